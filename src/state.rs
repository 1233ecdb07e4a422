//! Shared application state, constructed once at startup and cloned into
//! handlers. No module-level singletons; everything reachable from here.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::Error;
use crate::notify::Notifier;
use crate::provider::{AutomationEngine, ResourceProvider};
use crate::registry::ConnectionRegistry;
use crate::store::SessionStore;

/// Resource domains, each with its own isolated session store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Domain {
    Desktop,
    BrowserUse,
    ComputerUse,
    CodeInterpreter,
}

impl Domain {
    pub const ALL: [Domain; 4] = [
        Domain::Desktop,
        Domain::BrowserUse,
        Domain::ComputerUse,
        Domain::CodeInterpreter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Desktop => "desktop",
            Domain::BrowserUse => "browser-use",
            Domain::ComputerUse => "computer-use",
            Domain::CodeInterpreter => "code-interpreter",
        }
    }

    pub fn parse(value: &str) -> Result<Self, Error> {
        match value {
            "desktop" => Ok(Domain::Desktop),
            "browser-use" => Ok(Domain::BrowserUse),
            "computer-use" => Ok(Domain::ComputerUse),
            "code-interpreter" => Ok(Domain::CodeInterpreter),
            other => Err(Error::UnknownDomain(other.to_string())),
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub registry: Arc<ConnectionRegistry>,
    pub notifier: Notifier,
    desktop: Arc<SessionStore>,
    browser_use: Arc<SessionStore>,
    computer_use: Arc<SessionStore>,
    code_interpreter: Arc<SessionStore>,
    pub provider: Arc<dyn ResourceProvider>,
    pub engine: Arc<dyn AutomationEngine>,
}

impl AppState {
    pub fn new(
        config: Config,
        provider: Arc<dyn ResourceProvider>,
        engine: Arc<dyn AutomationEngine>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.pending_capacity));
        let store = |domain: &'static str| {
            SessionStore::new(
                domain,
                registry.clone(),
                config.session_timeout,
                config.sweep_interval,
                config.stop_grace,
            )
        };
        Self {
            notifier: Notifier::new(registry.clone()),
            desktop: store("desktop"),
            browser_use: store("browser-use"),
            computer_use: store("computer-use"),
            code_interpreter: store("code-interpreter"),
            registry,
            provider,
            engine,
            config,
        }
    }

    pub fn store(&self, domain: Domain) -> &Arc<SessionStore> {
        match domain {
            Domain::Desktop => &self.desktop,
            Domain::BrowserUse => &self.browser_use,
            Domain::ComputerUse => &self.computer_use,
            Domain::CodeInterpreter => &self.code_interpreter,
        }
    }

    pub fn stores(&self) -> [&Arc<SessionStore>; 4] {
        [
            &self.desktop,
            &self.browser_use,
            &self.computer_use,
            &self.code_interpreter,
        ]
    }

    /// Tear down every store; used on graceful shutdown.
    pub async fn shutdown(&self) {
        for store in self.stores() {
            store.shutdown().await;
        }
    }
}
