pub mod auth;
pub mod clock;
pub mod dms;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod lifecycle;
pub mod notify;
pub mod server;
pub mod store;
pub mod sweep;

use std::sync::Arc;
use std::time::Duration;

/// Name used as the sender in switch-release mail.
pub const SENDER_LABEL: &str = "lastlink";

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: store::Store,
    pub secrets: lifecycle::SecretEngine,
    pub switches: dms::SwitchEngine,
    pub maintenance: sweep::Maintenance,
    pub identity: Arc<dyn identity::IdentityProvider>,
    pub clock: Arc<dyn clock::Clock>,
    /// Bearer secret for the scheduler route. `None` disables the route.
    pub cron_secret: Option<String>,
    /// Record a switch check-in for every human-session request.
    pub implicit_check_in: bool,
}

impl AppState {
    /// Wire the engines over one store and clock. The scheduler route starts
    /// disabled and implicit check-ins start enabled.
    pub fn new(
        store: store::Store,
        clock: Arc<dyn clock::Clock>,
        notifier: Arc<dyn notify::Notifier>,
        identity: Arc<dyn identity::IdentityProvider>,
        notify_timeout: Duration,
    ) -> Self {
        let secrets = lifecycle::SecretEngine::new(store.clone(), clock.clone());
        let switches = dms::SwitchEngine::new(
            store.clone(),
            clock.clone(),
            notifier,
            notify_timeout,
            SENDER_LABEL.to_owned(),
        );
        let maintenance = sweep::Maintenance::new(secrets.clone(), switches.clone());
        Self {
            store,
            secrets,
            switches,
            maintenance,
            identity,
            clock,
            cron_secret: None,
            implicit_check_in: true,
        }
    }
}

pub use server::{read_key_file, resolve_data_dir, resolve_master_key, router, run, ServerConfig};
