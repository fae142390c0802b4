use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use directories::ProjectDirs;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    auth::{identify, require_caller, require_scheduler},
    clock::SystemClock,
    handlers::{
        check_in, create_api_key, create_secret, delete_api_key, delete_secret, get_config,
        health, list_api_keys, list_secrets, read_secret, run_sweep, update_config,
    },
    identity::{IdentityProvider, NoIdentity, RemoteIdentity},
    notify::{DisabledNotifier, Notifier, ResendNotifier, DEFAULT_RESEND_URL},
    store::{crypto, crypto::EncryptionKey, Store},
    AppState,
};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    /// Optional passphrase for the store key. Without it a random key is
    /// kept in `lastlink.key` next to the database.
    pub master_key: Option<String>,
    pub cors_origins: Option<String>,
    /// `Duration::ZERO` disables the in-process sweep.
    pub sweep_interval: Duration,
    /// Bearer secret for `POST /internal/sweep`. The route 404s when unset.
    pub cron_secret: Option<String>,
    /// Session-token resolution endpoint ($LASTLINK_IDENTITY_URL).
    pub identity_url: Option<String>,
    /// Treat human-session requests as switch check-ins.
    pub implicit_check_in: bool,
    pub resend_api_key: Option<String>,
    pub resend_url: String,
    pub mail_from: String,
    pub notify_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("LASTLINK_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("LASTLINK_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            data_dir: std::env::var("LASTLINK_DATA_DIR").ok().map(PathBuf::from),
            master_key: None,
            cors_origins: std::env::var("LASTLINK_CORS_ORIGINS").ok(),
            sweep_interval: Duration::from_secs(
                std::env::var("LASTLINK_SWEEP_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(300),
            ),
            cron_secret: std::env::var("LASTLINK_CRON_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            identity_url: std::env::var("LASTLINK_IDENTITY_URL").ok(),
            implicit_check_in: std::env::var("LASTLINK_IMPLICIT_CHECKIN")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            resend_api_key: std::env::var("LASTLINK_RESEND_API_KEY")
                .ok()
                .filter(|s| !s.is_empty()),
            resend_url: std::env::var("LASTLINK_RESEND_URL")
                .unwrap_or_else(|_| DEFAULT_RESEND_URL.into()),
            mail_from: std::env::var("LASTLINK_MAIL_FROM")
                .unwrap_or_else(|_| "lastlink <noreply@lastlink.dev>".into()),
            notify_timeout: Duration::from_secs(
                std::env::var("LASTLINK_NOTIFY_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
            ),
        }
    }
}

/// Read a master key from a file, trimming surrounding whitespace.
/// Fails if the file cannot be read or is empty after trimming.
pub fn read_key_file(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read key file: {}", path.display()))?;
    let key = content.trim().to_string();
    if key.is_empty() {
        anyhow::bail!("key file is empty: {}", path.display());
    }
    Ok(key)
}

/// Resolve the optional master key from `LASTLINK_MASTER_KEY_FILE`
/// (preferred) or `LASTLINK_MASTER_KEY`.
pub fn resolve_master_key() -> Result<Option<String>> {
    if let Ok(path) = std::env::var("LASTLINK_MASTER_KEY_FILE") {
        let key = read_key_file(Path::new(&path))?;
        if std::env::var("LASTLINK_MASTER_KEY").is_ok() {
            warn!("both LASTLINK_MASTER_KEY and LASTLINK_MASTER_KEY_FILE are set; using file");
        }
        return Ok(Some(key));
    }
    Ok(std::env::var("LASTLINK_MASTER_KEY")
        .ok()
        .filter(|k| !k.is_empty()))
}

/// Resolve (and create) the data directory. Without an explicit directory
/// the platform app data dir is used (`~/.local/share/lastlink/`, etc.).
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    let path = match data_dir {
        Some(d) => d.clone(),
        None => ProjectDirs::from("", "", "lastlink")
            .context("could not determine platform data directory")?
            .data_dir()
            .to_owned(),
    };
    std::fs::create_dir_all(&path).context("create data dir")?;
    Ok(path)
}

/// Build the full HTTP surface over `state`.
pub fn router(state: AppState, cors_origins: Option<&str>) -> Router {
    // Public routes (no auth required).
    let public = Router::new()
        .route("/health", get(health))
        .route("/secrets/{id}", get(read_secret));

    // Anonymous allowed; a presented credential must be valid.
    let optional = Router::new()
        .route("/secrets", post(create_secret))
        .layer(middleware::from_fn_with_state(state.clone(), identify));

    // Protected routes (caller required).
    let protected = Router::new()
        .route("/secrets", get(list_secrets))
        .route("/secrets/{id}", delete(delete_secret))
        .route("/dms/config", get(get_config).post(update_config))
        .route("/dms/checkin", post(check_in))
        .route("/keys", post(create_api_key).get(list_api_keys))
        .route("/keys/{id}", delete(delete_api_key))
        .layer(middleware::from_fn(require_caller))
        .layer(middleware::from_fn_with_state(state.clone(), identify));

    // Scheduler-only routes.
    let internal = Router::new()
        .route("/internal/sweep", post(run_sweep))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_scheduler,
        ));

    Router::new()
        .merge(public)
        .merge(optional)
        .merge(protected)
        .merge(internal)
        .with_state(state)
        .layer(build_cors(cors_origins))
        .layer(TraceLayer::new_for_http())
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let enc_key = match cfg.master_key.as_deref() {
        Some(master) => {
            let salt = load_or_create_salt(&data_dir)?;
            crypto::derive_key(master, &salt).context("derive store key")?
        }
        None => load_or_create_key(&data_dir)?,
    };

    let db_path = data_dir.join("lastlink.db");
    let store = Store::open(&db_path, enc_key).context("open store")?;

    let notifier: Arc<dyn Notifier> = match cfg.resend_api_key {
        Some(api_key) => Arc::new(ResendNotifier::new(
            api_key,
            cfg.resend_url,
            cfg.mail_from,
            cfg.notify_timeout,
        )?),
        None => {
            warn!("LASTLINK_RESEND_API_KEY not set; dead man's switches cannot fire");
            Arc::new(DisabledNotifier)
        }
    };

    let identity: Arc<dyn IdentityProvider> = match cfg.identity_url {
        Some(url) => Arc::new(RemoteIdentity::new(url, Duration::from_secs(5))?),
        None => {
            warn!("LASTLINK_IDENTITY_URL not set; only API keys can authenticate");
            Arc::new(NoIdentity)
        }
    };

    let mut state = AppState::new(
        store,
        Arc::new(SystemClock),
        notifier,
        identity,
        cfg.notify_timeout,
    );
    state.cron_secret = cfg.cron_secret;
    state.implicit_check_in = cfg.implicit_check_in;

    if cfg.sweep_interval.is_zero() {
        info!("in-process sweep disabled");
    } else {
        state.maintenance.clone().spawn(cfg.sweep_interval);
    }
    if state.cron_secret.is_none() {
        info!("LASTLINK_CRON_SECRET not set; /internal/sweep is disabled");
    }

    let app = router(state, cfg.cors_origins.as_deref());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "lastlink server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

fn load_or_create_key(data_dir: &Path) -> Result<EncryptionKey> {
    let key_path = data_dir.join("lastlink.key");
    if key_path.exists() {
        let bytes = std::fs::read(&key_path).context("read lastlink.key")?;
        crypto::load_key(&bytes).ok_or_else(|| {
            anyhow::anyhow!(
                "lastlink.key is corrupt (expected 32 bytes, got {})",
                bytes.len()
            )
        })
    } else {
        let key = crypto::generate_key();
        std::fs::write(&key_path, key.as_bytes()).context("write lastlink.key")?;
        info!("generated new encryption key");
        Ok(key)
    }
}

fn load_or_create_salt(data_dir: &Path) -> Result<[u8; 32]> {
    let salt_path = data_dir.join("lastlink.salt");
    if salt_path.exists() {
        let bytes = std::fs::read(&salt_path).context("read lastlink.salt")?;
        bytes.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "lastlink.salt is corrupt (expected 32 bytes, got {})",
                bytes.len()
            )
        })
    } else {
        let salt = crypto::generate_salt();
        std::fs::write(&salt_path, salt).context("write lastlink.salt")?;
        info!("generated new key-derivation salt");
        Ok(salt)
    }
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            http::Method::GET,
            http::Method::POST,
            http::Method::DELETE,
            http::Method::OPTIONS,
        ])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_file_is_trimmed_and_must_be_non_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master");
        std::fs::write(&path, "  s3cret\n").unwrap();
        assert_eq!(read_key_file(&path).unwrap(), "s3cret");

        std::fs::write(&path, "\n").unwrap();
        assert!(read_key_file(&path).is_err());
    }

    #[test]
    fn generated_key_and_salt_persist() {
        let dir = tempfile::tempdir().unwrap();
        let a = load_or_create_key(dir.path()).unwrap();
        let b = load_or_create_key(dir.path()).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());

        let s1 = load_or_create_salt(dir.path()).unwrap();
        let s2 = load_or_create_salt(dir.path()).unwrap();
        assert_eq!(s1, s2);
    }

    #[test]
    fn explicit_data_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let wanted = dir.path().join("nested").join("data");
        let resolved = resolve_data_dir(Some(&wanted)).unwrap();
        assert_eq!(resolved, wanted);
        assert!(wanted.is_dir());
    }

    #[test]
    fn corrupt_key_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lastlink.key"), b"short").unwrap();
        assert!(load_or_create_key(dir.path()).is_err());
    }
}
