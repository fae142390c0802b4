use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "lastlink",
    about = "lastlink: self-destructing links and a dead man's switch",
    version
)]
struct Cli {
    /// lastlink server URL (default: http://localhost:8080 or $LASTLINK_SERVER)
    #[arg(long, env = "LASTLINK_SERVER", default_value = "http://localhost:8080")]
    server: String,

    /// Session token or API key ($LASTLINK_TOKEN)
    #[arg(long, env = "LASTLINK_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the lastlink HTTP server
    Serve {
        /// Port to listen on (default: $LASTLINK_PORT or 8080)
        #[arg(long, env = "LASTLINK_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $LASTLINK_HOST or 0.0.0.0)
        #[arg(long, env = "LASTLINK_HOST", default_value = "0.0.0.0")]
        host: String,
    },
    /// Create a secret link. Anonymous unless a token is given.
    Create {
        /// The secret text
        payload: String,
        /// Lifetime e.g. 30m, 12h, 7d (rounded up to whole hours)
        #[arg(long)]
        ttl: Option<String>,
        /// Reads allowed before the link burns
        #[arg(long)]
        views: Option<u32>,
        /// Label shown only to you
        #[arg(long)]
        title: Option<String>,
    },
    /// Read a secret (consumes one view)
    Read {
        /// Secret id or full link
        id: String,
    },
    /// List your live secrets (metadata only)
    List,
    /// Delete one of your secrets
    Delete {
        /// Secret id
        id: String,
    },
    /// Check in: restart your switch countdown
    Checkin,
    /// Show or change your dead man's switch
    Switch {
        /// Arm the switch
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        /// Disarm the switch
        #[arg(long)]
        disable: bool,
        /// Who receives the note (empty string clears it)
        #[arg(long)]
        recipient: Option<String>,
        /// Days of silence before the switch fires
        #[arg(long)]
        interval: Option<i64>,
        /// The note to release
        #[arg(long)]
        note: Option<String>,
    },
    /// Run one maintenance pass on the server
    Sweep {
        /// Scheduler secret ($LASTLINK_CRON_SECRET)
        #[arg(long, env = "LASTLINK_CRON_SECRET")]
        cron_secret: String,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LASTLINK_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let api = Api::new(&cli.server, cli.token.clone());

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(host, port).await,

        Commands::Create {
            payload,
            ttl,
            views,
            title,
        } => cmd_create(&api, &payload, ttl.as_deref(), views, title).await,

        Commands::Read { id } => cmd_read(&api, &id).await,

        Commands::List => {
            api.require_token()?;
            cmd_list(&api).await
        }

        Commands::Delete { id } => {
            api.require_token()?;
            let json = api.send(api.delete(&format!("/secrets/{id}"))).await?;
            if json["deleted"].as_bool() == Some(true) {
                println!("✓ deleted {id}");
            }
            Ok(())
        }

        Commands::Checkin => {
            api.require_token()?;
            let json = api.send(api.post("/dms/checkin")).await?;
            println!("✓ checked in at {}", format_ts(json["last_check_in"].as_i64()));
            Ok(())
        }

        Commands::Switch {
            enable,
            disable,
            recipient,
            interval,
            note,
        } => {
            api.require_token()?;
            let switch_enabled = match (enable, disable) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            cmd_switch(&api, switch_enabled, recipient, interval, note).await
        }

        Commands::Sweep { cron_secret } => {
            let json = api
                .send(
                    api.client
                        .post(api.url("/internal/sweep"))
                        .bearer_auth(cron_secret),
                )
                .await?;
            println!(
                "deleted {} secret(s); switch scan {} ({} triggered)",
                json["deleted_secrets"].as_u64().unwrap_or(0),
                json["dms"].as_str().unwrap_or("?"),
                json["triggered"].as_u64().unwrap_or(0),
            );
            Ok(())
        }
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16) -> Result<()> {
    let cfg = lastlink_server::ServerConfig {
        host,
        port,
        master_key: lastlink_server::resolve_master_key()?,
        ..Default::default()
    };

    lastlink_server::run(cfg).await
}

async fn cmd_create(
    api: &Api,
    payload: &str,
    ttl: Option<&str>,
    views: Option<u32>,
    title: Option<String>,
) -> Result<()> {
    let expiration_hours = ttl.map(parse_hours).transpose()?;
    let body = json!({
        "payload": payload,
        "title": title,
        "expiration_hours": expiration_hours,
        "max_views": views,
    });

    let json = api.send(api.post("/secrets").json(&body)).await?;
    let id = json["id"].as_str().context("server response missing id")?;
    println!("{}/secrets/{id}", api.base);
    Ok(())
}

async fn cmd_read(api: &Api, id: &str) -> Result<()> {
    // Accept a full link as well as a bare id.
    let id = id.rsplit('/').next().unwrap_or(id);
    let json = api.send(api.client.get(api.url(&format!("/secrets/{id}")))).await?;
    println!("{}", json["payload"].as_str().unwrap_or(""));
    let remaining = json["remaining_views"].as_u64().unwrap_or(0);
    if remaining == 0 {
        eprintln!("(this link is now burned)");
    } else {
        eprintln!("({remaining} view(s) left)");
    }
    Ok(())
}

async fn cmd_list(api: &Api) -> Result<()> {
    let json = api.send(api.get("/secrets?owner=me")).await?;
    let metas: Vec<MetaItem> =
        serde_json::from_value(json["secrets"].clone()).context("parse secrets list")?;

    if metas.is_empty() {
        println!("(no live secrets)");
        return Ok(());
    }
    let now = unix_now();
    for m in &metas {
        let secs_left = m.expires_at - now;
        let ttl_info = if secs_left > 0 {
            format!("expires in {}", format_duration(secs_left as u64))
        } else {
            "expired".to_string()
        };
        println!(
            "  {} — {} — {}/{} views{}",
            m.id,
            ttl_info,
            m.view_count,
            m.max_views,
            m.title
                .as_deref()
                .map(|t| format!(" — {t}"))
                .unwrap_or_default(),
        );
    }
    Ok(())
}

async fn cmd_switch(
    api: &Api,
    switch_enabled: Option<bool>,
    recipient: Option<String>,
    interval: Option<i64>,
    note: Option<String>,
) -> Result<()> {
    let unchanged =
        switch_enabled.is_none() && recipient.is_none() && interval.is_none() && note.is_none();

    let json = if unchanged {
        api.send(api.get("/dms/config")).await?
    } else {
        let mut body = serde_json::Map::new();
        if let Some(v) = switch_enabled {
            body.insert("switch_enabled".into(), json!(v));
        }
        if let Some(v) = recipient {
            body.insert("recipient_email".into(), json!(v));
        }
        if let Some(v) = interval {
            body.insert("check_in_interval".into(), json!(v));
        }
        if let Some(v) = note {
            body.insert("note".into(), json!(v));
        }
        api.send(api.post("/dms/config").json(&body)).await?
    };

    let cfg = &json["config"];
    println!(
        "switch:     {}",
        if cfg["switch_enabled"].as_bool().unwrap_or(false) {
            "armed"
        } else {
            "disarmed"
        }
    );
    println!("status:     {}", cfg["status"].as_str().unwrap_or("?"));
    println!(
        "recipient:  {}",
        cfg["recipient_email"].as_str().unwrap_or("(none)")
    );
    println!(
        "interval:   {} day(s)",
        cfg["check_in_interval"].as_i64().unwrap_or(0)
    );
    println!("last check: {}", format_ts(cfg["last_check_in"].as_i64()));
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

struct Api {
    client: Client,
    base: String,
    token: Option<String>,
}

impl Api {
    fn new(server: &str, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base: server.trim_end_matches('/').to_owned(),
            token,
        }
    }

    fn require_token(&self) -> Result<()> {
        self.token
            .as_ref()
            .map(|_| ())
            .context("--token / LASTLINK_TOKEN is required for this command")
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match self.token {
            Some(ref t) => req.bearer_auth(t),
            None => req,
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.authed(self.client.get(self.url(path)))
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.authed(self.client.post(self.url(path)))
    }

    fn delete(&self, path: &str) -> RequestBuilder {
        self.authed(self.client.delete(self.url(path)))
    }

    /// Send and return the JSON body, turning non-2xx into an error carrying
    /// the server's `error` message.
    async fn send(&self, req: RequestBuilder) -> Result<Value> {
        let resp = req.send().await.context("HTTP request failed")?;
        let status = resp.status();
        let json: Value = resp.json().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!(
                "server returned {status}: {}",
                json["error"].as_str().unwrap_or("")
            );
        }
        Ok(json)
    }
}

/// Parse human duration strings like "30m", "12h", "7d" into whole hours,
/// rounding up.
fn parse_hours(s: &str) -> Result<u64> {
    let d: humantime::Duration = s
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;
    Ok(d.as_secs().div_ceil(3600).max(1))
}

fn format_duration(secs: u64) -> String {
    if secs >= 86400 {
        format!("{}d", secs / 86400)
    } else if secs >= 3600 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn format_ts(ts: Option<i64>) -> String {
    match ts {
        Some(ts) => {
            let ago = unix_now() - ts;
            if ago <= 0 {
                "just now".to_string()
            } else {
                format!("{} ago", format_duration(ago as u64))
            }
        }
        None => "never".to_string(),
    }
}

#[derive(serde::Deserialize)]
struct MetaItem {
    id: String,
    title: Option<String>,
    expires_at: i64,
    max_views: u32,
    view_count: u32,
}
