use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_SYNC_INTERVAL_MINUTES: u64 = 5;
const DEFAULT_FETCH_WINDOW: usize = 5;
const DEFAULT_RETENTION_CEILING: i64 = 5;
const DEFAULT_SEND_PACING_MS: u64 = 500;
const DEFAULT_IMAP_PORT: u16 = 993;

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

// ─── ServerConfig ─────────────────────────────────────────────────────────────

/// REST server configuration (`[server]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP port for the REST API (default: 8080).
    pub port: u16,
    /// Bind address (default: 127.0.0.1; use 0.0.0.0 for LAN access).
    pub bind_address: String,
    /// Shared-secret value every request must carry in `X-Auth-Token`.
    /// Empty string disables the check (not recommended).
    pub auth_token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: default_bind_address(),
            auth_token: String::new(),
        }
    }
}

// ─── SyncConfig ───────────────────────────────────────────────────────────────

/// Sync-cycle tuning (`[sync]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Minutes between scheduled passes (default: 5).
    pub interval_minutes: u64,
    /// How many recent messages to pull per mailbox per pass (default: 5).
    pub fetch_window: usize,
    /// Maximum delivered messages kept per mailbox before the oldest are
    /// pruned (default: 5). Undelivered messages never count against it.
    pub retention_ceiling: i64,
    /// Delay between consecutive provider sends for one mailbox, to avoid
    /// hammering a single endpoint (default: 500).
    pub send_pacing_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_minutes: DEFAULT_SYNC_INTERVAL_MINUTES,
            fetch_window: DEFAULT_FETCH_WINDOW,
            retention_ceiling: DEFAULT_RETENTION_CEILING,
            send_pacing_ms: DEFAULT_SEND_PACING_MS,
        }
    }
}

// ─── MailServerConfig ─────────────────────────────────────────────────────────

/// One known mail provider (`[[mail_servers]]` in config.toml).
///
/// `name` is what mailbox rows reference via `server_name`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MailServerConfig {
    pub name: String,
    pub imap_host: String,
    #[serde(default = "default_imap_port")]
    pub imap_port: u16,
}

fn default_imap_port() -> u16 {
    DEFAULT_IMAP_PORT
}

// ─── ProviderEndpoint ─────────────────────────────────────────────────────────

/// One notification provider endpoint (`[[providers]]` in config.toml).
///
/// `kind` must match a channel's provider kind (`pushbot`, `wecom`,
/// `webhook`); `endpoint` is the base URL POSTed to.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderEndpoint {
    pub kind: String,
    pub endpoint: String,
}

// ─── DaemonConfig ─────────────────────────────────────────────────────────────

/// Full daemon configuration, loaded from `config.toml` in the data
/// directory. Missing file or missing sections fall back to defaults; CLI
/// flags and env vars override individual fields in `main.rs`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub sync: SyncConfig,
    pub mail_servers: Vec<MailServerConfig>,
    pub providers: Vec<ProviderEndpoint>,
}

impl DaemonConfig {
    /// Load configuration from `{data_dir}/config.toml`.
    ///
    /// A missing file is not an error — defaults apply and a note is logged.
    /// A file that exists but fails to parse is a hard error, so a typo
    /// never silently reverts the daemon to defaults.
    pub fn load(data_dir: &Path) -> anyhow::Result<Self> {
        let path = data_dir.join("config.toml");
        if !path.is_file() {
            info!(path = %path.display(), "no config.toml found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        let config: DaemonConfig = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("invalid config file {}: {e}", path.display()))?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Resolve the IMAP server for a mailbox's `server_name`.
    ///
    /// Unknown names fall back to `imap.{name}.com:993`, matching the common
    /// convention for consumer providers.
    pub fn imap_server(&self, server_name: &str) -> MailServerConfig {
        if let Some(server) = self.mail_servers.iter().find(|s| s.name == server_name) {
            return server.clone();
        }
        let fallback = MailServerConfig {
            name: server_name.to_string(),
            imap_host: format!("imap.{}.com", server_name.to_lowercase()),
            imap_port: DEFAULT_IMAP_PORT,
        };
        warn!(
            server = server_name,
            host = %fallback.imap_host,
            "mail server not configured, using conventional host"
        );
        fallback
    }

    /// Endpoint URL for a provider kind, if one is configured.
    pub fn provider_endpoint(&self, kind: &str) -> Option<&str> {
        self.providers
            .iter()
            .find(|p| p.kind == kind)
            .map(|p| p.endpoint.as_str())
    }
}

/// Platform-conventional data directory (database, config.toml, logs).
pub fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/mailnotifyd
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("mailnotifyd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/mailnotifyd or ~/.local/share/mailnotifyd
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("mailnotifyd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("mailnotifyd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        // %APPDATA%\mailnotifyd
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("mailnotifyd");
        }
    }
    // Fallback
    PathBuf::from(".mailnotifyd")
}

// ─── Tests ────────────────────────────────────────────────────────────────────
