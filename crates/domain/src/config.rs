//! Process configuration, read once from the environment at startup and
//! passed explicitly to every component. No globals.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Immutable daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// State directory (`REEVE_HOME`, default `~/.reeve`). Created on load.
    pub reeve_home: PathBuf,
    /// Working directory handed to the agent subprocess
    /// (`REEVE_DESK_PATH`, default `~/reeve_desk`).
    pub desk_path: PathBuf,
    /// SQLite file backing the pulse store (`PULSE_DB_URL`,
    /// default `<REEVE_HOME>/pulse_queue.db`).
    pub db_path: PathBuf,
    /// HTTP ingress port (`PULSE_API_PORT`, default 8765).
    pub api_port: u16,
    /// Bearer token required by the ingress (`PULSE_API_TOKEN`).
    /// `None` means misconfigured: protected endpoints refuse requests.
    pub api_token: Option<String>,
    /// Where the inbound bridge posts pulses (`PULSE_API_URL`).
    pub api_url: String,
    /// Execution tasks in flight (`PULSE_MAX_CONCURRENT`, default 5).
    pub max_concurrent: usize,
    /// Agent subprocess command (`AGENT_COMMAND`, default `hapi`).
    pub agent_command: String,
    /// Inbound bridge + sentinel messaging credentials.
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    /// Explicit sentinel backend choice (`SENTINEL_BACKEND`); `None` = auto.
    pub sentinel_backend: Option<String>,
}

impl Config {
    /// Load from the environment. Creates `REEVE_HOME` if missing; fails
    /// on malformed numeric values or an uncreatable state directory.
    pub fn from_env() -> Result<Self> {
        let reeve_home = expand_path(&env_or("REEVE_HOME", "~/.reeve"));
        std::fs::create_dir_all(&reeve_home)?;

        let desk_path = expand_path(&env_or("REEVE_DESK_PATH", "~/reeve_desk"));

        let db_path = match non_empty_env("PULSE_DB_URL") {
            Some(url) => db_path_from_locator(&url),
            None => reeve_home.join("pulse_queue.db"),
        };

        let api_port = match non_empty_env("PULSE_API_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| Error::Config(format!("PULSE_API_PORT is not a port: '{raw}'")))?,
            None => 8765,
        };

        let max_concurrent = match non_empty_env("PULSE_MAX_CONCURRENT") {
            Some(raw) => raw.parse::<usize>().map_err(|_| {
                Error::Config(format!("PULSE_MAX_CONCURRENT is not an integer: '{raw}'"))
            })?,
            None => 5,
        };

        Ok(Self {
            reeve_home,
            desk_path,
            db_path,
            api_port,
            api_token: non_empty_env("PULSE_API_TOKEN"),
            api_url: env_or("PULSE_API_URL", "http://localhost:8765"),
            max_concurrent,
            agent_command: env_or("AGENT_COMMAND", "hapi"),
            telegram_bot_token: non_empty_env("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: non_empty_env("TELEGRAM_CHAT_ID"),
            sentinel_backend: non_empty_env("SENTINEL_BACKEND"),
        })
    }

    /// Bridge offset persistence file.
    pub fn offset_file(&self) -> PathBuf {
        self.reeve_home.join("telegram_offset.txt")
    }

    /// Sentinel cooldown state directory (created lazily by the sentinel).
    pub fn sentinel_dir(&self) -> PathBuf {
        self.reeve_home.join("sentinel")
    }
}

fn env_or(key: &str, default: &str) -> String {
    non_empty_env(key).unwrap_or_else(|| default.to_string())
}

fn non_empty_env(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Expand `~` and `$VAR` references in a path string. Unset variables are
/// left verbatim, matching shell-less config files in the wild.
pub fn expand_path(raw: &str) -> PathBuf {
    let expanded = expand_vars(raw);
    if let Some(rest) = expanded.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            let rest = rest.strip_prefix('/').unwrap_or(rest);
            return home.join(rest);
        }
    }
    PathBuf::from(expanded)
}

fn expand_vars(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let mut name = String::new();
        while let Some(&(_, nc)) = chars.peek() {
            if nc.is_ascii_alphanumeric() || nc == '_' {
                name.push(nc);
                chars.next();
            } else {
                break;
            }
        }
        if name.is_empty() {
            out.push('$');
        } else {
            match std::env::var(&name) {
                Ok(v) => out.push_str(&v),
                Err(_) => {
                    out.push('$');
                    out.push_str(&name);
                }
            }
        }
    }
    out
}

/// `PULSE_DB_URL` accepts a bare filesystem path or a `sqlite:` URL.
fn db_path_from_locator(url: &str) -> PathBuf {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    expand_path(path)
}
