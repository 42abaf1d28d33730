//! Load node config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Node configuration. File: ~/.config/pollen/config.toml or
/// /etc/pollen/config.toml. Env overrides: POLLEN_LISTEN_PORT,
/// POLLEN_DATA_ROOT, POLLEN_OWNER, POLLEN_MAX_EXECUTION_MS,
/// POLLEN_CHUNK_CACHE_LOOKBACK.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Transport TCP listen port (default 7710).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Root directory for per-format engine folders.
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    /// Peer name this node sends as.
    #[serde(default = "default_owner")]
    pub owner: String,
    /// Cap on a single PDU execution, in milliseconds (default 30000).
    #[serde(default = "default_max_execution_ms")]
    pub max_execution_ms: u64,
    /// Eras a chunk cache lookup walks back from the current one
    /// (default 1000).
    #[serde(default = "default_chunk_cache_lookback")]
    pub chunk_cache_lookback: u32,
}

fn default_listen_port() -> u16 {
    7710
}
fn default_data_root() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local/share/pollen"),
        None => PathBuf::from("pollen-data"),
    }
}
fn default_owner() -> String {
    "anon".to_string()
}
fn default_max_execution_ms() -> u64 {
    30_000
}
fn default_chunk_cache_lookback() -> u32 {
    pollen_core::era::DEFAULT_CACHE_LOOKBACK
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            data_root: default_data_root(),
            owner: default_owner(),
            max_execution_ms: default_max_execution_ms(),
            chunk_cache_lookback: default_chunk_cache_lookback(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_else(Config::default);
    if let Ok(s) = std::env::var("POLLEN_LISTEN_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.listen_port = p;
        }
    }
    if let Ok(s) = std::env::var("POLLEN_DATA_ROOT") {
        if !s.is_empty() {
            c.data_root = PathBuf::from(s);
        }
    }
    if let Ok(s) = std::env::var("POLLEN_OWNER") {
        if !s.is_empty() {
            c.owner = s;
        }
    }
    if let Ok(s) = std::env::var("POLLEN_MAX_EXECUTION_MS") {
        if let Ok(ms) = s.parse::<u64>() {
            c.max_execution_ms = ms;
        }
    }
    if let Ok(s) = std::env::var("POLLEN_CHUNK_CACHE_LOOKBACK") {
        if let Ok(n) = s.parse::<u32>() {
            c.chunk_cache_lookback = n;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/pollen/config.toml"));
    }
    out.push(PathBuf::from("/etc/pollen/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_cache_lookback_defaults_and_parses() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(
            c.chunk_cache_lookback,
            pollen_core::era::DEFAULT_CACHE_LOOKBACK
        );
        let c: Config = toml::from_str("chunk_cache_lookback = 25").unwrap();
        assert_eq!(c.chunk_cache_lookback, 25);
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<Config>("no_such_key = 1").is_err());
    }
}
