//! Load hub config from file and environment.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Hub configuration. File: ~/.config/lanbridge/hub.toml or /etc/lanbridge/hub.toml.
/// Env overrides: LANBRIDGE_BIND, LANBRIDGE_PORT, LANBRIDGE_UPLOAD_DIR.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listen address (default 0.0.0.0).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,
    /// WebSocket listen port (default 8080).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory uploaded files are written to (default `uploads`).
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    /// Prefix of the reference handed to peers (default `/uploads`).
    #[serde(default = "default_reference_prefix")]
    pub reference_prefix: String,
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_port() -> u16 {
    8080
}
fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}
fn default_reference_prefix() -> String {
    "/uploads".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            upload_dir: default_upload_dir(),
            reference_prefix: default_reference_prefix(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },
}

/// Load config: defaults, then the config file (`explicit` or the first
/// standard path that exists), then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(path) => load_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => load_file(&path)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |var| std::env::var(var).ok())?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lanbridge/hub.toml"));
    }
    out.push(PathBuf::from("/etc/lanbridge/hub.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn apply_env(
    c: &mut Config,
    get: impl Fn(&'static str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(s) = get("LANBRIDGE_BIND") {
        c.bind_addr = s.parse().map_err(|_| ConfigError::Env {
            var: "LANBRIDGE_BIND",
            value: s.clone(),
        })?;
    }
    if let Some(s) = get("LANBRIDGE_PORT") {
        c.port = s.parse().map_err(|_| ConfigError::Env {
            var: "LANBRIDGE_PORT",
            value: s.clone(),
        })?;
    }
    if let Some(s) = get("LANBRIDGE_UPLOAD_DIR") {
        c.upload_dir = PathBuf::from(s);
    }
    Ok(())
}
