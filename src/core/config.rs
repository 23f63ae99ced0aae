//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, VrError};
use crate::logger::jsonl::Severity;

/// Full vreserve configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub resolver: ResolverConfig,
    pub logging: LoggingConfig,
    pub client: ClientConfig,
    /// Where this config was loaded from. Not read from the file itself.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

/// HTTP listener and worker pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// `127.0.0.1` accepts only local requests, `0.0.0.0` accepts all.
    pub host: String,
    pub port: u16,
    pub worker_threads: usize,
    /// How long a worker blocks waiting for a request before re-checking shutdown.
    pub recv_timeout_ms: u64,
}

/// Mount-table probing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResolverConfig {
    /// Disk-usage command; invoked with `-P`.
    pub df_command: String,
    /// Reuse a parsed mount table for this long. 0 re-probes on every resolution.
    /// Free space is never cached regardless of this setting.
    pub mount_cache_ttl_ms: u64,
}

/// Activity log output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// JSONL log file. `None` writes to stdout.
    pub log_file: Option<PathBuf>,
    pub fallback_path: Option<PathBuf>,
    pub min_severity: Severity,
    pub max_size_bytes: u64,
    pub max_rotated_files: u32,
    pub fsync_interval_secs: u64,
}

/// Defaults for the client subcommands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub service_url: String,
    pub timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8188,
            worker_threads: std::thread::available_parallelism()
                .map_or(2, |n| n.get().saturating_div(2).max(2)),
            recv_timeout_ms: 250,
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            df_command: "df".to_string(),
            mount_cache_ttl_ms: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_file: None,
            fallback_path: None,
            min_severity: Severity::Info,
            max_size_bytes: 100 * 1024 * 1024,
            max_rotated_files: 5,
            fsync_interval_secs: 10,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            service_url: "http://127.0.0.1:8188".to_string(),
            timeout_ms: 5_000,
        }
    }
}

impl ServerConfig {
    /// `host:port` string suitable for binding.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[VR-CONFIG] WARNING: HOME not set, falling back to /tmp for config path"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        home_dir.join(".config").join("vreserve").join("config.toml")
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| VrError::io(&path_buf, source))?;
            let mut parsed: Self = toml::from_str(&raw)?;
            parsed.source = Some(path_buf);
            parsed
        } else if is_explicit_path {
            return Err(VrError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for the startup log line.
    ///
    /// FNV-1a, so the value is stable across processes and toolchains.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        // server
        if let Some(raw) = lookup("VRESERVE_SERVER_HOST") {
            self.server.host = raw;
        }
        if let Some(raw) = lookup("VRESERVE_SERVER_PORT") {
            self.server.port = parse_env("VRESERVE_SERVER_PORT", &raw)?;
        }
        if let Some(raw) = lookup("VRESERVE_SERVER_WORKER_THREADS") {
            self.server.worker_threads = parse_env("VRESERVE_SERVER_WORKER_THREADS", &raw)?;
        }

        // resolver
        if let Some(raw) = lookup("VRESERVE_RESOLVER_DF_COMMAND") {
            self.resolver.df_command = raw;
        }
        if let Some(raw) = lookup("VRESERVE_RESOLVER_MOUNT_CACHE_TTL_MS") {
            self.resolver.mount_cache_ttl_ms =
                parse_env("VRESERVE_RESOLVER_MOUNT_CACHE_TTL_MS", &raw)?;
        }

        // logging
        if let Some(raw) = lookup("VRESERVE_LOG_FILE") {
            self.logging.log_file = Some(PathBuf::from(raw));
        }
        if let Some(raw) = lookup("VRESERVE_LOG_MIN_SEVERITY") {
            self.logging.min_severity =
                raw.parse::<Severity>()
                    .map_err(|details| VrError::ConfigParse {
                        context: "env",
                        details: format!("VRESERVE_LOG_MIN_SEVERITY={raw:?}: {details}"),
                    })?;
        }

        // client
        if let Some(raw) = lookup("VRESERVE_CLIENT_SERVICE_URL") {
            self.client.service_url = raw;
        }
        if let Some(raw) = lookup("VRESERVE_CLIENT_TIMEOUT_MS") {
            self.client.timeout_ms = parse_env("VRESERVE_CLIENT_TIMEOUT_MS", &raw)?;
        }

        Ok(())
    }

    /// Reject configurations the daemon or client cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(VrError::InvalidConfig {
                details: "server.host must not be empty".to_string(),
            });
        }
        if self.server.port == 0 {
            return Err(VrError::InvalidConfig {
                details: "server.port must be > 0".to_string(),
            });
        }
        if self.server.worker_threads == 0 {
            return Err(VrError::InvalidConfig {
                details: "server.worker_threads must be >= 1".to_string(),
            });
        }
        if self.server.recv_timeout_ms == 0 {
            return Err(VrError::InvalidConfig {
                details: "server.recv_timeout_ms must be >= 1".to_string(),
            });
        }

        if self.resolver.df_command.trim().is_empty() {
            return Err(VrError::InvalidConfig {
                details: "resolver.df_command must not be empty".to_string(),
            });
        }

        if self.logging.max_size_bytes < 1024 {
            return Err(VrError::InvalidConfig {
                details: format!(
                    "logging.max_size_bytes ({}) must be >= 1024",
                    self.logging.max_size_bytes
                ),
            });
        }
        if self.logging.max_rotated_files == 0 {
            return Err(VrError::InvalidConfig {
                details: "logging.max_rotated_files must be >= 1".to_string(),
            });
        }

        let url = self.client.service_url.as_str();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(VrError::InvalidConfig {
                details: format!("client.service_url must be an http(s) URL, got {url:?}"),
            });
        }
        if self.client.timeout_ms == 0 {
            return Err(VrError::InvalidConfig {
                details: "client.timeout_ms must be >= 1".to_string(),
            });
        }

        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|error| VrError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}
