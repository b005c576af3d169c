use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

/// Command line options for the chat service.
#[derive(Parser, Debug, Default)]
pub struct Cli {
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Runtime configuration resolved from file, env and CLI.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// Base directory for the SQLite database.
    pub data_dir: PathBuf,
    /// Deadline for a single storage operation, in milliseconds.
    pub op_timeout_ms: u64,
    /// Seconds between unread-counter reconciliation passes; 0 disables.
    pub reconcile_secs: u64,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    storage: FileStorage,
    #[serde(default)]
    logging: FileLogging,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
}

#[derive(Deserialize)]
struct FileStorage {
    #[serde(default = "default_op_timeout_ms")]
    op_timeout_ms: u64,
    #[serde(default = "default_reconcile_secs")]
    reconcile_secs: u64,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

fn default_port() -> u16 {
    8790
}

fn default_op_timeout_ms() -> u64 {
    5000
}

fn default_reconcile_secs() -> u64 {
    300
}

fn default_logging() -> bool {
    true
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for FileStorage {
    fn default() -> Self {
        Self {
            op_timeout_ms: default_op_timeout_ms(),
            reconcile_secs: default_reconcile_secs(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_logging(),
        }
    }
}

impl Config {
    /// Resolve configuration with CLI -> env -> file -> default precedence.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut port = default_port();
        let mut op_timeout_ms = default_op_timeout_ms();
        let mut reconcile_secs = default_reconcile_secs();
        let mut logging = default_logging();

        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("SKILLCHAT_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/skillchat.toml"));

        if let Ok(bytes) = fs::read(&config_path) {
            let contents = String::from_utf8_lossy(&bytes);
            let file_cfg: FileConfig = toml::from_str(&contents).context("invalid config file")?;
            port = file_cfg.server.port;
            op_timeout_ms = file_cfg.storage.op_timeout_ms;
            reconcile_secs = file_cfg.storage.reconcile_secs;
            logging = file_cfg.logging.enabled;
        }

        if let Ok(p) = std::env::var("SKILLCHAT_PORT") {
            if let Ok(p) = p.parse::<u16>() {
                port = p;
            }
        }
        if let Ok(t) = std::env::var("SKILLCHAT_OP_TIMEOUT_MS") {
            if let Ok(t) = t.parse::<u64>() {
                op_timeout_ms = t;
            }
        }
        if let Ok(r) = std::env::var("SKILLCHAT_RECONCILE_SECS") {
            if let Ok(r) = r.parse::<u64>() {
                reconcile_secs = r;
            }
        }
        if let Ok(l) = std::env::var("SKILLCHAT_LOGGING") {
            if let Ok(l) = l.parse::<bool>() {
                logging = l;
            }
        }

        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            logging = l;
        }

        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }
        if op_timeout_ms == 0 {
            anyhow::bail!("invalid_op_timeout");
        }

        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());

        Ok(Self {
            bind,
            data_dir,
            op_timeout_ms,
            reconcile_secs,
            logging_enabled: logging,
        })
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    /// None when reconciliation is disabled.
    pub fn reconcile_interval(&self) -> Option<Duration> {
        (self.reconcile_secs > 0).then(|| Duration::from_secs(self.reconcile_secs))
    }
}

/// Determine the default data directory for the service.
pub fn default_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".local/share/skillchat");
        p
    } else {
        PathBuf::from("./skillchat_data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    fn clear_env() {
        for var in [
            "SKILLCHAT_PORT",
            "SKILLCHAT_LOGGING",
            "SKILLCHAT_OP_TIMEOUT_MS",
            "SKILLCHAT_RECONCILE_SECS",
            "BIND",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn valid_config_parses() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(
            &path,
            "[server]\nport=5555\n[storage]\nop_timeout_ms=250\nreconcile_secs=0\n[logging]\nenabled=false\n",
        )
        .unwrap();
        let cli = Cli {
            config: Some(path),
            ..Default::default()
        };
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:5555");
        assert_eq!(cfg.op_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.reconcile_interval(), None);
        assert!(!cfg.logging_enabled);
    }

    #[test]
    #[serial]
    fn invalid_port_fails() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(&path, "[server]\nport=80\n").unwrap();
        let cli = Cli {
            config: Some(path),
            ..Default::default()
        };
        assert!(Config::load(&cli).is_err());
    }

    #[test]
    #[serial]
    fn missing_keys_default() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(&path, "").unwrap();
        let cli = Cli {
            config: Some(path),
            ..Default::default()
        };
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:8790");
        assert_eq!(cfg.op_timeout(), Duration::from_millis(5000));
        assert_eq!(cfg.reconcile_interval(), Some(Duration::from_secs(300)));
        assert!(cfg.logging_enabled);
    }

    #[test]
    #[serial]
    fn precedence_cli_env_file() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(&path, "[server]\nport=1111\n").unwrap();
        std::env::set_var("SKILLCHAT_PORT", "2222");
        let cli = Cli {
            config: Some(path.clone()),
            port: Some(3333),
            ..Default::default()
        };
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:3333");
        let cli = Cli {
            config: Some(path),
            ..Default::default()
        };
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:2222");
        std::env::remove_var("SKILLCHAT_PORT");
    }
}
