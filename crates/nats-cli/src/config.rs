//! CLI configuration file
//!
//! Settings are read from `<config_dir>/nats/config.toml` (or `--config`)
//! and then overridden by whatever was given on the command line.
//!
//! ```toml
//! server = "nats://demo.example:4222"
//! name = "ops-shell"
//! token = "s3cr3t"
//! log_level = "debug"
//!
//! [tls]
//! enabled = true
//! ca_file = "/etc/nats/ca.pem"
//!
//! [reconnect]
//! max = 10
//! wait_ms = 500
//! ```

use anyhow::{Context, Result};
use nats_client::{Options, TlsOptions};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CliConfig {
    /// Server URL, or a comma-separated list of URLs
    pub server: Option<String>,
    pub name: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub log_level: Option<String>,
    pub json_logs: Option<bool>,
    pub tls: TlsSection,
    pub reconnect: ReconnectSection,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TlsSection {
    pub enabled: bool,
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub hostname: Option<String>,
    pub skip_verify: bool,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectSection {
    pub max: Option<i32>,
    pub wait_ms: Option<u64>,
    pub disabled: bool,
}

/// Values given on the command line; `None` means "not given"
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub server: Option<String>,
    pub name: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub tls: bool,
}

impl CliConfig {
    /// Parse a config document
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("Invalid config file")
    }

    /// Load the explicit path, or the default location when it exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (default_config_file(), false),
        };
        if !path.exists() {
            if required {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("In {}", path.display()))
    }

    /// Apply command-line overrides
    pub fn merge(mut self, cli: Overrides) -> Self {
        if cli.server.is_some() {
            self.server = cli.server;
        }
        if cli.name.is_some() {
            self.name = cli.name;
        }
        if cli.user.is_some() {
            self.user = cli.user;
        }
        if cli.password.is_some() {
            self.password = cli.password;
        }
        if cli.token.is_some() {
            self.token = cli.token;
        }
        self.tls.enabled |= cli.tls;
        self
    }

    /// Build client options from the merged settings
    pub fn to_options(&self) -> Options {
        let mut opts = Options::new();

        if let Some(server) = &self.server {
            let urls: Vec<&str> = server
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            opts = match urls.as_slice() {
                [single] => opts.url(single),
                many => opts.servers(many),
            };
        }
        if let Some(name) = &self.name {
            opts = opts.name(name);
        }
        if let Some(user) = &self.user {
            opts = opts.user_info(user, self.password.as_deref().unwrap_or(""));
        }
        if let Some(token) = &self.token {
            opts = opts.token(token);
        }

        if self.tls.enabled {
            opts = opts.secure(true).tls_options(TlsOptions {
                ca_file: self.tls.ca_file.clone(),
                cert_file: self.tls.cert_file.clone(),
                key_file: self.tls.key_file.clone(),
                expected_hostname: self.tls.hostname.clone(),
                skip_verify: self.tls.skip_verify,
            });
        }

        if self.reconnect.disabled {
            opts = opts.allow_reconnect(false);
        }
        if let Some(max) = self.reconnect.max {
            opts = opts.max_reconnect(max);
        }
        if let Some(wait) = self.reconnect.wait_ms {
            opts = opts.reconnect_wait(Duration::from_millis(wait));
        }

        opts
    }
}

/// Default config file location
pub fn default_config_file() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nats")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = CliConfig::parse(
            r#"
            server = "nats://a:4222, nats://b:4222"
            name = "shell"
            user = "alice"
            password = "pw"
            log_level = "debug"

            [tls]
            enabled = true
            hostname = "nats.internal"

            [reconnect]
            max = 5
            wait_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.server.as_deref(), Some("nats://a:4222, nats://b:4222"));
        assert_eq!(config.user.as_deref(), Some("alice"));
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert!(config.tls.enabled);
        assert_eq!(config.tls.hostname.as_deref(), Some("nats.internal"));
        assert_eq!(config.reconnect.max, Some(5));
        assert_eq!(config.reconnect.wait_ms, Some(250));
    }

    #[test]
    fn test_empty_config_is_default() {
        assert_eq!(CliConfig::parse("").unwrap(), CliConfig::default());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(CliConfig::parse("sever = \"typo\"").is_err());
    }

    #[test]
    fn test_flags_override_file() {
        let file = CliConfig {
            server: Some("nats://file:4222".into()),
            name: Some("from-file".into()),
            token: Some("file-token".into()),
            ..Default::default()
        };
        let merged = file.merge(Overrides {
            server: Some("nats://flag:4222".into()),
            tls: true,
            ..Default::default()
        });

        assert_eq!(merged.server.as_deref(), Some("nats://flag:4222"));
        assert_eq!(merged.name.as_deref(), Some("from-file"));
        assert_eq!(merged.token.as_deref(), Some("file-token"));
        assert!(merged.tls.enabled);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let missing = std::env::temp_dir().join("nats-cli-does-not-exist.toml");
        assert!(CliConfig::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("nats-cli-{}.toml", std::process::id()));
        std::fs::write(&path, "name = \"loaded\"\n[reconnect]\ndisabled = true\n").unwrap();
        let config = CliConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.name.as_deref(), Some("loaded"));
        assert!(config.reconnect.disabled);
    }

    #[test]
    fn test_default_location() {
        let path = default_config_file();
        assert!(path.ends_with("nats/config.toml"));
    }
}
