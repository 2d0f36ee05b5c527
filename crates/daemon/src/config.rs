// Tunneld - Daemon Config Module
// Listener address, storage path, auth and TLS settings

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Signed-token gating of the control API
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// HMAC secret for signing tokens
    pub secret: String,
    /// Login username
    #[serde(default = "default_auth_username")]
    pub username: String,
    /// Hex-encoded SHA-256 of the login password
    pub password_sha256: String,
    /// Lifetime of issued tokens in seconds
    #[serde(default = "default_token_lifetime")]
    pub token_lifetime_secs: u64,
}

fn default_auth_username() -> String {
    "admin".to_string()
}

fn default_token_lifetime() -> u64 {
    86_400
}

/// TLS for the control endpoint; certificates are operator-supplied PEM files
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// Where the control API binds, e.g. "127.0.0.1:8322"
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Path to the SQLite tunnel store
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    /// Path to the known_hosts file used for host-key verification
    #[serde(default = "default_known_hosts_path")]
    pub known_hosts_path: PathBuf,

    /// Verbose logging
    #[serde(default)]
    pub debug: bool,

    /// When present, control operations require a signed token
    #[serde(default)]
    pub auth: Option<AuthConfig>,

    /// When present, the control endpoint serves HTTPS
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

fn config_base() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tunneld")
}

fn default_listen_address() -> String {
    "127.0.0.1:8322".to_string()
}

fn default_storage_path() -> PathBuf {
    config_base().join("tunnels.db")
}

fn default_known_hosts_path() -> PathBuf {
    config_base().join("known_hosts")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            storage_path: default_storage_path(),
            known_hosts_path: default_known_hosts_path(),
            debug: false,
            auth: None,
            tls: None,
        }
    }
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<()> {
        let (host, _port) = tunneld_common::split_host_port(&self.listen_address)
            .ok_or_else(|| anyhow::anyhow!("listen_address must be host:port"))?;

        // Plaintext HTTP on a non-loopback interface is a misconfiguration
        if self.tls.is_none() && !tunneld_common::is_loopback_address(&host) {
            anyhow::bail!(
                "listen_address {} is not loopback; configure [tls] or bind to 127.0.0.1",
                self.listen_address
            );
        }

        if let Some(auth) = &self.auth {
            if auth.secret.len() < 16 {
                anyhow::bail!("auth.secret must be at least 16 characters");
            }
            if auth.password_sha256.len() != 64
                || !auth.password_sha256.chars().all(|c| c.is_ascii_hexdigit())
            {
                anyhow::bail!("auth.password_sha256 must be a hex-encoded SHA-256 digest");
            }
        }

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir =
            dirs::config_dir().ok_or_else(|| anyhow::anyhow!("could not determine config directory"))?;
        Ok(config_dir.join("tunneld").join("daemon.toml"))
    }

    /// Load the daemon configuration, writing defaults on first run
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("no daemon configuration found, using defaults");
            info!("configuration will be saved to: {}", config_path.display());
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let contents =
            fs::read_to_string(&config_path).context("failed to read daemon configuration")?;
        let config: Self =
            toml::from_str(&contents).context("failed to parse daemon configuration")?;

        config.validate().context("configuration validation failed")?;
        info!("loaded daemon configuration from {}", config_path.display());
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("failed to create configuration directory")?;
        }

        let contents =
            toml::to_string_pretty(self).context("failed to serialize daemon configuration")?;
        fs::write(&config_path, contents).context("failed to write daemon configuration")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))
                .context("failed to set config file permissions")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(DaemonConfig::default().validate().is_ok());
    }

    #[test]
    fn non_loopback_without_tls_is_rejected() {
        let config = DaemonConfig {
            listen_address: "0.0.0.0:8322".into(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("loopback"));
    }

    #[test]
    fn non_loopback_with_tls_is_accepted() {
        let config = DaemonConfig {
            listen_address: "0.0.0.0:8322".into(),
            tls: Some(TlsConfig {
                cert_path: "/etc/tunneld/server.crt".into(),
                key_path: "/etc/tunneld/server.key".into(),
            }),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn auth_secret_and_digest_are_checked() {
        let mut config = DaemonConfig {
            auth: Some(AuthConfig {
                secret: "short".into(),
                username: "admin".into(),
                password_sha256: "ab".repeat(32),
                token_lifetime_secs: 3600,
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.auth.as_mut().unwrap().secret = "a-sufficiently-long-secret".into();
        assert!(config.validate().is_ok());

        config.auth.as_mut().unwrap().password_sha256 = "not-hex".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = DaemonConfig {
            listen_address: "127.0.0.1:9000".into(),
            debug: true,
            ..Default::default()
        };
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let back: DaemonConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(back.listen_address, "127.0.0.1:9000");
        assert!(back.debug);
        assert!(back.auth.is_none());
    }
}
