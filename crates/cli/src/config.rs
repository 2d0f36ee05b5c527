// Tunneld - CLI Config Module
// Where tunnelctl finds the daemon and its token

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// CLI configuration stored in ~/.config/tunneld/cli.toml
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CliConfig {
    /// Base URL of the daemon's control API
    #[serde(default = "default_daemon_url")]
    pub daemon_url: String,

    /// Bearer token obtained via `tunnelctl login`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

fn default_daemon_url() -> String {
    "http://127.0.0.1:8322".to_string()
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            daemon_url: default_daemon_url(),
            token: None,
        }
    }
}

impl CliConfig {
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("could not determine config directory"))?;
        Ok(config_dir.join("tunneld").join("cli.toml"))
    }

    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let contents =
            fs::read_to_string(&config_path).context("failed to read CLI configuration")?;
        toml::from_str(&contents).context("failed to parse CLI configuration")
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("failed to create configuration directory")?;
        }

        let contents =
            toml::to_string_pretty(self).context("failed to serialize CLI configuration")?;
        fs::write(&config_path, contents).context("failed to write CLI configuration")?;

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
    fn defaults_point_at_loopback() {
        let config = CliConfig::default();
        assert_eq!(config.daemon_url, "http://127.0.0.1:8322");
        assert!(config.token.is_none());
    }

    #[test]
    fn toml_round_trip_keeps_token() {
        let config = CliConfig {
            daemon_url: "https://tunnels.internal:8443".into(),
            token: Some("abc".into()),
        };
        let raw = toml::to_string_pretty(&config).unwrap();
        let back: CliConfig = toml::from_str(&raw).unwrap();
        assert_eq!(back.daemon_url, config.daemon_url);
        assert_eq!(back.token.as_deref(), Some("abc"));
    }
}
