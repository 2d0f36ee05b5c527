// Common types for tunneld

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Type of port forwarding a tunnel performs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    /// Local port forwarding (bind local port, forward to remote)
    Local,
    /// Remote port forwarding (bind remote port, forward back to local)
    Remote,
    /// Dynamic port forwarding (SOCKS5 proxy)
    Dynamic,
}

impl std::fmt::Display for TunnelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelType::Local => write!(f, "local"),
            TunnelType::Remote => write!(f, "remote"),
            TunnelType::Dynamic => write!(f, "dynamic"),
        }
    }
}

/// Lifecycle state of a tunnel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    /// Created, connecting in the background
    Pending,
    /// Session up, forwarder listening
    Active,
    /// Connection attempt or live session failed
    Failed,
    /// Stopped by the user; spec retained, no listener or wire connection
    Stopped,
}

impl TunnelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::Pending => "pending",
            TunnelState::Active => "active",
            TunnelState::Failed => "failed",
            TunnelState::Stopped => "stopped",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, TunnelState::Active)
    }
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SSH authentication method for a hop
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Private-key file (optionally passphrase protected)
    Key,
    /// Static password
    Password,
    /// ssh-agent socket
    Agent,
    /// OpenSSH user certificate + matching private key
    Cert,
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::Key => write!(f, "key"),
            AuthMethod::Password => write!(f, "password"),
            AuthMethod::Agent => write!(f, "agent"),
            AuthMethod::Cert => write!(f, "cert"),
        }
    }
}

/// Host-key verification policy for a hop
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyMode {
    /// Refuse unknown hosts, refuse mismatches
    #[default]
    Strict,
    /// Trust known_hosts matches, record unknown hosts, refuse mismatches
    KnownHosts,
    /// Accept any server key
    Insecure,
}

/// One SSH server in a connection chain. Immutable after tunnel creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Hop {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth_method: AuthMethod,
    /// Private-key (or certificate) path reference; `~` is expanded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    /// Static credential for the password method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub host_key: HostKeyMode,
}

/// Declarative tunnel record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelSpec {
    pub id: String,
    pub name: String,
    pub owner: String,
    #[serde(rename = "type")]
    pub tunnel_type: TunnelType,
    pub hops: Vec<Hop>,
    /// 0 requests an ephemeral port; the bound port is written back
    #[serde(default)]
    pub local_port: u16,
    #[serde(default = "default_bind_address")]
    pub local_bind_address: String,
    #[serde(default)]
    pub remote_host: String,
    #[serde(default)]
    pub remote_port: u16,
    #[serde(default)]
    pub auto_reconnect: bool,
    /// Keep-alive probe interval in whole seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

pub fn default_keep_alive() -> u64 {
    30
}

pub fn default_max_retries() -> u32 {
    5
}

/// Live status of a tunnel, mutated only under the owning tunnel's lock
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatus {
    pub tunnel_id: String,
    pub state: TunnelState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub retry_count: u32,
}

impl TunnelStatus {
    pub fn new(tunnel_id: impl Into<String>) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            state: TunnelState::Pending,
            connected_at: None,
            last_error: String::new(),
            bytes_sent: 0,
            bytes_received: 0,
            retry_count: 0,
        }
    }
}

/// Push-channel message emitted whenever a tunnel's status changes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelEvent {
    TunnelUpdate {
        #[serde(rename = "tunnelId")]
        tunnel_id: String,
        status: TunnelStatus,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> TunnelSpec {
        TunnelSpec {
            id: "t-1".into(),
            name: "db".into(),
            owner: "ops".into(),
            tunnel_type: TunnelType::Local,
            hops: vec![Hop {
                host: "bastion.example.com".into(),
                port: 22,
                user: "deploy".into(),
                auth_method: AuthMethod::Key,
                key_id: Some("~/.ssh/id_ed25519".into()),
                password: None,
                host_key: HostKeyMode::KnownHosts,
            }],
            local_port: 0,
            local_bind_address: default_bind_address(),
            remote_host: "10.0.0.5".into(),
            remote_port: 5432,
            auto_reconnect: true,
            keep_alive: 30,
            max_retries: 3,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn spec_json_uses_camel_case_and_lowercase_enums() {
        let json = serde_json::to_value(sample_spec()).unwrap();
        assert_eq!(json["type"], "local");
        assert_eq!(json["localBindAddress"], "127.0.0.1");
        assert_eq!(json["hops"][0]["auth_method"], "key");
        assert_eq!(json["hops"][0]["host_key"], "known-hosts");
    }

    #[test]
    fn spec_round_trips_through_json() {
        let spec = sample_spec();
        let json = serde_json::to_string(&spec).unwrap();
        let back: TunnelSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, spec.id);
        assert_eq!(back.hops, spec.hops);
        assert_eq!(back.keep_alive, 30);
    }

    #[test]
    fn missing_optional_fields_take_defaults() {
        let json = r#"{
            "id": "t-2", "name": "n", "owner": "o", "type": "dynamic",
            "hops": [{"host": "h", "port": 22, "user": "u", "auth_method": "agent"}],
            "createdAt": "2025-01-01T00:00:00Z", "updatedAt": "2025-01-01T00:00:00Z"
        }"#;
        let spec: TunnelSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.local_port, 0);
        assert_eq!(spec.local_bind_address, "127.0.0.1");
        assert_eq!(spec.keep_alive, 30);
        assert_eq!(spec.hops[0].host_key, HostKeyMode::Strict);
    }

    #[test]
    fn tunnel_update_event_shape() {
        let ev = TunnelEvent::TunnelUpdate {
            tunnel_id: "t-1".into(),
            status: TunnelStatus::new("t-1"),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "tunnel_update");
        assert_eq!(json["tunnelId"], "t-1");
        assert_eq!(json["status"]["state"], "pending");
    }
}
