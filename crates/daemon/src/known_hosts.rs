// Tunneld - Known Hosts Module
// Host key verification against an OpenSSH-style known_hosts file

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Result of checking a server key against the file
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyResult {
    /// Host present and key matches
    Trusted,
    /// Host not present (first connection)
    Unknown,
    /// Host present with a different key
    Mismatch {
        actual_fingerprint: String,
        line_number: usize,
    },
}

#[derive(Debug, Clone)]
struct HostEntry {
    host_pattern: String,
    key_type: String,
    key_data: String,
    line_number: usize,
}

impl HostEntry {
    /// Parse one `host_pattern key_type key_data [comment]` line
    fn parse(line: &str, line_number: usize) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let mut parts = line.split_whitespace();
        let host_pattern = parts.next()?.to_string();
        let key_type = parts.next()?.to_string();
        let key_data = match parts.next() {
            Some(d) => d.to_string(),
            None => {
                warn!("known_hosts line {} has too few fields", line_number);
                return None;
            }
        };

        Some(HostEntry {
            host_pattern,
            key_type,
            key_data,
            line_number,
        })
    }

    fn matches(&self, host: &str, port: u16) -> bool {
        if self.host_pattern == host_pattern(host, port) {
            return true;
        }
        // Port-22 entries are commonly written without the bracket form
        port == 22 && self.host_pattern == host
    }

    fn matches_key(&self, key: &PublicKey) -> bool {
        self.key_type == key_algorithm(key) && self.key_data == key.public_key_base64()
    }
}

/// An OpenSSH-style known_hosts file
pub struct KnownHosts {
    path: PathBuf,
    entries: Vec<HostEntry>,
}

impl KnownHosts {
    /// Load the file; a missing file is an empty (not an error) state
    pub fn load(path: &Path) -> Result<Self> {
        let mut entries = Vec::new();

        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("failed to read known_hosts: {}", path.display()))?;
            for (idx, line) in contents.lines().enumerate() {
                if let Some(entry) = HostEntry::parse(line, idx + 1) {
                    entries.push(entry);
                }
            }
            debug!(
                "loaded {} known_hosts entries from {}",
                entries.len(),
                path.display()
            );
        }

        Ok(KnownHosts {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> VerifyResult {
        let matching: Vec<&HostEntry> = self
            .entries
            .iter()
            .filter(|e| e.matches(host, port))
            .collect();

        if matching.is_empty() {
            return VerifyResult::Unknown;
        }

        if matching.iter().any(|e| e.matches_key(key)) {
            return VerifyResult::Trusted;
        }

        VerifyResult::Mismatch {
            actual_fingerprint: fingerprint(key),
            line_number: matching[0].line_number,
        }
    }

    /// Record a host key (accept-new behavior); callers persist with `save`
    pub fn add(&mut self, host: &str, port: u16, key: &PublicKey) {
        let line_number = self.entries.len() + 1;
        self.entries.push(HostEntry {
            host_pattern: host_pattern(host, port),
            key_type: key_algorithm(key),
            key_data: key.public_key_base64(),
            line_number,
        });
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("failed to create known_hosts directory")?;
        }

        let mut file = fs::File::create(&self.path)
            .with_context(|| format!("failed to create known_hosts: {}", self.path.display()))?;
        for entry in &self.entries {
            writeln!(
                file,
                "{} {} {}",
                entry.host_pattern, entry.key_type, entry.key_data
            )?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))
                .context("failed to set known_hosts permissions")?;
        }

        Ok(())
    }
}

/// `host` for port 22, `[host]:port` otherwise
fn host_pattern(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// Algorithm name from the SSH wire encoding (length-prefixed first field)
fn key_algorithm(key: &PublicKey) -> String {
    let bytes = key.public_key_bytes();
    if bytes.len() < 4 {
        return "unknown".to_string();
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if bytes.len() < 4 + len {
        return "unknown".to_string();
    }
    String::from_utf8_lossy(&bytes[4..4 + len]).to_string()
}

/// OpenSSH-style SHA256 fingerprint
pub fn fingerprint(key: &PublicKey) -> String {
    let digest = Sha256::digest(key.public_key_bytes());
    format!("SHA256:{}", BASE64.encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_host_pattern() {
        assert_eq!(host_pattern("example.com", 22), "example.com");
        assert_eq!(host_pattern("example.com", 2222), "[example.com]:2222");
    }

    #[test]
    fn test_entry_parse() {
        let entry =
            HostEntry::parse("example.com ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAbc123", 7).unwrap();
        assert_eq!(entry.host_pattern, "example.com");
        assert_eq!(entry.key_type, "ssh-ed25519");
        assert_eq!(entry.line_number, 7);

        assert!(HostEntry::parse("# comment", 1).is_none());
        assert!(HostEntry::parse("", 1).is_none());
        assert!(HostEntry::parse("only two", 1).is_none());
    }

    #[test]
    fn test_entry_matches_port_forms() {
        let plain = HostEntry {
            host_pattern: "example.com".into(),
            key_type: "ssh-ed25519".into(),
            key_data: "data".into(),
            line_number: 1,
        };
        assert!(plain.matches("example.com", 22));
        assert!(!plain.matches("example.com", 2222));
        assert!(!plain.matches("other.com", 22));

        let bracketed = HostEntry {
            host_pattern: "[example.com]:2222".into(),
            key_type: "ssh-ed25519".into(),
            key_data: "data".into(),
            line_number: 1,
        };
        assert!(bracketed.matches("example.com", 2222));
        assert!(!bracketed.matches("example.com", 22));
    }

    #[test]
    fn test_unknown_host_and_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("known_hosts");

        let kh = KnownHosts::load(&path).unwrap();
        assert!(kh.entries.is_empty());

        let mut kh = KnownHosts {
            path: path.clone(),
            entries: vec![HostEntry {
                host_pattern: "example.com".into(),
                key_type: "ssh-ed25519".into(),
                key_data: "AAAAC3NzaC1lZDI1NTE5AAAAIAbc123".into(),
                line_number: 1,
            }],
        };
        kh.entries.push(HostEntry {
            host_pattern: "[10.0.0.1]:2222".into(),
            key_type: "ssh-rsa".into(),
            key_data: "AAAAB3NzaC1yc2E".into(),
            line_number: 2,
        });
        kh.save().unwrap();

        let loaded = KnownHosts::load(&path).unwrap();
        assert_eq!(loaded.entries.len(), 2);
        assert_eq!(loaded.entries[1].host_pattern, "[10.0.0.1]:2222");
    }
}
