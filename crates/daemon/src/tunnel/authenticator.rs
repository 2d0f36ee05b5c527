// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunneld Contributors

// Tunneld - Authenticator Module
// Produces and runs SSH authentication material for one hop

use std::path::PathBuf;
use std::sync::Arc;

use russh::client::{self, AuthResult, Handle};
use russh::keys::{load_openssh_certificate, load_secret_key, PrivateKeyWithHashAlg};
use tracing::{debug, info, warn};

use tunneld_common::{AuthMethod, Error, Hop, Result};

/// Expand a leading `~` to the user's home directory
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

/// Authentication material for a single hop
#[derive(Debug, Clone)]
pub enum Authenticator {
    /// Private-key file, optionally passphrase protected
    Key {
        path: PathBuf,
        passphrase: Option<String>,
    },
    /// Static password
    Password { password: String },
    /// ssh-agent, socket from SSH_AUTH_SOCK or an explicit path
    Agent { socket: Option<PathBuf> },
    /// OpenSSH user certificate plus the matching private key
    Cert { cert_path: PathBuf, key_path: PathBuf },
}

impl Authenticator {
    /// Build the authenticator described by a hop
    pub fn for_hop(hop: &Hop) -> Result<Self> {
        match hop.auth_method {
            AuthMethod::Key => {
                let key_id = hop.key_id.as_deref().ok_or_else(|| {
                    Error::Authentication(format!("key_id is required for key auth on {}", hop.host))
                })?;
                Ok(Authenticator::Key {
                    path: expand_path(key_id),
                    passphrase: hop.password.clone(),
                })
            }
            AuthMethod::Password => {
                let password = hop.password.clone().ok_or_else(|| {
                    Error::Authentication(format!(
                        "password is required for password auth on {}",
                        hop.host
                    ))
                })?;
                Ok(Authenticator::Password { password })
            }
            AuthMethod::Agent => Ok(Authenticator::Agent {
                socket: hop.key_id.as_deref().map(expand_path),
            }),
            AuthMethod::Cert => {
                let cert_id = hop.key_id.as_deref().ok_or_else(|| {
                    Error::Authentication(format!(
                        "key_id (certificate path) is required for cert auth on {}",
                        hop.host
                    ))
                })?;
                let cert_path = expand_path(cert_id);
                // Convention: "id_ed25519-cert.pub" signs with "id_ed25519"
                let key_path = derive_cert_key_path(&cert_path);
                Ok(Authenticator::Cert {
                    cert_path,
                    key_path,
                })
            }
        }
    }

    /// Run the SSH authentication exchange on an established handle.
    /// Returns Ok(true) on success, Ok(false) when the server rejected the
    /// material, Err when the material itself could not be produced.
    pub async fn authenticate<H: client::Handler>(
        &self,
        handle: &mut Handle<H>,
        user: &str,
        host: &str,
    ) -> Result<bool> {
        match self {
            Authenticator::Key { path, passphrase } => {
                debug!("authenticating {}@{} with key {}", user, host, path.display());
                let key = load_secret_key(path, passphrase.as_deref()).map_err(|e| {
                    Error::Authentication(format!(
                        "failed to load private key {}: {}",
                        path.display(),
                        e
                    ))
                })?;

                let hash_alg = handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(|e| Error::Authentication(format!("rsa hash negotiation: {}", e)))?
                    .flatten();

                let result = handle
                    .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
                    .await
                    .map_err(|e| Error::Authentication(format!("publickey exchange: {}", e)))?;
                Ok(auth_result_ok(result, user, host, "publickey")?)
            }

            Authenticator::Password { password } => {
                debug!("authenticating {}@{} with password", user, host);
                let result = handle
                    .authenticate_password(user, password)
                    .await
                    .map_err(|e| Error::Authentication(format!("password exchange: {}", e)))?;
                Ok(auth_result_ok(result, user, host, "password")?)
            }

            Authenticator::Agent { socket } => {
                self.authenticate_with_agent(handle, user, host, socket.as_deref())
                    .await
            }

            Authenticator::Cert {
                cert_path,
                key_path,
            } => {
                debug!(
                    "authenticating {}@{} with certificate {}",
                    user,
                    host,
                    cert_path.display()
                );
                let cert = load_openssh_certificate(cert_path).map_err(|e| {
                    Error::Authentication(format!(
                        "failed to load certificate {}: {}",
                        cert_path.display(),
                        e
                    ))
                })?;
                let key = load_secret_key(key_path, None).map_err(|e| {
                    Error::Authentication(format!(
                        "failed to load certificate key {}: {}",
                        key_path.display(),
                        e
                    ))
                })?;

                let result = handle
                    .authenticate_openssh_cert(user, Arc::new(key), cert)
                    .await
                    .map_err(|e| Error::Authentication(format!("certificate exchange: {}", e)))?;
                Ok(auth_result_ok(result, user, host, "certificate")?)
            }
        }
    }

    #[cfg(unix)]
    async fn authenticate_with_agent<H: client::Handler>(
        &self,
        handle: &mut Handle<H>,
        user: &str,
        host: &str,
        socket: Option<&std::path::Path>,
    ) -> Result<bool> {
        use russh::keys::agent::client::AgentClient;

        let mut agent = match socket {
            Some(path) => AgentClient::connect_uds(path).await.map_err(|e| {
                Error::Authentication(format!("agent socket {}: {}", path.display(), e))
            })?,
            None => AgentClient::connect_env()
                .await
                .map_err(|e| Error::Authentication(format!("ssh-agent unreachable: {}", e)))?,
        };

        let identities = agent
            .request_identities()
            .await
            .map_err(|e| Error::Authentication(format!("agent identities: {}", e)))?;

        if identities.is_empty() {
            return Err(Error::Authentication(format!(
                "ssh-agent holds no identities for {}@{}",
                user, host
            )));
        }

        for public_key in identities {
            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();

            match handle
                .authenticate_publickey_with(user, public_key, hash_alg, &mut agent)
                .await
            {
                Ok(result) if result.success() => return Ok(true),
                Ok(_) => continue,
                Err(e) => {
                    debug!("agent identity rejected for {}@{}: {}", user, host, e);
                    continue;
                }
            }
        }

        info!("no agent identity accepted for {}@{}", user, host);
        Ok(false)
    }

    #[cfg(not(unix))]
    async fn authenticate_with_agent<H: client::Handler>(
        &self,
        _handle: &mut Handle<H>,
        user: &str,
        host: &str,
        _socket: Option<&std::path::Path>,
    ) -> Result<bool> {
        Err(Error::Authentication(format!(
            "ssh-agent auth is not supported on this platform ({}@{})",
            user, host
        )))
    }
}

/// Sequences several authenticators; variants that cannot produce material
/// are skipped, and the whole attempt fails only if none succeed.
pub struct MultiAuthenticator {
    authenticators: Vec<Authenticator>,
}

impl MultiAuthenticator {
    pub fn new(authenticators: Vec<Authenticator>) -> Self {
        Self { authenticators }
    }

    pub fn for_hop(hop: &Hop) -> Result<Self> {
        Ok(Self::new(vec![Authenticator::for_hop(hop)?]))
    }

    pub fn push(&mut self, authenticator: Authenticator) {
        self.authenticators.push(authenticator);
    }

    pub fn is_empty(&self) -> bool {
        self.authenticators.is_empty()
    }

    pub async fn authenticate<H: client::Handler>(
        &self,
        handle: &mut Handle<H>,
        user: &str,
        host: &str,
    ) -> Result<()> {
        let mut last_error: Option<Error> = None;

        for authenticator in &self.authenticators {
            match authenticator.authenticate(handle, user, host).await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    last_error = Some(Error::Authentication(format!(
                        "server rejected credentials for {}@{}",
                        user, host
                    )));
                }
                Err(e) => {
                    // Material could not be produced; try the next one
                    warn!("authenticator unusable for {}@{}: {}", user, host, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::Authentication(format!("no authenticators configured for {}@{}", user, host))
        }))
    }
}

/// Map an AuthResult to success/failure, surfacing the remaining methods
fn auth_result_ok(result: AuthResult, user: &str, host: &str, method: &str) -> Result<bool> {
    match result {
        AuthResult::Success => Ok(true),
        AuthResult::Failure {
            remaining_methods,
            partial_success,
        } => {
            let methods: Vec<String> = remaining_methods
                .iter()
                .map(|m| {
                    let s: &str = m.into();
                    s.to_string()
                })
                .collect();
            if partial_success {
                // Accepted but wants more; we have nothing further to offer
                Err(Error::Authentication(format!(
                    "{} accepted for {}@{} but server requires additional methods: {}",
                    method,
                    user,
                    host,
                    methods.join(", ")
                )))
            } else {
                debug!(
                    "{} rejected for {}@{}; server offers: {}",
                    method,
                    user,
                    host,
                    methods.join(", ")
                );
                Ok(false)
            }
        }
    }
}

/// Strip the OpenSSH "-cert.pub" suffix to locate the signing key
fn derive_cert_key_path(cert_path: &std::path::Path) -> PathBuf {
    let name = cert_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    match name.strip_suffix("-cert.pub") {
        Some(stem) => cert_path.with_file_name(stem),
        None => cert_path.with_extension(""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunneld_common::HostKeyMode;

    fn hop(method: AuthMethod, key_id: Option<&str>, password: Option<&str>) -> Hop {
        Hop {
            host: "bastion".into(),
            port: 22,
            user: "deploy".into(),
            auth_method: method,
            key_id: key_id.map(String::from),
            password: password.map(String::from),
            host_key: HostKeyMode::Insecure,
        }
    }

    #[test]
    fn expand_path_handles_tilde() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_path("~/.ssh/id_ed25519"), home.join(".ssh/id_ed25519"));
        assert_eq!(expand_path("/abs/key"), PathBuf::from("/abs/key"));
        assert_eq!(expand_path("relative/key"), PathBuf::from("relative/key"));
    }

    #[test]
    fn for_hop_requires_material_references() {
        assert!(Authenticator::for_hop(&hop(AuthMethod::Key, None, None)).is_err());
        assert!(Authenticator::for_hop(&hop(AuthMethod::Password, None, None)).is_err());
        assert!(Authenticator::for_hop(&hop(AuthMethod::Cert, None, None)).is_err());
        // Agent works without an explicit socket (falls back to SSH_AUTH_SOCK)
        assert!(Authenticator::for_hop(&hop(AuthMethod::Agent, None, None)).is_ok());
    }

    #[test]
    fn for_hop_builds_expected_variants() {
        match Authenticator::for_hop(&hop(AuthMethod::Key, Some("/tmp/k"), Some("pp"))).unwrap() {
            Authenticator::Key { path, passphrase } => {
                assert_eq!(path, PathBuf::from("/tmp/k"));
                assert_eq!(passphrase.as_deref(), Some("pp"));
            }
            other => panic!("unexpected variant: {:?}", other),
        }

        match Authenticator::for_hop(&hop(AuthMethod::Password, None, Some("s3cret"))).unwrap() {
            Authenticator::Password { password } => assert_eq!(password, "s3cret"),
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn cert_key_path_derivation() {
        assert_eq!(
            derive_cert_key_path(std::path::Path::new("/home/u/.ssh/id_ed25519-cert.pub")),
            PathBuf::from("/home/u/.ssh/id_ed25519")
        );
        assert_eq!(
            derive_cert_key_path(std::path::Path::new("/home/u/.ssh/id_rsa.pub")),
            PathBuf::from("/home/u/.ssh/id_rsa")
        );
    }
}
