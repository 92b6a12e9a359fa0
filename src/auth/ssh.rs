//! Host SSH daemon as a credential oracle.
//!
//! A login is accepted iff the local sshd accepts the same username/password.
//! The probe connection is closed as soon as the password attempt resolves.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::Disconnect;
use thiserror::Error;
use tracing::debug;

/// Why a credential check did not succeed.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("credentials rejected")]
    Rejected,
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("ssh handshake failed: {0}")]
    Handshake(String),
}

/// Anything that can say yes or no to a username/password pair.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, username: &str, password: &str) -> Result<(), VerifyError>;
}

/// Verifies credentials with a password-auth attempt against `host:port`.
pub struct SshVerifier {
    host: String,
    port: u16,
    timeout: Duration,
}

impl SshVerifier {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    async fn handshake(&self, username: &str, password: &str) -> Result<(), VerifyError> {
        let config = Arc::new(client::Config::default());
        let mut handle = client::connect(config, (self.host.as_str(), self.port), ProbeHandler)
            .await
            .map_err(|e| VerifyError::Handshake(e.to_string()))?;

        let outcome = handle
            .authenticate_password(username, password)
            .await
            .map_err(|e| VerifyError::Handshake(e.to_string()));

        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("ssh probe disconnect: {e}");
        }

        if outcome?.success() {
            Ok(())
        } else {
            Err(VerifyError::Rejected)
        }
    }
}

#[async_trait]
impl CredentialVerifier for SshVerifier {
    async fn verify(&self, username: &str, password: &str) -> Result<(), VerifyError> {
        tokio::time::timeout(self.timeout, self.handshake(username, password))
            .await
            .map_err(|_| VerifyError::Timeout(self.timeout))?
    }
}

/// Client handler for the probe connection. The oracle is the loopback
/// daemon the gateway is deployed next to, so its host key is not pinned.
struct ProbeHandler;

impl client::Handler for ProbeHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_refused_connection_is_a_handshake_error() {
        // Bind then drop to get a port with nothing listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let verifier = SshVerifier::new("127.0.0.1", port, Duration::from_secs(2));
        let err = verifier.verify("alice", "secret").await.unwrap_err();
        assert!(matches!(err, VerifyError::Handshake(_)));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        // Accepts TCP but never speaks SSH.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _hold = tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let verifier = SshVerifier::new("127.0.0.1", port, Duration::from_millis(200));
        let err = verifier.verify("alice", "secret").await.unwrap_err();
        assert!(matches!(err, VerifyError::Timeout(_)));
    }
}
