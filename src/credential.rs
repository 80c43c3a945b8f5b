//! Credential handling and the validation gate.

use crate::error::{Result, StableGenError};
use crate::image::{Connector, GenerationBackend};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// An opaque API secret.
///
/// Held in memory only. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wraps a secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Returns the raw secret for use in an auth header.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns true if the secret is empty or whitespace.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Result of checking a secret against the service.
#[derive(Debug, Clone)]
pub enum ValidationOutcome {
    /// The service accepted the secret.
    Valid(Credential),
    /// The secret is malformed or was refused. Re-prompting is the only fix.
    Rejected(String),
    /// The service could not be reached; the same secret may work later.
    Unreachable(String),
}

impl ValidationOutcome {
    /// Returns true for [`ValidationOutcome::Valid`].
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    /// Returns the validated credential, if any.
    pub fn into_credential(self) -> Option<Credential> {
        match self {
            Self::Valid(credential) => Some(credential),
            _ => None,
        }
    }

    pub(crate) fn from_error(err: &StableGenError) -> Self {
        if err.is_retryable() {
            Self::Unreachable(err.to_string())
        } else {
            Self::Rejected(err.to_string())
        }
    }
}

/// A credential that passed validation, with the client built from it.
pub struct Admitted {
    /// The validated credential.
    pub credential: Credential,
    /// Client handle constructed during validation.
    pub backend: Box<dyn GenerationBackend>,
}

impl fmt::Debug for Admitted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Admitted")
            .field("credential", &self.credential)
            .field("backend", &self.backend.name())
            .finish()
    }
}

/// Validates secrets by constructing a client and checking it against the service.
#[derive(Clone)]
pub struct CredentialGate {
    connector: Arc<dyn Connector>,
    retries: u32,
}

impl CredentialGate {
    /// Creates a gate that does not retry.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            retries: 0,
        }
    }

    /// Retries transient failures (network, 5xx, rate limits) up to `retries` times.
    ///
    /// Rejected secrets are never retried.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Returns true only if a client could be constructed and verified with `secret`.
    pub async fn validate(&self, secret: &str) -> bool {
        self.check(secret).await.is_valid()
    }

    /// Checks `secret`, distinguishing refused secrets from an unreachable service.
    pub async fn check(&self, secret: &str) -> ValidationOutcome {
        match self.admit(secret).await {
            Ok(admitted) => ValidationOutcome::Valid(admitted.credential),
            Err(e) => ValidationOutcome::from_error(&e),
        }
    }

    /// Validates `secret` and hands back the client built along the way.
    pub async fn admit(&self, secret: &str) -> Result<Admitted> {
        let credential = Credential::new(secret.trim());
        if credential.is_blank() {
            return Err(StableGenError::Auth("API key is empty".into()));
        }

        let mut attempt = 0;
        loop {
            match self.try_connect(&credential).await {
                Ok(backend) => {
                    tracing::info!(backend = backend.name(), "credential validated");
                    return Ok(Admitted {
                        credential,
                        backend,
                    });
                }
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    attempt += 1;
                    let delay = e.retry_after().unwrap_or(Duration::from_secs(1));
                    tracing::warn!(
                        attempt,
                        max_retries = self.retries,
                        delay_ms = delay.as_millis(),
                        "retrying credential check after transient error: {e}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::debug!("credential check failed: {e}");
                    return Err(e);
                }
            }
        }
    }

    async fn try_connect(&self, credential: &Credential) -> Result<Box<dyn GenerationBackend>> {
        let backend = self.connector.connect(credential).await?;
        backend.health_check().await?;
        Ok(backend)
    }
}
