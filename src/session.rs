//! Per-user session context.
//!
//! A [`Session`] starts unvalidated. Once a secret passes the gate it keeps
//! the credential and the client handle built from it, and every later
//! generation reuses that handle. Dropping the session (or calling
//! [`Session::sign_out`]) discards both.

use crate::client;
use crate::credential::{Admitted, Credential, CredentialGate, ValidationOutcome};
use crate::error::{Result, StableGenError};
use crate::image::{Connector, GenerationBackend, GenerationOutcome, GenerationRequest};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No secret has passed validation yet.
    Unvalidated,
    /// A credential is held; generation is allowed.
    Validated,
}

struct Active {
    credential: Credential,
    backend: Box<dyn GenerationBackend>,
}

/// Session context passed to every operation.
///
/// Generation takes `&mut self`, so at most one request per session is in
/// flight at a time.
pub struct Session {
    gate: CredentialGate,
    active: Option<Active>,
}

impl Session {
    /// Creates an unvalidated session using a non-retrying gate.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_gate(CredentialGate::new(connector))
    }

    /// Creates an unvalidated session using the given gate.
    pub fn with_gate(gate: CredentialGate) -> Self {
        Self { gate, active: None }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        if self.active.is_some() {
            SessionState::Validated
        } else {
            SessionState::Unvalidated
        }
    }

    /// The validated credential, if any.
    pub fn credential(&self) -> Option<&Credential> {
        self.active.as_ref().map(|active| &active.credential)
    }

    /// Validates `secret` and, on success, moves the session to `Validated`.
    ///
    /// A validated session keeps its credential: calling this again returns
    /// the held credential without contacting the service.
    pub async fn unlock(&mut self, secret: &str) -> ValidationOutcome {
        if let Some(active) = &self.active {
            return ValidationOutcome::Valid(active.credential.clone());
        }

        match self.gate.admit(secret).await {
            Ok(Admitted {
                credential,
                backend,
            }) => {
                self.active = Some(Active {
                    credential: credential.clone(),
                    backend,
                });
                ValidationOutcome::Valid(credential)
            }
            Err(e) => {
                tracing::info!("API key not accepted: {e}");
                ValidationOutcome::from_error(&e)
            }
        }
    }

    /// Generates one image for `prompt` with the session's client.
    ///
    /// Returns an error only when the call itself is not allowed: the
    /// session is unvalidated or the prompt is blank. Service failures are
    /// reported through [`GenerationOutcome`].
    pub async fn generate(&mut self, prompt: &str) -> Result<GenerationOutcome> {
        let (active, request) = self.prepare(prompt)?;
        Ok(client::run(active.backend.as_ref(), request).await)
    }

    /// Like [`generate`](Self::generate), but gives up when `token` is cancelled.
    pub async fn generate_with_cancel(
        &mut self,
        prompt: &str,
        token: &CancellationToken,
    ) -> Result<GenerationOutcome> {
        let (active, request) = self.prepare(prompt)?;
        let outcome = tokio::select! {
            outcome = client::run(active.backend.as_ref(), request) => outcome,
            _ = token.cancelled() => client::cancelled(),
        };
        Ok(outcome)
    }

    /// Discards the credential and client, returning to `Unvalidated`.
    pub fn sign_out(&mut self) {
        if self.active.take().is_some() {
            tracing::info!("session signed out");
        }
    }

    fn prepare(&self, prompt: &str) -> Result<(&Active, GenerationRequest)> {
        if prompt.trim().is_empty() {
            return Err(StableGenError::InvalidRequest(
                "Please enter a prompt before generating.".into(),
            ));
        }
        let active = self
            .active
            .as_ref()
            .ok_or_else(|| StableGenError::Auth("session has no validated API key".into()))?;
        Ok((active, GenerationRequest::new(prompt)))
    }
}
