//! The remote service boundary.
//!
//! A [`Connector`] turns a credential into a [`GenerationBackend`] handle; the
//! handle submits requests and returns the raw artifact sequence. Wire
//! formats live entirely behind these traits.

use crate::credential::Credential;
use crate::error::Result;
use crate::image::artifact::Artifact;
use crate::image::types::GenerationRequest;
use async_trait::async_trait;

/// A connected client for the generation service.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Submits one request and returns the artifacts in response order.
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<Artifact>>;

    /// Checks that the service is reachable and accepts the credential.
    async fn health_check(&self) -> Result<()>;

    /// Returns the name of this backend for display.
    fn name(&self) -> &str;
}

/// Constructs backend handles from a credential.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Builds a client for the given credential.
    ///
    /// Whether this contacts the service is up to the implementation;
    /// callers that need a verified credential should follow up with
    /// [`GenerationBackend::health_check`].
    async fn connect(&self, credential: &Credential) -> Result<Box<dyn GenerationBackend>>;
}
