//! The generation client: one prompt in, one outcome out.

use crate::credential::Credential;
use crate::error::StableGenError;
use crate::image::{
    scan_artifacts, ArtifactScan, Connector, GeneratedImage, GenerationBackend,
    GenerationMetadata, GenerationOutcome, GenerationRequest,
};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Message reported when a response carries no usable image.
pub const NO_IMAGE_MESSAGE: &str = "response contained no image artifact";

/// Submits prompts with the fixed parameter set and reduces responses to an outcome.
///
/// Never returns an error: every failure becomes [`GenerationOutcome::Error`].
#[derive(Clone)]
pub struct GenerationClient {
    connector: Arc<dyn Connector>,
}

impl GenerationClient {
    /// Creates a client that connects through `connector`.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    /// Connects with `credential` and generates one image for `prompt`.
    ///
    /// The prompt should be non-empty; callers are expected to check that first.
    pub async fn generate(&self, prompt: &str, credential: &Credential) -> GenerationOutcome {
        let backend = match self.connector.connect(credential).await {
            Ok(backend) => backend,
            Err(e) => return GenerationOutcome::Error(e.to_string()),
        };
        run(backend.as_ref(), GenerationRequest::new(prompt)).await
    }

    /// Like [`generate`](Self::generate), but gives up when `token` is cancelled.
    pub async fn generate_with_cancel(
        &self,
        prompt: &str,
        credential: &Credential,
        token: &CancellationToken,
    ) -> GenerationOutcome {
        tokio::select! {
            outcome = self.generate(prompt, credential) => outcome,
            _ = token.cancelled() => cancelled(),
        }
    }
}

pub(crate) fn cancelled() -> GenerationOutcome {
    tracing::debug!("generation cancelled by caller");
    GenerationOutcome::Error(StableGenError::Cancelled.to_string())
}

/// Submits `request` on an existing backend handle.
pub(crate) async fn run(
    backend: &dyn GenerationBackend,
    request: GenerationRequest,
) -> GenerationOutcome {
    let start = Instant::now();
    let params = *request.params();

    let artifacts = match backend.generate(&request).await {
        Ok(artifacts) => artifacts,
        Err(e) => {
            tracing::warn!(backend = backend.name(), "generation failed: {e}");
            return GenerationOutcome::Error(e.to_string());
        }
    };

    match scan_artifacts(artifacts) {
        ArtifactScan::Filtered(reason) => {
            tracing::warn!("request blocked by safety filter");
            GenerationOutcome::Filtered(reason)
        }
        ArtifactScan::Image(artifact) => {
            let metadata = GenerationMetadata {
                engine: Some(params.engine.as_str().to_string()),
                seed: artifact.seed.or(Some(u64::from(params.seed))),
                duration_ms: Some(start.elapsed().as_millis() as u64),
            };
            match GeneratedImage::from_bytes(artifact.binary, metadata) {
                Ok(image) => {
                    tracing::debug!(
                        size = image.size(),
                        format = image.format.extension(),
                        "image generated"
                    );
                    GenerationOutcome::Image(image)
                }
                Err(e) => GenerationOutcome::Error(e.to_string()),
            }
        }
        ArtifactScan::Empty => GenerationOutcome::Error(NO_IMAGE_MESSAGE.to_string()),
    }
}
