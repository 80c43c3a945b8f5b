//! Response artifacts and how a response is reduced to a single outcome.

use crate::image::types::GeneratedImage;
use serde::{Deserialize, Serialize};

/// Message reported when the service's safety filter rejects a request.
pub const FILTERED_MESSAGE: &str =
    "Your request activated the API's safety filters and could not be processed.";

/// What an artifact carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Encoded image bytes.
    Image,
    /// Anything else (text, classifications, empty payloads).
    Other,
}

/// Why generation of an artifact stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinishReason {
    /// Generation completed normally.
    #[default]
    Success,
    /// The safety filter rejected the output.
    Filter,
    /// The service failed to produce this artifact.
    Error,
}

/// A single unit of output returned by the generation service.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    /// Payload type.
    pub kind: ArtifactKind,
    /// Finish reason reported for this artifact.
    pub finish_reason: FinishReason,
    /// Raw (already transport-decoded) payload.
    pub binary: Vec<u8>,
    /// Seed the service used, if reported.
    pub seed: Option<u64>,
}

impl Artifact {
    /// Creates an image artifact that finished normally.
    pub fn image(binary: Vec<u8>) -> Self {
        Self {
            kind: ArtifactKind::Image,
            finish_reason: FinishReason::Success,
            binary,
            seed: None,
        }
    }

    /// Creates an artifact flagged by the safety filter.
    pub fn filtered() -> Self {
        Self {
            kind: ArtifactKind::Image,
            finish_reason: FinishReason::Filter,
            binary: Vec::new(),
            seed: None,
        }
    }

    /// Sets the reported seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Returns true if the safety filter rejected this artifact.
    pub fn is_filtered(&self) -> bool {
        self.finish_reason == FinishReason::Filter
    }
}

/// Result of scanning a response's artifacts.
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactScan {
    /// An artifact was filtered; scanning stopped there.
    Filtered(String),
    /// The first usable image artifact.
    Image(Artifact),
    /// Neither a filtered nor an image artifact was present.
    Empty,
}

/// Reduces a response to the artifact the caller should act on.
///
/// Walks artifacts in order. A filtered artifact ends the scan immediately,
/// even if a later artifact carries an image.
pub fn scan_artifacts(artifacts: impl IntoIterator<Item = Artifact>) -> ArtifactScan {
    for artifact in artifacts {
        if artifact.is_filtered() {
            return ArtifactScan::Filtered(FILTERED_MESSAGE.to_string());
        }
        if artifact.kind == ArtifactKind::Image {
            return ArtifactScan::Image(artifact);
        }
    }
    ArtifactScan::Empty
}

/// Outcome of one generation action, handed to the presentation layer.
#[derive(Debug, Clone)]
pub enum GenerationOutcome {
    /// A decoded image.
    Image(GeneratedImage),
    /// The safety filter rejected the request; a warning, not an error.
    Filtered(String),
    /// Any other failure.
    Error(String),
}

impl GenerationOutcome {
    /// Returns the image, if any.
    pub fn image(&self) -> Option<&GeneratedImage> {
        match self {
            Self::Image(image) => Some(image),
            _ => None,
        }
    }

    /// Consumes the outcome, returning the image if any.
    pub fn into_image(self) -> Option<GeneratedImage> {
        match self {
            Self::Image(image) => Some(image),
            _ => None,
        }
    }

    /// Returns true for [`GenerationOutcome::Filtered`].
    pub fn is_filtered(&self) -> bool {
        matches!(self, Self::Filtered(_))
    }

    /// Returns true for [`GenerationOutcome::Error`].
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}
