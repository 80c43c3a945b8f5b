//! Image generation module.

mod artifact;
mod backend;
pub mod providers;
mod types;

pub use artifact::{
    scan_artifacts, Artifact, ArtifactKind, ArtifactScan, FinishReason, GenerationOutcome,
    FILTERED_MESSAGE,
};
pub use backend::{Connector, GenerationBackend};
pub use types::{
    Engine, GeneratedImage, GenerationMetadata, GenerationParams, GenerationRequest, ImageFormat,
    Sampler,
};
