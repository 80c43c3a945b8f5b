#![warn(missing_docs)]
//! StableGen - Stable Diffusion image generation via the Stability AI API.
//!
//! A session validates an API key once, keeps it in memory, and then turns
//! each prompt into exactly one request with a fixed parameter set
//! (SDXL 1.0, seed 992446758, 50 steps, guidance 8.0, 1024x1024, one sample,
//! `K_DPMPP_2M`).
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use stablegen::{GenerationOutcome, Session, StabilityConnector};
//!
//! #[tokio::main]
//! async fn main() -> stablegen::Result<()> {
//!     let mut session = Session::new(Arc::new(StabilityConnector::from_env()));
//!     if !session.unlock("sk-...").await.is_valid() {
//!         eprintln!("Invalid API key. Please try again.");
//!         return Ok(());
//!     }
//!
//!     match session.generate("A serene landscape with a mountain lake at sunset").await? {
//!         GenerationOutcome::Image(image) => image.save("lake.png")?,
//!         GenerationOutcome::Filtered(reason) => eprintln!("warning: {reason}"),
//!         GenerationOutcome::Error(message) => eprintln!("error: {message}"),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `stability` (default): Stability AI REST backend
//! - `cli`: the `stablegen` command-line front end

mod client;
mod credential;
mod error;
pub mod image;
mod session;

#[cfg(test)]
mod testing;

pub use client::{GenerationClient, NO_IMAGE_MESSAGE};
pub use credential::{Admitted, Credential, CredentialGate, ValidationOutcome};
pub use error::{Result, StableGenError};
pub use image::{
    Artifact, ArtifactKind, Connector, Engine, FinishReason, GeneratedImage, GenerationBackend,
    GenerationMetadata, GenerationOutcome, GenerationParams, GenerationRequest, ImageFormat,
    Sampler,
};
pub use session::{Session, SessionState};

#[cfg(feature = "stability")]
pub use image::providers::{StabilityBackend, StabilityBuilder, StabilityConnector};

/// Re-exported so callers can cancel in-flight generations.
pub use tokio_util::sync::CancellationToken;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::credential::{Credential, CredentialGate, ValidationOutcome};
    pub use crate::error::{Result, StableGenError};
    pub use crate::image::{GeneratedImage, GenerationOutcome, GenerationRequest};
    pub use crate::session::Session;

    #[cfg(feature = "stability")]
    pub use crate::image::providers::StabilityConnector;
}
