//! Generation service backends.

#[cfg(feature = "stability")]
mod stability;

#[cfg(feature = "stability")]
pub use stability::{StabilityBackend, StabilityBuilder, StabilityConnector, DEFAULT_HOST};
