//! Core types for image generation.

use crate::error::{Result, StableGenError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Supported image formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// PNG format (lossless).
    #[default]
    Png,
    /// JPEG format (lossy).
    Jpeg,
    /// WebP format.
    WebP,
}

impl ImageFormat {
    /// Returns the file extension for this format.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::WebP => "webp",
        }
    }

    /// Returns the MIME type for this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::WebP => "image/webp",
        }
    }

    /// Detects image format from magic bytes.
    pub fn from_magic_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 12 {
            return None;
        }

        // PNG: 89 50 4E 47 0D 0A 1A 0A
        if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
            return Some(Self::Png);
        }

        // JPEG: FF D8 FF
        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(Self::Jpeg);
        }

        // WebP: RIFF....WEBP
        if data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
            return Some(Self::WebP);
        }

        None
    }
}

/// Diffusion engines served by the generation API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Engine {
    /// Stable Diffusion XL 1.0, native 1024x1024.
    #[default]
    #[serde(rename = "stable-diffusion-xl-1024-v1-0")]
    StableDiffusionXl1024,
}

impl Engine {
    /// Returns the API engine identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StableDiffusionXl1024 => "stable-diffusion-xl-1024-v1-0",
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Denoising sampler variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Sampler {
    /// DPM++ 2M (Karras-style scheduler).
    #[default]
    #[serde(rename = "K_DPMPP_2M")]
    KDpmpp2M,
    /// Euler ancestral.
    #[serde(rename = "K_EULER_ANCESTRAL")]
    KEulerAncestral,
    /// DDIM.
    Ddim,
}

impl Sampler {
    /// Returns the API sampler identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KDpmpp2M => "K_DPMPP_2M",
            Self::KEulerAncestral => "K_EULER_ANCESTRAL",
            Self::Ddim => "DDIM",
        }
    }
}

/// The parameter set every request is submitted with.
///
/// Only the prompt varies between requests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GenerationParams {
    /// Engine the request is routed to.
    pub engine: Engine,
    /// Seed for deterministic output.
    pub seed: u32,
    /// Number of inference steps.
    pub steps: u32,
    /// Guidance scale.
    pub cfg_scale: f32,
    /// Output width in pixels.
    pub width: u32,
    /// Output height in pixels.
    pub height: u32,
    /// Number of images to generate.
    pub samples: u32,
    /// Denoising sampler.
    pub sampler: Sampler,
}

impl GenerationParams {
    /// The fixed workflow parameters.
    pub const FIXED: Self = Self {
        engine: Engine::StableDiffusionXl1024,
        seed: 992_446_758,
        steps: 50,
        cfg_scale: 8.0,
        width: 1024,
        height: 1024,
        samples: 1,
        sampler: Sampler::KDpmpp2M,
    };
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self::FIXED
    }
}

/// A request to generate an image.
///
/// Immutable once built; the parameters are always [`GenerationParams::FIXED`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    prompt: String,
    params: GenerationParams,
}

impl GenerationRequest {
    /// Creates a request for the given prompt.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            params: GenerationParams::FIXED,
        }
    }

    /// The text prompt describing the desired image.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// The generation parameters.
    pub fn params(&self) -> &GenerationParams {
        &self.params
    }
}

/// Metadata about the generation process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationMetadata {
    /// Engine used for generation.
    pub engine: Option<String>,
    /// Seed reported by the service.
    pub seed: Option<u64>,
    /// Generation duration in milliseconds.
    pub duration_ms: Option<u64>,
}

/// A generated image with its data and metadata.
#[derive(Debug, Clone)]
#[must_use = "generated image should be saved or processed"]
pub struct GeneratedImage {
    /// Raw image bytes.
    pub data: Vec<u8>,
    /// Image format.
    pub format: ImageFormat,
    /// Generation metadata.
    pub metadata: GenerationMetadata,
}

impl GeneratedImage {
    /// Creates a new generated image.
    pub fn new(data: Vec<u8>, format: ImageFormat, metadata: GenerationMetadata) -> Self {
        Self {
            data,
            format,
            metadata,
        }
    }

    /// Creates a new generated image, detecting format from magic bytes.
    pub fn from_bytes(data: Vec<u8>, metadata: GenerationMetadata) -> Result<Self> {
        let format = ImageFormat::from_magic_bytes(&data)
            .ok_or_else(|| StableGenError::Decode("unknown image format".into()))?;
        Ok(Self::new(data, format, metadata))
    }

    /// Returns the size of the image data in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Saves the image to the specified path.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, &self.data)?;
        Ok(())
    }

    /// Encodes the image data as base64.
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }

    /// Returns the image as a data URL.
    pub fn to_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.format.mime_type(),
            self.to_base64()
        )
    }
}
