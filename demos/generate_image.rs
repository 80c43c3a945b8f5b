//! Validate a key, then generate one image.
//!
//! Run with: `cargo run --example generate_image`
//!
//! Requires `STABILITY_API_KEY` environment variable.

use stablegen::{GenerationOutcome, Session, StabilityConnector};
use std::sync::Arc;

#[tokio::main]
async fn main() -> stablegen::Result<()> {
    let api_key = std::env::var("STABILITY_API_KEY").unwrap_or_default();

    let mut session = Session::new(Arc::new(StabilityConnector::from_env()));
    if !session.unlock(&api_key).await.is_valid() {
        eprintln!("Invalid API key. Please try again.");
        return Ok(());
    }

    let outcome = session
        .generate("A whimsical fairy tale castle in a magical forest")
        .await?;

    match outcome {
        GenerationOutcome::Image(image) => {
            image.save("castle.png")?;
            println!(
                "Generated image: {} bytes, format: {:?}",
                image.size(),
                image.format
            );
        }
        GenerationOutcome::Filtered(reason) => eprintln!("warning: {reason}"),
        GenerationOutcome::Error(message) => eprintln!("Error generating image: {message}"),
    }

    Ok(())
}
