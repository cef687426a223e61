//! OCRSieve - OCR-based spam scoring for email attachments.
//!
//! Scores the image and PDF attachments of an RFC822 message by running
//! them through external conversion and OCR tools and fuzzy-matching the
//! recognized text against a weighted wordlist.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ocrsieve::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();

    // Initialize logging based on verbosity
    let default_filter = if cli::is_verbose() {
        "ocrsieve=info"
    } else {
        "ocrsieve=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Run CLI
    cli::run().await
}
