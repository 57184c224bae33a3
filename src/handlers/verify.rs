use anyhow::Result;
use console::{Term, style};
use distroget::config::Config;
use distroget::download::{DownloadEngine, HashVerifier};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub async fn handle_verify(
    config: &Config,
    file: &Path,
    url: Option<&str>,
    digest: Option<&str>,
) -> Result<()> {
    let term = Term::stdout();

    let engine = DownloadEngine::new(
        config.retry.chunk_size,
        Duration::from_secs(config.retry.request_timeout_secs),
    )?;
    let verifier = HashVerifier::new(Arc::new(engine));

    term.write_line(&format!(
        "{} Verifying {}...",
        style("🔍").cyan(),
        style(file.display()).bold()
    ))?;
    let result = verifier.verify_file(file, digest, url).await;

    let marker = if result.is_verified() {
        style("✓").green()
    } else if result.is_failed() {
        style("✗").red()
    } else {
        style("?").yellow()
    };
    term.write_line(&format!("{} {}", marker, result.message()))?;
    if let Some(computed) = result.computed_digest() {
        term.write_line(&format!("   computed: {}", style(computed).dim()))?;
    }

    if result.is_failed() {
        std::process::exit(1);
    }
    Ok(())
}
