use anyhow::{Context, Result};
use console::{Term, style};
use distroget::config::Config;
use distroget::download::DownloadOptions;
use distroget::links::LinkNode;
use distroget::pipeline::{CombinedPipeline, Destination};
use distroget::transfer::{RemoteCommandRunner, SystemCommandRunner};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use super::{PromptCredentials, finish_display, print_summary, spawn_progress_display};

pub struct FetchArgs {
    pub urls: Vec<String>,
    pub dest: Option<String>,
    pub workers: Option<usize>,
    pub no_verify: bool,
    pub no_decompress: bool,
    pub links: Option<PathBuf>,
    pub json: bool,
    pub delete_failed: bool,
}

pub async fn handle_fetch(config: &Config, args: FetchArgs) -> Result<()> {
    let term = Term::stdout();

    let mut options = DownloadOptions::from_config(config);
    if args.no_verify {
        options.verify_checksums = false;
    }
    if args.no_decompress {
        options.decompress = false;
    }
    let worker_count = args.workers.unwrap_or(options.max_workers);

    let mut urls = args.urls;
    if let Some(links) = &args.links {
        let tree = LinkNode::load(links)?;
        let linked = tree.flatten();
        debug!("Loaded {} URLs from {:?}", linked.len(), links);
        urls.extend(linked);
    }

    let destination = match &args.dest {
        Some(dest) => Destination::parse(dest),
        None => Destination::Local(config.general.download_dir.clone()),
    };
    info!("Fetching {} URL(s) to {:?}", urls.len(), destination);

    let runner: Arc<dyn RemoteCommandRunner> = Arc::new(SystemCommandRunner::new());
    let (pipeline, events) = CombinedPipeline::open(options, destination.clone(), runner)?;

    if let Destination::Remote { host, path } = &destination {
        if !args.json {
            term.write_line(&format!(
                "{} Connecting to {}...",
                style("🔐").cyan(),
                style(host).bold()
            ))?;
        }
        pipeline
            .connect(&PromptCredentials)
            .await
            .with_context(|| format!("Cannot deploy to {}:{}", host, path))?;
    }

    let display = spawn_progress_display(events, args.json);
    pipeline.start(worker_count);
    for url in &urls {
        if !pipeline.enqueue(url) {
            debug!("Skipping duplicate URL: {}", url);
        }
    }

    let deployed = pipeline.wait_and_deploy(&|_, _| {}).await;

    let deleted = if args.delete_failed {
        pipeline.downloads().delete_failed_verifications()
    } else {
        Vec::new()
    };
    let snapshot = pipeline.snapshot();
    drop(pipeline);
    finish_display(display).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_summary(&term, &snapshot)?;
        for path in &deleted {
            term.write_line(&format!(
                "   {} deleted {}",
                style("🗑").red(),
                path.display()
            ))?;
        }
    }

    if let Err(e) = deployed {
        eprintln!("{} {}", style("Error:").red().bold(), e);
        std::process::exit(1);
    }
    if snapshot.downloads.has_failures() {
        std::process::exit(1);
    }

    Ok(())
}
