//! Command handlers.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use cloudgate_backend::{BackendProtocol, LocalDirBackend, RemotePath};
use cloudgate_transfer::{FileSource, ProgressSink, ReaderSource, SourceStream};
use cloudgate_upload::{UploadOutcome, UploadRequest, Uploader};
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Arguments of `cloudgate upload`.
pub struct UploadArgs<'a> {
    /// Local file, or `-` for stdin.
    pub file: &'a str,
    pub dest: &'a str,
    pub size: Option<u64>,
    pub concurrency: Option<usize>,
    pub chunk_size: Option<u64>,
    pub json: bool,
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<LocalDirBackend>> {
    let root = &config.store.root;
    let backend = LocalDirBackend::with_options(root, config.store.options(config.profile.clone()))
        .await
        .with_context(|| format!("opening store at {}", root.display()))?
        .with_signer(config.store.signer());
    tracing::debug!(root = %root.display(), profile = %config.profile.name, "store opened");
    Ok(Arc::new(backend))
}

async fn open_source(file: &str) -> anyhow::Result<Arc<dyn SourceStream>> {
    if file == "-" {
        return Ok(Arc::new(ReaderSource::new(tokio::io::stdin(), None)));
    }
    let source = FileSource::open(Path::new(file))
        .await
        .with_context(|| format!("opening {file}"))?;
    Ok(Arc::new(source))
}

/// Logs progress each time it crosses another ten percent.
fn progress_logger() -> Arc<dyn ProgressSink> {
    let last = AtomicU64::new(0);
    Arc::new(move |percent: f64| {
        let decile = (percent / 10.0).floor() as u64;
        if last.fetch_max(decile, Ordering::Relaxed) < decile {
            tracing::info!(percent = decile * 10, "progress");
        }
    })
}

pub async fn upload(
    config: Config,
    args: UploadArgs<'_>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let dest = RemotePath::parse(args.dest).context("invalid destination")?;
    let store = open_store(&config).await?;
    let source = open_source(args.file).await?;

    let mut request = UploadRequest::new(source, dest);
    if let Some(size) = args.size {
        request = request.with_declared_size(size);
    }
    if let Some(concurrency) = args.concurrency {
        request = request.with_concurrency(concurrency);
    }
    if let Some(chunk_size) = args.chunk_size {
        request = request.with_chunk_size(chunk_size);
    }

    let uploader = Uploader::new(store as Arc<dyn BackendProtocol>, config.policy);
    let outcome = uploader
        .session(request)
        .run(progress_logger(), cancel)
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome.object)?);
    } else {
        print_outcome(&outcome);
    }
    Ok(())
}

fn print_outcome(outcome: &UploadOutcome) {
    let object = &outcome.object;
    println!("stored   {} ({} bytes)", object.path, object.size);
    println!("id       {}", object.id);
    println!("digest   {}", object.fingerprint);
    if outcome.fast_path.is_matched() {
        println!("via      fast path, no bytes sent");
    } else {
        println!(
            "via      {} chunk(s), {} bytes sent, {} resumed",
            outcome.chunks.len(),
            outcome.uploaded_bytes,
            outcome.resumed_bytes
        );
    }
    println!("elapsed  {:.2?}", outcome.elapsed);
}

/// `cloudgate stat`: shows the object linked at `dest`.
pub async fn stat(config: Config, dest: &str, json: bool) -> anyhow::Result<()> {
    let dest = RemotePath::parse(dest).context("invalid destination")?;
    let store = open_store(&config).await?;
    let Some(object) = store.lookup(&dest).await? else {
        anyhow::bail!("no object at {dest}");
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&object)?);
    } else {
        println!("{}  {}  {} bytes  {}", object.path, object.id, object.size, object.fingerprint);
    }
    Ok(())
}
