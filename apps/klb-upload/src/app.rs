//! Drives one upload from the command line.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use klb_upload_client::{
    ClientConfig, CompletionResult, FileSource, UploadClient, UploadError, UploadEvent,
    UploadRequest, UploadSession, UploadSource, content_type_or_default,
};

pub const USAGE: &str = "usage: klb-upload <negotiation-endpoint> <file> [key=value ...]";

/// Parsed command line.
#[derive(Debug, PartialEq)]
pub struct Args {
    pub endpoint: String,
    pub file: PathBuf,
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl Args {
    /// Parses the arguments following the program name.
    ///
    /// Parameter values are read as JSON when they parse (`public=true`,
    /// `count=3`), as strings otherwise.
    pub fn parse(args: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        let mut args = args.into_iter();
        let (Some(endpoint), Some(file)) = (args.next(), args.next()) else {
            bail!("{USAGE}");
        };

        let mut params = serde_json::Map::new();
        for arg in args {
            let Some((key, value)) = arg.split_once('=') else {
                bail!("invalid parameter {arg:?}, expected key=value\n{USAGE}");
            };
            if key.is_empty() {
                bail!("empty parameter name in {arg:?}");
            }
            let value = serde_json::from_str(value)
                .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
            params.insert(key.to_string(), value);
        }

        Ok(Self {
            endpoint,
            file: PathBuf::from(file),
            params,
        })
    }
}

/// Uploads `args.file` and returns the stored blob's metadata.
///
/// Ctrl-C cancels the upload.
pub async fn run(config: ClientConfig, args: Args) -> anyhow::Result<CompletionResult> {
    let source = FileSource::open(&args.file)
        .await
        .with_context(|| format!("cannot open {}", args.file.display()))?;
    let modified: DateTime<Utc> = tokio::fs::metadata(&args.file)
        .await?
        .modified()
        .map(DateTime::from)
        .unwrap_or_else(|_| Utc::now());
    let filename = args
        .file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("file path has no file name")?;

    let mut request = UploadRequest::new(filename, source.len(), content_type_or_default(&args.file))
        .with_last_modified(modified);
    request.params = args.params;
    tracing::info!(
        file = %request.filename,
        size = request.size,
        mime = %request.mime_type,
        "uploading"
    );

    let client = UploadClient::new(&config)?;
    let session = client.session(request, Arc::new(source));
    let reporter = session.take_events().map(|events| tokio::spawn(report(events)));

    // The signal branch never finishes, so a cancelled upload still drains.
    let result = tokio::select! {
        result = session.start(&args.endpoint) => result,
        () = cancel_on_ctrl_c(&session) => Err(UploadError::Cancelled),
    };
    if let Some(reporter) = reporter {
        reporter.abort();
    }

    match result {
        Ok(result) => Ok(result),
        Err(UploadError::Completion { message, target }) => {
            if let Some(target) = target {
                tracing::warn!(
                    endpoint = %target.endpoint,
                    "file transferred but not finalized; the completion call can be retried"
                );
            }
            bail!("completion failed: {message}")
        }
        Err(e) => Err(e.into()),
    }
}

async fn cancel_on_ctrl_c(session: &UploadSession) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("SIGINT received, cancelling upload");
        session.cancel();
    }
    std::future::pending::<()>().await
}

async fn report(mut events: tokio::sync::mpsc::Receiver<UploadEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            UploadEvent::Progress { progress, .. } => {
                tracing::info!(
                    done = progress.completed_chunks,
                    chunks = progress.total_chunks,
                    percent = format_args!("{:.1}", progress.fraction * 100.0),
                    speed = format_args!("{:.0} B/s", progress.bytes_per_second),
                    eta = ?progress.eta,
                    "progress"
                );
            }
            UploadEvent::StatusChanged { status, .. } => {
                tracing::debug!(%status, "status changed");
            }
            UploadEvent::Completed { .. } | UploadEvent::Failed { .. } => {}
        }
    }
}
