//! Mizuchi Storage - command-line client for S3-compatible object storage
//!
//! Uploads (single PUT or resumable multipart) and object operations against
//! the backends of a YAML configuration file.

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use mizuchi_storage::config::{default_session_name, Config, UploadConfig};
use mizuchi_storage::s3::sts::StsClient;
use mizuchi_storage::s3::{ByteRange, ListObjectsOptions, S3Client, S3ClientPool};
use mizuchi_storage::upload::{
    CheckpointStore, UploadOptions, UploadSource, UploadTarget, Uploader,
};
use reqwest::Method;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Mizuchi Storage - S3-compatible upload engine
#[derive(Parser, Debug)]
#[command(name = "mizuchi-storage")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides it
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Backend to use (defaults to the configured default backend)
    #[arg(short, long)]
    backend: Option<String>,

    /// Print Prometheus metrics to stderr when done
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a local file
    Upload {
        file: PathBuf,
        /// Object key, relative to the backend's dir prefix
        key: String,
        #[arg(long)]
        part_size: Option<u64>,
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long)]
        content_type: Option<String>,
        /// Save multipart progress here so the upload can be resumed
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        /// Leave failed multipart uploads open instead of aborting them
        #[arg(long)]
        keep_on_failure: bool,
    },
    /// Resume a multipart upload from its checkpoint file
    Resume {
        checkpoint: PathBuf,
        /// Source file, when it moved since the checkpoint was written
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Download an object
    Get {
        key: String,
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Byte range, e.g. `0-1023` or `1024-`
        #[arg(long)]
        range: Option<String>,
    },
    /// Show object metadata
    Head { key: String },
    /// List objects
    List {
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long)]
        delimiter: Option<String>,
        /// Follow markers until the listing ends
        #[arg(long)]
        all: bool,
    },
    /// Delete one or more objects
    Delete {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Server-side copy within the bucket
    Copy { source: String, destination: String },
    /// Print a presigned URL
    Presign {
        key: String,
        #[arg(long, default_value = "GET")]
        method: String,
        /// Seconds until the URL expires
        #[arg(long)]
        expires: Option<u64>,
    },
    /// Assume a role through STS and print the temporary credentials
    AssumeRole {
        role_arn: String,
        #[arg(long, default_value_t = 3600)]
        duration: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; stdout is reserved for command output
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .json()
        .init();

    info!("Starting Mizuchi Storage v{}", mizuchi_storage::VERSION);

    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!("Loaded configuration from {:?}", args.config);

    let result = run(&args, config).await;

    if args.metrics {
        eprint!("{}", mizuchi_storage::metrics::gather());
    }
    result
}

async fn run(args: &Args, config: Config) -> anyhow::Result<()> {
    let backend = args.backend.as_deref();

    match &args.command {
        Command::Upload {
            file,
            key,
            part_size,
            concurrency,
            content_type,
            checkpoint,
            keep_on_failure,
        } => {
            let (client, upload_config) = connect(&config, backend).await?;
            let mut options = UploadOptions::from_config(&upload_config).with_cancel(cancel_on_ctrl_c());
            if let Some(part_size) = part_size {
                options = options.with_part_size(*part_size);
            }
            if let Some(concurrency) = concurrency {
                options = options.with_concurrency(*concurrency);
            }
            if let Some(path) = checkpoint {
                options = options.with_checkpoint_store(CheckpointStore::new(path));
            }
            if *keep_on_failure {
                options.abort_on_failure = false;
            }
            options = options.with_progress(|progress| {
                info!(
                    percent = progress.percent,
                    loaded = progress.loaded,
                    total = progress.total,
                    "Upload progress"
                );
            });

            let mut target = UploadTarget::new(key.clone(), UploadSource::file(file));
            if let Some(content_type) = content_type {
                target = target.with_content_type(content_type.clone());
            }

            let uploaded = Uploader::new(client).upload(target, &options).await;
            match uploaded {
                Ok(result) => print_json(&serde_json::json!({
                    "backend": result.platform.as_str(),
                    "key": result.key,
                    "etag": result.etag,
                    "version_id": result.version_id,
                    "location": result.location,
                    "bytes": result.bytes_written,
                    "parts": result.parts,
                })),
                Err(e) => {
                    if let (Some(cp), Some(path)) = (e.checkpoint(), checkpoint) {
                        warn!(
                            upload_id = %cp.upload_id,
                            done = cp.parts.len(),
                            checkpoint = %path.display(),
                            "Upload interrupted; resume with `mizuchi-storage resume`"
                        );
                    }
                    Err(e.into())
                }
            }
        }
        Command::Resume { checkpoint, file } => {
            let (client, upload_config) = connect(&config, backend).await?;
            let store = CheckpointStore::new(checkpoint);
            let saved = store
                .load()
                .await?
                .ok_or_else(|| anyhow!("no checkpoint at {}", checkpoint.display()))?;
            let path = file
                .clone()
                .or_else(|| saved.source_path.clone())
                .ok_or_else(|| anyhow!("checkpoint has no source file; pass --file"))?;

            let options = UploadOptions::from_config(&upload_config)
                .with_cancel(cancel_on_ctrl_c())
                .with_checkpoint_store(store);
            let result = Uploader::new(client)
                .resume(saved, &UploadSource::file(path), &options)
                .await?;
            print_json(&serde_json::json!({
                "key": result.key,
                "etag": result.etag,
                "bytes": result.bytes_written,
                "parts": result.parts,
            }))
        }
        Command::Get { key, output, range } => {
            let (client, _) = connect(&config, backend).await?;
            let range = range.as_deref().map(parse_range).transpose()?;
            let object = client.get_object(&client.credential().object_key(key), range).await?;
            match output {
                Some(path) => tokio::fs::write(path, &object.body).await?,
                None => {
                    let mut stdout = tokio::io::stdout();
                    stdout.write_all(&object.body).await?;
                    stdout.flush().await?;
                }
            }
            Ok(())
        }
        Command::Head { key } => {
            let (client, _) = connect(&config, backend).await?;
            let head = client.head_object(&client.credential().object_key(key)).await?;
            print_json(&serde_json::json!({
                "content_length": head.content_length,
                "content_type": head.content_type,
                "etag": head.etag,
                "last_modified": head.last_modified,
                "version_id": head.version_id,
                "metadata": head.metadata,
            }))
        }
        Command::List {
            prefix,
            delimiter,
            all,
        } => {
            let (client, _) = connect(&config, backend).await?;
            let prefix = prefix.as_deref().map(|p| client.credential().object_key(p));
            let objects = if *all {
                client.list_all_objects(prefix.as_deref()).await?
            } else {
                let page = client
                    .list_objects(&ListObjectsOptions {
                        prefix,
                        delimiter: delimiter.clone(),
                        ..Default::default()
                    })
                    .await?;
                for common in &page.common_prefixes {
                    println!("{:>12}  {}", "PRE", common);
                }
                page.contents
            };
            for object in objects {
                println!("{:>12}  {}", object.size, object.key);
            }
            Ok(())
        }
        Command::Delete { keys } => {
            let (client, _) = connect(&config, backend).await?;
            let keys: Vec<String> = keys
                .iter()
                .map(|k| client.credential().object_key(k))
                .collect();
            let result = client.delete_objects(&keys).await?;
            for error in &result.errors {
                warn!(key = %error.key, code = %error.code, "{}", error.message);
            }
            if !result.errors.is_empty() {
                bail!("{} of {} keys not deleted", result.errors.len(), keys.len());
            }
            Ok(())
        }
        Command::Copy {
            source,
            destination,
        } => {
            let (client, _) = connect(&config, backend).await?;
            let credential = client.credential();
            let copied = client
                .copy_object(
                    &credential.object_key(source),
                    &credential.object_key(destination),
                    None,
                    &Default::default(),
                )
                .await?;
            print_json(&serde_json::json!({
                "etag": copied.etag,
                "last_modified": copied.last_modified,
            }))
        }
        Command::Presign {
            key,
            method,
            expires,
        } => {
            let (client, upload_config) = connect(&config, backend).await?;
            let method = Method::from_bytes(method.to_uppercase().as_bytes())
                .with_context(|| format!("invalid method {}", method))?;
            let expires = expires.unwrap_or(upload_config.presign_expires_seconds);
            let url = client.presign_url(method, &client.credential().object_key(key), expires)?;
            println!("{}", url);
            Ok(())
        }
        Command::AssumeRole { role_arn, duration } => {
            assume_role(&config, backend, role_arn, *duration).await
        }
    }
}

/// Client and upload settings of the selected backend
async fn connect(
    config: &Config,
    name: Option<&str>,
) -> anyhow::Result<(Arc<S3Client>, UploadConfig)> {
    let pool = S3ClientPool::new(config).await?;
    let client = match name {
        Some(name) => pool
            .get_client(name)
            .ok_or_else(|| anyhow!("unknown backend '{}' (have: {})", name, pool.names().join(", ")))?,
        None => pool
            .default_client()
            .ok_or_else(|| anyhow!("no backends configured"))?,
    };
    let upload = pool.upload_config(client.name()).cloned().unwrap_or_default();
    Ok((client, upload))
}

async fn assume_role(
    config: &Config,
    backend: Option<&str>,
    role_arn: &str,
    duration: u64,
) -> anyhow::Result<()> {
    let backend = config
        .backend(backend)
        .ok_or_else(|| anyhow!("backend not found"))?;
    let credential = mizuchi_storage::s3::CredentialsProvider::storage_credential(
        &backend.s3,
        backend.path_style(),
    )?;
    let endpoint = backend
        .s3
        .sts_endpoint
        .clone()
        .unwrap_or_else(|| credential.sts_endpoint());

    let assumed = StsClient::new(endpoint, credential.region.clone())?
        .assume_role(&credential.credentials, role_arn, &default_session_name(), duration)
        .await?;

    print_json(&serde_json::json!({
        "access_key_id": assumed.credentials.access_key_id(),
        "secret_access_key": assumed.credentials.secret_access_key(),
        "session_token": assumed.credentials.session_token(),
        "expiration": assumed.expiration,
    }))
}

/// Cancel the returned token on the first Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; finishing in-flight parts");
            token.cancel();
        }
    });
    cancel
}

fn parse_range(range: &str) -> anyhow::Result<ByteRange> {
    let (start, end) = range
        .split_once('-')
        .ok_or_else(|| anyhow!("range must look like START-END or START-"))?;
    let start = start.trim().parse().context("invalid range start")?;
    let end = match end.trim() {
        "" => None,
        end => Some(end.parse().context("invalid range end")?),
    };
    Ok(ByteRange { start, end })
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
