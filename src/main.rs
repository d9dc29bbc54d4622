use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use reqwest::Method;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use wos_sdk::{
    ClientConfig, Credentials, DownloadFileInput, SignatureScheme, SignedUrlInput, UploadFileInput,
    WosClient,
};

#[derive(Parser, Debug)]
#[command(name = "wos")]
#[command(about = "Transfer files to and from WOS/S3-compatible object storage", long_about = None)]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Service endpoint, e.g. https://wos.example.com
    #[arg(long, global = true, env = "WOS_ENDPOINT", default_value = "https://s3.amazonaws.com")]
    endpoint: String,

    /// Region used in V4 signatures
    #[arg(long, global = true, default_value = wos_sdk::config::DEFAULT_REGION)]
    region: String,

    /// Signature scheme (v2, v4, wos)
    #[arg(long, global = true, default_value = "v4")]
    signature: SignatureScheme,

    /// Address buckets as a path segment instead of a subdomain
    #[arg(long, global = true)]
    path_style: bool,

    #[arg(
        long,
        global = true,
        env = "WOS_ACCESS_KEY_ID",
        default_value = "",
        hide_env_values = true
    )]
    access_key: String,

    #[arg(
        long,
        global = true,
        env = "WOS_SECRET_ACCESS_KEY",
        default_value = "",
        hide_env_values = true
    )]
    secret_key: String,

    #[arg(long, global = true, env = "WOS_SECURITY_TOKEN", hide_env_values = true)]
    security_token: Option<String>,

    /// Part size in bytes
    #[arg(long, global = true, default_value_t = 0)]
    part_size: u64,

    /// Concurrent part transfers
    #[arg(long, global = true, default_value_t = 4)]
    tasks: usize,

    /// Keep a checkpoint file so an interrupted transfer can resume
    #[arg(long, global = true)]
    checkpoint: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a local file as a multipart upload
    Upload {
        file: PathBuf,
        bucket: String,
        key: String,
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Download an object with ranged GETs
    Download {
        bucket: String,
        key: String,
        file: Option<PathBuf>,
    },
    /// Print a presigned URL
    Presign {
        bucket: String,
        key: String,
        #[arg(long, default_value = "GET")]
        method: Method,
        /// Lifetime, e.g. 15m or 1h
        #[arg(long, default_value = "5m", value_parser = humantime::parse_duration)]
        expires: Duration,
    },
}

fn progress_bar(message: String) -> indicatif::ProgressBar {
    let pb = indicatif::ProgressBar::new(0);
    pb.set_style(
        indicatif::ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} parts {msg} | {elapsed_precise} elapsed, ETA {eta_precise}")
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
            .progress_chars("█▓▒░ "),
    );
    pb.set_message(message);
    pb
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let args = cli.common;

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("wos_sdk={},wos={}", log_level, log_level))
        .init();

    let config = ClientConfig::new(&args.endpoint)
        .with_region(&args.region)
        .with_signature(args.signature)
        .with_path_style(args.path_style);
    let mut credentials = Credentials::new(&args.access_key, &args.secret_key);
    if let Some(token) = &args.security_token {
        credentials = credentials.with_security_token(token);
    }
    let client = WosClient::new(config, credentials).context("failed to build client")?;

    match cli.command {
        Command::Upload {
            file,
            bucket,
            key,
            content_type,
        } => {
            info!("🚀 Uploading {} to {}/{}", file.display(), bucket, key);
            let mut input = UploadFileInput::new(&bucket, &key, &file);
            input.part_size = args.part_size;
            input.task_num = args.tasks;
            input.enable_checkpoint = args.checkpoint;
            input.content_type = content_type;
            input.progress = Some(progress_bar(format!("⬆️ {}", key)));
            let output = client
                .upload_file(input)
                .await
                .with_context(|| format!("upload of {} failed", file.display()))?;
            info!("✅ Uploaded {}/{} (ETag {})", output.bucket, output.key, output.etag);
        }
        Command::Download { bucket, key, file } => {
            info!("🚀 Downloading {}/{}", bucket, key);
            let mut input = DownloadFileInput::new(&bucket, &key);
            input.download_file = file;
            input.part_size = args.part_size;
            input.task_num = args.tasks;
            input.enable_checkpoint = args.checkpoint;
            input.progress = Some(progress_bar(format!("⬇️ {}", key)));
            let meta = client
                .download_file(input)
                .await
                .with_context(|| format!("download of {}/{} failed", bucket, key))?;
            info!("✅ Downloaded {} bytes", meta.content_length);
        }
        Command::Presign {
            bucket,
            key,
            method,
            expires,
        } => {
            let signed = client.create_signed_url(&SignedUrlInput {
                method,
                bucket,
                key,
                expires: expires.as_secs().max(1),
                ..Default::default()
            })?;
            println!("{}", signed.url);
        }
    }
    Ok(())
}
