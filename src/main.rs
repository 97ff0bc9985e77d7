use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use thiserror::Error;
use tokio::sync::watch;

use amipub::aws::AwsProvider;
use amipub::config::{self, AccountsMap, RetryPolicy, SnapshotAccounts, DEFAULT_ACCOUNT_GROUP};
use amipub::delete::{self, DeleteConfig, DeleteEngine};
use amipub::manifest;
use amipub::push::{self, PushConfig, PushEngine};
use amipub::rhsm::RhsmClient;
use amipub::source;

/// Exit code signalling a failed push or delete run, as opposed to a fatal
/// startup error.
const TASK_FAILURE_EXIT_CODE: i32 = 30;

/// Publish and retract Amazon Machine Images on behalf of a release pipeline.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the amipub configuration file.
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Push staged AMIs to AWS and register them with the product catalog.
    Push(PushArgs),
    /// Mark AMIs invisible in the product catalog, then delete the image and
    /// related snapshots on AWS.
    Delete(DeleteArgs),
}

#[derive(Debug, clap::Args)]
struct CommonArgs {
    /// Source locations of the staged AMIs with the source type,
    /// e.g. staged:/path/to/stage/ami or pub:https://pub.example.com?task_id=125222
    #[arg(required = true)]
    source: Vec<String>,

    /// AWS provider, e.g. AWS, ACN (AWS China), AGOV (AWS US Gov).
    #[arg(long)]
    aws_provider_name: Option<String>,

    /// Region to accounts mapping for the accounts an image is pushed to or
    /// deleted from in a region, e.g.
    /// '{"region-1": {"access-id": "secret"}, "default": {"access-id": "secret"}}'
    #[arg(long, default_value = "{}")]
    accounts: String,

    /// The AWS access id used as the default account
    /// (or set AWS_ACCESS_ID environment variable)
    #[arg(long, env = "AWS_ACCESS_ID")]
    aws_access_id: Option<String>,

    /// The AWS secret key used as the default account
    /// (or set AWS_SECRET_KEY environment variable)
    #[arg(long, env = "AWS_SECRET_KEY")]
    aws_secret_key: Option<String>,

    /// Base URL of the product catalog API.
    #[arg(long, env = "RHSM_URL")]
    rhsm_url: String,

    /// PEM bundle with the client certificate and key for the catalog API.
    #[arg(long)]
    rhsm_cert: Option<PathBuf>,

    /// Duration to wait in seconds before retrying an action on AWS.
    #[arg(long)]
    retry_wait: Option<u64>,

    /// Number of retries on failure with an action on AWS.
    #[arg(long)]
    max_retries: Option<u32>,

    /// Number of concurrent (item, target) workers.
    #[arg(long)]
    request_threads: Option<usize>,

    /// Where to write the structured result manifest.
    #[arg(long, default_value = "images.json")]
    manifest: PathBuf,
}

#[derive(Debug, clap::Args)]
struct PushArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Publish the AMIs in the public domain.
    #[arg(long)]
    ship: bool,

    /// Prefix of the storage container used for upload.
    #[arg(long)]
    container_prefix: Option<String>,

    /// Images are released for general use.
    #[arg(long)]
    allow_public_images: bool,

    /// Region to account-id list mapping granting snapshot creation
    /// permission when a new snapshot is created as part of the push.
    #[arg(long)]
    snapshot_account_ids: Option<String>,
}

#[derive(Debug, clap::Args)]
struct DeleteArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Do not delete snapshots from AWS.
    #[arg(long)]
    keep_snapshot: bool,

    /// Skip destructive actions on the catalog or AWS.
    #[arg(long)]
    dry_run: bool,

    /// Only remove the specified AMIs by AMI image id.
    #[arg(long, value_delimiter = ',')]
    limit: Vec<String>,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration file: {0}")]
    ConfigParse(#[from] config::FileError),

    #[error("configuration: {0}")]
    Config(#[from] config::Error),

    #[error("load push items: {0}")]
    Source(#[from] source::Error),

    #[error("catalog client: {0}")]
    Catalog(#[from] amipub::rhsm::CatalogError),

    #[error("push: {0}")]
    Push(#[from] push::Error),

    #[error("delete: {0}")]
    Delete(#[from] delete::Error),

    #[error("manifest: {0}")]
    Manifest(#[from] manifest::Error),

    #[error("{0}")]
    TaskFailed(String),
}

/// Read configuration file from disk, falling back to the compiled-in
/// `default.toml`.
///
/// If a configuration file name is not set explicitly, this function will
/// detect whether a config file with the default file name exists in the
/// working directory. If it does, it is used implicitly.
fn read_config(args: &Cli) -> Result<config::File, Error> {
    const DEFAULT_CONFIG_FILE: &str = "amipub.toml";

    let config_file = match &args.config {
        None => {
            if std::fs::metadata(DEFAULT_CONFIG_FILE)
                .map(|metadata| metadata.is_file())
                .unwrap_or(false)
            {
                Some(DEFAULT_CONFIG_FILE.to_string())
            } else {
                None
            }
        }
        Some(c) => Some(c.clone()),
    };

    Ok(if let Some(config_file) = config_file {
        config::File::from_path(&config_file)?
    } else {
        config::File::default()
    })
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(_) => std::process::exit(0),
        Err(Error::TaskFailed(message)) => {
            error!("{}", message);
            std::process::exit(TASK_FAILURE_EXIT_CODE)
        }
        Err(err) => {
            error!("fatal: {}", err);
            std::process::exit(1)
        }
    }
}

async fn run() -> Result<(), Error> {
    env_logger::init();

    let args = Cli::parse();
    let cfg = read_config(&args)?;

    info!("amipub {}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Commands::Push(push_args) => run_push(cfg, push_args).await,
        Commands::Delete(delete_args) => run_delete(cfg, delete_args).await,
    }
}

fn parse_accounts(common: &CommonArgs) -> Result<AccountsMap, Error> {
    let mut accounts = AccountsMap::parse(&common.accounts)?;
    // Explicit access/secret keys become the default account
    if let (Some(access_id), Some(secret_key)) = (&common.aws_access_id, &common.aws_secret_key) {
        accounts.insert(DEFAULT_ACCOUNT_GROUP, access_id.clone(), secret_key.clone());
    }
    Ok(accounts)
}

fn retry_policy(common: &CommonArgs, cfg: &config::File) -> RetryPolicy {
    RetryPolicy::new(
        common.max_retries.unwrap_or(cfg.task.max_retries),
        common.retry_wait.unwrap_or(cfg.task.retry_wait),
    )
}

/// Interrupts flip a flag the engines check between steps, so in-flight
/// units stop at the next safe checkpoint instead of being hard-killed.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping at the next safe checkpoint");
            let _ = tx.send(true);
        }
    });
    rx
}

async fn run_push(cfg: config::File, args: PushArgs) -> Result<(), Error> {
    let common = &args.common;
    let accounts = parse_accounts(common)?;
    let snapshot_accounts = match &args.snapshot_account_ids {
        Some(raw) => SnapshotAccounts::parse(raw)?,
        None => SnapshotAccounts::default(),
    };

    let catalog = Arc::new(RhsmClient::new(
        common.rhsm_url.clone(),
        common.rhsm_cert.as_deref(),
    )?);
    let provider = Arc::new(AwsProvider::new());

    let items = source::load_items(&common.source).await?;

    let engine = PushEngine::new(
        provider,
        catalog,
        accounts,
        snapshot_accounts,
        PushConfig {
            provider_name: common
                .aws_provider_name
                .clone()
                .unwrap_or_else(|| cfg.task.provider.clone()),
            container_prefix: args
                .container_prefix
                .clone()
                .unwrap_or_else(|| cfg.task.container_prefix.clone()),
            ship: args.ship,
            allow_public_images: args.allow_public_images,
            retry: retry_policy(common, &cfg),
            request_threads: common.request_threads.unwrap_or(cfg.task.request_threads),
        },
    )
    .with_shutdown(shutdown_signal());

    let manifest = engine.run(items).await?;

    info!("Collecting results");
    manifest.write(&common.manifest)?;

    if !manifest.is_success() {
        return Err(Error::TaskFailed("AMI upload failed".to_string()));
    }
    info!("AMI upload completed");
    Ok(())
}

async fn run_delete(cfg: config::File, args: DeleteArgs) -> Result<(), Error> {
    let common = &args.common;
    let accounts = parse_accounts(common)?;

    let catalog = Arc::new(RhsmClient::new(
        common.rhsm_url.clone(),
        common.rhsm_cert.as_deref(),
    )?);
    let provider = Arc::new(AwsProvider::new());

    let items = source::load_items(&common.source).await?;

    let dry_run = args.dry_run;
    let engine = DeleteEngine::new(
        provider,
        catalog,
        accounts,
        DeleteConfig {
            provider_name: common
                .aws_provider_name
                .clone()
                .unwrap_or_else(|| cfg.task.provider.clone()),
            dry_run,
            keep_snapshot: args.keep_snapshot,
            limit: (!args.limit.is_empty()).then(|| args.limit.clone()),
            retry: retry_policy(common, &cfg),
            request_threads: common.request_threads.unwrap_or(cfg.task.request_threads),
        },
    )
    .with_shutdown(shutdown_signal());

    let manifest = engine.run(items).await?;

    info!("Collecting results");
    manifest.write(&common.manifest)?;

    if dry_run {
        info!("AMI delete dry-run completed");
        return Ok(());
    }
    if !manifest.is_success() {
        return Err(Error::TaskFailed("AMI delete finished with failure".to_string()));
    }
    info!("AMI delete completed");
    Ok(())
}
