//! trailprobe CLI - Recover the account id owning an S3 bucket.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use trailprobe::models::{encode, ACCOUNT_ID_WIDTH};
use trailprobe::{Config, InvocationResponse, RecoveryPipeline, ServiceRegistry};

#[derive(Parser)]
#[command(name = "trailprobe")]
#[command(version)]
#[command(about = "Recover the owning account id of an S3 bucket through CloudTrail")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe the bucket and recover its owning account id
    Run {
        /// Read configuration from the deployment environment instead of a file
        #[arg(long)]
        env: bool,

        /// Override the target bucket
        #[arg(short, long)]
        bucket: Option<String>,

        /// Override the expected gateway endpoint id
        #[arg(short, long)]
        gateway: Option<String>,

        /// Write the full run report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Print every probe pattern with its session name
    Probes,

    /// Validate configuration file
    Validate {
        /// Read configuration from the deployment environment instead of a file
        #[arg(long)]
        env: bool,
    },

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}

fn load_config(path: &Path, from_env: bool) -> Result<Config> {
    let config = if from_env {
        Config::from_env().context("Failed to load config from environment")?
    } else {
        Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))?
    };
    Ok(config)
}

fn print_example_config() {
    let example = r#"# trailprobe configuration file

[aws]
region = "eu-west-1"
# Credentials default to AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY / AWS_SESSION_TOKEN
# access_key_id = "${PROBE_ACCESS_KEY_ID}"
timeout_secs = 30
max_retries = 3

[endpoints]
# Interface endpoints inside the VPC (gateway entry points)
sts = "https://vpce-0123456789abcdef0-abcdefgh.sts.eu-west-1.vpce.amazonaws.com"
cloudtrail = "https://vpce-0fedcba9876543210-hgfedcba.cloudtrail.eu-west-1.vpce.amazonaws.com"
# s3 = "https://bucket.vpce-0aaaabbbbccccdddd-11112222.s3.eu-west-1.vpce.amazonaws.com"

[target]
bucket = "bucket-to-attribute"
gateway_id = "vpce-0aaaabbbbccccdddd"
role_arn = "arn:aws:iam::111122223333:role/trailprobe"
# role_name = "trailprobe"  # derived from role_arn when omitted

[probing]
concurrency = 1
session_duration_secs = 900

[correlation]
event_name = "GetBucketAcl"
deadline_secs = 600
lookback_secs = 60
poll_interval_secs = 5
stop_after_distinct = 10
"#;
    println!("{example}");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Probes => {
            for pattern in RecoveryPipeline::probe_patterns() {
                println!("{pattern}  {}", encode(&pattern));
            }
            return Ok(());
        }

        Commands::Validate { env } => {
            let config = load_config(&cli.config, env)?;
            config.validate().context("Invalid configuration")?;

            // Try to resolve credentials
            config
                .resolve_credentials()
                .context("Failed to resolve AWS credentials")?;

            info!("Configuration is valid");
            info!("  Region:    {}", config.aws.region);
            info!("  Bucket:    {}", config.target.bucket);
            info!("  Gateway:   {}", config.target.gateway_id);
            info!("  Role:      {} ({})", config.target.role_arn, config.role_name());
            info!("  STS:       {}", config.sts_url());
            info!("  Trail:     {}", config.cloudtrail_url());
            info!(
                "  Deadline:  {}s, stop after {} labels",
                config.correlation.deadline_secs, config.correlation.stop_after_distinct
            );
            return Ok(());
        }

        Commands::Run {
            env,
            bucket,
            gateway,
            report,
        } => {
            let mut config = load_config(&cli.config, env)?;

            // Override target from CLI
            if let Some(bucket) = bucket {
                config.target.bucket = bucket;
            }
            if let Some(gateway) = gateway {
                config.target.gateway_id = gateway;
            }
            config.validate().context("Invalid configuration")?;

            let services =
                ServiceRegistry::from_config(&config).context("Failed to set up AWS clients")?;
            let pipeline = RecoveryPipeline::new(config, services).with_progress(true);

            let stats = pipeline.run().await.context("Recovery aborted")?;

            if let Some(path) = report {
                let json = serde_json::to_string_pretty(&stats)?;
                std::fs::write(&path, json)
                    .with_context(|| format!("Failed to write report to {path:?}"))?;
            }

            eprintln!("\n=== Recovery Complete ===");
            eprintln!("Bucket:      {}", stats.bucket);
            eprintln!("Account id:  {}", stats.account_id);
            eprintln!("Resolved:    {}/{ACCOUNT_ID_WIDTH}", stats.resolved_positions);
            eprintln!("Labels:      {}", stats.distinct_labels);
            eprintln!("Anomalies:   {}", stats.anomalies.len());
            eprintln!("Outcome:     {:?}", stats.outcome);
            eprintln!("Polls:       {}", stats.polls);
            eprintln!(
                "Probes:      {} issued, {} delivered",
                stats.probes.issued, stats.probes.delivered
            );
            eprintln!("Runtime:     {:.1}s", stats.runtime_secs);

            let response = InvocationResponse::from_report(&stats)?;
            println!("{}", serde_json::to_string(&response)?);
        }
    }

    Ok(())
}
