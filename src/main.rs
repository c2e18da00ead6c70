use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use fluxguard::config::{FluxGuardConfig, LoggingConfig};
use fluxguard::middleware::{LimiterAdapter, Verdict};
use fluxguard::ratelimit::KeyMode;

/// Admission control and rate limiting.
#[derive(Debug, Parser)]
#[command(name = "fluxguard", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run sequential admission checks and print each verdict
    Check {
        /// Key mode: ip, apiKey or user
        #[arg(long)]
        mode: KeyMode,
        #[arg(long)]
        identifier: String,
        #[arg(long, default_value_t = 1)]
        requests: u32,
        /// Delay between requests in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
    /// Fire concurrent admission checks and print the totals
    Burst {
        #[arg(long)]
        mode: KeyMode,
        #[arg(long)]
        identifier: String,
        #[arg(long, default_value_t = 100)]
        requests: u32,
    },
}

/// Request context used by the CLI.
struct CliRequest {
    identifier: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = FluxGuardConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;
    init_logging(&config.logging);

    info!("Starting fluxguard");
    info!(version = env!("CARGO_PKG_VERSION"), instance_id = %config.instance_id, "Configuration loaded");

    let store = config.build_store()?;
    config.rules.validate(store.clone())?;

    match cli.command {
        Command::Check {
            mode,
            identifier,
            requests,
            interval_ms,
        } => {
            let adapter = build_adapter(&config, mode, store)?;
            let request = CliRequest { identifier };

            for i in 1..=requests {
                let verdict = adapter.evaluate(&request).await;
                print_verdict(i, &verdict);

                if interval_ms > 0 && i < requests {
                    tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                }
            }
        }
        Command::Burst {
            mode,
            identifier,
            requests,
        } => {
            let adapter = Arc::new(build_adapter(&config, mode, store)?);

            let handles: Vec<_> = (0..requests)
                .map(|_| {
                    let adapter = adapter.clone();
                    let request = CliRequest {
                        identifier: identifier.clone(),
                    };
                    tokio::spawn(async move { adapter.evaluate(&request).await.is_proceed() })
                })
                .collect();

            let mut admitted = 0u32;
            for result in futures::future::join_all(handles).await {
                if result.context("Admission task failed")? {
                    admitted += 1;
                }
            }

            println!("admitted: {}", admitted);
            println!("rejected: {}", requests - admitted);
        }
    }

    info!("fluxguard finished");
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_adapter(
    config: &FluxGuardConfig,
    mode: KeyMode,
    store: Arc<dyn fluxguard::store::KeyedStateStore>,
) -> anyhow::Result<LimiterAdapter<CliRequest>> {
    let limiter = config.limiter_for(mode, store)?;
    info!(
        mode = %mode,
        algorithm = limiter.algorithm(),
        limit = limiter.limit(),
        "Limiter ready"
    );

    Ok(LimiterAdapter::new(limiter, mode, |req: &CliRequest| {
        Some(req.identifier.clone())
    }))
}

fn print_verdict(n: u32, verdict: &Verdict) {
    match verdict {
        Verdict::Proceed { .. } => println!("#{} allowed", n),
        Verdict::Reject(rejection) => println!(
            "#{} rejected ({}): {}",
            n,
            rejection.status,
            rejection.body.to_json()
        ),
    }

    for (name, value) in verdict.headers() {
        println!("    {}: {}", name, value.to_str().unwrap_or("<binary>"));
    }
}
