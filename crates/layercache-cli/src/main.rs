use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};

use layercache_core::config::LayercacheConfig;
use layercache_scheduler::{
    AttemptRecord, Conditions, Constraint, ConstraintSet, HostConditions, JobRequest, Outcome,
    RetryPolicy, Scheduler, SchedulerConfig,
};

mod registry;

#[derive(Parser)]
#[command(name = "layercache", version, about = "Deferred, constraint-gated layer cache rebuilds")]
struct Cli {
    /// Config file (default: $LAYERCACHE_CONFIG, then ~/.layercache/layercache.toml).
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the layers defined in the config.
    Layers,
    /// Schedule cache rebuilds and wait for every outcome.
    ///
    /// Prints one JSON attempt record per executor attempt on stdout.
    Rebuild(RebuildArgs),
}

#[derive(Args)]
struct RebuildArgs {
    /// Layer ids to rebuild.
    #[arg(required = true, allow_negative_numbers = true)]
    layer_ids: Vec<i64>,

    /// Delay before a job becomes eligible (default: scheduler.initial_delay_ms).
    #[arg(long)]
    delay_ms: Option<u64>,

    /// Constraints that must hold, comma-separated (e.g. network,charging).
    #[arg(long, value_delimiter = ',')]
    require: Vec<Constraint>,

    /// Fail a job whose constraints do not hold within this many ms.
    #[arg(long)]
    constraint_timeout_ms: Option<u64>,

    /// Total attempts per job for rebuild failures (default: scheduler.retry).
    #[arg(long)]
    attempts: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "layercache=info,layercache_scheduler=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = LayercacheConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        LayercacheConfig::default()
    });

    match cli.command {
        Command::Layers => {
            list_layers(&config);
            Ok(())
        }
        Command::Rebuild(args) => rebuild(&config, args).await,
    }
}

fn list_layers(config: &LayercacheConfig) {
    if config.layers.is_empty() {
        println!("no layers configured");
        return;
    }
    for layer in &config.layers {
        let timeout = layer
            .timeout_secs
            .map_or_else(|| "-".to_string(), |s| format!("{s}s"));
        println!(
            "{}\t{}\t{}\t{}",
            layer.id, layer.name, timeout, layer.rebuild_command
        );
    }
}

async fn rebuild(config: &LayercacheConfig, args: RebuildArgs) -> anyhow::Result<()> {
    let registry = Arc::new(registry::ConfigRegistry::new(
        &config.layers,
        tokio::runtime::Handle::current(),
    ));
    // No platform signals in a standalone host: conditions stay as configured.
    let host = HostConditions::new(Conditions::from(&config.conditions));
    let scheduler_config = SchedulerConfig::from(&config.scheduler);

    let (records_tx, mut records_rx) = mpsc::channel::<AttemptRecord>(256);
    let scheduler = Scheduler::new(registry, host.subscribe(), scheduler_config.clone(), Some(records_tx))?;

    let printer = tokio::spawn(async move {
        while let Some(record) = records_rx.recv().await {
            match serde_json::to_string(&record) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(job_id = %record.job_id, "failed to encode attempt record: {e}"),
            }
        }
    });

    let constraints: ConstraintSet = args.require.into_iter().collect();
    let total = args.layer_ids.len();
    let mut rejected = 0usize;
    let mut handles = Vec::with_capacity(total);

    for raw_id in args.layer_ids {
        let mut request = JobRequest::new(raw_id).constraints(constraints.clone());
        if let Some(ms) = args.delay_ms {
            request = request.initial_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = args.constraint_timeout_ms {
            request = request.constraint_timeout(Duration::from_millis(ms));
        }
        if let Some(attempts) = args.attempts {
            request = request.retry(RetryPolicy::fixed(attempts, scheduler_config.retry.backoff));
        }
        match scheduler.submit(request) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                warn!(layer_id = raw_id, "rebuild request rejected: {e}");
                rejected += 1;
            }
        }
    }

    let all = async {
        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in &handles {
            outcomes.push((handle.layer_id(), handle.wait().await));
        }
        outcomes
    };
    tokio::pin!(all);
    let outcomes = tokio::select! {
        outcomes = &mut all => outcomes,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, cancelling rebuilds that have not started");
            scheduler.cancel_all();
            all.await
        }
    };

    let mut unsuccessful = rejected;
    for (layer_id, outcome) in &outcomes {
        match outcome {
            Outcome::Succeeded => info!(%layer_id, "layer cache rebuilt"),
            Outcome::Failed(failure) => {
                warn!(%layer_id, failure = %failure.kind, error = %failure.detail, "layer cache rebuild failed");
                unsuccessful += 1;
            }
            Outcome::Cancelled => {
                warn!(%layer_id, "layer cache rebuild cancelled");
                unsuccessful += 1;
            }
        }
    }

    scheduler.shutdown().await;
    // Dropping the scheduler closes the record channel and ends the printer.
    drop(scheduler);
    printer.await?;

    if unsuccessful > 0 {
        anyhow::bail!("{unsuccessful} of {total} rebuild request(s) did not succeed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rebuild_arguments() {
        let cli = Cli::try_parse_from([
            "layercache",
            "rebuild",
            "7",
            "-1",
            "--delay-ms",
            "0",
            "--require",
            "network,device-idle",
            "--attempts",
            "3",
        ])
        .expect("parse failed");
        let Command::Rebuild(args) = cli.command else {
            panic!("expected rebuild");
        };
        assert_eq!(args.layer_ids, vec![7, -1]);
        assert_eq!(args.delay_ms, Some(0));
        assert_eq!(args.require, vec![Constraint::Network, Constraint::DeviceIdle]);
        assert_eq!(args.attempts, Some(3));
    }

    #[test]
    fn rejects_unknown_constraint() {
        assert!(Cli::try_parse_from(["layercache", "rebuild", "1", "--require", "wifi"]).is_err());
    }

    #[test]
    fn rebuild_requires_a_layer() {
        assert!(Cli::try_parse_from(["layercache", "rebuild"]).is_err());
    }
}
