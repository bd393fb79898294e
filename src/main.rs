use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::future::join_all;
use http::Request;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use keyrate::config::KeyrateConfig;
use keyrate::filter::{Action, KeySource};
use keyrate::ratelimit::{Clock, RulesConfig, SystemClock};
use keyrate::scheduler::RefillScheduler;
use keyrate::store::{MemoryStore, SharedStore};
use keyrate::worker::Worker;

/// Run rate limiting workers against one shared store under synthetic load.
#[derive(Debug, Parser)]
#[command(name = "keyrate", version, about)]
struct Args {
    /// Service configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Rate limit rules file (YAML); overrides `rules_path`
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// Number of workers; overrides `worker.workers`
    #[arg(long)]
    workers: Option<usize>,

    /// How long to generate traffic
    #[arg(long, default_value_t = 10)]
    duration_secs: u64,

    /// Requests per second issued by each worker
    #[arg(long, default_value_t = 50)]
    requests_per_sec: u32,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

/// A key the traffic generator sends, and where it puts it.
#[derive(Debug, Clone)]
struct Target {
    label: String,
    source: KeySource,
    key: String,
}

impl Target {
    fn new(source: &KeySource, key: &str) -> Self {
        let label = match source {
            KeySource::Header(name) => format!("header {}={}", name, key),
            KeySource::QueryParam(name) => format!("param {}={}", name, key),
        };
        Self {
            label,
            source: source.clone(),
            key: key.to_string(),
        }
    }

    fn request(&self) -> Option<Request<()>> {
        let builder = match &self.source {
            KeySource::Header(name) => Request::builder().uri("/").header(name, self.key.as_str()),
            KeySource::QueryParam(name) => Request::builder().uri(format!(
                "/?{}={}",
                form_encode(name),
                form_encode(&self.key)
            )),
        };
        builder.body(()).ok()
    }
}

/// Percent-encode everything outside the URL unreserved set.
fn form_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
struct Tally {
    admitted: u64,
    rejected: u64,
}

#[derive(Debug, Serialize)]
struct Report {
    workers: usize,
    duration_secs: u64,
    refill_ticks: u64,
    targets: BTreeMap<String, Tally>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting Keyrate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = KeyrateConfig::load(args.config.as_deref())?;
    if let Some(workers) = args.workers {
        anyhow::ensure!(workers > 0, "at least one worker is required");
        config.worker.workers = workers;
    }

    let rules_path = args
        .rules
        .or_else(|| config.rules_path.clone())
        .context("no rules file given; pass --rules or set rules_path")?;
    let rules = RulesConfig::from_file(&rules_path)?;
    let definitions = rules.validate()?;
    info!(
        rules = definitions.len(),
        workers = config.worker.workers,
        tick = ?config.worker.tick_interval(),
        "Configuration loaded"
    );

    let mut targets: Vec<Target> = Vec::new();
    for definition in &definitions {
        for limit in &definition.limits {
            targets.push(Target::new(&definition.source, &limit.key));
        }
        targets.push(Target::new(&definition.source, "unlisted-key"));
    }
    let targets = Arc::new(targets);

    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = RefillScheduler::new(config.worker.tick_interval());

    let mut schedulers = Vec::with_capacity(config.worker.workers);
    let mut drivers = Vec::with_capacity(config.worker.workers);
    for _ in 0..config.worker.workers {
        let worker = Arc::new(Worker::new(store.clone(), clock.clone()));
        worker.apply(&rules)?;
        info!(worker = %worker.id(), "Worker started");

        schedulers.push(scheduler.spawn(worker.clone(), shutdown_rx.clone()));
        drivers.push(tokio::spawn(drive_traffic(
            worker,
            targets.clone(),
            args.requests_per_sec,
            shutdown_rx.clone(),
        )));
    }

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.duration_secs)) => {
            info!("Traffic run complete");
        }
        _ = shutdown_signal() => {}
    }
    let _ = shutdown_tx.send(true);

    let refill_ticks: u64 = join_all(schedulers)
        .await
        .into_iter()
        .filter_map(Result::ok)
        .sum();

    let mut totals = vec![Tally::default(); targets.len()];
    for tallies in join_all(drivers).await.into_iter().filter_map(Result::ok) {
        for (total, tally) in totals.iter_mut().zip(tallies) {
            total.admitted += tally.admitted;
            total.rejected += tally.rejected;
        }
    }

    let report = Report {
        workers: config.worker.workers,
        duration_secs: args.duration_secs,
        refill_ticks,
        targets: targets
            .iter()
            .map(|t| t.label.clone())
            .zip(totals)
            .collect(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    info!("Keyrate stopped");
    Ok(())
}

/// Send requests for random targets through `worker` until shutdown.
async fn drive_traffic(
    worker: Arc<Worker>,
    targets: Arc<Vec<Target>>,
    requests_per_sec: u32,
    mut shutdown: watch::Receiver<bool>,
) -> Vec<Tally> {
    let mut tallies = vec![Tally::default(); targets.len()];
    if targets.is_empty() {
        return tallies;
    }

    let mut rng = StdRng::from_entropy();
    let mut interval = tokio::time::interval(Duration::from_secs(1) / requests_per_sec.clamp(1, 1_000_000));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let index = rng.gen_range(0..targets.len());
                let Some(request) = targets[index].request() else {
                    warn!(label = %targets[index].label, "Could not build request");
                    continue;
                };
                match worker.handle(&request) {
                    Action::Continue => tallies[index].admitted += 1,
                    Action::Reject(_) => tallies[index].rejected += 1,
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    tallies
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyrate::filter::RuleFilter;
    use keyrate::ratelimit::{KeyLimit, RuleDefinition, RuleId};

    #[test]
    fn test_query_target_round_trips_through_filter() {
        let source = KeySource::QueryParam("api key".into());
        let key = "a&b=c+d é";
        let definition = RuleDefinition {
            source: source.clone(),
            limits: vec![KeyLimit {
                key: key.to_string(),
                tokens_per_refill: 1,
                refill_interval: Duration::from_secs(1),
                max_tokens: 1,
            }],
        };
        let filter = RuleFilter::new(RuleId(0), &definition);

        let request = Target::new(&source, key).request().unwrap();
        assert_eq!(filter.classify(&request).as_deref(), Some(key));
    }
}
