//! Pipeline assembly and lifecycle.
//!
//! Wires the sources into the enrich/aggregate stage, the stage into the
//! durable queue, and one output worker per configured output. Shutdown is
//! signal-driven: sources stop, the accumulator and aggregator drain and
//! persist, the queue closes, and the workers exit once they have handed
//! off what they can.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use snafu::{ResultExt, Snafu};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::event::Event;
use crate::prioritizer::Prioritizer;
use crate::sinks::unix::OutputWorker;
use crate::sources::audit::run_audit_source;
use crate::sources::socket::run_input_listener;
use crate::transforms::aggregate::rule::AggregationRule;
use crate::transforms::aggregate::{Aggregator, HandleOutcome};
use crate::transforms::enrich::interpret::SystemUserDb;
use crate::transforms::enrich::inventory::run_inventory;
use crate::transforms::enrich::Enricher;
use auditmux_buffers::{PutError, Queue};

/// How long a `put` may wait on a full band before the event is dropped
/// and counted.
const PUT_DEADLINE: Duration = Duration::from_secs(5);

/// How often ready aggregates are pumped toward the queue.
const AGGREGATE_TICK: Duration = Duration::from_millis(500);

#[derive(Debug, Snafu)]
pub enum AppError {
    #[snafu(display("failed to open the event queue: {source}"))]
    QueueOpen { source: auditmux_buffers::OpenError },

    #[snafu(display("failed to start the input listener: {source}"))]
    Input { source: crate::sources::socket::ListenerError },

    #[snafu(display("failed to read aggregation rules {}: {source}", path.display()))]
    RulesRead { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to parse aggregation rules {}: {source}", path.display()))]
    RulesParse {
        path: PathBuf,
        source: crate::transforms::aggregate::rule::RuleParseError,
    },

    #[snafu(display("failed to compile aggregation rules: {source}"))]
    RulesCompile { source: crate::transforms::aggregate::matcher::MatcherError },
}

fn load_rules(path: &PathBuf) -> Result<Vec<AggregationRule>, AppError> {
    let raw = std::fs::read_to_string(path).context(RulesReadSnafu { path: path.clone() })?;
    let value: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
        AppError::RulesParse {
            path: path.clone(),
            source: crate::transforms::aggregate::rule::RuleParseError::Json {
                reason: e.to_string(),
            },
        }
    })?;
    AggregationRule::rules_from_json(&value).context(RulesParseSnafu { path: path.clone() })
}

fn init_aggregator(config: &Config) -> Result<Aggregator, AppError> {
    let state_file = config.state_file();
    let mut aggregator = if state_file.exists() {
        match Aggregator::load(&state_file) {
            Ok(aggregator) => {
                info!(
                    path = %state_file.display(),
                    ready = aggregator.num_ready(),
                    open = aggregator.num_pending(),
                    "Restored aggregator state."
                );
                aggregator
            }
            Err(error) => {
                warn!(path = %state_file.display(), %error, "Ignoring unreadable aggregator state.");
                Aggregator::new()
            }
        }
    } else {
        Aggregator::new()
    };

    if let Some(rules_file) = &config.aggregator.rules_file {
        let rules = load_rules(rules_file)?;
        info!(path = %rules_file.display(), rules = rules.len(), "Loaded aggregation rules.");
        aggregator.set_rules(rules).context(RulesCompileSnafu)?;
    }

    Ok(aggregator)
}

/// Moves ready aggregates into the queue; an aggregate stays queued inside
/// the aggregator while the queue is full.
async fn pump_aggregates(aggregator: &mut Aggregator, queue: &Queue, prioritizer: &Prioritizer) {
    loop {
        let mut pending: Option<Event> = None;
        match aggregator.handle_ready(|event| {
            pending = Some(event.clone());
            (0, false)
        }) {
            HandleOutcome::Handled { .. } => {}
            HandleOutcome::Empty => break,
            HandleOutcome::BuildFailed(error) => {
                // The entry stays queued; retry on the next tick.
                error!(%error, "Ready aggregate failed to render.");
                break;
            }
        }
        let Some(event) = pending else { break };

        let priority = prioritizer.priority(&event);
        let deadline = tokio::time::Instant::now() + PUT_DEADLINE;
        match queue.put(priority, event.as_bytes(), Some(deadline)).await {
            Ok(()) => {
                aggregator.handle_ready(|_| (0, true));
            }
            Err(PutError::QueueFull) => break,
            Err(PutError::Closed) => break,
        }
    }
}

/// The enrich/aggregate stage: one task owning the enricher and the
/// aggregator, between the sources and the queue.
#[allow(clippy::too_many_arguments)]
async fn run_pipeline_stage(
    mut events: mpsc::Receiver<Event>,
    mut enricher: Enricher,
    mut aggregator: Aggregator,
    queue: Queue,
    prioritizer: Prioritizer,
    state_file: PathBuf,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut enriched = Vec::new();
    let mut ticker = tokio::time::interval(AGGREGATE_TICK);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                enricher.process(&event, &mut enriched);
                for event in enriched.drain(..) {
                    if aggregator.add_event(&event) {
                        continue;
                    }
                    let priority = prioritizer.priority(&event);
                    let deadline = tokio::time::Instant::now() + PUT_DEADLINE;
                    match queue.put(priority, event.as_bytes(), Some(deadline)).await {
                        Ok(()) => {}
                        Err(PutError::QueueFull) => {
                            metrics::counter!("pipeline_dropped_events").increment(1);
                            warn!(id = %event.id(), "Queue full; dropping event.");
                        }
                        Err(PutError::Closed) => return,
                    }
                }
                pump_aggregates(&mut aggregator, &queue, &prioritizer).await;
            }
            _ = ticker.tick() => {
                pump_aggregates(&mut aggregator, &queue, &prioritizer).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    // Drain what is already ready, then persist the rest.
    pump_aggregates(&mut aggregator, &queue, &prioritizer).await;
    if let Err(error) = aggregator.save(&state_file) {
        error!(path = %state_file.display(), %error, "Failed to save aggregator state.");
    } else {
        info!(
            path = %state_file.display(),
            ready = aggregator.num_ready(),
            open = aggregator.num_pending(),
            "Saved aggregator state."
        );
    }
}

/// Runs the daemon until SIGTERM/SIGINT.
pub async fn run(config: Config) -> Result<(), AppError> {
    let queue = Queue::open(config.queue_config()).await.context(QueueOpenSnafu)?;
    let aggregator = init_aggregator(&config)?;
    let user_db = Arc::new(SystemUserDb::default());
    let prioritizer = Prioritizer::from_config(&config.priority, config.queue.num_priorities.max(1));
    let enricher = Enricher::new(config.enrich_config(), user_db.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (event_tx, event_rx) = mpsc::channel::<Event>(1024);

    let mut tasks = JoinSet::new();

    tasks.spawn(run_pipeline_stage(
        event_rx,
        enricher,
        aggregator,
        queue.clone(),
        prioritizer,
        config.state_file(),
        shutdown_rx.clone(),
    ));

    if config.netlink.enabled {
        let source_config = config.audit_source_config();
        let events = event_tx.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            if let Err(error) = run_audit_source(source_config, events, shutdown).await {
                // Most commonly a permissions problem; the socket input
                // keeps the daemon useful.
                error!(%error, "Audit netlink source failed.");
            }
        });
    }

    if config.input.enabled {
        let input_config = config.input_config();
        let events = event_tx.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            if let Err(error) = run_input_listener(input_config, events, shutdown).await {
                error!(%error, "Input listener failed.");
            }
        });
    }

    if config.inventory.enabled {
        tasks.spawn(run_inventory(
            config.inventory_config(),
            user_db,
            event_tx.clone(),
            shutdown_rx.clone(),
        ));
    }

    for sink_config in config.sink_configs() {
        let cursor = queue.register(&sink_config.name).await;
        tasks.spawn(OutputWorker::new(sink_config, cursor).run(shutdown_rx.clone()));
    }
    if config.outputs.is_empty() {
        warn!("No outputs configured; events will accumulate in the queue.");
    }

    // The stage holds the only receiver; drop our sender so it can see the
    // channel close once the sources are gone.
    drop(event_tx);

    wait_for_signal().await;
    info!("Shutting down.");
    let _ = shutdown_tx.send(true);

    // Let the sources flush into the stage, then close the queue so the
    // outputs drain and exit.
    tokio::time::sleep(Duration::from_millis(200)).await;
    queue.close().await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        match tokio::time::timeout_at(deadline, tasks.join_next()).await {
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(_) => {
                warn!("Shutdown timed out; aborting remaining tasks.");
                tasks.abort_all();
                break;
            }
        }
    }

    info!("Shutdown complete.");
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(error) => {
            error!(%error, "Failed to install SIGTERM handler.");
            futures::future::pending::<()>().await;
            return;
        }
    };
    tokio::select! {
        _ = term.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}
