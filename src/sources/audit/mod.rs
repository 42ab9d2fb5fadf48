//! The audit netlink source: raw kernel records in, assembled events out.

pub mod accumulator;
pub mod netlink;
pub mod record;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::event::Event;

use accumulator::Accumulator;
use netlink::{AuditNetlink, NetlinkError, RawMessage};
use record::RawRecord;

#[derive(Clone, Debug)]
pub struct AuditSourceConfig {
    /// How often partially assembled events are checked for staleness.
    pub flush_interval: Duration,
    /// How long an incomplete event may sit before it is force-assembled.
    pub max_record_age: Duration,
}

impl Default for AuditSourceConfig {
    fn default() -> Self {
        AuditSourceConfig {
            flush_interval: Duration::from_secs(1),
            max_record_age: Duration::from_millis(1500),
        }
    }
}

/// Runs the netlink reader and the accumulator flush ticker until shutdown.
pub async fn run_audit_source(
    config: AuditSourceConfig,
    events: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), NetlinkError> {
    let netlink = Arc::new(AuditNetlink::open()?);
    netlink.set_audit_pid(std::process::id()).await?;
    info!("Audit netlink source started.");

    let (raw_tx, mut raw_rx) = mpsc::channel::<RawMessage>(1024);
    let reader = {
        let netlink = Arc::clone(&netlink);
        tokio::spawn(async move { netlink.run(raw_tx).await })
    };

    let mut accumulator = Accumulator::new();
    let mut ticker = tokio::time::interval(config.flush_interval);
    let mut out = Vec::new();

    loop {
        tokio::select! {
            message = raw_rx.recv() => {
                let Some(message) = message else {
                    warn!("Audit netlink reader stopped.");
                    break;
                };
                match RawRecord::parse(message.record_type, &message.payload) {
                    Ok(record) => {
                        accumulator.add_record(record, &mut out);
                    }
                    Err(error) => {
                        debug!(%error, record_type = %message.record_type, "Skipping unparsable record.");
                    }
                }
            }
            _ = ticker.tick() => {
                accumulator.flush(config.max_record_age, &mut out);
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }

        for event in out.drain(..) {
            if events.send(event).await.is_err() {
                reader.abort();
                return Ok(());
            }
        }
    }

    // Drain whatever is still assembling before going down.
    accumulator.flush(Duration::ZERO, &mut out);
    for event in out.drain(..) {
        if events.send(event).await.is_err() {
            break;
        }
    }
    reader.abort();
    info!("Audit netlink source stopped.");
    Ok(())
}
