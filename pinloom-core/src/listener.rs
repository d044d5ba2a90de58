//! Per-listener intake worker
//!
//! Each ledger listener feeds a bounded channel; one worker drains it
//! serially, so pins from the same listener are processed in arrival
//! order while listeners progress in parallel. The channel bound gives
//! natural backpressure to the adapter.

use crate::aggregator::Aggregator;
use crate::error::PipelineError;
use pinloom_model::{BatchPinEvent, Database, VerifierRef};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// One inbound pin event as delivered by a ledger adapter.
#[derive(Debug, Clone)]
pub struct PinDelivery {
    /// Name of the listener the event arrived through.
    pub listener: String,
    pub pin: BatchPinEvent,
    pub verifier: VerifierRef,
}

/// Spawn a worker draining `rx` through the aggregator until the channel
/// closes or the token fires.
pub fn spawn_listener<D: Database + 'static>(
    aggregator: Arc<Aggregator<D>>,
    mut rx: mpsc::Receiver<PinDelivery>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let delivery = tokio::select! {
                _ = token.cancelled() => break,
                delivery = rx.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };
            match aggregator
                .batch_pin_complete(&delivery.listener, &delivery.pin, &delivery.verifier, &token)
                .await
            {
                Ok(()) => {}
                Err(PipelineError::Cancelled) => break,
                // batch_pin_complete swallows everything terminal itself;
                // anything surfacing here is unexpected.
                Err(err) => {
                    error!(%err, batch_id = %delivery.pin.batch_id, "pin processing failed");
                }
            }
        }
        debug!("pin intake worker stopped");
    })
}
