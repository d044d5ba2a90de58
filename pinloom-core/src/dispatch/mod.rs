//! Event dispatcher: per-topic, in-order delivery of user events
//!
//! One poller scans newly persisted pins and fans them out to a fixed
//! pool of shard workers keyed by context hash. Each worker owns the
//! lanes that hash to it, so every lane has exactly one drainer and
//! per-topic order falls out of the lane queue. Dependency arrivals
//! (batches, messages, data) are signalled by poking the poller, which
//! sweeps all lanes; a periodic tick covers anything missed.

mod lane;

use crate::bus::EventBus;
use crate::cache::{KeyResolver, MessageDataCache};
use crate::config::CoreConfig;
use crate::error::PipelineError;
use crate::retry::Retrier;
use lane::{commit_dispatch, commit_reject, evaluate, Disposition, Lane, ShardCtx};
use pinloom_model::{Clock, Database, Hash, PinRecord};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

enum ShardMsg {
    Pin(PinRecord),
    /// Re-evaluate stalled lanes after dependencies changed.
    Sweep,
}

/// Cheap, cloneable way to nudge the dispatcher after a commit added pins
/// or dependencies.
#[derive(Clone)]
pub struct DispatcherHandle {
    poke_tx: mpsc::Sender<()>,
}

impl DispatcherHandle {
    pub fn poke(&self) {
        // A full channel already holds a pending wakeup.
        let _ = self.poke_tx.try_send(());
    }
}

pub struct Dispatcher {
    handle: DispatcherHandle,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawn the poller and shard workers. They run until `parent` (or
    /// `shutdown`) cancels them.
    pub fn spawn<D: Database + 'static>(
        config: &CoreConfig,
        db: Arc<D>,
        resolver: KeyResolver,
        cache: Arc<MessageDataCache>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
        parent: &CancellationToken,
    ) -> Self {
        let token = parent.child_token();
        let shards = config.dispatcher_shards.max(1);
        let (poke_tx, poke_rx) = mpsc::channel(1);

        let mut shard_txs = Vec::with_capacity(shards);
        let mut tasks = Vec::with_capacity(shards + 1);
        for shard in 0..shards {
            let (tx, rx) = mpsc::channel(config.channel_bound.max(1));
            shard_txs.push(tx);
            let ctx = ShardCtx {
                db: db.clone(),
                resolver: resolver.clone(),
                cache: cache.clone(),
                bus: bus.clone(),
                clock: clock.clone(),
                retry: Retrier::new(config.retry.clone()),
                token: token.clone(),
                stall_timeout: Duration::from_millis(config.topic_stall_timeout_ms),
            };
            tasks.push(tokio::spawn(shard_worker(shard, ctx, rx)));
        }

        tasks.push(tokio::spawn(poller(
            db,
            shard_txs,
            poke_rx,
            token.clone(),
            config.poll_page_size.max(1),
            Duration::from_millis(config.poll_interval_ms.max(1)),
        )));

        let handle = DispatcherHandle { poke_tx };
        // Pick up pins persisted before this process started.
        handle.poke();
        Self { handle, token, tasks }
    }

    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    /// Stop the workers and wait for them to unwind.
    pub async fn shutdown(self) {
        self.token.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

fn shard_of(context: &Hash, shards: usize) -> usize {
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&context.as_bytes()[..8]);
    (u64::from_be_bytes(prefix) % shards as u64) as usize
}

/// Scan pins in sequence order and route undispatched ones to their
/// lane's shard. The cursor only moves forward; parked pins live in the
/// shard workers until their dependencies arrive.
async fn poller<D: Database>(
    db: Arc<D>,
    shard_txs: Vec<mpsc::Sender<ShardMsg>>,
    mut poke_rx: mpsc::Receiver<()>,
    token: CancellationToken,
    page_size: usize,
    interval: Duration,
) {
    let shards = shard_txs.len();
    let mut cursor = 0u64;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            poke = poke_rx.recv() => {
                if poke.is_none() {
                    break;
                }
                // Coalesce any pokes that queued up behind this one.
                while poke_rx.try_recv().is_ok() {}
            }
            _ = tokio::time::sleep(interval) => {}
        }

        loop {
            let page = match db.list_pins_after(cursor, page_size).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(%err, "failed to scan pins, will retry on next sweep");
                    break;
                }
            };
            let full = page.len() == page_size;
            for pin in page {
                cursor = cursor.max(pin.sequence);
                if pin.dispatched {
                    continue;
                }
                let shard = shard_of(&pin.hash, shards);
                tokio::select! {
                    _ = token.cancelled() => return,
                    sent = shard_txs[shard].send(ShardMsg::Pin(pin)) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            if !full {
                break;
            }
        }

        for tx in &shard_txs {
            let _ = tx.try_send(ShardMsg::Sweep);
        }
    }
}

/// One worker drains every lane that hashes to its shard.
async fn shard_worker<D: Database>(shard: usize, ctx: ShardCtx<D>, mut rx: mpsc::Receiver<ShardMsg>) {
    let mut lanes: HashMap<Hash, Lane> = HashMap::new();
    debug!(shard, "dispatch worker started");
    loop {
        let msg = tokio::select! {
            _ = ctx.token.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        match msg {
            ShardMsg::Pin(pin) => {
                let lane = lanes.entry(pin.hash).or_insert_with(Lane::new);
                lane.queue.insert(pin.sequence, pin.clone());
                drain_lane(&ctx, &pin.hash, lane).await;
            }
            ShardMsg::Sweep => {
                for (context, lane) in lanes.iter_mut() {
                    if ctx.token.is_cancelled() {
                        return;
                    }
                    if !lane.queue.is_empty() {
                        drain_lane(&ctx, context, lane).await;
                    }
                }
            }
        }
        lanes.retain(|_, lane| !lane.queue.is_empty());
    }
    debug!(shard, "dispatch worker stopped");
}

/// Advance a lane head by head until it stalls or empties.
async fn drain_lane<D: Database>(ctx: &ShardCtx<D>, context: &Hash, lane: &mut Lane) {
    loop {
        if ctx.token.is_cancelled() {
            return;
        }
        let Some((sequence, pin)) = lane.queue.iter().next().map(|(s, p)| (*s, p.clone())) else {
            lane.clear_stall();
            return;
        };

        match evaluate(ctx, &pin).await {
            Ok(Disposition::AlreadyDispatched) => {
                lane.queue.remove(&sequence);
                lane.clear_stall();
            }
            Ok(Disposition::Dispatch { message, topic, topic_indices }) => {
                let committed = ctx
                    .retry
                    .run(&ctx.token, "dispatch-commit", || {
                        commit_dispatch(ctx, &pin, &message, &topic, &topic_indices)
                    })
                    .await;
                match committed {
                    Ok(()) => {
                        lane.queue.remove(&sequence);
                        lane.clear_stall();
                    }
                    Err(PipelineError::Cancelled) => return,
                    Err(err) => {
                        error!(%err, sequence, "failed to commit dispatch, leaving pin queued");
                        return;
                    }
                }
            }
            Ok(Disposition::Reject { message }) => {
                let committed = ctx
                    .retry
                    .run(&ctx.token, "dispatch-reject", || commit_reject(ctx, &pin, message))
                    .await;
                match committed {
                    Ok(()) => {
                        lane.queue.remove(&sequence);
                        lane.clear_stall();
                    }
                    Err(PipelineError::Cancelled) => return,
                    Err(err) => {
                        error!(%err, sequence, "failed to commit rejection, leaving pin queued");
                        return;
                    }
                }
            }
            Ok(Disposition::Stall { reason }) => {
                lane.note_stall(context, reason, ctx.stall_timeout);
                return;
            }
            Err(err) if err.is_transient() => {
                debug!(%err, sequence, "transient failure evaluating pin, will retry on next sweep");
                return;
            }
            Err(err) => {
                error!(%err, sequence, "unexpected failure evaluating pin");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_of_stable_and_bounded() {
        let h1 = Hash::of(b"ns1:topic1");
        let h2 = Hash::of(b"ns1:topic2");
        assert_eq!(shard_of(&h1, 4), shard_of(&h1, 4));
        assert!(shard_of(&h1, 4) < 4);
        assert!(shard_of(&h2, 1) == 0);
    }
}
