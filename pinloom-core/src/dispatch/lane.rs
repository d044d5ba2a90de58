//! Per-topic lane state and pin readiness
//!
//! A lane is the single-writer queue for one ordering context. Pins wait
//! in sequence order; the head is evaluated against the full readiness
//! predicate and either dispatched, rejected, or left to stall until a
//! dependency arrives. Nothing is ever skipped or reordered.

use crate::bus::EventBus;
use crate::cache::{KeyResolver, MessageDataCache};
use crate::error::PipelineError;
use crate::retry::Retrier;
use pinloom_model::{
    context_hash, run_as_group, Batch, Clock, Data, Database, Message, MessageState, PinRecord,
    StoreError, UserEvent, UserEventType,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

/// Everything a shard worker needs to evaluate and commit pins.
pub(crate) struct ShardCtx<D> {
    pub db: Arc<D>,
    pub resolver: KeyResolver,
    pub cache: Arc<MessageDataCache>,
    pub bus: EventBus,
    pub clock: Arc<dyn Clock>,
    pub retry: Retrier,
    pub token: CancellationToken,
    pub stall_timeout: Duration,
}

/// Queue of undispatched pins for one ordering context.
pub(crate) struct Lane {
    pub queue: BTreeMap<u64, PinRecord>,
    stalled_since: Option<Instant>,
    stall_warned: bool,
}

impl Lane {
    pub fn new() -> Self {
        Self { queue: BTreeMap::new(), stalled_since: None, stall_warned: false }
    }

    /// The head made progress; forget any stall.
    pub fn clear_stall(&mut self) {
        self.stalled_since = None;
        self.stall_warned = false;
    }

    /// The head cannot advance. Log a warning once per stall episode when
    /// the wait exceeds the configured timeout; the lane keeps waiting
    /// regardless.
    pub fn note_stall(&mut self, context: &pinloom_model::Hash, reason: &str, timeout: Duration) {
        let since = *self.stalled_since.get_or_insert_with(Instant::now);
        if !self.stall_warned && since.elapsed() >= timeout {
            warn!(
                context = %context,
                reason,
                waited_ms = since.elapsed().as_millis() as u64,
                "topic blocked waiting for a dependency"
            );
            self.stall_warned = true;
        }
    }
}

/// Outcome of evaluating a lane head.
pub(crate) enum Disposition {
    /// The stored pin is already dispatched (a stale routing); drop it.
    AlreadyDispatched,
    /// All dependencies satisfied; commit and emit.
    Dispatch { message: Arc<Message>, topic: String, topic_indices: Vec<u32> },
    /// Terminally bad; durably flag and advance without an event.
    Reject { message: Option<Uuid> },
    /// A dependency is missing; hold the lane.
    Stall { reason: &'static str },
}

/// Locate the (message, topic) pair a pin's index points at: pins are laid
/// out over the batch's messages in order, one per topic.
pub(crate) fn flat_entry(batch: &Batch, index: u32) -> Option<(Uuid, String)> {
    let mut i = 0u32;
    for msg in &batch.payload.messages {
        for topic in &msg.header.topics {
            if i == index {
                return Some((msg.header.id, topic.clone()));
            }
            i += 1;
        }
    }
    None
}

/// Flat pin indices of every topic of the given message within its batch.
pub(crate) fn topic_indices(batch: &Batch, message_id: &Uuid) -> Vec<u32> {
    let mut indices = Vec::new();
    let mut i = 0u32;
    for msg in &batch.payload.messages {
        for _ in &msg.header.topics {
            if msg.header.id == *message_id {
                indices.push(i);
            }
            i += 1;
        }
    }
    indices
}

/// Full readiness predicate for a pin: the stored pin is still
/// undispatched, the batch and owning message are persisted and valid,
/// every referenced data item is present with a matching hash, and the
/// message's author identity claims its signing key.
pub(crate) async fn evaluate<D: Database>(
    ctx: &ShardCtx<D>,
    pin: &PinRecord,
) -> Result<Disposition, PipelineError> {
    match ctx.db.get_pin(&pin.batch, pin.index).await? {
        Some(stored) if stored.dispatched => return Ok(Disposition::AlreadyDispatched),
        Some(_) => {}
        None => return Ok(Disposition::Stall { reason: "pin not yet visible" }),
    }

    if pin.masked {
        return Ok(Disposition::Stall { reason: "private batch not yet delivered" });
    }

    let Some(batch) = ctx.db.get_batch(&pin.batch).await? else {
        return Ok(Disposition::Stall { reason: "batch not yet persisted" });
    };

    let Some((message_id, topic)) = flat_entry(&batch, pin.index) else {
        // The contexts on chain disagree with the batch shape; this can
        // only be a sender-side bug, and it can never heal.
        error!(batch_id = %pin.batch, index = pin.index, "pin index beyond the batch's topics");
        return Ok(Disposition::Reject { message: None });
    };

    if context_hash(&batch.header.namespace, &topic) != pin.hash {
        warn!(batch_id = %pin.batch, index = pin.index, topic, "pin context does not match the batch topic");
        return Ok(Disposition::Reject { message: None });
    }

    let (message, cached_data) = match ctx.cache.get(&message_id) {
        Some(entry) => (entry.message, Some(entry.data)),
        None => match ctx.db.get_message(&message_id).await? {
            Some(msg) => (Arc::new(msg), None),
            None => return Ok(Disposition::Stall { reason: "message not yet persisted" }),
        },
    };

    if message.local_state == MessageState::Rejected {
        return Ok(Disposition::Reject { message: Some(message_id) });
    }
    if !message.verify_hash() {
        warn!(%message_id, "persisted message no longer verifies");
        return Ok(Disposition::Reject { message: Some(message_id) });
    }

    for data_ref in &message.header.data_refs {
        let item: Option<Data> = match &cached_data {
            Some(data) => data.iter().find(|d| d.id == data_ref.id).cloned(),
            None => None,
        };
        let item = match item {
            Some(item) => Some(item),
            None => ctx.db.get_data(&data_ref.id).await?,
        };
        match item {
            None => return Ok(Disposition::Stall { reason: "data not yet persisted" }),
            Some(item) => {
                if item.hash != data_ref.hash || !item.verify_hash() {
                    warn!(%message_id, data_id = %data_ref.id, "referenced data does not verify");
                    return Ok(Disposition::Reject { message: Some(message_id) });
                }
            }
        }
    }

    match ctx
        .resolver
        .resolve(&message.header.namespace, &message.header.signer.key)
        .await?
    {
        Some(author) if author == message.header.signer.author => {}
        Some(author) => {
            warn!(%message_id, resolved = %author, claimed = %message.header.signer.author, "message author does not claim its signing key");
            return Ok(Disposition::Reject { message: Some(message_id) });
        }
        None => {
            warn!(%message_id, key = %message.header.signer.key, "no identity claims the message signing key");
            return Ok(Disposition::Reject { message: Some(message_id) });
        }
    }

    let topic_indices = topic_indices(&batch, &message_id);
    Ok(Disposition::Dispatch { message, topic, topic_indices })
}

/// Durably mark a pin dispatched. When it was the message's last
/// undispatched pin, confirm the message and emit its user event, all in
/// one group; the event reaches the bus only after the commit.
pub(crate) async fn commit_dispatch<D: Database>(
    ctx: &ShardCtx<D>,
    pin: &PinRecord,
    message: &Message,
    topic: &str,
    topic_indices: &[u32],
) -> Result<(), PipelineError> {
    let now = ctx.clock.now_ms();

    let event = run_as_group(ctx.db.as_ref(), async {
        ctx.db.set_pin_dispatched(pin.sequence, false).await?;

        // Checked inside the group: groups serialize, so for a message
        // pinned on several topics exactly one lane observes every other
        // pin already dispatched and emits the event.
        let mut last_pin = true;
        for index in topic_indices {
            if *index == pin.index {
                continue;
            }
            match ctx.db.get_pin(&pin.batch, *index).await? {
                Some(other) if other.dispatched => {}
                _ => {
                    last_pin = false;
                    break;
                }
            }
        }
        if !last_pin {
            return Ok::<_, PipelineError>(None);
        }
        ctx.db
            .set_message_state(&message.header.id, MessageState::Confirmed)
            .await?;
        let mut event = UserEvent {
            id: Uuid::new_v4(),
            event_type: UserEventType::MessageConfirmed,
            namespace: message.header.namespace.clone(),
            reference: message.header.id,
            topic: Some(topic.to_string()),
            sequence: 0,
            created: now,
        };
        ctx.db.insert_event(&mut event).await?;
        Ok(Some(event))
    })
    .await?;

    if let Some(event) = event {
        ctx.bus.publish(event);
    }
    Ok(())
}

/// Durably flag a terminally bad pin as dispatched+rejected, marking the
/// owning message rejected when there is one. No user event is emitted.
pub(crate) async fn commit_reject<D: Database>(
    ctx: &ShardCtx<D>,
    pin: &PinRecord,
    message: Option<Uuid>,
) -> Result<(), PipelineError> {
    run_as_group(ctx.db.as_ref(), async {
        ctx.db.set_pin_dispatched(pin.sequence, true).await?;
        if let Some(message_id) = message {
            match ctx.db.set_message_state(&message_id, MessageState::Rejected).await {
                Ok(()) => {}
                // Already settled, or rejected before it was stored.
                Err(StoreError::InvalidTransition { .. }) | Err(StoreError::NotFound) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok::<_, PipelineError>(())
    })
    .await
}
