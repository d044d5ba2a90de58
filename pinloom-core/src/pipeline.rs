//! Pipeline wiring
//!
//! Builds the aggregator, dispatcher and intake worker around a store and
//! the collaborator adapters, and owns their shutdown.

use crate::aggregator::Aggregator;
use crate::bus::EventBus;
use crate::cache::{IdentityCache, KeyResolver, MessageDataCache};
use crate::config::CoreConfig;
use crate::dispatch::Dispatcher;
use crate::listener::{spawn_listener, PinDelivery};
use pinloom_model::{Clock, Database, IdentityResolver, SharedStorage, UserEvent};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Pipeline<D> {
    aggregator: Arc<Aggregator<D>>,
    dispatcher: Dispatcher,
    intake_tx: mpsc::Sender<PinDelivery>,
    intake_task: JoinHandle<()>,
    bus: EventBus,
    identities: Arc<IdentityCache>,
    token: CancellationToken,
}

impl<D: Database + 'static> Pipeline<D> {
    /// Start the pipeline. The returned handle owns the workers; callers
    /// feed pin events through `intake` and observe results via
    /// `subscribe`.
    pub fn start(
        config: CoreConfig,
        db: Arc<D>,
        storage: Arc<dyn SharedStorage>,
        identity: Arc<dyn IdentityResolver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let token = CancellationToken::new();
        let bus = EventBus::new(config.channel_bound.max(16));
        let identities = Arc::new(IdentityCache::new());
        let resolver = KeyResolver::new(identities.clone(), identity);
        let data_cache = Arc::new(MessageDataCache::new(config.data_cache_entries));

        let dispatcher = Dispatcher::spawn(
            &config,
            db.clone(),
            resolver.clone(),
            data_cache.clone(),
            bus.clone(),
            clock.clone(),
            &token,
        );

        let aggregator = Arc::new(Aggregator::new(
            config.clone(),
            db,
            storage,
            resolver,
            clock,
            bus.clone(),
            dispatcher.handle(),
            data_cache,
        ));

        let (intake_tx, intake_rx) = mpsc::channel(config.channel_bound.max(1));
        let intake_task = spawn_listener(aggregator.clone(), intake_rx, token.clone());

        Self { aggregator, dispatcher, intake_tx, intake_task, bus, identities, token }
    }

    /// Sender the ledger adapter pushes pin events into.
    pub fn intake(&self) -> mpsc::Sender<PinDelivery> {
        self.intake_tx.clone()
    }

    /// Subscribe to user events.
    pub fn subscribe(&self) -> broadcast::Receiver<UserEvent> {
        self.bus.subscribe()
    }

    /// Direct access to the aggregator, mainly for tests driving pins
    /// without the intake channel.
    pub fn aggregator(&self) -> Arc<Aggregator<D>> {
        self.aggregator.clone()
    }

    /// Drop cached identity resolutions for a namespace, forcing fresh
    /// lookups after identities changed.
    pub fn invalidate_identities(&self, namespace: &str) {
        self.identities.invalidate_namespace(namespace);
    }

    /// Cancel everything and wait for the workers to unwind.
    pub async fn shutdown(self) {
        self.token.cancel();
        drop(self.intake_tx);
        let _ = self.intake_task.await;
        self.dispatcher.shutdown().await;
    }
}
