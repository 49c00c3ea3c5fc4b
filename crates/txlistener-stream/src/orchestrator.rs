//! `TxListener`: owns one [`ChainListener`] per tracked chain.
//!
//! Two ways to consume:
//! - [`listen`](TxListener::listen): chains write into the shared
//!   [`TxListenerOutputs`] channels. Order is kept per chain; interleaving
//!   across chains is unspecified.
//! - [`listen_with`](TxListener::listen_with): one consumer task per chain
//!   drives a [`ListenerHandler`] and the call blocks until every chain
//!   stopped.
//!
//! Shutdown converges on a single idempotent path: explicit [`close`],
//! cancellation of the root token, and the last chain exiting on its own all
//! cancel the sessions and drop the shared senders. The output channels close
//! once every session has exited.
//!
//! [`close`]: TxListener::close

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use futures::future::{join_all, try_join_all};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use txlistener_core::{
    Block, ChainId, ChainReader, ListenerConfig, ListenerError, Position, PositionResolver,
    Progress, Receipt, StartPosition, StartPositions, TxListenerError,
};

use crate::handler::ListenerHandler;
use crate::listener::{ChainEvent, ChainListener, Sink};
use crate::tracker::TipTracker;

/// Aggregate output channels of a [`TxListener`].
pub struct TxListenerOutputs {
    pub receipts: mpsc::Receiver<Receipt>,
    pub blocks: mpsc::Receiver<Block>,
    pub errors: mpsc::Receiver<ListenerError>,
}

enum Wiring {
    FanIn,
    Events,
}

struct Inner {
    config: ListenerConfig,
    starts: StartPositions,
    reader: Arc<dyn ChainReader>,
    resolver: Option<Arc<dyn PositionResolver>>,
    listeners: RwLock<HashMap<ChainId, ChainListener>>,
    /// Master copy of the shared senders; `None` once closed.
    sinks: Mutex<Option<Sink>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Inner {
    fn unregister(&self, chain_id: &ChainId) {
        let empty = {
            let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
            listeners.remove(chain_id);
            listeners.is_empty()
        };
        tracing::debug!(chain_id = %chain_id, "Chain listener unregistered");
        if empty {
            self.shutdown();
        }
    }

    fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        let taken = self
            .sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if taken.is_some() {
            tracing::info!("Closing tx-listener");
        }
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
            || self
                .sinks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_none()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Multi-chain orchestrator.
pub struct TxListener {
    inner: Arc<Inner>,
}

impl TxListener {
    /// Build a listener and its aggregate output channels.
    ///
    /// `resolver` answers `oldest` start positions; without one they start at
    /// genesis.
    pub fn new(
        config: ListenerConfig,
        reader: Arc<dyn ChainReader>,
        resolver: Option<Arc<dyn PositionResolver>>,
    ) -> Result<(Self, TxListenerOutputs), TxListenerError> {
        config.validate()?;
        let starts = config.start.parse()?;
        let (sink, outputs) = Sink::split(1);

        let inner = Inner {
            config,
            starts,
            reader,
            resolver,
            listeners: RwLock::new(HashMap::new()),
            sinks: Mutex::new(Some(sink)),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        };
        let outputs = TxListenerOutputs {
            receipts: outputs.receipts,
            blocks: outputs.blocks,
            errors: outputs.errors,
        };
        Ok((
            Self {
                inner: Arc::new(inner),
            },
            outputs,
        ))
    }

    /// Root token; cancelling it shuts the listener down like [`close`](Self::close).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Start tailing `chains` into the aggregate outputs. Returns once every
    /// chain is registered.
    ///
    /// Fails without starting anything if one chain is already listened.
    pub async fn listen(&self, chains: &[ChainId]) -> Result<(), TxListenerError> {
        let plan = self.plan_configured(chains).await?;
        self.register(&plan, Wiring::FanIn)?;
        Ok(())
    }

    /// Start tailing one chain from an explicit position.
    pub async fn listen_chain(
        &self,
        chain_id: ChainId,
        start: StartPosition,
    ) -> Result<(), TxListenerError> {
        self.check_available(&[chain_id])?;
        let position = self.resolve(chain_id, start).await?;
        self.register(&[(chain_id, position)], Wiring::FanIn)?;
        Ok(())
    }

    /// Tail `chains` and drive `handler` until every chain stopped.
    ///
    /// Returns the first handler error, after `cleanup` ran.
    pub async fn listen_with(
        &self,
        chains: &[ChainId],
        handler: Arc<dyn ListenerHandler>,
    ) -> Result<(), TxListenerError> {
        let plan = self.plan_configured(chains).await?;
        handler.setup(chains).await?;

        let events = match self.register(&plan, Wiring::Events) {
            Ok(events) => events,
            Err(e) => {
                handler.cleanup().await;
                return Err(e);
            }
        };

        let consumers = plan.iter().zip(events).map(|(&(chain_id, _), events)| {
            let handler = handler.clone();
            let listener = self.listener(&chain_id);
            tokio::spawn(consume(chain_id, events, handler, listener))
        });
        let results = join_all(consumers).await;
        handler.cleanup().await;

        let mut first_error = None;
        for (result, &(chain_id, _)) in results.into_iter().zip(&plan) {
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => Err(TxListenerError::handler(chain_id, e.to_string())),
            };
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Registered chains, sorted.
    pub fn chains(&self) -> Vec<ChainId> {
        let mut chains: Vec<ChainId> = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        chains.sort();
        chains
    }

    pub fn is_listening(&self, chain_id: &ChainId) -> bool {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(chain_id)
    }

    /// Progress snapshot of every registered chain.
    pub async fn progress(&self) -> HashMap<ChainId, Progress> {
        let listeners: Vec<ChainListener> = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let snapshots = join_all(listeners.iter().map(|l| l.progress())).await;
        listeners
            .iter()
            .map(|l| *l.chain_id())
            .zip(snapshots)
            .collect()
    }

    /// Stop one chain. Returns `false` if it was not registered.
    pub fn close_chain(&self, chain_id: &ChainId) -> bool {
        match self.listener(chain_id) {
            Some(listener) => {
                listener.close();
                true
            }
            None => false,
        }
    }

    /// Stop every chain and wait until all sessions exited. Idempotent and
    /// safe to call concurrently.
    pub async fn close(&self) {
        self.inner.shutdown();
        self.inner.tasks.wait().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn listener(&self, chain_id: &ChainId) -> Option<ChainListener> {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(chain_id)
            .cloned()
    }

    fn check_available(&self, chains: &[ChainId]) -> Result<(), TxListenerError> {
        if self.inner.is_closed() {
            return Err(TxListenerError::Closed);
        }
        let listeners = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut seen = HashSet::new();
        for chain_id in chains {
            if listeners.contains_key(chain_id) || !seen.insert(*chain_id) {
                return Err(TxListenerError::AlreadyListening(*chain_id));
            }
        }
        Ok(())
    }

    /// Resolve the configured start of every chain, concurrently.
    async fn plan_configured(
        &self,
        chains: &[ChainId],
    ) -> Result<Vec<(ChainId, Position)>, TxListenerError> {
        self.check_available(chains)?;
        try_join_all(chains.iter().map(|&chain_id| async move {
            let start = self.inner.starts.for_chain(&chain_id);
            let position = self.resolve(chain_id, start).await?;
            Ok::<_, TxListenerError>((chain_id, position))
        }))
        .await
    }

    async fn resolve(
        &self,
        chain_id: ChainId,
        start: StartPosition,
    ) -> Result<Position, TxListenerError> {
        let resolution = |source| TxListenerError::PositionResolution { chain_id, source };
        let position = match start {
            StartPosition::At(position) => position,
            StartPosition::Latest => {
                let tracker = TipTracker::new(chain_id, self.inner.reader.clone(), &self.inner.config.tracker);
                Position::new(tracker.highest_block().await.map_err(resolution)?, 0)
            }
            StartPosition::Oldest => match &self.inner.resolver {
                Some(resolver) => resolver
                    .last_known_position(&chain_id)
                    .await
                    .map_err(resolution)?
                    .map(Position::next_tx)
                    .unwrap_or_default(),
                None => Position::genesis(),
            },
        };
        tracing::debug!(chain_id = %chain_id, start = %start, position = %position, "Resolved start position");
        Ok(position)
    }

    /// Register and spawn every planned chain, or none of them.
    fn register(
        &self,
        plan: &[(ChainId, Position)],
        wiring: Wiring,
    ) -> Result<Vec<mpsc::Receiver<ChainEvent>>, TxListenerError> {
        let sinks = self
            .inner
            .sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let aggregate = match sinks.as_ref() {
            Some(sink) if !self.inner.cancel.is_cancelled() => sink,
            _ => return Err(TxListenerError::Closed),
        };

        let mut listeners = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut seen = HashSet::new();
        for (chain_id, _) in plan {
            if listeners.contains_key(chain_id) || !seen.insert(*chain_id) {
                return Err(TxListenerError::AlreadyListening(*chain_id));
            }
        }

        let mut events = Vec::new();
        for &(chain_id, start) in plan {
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            let builder = ChainListener::builder(chain_id, self.inner.reader.clone())
                .config(self.inner.config.clone())
                .start_at(start)
                .cancellation(&self.inner.cancel)
                .tracker(self.inner.tasks.clone())
                .on_exit(move |chain_id| {
                    if let Some(inner) = weak.upgrade() {
                        inner.unregister(&chain_id);
                    }
                });
            let listener = match wiring {
                Wiring::FanIn => builder.spawn_into(aggregate.clone()),
                Wiring::Events => {
                    let (listener, rx) = builder.spawn_events();
                    events.push(rx);
                    listener
                }
            };
            listeners.insert(chain_id, listener);
        }
        Ok(events)
    }
}

/// Feed one chain's events to `handler` until the chain stops.
async fn consume(
    chain_id: ChainId,
    mut events: mpsc::Receiver<ChainEvent>,
    handler: Arc<dyn ListenerHandler>,
    listener: Option<ChainListener>,
) -> Result<(), TxListenerError> {
    while let Some(event) = events.recv().await {
        let handled = match event {
            ChainEvent::Receipt(receipt) => handler.handle_receipt(receipt).await,
            ChainEvent::Block(block) => handler.handle_block(block).await,
            ChainEvent::Error(error) => handler.handle_error(error).await,
        };
        if let Err(e) = handled {
            tracing::error!(chain_id = %chain_id, error = %e, "Handler failed, stopping chain");
            if let Some(listener) = &listener {
                listener.close();
            }
            return Err(e);
        }
    }
    Ok(())
}
