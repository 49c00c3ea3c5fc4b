//! Per-chain listener session.
//!
//! Ties a [`TipTracker`], a [`BlockCursor`] and a [`ReceiptDispatcher`]
//! together, keeps the `(block, tx)` position and forwards receipts, blocks
//! and errors downstream. Only the session task writes the position; readers
//! go through atomics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use txlistener_core::{
    Block, ChainId, ChainReader, ListenerConfig, ListenerError, Position, Progress, Receipt,
};

use crate::cursor::{BlockCursor, CursorHandle};
use crate::dispatcher::ReceiptDispatcher;
use crate::tracker::TipTracker;

/// Called with the chain id once the session has fully stopped.
pub type OnExit = Box<dyn FnOnce(ChainId) + Send + 'static>;

// ─── Position cell ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct PositionCell {
    block_number: AtomicU64,
    tx_index: AtomicU64,
}

impl PositionCell {
    fn new(position: Position) -> Self {
        Self {
            block_number: AtomicU64::new(position.block_number),
            tx_index: AtomicU64::new(position.tx_index),
        }
    }

    fn load(&self) -> Position {
        Position::new(
            self.block_number.load(Ordering::SeqCst),
            self.tx_index.load(Ordering::SeqCst),
        )
    }

    fn advance_tx(&self) {
        self.tx_index.fetch_add(1, Ordering::SeqCst);
    }

    fn next_block(&self, block_number: u64) {
        self.tx_index.store(0, Ordering::SeqCst);
        self.block_number.store(block_number, Ordering::SeqCst);
    }
}

// ─── Outputs ──────────────────────────────────────────────────────────────────

/// One item produced by a chain listener, in emission order.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    Block(Block),
    Receipt(Receipt),
    Error(ListenerError),
}

/// Receiving side of a standalone chain listener.
///
/// Each channel closes exactly once, when the session stops. `blocks` and
/// `errors` only carry items when enabled in [`ReturnConfig`](txlistener_core::ReturnConfig).
pub struct ChainOutputs {
    pub receipts: mpsc::Receiver<Receipt>,
    pub blocks: mpsc::Receiver<Block>,
    pub errors: mpsc::Receiver<ListenerError>,
}

/// Sending side of a session.
#[derive(Clone)]
pub(crate) enum Sink {
    /// Separate channels; several sessions may share clones (fan-in).
    Split {
        receipts: mpsc::Sender<Receipt>,
        blocks: mpsc::Sender<Block>,
        errors: mpsc::Sender<ListenerError>,
    },
    /// One ordered channel per chain.
    Events(mpsc::Sender<ChainEvent>),
}

impl Sink {
    pub(crate) fn split(capacity: usize) -> (Self, ChainOutputs) {
        let (receipts_tx, receipts) = mpsc::channel(capacity);
        let (blocks_tx, blocks) = mpsc::channel(capacity);
        let (errors_tx, errors) = mpsc::channel(capacity);
        let sink = Self::Split {
            receipts: receipts_tx,
            blocks: blocks_tx,
            errors: errors_tx,
        };
        (
            sink,
            ChainOutputs {
                receipts,
                blocks,
                errors,
            },
        )
    }

    async fn receipt(&self, receipt: Receipt) -> bool {
        match self {
            Self::Split { receipts, .. } => receipts.send(receipt).await.is_ok(),
            Self::Events(events) => events.send(ChainEvent::Receipt(receipt)).await.is_ok(),
        }
    }

    async fn block(&self, block: Block) -> bool {
        match self {
            Self::Split { blocks, .. } => blocks.send(block).await.is_ok(),
            Self::Events(events) => events.send(ChainEvent::Block(block)).await.is_ok(),
        }
    }

    async fn error(&self, error: ListenerError) -> bool {
        match self {
            Self::Split { errors, .. } => errors.send(error).await.is_ok(),
            Self::Events(events) => events.send(ChainEvent::Error(error)).await.is_ok(),
        }
    }
}

// ─── ChainListener ────────────────────────────────────────────────────────────

/// Handle to a running chain session.
///
/// Cheap to clone. Dropping handles does not stop the session; call
/// [`close`](Self::close).
#[derive(Clone)]
pub struct ChainListener {
    chain_id: ChainId,
    initial: Position,
    position: Arc<PositionCell>,
    tracker: TipTracker,
    cancel: CancellationToken,
}

impl ChainListener {
    pub fn builder(chain_id: ChainId, reader: Arc<dyn ChainReader>) -> ChainListenerBuilder {
        ChainListenerBuilder {
            chain_id,
            reader,
            config: ListenerConfig::default(),
            start: Position::genesis(),
            cancel: None,
            tasks: None,
            on_exit: None,
        }
    }

    pub fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    /// Where the session started.
    pub fn initial_position(&self) -> Position {
        self.initial
    }

    /// Next `(block, tx)` the session will emit.
    pub fn position(&self) -> Position {
        self.position.load()
    }

    /// Current position plus a fresh safe-head read. Never blocks the session.
    pub async fn progress(&self) -> Progress {
        let position = self.position.load();
        let highest_block = match self.tracker.highest_block().await {
            Ok(head) => Some(head),
            Err(e) => {
                tracing::debug!(chain_id = %self.chain_id, error = %e, "Progress without tip");
                None
            }
        };
        Progress {
            current_block: position.block_number,
            tx_index: position.tx_index,
            highest_block,
        }
    }

    /// Ask the session to stop. Idempotent; outputs close once it has exited.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Configures and spawns a [`ChainListener`].
pub struct ChainListenerBuilder {
    chain_id: ChainId,
    reader: Arc<dyn ChainReader>,
    config: ListenerConfig,
    start: Position,
    cancel: Option<CancellationToken>,
    tasks: Option<TaskTracker>,
    on_exit: Option<OnExit>,
}

impl ChainListenerBuilder {
    pub fn config(mut self, config: ListenerConfig) -> Self {
        self.config = config;
        self
    }

    /// Resolved starting position (default: genesis).
    pub fn start_at(mut self, start: Position) -> Self {
        self.start = start;
        self
    }

    /// Stop when `parent` is cancelled.
    pub fn cancellation(mut self, parent: &CancellationToken) -> Self {
        self.cancel = Some(parent.child_token());
        self
    }

    /// Spawn the session task on `tasks`.
    pub fn tracker(mut self, tasks: TaskTracker) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn on_exit(mut self, f: impl FnOnce(ChainId) + Send + 'static) -> Self {
        self.on_exit = Some(Box::new(f));
        self
    }

    /// Spawn with private output channels.
    pub fn spawn(self) -> (ChainListener, ChainOutputs) {
        let (sink, outputs) = Sink::split(1);
        (self.spawn_into(sink), outputs)
    }

    /// Spawn with a single ordered event channel.
    pub fn spawn_events(self) -> (ChainListener, mpsc::Receiver<ChainEvent>) {
        let (tx, rx) = mpsc::channel(1);
        (self.spawn_into(Sink::Events(tx)), rx)
    }

    pub(crate) fn spawn_into(self, sink: Sink) -> ChainListener {
        let cancel = self.cancel.unwrap_or_default();
        let tracker = TipTracker::new(self.chain_id, self.reader.clone(), &self.config.tracker);
        let position = Arc::new(PositionCell::new(self.start));

        let handle = ChainListener {
            chain_id: self.chain_id,
            initial: self.start,
            position: position.clone(),
            tracker: tracker.clone(),
            cancel: cancel.clone(),
        };

        let session = Session {
            chain_id: self.chain_id,
            dispatcher: ReceiptDispatcher::new(
                self.chain_id,
                self.reader.clone(),
                self.config.block.fetch_limit(),
            ),
            reader: self.reader,
            tracker,
            config: self.config,
            position,
            next_block_out: AtomicU64::new(self.start.block_number),
            sink,
            cancel,
        };
        let on_exit = self.on_exit;
        let run = async move {
            let chain_id = session.chain_id;
            session.run().await;
            if let Some(on_exit) = on_exit {
                on_exit(chain_id);
            }
        };
        match self.tasks {
            Some(tasks) => {
                tasks.spawn(run);
            }
            None => {
                tokio::spawn(run);
            }
        }
        handle
    }
}

// ─── Session ──────────────────────────────────────────────────────────────────

enum Stop {
    /// Cancelled, or the consumer went away.
    Closed,
    Failed(ListenerError),
}

struct Session {
    chain_id: ChainId,
    reader: Arc<dyn ChainReader>,
    tracker: TipTracker,
    dispatcher: ReceiptDispatcher,
    config: ListenerConfig,
    position: Arc<PositionCell>,
    /// Lowest block number not yet forwarded on the blocks output.
    next_block_out: AtomicU64,
    sink: Sink,
    cancel: CancellationToken,
}

impl Session {
    fn start_cursor(&self) -> CursorHandle {
        let mut cursor = BlockCursor::new(self.reader.clone(), self.tracker.clone(), &self.config.block);
        cursor.set(self.position.load().block_number);
        cursor.start(self.cancel.child_token())
    }

    async fn run(self) {
        let start = self.position.load();
        tracing::info!(
            chain_id = %self.chain_id,
            block = start.block_number,
            tx_index = start.tx_index,
            depth = self.tracker.depth(),
            "Listening chain"
        );

        let mut cursor = self.start_cursor();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                block = cursor.blocks.recv() => block,
            };

            let outcome = match next {
                Some(block) => self.process_block(block).await,
                // The cursor stopped: an error is waiting, or we were cancelled.
                None => match cursor.errors.recv().await {
                    Some(err) => Err(Stop::Failed(err)),
                    None => Err(Stop::Closed),
                },
            };

            match outcome {
                Ok(()) => {}
                Err(Stop::Closed) => break,
                Err(Stop::Failed(err)) => {
                    cursor.shutdown().await;
                    if !self.recover(err).await {
                        break;
                    }
                    cursor = self.start_cursor();
                }
            }
        }

        self.cancel.cancel();
        cursor.shutdown().await;
        self.dispatcher.tracker().close();
        self.dispatcher.tracker().wait().await;

        let end = self.position.load();
        tracing::info!(
            chain_id = %self.chain_id,
            block = end.block_number,
            tx_index = end.tx_index,
            "Stopped listening chain"
        );
    }

    /// Emit `block` and its receipts from the stored tx index on.
    async fn process_block(&self, block: Block) -> Result<(), Stop> {
        let number = block.number();

        // A cursor restarted mid-block hands the same block over again.
        if self.config.returns.blocks && number >= self.next_block_out.load(Ordering::SeqCst) {
            let sent = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => false,
                sent = self.sink.block(block.clone()) => sent,
            };
            if !sent {
                return Err(Stop::Closed);
            }
            self.next_block_out.store(number + 1, Ordering::SeqCst);
        }

        let from = self.position.load().tx_index;
        if from < block.tx_count() as u64 {
            let mut receipts = self.dispatcher.dispatch(&block, from, &self.cancel);
            loop {
                let next = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(Stop::Closed),
                    next = receipts.next() => next,
                };
                let receipt = match next {
                    None => break,
                    Some(Ok(receipt)) => receipt,
                    Some(Err(err)) => return Err(Stop::Failed(err)),
                };
                let sent = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => false,
                    sent = self.sink.receipt(receipt) => sent,
                };
                if !sent {
                    return Err(Stop::Closed);
                }
                self.position.advance_tx();
            }

            // The stream ended without every receipt: it was cut short.
            if self.position.load().tx_index < block.tx_count() as u64 {
                return Err(Stop::Closed);
            }
        }

        self.position.next_block(number + 1);
        tracing::debug!(chain_id = %self.chain_id, block = number, txs = block.tx_count(), "Block done");
        Ok(())
    }

    /// Surface `err` and decide whether to keep running.
    async fn recover(&self, err: ListenerError) -> bool {
        if !self.config.returns.errors {
            tracing::error!(chain_id = %self.chain_id, error = %err, "Chain listener failed");
            return false;
        }

        tracing::warn!(chain_id = %self.chain_id, error = %err, "Chain listener error");
        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.sink.error(err) => sent,
        };
        if !sent {
            return false;
        }

        // Restart from the current position after one interval.
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.block.poll_interval()) => true,
        }
    }
}
