//! Block cursor: a gap-free, self-paced stream of safe blocks for one chain.
//!
//! # Loop
//! 1. If `next` is above the cached safe head, refresh it from the tip tracker.
//! 2. Still above: sleep for the idle delay (doubles up to `max_poll_backoff`).
//! 3. Otherwise fetch block `next`; missing blocks are waited for like step 2.
//! 4. Send the block downstream (blocks while the consumer is busy), advance
//!    `next`, reset the idle delay and re-check right away so a backlog of
//!    mined blocks drains without waiting a full interval.
//!
//! A reader error is sent on the errors channel and ends the cursor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use txlistener_core::{Block, BlockConfig, ChainId, ChainReader, ListenerError};

use crate::tracker::TipTracker;

/// Sequential block reader for one chain.
pub struct BlockCursor {
    reader: Arc<dyn ChainReader>,
    tracker: TipTracker,
    /// Next block to emit.
    next: u64,
    /// Last known safe head; `None` until first read.
    safe_head: Option<u64>,
    poll_interval: Duration,
    max_poll_backoff: Duration,
}

impl BlockCursor {
    pub fn new(reader: Arc<dyn ChainReader>, tracker: TipTracker, config: &BlockConfig) -> Self {
        Self {
            reader,
            tracker,
            next: 0,
            safe_head: None,
            poll_interval: config.poll_interval(),
            max_poll_backoff: config.max_poll_backoff().max(config.poll_interval()),
        }
    }

    pub fn chain_id(&self) -> &ChainId {
        self.tracker.chain_id()
    }

    /// Re-point the cursor at `block_number`.
    ///
    /// Only possible before [`start`](Self::start), which consumes the cursor.
    pub fn set(&mut self, block_number: u64) {
        self.next = block_number;
    }

    /// The next block number the cursor will emit.
    pub fn position(&self) -> u64 {
        self.next
    }

    /// One step of the loop: the next block if it is safe and mined.
    ///
    /// `Ok(None)` means "not available yet"; the position is unchanged.
    pub async fn next(&mut self) -> Result<Option<Block>, ListenerError> {
        if self.safe_head.map_or(true, |head| self.next > head) {
            let head = self
                .tracker
                .highest_block()
                .await
                .map_err(|source| ListenerError::Tip {
                    chain_id: *self.chain_id(),
                    source,
                })?;
            self.safe_head = Some(head);
            if self.next > head {
                return Ok(None);
            }
        }

        let fetched = self
            .reader
            .block_by_number(self.chain_id(), self.next)
            .await
            .map_err(|source| ListenerError::BlockFetch {
                chain_id: *self.chain_id(),
                block_number: self.next,
                source,
            })?;

        match fetched {
            Some(block) => {
                self.next += 1;
                Ok(Some(block))
            }
            None => {
                tracing::trace!(
                    chain_id = %self.chain_id(),
                    block = self.next,
                    "Safe block not served by node yet"
                );
                Ok(None)
            }
        }
    }

    /// Spawn the polling loop. The loop stops when `cancel` fires, when the
    /// blocks receiver is dropped, or after the first reader error.
    ///
    /// `cancel` is cancelled when the returned handle is dropped; pass a child
    /// token when it is shared.
    pub fn start(self, cancel: CancellationToken) -> CursorHandle {
        let (blocks_tx, blocks) = mpsc::channel(1);
        let (errors_tx, errors) = mpsc::channel(1);
        let task = tokio::spawn(self.run(blocks_tx, errors_tx, cancel.clone()));
        CursorHandle {
            blocks,
            errors,
            cancel,
            task: Some(task),
        }
    }

    async fn run(
        mut self,
        blocks: mpsc::Sender<Block>,
        errors: mpsc::Sender<ListenerError>,
        cancel: CancellationToken,
    ) {
        let chain_id = *self.chain_id();
        tracing::debug!(chain_id = %chain_id, from = self.next, "Block cursor started");

        let mut idle_delay = self.poll_interval;
        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                step = self.next() => step,
            };

            match step {
                Ok(Some(block)) => {
                    let number = block.number();
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        sent = blocks.send(block) => if sent.is_err() { break },
                    }
                    tracing::trace!(chain_id = %chain_id, block = number, "Block emitted");
                    idle_delay = self.poll_interval;
                }
                Ok(None) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(idle_delay) => {}
                    }
                    idle_delay = (idle_delay * 2).min(self.max_poll_backoff);
                }
                Err(err) => {
                    tracing::debug!(chain_id = %chain_id, error = %err, "Block cursor failed");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {}
                        _ = errors.send(err) => {}
                    }
                    break;
                }
            }
        }

        tracing::debug!(chain_id = %chain_id, next = self.next, "Block cursor stopped");
    }
}

/// A running cursor. Both channels close once, when the loop exits.
pub struct CursorHandle {
    pub blocks: mpsc::Receiver<Block>,
    pub errors: mpsc::Receiver<ListenerError>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl CursorHandle {
    /// Ask the loop to stop at its next suspension point. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Close and wait for the loop to exit.
    pub async fn shutdown(&mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Block cursor task panicked");
            }
        }
    }
}

impl Drop for CursorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
