//! Ordered receipt dispatcher.
//!
//! Fetches the receipts of a block's transactions concurrently and yields
//! them strictly in transaction order.
//!
//! ```text
//!  admit ──permit──► spawn fetch(i) ──► Slot{i, oneshot, permit} ──► queue (FIFO)
//!                                                                     │
//!  consumer ◄── Result<Receipt> ◄── drain: await slot i, then i+1 … ◄─┘
//! ```
//!
//! Every fetch holds a semaphore permit from before it is spawned until its
//! result has been handed to the consumer, so at most `limit` fetches are
//! started but not yet drained, whatever the block size. The first failed
//! slot is forwarded and ends the stream; fetches still running are aborted.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use txlistener_core::{Block, ChainId, ChainReader, ListenerError, ReadError, Receipt};

type SlotResult = Result<Receipt, ListenerError>;

/// A reserved place in the output order.
struct Slot {
    tx_index: u64,
    result: oneshot::Receiver<SlotResult>,
    _permit: OwnedSemaphorePermit,
}

/// Expands blocks into ordered receipt streams for one chain.
#[derive(Clone)]
pub struct ReceiptDispatcher {
    chain_id: ChainId,
    reader: Arc<dyn ChainReader>,
    limit: usize,
    tasks: TaskTracker,
}

impl ReceiptDispatcher {
    /// `limit` is clamped to at least 1.
    pub fn new(chain_id: ChainId, reader: Arc<dyn ChainReader>, limit: usize) -> Self {
        Self {
            chain_id,
            reader,
            limit: limit.max(1),
            tasks: TaskTracker::new(),
        }
    }

    /// Tracker owning every task this dispatcher spawned.
    pub fn tracker(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Fetch receipts of `block` for transactions `from..`, in order.
    ///
    /// The stream ends after the last receipt, after the first error, or when
    /// `cancel` fires. Dropping the stream aborts outstanding fetches.
    pub fn dispatch(&self, block: &Block, from: u64, cancel: &CancellationToken) -> ReceiptStream {
        let cancel = cancel.child_token();
        let (out_tx, out_rx) = mpsc::channel(1);
        let (queue_tx, queue_rx) = mpsc::channel(self.limit);
        let permits = Arc::new(Semaphore::new(self.limit));

        let pending: Vec<(u64, String)> = block
            .transactions
            .iter()
            .enumerate()
            .skip(from as usize)
            .map(|(index, tx)| (index as u64, tx.hash.clone()))
            .collect();

        tracing::trace!(
            chain_id = %self.chain_id,
            block = block.number(),
            from,
            count = pending.len(),
            "Dispatching receipt fetches"
        );

        self.tasks.spawn(self.clone().admit(
            block.number(),
            block.hash().to_string(),
            pending,
            permits,
            queue_tx,
            cancel.clone(),
        ));
        self.tasks.spawn(drain(
            self.chain_id,
            block.number(),
            queue_rx,
            out_tx,
            cancel.clone(),
        ));

        ReceiptStream {
            receipts: out_rx,
            cancel,
        }
    }

    /// Launch one fetch per transaction, each after obtaining a permit, and
    /// queue their slots in transaction order.
    async fn admit(
        self,
        block_number: u64,
        block_hash: String,
        pending: Vec<(u64, String)>,
        permits: Arc<Semaphore>,
        queue: mpsc::Sender<Slot>,
        cancel: CancellationToken,
    ) {
        for (tx_index, tx_hash) in pending {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            let (result_tx, result_rx) = oneshot::channel();
            self.tasks.spawn(fetch(
                self.chain_id,
                self.reader.clone(),
                block_number,
                block_hash.clone(),
                tx_index,
                tx_hash,
                result_tx,
                cancel.clone(),
            ));

            let slot = Slot {
                tx_index,
                result: result_rx,
                _permit: permit,
            };
            // Never blocks: the queue holds as many slots as there are permits.
            if queue.send(slot).await.is_err() {
                return;
            }
        }
    }
}

async fn fetch(
    chain_id: ChainId,
    reader: Arc<dyn ChainReader>,
    block_number: u64,
    block_hash: String,
    tx_index: u64,
    tx_hash: String,
    result: oneshot::Sender<SlotResult>,
    cancel: CancellationToken,
) {
    let fetched = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        fetched = reader.transaction_receipt(&chain_id, &tx_hash) => fetched,
    };

    let outcome = match fetched {
        Ok(Some(receipt)) => match misplaced(&receipt, block_number, &block_hash, tx_index) {
            None => Ok(receipt),
            Some(reason) => Err(ListenerError::ReceiptFetch {
                chain_id,
                block_number,
                tx_index,
                tx_hash,
                source: ReadError::invalid_response(reason),
            }),
        },
        Ok(None) => Err(ListenerError::ReceiptMissing {
            chain_id,
            block_number,
            tx_index,
            tx_hash,
        }),
        Err(source) => Err(ListenerError::ReceiptFetch {
            chain_id,
            block_number,
            tx_index,
            tx_hash,
            source,
        }),
    };
    let _ = result.send(outcome);
}

/// Why `receipt` does not belong at `(block_number, tx_index)` of the block
/// with `block_hash`, if it does not.
fn misplaced(receipt: &Receipt, block_number: u64, block_hash: &str, tx_index: u64) -> Option<String> {
    if receipt.block_number != block_number || !receipt.block_hash.eq_ignore_ascii_case(block_hash) {
        Some(format!(
            "receipt is from block {} ({}), expected {block_number} ({block_hash})",
            receipt.block_number, receipt.block_hash
        ))
    } else if receipt.tx_index != tx_index {
        Some(format!(
            "receipt has tx index {}, expected {tx_index}",
            receipt.tx_index
        ))
    } else {
        None
    }
}

/// Await slots in queue order and forward their results.
async fn drain(
    chain_id: ChainId,
    block_number: u64,
    mut queue: mpsc::Receiver<Slot>,
    out: mpsc::Sender<SlotResult>,
    cancel: CancellationToken,
) {
    while let Some(slot) = queue.recv().await {
        let Slot {
            tx_index,
            result,
            _permit: permit,
        } = slot;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            outcome = result => outcome,
        };
        // The fetch task went away without answering.
        let outcome = outcome.unwrap_or_else(|_| {
            Err(ListenerError::ReceiptAbandoned {
                chain_id,
                block_number,
                tx_index,
            })
        });
        let failed = outcome.is_err();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = out.send(outcome) => if sent.is_err() { break },
        }
        drop(permit);

        if failed {
            break;
        }
    }
    // Abort fetches that will never be drained.
    cancel.cancel();
}

/// Ordered receipts of one block.
pub struct ReceiptStream {
    receipts: mpsc::Receiver<SlotResult>,
    cancel: CancellationToken,
}

impl ReceiptStream {
    /// The next receipt in transaction order, or `None` once the stream ended.
    pub async fn next(&mut self) -> Option<SlotResult> {
        self.receipts.recv().await
    }

}

impl Drop for ReceiptStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use txlistener_core::{MemoryChain, Position, ReadError, ReadErrorKind};

    fn setup(tx_count: usize, limit: usize) -> (Arc<MemoryChain>, Block, ReceiptDispatcher) {
        let chain = Arc::new(MemoryChain::new());
        let id = ChainId::from(1);
        let block = chain.push_block(id, tx_count);
        let dispatcher = ReceiptDispatcher::new(id, chain.clone(), limit);
        (chain, block, dispatcher)
    }

    async fn collect(mut stream: ReceiptStream) -> Vec<SlotResult> {
        let mut out = vec![];
        while let Some(item) = stream.next().await {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn empty_block_ends_immediately() {
        let (_, block, dispatcher) = setup(0, 4);
        let results = collect(dispatcher.dispatch(&block, 0, &CancellationToken::new())).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn slow_early_receipts_keep_order() {
        let (chain, block, dispatcher) = setup(5, 5);
        for (i, tx) in block.transactions.iter().enumerate() {
            let delay = Duration::from_millis(5 * (5 - i as u64));
            chain.set_receipt_delay(ChainId::from(1), &tx.hash, delay);
        }

        let results = collect(dispatcher.dispatch(&block, 0, &CancellationToken::new())).await;
        let order: Vec<u64> = results.into_iter().map(|r| r.unwrap().tx_index).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn starts_from_index() {
        let (chain, block, dispatcher) = setup(4, 2);
        let results = collect(dispatcher.dispatch(&block, 2, &CancellationToken::new())).await;
        let order: Vec<u64> = results.into_iter().map(|r| r.unwrap().tx_index).collect();
        assert_eq!(order, vec![2, 3]);
        assert_eq!(chain.receipt_requests(ChainId::from(1)), 2);
    }

    #[tokio::test]
    async fn first_error_ends_stream() {
        let (chain, block, dispatcher) = setup(4, 4);
        chain.fail_receipt(
            ChainId::from(1),
            &block.transactions[1].hash,
            ReadError::transient("reset"),
        );

        let results = collect(dispatcher.dispatch(&block, 0, &CancellationToken::new())).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().tx_index, 0);
        assert!(matches!(
            results[1],
            Err(ListenerError::ReceiptFetch { tx_index: 1, .. })
        ));
    }

    #[tokio::test]
    async fn unknown_receipt_is_an_error() {
        let (chain, block, dispatcher) = setup(1, 1);
        chain.remove_receipt(ChainId::from(1), &block.transactions[0].hash);
        let results = collect(dispatcher.dispatch(&block, 0, &CancellationToken::new())).await;
        assert!(matches!(
            results[0],
            Err(ListenerError::ReceiptMissing { tx_index: 0, .. })
        ));
    }

    #[tokio::test]
    async fn receipt_from_another_block_is_rejected() {
        let chain = Arc::new(MemoryChain::new());
        let id = ChainId::from(1);
        let blocks = chain.push_blocks(id, &[1, 2]);
        let dispatcher = ReceiptDispatcher::new(id, chain.clone(), 2);

        // The node now answers tx 1 of block 1 with a receipt from a
        // replaced block 1.
        let tx = &blocks[1].transactions[1];
        let mut stale = chain.transaction_receipt(&id, &tx.hash).await.unwrap().unwrap();
        stale.block_hash = "0xreorged".into();
        chain.replace_receipt(id, stale);

        let results = collect(dispatcher.dispatch(&blocks[1], 0, &CancellationToken::new())).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().position(), Position::new(1, 0));
        match &results[1] {
            Err(ListenerError::ReceiptFetch { tx_index: 1, source, .. }) => {
                assert_eq!(source.kind, ReadErrorKind::InvalidResponse);
            }
            other => panic!("expected a rejected receipt, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn receipt_with_wrong_index_is_rejected() {
        let (chain, block, dispatcher) = setup(2, 2);
        let id = ChainId::from(1);
        let mut shifted = chain
            .transaction_receipt(&id, &block.transactions[0].hash)
            .await
            .unwrap()
            .unwrap();
        shifted.tx_index = 1;
        chain.replace_receipt(id, shifted);

        let results = collect(dispatcher.dispatch(&block, 0, &CancellationToken::new())).await;
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(ListenerError::ReceiptFetch { tx_index: 0, .. })
        ));
    }

    #[tokio::test]
    async fn dropping_stream_aborts_fetches() {
        let (chain, block, dispatcher) = setup(3, 3);
        for tx in &block.transactions {
            chain.hang_receipt(ChainId::from(1), &tx.hash);
        }
        let stream = dispatcher.dispatch(&block, 0, &CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(chain.in_flight(), 3);

        drop(stream);
        dispatcher.tracker().close();
        dispatcher.tracker().wait().await;
        assert_eq!(chain.in_flight(), 0);
    }
}
