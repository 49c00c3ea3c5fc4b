//! Ordering, pacing and concurrency guarantees of a single chain session.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use txlistener_core::{
    BlockConfig, ChainId, ListenerConfig, MemoryChain, Position, ReturnConfig, TrackerConfig,
};
use txlistener_stream::{ChainListener, TipTracker};

// ─── Helpers ──────────────────────────────────────────────────────────────────

const CHAIN: u64 = 1;

fn id() -> ChainId {
    ChainId::from(CHAIN)
}

fn config(limit: usize, returns: ReturnConfig) -> ListenerConfig {
    ListenerConfig {
        block: BlockConfig {
            backoff_ms: 5,
            max_backoff_ms: 20,
            limit,
        },
        returns,
        ..Default::default()
    }
}

async fn within<F: Future>(f: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), f)
        .await
        .expect("timed out")
}

async fn take<T>(rx: &mut mpsc::Receiver<T>, n: usize) -> Vec<T> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(within(rx.recv()).await.expect("channel closed early"));
    }
    out
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn receipts_keep_block_order_when_later_fetches_finish_first() {
    let chain = Arc::new(MemoryChain::new());
    let blocks = chain.push_blocks(id(), &[8, 8]);
    for block in &blocks {
        for (i, tx) in block.transactions.iter().enumerate() {
            let delay = Duration::from_millis(3 * (8 - i as u64));
            chain.set_receipt_delay(id(), &tx.hash, delay);
        }
    }

    let (listener, mut out) = ChainListener::builder(id(), chain.clone())
        .config(config(8, ReturnConfig::default()))
        .spawn();

    let positions: Vec<Position> = take(&mut out.receipts, 16)
        .await
        .iter()
        .map(|r| r.position())
        .collect();
    let expected: Vec<Position> = (0..2)
        .flat_map(|b| (0..8).map(move |t| Position::new(b, t)))
        .collect();
    assert_eq!(positions, expected);
    listener.close();
}

#[tokio::test]
async fn cursor_emits_every_block_once_in_order() {
    let chain = Arc::new(MemoryChain::new());
    chain.push_blocks(id(), &[0; 100]);

    let (listener, mut out) = ChainListener::builder(id(), chain.clone())
        .config(config(
            4,
            ReturnConfig {
                blocks: true,
                errors: false,
            },
        ))
        .spawn();

    let numbers: Vec<u64> = take(&mut out.blocks, 100)
        .await
        .iter()
        .map(|b| b.number())
        .collect();
    assert_eq!(numbers, (0..100).collect::<Vec<_>>());

    listener.close();
    let requests = chain.block_requests(id());
    assert_eq!(requests, (0..100).collect::<Vec<_>>());
}

#[tokio::test]
async fn resume_finishes_partial_block_first() {
    let chain = Arc::new(MemoryChain::new());
    chain.push_blocks(id(), &[2, 2, 2, 2, 2, 4, 3]);

    let (listener, mut out) = ChainListener::builder(id(), chain.clone())
        .config(config(4, ReturnConfig::default()))
        .start_at(Position::new(5, 2))
        .spawn();

    let positions: Vec<Position> = take(&mut out.receipts, 5)
        .await
        .iter()
        .map(|r| r.position())
        .collect();
    assert_eq!(
        positions,
        vec![
            Position::new(5, 2),
            Position::new(5, 3),
            Position::new(6, 0),
            Position::new(6, 1),
            Position::new(6, 2),
        ]
    );
    // Transactions 0 and 1 of block 5 were never fetched.
    assert_eq!(chain.receipt_requests(id()), 5);
    listener.close();
}

#[tokio::test]
async fn fetch_concurrency_never_exceeds_limit() {
    let chain = Arc::new(MemoryChain::new());
    let block = chain.push_block(id(), 25);
    for tx in &block.transactions {
        chain.set_receipt_delay(id(), &tx.hash, Duration::from_millis(10));
    }

    let (listener, mut out) = ChainListener::builder(id(), chain.clone())
        .config(config(3, ReturnConfig::default()))
        .spawn();

    let receipts = take(&mut out.receipts, 25).await;
    assert_eq!(receipts.last().map(|r| r.tx_index), Some(24));
    assert_eq!(chain.max_in_flight(), 3);
    listener.close();
}

#[tokio::test]
async fn slow_consumer_bounds_outstanding_fetches() {
    let chain = Arc::new(MemoryChain::new());
    chain.push_block(id(), 20);

    let (listener, mut out) = ChainListener::builder(id(), chain.clone())
        .config(config(4, ReturnConfig::default()))
        .spawn();

    // Nobody reads for a while. Admitted fetches stop at `limit` plus the
    // three receipts parked between the dispatcher and the consumer.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let requests = chain.receipt_requests(id());
    assert!(requests <= 4 + 3, "{requests} fetches started");

    take(&mut out.receipts, 20).await;
    assert!(chain.max_in_flight() <= 4);
    listener.close();
}

#[tokio::test]
async fn tracker_applies_finality_depth() {
    let chain = Arc::new(MemoryChain::new());

    chain.set_head(id(), 7);
    let tracker = TipTracker::new(id(), chain.clone(), &TrackerConfig { depth: 10 });
    assert_eq!(tracker.highest_block().await.unwrap(), 0);

    chain.set_head(id(), 25);
    assert_eq!(tracker.highest_block().await.unwrap(), 15);
}

#[tokio::test]
async fn unsafe_blocks_are_held_back() {
    let chain = Arc::new(MemoryChain::new());
    chain.push_blocks(id(), &[1; 6]);

    let mut cfg = config(4, ReturnConfig::default());
    cfg.tracker.depth = 3;
    let (listener, mut out) = ChainListener::builder(id(), chain.clone()).config(cfg).spawn();

    // Head 5, depth 3: blocks 0..=2 are safe.
    let numbers: Vec<u64> = take(&mut out.receipts, 3)
        .await
        .iter()
        .map(|r| r.block_number)
        .collect();
    assert_eq!(numbers, vec![0, 1, 2]);

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(out.receipts.try_recv().is_err());

    chain.push_block(id(), 1);
    assert_eq!(within(out.receipts.recv()).await.unwrap().block_number, 3);
    listener.close();
}
