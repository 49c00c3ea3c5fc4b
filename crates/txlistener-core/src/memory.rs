//! In-memory chain reader for tests, demos and local development.
//!
//! Blocks are appended with synthetic hashes and one successful receipt per
//! transaction. Reads can be slowed down, made to fail or made to hang per
//! transaction, and the reader keeps an in-flight gauge so callers can assert
//! how many receipt fetches were outstanding at once.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ReadError;
use crate::reader::ChainReader;
use crate::types::{Block, ChainId, Header, Log, Receipt, Transaction};

#[derive(Default)]
struct ChainState {
    blocks: Vec<Block>,
    receipts: HashMap<String, Receipt>,
    /// Overrides the reported head; defaults to the last pushed block.
    head: Option<u64>,
    head_error: Option<ReadError>,
    block_errors: HashMap<u64, ReadError>,
    receipt_errors: HashMap<String, ReadError>,
    receipt_delays: HashMap<String, Duration>,
    hanging: HashSet<String>,
    block_requests: Vec<u64>,
    receipt_requests: usize,
}

impl ChainState {
    fn head(&self) -> Option<u64> {
        self.head
            .or_else(|| self.blocks.last().map(|b| b.header.number))
    }
}

/// A fully scriptable [`ChainReader`] holding any number of chains.
///
/// The internal lock is never held across an await point.
#[derive(Default)]
pub struct MemoryChain {
    chains: Mutex<HashMap<ChainId, ChainState>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ChainId, ChainState>> {
        self.chains.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_chain<T>(&self, chain_id: ChainId, f: impl FnOnce(&mut ChainState) -> T) -> T {
        let mut chains = self.lock();
        f(chains.entry(chain_id).or_default())
    }

    // ── Building ─────────────────────────────────────────────────────────────

    /// Append a block with `tx_count` transactions and return it.
    pub fn push_block(&self, chain_id: ChainId, tx_count: usize) -> Block {
        self.with_chain(chain_id, |state| {
            let number = state.blocks.len() as u64;
            let parent_hash = state
                .blocks
                .last()
                .map(|b| b.header.hash.clone())
                .unwrap_or_else(|| format!("0x{:064x}", 0));
            let hash = block_hash(&chain_id, number);

            let transactions: Vec<Transaction> = (0..tx_count as u64)
                .map(|index| Transaction {
                    hash: tx_hash(&chain_id, number, index),
                    from: format!("0x{:040x}", index + 1),
                    to: Some(format!("0x{:040x}", number + 1)),
                    nonce: number,
                })
                .collect();

            let mut cumulative = 0;
            for (index, tx) in transactions.iter().enumerate() {
                let gas_used = 21_000 + index as u64;
                cumulative += gas_used;
                state.receipts.insert(
                    tx.hash.clone(),
                    Receipt {
                        chain_id,
                        tx_hash: tx.hash.clone(),
                        block_hash: hash.clone(),
                        block_number: number,
                        tx_index: index as u64,
                        status: 1,
                        gas_used,
                        cumulative_gas_used: cumulative,
                        contract_address: None,
                        logs: vec![Log {
                            address: tx.to.clone().unwrap_or_default(),
                            topics: vec![format!("0x{:064x}", index)],
                            data: "0x".into(),
                            log_index: index as u64,
                            removed: false,
                        }],
                    },
                );
            }

            let block = Block {
                chain_id,
                header: Header {
                    number,
                    hash,
                    parent_hash,
                    timestamp: 1_700_000_000 + number as i64 * 12,
                },
                transactions,
            };
            state.blocks.push(block.clone());
            block
        })
    }

    /// Append one block per entry of `tx_counts`.
    pub fn push_blocks(&self, chain_id: ChainId, tx_counts: &[usize]) -> Vec<Block> {
        tx_counts
            .iter()
            .map(|&count| self.push_block(chain_id, count))
            .collect()
    }

    /// Report `head` as the latest block regardless of what was pushed.
    pub fn set_head(&self, chain_id: ChainId, head: u64) {
        self.with_chain(chain_id, |state| state.head = Some(head));
    }

    /// Drop the receipt of `tx_hash` so the node reports it as unknown.
    pub fn remove_receipt(&self, chain_id: ChainId, tx_hash: &str) {
        self.with_chain(chain_id, |state| {
            state.receipts.remove(tx_hash);
        });
    }

    /// Serve `receipt` for its `tx_hash`, replacing the stored one.
    pub fn replace_receipt(&self, chain_id: ChainId, receipt: Receipt) {
        self.with_chain(chain_id, |state| {
            state.receipts.insert(receipt.tx_hash.clone(), receipt);
        });
    }

    // ── Fault injection ──────────────────────────────────────────────────────

    pub fn fail_head(&self, chain_id: ChainId, err: ReadError) {
        self.with_chain(chain_id, |state| state.head_error = Some(err));
    }

    pub fn fail_block(&self, chain_id: ChainId, number: u64, err: ReadError) {
        self.with_chain(chain_id, |state| {
            state.block_errors.insert(number, err);
        });
    }

    pub fn fail_receipt(&self, chain_id: ChainId, tx_hash: &str, err: ReadError) {
        self.with_chain(chain_id, |state| {
            state.receipt_errors.insert(tx_hash.to_string(), err);
        });
    }

    /// Remove every injected failure on `chain_id`.
    pub fn clear_failures(&self, chain_id: ChainId) {
        self.with_chain(chain_id, |state| {
            state.head_error = None;
            state.block_errors.clear();
            state.receipt_errors.clear();
        });
    }

    /// Delay the receipt fetch of `tx_hash` by `delay`.
    pub fn set_receipt_delay(&self, chain_id: ChainId, tx_hash: &str, delay: Duration) {
        self.with_chain(chain_id, |state| {
            state.receipt_delays.insert(tx_hash.to_string(), delay);
        });
    }

    /// Make the receipt fetch of `tx_hash` never complete.
    pub fn hang_receipt(&self, chain_id: ChainId, tx_hash: &str) {
        self.with_chain(chain_id, |state| {
            state.hanging.insert(tx_hash.to_string());
        });
    }

    // ── Instrumentation ──────────────────────────────────────────────────────

    /// Receipt fetches currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of receipt fetches ever running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Block numbers requested on `chain_id`, in request order.
    pub fn block_requests(&self, chain_id: ChainId) -> Vec<u64> {
        self.with_chain(chain_id, |state| state.block_requests.clone())
    }

    /// Number of receipt fetches started on `chain_id`.
    pub fn receipt_requests(&self, chain_id: ChainId) -> usize {
        self.with_chain(chain_id, |state| state.receipt_requests)
    }
}

/// Decrements the in-flight gauge when the fetch completes or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(gauge: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let now = gauge.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self(gauge)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn chain_hex(chain_id: &ChainId) -> String {
    chain_id.to_hex().trim_start_matches("0x").to_string()
}

fn block_hash(chain_id: &ChainId, number: u64) -> String {
    format!("0x{:0>16}{:048x}", chain_hex(chain_id), number)
}

fn tx_hash(chain_id: &ChainId, number: u64, index: u64) -> String {
    format!("0x{:0>16}{:032x}{:016x}", chain_hex(chain_id), number, index)
}

#[async_trait]
impl ChainReader for MemoryChain {
    async fn header_by_number(
        &self,
        chain_id: &ChainId,
        number: Option<u64>,
    ) -> Result<Header, ReadError> {
        self.with_chain(*chain_id, |state| {
            if let Some(err) = &state.head_error {
                return Err(err.clone());
            }
            match number {
                Some(n) => state
                    .blocks
                    .get(n as usize)
                    .map(|b| b.header.clone())
                    .ok_or_else(|| ReadError::not_found(format!("header {n}"))),
                None => {
                    let head = state
                        .head()
                        .ok_or_else(|| ReadError::not_found("no blocks on chain"))?;
                    Ok(state
                        .blocks
                        .get(head as usize)
                        .map(|b| b.header.clone())
                        .unwrap_or_else(|| Header {
                            number: head,
                            hash: block_hash(chain_id, head),
                            parent_hash: block_hash(chain_id, head.saturating_sub(1)),
                            timestamp: 0,
                        }))
                }
            }
        })
    }

    async fn block_by_number(
        &self,
        chain_id: &ChainId,
        number: u64,
    ) -> Result<Option<Block>, ReadError> {
        self.with_chain(*chain_id, |state| {
            state.block_requests.push(number);
            if let Some(err) = state.block_errors.get(&number) {
                return Err(err.clone());
            }
            Ok(state.blocks.get(number as usize).cloned())
        })
    }

    async fn transaction_receipt(
        &self,
        chain_id: &ChainId,
        tx_hash: &str,
    ) -> Result<Option<Receipt>, ReadError> {
        let _guard = InFlight::enter(&self.in_flight, &self.max_in_flight);

        let (delay, hang) = self.with_chain(*chain_id, |state| {
            state.receipt_requests += 1;
            (
                state.receipt_delays.get(tx_hash).copied(),
                state.hanging.contains(tx_hash),
            )
        });
        if hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.with_chain(*chain_id, |state| {
            if let Some(err) = state.receipt_errors.get(tx_hash) {
                return Err(err.clone());
            }
            Ok(state.receipts.get(tx_hash).cloned())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn blocks_link_to_parents() {
        let chain = MemoryChain::new();
        let id = ChainId::from(1);
        let blocks = chain.push_blocks(id, &[0, 3, 1]);

        assert!(blocks[1].extends(&blocks[0].header));
        assert!(blocks[2].extends(&blocks[1].header));
        assert_eq!(blocks[1].tx_count(), 3);

        let head = chain.header_by_number(&id, None).await.unwrap();
        assert_eq!(head.number, 2);
        assert!(chain.block_by_number(&id, 3).await.unwrap().is_none());
        assert_eq!(chain.block_requests(id), vec![3]);
    }

    #[tokio::test]
    async fn receipts_match_their_transactions() {
        let chain = MemoryChain::new();
        let id = ChainId::from(5);
        let block = chain.push_block(id, 2);

        let receipt = chain
            .transaction_receipt(&id, &block.transactions[1].hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(receipt.tx_index, 1);
        assert_eq!(receipt.block_hash, block.header.hash);
        assert!(receipt.is_success());

        // Hashes are chain-scoped.
        assert!(chain
            .transaction_receipt(&ChainId::from(6), &block.transactions[1].hash)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn head_override_and_failures() {
        let chain = MemoryChain::new();
        let id = ChainId::from(1);
        chain.set_head(id, 25);
        assert_eq!(chain.header_by_number(&id, None).await.unwrap().number, 25);

        chain.fail_head(id, ReadError::transient("down"));
        assert!(chain.header_by_number(&id, None).await.is_err());
        chain.clear_failures(id);
        assert!(chain.header_by_number(&id, None).await.is_ok());
    }

    #[tokio::test]
    async fn gauge_tracks_concurrent_fetches() {
        let chain = Arc::new(MemoryChain::new());
        let id = ChainId::from(1);
        let block = chain.push_block(id, 3);
        for tx in &block.transactions {
            chain.set_receipt_delay(id, &tx.hash, Duration::from_millis(20));
        }

        let handles: Vec<_> = block
            .transactions
            .iter()
            .map(|tx| {
                let chain = chain.clone();
                let hash = tx.hash.clone();
                tokio::spawn(async move { chain.transaction_receipt(&id, &hash).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(chain.in_flight(), 0);
        assert_eq!(chain.max_in_flight(), 3);
        assert_eq!(chain.receipt_requests(id), 3);
    }

    #[tokio::test]
    async fn dropped_fetch_leaves_gauge() {
        let chain = MemoryChain::new();
        let id = ChainId::from(1);
        let block = chain.push_block(id, 1);
        chain.hang_receipt(id, &block.transactions[0].hash);

        let fetch = chain.transaction_receipt(&id, &block.transactions[0].hash);
        let timed_out = tokio::time::timeout(Duration::from_millis(10), fetch).await;
        assert!(timed_out.is_err());
        assert_eq!(chain.in_flight(), 0);
    }
}
