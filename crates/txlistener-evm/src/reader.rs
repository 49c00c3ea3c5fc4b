//! `ChainReader` backed by EVM JSON-RPC endpoints.
//!
//! Uses `eth_getBlockByNumber` for headers and full blocks and
//! `eth_getTransactionReceipt` for receipts. A `null` result is "not found".

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use txlistener_core::{
    Block, ChainId, ChainReader, Header, Log, ReadError, ReadErrorKind, Receipt, Transaction,
};

use crate::transport::RpcTransport;

/// Reads chain state from one JSON-RPC transport per chain.
#[derive(Default, Clone)]
pub struct EvmChainReader {
    transports: HashMap<ChainId, Arc<dyn RpcTransport>>,
}

impl EvmChainReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route calls for `chain_id` to `transport`, replacing any previous one.
    pub fn with_chain(mut self, chain_id: ChainId, transport: Arc<dyn RpcTransport>) -> Self {
        self.transports.insert(chain_id, transport);
        self
    }

    /// Chains this reader has a transport for.
    pub fn chains(&self) -> Vec<ChainId> {
        let mut ids: Vec<ChainId> = self.transports.keys().copied().collect();
        ids.sort();
        ids
    }

    fn transport(&self, chain_id: &ChainId) -> Result<&Arc<dyn RpcTransport>, ReadError> {
        self.transports.get(chain_id).ok_or_else(|| {
            ReadError::new(
                ReadErrorKind::Other,
                format!("no RPC endpoint configured for chain {chain_id}"),
            )
        })
    }

    async fn raw_block(
        &self,
        chain_id: &ChainId,
        tag: String,
        full: bool,
    ) -> Result<Value, ReadError> {
        let transport = self.transport(chain_id)?;
        tracing::trace!(chain_id = %chain_id, url = transport.url(), block = %tag, "eth_getBlockByNumber");
        Ok(transport
            .call("eth_getBlockByNumber", vec![json!(tag), json!(full)])
            .await?)
    }
}

#[async_trait]
impl ChainReader for EvmChainReader {
    async fn header_by_number(
        &self,
        chain_id: &ChainId,
        number: Option<u64>,
    ) -> Result<Header, ReadError> {
        let tag = number.map_or_else(|| "latest".to_string(), |n| format!("0x{n:x}"));
        let raw = self.raw_block(chain_id, tag.clone(), false).await?;
        if raw.is_null() {
            return Err(ReadError::not_found(format!("block {tag} on chain {chain_id}")));
        }
        header_from_json(&raw)
    }

    async fn block_by_number(
        &self,
        chain_id: &ChainId,
        number: u64,
    ) -> Result<Option<Block>, ReadError> {
        let raw = self.raw_block(chain_id, format!("0x{number:x}"), true).await?;
        if raw.is_null() {
            return Ok(None);
        }
        let block = block_from_json(*chain_id, &raw)?;
        if block.number() != number {
            return Err(ReadError::invalid_response(format!(
                "asked for block {number}, node returned {}",
                block.number()
            )));
        }
        Ok(Some(block))
    }

    async fn transaction_receipt(
        &self,
        chain_id: &ChainId,
        tx_hash: &str,
    ) -> Result<Option<Receipt>, ReadError> {
        let transport = self.transport(chain_id)?;
        let raw = transport
            .call("eth_getTransactionReceipt", vec![json!(tx_hash)])
            .await?;
        if raw.is_null() {
            return Ok(None);
        }
        receipt_from_json(*chain_id, &raw).map(Some)
    }
}

// ─── Decoding ─────────────────────────────────────────────────────────────────

/// Parse a `0x`-prefixed hex quantity.
pub fn parse_hex_u64(s: &str) -> Result<u64, ReadError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16)
        .map_err(|_| ReadError::invalid_response(format!("bad hex quantity {s:?}")))
}

fn str_field<'a>(v: &'a Value, key: &str) -> Result<&'a str, ReadError> {
    v[key]
        .as_str()
        .ok_or_else(|| ReadError::invalid_response(format!("missing field {key:?}")))
}

fn hex_field(v: &Value, key: &str) -> Result<u64, ReadError> {
    parse_hex_u64(str_field(v, key)?)
}

fn opt_str_field(v: &Value, key: &str) -> Option<String> {
    v[key].as_str().map(str::to_string)
}

pub fn header_from_json(v: &Value) -> Result<Header, ReadError> {
    Ok(Header {
        number: hex_field(v, "number")?,
        hash: str_field(v, "hash")?.to_string(),
        parent_hash: str_field(v, "parentHash")?.to_string(),
        timestamp: hex_field(v, "timestamp")? as i64,
    })
}

/// Decode a block fetched with full transaction objects.
pub fn block_from_json(chain_id: ChainId, v: &Value) -> Result<Block, ReadError> {
    let header = header_from_json(v)?;
    let transactions = match v["transactions"].as_array() {
        Some(txs) => txs
            .iter()
            .map(transaction_from_json)
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };
    Ok(Block {
        chain_id,
        header,
        transactions,
    })
}

fn transaction_from_json(v: &Value) -> Result<Transaction, ReadError> {
    if !v.is_object() {
        return Err(ReadError::invalid_response(
            "block transactions are hashes, expected full objects",
        ));
    }
    Ok(Transaction {
        hash: str_field(v, "hash")?.to_string(),
        from: str_field(v, "from")?.to_string(),
        to: opt_str_field(v, "to"),
        nonce: hex_field(v, "nonce")?,
    })
}

pub fn receipt_from_json(chain_id: ChainId, v: &Value) -> Result<Receipt, ReadError> {
    let logs = match v["logs"].as_array() {
        Some(logs) => logs.iter().map(log_from_json).collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };
    // Pre-Byzantium receipts carry a state root instead of a status.
    let status = match v["status"].as_str() {
        Some(s) => parse_hex_u64(s)?,
        None => 1,
    };
    Ok(Receipt {
        chain_id,
        tx_hash: str_field(v, "transactionHash")?.to_string(),
        block_hash: str_field(v, "blockHash")?.to_string(),
        block_number: hex_field(v, "blockNumber")?,
        tx_index: hex_field(v, "transactionIndex")?,
        status,
        gas_used: hex_field(v, "gasUsed")?,
        cumulative_gas_used: hex_field(v, "cumulativeGasUsed")?,
        contract_address: opt_str_field(v, "contractAddress"),
        logs,
    })
}

fn log_from_json(v: &Value) -> Result<Log, ReadError> {
    let topics = v["topics"]
        .as_array()
        .map(|ts| {
            ts.iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    Ok(Log {
        address: str_field(v, "address")?.to_string(),
        topics,
        data: opt_str_field(v, "data").unwrap_or_else(|| "0x".into()),
        log_index: hex_field(v, "logIndex")?,
        removed: v["removed"].as_bool().unwrap_or(false),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
    use crate::transport::{TransportError, RATE_LIMIT_CODE};

    /// Answers by `(method, first param)`; unknown calls return `null`.
    #[derive(Default)]
    struct MockTransport {
        answers: Mutex<HashMap<(String, String), Result<Value, JsonRpcError>>>,
        calls: Mutex<Vec<JsonRpcRequest>>,
    }

    impl MockTransport {
        fn answer(&self, method: &str, param: &str, result: Value) {
            self.answers
                .lock()
                .unwrap()
                .insert((method.into(), param.into()), Ok(result));
        }

        fn fail(&self, method: &str, param: &str, code: i64) {
            let err = JsonRpcError {
                code,
                message: "rejected".into(),
                data: None,
            };
            self.answers
                .lock()
                .unwrap()
                .insert((method.into(), param.into()), Err(err));
        }
    }

    #[async_trait]
    impl RpcTransport for MockTransport {
        async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
            let key = (
                req.method.clone(),
                req.params.first().and_then(Value::as_str).unwrap_or("").to_string(),
            );
            let answer = self.answers.lock().unwrap().get(&key).cloned();
            let id = req.id.clone();
            self.calls.lock().unwrap().push(req);
            match answer {
                Some(Ok(v)) => Ok(JsonRpcResponse::success(id, v)),
                Some(Err(e)) => Ok(JsonRpcResponse {
                    jsonrpc: "2.0".into(),
                    id,
                    result: None,
                    error: Some(e),
                }),
                None => Ok(JsonRpcResponse::success(id, Value::Null)),
            }
        }

        fn url(&self) -> &str {
            "mock://node"
        }
    }

    fn chain() -> ChainId {
        ChainId::from(1)
    }

    fn reader(mock: Arc<MockTransport>) -> EvmChainReader {
        EvmChainReader::new().with_chain(chain(), mock)
    }

    fn block_json() -> Value {
        json!({
            "number": "0x10",
            "hash": "0xb16",
            "parentHash": "0xb15",
            "timestamp": "0x5f5e100",
            "transactions": [
                { "hash": "0xt0", "from": "0xa", "to": "0xb", "nonce": "0x0" },
                { "hash": "0xt1", "from": "0xa", "to": null, "nonce": "0x1" }
            ]
        })
    }

    fn receipt_json() -> Value {
        json!({
            "transactionHash": "0xt1",
            "blockHash": "0xb16",
            "blockNumber": "0x10",
            "transactionIndex": "0x1",
            "status": "0x0",
            "gasUsed": "0x5208",
            "cumulativeGasUsed": "0xa410",
            "contractAddress": "0xc0ffee",
            "logs": [{
                "address": "0xc0ffee",
                "topics": ["0xddf2"],
                "data": "0x01",
                "logIndex": "0x3",
                "removed": false
            }]
        })
    }

    #[test]
    fn hex_quantities() {
        assert_eq!(parse_hex_u64("0x0").unwrap(), 0);
        assert_eq!(parse_hex_u64("0xff").unwrap(), 255);
        assert_eq!(parse_hex_u64("0x12a05f200").unwrap(), 5_000_000_000);
        assert_eq!(
            parse_hex_u64("0xzz").unwrap_err().kind,
            ReadErrorKind::InvalidResponse
        );
    }

    #[tokio::test]
    async fn latest_header() {
        let mock = Arc::new(MockTransport::default());
        mock.answer("eth_getBlockByNumber", "latest", block_json());
        let header = reader(mock.clone()).header_by_number(&chain(), None).await.unwrap();
        assert_eq!(header.number, 16);
        assert_eq!(header.parent_hash, "0xb15");
        assert_eq!(header.timestamp, 100_000_000);

        let calls = mock.calls.lock().unwrap();
        assert_eq!(calls[0].params, vec![json!("latest"), json!(false)]);
    }

    #[tokio::test]
    async fn unknown_header_is_not_found() {
        let mock = Arc::new(MockTransport::default());
        let err = reader(mock).header_by_number(&chain(), Some(99)).await.unwrap_err();
        assert_eq!(err.kind, ReadErrorKind::NotFound);
    }

    #[tokio::test]
    async fn full_block_keeps_transaction_order() {
        let mock = Arc::new(MockTransport::default());
        mock.answer("eth_getBlockByNumber", "0x10", block_json());
        let block = reader(mock.clone())
            .block_by_number(&chain(), 16)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(block.chain_id, chain());
        let hashes: Vec<&str> = block.transactions.iter().map(|t| t.hash.as_str()).collect();
        assert_eq!(hashes, vec!["0xt0", "0xt1"]);
        assert_eq!(block.transactions[1].to, None);
        assert_eq!(mock.calls.lock().unwrap()[0].params[1], json!(true));
    }

    #[tokio::test]
    async fn unmined_block_is_none() {
        let mock = Arc::new(MockTransport::default());
        assert!(reader(mock).block_by_number(&chain(), 17).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mismatched_block_number_is_rejected() {
        let mock = Arc::new(MockTransport::default());
        mock.answer("eth_getBlockByNumber", "0x11", block_json());
        let err = reader(mock).block_by_number(&chain(), 17).await.unwrap_err();
        assert_eq!(err.kind, ReadErrorKind::InvalidResponse);
    }

    #[tokio::test]
    async fn receipt_decoding() {
        let mock = Arc::new(MockTransport::default());
        mock.answer("eth_getTransactionReceipt", "0xt1", receipt_json());
        let receipt = reader(mock)
            .transaction_receipt(&chain(), "0xt1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(receipt.position(), txlistener_core::Position::new(16, 1));
        assert!(!receipt.is_success());
        assert_eq!(receipt.gas_used, 21_000);
        assert_eq!(receipt.logs.len(), 1);
        assert_eq!(receipt.logs[0].log_index, 3);
        assert_eq!(receipt.logs[0].topics, vec!["0xddf2".to_string()]);
    }

    #[tokio::test]
    async fn missing_receipt_is_none() {
        let mock = Arc::new(MockTransport::default());
        assert!(reader(mock)
            .transaction_receipt(&chain(), "0xdead")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn rpc_errors_are_classified() {
        let mock = Arc::new(MockTransport::default());
        mock.fail("eth_getTransactionReceipt", "0xt0", RATE_LIMIT_CODE);
        mock.fail("eth_getTransactionReceipt", "0xt1", -32602);
        let r = reader(mock);

        let limited = r.transaction_receipt(&chain(), "0xt0").await.unwrap_err();
        assert_eq!(limited.kind, ReadErrorKind::RateLimited);
        assert!(limited.is_retryable());

        let invalid = r.transaction_receipt(&chain(), "0xt1").await.unwrap_err();
        assert_eq!(invalid.kind, ReadErrorKind::Rpc { code: -32602 });
    }

    #[tokio::test]
    async fn unconfigured_chain() {
        let r = reader(Arc::new(MockTransport::default()));
        let err = r.header_by_number(&ChainId::from(5), None).await.unwrap_err();
        assert_eq!(err.kind, ReadErrorKind::Other);
        assert_eq!(r.chains(), vec![chain()]);
    }

    #[test]
    fn hash_only_transactions_are_rejected() {
        let mut v = block_json();
        v["transactions"] = json!(["0xt0"]);
        assert!(block_from_json(chain(), &v).is_err());
    }
}
