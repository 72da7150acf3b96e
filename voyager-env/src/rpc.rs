//! # JSON-RPC client
//!
//! A small client for the Solana JSON-RPC surface the harness consumes.
//! One instance talks to the local validator, another to the live network
//! when example transactions are fetched.

use crate::error::{self, Error, ErrorKind, Result};
use base64::Engine as _;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::VersionedTransaction;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Status entry returned by `getSignatureStatuses`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureStatus {
    pub slot: u64,
    pub confirmations: Option<u64>,
    pub err: Option<Value>,
    pub confirmation_status: Option<String>,
}

impl SignatureStatus {
    /// Whether the status has reached `commitment`
    pub fn satisfies(&self, commitment: &str) -> bool {
        let reached = match self.confirmation_status.as_deref() {
            Some(status) => commitment_rank(status),
            // null confirmations means the block is rooted
            None if self.confirmations.is_none() => commitment_rank("finalized"),
            None => commitment_rank("processed"),
        };
        reached >= commitment_rank(commitment)
    }
}

/// Entry returned by `getSignaturesForAddress`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureInfo {
    pub signature: String,
    pub slot: u64,
    pub err: Option<Value>,
    pub block_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    value: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockhashValue {
    blockhash: String,
}

/// JSON-RPC over HTTP
pub struct RpcClient {
    client: Client,
    url: String,
    commitment: String,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: impl Into<String>, timeout: Duration, commitment: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| error::network_error(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
            commitment: commitment.into(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn commitment(&self) -> &str {
        &self.commitment
    }

    /// Issue one JSON-RPC call and decode its `result`
    async fn call<T: DeserializeOwned>(&self, method: &'static str, params: Value) -> Result<T> {
        let result = self.call_raw(method, params).await?;
        serde_json::from_value(result).map_err(|e| {
            error::parse_error(format!("unexpected {} result: {}", method, e))
                .with_context("method", method)
        })
    }

    async fn call_raw(&self, method: &'static str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        debug!(method, id, url = %self.url, "rpc request");

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error::network_error(format!("{} request failed: {}", method, e))
                    .with_context("method", method)
                    .with_context("url", self.url.clone())
                    .set_source(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let kind = if status.as_u16() == 429 {
                ErrorKind::RateLimited
            } else {
                ErrorKind::RpcFailed
            };
            return Err(Error::new(kind, format!("HTTP {}: {}", status.as_u16(), text))
                .with_operation("rpc::call")
                .with_context("method", method));
        }

        let mut payload: Value = response.json().await.map_err(|e| {
            error::parse_error(format!("{} response is not JSON: {}", method, e))
                .with_context("method", method)
        })?;

        if let Some(err) = payload.get("error") {
            return Err(rpc_error(method, err));
        }

        Ok(payload
            .get_mut("result")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    // =========================================================================
    // Methods
    // =========================================================================

    pub async fn request_airdrop(&self, pubkey: &Pubkey, lamports: u64) -> Result<Signature> {
        let sig: String = self
            .call(
                "requestAirdrop",
                json!([pubkey.to_string(), lamports, { "commitment": self.commitment }]),
            )
            .await?;
        parse_signature(&sig)
    }

    pub async fn get_latest_blockhash(&self) -> Result<Hash> {
        let response: RpcResponse<BlockhashValue> = self
            .call("getLatestBlockhash", json!([{ "commitment": self.commitment }]))
            .await?;
        Hash::from_str(&response.value.blockhash)
            .map_err(|e| error::parse_error(format!("invalid blockhash: {}", e)))
    }

    pub async fn get_balance(&self, pubkey: &Pubkey) -> Result<u64> {
        let response: RpcResponse<u64> = self
            .call(
                "getBalance",
                json!([pubkey.to_string(), { "commitment": self.commitment }]),
            )
            .await?;
        Ok(response.value)
    }

    pub async fn get_block_height(&self) -> Result<u64> {
        self.call("getBlockHeight", json!([{ "commitment": self.commitment }]))
            .await
    }

    /// Submit a signed transaction (base64 wire encoding, preflight enabled)
    pub async fn send_transaction(&self, tx: &VersionedTransaction) -> Result<Signature> {
        let wire = bincode::serialize(tx)
            .map_err(|e| error::serialization_error(format!("transaction encode failed: {}", e)))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(wire);

        let params = json!([
            encoded,
            {
                "encoding": "base64",
                "skipPreflight": false,
                "preflightCommitment": self.commitment,
            }
        ]);

        let sig: String = self.call("sendTransaction", params).await?;
        parse_signature(&sig)
    }

    pub async fn get_signature_statuses(
        &self,
        signatures: &[Signature],
    ) -> Result<Vec<Option<SignatureStatus>>> {
        let sigs: Vec<String> = signatures.iter().map(|s| s.to_string()).collect();
        let response: RpcResponse<Vec<Option<SignatureStatus>>> = self
            .call(
                "getSignatureStatuses",
                json!([sigs, { "searchTransactionHistory": false }]),
            )
            .await?;
        Ok(response.value)
    }

    /// Poll until `signature` reaches the client's commitment.
    ///
    /// Returns the on-chain error, if the transaction failed, as `Some(err)`.
    pub async fn confirm_transaction(
        &self,
        signature: &Signature,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Option<Value>> {
        let poll = async {
            loop {
                match self.get_signature_statuses(std::slice::from_ref(signature)).await {
                    Ok(statuses) => {
                        if let Some(Some(status)) = statuses.into_iter().next() {
                            if status.satisfies(&self.commitment) {
                                return Ok(status.err);
                            }
                        }
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(error = %e, %signature, "status poll failed; retrying");
                    }
                    Err(e) => return Err(e),
                }
                tokio::time::sleep(poll_interval).await;
            }
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(error::confirmation_timeout(signature.to_string(), timeout.as_secs())),
        }
    }

    /// Fetch a transaction with instruction data, inner instructions and logs
    pub async fn get_transaction(&self, signature: &str) -> Result<Option<Value>> {
        // getTransaction does not accept "processed"
        let commitment = if self.commitment == "processed" {
            "confirmed"
        } else {
            self.commitment.as_str()
        };
        let value = self
            .call_raw(
                "getTransaction",
                json!([
                    signature,
                    {
                        "encoding": "json",
                        "commitment": commitment,
                        "maxSupportedTransactionVersion": 0,
                    }
                ]),
            )
            .await?;
        Ok((!value.is_null()).then_some(value))
    }

    pub async fn get_signatures_for_address(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<SignatureInfo>> {
        self.call(
            "getSignaturesForAddress",
            json!([address, { "limit": limit }]),
        )
        .await
    }
}

/// Order of commitment levels
pub fn commitment_rank(commitment: &str) -> u8 {
    match commitment {
        "processed" => 0,
        "confirmed" => 1,
        "finalized" => 2,
        _ => 1,
    }
}

/// Map a JSON-RPC error object to an Error.
///
/// Some validators answer a failed `sendTransaction` with an error object
/// lacking `data`; the transaction may still have landed, so that shape is
/// surfaced as `PossiblySucceeded` rather than `RpcFailed`.
pub fn rpc_error(method: &'static str, err: &Value) -> Error {
    let code = err.get("code").and_then(Value::as_i64).unwrap_or_default();
    let message = err
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown rpc error")
        .to_string();

    if method == "sendTransaction" && err.get("data").is_none() {
        return error::possibly_succeeded(format!(
            "sendTransaction error without `data` field: {}",
            message
        ))
        .with_context("code", code.to_string());
    }

    let mut e = error::rpc_failed(method, code, message);
    if let Some(logs) = err
        .get("data")
        .and_then(|d| d.get("logs"))
        .and_then(Value::as_array)
    {
        let tail: Vec<&str> = logs.iter().rev().take(5).filter_map(Value::as_str).collect();
        if !tail.is_empty() {
            e = e.with_context("logs", tail.into_iter().rev().collect::<Vec<_>>().join(" | "));
        }
    }
    e
}

fn parse_signature(sig: &str) -> Result<Signature> {
    Signature::from_str(sig).map_err(|e| error::parse_error(format!("invalid signature '{}': {}", sig, e)))
}
