//! # Transaction records
//!
//! The immutable result of a confirmed submission, mapped from the JSON
//! encoding of `getTransaction`.

use crate::error::{self, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// One compiled instruction as it appears on chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionRecord {
    /// Index into the transaction's account keys
    pub program_id_index: usize,
    pub accounts: Vec<usize>,
    /// Instruction payload, base58 as returned by the RPC
    pub data: String,
    pub stack_height: Option<u32>,
}

impl InstructionRecord {
    pub fn new(program_id_index: usize, accounts: Vec<usize>, data: impl Into<String>) -> Self {
        Self {
            program_id_index,
            accounts,
            data: data.into(),
            stack_height: None,
        }
    }

    /// Decoded payload, `None` if the data is not valid base58
    pub fn decoded_data(&self) -> Option<Vec<u8>> {
        bs58::decode(&self.data).into_vec().ok()
    }

    /// First byte of the decoded payload
    pub fn discriminator(&self) -> Option<u8> {
        self.decoded_data().and_then(|d| d.first().copied())
    }
}

/// Instructions invoked by top-level instruction `index`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InnerInstructionGroup {
    pub index: usize,
    pub instructions: Vec<InstructionRecord>,
}

/// A flattened instruction in execution order
#[derive(Debug, Clone, PartialEq)]
pub struct FlatInstruction<'a> {
    /// "i" for top-level, "i.j" for inner instructions
    pub label: String,
    /// 0 for top-level, 1 for inner
    pub depth: usize,
    pub instruction: &'a InstructionRecord,
}

/// A confirmed transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub signature: String,
    pub slot: u64,
    pub block_time: Option<i64>,
    pub fee: u64,
    pub account_keys: Vec<String>,
    pub instructions: Vec<InstructionRecord>,
    pub inner_instructions: Vec<InnerInstructionGroup>,
    pub succeeded: bool,
    pub error_detail: Option<String>,
    pub log_lines: Vec<String>,
    pub compute_units: Option<u64>,
}

impl TransactionRecord {
    /// Minimal record, mainly for tests and fakes
    pub fn new(account_keys: Vec<String>, instructions: Vec<InstructionRecord>) -> Self {
        Self {
            signature: String::new(),
            slot: 0,
            block_time: None,
            fee: 0,
            account_keys,
            instructions,
            inner_instructions: Vec::new(),
            succeeded: true,
            error_detail: None,
            log_lines: Vec::new(),
            compute_units: None,
        }
    }

    pub fn with_inner(mut self, index: usize, instructions: Vec<InstructionRecord>) -> Self {
        self.inner_instructions.push(InnerInstructionGroup { index, instructions });
        self
    }

    pub fn with_failure(mut self, detail: impl Into<String>) -> Self {
        self.succeeded = false;
        self.error_detail = Some(detail.into());
        self
    }

    /// Map a `getTransaction` result (json encoding)
    pub fn from_rpc(value: &Value) -> Result<Self> {
        let raw: RpcConfirmedTransaction = serde_json::from_value(value.clone())
            .map_err(|e| error::parse_error(format!("malformed transaction: {}", e)))?;
        let meta = raw
            .meta
            .ok_or_else(|| error::parse_error("transaction has no meta"))?;

        let mut account_keys = raw
            .transaction
            .message
            .account_keys
            .iter()
            .map(account_key)
            .collect::<Result<Vec<_>>>()?;
        if let Some(loaded) = meta.loaded_addresses {
            account_keys.extend(loaded.writable);
            account_keys.extend(loaded.readonly);
        }

        let instructions = raw
            .transaction
            .message
            .instructions
            .into_iter()
            .map(RpcInstruction::into_record)
            .collect();

        let inner_instructions = meta
            .inner_instructions
            .unwrap_or_default()
            .into_iter()
            .map(|group| InnerInstructionGroup {
                index: group.index,
                instructions: group.instructions.into_iter().map(RpcInstruction::into_record).collect(),
            })
            .collect();

        let log_lines = meta.log_messages.unwrap_or_default();
        let compute_units = meta
            .compute_units_consumed
            .or_else(|| compute_units_from_logs(&log_lines));
        let (succeeded, error_detail) = match meta.err {
            None | Some(Value::Null) => (true, None),
            Some(err) => (false, Some(err.to_string())),
        };

        Ok(Self {
            signature: raw.transaction.signatures.into_iter().next().unwrap_or_default(),
            slot: raw.slot,
            block_time: raw.block_time,
            fee: meta.fee,
            account_keys,
            instructions,
            inner_instructions,
            succeeded,
            error_detail,
            log_lines,
            compute_units,
        })
    }

    /// Instructions in execution order: top-level `i`, then its inner
    /// instructions `i.0, i.1, ...`, then top-level `i+1`.
    ///
    /// An inner group pointing past the last top-level instruction is a
    /// malformed record.
    pub fn flatten(&self) -> Result<Vec<FlatInstruction<'_>>> {
        if let Some(group) = self
            .inner_instructions
            .iter()
            .find(|g| g.index >= self.instructions.len())
        {
            return Err(error::parse_error(format!(
                "inner instruction group {} has no top-level instruction ({} present)",
                group.index,
                self.instructions.len()
            )));
        }

        let mut flat = Vec::new();
        for (i, ix) in self.instructions.iter().enumerate() {
            flat.push(FlatInstruction {
                label: i.to_string(),
                depth: 0,
                instruction: ix,
            });
            let inner = self
                .inner_instructions
                .iter()
                .filter(|g| g.index == i)
                .flat_map(|g| g.instructions.iter());
            for (j, inner_ix) in inner.enumerate() {
                flat.push(FlatInstruction {
                    label: format!("{}.{}", i, j),
                    depth: 1,
                    instruction: inner_ix,
                });
            }
        }
        Ok(flat)
    }

    /// Resolve the program id of an instruction
    pub fn program_id(&self, instruction: &InstructionRecord) -> Result<&str> {
        self.account_keys
            .get(instruction.program_id_index)
            .map(String::as_str)
            .ok_or_else(|| {
                error::parse_error(format!(
                    "program id index {} out of range ({} account keys)",
                    instruction.program_id_index,
                    self.account_keys.len()
                ))
            })
    }

    /// Number of inner (cross-program) instructions
    pub fn inner_count(&self) -> usize {
        self.inner_instructions.iter().map(|g| g.instructions.len()).sum()
    }

    /// Distinct programs invoked anywhere in the instruction tree
    pub fn invoked_programs(&self) -> BTreeSet<&str> {
        self.flatten()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|f| self.program_id(f.instruction).ok())
            .collect()
    }

    /// Heuristic complexity used in trajectory analysis
    ///
    /// instructions x10 + accounts x5 + min(CU / 10000, 50)
    /// + 20 per inner instruction + 15 per distinct program
    pub fn complexity_score(&self) -> f64 {
        let mut score = self.instructions.len() as f64 * 10.0;
        score += self.account_keys.len() as f64 * 5.0;
        score += (self.compute_units.unwrap_or(0) as f64 / 10_000.0).min(50.0);
        score += self.inner_count() as f64 * 20.0;
        score += self.invoked_programs().len() as f64 * 15.0;
        (score * 100.0).round() / 100.0
    }

    /// Compact copy kept by the trajectory log
    pub fn summary(&self) -> TransactionSummary {
        TransactionSummary {
            signature: self.signature.clone(),
            slot: self.slot,
            succeeded: self.succeeded,
            fee: self.fee,
            compute_units: self.compute_units.unwrap_or(0),
            num_instructions: self.instructions.len(),
            num_inner_instructions: self.inner_count(),
            num_accounts: self.account_keys.len(),
            programs: self.invoked_programs().into_iter().map(String::from).collect(),
            complexity: self.complexity_score(),
        }
    }

    /// Last `n` log lines, for error feedback
    pub fn log_tail(&self, n: usize) -> Vec<&str> {
        let start = self.log_lines.len().saturating_sub(n);
        self.log_lines[start..].iter().map(String::as_str).collect()
    }
}

/// What the trajectory log keeps of a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionSummary {
    pub signature: String,
    pub slot: u64,
    pub succeeded: bool,
    pub fee: u64,
    pub compute_units: u64,
    pub num_instructions: usize,
    pub num_inner_instructions: usize,
    pub num_accounts: usize,
    pub programs: Vec<String>,
    pub complexity: f64,
}

impl std::fmt::Display for TransactionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let chars = self.signature.chars().count();
        let sig = if chars > 16 {
            let head: String = self.signature.chars().take(8).collect();
            let tail: String = self.signature.chars().skip(chars - 8).collect();
            format!("{}...{}", head, tail)
        } else {
            self.signature.clone()
        };
        write!(
            f,
            "{} slot={} {} fee={:.6} SOL cu={} ix={}+{} accounts={} complexity={}",
            sig,
            self.slot,
            if self.succeeded { "ok" } else { "failed" },
            self.fee as f64 / 1e9,
            self.compute_units,
            self.num_instructions,
            self.num_inner_instructions,
            self.num_accounts,
            self.complexity
        )
    }
}

/// First "consumed N of M compute units" value in the logs
pub fn compute_units_from_logs(logs: &[String]) -> Option<u64> {
    logs.iter()
        .filter(|line| line.contains("compute units"))
        .find_map(|line| {
            let mut words = line.split_whitespace();
            while let Some(word) = words.next() {
                if word == "consumed" {
                    if let Some(n) = words.next().and_then(|n| n.parse().ok()) {
                        return Some(n);
                    }
                }
            }
            None
        })
}

fn account_key(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        // jsonParsed encoding
        Value::Object(obj) => obj
            .get("pubkey")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| error::parse_error("account key object without pubkey")),
        other => Err(error::parse_error(format!("unexpected account key: {}", other))),
    }
}

// ============================================================================
// getTransaction JSON shapes
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcConfirmedTransaction {
    #[serde(default)]
    slot: u64,
    block_time: Option<i64>,
    meta: Option<RpcMeta>,
    transaction: RpcTransaction,
}

#[derive(Debug, Deserialize)]
struct RpcTransaction {
    #[serde(default)]
    signatures: Vec<String>,
    message: RpcMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcMessage {
    account_keys: Vec<Value>,
    #[serde(default)]
    instructions: Vec<RpcInstruction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcInstruction {
    program_id_index: usize,
    #[serde(default)]
    accounts: Vec<usize>,
    #[serde(default)]
    data: String,
    stack_height: Option<u32>,
}

impl RpcInstruction {
    fn into_record(self) -> InstructionRecord {
        InstructionRecord {
            program_id_index: self.program_id_index,
            accounts: self.accounts,
            data: self.data,
            stack_height: self.stack_height,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcMeta {
    err: Option<Value>,
    #[serde(default)]
    fee: u64,
    log_messages: Option<Vec<String>>,
    inner_instructions: Option<Vec<RpcInnerGroup>>,
    loaded_addresses: Option<RpcLoadedAddresses>,
    compute_units_consumed: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RpcInnerGroup {
    index: usize,
    instructions: Vec<RpcInstruction>,
}

#[derive(Debug, Deserialize)]
struct RpcLoadedAddresses {
    #[serde(default)]
    writable: Vec<String>,
    #[serde(default)]
    readonly: Vec<String>,
}
