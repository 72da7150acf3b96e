//! Example transactions fetched from a live network, used as planner context

use crate::error::Result;
use crate::record::TransactionRecord;
use crate::rpc::RpcClient;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Most examples kept per program
pub const MAX_EXAMPLES: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleInstruction {
    /// "i" or "i.j"
    pub label: String,
    pub depth: usize,
    pub program_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleTransaction {
    pub signature: String,
    pub success: bool,
    pub error: Option<String>,
    pub instructions: Vec<ExampleInstruction>,
    pub logs: Vec<String>,
}

impl ExampleTransaction {
    pub fn from_record(record: &TransactionRecord) -> Result<Self> {
        let instructions = record
            .flatten()?
            .into_iter()
            .map(|f| {
                Ok(ExampleInstruction {
                    program_id: record.program_id(f.instruction)?.to_string(),
                    label: f.label,
                    depth: f.depth,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            signature: record.signature.clone(),
            success: record.succeeded,
            error: record.error_detail.clone(),
            instructions,
            logs: record.log_lines.clone(),
        })
    }
}

/// Recent transactions that touched `program_id`, newest first.
///
/// Individual transactions that cannot be fetched or parsed are skipped.
pub async fn fetch_examples(rpc: &RpcClient, program_id: &str, limit: usize) -> Result<Vec<ExampleTransaction>> {
    let limit = limit.clamp(1, MAX_EXAMPLES);
    // ask for a few extra, some will have failed to load
    let signatures = rpc.get_signatures_for_address(program_id, limit * 3).await?;
    debug!(program_id, found = signatures.len(), "fetched signatures");

    let mut examples = Vec::with_capacity(limit);
    for info in signatures {
        if examples.len() >= limit {
            break;
        }
        let value = match rpc.get_transaction(&info.signature).await {
            Ok(Some(value)) => value,
            Ok(None) => continue,
            Err(e) => {
                warn!(signature = %info.signature, error = %e, "skipping example");
                continue;
            }
        };
        match TransactionRecord::from_rpc(&value).and_then(|r| ExampleTransaction::from_record(&r)) {
            Ok(example) => examples.push(example),
            Err(e) => warn!(signature = %info.signature, error = %e, "skipping unparsable example"),
        }
    }

    info!(program_id, examples = examples.len(), "fetched example transactions");
    Ok(examples)
}
