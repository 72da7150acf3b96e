//! # Transaction submission and confirmation
//!
//! Sign the unsigned transaction produced by a skill with the agent keypair,
//! submit it, wait for confirmation and fetch the resulting record. Each step
//! runs once; retrying is the caller's decision.

use crate::config::RpcConfig;
use crate::error::{self, Error, ErrorKind, Result};
use crate::record::TransactionRecord;
use crate::rpc::RpcClient;
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};
use solana_sdk::transaction::VersionedTransaction;
use tracing::{info, warn};

/// Result of one submission attempt
#[derive(Debug)]
pub enum SubmitOutcome {
    /// Confirmed and fetched. The record may describe a failed transaction.
    Confirmed(TransactionRecord),
    /// The validator answered in its known malformed way; the transaction
    /// may or may not have landed.
    PossiblySucceeded {
        signature: Option<String>,
        detail: String,
    },
    /// Anything else; fatal to the attempt only
    Failed(Error),
}

impl SubmitOutcome {
    pub fn record(&self) -> Option<&TransactionRecord> {
        match self {
            SubmitOutcome::Confirmed(record) => Some(record),
            _ => None,
        }
    }

    /// Confirmed and not failed on chain
    pub fn is_success(&self) -> bool {
        matches!(self, SubmitOutcome::Confirmed(record) if record.succeeded)
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            SubmitOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Short label for trajectory entries
    pub fn label(&self) -> &'static str {
        match self {
            SubmitOutcome::Confirmed(record) if record.succeeded => "confirmed",
            SubmitOutcome::Confirmed(_) => "confirmed_failed",
            SubmitOutcome::PossiblySucceeded { .. } => "possibly_succeeded",
            SubmitOutcome::Failed(_) => "submission_failed",
        }
    }
}

/// Anything that can sign and land an unsigned transaction
#[allow(async_fn_in_trait)]
pub trait TransactionSubmitter {
    /// Public key skills must use as fee payer
    fn agent_pubkey(&self) -> Pubkey;

    /// A fresh blockhash to bind into the next skill execution
    async fn latest_blockhash(&self) -> Result<Hash>;

    /// Sign `unsigned` over `blockhash`, submit, confirm and fetch
    async fn submit(&self, unsigned: &[u8], blockhash: Hash) -> SubmitOutcome;
}

/// Decode a wire transaction, bind `blockhash` and sign it with `payer`.
///
/// Accepts both legacy and v0 wire formats. Fails when the message needs any
/// signer besides `payer`.
pub fn prepare_transaction(unsigned: &[u8], blockhash: Hash, payer: &Keypair) -> Result<VersionedTransaction> {
    let tx: VersionedTransaction = bincode::deserialize(unsigned).map_err(|e| {
        error::signing_failed(format!("not a valid wire transaction: {}", e))
    })?;

    let mut message = tx.message;
    let required = message.header().num_required_signatures as usize;
    let signers = &message.static_account_keys()[..required.min(message.static_account_keys().len())];
    if required != 1 || signers.first() != Some(&payer.pubkey()) {
        return Err(error::signing_failed(format!(
            "transaction must have exactly one signer, the agent {}; found {:?}",
            payer.pubkey(),
            signers.iter().map(|k| k.to_string()).collect::<Vec<_>>()
        )));
    }

    message.set_recent_blockhash(blockhash);
    VersionedTransaction::try_new(message, &[payer])
        .map_err(|e| error::signing_failed(format!("signing failed: {}", e)))
}

/// Sign, send, confirm and fetch against `rpc`
pub async fn submit_transaction(
    rpc: &RpcClient,
    payer: &Keypair,
    unsigned: &[u8],
    blockhash: Hash,
    config: &RpcConfig,
) -> SubmitOutcome {
    let tx = match prepare_transaction(unsigned, blockhash, payer) {
        Ok(tx) => tx,
        Err(e) => return SubmitOutcome::Failed(e),
    };
    let local_signature = tx.signatures.first().map(|s| s.to_string());

    let signature = match rpc.send_transaction(&tx).await {
        Ok(sig) => sig,
        Err(e) if e.kind() == ErrorKind::PossiblySucceeded => {
            warn!(signature = ?local_signature, detail = e.message(), "submission possibly succeeded");
            return SubmitOutcome::PossiblySucceeded {
                signature: local_signature,
                detail: e.message().to_string(),
            };
        }
        Err(e) => {
            return SubmitOutcome::Failed(e.with_operation("submission::submit"));
        }
    };
    info!(%signature, "transaction sent");

    let chain_error = match rpc
        .confirm_transaction(&signature, config.confirm_timeout(), config.poll_interval())
        .await
    {
        Ok(err) => err,
        Err(e) => return SubmitOutcome::Failed(e),
    };
    if let Some(err) = &chain_error {
        info!(%signature, error = %err, "transaction confirmed with error");
    }

    let value = match rpc.get_transaction(&signature.to_string()).await {
        Ok(Some(value)) => value,
        Ok(None) => {
            return SubmitOutcome::Failed(error::transaction_not_found(signature.to_string()))
        }
        Err(e) => return SubmitOutcome::Failed(e),
    };

    match TransactionRecord::from_rpc(&value) {
        Ok(record) => SubmitOutcome::Confirmed(record),
        Err(e) => SubmitOutcome::Failed(e.with_context("signature", signature.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::instruction::{AccountMeta, Instruction};
    use solana_sdk::message::Message;
    use solana_sdk::transaction::Transaction;

    fn unsigned_bytes(fee_payer: &Pubkey, extra_signer: Option<&Pubkey>) -> Vec<u8> {
        let program = Pubkey::new_unique();
        let mut accounts = vec![AccountMeta::new(*fee_payer, true)];
        if let Some(extra) = extra_signer {
            accounts.push(AccountMeta::new(*extra, true));
        }
        let ix = Instruction::new_with_bytes(program, &[3, 0, 0, 0], accounts);
        let tx = Transaction::new_unsigned(Message::new(&[ix], Some(fee_payer)));
        bincode::serialize(&tx).unwrap()
    }

    #[test]
    fn test_prepare_binds_blockhash_and_signs() {
        let payer = Keypair::new();
        let blockhash = Hash::new_unique();
        let bytes = unsigned_bytes(&payer.pubkey(), None);

        let tx = prepare_transaction(&bytes, blockhash, &payer).unwrap();
        assert_eq!(tx.message.recent_blockhash(), &blockhash);
        assert!(tx.verify_with_results().into_iter().all(|ok| ok));
    }

    #[test]
    fn test_prepare_rejects_foreign_fee_payer() {
        let payer = Keypair::new();
        let other = Pubkey::new_unique();
        let bytes = unsigned_bytes(&other, None);

        let err = prepare_transaction(&bytes, Hash::new_unique(), &payer).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SigningFailed);
    }

    #[test]
    fn test_prepare_rejects_extra_signers() {
        let payer = Keypair::new();
        let bytes = unsigned_bytes(&payer.pubkey(), Some(&Pubkey::new_unique()));

        let err = prepare_transaction(&bytes, Hash::new_unique(), &payer).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SigningFailed);
    }

    #[test]
    fn test_prepare_rejects_garbage() {
        let payer = Keypair::new();
        let err = prepare_transaction(b"not a transaction", Hash::new_unique(), &payer).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SigningFailed);
    }

    #[test]
    fn test_outcome_labels() {
        let record = TransactionRecord::new(vec!["A".into()], vec![]);
        assert!(SubmitOutcome::Confirmed(record.clone()).is_success());
        assert_eq!(
            SubmitOutcome::Confirmed(record.with_failure("InstructionError")).label(),
            "confirmed_failed"
        );

        let possibly = SubmitOutcome::PossiblySucceeded { signature: None, detail: "missing data".into() };
        assert!(!possibly.is_success());
        assert!(possibly.record().is_none());
        assert_eq!(possibly.label(), "possibly_succeeded");
    }
}
