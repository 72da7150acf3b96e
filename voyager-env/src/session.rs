//! # Validator Session
//!
//! One episode's chain identity: a fresh validator, a fresh agent keypair
//! funded by airdrop, and the RPC client that talks to both.

use crate::config::{EnvConfig, RpcConfig, LAMPORTS_PER_SOL};
use crate::error::{self, Result};
use crate::rpc::RpcClient;
use crate::submission::{submit_transaction, SubmitOutcome, TransactionSubmitter};
use crate::validator::ValidatorProcess;
use serde::{Deserialize, Serialize};
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};
use tracing::{info, warn};

/// Snapshot handed to the planner. Chain fields come from the session, the
/// rest is filled in by whoever drives the episode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub agent_pubkey: String,
    pub sol_balance: f64,
    pub block_height: u64,
    pub last_tx_success: bool,
    pub last_tx_error: Option<String>,
    pub protocols_discovered: usize,
    pub instructions_discovered: usize,
    pub skills: usize,
}

impl Observation {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

pub struct ValidatorSession {
    validator: ValidatorProcess,
    keypair: Keypair,
    rpc: RpcClient,
    rpc_config: RpcConfig,
    funded: bool,
}

impl ValidatorSession {
    /// Start a validator, create the agent keypair and fund it.
    ///
    /// If anything after the launch fails the validator is stopped before
    /// the error is returned.
    pub async fn open(config: &EnvConfig) -> Result<Self> {
        let validator = ValidatorProcess::start(&config.validator).await?;
        let rpc = match RpcClient::new(
            config.rpc.local_url.clone(),
            config.rpc.request_timeout(),
            config.rpc.commitment.clone(),
        ) {
            Ok(rpc) => rpc,
            Err(e) => {
                let mut validator = validator;
                validator.stop().await.ok();
                return Err(e);
            }
        };

        let mut session = Self {
            validator,
            keypair: Keypair::new(),
            rpc,
            rpc_config: config.rpc.clone(),
            funded: false,
        };

        if let Err(e) = session.fund(config.agent.airdrop_lamports).await {
            if let Err(stop_err) = session.close().await {
                warn!(error = %stop_err, "validator cleanup after failed funding");
            }
            return Err(e);
        }
        Ok(session)
    }

    async fn fund(&mut self, lamports: u64) -> Result<()> {
        let pubkey = self.keypair.pubkey();
        let signature = self.rpc.request_airdrop(&pubkey, lamports).await.map_err(|e| {
            error::not_funded()
                .with_operation("session::fund")
                .with_context("reason", e.to_string())
                .set_source(e)
        })?;
        self.rpc
            .confirm_transaction(
                &signature,
                self.rpc_config.confirm_timeout(),
                self.rpc_config.poll_interval(),
            )
            .await
            .map_err(|e| {
                error::not_funded()
                    .with_operation("session::fund")
                    .with_context("signature", signature.to_string())
                    .set_source(e)
            })?;
        self.funded = true;
        info!(agent = %pubkey, sol = lamports as f64 / LAMPORTS_PER_SOL as f64, "agent funded");
        Ok(())
    }

    pub fn is_funded(&self) -> bool {
        self.funded
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    pub fn validator_pid(&self) -> Option<u32> {
        self.validator.pid()
    }

    /// Chain-side observation; failed lookups leave zeros
    pub async fn observe(&self) -> Observation {
        let pubkey = self.keypair.pubkey();
        let sol_balance = match self.rpc.get_balance(&pubkey).await {
            Ok(lamports) => lamports as f64 / LAMPORTS_PER_SOL as f64,
            Err(e) => {
                warn!(error = %e, "balance lookup failed");
                0.0
            }
        };
        let block_height = match self.rpc.get_block_height().await {
            Ok(height) => height,
            Err(e) => {
                warn!(error = %e, "block height lookup failed");
                0
            }
        };
        Observation {
            agent_pubkey: pubkey.to_string(),
            sol_balance,
            block_height,
            ..Default::default()
        }
    }

    /// Stop the validator; safe to call more than once
    pub async fn close(&mut self) -> Result<()> {
        self.funded = false;
        self.validator.stop().await
    }
}

impl TransactionSubmitter for ValidatorSession {
    fn agent_pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    async fn latest_blockhash(&self) -> Result<Hash> {
        self.rpc.get_latest_blockhash().await
    }

    async fn submit(&self, unsigned: &[u8], blockhash: Hash) -> SubmitOutcome {
        if !self.funded {
            return SubmitOutcome::Failed(error::not_funded());
        }
        submit_transaction(&self.rpc, &self.keypair, unsigned, blockhash, &self.rpc_config).await
    }
}
