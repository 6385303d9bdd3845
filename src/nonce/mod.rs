//! Durable nonce accounts and offline transaction envelopes
//!
//! A normal transaction dies with its recent blockhash ~90 seconds after
//! signing. Durable nonces replace the blockhash with the value of an
//! on-chain nonce account, so a sender can build and sign completely
//! offline and any online relay can submit later.

use crate::clock::Clock;
use crate::store::{SecureStore, KEY_DURABLE_NONCE_ACCOUNT};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use solana_program::pubkey;
use solana_sdk::{
    hash::Hash,
    instruction::Instruction,
    pubkey::Pubkey,
    signature::{Keypair, Signature, Signer},
    system_instruction::{self, SystemInstruction},
    system_program,
    transaction::Transaction,
};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

#[cfg(feature = "rpc-client")]
use solana_sdk::commitment_config::CommitmentConfig;
#[cfg(feature = "rpc-client")]
use std::time::Duration;

/// Lamports funded into a fresh nonce account (~0.002 SOL)
pub const NONCE_FUNDING_LAMPORTS: u64 = 2_000_000;

/// Submission attempts before giving up
pub const SUBMIT_MAX_ATTEMPTS: u32 = 3;

/// Exponential backoff cap between submission attempts
pub const SUBMIT_BACKOFF_CAP_MS: u64 = 5_000;

/// Overall wall-clock budget for one submit call
pub const SUBMIT_BUDGET_SECS: u64 = 30;

/// Memo program, for the optional transfer memo instruction
pub const MEMO_PROGRAM_ID: Pubkey = pubkey!("MemoSq4gqABAXKb96qnH8TysNcWxMyWCqXgDLGmfcHr");

/// Solana-side errors
#[derive(Error, Debug)]
pub enum SolanaError {
    #[error("blockhash expired")]
    BlockhashExpired,

    #[error("nonce already used by another submission")]
    NonceAlreadyUsed,

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("RPC unavailable: {0}")]
    RpcUnavailable(String),

    #[error("submit failed: {0}")]
    SubmitFailed(String),

    #[error("invalid public key: {0}")]
    InvalidPubkey(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Nonce data fetched while online, consumed for offline signing
///
/// `used` flips once an envelope is built against the value; the nonce
/// is single-use and a second envelope would be dead on arrival.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedNonceValue {
    pub nonce_account: String,
    pub authority: String,
    pub nonce_value: String,
    pub fetched_at: u64,
    pub used: bool,
}

/// A signed transaction frozen against a nonce value
///
/// The serialized transaction's recent blockhash equals `nonce_value`
/// and its first instruction advances `nonce_account`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableNonceEnvelope {
    pub nonce_account: String,
    pub nonce_value: String,
    pub authority: String,
    pub serialized_tx: Vec<u8>,
    pub created_at: u64,
}

impl DurableNonceEnvelope {
    /// Compact form for mesh relay payloads
    pub fn to_base64(&self) -> Result<String, SolanaError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| SolanaError::Serialization(e.to_string()))?;
        Ok(BASE64.encode(json))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, SolanaError> {
        let json = BASE64
            .decode(encoded)
            .map_err(|e| SolanaError::Serialization(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| SolanaError::Serialization(e.to_string()))
    }

    pub fn transaction(&self) -> Result<Transaction, SolanaError> {
        bincode::deserialize(&self.serialized_tx)
            .map_err(|e| SolanaError::Serialization(e.to_string()))
    }

    /// Check the envelope invariants hold for the embedded transaction
    pub fn verify(&self) -> Result<(), SolanaError> {
        let tx = self.transaction()?;

        let expected_hash = Hash::from_str(&self.nonce_value)
            .map_err(|e| SolanaError::Serialization(e.to_string()))?;
        if tx.message.recent_blockhash != expected_hash {
            return Err(SolanaError::Serialization(
                "recent blockhash does not match nonce value".to_string(),
            ));
        }

        let first = tx
            .message
            .instructions
            .first()
            .ok_or_else(|| SolanaError::Serialization("transaction has no instructions".to_string()))?;
        let program_id = tx
            .message
            .account_keys
            .get(first.program_id_index as usize)
            .ok_or_else(|| SolanaError::Serialization("bad program index".to_string()))?;
        let advance = bincode::serialize(&SystemInstruction::AdvanceNonceAccount)
            .map_err(|e| SolanaError::Serialization(e.to_string()))?;
        if *program_id != system_program::id() || first.data != advance {
            return Err(SolanaError::Serialization(
                "first instruction is not AdvanceNonceAccount".to_string(),
            ));
        }

        Ok(())
    }
}

/// Inputs for an offline durable transfer
#[derive(Debug, Clone)]
pub struct DurableTransferParams {
    pub from: Pubkey,
    pub to: Pubkey,
    pub lamports: u64,
    pub memo: Option<String>,
    pub nonce_account: Pubkey,
    pub nonce_authority: Pubkey,
    pub nonce_value: Hash,
}

/// Manages the device's nonce account and envelope lifecycle
pub struct DurableNonceManager {
    store: Arc<dyn SecureStore>,
    clock: Arc<dyn Clock>,
    #[cfg(feature = "rpc-client")]
    rpc_url: Option<String>,
}

impl DurableNonceManager {
    pub fn new(store: Arc<dyn SecureStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            #[cfg(feature = "rpc-client")]
            rpc_url: None,
        }
    }

    #[cfg(feature = "rpc-client")]
    pub fn with_rpc(mut self, rpc_url: &str) -> Self {
        self.rpc_url = Some(rpc_url.to_string());
        self
    }

    /// The persisted nonce account address, if one was created
    pub fn stored_nonce_account(&self) -> Option<Pubkey> {
        let bytes = self.store.get(KEY_DURABLE_NONCE_ACCOUNT).ok()?;
        let address = String::from_utf8(bytes).ok()?;
        Pubkey::from_str(&address).ok()
    }

    /// Build the offline transfer transaction
    ///
    /// AdvanceNonce leads, then the transfer, then the optional memo; the
    /// fee payer is the sender and the nonce value stands in for a recent
    /// blockhash.
    pub fn build_durable_transfer(
        &self,
        params: &DurableTransferParams,
    ) -> Result<Transaction, SolanaError> {
        let mut instructions = vec![
            system_instruction::advance_nonce_account(
                &params.nonce_account,
                &params.nonce_authority,
            ),
            system_instruction::transfer(&params.from, &params.to, params.lamports),
        ];
        if let Some(memo) = &params.memo {
            instructions.push(Instruction::new_with_bytes(
                MEMO_PROGRAM_ID,
                memo.as_bytes(),
                vec![],
            ));
        }

        let mut tx = Transaction::new_with_payer(&instructions, Some(&params.from));
        tx.message.recent_blockhash = params.nonce_value;

        tracing::debug!(
            "built durable transfer: {} -> {} ({} lamports, nonce {})",
            params.from,
            params.to,
            params.lamports,
            params.nonce_account
        );
        Ok(tx)
    }

    /// Offline variant working from a cached nonce snapshot
    pub fn build_transfer_from_cache(
        &self,
        from: Pubkey,
        to: Pubkey,
        lamports: u64,
        memo: Option<String>,
        cached: &CachedNonceValue,
    ) -> Result<Transaction, SolanaError> {
        if cached.used {
            return Err(SolanaError::NonceAlreadyUsed);
        }
        let params = DurableTransferParams {
            from,
            to,
            lamports,
            memo,
            nonce_account: parse_pubkey(&cached.nonce_account)?,
            nonce_authority: parse_pubkey(&cached.authority)?,
            nonce_value: Hash::from_str(&cached.nonce_value)
                .map_err(|e| SolanaError::Serialization(e.to_string()))?,
        };
        self.build_durable_transfer(&params)
    }

    /// Sign and freeze a transaction into a relayable envelope
    pub fn sign_envelope(
        &self,
        mut tx: Transaction,
        signers: &[&Keypair],
    ) -> Result<DurableNonceEnvelope, SolanaError> {
        let nonce_value = tx.message.recent_blockhash;
        tx.try_sign(signers, nonce_value)
            .map_err(|e| SolanaError::Serialization(format!("signing failed: {e}")))?;

        let first = tx
            .message
            .instructions
            .first()
            .ok_or_else(|| SolanaError::Serialization("transaction has no instructions".to_string()))?;
        let nonce_account_index = *first
            .accounts
            .first()
            .ok_or_else(|| SolanaError::Serialization("advance instruction has no accounts".to_string()))?;
        let nonce_account = tx
            .message
            .account_keys
            .get(nonce_account_index as usize)
            .ok_or_else(|| SolanaError::Serialization("bad nonce account index".to_string()))?;

        let envelope = DurableNonceEnvelope {
            nonce_account: nonce_account.to_string(),
            nonce_value: nonce_value.to_string(),
            authority: signers
                .first()
                .map(|keypair| keypair.pubkey().to_string())
                .unwrap_or_default(),
            serialized_tx: bincode::serialize(&tx)
                .map_err(|e| SolanaError::Serialization(e.to_string()))?,
            created_at: self.clock.now_secs(),
        };
        envelope.verify()?;
        Ok(envelope)
    }
}

#[cfg(feature = "rpc-client")]
impl DurableNonceManager {
    fn rpc_url(&self) -> Result<String, SolanaError> {
        self.rpc_url
            .clone()
            .ok_or_else(|| SolanaError::RpcUnavailable("no RPC endpoint configured".to_string()))
    }

    /// Create and initialize a nonce account, persisting its address
    pub async fn create_nonce_account(
        &self,
        authority: &Keypair,
        funding_lamports: u64,
    ) -> Result<Pubkey, SolanaError> {
        let url = self.rpc_url()?;
        let nonce_keypair = Keypair::new();
        let nonce_pubkey = nonce_keypair.pubkey();
        let authority_pubkey = authority.pubkey();
        let authority_bytes = authority.to_bytes();
        let nonce_bytes = nonce_keypair.to_bytes();

        let signature = tokio::task::spawn_blocking(move || -> Result<Signature, SolanaError> {
            let client = blocking_client(&url);
            let rent = client
                .get_minimum_balance_for_rent_exemption(solana_sdk::nonce::State::size())
                .map_err(|e| SolanaError::RpcUnavailable(e.to_string()))?;
            let lamports = rent.max(funding_lamports);

            let balance = client
                .get_balance(&authority_pubkey)
                .map_err(|e| SolanaError::RpcUnavailable(e.to_string()))?;
            if balance < lamports {
                return Err(SolanaError::InsufficientFunds);
            }

            let instructions = system_instruction::create_nonce_account(
                &authority_pubkey,
                &nonce_pubkey,
                &authority_pubkey,
                lamports,
            );
            let blockhash = client
                .get_latest_blockhash()
                .map_err(|e| SolanaError::RpcUnavailable(e.to_string()))?;

            let authority = Keypair::from_bytes(&authority_bytes)
                .map_err(|e| SolanaError::Serialization(e.to_string()))?;
            let nonce_keypair = Keypair::from_bytes(&nonce_bytes)
                .map_err(|e| SolanaError::Serialization(e.to_string()))?;
            let mut tx = Transaction::new_with_payer(&instructions, Some(&authority_pubkey));
            tx.try_sign(&[&nonce_keypair, &authority], blockhash)
                .map_err(|e| SolanaError::Serialization(e.to_string()))?;

            client
                .send_and_confirm_transaction(&tx)
                .map_err(|e| classify_submit_error(&e.to_string()))
        })
        .await
        .map_err(|e| SolanaError::RpcUnavailable(format!("task join: {e}")))??;

        tracing::info!("created nonce account {} ({})", nonce_pubkey, signature);

        if let Err(e) = self
            .store
            .set(KEY_DURABLE_NONCE_ACCOUNT, nonce_pubkey.to_string().as_bytes())
        {
            tracing::warn!("could not persist nonce account address: {}", e);
        }
        Ok(nonce_pubkey)
    }

    /// Read the current on-chain nonce value
    pub async fn fetch_nonce_value(&self, nonce_account: &Pubkey) -> Result<Hash, SolanaError> {
        let data = self.fetch_nonce_data(nonce_account).await?;
        Ok(data.blockhash())
    }

    /// Snapshot nonce data for later offline use
    pub async fn prepare_cached_nonce(
        &self,
        nonce_account: &Pubkey,
    ) -> Result<CachedNonceValue, SolanaError> {
        let data = self.fetch_nonce_data(nonce_account).await?;
        let cached = CachedNonceValue {
            nonce_account: nonce_account.to_string(),
            authority: data.authority.to_string(),
            nonce_value: data.blockhash().to_string(),
            fetched_at: self.clock.now_secs(),
            used: false,
        };
        tracing::info!(
            "cached nonce value for offline use: {} (authority {})",
            cached.nonce_value,
            cached.authority
        );
        Ok(cached)
    }

    async fn fetch_nonce_data(
        &self,
        nonce_account: &Pubkey,
    ) -> Result<solana_sdk::nonce::state::Data, SolanaError> {
        let url = self.rpc_url()?;
        let nonce_account = *nonce_account;

        tokio::task::spawn_blocking(move || {
            let client = blocking_client(&url);
            let account = client
                .get_account(&nonce_account)
                .map_err(|e| SolanaError::RpcUnavailable(e.to_string()))?;

            // Nonce accounts are 80 bytes once initialized
            if account.data.len() < 80 {
                return Err(SolanaError::Serialization(
                    "nonce account data too small, not initialized".to_string(),
                ));
            }

            let versions: solana_sdk::nonce::state::Versions = bincode::deserialize(&account.data)
                .map_err(|e| SolanaError::Serialization(format!("nonce account: {e}")))?;
            match versions.state() {
                solana_sdk::nonce::State::Initialized(data) => Ok(data.clone()),
                _ => Err(SolanaError::Serialization(
                    "nonce account is not initialized".to_string(),
                )),
            }
        })
        .await
        .map_err(|e| SolanaError::RpcUnavailable(format!("task join: {e}")))?
    }

    /// Submit a signed envelope, retrying transient failures
    ///
    /// Verifies signatures locally, fails fast when the nonce moved on,
    /// and retries RPC unavailability with capped exponential backoff
    /// inside the overall budget.
    pub async fn submit(&self, envelope: &DurableNonceEnvelope) -> Result<Signature, SolanaError> {
        envelope.verify()?;
        let tx = envelope.transaction()?;
        tx.verify()
            .map_err(|e| SolanaError::SubmitFailed(format!("local signature check: {e}")))?;

        let nonce_account = parse_pubkey(&envelope.nonce_account)?;
        let expected_value = Hash::from_str(&envelope.nonce_value)
            .map_err(|e| SolanaError::Serialization(e.to_string()))?;

        let budget = Duration::from_secs(SUBMIT_BUDGET_SECS);
        tokio::time::timeout(budget, self.submit_with_retry(tx, nonce_account, expected_value))
            .await
            .map_err(|_| SolanaError::RpcUnavailable("submit budget exhausted".to_string()))?
    }

    async fn submit_with_retry(
        &self,
        tx: Transaction,
        nonce_account: Pubkey,
        expected_value: Hash,
    ) -> Result<Signature, SolanaError> {
        let url = self.rpc_url()?;
        let mut backoff_ms: u64 = 500;

        for attempt in 1..=SUBMIT_MAX_ATTEMPTS {
            let url = url.clone();
            let tx = tx.clone();
            let result = tokio::task::spawn_blocking(move || {
                blocking_client(&url)
                    .send_and_confirm_transaction(&tx)
                    .map_err(|e| classify_submit_error(&e.to_string()))
            })
            .await
            .map_err(|e| SolanaError::RpcUnavailable(format!("task join: {e}")))?;

            match result {
                Ok(signature) => {
                    tracing::info!("envelope submitted: {}", signature);
                    return Ok(signature);
                }
                Err(SolanaError::BlockhashExpired) => {
                    // "Blockhash not found" on a durable transaction means
                    // either a racing submit advanced the nonce, or the RPC
                    // node is behind. Ask the chain which.
                    match self.fetch_nonce_value(&nonce_account).await {
                        Ok(current) if current != expected_value => {
                            tracing::warn!("nonce advanced under us, envelope is dead");
                            return Err(SolanaError::NonceAlreadyUsed);
                        }
                        _ => {
                            tracing::debug!(
                                "nonce still current, retrying submit (attempt {attempt})"
                            );
                        }
                    }
                }
                Err(SolanaError::RpcUnavailable(msg)) => {
                    tracing::warn!("submit attempt {attempt} failed: {msg}");
                }
                Err(terminal) => return Err(terminal),
            }

            if attempt < SUBMIT_MAX_ATTEMPTS {
                // Jittered exponential backoff, capped
                let jitter = rand::random::<u64>() % 100;
                tokio::time::sleep(Duration::from_millis(backoff_ms + jitter)).await;
                backoff_ms = (backoff_ms * 2).min(SUBMIT_BACKOFF_CAP_MS);
            }
        }

        Err(SolanaError::RpcUnavailable(format!(
            "submit failed after {SUBMIT_MAX_ATTEMPTS} attempts"
        )))
    }

    /// Force a new nonce value, invalidating outstanding envelopes
    pub async fn advance_nonce(
        &self,
        nonce_account: &Pubkey,
        authority: &Keypair,
    ) -> Result<Signature, SolanaError> {
        let url = self.rpc_url()?;
        let nonce_account = *nonce_account;
        let authority_bytes = authority.to_bytes();

        tokio::task::spawn_blocking(move || {
            let client = blocking_client(&url);
            let authority = Keypair::from_bytes(&authority_bytes)
                .map_err(|e| SolanaError::Serialization(e.to_string()))?;
            let instruction =
                system_instruction::advance_nonce_account(&nonce_account, &authority.pubkey());
            let blockhash = client
                .get_latest_blockhash()
                .map_err(|e| SolanaError::RpcUnavailable(e.to_string()))?;

            let mut tx = Transaction::new_with_payer(&[instruction], Some(&authority.pubkey()));
            tx.try_sign(&[&authority], blockhash)
                .map_err(|e| SolanaError::Serialization(e.to_string()))?;
            client
                .send_and_confirm_transaction(&tx)
                .map_err(|e| classify_submit_error(&e.to_string()))
        })
        .await
        .map_err(|e| SolanaError::RpcUnavailable(format!("task join: {e}")))?
    }

    /// Drain and close the nonce account
    pub async fn close_nonce_account(
        &self,
        nonce_account: &Pubkey,
        authority: &Keypair,
        to: &Pubkey,
    ) -> Result<Signature, SolanaError> {
        let url = self.rpc_url()?;
        let nonce_account = *nonce_account;
        let to = *to;
        let authority_bytes = authority.to_bytes();

        let signature = tokio::task::spawn_blocking(move || {
            let client = blocking_client(&url);
            let authority = Keypair::from_bytes(&authority_bytes)
                .map_err(|e| SolanaError::Serialization(e.to_string()))?;
            let balance = client
                .get_balance(&nonce_account)
                .map_err(|e| SolanaError::RpcUnavailable(e.to_string()))?;

            let instruction = system_instruction::withdraw_nonce_account(
                &nonce_account,
                &authority.pubkey(),
                &to,
                balance,
            );
            let blockhash = client
                .get_latest_blockhash()
                .map_err(|e| SolanaError::RpcUnavailable(e.to_string()))?;

            let mut tx = Transaction::new_with_payer(&[instruction], Some(&authority.pubkey()));
            tx.try_sign(&[&authority], blockhash)
                .map_err(|e| SolanaError::Serialization(e.to_string()))?;
            client
                .send_and_confirm_transaction(&tx)
                .map_err(|e| classify_submit_error(&e.to_string()))
        })
        .await
        .map_err(|e| SolanaError::RpcUnavailable(format!("task join: {e}")))??;

        if let Err(e) = self.store.delete(KEY_DURABLE_NONCE_ACCOUNT) {
            tracing::warn!("could not clear stored nonce account: {}", e);
        }
        tracing::info!("closed nonce account {} ({})", nonce_account, signature);
        Ok(signature)
    }
}

#[cfg(feature = "rpc-client")]
fn blocking_client(url: &str) -> solana_client::rpc_client::RpcClient {
    solana_client::rpc_client::RpcClient::new_with_commitment(
        url.to_string(),
        CommitmentConfig::confirmed(),
    )
}

/// Map an RPC error message onto the submit taxonomy
pub fn classify_submit_error(message: &str) -> SolanaError {
    let lower = message.to_lowercase();
    if lower.contains("blockhash not found") {
        SolanaError::BlockhashExpired
    } else if lower.contains("insufficient funds") || lower.contains("insufficient lamports") {
        SolanaError::InsufficientFunds
    } else if lower.contains("connection")
        || lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("unavailable")
        || lower.contains("dns")
    {
        SolanaError::RpcUnavailable(message.to_string())
    } else {
        SolanaError::SubmitFailed(message.to_string())
    }
}

fn parse_pubkey(value: &str) -> Result<Pubkey, SolanaError> {
    Pubkey::from_str(value).map_err(|e| SolanaError::InvalidPubkey(format!("{value}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemorySecureStore;

    fn manager() -> DurableNonceManager {
        DurableNonceManager::new(
            Arc::new(MemorySecureStore::new()),
            Arc::new(ManualClock::new(1_700_000_000_000)),
        )
    }

    fn cached_nonce(authority: &Keypair) -> CachedNonceValue {
        CachedNonceValue {
            nonce_account: Keypair::new().pubkey().to_string(),
            authority: authority.pubkey().to_string(),
            nonce_value: Hash::new_unique().to_string(),
            fetched_at: 1_700_000_000,
            used: false,
        }
    }

    #[test]
    fn test_build_durable_transfer_layout() {
        let manager = manager();
        let sender = Keypair::new();
        let cached = cached_nonce(&sender);
        let to = Pubkey::new_unique();

        let tx = manager
            .build_transfer_from_cache(sender.pubkey(), to, 100_000_000, None, &cached)
            .unwrap();

        assert_eq!(tx.message.instructions.len(), 2);
        assert_eq!(tx.message.recent_blockhash.to_string(), cached.nonce_value);
        // AdvanceNonce leads
        let first = &tx.message.instructions[0];
        let program = tx.message.account_keys[first.program_id_index as usize];
        assert_eq!(program, system_program::id());
        assert_eq!(
            first.data,
            bincode::serialize(&SystemInstruction::AdvanceNonceAccount).unwrap()
        );
        // Fee payer is the sender
        assert_eq!(tx.message.account_keys[0], sender.pubkey());
    }

    #[test]
    fn test_memo_instruction_appended() {
        let manager = manager();
        let sender = Keypair::new();
        let cached = cached_nonce(&sender);

        let tx = manager
            .build_transfer_from_cache(
                sender.pubkey(),
                Pubkey::new_unique(),
                1,
                Some("coffee".to_string()),
                &cached,
            )
            .unwrap();

        assert_eq!(tx.message.instructions.len(), 3);
        let memo = tx.message.instructions.last().unwrap();
        assert_eq!(
            tx.message.account_keys[memo.program_id_index as usize],
            MEMO_PROGRAM_ID
        );
        assert_eq!(memo.data, b"coffee");
    }

    #[test]
    fn test_used_cache_refused() {
        let manager = manager();
        let sender = Keypair::new();
        let mut cached = cached_nonce(&sender);
        cached.used = true;

        assert!(matches!(
            manager.build_transfer_from_cache(
                sender.pubkey(),
                Pubkey::new_unique(),
                1,
                None,
                &cached
            ),
            Err(SolanaError::NonceAlreadyUsed)
        ));
    }

    #[test]
    fn test_sign_envelope_round_trip() {
        let manager = manager();
        let sender = Keypair::new();
        let cached = cached_nonce(&sender);

        let tx = manager
            .build_transfer_from_cache(sender.pubkey(), Pubkey::new_unique(), 42, None, &cached)
            .unwrap();
        let envelope = manager.sign_envelope(tx, &[&sender]).unwrap();

        assert_eq!(envelope.nonce_account, cached.nonce_account);
        assert_eq!(envelope.nonce_value, cached.nonce_value);
        assert_eq!(envelope.authority, sender.pubkey().to_string());
        envelope.verify().unwrap();

        let restored = DurableNonceEnvelope::from_base64(&envelope.to_base64().unwrap()).unwrap();
        assert_eq!(restored.serialized_tx, envelope.serialized_tx);
        restored.verify().unwrap();
        restored.transaction().unwrap().verify().unwrap();
    }

    #[test]
    fn test_envelope_verify_rejects_wrong_first_instruction() {
        let sender = Keypair::new();
        let to = Pubkey::new_unique();
        let hash = Hash::new_unique();

        // Plain transfer with no AdvanceNonce
        let mut tx = Transaction::new_with_payer(
            &[system_instruction::transfer(&sender.pubkey(), &to, 1)],
            Some(&sender.pubkey()),
        );
        tx.message.recent_blockhash = hash;
        tx.try_sign(&[&sender], hash).unwrap();

        let envelope = DurableNonceEnvelope {
            nonce_account: to.to_string(),
            nonce_value: hash.to_string(),
            authority: sender.pubkey().to_string(),
            serialized_tx: bincode::serialize(&tx).unwrap(),
            created_at: 0,
        };
        assert!(envelope.verify().is_err());
    }

    #[test]
    fn test_classify_submit_errors() {
        assert!(matches!(
            classify_submit_error("Blockhash not found"),
            SolanaError::BlockhashExpired
        ));
        assert!(matches!(
            classify_submit_error("Error: insufficient funds for fee"),
            SolanaError::InsufficientFunds
        ));
        assert!(matches!(
            classify_submit_error("connection refused"),
            SolanaError::RpcUnavailable(_)
        ));
        assert!(matches!(
            classify_submit_error("custom program error 0x1"),
            SolanaError::SubmitFailed(_)
        ));
    }

    #[test]
    fn test_envelope_base64_garbage_rejected() {
        assert!(DurableNonceEnvelope::from_base64("not-base64!!!").is_err());
    }
}
