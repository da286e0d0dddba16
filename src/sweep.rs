//! Draining the ephemeral identity back into the parent wallet.
//!
//! Sweep is best-effort cleanup: it never fails outward, because it runs
//! on failure paths where the original error must stay the one reported.
//! Sub-step failures are logged with the ephemeral address and recorded
//! on the result for manual recovery.

use solana_compute_budget_interface::ComputeBudgetInstruction;
use solana_pubkey::Pubkey;
use solana_transaction::Instruction;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::identity::EphemeralIdentity;
use crate::ledger::{LedgerRpc, send_and_confirm};
use crate::token::{Mint, associated_token_address, fetch_mint};
use crate::tx::{compile_transaction, sign_transaction};

/// A sweep sub-step that failed. Recorded, never raised.
#[derive(Debug, Clone)]
pub struct SweepWarning {
    pub stage: &'static str,
    pub message: String,
}

/// Summary of funds recovered from an ephemeral identity. An all-zero
/// result is valid: it means nothing was left to recover.
#[derive(Debug, Clone)]
pub struct SweepResult {
    /// Base58 address of the swept identity, kept for auditing and for
    /// manual recovery should a warning be recorded.
    pub address: String,
    /// Payment-token base units returned to the parent.
    pub token_swept: u64,
    /// Lamports returned to the parent, excluding reclaimed rent.
    pub lamports_swept: u64,
    /// Lamports reclaimed by closing the identity's token account.
    pub rent_reclaimed: u64,
    pub warnings: Vec<SweepWarning>,
}

impl SweepResult {
    fn empty(address: String) -> Self {
        Self {
            address,
            token_swept: 0,
            lamports_swept: 0,
            rent_reclaimed: 0,
            warnings: Vec::new(),
        }
    }

    fn warn(&mut self, stage: &'static str, message: String) {
        warn!(address = %self.address, stage, %message, "sweep sub-step failed");
        self.warnings.push(SweepWarning { stage, message });
    }

    /// True when every attempted sub-step succeeded.
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

struct TokenLeg {
    instructions: Vec<Instruction>,
    amount: u64,
    rent: u64,
}

/// Builds the instructions that drain the identity's token account:
/// a full-balance transfer to the parent's associated token account (the
/// parent funded this flow from it, so it exists) and a close of the
/// source account with the rent paid to the parent. Returns `None` when
/// the identity has no token account at all.
async fn token_leg<L: LedgerRpc>(
    ledger: &L,
    owner: &Pubkey,
    parent: &Pubkey,
    mint_address: &Pubkey,
) -> Result<Option<TokenLeg>, String> {
    let mint = fetch_mint(ledger, mint_address)
        .await
        .map_err(|e| e.to_string())?;
    let source = associated_token_address(owner, &mint.token_program(), mint_address);
    let amount = match ledger
        .get_token_account_balance(&source)
        .await
        .map_err(|e| e.to_string())?
    {
        Some(amount) => amount,
        None => return Ok(None),
    };
    let rent = ledger
        .get_account(&source)
        .await
        .map_err(|e| e.to_string())?
        .map(|account| account.lamports)
        .unwrap_or(0);

    let mut instructions = Vec::with_capacity(2);
    if amount > 0 {
        let destination = associated_token_address(parent, &mint.token_program(), mint_address);
        let transfer_ix = match mint {
            Mint::Token { decimals } => spl_token::instruction::transfer_checked(
                &spl_token::id(),
                &source,
                mint_address,
                &destination,
                owner,
                &[],
                amount,
                decimals,
            ),
            Mint::Token2022 { decimals } => spl_token_2022::instruction::transfer_checked(
                &spl_token_2022::id(),
                &source,
                mint_address,
                &destination,
                owner,
                &[],
                amount,
                decimals,
            ),
        }
        .map_err(|e| format!("transfer instruction: {e}"))?;
        instructions.push(transfer_ix);
    }
    let close_ix = match mint {
        Mint::Token { .. } => {
            spl_token::instruction::close_account(&spl_token::id(), &source, parent, owner, &[])
        }
        Mint::Token2022 { .. } => spl_token_2022::instruction::close_account(
            &spl_token_2022::id(),
            &source,
            parent,
            owner,
            &[],
        ),
    }
    .map_err(|e| format!("close instruction: {e}"))?;
    instructions.push(close_ix);

    Ok(Some(TokenLeg {
        instructions,
        amount,
        rent,
    }))
}

async fn submit<L: LedgerRpc>(
    ledger: &L,
    identity: &EphemeralIdentity,
    instructions: &[Instruction],
    config: &EngineConfig,
) -> Result<(), String> {
    let recent_blockhash = ledger
        .get_latest_blockhash()
        .await
        .map_err(|e| e.to_string())?;
    let mut priced = Vec::with_capacity(1 + instructions.len());
    priced.push(ComputeBudgetInstruction::set_compute_unit_price(
        config.compute_unit_price_micro_lamports,
    ));
    priced.extend_from_slice(instructions);
    let tx = compile_transaction(&identity.pubkey(), &priced, recent_blockhash)
        .map_err(|e| e.to_string())?;
    let signed = sign_transaction(tx, &identity.signer()).map_err(|e| e.to_string())?;
    send_and_confirm(ledger, &signed, config)
        .await
        .map_err(|e| e.to_string())?;
    Ok(())
}

/// Drains everything recoverable from `identity` back to `parent`: the
/// full token balance, the token account's rent deposit, and all lamports
/// above the fee reserve, batched into one transaction where possible.
///
/// Never sweeps an amount that would leave the identity unable to pay the
/// sweep transaction's own fee: undersweeping by
/// [`EngineConfig::fee_reserve_lamports`] is correct behavior.
pub async fn sweep<L: LedgerRpc>(
    ledger: &L,
    identity: &EphemeralIdentity,
    parent: &Pubkey,
    mint: Option<&Pubkey>,
    config: &EngineConfig,
) -> SweepResult {
    let owner = identity.pubkey();
    let mut result = SweepResult::empty(owner.to_string());

    let token = match mint {
        Some(mint_address) => match token_leg(ledger, &owner, parent, mint_address).await {
            Ok(leg) => leg,
            Err(message) => {
                result.warn("token", message);
                None
            }
        },
        None => None,
    };

    let lamports = match ledger.get_balance(&owner).await {
        Ok(lamports) => lamports,
        Err(e) => {
            result.warn("native", format!("balance read failed: {e}"));
            0
        }
    };
    let sweepable = lamports.saturating_sub(config.fee_reserve_lamports);
    let native_ix = (sweepable > 0)
        .then(|| solana_system_interface::instruction::transfer(&owner, parent, sweepable));

    if token.is_none() && native_ix.is_none() {
        debug!(address = %owner, lamports, "nothing to sweep");
        return result;
    }

    let mut instructions: Vec<Instruction> = Vec::with_capacity(3);
    if let Some(leg) = &token {
        instructions.extend(leg.instructions.iter().cloned());
    }
    if let Some(ix) = &native_ix {
        instructions.push(ix.clone());
    }

    match submit(ledger, identity, &instructions, config).await {
        Ok(()) => {
            if let Some(leg) = token {
                result.token_swept = leg.amount;
                result.rent_reclaimed = leg.rent;
            }
            result.lamports_swept = sweepable;
            info!(
                address = %owner,
                token_swept = result.token_swept,
                lamports_swept = result.lamports_swept,
                rent_reclaimed = result.rent_reclaimed,
                "sweep complete"
            );
        }
        Err(message) => {
            if let (Some(_), Some(ix)) = (&token, &native_ix) {
                result.warn("token", format!("batched sweep failed: {message}"));
                // The token leg is what usually trips (missing parent ATA,
                // already-closed account); retry lamports on their own.
                match submit(ledger, identity, std::slice::from_ref(ix), config).await {
                    Ok(()) => {
                        result.lamports_swept = sweepable;
                        info!(
                            address = %owner,
                            lamports_swept = sweepable,
                            "native-only sweep complete"
                        );
                    }
                    Err(message) => result.warn("native", message),
                }
            } else if token.is_some() {
                result.warn("token", message);
            } else {
                result.warn("native", message);
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerError;
    use solana_account::Account;
    use solana_message::Hash;
    use solana_signature::Signature;
    use solana_transaction::versioned::VersionedTransaction;
    use spl_token::solana_program::program_pack::Pack;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct SweepLedger {
        mint: Pubkey,
        owner_ata: Pubkey,
        lamports: u64,
        token_amount: Option<u64>,
        ata_rent: u64,
        sent: Mutex<Vec<VersionedTransaction>>,
        fail_first_sends: AtomicU32,
    }

    impl SweepLedger {
        fn new(identity: &EphemeralIdentity, lamports: u64, token_amount: Option<u64>) -> Self {
            let mint = Pubkey::new_unique();
            let owner_ata =
                associated_token_address(&identity.pubkey(), &spl_token::id(), &mint);
            Self {
                mint,
                owner_ata,
                lamports,
                token_amount,
                ata_rent: 2_039_280,
                sent: Mutex::new(vec![]),
                fail_first_sends: AtomicU32::new(0),
            }
        }
    }

    impl LedgerRpc for SweepLedger {
        fn get_balance(
            &self,
            _address: &Pubkey,
        ) -> impl Future<Output = Result<u64, LedgerError>> + Send {
            let lamports = self.lamports;
            async move { Ok(lamports) }
        }
        fn get_token_account_balance(
            &self,
            token_account: &Pubkey,
        ) -> impl Future<Output = Result<Option<u64>, LedgerError>> + Send {
            let amount = (*token_account == self.owner_ata)
                .then_some(self.token_amount)
                .flatten();
            async move { Ok(amount) }
        }
        fn get_account(
            &self,
            address: &Pubkey,
        ) -> impl Future<Output = Result<Option<Account>, LedgerError>> + Send {
            let account = if *address == self.mint {
                let state = spl_token::state::Mint {
                    mint_authority: None.into(),
                    supply: 0,
                    decimals: 6,
                    is_initialized: true,
                    freeze_authority: None.into(),
                };
                let mut data = vec![0u8; spl_token::state::Mint::LEN];
                spl_token::state::Mint::pack(state, &mut data).unwrap();
                Some(Account {
                    lamports: 1,
                    data,
                    owner: spl_token::id(),
                    executable: false,
                    rent_epoch: 0,
                })
            } else if *address == self.owner_ata && self.token_amount.is_some() {
                Some(Account {
                    lamports: self.ata_rent,
                    data: vec![],
                    owner: spl_token::id(),
                    executable: false,
                    rent_epoch: 0,
                })
            } else {
                None
            };
            async move { Ok(account) }
        }
        fn get_latest_blockhash(&self) -> impl Future<Output = Result<Hash, LedgerError>> + Send {
            async move { Ok(Hash::default()) }
        }
        fn send_transaction(
            &self,
            tx: &VersionedTransaction,
        ) -> impl Future<Output = Result<Signature, LedgerError>> + Send {
            let fail = self
                .fail_first_sends
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !fail {
                self.sent.lock().unwrap().push(tx.clone());
            }
            async move {
                if fail {
                    Err(LedgerError::Custom("node rejected transaction".to_string()))
                } else {
                    Ok(Signature::default())
                }
            }
        }
        fn confirm_transaction(
            &self,
            _signature: &Signature,
        ) -> impl Future<Output = Result<bool, LedgerError>> + Send {
            async move { Ok(true) }
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            confirm_backoff_ms: 1,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_batched_sweep_of_token_and_native() {
        let identity = EphemeralIdentity::generate();
        let ledger = SweepLedger::new(&identity, 1_000_000, Some(8_000));
        let parent = Pubkey::new_unique();
        let mint = ledger.mint;

        let result = sweep(&ledger, &identity, &parent, Some(&mint), &fast_config()).await;

        assert!(result.is_clean());
        assert_eq!(result.token_swept, 8_000);
        assert_eq!(result.lamports_swept, 1_000_000 - 5_000);
        assert_eq!(result.rent_reclaimed, 2_039_280);
        let sent = ledger.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        // compute price + transfer_checked + close_account + system transfer
        assert_eq!(sent[0].message.instructions().len(), 4);
    }

    #[tokio::test]
    async fn test_undersweep_below_fee_reserve() {
        let identity = EphemeralIdentity::generate();
        let ledger = SweepLedger::new(&identity, 4_000, None);
        let parent = Pubkey::new_unique();
        let mint = ledger.mint;

        let result = sweep(&ledger, &identity, &parent, Some(&mint), &fast_config()).await;

        assert!(result.is_clean());
        assert_eq!(result.lamports_swept, 0);
        assert_eq!(result.token_swept, 0);
        assert!(ledger.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_token_account_still_closed_for_rent() {
        let identity = EphemeralIdentity::generate();
        let ledger = SweepLedger::new(&identity, 1_000_000, Some(0));
        let parent = Pubkey::new_unique();
        let mint = ledger.mint;

        let result = sweep(&ledger, &identity, &parent, Some(&mint), &fast_config()).await;

        assert!(result.is_clean());
        assert_eq!(result.token_swept, 0);
        assert_eq!(result.rent_reclaimed, 2_039_280);
        let sent = ledger.sent.lock().unwrap();
        // compute price + close_account + system transfer, no token transfer
        assert_eq!(sent[0].message.instructions().len(), 3);
    }

    #[tokio::test]
    async fn test_batched_failure_falls_back_to_native_only() {
        let identity = EphemeralIdentity::generate();
        let ledger = SweepLedger::new(&identity, 1_000_000, Some(8_000));
        ledger.fail_first_sends.store(1, Ordering::SeqCst);
        let parent = Pubkey::new_unique();
        let mint = ledger.mint;

        let result = sweep(&ledger, &identity, &parent, Some(&mint), &fast_config()).await;

        assert!(!result.is_clean());
        assert_eq!(result.token_swept, 0);
        assert_eq!(result.lamports_swept, 1_000_000 - 5_000);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].stage, "token");
        let sent = ledger.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        // compute price + system transfer only
        assert_eq!(sent[0].message.instructions().len(), 2);
    }
}
