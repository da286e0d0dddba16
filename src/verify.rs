//! Settlement verification: turning "maybe funded" into go/no-go.
//!
//! A paid call against an unfunded identity wastes the remote call and
//! produces a confusing downstream error, so nothing proceeds until both
//! funding legs are visible on-chain.

use solana_pubkey::Pubkey;
use tracing::debug;

use crate::config::EngineConfig;
use crate::identity::EphemeralIdentity;
use crate::ledger::LedgerRpc;
use crate::token::{TokenError, associated_token_address, fetch_mint};

#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    /// The funding transfers never became visible within the polling
    /// budget. A read failure counts as not-visible for that attempt.
    #[error(
        "funding for {address} not settled after {attempts} attempts \
         (native seen: {native_seen}, token seen: {token_seen})"
    )]
    NotSettled {
        address: String,
        attempts: u32,
        native_seen: bool,
        token_seen: bool,
    },
    /// The payment mint itself could not be read, so the token account
    /// address cannot even be derived.
    #[error(transparent)]
    Mint(#[from] TokenError),
}

/// Balances observed on the ephemeral identity at go/no-go time.
#[derive(Debug, Clone, Copy)]
pub struct VerifiedBalances {
    pub lamports: u64,
    pub token_amount: u64,
}

/// Re-reads the ephemeral identity's balances until the native balance is
/// positive and the token account holds at least `expected_min_token`, or
/// the bounded retry budget runs out.
///
/// The two funding transfers are issued in a fixed order but settle in no
/// guaranteed order, so both legs are checked independently on every
/// attempt.
pub async fn verify<L: LedgerRpc>(
    ledger: &L,
    identity: &EphemeralIdentity,
    expected_min_token: u64,
    mint: &Pubkey,
    config: &EngineConfig,
) -> Result<VerifiedBalances, VerificationError> {
    let owner = identity.pubkey();
    let mint_info = fetch_mint(ledger, mint).await?;
    let token_account = associated_token_address(&owner, &mint_info.token_program(), mint);

    let mut native_seen = false;
    let mut token_seen = false;
    for attempt in 0..config.confirm_retries {
        let lamports = ledger.get_balance(&owner).await.unwrap_or(0);
        let token_amount = ledger
            .get_token_account_balance(&token_account)
            .await
            .unwrap_or(None)
            .unwrap_or(0);

        native_seen = lamports > 0;
        token_seen = token_amount >= expected_min_token;
        if native_seen && token_seen {
            debug!(
                address = %owner,
                lamports,
                token_amount,
                attempt,
                "funding settled"
            );
            return Ok(VerifiedBalances {
                lamports,
                token_amount,
            });
        }

        debug!(
            address = %owner,
            native_seen,
            token_seen,
            attempt,
            "funding not yet settled"
        );
        if attempt + 1 < config.confirm_retries {
            tokio::time::sleep(config.confirm_backoff(attempt)).await;
        }
    }

    Err(VerificationError::NotSettled {
        address: owner.to_string(),
        attempts: config.confirm_retries,
        native_seen,
        token_seen,
    })
}
