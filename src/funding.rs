//! Just-in-time funding of the ephemeral identity from the custodial
//! parent account.

use async_trait::async_trait;
use solana_pubkey::Pubkey;
use std::fmt;
use tracing::info;

use crate::config::EngineConfig;
use crate::identity::EphemeralIdentity;

/// Opaque settlement reference returned by the funding port (a signature,
/// a transfer id, whatever the custodial signer tracks).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReference(String);

impl TransferReference {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }
}

impl fmt::Display for TransferReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error surfaced by a funding port implementation.
#[derive(Debug, thiserror::Error)]
#[error("funding port: {0}")]
pub struct FundingPortError(pub String);

/// A parent-side transfer could not be submitted. Fatal: the engine never
/// retries funding.
#[derive(Debug, thiserror::Error)]
pub enum FundingError {
    #[error("token funding transfer rejected")]
    TokenTransfer(#[source] FundingPortError),
    #[error("native funding transfer rejected")]
    NativeTransfer(#[source] FundingPortError),
}

/// The external service that controls the long-lived parent account and
/// moves value out of it on the engine's behalf. The engine never sees
/// the parent's key material; if the underlying signer requires
/// per-account sequencing, serializing access is the implementation's
/// responsibility.
#[async_trait]
pub trait CustodialFundingPort: Send + Sync {
    /// Transfers `amount` to `recipient`. `mint: Some(..)` moves token
    /// base units of that mint; `mint: None` moves native lamports.
    async fn send_tokens(
        &self,
        recipient: &Pubkey,
        amount: u64,
        mint: Option<&Pubkey>,
    ) -> Result<TransferReference, FundingPortError>;
}

/// One confirmed funding transfer.
#[derive(Debug, Clone)]
pub struct FundedTransfer {
    pub amount: u64,
    pub reference: TransferReference,
}

/// The two transfers that funded an ephemeral identity.
#[derive(Debug, Clone)]
pub struct FundingRecord {
    pub token: FundedTransfer,
    pub native: FundedTransfer,
}

/// Funds `identity` with `payment_amount` of `mint` plus `fee_amount`
/// lamports, then waits the settlement grace period.
///
/// Issues exactly one token transfer and one native transfer. The grace
/// sleep stands in for polling the parent-side transactions; ledger
/// finality of the ephemeral side is verified separately. Once the first
/// transfer has been submitted, real value may have left the parent
/// wallet: from here on a sweep is mandatory on every path.
pub async fn fund<F: CustodialFundingPort + ?Sized>(
    port: &F,
    identity: &EphemeralIdentity,
    payment_amount: u64,
    fee_amount: u64,
    mint: &Pubkey,
    config: &EngineConfig,
) -> Result<FundingRecord, FundingError> {
    let recipient = identity.pubkey();

    let token_reference = port
        .send_tokens(&recipient, payment_amount, Some(mint))
        .await
        .map_err(FundingError::TokenTransfer)?;
    info!(
        address = %recipient,
        amount = payment_amount,
        mint = %mint,
        reference = %token_reference,
        "token funding transfer submitted"
    );

    let native_reference = port
        .send_tokens(&recipient, fee_amount, None)
        .await
        .map_err(FundingError::NativeTransfer)?;
    info!(
        address = %recipient,
        lamports = fee_amount,
        reference = %native_reference,
        "native funding transfer submitted"
    );

    tokio::time::sleep(config.settlement_grace()).await;

    Ok(FundingRecord {
        token: FundedTransfer {
            amount: payment_amount,
            reference: token_reference,
        },
        native: FundedTransfer {
            amount: fee_amount,
            reference: native_reference,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPort {
        calls: Mutex<Vec<(Pubkey, u64, Option<Pubkey>)>>,
        fail_native: bool,
    }

    #[async_trait]
    impl CustodialFundingPort for RecordingPort {
        async fn send_tokens(
            &self,
            recipient: &Pubkey,
            amount: u64,
            mint: Option<&Pubkey>,
        ) -> Result<TransferReference, FundingPortError> {
            self.calls
                .lock()
                .unwrap()
                .push((*recipient, amount, mint.copied()));
            if self.fail_native && mint.is_none() {
                return Err(FundingPortError("signer unavailable".to_string()));
            }
            Ok(TransferReference::new(format!("ref-{amount}")))
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            settlement_grace_ms: 1,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_token_transfer_issued_before_native() {
        let port = RecordingPort::default();
        let identity = EphemeralIdentity::generate();
        let mint = Pubkey::new_unique();

        let record = fund(&port, &identity, 10_000, 1_000_000, &mint, &fast_config())
            .await
            .unwrap();

        let calls = port.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], (identity.pubkey(), 10_000, Some(mint)));
        assert_eq!(calls[1], (identity.pubkey(), 1_000_000, None));
        assert_eq!(record.token.amount, 10_000);
        assert_eq!(record.native.amount, 1_000_000);
    }

    #[tokio::test]
    async fn test_native_failure_is_distinguished() {
        let port = RecordingPort {
            fail_native: true,
            ..RecordingPort::default()
        };
        let identity = EphemeralIdentity::generate();
        let mint = Pubkey::new_unique();

        let err = fund(&port, &identity, 10_000, 1_000_000, &mint, &fast_config())
            .await
            .unwrap_err();
        assert!(matches!(err, FundingError::NativeTransfer(_)));
        // The token transfer was already submitted: the caller must sweep.
        assert_eq!(port.calls.lock().unwrap().len(), 2);
    }
}
