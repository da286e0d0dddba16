//! Read-side ledger access.
//!
//! [`LedgerRpc`] is the narrow RPC surface the engine needs: balance reads,
//! a blockhash, transaction submission, and confirmation. It is implemented
//! for the nonblocking [`RpcClient`] and, by delegation, for `Arc<T>`, so
//! an `Arc<RpcClient>` can be shared read-only across concurrent flows.

use solana_account::Account;
use solana_client::client_error::{ClientError, ClientErrorKind};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcSendTransactionConfig;
use solana_commitment_config::CommitmentConfig;
use solana_message::Hash;
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use solana_transaction::versioned::VersionedTransaction;

use crate::config::EngineConfig;

/// Errors from the ledger RPC layer.
#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    /// RPC transport error.
    #[error(transparent)]
    Transport(Box<ClientErrorKind>),
    /// A submitted transaction did not confirm within the polling budget.
    #[error("transaction {0} not confirmed within the polling budget")]
    Unconfirmed(Signature),
    #[error("{0}")]
    Custom(String),
}

impl From<ClientError> for LedgerError {
    fn from(value: ClientError) -> Self {
        LedgerError::Transport(value.kind)
    }
}

/// The ledger operations the engine consumes.
pub trait LedgerRpc {
    /// Native balance of `address` in lamports.
    fn get_balance(
        &self,
        address: &Pubkey,
    ) -> impl Future<Output = Result<u64, LedgerError>> + Send;

    /// Token balance of `token_account` in base units, or `None` if the
    /// account does not exist.
    fn get_token_account_balance(
        &self,
        token_account: &Pubkey,
    ) -> impl Future<Output = Result<Option<u64>, LedgerError>> + Send;

    /// Raw account fetch, `None` if the account does not exist.
    fn get_account(
        &self,
        address: &Pubkey,
    ) -> impl Future<Output = Result<Option<Account>, LedgerError>> + Send;

    fn get_latest_blockhash(&self) -> impl Future<Output = Result<Hash, LedgerError>> + Send;

    /// Submits a signed transaction without waiting for confirmation.
    fn send_transaction(
        &self,
        tx: &VersionedTransaction,
    ) -> impl Future<Output = Result<Signature, LedgerError>> + Send;

    /// Whether `signature` has reached confirmed commitment.
    fn confirm_transaction(
        &self,
        signature: &Signature,
    ) -> impl Future<Output = Result<bool, LedgerError>> + Send;
}

impl LedgerRpc for RpcClient {
    fn get_balance(
        &self,
        address: &Pubkey,
    ) -> impl Future<Output = Result<u64, LedgerError>> + Send {
        let fut = RpcClient::get_balance(self, address);
        async move { Ok(fut.await?) }
    }

    fn get_token_account_balance(
        &self,
        token_account: &Pubkey,
    ) -> impl Future<Output = Result<Option<u64>, LedgerError>> + Send {
        let fut = RpcClient::get_token_account_balance(self, token_account);
        async move {
            match fut.await {
                Ok(ui_amount) => {
                    let amount = ui_amount.amount.parse::<u64>().map_err(|e| {
                        LedgerError::Custom(format!("unparseable token amount: {e}"))
                    })?;
                    Ok(Some(amount))
                }
                // The node reports a missing token account as an RPC-level
                // error, not a null response.
                Err(e) if matches!(*e.kind, ClientErrorKind::RpcError(_)) => Ok(None),
                Err(e) => Err(e.into()),
            }
        }
    }

    fn get_account(
        &self,
        address: &Pubkey,
    ) -> impl Future<Output = Result<Option<Account>, LedgerError>> + Send {
        let fut =
            RpcClient::get_account_with_commitment(self, address, CommitmentConfig::confirmed());
        async move { Ok(fut.await?.value) }
    }

    fn get_latest_blockhash(&self) -> impl Future<Output = Result<Hash, LedgerError>> + Send {
        let fut = RpcClient::get_latest_blockhash(self);
        async move { Ok(fut.await?) }
    }

    fn send_transaction(
        &self,
        tx: &VersionedTransaction,
    ) -> impl Future<Output = Result<Signature, LedgerError>> + Send {
        let fut = RpcClient::send_transaction_with_config(
            self,
            tx,
            RpcSendTransactionConfig {
                skip_preflight: true,
                ..RpcSendTransactionConfig::default()
            },
        );
        async move { Ok(fut.await?) }
    }

    fn confirm_transaction(
        &self,
        signature: &Signature,
    ) -> impl Future<Output = Result<bool, LedgerError>> + Send {
        let fut = RpcClient::confirm_transaction_with_commitment(
            self,
            signature,
            CommitmentConfig::confirmed(),
        );
        async move { Ok(fut.await?.value) }
    }
}

impl<T: LedgerRpc + Send + Sync> LedgerRpc for std::sync::Arc<T> {
    fn get_balance(
        &self,
        address: &Pubkey,
    ) -> impl Future<Output = Result<u64, LedgerError>> + Send {
        (**self).get_balance(address)
    }

    fn get_token_account_balance(
        &self,
        token_account: &Pubkey,
    ) -> impl Future<Output = Result<Option<u64>, LedgerError>> + Send {
        (**self).get_token_account_balance(token_account)
    }

    fn get_account(
        &self,
        address: &Pubkey,
    ) -> impl Future<Output = Result<Option<Account>, LedgerError>> + Send {
        (**self).get_account(address)
    }

    fn get_latest_blockhash(&self) -> impl Future<Output = Result<Hash, LedgerError>> + Send {
        (**self).get_latest_blockhash()
    }

    fn send_transaction(
        &self,
        tx: &VersionedTransaction,
    ) -> impl Future<Output = Result<Signature, LedgerError>> + Send {
        (**self).send_transaction(tx)
    }

    fn confirm_transaction(
        &self,
        signature: &Signature,
    ) -> impl Future<Output = Result<bool, LedgerError>> + Send {
        (**self).confirm_transaction(signature)
    }
}

/// Submits `tx` and polls for confirmation with the config's bounded
/// retry budget and doubling backoff.
pub(crate) async fn send_and_confirm<L: LedgerRpc>(
    ledger: &L,
    tx: &VersionedTransaction,
    config: &EngineConfig,
) -> Result<Signature, LedgerError> {
    let signature = ledger.send_transaction(tx).await?;
    for attempt in 0..config.confirm_retries {
        if ledger.confirm_transaction(&signature).await? {
            return Ok(signature);
        }
        if attempt + 1 < config.confirm_retries {
            tokio::time::sleep(config.confirm_backoff(attempt)).await;
        }
    }
    Err(LedgerError::Unconfirmed(signature))
}
