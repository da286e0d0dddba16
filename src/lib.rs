//! Pay-per-call x402 payments from disposable Solana wallets.
//!
//! `burnerpay` executes a metered HTTP request that demands payment, using
//! a single-use ("burner") keypair as the paying identity. The keypair is
//! funded just-in-time from a custodial parent account the engine never
//! holds keys for, used to settle one `402 Payment Required` exchange,
//! and drained back to the parent afterwards (token balance, fee buffer,
//! and token-account rent) on every code path, including failures and
//! caller cancellation.
//!
//! ## Flow
//!
//! [`pay_and_fetch_data`] sequences the whole thing:
//!
//! 1. generate an [`EphemeralIdentity`] (memory-only keypair);
//! 2. fund it through a [`CustodialFundingPort`]: one token transfer,
//!    one lamport transfer for fees;
//! 3. verify both legs settled on-chain before spending anything;
//! 4. run the paid exchange through a [`PaidTransport`]; the bundled
//!    [`PaymentProtocolClient`] signs an SPL transfer when the server
//!    answers 402 and retries exactly once with the `X-Payment` header;
//! 5. sweep everything left back to the parent, with the outcome reported
//!    in [`FlowOutcome`] or [`FlowError`] either way.
//!
//! ## Example
//!
//! ```rust,no_run
//! use burnerpay::{
//!     EngineConfig, PaymentProtocolClient, PaymentRequirement, pay_and_fetch_data,
//! };
//! use solana_client::nonblocking::rpc_client::RpcClient;
//! use std::sync::Arc;
//!
//! # async fn run(parent: solana_pubkey::Pubkey, mint: solana_pubkey::Pubkey,
//! #     port: impl burnerpay::CustodialFundingPort) -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::default();
//! let ledger = Arc::new(RpcClient::new(
//!     "https://api.mainnet-beta.solana.com".to_string(),
//! ));
//! let transport = PaymentProtocolClient::new(
//!     reqwest::Client::new(),
//!     Arc::clone(&ledger),
//!     config.clone(),
//! );
//! let requirement = PaymentRequirement::new(
//!     http::Method::GET,
//!     "https://api.example.com/data".parse()?,
//!     10_000, // 0.01 USDC
//!     mint,
//! );
//! let outcome =
//!     pay_and_fetch_data(requirement, &parent, &port, &ledger, &transport, &config).await?;
//! println!("body: {}, swept: {}", outcome.body, outcome.sweep.lamports_swept);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod flow;
pub mod funding;
pub mod identity;
pub mod ledger;
pub mod payment;
pub mod proto;
pub mod sweep;
pub mod token;
pub mod tx;
pub mod util;
pub mod verify;

pub use config::EngineConfig;
pub use flow::{EngineError, FlowError, FlowOutcome, pay_and_fetch_data};
pub use funding::{
    CustodialFundingPort, FundedTransfer, FundingError, FundingPortError, FundingRecord,
    TransferReference,
};
pub use identity::EphemeralIdentity;
pub use ledger::{LedgerError, LedgerRpc};
pub use payment::{
    PaidTransport, PaymentError, PaymentMiddleware, PaymentProtocolClient, PaymentRequirement,
};
pub use sweep::{SweepResult, SweepWarning, sweep};
pub use verify::{VerificationError, VerifiedBalances, verify};
