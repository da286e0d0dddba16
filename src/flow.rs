//! The payment flow: create → fund → verify → pay → sweep.
//!
//! One flow is one logical task; nothing here is shared between flows.
//! The sweep is the flow's compensating action: it is scheduled the
//! moment funding is about to be submitted and runs on every path out,
//! whether success, failure, or the caller dropping the future mid-flight.

use solana_pubkey::Pubkey;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::funding::{CustodialFundingPort, FundingError, FundingRecord, fund};
use crate::identity::EphemeralIdentity;
use crate::ledger::LedgerRpc;
use crate::payment::{PaidTransport, PaymentError, PaymentRequirement};
use crate::sweep::{SweepResult, sweep};
use crate::verify::{VerificationError, verify};

/// Everything that can abort a payment flow. The sweep has already been
/// attempted by the time one of these reaches the caller.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Funding(#[from] FundingError),
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error(transparent)]
    Payment(#[from] PaymentError),
}

/// A failed flow: the causal error plus the outcome of the terminal
/// sweep, surfaced for auditing. Cleanup never masks the causal error.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct FlowError {
    #[source]
    pub source: EngineError,
    pub sweep: SweepResult,
}

/// A completed flow: the response body plus the funding and sweep
/// records for reconciliation.
#[derive(Debug)]
pub struct FlowOutcome {
    pub body: serde_json::Value,
    pub funding: FundingRecord,
    pub sweep: SweepResult,
}

/// Compensating-action guard: once funding is about to be submitted, a
/// sweep must happen no matter how the flow unwinds. On the normal and
/// error paths the guard is disarmed and the sweep runs inline so its
/// result can be captured; if the flow future is dropped mid-flight
/// (caller cancellation), `Drop` pushes the sweep onto the runtime so the
/// funds are not abandoned.
struct SweepGuard<L: LedgerRpc + Clone + Send + Sync + 'static> {
    armed: bool,
    ledger: L,
    identity: EphemeralIdentity,
    parent: Pubkey,
    mint: Pubkey,
    config: EngineConfig,
}

impl<L: LedgerRpc + Clone + Send + Sync + 'static> SweepGuard<L> {
    fn new(
        ledger: L,
        identity: EphemeralIdentity,
        parent: Pubkey,
        mint: Pubkey,
        config: EngineConfig,
    ) -> Self {
        Self {
            armed: true,
            ledger,
            identity,
            parent,
            mint,
            config,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<L: LedgerRpc + Clone + Send + Sync + 'static> Drop for SweepGuard<L> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let ledger = self.ledger.clone();
        let identity = self.identity.shared();
        let parent = self.parent;
        let mint = self.mint;
        let config = self.config.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let result = sweep(&ledger, &identity, &parent, Some(&mint), &config).await;
                    info!(
                        address = %result.address,
                        token_swept = result.token_swept,
                        lamports_swept = result.lamports_swept,
                        clean = result.is_clean(),
                        "swept after flow cancellation"
                    );
                });
            }
            Err(_) => {
                // No runtime left to run the sweep on.
                warn!(
                    address = %self.identity.address(),
                    "flow dropped outside a runtime; funds may need manual recovery"
                );
            }
        }
    }
}

async fn execute<L, F, T>(
    requirement: &PaymentRequirement,
    funding_port: &F,
    ledger: &L,
    transport: &T,
    config: &EngineConfig,
    identity: &EphemeralIdentity,
) -> Result<(serde_json::Value, FundingRecord), EngineError>
where
    L: LedgerRpc + Sync,
    F: CustodialFundingPort + ?Sized,
    T: PaidTransport + ?Sized,
{
    let funding = fund(
        funding_port,
        identity,
        requirement.amount(),
        config.fee_funding_lamports,
        requirement.mint(),
        config,
    )
    .await?;
    let balances = verify(
        ledger,
        identity,
        requirement.amount(),
        requirement.mint(),
        config,
    )
    .await?;
    debug!(
        lamports = balances.lamports,
        token_amount = balances.token_amount,
        "funding verified, executing paid exchange"
    );
    let body = transport.pay_and_fetch(requirement, identity).await?;
    Ok((body, funding))
}

/// Executes one complete payment flow and returns the response body along
/// with the funding and sweep records.
///
/// Dependencies are explicit parameters and nothing outlives the call:
/// each invocation allocates its own [`EphemeralIdentity`], so concurrent
/// flows are isolated by construction. The ledger handle may be a shared
/// `Arc<RpcClient>`; it is only read.
pub async fn pay_and_fetch_data<L, F, T>(
    requirement: PaymentRequirement,
    parent: &Pubkey,
    funding_port: &F,
    ledger: &L,
    transport: &T,
    config: &EngineConfig,
) -> Result<FlowOutcome, FlowError>
where
    L: LedgerRpc + Clone + Send + Sync + 'static,
    F: CustodialFundingPort + ?Sized,
    T: PaidTransport + ?Sized,
{
    let identity = EphemeralIdentity::generate();
    info!(
        address = %identity.address(),
        url = %requirement.url(),
        amount = requirement.amount(),
        "payment flow started"
    );

    let mut guard = SweepGuard::new(
        ledger.clone(),
        identity.shared(),
        *parent,
        *requirement.mint(),
        config.clone(),
    );
    let exchanged = execute(
        &requirement,
        funding_port,
        ledger,
        transport,
        config,
        &identity,
    )
    .await;
    guard.disarm();

    let sweep_result = sweep(ledger, &identity, parent, Some(requirement.mint()), config).await;
    match exchanged {
        Ok((body, funding)) => {
            info!(address = %identity.address(), "payment flow complete");
            Ok(FlowOutcome {
                body,
                funding,
                sweep: sweep_result,
            })
        }
        Err(source) => {
            error!(
                address = %identity.address(),
                error = %source,
                "payment flow failed; identity swept"
            );
            Err(FlowError {
                source,
                sweep: sweep_result,
            })
        }
    }
}
