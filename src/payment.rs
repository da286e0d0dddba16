//! Payment-aware HTTP transport.
//!
//! [`PaymentMiddleware`] wraps a reqwest client: when a request comes back
//! `402 Payment Required`, it parses the v1 payment terms, signs an SPL
//! token transfer with the flow's ephemeral identity, and retries the same
//! request exactly once with the artifact in the `X-Payment` header. A
//! second 402, like any other non-2xx, is terminal; the middleware never
//! loops, so a misbehaving server cannot drain the wallet.

use async_trait::async_trait;
use http::{Extensions, HeaderValue, StatusCode};
use reqwest::{Request, Response};
use reqwest_middleware as rqm;
use solana_compute_budget_interface::ComputeBudgetInstruction;
use solana_keypair::Keypair;
use solana_pubkey::{Pubkey, pubkey};
use solana_signer::Signer;
use solana_transaction::Instruction;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::config::EngineConfig;
use crate::identity::EphemeralIdentity;
use crate::ledger::{LedgerError, LedgerRpc};
use crate::proto::{
    ExactScheme, ExactSolanaPayload, PAYMENT_HEADER, PaymentPayload, PaymentRequired,
    PaymentRequirements, X402Version1,
};
use crate::token::{Mint, TokenError, associated_token_address, fetch_mint};
use crate::tx::{TxError, compile_transaction, sign_transaction, transaction_to_base64};
use crate::util::Base64Bytes;

/// SPL Memo program, used to add a random nonce so every payment
/// transaction has a unique message.
pub static MEMO_PROGRAM_PUBKEY: Pubkey = pubkey!("MemoSq4gqABAXKb96qnH8TysNcWxMyWCqXgDLGmfcHr");

/// What the caller wants fetched and what it is prepared to pay for it.
///
/// Immutable once constructed; build with [`PaymentRequirement::new`] and
/// the `with_*` methods.
#[derive(Debug, Clone)]
pub struct PaymentRequirement {
    url: Url,
    method: http::Method,
    headers: Vec<(String, String)>,
    body: Option<serde_json::Value>,
    amount: u64,
    mint: Pubkey,
}

impl PaymentRequirement {
    /// `amount` is the estimated cost in base units of `mint`; terms
    /// demanding more than this are rejected.
    pub fn new(method: http::Method, url: Url, amount: u64, mint: Pubkey) -> Self {
        Self {
            url,
            method,
            headers: Vec::new(),
            body: None,
            amount,
            mint,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn mint(&self) -> &Pubkey {
        &self.mint
    }
}

/// Errors from the paid HTTP exchange.
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    /// The payment artifact could not be constructed or attached.
    #[error("payment negotiation: {0}")]
    Protocol(String),
    /// The remote endpoint rejected the request with a terminal status.
    /// Distinct from `Protocol` so callers can tell "payment could not be
    /// made" from "the API rejected an already-paid request".
    #[error("api rejected the paid request: status {status}")]
    Api { status: u16, body: String },
    /// Transport-level HTTP failure.
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl From<TokenError> for PaymentError {
    fn from(e: TokenError) -> Self {
        PaymentError::Protocol(e.to_string())
    }
}

impl From<TxError> for PaymentError {
    fn from(e: TxError) -> Self {
        PaymentError::Protocol(e.to_string())
    }
}

impl From<LedgerError> for PaymentError {
    fn from(e: LedgerError) -> Self {
        PaymentError::Protocol(e.to_string())
    }
}

impl From<serde_json::Error> for PaymentError {
    fn from(e: serde_json::Error) -> Self {
        PaymentError::Protocol(e.to_string())
    }
}

impl From<rqm::Error> for PaymentError {
    fn from(e: rqm::Error) -> Self {
        match e {
            // Recover the original error the middleware raised.
            rqm::Error::Middleware(inner) => match inner.downcast::<PaymentError>() {
                Ok(payment) => payment,
                Err(other) => PaymentError::Protocol(other.to_string()),
            },
            rqm::Error::Reqwest(e) => PaymentError::Http(e),
        }
    }
}

/// The seam between the flow and the HTTP layer, object-safe so tests can
/// substitute a fake exchange.
#[async_trait]
pub trait PaidTransport: Send + Sync {
    /// Executes the paid exchange and returns the parsed response body.
    async fn pay_and_fetch(
        &self,
        requirement: &PaymentRequirement,
        identity: &EphemeralIdentity,
    ) -> Result<serde_json::Value, PaymentError>;
}

/// Parses a v1 `PaymentRequired` out of a 402 response body.
pub fn parse_payment_required(bytes: &[u8]) -> Option<PaymentRequired> {
    serde_json::from_slice(bytes).ok()
}

/// Picks the first offered terms the flow can actually satisfy: exact
/// scheme, expected network and mint, demanded amount within the funded
/// amount.
pub fn select_terms<'a>(
    required: &'a PaymentRequired,
    network: &str,
    mint: &Pubkey,
    funded_amount: u64,
) -> Option<&'a PaymentRequirements> {
    required.accepts.iter().find(|terms| {
        terms.scheme == ExactScheme::VALUE
            && terms.network == network
            && terms.asset_pubkey().is_some_and(|asset| asset == *mint)
            && terms.pay_to_pubkey().is_some()
            && terms.amount().is_some_and(|amount| amount <= funded_amount)
    })
}

fn random_memo_ix() -> Instruction {
    let nonce: [u8; 16] = rand::random();
    let memo = Base64Bytes::encode(nonce).to_string();
    Instruction::new_with_bytes(MEMO_PROGRAM_PUBKEY, memo.as_bytes(), Vec::new())
}

/// Builds and signs the payment transaction: compute-unit price, a
/// `transfer_checked` of `amount` from the signer's token account to the
/// recipient's, and a random memo for uniqueness. The ephemeral identity
/// is both fee payer and transfer authority. Returns the base64 wire
/// encoding.
pub async fn build_payment_transaction<L: LedgerRpc>(
    ledger: &L,
    signer: &Keypair,
    pay_to: &Pubkey,
    mint_address: &Pubkey,
    amount: u64,
    compute_unit_price: u64,
) -> Result<String, PaymentError> {
    let mint = fetch_mint(ledger, mint_address).await?;
    let payer = signer.pubkey();
    let source = associated_token_address(&payer, &mint.token_program(), mint_address);
    let destination = associated_token_address(pay_to, &mint.token_program(), mint_address);

    let transfer_ix = match mint {
        Mint::Token { decimals } => spl_token::instruction::transfer_checked(
            &spl_token::id(),
            &source,
            mint_address,
            &destination,
            &payer,
            &[],
            amount,
            decimals,
        ),
        Mint::Token2022 { decimals } => spl_token_2022::instruction::transfer_checked(
            &spl_token_2022::id(),
            &source,
            mint_address,
            &destination,
            &payer,
            &[],
            amount,
            decimals,
        ),
    }
    .map_err(|e| PaymentError::Protocol(format!("transfer instruction: {e}")))?;

    let recent_blockhash = ledger.get_latest_blockhash().await?;
    let instructions = [
        ComputeBudgetInstruction::set_compute_unit_price(compute_unit_price),
        transfer_ix,
        random_memo_ix(),
    ];
    let tx = compile_transaction(&payer, &instructions, recent_blockhash)?;
    let signed = sign_transaction(tx, signer)?;
    Ok(transaction_to_base64(&signed)?)
}

/// Reqwest middleware bound to one flow's ephemeral identity.
pub struct PaymentMiddleware<L> {
    signer: Arc<Keypair>,
    ledger: L,
    mint: Pubkey,
    funded_amount: u64,
    network: String,
    compute_unit_price: u64,
}

impl<L> PaymentMiddleware<L> {
    pub fn new(
        identity: &EphemeralIdentity,
        ledger: L,
        requirement: &PaymentRequirement,
        config: &EngineConfig,
    ) -> Self {
        Self {
            signer: identity.signer(),
            ledger,
            mint: requirement.mint,
            funded_amount: requirement.amount,
            network: config.network.clone(),
            compute_unit_price: config.compute_unit_price_micro_lamports,
        }
    }
}

impl<L: LedgerRpc + Send + Sync> PaymentMiddleware<L> {
    /// Derives the `X-Payment` header value from a 402 response.
    async fn payment_header(&self, res: Response) -> Result<HeaderValue, PaymentError> {
        let bytes = res.bytes().await?;
        let required = parse_payment_required(&bytes)
            .ok_or(PaymentError::Protocol("unparseable 402 response".to_string()))?;
        let terms = select_terms(&required, &self.network, &self.mint, self.funded_amount).ok_or(
            PaymentError::Protocol("no acceptable payment terms in 402 response".to_string()),
        )?;
        debug!(
            network = %terms.network,
            amount = %terms.max_amount_required,
            pay_to = %terms.pay_to,
            "selected payment terms"
        );

        let pay_to = terms
            .pay_to_pubkey()
            .ok_or(PaymentError::Protocol("invalid payTo address".to_string()))?;
        let amount = terms
            .amount()
            .ok_or(PaymentError::Protocol("invalid payment amount".to_string()))?;
        let transaction = build_payment_transaction(
            &self.ledger,
            &self.signer,
            &pay_to,
            &self.mint,
            amount,
            self.compute_unit_price,
        )
        .await?;

        let payload = PaymentPayload {
            x402_version: X402Version1,
            scheme: ExactScheme,
            network: terms.network.clone(),
            payload: ExactSolanaPayload { transaction },
        };
        let json = serde_json::to_vec(&payload)?;
        let encoded = Base64Bytes::encode(&json).to_string();
        HeaderValue::from_str(&encoded)
            .map_err(|e| PaymentError::Protocol(format!("header encoding: {e}")))
    }
}

#[async_trait]
impl<L: LedgerRpc + Send + Sync + 'static> rqm::Middleware for PaymentMiddleware<L> {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: rqm::Next<'_>,
    ) -> rqm::Result<Response> {
        let retry_req = req.try_clone();
        let res = next.clone().run(req, extensions).await?;
        if res.status() != StatusCode::PAYMENT_REQUIRED {
            return Ok(res);
        }

        info!(url = %res.url(), "received 402 Payment Required, signing payment");
        let header = self
            .payment_header(res)
            .await
            .map_err(|e| rqm::Error::Middleware(e.into()))?;

        // Retry with payment, once.
        let mut retry = retry_req.ok_or(rqm::Error::Middleware(
            PaymentError::Protocol("request not cloneable for paid retry".to_string()).into(),
        ))?;
        retry.headers_mut().insert(PAYMENT_HEADER, header);
        next.run(retry, extensions).await
    }
}

/// The real [`PaidTransport`]: a reqwest client with [`PaymentMiddleware`]
/// attached per flow.
pub struct PaymentProtocolClient<L> {
    http: reqwest::Client,
    ledger: L,
    config: EngineConfig,
}

impl<L> PaymentProtocolClient<L> {
    pub fn new(http: reqwest::Client, ledger: L, config: EngineConfig) -> Self {
        Self {
            http,
            ledger,
            config,
        }
    }
}

#[async_trait]
impl<L: LedgerRpc + Clone + Send + Sync + 'static> PaidTransport for PaymentProtocolClient<L> {
    async fn pay_and_fetch(
        &self,
        requirement: &PaymentRequirement,
        identity: &EphemeralIdentity,
    ) -> Result<serde_json::Value, PaymentError> {
        let middleware =
            PaymentMiddleware::new(identity, self.ledger.clone(), requirement, &self.config);
        let client = rqm::ClientBuilder::new(self.http.clone())
            .with(middleware)
            .build();

        let mut request = client.request(requirement.method.clone(), requirement.url.clone());
        for (name, value) in &requirement.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &requirement.body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(PaymentError::from)?;
        let status = response.status();
        if !status.is_success() {
            // A second 402 after the paid retry lands here too.
            let body = response.text().await.unwrap_or_default();
            return Err(PaymentError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms(network: &str, asset: &str, amount: &str) -> PaymentRequirements {
        PaymentRequirements {
            scheme: "exact".to_string(),
            network: network.to_string(),
            max_amount_required: amount.to_string(),
            resource: String::new(),
            description: String::new(),
            mime_type: String::new(),
            pay_to: Pubkey::new_unique().to_string(),
            max_timeout_seconds: 60,
            asset: asset.to_string(),
            extra: None,
        }
    }

    #[test]
    fn test_select_terms_filters_candidates() {
        let mint = Pubkey::new_unique();
        let required = PaymentRequired {
            x402_version: X402Version1,
            accepts: vec![
                terms("base", &mint.to_string(), "100"),           // wrong network
                terms("solana", "not-an-address", "100"),          // bad asset
                terms("solana", &Pubkey::new_unique().to_string(), "100"), // wrong mint
                terms("solana", &mint.to_string(), "20000"),       // too expensive
                terms("solana", &mint.to_string(), "9000"),        // acceptable
            ],
            error: None,
        };

        let selected = select_terms(&required, "solana", &mint, 10_000).unwrap();
        assert_eq!(selected.amount(), Some(9_000));
        assert_eq!(selected.asset, mint.to_string());
    }

    #[test]
    fn test_select_terms_none_when_unaffordable() {
        let mint = Pubkey::new_unique();
        let required = PaymentRequired {
            x402_version: X402Version1,
            accepts: vec![terms("solana", &mint.to_string(), "20000")],
            error: None,
        };
        assert!(select_terms(&required, "solana", &mint, 10_000).is_none());
    }

    #[test]
    fn test_parse_payment_required_rejects_garbage() {
        assert!(parse_payment_required(b"<html>payment required</html>").is_none());
        assert!(parse_payment_required(b"{}").is_none());
    }

    #[test]
    fn test_memo_instructions_are_unique() {
        let a = random_memo_ix();
        let b = random_memo_ix();
        assert_eq!(a.program_id, MEMO_PROGRAM_PUBKEY);
        assert_ne!(a.data, b.data);
    }
}
