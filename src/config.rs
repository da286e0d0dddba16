//! Engine configuration.
//!
//! Every timing and fee constant the engine relies on lives here rather
//! than as a literal at the call site: the correct values depend on the
//! ledger network's fee schedule and finality characteristics, so they
//! must be tunable per deployment.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for one payment engine instance.
///
/// All fields carry serde defaults, so a partial JSON document (or
/// `EngineConfig::default()`) produces a working mainnet-shaped
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Grace period after the funding transfers are submitted, before any
    /// on-chain read is attempted. The parent-side transactions are not
    /// polled; only the ephemeral side is verified afterwards. This trades
    /// latency for not having to track the custodial signer's signatures.
    #[serde(default = "default_settlement_grace_ms")]
    pub settlement_grace_ms: u64,

    /// Lamports funded to the ephemeral identity as its fee buffer.
    #[serde(default = "default_fee_funding_lamports")]
    pub fee_funding_lamports: u64,

    /// Lamports left behind by the sweep to cover the sweep transaction's
    /// own fee. Undersweeping by this reserve is correct behavior.
    #[serde(default = "default_fee_reserve_lamports")]
    pub fee_reserve_lamports: u64,

    /// Attempts for verification and confirmation polling.
    #[serde(default = "default_confirm_retries")]
    pub confirm_retries: u32,

    /// Base backoff between polling attempts; doubles per attempt.
    #[serde(default = "default_confirm_backoff_ms")]
    pub confirm_backoff_ms: u64,

    /// Compute-unit price attached to transactions the engine signs,
    /// in micro-lamports.
    #[serde(default = "default_compute_unit_price")]
    pub compute_unit_price_micro_lamports: u64,

    /// Network name expected in v1 `accepts` entries (e.g. "solana").
    #[serde(default = "default_network")]
    pub network: String,
}

fn default_settlement_grace_ms() -> u64 {
    2_000
}

fn default_fee_funding_lamports() -> u64 {
    1_000_000 // 0.001 SOL
}

fn default_fee_reserve_lamports() -> u64 {
    5_000 // one signature's base fee
}

fn default_confirm_retries() -> u32 {
    5
}

fn default_confirm_backoff_ms() -> u64 {
    500
}

fn default_compute_unit_price() -> u64 {
    1
}

fn default_network() -> String {
    "solana".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            settlement_grace_ms: default_settlement_grace_ms(),
            fee_funding_lamports: default_fee_funding_lamports(),
            fee_reserve_lamports: default_fee_reserve_lamports(),
            confirm_retries: default_confirm_retries(),
            confirm_backoff_ms: default_confirm_backoff_ms(),
            compute_unit_price_micro_lamports: default_compute_unit_price(),
            network: default_network(),
        }
    }
}

impl EngineConfig {
    pub fn settlement_grace(&self) -> Duration {
        Duration::from_millis(self.settlement_grace_ms)
    }

    /// Backoff before the attempt after `attempt` (0-based), doubling each
    /// time: base, 2*base, 4*base, ...
    pub fn confirm_backoff(&self, attempt: u32) -> Duration {
        let multiplier = 1u64 << attempt.min(16);
        Duration::from_millis(self.confirm_backoff_ms.saturating_mul(multiplier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.settlement_grace_ms, 2_000);
        assert_eq!(config.fee_funding_lamports, 1_000_000);
        assert_eq!(config.fee_reserve_lamports, 5_000);
        assert_eq!(config.confirm_retries, 5);
        assert_eq!(config.network, "solana");
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"feeReserveLamports": 10000}"#).unwrap();
        assert_eq!(config.fee_reserve_lamports, 10_000);
        assert_eq!(config.confirm_retries, 5);
        assert_eq!(config.network, "solana");
    }

    #[test]
    fn test_backoff_doubles() {
        let config = EngineConfig {
            confirm_backoff_ms: 100,
            ..EngineConfig::default()
        };
        assert_eq!(config.confirm_backoff(0), Duration::from_millis(100));
        assert_eq!(config.confirm_backoff(1), Duration::from_millis(200));
        assert_eq!(config.confirm_backoff(3), Duration::from_millis(800));
    }
}
