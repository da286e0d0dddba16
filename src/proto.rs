//! x402 protocol version 1 wire types.
//!
//! The subset of the v1 protocol a paying client needs: the
//! `PaymentRequired` body a server returns with HTTP 402, and the
//! `PaymentPayload` artifact the retried request carries in the
//! `X-Payment` header (base64 of camelCase JSON wrapping a base64
//! bincode transaction).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use solana_pubkey::Pubkey;
use std::fmt;
use std::str::FromStr;

/// Header carrying the signed payment artifact on the retried request.
pub const PAYMENT_HEADER: &str = "X-Payment";

/// Version marker for x402 protocol version 1; serializes as the bare
/// integer `1`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct X402Version1;

impl X402Version1 {
    pub const VALUE: u8 = 1;
}

impl Serialize for X402Version1 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(Self::VALUE)
    }
}

impl<'de> Deserialize<'de> for X402Version1 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let num = u8::deserialize(deserializer)?;
        if num == Self::VALUE {
            Ok(X402Version1)
        } else {
            Err(serde::de::Error::custom(format!(
                "expected version {}, got {num}",
                Self::VALUE
            )))
        }
    }
}

impl fmt::Display for X402Version1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Self::VALUE)
    }
}

/// Scheme marker that serializes as the literal string `"exact"`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ExactScheme;

impl ExactScheme {
    pub const VALUE: &'static str = "exact";
}

impl Serialize for ExactScheme {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(Self::VALUE)
    }
}

impl<'de> Deserialize<'de> for ExactScheme {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s == Self::VALUE {
            Ok(ExactScheme)
        } else {
            Err(serde::de::Error::custom(format!(
                "expected scheme {:?}, got {s:?}",
                Self::VALUE
            )))
        }
    }
}

impl fmt::Display for ExactScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(Self::VALUE)
    }
}

/// Payment terms offered by the server in a 402 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    /// The payment scheme (e.g. "exact").
    pub scheme: String,
    /// The network name (e.g. "solana").
    pub network: String,
    /// Maximum amount required, in token base units, as a decimal string.
    pub max_amount_required: String,
    /// The resource URL being paid for.
    #[serde(default)]
    pub resource: String,
    /// Human-readable description of the resource.
    #[serde(default)]
    pub description: String,
    /// MIME type of the resource.
    #[serde(default)]
    pub mime_type: String,
    /// The recipient address for payment.
    pub pay_to: String,
    /// Maximum time in seconds for payment validity.
    #[serde(default)]
    pub max_timeout_seconds: u64,
    /// The token mint address.
    pub asset: String,
    /// Scheme-specific extra data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl PaymentRequirements {
    pub fn amount(&self) -> Option<u64> {
        self.max_amount_required.parse().ok()
    }

    pub fn asset_pubkey(&self) -> Option<Pubkey> {
        Pubkey::from_str(&self.asset).ok()
    }

    pub fn pay_to_pubkey(&self) -> Option<Pubkey> {
        Pubkey::from_str(&self.pay_to).ok()
    }
}

/// HTTP 402 response body: the list of acceptable payment methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    pub x402_version: X402Version1,
    #[serde(default)]
    pub accepts: Vec<PaymentRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The scheme-specific payload: a fully signed, base64-encoded transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactSolanaPayload {
    pub transaction: String,
}

/// The signed artifact attached to the retried request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub x402_version: X402Version1,
    pub scheme: ExactScheme,
    pub network: String,
    pub payload: ExactSolanaPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_402_body() {
        let body = r#"{
            "x402Version": 1,
            "accepts": [{
                "scheme": "exact",
                "network": "solana",
                "maxAmountRequired": "10000",
                "resource": "https://api.example.com/data",
                "description": "Market data",
                "mimeType": "application/json",
                "payTo": "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
                "maxTimeoutSeconds": 300,
                "asset": "4zMMC9srt5Ri5X14GAgXhaHii3GnPAEERYPJgZ5nc4pb"
            }]
        }"#;
        let required: PaymentRequired = serde_json::from_str(body).unwrap();
        assert_eq!(required.accepts.len(), 1);
        let terms = &required.accepts[0];
        assert_eq!(terms.amount(), Some(10_000));
        assert!(terms.asset_pubkey().is_some());
        assert!(terms.pay_to_pubkey().is_some());
    }

    #[test]
    fn test_reject_wrong_version() {
        let body = r#"{"x402Version": 2, "accepts": []}"#;
        assert!(serde_json::from_str::<PaymentRequired>(body).is_err());
    }

    #[test]
    fn test_payload_wire_shape() {
        let payload = PaymentPayload {
            x402_version: X402Version1,
            scheme: ExactScheme,
            network: "solana".to_string(),
            payload: ExactSolanaPayload {
                transaction: "AAEC".to_string(),
            },
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["x402Version"], 1);
        assert_eq!(json["scheme"], "exact");
        assert_eq!(json["payload"]["transaction"], "AAEC");
    }
}
