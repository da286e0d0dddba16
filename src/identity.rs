//! Single-use signing identities.

use solana_keypair::Keypair;
use solana_pubkey::Pubkey;
use solana_signer::Signer;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// A keypair that exists only for the duration of one payment flow.
///
/// Generated from the OS CSPRNG, held only in process memory, never
/// serialized or persisted. The type is deliberately not `Clone`: a flow
/// owns its identity exclusively, and two flows never share one. The inner
/// `Arc` exists solely so the per-flow payment middleware can hold the
/// signer across one HTTP exchange.
pub struct EphemeralIdentity {
    keypair: Arc<Keypair>,
}

impl EphemeralIdentity {
    /// Generates a fresh identity. Pure generation: no I/O, no failure mode.
    pub fn generate() -> Self {
        Self {
            keypair: Arc::new(Keypair::new()),
        }
    }

    /// The identity's public key.
    pub fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    /// Base58 address, for logging and manual-recovery breadcrumbs.
    pub fn address(&self) -> String {
        self.pubkey().to_string()
    }

    /// Shared handle to the signing keypair, for components that sign on
    /// this flow's behalf.
    pub(crate) fn signer(&self) -> Arc<Keypair> {
        Arc::clone(&self.keypair)
    }

    /// Internal handle sharing the same keypair, for the sweep guard's
    /// deferred cleanup. Stays `pub(crate)`: the no-reuse invariant holds
    /// because both handles belong to the same flow.
    pub(crate) fn shared(&self) -> Self {
        Self {
            keypair: Arc::clone(&self.keypair),
        }
    }
}

impl Debug for EphemeralIdentity {
    // Never print key material.
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralIdentity")
            .field("pubkey", &self.pubkey())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generated_identities_are_unique() {
        let addresses: HashSet<String> = (0..100)
            .map(|_| EphemeralIdentity::generate().address())
            .collect();
        assert_eq!(addresses.len(), 100);
    }

    #[test]
    fn test_debug_does_not_leak_key_material() {
        let identity = EphemeralIdentity::generate();
        let rendered = format!("{identity:?}");
        assert!(rendered.contains(&identity.address()));
        let secret = identity.signer().to_base58_string();
        assert!(!rendered.contains(&secret));
    }
}
