//! Transaction assembly and signing for the ephemeral identity.

use solana_keypair::Keypair;
use solana_message::v0::Message as MessageV0;
use solana_message::{Hash, VersionedMessage};
use solana_signature::Signature;
use solana_signer::Signer;
use solana_transaction::Instruction;
use solana_transaction::versioned::VersionedTransaction;

use crate::util::Base64Bytes;

#[derive(Debug, thiserror::Error)]
pub enum TxError {
    #[error("cannot compile message: {0}")]
    Compile(String),
    #[error("cannot sign transaction: {0}")]
    Sign(String),
    #[error("cannot encode transaction: {0}")]
    Encode(String),
}

/// Compiles `instructions` into an unsigned v0 transaction with `payer`
/// as fee payer.
pub fn compile_transaction(
    payer: &solana_pubkey::Pubkey,
    instructions: &[Instruction],
    recent_blockhash: Hash,
) -> Result<VersionedTransaction, TxError> {
    let message = MessageV0::try_compile(payer, instructions, &[], recent_blockhash)
        .map_err(|e| TxError::Compile(format!("{e:?}")))?;
    Ok(VersionedTransaction {
        signatures: vec![],
        message: VersionedMessage::V0(message),
    })
}

/// Places `signer`'s signature into its slot among the required signers.
pub fn sign_transaction(
    mut tx: VersionedTransaction,
    signer: &Keypair,
) -> Result<VersionedTransaction, TxError> {
    let message_bytes = tx.message.serialize();
    let signature = signer
        .try_sign_message(message_bytes.as_slice())
        .map_err(|e| TxError::Sign(e.to_string()))?;

    // Required signatures are the first N account keys.
    let num_required = tx.message.header().num_required_signatures as usize;
    let static_keys = tx.message.static_account_keys();
    let position = static_keys[..num_required]
        .iter()
        .position(|key| *key == signer.pubkey())
        .ok_or(TxError::Sign("signer not among required signers".to_string()))?;

    if tx.signatures.len() < num_required {
        tx.signatures.resize(num_required, Signature::default());
    }
    tx.signatures[position] = signature;
    Ok(tx)
}

pub fn is_fully_signed(tx: &VersionedTransaction) -> bool {
    let num_required = tx.message.header().num_required_signatures as usize;
    tx.signatures.len() >= num_required
        && tx.signatures.iter().all(|s| *s != Signature::default())
}

/// Bincode-serializes the transaction and base64-encodes it for the wire.
pub fn transaction_to_base64(tx: &VersionedTransaction) -> Result<String, TxError> {
    let bytes = bincode::serialize(tx).map_err(|e| TxError::Encode(e.to_string()))?;
    Ok(Base64Bytes::encode(bytes).to_string())
}
