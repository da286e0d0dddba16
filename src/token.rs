//! SPL token plumbing shared by verification, payment, and sweep.

use solana_pubkey::{Pubkey, pubkey};
use spl_token::solana_program::program_pack::Pack;

use crate::ledger::{LedgerError, LedgerRpc};

pub const ATA_PROGRAM_PUBKEY: Pubkey = pubkey!("ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL");

/// Errors from reading token mints.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("mint {0} does not exist")]
    MintNotFound(Pubkey),
    #[error("mint {mint} could not be unpacked: {message}")]
    MintUnreadable { mint: Pubkey, message: String },
    #[error("mint {0} is owned by an unknown token program")]
    UnknownMintOwner(Pubkey),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Mint information for SPL tokens.
#[derive(Debug, Clone, Copy)]
pub enum Mint {
    Token { decimals: u8 },
    Token2022 { decimals: u8 },
}

impl Mint {
    pub fn token_program(&self) -> Pubkey {
        match self {
            Mint::Token { .. } => spl_token::id(),
            Mint::Token2022 { .. } => spl_token_2022::id(),
        }
    }

    pub fn decimals(&self) -> u8 {
        match self {
            Mint::Token { decimals } | Mint::Token2022 { decimals } => *decimals,
        }
    }
}

/// Fetch mint information from the ledger, dispatching on the owning
/// token program.
pub async fn fetch_mint<L: LedgerRpc>(ledger: &L, mint: &Pubkey) -> Result<Mint, TokenError> {
    let account = ledger
        .get_account(mint)
        .await?
        .ok_or(TokenError::MintNotFound(*mint))?;
    if account.owner == spl_token::id() {
        let state = spl_token::state::Mint::unpack(&account.data).map_err(|e| {
            TokenError::MintUnreadable {
                mint: *mint,
                message: e.to_string(),
            }
        })?;
        Ok(Mint::Token {
            decimals: state.decimals,
        })
    } else if account.owner == spl_token_2022::id() {
        let state = spl_token_2022::state::Mint::unpack(&account.data).map_err(|e| {
            TokenError::MintUnreadable {
                mint: *mint,
                message: e.to_string(),
            }
        })?;
        Ok(Mint::Token2022 {
            decimals: state.decimals,
        })
    } else {
        Err(TokenError::UnknownMintOwner(*mint))
    }
}

/// Derives the associated token account for `owner` under `token_program`.
pub fn associated_token_address(
    owner: &Pubkey,
    token_program: &Pubkey,
    mint: &Pubkey,
) -> Pubkey {
    let (ata, _) = Pubkey::find_program_address(
        &[owner.as_ref(), token_program.as_ref(), mint.as_ref()],
        &ATA_PROGRAM_PUBKEY,
    );
    ata
}
