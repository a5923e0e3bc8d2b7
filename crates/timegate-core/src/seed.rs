//! BIP-39 seed management
//!
//! The seed is the single secret every role key is derived from. It is built
//! once per session from a mnemonic and wiped from memory on drop.

use bip39::{Language, Mnemonic};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of a BIP-39 seed in bytes
pub const SEED_LEN: usize = 64;

#[derive(Error, Debug)]
pub enum SeedError {
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),
}

/// A 64-byte BIP-39 seed.
///
/// Deliberately not `Clone`: one session owns one seed.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Seed([u8; SEED_LEN]);

impl Seed {
    /// Wrap raw seed bytes
    pub fn from_bytes(bytes: [u8; SEED_LEN]) -> Self {
        Self(bytes)
    }

    /// Derive the seed from a mnemonic and (possibly empty) passphrase
    pub fn from_mnemonic(mnemonic: &Mnemonic, passphrase: &str) -> Self {
        Self(mnemonic.to_seed(passphrase))
    }

    /// Parse an English mnemonic and derive the seed in one step
    pub fn from_phrase(words: &str, passphrase: &str) -> Result<Self, SeedError> {
        let mnemonic = parse_mnemonic(words)?;
        Ok(Self::from_mnemonic(&mnemonic, passphrase))
    }

    pub fn as_bytes(&self) -> &[u8; SEED_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for Seed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Seed(<redacted>)")
    }
}

/// Generate a new 12-word BIP-39 mnemonic
pub fn generate_mnemonic() -> Result<Mnemonic, SeedError> {
    Mnemonic::generate_in(Language::English, 12)
        .map_err(|e| SeedError::InvalidMnemonic(e.to_string()))
}

/// Parse a mnemonic from words
pub fn parse_mnemonic(words: &str) -> Result<Mnemonic, SeedError> {
    Mnemonic::parse_in(Language::English, words.trim())
        .map_err(|e| SeedError::InvalidMnemonic(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ABANDON: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    /// BIP-39 reference vector (passphrase "TREZOR")
    #[test]
    fn test_bip39_vector() {
        let seed = Seed::from_phrase(ABANDON, "TREZOR").unwrap();
        assert_eq!(
            hex::encode(seed.as_bytes()),
            "c55257c360c07c72029aebc1b53c05ed0362ada38ead3e3e9efa3708e53495531f09a6987599d18264c1e1c92f2cf141630c7a3c4ab7c81b2f001698e7463b04"
        );
    }

    #[test]
    fn test_generated_mnemonic_parses() {
        let mnemonic = generate_mnemonic().unwrap();
        assert_eq!(mnemonic.word_count(), 12);
        let reparsed = parse_mnemonic(&mnemonic.to_string()).unwrap();
        assert_eq!(mnemonic, reparsed);
    }

    #[test]
    fn test_invalid_mnemonic_rejected() {
        assert!(matches!(
            parse_mnemonic("not a real mnemonic"),
            Err(SeedError::InvalidMnemonic(_))
        ));
    }

    #[test]
    fn test_debug_redacts() {
        let seed = Seed::from_bytes([7u8; SEED_LEN]);
        assert_eq!(format!("{:?}", seed), "Seed(<redacted>)");
    }
}
