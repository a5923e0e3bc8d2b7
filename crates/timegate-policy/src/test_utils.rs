//! Deterministic keys, UTXOs and addresses shared by the unit tests.

use bitcoin::hashes::Hash as _;
use bitcoin::{Address, Amount, Network, OutPoint, Txid};
use std::str::FromStr;
use timegate_core::{KeyManager, Role, RoleKeys, Seed, SEED_LEN};

use crate::scheme::{Scheme, Variant};
use crate::spend::Utxo;

/// BIP-39 test mnemonic; never fund it on mainnet.
pub const TEST_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

/// Keys for `roles` derived from [`TEST_MNEMONIC`] on testnet.
pub fn role_keys(roles: &[Role]) -> RoleKeys {
    let seed = Seed::from_phrase(TEST_MNEMONIC, "").unwrap();
    KeyManager::new(&seed, Network::Testnet)
        .unwrap()
        .derive_all(roles)
        .unwrap()
}

/// Keys for `roles` from an unrelated seed, same role names and paths.
pub fn foreign_role_keys(roles: &[Role]) -> RoleKeys {
    KeyManager::new(&Seed::from_bytes([0x42; SEED_LEN]), Network::Testnet)
        .unwrap()
        .derive_all(roles)
        .unwrap()
}

/// A variant's scheme with keys for every one of its roles.
pub fn test_scheme_keys(variant: Variant) -> (Scheme, RoleKeys) {
    let scheme = variant.scheme();
    let keys = role_keys(scheme.roles());
    (scheme, keys)
}

/// A confirmed-or-not UTXO with a synthetic txid derived from `tag`.
pub fn test_utxo(tag: u8, sats: u64, height: Option<u32>) -> Utxo {
    let txid = Txid::from_byte_array([tag; 32]);
    Utxo::new(OutPoint::new(txid, 0), Amount::from_sat(sats), height)
}

/// Testnet faucet return address.
pub fn test_destination() -> Address {
    Address::from_str("tb1qerzrlxcfu24davlur5sqmgzzgsal6wusda40er")
        .unwrap()
        .require_network(Network::Testnet)
        .unwrap()
}
