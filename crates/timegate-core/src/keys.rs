//! Per-role key derivation from a BIP-39 seed
//!
//! Every role owns one hardened account at `m/<account>'/1'/0'` and signs with
//! the first receive key below it (`/0/0`). The account xpub together with
//! the master fingerprint is enough for a verifier to re-derive the key.

use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, Xpriv, Xpub};
use bitcoin::secp256k1::{All, Secp256k1, SecretKey};
use bitcoin::{Network, PublicKey};
use miniscript::descriptor::{DescriptorPublicKey, DescriptorXKey, Wildcard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::seed::Seed;

/// Second hardened level of every role's origin path (testnet coin type)
pub const COIN_TYPE: u32 = 1;

/// Third hardened level of every role's origin path
pub const ACCOUNT: u32 = 0;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Seed cannot produce a master key: {0}")]
    InvalidSeed(String),
    #[error("Derivation failed: {0}")]
    Derivation(String),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("Unknown role: {0}")]
    UnknownRole(String),
}

/// A named signer and the hardened purpose index its keys live under
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Role {
    name: String,
    account: u32,
}

impl Role {
    pub fn new(name: impl Into<String>, account: u32) -> Self {
        Self {
            name: name.into(),
            account,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn account(&self) -> u32 {
        self.account
    }

    /// `m/<account>'/1'/0'`
    pub fn origin_path(&self) -> Result<DerivationPath, KeyError> {
        let levels = [self.account, COIN_TYPE, ACCOUNT]
            .into_iter()
            .map(ChildNumber::from_hardened_idx)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| KeyError::InvalidPath(format!("{}: {}", self.name, e)))?;
        Ok(DerivationPath::from(levels))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// The unhardened `/0/0` suffix below a role's origin
pub fn key_path() -> DerivationPath {
    DerivationPath::from(vec![
        ChildNumber::Normal { index: 0 },
        ChildNumber::Normal { index: 0 },
    ])
}

/// The shareable half of a role's keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolePublicKey {
    role: Role,
    master_fingerprint: Fingerprint,
    origin_path: DerivationPath,
    xpub: Xpub,
    public_key: PublicKey,
}

impl RolePublicKey {
    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Signing public key at `origin/0/0`
    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// Account-level extended public key at the origin path
    pub fn xpub(&self) -> Xpub {
        self.xpub
    }

    pub fn master_fingerprint(&self) -> Fingerprint {
        self.master_fingerprint
    }

    pub fn origin_path(&self) -> &DerivationPath {
        &self.origin_path
    }

    /// Descriptor key `[fingerprint/account'/1'/0']xpub/0/0`
    pub fn descriptor_key(&self) -> DescriptorPublicKey {
        DescriptorPublicKey::XPub(DescriptorXKey {
            origin: Some((self.master_fingerprint, self.origin_path.clone())),
            xkey: self.xpub,
            derivation_path: key_path(),
            wildcard: Wildcard::None,
        })
    }
}

/// A role's derived keys.
///
/// The account xpriv never leaves this type except through [`Self::secret_key`],
/// which callers use for the duration of a signing step only. It is erased
/// when the pair is dropped.
#[derive(Clone)]
pub struct DerivedKeyPair {
    public: RolePublicKey,
    xpriv: Xpriv,
}

impl DerivedKeyPair {
    pub fn role(&self) -> &Role {
        self.public.role()
    }

    /// Signing public key at `origin/0/0`
    pub fn public_key(&self) -> PublicKey {
        self.public.public_key()
    }

    /// Account-level extended public key at the origin path
    pub fn xpub(&self) -> Xpub {
        self.public.xpub()
    }

    pub fn master_fingerprint(&self) -> Fingerprint {
        self.public.master_fingerprint()
    }

    pub fn origin_path(&self) -> &DerivationPath {
        self.public.origin_path()
    }

    pub fn descriptor_key(&self) -> DescriptorPublicKey {
        self.public.descriptor_key()
    }

    /// Public data only, safe to keep for the whole session
    pub fn public(&self) -> &RolePublicKey {
        &self.public
    }

    /// Secret key for `origin/0/0`
    pub fn secret_key(&self, secp: &Secp256k1<All>) -> Result<SecretKey, KeyError> {
        let child = self
            .xpriv
            .derive_priv(secp, &key_path())
            .map_err(|e| KeyError::Derivation(e.to_string()))?;
        Ok(child.private_key)
    }
}

impl Drop for DerivedKeyPair {
    fn drop(&mut self) {
        self.xpriv.private_key.non_secure_erase();
    }
}

impl fmt::Debug for DerivedKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Derived key pairs indexed by role name
#[derive(Debug, Clone, Default)]
pub struct RoleKeys(BTreeMap<String, DerivedKeyPair>);

impl RoleKeys {
    pub fn get(&self, role: &str) -> Option<&DerivedKeyPair> {
        self.0.get(role)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DerivedKeyPair> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Public halves, in role-name order
    pub fn public_keys(&self) -> Vec<RolePublicKey> {
        self.0.values().map(|pair| pair.public().clone()).collect()
    }

    /// Role name -> descriptor key, the mapping the policy compiler binds with
    pub fn descriptor_keys(&self) -> BTreeMap<String, DescriptorPublicKey> {
        self.0
            .iter()
            .map(|(name, pair)| (name.clone(), pair.descriptor_key()))
            .collect()
    }

    /// Key pairs for the given role names, in the order given
    pub fn select<'a, I>(&self, roles: I) -> Result<Vec<DerivedKeyPair>, KeyError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        roles
            .into_iter()
            .map(|name| {
                self.0
                    .get(name)
                    .cloned()
                    .ok_or_else(|| KeyError::UnknownRole(name.to_string()))
            })
            .collect()
    }
}

/// Derives role keys from the session's master node
pub struct KeyManager {
    master: Xpriv,
    secp: Secp256k1<All>,
}

impl KeyManager {
    pub fn new(seed: &Seed, network: Network) -> Result<Self, KeyError> {
        let master = Xpriv::new_master(network, seed.as_bytes())
            .map_err(|e| KeyError::InvalidSeed(e.to_string()))?;
        Ok(Self {
            master,
            secp: Secp256k1::new(),
        })
    }

    /// Fingerprint of the master public key (first 4 bytes of its hash160)
    pub fn fingerprint(&self) -> Fingerprint {
        self.master.fingerprint(&self.secp)
    }

    pub fn derive_role_key(&self, role: &Role) -> Result<DerivedKeyPair, KeyError> {
        let origin_path = role.origin_path()?;
        let xpriv = self
            .master
            .derive_priv(&self.secp, &origin_path)
            .map_err(|e| KeyError::Derivation(e.to_string()))?;
        let xpub = Xpub::from_priv(&self.secp, &xpriv);
        let signing = xpub
            .derive_pub(&self.secp, &key_path())
            .map_err(|e| KeyError::Derivation(e.to_string()))?;
        let public_key = PublicKey::new(signing.public_key);

        Ok(DerivedKeyPair {
            public: RolePublicKey {
                role: role.clone(),
                master_fingerprint: self.fingerprint(),
                origin_path,
                xpub,
                public_key,
            },
            xpriv,
        })
    }

    /// Account xpub for a role; no private material
    pub fn derive_extended_public(&self, role: &Role) -> Result<Xpub, KeyError> {
        Ok(self.derive_role_key(role)?.xpub())
    }

    pub fn derive_all<'a, I>(&self, roles: I) -> Result<RoleKeys, KeyError>
    where
        I: IntoIterator<Item = &'a Role>,
    {
        let mut keys = BTreeMap::new();
        for role in roles {
            let pair = self.derive_role_key(role)?;
            log::debug!(
                "derived role {} at {} ({})",
                role,
                pair.origin_path(),
                pair.public_key()
            );
            keys.insert(role.name().to_string(), pair);
        }
        Ok(RoleKeys(keys))
    }
}

impl Drop for KeyManager {
    fn drop(&mut self) {
        self.master.private_key.non_secure_erase();
    }
}

/// One-shot derivation without keeping a [`KeyManager`] around
pub fn derive_role_key(
    seed: &Seed,
    role: &Role,
    network: Network,
) -> Result<DerivedKeyPair, KeyError> {
    KeyManager::new(seed, network)?.derive_role_key(role)
}
