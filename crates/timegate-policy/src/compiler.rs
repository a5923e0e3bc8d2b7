//! Policy compilation
//!
//! Turns a [`Scheme`] anchored at an origin height into a P2WSH descriptor.
//!
//! The policy is first assembled over role names, compiled and checked for
//! soundness, and only then bound to concrete keys. Binding goes through a
//! [`Translator`] keyed by exact role name, so `recovery-1` and `recovery-10`
//! can never be confused the way textual find-and-replace would allow.

use bitcoin::absolute::LockTime;
use bitcoin::{Address, Network, PublicKey, ScriptBuf};
use miniscript::descriptor::{DefiniteDescriptorKey, DescriptorPublicKey};
use miniscript::policy::Concrete;
use miniscript::{
    AbsLockTime, Descriptor, MiniscriptKey, Segwitv0, Threshold, ToPublicKey, Translator,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::scheme::{Branch, Scheme};

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Unsound policy {expression}: {reason}")]
    UnsoundPolicy { expression: String, reason: String },

    #[error("Policy compilation failed for {expression}: {reason}")]
    CompilerError { expression: String, reason: String },

    #[error("Invalid absolute locktime: {0}")]
    InvalidLocktime(String),

    #[error("No key bound to role {0}")]
    MissingKey(String),

    #[error("Descriptor error: {0}")]
    Descriptor(String),
}

/// The outcome of compiling a scheme at an origin height
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    variant: String,
    origin_height: u32,
    network: Network,
    /// Policy over role placeholders
    expression: String,
    /// Compiled miniscript over role placeholders
    miniscript: String,
    descriptor: Descriptor<DescriptorPublicKey>,
    definite: Descriptor<DefiniteDescriptorKey>,
    address: Address,
    locktimes: BTreeMap<String, LockTime>,
    /// Signing key each branch member is bound to
    bound_keys: BTreeMap<String, PublicKey>,
}

impl CompiledPolicy {
    pub fn variant(&self) -> &str {
        &self.variant
    }

    pub fn origin_height(&self) -> u32 {
        self.origin_height
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn miniscript(&self) -> &str {
        &self.miniscript
    }

    pub fn descriptor(&self) -> &Descriptor<DescriptorPublicKey> {
        &self.descriptor
    }

    /// Descriptor with every key at its final derivation step
    pub fn definite_descriptor(&self) -> &Descriptor<DefiniteDescriptorKey> {
        &self.definite
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }

    pub fn witness_script(&self) -> Result<ScriptBuf, PolicyError> {
        self.definite
            .explicit_script()
            .map_err(|e| PolicyError::Descriptor(e.to_string()))
    }

    /// Absolute locktime of a branch, `None` when the branch has no wait
    pub fn locktime(&self, branch: &str) -> Option<LockTime> {
        self.locktimes.get(branch).copied()
    }

    pub fn locktimes(&self) -> &BTreeMap<String, LockTime> {
        &self.locktimes
    }

    /// The public key the script expects from `role`
    pub fn bound_key(&self, role: &str) -> Option<PublicKey> {
        self.bound_keys.get(role).copied()
    }
}

/// Height-encoded absolute locktime for `origin_height + wait`
pub fn absolute_locktime(origin_height: u32, wait: u32) -> Result<LockTime, PolicyError> {
    let height = origin_height
        .checked_add(wait)
        .ok_or_else(|| PolicyError::InvalidLocktime(format!("{} + {}", origin_height, wait)))?;
    LockTime::from_height(height).map_err(|e| PolicyError::InvalidLocktime(e.to_string()))
}

/// Per-branch absolute locktimes, only for branches with a wait
pub fn branch_locktimes(
    scheme: &Scheme,
    origin_height: u32,
) -> Result<BTreeMap<String, LockTime>, PolicyError> {
    scheme
        .branches()
        .iter()
        .filter_map(|b| b.wait().map(|w| (b.name(), w)))
        .map(|(name, wait)| Ok((name.to_string(), absolute_locktime(origin_height, wait)?)))
        .collect()
}

/// Assemble the policy over role-name placeholders.
///
/// Branches combine as `or(b1, or(b2, ...))`; inside a branch the signer
/// threshold is conjoined with `after(locktime)` when the branch waits.
pub fn policy_expression(
    scheme: &Scheme,
    locktimes: &BTreeMap<String, LockTime>,
) -> Result<Concrete<String>, PolicyError> {
    let mut branches = scheme
        .branches()
        .iter()
        .map(|b| branch_policy(b, locktimes.get(b.name()).copied()))
        .collect::<Result<Vec<_>, _>>()?;

    let mut combined = branches
        .pop()
        .ok_or_else(|| PolicyError::Descriptor("scheme has no branches".into()))?;
    while let Some(branch) = branches.pop() {
        combined = Arc::new(Concrete::Or(vec![(1, branch), (1, combined)]));
    }

    Ok(Arc::unwrap_or_clone(combined))
}

fn branch_policy(
    branch: &Branch,
    locktime: Option<LockTime>,
) -> Result<Arc<Concrete<String>>, PolicyError> {
    let signers = match branch.members() {
        _ if branch.threshold() == 0 => None,
        [single] => Some(Arc::new(Concrete::Key(single.clone()))),
        members => {
            let keys = members
                .iter()
                .map(|m| Arc::new(Concrete::Key(m.clone())))
                .collect();
            let thresh = Threshold::new(branch.threshold(), keys).map_err(|e| {
                PolicyError::CompilerError {
                    expression: branch.name().to_string(),
                    reason: e.to_string(),
                }
            })?;
            Some(Arc::new(Concrete::Thresh(thresh)))
        }
    };

    let after = locktime
        .map(|lt| {
            AbsLockTime::from_consensus(lt.to_consensus_u32())
                .map(|abs| Arc::new(Concrete::After(abs)))
                .map_err(|e| PolicyError::InvalidLocktime(e.to_string()))
        })
        .transpose()?;

    Ok(match (signers, after) {
        (Some(signers), Some(after)) => Arc::new(Concrete::And(vec![signers, after])),
        (Some(signers), None) => signers,
        (None, Some(after)) => after,
        (None, None) => Arc::new(Concrete::Trivial),
    })
}

/// Compile `scheme` at `origin_height`, binding each role to its key.
///
/// Fails without a partial result: an unsound policy aborts with
/// [`PolicyError::UnsoundPolicy`], a compiler failure with
/// [`PolicyError::CompilerError`]; both carry the placeholder expression.
pub fn compile(
    scheme: &Scheme,
    origin_height: u32,
    keys: &BTreeMap<String, DescriptorPublicKey>,
    network: Network,
) -> Result<CompiledPolicy, PolicyError> {
    let locktimes = branch_locktimes(scheme, origin_height)?;
    let policy = policy_expression(scheme, &locktimes)?;
    let expression = policy.to_string();
    log::debug!("{} policy: {}", scheme.variant(), expression);

    let unsound = |reason: String| PolicyError::UnsoundPolicy {
        expression: expression.clone(),
        reason,
    };

    policy.is_valid().map_err(|e| unsound(e.to_string()))?;
    let (safe, non_malleable) = policy.is_safe_nonmalleable();
    if !safe {
        return Err(unsound("a branch can be spent without any signature".into()));
    }
    if !non_malleable {
        return Err(unsound("no non-malleable satisfaction exists".into()));
    }

    let ms = policy
        .compile::<Segwitv0>()
        .map_err(|e| PolicyError::CompilerError {
            expression: expression.clone(),
            reason: e.to_string(),
        })?;
    ms.sanity_check().map_err(|e| unsound(e.to_string()))?;
    let miniscript = ms.to_string();

    let mut bound_keys = BTreeMap::new();
    for member in scheme.branches().iter().flat_map(|b| b.members()) {
        let key = keys
            .get(member)
            .ok_or_else(|| PolicyError::MissingKey(member.clone()))?;
        let definite = key
            .clone()
            .at_derivation_index(0)
            .map_err(|e| PolicyError::Descriptor(format!("{}: {}", member, e)))?;
        bound_keys.insert(member.clone(), definite.to_public_key());
    }

    let placeholder_desc =
        Descriptor::new_wsh(ms).map_err(|e| PolicyError::Descriptor(e.to_string()))?;
    let descriptor = placeholder_desc
        .translate_pk(&mut RoleBinder { keys })
        .map_err(|e| PolicyError::Descriptor(format!("key binding failed: {:?}", e)))?;

    let definite = descriptor
        .at_derivation_index(0)
        .map_err(|e| PolicyError::Descriptor(e.to_string()))?;
    let address = definite
        .address(network)
        .map_err(|e| PolicyError::Descriptor(e.to_string()))?;

    log::info!(
        "compiled {} policy at origin {} -> {}",
        scheme.variant(),
        origin_height,
        address
    );

    Ok(CompiledPolicy {
        variant: scheme.variant().to_string(),
        origin_height,
        network,
        expression,
        miniscript,
        descriptor,
        definite,
        address,
        locktimes,
        bound_keys,
    })
}

/// Binds role-name placeholders to descriptor keys
struct RoleBinder<'a> {
    keys: &'a BTreeMap<String, DescriptorPublicKey>,
}

impl RoleBinder<'_> {
    fn no_hashes() -> PolicyError {
        PolicyError::Descriptor("hash locks are not part of any scheme".into())
    }
}

impl Translator<String> for RoleBinder<'_> {
    type TargetPk = DescriptorPublicKey;
    type Error = PolicyError;

    fn pk(&mut self, role: &String) -> Result<DescriptorPublicKey, PolicyError> {
        self.keys
            .get(role)
            .cloned()
            .ok_or_else(|| PolicyError::MissingKey(role.clone()))
    }

    fn sha256(
        &mut self,
        _sha256: &<String as MiniscriptKey>::Sha256,
    ) -> Result<<DescriptorPublicKey as MiniscriptKey>::Sha256, PolicyError> {
        Err(Self::no_hashes())
    }

    fn hash256(
        &mut self,
        _hash256: &<String as MiniscriptKey>::Hash256,
    ) -> Result<<DescriptorPublicKey as MiniscriptKey>::Hash256, PolicyError> {
        Err(Self::no_hashes())
    }

    fn ripemd160(
        &mut self,
        _ripemd160: &<String as MiniscriptKey>::Ripemd160,
    ) -> Result<<DescriptorPublicKey as MiniscriptKey>::Ripemd160, PolicyError> {
        Err(Self::no_hashes())
    }

    fn hash160(
        &mut self,
        _hash160: &<String as MiniscriptKey>::Hash160,
    ) -> Result<<DescriptorPublicKey as MiniscriptKey>::Hash160, PolicyError> {
        Err(Self::no_hashes())
    }
}
