//! One run of the tool: public role keys, origin height and compiled policy,
//! plus the chain-facing operations built on them.
//!
//! No private key material is held between calls. [`Session::spend`] derives
//! the chosen branch's signing keys from the seed it is handed and drops them
//! once the transaction is signed.

use anyhow::{Context, Result};
use bitcoin::bip32::Fingerprint;
use bitcoin::{Address, Amount, Network, OutPoint};
use std::sync::Arc;
use timegate_core::{KeyManager, RolePublicKey, Seed};
use timegate_esplora::{BroadcastOutcome, ChainSource};
use timegate_policy::authorization::{self, BranchStatus};
use timegate_policy::{build_spend, compile, select_utxo, CompiledPolicy, Scheme, SignedSpend, Utxo};

pub struct Session {
    chain: Arc<dyn ChainSource>,
    scheme: Scheme,
    public_keys: Vec<RolePublicKey>,
    fingerprint: Fingerprint,
    policy: CompiledPolicy,
    origin_time: i64,
}

/// Result of a spend attempt that reached the network
#[derive(Debug)]
pub struct SpendReport {
    pub spend: SignedSpend,
    /// Branch state at the tip observed just before building
    pub status: BranchStatus,
    pub outcome: BroadcastOutcome,
}

impl Session {
    /// Derive keys, fix the origin height and compile the policy.
    ///
    /// With `origin_height` unset the current tip is used, which yields a new
    /// address every time the chain advances.
    pub async fn init(
        chain: Arc<dyn ChainSource>,
        seed: &Seed,
        scheme: Scheme,
        network: Network,
        origin_height: Option<u32>,
    ) -> Result<Self> {
        let manager = KeyManager::new(seed, network).context("Failed to derive master key")?;
        let fingerprint = manager.fingerprint();
        let (public_keys, descriptor_keys) = {
            let keys = manager
                .derive_all(scheme.roles())
                .context("Failed to derive role keys")?;
            (keys.public_keys(), keys.descriptor_keys())
        };
        drop(manager);

        let origin = match origin_height {
            Some(h) => h,
            None => chain
                .tip_height()
                .await
                .context("Failed to query chain tip")?,
        };
        let hash = chain
            .block_hash(origin)
            .await
            .with_context(|| format!("Failed to fetch block hash at {}", origin))?;
        let timestamp = chain
            .block_timestamp(&hash)
            .await
            .with_context(|| format!("Failed to fetch block {}", hash))?;
        let origin_time = i64::try_from(timestamp).context("Block timestamp out of range")?;

        log::info!(
            "origin height {} ({}) mined {}",
            origin,
            hash,
            format_time(origin_time)
        );

        let policy = compile(&scheme, origin, &descriptor_keys, network)
            .with_context(|| format!("Failed to compile {} policy", scheme.variant()))?;

        Ok(Self {
            chain,
            scheme,
            public_keys,
            fingerprint,
            policy,
            origin_time,
        })
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn policy(&self) -> &CompiledPolicy {
        &self.policy
    }

    /// Every role's public keys, in role-name order
    pub fn public_keys(&self) -> &[RolePublicKey] {
        &self.public_keys
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn origin_height(&self) -> u32 {
        self.policy.origin_height()
    }

    /// Origin block time, RFC 3339
    pub fn origin_time(&self) -> String {
        format_time(self.origin_time)
    }

    /// Current tip and every branch's state against it
    pub async fn status(&self) -> Result<(u32, Vec<BranchStatus>)> {
        let height = self
            .chain
            .tip_height()
            .await
            .context("Failed to query chain tip")?;
        Ok((
            height,
            authorization::evaluate(&self.scheme, self.origin_height(), height),
        ))
    }

    /// UTXOs at the policy address, oldest first
    pub async fn utxos(&self) -> Result<Vec<Utxo>> {
        let address = self.policy.address();
        let mut utxos: Vec<Utxo> = self
            .chain
            .address_utxos(address)
            .await
            .with_context(|| format!("Failed to list UTXOs for {}", address))?
            .into_iter()
            .map(|u| {
                let height = u.height();
                Utxo::new(
                    OutPoint::new(u.txid, u.vout),
                    Amount::from_sat(u.value),
                    height,
                )
            })
            .collect();
        // Stable: equal heights keep explorer order
        utxos.sort_by_key(|u| u.height.unwrap_or(u32::MAX));
        Ok(utxos)
    }

    /// Build, sign and broadcast a spend through `branch_name`.
    ///
    /// Only the branch members' keys are derived from `seed`, and they are
    /// dropped before the broadcast. Eligibility is reported but not enforced
    /// here; the network decides.
    pub async fn spend(
        &self,
        seed: &Seed,
        branch_name: &str,
        destination: &Address,
        fee: Amount,
    ) -> Result<SpendReport> {
        let branch = self.scheme.branch(branch_name).with_context(|| {
            let names: Vec<&str> = self.scheme.branches().iter().map(|b| b.name()).collect();
            format!(
                "Unknown branch '{}' (expected one of: {})",
                branch_name,
                names.join(", ")
            )
        })?;

        let (height, _) = self.status().await?;
        let status = BranchStatus::new(branch, self.origin_height(), height);
        if !status.eligible {
            log::warn!(
                "branch {} unlocks at {}, tip is {} ({} blocks remaining)",
                branch.name(),
                status.unlock_height.unwrap_or_default(),
                height,
                status.remaining
            );
        }

        let utxos = self.utxos().await?;
        let selected = select_utxo(&utxos)?;
        let funding = self
            .chain
            .transaction(&selected.outpoint.txid)
            .await
            .with_context(|| format!("Failed to fetch funding tx {}", selected.outpoint.txid))?;
        let selected = selected.clone().with_funding_tx(funding);

        let spend = {
            let manager = KeyManager::new(seed, self.policy.network())
                .context("Failed to derive master key")?;
            let signers = self
                .scheme
                .roles()
                .iter()
                .filter(|role| branch.is_member(role.name()))
                .map(|role| manager.derive_role_key(role))
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to derive signing keys")?;
            build_spend(
                branch,
                &self.policy,
                &signers,
                std::slice::from_ref(&selected),
                destination,
                fee,
            )?
        };

        let outcome = self
            .chain
            .broadcast(&spend.to_hex())
            .await
            .context("Broadcast request failed")?;

        match &outcome {
            BroadcastOutcome::Accepted(txid) => log::info!("{} spend accepted: {}", branch.name(), txid),
            BroadcastOutcome::PrematureLocktime { .. } => log::info!(
                "{} spend rejected as premature, {} blocks remaining",
                branch.name(),
                status.remaining
            ),
            BroadcastOutcome::OtherRejection(reason) => {
                log::warn!("{} spend rejected: {}", branch.name(), reason)
            }
        }

        Ok(SpendReport {
            spend,
            status,
            outcome,
        })
    }
}

fn format_time(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| timestamp.to_string())
}
