//! Spend construction for a selected branch
//!
//! Picks the oldest UTXO at the policy address, pays `value - fee` to the
//! destination, signs with the supplied role keys and lets the miniscript
//! satisfier assemble the witness. Nothing is broadcast here.

use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::ecdsa;
use bitcoin::hashes::Hash as _;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use miniscript::psbt::PsbtExt;
use std::collections::BTreeSet;
use thiserror::Error;
use timegate_core::DerivedKeyPair;

use crate::compiler::CompiledPolicy;
use crate::scheme::Branch;

/// Fixed fee paid by every spend
pub const DEFAULT_FEE: Amount = Amount::from_sat(200);

#[derive(Error, Debug)]
pub enum SpendError {
    #[error("No UTXOs at the policy address")]
    NoFunds,

    #[error("UTXO value {value} does not cover the fee {fee}")]
    InsufficientValue { value: Amount, fee: Amount },

    #[error("Branch {branch} needs {required} signers, {supplied} supplied")]
    InsufficientSigners {
        branch: String,
        required: usize,
        supplied: usize,
    },

    #[error("Key for role {role} is not the key the policy was compiled with")]
    KeyMismatch { role: String },

    #[error("Funding transaction does not match {0}")]
    PrevoutMismatch(OutPoint),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Finalization failed: {0}")]
    FinalizationError(String),

    #[error("PSBT error: {0}")]
    Psbt(String),
}

/// An unspent output at the policy address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: Amount,
    /// Confirmation height, `None` while unconfirmed
    pub height: Option<u32>,
    /// Full funding transaction, when the caller fetched it
    pub funding_tx: Option<Transaction>,
}

impl Utxo {
    pub fn new(outpoint: OutPoint, value: Amount, height: Option<u32>) -> Self {
        Self {
            outpoint,
            value,
            height,
            funding_tx: None,
        }
    }

    pub fn with_funding_tx(mut self, tx: Transaction) -> Self {
        self.funding_tx = Some(tx);
        self
    }

    pub fn is_confirmed(&self) -> bool {
        self.height.is_some()
    }
}

/// Oldest confirmed UTXO first; ties keep input order. Unconfirmed outputs go last.
pub fn select_utxo(utxos: &[Utxo]) -> Result<&Utxo, SpendError> {
    utxos
        .iter()
        .min_by_key(|u| u.height.unwrap_or(u32::MAX))
        .ok_or(SpendError::NoFunds)
}

/// `value - fee`, rejecting anything that leaves nothing to pay out
pub fn payout(value: Amount, fee: Amount) -> Result<Amount, SpendError> {
    value
        .checked_sub(fee)
        .filter(|p| *p > Amount::ZERO)
        .ok_or(SpendError::InsufficientValue { value, fee })
}

/// A finalized spend ready for broadcast
#[derive(Debug, Clone)]
pub struct SignedSpend {
    pub branch: String,
    pub outpoint: OutPoint,
    pub payout: Amount,
    pub fee: Amount,
    pub lock_time: LockTime,
    pub tx: Transaction,
}

impl SignedSpend {
    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }

    /// Wire-format hex
    pub fn to_hex(&self) -> String {
        serialize_hex(&self.tx)
    }
}

/// Build, sign and finalize a spend of the oldest UTXO through `branch`.
///
/// `signers` are the role keys meant for this branch. Keys of roles outside
/// the branch are ignored. A member key that differs from the one bound at
/// compile time fails with [`SpendError::KeyMismatch`], and fewer member keys
/// than the threshold with [`SpendError::InsufficientSigners`], both before
/// anything is signed.
pub fn build_spend(
    branch: &Branch,
    policy: &CompiledPolicy,
    signers: &[DerivedKeyPair],
    utxos: &[Utxo],
    destination: &Address,
    fee: Amount,
) -> Result<SignedSpend, SpendError> {
    let utxo = select_utxo(utxos)?;
    let payout = payout(utxo.value, fee)?;

    let members: Vec<&DerivedKeyPair> = signers
        .iter()
        .filter(|s| {
            let member = branch.is_member(s.role().name());
            if !member {
                log::warn!(
                    "ignoring key for role {}: not a member of branch {}",
                    s.role(),
                    branch.name()
                );
            }
            member
        })
        .collect();
    for signer in &members {
        let role = signer.role().name();
        if policy.bound_key(role) != Some(signer.public_key()) {
            return Err(SpendError::KeyMismatch {
                role: role.to_string(),
            });
        }
    }
    let distinct: BTreeSet<&str> = members.iter().map(|s| s.role().name()).collect();
    if distinct.len() < branch.threshold() {
        return Err(SpendError::InsufficientSigners {
            branch: branch.name().to_string(),
            required: branch.threshold(),
            supplied: distinct.len(),
        });
    }

    let script_pubkey = policy.script_pubkey();
    if let Some(funding) = &utxo.funding_tx {
        check_prevout(funding, utxo, &script_pubkey)?;
    }

    let lock_time = policy.locktime(branch.name()).unwrap_or(LockTime::ZERO);
    let mut psbt = unsigned_psbt(policy, utxo, lock_time, payout, destination)?;
    sign_input(&mut psbt, policy, utxo.value, &members)?;
    let tx = finalize(psbt)?;

    log::info!(
        "built {} spend of {} for {} (locktime {})",
        branch.name(),
        utxo.outpoint,
        payout,
        lock_time
    );

    Ok(SignedSpend {
        branch: branch.name().to_string(),
        outpoint: utxo.outpoint,
        payout,
        fee,
        lock_time,
        tx,
    })
}

/// Single-input PSBT paying `payout` to `destination`, populated from the descriptor
fn unsigned_psbt(
    policy: &CompiledPolicy,
    utxo: &Utxo,
    lock_time: LockTime,
    payout: Amount,
    destination: &Address,
) -> Result<Psbt, SpendError> {
    let tx = Transaction {
        version: Version::TWO,
        lock_time,
        input: vec![TxIn {
            previous_output: utxo.outpoint,
            script_sig: ScriptBuf::new(),
            // Non-final so nLockTime is enforced
            sequence: Sequence::ENABLE_LOCKTIME_NO_RBF,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: payout,
            script_pubkey: destination.script_pubkey(),
        }],
    };

    let mut psbt =
        Psbt::from_unsigned_tx(tx).map_err(|e| SpendError::Psbt(format!("PSBT creation failed: {}", e)))?;
    psbt.inputs[0].witness_utxo = Some(TxOut {
        value: utxo.value,
        script_pubkey: policy.script_pubkey(),
    });
    psbt.inputs[0].non_witness_utxo = utxo.funding_tx.clone();
    psbt.update_input_with_descriptor(0, policy.definite_descriptor())
        .map_err(|e| SpendError::Psbt(e.to_string()))?;

    Ok(psbt)
}

/// Let the miniscript satisfier assemble the witness, then extract
fn finalize(mut psbt: Psbt) -> Result<Transaction, SpendError> {
    let secp = Secp256k1::verification_only();
    psbt.finalize_mut(&secp).map_err(|errors| {
        SpendError::FinalizationError(
            errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        )
    })?;

    psbt.extract_tx()
        .map_err(|e| SpendError::Psbt(e.to_string()))
}

fn check_prevout(funding: &Transaction, utxo: &Utxo, script_pubkey: &ScriptBuf) -> Result<(), SpendError> {
    let matches = funding.compute_txid() == utxo.outpoint.txid
        && funding
            .output
            .get(utxo.outpoint.vout as usize)
            .is_some_and(|out| out.value == utxo.value && &out.script_pubkey == script_pubkey);
    if matches {
        Ok(())
    } else {
        Err(SpendError::PrevoutMismatch(utxo.outpoint))
    }
}

/// ECDSA/SIGHASH_ALL signature from each key into the input's partial sigs
fn sign_input(
    psbt: &mut Psbt,
    policy: &CompiledPolicy,
    value: Amount,
    signers: &[&DerivedKeyPair],
) -> Result<(), SpendError> {
    let secp = Secp256k1::new();
    let witness_script = policy
        .witness_script()
        .map_err(|e| SpendError::Signing(e.to_string()))?;

    let sighash = SighashCache::new(&psbt.unsigned_tx)
        .p2wsh_signature_hash(0, &witness_script, value, EcdsaSighashType::All)
        .map_err(|e| SpendError::Signing(e.to_string()))?;
    let msg = Message::from_digest(sighash.to_byte_array());

    for signer in signers {
        let mut secret = signer
            .secret_key(&secp)
            .map_err(|e| SpendError::Signing(e.to_string()))?;
        let signature = ecdsa::Signature {
            signature: secp.sign_ecdsa(&msg, &secret),
            sighash_type: EcdsaSighashType::All,
        };
        secret.non_secure_erase();
        psbt.inputs[0]
            .partial_sigs
            .insert(signer.public_key(), signature);
        log::debug!("signed with role {}", signer.role());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::scheme::Variant;
    use crate::test_utils::{foreign_role_keys, test_destination, test_scheme_keys, test_utxo};
    use bitcoin::Network;

    #[test]
    fn test_payout_scenarios() {
        assert_eq!(
            payout(Amount::from_sat(1000), Amount::from_sat(200)).unwrap(),
            Amount::from_sat(800)
        );
        assert!(matches!(
            payout(Amount::from_sat(150), Amount::from_sat(200)),
            Err(SpendError::InsufficientValue { .. })
        ));
        assert!(matches!(
            payout(Amount::from_sat(200), Amount::from_sat(200)),
            Err(SpendError::InsufficientValue { .. })
        ));
    }

    #[test]
    fn test_select_oldest() {
        let utxos = vec![test_utxo(1, 5_000, Some(80)), test_utxo(2, 5_000, Some(50))];
        assert_eq!(select_utxo(&utxos).unwrap().height, Some(50));
    }

    #[test]
    fn test_select_ties_keep_input_order() {
        let utxos = vec![
            test_utxo(7, 1_000, Some(50)),
            test_utxo(8, 2_000, Some(50)),
        ];
        assert_eq!(select_utxo(&utxos).unwrap().value, Amount::from_sat(1_000));
    }

    #[test]
    fn test_select_prefers_confirmed() {
        let utxos = vec![test_utxo(1, 1_000, None), test_utxo(2, 1_000, Some(900))];
        assert_eq!(select_utxo(&utxos).unwrap().height, Some(900));
    }

    #[test]
    fn test_empty_utxos_no_funds() {
        let (scheme, keys) = test_scheme_keys(Variant::Vault);
        let policy = compile(&scheme, 100, &keys.descriptor_keys(), Network::Testnet).unwrap();
        let signers = keys.select(["immediate"]).unwrap();

        let result = build_spend(
            scheme.branch("immediate").unwrap(),
            &policy,
            &signers,
            &[],
            &test_destination(),
            DEFAULT_FEE,
        );
        assert!(matches!(result, Err(SpendError::NoFunds)));
    }

    #[test]
    fn test_value_below_fee() {
        let (scheme, keys) = test_scheme_keys(Variant::Vault);
        let policy = compile(&scheme, 100, &keys.descriptor_keys(), Network::Testnet).unwrap();
        let signers = keys.select(["immediate"]).unwrap();

        let result = build_spend(
            scheme.branch("immediate").unwrap(),
            &policy,
            &signers,
            &[test_utxo(1, 150, Some(90))],
            &test_destination(),
            DEFAULT_FEE,
        );
        assert!(matches!(result, Err(SpendError::InsufficientValue { .. })));
    }

    #[test]
    fn test_immediate_spend_pays_value_minus_fee() {
        let (scheme, keys) = test_scheme_keys(Variant::Vault);
        let policy = compile(&scheme, 100, &keys.descriptor_keys(), Network::Testnet).unwrap();
        let signers = keys.select(["immediate"]).unwrap();

        let spend = build_spend(
            scheme.branch("immediate").unwrap(),
            &policy,
            &signers,
            &[test_utxo(1, 1_000, Some(90))],
            &test_destination(),
            DEFAULT_FEE,
        )
        .unwrap();

        assert_eq!(spend.payout, Amount::from_sat(800));
        assert_eq!(spend.tx.output[0].value, Amount::from_sat(800));
        assert_eq!(spend.lock_time, LockTime::ZERO);
        assert!(!spend.tx.input[0].witness.is_empty());
        assert!(!spend.to_hex().is_empty());
    }

    #[test]
    fn test_delayed_spend_sets_locktime() {
        let (scheme, keys) = test_scheme_keys(Variant::Vault);
        let policy = compile(&scheme, 100, &keys.descriptor_keys(), Network::Testnet).unwrap();
        let signers = keys.select(["delayed"]).unwrap();

        let spend = build_spend(
            scheme.branch("delayed").unwrap(),
            &policy,
            &signers,
            &[test_utxo(1, 10_000, Some(90))],
            &test_destination(),
            DEFAULT_FEE,
        )
        .unwrap();

        assert_eq!(spend.lock_time.to_consensus_u32(), 103);
        assert_eq!(spend.tx.lock_time.to_consensus_u32(), 103);
        assert!(spend.tx.input[0].sequence.enables_absolute_lock_time());
    }

    #[test]
    fn test_threshold_checked_before_signing() {
        let (scheme, keys) = test_scheme_keys(Variant::SelfCustody);
        let policy = compile(&scheme, 100, &keys.descriptor_keys(), Network::Testnet).unwrap();
        // One daily key plus an outsider does not make 2-of-3
        let signers = keys.select(["daily-1", "emergency"]).unwrap();

        let result = build_spend(
            scheme.branch("daily").unwrap(),
            &policy,
            &signers,
            &[test_utxo(1, 10_000, Some(90))],
            &test_destination(),
            DEFAULT_FEE,
        );
        assert!(matches!(
            result,
            Err(SpendError::InsufficientSigners { required: 2, supplied: 1, .. })
        ));
    }

    #[test]
    fn test_funding_tx_must_match() {
        let (scheme, keys) = test_scheme_keys(Variant::Vault);
        let policy = compile(&scheme, 100, &keys.descriptor_keys(), Network::Testnet).unwrap();
        let signers = keys.select(["immediate"]).unwrap();

        // A funding tx paying somewhere else cannot back this outpoint
        let funding = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![TxOut {
                value: Amount::from_sat(10_000),
                script_pubkey: test_destination().script_pubkey(),
            }],
        };
        let utxo = Utxo::new(
            OutPoint::new(funding.compute_txid(), 0),
            Amount::from_sat(10_000),
            Some(90),
        )
        .with_funding_tx(funding);

        let result = build_spend(
            scheme.branch("immediate").unwrap(),
            &policy,
            &signers,
            &[utxo],
            &test_destination(),
            DEFAULT_FEE,
        );
        assert!(matches!(result, Err(SpendError::PrevoutMismatch(_))));
    }

    #[test]
    fn test_foreign_keys_refused() {
        let (scheme, keys) = test_scheme_keys(Variant::Vault);
        let policy = compile(&scheme, 100, &keys.descriptor_keys(), Network::Testnet).unwrap();
        // Right role name, wrong seed
        let signers = foreign_role_keys(scheme.roles()).select(["immediate"]).unwrap();

        let result = build_spend(
            scheme.branch("immediate").unwrap(),
            &policy,
            &signers,
            &[test_utxo(1, 10_000, Some(90))],
            &test_destination(),
            DEFAULT_FEE,
        );
        match result {
            Err(SpendError::KeyMismatch { role }) => assert_eq!(role, "immediate"),
            other => panic!("expected KeyMismatch, got {:?}", other.map(|s| s.txid())),
        }
    }

    #[test]
    fn test_one_foreign_key_among_members_refused() {
        let (scheme, keys) = test_scheme_keys(Variant::SelfCustody);
        let policy = compile(&scheme, 100, &keys.descriptor_keys(), Network::Testnet).unwrap();
        let mut signers = keys.select(["daily-1"]).unwrap();
        signers.extend(foreign_role_keys(scheme.roles()).select(["daily-2"]).unwrap());

        let result = build_spend(
            scheme.branch("daily").unwrap(),
            &policy,
            &signers,
            &[test_utxo(1, 10_000, Some(90))],
            &test_destination(),
            DEFAULT_FEE,
        );
        assert!(matches!(result, Err(SpendError::KeyMismatch { role }) if role == "daily-2"));
    }

    #[test]
    fn test_unsigned_input_fails_finalization() {
        let (scheme, keys) = test_scheme_keys(Variant::Vault);
        let policy = compile(&scheme, 100, &keys.descriptor_keys(), Network::Testnet).unwrap();
        let utxo = test_utxo(1, 10_000, Some(90));

        let psbt = unsigned_psbt(
            &policy,
            &utxo,
            LockTime::ZERO,
            Amount::from_sat(9_800),
            &test_destination(),
        )
        .unwrap();
        assert!(psbt.inputs[0].witness_script.is_some());
        assert!(psbt.inputs[0].partial_sigs.is_empty());

        let result = finalize(psbt);
        assert!(matches!(result, Err(SpendError::FinalizationError(_))));
    }

    #[test]
    fn test_signature_from_unbound_key_fails_finalization() {
        let (scheme, keys) = test_scheme_keys(Variant::Vault);
        let policy = compile(&scheme, 100, &keys.descriptor_keys(), Network::Testnet).unwrap();
        let utxo = test_utxo(1, 10_000, Some(90));
        let foreign = foreign_role_keys(scheme.roles()).select(["immediate"]).unwrap();

        let mut psbt = unsigned_psbt(
            &policy,
            &utxo,
            LockTime::ZERO,
            Amount::from_sat(9_800),
            &test_destination(),
        )
        .unwrap();
        let members: Vec<&DerivedKeyPair> = foreign.iter().collect();
        sign_input(&mut psbt, &policy, utxo.value, &members).unwrap();
        assert_eq!(psbt.inputs[0].partial_sigs.len(), 1);

        // The satisfier finds no signature for the script's key
        let result = finalize(psbt);
        assert!(matches!(result, Err(SpendError::FinalizationError(_))));
    }
}
