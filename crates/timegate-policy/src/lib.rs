//! Timelocked spending policies
//!
//! A [`scheme::Scheme`] names roles and the branches through which they may
//! spend. Each branch is a k-of-n threshold optionally gated by an absolute
//! block-height locktime measured from an origin height.
//!
//! # Example Policy
//!
//! ```text
//! or(
//!   thresh(2, pk(daily-1), pk(daily-2), pk(daily-3)),
//!   or(
//!     and(thresh(1, pk(recovery-1), pk(recovery-2)), after(origin + 3)),
//!     and(pk(emergency), after(origin + 5))
//!   )
//! )
//! ```
//!
//! [`compiler::compile`] turns the scheme into a P2WSH descriptor bound to
//! seed-derived keys, [`authorization`] reports which branches are open at a
//! tip height and [`spend::build_spend`] produces a finalized transaction.

pub mod authorization;
pub mod compiler;
pub mod scheme;
pub mod spend;

#[cfg(test)]
mod test_utils;

pub use authorization::{evaluate, BranchStatus};
pub use compiler::{compile, CompiledPolicy, PolicyError};
pub use scheme::{Branch, Scheme, SchemeError, Variant};
pub use spend::{build_spend, select_utxo, SignedSpend, SpendError, Utxo, DEFAULT_FEE};
