//! Branch eligibility against the chain tip
//!
//! Advisory only: consensus enforces the locktimes. These numbers drive the
//! status display and the message shown when a broadcast is premature.

use serde::Serialize;
use std::fmt;

use crate::scheme::{Branch, Scheme};

/// Approximate blocks per day (~10 min each)
pub const BLOCKS_PER_DAY: u32 = 144;

/// Blocks left until `branch` becomes spendable, clamped at zero.
///
/// A branch without a wait is eligible immediately and forever.
pub fn remaining(branch: &Branch, origin_height: u32, current_height: u32) -> u32 {
    match branch.wait() {
        Some(wait) => origin_height
            .saturating_add(wait)
            .saturating_sub(current_height),
        None => 0,
    }
}

pub fn eligible(branch: &Branch, origin_height: u32, current_height: u32) -> bool {
    remaining(branch, origin_height, current_height) == 0
}

/// Snapshot of one branch at a given tip height
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchStatus {
    pub branch: String,
    pub threshold: usize,
    pub members: Vec<String>,
    pub wait: Option<u32>,
    /// Absolute unlock height, `None` for immediate branches
    pub unlock_height: Option<u32>,
    pub remaining: u32,
    pub eligible: bool,
}

impl BranchStatus {
    pub fn new(branch: &Branch, origin_height: u32, current_height: u32) -> Self {
        let remaining = remaining(branch, origin_height, current_height);
        Self {
            branch: branch.name().to_string(),
            threshold: branch.threshold(),
            members: branch.members().to_vec(),
            wait: branch.wait(),
            unlock_height: branch.wait().map(|w| origin_height.saturating_add(w)),
            remaining,
            eligible: remaining == 0,
        }
    }
}

impl fmt::Display for BranchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} of {})",
            self.branch,
            self.threshold,
            self.members.join(", ")
        )?;
        if self.eligible {
            write!(f, ": spendable")
        } else {
            write!(
                f,
                ": {} blocks remaining ({})",
                self.remaining,
                ApproxDuration(self.remaining)
            )
        }
    }
}

/// Status of every branch in scheme order
pub fn evaluate(scheme: &Scheme, origin_height: u32, current_height: u32) -> Vec<BranchStatus> {
    scheme
        .branches()
        .iter()
        .map(|b| BranchStatus::new(b, origin_height, current_height))
        .collect()
}

/// Human-readable duration for a block count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApproxDuration(pub u32);

impl fmt::Display for ApproxDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let blocks = self.0;
        let days = blocks / BLOCKS_PER_DAY;
        if days >= 365 {
            write!(f, "~{:.1} years", days as f32 / 365.0)
        } else if days >= 30 {
            write!(f, "~{:.1} months", days as f32 / 30.0)
        } else if days >= 1 {
            write!(f, "~{} days", days)
        } else {
            write!(f, "~{} minutes", blocks * 10)
        }
    }
}
