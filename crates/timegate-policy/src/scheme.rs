//! Branch schemas
//!
//! A scheme is an ordered list of spending branches over a fixed set of roles.
//! Each branch needs `threshold` signatures from its member roles and may
//! additionally wait a number of blocks after the session's origin height.
//!
//! # Built-in variants
//!
//! ```text
//! self-custody: or(thresh(2, daily-1, daily-2, daily-3),
//!               or(and(thresh(1, recovery-1, recovery-2), after(origin + 3)),
//!                  and(pk(emergency), after(origin + 5))))
//! vault:        or(pk(immediate), and(pk(delayed), after(origin + 3)))
//! inheritance:  or(pk(owner),
//!               or(and(thresh(2, heir-1, heir-2), after(origin + 5)),
//!                  and(pk(executor), after(origin + 10))))
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use timegate_core::Role;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchemeError {
    #[error("Scheme has no branches")]
    EmptyScheme,

    #[error("Duplicate role: {0}")]
    DuplicateRole(String),

    #[error("Duplicate branch: {0}")]
    DuplicateBranch(String),

    #[error("Branch {branch} references unknown role {role}")]
    UnknownRole { branch: String, role: String },

    #[error("Unknown branch: {0}")]
    UnknownBranch(String),

    #[error("Invalid threshold for branch {branch}: {threshold} of {members}")]
    InvalidThreshold {
        branch: String,
        threshold: usize,
        members: usize,
    },

    #[error("Branch {0} spends immediately and cannot take a wait")]
    WaitlessBranch(String),

    #[error("Unknown variant: {0}")]
    UnknownVariant(String),
}

/// One alternative spending condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    name: String,
    threshold: usize,
    members: Vec<String>,
    wait: Option<u32>,
}

impl Branch {
    /// A branch spendable immediately by `threshold` of `members`
    pub fn new<I, S>(name: impl Into<String>, threshold: usize, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            threshold,
            members: members.into_iter().map(Into::into).collect(),
            wait: None,
        }
    }

    /// Gate the branch on `blocks` blocks past the origin height. Zero means no wait.
    pub fn after(mut self, blocks: u32) -> Self {
        self.wait = (blocks > 0).then_some(blocks);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn is_member(&self, role: &str) -> bool {
        self.members.iter().any(|m| m == role)
    }

    /// Relative wait in blocks, `None` for an immediately eligible branch
    pub fn wait(&self) -> Option<u32> {
        self.wait
    }
}

/// A named, validated set of roles and branches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scheme {
    variant: String,
    roles: Vec<Role>,
    branches: Vec<Branch>,
}

impl Scheme {
    pub fn new(
        variant: impl Into<String>,
        roles: Vec<Role>,
        branches: Vec<Branch>,
    ) -> Result<Self, SchemeError> {
        let scheme = Self {
            variant: variant.into(),
            roles,
            branches,
        };
        scheme.validate()?;
        Ok(scheme)
    }

    fn validate(&self) -> Result<(), SchemeError> {
        if self.branches.is_empty() {
            return Err(SchemeError::EmptyScheme);
        }

        let mut role_names = HashSet::new();
        let mut accounts = HashSet::new();
        for role in &self.roles {
            if !role_names.insert(role.name()) || !accounts.insert(role.account()) {
                return Err(SchemeError::DuplicateRole(role.name().to_string()));
            }
        }

        let mut branch_names = HashSet::new();
        for branch in &self.branches {
            if !branch_names.insert(branch.name()) {
                return Err(SchemeError::DuplicateBranch(branch.name().to_string()));
            }

            let mut seen = HashSet::new();
            for member in branch.members() {
                if !role_names.contains(member.as_str()) {
                    return Err(SchemeError::UnknownRole {
                        branch: branch.name().to_string(),
                        role: member.clone(),
                    });
                }
                if !seen.insert(member.as_str()) {
                    return Err(SchemeError::DuplicateRole(member.clone()));
                }
            }

            // A keyless branch is representable; whether it is sound is the compiler's call
            let members = branch.members().len();
            let bad_threshold = if members == 0 {
                branch.threshold() != 0
            } else {
                branch.threshold() == 0 || branch.threshold() > members
            };
            if bad_threshold {
                return Err(SchemeError::InvalidThreshold {
                    branch: branch.name().to_string(),
                    threshold: branch.threshold(),
                    members,
                });
            }
        }

        Ok(())
    }

    pub fn variant(&self) -> &str {
        &self.variant
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn branch(&self, name: &str) -> Option<&Branch> {
        self.branches.iter().find(|b| b.name() == name)
    }

    /// Override branch waits by name. Waits clamp to at least one block.
    pub fn with_waits(mut self, waits: &BTreeMap<String, u32>) -> Result<Self, SchemeError> {
        for (name, blocks) in waits {
            let branch = self
                .branches
                .iter_mut()
                .find(|b| b.name() == name)
                .ok_or_else(|| SchemeError::UnknownBranch(name.clone()))?;
            if branch.wait.is_none() {
                return Err(SchemeError::WaitlessBranch(name.clone()));
            }
            branch.wait = Some((*blocks).max(1));
        }
        Ok(self)
    }
}

/// The built-in policy families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Variant {
    /// Daily 2-of-3, delayed 1-of-2 recovery, later single-key emergency
    SelfCustody,
    /// Immediate key or delayed key
    Vault,
    /// Owner now, heirs together later, executor last
    Inheritance,
}

impl Variant {
    pub const ALL: [Variant; 3] = [Variant::SelfCustody, Variant::Vault, Variant::Inheritance];

    pub fn name(&self) -> &'static str {
        match self {
            Variant::SelfCustody => "self-custody",
            Variant::Vault => "vault",
            Variant::Inheritance => "inheritance",
        }
    }

    pub fn branches(&self) -> Vec<Branch> {
        self.scheme().branches
    }

    pub fn scheme(&self) -> Scheme {
        let (roles, branches) = match self {
            Variant::SelfCustody => (
                vec![
                    Role::new("daily-1", 101),
                    Role::new("daily-2", 102),
                    Role::new("daily-3", 103),
                    Role::new("recovery-1", 105),
                    Role::new("recovery-2", 106),
                    Role::new("emergency", 107),
                ],
                vec![
                    Branch::new("daily", 2, ["daily-1", "daily-2", "daily-3"]),
                    Branch::new("recovery", 1, ["recovery-1", "recovery-2"]).after(3),
                    Branch::new("emergency", 1, ["emergency"]).after(5),
                ],
            ),
            Variant::Vault => (
                vec![Role::new("delayed", 201), Role::new("immediate", 202)],
                vec![
                    Branch::new("immediate", 1, ["immediate"]),
                    Branch::new("delayed", 1, ["delayed"]).after(3),
                ],
            ),
            Variant::Inheritance => (
                vec![
                    Role::new("owner", 301),
                    Role::new("heir-1", 302),
                    Role::new("heir-2", 303),
                    Role::new("executor", 304),
                ],
                vec![
                    Branch::new("owner", 1, ["owner"]),
                    Branch::new("heirs", 2, ["heir-1", "heir-2"]).after(5),
                    Branch::new("executor", 1, ["executor"]).after(10),
                ],
            ),
        };

        Scheme {
            variant: self.name().to_string(),
            roles,
            branches,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Variant {
    type Err = SchemeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Variant::ALL
            .into_iter()
            .find(|v| v.name() == s)
            .ok_or_else(|| SchemeError::UnknownVariant(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles() -> Vec<Role> {
        vec![Role::new("a", 1), Role::new("b", 2)]
    }

    #[test]
    fn test_builtin_schemes_validate() {
        for variant in Variant::ALL {
            let scheme = variant.scheme();
            Scheme::new(
                scheme.variant().to_string(),
                scheme.roles().to_vec(),
                scheme.branches().to_vec(),
            )
            .unwrap();
        }
    }

    #[test]
    fn test_variant_roundtrip_names() {
        for variant in Variant::ALL {
            assert_eq!(variant.name().parse::<Variant>().unwrap(), variant);
        }
        assert!(matches!(
            "boveda".parse::<Variant>(),
            Err(SchemeError::UnknownVariant(_))
        ));
    }

    #[test]
    fn test_self_custody_shape() {
        let branches = Variant::SelfCustody.branches();
        let names: Vec<_> = branches.iter().map(|b| b.name()).collect();
        assert_eq!(names, ["daily", "recovery", "emergency"]);
        assert_eq!(branches[0].threshold(), 2);
        assert_eq!(branches[0].wait(), None);
        assert_eq!(branches[1].wait(), Some(3));
        assert_eq!(branches[2].wait(), Some(5));
    }

    #[test]
    fn test_zero_wait_is_immediate() {
        assert_eq!(Branch::new("x", 1, ["a"]).after(0).wait(), None);
    }

    #[test]
    fn test_unknown_member_rejected() {
        let result = Scheme::new("t", roles(), vec![Branch::new("x", 1, ["c"])]);
        assert_eq!(
            result,
            Err(SchemeError::UnknownRole {
                branch: "x".into(),
                role: "c".into()
            })
        );
    }

    #[test]
    fn test_threshold_bounds() {
        let too_high = Scheme::new("t", roles(), vec![Branch::new("x", 3, ["a", "b"])]);
        assert!(matches!(too_high, Err(SchemeError::InvalidThreshold { .. })));

        let zero = Scheme::new("t", roles(), vec![Branch::new("x", 0, ["a"])]);
        assert!(matches!(zero, Err(SchemeError::InvalidThreshold { .. })));

        let keyless = Scheme::new("t", roles(), vec![Branch::new("x", 0, Vec::<String>::new())]);
        assert!(keyless.is_ok());
    }

    #[test]
    fn test_duplicates_rejected() {
        let dup_role = Scheme::new(
            "t",
            vec![Role::new("a", 1), Role::new("a", 2)],
            vec![Branch::new("x", 1, ["a"])],
        );
        assert!(matches!(dup_role, Err(SchemeError::DuplicateRole(_))));

        let dup_account = Scheme::new(
            "t",
            vec![Role::new("a", 1), Role::new("b", 1)],
            vec![Branch::new("x", 1, ["a"])],
        );
        assert!(matches!(dup_account, Err(SchemeError::DuplicateRole(_))));

        let dup_branch = Scheme::new(
            "t",
            roles(),
            vec![Branch::new("x", 1, ["a"]), Branch::new("x", 1, ["b"])],
        );
        assert!(matches!(dup_branch, Err(SchemeError::DuplicateBranch(_))));
    }

    #[test]
    fn test_empty_scheme_rejected() {
        assert_eq!(
            Scheme::new("t", roles(), vec![]),
            Err(SchemeError::EmptyScheme)
        );
    }

    #[test]
    fn test_with_waits() {
        let mut waits = BTreeMap::new();
        waits.insert("recovery".to_string(), 12);
        waits.insert("emergency".to_string(), 0);

        let scheme = Variant::SelfCustody.scheme().with_waits(&waits).unwrap();
        assert_eq!(scheme.branch("recovery").unwrap().wait(), Some(12));
        assert_eq!(scheme.branch("emergency").unwrap().wait(), Some(1));

        let mut bad = BTreeMap::new();
        bad.insert("daily".to_string(), 4);
        assert_eq!(
            Variant::SelfCustody.scheme().with_waits(&bad),
            Err(SchemeError::WaitlessBranch("daily".into()))
        );

        let mut unknown = BTreeMap::new();
        unknown.insert("nope".to_string(), 4);
        assert!(matches!(
            Variant::Vault.scheme().with_waits(&unknown),
            Err(SchemeError::UnknownBranch(_))
        ));
    }
}
