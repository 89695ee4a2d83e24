//! Roles and the single authorization policy every handler goes through.
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

use crate::error::AppError;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Serialize,
    Deserialize,
    utoipa::ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[display(fmt = "designer")]
    Designer,
    #[display(fmt = "contributor")]
    Contributor,
    #[serde(rename = "bughunter")]
    #[display(fmt = "bughunter")]
    BugHunter,
    /// Derived from the subscription; never stored by a grant.
    #[display(fmt = "subscriber")]
    Subscriber,
    #[display(fmt = "role_manager")]
    RoleManager,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Designer,
        Role::Contributor,
        Role::BugHunter,
        Role::Subscriber,
        Role::RoleManager,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Designer => "designer",
            Role::Contributor => "contributor",
            Role::BugHunter => "bughunter",
            Role::Subscriber => "subscriber",
            Role::RoleManager => "role_manager",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Role::Designer => "Designer",
            Role::Contributor => "Contributor",
            Role::BugHunter => "BugHunter",
            Role::Subscriber => "Subscriber",
            Role::RoleManager => "Role Manager",
        }
    }

    pub fn is_grantable(&self) -> bool {
        !matches!(self, Role::Subscriber)
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| AppError::Validation(format!("unknown role: {s}")))
    }
}

/// Parses stored role strings, dropping anything that is no longer a known
/// role instead of failing the whole record.
pub fn parse_stored_roles(raw: &[String]) -> BTreeSet<Role> {
    raw.iter().filter_map(|r| r.parse().ok()).collect()
}

pub fn to_stored_roles(roles: &BTreeSet<Role>) -> Vec<String> {
    roles.iter().map(|r| r.as_str().to_string()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    ManageRoles,
    GrantRoleManager,
    ManageSubscriptions,
    CreateContest,
}

#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    admin_user_id: Option<i64>,
}

impl AccessPolicy {
    pub fn new(admin_user_id: Option<i64>) -> Self {
        Self { admin_user_id }
    }

    pub fn is_global_admin(&self, user_id: i64) -> bool {
        self.admin_user_id == Some(user_id)
    }

    pub fn capabilities(&self, user_id: i64, roles: &BTreeSet<Role>) -> BTreeSet<Capability> {
        let mut caps = BTreeSet::from([Capability::CreateContest]);
        if self.is_global_admin(user_id) {
            caps.extend([
                Capability::ManageRoles,
                Capability::GrantRoleManager,
                Capability::ManageSubscriptions,
            ]);
        }
        if roles.contains(&Role::RoleManager) {
            caps.insert(Capability::ManageRoles);
        }
        caps
    }

    pub fn require(
        &self,
        user_id: i64,
        roles: &BTreeSet<Role>,
        capability: Capability,
    ) -> Result<(), AppError> {
        if self.capabilities(user_id, roles).contains(&capability) {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!("missing capability {capability:?}")))
        }
    }

    /// Capability needed to grant or revoke `role`.
    pub fn capability_for_role(&self, role: Role) -> Capability {
        match role {
            Role::RoleManager => Capability::GrantRoleManager,
            _ => Capability::ManageRoles,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_strings_round_trip_through_parse() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
            assert_eq!(role.to_string(), role.as_str());
        }
        assert!("admin".parse::<Role>().is_err());
    }

    #[test]
    fn stored_roles_ignore_unknown_values() {
        let roles = parse_stored_roles(&["designer".into(), "ghost".into()]);
        assert_eq!(roles, BTreeSet::from([Role::Designer]));
    }

    #[test]
    fn global_admin_gets_everything() {
        let policy = AccessPolicy::new(Some(1));
        let caps = policy.capabilities(1, &BTreeSet::new());
        assert!(caps.contains(&Capability::GrantRoleManager));
        assert!(caps.contains(&Capability::ManageSubscriptions));
    }

    #[test]
    fn role_manager_can_manage_but_not_promote() {
        let policy = AccessPolicy::new(Some(1));
        let roles = BTreeSet::from([Role::RoleManager]);
        assert!(policy.require(2, &roles, Capability::ManageRoles).is_ok());
        let needed = policy.capability_for_role(Role::RoleManager);
        assert!(matches!(
            policy.require(2, &roles, needed),
            Err(AppError::Forbidden(_))
        ));
    }

    #[test]
    fn plain_user_can_only_create_contests() {
        let policy = AccessPolicy::new(None);
        let caps = policy.capabilities(5, &BTreeSet::from([Role::Designer]));
        assert_eq!(caps, BTreeSet::from([Capability::CreateContest]));
    }
}
