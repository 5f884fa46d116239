//! Host user/group database access.
//!
//! Ownership decisions only ever go through [`IdentityProvider`], so the
//! daemon can be exercised without touching `/etc/passwd`.

use std::collections::HashMap;

use nix::unistd::{Gid, Group, Uid, User};
use serde::{Deserialize, Serialize};

use crate::server::error::{ServerError, ServerResult};

/// uid/gid pair owning an instance's directories and processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

/// Resolved owner, as reported by the `owner` property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerInfo {
    pub uid: u32,
    pub gid: u32,
    pub username: String,
    pub groupname: String,
}

pub trait IdentityProvider: Send + Sync {
    fn username(&self, uid: u32) -> Option<String>;

    fn groupname(&self, gid: u32) -> Option<String>;

    /// uid and primary gid for a login name.
    fn user_credentials(&self, username: &str) -> Option<Owner>;

    /// Whether `username` belongs to `groupname` (primary or supplementary).
    fn test_membership(&self, username: &str, groupname: &str) -> bool;

    /// Both ids must exist in the host databases.
    fn verify_ids(&self, uid: u32, gid: u32) -> ServerResult<()> {
        if self.username(uid).is_none() {
            return Err(ServerError::Ownership(format!("uid {} does not exist on this host", uid)));
        }
        if self.groupname(gid).is_none() {
            return Err(ServerError::Ownership(format!("gid {} does not exist on this host", gid)));
        }
        Ok(())
    }

    fn owner_info(&self, owner: Owner) -> OwnerInfo {
        OwnerInfo {
            uid: owner.uid,
            gid: owner.gid,
            username: self.username(owner.uid).unwrap_or_else(|| "?".to_string()),
            groupname: self.groupname(owner.gid).unwrap_or_else(|| "?".to_string()),
        }
    }
}

/// passwd/group lookups through libc.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemIdentity;

impl IdentityProvider for SystemIdentity {
    fn username(&self, uid: u32) -> Option<String> {
        User::from_uid(Uid::from_raw(uid)).ok().flatten().map(|u| u.name)
    }

    fn groupname(&self, gid: u32) -> Option<String> {
        Group::from_gid(Gid::from_raw(gid)).ok().flatten().map(|g| g.name)
    }

    fn user_credentials(&self, username: &str) -> Option<Owner> {
        User::from_name(username).ok().flatten().map(|u| Owner {
            uid: u.uid.as_raw(),
            gid: u.gid.as_raw(),
        })
    }

    fn test_membership(&self, username: &str, groupname: &str) -> bool {
        let group = match Group::from_name(groupname) {
            Ok(Some(group)) => group,
            _ => return false,
        };
        if group.mem.iter().any(|m| m == username) {
            return true;
        }
        // primary group은 group.mem에 나타나지 않음
        matches!(User::from_name(username), Ok(Some(u)) if u.gid == group.gid)
    }
}

/// Fixed user/group tables, for hosts where the real databases should not be consulted.
#[derive(Debug, Default, Clone)]
pub struct StaticIdentity {
    users: HashMap<u32, (String, u32)>,
    groups: HashMap<u32, (String, Vec<String>)>,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, uid: u32, name: &str, primary_gid: u32) -> Self {
        self.users.insert(uid, (name.to_string(), primary_gid));
        self
    }

    pub fn with_group(mut self, gid: u32, name: &str, members: &[&str]) -> Self {
        self.groups.insert(
            gid,
            (name.to_string(), members.iter().map(|m| m.to_string()).collect()),
        );
        self
    }
}

impl IdentityProvider for StaticIdentity {
    fn username(&self, uid: u32) -> Option<String> {
        self.users.get(&uid).map(|(name, _)| name.clone())
    }

    fn groupname(&self, gid: u32) -> Option<String> {
        self.groups.get(&gid).map(|(name, _)| name.clone())
    }

    fn user_credentials(&self, username: &str) -> Option<Owner> {
        self.users
            .iter()
            .find(|(_, (name, _))| name == username)
            .map(|(uid, (_, gid))| Owner { uid: *uid, gid: *gid })
    }

    fn test_membership(&self, username: &str, groupname: &str) -> bool {
        let Some((gid, (_, members))) = self.groups.iter().find(|(_, (name, _))| name == groupname) else {
            return false;
        };
        members.iter().any(|m| m == username)
            || self.user_credentials(username).map(|o| o.gid == *gid).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> StaticIdentity {
        StaticIdentity::new()
            .with_user(1000, "steve", 1000)
            .with_user(1001, "alex", 100)
            .with_group(1000, "steve", &[])
            .with_group(100, "users", &[])
            .with_group(2000, "minecraft", &["alex"])
    }

    #[test]
    fn verify_ids_requires_both() {
        let id = identity();
        assert!(id.verify_ids(1000, 1000).is_ok());
        assert!(matches!(id.verify_ids(4242, 1000), Err(ServerError::Ownership(_))));
        assert!(matches!(id.verify_ids(1000, 4242), Err(ServerError::Ownership(_))));
    }

    #[test]
    fn membership_counts_primary_and_supplementary() {
        let id = identity();
        assert!(id.test_membership("steve", "steve"));
        assert!(id.test_membership("alex", "minecraft"));
        assert!(id.test_membership("alex", "users"));
        assert!(!id.test_membership("steve", "minecraft"));
        assert!(!id.test_membership("steve", "nosuchgroup"));
    }

    #[test]
    fn owner_info_falls_back_to_question_mark() {
        let info = identity().owner_info(Owner { uid: 1000, gid: 4242 });
        assert_eq!(info.username, "steve");
        assert_eq!(info.groupname, "?");
    }
}
