use serde::Serialize;

use crate::protocol::LeadershipChange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Leader,
    Follower,
}

impl Role {
    pub fn from_leader_flag(is_leader: bool) -> Self {
        if is_leader {
            Self::Leader
        } else {
            Self::Follower
        }
    }

    pub fn is_leader(self) -> bool {
        self == Self::Leader
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleTransition {
    Promoted,
    Demoted,
}

/// Derives the local role from the room layer's leadership notifications.
#[derive(Debug)]
pub struct LeadershipMonitor {
    local_id: String,
    role: Role,
}

impl LeadershipMonitor {
    pub fn new(local_id: impl Into<String>, initial: Role) -> Self {
        Self {
            local_id: local_id.into(),
            role: initial,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn observe(&mut self, change: &LeadershipChange) -> Option<RoleTransition> {
        let names_us = change.new_leader_id == self.local_id;
        match (self.role, names_us) {
            (Role::Follower, true) => {
                self.role = Role::Leader;
                Some(RoleTransition::Promoted)
            }
            (Role::Leader, false) => {
                self.role = Role::Follower;
                Some(RoleTransition::Demoted)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(id: &str) -> LeadershipChange {
        LeadershipChange {
            new_leader_id: id.to_string(),
        }
    }

    #[test]
    fn test_promotion_and_demotion() {
        let mut monitor = LeadershipMonitor::new("b", Role::Follower);
        assert_eq!(monitor.observe(&change("a")), None);
        assert_eq!(monitor.observe(&change("b")), Some(RoleTransition::Promoted));
        assert_eq!(monitor.role(), Role::Leader);
        assert_eq!(monitor.observe(&change("b")), None);
        assert_eq!(monitor.observe(&change("c")), Some(RoleTransition::Demoted));
        assert_eq!(monitor.role(), Role::Follower);
    }
}
