//! Log entry and configuration types.

use bytes::Bytes;
use quorum_topology::NodeId;
use serde::{Deserialize, Serialize};

use crate::foundation::{LogIndex, MemberRole, SessionId, Term};

/// One replicated log entry.
///
/// Indices are strictly monotonic from 1 with no gaps inside a contiguous
/// segment; terms are non-decreasing along the log. Once committed on a
/// majority, the entry at `(index, term)` is immutable everywhere forever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log
    pub index: LogIndex,
    /// Term in which the entry was created
    pub term: Term,
    /// Leader-assigned wall-clock milliseconds, replicated so every
    /// replica observes identical time
    pub timestamp: i64,
    /// Entry payload
    pub payload: EntryPayload,
}

/// Payload of a log entry. Queries are never appended; they flow through
/// the read path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// No-op appended by a new leader to commit its term
    Initialize,
    /// Membership change, effective on receipt
    Configuration(Configuration),
    /// Create a session
    OpenSession(OpenSessionEntry),
    /// Refresh a session and acknowledge commands and events
    KeepAlive(KeepAliveEntry),
    /// Close a session
    CloseSession(CloseSessionEntry),
    /// Session-scoped state-machine command
    Command(CommandEntry),
}

/// Session-open payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenSessionEntry {
    /// Node the client connected through
    pub member: NodeId,
    /// Primitive name (routing key)
    pub primitive: String,
    /// Service type hosting the primitive
    pub service_type: String,
    /// Session timeout in milliseconds
    pub timeout_ms: u64,
}

/// Keep-alive payload
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeepAliveEntry {
    /// Session being refreshed
    pub session_id: SessionId,
    /// Highest command sequence whose result the client has received
    pub command_ack: u64,
    /// Highest event index the client has received
    pub event_ack: LogIndex,
}

/// Session-close payload
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CloseSessionEntry {
    /// Session being closed
    pub session_id: SessionId,
}

/// Command payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEntry {
    /// Owning session
    pub session_id: SessionId,
    /// Per-session sequence number, dense from 1
    pub sequence: u64,
    /// Operation name understood by the primitive service
    pub operation: String,
    /// Operation arguments
    pub args: Bytes,
}

/// One member of a partition configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMember {
    /// The node
    pub node: NodeId,
    /// Its role in the partition
    pub role: MemberRole,
}

impl RaftMember {
    /// Create a member record
    pub fn new(node: NodeId, role: MemberRole) -> Self {
        Self { node, role }
    }
}

/// A partition's membership, carried in configuration entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    /// Members with role annotations
    pub members: Vec<RaftMember>,
}

impl Configuration {
    /// Create a configuration from members
    pub fn new(members: Vec<RaftMember>) -> Self {
        Self { members }
    }

    /// Voting members
    pub fn voters(&self) -> impl Iterator<Item = &NodeId> {
        self.members
            .iter()
            .filter(|m| m.role == MemberRole::Active)
            .map(|m| &m.node)
    }

    /// Members that receive log replication (active + passive)
    pub fn replicas(&self) -> impl Iterator<Item = &NodeId> {
        self.members
            .iter()
            .filter(|m| m.role != MemberRole::Reserve)
            .map(|m| &m.node)
    }

    /// Number of voters
    pub fn voter_count(&self) -> usize {
        self.voters().count()
    }

    /// Votes needed to win an election or commit an entry
    pub fn quorum(&self) -> usize {
        self.voter_count() / 2 + 1
    }

    /// Look up a member's role
    pub fn role_of(&self, node: &NodeId) -> Option<MemberRole> {
        self.members
            .iter()
            .find(|m| &m.node == node)
            .map(|m| m.role)
    }

    /// Whether the node is a voter
    pub fn is_voter(&self, node: &NodeId) -> bool {
        self.role_of(node) == Some(MemberRole::Active)
    }

    /// Whether the node appears at all
    pub fn contains(&self, node: &NodeId) -> bool {
        self.role_of(node).is_some()
    }

    /// Apply a single-member change, returning the new configuration.
    /// Fails if the change does not make sense against this membership.
    pub fn apply_change(&self, change: &ConfigurationChange) -> Result<Configuration, String> {
        let mut members = self.members.clone();
        match change {
            ConfigurationChange::Add { node, role } => {
                if members.iter().any(|m| &m.node == node) {
                    return Err(format!("{node} is already a member"));
                }
                members.push(RaftMember::new(node.clone(), *role));
            }
            ConfigurationChange::Remove { node } => {
                let before = members.len();
                members.retain(|m| &m.node != node);
                if members.len() == before {
                    return Err(format!("{node} is not a member"));
                }
            }
            ConfigurationChange::Promote { node, role } => {
                let member = members
                    .iter_mut()
                    .find(|m| &m.node == node)
                    .ok_or_else(|| format!("{node} is not a member"))?;
                member.role = *role;
            }
        }
        Ok(Configuration::new(members))
    }
}

/// A single-member configuration change. One change per committed
/// configuration entry keeps overlapping majorities and therefore safety.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigurationChange {
    /// Add a new member
    Add {
        /// Node to add
        node: NodeId,
        /// Role to add it with
        role: MemberRole,
    },
    /// Remove a member
    Remove {
        /// Node to remove
        node: NodeId,
    },
    /// Change an existing member's role (reserve → passive → active)
    Promote {
        /// Node to change
        node: NodeId,
        /// New role
        role: MemberRole,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Configuration {
        Configuration::new(vec![
            RaftMember::new(NodeId::new("a"), MemberRole::Active),
            RaftMember::new(NodeId::new("b"), MemberRole::Active),
            RaftMember::new(NodeId::new("c"), MemberRole::Active),
            RaftMember::new(NodeId::new("d"), MemberRole::Passive),
            RaftMember::new(NodeId::new("e"), MemberRole::Reserve),
        ])
    }

    #[test]
    fn voters_and_replicas_follow_roles() {
        let config = config();
        assert_eq!(config.voter_count(), 3);
        assert_eq!(config.quorum(), 2);
        assert_eq!(config.replicas().count(), 4);
        assert!(config.is_voter(&NodeId::new("a")));
        assert!(!config.is_voter(&NodeId::new("d")));
        assert!(config.contains(&NodeId::new("e")));
    }

    #[test]
    fn single_member_changes() {
        let config = config();

        let grown = config
            .apply_change(&ConfigurationChange::Add {
                node: NodeId::new("f"),
                role: MemberRole::Active,
            })
            .unwrap();
        assert_eq!(grown.voter_count(), 4);
        assert_eq!(grown.quorum(), 3);

        let promoted = config
            .apply_change(&ConfigurationChange::Promote {
                node: NodeId::new("e"),
                role: MemberRole::Passive,
            })
            .unwrap();
        assert_eq!(promoted.replicas().count(), 5);

        let shrunk = config
            .apply_change(&ConfigurationChange::Remove {
                node: NodeId::new("a"),
            })
            .unwrap();
        assert_eq!(shrunk.voter_count(), 2);

        assert!(config
            .apply_change(&ConfigurationChange::Add {
                node: NodeId::new("a"),
                role: MemberRole::Active,
            })
            .is_err());
    }
}
