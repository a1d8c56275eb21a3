//! Identifier and enumeration types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Log index within one partition's log. Indices are strictly monotonic
/// from 1; 0 means "before the first entry".
pub type LogIndex = u64;

/// Partition identifier within a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(u32);

impl PartitionId {
    /// Create a new partition ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the inner value
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally routable partition reference: `(group name, partition id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionRef {
    /// Partition group name
    pub group: String,
    /// Partition within the group
    pub partition: PartitionId,
}

impl PartitionRef {
    /// Create a new partition reference
    pub fn new(group: impl Into<String>, partition: PartitionId) -> Self {
        Self {
            group: group.into(),
            partition,
        }
    }
}

impl fmt::Display for PartitionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.partition)
    }
}

/// Session identifier, unique within a partition (the log index of the
/// entry that opened the session)
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SessionId(u64);

impl SessionId {
    /// Create a new session ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner value
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Election epoch. Terms are monotonically increasing; each term has at
/// most one leader.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Term(u64);

impl Term {
    /// Create a new term
    pub fn new(term: u64) -> Self {
        Self(term)
    }

    /// Get the inner value
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The next term
    pub fn next(&self) -> Term {
        Term(self.0 + 1)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Replica role within a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    /// Not participating (failed or removed); operator intervention needed
    Inactive,
    /// Not replicating; may be promoted later
    Reserve,
    /// Replicates the log without voting
    Passive,
    /// Normal non-leader voter
    Follower,
    /// Campaigning for leadership
    Candidate,
    /// Leader of record for its term
    Leader,
}

impl fmt::Display for RaftRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RaftRole::Inactive => "inactive",
            RaftRole::Reserve => "reserve",
            RaftRole::Passive => "passive",
            RaftRole::Follower => "follower",
            RaftRole::Candidate => "candidate",
            RaftRole::Leader => "leader",
        };
        write!(f, "{name}")
    }
}

/// Membership role annotation in a partition configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    /// Voting replica
    Active,
    /// Replicating non-voter
    Passive,
    /// Non-replicating standby
    Reserve,
}

/// Consistency level for queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyLevel {
    /// Leader round-trips through a majority heartbeat before answering
    Linearizable,
    /// Leader answers from local state while its lease is valid
    LinearizableLease,
    /// Any replica; monotonic in the commit index observed by the session
    Sequential,
    /// Any replica, no monotonicity
    Eventual,
}
