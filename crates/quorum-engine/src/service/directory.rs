//! Management-group directory service.
//!
//! Hosted by the mandatory management group. Keeps the cluster-wide
//! primitive metadata (name → group/partition/service type) and allocates
//! monotonic cluster-unique identifiers.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{decode_args, encode_value, CommandContext, PrimitiveService, QueryContext,
    ServiceError};

/// Where a primitive lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimitiveRecord {
    /// Partition group hosting the primitive
    pub group: String,
    /// Partition within the group
    pub partition: u32,
    /// Service type implementing it
    pub service_type: String,
}

/// Arguments for `register`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPrimitive {
    /// Primitive name
    pub name: String,
    /// Record to register
    pub record: PrimitiveRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LookupArgs {
    name: String,
}

/// The management directory state machine.
///
/// Commands: `register {name, record}` (first write wins; returns the
/// authoritative record) and `next-id`. Queries: `lookup {name}`, `list`.
#[derive(Debug, Default)]
pub struct DirectoryService {
    next_id: u64,
    primitives: BTreeMap<String, PrimitiveRecord>,
}

impl PrimitiveService for DirectoryService {
    fn apply_command(
        &mut self,
        _ctx: &mut CommandContext<'_>,
        operation: &str,
        args: &[u8],
    ) -> Result<Bytes, ServiceError> {
        match operation {
            "register" => {
                let register: RegisterPrimitive = decode_args(args)?;
                let record = self
                    .primitives
                    .entry(register.name)
                    .or_insert(register.record);
                encode_value(&record.clone())
            }
            "next-id" => {
                self.next_id += 1;
                encode_value(&self.next_id)
            }
            other => Err(ServiceError::UnknownOperation(other.to_string())),
        }
    }

    fn apply_query(
        &self,
        _ctx: &QueryContext,
        operation: &str,
        args: &[u8],
    ) -> Result<Bytes, ServiceError> {
        match operation {
            "lookup" => {
                let lookup: LookupArgs = decode_args(args)?;
                encode_value(&self.primitives.get(&lookup.name))
            }
            "list" => encode_value(&self.primitives),
            other => Err(ServiceError::UnknownOperation(other.to_string())),
        }
    }

    fn backup(&self, out: &mut Vec<u8>) -> Result<(), ServiceError> {
        ciborium::ser::into_writer(&(self.next_id, &self.primitives), out)
            .map_err(|e| ServiceError::Failed(format!("encode: {e}")))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), ServiceError> {
        let (next_id, primitives): (u64, BTreeMap<String, PrimitiveRecord>) =
            ciborium::de::from_reader(data)
                .map_err(|e| ServiceError::Failed(format!("decode: {e}")))?;
        self.next_id = next_id;
        self.primitives = primitives;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::{RaftRole, SessionId};

    fn command(service: &mut DirectoryService, operation: &str, args: &[u8]) -> Bytes {
        let mut events = Vec::new();
        let mut ctx = CommandContext::new(1, 0, RaftRole::Leader, SessionId::new(1), &mut events);
        service.apply_command(&mut ctx, operation, args).unwrap()
    }

    #[test]
    fn first_registration_wins() {
        let mut service = DirectoryService::default();
        let register = RegisterPrimitive {
            name: "work-queue".to_string(),
            record: PrimitiveRecord {
                group: "data".to_string(),
                partition: 3,
                service_type: "map".to_string(),
            },
        };
        let mut args = Vec::new();
        ciborium::ser::into_writer(&register, &mut args).unwrap();
        let out = command(&mut service, "register", &args);
        let record: PrimitiveRecord = ciborium::de::from_reader(out.as_ref()).unwrap();
        assert_eq!(record.partition, 3);

        // Conflicting registration returns the existing record.
        let conflicting = RegisterPrimitive {
            name: "work-queue".to_string(),
            record: PrimitiveRecord {
                group: "data".to_string(),
                partition: 9,
                service_type: "map".to_string(),
            },
        };
        let mut args = Vec::new();
        ciborium::ser::into_writer(&conflicting, &mut args).unwrap();
        let out = command(&mut service, "register", &args);
        let record: PrimitiveRecord = ciborium::de::from_reader(out.as_ref()).unwrap();
        assert_eq!(record.partition, 3);
    }

    #[test]
    fn ids_are_monotonic() {
        let mut service = DirectoryService::default();
        let a: u64 =
            ciborium::de::from_reader(command(&mut service, "next-id", &[]).as_ref()).unwrap();
        let b: u64 =
            ciborium::de::from_reader(command(&mut service, "next-id", &[]).as_ref()).unwrap();
        assert_eq!((a, b), (1, 2));
    }
}
