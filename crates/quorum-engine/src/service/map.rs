//! Distributed map service.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{decode_args, encode_value, CommandContext, EventTarget, PrimitiveService,
    QueryContext, ServiceError};

/// A key/value pair argument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapEntry {
    /// Key
    pub key: String,
    /// Value (absent for key-only operations)
    #[serde(default)]
    pub value: Option<Bytes>,
}

/// Event published to every open session when the map changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MapEvent {
    /// A key was inserted or replaced
    Updated {
        /// The key
        key: String,
        /// The new value
        value: Bytes,
    },
    /// A key was removed
    Removed {
        /// The key
        key: String,
    },
}

/// A replicated string-keyed map with change events.
///
/// Commands: `put {key, value}` and `remove {key}` — both return the
/// previous value. Queries: `get {key}`, `contains {key}`, `size`.
#[derive(Debug, Default)]
pub struct MapService {
    entries: BTreeMap<String, Bytes>,
}

impl PrimitiveService for MapService {
    fn apply_command(
        &mut self,
        ctx: &mut CommandContext<'_>,
        operation: &str,
        args: &[u8],
    ) -> Result<Bytes, ServiceError> {
        match operation {
            "put" => {
                let entry: MapEntry = decode_args(args)?;
                let value = entry
                    .value
                    .ok_or_else(|| ServiceError::BadArguments("put requires a value".to_string()))?;
                let previous = self.entries.insert(entry.key.clone(), value.clone());
                let event = encode_value(&MapEvent::Updated {
                    key: entry.key,
                    value,
                })?;
                ctx.publish_to(EventTarget::AllSessions, event);
                encode_value(&previous)
            }
            "remove" => {
                let entry: MapEntry = decode_args(args)?;
                let previous = self.entries.remove(&entry.key);
                if previous.is_some() {
                    let event = encode_value(&MapEvent::Removed { key: entry.key })?;
                    ctx.publish_to(EventTarget::AllSessions, event);
                }
                encode_value(&previous)
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
            "get" => {
                let entry: MapEntry = decode_args(args)?;
                encode_value(&self.entries.get(&entry.key))
            }
            "contains" => {
                let entry: MapEntry = decode_args(args)?;
                encode_value(&self.entries.contains_key(&entry.key))
            }
            "size" => encode_value(&(self.entries.len() as u64)),
            other => Err(ServiceError::UnknownOperation(other.to_string())),
        }
    }

    fn backup(&self, out: &mut Vec<u8>) -> Result<(), ServiceError> {
        ciborium::ser::into_writer(&self.entries, out)
            .map_err(|e| ServiceError::Failed(format!("encode: {e}")))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), ServiceError> {
        self.entries = ciborium::de::from_reader(data)
            .map_err(|e| ServiceError::Failed(format!("decode: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::{RaftRole, SessionId};

    fn args(entry: &MapEntry) -> Vec<u8> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(entry, &mut buf).unwrap();
        buf
    }

    #[test]
    fn put_returns_previous_and_publishes() {
        let mut service = MapService::default();
        let mut events = Vec::new();
        let mut ctx = CommandContext::new(5, 0, RaftRole::Leader, SessionId::new(1), &mut events);

        let out = service
            .apply_command(
                &mut ctx,
                "put",
                &args(&MapEntry {
                    key: "k".to_string(),
                    value: Some(Bytes::from("v1")),
                }),
            )
            .unwrap();
        let previous: Option<Bytes> = ciborium::de::from_reader(out.as_ref()).unwrap();
        assert!(previous.is_none());

        let out = service
            .apply_command(
                &mut ctx,
                "put",
                &args(&MapEntry {
                    key: "k".to_string(),
                    value: Some(Bytes::from("v2")),
                }),
            )
            .unwrap();
        let previous: Option<Bytes> = ciborium::de::from_reader(out.as_ref()).unwrap();
        assert_eq!(previous, Some(Bytes::from("v1")));

        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].0, EventTarget::AllSessions));
        let event: MapEvent = ciborium::de::from_reader(events[1].1.as_ref()).unwrap();
        assert_eq!(
            event,
            MapEvent::Updated {
                key: "k".to_string(),
                value: Bytes::from("v2")
            }
        );
    }

    #[test]
    fn remove_of_missing_key_publishes_nothing() {
        let mut service = MapService::default();
        let mut events = Vec::new();
        let mut ctx = CommandContext::new(5, 0, RaftRole::Leader, SessionId::new(1), &mut events);

        service
            .apply_command(
                &mut ctx,
                "remove",
                &args(&MapEntry {
                    key: "ghost".to_string(),
                    value: None,
                }),
            )
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn queries_read_current_state() {
        let mut service = MapService::default();
        let mut events = Vec::new();
        let mut ctx = CommandContext::new(5, 0, RaftRole::Leader, SessionId::new(1), &mut events);
        service
            .apply_command(
                &mut ctx,
                "put",
                &args(&MapEntry {
                    key: "k".to_string(),
                    value: Some(Bytes::from("v")),
                }),
            )
            .unwrap();

        let qctx = QueryContext {
            index: 5,
            timestamp: 0,
            role: RaftRole::Follower,
            session_id: SessionId::new(1),
        };
        let out = service
            .apply_query(
                &qctx,
                "get",
                &args(&MapEntry {
                    key: "k".to_string(),
                    value: None,
                }),
            )
            .unwrap();
        let value: Option<Bytes> = ciborium::de::from_reader(out.as_ref()).unwrap();
        assert_eq!(value, Some(Bytes::from("v")));

        let out = service.apply_query(&qctx, "size", &[]).unwrap();
        let size: u64 = ciborium::de::from_reader(out.as_ref()).unwrap();
        assert_eq!(size, 1);
    }
}
