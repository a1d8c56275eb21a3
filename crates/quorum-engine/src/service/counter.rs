//! Distributed counter service.

use bytes::Bytes;

use super::{decode_args, encode_value, CommandContext, PrimitiveService, QueryContext,
    ServiceError};

/// A replicated signed counter.
///
/// Commands: `set(i64)`, `increment(i64)`, `decrement(i64)` — each returns
/// the resulting value. Queries: `get`.
#[derive(Debug, Default)]
pub struct CounterService {
    value: i64,
}

impl PrimitiveService for CounterService {
    fn apply_command(
        &mut self,
        _ctx: &mut CommandContext<'_>,
        operation: &str,
        args: &[u8],
    ) -> Result<Bytes, ServiceError> {
        match operation {
            "set" => {
                self.value = decode_args(args)?;
            }
            "increment" => {
                let delta: i64 = decode_args(args)?;
                self.value = self.value.wrapping_add(delta);
            }
            "decrement" => {
                let delta: i64 = decode_args(args)?;
                self.value = self.value.wrapping_sub(delta);
            }
            other => return Err(ServiceError::UnknownOperation(other.to_string())),
        }
        encode_value(&self.value)
    }

    fn apply_query(
        &self,
        _ctx: &QueryContext,
        operation: &str,
        _args: &[u8],
    ) -> Result<Bytes, ServiceError> {
        match operation {
            "get" => encode_value(&self.value),
            other => Err(ServiceError::UnknownOperation(other.to_string())),
        }
    }

    fn backup(&self, out: &mut Vec<u8>) -> Result<(), ServiceError> {
        ciborium::ser::into_writer(&self.value, out)
            .map_err(|e| ServiceError::Failed(format!("encode: {e}")))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), ServiceError> {
        self.value = ciborium::de::from_reader(data)
            .map_err(|e| ServiceError::Failed(format!("decode: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::{RaftRole, SessionId};

    fn command(service: &mut CounterService, operation: &str, args: &[u8]) -> i64 {
        let mut events = Vec::new();
        let mut ctx = CommandContext::new(1, 0, RaftRole::Leader, SessionId::new(1), &mut events);
        let out = service.apply_command(&mut ctx, operation, args).unwrap();
        ciborium::de::from_reader(out.as_ref()).unwrap()
    }

    fn arg(value: i64) -> Vec<u8> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&value, &mut buf).unwrap();
        buf
    }

    #[test]
    fn increments_and_backups() {
        let mut service = CounterService::default();
        assert_eq!(command(&mut service, "increment", &arg(1)), 1);
        assert_eq!(command(&mut service, "increment", &arg(4)), 5);
        assert_eq!(command(&mut service, "decrement", &arg(2)), 3);
        assert_eq!(command(&mut service, "set", &arg(100)), 100);

        let mut backup = Vec::new();
        service.backup(&mut backup).unwrap();
        let mut restored = CounterService::default();
        restored.restore(&backup).unwrap();

        let ctx = QueryContext {
            index: 1,
            timestamp: 0,
            role: RaftRole::Follower,
            session_id: SessionId::new(1),
        };
        let out = restored.apply_query(&ctx, "get", &[]).unwrap();
        let value: i64 = ciborium::de::from_reader(out.as_ref()).unwrap();
        assert_eq!(value, 100);
    }

    #[test]
    fn unknown_operation_is_rejected() {
        let mut service = CounterService::default();
        let mut events = Vec::new();
        let mut ctx = CommandContext::new(1, 0, RaftRole::Leader, SessionId::new(1), &mut events);
        let err = service.apply_command(&mut ctx, "multiply", &arg(2)).unwrap_err();
        assert_eq!(err, ServiceError::UnknownOperation("multiply".to_string()));
    }
}
