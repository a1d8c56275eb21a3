//! Typed service message contract.

use serde::{de::DeserializeOwned, Serialize};

/// A request type bound to a service ID and a response type.
///
/// The service ID routes the request to the registered handler on the
/// receiving node; both sides must agree on the request and response
/// encodings for that ID.
pub trait ServiceMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The response this request elicits
    type Response: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Wire identifier of the service handling this message
    fn service_id() -> &'static str;
}
