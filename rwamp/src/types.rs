use bytestring::ByteString;
use serde::{Deserialize, Serialize};

pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type HashSet<K> = std::collections::HashSet<K, ahash::RandomState>;
pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;

/// Router-assigned session identifier, unique per router process.
pub type SessionId = u64;

/// Identifier of a subscription or registration, unique per router process.
pub type ObservationId = u64;

/// Identifier of a pub/sub or RPC request, scoped to the issuing session.
pub type RequestId = u64;

/// Transport-level connection identifier, used by the cookie store to track
/// which live connections present a given cookie.
pub type ConnectionId = u64;

pub type AuthId = ByteString;
pub type AuthRole = ByteString;
pub type TopicName = ByteString;
pub type Payload = bytestring::ByteString;

/// Typed router error carrying a stable WAMP-style error URI plus a
/// human-readable message, so clients can distinguish failure classes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum RouterError {
    #[error("invalid URI: {0}")]
    InvalidUri(String),
    #[error("no such subscription: {0}")]
    NoSuchSubscription(ObservationId),
    #[error("no such registration: {0}")]
    NoSuchRegistration(ObservationId),
    #[error("no such procedure: {0}")]
    NoSuchProcedure(String),
    #[error("procedure already exists: {0}")]
    ProcedureAlreadyExists(String),
    #[error("register for already registered procedure '{procedure}' with conflicting invocation policy (has {has} and {requested} was requested)")]
    InvocationPolicyConflict { procedure: String, has: String, requested: String },
    #[error("no such session: {0}")]
    NoSuchSession(SessionId),
    #[error("session not authorized: {0}")]
    NotAuthorized(String),
    #[error("no such call in flight: {0}")]
    NoSuchCall(RequestId),
}

impl RouterError {
    /// Stable error URI for the wire, per the WAMP predefined error URIs.
    pub fn uri(&self) -> &'static str {
        match self {
            RouterError::InvalidUri(_) => "wamp.error.invalid_uri",
            RouterError::NoSuchSubscription(_) => "wamp.error.no_such_subscription",
            RouterError::NoSuchRegistration(_) => "wamp.error.no_such_registration",
            RouterError::NoSuchProcedure(_) => "wamp.error.no_such_procedure",
            RouterError::ProcedureAlreadyExists(_) => "wamp.error.procedure_already_exists",
            RouterError::InvocationPolicyConflict { .. } => {
                "wamp.error.procedure_exists_with_conflicting_invocation_policy"
            }
            RouterError::NoSuchSession(_) => "wamp.error.no_such_session",
            RouterError::NotAuthorized(_) => "wamp.error.not_authorized",
            RouterError::NoSuchCall(_) => "wamp.error.no_such_call",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_uris() {
        assert_eq!(RouterError::NoSuchProcedure("com.example.add".into()).uri(), "wamp.error.no_such_procedure");
        let e = RouterError::InvocationPolicyConflict {
            procedure: "com.example.add".into(),
            has: "single".into(),
            requested: "roundrobin".into(),
        };
        assert_eq!(e.uri(), "wamp.error.procedure_exists_with_conflicting_invocation_policy");
        assert!(e.to_string().contains("conflicting invocation policy"));
    }
}
