//! Pending-authentication state machines.
//!
//! One pending authentication exists per connecting session, created when
//! its HELLO arrives and consumed by the verify step. The supported methods
//! are challenge-response over a shared secret ([`cra`]), ticket
//! ([`ticket`]) and Ed25519 challenge signing ([`cryptosign`]).

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::realm::RealmContainer;
use crate::types::SessionId;

pub mod cra;
pub mod cryptosign;
pub mod ticket;

pub use cra::PendingCra;
pub use cryptosign::PendingCryptosign;
pub use ticket::PendingTicket;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("authentication failed: {0}")]
    Failed(String),
    #[error("no realm assigned or no such realm: {0}")]
    NoSuchRealm(String),
    #[error("no authrole assigned or no such role: {0}")]
    NoSuchRole(String),
    #[error("no such principal: {0}")]
    NoSuchPrincipal(String),
}

impl AuthError {
    /// Stable error URI for the wire.
    pub fn uri(&self) -> &'static str {
        match self {
            AuthError::Failed(_) => "wamp.error.authentication_failed",
            AuthError::NoSuchRealm(_) => "wamp.error.no_such_realm",
            AuthError::NoSuchRole(_) => "wamp.error.no_such_role",
            AuthError::NoSuchPrincipal(_) => "wamp.error.no_such_principal",
        }
    }
}

/// Client-provided details from HELLO.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HelloDetails {
    pub authid: Option<String>,
    pub authrole: Option<String>,
    pub authextra: Option<Value>,
}

/// Challenge sent back to the client; the extra payload is method-specific.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub authmethod: &'static str,
    pub extra: Value,
}

/// Successful authentication outcome: the effective identity the session
/// will join with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthAccept {
    pub realm: String,
    pub authid: String,
    pub authrole: String,
    pub authmethod: &'static str,
    pub authprovider: &'static str,
    pub authextra: Option<Value>,
}

/// Principal returned by a principal database or a dynamic authenticator.
/// A bare string is shorthand for `{ "role": ... }`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Principal {
    pub realm: Option<String>,
    pub authid: Option<String>,
    pub role: Option<String>,
    pub secret: Option<String>,
    pub ticket: Option<String>,
    pub pubkey: Option<String>,
    pub salt: Option<String>,
    pub iterations: Option<u32>,
    pub keylen: Option<u32>,
    pub extra: Option<Value>,
}

impl Principal {
    pub fn from_value(value: Value) -> Result<Self, AuthError> {
        match value {
            Value::String(role) => Ok(Principal { role: Some(role), ..Default::default() }),
            value @ Value::Object(_) => serde_json::from_value(value)
                .map_err(|e| AuthError::Failed(format!("invalid principal from dynamic authenticator: {}", e))),
            other => Err(AuthError::Failed(format!(
                "got invalid return type {:?} from dynamic authenticator",
                other
            ))),
        }
    }
}

/// State shared by all pending-authentication methods: the candidate
/// identity accumulated over the handshake, and the container the realm
/// and role assignments are checked against.
pub(crate) struct AuthBase {
    pub session: SessionId,
    pub container: Arc<dyn RealmContainer>,
    pub realm: Option<String>,
    pub authid: Option<String>,
    pub authrole: Option<String>,
    pub authextra: Option<Value>,
    pub authprovider: &'static str,
}

impl AuthBase {
    pub fn new(session: SessionId, container: Arc<dyn RealmContainer>) -> Self {
        Self {
            session,
            container,
            realm: None,
            authid: None,
            authrole: None,
            authextra: None,
            authprovider: "static",
        }
    }

    /// Fold a principal into the candidate identity. The principal may
    /// redirect the realm and override authid; realm, authid and authrole
    /// must all be assigned afterwards, and realm and role must exist.
    pub async fn assign_principal(
        &mut self,
        principal: &Principal,
        default_role: Option<&str>,
    ) -> Result<(), AuthError> {
        if let Some(realm) = principal.realm.as_ref() {
            self.realm = Some(realm.clone());
        }
        if let Some(authid) = principal.authid.as_ref() {
            self.authid = Some(authid.clone());
        }
        if let Some(role) = principal.role.as_ref() {
            self.authrole = Some(role.clone());
        } else if let Some(role) = default_role {
            self.authrole = Some(role.to_owned());
        }
        if let Some(extra) = principal.extra.as_ref() {
            self.authextra = Some(extra.clone());
        }

        let realm = self.realm.as_ref().ok_or_else(|| AuthError::NoSuchRealm("no realm assigned".into()))?;
        if self.authid.is_none() {
            return Err(AuthError::NoSuchPrincipal("no authid assigned".into()));
        }
        let authrole =
            self.authrole.as_ref().ok_or_else(|| AuthError::NoSuchRole("no authrole assigned".into()))?;

        if !self.container.has_realm(realm).await {
            return Err(AuthError::NoSuchRealm(format!("no realm {:?} exists on this router", realm)));
        }
        if !self.container.has_role(realm, authrole).await {
            return Err(AuthError::NoSuchRole(format!("realm {:?} has no role {:?}", realm, authrole)));
        }
        Ok(())
    }

    /// Invoke a dynamic authenticator and parse the returned principal.
    /// Any failure of the call maps to an authentication failure.
    pub async fn call_authenticator(
        &self,
        authenticator: &str,
        authenticator_realm: Option<&str>,
        details: Value,
    ) -> Result<Principal, AuthError> {
        let realm = authenticator_realm
            .map(|r| r.to_owned())
            .or_else(|| self.realm.clone())
            .ok_or_else(|| {
                AuthError::NoSuchRealm(
                    "client did not specify a realm to join (and no explicit realm was configured for dynamic authenticator)"
                        .into(),
                )
            })?;
        let value = self
            .container
            .call_authenticator(&realm, authenticator, details)
            .await
            .map_err(|e| AuthError::Failed(format!("dynamic authenticator failed: {}", e)))?;
        Principal::from_value(value)
    }

    pub fn accept(&self, authmethod: &'static str) -> Result<AuthAccept, AuthError> {
        let realm =
            self.realm.clone().ok_or_else(|| AuthError::NoSuchRealm("no realm assigned".into()))?;
        let authid = self
            .authid
            .clone()
            .ok_or_else(|| AuthError::NoSuchPrincipal("no authid assigned".into()))?;
        let authrole = self
            .authrole
            .clone()
            .ok_or_else(|| AuthError::NoSuchRole("no authrole assigned".into()))?;
        Ok(AuthAccept {
            realm,
            authid,
            authrole,
            authmethod,
            authprovider: self.authprovider,
            authextra: self.authextra.clone(),
        })
    }

    /// Session details handed to dynamic authenticators.
    pub fn session_details(&self, authmethod: &'static str) -> Value {
        serde_json::json!({
            "session": self.session,
            "authmethod": authmethod,
            "authid": self.authid,
            "authrole": self.authrole,
            "authextra": self.authextra,
        })
    }
}

/// A pending authentication, one variant per method. Verification consumes
/// the value, so a challenge can only ever be answered once.
pub enum PendingAuth {
    Cra(PendingCra),
    Ticket(PendingTicket),
    Cryptosign(PendingCryptosign),
}

impl PendingAuth {
    pub fn authmethod(&self) -> &'static str {
        match self {
            PendingAuth::Cra(_) => cra::AUTHMETHOD,
            PendingAuth::Ticket(_) => ticket::AUTHMETHOD,
            PendingAuth::Cryptosign(_) => cryptosign::AUTHMETHOD,
        }
    }

    /// Open the pending authentication from the client's HELLO. Returns the
    /// challenge to send, or denies immediately.
    pub async fn hello(
        &mut self,
        realm: Option<&str>,
        details: &HelloDetails,
    ) -> Result<Challenge, AuthError> {
        match self {
            PendingAuth::Cra(p) => p.hello(realm, details).await,
            PendingAuth::Ticket(p) => p.hello(realm, details).await,
            PendingAuth::Cryptosign(p) => p.hello(realm, details).await,
        }
    }

    /// Verify the client's answer to the challenge.
    pub async fn verify(self, signature: &str) -> Result<AuthAccept, AuthError> {
        match self {
            PendingAuth::Cra(p) => p.verify(signature).await,
            PendingAuth::Ticket(p) => p.verify(signature).await,
            PendingAuth::Cryptosign(p) => p.verify(signature).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realm::StaticRealmContainer;

    #[test]
    fn test_error_uris() {
        assert_eq!(AuthError::Failed("x".into()).uri(), "wamp.error.authentication_failed");
        assert_eq!(AuthError::NoSuchRealm("x".into()).uri(), "wamp.error.no_such_realm");
        assert_eq!(AuthError::NoSuchRole("x".into()).uri(), "wamp.error.no_such_role");
        assert_eq!(AuthError::NoSuchPrincipal("x".into()).uri(), "wamp.error.no_such_principal");
    }

    #[test]
    fn test_principal_from_value() {
        let p = Principal::from_value(Value::String("frontend".into())).unwrap();
        assert_eq!(p.role.as_deref(), Some("frontend"));
        assert!(p.authid.is_none());

        let p = Principal::from_value(serde_json::json!({
            "authid": "joe", "role": "backend", "realm": "realm2"
        }))
        .unwrap();
        assert_eq!(p.authid.as_deref(), Some("joe"));
        assert_eq!(p.role.as_deref(), Some("backend"));
        assert_eq!(p.realm.as_deref(), Some("realm2"));

        assert!(Principal::from_value(Value::Number(7.into())).is_err());
    }

    #[tokio::test]
    async fn test_assign_principal_checks_topology() {
        let container = Arc::new(StaticRealmContainer::default());
        container.add_realm("realm1", ["frontend"]);

        let mut base = AuthBase::new(1, container.clone());
        base.realm = Some("realm1".into());
        base.authid = Some("alice".into());
        let principal = Principal { role: Some("frontend".into()), ..Default::default() };
        base.assign_principal(&principal, None).await.unwrap();

        let mut base = AuthBase::new(1, container.clone());
        base.realm = Some("realm1".into());
        base.authid = Some("alice".into());
        let principal = Principal { role: Some("admin".into()), ..Default::default() };
        assert!(matches!(
            base.assign_principal(&principal, None).await,
            Err(AuthError::NoSuchRole(_))
        ));

        // principal may redirect the realm
        let mut base = AuthBase::new(1, container.clone());
        base.realm = Some("realm1".into());
        base.authid = Some("alice".into());
        let principal = Principal {
            realm: Some("realm9".into()),
            role: Some("frontend".into()),
            ..Default::default()
        };
        assert!(matches!(
            base.assign_principal(&principal, None).await,
            Err(AuthError::NoSuchRealm(_))
        ));
    }

    #[tokio::test]
    async fn test_assign_principal_requires_identity() {
        let container = Arc::new(StaticRealmContainer::default());
        let mut base = AuthBase::new(1, container.clone());
        let principal = Principal::default();
        assert!(matches!(
            base.assign_principal(&principal, None).await,
            Err(AuthError::NoSuchRealm(_))
        ));

        let mut base = AuthBase::new(1, container);
        base.realm = Some("realm1".into());
        base.authid = Some("alice".into());
        assert!(matches!(
            base.assign_principal(&Principal::default(), None).await,
            Err(AuthError::NoSuchRole(_))
        ));
    }
}
