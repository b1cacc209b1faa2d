//! WAMP-CRA: HMAC-SHA256 challenge-response over a shared secret.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;

use crate::auth::{AuthAccept, AuthBase, AuthError, Challenge, HelloDetails, Principal};
use crate::realm::RealmContainer;
use crate::settings::{CraConfig, CraPrincipal};
use crate::types::SessionId;
use crate::utils;

pub const AUTHMETHOD: &str = "wampcra";

/// Signature over a challenge: base64(HMAC-SHA256(key, challenge)).
pub fn compute_wcs(key: &[u8], challenge: &[u8]) -> Result<String, AuthError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| AuthError::Failed(format!("invalid HMAC key: {}", e)))?;
    mac.update(challenge);
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// The challenge the client signs. Field order is the serialization order
/// on the wire, so the JSON is deterministic for a given set of values.
#[derive(Serialize)]
struct ChallengeBody<'a> {
    authid: &'a str,
    authrole: &'a str,
    authmethod: &'a str,
    authprovider: &'a str,
    session: SessionId,
    nonce: String,
    timestamp: String,
}

pub struct PendingCra {
    base: AuthBase,
    config: CraConfig,
    // the signature we expect the client to send back
    expected_signature: Option<String>,
}

impl PendingCra {
    pub fn new(session: SessionId, container: Arc<dyn RealmContainer>, config: CraConfig) -> Self {
        Self { base: AuthBase::new(session, container), config, expected_signature: None }
    }

    fn compute_challenge(&self, user: &CraPrincipal) -> Result<(Value, String), AuthError> {
        let body = ChallengeBody {
            authid: self.base.authid.as_deref().unwrap_or_default(),
            authrole: self.base.authrole.as_deref().unwrap_or_default(),
            authmethod: AUTHMETHOD,
            authprovider: self.base.authprovider,
            session: self.base.session,
            nonce: utils::newid(64),
            timestamp: utils::utcnow(),
        };
        let challenge = serde_json::to_string(&body)
            .map_err(|e| AuthError::Failed(format!("challenge serialization failed: {}", e)))?;
        let signature = compute_wcs(user.secret.as_bytes(), challenge.as_bytes())?;

        let mut extra = serde_json::Map::new();
        extra.insert("challenge".into(), Value::String(challenge));

        // salted principals: the client derives the key from the password
        // with the parameters below; the stored secret is the derived key
        if let Some(salt) = user.salt.as_ref() {
            extra.insert("salt".into(), Value::String(salt.clone()));
            extra.insert("iterations".into(), Value::from(user.iterations.unwrap_or(1000)));
            extra.insert("keylen".into(), Value::from(user.keylen.unwrap_or(32)));
        }
        Ok((Value::Object(extra), signature))
    }

    pub async fn hello(
        &mut self,
        realm: Option<&str>,
        details: &HelloDetails,
    ) -> Result<Challenge, AuthError> {
        self.base.realm = realm.map(|r| r.to_owned());
        self.base.authid = details.authid.clone();
        self.base.authextra = details.authextra.clone();

        match self.config.clone() {
            CraConfig::Static { users, default_role } => {
                self.base.authprovider = "static";

                let authid = self
                    .base
                    .authid
                    .clone()
                    .ok_or_else(|| AuthError::NoSuchPrincipal("no authid requested".into()))?;
                let user = users.get(&authid).ok_or_else(|| {
                    AuthError::NoSuchPrincipal(format!("no principal with authid {:?} exists", authid))
                })?;

                let principal = Principal { role: user.role.clone(), ..Default::default() };
                self.base.assign_principal(&principal, default_role.as_deref()).await?;

                let (extra, signature) = self.compute_challenge(user)?;
                self.expected_signature = Some(signature);
                Ok(Challenge { authmethod: AUTHMETHOD, extra })
            }
            CraConfig::Dynamic { authenticator, authenticator_realm } => {
                self.base.authprovider = "dynamic";

                let details = self.base.session_details(AUTHMETHOD);
                let principal = self
                    .base
                    .call_authenticator(&authenticator, authenticator_realm.as_deref(), details)
                    .await?;
                let secret = principal.secret.clone().ok_or_else(|| {
                    AuthError::Failed("dynamic authenticator did not return a secret".into())
                })?;
                self.base.assign_principal(&principal, None).await?;

                let user = CraPrincipal {
                    secret,
                    role: None,
                    salt: principal.salt.clone(),
                    iterations: principal.iterations,
                    keylen: principal.keylen,
                };
                let (extra, signature) = self.compute_challenge(&user)?;
                self.expected_signature = Some(signature);
                Ok(Challenge { authmethod: AUTHMETHOD, extra })
            }
        }
    }

    /// Check the client's signature against the one computed at challenge
    /// time. Consumes the pending authentication.
    pub async fn verify(self, signature: &str) -> Result<AuthAccept, AuthError> {
        match self.expected_signature.as_deref() {
            Some(expected) if expected == signature => self.base.accept(AUTHMETHOD),
            Some(_) => Err(AuthError::Failed("signature is invalid".into())),
            None => Err(AuthError::Failed("no challenge was issued".into())),
        }
    }
}
