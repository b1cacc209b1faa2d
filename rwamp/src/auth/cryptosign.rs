//! WAMP-Cryptosign: the client proves possession of an Ed25519 key by
//! signing 32 random challenge bytes.

use std::sync::Arc;

use ed25519_dalek::{Signature, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use rand::RngCore;
use serde_json::Value;

use crate::auth::{AuthAccept, AuthBase, AuthError, Challenge, HelloDetails, Principal};
use crate::realm::RealmContainer;
use crate::settings::CryptosignConfig;
use crate::types::SessionId;
use crate::utils;

pub const AUTHMETHOD: &str = "cryptosign";

const CHALLENGE_LENGTH: usize = 32;
// hex-decoded AUTHENTICATE payload: signature followed by the signed message
const SIGNED_MESSAGE_LENGTH: usize = SIGNATURE_LENGTH + CHALLENGE_LENGTH;

pub struct PendingCryptosign {
    base: AuthBase,
    config: CryptosignConfig,
    verify_key: Option<VerifyingKey>,
    challenge: Option<[u8; CHALLENGE_LENGTH]>,
}

fn parse_verify_key(pubkey_hex: &str) -> Result<VerifyingKey, AuthError> {
    let bytes = utils::from_hex(pubkey_hex)
        .map_err(|_| AuthError::Failed("public key is invalid (not a HEX encoded string)".into()))?;
    let bytes: [u8; PUBLIC_KEY_LENGTH] = bytes
        .try_into()
        .map_err(|_| AuthError::Failed("public key has invalid length".into()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|_| AuthError::Failed("public key is not a valid Ed25519 key".into()))
}

impl PendingCryptosign {
    pub fn new(
        session: SessionId,
        container: Arc<dyn RealmContainer>,
        config: CryptosignConfig,
    ) -> Self {
        Self { base: AuthBase::new(session, container), config, verify_key: None, challenge: None }
    }

    fn compute_challenge(&mut self) -> Value {
        let mut challenge = [0u8; CHALLENGE_LENGTH];
        rand::rng().fill_bytes(&mut challenge);
        self.challenge = Some(challenge);
        serde_json::json!({ "challenge": utils::to_hex(&challenge) })
    }

    fn pubkey_from_extra(details: &HelloDetails) -> Option<String> {
        details
            .authextra
            .as_ref()
            .and_then(|extra| extra.get("pubkey"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_owned())
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
            CryptosignConfig::Static { principals, default_role } => {
                self.base.authprovider = "static";

                let pubkey = Self::pubkey_from_extra(details);

                // a client may identify by public key alone, as long as the
                // key maps to exactly one principal
                if self.base.authid.is_none() {
                    let pubkey = pubkey.as_deref().ok_or_else(|| {
                        AuthError::Failed(
                            "cannot identify client: no authid requested and no extra.pubkey provided".into(),
                        )
                    })?;
                    let mut inferred = None;
                    for (authid, principal) in principals.iter() {
                        if principal.authorized_keys.iter().any(|k| k == pubkey) {
                            if inferred.is_some() {
                                return Err(AuthError::Failed(
                                    "cannot infer client identity from pubkey: multiple authids in principal database have this pubkey".into(),
                                ));
                            }
                            inferred = Some(authid.clone());
                        }
                    }
                    self.base.authid = Some(inferred.ok_or_else(|| {
                        AuthError::NoSuchPrincipal(
                            "no authid requested and no principal found for provided extra.pubkey".into(),
                        )
                    })?);
                }

                let authid = self.base.authid.clone().unwrap_or_default();
                let principal = principals.get(&authid).ok_or_else(|| {
                    AuthError::NoSuchPrincipal(format!("no principal with authid {:?} exists", authid))
                })?;

                let key_hex = match pubkey {
                    Some(pubkey) => {
                        if !principal.authorized_keys.iter().any(|k| k == &pubkey) {
                            return Err(AuthError::Failed(
                                "extra.pubkey provided does not match any one of authorized_keys for the principal"
                                    .into(),
                            ));
                        }
                        pubkey
                    }
                    None => match principal.authorized_keys.as_slice() {
                        [only] => only.clone(),
                        _ => {
                            return Err(AuthError::Failed(
                                "cannot select client key: no extra.pubkey provided and principal has multiple authorized_keys"
                                    .into(),
                            ))
                        }
                    },
                };

                let assigned = Principal { role: principal.role.clone(), ..Default::default() };
                self.base.assign_principal(&assigned, default_role.as_deref()).await?;

                self.verify_key = Some(parse_verify_key(&key_hex)?);
                Ok(Challenge { authmethod: AUTHMETHOD, extra: self.compute_challenge() })
            }
            CryptosignConfig::Dynamic { authenticator, authenticator_realm } => {
                self.base.authprovider = "dynamic";

                let details = self.base.session_details(AUTHMETHOD);
                let principal = self
                    .base
                    .call_authenticator(&authenticator, authenticator_realm.as_deref(), details)
                    .await?;
                let pubkey = principal.pubkey.clone().ok_or_else(|| {
                    AuthError::Failed("dynamic authenticator did not return a pubkey".into())
                })?;
                self.base.assign_principal(&principal, None).await?;

                self.verify_key = Some(parse_verify_key(&pubkey)?);
                Ok(Challenge { authmethod: AUTHMETHOD, extra: self.compute_challenge() })
            }
        }
    }

    /// Verify the signed challenge: 96 hex-decoded bytes, the Ed25519
    /// signature over the signed message followed by the message itself,
    /// which must equal the challenge we issued. Consumes the pending
    /// authentication.
    pub async fn verify(self, signed_message: &str) -> Result<AuthAccept, AuthError> {
        let verify_key = self
            .verify_key
            .ok_or_else(|| AuthError::Failed("no challenge was issued".into()))?;
        let challenge =
            self.challenge.ok_or_else(|| AuthError::Failed("no challenge was issued".into()))?;

        let signed = utils::from_hex(signed_message).map_err(|_| {
            AuthError::Failed("signed message is invalid (not a HEX encoded string)".into())
        })?;
        if signed.len() != SIGNED_MESSAGE_LENGTH {
            return Err(AuthError::Failed(format!(
                "signed message has invalid length (was {}, but should have been {})",
                signed.len(),
                SIGNED_MESSAGE_LENGTH
            )));
        }

        let (sig_bytes, message) = signed.split_at(SIGNATURE_LENGTH);
        let sig_bytes: [u8; SIGNATURE_LENGTH] =
            sig_bytes.try_into().map_err(|_| AuthError::Failed("signature is malformed".into()))?;
        let signature = Signature::from_bytes(&sig_bytes);

        if verify_key.verify_strict(message, &signature).is_err() {
            return Err(AuthError::Failed("signed message has invalid signature".into()));
        }
        if message != challenge {
            return Err(AuthError::Failed("message signed is bogus".into()));
        }
        self.base.accept(AUTHMETHOD)
    }
}
