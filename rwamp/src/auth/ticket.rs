//! WAMP-Ticket: the client answers the (empty) challenge with a ticket,
//! checked against configuration or forwarded to a dynamic authenticator.

use std::sync::Arc;

use serde_json::Value;

use crate::auth::{AuthAccept, AuthBase, AuthError, Challenge, HelloDetails, Principal};
use crate::realm::RealmContainer;
use crate::settings::TicketConfig;
use crate::types::SessionId;

pub const AUTHMETHOD: &str = "ticket";

pub struct PendingTicket {
    base: AuthBase,
    config: TicketConfig,
    // the ticket we expect, filled only in static mode
    expected_ticket: Option<String>,
}

impl PendingTicket {
    pub fn new(session: SessionId, container: Arc<dyn RealmContainer>, config: TicketConfig) -> Self {
        Self { base: AuthBase::new(session, container), config, expected_ticket: None }
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
            TicketConfig::Static { principals, default_role } => {
                self.base.authprovider = "static";

                let authid = self
                    .base
                    .authid
                    .clone()
                    .ok_or_else(|| AuthError::NoSuchPrincipal("no authid requested".into()))?;
                let principal = principals.get(&authid).ok_or_else(|| {
                    AuthError::NoSuchPrincipal(format!("no principal with authid {:?} exists", authid))
                })?;

                let assigned = Principal { role: principal.role.clone(), ..Default::default() };
                self.base.assign_principal(&assigned, default_role.as_deref()).await?;

                self.expected_ticket = Some(principal.ticket.clone());
                Ok(Challenge { authmethod: AUTHMETHOD, extra: Value::Null })
            }
            TicketConfig::Dynamic { .. } => {
                // the ticket only exists at verify time; the authenticator
                // is consulted there
                self.base.authprovider = "dynamic";
                Ok(Challenge { authmethod: AUTHMETHOD, extra: Value::Null })
            }
        }
    }

    /// Check the presented ticket. Consumes the pending authentication.
    pub async fn verify(mut self, ticket: &str) -> Result<AuthAccept, AuthError> {
        match self.config.clone() {
            TicketConfig::Static { .. } => match self.expected_ticket.as_deref() {
                Some(expected) if expected == ticket => self.base.accept(AUTHMETHOD),
                Some(_) => Err(AuthError::Failed("ticket is invalid".into())),
                None => Err(AuthError::Failed("no challenge was issued".into())),
            },
            TicketConfig::Dynamic { authenticator, authenticator_realm } => {
                let mut details = self.base.session_details(AUTHMETHOD);
                details["ticket"] = Value::String(ticket.to_owned());

                let principal = self
                    .base
                    .call_authenticator(&authenticator, authenticator_realm.as_deref(), details)
                    .await?;
                self.base.assign_principal(&principal, None).await?;
                self.base.accept(AUTHMETHOD)
            }
        }
    }
}
