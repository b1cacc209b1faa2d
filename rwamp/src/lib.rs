#![deny(unsafe_code)]

//! WAMP application router core.
//!
//! Routes publish/subscribe events and remote procedure calls between
//! sessions joined to isolated realms, and gates session admission behind
//! per-method authentication handshakes.
//!
//! # Overall Example
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rwamp::realm::{Realm, StaticRealmContainer};
//! use rwamp::topic::MatchPolicy;
//!
//! #[tokio::main]
//! async fn main() -> rwamp::Result<()> {
//!     let container = Arc::new(StaticRealmContainer::default());
//!     let realm = Realm::new("realm1", container);
//!
//!     let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
//!     realm.join(1, "alice", "frontend", tx).await?;
//!     realm.subscribe(1, "com.example.topic1", MatchPolicy::Exact).await?;
//!     Ok(())
//! }
//! ```

pub mod auth; // Pending-authentication state machines
pub mod broker; // Pub/sub half of the router
pub mod cookie; // Cookie-backed identity cache
pub mod dealer; // RPC half of the router
pub mod logger; // slog-backed logging
pub mod matcher; // Wildcard pattern index
pub mod observation; // Subscription/registration map
pub mod realm; // Realm-scoped router state
pub mod settings; // Configuration loading
pub mod topic; // URI parsing and matching policies
pub mod trie; // Prefix-searchable index
pub mod types; // Common data types

pub use rwamp_utils as utils;

pub use anyhow::Error;

pub type Result<T> = anyhow::Result<T, Error>;
