//! Domain types and pure coordination logic for tandem focus sessions.
//!
//! This crate has no I/O of its own. It defines the rows the durable store
//! keeps ([`session`], [`matching`]), the pure pieces every client must agree
//! on ([`timer`], [`presence::PresenceClassifier`],
//! [`matching::MatchReconciler`]), and the seams the rest of the workspace
//! plugs into ([`remote::RemoteProcedures`], [`remote::Beacon`],
//! [`feed::ChangeFeed`], [`clock::Clock`]).

pub mod clock;
pub mod error;
pub mod feed;
pub mod matching;
pub mod presence;
pub mod remote;
pub mod session;
pub mod timer;
pub mod types;
pub mod wire;
