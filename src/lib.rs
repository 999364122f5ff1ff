//! Realm-scoped WAMP routing core: session manager, broker and dealer.
//!
//! This crate implements the part of a WAMP router that sits behind the
//! transport and wire codec: given decoded [`Message`] values arriving on a
//! [`PeerLink`], it assigns session identity, maintains topic subscriptions
//! and procedure registrations, and routes PUBLISH/CALL traffic to the right
//! peers. Transport framing, the choice of wire serialization, CLI tooling
//! and authentication beyond the anonymous method are left to callers.

use rand::{thread_rng, Rng};

mod broker;
pub mod config;
mod dealer;
mod error;
pub mod messages;
mod meta;
mod peer;
mod realm;
mod router;

pub use config::{RealmConfig, RouterConfig};
pub use error::{Error, ErrorKind};
pub use messages::{
    ArgDict, ArgList, CallError, Dict, ErrorType, InvocationPolicy, List, MatchingPolicy, Message,
    Options, Reason, Value, URI,
};
pub use peer::{PeerHandle, PeerLink};
pub use realm::SessionInfo;
pub use router::Router;

/// All router-assigned identifiers (session, subscription, registration,
/// publication and request ids) share this type, per the WAMP spec.
pub type ID = u64;

pub type CallResult<T> = Result<T, CallError>;
pub type WampResult<T> = Result<T, Error>;

/// Draws a uniformly random, non-zero id from the 53-bit space the WAMP
/// spec requires, used for every id a realm hands out.
pub(crate) fn random_id() -> ID {
    thread_rng().gen_range(1..1u64.rotate_left(53))
}
