//! The top-level realm registry: generalizes the teacher's `Router`
//! (`router/mod.rs`) from a WebSocket listener bound to `parity-ws` into a
//! transport-agnostic entry point. Callers own the transport; they hand
//! this module an already-paired `PeerLink`/`PeerHandle` and get back
//! either a live `SessionInfo` or the reason the handshake failed.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::config::{RealmConfig, RouterConfig};
use crate::error::{Error, ErrorKind};
use crate::messages::Reason;
use crate::peer::{PeerHandle, PeerLink};
use crate::realm::{Realm, SessionInfo};
use crate::{Dict, Message, WampResult, ID, URI};

/// Process-wide container of realms. Cheap to clone-share: wrap in `Arc`
/// if multiple transport listeners need the same router.
pub struct Router {
    config: RouterConfig,
    realms: Mutex<HashMap<String, Arc<Realm>>>,
}

impl Router {
    pub fn new(config: RouterConfig) -> Router {
        Router {
            config,
            realms: Mutex::new(HashMap::new()),
        }
    }

    /// Builds a `PeerLink`/`PeerHandle` pair sized to this router's
    /// `outbound_queue_depth`, for a transport adapter to split between
    /// its read side and the end it hands to `attach`.
    pub fn new_peer_pair(&self, id: ID) -> (PeerLink, PeerHandle) {
        PeerLink::pair(id, self.config.outbound_queue_depth)
    }

    /// Adds a realm under `uri`, idempotent on an exact re-add (same or
    /// different config for an existing URI is a no-op — spec.md §4.6
    /// only requires duplicate URIs be rejected, not re-configured).
    /// Returns `true` if a new realm was created.
    pub fn add_realm(&self, uri: &str, config: RealmConfig) -> bool {
        let mut realms = self.realms.lock().unwrap();
        if realms.contains_key(uri) {
            return false;
        }
        realms.insert(uri.to_string(), Arc::new(Realm::new(config)));
        debug!("added realm {}", uri);
        true
    }

    /// Performs the HELLO/WELCOME handshake for a freshly connected peer
    /// and, on success, hands it off to its realm's per-session dispatch
    /// loop. The first message read off `inbound` must be HELLO; anything
    /// else, or a realm that doesn't exist, aborts the attempt.
    pub async fn attach(&self, inbound: PeerLink, outbound: PeerHandle) -> WampResult<SessionInfo> {
        let message = inbound.recv().await.ok_or_else(|| {
            Error::new(ErrorKind::Io(
                "peer closed before sending HELLO".to_string(),
            ))
        })?;

        let (realm_uri, details) = match message {
            Message::Hello(uri, details) => (uri, details),
            other => {
                warn!("peer sent {} before HELLO", other.name());
                let _ = outbound
                    .send(Message::Abort(
                        Dict::new(),
                        Reason::CustomReason(URI::new("wamp.error.protocol_violation")),
                    ))
                    .await;
                return Err(Error::new(ErrorKind::InvalidState(
                    "expected HELLO as the first message",
                )));
            }
        };

        let realm = {
            let realms = self.realms.lock().unwrap();
            realms.get(&realm_uri.uri).cloned()
        };
        let realm = match realm {
            Some(realm) => realm,
            None => {
                let _ = outbound
                    .send(Message::Abort(Dict::new(), Reason::NoSuchRealm))
                    .await;
                return Err(Error::new(ErrorKind::HandshakeError(Reason::NoSuchRealm)));
            }
        };

        let sid = realm.attach(inbound, outbound, details).await?;
        Ok(SessionInfo {
            id: sid,
            realm: realm_uri.uri,
        })
    }

    /// Closes every realm (and so every session in it). Idempotent: a
    /// second call just closes an already-empty set of sessions again.
    pub fn close(&self) {
        for (uri, realm) in self.realms.lock().unwrap().iter() {
            debug!("closing realm {}", uri);
            realm.close();
        }
    }
}

impl Default for Router {
    fn default() -> Router {
        Router::new(RouterConfig::new())
    }
}
