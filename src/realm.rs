//! The realm: session table, HELLO/WELCOME/GOODBYE handshake, and the
//! per-session dispatch loop that feeds the broker and dealer. Generalizes
//! the teacher's `ConnectionHandler` (`router/mod.rs`/`router/handshake.rs`)
//! from a transport-bound, single-connection object into a realm-owned
//! component that drives many sessions concurrently over `PeerLink`s.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};

use crate::broker::Broker;
use crate::config::RealmConfig;
use crate::dealer::Dealer;
use crate::error::{Error, ErrorKind};
use crate::meta;
use crate::messages::RouterRoles;
use crate::peer::{PeerHandle, PeerLink};
use crate::{random_id, Dict, ErrorType, MatchingPolicy, Message, Options, Reason, WampResult, ID};

/// Returned by [`crate::Router::attach`] once a session clears the
/// handshake: enough to identify which realm and session a caller is now
/// driving, without exposing the realm's internals.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: ID,
    pub realm: String,
}

/// A snapshot of one session's auth identity, handed to the meta-procedure
/// dispatcher so it never has to lock the session table itself.
pub(crate) struct SessionSnapshot {
    pub id: ID,
    pub authid: String,
    pub authrole: String,
    pub authmethod: String,
    pub authprovider: String,
}

struct Session {
    outbound: PeerHandle,
    /// Kept alongside the task's own copy so [`Realm::close`] can force a
    /// hung session shut without the realm ever reading from it itself
    /// (`PeerLink` isn't `Clone`, so this is an `Arc` around the one link
    /// the transport handed to `attach`).
    inbound: Arc<PeerLink>,
    authid: String,
    authrole: String,
    authmethod: String,
    authprovider: String,
}

/// One isolated WAMP namespace: its own broker, dealer and session table.
pub struct Realm {
    config: RealmConfig,
    broker: Mutex<Broker>,
    dealer: Mutex<Dealer>,
    sessions: Mutex<HashMap<ID, Session>>,
}

impl Realm {
    pub fn new(config: RealmConfig) -> Realm {
        let mut dealer = Dealer::new();
        meta::register_all(&mut dealer);
        Realm {
            config,
            broker: Mutex::new(Broker::new()),
            dealer: Mutex::new(dealer),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Completes the handshake for a freshly connected peer: validates the
    /// authmethod, allocates a session id, sends WELCOME, and spawns the
    /// per-session dispatch loop. `details` is the `HELLO` message's option
    /// dict, already stripped of the realm uri by the caller.
    pub async fn attach(
        self: Arc<Self>,
        inbound: PeerLink,
        outbound: PeerHandle,
        details: Dict,
    ) -> WampResult<ID> {
        if !self.config.anonymous_auth {
            let _ = outbound
                .send(Message::Abort(Dict::new(), Reason::AuthenticationFailed))
                .await;
            return Err(Error::new(ErrorKind::HandshakeError(
                Reason::AuthenticationFailed,
            )));
        }

        let authid = details
            .as_str("authid")
            .map(str::to_string)
            .unwrap_or_else(|| format!("anonymous-{}", random_id()));
        let inbound = Arc::new(inbound);

        let sid = {
            let mut sessions = self.sessions.lock().unwrap();
            loop {
                let candidate = random_id();
                if candidate != meta::META_SESSION_ID && !sessions.contains_key(&candidate) {
                    sessions.insert(
                        candidate,
                        Session {
                            outbound: outbound.clone(),
                            inbound: inbound.clone(),
                            authid: authid.clone(),
                            authrole: "anonymous".to_string(),
                            authmethod: "anonymous".to_string(),
                            authprovider: "static".to_string(),
                        },
                    );
                    break candidate;
                }
            }
        };

        let mut welcome_details = Dict::new();
        welcome_details.insert("roles".to_string(), RouterRoles::new().to_value());
        if outbound
            .send(Message::Welcome(sid, welcome_details))
            .await
            .is_err()
        {
            self.sessions.lock().unwrap().remove(&sid);
            return Err(Error::new(ErrorKind::Io(
                "peer closed before WELCOME could be delivered".to_string(),
            )));
        }

        debug!("session {} attached", sid);
        tokio::spawn(self.clone().run_session(sid, inbound));
        Ok(sid)
    }

    async fn run_session(self: Arc<Self>, sid: ID, inbound: Arc<PeerLink>) {
        loop {
            match inbound.recv().await {
                Some(message) => {
                    if !self.dispatch(sid, message).await {
                        break;
                    }
                }
                None => break,
            }
        }
        self.teardown(sid).await;
    }

    /// Handles one inbound message for `sid`. Returns `false` once the
    /// session's loop should end (GOODBYE exchanged or the peer violated
    /// the handshake state machine badly enough to abort).
    async fn dispatch(self: &Arc<Self>, sid: ID, message: Message) -> bool {
        match message {
            Message::Subscribe(req, options, topic) => {
                let policy = MatchingPolicy::from_option(options.as_str("match"));
                if self.config.strict_uris && policy != MatchingPolicy::Wildcard && !topic.is_strict() {
                    self.deliver(
                        sid,
                        Message::Error(ErrorType::Subscribe, req, Dict::new(), Reason::InvalidURI, None, None),
                    )
                    .await;
                    return true;
                }
                let outcome = self.broker.lock().unwrap().subscribe(sid, &options, topic);
                match outcome {
                    Ok(subscription_id) => {
                        self.deliver(sid, Message::Subscribed(req, subscription_id)).await
                    }
                    Err(e) => {
                        let (reason, args, kwargs) = e.into_tuple();
                        self.deliver(
                            sid,
                            Message::Error(ErrorType::Subscribe, req, Dict::new(), reason, args, kwargs),
                        )
                        .await
                    }
                }
                true
            }
            Message::Unsubscribe(req, subscription_id) => {
                let outcome = self.broker.lock().unwrap().unsubscribe(sid, subscription_id);
                match outcome {
                    Ok(()) => self.deliver(sid, Message::Unsubscribed(req)).await,
                    Err(e) => {
                        let (reason, args, kwargs) = e.into_tuple();
                        self.deliver(
                            sid,
                            Message::Error(ErrorType::Unsubscribe, req, Dict::new(), reason, args, kwargs),
                        )
                        .await
                    }
                }
                true
            }
            Message::Publish(req, options, topic, args, kwargs) => {
                if self.config.strict_uris && !topic.is_strict() {
                    self.deliver(
                        sid,
                        Message::Error(ErrorType::Publish, req, Dict::new(), Reason::InvalidURI, None, None),
                    )
                    .await;
                    return true;
                }
                let acknowledge = options.as_bool("acknowledge");
                let publication_id = random_id();
                let events = self.broker.lock().unwrap().publish(
                    sid,
                    &options,
                    &topic,
                    publication_id,
                    args,
                    kwargs,
                    self.config.allow_disclose,
                );
                for (subscriber, event) in events {
                    self.deliver(subscriber, event).await;
                }
                if acknowledge {
                    self.deliver(sid, Message::Published(req, publication_id)).await;
                }
                true
            }
            Message::Register(req, options, procedure) => {
                let policy = MatchingPolicy::from_option(options.as_str("match"));
                if self.config.strict_uris && policy != MatchingPolicy::Wildcard && !procedure.is_strict() {
                    self.deliver(
                        sid,
                        Message::Error(ErrorType::Register, req, Dict::new(), Reason::InvalidURI, None, None),
                    )
                    .await;
                    return true;
                }
                let outcome = self.dealer.lock().unwrap().register(sid, &options, procedure);
                match outcome {
                    Ok(registration_id) => {
                        self.deliver(sid, Message::Registered(req, registration_id)).await
                    }
                    Err(e) => {
                        let (reason, args, kwargs) = e.into_tuple();
                        self.deliver(
                            sid,
                            Message::Error(ErrorType::Register, req, Dict::new(), reason, args, kwargs),
                        )
                        .await
                    }
                }
                true
            }
            Message::Unregister(req, registration_id) => {
                let outcome = self.dealer.lock().unwrap().unregister(sid, registration_id);
                match outcome {
                    Ok(()) => self.deliver(sid, Message::Unregistered(req)).await,
                    Err(e) => {
                        let (reason, args, kwargs) = e.into_tuple();
                        self.deliver(
                            sid,
                            Message::Error(ErrorType::Unregister, req, Dict::new(), reason, args, kwargs),
                        )
                        .await
                    }
                }
                true
            }
            Message::Call(req, options, procedure, args, kwargs) => {
                if self.config.strict_uris && !procedure.is_strict() {
                    self.deliver(
                        sid,
                        Message::Error(ErrorType::Call, req, Dict::new(), Reason::InvalidURI, None, None),
                    )
                    .await;
                    return true;
                }

                let is_meta = {
                    let dealer = self.dealer.lock().unwrap();
                    dealer
                        .lookup_registration(&procedure)
                        .map(|registration_id| {
                            dealer
                                .callees_for(registration_id)
                                .contains(&meta::META_SESSION_ID)
                        })
                        .unwrap_or(false)
                };
                if is_meta {
                    let sessions = self.session_snapshots();
                    let outcome = {
                        let dealer = self.dealer.lock().unwrap();
                        meta::dispatch(&procedure.uri, args, &sessions, &dealer)
                    };
                    match outcome {
                        Ok((rargs, rkwargs)) => {
                            self.deliver(sid, Message::Result(req, Dict::new(), rargs, rkwargs)).await
                        }
                        Err(e) => {
                            let (reason, eargs, ekwargs) = e.into_tuple();
                            self.deliver(
                                sid,
                                Message::Error(ErrorType::Call, req, Dict::new(), reason, eargs, ekwargs),
                            )
                            .await
                        }
                    }
                    return true;
                }

                let invocation_id = random_id();
                let outcome = {
                    let mut dealer = self.dealer.lock().unwrap();
                    dealer.call(sid, req, invocation_id, &procedure, args, kwargs)
                };
                match outcome {
                    Ok((callee, invocation)) => {
                        self.deliver(callee, invocation).await;
                        let timeout = match options.as_u64("timeout") {
                            Some(ms) if ms > 0 => Some(Duration::from_millis(ms)),
                            Some(_) => None,
                            None => self.config.default_call_timeout,
                        };
                        if let Some(timeout) = timeout {
                            self.clone().spawn_call_timeout(invocation_id, timeout);
                        }
                    }
                    Err(e) => {
                        let (reason, eargs, ekwargs) = e.into_tuple();
                        self.deliver(
                            sid,
                            Message::Error(ErrorType::Call, req, Dict::new(), reason, eargs, ekwargs),
                        )
                        .await
                    }
                }
                true
            }
            Message::Yield(invocation_id, options, args, kwargs) => {
                let outcome = self.dealer.lock().unwrap().yield_(invocation_id, &options, args, kwargs);
                if let Some((caller, result)) = outcome {
                    self.deliver(caller, result).await;
                }
                true
            }
            Message::Error(ErrorType::Invocation, invocation_id, details, reason, args, kwargs) => {
                let outcome = self
                    .dealer
                    .lock()
                    .unwrap()
                    .error(invocation_id, details, reason, args, kwargs);
                if let Some((caller, error)) = outcome {
                    self.deliver(caller, error).await;
                }
                true
            }
            Message::Cancel(call_request_id, options) => {
                let kill_now = options.as_str("mode") == Some("killnowait");
                let invocation_id = {
                    let dealer = self.dealer.lock().unwrap();
                    dealer.find_invocation_for_cancel(sid, call_request_id)
                };
                if let Some(invocation_id) = invocation_id {
                    let outcome = self
                        .dealer
                        .lock()
                        .unwrap()
                        .interrupt_for_cancel(invocation_id, kill_now);
                    if let Some((callee, interrupt)) = outcome {
                        self.deliver(callee, interrupt).await;
                    }
                }
                true
            }
            Message::Goodbye(_, _) => {
                self.deliver(sid, Message::Goodbye(Dict::new(), Reason::GoodbyeAndOut)).await;
                debug!("session {} said goodbye", sid);
                false
            }
            other => {
                warn!("session {} sent unexpected message {}", sid, other.name());
                true
            }
        }
    }

    async fn teardown(&self, sid: ID) {
        self.sessions.lock().unwrap().remove(&sid);
        self.broker.lock().unwrap().remove_session(sid);
        let pending = self.dealer.lock().unwrap().remove_session(sid);
        for (peer, message) in pending {
            self.deliver(peer, message).await;
        }
        debug!("session {} torn down", sid);
    }

    /// Closes every attached session's inbound link. Each session's own
    /// dispatch loop notices the close on its next `recv()` (after
    /// draining whatever was already queued) and runs its own
    /// [`Realm::teardown`], so this only needs to kick the link — it does
    /// not wait for teardown to finish. Idempotent: closing an
    /// already-closed `PeerLink` is a no-op (see `peer::Shared::close`).
    pub fn close(&self) {
        for session in self.sessions.lock().unwrap().values() {
            session.inbound.close();
        }
    }

    fn spawn_call_timeout(self: Arc<Self>, invocation_id: ID, timeout: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let outcome = self.dealer.lock().unwrap().timeout(invocation_id);
            if let Some(((callee, interrupt), (caller, error))) = outcome {
                self.deliver(callee, interrupt).await;
                self.deliver(caller, error).await;
            }
        });
    }

    fn session_snapshots(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .map(|(id, session)| SessionSnapshot {
                id: *id,
                authid: session.authid.clone(),
                authrole: session.authrole.clone(),
                authmethod: session.authmethod.clone(),
                authprovider: session.authprovider.clone(),
            })
            .collect()
    }

    async fn deliver(&self, sid: ID, message: Message) {
        let name = message.name();
        let outbound = self.sessions.lock().unwrap().get(&sid).map(|s| s.outbound.clone());
        match outbound {
            Some(handle) => {
                if handle.send(message).await.is_err() {
                    debug!("peer {} gone, dropped {}", sid, name);
                }
            }
            None => debug!("no session {} to deliver {} to", sid, name),
        }
    }
}
