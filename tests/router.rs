//! End-to-end scenarios against `Router`/`Realm` driven entirely through
//! `PeerLink`/`PeerHandle` pairs, the same seam a real transport adapter
//! would use. Each session gets two independent pairs — one carrying
//! messages into the router, one carrying messages back out — since a
//! single `PeerLink`/`PeerHandle` pair is one direction only.

use std::time::Duration;

use wamp_router::{
    Dict, Message, PeerHandle, PeerLink, RealmConfig, Reason, Router, RouterConfig, Value, URI,
};

const REALM: &str = "nexus.test.realm";
const QUEUE_DEPTH: usize = 32;

struct TestPeer {
    send: PeerHandle,
    recv: PeerLink,
}

impl TestPeer {
    async fn send(&self, message: Message) {
        self.send.send(message).await.expect("router peer closed");
    }

    async fn recv(&self) -> Message {
        tokio::time::timeout(Duration::from_secs(1), self.recv.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("peer link closed unexpectedly")
    }

    async fn recv_none_within(&self, d: Duration) {
        assert!(
            tokio::time::timeout(d, self.recv.recv()).await.is_err(),
            "expected no message to arrive"
        );
    }
}

/// Builds a fresh `Router` with one realm plus a pair of in-memory links
/// ready to hand to `Router::attach`: `(inbound, outbound)` for the
/// router side, and a `TestPeer` for the test to drive the other end.
fn new_router() -> Router {
    let router = Router::new(RouterConfig::new());
    assert!(router.add_realm(REALM, RealmConfig::new()));
    router
}

fn peer_pair() -> (PeerLink, PeerHandle, TestPeer) {
    let (router_inbound, client_outbound) = PeerLink::pair(0, QUEUE_DEPTH);
    let (client_inbound, router_outbound) = PeerLink::pair(0, QUEUE_DEPTH);
    (
        router_inbound,
        router_outbound,
        TestPeer {
            send: client_outbound,
            recv: client_inbound,
        },
    )
}

/// Drives a HELLO through `router` and returns the peer once the session
/// is attached. The HELLO is queued before `attach` is called, so `attach`
/// finds it waiting the moment it reads from `inbound` — no concurrency
/// needed on the test side.
async fn attach(router: &Router, realm: &str) -> TestPeer {
    let (inbound, outbound, peer) = peer_pair();
    peer.send(Message::Hello(URI::new(realm), Dict::new())).await;
    router
        .attach(inbound, outbound)
        .await
        .expect("handshake should succeed");
    peer
}

#[tokio::test]
async fn handshake_then_goodbye() {
    let router = new_router();
    let peer = attach(&router, REALM).await;

    match peer.recv().await {
        Message::Welcome(sid, _) => assert_ne!(sid, 0),
        other => panic!("expected WELCOME, got {}", other.name()),
    }

    peer.send(Message::Goodbye(Dict::new(), Reason::GoodbyeAndOut))
        .await;
    match peer.recv().await {
        Message::Goodbye(_, reason) => assert_eq!(reason, Reason::GoodbyeAndOut),
        other => panic!("expected GOODBYE, got {}", other.name()),
    }
}

#[tokio::test]
async fn bad_realm_is_aborted() {
    let router = new_router();
    let (inbound, outbound, peer) = peer_pair();
    peer.send(Message::Hello(URI::new("does.not.exist"), Dict::new()))
        .await;
    let result = router.attach(inbound, outbound).await;
    assert!(result.is_err());
    match peer.recv().await {
        Message::Abort(_, reason) => assert_eq!(reason, Reason::NoSuchRealm),
        other => panic!("expected ABORT, got {}", other.name()),
    }
}

async fn welcome_sid(peer: &TestPeer) -> u64 {
    match peer.recv().await {
        Message::Welcome(sid, _) => sid,
        other => panic!("expected WELCOME, got {}", other.name()),
    }
}

#[tokio::test]
async fn pubsub_delivers_to_subscriber_only() {
    let router = new_router();
    let subscriber = attach(&router, REALM).await;
    welcome_sid(&subscriber).await;
    let publisher = attach(&router, REALM).await;
    welcome_sid(&publisher).await;

    subscriber
        .send(Message::Subscribe(1, Dict::new(), URI::new("some.uri")))
        .await;
    let subscription_id = match subscriber.recv().await {
        Message::Subscribed(req, subscription_id) => {
            assert_eq!(req, 1);
            subscription_id
        }
        other => panic!("expected SUBSCRIBED, got {}", other.name()),
    };

    publisher
        .send(Message::Publish(2, Dict::new(), URI::new("some.uri"), None, None))
        .await;

    match subscriber.recv().await {
        Message::Event(subid, _pubid, _details, _args, _kwargs) => {
            assert_eq!(subid, subscription_id)
        }
        other => panic!("expected EVENT, got {}", other.name()),
    }
    publisher.recv_none_within(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn acknowledged_publish_gets_published() {
    let router = new_router();
    let publisher = attach(&router, REALM).await;
    welcome_sid(&publisher).await;

    let mut options = Dict::new();
    options.insert("acknowledge".to_string(), Value::Boolean(true));
    publisher
        .send(Message::Publish(7, options, URI::new("some.uri"), None, None))
        .await;

    match publisher.recv().await {
        Message::Published(req, _pubid) => assert_eq!(req, 7),
        other => panic!("expected PUBLISHED, got {}", other.name()),
    }
}

#[tokio::test]
async fn unacknowledged_publish_gets_nothing() {
    let router = new_router();
    let publisher = attach(&router, REALM).await;
    welcome_sid(&publisher).await;

    let mut options = Dict::new();
    options.insert("acknowledge".to_string(), Value::Boolean(false));
    publisher
        .send(Message::Publish(7, options, URI::new("some.uri"), None, None))
        .await;

    publisher.recv_none_within(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn rpc_round_trip() {
    let router = new_router();
    let callee = attach(&router, REALM).await;
    welcome_sid(&callee).await;
    let caller = attach(&router, REALM).await;
    welcome_sid(&caller).await;

    callee
        .send(Message::Register(
            1,
            Dict::new(),
            URI::new("nexus.test.endpoint"),
        ))
        .await;
    let registration_id = match callee.recv().await {
        Message::Registered(req, registration_id) => {
            assert_eq!(req, 1);
            registration_id
        }
        other => panic!("expected REGISTERED, got {}", other.name()),
    };

    caller
        .send(Message::Call(
            42,
            Dict::new(),
            URI::new("nexus.test.endpoint"),
            Some(vec![Value::Integer(1)]),
            None,
        ))
        .await;

    let invocation_id = match callee.recv().await {
        Message::Invocation(invocation_id, regid, _details, args, _kwargs) => {
            assert_eq!(regid, registration_id);
            assert_eq!(args, Some(vec![Value::Integer(1)]));
            invocation_id
        }
        other => panic!("expected INVOCATION, got {}", other.name()),
    };

    callee
        .send(Message::Yield(
            invocation_id,
            Dict::new(),
            Some(vec![Value::Integer(2)]),
            None,
        ))
        .await;

    match caller.recv().await {
        Message::Result(req, _details, args, _kwargs) => {
            assert_eq!(req, 42);
            assert_eq!(args, Some(vec![Value::Integer(2)]));
        }
        other => panic!("expected RESULT, got {}", other.name()),
    }
}

#[tokio::test]
async fn registration_meta_procedures() {
    let router = new_router();
    let callee = attach(&router, REALM).await;
    let callee_sid = welcome_sid(&callee).await;
    let caller = attach(&router, REALM).await;
    welcome_sid(&caller).await;

    callee
        .send(Message::Register(
            1,
            Dict::new(),
            URI::new("nexus.test.endpoint"),
        ))
        .await;
    let exact_regid = match callee.recv().await {
        Message::Registered(_, regid) => regid,
        other => panic!("expected REGISTERED, got {}", other.name()),
    };

    let mut wildcard_options = Dict::new();
    wildcard_options.insert("match".to_string(), Value::String("wildcard".to_string()));
    callee
        .send(Message::Register(
            2,
            wildcard_options,
            URI::new("nexus..endpoint"),
        ))
        .await;
    let wildcard_regid = match callee.recv().await {
        Message::Registered(_, regid) => regid,
        other => panic!("expected REGISTERED, got {}", other.name()),
    };

    caller
        .send(Message::Call(
            100,
            Dict::new(),
            URI::new("wamp.registration.list"),
            None,
            None,
        ))
        .await;
    match caller.recv().await {
        Message::Result(req, _, _, Some(kwargs)) => {
            assert_eq!(req, 100);
            let exact = match kwargs.get("exact") {
                Some(Value::List(ids)) => ids.clone(),
                _ => panic!("missing exact list"),
            };
            assert!(exact.contains(&Value::UnsignedInteger(exact_regid)));
            let wildcard = match kwargs.get("wildcard") {
                Some(Value::List(ids)) => ids.clone(),
                _ => panic!("missing wildcard list"),
            };
            assert!(wildcard.contains(&Value::UnsignedInteger(wildcard_regid)));
            let prefix = match kwargs.get("prefix") {
                Some(Value::List(ids)) => ids.clone(),
                _ => panic!("missing prefix list"),
            };
            assert!(prefix.is_empty());
        }
        other => panic!("expected RESULT, got {:?}", other.name()),
    }

    caller
        .send(Message::Call(
            101,
            Dict::new(),
            URI::new("wamp.registration.lookup"),
            Some(vec![Value::String("nexus.test.endpoint".to_string())]),
            None,
        ))
        .await;
    match caller.recv().await {
        Message::Result(req, _, Some(args), _) => {
            assert_eq!(req, 101);
            assert_eq!(args, vec![Value::UnsignedInteger(exact_regid)]);
        }
        other => panic!("expected RESULT, got {}", other.name()),
    }

    caller
        .send(Message::Call(
            102,
            Dict::new(),
            URI::new("wamp.registration.match"),
            Some(vec![Value::String("nexus.test.endpoint".to_string())]),
            None,
        ))
        .await;
    match caller.recv().await {
        Message::Result(req, _, Some(args), _) => {
            assert_eq!(req, 102);
            assert_eq!(args, vec![Value::UnsignedInteger(exact_regid)]);
        }
        other => panic!("expected RESULT, got {}", other.name()),
    }

    caller
        .send(Message::Call(
            103,
            Dict::new(),
            URI::new("wamp.registration.list_callees"),
            Some(vec![Value::UnsignedInteger(exact_regid)]),
            None,
        ))
        .await;
    match caller.recv().await {
        Message::Result(req, _, Some(args), _) => {
            assert_eq!(req, 103);
            assert_eq!(args, vec![Value::List(vec![Value::UnsignedInteger(callee_sid)])]);
        }
        other => panic!("expected RESULT, got {}", other.name()),
    }

    caller
        .send(Message::Call(
            104,
            Dict::new(),
            URI::new("wamp.registration.count_callees"),
            Some(vec![Value::UnsignedInteger(exact_regid)]),
            None,
        ))
        .await;
    match caller.recv().await {
        Message::Result(req, _, Some(args), _) => {
            assert_eq!(req, 104);
            assert_eq!(args, vec![Value::UnsignedInteger(1)]);
        }
        other => panic!("expected RESULT, got {}", other.name()),
    }
}

#[tokio::test]
async fn pubsub_delivers_to_every_subscriber_on_a_shared_topic() {
    let router = new_router();
    let first = attach(&router, REALM).await;
    welcome_sid(&first).await;
    let second = attach(&router, REALM).await;
    welcome_sid(&second).await;
    let publisher = attach(&router, REALM).await;
    welcome_sid(&publisher).await;

    first
        .send(Message::Subscribe(1, Dict::new(), URI::new("some.uri")))
        .await;
    let first_subid = match first.recv().await {
        Message::Subscribed(_, subid) => subid,
        other => panic!("expected SUBSCRIBED, got {}", other.name()),
    };

    second
        .send(Message::Subscribe(1, Dict::new(), URI::new("some.uri")))
        .await;
    let second_subid = match second.recv().await {
        Message::Subscribed(_, subid) => subid,
        other => panic!("expected SUBSCRIBED, got {}", other.name()),
    };
    assert_eq!(
        first_subid, second_subid,
        "both sessions share one subscription object for the same (topic, match)"
    );

    publisher
        .send(Message::Publish(2, Dict::new(), URI::new("some.uri"), None, None))
        .await;

    match first.recv().await {
        Message::Event(subid, ..) => assert_eq!(subid, first_subid),
        other => panic!("expected EVENT for first subscriber, got {}", other.name()),
    }
    match second.recv().await {
        Message::Event(subid, ..) => assert_eq!(subid, second_subid),
        other => panic!("expected EVENT for second subscriber, got {}", other.name()),
    }
}

#[tokio::test]
async fn registration_lookup_is_exact_but_match_falls_back_to_prefix() {
    let router = new_router();
    let callee = attach(&router, REALM).await;
    welcome_sid(&callee).await;
    let caller = attach(&router, REALM).await;
    welcome_sid(&caller).await;

    let mut prefix_options = Dict::new();
    prefix_options.insert("match".to_string(), Value::String("prefix".to_string()));
    callee
        .send(Message::Register(1, prefix_options, URI::new("com.example")))
        .await;
    let prefix_regid = match callee.recv().await {
        Message::Registered(_, regid) => regid,
        other => panic!("expected REGISTERED, got {}", other.name()),
    };

    caller
        .send(Message::Call(
            10,
            Dict::new(),
            URI::new("wamp.registration.lookup"),
            Some(vec![Value::String("com.example.foo".to_string())]),
            None,
        ))
        .await;
    match caller.recv().await {
        Message::Result(req, _, args, _) => {
            assert_eq!(req, 10);
            assert_eq!(
                args, None,
                "exact lookup of an uncovered uri must not fall back to the prefix registration"
            );
        }
        other => panic!("expected RESULT, got {}", other.name()),
    }

    caller
        .send(Message::Call(
            11,
            Dict::new(),
            URI::new("wamp.registration.match"),
            Some(vec![Value::String("com.example.foo".to_string())]),
            None,
        ))
        .await;
    match caller.recv().await {
        Message::Result(req, _, Some(args), _) => {
            assert_eq!(req, 11);
            assert_eq!(args, vec![Value::UnsignedInteger(prefix_regid)]);
        }
        other => panic!("expected RESULT, got {}", other.name()),
    }
}
