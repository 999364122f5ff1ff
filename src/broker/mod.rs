//! PubSub routing: SUBSCRIBE/UNSUBSCRIBE/PUBLISH, generalized from the
//! teacher's `ConnectionHandler::handle_subscribe/handle_unsubscribe/
//! handle_publish` (`router/pubsub/mod.rs`) into a realm-owned component
//! that hands back messages to deliver instead of sending them itself,
//! so the caller can do the actual async `PeerHandle::send` after
//! releasing the lock that guards this state.
use std::collections::HashMap;

use log::debug;

use crate::messages::Reason;
use crate::{CallError, Dict, List, MatchingPolicy, Options, URI};
use crate::{Message, ID};

mod patterns;
pub use self::patterns::SubscriptionPatternNode;

pub struct Broker {
    subscriptions: SubscriptionPatternNode<ID>,
    /// `subID -> (topic, match)`, the shared subscription object spec.md
    /// §3 describes. Torn down only once its member set is empty, not on
    /// the first subscriber to leave.
    subscription_index: HashMap<ID, (String, MatchingPolicy)>,
    /// `(topic, match) -> subID`, so a second SUBSCRIBE for the same
    /// pattern finds the existing shared subscription instead of minting
    /// a new one.
    topic_index: HashMap<(String, MatchingPolicy), ID>,
    /// `subID -> subscriber sids`, used both to decide when a subscription
    /// is fully vacated and to enforce "at most once per (topic, match)".
    subscription_members: HashMap<ID, Vec<ID>>,
    session_subscriptions: HashMap<ID, Vec<ID>>,
}

impl Broker {
    pub fn new() -> Broker {
        Broker {
            subscriptions: SubscriptionPatternNode::new(),
            subscription_index: HashMap::new(),
            topic_index: HashMap::new(),
            subscription_members: HashMap::new(),
            session_subscriptions: HashMap::new(),
        }
    }

    /// Joins `sid` to the shared subscription for `(topic, match)`,
    /// creating it if this is the first subscriber. Subscribing again to
    /// the same pattern is idempotent and returns the same `subID`
    /// (spec.md §3: "a session may subscribe at most once per (topic,
    /// match)").
    pub fn subscribe(&mut self, sid: ID, options: &Dict, topic: URI) -> Result<ID, CallError> {
        let policy = MatchingPolicy::from_option(options.as_str("match"));
        let key = (topic.uri.clone(), policy);
        if let Some(&subscription_id) = self.topic_index.get(&key) {
            let members = self.subscription_members.entry(subscription_id).or_default();
            if !members.contains(&sid) {
                members.push(sid);
                self.session_subscriptions
                    .entry(sid)
                    .or_default()
                    .push(subscription_id);
                // The fan-out in `publish` walks the trie, not
                // `subscription_members` — a joining session must be
                // pushed onto the same shared node too, or it never
                // receives an EVENT. `subscribe_with` on an existing
                // (topic, match) pair returns this node's existing id.
                self.subscriptions
                    .subscribe_with(&topic, sid, policy)
                    .map_err(|e| CallError::new(e.reason(), None, None))?;
            }
            return Ok(subscription_id);
        }
        let subscription_id = self
            .subscriptions
            .subscribe_with(&topic, sid, policy)
            .map_err(|e| CallError::new(e.reason(), None, None))?;
        debug!(
            "session {} subscribed to {} ({})",
            sid, topic.uri, subscription_id
        );
        self.subscription_index.insert(subscription_id, key.clone());
        self.topic_index.insert(key, subscription_id);
        self.subscription_members
            .insert(subscription_id, vec![sid]);
        self.session_subscriptions
            .entry(sid)
            .or_default()
            .push(subscription_id);
        Ok(subscription_id)
    }

    /// Leaves `sid` off `subscription_id`'s member set. Fails with
    /// `wamp.error.no_such_subscription` if `sid` never held it, per
    /// spec.md §4.3. The shared subscription object itself is only torn
    /// down once its last member leaves.
    pub fn unsubscribe(&mut self, sid: ID, subscription_id: ID) -> Result<(), CallError> {
        let owned = self
            .subscription_members
            .get(&subscription_id)
            .map(|members| members.contains(&sid))
            .unwrap_or(false);
        if !owned {
            return Err(CallError::new(Reason::NoSuchSubscription, None, None));
        }
        let (topic_uri, policy) = self.subscription_index[&subscription_id].clone();
        self.subscriptions
            .unsubscribe_with(&topic_uri, &sid, policy == MatchingPolicy::Prefix)
            .map_err(|e| CallError::new(e.reason(), None, None))?;
        if let Some(subs) = self.session_subscriptions.get_mut(&sid) {
            subs.retain(|id| *id != subscription_id);
        }
        self.forget_if_vacated(subscription_id, sid, &topic_uri, policy);
        Ok(())
    }

    fn forget_if_vacated(&mut self, subscription_id: ID, sid: ID, topic_uri: &str, policy: MatchingPolicy) {
        let vacated = match self.subscription_members.get_mut(&subscription_id) {
            Some(members) => {
                members.retain(|s| *s != sid);
                members.is_empty()
            }
            None => true,
        };
        if vacated {
            self.subscription_members.remove(&subscription_id);
            self.subscription_index.remove(&subscription_id);
            self.topic_index.remove(&(topic_uri.to_string(), policy));
        }
    }

    /// Resolves a PUBLISH into the set of `(subscriber_sid, EVENT message)`
    /// pairs that need delivering. Honors `exclude_me` (default true),
    /// `exclude`, and `eligible`; discloses the publisher's session id in
    /// EVENT details only when the publisher asked via `disclose_me` and
    /// `allow_disclose` permits it realm-wide.
    pub fn publish(
        &self,
        publisher: ID,
        options: &Dict,
        topic: &URI,
        publication_id: ID,
        args: Option<List>,
        kwargs: Option<Dict>,
        allow_disclose: bool,
    ) -> Vec<(ID, Message)> {
        let exclude_me = !matches!(options.get("exclude_me"), Some(crate::Value::Boolean(false)));
        let exclude = options.as_id_list("exclude").unwrap_or_default();
        let eligible = options.as_id_list("eligible");
        let disclose_me = allow_disclose && options.as_bool("disclose_me");

        let mut out = Vec::new();
        for (subscriber, subscription_id, policy) in self.subscriptions.filter(topic) {
            let subscriber = *subscriber;
            if exclude_me && subscriber == publisher {
                continue;
            }
            if exclude.contains(&subscriber) {
                continue;
            }
            if let Some(ref eligible) = eligible {
                if !eligible.contains(&subscriber) {
                    continue;
                }
            }
            let mut details = Dict::new();
            if policy != MatchingPolicy::Strict {
                details.insert(
                    "topic".to_string(),
                    crate::Value::String(topic.uri.clone()),
                );
            }
            if disclose_me {
                details.insert(
                    "publisher".to_string(),
                    crate::Value::UnsignedInteger(publisher),
                );
            }
            out.push((
                subscriber,
                Message::Event(
                    subscription_id,
                    publication_id,
                    details,
                    args.clone(),
                    kwargs.clone(),
                ),
            ));
        }
        out
    }

    /// Drops every subscription belonging to a session that just
    /// disconnected, tearing down any shared subscription object it was
    /// the last member of.
    pub fn remove_session(&mut self, sid: ID) {
        if let Some(subs) = self.session_subscriptions.remove(&sid) {
            for subscription_id in subs {
                if let Some((topic_uri, policy)) = self.subscription_index.get(&subscription_id).cloned()
                {
                    self.subscriptions
                        .unsubscribe_with(&topic_uri, &sid, policy == MatchingPolicy::Prefix)
                        .ok();
                    self.forget_if_vacated(subscription_id, sid, &topic_uri, policy);
                }
            }
        }
    }
}

impl Default for Broker {
    fn default() -> Broker {
        Broker::new()
    }
}
