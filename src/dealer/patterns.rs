//! Trie of registration patterns, keyed by the `.`-separated components of
//! a procedure URI.
//!
//! Ported from the teacher's `router/rpc/patterns.rs` `RegistrationPatternNode`,
//! generalized to a bare session [`ID`] registrant, with one deliberate
//! redesign: `get_registrant_for` now resolves candidates in three
//! completely separate passes (exact, then longest prefix, then wildcard)
//! instead of the teacher's single recursive descent that tries the exact
//! child edge and the wildcard child edge together before falling back to
//! a shallower prefix. That merged traversal can return a wildcard match
//! before a prefix match registered at a shallower node is even
//! considered, which violates the required `exact > prefix > wildcard`
//! precedence. See `DESIGN.md` for the worked example.
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};

use itertools::Itertools;
use rand::seq::SliceRandom;
use rand::thread_rng;

use crate::messages::Reason;
use crate::{random_id, InvocationPolicy, MatchingPolicy, ID, URI};

/// Contains a trie corresponding to the registration patterns that callees
/// have requested.
pub struct RegistrationPatternNode<P: PatternData> {
    edges: HashMap<String, RegistrationPatternNode<P>>,
    connections: ProcedureCollection<P>,
    prefix_connections: ProcedureCollection<P>,
    id: ID,
    prefix_id: ID,
}

/// Represents data that a pattern trie will hold.
pub trait PatternData {
    fn get_id(&self) -> ID;
}

impl PatternData for ID {
    fn get_id(&self) -> ID {
        *self
    }
}

struct DataWrapper<P: PatternData> {
    registrant: P,
    policy: MatchingPolicy,
}

struct ProcedureCollection<P: PatternData> {
    invocation_policy: InvocationPolicy,
    round_robin_counter: RefCell<usize>,
    procedures: Vec<DataWrapper<P>>,
}

/// Represents an error caused during adding or removing patterns.
#[derive(Debug)]
pub struct PatternError {
    reason: Reason,
}

impl PatternError {
    #[inline]
    pub fn new(reason: Reason) -> PatternError {
        PatternError { reason }
    }

    pub fn reason(self) -> Reason {
        self.reason
    }
}

impl<P: PatternData> Debug for RegistrationPatternNode<P> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.fmt_with_indent(f, 0)
    }
}

impl<P: PatternData> Default for RegistrationPatternNode<P> {
    fn default() -> RegistrationPatternNode<P> {
        RegistrationPatternNode::new()
    }
}

impl<P: PatternData> ProcedureCollection<P> {
    fn new() -> ProcedureCollection<P> {
        ProcedureCollection {
            invocation_policy: InvocationPolicy::Single,
            round_robin_counter: RefCell::new(0),
            procedures: Vec::new(),
        }
    }

    fn add_procedure(
        &mut self,
        registrant: P,
        matching_policy: MatchingPolicy,
        invocation_policy: InvocationPolicy,
    ) -> Result<(), PatternError> {
        if self.procedures.is_empty()
            || (invocation_policy == self.invocation_policy
                && invocation_policy != InvocationPolicy::Single)
        {
            self.procedures.push(DataWrapper {
                registrant,
                policy: matching_policy,
            });
            self.invocation_policy = invocation_policy;
            Ok(())
        } else {
            Err(PatternError::new(Reason::ProcedureAlreadyExists))
        }
    }

    fn remove_procedure(&mut self, registrant_id: ID) {
        self.procedures
            .retain(|sub| sub.registrant.get_id() != registrant_id);
    }

    fn get_entry(&self) -> Option<&DataWrapper<P>> {
        match self.invocation_policy {
            InvocationPolicy::Single | InvocationPolicy::First => self.procedures.first(),
            InvocationPolicy::Last => self.procedures.last(),
            InvocationPolicy::Random => self.procedures.choose(&mut thread_rng()),
            InvocationPolicy::RoundRobin => {
                let mut counter = self.round_robin_counter.borrow_mut();
                if *counter >= self.procedures.len() {
                    *counter = 0
                }
                let result = self.procedures.get(*counter);
                *counter += 1;
                result
            }
        }
    }
}

impl<P: PatternData> RegistrationPatternNode<P> {
    fn fmt_with_indent(&self, f: &mut Formatter<'_>, indent: usize) -> fmt::Result {
        writeln!(
            f,
            "{} pre: {:?} subs: {:?}",
            self.id,
            self.prefix_connections
                .procedures
                .iter()
                .map(|sub| sub.registrant.get_id())
                .join(","),
            self.connections
                .procedures
                .iter()
                .map(|sub| sub.registrant.get_id())
                .join(",")
        )?;
        for (chunk, node) in &self.edges {
            for _ in 0..indent * 2 {
                write!(f, "  ")?;
            }
            write!(f, "{} - ", chunk)?;
            node.fmt_with_indent(f, indent + 1)?;
        }
        Ok(())
    }

    /// Constructs a new `RegistrationPatternNode` to be used as the root of
    /// the trie.
    #[inline]
    pub fn new() -> RegistrationPatternNode<P> {
        RegistrationPatternNode {
            edges: HashMap::new(),
            connections: ProcedureCollection::new(),
            prefix_connections: ProcedureCollection::new(),
            id: random_id(),
            prefix_id: random_id(),
        }
    }

    /// Adds a new registration to the pattern trie with the given pattern
    /// and matching policy.
    pub fn register_with(
        &mut self,
        topic: &URI,
        registrant: P,
        matching_policy: MatchingPolicy,
        invocation_policy: InvocationPolicy,
    ) -> Result<ID, PatternError> {
        let mut uri_bits = topic.uri.split('.');
        let initial = match uri_bits.next() {
            Some(initial) => initial,
            None => return Err(PatternError::new(Reason::InvalidURI)),
        };
        let edge = self
            .edges
            .entry(initial.to_string())
            .or_insert_with(RegistrationPatternNode::new);
        edge.add_registration(uri_bits, registrant, matching_policy, invocation_policy)
    }

    /// Removes a registration from the pattern trie.
    pub fn unregister_with(
        &mut self,
        topic: &str,
        registrant: &P,
        is_prefix: bool,
    ) -> Result<ID, PatternError> {
        let uri_bits = topic.split('.');
        self.remove_registration(uri_bits, registrant.get_id(), is_prefix)
    }

    /// Finds the registrant to dispatch a CALL for `procedure` to,
    /// resolving exact matches ahead of prefix matches ahead of wildcard
    /// matches.
    pub fn get_registrant_for(
        &self,
        procedure: &URI,
    ) -> Result<(&P, ID, MatchingPolicy), PatternError> {
        let bits: Vec<&str> = procedure.uri.split('.').collect();
        if let Some((entry, id)) = self.find_exact(&bits, 0) {
            return Ok((&entry.registrant, id, entry.policy));
        }
        if let Some((entry, id)) = self.find_prefix(&bits, 0) {
            return Ok((&entry.registrant, id, entry.policy));
        }
        if let Some((entry, id)) = self.find_wildcard(&bits, 0) {
            return Ok((&entry.registrant, id, entry.policy));
        }
        Err(PatternError::new(Reason::NoSuchProcedure))
    }

    fn add_registration<'a, I>(
        &mut self,
        mut uri_bits: I,
        registrant: P,
        matching_policy: MatchingPolicy,
        invocation_policy: InvocationPolicy,
    ) -> Result<ID, PatternError>
    where
        I: Iterator<Item = &'a str>,
    {
        match uri_bits.next() {
            Some(uri_bit) => {
                if uri_bit.is_empty() && matching_policy != MatchingPolicy::Wildcard {
                    return Err(PatternError::new(Reason::InvalidURI));
                }
                let edge = self
                    .edges
                    .entry(uri_bit.to_string())
                    .or_insert_with(RegistrationPatternNode::new);
                edge.add_registration(uri_bits, registrant, matching_policy, invocation_policy)
            }
            None => {
                if matching_policy == MatchingPolicy::Prefix {
                    self.prefix_connections.add_procedure(
                        registrant,
                        matching_policy,
                        invocation_policy,
                    )?;
                    Ok(self.prefix_id)
                } else {
                    self.connections.add_procedure(
                        registrant,
                        matching_policy,
                        invocation_policy,
                    )?;
                    Ok(self.id)
                }
            }
        }
    }

    fn remove_registration<'a, I>(
        &mut self,
        mut uri_bits: I,
        registrant_id: ID,
        is_prefix: bool,
    ) -> Result<ID, PatternError>
    where
        I: Iterator<Item = &'a str>,
    {
        match uri_bits.next() {
            Some(uri_bit) => {
                if let Some(edge) = self.edges.get_mut(uri_bit) {
                    edge.remove_registration(uri_bits, registrant_id, is_prefix)
                } else {
                    Err(PatternError::new(Reason::InvalidURI))
                }
            }
            None => {
                if is_prefix {
                    self.prefix_connections.remove_procedure(registrant_id);
                    Ok(self.prefix_id)
                } else {
                    self.connections.remove_procedure(registrant_id);
                    Ok(self.id)
                }
            }
        }
    }

    fn find_exact(&self, bits: &[&str], depth: usize) -> Option<(&DataWrapper<P>, ID)> {
        if depth == bits.len() {
            return self
                .connections
                .get_entry()
                .filter(|e| e.policy == MatchingPolicy::Strict)
                .map(|e| (e, self.id));
        }
        self.edges
            .get(bits[depth])
            .and_then(|child| child.find_exact(bits, depth + 1))
    }

    /// Prefers the longest (deepest) prefix registration that covers
    /// `bits`, matching the WAMP convention that a more specific prefix
    /// wins over a shorter one.
    fn find_prefix(&self, bits: &[&str], depth: usize) -> Option<(&DataWrapper<P>, ID)> {
        if depth < bits.len() {
            if let Some(child) = self.edges.get(bits[depth]) {
                if let Some(found) = child.find_prefix(bits, depth + 1) {
                    return Some(found);
                }
            }
        }
        self.prefix_connections
            .get_entry()
            .map(|e| (e, self.prefix_id))
    }

    fn find_wildcard(&self, bits: &[&str], depth: usize) -> Option<(&DataWrapper<P>, ID)> {
        if depth == bits.len() {
            return self
                .connections
                .get_entry()
                .filter(|e| e.policy == MatchingPolicy::Wildcard)
                .map(|e| (e, self.id));
        }
        if let Some(child) = self.edges.get(bits[depth]) {
            if let Some(found) = child.find_wildcard(bits, depth + 1) {
                return Some(found);
            }
        }
        if let Some(child) = self.edges.get("") {
            if let Some(found) = child.find_wildcard(bits, depth + 1) {
                return Some(found);
            }
        }
        None
    }
}

#[cfg(test)]
mod test {
    use super::{PatternData, RegistrationPatternNode};
    use crate::{InvocationPolicy, MatchingPolicy, ID, URI};

    #[derive(Clone)]
    struct MockData {
        id: ID,
    }

    impl PatternData for MockData {
        fn get_id(&self) -> ID {
            self.id
        }
    }
    impl MockData {
        pub fn new(id: ID) -> MockData {
            MockData { id }
        }
    }

    #[test]
    fn exact_beats_prefix_and_wildcard() {
        let mut root = RegistrationPatternNode::new();
        let exact_id = root
            .register_with(
                &URI::new("com.example.test.specific.topic"),
                MockData::new(1),
                MatchingPolicy::Strict,
                InvocationPolicy::Single,
            )
            .unwrap();
        root.register_with(
            &URI::new("com.example.test"),
            MockData::new(2),
            MatchingPolicy::Prefix,
            InvocationPolicy::Single,
        )
        .unwrap();
        root.register_with(
            &URI::new("com.example.test..topic"),
            MockData::new(3),
            MatchingPolicy::Wildcard,
            InvocationPolicy::Single,
        )
        .unwrap();

        assert_eq!(
            root.get_registrant_for(&URI::new("com.example.test.specific.topic"))
                .unwrap()
                .1,
            exact_id
        );
    }

    #[test]
    fn prefix_beats_wildcard_when_both_would_match() {
        let mut root = RegistrationPatternNode::new();
        let prefix_id = root
            .register_with(
                &URI::new("com.example.test"),
                MockData::new(1),
                MatchingPolicy::Prefix,
                InvocationPolicy::Single,
            )
            .unwrap();
        root.register_with(
            &URI::new("com.example.test..topic"),
            MockData::new(2),
            MatchingPolicy::Wildcard,
            InvocationPolicy::Single,
        )
        .unwrap();

        assert_eq!(
            root.get_registrant_for(&URI::new("com.example.test.another.topic"))
                .unwrap()
                .1,
            prefix_id
        );
    }

    #[test]
    fn wildcard_used_only_when_nothing_else_matches() {
        let mut root = RegistrationPatternNode::new();
        let wildcard_id = root
            .register_with(
                &URI::new("com.example.test..topic"),
                MockData::new(1),
                MatchingPolicy::Wildcard,
                InvocationPolicy::Single,
            )
            .unwrap();

        assert_eq!(
            root.get_registrant_for(&URI::new("com.example.test.another.topic"))
                .unwrap()
                .1,
            wildcard_id
        );
        assert!(root
            .get_registrant_for(&URI::new("com.example.test.another.other"))
            .is_err());
    }

    #[test]
    fn removing_registrations() {
        let connection1 = MockData::new(1);
        let connection2 = MockData::new(2);
        let mut root = RegistrationPatternNode::new();

        let ids = [
            root.register_with(
                &URI::new("com.example.test.specific.topic"),
                connection1.clone(),
                MatchingPolicy::Strict,
                InvocationPolicy::Single,
            )
            .unwrap(),
            root.register_with(
                &URI::new("com.example.test"),
                connection2.clone(),
                MatchingPolicy::Prefix,
                InvocationPolicy::Single,
            )
            .unwrap(),
        ];

        root.unregister_with(
            "com.example.test.specific.topic",
            &connection1,
            false,
        )
        .unwrap();

        assert_eq!(
            root.get_registrant_for(&URI::new("com.example.test.specific.topic"))
                .unwrap()
                .1,
            ids[1]
        );
    }
}
