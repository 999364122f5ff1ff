//! RPC routing: REGISTER/UNREGISTER/CALL/INVOCATION/YIELD/ERROR/CANCEL/
//! INTERRUPT, generalized from the teacher's `ConnectionHandler::
//! handle_register/handle_unregister/handle_call/handle_yield`
//! (`router/rpc/mod.rs`) the same way `broker::Broker` generalizes the
//! PubSub handlers: this type only computes what to send, the realm does
//! the actual async delivery.
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use crate::messages::Reason;
use crate::{CallError, Dict, ErrorType, InvocationPolicy, List, MatchingPolicy, Options, URI};
use crate::{Message, ID};

mod patterns;
pub use self::patterns::RegistrationPatternNode;

/// A CALL in flight: who called with which request id, and who it was
/// dispatched to, so CANCEL, timeout expiry and session teardown can all
/// find their way back to both ends.
struct PendingCall {
    caller: ID,
    call_request_id: ID,
    callee: ID,
}

pub struct Dealer {
    registrations: RegistrationPatternNode<ID>,
    registration_index: HashMap<ID, (String, MatchingPolicy, InvocationPolicy, u64)>,
    session_registrations: HashMap<ID, Vec<ID>>,
    pending_calls: HashMap<ID, PendingCall>,
    session_pending_calls: HashMap<ID, Vec<ID>>,
    session_invocations: HashMap<ID, Vec<ID>>,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Dealer {
    pub fn new() -> Dealer {
        Dealer {
            registrations: RegistrationPatternNode::new(),
            registration_index: HashMap::new(),
            session_registrations: HashMap::new(),
            pending_calls: HashMap::new(),
            session_pending_calls: HashMap::new(),
            session_invocations: HashMap::new(),
        }
    }

    pub fn register(&mut self, sid: ID, options: &Dict, procedure: URI) -> Result<ID, CallError> {
        let matching_policy = MatchingPolicy::from_option(options.as_str("match"));
        let invocation_policy = InvocationPolicy::from_option(options.as_str("invoke"));
        let registration_id = self
            .registrations
            .register_with(&procedure, sid, matching_policy, invocation_policy)
            .map_err(|e| CallError::new(e.reason(), None, None))?;
        debug!(
            "session {} registered {} ({})",
            sid, procedure.uri, registration_id
        );
        self.registration_index.insert(
            registration_id,
            (procedure.uri, matching_policy, invocation_policy, now_unix()),
        );
        self.session_registrations
            .entry(sid)
            .or_default()
            .push(registration_id);
        Ok(registration_id)
    }

    /// Fails with `wamp.error.no_such_registration` if `sid` doesn't hold
    /// `registration_id` (spec.md §4.4). A registration shared by several
    /// callees (RoundRobin/Random/First/Last) only disappears from the
    /// index once its last callee unregisters.
    pub fn unregister(&mut self, sid: ID, registration_id: ID) -> Result<(), CallError> {
        let owned = self
            .session_registrations
            .get(&sid)
            .map(|regs| regs.contains(&registration_id))
            .unwrap_or(false);
        if !owned {
            return Err(CallError::new(Reason::NoSuchRegistration, None, None));
        }
        let (uri, policy, ..) = self.registration_index[&registration_id].clone();
        self.registrations
            .unregister_with(&uri, &sid, policy == MatchingPolicy::Prefix)
            .map_err(|e| CallError::new(e.reason(), None, None))?;
        if let Some(regs) = self.session_registrations.get_mut(&sid) {
            regs.retain(|id| *id != registration_id);
        }
        if self.callees_for(registration_id).is_empty() {
            self.registration_index.remove(&registration_id);
        }
        Ok(())
    }

    /// Resolves a CALL to an INVOCATION addressed at the chosen callee,
    /// recording enough state to route the matching YIELD/ERROR/CANCEL
    /// back.
    pub fn call(
        &mut self,
        caller: ID,
        call_request_id: ID,
        invocation_id: ID,
        procedure: &URI,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) -> Result<(ID, Message), CallError> {
        let (callee, registration_id, policy) = self
            .registrations
            .get_registrant_for(procedure)
            .map_err(|e| CallError::new(e.reason(), None, None))?;
        let callee = *callee;
        let mut details = Dict::new();
        if policy != MatchingPolicy::Strict {
            details.insert(
                "procedure".to_string(),
                crate::Value::String(procedure.uri.clone()),
            );
        }
        self.pending_calls.insert(
            invocation_id,
            PendingCall {
                caller,
                call_request_id,
                callee,
            },
        );
        self.session_pending_calls
            .entry(caller)
            .or_default()
            .push(invocation_id);
        self.session_invocations
            .entry(callee)
            .or_default()
            .push(invocation_id);
        Ok((
            callee,
            Message::Invocation(invocation_id, registration_id, details, args, kwargs),
        ))
    }

    /// Completes a pending call with a YIELD, returning the caller to
    /// reply to and the RESULT message to send. A `progress` YIELD leaves
    /// the invocation open for further YIELDs instead of completing it.
    pub fn yield_(
        &mut self,
        invocation_id: ID,
        options: &Dict,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) -> Option<(ID, Message)> {
        if options.as_bool("progress") {
            let pending = self.pending_calls.get(&invocation_id)?;
            return Some((
                pending.caller,
                Message::Result(pending.call_request_id, Dict::new(), args, kwargs),
            ));
        }
        let pending = self.complete(invocation_id)?;
        Some((
            pending.caller,
            Message::Result(pending.call_request_id, Dict::new(), args, kwargs),
        ))
    }

    /// Completes a pending call with an ERROR from the callee, returning
    /// the caller to reply to and the ERROR message to send.
    pub fn error(
        &mut self,
        invocation_id: ID,
        details: Dict,
        reason: Reason,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) -> Option<(ID, Message)> {
        let pending = self.complete(invocation_id)?;
        Some((
            pending.caller,
            Message::Error(
                ErrorType::Call,
                pending.call_request_id,
                details,
                reason,
                args,
                kwargs,
            ),
        ))
    }

    /// A caller asked to CANCEL `call_request_id`; finds the still-pending
    /// invocation it maps to (if any) so the realm can forward INTERRUPT
    /// to the callee.
    pub fn find_invocation_for_cancel(&self, caller: ID, call_request_id: ID) -> Option<ID> {
        self.session_pending_calls
            .get(&caller)?
            .iter()
            .copied()
            .find(|id| {
                self.pending_calls
                    .get(id)
                    .map(|p| p.call_request_id == call_request_id)
                    .unwrap_or(false)
            })
    }

    /// Builds the INTERRUPT to send the callee for a CANCEL on
    /// `invocation_id`. With `kill_now` (CANCEL's `killnowait` mode, and
    /// always for timeout expiry) the invocation is destroyed immediately
    /// rather than waiting for the callee's eventual YIELD/ERROR.
    pub fn interrupt_for_cancel(&mut self, invocation_id: ID, kill_now: bool) -> Option<(ID, Message)> {
        let callee = self.pending_calls.get(&invocation_id)?.callee;
        if kill_now {
            self.complete(invocation_id);
        }
        Some((callee, Message::Interrupt(invocation_id, Dict::new())))
    }

    /// A call's deadline elapsed: behaves as `interrupt_for_cancel` with
    /// `kill_now=true`, plus the caller gets an explicit
    /// `wamp.error.canceled` ERROR (spec.md §4.4).
    pub fn timeout(&mut self, invocation_id: ID) -> Option<((ID, Message), (ID, Message))> {
        let pending = self.pending_calls.get(&invocation_id)?;
        let callee = pending.callee;
        let caller = pending.caller;
        let call_request_id = pending.call_request_id;
        self.complete(invocation_id);
        Some((
            (callee, Message::Interrupt(invocation_id, Dict::new())),
            (
                caller,
                Message::Error(
                    ErrorType::Call,
                    call_request_id,
                    Dict::new(),
                    Reason::Canceled,
                    None,
                    None,
                ),
            ),
        ))
    }

    fn complete(&mut self, invocation_id: ID) -> Option<PendingCall> {
        let pending = self.pending_calls.remove(&invocation_id)?;
        if let Some(ids) = self.session_pending_calls.get_mut(&pending.caller) {
            ids.retain(|id| *id != invocation_id);
        }
        if let Some(ids) = self.session_invocations.get_mut(&pending.callee) {
            ids.retain(|id| *id != invocation_id);
        }
        Some(pending)
    }

    /// Drops every registration belonging to a session that just
    /// disconnected, fails every invocation it was the callee of with
    /// `wamp.error.canceled`, and discards every invocation it was the
    /// caller of (INTERRUPTing the callee so it can stop work early).
    /// Returns the messages the realm still needs to deliver.
    pub fn remove_session(&mut self, sid: ID) -> Vec<(ID, Message)> {
        if let Some(regs) = self.session_registrations.remove(&sid) {
            for registration_id in regs {
                if let Some((uri, policy, ..)) = self.registration_index.get(&registration_id).cloned() {
                    self.registrations
                        .unregister_with(&uri, &sid, policy == MatchingPolicy::Prefix)
                        .ok();
                    if self.callees_for(registration_id).is_empty() {
                        self.registration_index.remove(&registration_id);
                    }
                }
            }
        }

        let mut out = Vec::new();
        for invocation_id in self.session_invocations.remove(&sid).unwrap_or_default() {
            if let Some(pending) = self.complete(invocation_id) {
                out.push((
                    pending.caller,
                    Message::Error(
                        ErrorType::Call,
                        pending.call_request_id,
                        Dict::new(),
                        Reason::Canceled,
                        None,
                        None,
                    ),
                ));
            }
        }
        for invocation_id in self.session_pending_calls.remove(&sid).unwrap_or_default() {
            if let Some(pending) = self.complete(invocation_id) {
                out.push((pending.callee, Message::Interrupt(invocation_id, Dict::new())));
            }
        }
        out
    }

    // -- meta-procedure support (spec.md §4.5/§9) --

    pub fn registration_ids_by_policy(&self, policy: MatchingPolicy) -> Vec<ID> {
        self.registration_index
            .iter()
            .filter(|(_, (_, p, ..))| *p == policy)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn registration_uri(&self, registration_id: ID) -> Option<String> {
        self.registration_index
            .get(&registration_id)
            .map(|(uri, ..)| uri.clone())
    }

    /// `(uri, match, invoke, created)` for `wamp.registration.get`.
    pub fn registration_details(
        &self,
        registration_id: ID,
    ) -> Option<(String, MatchingPolicy, InvocationPolicy, u64)> {
        self.registration_index.get(&registration_id).cloned()
    }

    /// Best-match resolution (`exact > prefix > wildcard`), the same
    /// precedence a CALL uses. Backs `wamp.registration.match` and the
    /// realm's meta-call detection.
    pub fn lookup_registration(&self, procedure: &URI) -> Option<ID> {
        self.registrations
            .get_registrant_for(procedure)
            .ok()
            .map(|(_, id, _)| id)
    }

    /// Best-match resolution, exposed under the name `wamp.registration.match`
    /// uses in spec.md §4.5.
    pub fn match_registration(&self, procedure: &URI) -> Option<ID> {
        self.lookup_registration(procedure)
    }

    /// Exact structural lookup against `(uri, match)`, per spec.md §4.2's
    /// `Lookup(uri, mode) -> id?`. Unlike `lookup_registration`/
    /// `match_registration`, this never falls back to a looser match mode:
    /// a prefix registration on `com.example` does not satisfy a lookup
    /// for `com.example.foo` under `match=exact`.
    pub fn lookup_exact(&self, procedure: &URI, policy: MatchingPolicy) -> Option<ID> {
        self.registration_index
            .iter()
            .find(|(_, (uri, p, ..))| *p == policy && *uri == procedure.uri)
            .map(|(id, _)| *id)
    }

    pub fn callees_for(&self, registration_id: ID) -> Vec<ID> {
        self.session_registrations
            .iter()
            .filter(|(_, regs)| regs.contains(&registration_id))
            .map(|(sid, _)| *sid)
            .collect()
    }
}

impl Default for Dealer {
    fn default() -> Dealer {
        Dealer::new()
    }
}
