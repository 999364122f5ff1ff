//! The meta-procedure backend spec.md §4.5/§9 describes: a reserved
//! pseudo-session whose "callee" is this module's synchronous dispatcher
//! rather than a peer, so ordinary CALL routing through the dealer's
//! registration table reaches it uniformly with any other registration.

use std::collections::HashMap;

use crate::messages::Reason;
use crate::{CallError, CallResult, Dict, InvocationPolicy, List, MatchingPolicy, Value, ID, URI};

use crate::dealer::Dealer;
use crate::realm::SessionSnapshot;

/// Session id reserved for the meta-callee. Real sessions draw from
/// `[1, 2^53)` (`random_id()`), so `0` can never collide with one.
pub const META_SESSION_ID: ID = 0;

/// Every procedure URI the meta-callee answers, registered on
/// [`META_SESSION_ID`] when a realm is constructed so
/// `wamp.registration.list`/`.get`/etc. see them like any other
/// registration.
pub const PROCEDURES: &[&str] = &[
    "wamp.session.count",
    "wamp.session.list",
    "wamp.session.get",
    "wamp.registration.list",
    "wamp.registration.lookup",
    "wamp.registration.match",
    "wamp.registration.get",
    "wamp.registration.list_callees",
    "wamp.registration.count_callees",
];

/// Registers every entry in [`PROCEDURES`] against the meta session so
/// `Dealer::call` dispatches them exactly like a user registration.
pub fn register_all(dealer: &mut Dealer) {
    for uri in PROCEDURES {
        dealer
            .register(META_SESSION_ID, &Dict::new(), URI::new(uri))
            .expect("meta procedure registration cannot collide at realm construction");
    }
}

fn policy_str(policy: MatchingPolicy) -> &'static str {
    match policy {
        MatchingPolicy::Strict => "exact",
        MatchingPolicy::Prefix => "prefix",
        MatchingPolicy::Wildcard => "wildcard",
    }
}

fn invoke_str(policy: InvocationPolicy) -> &'static str {
    match policy {
        InvocationPolicy::Single => "single",
        InvocationPolicy::RoundRobin => "roundrobin",
        InvocationPolicy::Random => "random",
        InvocationPolicy::First => "first",
        InvocationPolicy::Last => "last",
    }
}

fn arg_id(args: &Option<List>, index: usize) -> CallResult<ID> {
    match args.as_ref().and_then(|a| a.get(index)) {
        Some(Value::UnsignedInteger(id)) => Ok(*id),
        Some(Value::Integer(id)) if *id >= 0 => Ok(*id as ID),
        _ => Err(CallError::new(
            Reason::InvalidArgument,
            Some(vec![Value::String(format!(
                "expected an id argument at position {}",
                index
            ))]),
            None,
        )),
    }
}

fn arg_uri(args: &Option<List>, index: usize) -> CallResult<URI> {
    match args.as_ref().and_then(|a| a.get(index)) {
        Some(Value::String(uri)) => Ok(URI::new(uri)),
        _ => Err(CallError::new(
            Reason::InvalidArgument,
            Some(vec![Value::String(format!(
                "expected a uri argument at position {}",
                index
            ))]),
            None,
        )),
    }
}

/// Reads the optional `{match: "exact"|"prefix"|"wildcard"}` options dict
/// `wamp.registration.lookup(uri, options?)` takes as its second
/// positional argument, defaulting to `exact` when absent.
fn arg_match_policy(args: &Option<List>, index: usize) -> MatchingPolicy {
    match args.as_ref().and_then(|a| a.get(index)) {
        Some(Value::Dict(options)) => match options.get("match") {
            Some(Value::String(mode)) => MatchingPolicy::from_option(Some(mode.as_str())),
            _ => MatchingPolicy::Strict,
        },
        _ => MatchingPolicy::Strict,
    }
}

/// Resolves one meta-procedure CALL against the realm's live session
/// table and dealer state, returning the `(args, kwargs)` RESULT payload
/// or the `CallError` to surface as ERROR.
pub fn dispatch(
    procedure: &str,
    args: Option<List>,
    sessions: &[SessionSnapshot],
    dealer: &Dealer,
) -> CallResult<(Option<List>, Option<Dict>)> {
    match procedure {
        "wamp.session.count" => {
            let count = sessions.iter().filter(|s| s.id != META_SESSION_ID).count();
            Ok((Some(vec![Value::UnsignedInteger(count as u64)]), None))
        }
        "wamp.session.list" => {
            let ids = sessions
                .iter()
                .filter(|s| s.id != META_SESSION_ID)
                .map(|s| Value::UnsignedInteger(s.id))
                .collect();
            Ok((Some(vec![Value::List(ids)]), None))
        }
        "wamp.session.get" => {
            let sid = arg_id(&args, 0)?;
            let session = sessions
                .iter()
                .find(|s| s.id == sid)
                .ok_or_else(|| CallError::new(Reason::NoSuchSession, None, None))?;
            let mut dict = HashMap::new();
            dict.insert("session".to_string(), Value::UnsignedInteger(session.id));
            dict.insert(
                "authid".to_string(),
                Value::String(session.authid.clone()),
            );
            dict.insert(
                "authrole".to_string(),
                Value::String(session.authrole.clone()),
            );
            dict.insert(
                "authmethod".to_string(),
                Value::String(session.authmethod.clone()),
            );
            dict.insert(
                "authprovider".to_string(),
                Value::String(session.authprovider.clone()),
            );
            Ok((None, Some(dict)))
        }
        "wamp.registration.list" => {
            let mut dict = HashMap::new();
            for policy in [
                MatchingPolicy::Strict,
                MatchingPolicy::Prefix,
                MatchingPolicy::Wildcard,
            ] {
                let ids = dealer
                    .registration_ids_by_policy(policy)
                    .into_iter()
                    .map(Value::UnsignedInteger)
                    .collect();
                let key = match policy {
                    MatchingPolicy::Strict => "exact",
                    MatchingPolicy::Prefix => "prefix",
                    MatchingPolicy::Wildcard => "wildcard",
                };
                dict.insert(key.to_string(), Value::List(ids));
            }
            Ok((None, Some(dict)))
        }
        "wamp.registration.lookup" => {
            let uri = arg_uri(&args, 0)?;
            let policy = arg_match_policy(&args, 1);
            match dealer.lookup_exact(&uri, policy) {
                Some(id) => Ok((Some(vec![Value::UnsignedInteger(id)]), None)),
                None => Ok((None, None)),
            }
        }
        "wamp.registration.match" => {
            let uri = arg_uri(&args, 0)?;
            match dealer.match_registration(&uri) {
                Some(id) => Ok((Some(vec![Value::UnsignedInteger(id)]), None)),
                None => Ok((None, None)),
            }
        }
        "wamp.registration.get" => {
            let regid = arg_id(&args, 0)?;
            let (uri, policy, invoke, created) = dealer
                .registration_details(regid)
                .ok_or_else(|| CallError::new(Reason::NoSuchRegistration, None, None))?;
            let mut dict = HashMap::new();
            dict.insert("id".to_string(), Value::UnsignedInteger(regid));
            dict.insert("created".to_string(), Value::UnsignedInteger(created));
            dict.insert("uri".to_string(), Value::String(uri));
            dict.insert(
                "match".to_string(),
                Value::String(policy_str(policy).to_string()),
            );
            dict.insert(
                "invoke".to_string(),
                Value::String(invoke_str(invoke).to_string()),
            );
            Ok((None, Some(dict)))
        }
        "wamp.registration.list_callees" => {
            let regid = arg_id(&args, 0)?;
            if dealer.registration_uri(regid).is_none() {
                return Err(CallError::new(Reason::NoSuchRegistration, None, None));
            }
            let callees = dealer
                .callees_for(regid)
                .into_iter()
                .map(Value::UnsignedInteger)
                .collect();
            Ok((Some(vec![Value::List(callees)]), None))
        }
        "wamp.registration.count_callees" => {
            let regid = arg_id(&args, 0)?;
            if dealer.registration_uri(regid).is_none() {
                return Err(CallError::new(Reason::NoSuchRegistration, None, None));
            }
            let count = dealer.callees_for(regid).len();
            Ok((Some(vec![Value::UnsignedInteger(count as u64)]), None))
        }
        _ => Err(CallError::new(Reason::NoSuchProcedure, None, None)),
    }
}
