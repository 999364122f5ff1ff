use std::time::Duration;

/// Process-wide router settings.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Outbound peer queue depth before EVENT backpressure kicks in
    /// (spec.md §5). Reliable control replies always block rather than
    /// drop, regardless of this setting.
    pub outbound_queue_depth: usize,
}

impl RouterConfig {
    pub fn new() -> RouterConfig {
        RouterConfig {
            outbound_queue_depth: 128,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> RouterConfig {
        RouterConfig::new()
    }
}

/// Per-realm settings, set at `Router::add_realm` time.
#[derive(Debug, Clone)]
pub struct RealmConfig {
    /// Reject URIs with empty components outside of the wildcard position
    /// a subscription/registration pattern is explicitly allowed to use
    /// (spec.md §4.3/4.5's strict-URI toggle).
    pub strict_uris: bool,
    /// `anonymous` is the only WAMP authmethod this router accepts; when
    /// false, HELLO is always aborted with `wamp.error.authentication_failed`.
    pub anonymous_auth: bool,
    /// Whether `disclose_me` on PUBLISH/CALL is honored at all.
    pub allow_disclose: bool,
    /// Applied to a CALL with no `timeout` option of its own; `None`
    /// means calls never time out unless the caller asks for it.
    pub default_call_timeout: Option<Duration>,
}

impl RealmConfig {
    pub fn new() -> RealmConfig {
        RealmConfig {
            strict_uris: true,
            anonymous_auth: true,
            allow_disclose: true,
            default_call_timeout: None,
        }
    }
}

impl Default for RealmConfig {
    fn default() -> RealmConfig {
        RealmConfig::new()
    }
}
