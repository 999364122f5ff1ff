use std::collections::HashMap;

use super::{Dict, Value};

/// The feature set this router advertises in WELCOME.roles.
///
/// Both broker and dealer support pattern-based (prefix/wildcard)
/// subscription and registration, so those features are always on.
pub struct RouterRoles {
    pattern_based_subscription: bool,
    pattern_based_registration: bool,
}

impl RouterRoles {
    #[inline]
    pub fn new() -> RouterRoles {
        RouterRoles {
            pattern_based_subscription: true,
            pattern_based_registration: true,
        }
    }

    /// Builds the `roles` dict embedded in a WELCOME message's details.
    pub fn to_value(&self) -> Value {
        let mut broker_features = HashMap::new();
        broker_features.insert(
            "pattern_based_subscription".to_string(),
            Value::Boolean(self.pattern_based_subscription),
        );
        let mut dealer_features = HashMap::new();
        dealer_features.insert(
            "pattern_based_registration".to_string(),
            Value::Boolean(self.pattern_based_registration),
        );

        let mut broker = HashMap::new();
        broker.insert("features".to_string(), Value::Dict(broker_features));
        let mut dealer = HashMap::new();
        dealer.insert("features".to_string(), Value::Dict(dealer_features));

        let mut roles: Dict = HashMap::new();
        roles.insert("broker".to_string(), Value::Dict(broker));
        roles.insert("dealer".to_string(), Value::Dict(dealer));
        Value::Dict(roles)
    }
}

impl Default for RouterRoles {
    fn default() -> RouterRoles {
        RouterRoles::new()
    }
}
