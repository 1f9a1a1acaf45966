use crate::core::{
    hash::HashSet,
    types::{
        Dictionary,
        Value,
    },
};

/// A role a peer may advertise when establishing a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerRole {
    // Calls RPC endpoints.
    Caller,
    // Registers RPC endpoints.
    Callee,
    // Publishes events to topics.
    Publisher,
    // Subscribes to events for topics.
    Subscriber,
}

impl PeerRole {
    pub fn key_for_details(&self) -> &'static str {
        match self {
            Self::Caller => "caller",
            Self::Callee => "callee",
            Self::Publisher => "publisher",
            Self::Subscriber => "subscriber",
        }
    }
}

/// A role the router may implement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RouterRole {
    // Supports RPC calls.
    Dealer,
    // Supports pub/sub.
    Broker,
}

impl RouterRole {
    pub fn key_for_details(&self) -> &str {
        match self {
            Self::Dealer => "dealer",
            Self::Broker => "broker",
        }
    }

    fn features(&self) -> Dictionary {
        let features: &[&str] = match self {
            Self::Dealer => &[
                "call_canceling",
                "call_timeout",
                "caller_identification",
                "pattern_based_registration",
                "progressive_call_results",
            ],
            Self::Broker => &[
                "pattern_based_subscription",
                "publisher_exclusion",
                "publisher_identification",
                "subscriber_blackwhite_listing",
            ],
        };
        features
            .iter()
            .map(|feature| ((*feature).to_owned(), Value::Bool(true)))
            .collect()
    }
}

/// Builds the `roles` dictionary advertised in WELCOME messages.
pub fn router_roles_details<I>(roles: I) -> Dictionary
where
    I: IntoIterator<Item = RouterRole>,
{
    roles
        .into_iter()
        .map(|role| {
            (
                role.key_for_details().to_owned(),
                Value::Dictionary(Dictionary::from_iter([(
                    "features".to_owned(),
                    Value::Dictionary(role.features()),
                )])),
            )
        })
        .collect()
}

/// The set of roles a peer advertised in its HELLO message.
#[derive(Debug, Default, Clone)]
pub struct PeerRoles {
    roles: HashSet<&'static str>,
}

impl PeerRoles {
    /// Reads the advertised roles out of HELLO details.
    ///
    /// A peer that advertises no roles at all is treated as supporting everything, since several
    /// thin clients skip the roles dictionary entirely.
    pub fn from_details(details: &Dictionary) -> Self {
        let roles = match details.get("roles").and_then(|roles| roles.dictionary()) {
            Some(roles) => roles,
            None => return Self::default(),
        };
        let roles = [
            PeerRole::Caller,
            PeerRole::Callee,
            PeerRole::Publisher,
            PeerRole::Subscriber,
        ]
        .into_iter()
        .filter(|role| roles.contains_key(role.key_for_details()))
        .map(|role| role.key_for_details())
        .collect::<HashSet<_>>();
        Self { roles }
    }

    /// Checks whether the peer advertised the given role.
    pub fn has(&self, role: PeerRole) -> bool {
        self.roles.is_empty() || self.roles.contains(role.key_for_details())
    }
}
