use std::collections::HashSet;

use crate::key::Identity;

/// Identity → exempt lookup, consulted before any store access.
///
/// Sits on the hot path of every request, so implementations must answer from
/// local state (a cache or pre-resolved flag), never from a network call.
pub trait BypassPolicy: Send + Sync {
    fn is_exempt(&self, identity: &Identity) -> bool;
}

/// Nobody is exempt
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBypass;

impl BypassPolicy for NoBypass {
    fn is_exempt(&self, _identity: &Identity) -> bool {
        false
    }
}

/// Fixed allow-list loaded from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticBypassList {
    exempt: HashSet<String>,
}

impl StaticBypassList {
    pub fn new<I, S>(identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exempt: identities.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.exempt.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exempt.is_empty()
    }
}

impl BypassPolicy for StaticBypassList {
    fn is_exempt(&self, identity: &Identity) -> bool {
        self.exempt.contains(identity.as_str())
    }
}
