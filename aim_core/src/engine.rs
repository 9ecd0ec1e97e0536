//! Permission engine.
//!
//! [`decide`] is the pure decision; [`PermissionEngine`] wraps it with the
//! daemon's counters. Elevations are judged against `now` on every call,
//! nothing is cached.

use tokio::time::Instant;

use crate::capability::CapabilitySet;
use crate::principal::Principal;
use crate::stats::Stats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allow
    }
}

/// Whether a decision gates an operation or only answers a query.
///
/// Only mediated denials count towards `denials`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mediation {
    Query,
    Mediated,
}

/// `required ⊆ base ∪ (elevated if now < deadline)`, with ROOT allowing
/// everything and the empty requirement always allowed.
pub fn decide(principal: &Principal, required: CapabilitySet, now: Instant) -> Decision {
    if required.is_empty() || principal.base_caps.contains(CapabilitySet::ROOT) {
        return Decision::Allow;
    }
    if principal.effective_caps(now).contains(required) {
        Decision::Allow
    } else {
        Decision::Deny
    }
}

/// Counting front-end to [`decide`].
#[derive(Debug, Default)]
pub struct PermissionEngine {
    stats: Stats,
}

impl PermissionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evaluate(
        &self,
        principal: &Principal,
        required: CapabilitySet,
        now: Instant,
        mediation: Mediation,
    ) -> Decision {
        self.stats.record_check();
        let decision = decide(principal, required, now);
        if decision == Decision::Deny && mediation == Mediation::Mediated {
            self.stats.record_denial();
        }
        decision
    }

    /// Allow if any one of `alternatives` would be allowed. Counts as a
    /// single check.
    pub fn evaluate_any(
        &self,
        principal: &Principal,
        alternatives: &[CapabilitySet],
        now: Instant,
        mediation: Mediation,
    ) -> Decision {
        self.stats.record_check();
        let allowed = alternatives
            .iter()
            .any(|required| decide(principal, *required, now).is_allowed());
        if allowed {
            return Decision::Allow;
        }
        if mediation == Mediation::Mediated {
            self.stats.record_denial();
        }
        Decision::Deny
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }
}
