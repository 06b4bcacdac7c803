//! Metadata normalization
//!
//! Provider objects carry a free-form string metadata bag. Checkout links
//! written at different times encode the purchase differently: newer ones
//! set `plan` and `interval` separately, older ones set a single combined
//! `tier`. This module turns either shape into one canonical intent without
//! touching any storage.

use std::collections::HashMap;

use crate::plans::{BillingInterval, Plan, Tier};

/// Free-form metadata attached to provider objects
pub type Metadata = HashMap<String, String>;

/// Where the plan and interval of a [`NormalizedIntent`] came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentSource {
    /// A recognized combined tier identifier
    Tier,
    /// Separate `plan` / `interval` fields
    Explicit,
    /// Nothing usable, fell back to starter monthly
    Default,
}

/// Canonical purchase intent extracted from provider metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedIntent {
    pub user_id: Option<String>,
    pub plan: Plan,
    pub interval: BillingInterval,
    pub tier: Option<Tier>,
    pub source: IntentSource,
    /// Whether `plan` was read from the metadata rather than defaulted
    pub plan_stated: bool,
    /// Whether `interval` was read from the metadata rather than defaulted
    pub interval_stated: bool,
}

impl NormalizedIntent {
    /// Combine with an intent from a more authoritative object (for example a
    /// freshly fetched subscription refining its checkout session).
    ///
    /// A tier on the other object replaces plan and interval together.
    /// Otherwise each field the other object states replaces ours, and a
    /// field it leaves out keeps our value. A user id already known is kept.
    pub fn refined_by(self, other: NormalizedIntent) -> NormalizedIntent {
        let user_id = self.user_id.or(other.user_id);

        if other.source == IntentSource::Tier {
            return NormalizedIntent { user_id, ..other };
        }

        let plan = if other.plan_stated { other.plan } else { self.plan };
        let interval = if other.interval_stated {
            other.interval
        } else {
            self.interval
        };

        // A tier only survives while both of its halves are untouched
        let tier = self
            .tier
            .filter(|t| t.plan() == plan && t.interval() == interval);
        let source = match (tier, self.source, other.source) {
            (Some(_), _, _) => IntentSource::Tier,
            (None, IntentSource::Default, IntentSource::Default) => IntentSource::Default,
            _ => IntentSource::Explicit,
        };

        NormalizedIntent {
            user_id,
            plan,
            interval,
            tier,
            source,
            plan_stated: self.plan_stated || other.plan_stated,
            interval_stated: self.interval_stated || other.interval_stated,
        }
    }
}

/// Normalize a metadata bag plus an optional legacy `tier` field.
///
/// A recognized tier is authoritative over separate plan/interval fields.
/// Unrecognized values never fail; they fall back to starter / monthly.
pub fn normalize(metadata: &Metadata, legacy_tier: Option<&str>) -> NormalizedIntent {
    let user_id = metadata
        .get("user_id")
        .filter(|id| !id.trim().is_empty())
        .cloned();

    let tier = metadata
        .get("tier")
        .and_then(|t| Tier::parse(t))
        .or_else(|| legacy_tier.and_then(Tier::parse));

    if let Some(tier) = tier {
        return NormalizedIntent {
            user_id,
            plan: tier.plan(),
            interval: tier.interval(),
            tier: Some(tier),
            source: IntentSource::Tier,
            plan_stated: true,
            interval_stated: true,
        };
    }

    let plan = metadata.get("plan").and_then(|p| Plan::parse(p));
    let interval = metadata
        .get("interval")
        .or_else(|| metadata.get("billing_interval"))
        .and_then(|i| BillingInterval::parse(i));

    let source = if plan.is_some() || interval.is_some() {
        IntentSource::Explicit
    } else {
        IntentSource::Default
    };

    NormalizedIntent {
        user_id,
        plan: plan.unwrap_or_default(),
        interval: interval.unwrap_or_default(),
        tier: None,
        source,
        plan_stated: plan.is_some(),
        interval_stated: interval.is_some(),
    }
}
