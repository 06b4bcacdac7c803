//! Plan catalogue and provider status vocabulary
//!
//! Everything a subscription can be sold as: the plan family, the billing
//! interval, and the closed set of combined tier identifiers that checkout
//! links and older subscriptions carry in their metadata.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Plan family a studio is subscribed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    #[default]
    Starter,
    Pro,
    Founder,
    Elite,
    Studio,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Starter => "starter",
            Plan::Pro => "pro",
            Plan::Founder => "founder",
            Plan::Elite => "elite",
            Plan::Studio => "studio",
        }
    }

    /// Parse a plan name. Unknown names yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Some(Plan::Free),
            "starter" => Some(Plan::Starter),
            "pro" => Some(Plan::Pro),
            "founder" => Some(Plan::Founder),
            "elite" => Some(Plan::Elite),
            "studio" => Some(Plan::Studio),
            _ => None,
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Billing interval for a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    #[default]
    Monthly,
    Annual,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Monthly => "monthly",
            BillingInterval::Annual => "annual",
        }
    }

    /// Parse an interval, accepting the provider's `month`/`year` spellings
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "monthly" | "month" => Some(BillingInterval::Monthly),
            "annual" | "yearly" | "year" => Some(BillingInterval::Annual),
            _ => None,
        }
    }
}

impl fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Combined plan + interval identifier used by legacy checkout links.
///
/// There is no monthly founder tier: the founder offer is annual only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    StarterMonthly,
    StarterAnnual,
    ProMonthly,
    ProAnnual,
    FounderAnnual,
    EliteMonthly,
    EliteAnnual,
    StudioMonthly,
    StudioAnnual,
}

impl Tier {
    pub const ALL: [Tier; 9] = [
        Tier::StarterMonthly,
        Tier::StarterAnnual,
        Tier::ProMonthly,
        Tier::ProAnnual,
        Tier::FounderAnnual,
        Tier::EliteMonthly,
        Tier::EliteAnnual,
        Tier::StudioMonthly,
        Tier::StudioAnnual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::StarterMonthly => "starter_monthly",
            Tier::StarterAnnual => "starter_annual",
            Tier::ProMonthly => "pro_monthly",
            Tier::ProAnnual => "pro_annual",
            Tier::FounderAnnual => "founder_annual",
            Tier::EliteMonthly => "elite_monthly",
            Tier::EliteAnnual => "elite_annual",
            Tier::StudioMonthly => "studio_monthly",
            Tier::StudioAnnual => "studio_annual",
        }
    }

    /// Parse a tier identifier. Anything outside the closed set yields `None`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        Tier::ALL.into_iter().find(|tier| tier.as_str() == s)
    }

    pub fn plan(&self) -> Plan {
        match self {
            Tier::StarterMonthly | Tier::StarterAnnual => Plan::Starter,
            Tier::ProMonthly | Tier::ProAnnual => Plan::Pro,
            Tier::FounderAnnual => Plan::Founder,
            Tier::EliteMonthly | Tier::EliteAnnual => Plan::Elite,
            Tier::StudioMonthly | Tier::StudioAnnual => Plan::Studio,
        }
    }

    pub fn interval(&self) -> BillingInterval {
        match self {
            Tier::StarterMonthly | Tier::ProMonthly | Tier::EliteMonthly | Tier::StudioMonthly => {
                BillingInterval::Monthly
            }
            Tier::StarterAnnual
            | Tier::ProAnnual
            | Tier::FounderAnnual
            | Tier::EliteAnnual
            | Tier::StudioAnnual => BillingInterval::Annual,
        }
    }
}

/// Subscription status as reported by the payment provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
    IncompleteExpired,
    Paused,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "trialing" => Some(SubscriptionStatus::Trialing),
            "past_due" => Some(SubscriptionStatus::PastDue),
            // Stripe has used both spellings historically
            "canceled" | "cancelled" => Some(SubscriptionStatus::Canceled),
            "unpaid" => Some(SubscriptionStatus::Unpaid),
            "incomplete" => Some(SubscriptionStatus::Incomplete),
            "incomplete_expired" => Some(SubscriptionStatus::IncompleteExpired),
            "paused" => Some(SubscriptionStatus::Paused),
            _ => None,
        }
    }

    /// Statuses under which a founder seat may be claimed
    pub fn allows_founder_claim(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
