//! Webhook wire types
//!
//! Only the fields the reconciler reads are modelled. Unknown fields are
//! ignored so newer provider API versions keep deserializing.

use serde::{Deserialize, Deserializer};

use crate::normalize::Metadata;

/// Event types the reconciler acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    CheckoutSessionCompleted,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    Other(String),
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "checkout.session.completed" => EventKind::CheckoutSessionCompleted,
            "customer.subscription.created" => EventKind::SubscriptionCreated,
            "customer.subscription.updated" => EventKind::SubscriptionUpdated,
            "customer.subscription.deleted" => EventKind::SubscriptionDeleted,
            other => EventKind::Other(other.to_string()),
        }
    }
}

/// Verified webhook event envelope
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix seconds at which the provider created the event
    pub created: i64,
    pub data: WebhookEventData,
}

impl WebhookEvent {
    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.event_type)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

/// A reference that the provider sends either as a bare id or, when
/// expanded, as the full object
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ExpandableId {
    Id(String),
    Object { id: String },
}

impl ExpandableId {
    pub fn id(&self) -> &str {
        match self {
            ExpandableId::Id(id) => id,
            ExpandableId::Object { id } => id,
        }
    }
}

/// Completed checkout session
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<ExpandableId>,
    #[serde(default)]
    pub subscription: Option<ExpandableId>,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub metadata: Metadata,
}

impl CheckoutSessionObject {
    pub fn customer_id(&self) -> Option<&str> {
        self.customer.as_ref().map(ExpandableId::id)
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription.as_ref().map(ExpandableId::id)
    }
}

/// Subscription object, as delivered in webhooks or fetched from the provider
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<ExpandableId>,
    pub status: String,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub metadata: Metadata,
    /// Legacy top-level tier field written by early checkout links
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub items: Option<SubscriptionItems>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

impl SubscriptionObject {
    pub fn customer_id(&self) -> Option<&str> {
        self.customer.as_ref().map(ExpandableId::id)
    }

    /// Period end in unix seconds. Newer API versions only report it on the
    /// subscription items.
    pub fn period_end(&self) -> Option<i64> {
        self.current_period_end.or_else(|| {
            self.items
                .as_ref()
                .and_then(|items| items.data.iter().filter_map(|i| i.current_period_end).max())
        })
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Metadata, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Metadata>::deserialize(deserializer)?.unwrap_or_default())
}
