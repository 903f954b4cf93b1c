//! Common types for Dripline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unique identifier for campaigns (server-assigned)
pub type CampaignId = String;

/// Unique identifier for sub-campaigns (server-assigned)
pub type SubCampaignId = String;

/// Logical scope a real-time subscription targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Channel {
    Campaign,
    SubCampaign,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Campaign => write!(f, "campaign"),
            Channel::SubCampaign => write!(f, "subCampaign"),
        }
    }
}

/// A real-time subscription, keyed by structural equality
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub channel: Channel,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<CampaignId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_campaign_id: Option<SubCampaignId>,
}

impl Subscription {
    /// Subscription to a campaign's event stream
    pub fn campaign(campaign_id: impl Into<CampaignId>) -> Self {
        Self {
            channel: Channel::Campaign,
            campaign_id: Some(campaign_id.into()),
            sub_campaign_id: None,
        }
    }

    /// Subscription to a sub-campaign's event stream
    pub fn sub_campaign(
        campaign_id: impl Into<CampaignId>,
        sub_campaign_id: impl Into<SubCampaignId>,
    ) -> Self {
        Self {
            channel: Channel::SubCampaign,
            campaign_id: Some(campaign_id.into()),
            sub_campaign_id: Some(sub_campaign_id.into()),
        }
    }
}

/// Delivery event kind, as reported by the server.
///
/// Kept as an open string tag rather than a closed enum so the server can
/// introduce new kinds without a client rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    /// Fallback tag for payloads that carry no event kind
    pub fn unknown() -> Self {
        Self("unknown".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inbound delivery event as it appears on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(default)]
    pub email: Option<String>,

    #[serde(default)]
    pub event: Option<EventType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    /// Event timestamp as sent by the server (opaque on the wire)
    #[serde(default)]
    pub date: Option<String>,
}

impl EventPayload {
    /// A payload missing both `email` and `event` is not a delivery event
    pub fn is_event(&self) -> bool {
        self.email.is_some() || self.event.is_some()
    }

    /// Parse an inbound message into delivery events.
    ///
    /// The server sends either a single event object or an array of event
    /// objects; both forms are handled identically. Non-objects and payloads
    /// that are not delivery events are dropped.
    pub fn parse_message(value: &Value) -> Vec<EventPayload> {
        match value {
            Value::Array(items) => items.iter().filter_map(Self::parse_single).collect(),
            other => Self::parse_single(other).into_iter().collect(),
        }
    }

    fn parse_single(value: &Value) -> Option<EventPayload> {
        let payload: EventPayload = serde_json::from_value(value.clone()).ok()?;
        payload.is_event().then_some(payload)
    }
}

/// A delivery event held in the live buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveEvent {
    /// Locally-assigned id, monotonic per aggregator instance
    pub id: u64,

    /// Recipient address
    pub email: String,

    /// Event kind
    pub event: EventType,

    /// Subject line, when reported
    pub subject: Option<String>,

    /// Event timestamp
    pub date: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_channel_serde() {
        assert_eq!(
            serde_json::to_value(Channel::SubCampaign).unwrap(),
            json!("subCampaign")
        );
        assert_eq!(
            serde_json::to_value(Channel::Campaign).unwrap(),
            json!("campaign")
        );
    }

    #[test]
    fn test_subscription_omits_null_fields() {
        let sub = Subscription::campaign("c1");
        let value = serde_json::to_value(&sub).unwrap();
        assert_eq!(value, json!({"channel": "campaign", "campaignId": "c1"}));

        let sub = Subscription::sub_campaign("c1", "s1");
        let value = serde_json::to_value(&sub).unwrap();
        assert_eq!(
            value,
            json!({"channel": "subCampaign", "campaignId": "c1", "subCampaignId": "s1"})
        );
    }

    #[test]
    fn test_subscription_structural_equality() {
        assert_eq!(Subscription::campaign("c1"), Subscription::campaign("c1"));
        assert_ne!(Subscription::campaign("c1"), Subscription::campaign("c2"));
        assert_ne!(
            Subscription::campaign("c1"),
            Subscription::sub_campaign("c1", "s1")
        );
    }

    #[test]
    fn test_parse_message_single() {
        let value = json!({"email": "a@example.com", "event": "delivered"});
        let events = EventPayload::parse_message(&value);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].email.as_deref(), Some("a@example.com"));
        assert_eq!(events[0].event, Some(EventType::from("delivered")));
    }

    #[test]
    fn test_parse_message_array_preserves_order() {
        let value = json!([
            {"email": "a@example.com", "event": "sent"},
            {"email": "b@example.com", "event": "opened"},
        ]);
        let events = EventPayload::parse_message(&value);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, Some(EventType::from("sent")));
        assert_eq!(events[1].event, Some(EventType::from("opened")));
    }

    #[test]
    fn test_parse_message_ignores_non_events() {
        // Missing both email and event
        assert!(EventPayload::parse_message(&json!({"subject": "hi"})).is_empty());
        // Not an object at all
        assert!(EventPayload::parse_message(&json!(42)).is_empty());
        // Mixed array keeps only the events
        let value = json!([{"foo": 1}, {"email": "a@example.com", "event": "sent"}]);
        assert_eq!(EventPayload::parse_message(&value).len(), 1);
    }

    #[test]
    fn test_event_with_only_email_is_kept() {
        let value = json!({"email": "a@example.com"});
        assert_eq!(EventPayload::parse_message(&value).len(), 1);
    }
}
