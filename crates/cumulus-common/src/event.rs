use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UsageEventKind {
    TemplateCreate,
    TemplateCopy,
    IsoCreate,
    IsoCopy,
}

/// Billing/usage record. Stored under `/usage_events/{event_id}`.
///
/// Exactly one copy event is emitted per successful cross-zone copy, sized
/// from the source host association. System-account operations emit none.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub event_id: String,
    pub kind: UsageEventKind,
    pub account_id: String,
    pub zone_id: String,
    pub template_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,

    #[serde(default)]
    pub created_at_ms: u64,
}

impl UsageEvent {
    pub fn new(
        kind: UsageEventKind,
        account_id: &str,
        zone_id: &str,
        template_id: &str,
        size_bytes: Option<u64>,
        now_ms: u64,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            kind,
            account_id: account_id.to_string(),
            zone_id: zone_id.to_string(),
            template_id: template_id.to_string(),
            size_bytes,
            created_at_ms: now_ms,
        }
    }
}
