//! Notification envelopes produced for one evaluation result
//!
//! An envelope is a user-visible notification with a fixed fire offset relative
//! to the evaluation that triggered it. A sequence holds at most three:
//! welcome (0 ms), primary deal (1000 ms), and "N more deals" (3000 ms, only when
//! more than one deal came back).

use crate::domain::types::{DealSummary, GeofenceEvaluationResult};
use serde::Serialize;

pub const WELCOME_OFFSET_MS: u64 = 0;
pub const PRIMARY_DEAL_OFFSET_MS: u64 = 1000;
pub const MORE_DEALS_OFFSET_MS: u64 = 3000;

/// Deep-link prefix for a single deal
pub const DEAL_LINK_PREFIX: &str = "/deals/";
/// Deep-link target for browsing all nearby deals
pub const BROWSE_DEALS_LINK: &str = "/deals";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EnvelopeKind {
    Welcome,
    PrimaryDeal,
    MoreDealsCount,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Welcome => "welcome",
            EnvelopeKind::PrimaryDeal => "primary_deal",
            EnvelopeKind::MoreDealsCount => "more_deals_count",
        }
    }
}

/// Action attached to an envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
    pub label: String,
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EnvelopePayload {
    Welcome { neighborhood: String, deal_count: usize },
    PrimaryDeal { deal: DealSummary },
    MoreDealsCount { count: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationEnvelope {
    /// Sequence number of the evaluation that produced this envelope
    pub evaluation_id: u64,
    pub fire_at_offset_ms: u64,
    pub payload: EnvelopePayload,
}

impl NotificationEnvelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self.payload {
            EnvelopePayload::Welcome { .. } => EnvelopeKind::Welcome,
            EnvelopePayload::PrimaryDeal { .. } => EnvelopeKind::PrimaryDeal,
            EnvelopePayload::MoreDealsCount { .. } => EnvelopeKind::MoreDealsCount,
        }
    }

    pub fn title(&self) -> String {
        match &self.payload {
            EnvelopePayload::Welcome { neighborhood, .. } => format!("Welcome to {neighborhood}!"),
            EnvelopePayload::PrimaryDeal { deal } => deal.title.clone(),
            EnvelopePayload::MoreDealsCount { count } => {
                format!("{count} more {} nearby", plural(*count, "deal", "deals"))
            }
        }
    }

    pub fn body(&self) -> String {
        match &self.payload {
            EnvelopePayload::Welcome { deal_count, .. } => {
                format!("{deal_count} {} available nearby", plural(*deal_count, "deal", "deals"))
            }
            EnvelopePayload::PrimaryDeal { deal } if deal.venue_name.is_empty() => {
                deal.description.clone()
            }
            EnvelopePayload::PrimaryDeal { deal } => {
                format!("{} at {}", deal.description, deal.venue_name)
            }
            EnvelopePayload::MoreDealsCount { .. } => "Tap to browse everything around you".into(),
        }
    }

    pub fn action(&self) -> Option<NotificationAction> {
        match &self.payload {
            EnvelopePayload::Welcome { .. } => None,
            EnvelopePayload::PrimaryDeal { deal } => Some(NotificationAction {
                label: "View deal".to_string(),
                link: format!("{DEAL_LINK_PREFIX}{}", deal.id),
            }),
            EnvelopePayload::MoreDealsCount { .. } => Some(NotificationAction {
                label: "Browse deals".to_string(),
                link: BROWSE_DEALS_LINK.to_string(),
            }),
        }
    }
}

fn plural<'a>(n: usize, one: &'a str, many: &'a str) -> &'a str {
    if n == 1 {
        one
    } else {
        many
    }
}

/// Build the envelope sequence for an evaluation result.
///
/// Returns an empty plan unless the result entered a new neighborhood with at
/// least one deal.
pub fn plan_envelopes(
    evaluation_id: u64,
    result: &GeofenceEvaluationResult,
) -> Vec<NotificationEnvelope> {
    if !result.should_notify() {
        return Vec::new();
    }
    let Some(primary) = result.deals.first() else {
        return Vec::new();
    };

    let neighborhood = result
        .current_neighborhood
        .as_ref()
        .map(|n| n.name.clone())
        .unwrap_or_else(|| "the neighborhood".to_string());

    let mut plan = Vec::with_capacity(3);
    plan.push(NotificationEnvelope {
        evaluation_id,
        fire_at_offset_ms: WELCOME_OFFSET_MS,
        payload: EnvelopePayload::Welcome { neighborhood, deal_count: result.deals.len() },
    });
    plan.push(NotificationEnvelope {
        evaluation_id,
        fire_at_offset_ms: PRIMARY_DEAL_OFFSET_MS,
        payload: EnvelopePayload::PrimaryDeal { deal: primary.clone() },
    });
    if result.deals.len() > 1 {
        plan.push(NotificationEnvelope {
            evaluation_id,
            fire_at_offset_ms: MORE_DEALS_OFFSET_MS,
            payload: EnvelopePayload::MoreDealsCount { count: result.deals.len() - 1 },
        });
    }
    plan
}
