use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The paywalled action types the server sells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Effect,
    Question,
    Donation,
    Membership,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Effect => "effect",
            ActionKind::Question => "question",
            ActionKind::Donation => "donation",
            ActionKind::Membership => "membership",
        }
    }
}

/// What a payment paid for. Written once on the payment record and never
/// overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PaymentContext {
    Effect {
        effect_key: String,
        correlation_id: Uuid,
    },
    Question {
        text: String,
        correlation_id: Uuid,
    },
    Donation {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        correlation_id: Uuid,
    },
    Membership {
        tier: String,
        correlation_id: Uuid,
    },
}

impl PaymentContext {
    pub fn kind(&self) -> ActionKind {
        match self {
            PaymentContext::Effect { .. } => ActionKind::Effect,
            PaymentContext::Question { .. } => ActionKind::Question,
            PaymentContext::Donation { .. } => ActionKind::Donation,
            PaymentContext::Membership { .. } => ActionKind::Membership,
        }
    }

    pub fn correlation_id(&self) -> Uuid {
        match self {
            PaymentContext::Effect { correlation_id, .. }
            | PaymentContext::Question { correlation_id, .. }
            | PaymentContext::Donation { correlation_id, .. }
            | PaymentContext::Membership { correlation_id, .. } => *correlation_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_is_tagged_by_kind() {
        let ctx = PaymentContext::Effect {
            effect_key: "sticker_01".to_string(),
            correlation_id: Uuid::nil(),
        };
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["kind"], "effect");
        assert_eq!(json["effect_key"], "sticker_01");

        let back: PaymentContext = serde_json::from_value(json).unwrap();
        assert_eq!(back, ctx);
        assert_eq!(back.kind(), ActionKind::Effect);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let json = serde_json::json!({"kind": "refund", "correlation_id": Uuid::nil()});
        assert!(serde_json::from_value::<PaymentContext>(json).is_err());
    }
}
