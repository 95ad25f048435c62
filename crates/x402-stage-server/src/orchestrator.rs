//! Payment-gated action pipeline.
//!
//! One [`SettlementOrchestrator`] per paywalled action type. A request either
//! carries no proof (answered with a 402 challenge, nothing persisted) or
//! carries an `X-PAYMENT` proof that is fingerprinted, verified, authorized,
//! recorded, settled and finally turned into side effects exactly once.
//! Retries of an already-settled proof replay the stored receipt.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;
use x402::{
    Oracle, PaymentProof, PaymentRequiredBody, PaymentRequirements, SettleOutcome,
    SettlementReceipt, VerifyOutcome, PROTOCOL_VERSION, SCHEME_EXACT,
};

use crate::broker::{Audience, AudienceFilter, EventBroker};
use crate::catalog::{Aggregates, Blocklist, Catalog, Resource};
use crate::context::{ActionKind, PaymentContext};
use crate::error::{PaymentError, StoreError};
use crate::metrics::{ORACLE_LATENCY, PAYMENTS_TOTAL};
use crate::store::{fingerprint, PaymentRecord, PaymentStatus, PaymentStore};

/// Per-fingerprint locks for requests currently in flight.
pub type InflightTable = DashMap<String, Arc<AsyncMutex<()>>>;

/// What the payer is buying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaidAction {
    Effect { effect_key: String },
    Question { text: String },
    /// The payer names the amount, in base units.
    Donation {
        amount: String,
        message: Option<String>,
    },
    Membership { tier: String },
}

impl PaidAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            PaidAction::Effect { .. } => ActionKind::Effect,
            PaidAction::Question { .. } => ActionKind::Question,
            PaidAction::Donation { .. } => ActionKind::Donation,
            PaidAction::Membership { .. } => ActionKind::Membership,
        }
    }

    /// Catalog key the price is looked up under. Donations are not priced.
    pub fn catalog_key(&self) -> Option<String> {
        match self {
            PaidAction::Effect { effect_key } => Some(effect_key.clone()),
            PaidAction::Question { .. } => Some("question".to_string()),
            PaidAction::Donation { .. } => None,
            PaidAction::Membership { tier } => Some(format!("membership:{tier}")),
        }
    }

    fn to_context(&self, correlation_id: Uuid) -> PaymentContext {
        match self {
            PaidAction::Effect { effect_key } => PaymentContext::Effect {
                effect_key: effect_key.clone(),
                correlation_id,
            },
            PaidAction::Question { text } => PaymentContext::Question {
                text: text.clone(),
                correlation_id,
            },
            PaidAction::Donation { message, .. } => PaymentContext::Donation {
                message: message.clone(),
                correlation_id,
            },
            PaidAction::Membership { tier } => PaymentContext::Membership {
                tier: tier.clone(),
                correlation_id,
            },
        }
    }
}

/// An inbound paywalled request.
#[derive(Debug, Clone)]
pub struct PaidRequest {
    pub resource_id: String,
    pub action: PaidAction,
    /// Raw `X-PAYMENT` header value, if any.
    pub payment_header: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SettlementOutcome {
    /// No proof was presented; the payer must pay and retry.
    ChallengeIssued(PaymentRequiredBody),
    Settled {
        payment_id: String,
        receipt: SettlementReceipt,
        /// True when replayed from an earlier settlement.
        cached: bool,
        context: Option<PaymentContext>,
    },
}

/// Collaborators shared by every orchestrator instance.
#[derive(Clone)]
pub struct SettlementDeps {
    pub store: PaymentStore,
    pub catalog: Arc<dyn Catalog>,
    pub blocklist: Arc<dyn Blocklist>,
    pub aggregates: Arc<dyn Aggregates>,
    pub oracle: Arc<dyn Oracle>,
    pub broker: Arc<EventBroker>,
    pub inflight: Arc<InflightTable>,
}

pub struct SettlementOrchestrator {
    kind: ActionKind,
    deps: SettlementDeps,
}

/// Releases a fingerprint's slot in the inflight table, removing the entry
/// once no other request holds it.
struct InflightSlot<'a> {
    table: &'a InflightTable,
    key: String,
    lock: Arc<AsyncMutex<()>>,
}

impl<'a> InflightSlot<'a> {
    fn acquire(table: &'a InflightTable, key: &str) -> Self {
        let lock = Arc::clone(table.entry(key.to_string()).or_default().value());
        Self {
            table,
            key: key.to_string(),
            lock,
        }
    }
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        // The table and this slot hold the last two references.
        self.table.remove_if(&self.key, |_, lock| {
            Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2
        });
    }
}

struct Priced {
    resource: Resource,
    requirements: PaymentRequirements,
}

impl SettlementOrchestrator {
    pub fn new(kind: ActionKind, deps: SettlementDeps) -> Self {
        Self { kind, deps }
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    /// Run one paywalled request through the pipeline.
    pub async fn handle(&self, req: PaidRequest) -> Result<SettlementOutcome, PaymentError> {
        let result = self.run(&req).await;
        let outcome = match &result {
            Ok(SettlementOutcome::ChallengeIssued(_)) => "challenge",
            Ok(SettlementOutcome::Settled { cached: true, .. }) => "cached",
            Ok(SettlementOutcome::Settled { cached: false, .. }) => "settled",
            Err(e) => e.label(),
        };
        PAYMENTS_TOTAL
            .with_label_values(&[self.kind.as_str(), outcome])
            .inc();
        result
    }

    async fn run(&self, req: &PaidRequest) -> Result<SettlementOutcome, PaymentError> {
        if req.action.kind() != self.kind {
            return Err(PaymentError::Internal(format!(
                "{} request routed to {} orchestrator",
                req.action.kind().as_str(),
                self.kind.as_str()
            )));
        }

        let priced = self.price(req)?;

        let header = match req.payment_header.as_deref() {
            Some(h) if !h.trim().is_empty() => h,
            _ => {
                tracing::debug!(
                    resource_id = %req.resource_id,
                    action = self.kind.as_str(),
                    amount = %priced.requirements.max_amount_required,
                    "payment required"
                );
                return Ok(SettlementOutcome::ChallengeIssued(PaymentRequiredBody::new(
                    priced.requirements,
                )));
            }
        };

        let fp = fingerprint(header);
        let slot = InflightSlot::acquire(&self.deps.inflight, &fp);
        let _guard = Arc::clone(&slot.lock).lock_owned().await;

        self.settle_proof(req, &fp, header, &priced).await
    }

    fn price(&self, req: &PaidRequest) -> Result<Priced, PaymentError> {
        let resource = self
            .deps
            .catalog
            .resource(&req.resource_id)?
            .ok_or_else(|| PaymentError::UnknownResource(req.resource_id.clone()))?;

        let (amount, description) = match (&req.action, req.action.catalog_key()) {
            (PaidAction::Donation { amount, .. }, _) => {
                (amount.clone(), format!("Donation to {}", display_name(&resource)))
            }
            (_, Some(key)) => {
                let pricing = self
                    .deps
                    .catalog
                    .pricing(&resource.id, &key)?
                    .ok_or(PaymentError::UnknownAction(key))?;
                (pricing.amount, pricing.description)
            }
            (_, None) => {
                return Err(PaymentError::Internal(format!(
                    "{} action has no catalog key",
                    self.kind.as_str()
                )))
            }
        };

        let requirements = x402::build_challenge(
            &resource.network,
            resource.pay_to,
            resource.asset,
            &amount,
            &description,
        )?;
        Ok(Priced {
            resource,
            requirements,
        })
    }

    async fn settle_proof(
        &self,
        req: &PaidRequest,
        fp: &str,
        header: &str,
        priced: &Priced,
    ) -> Result<SettlementOutcome, PaymentError> {
        let store = &self.deps.store;

        let existing = store.lookup(fp)?;
        if let Some(record) = &existing {
            if record.status != PaymentStatus::Verified {
                return self.replay(req, record);
            }
            self.check_binding(req, record)?;
        }

        let proof = x402::decode_payment_header(header)?;
        check_proof_matches(&proof, &priced.requirements)?;

        let verify = self.timed_verify(header, &priced.requirements).await;
        if !verify.valid {
            let reason = verify
                .reason
                .unwrap_or_else(|| "payment invalid".to_string());
            tracing::info!(fingerprint = %fp, reason = %reason, "payment verification rejected");
            return Err(PaymentError::VerificationRejected(reason));
        }

        let payer = proof.payload.from;
        if self.deps.blocklist.is_blocked(&priced.resource.id, &payer)? {
            tracing::info!(
                fingerprint = %fp,
                resource_id = %priced.resource.id,
                payer = %format!("{:#x}", payer),
                "blocked sender"
            );
            return Err(PaymentError::Forbidden(format!("{:#x}", payer)));
        }

        let context = req.action.to_context(Uuid::new_v4());
        let context = match existing {
            None => match store.create_verified(fp, &req.resource_id, &proof, Some(&context)) {
                Ok(()) => Some(context),
                Err(StoreError::DuplicateFingerprint(_)) => {
                    let record = store.lookup(fp)?.ok_or_else(|| {
                        PaymentError::Internal(format!("record {fp} vanished after duplicate insert"))
                    })?;
                    if record.status != PaymentStatus::Verified {
                        return self.replay(req, &record);
                    }
                    self.check_binding(req, &record)?;
                    self.stored_or_backfilled(fp, record.context, context)?
                }
                Err(e) => return Err(e.into()),
            },
            Some(record) => self.stored_or_backfilled(fp, record.context, context)?,
        };

        match store.mark_settle_attempt(fp)? {
            Some(0) => {}
            Some(previous) => tracing::warn!(
                fingerprint = %fp,
                previous_attempts = previous,
                "retrying settlement of a previously attempted payment"
            ),
            None => {
                let record = store.lookup(fp)?.ok_or_else(|| {
                    PaymentError::Internal(format!("record {fp} vanished before settle"))
                })?;
                return self.replay(req, &record);
            }
        }

        let receipt = match self.timed_settle(header, &priced.requirements).await {
            SettleOutcome::Settled(receipt) => receipt,
            SettleOutcome::Failed {
                reason,
                retryable: true,
            } => {
                // Transfer outcome unknown; the record stays verified so the
                // same proof can be retried.
                tracing::warn!(
                    fingerprint = %fp,
                    reason = %reason,
                    "settlement did not complete; proof left retryable"
                );
                return Err(PaymentError::SettlementRejected(reason));
            }
            SettleOutcome::Failed {
                reason,
                retryable: false,
            } => {
                tracing::warn!(fingerprint = %fp, reason = %reason, "payment settlement failed");
                if let Err(e) = store.mark_failed(fp, &reason) {
                    tracing::error!(fingerprint = %fp, error = %e, "failed to record settlement failure");
                }
                return Err(PaymentError::SettlementRejected(reason));
            }
        };

        match store.mark_settled(fp, &receipt) {
            Ok(true) => {
                tracing::info!(
                    fingerprint = %fp,
                    resource_id = %req.resource_id,
                    action = self.kind.as_str(),
                    tx = %receipt.transaction_id,
                    value = %receipt.value,
                    "payment settled"
                );
                if let Some(ctx) = &context {
                    self.run_side_effects(&priced.resource, fp, &receipt, ctx);
                }
            }
            Ok(false) => {
                let record = store.lookup(fp)?.ok_or_else(|| {
                    PaymentError::Internal(format!("record {fp} vanished after settle"))
                })?;
                tracing::warn!(
                    fingerprint = %fp,
                    status = record.status.as_str(),
                    "record already terminal after settle; replaying stored outcome"
                );
                return self.replay(req, &record);
            }
            Err(e) => {
                // Funds moved but the receipt is not durable; skip side effects
                // so a retry cannot trigger them twice.
                tracing::error!(
                    fingerprint = %fp,
                    tx = %receipt.transaction_id,
                    error = %e,
                    "failed to persist settlement receipt"
                );
            }
        }

        Ok(SettlementOutcome::Settled {
            payment_id: fp.to_string(),
            receipt,
            cached: false,
            context,
        })
    }

    fn stored_or_backfilled(
        &self,
        fp: &str,
        stored: Option<PaymentContext>,
        fresh: PaymentContext,
    ) -> Result<Option<PaymentContext>, PaymentError> {
        if stored.is_some() {
            return Ok(stored);
        }
        if self.deps.store.backfill_context(fp, &fresh)? {
            return Ok(Some(fresh));
        }
        Ok(self.deps.store.lookup(fp)?.and_then(|r| r.context))
    }

    /// A proof is bound to the resource and action it first paid for,
    /// including the effect key or membership tier.
    fn check_binding(&self, req: &PaidRequest, record: &PaymentRecord) -> Result<(), PaymentError> {
        if record.resource_id != req.resource_id {
            return Err(PaymentError::AlreadyUsed(format!(
                "payment belongs to resource {}",
                record.resource_id
            )));
        }
        if let Some(ctx) = &record.context {
            if ctx.kind() != self.kind {
                return Err(PaymentError::AlreadyUsed(format!(
                    "payment was made for a {} action",
                    ctx.kind().as_str()
                )));
            }
            match (ctx, &req.action) {
                (
                    PaymentContext::Effect { effect_key, .. },
                    PaidAction::Effect {
                        effect_key: requested,
                    },
                ) if effect_key != requested => {
                    return Err(PaymentError::AlreadyUsed(format!(
                        "payment was made for effect {effect_key}"
                    )));
                }
                (
                    PaymentContext::Membership { tier, .. },
                    PaidAction::Membership { tier: requested },
                ) if tier != requested => {
                    return Err(PaymentError::AlreadyUsed(format!(
                        "payment was made for membership tier {tier}"
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn replay(
        &self,
        req: &PaidRequest,
        record: &PaymentRecord,
    ) -> Result<SettlementOutcome, PaymentError> {
        self.check_binding(req, record)?;
        match record.status {
            PaymentStatus::Settled => {
                let receipt = record.receipt.clone().ok_or_else(|| {
                    PaymentError::Internal(format!("settled record {} has no receipt", record.fingerprint))
                })?;
                tracing::debug!(fingerprint = %record.fingerprint, "replaying settled payment");
                Ok(SettlementOutcome::Settled {
                    payment_id: record.fingerprint.clone(),
                    receipt,
                    cached: true,
                    context: record.context.clone(),
                })
            }
            PaymentStatus::Failed => Err(PaymentError::SettlementRejected(
                record
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "settlement failed".to_string()),
            )),
            PaymentStatus::Verified => Err(PaymentError::Internal(format!(
                "record {} is not terminal",
                record.fingerprint
            ))),
        }
    }

    async fn timed_verify(&self, header: &str, requirements: &PaymentRequirements) -> VerifyOutcome {
        let start = Instant::now();
        let outcome = self.deps.oracle.verify(header, requirements).await;
        ORACLE_LATENCY
            .with_label_values(&["verify"])
            .observe(start.elapsed().as_secs_f64());
        outcome
    }

    async fn timed_settle(&self, header: &str, requirements: &PaymentRequirements) -> SettleOutcome {
        let start = Instant::now();
        let outcome = self.deps.oracle.settle(header, requirements).await;
        ORACLE_LATENCY
            .with_label_values(&["settle"])
            .observe(start.elapsed().as_secs_f64());
        outcome
    }

    /// Broadcast events and bump aggregates. Never fails the request.
    fn run_side_effects(
        &self,
        resource: &Resource,
        fp: &str,
        receipt: &SettlementReceipt,
        context: &PaymentContext,
    ) {
        let broker = &self.deps.broker;
        let correlation_id = context.correlation_id().to_string();
        let payment = json!({
            "paymentId": fp,
            "transactionId": receipt.transaction_id,
            "from": receipt.from,
            "value": receipt.value,
        });

        match context {
            PaymentContext::Effect { effect_key, .. } => {
                broker.publish(
                    &resource.id,
                    "effect.triggered",
                    &json!({
                        "effectKey": effect_key,
                        "correlationId": correlation_id,
                        "payment": payment,
                    }),
                    AudienceFilter::All,
                );
            }
            PaymentContext::Question { text, .. } => {
                broker.publish(
                    &resource.id,
                    "question.submitted",
                    &json!({
                        "text": text,
                        "correlationId": correlation_id,
                        "payment": payment,
                    }),
                    AudienceFilter::Only(Audience::Console),
                );
            }
            PaymentContext::Donation { message, .. } => {
                broker.publish(
                    &resource.id,
                    "donation.received",
                    &json!({
                        "amount": receipt.value,
                        "message": message,
                        "correlationId": correlation_id,
                        "payment": payment,
                    }),
                    AudienceFilter::All,
                );
            }
            PaymentContext::Membership { tier, .. } => {
                broker.publish(
                    &resource.id,
                    "membership.joined",
                    &json!({
                        "tier": tier,
                        "correlationId": correlation_id,
                        "payment": payment,
                    }),
                    AudienceFilter::All,
                );
            }
        }

        broker.publish(
            &resource.id,
            "payment.settled",
            &json!({
                "paymentId": fp,
                "action": context.kind().as_str(),
                "correlationId": correlation_id,
                "transactionId": receipt.transaction_id,
                "from": receipt.from,
                "value": receipt.value,
                "blockNumber": receipt.block_number,
                "timestamp": receipt.timestamp,
            }),
            AudienceFilter::Only(Audience::Console),
        );

        match receipt.value.parse::<u128>() {
            Ok(delta) => {
                if let Err(e) = self.deps.aggregates.add_revenue(&resource.id, delta) {
                    tracing::warn!(
                        resource_id = %resource.id,
                        fingerprint = %fp,
                        error = %e,
                        "failed to update resource aggregates"
                    );
                }
            }
            Err(_) => tracing::warn!(
                resource_id = %resource.id,
                fingerprint = %fp,
                value = %receipt.value,
                "settled value is not an integer; aggregates not updated"
            ),
        }
    }
}

fn display_name(resource: &Resource) -> &str {
    if resource.name.is_empty() {
        &resource.id
    } else {
        &resource.name
    }
}

fn check_proof_matches(
    proof: &PaymentProof,
    requirements: &PaymentRequirements,
) -> Result<(), PaymentError> {
    if proof.protocol_version != PROTOCOL_VERSION {
        return Err(PaymentError::InvalidPaymentHeader(format!(
            "unsupported protocol version {}",
            proof.protocol_version
        )));
    }
    if proof.scheme != SCHEME_EXACT {
        return Err(PaymentError::InvalidPaymentHeader(format!(
            "unsupported scheme {}",
            proof.scheme
        )));
    }
    if proof.network != requirements.network {
        return Err(PaymentError::InvalidPaymentHeader(format!(
            "network mismatch: expected {}, got {}",
            requirements.network, proof.network
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_keys() {
        assert_eq!(
            PaidAction::Effect {
                effect_key: "sticker_01".into()
            }
            .catalog_key()
            .as_deref(),
            Some("sticker_01")
        );
        assert_eq!(
            PaidAction::Question { text: "hi".into() }.catalog_key().as_deref(),
            Some("question")
        );
        assert_eq!(
            PaidAction::Membership { tier: "gold".into() }
                .catalog_key()
                .as_deref(),
            Some("membership:gold")
        );
        assert!(PaidAction::Donation {
            amount: "1".into(),
            message: None
        }
        .catalog_key()
        .is_none());
    }

    #[test]
    fn test_context_carries_action_data() {
        let id = Uuid::new_v4();
        let ctx = PaidAction::Donation {
            amount: "100".into(),
            message: Some("gg".into()),
        }
        .to_context(id);
        assert_eq!(ctx.kind(), ActionKind::Donation);
        assert_eq!(ctx.correlation_id(), id);
    }

    #[test]
    fn test_inflight_slot_removes_entry_when_last_holder_leaves() {
        let table = InflightTable::new();
        {
            let a = InflightSlot::acquire(&table, "fp");
            let b = InflightSlot::acquire(&table, "fp");
            assert_eq!(table.len(), 1);
            drop(a);
            assert_eq!(table.len(), 1);
            drop(b);
        }
        assert!(table.is_empty());
    }
}
