//! Idempotency store: one durable [`PaymentRecord`] per payment fingerprint.
//!
//! Every mutation is a single SQL statement. Status transitions are guarded
//! by `WHERE status = 'verified'`, so a record that reached `settled` or
//! `failed` never changes again and a duplicate settlement callback is a no-op.

use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use x402::{PaymentProof, SettlementReceipt};

use crate::context::PaymentContext;
use crate::error::StoreError;

/// Lifecycle of a payment record. Only `Verified` can transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Verified,
    Settled,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Verified => "verified",
            PaymentStatus::Settled => "settled",
            PaymentStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "verified" => Ok(PaymentStatus::Verified),
            "settled" => Ok(PaymentStatus::Settled),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(StoreError::Corrupt(format!("unknown status {other}"))),
        }
    }
}

/// A persisted payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRecord {
    pub fingerprint: String,
    pub resource_id: String,
    pub status: PaymentStatus,
    pub scheme: String,
    pub network: String,
    pub payer: String,
    pub pay_to: String,
    pub value: String,
    pub asset: String,
    pub nonce: String,
    pub valid_after: String,
    pub valid_before: String,
    pub context: Option<PaymentContext>,
    /// Present once settled.
    pub receipt: Option<SettlementReceipt>,
    /// Present once failed.
    pub failure_reason: Option<String>,
    pub settle_attempts: u32,
    pub created_at: i64,
}

/// Deterministic identity of a payment proof: SHA-256 hex of the raw header.
pub fn fingerprint(payment_header: &str) -> String {
    format!("{:x}", Sha256::digest(payment_header.as_bytes()))
}

/// Handle to the `payments` table. Cheap to clone.
#[derive(Clone)]
pub struct PaymentStore {
    conn: Arc<Mutex<Connection>>,
}

const SELECT_COLUMNS: &str = r#"
    fingerprint, resource_id, status, scheme, network, payer, pay_to, value, asset,
    nonce, valid_after, valid_before, context, transaction_id, block_number, settled_at,
    receipt_from, receipt_to, receipt_value, failure_reason, settle_attempts, created_at
"#;

struct RawRecord {
    fingerprint: String,
    resource_id: String,
    status: String,
    scheme: String,
    network: String,
    payer: String,
    pay_to: String,
    value: String,
    asset: String,
    nonce: String,
    valid_after: String,
    valid_before: String,
    context: Option<String>,
    transaction_id: Option<String>,
    block_number: Option<i64>,
    settled_at: Option<String>,
    receipt_from: Option<String>,
    receipt_to: Option<String>,
    receipt_value: Option<String>,
    failure_reason: Option<String>,
    settle_attempts: i64,
    created_at: i64,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            fingerprint: row.get(0)?,
            resource_id: row.get(1)?,
            status: row.get(2)?,
            scheme: row.get(3)?,
            network: row.get(4)?,
            payer: row.get(5)?,
            pay_to: row.get(6)?,
            value: row.get(7)?,
            asset: row.get(8)?,
            nonce: row.get(9)?,
            valid_after: row.get(10)?,
            valid_before: row.get(11)?,
            context: row.get(12)?,
            transaction_id: row.get(13)?,
            block_number: row.get(14)?,
            settled_at: row.get(15)?,
            receipt_from: row.get(16)?,
            receipt_to: row.get(17)?,
            receipt_value: row.get(18)?,
            failure_reason: row.get(19)?,
            settle_attempts: row.get(20)?,
            created_at: row.get(21)?,
        })
    }

    fn into_record(self) -> Result<PaymentRecord, StoreError> {
        let status = PaymentStatus::parse(&self.status)?;

        let context = self
            .context
            .as_deref()
            .map(serde_json::from_str::<PaymentContext>)
            .transpose()
            .map_err(|e| StoreError::Corrupt(format!("context of {}: {e}", self.fingerprint)))?;

        let receipt = match status {
            PaymentStatus::Settled => {
                let missing =
                    |col: &str| StoreError::Corrupt(format!("settled {} without {col}", self.fingerprint));
                let block_number = self.block_number.ok_or_else(|| missing("block_number"))?;
                Some(SettlementReceipt {
                    transaction_id: self.transaction_id.ok_or_else(|| missing("transaction_id"))?,
                    from: self.receipt_from.ok_or_else(|| missing("receipt_from"))?,
                    to: self.receipt_to.ok_or_else(|| missing("receipt_to"))?,
                    value: self.receipt_value.ok_or_else(|| missing("receipt_value"))?,
                    block_number: u64::try_from(block_number)
                        .map_err(|_| missing("valid block_number"))?,
                    timestamp: self.settled_at.ok_or_else(|| missing("settled_at"))?,
                })
            }
            _ => None,
        };

        Ok(PaymentRecord {
            fingerprint: self.fingerprint,
            resource_id: self.resource_id,
            status,
            scheme: self.scheme,
            network: self.network,
            payer: self.payer,
            pay_to: self.pay_to,
            value: self.value,
            asset: self.asset,
            nonce: self.nonce,
            valid_after: self.valid_after,
            valid_before: self.valid_before,
            context,
            receipt,
            failure_reason: self.failure_reason,
            settle_attempts: u32::try_from(self.settle_attempts).unwrap_or(u32::MAX),
            created_at: self.created_at,
        })
    }
}

fn context_json(context: &PaymentContext) -> Result<String, StoreError> {
    serde_json::to_string(context).map_err(|e| StoreError::Corrupt(e.to_string()))
}

impl PaymentStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    pub fn lookup(&self, fingerprint: &str) -> Result<Option<PaymentRecord>, StoreError> {
        let raw = {
            let conn = self.lock()?;
            conn.query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM payments WHERE fingerprint = ?1"),
                params![fingerprint],
                RawRecord::from_row,
            )
            .optional()?
        };
        raw.map(RawRecord::into_record).transpose()
    }

    /// Insert a new `verified` record.
    ///
    /// Fails with [`StoreError::DuplicateFingerprint`] if a record already
    /// exists; the caller should re-read it.
    pub fn create_verified(
        &self,
        fingerprint: &str,
        resource_id: &str,
        proof: &PaymentProof,
        context: Option<&PaymentContext>,
    ) -> Result<(), StoreError> {
        let context = context.map(context_json).transpose()?;
        let payload = &proof.payload;
        let now = chrono::Utc::now().timestamp();

        let conn = self.lock()?;
        let result = conn.execute(
            r#"
            INSERT INTO payments (
                fingerprint, resource_id, status, scheme, network, payer, pay_to, value,
                asset, nonce, valid_after, valid_before, context, created_at, updated_at
            )
            VALUES (?1, ?2, 'verified', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
            "#,
            params![
                fingerprint,
                resource_id,
                proof.scheme,
                proof.network,
                format!("{:#x}", payload.from),
                format!("{:#x}", payload.to),
                payload.value,
                format!("{:#x}", payload.asset),
                format!("{}", payload.nonce),
                payload.valid_after,
                payload.valid_before,
                context,
                now
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if StoreError::is_unique_violation(&e) => {
                Err(StoreError::DuplicateFingerprint(fingerprint.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record that `settle()` is about to be called. Returns the number of
    /// earlier attempts, or `None` if the record is missing or already terminal.
    pub fn mark_settle_attempt(&self, fingerprint: &str) -> Result<Option<u32>, StoreError> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.lock()?;
        let attempts: Option<i64> = conn
            .query_row(
                r#"
                UPDATE payments
                SET settle_attempts = settle_attempts + 1,
                    settle_started_at = ?2,
                    updated_at = ?2
                WHERE fingerprint = ?1 AND status = 'verified'
                RETURNING settle_attempts
                "#,
                params![fingerprint, now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(attempts.map(|n| u32::try_from(n.saturating_sub(1)).unwrap_or(u32::MAX)))
    }

    /// `verified -> settled`. Returns whether this call made the transition.
    pub fn mark_settled(
        &self,
        fingerprint: &str,
        receipt: &SettlementReceipt,
    ) -> Result<bool, StoreError> {
        let block_number = i64::try_from(receipt.block_number).map_err(|_| {
            StoreError::Corrupt(format!("block number out of range: {}", receipt.block_number))
        })?;
        let now = chrono::Utc::now().timestamp();

        let conn = self.lock()?;
        let changed = conn.execute(
            r#"
            UPDATE payments
            SET status = 'settled',
                transaction_id = ?2,
                block_number = ?3,
                settled_at = ?4,
                receipt_from = ?5,
                receipt_to = ?6,
                receipt_value = ?7,
                updated_at = ?8
            WHERE fingerprint = ?1 AND status = 'verified'
            "#,
            params![
                fingerprint,
                receipt.transaction_id,
                block_number,
                receipt.timestamp,
                receipt.from,
                receipt.to,
                receipt.value,
                now
            ],
        )?;
        Ok(changed == 1)
    }

    /// `verified -> failed`. Returns whether this call made the transition.
    pub fn mark_failed(&self, fingerprint: &str, reason: &str) -> Result<bool, StoreError> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.lock()?;
        let changed = conn.execute(
            r#"
            UPDATE payments
            SET status = 'failed', failure_reason = ?2, updated_at = ?3
            WHERE fingerprint = ?1 AND status = 'verified'
            "#,
            params![fingerprint, reason, now],
        )?;
        Ok(changed == 1)
    }

    /// Set the context only if none is stored yet.
    pub fn backfill_context(
        &self,
        fingerprint: &str,
        context: &PaymentContext,
    ) -> Result<bool, StoreError> {
        let json = context_json(context)?;
        let now = chrono::Utc::now().timestamp();
        let conn = self.lock()?;
        let changed = conn.execute(
            r#"
            UPDATE payments SET context = ?2, updated_at = ?3
            WHERE fingerprint = ?1 AND context IS NULL
            "#,
            params![fingerprint, json, now],
        )?;
        Ok(changed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use alloy::primitives::{Address, FixedBytes};
    use uuid::Uuid;
    use x402::ExactPayload;

    fn test_store() -> (tempfile::TempDir, Database, PaymentStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payments.db");
        let db = Database::new(path.to_str().unwrap()).unwrap();
        let store = db.payments();
        (dir, db, store)
    }

    fn proof() -> PaymentProof {
        PaymentProof {
            protocol_version: 1,
            scheme: "exact".to_string(),
            network: "base-sepolia".to_string(),
            payload: ExactPayload {
                from: Address::repeat_byte(0x11),
                to: Address::repeat_byte(0x22),
                value: "50000".to_string(),
                valid_after: "0".to_string(),
                valid_before: "9999999999".to_string(),
                nonce: FixedBytes::repeat_byte(0x33),
                signature: "0xdead".to_string(),
                asset: Address::repeat_byte(0x44),
            },
        }
    }

    fn receipt(tx: &str) -> SettlementReceipt {
        SettlementReceipt {
            transaction_id: tx.to_string(),
            from: format!("{:#x}", Address::repeat_byte(0x11)),
            to: format!("{:#x}", Address::repeat_byte(0x22)),
            value: "50000".to_string(),
            block_number: 12345,
            timestamp: "2026-03-01T12:00:00Z".to_string(),
        }
    }

    fn effect(key: &str) -> PaymentContext {
        PaymentContext::Effect {
            effect_key: key.to_string(),
            correlation_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_fingerprint_is_stable_sha256_hex() {
        let a = fingerprint("eyJmb28iOiJiYXIifQ==");
        assert_eq!(a, fingerprint("eyJmb28iOiJiYXIifQ=="));
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, fingerprint("eyJmb28iOiJiYXoifQ=="));
        // sha256("")
        assert_eq!(
            fingerprint(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_create_and_lookup() {
        let (_dir, _db, store) = test_store();
        let ctx = effect("sticker_01");
        store
            .create_verified("fp1", "stage-1", &proof(), Some(&ctx))
            .unwrap();

        let rec = store.lookup("fp1").unwrap().unwrap();
        assert_eq!(rec.status, PaymentStatus::Verified);
        assert_eq!(rec.resource_id, "stage-1");
        assert_eq!(rec.payer, format!("{:#x}", Address::repeat_byte(0x11)));
        assert_eq!(rec.value, "50000");
        assert_eq!(rec.context, Some(ctx));
        assert!(rec.receipt.is_none());
        assert_eq!(rec.settle_attempts, 0);

        assert!(store.lookup("nope").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let (_dir, _db, store) = test_store();
        store.create_verified("fp1", "stage-1", &proof(), None).unwrap();

        let err = store
            .create_verified("fp1", "stage-1", &proof(), None)
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateFingerprint(fp) if fp == "fp1"));
    }

    #[test]
    fn test_settled_is_terminal() {
        let (_dir, _db, store) = test_store();
        store.create_verified("fp1", "stage-1", &proof(), None).unwrap();

        assert!(store.mark_settled("fp1", &receipt("0xaaa")).unwrap());
        assert!(!store.mark_settled("fp1", &receipt("0xbbb")).unwrap());
        assert!(!store.mark_failed("fp1", "late failure").unwrap());

        let rec = store.lookup("fp1").unwrap().unwrap();
        assert_eq!(rec.status, PaymentStatus::Settled);
        assert_eq!(rec.receipt, Some(receipt("0xaaa")));
        assert!(rec.failure_reason.is_none());
    }

    #[test]
    fn test_failed_is_terminal() {
        let (_dir, _db, store) = test_store();
        store.create_verified("fp1", "stage-1", &proof(), None).unwrap();

        assert!(store.mark_failed("fp1", "insufficient funds").unwrap());
        assert!(!store.mark_settled("fp1", &receipt("0xaaa")).unwrap());

        let rec = store.lookup("fp1").unwrap().unwrap();
        assert_eq!(rec.status, PaymentStatus::Failed);
        assert_eq!(rec.failure_reason.as_deref(), Some("insufficient funds"));
        assert!(rec.receipt.is_none());
    }

    #[test]
    fn test_transitions_on_missing_record_are_noops() {
        let (_dir, _db, store) = test_store();
        assert!(!store.mark_settled("ghost", &receipt("0xaaa")).unwrap());
        assert!(!store.mark_failed("ghost", "x").unwrap());
        assert_eq!(store.mark_settle_attempt("ghost").unwrap(), None);
    }

    #[test]
    fn test_settle_attempt_marker_counts() {
        let (_dir, _db, store) = test_store();
        store.create_verified("fp1", "stage-1", &proof(), None).unwrap();

        assert_eq!(store.mark_settle_attempt("fp1").unwrap(), Some(0));
        assert_eq!(store.mark_settle_attempt("fp1").unwrap(), Some(1));
        assert_eq!(store.lookup("fp1").unwrap().unwrap().settle_attempts, 2);

        store.mark_settled("fp1", &receipt("0xaaa")).unwrap();
        assert_eq!(store.mark_settle_attempt("fp1").unwrap(), None);
    }

    #[test]
    fn test_context_written_once() {
        let (_dir, _db, store) = test_store();
        store.create_verified("fp1", "stage-1", &proof(), None).unwrap();

        let first = effect("sticker_01");
        assert!(store.backfill_context("fp1", &first).unwrap());
        assert!(!store.backfill_context("fp1", &effect("sticker_02")).unwrap());

        assert_eq!(store.lookup("fp1").unwrap().unwrap().context, Some(first));
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payments.db");
        let path = path.to_str().unwrap();
        let fp = fingerprint("some-proof");

        {
            let store = Database::new(path).unwrap().payments();
            store.create_verified(&fp, "stage-1", &proof(), None).unwrap();
            store.mark_settled(&fp, &receipt("0xaaa")).unwrap();
        }

        let store = Database::new(path).unwrap().payments();
        let rec = store.lookup(&fingerprint("some-proof")).unwrap().unwrap();
        assert_eq!(rec.status, PaymentStatus::Settled);
        assert_eq!(rec.receipt, Some(receipt("0xaaa")));
    }
}
