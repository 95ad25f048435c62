use alloy::primitives::Address;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::catalog::{Aggregates, Blocklist, Catalog, CatalogSeed, Pricing, Resource};
use crate::error::{SeedError, StoreError};
use crate::store::PaymentStore;

/// Aggregate totals for one resource.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ResourceStats {
    pub resource_id: String,
    pub payment_count: i64,
    /// Total revenue in base units (integer string)
    pub revenue_total: String,
    pub last_payment_at: Option<i64>,
}

/// SQLite database wrapper
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;

        #[cfg(unix)]
        if path != ":memory:" {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            {
                tracing::warn!(path = %path, error = %e, "failed to restrict database permissions");
            }
        }

        Ok(db)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;

        // WAL for concurrent readers alongside the single writer
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS resources (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                pay_to TEXT NOT NULL,
                network TEXT NOT NULL,
                asset TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS catalog_actions (
                resource_id TEXT NOT NULL,
                action_key TEXT NOT NULL,
                amount TEXT NOT NULL,
                description TEXT NOT NULL,
                PRIMARY KEY (resource_id, action_key)
            );

            CREATE TABLE IF NOT EXISTS blocklist (
                resource_id TEXT NOT NULL,
                sender TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (resource_id, sender)
            );

            CREATE TABLE IF NOT EXISTS resource_stats (
                resource_id TEXT PRIMARY KEY,
                payment_count INTEGER NOT NULL DEFAULT 0,
                revenue_total TEXT NOT NULL DEFAULT '0',
                last_payment_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS payments (
                fingerprint TEXT PRIMARY KEY,
                resource_id TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('verified', 'settled', 'failed')),
                scheme TEXT NOT NULL,
                network TEXT NOT NULL,
                payer TEXT NOT NULL,
                pay_to TEXT NOT NULL,
                value TEXT NOT NULL,
                asset TEXT NOT NULL,
                nonce TEXT NOT NULL,
                valid_after TEXT NOT NULL,
                valid_before TEXT NOT NULL,
                context TEXT,
                transaction_id TEXT,
                block_number INTEGER,
                settled_at TEXT,
                receipt_from TEXT,
                receipt_to TEXT,
                receipt_value TEXT,
                failure_reason TEXT,
                settle_attempts INTEGER NOT NULL DEFAULT 0,
                settle_started_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_payments_resource ON payments(resource_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_payments_payer ON payments(payer);
            "#,
        )?;

        Ok(())
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// The idempotency store over the same connection.
    pub fn payments(&self) -> PaymentStore {
        PaymentStore::new(Arc::clone(&self.conn))
    }

    /// Insert or replace a resource.
    pub fn upsert_resource(&self, resource: &Resource) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let now = chrono::Utc::now().timestamp();
        conn.execute(
            r#"
            INSERT INTO resources (id, name, pay_to, network, asset, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                pay_to = excluded.pay_to,
                network = excluded.network,
                asset = excluded.asset
            "#,
            params![
                resource.id,
                resource.name,
                format!("{:#x}", resource.pay_to),
                resource.network,
                resource.asset.map(|a| format!("{:#x}", a)),
                now
            ],
        )?;
        Ok(())
    }

    /// Insert or replace the price of an action.
    pub fn upsert_action(
        &self,
        resource_id: &str,
        action_key: &str,
        amount: &str,
        description: &str,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO catalog_actions (resource_id, action_key, amount, description)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(resource_id, action_key) DO UPDATE SET
                amount = excluded.amount,
                description = excluded.description
            "#,
            params![resource_id, action_key, amount, description],
        )?;
        Ok(())
    }

    /// Block a sender from paying a resource.
    pub fn block_sender(&self, resource_id: &str, sender: &Address) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT OR IGNORE INTO blocklist (resource_id, sender, created_at) VALUES (?1, ?2, ?3)",
            params![resource_id, format!("{:#x}", sender), now],
        )?;
        Ok(())
    }

    /// Load a catalog seed. Amounts are validated before anything is written.
    pub fn seed(&self, seed: &CatalogSeed) -> Result<usize, SeedError> {
        for resource in &seed.resources {
            for action in &resource.actions {
                x402::requirements::normalize_amount(&action.amount)
                    .map_err(invalid_entry(format!("{}/{}", resource.id, action.key)))?;
            }
            if resource.asset.is_none() {
                x402::requirements::resolve_asset(&resource.network)
                    .map_err(invalid_entry(resource.id.clone()))?;
            }
        }

        for resource in &seed.resources {
            self.upsert_resource(&Resource {
                id: resource.id.clone(),
                name: resource.name.clone(),
                pay_to: resource.pay_to,
                network: resource.network.clone(),
                asset: resource.asset,
            })?;
            for action in &resource.actions {
                let amount = x402::requirements::normalize_amount(&action.amount)
                    .map_err(invalid_entry(format!("{}/{}", resource.id, action.key)))?;
                self.upsert_action(&resource.id, &action.key, &amount, &action.description)?;
            }
            for sender in &resource.blocked {
                self.block_sender(&resource.id, sender)?;
            }
        }
        Ok(seed.resources.len())
    }

    /// Aggregate totals for a resource, if it has any settled payments.
    pub fn resource_stats(&self, resource_id: &str) -> Result<Option<ResourceStats>, StoreError> {
        let conn = self.lock()?;
        let stats = conn
            .query_row(
                r#"
                SELECT resource_id, payment_count, revenue_total, last_payment_at
                FROM resource_stats
                WHERE resource_id = ?1
                "#,
                params![resource_id],
                |row| {
                    Ok(ResourceStats {
                        resource_id: row.get(0)?,
                        payment_count: row.get(1)?,
                        revenue_total: row.get(2)?,
                        last_payment_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(stats)
    }
}

fn invalid_entry(entry: String) -> impl FnOnce(x402::X402Error) -> SeedError {
    move |source| SeedError::Invalid { entry, source }
}

fn parse_address(column: &str, value: &str) -> Result<Address, StoreError> {
    value
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("invalid {column} address: {value}")))
}

impl Catalog for Database {
    fn resource(&self, resource_id: &str) -> Result<Option<Resource>, StoreError> {
        let row = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT id, name, pay_to, network, asset FROM resources WHERE id = ?1",
                params![resource_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()?
        };

        let Some((id, name, pay_to, network, asset)) = row else {
            return Ok(None);
        };
        Ok(Some(Resource {
            id,
            name,
            pay_to: parse_address("pay_to", &pay_to)?,
            network,
            asset: asset.as_deref().map(|a| parse_address("asset", a)).transpose()?,
        }))
    }

    fn pricing(&self, resource_id: &str, action_key: &str) -> Result<Option<Pricing>, StoreError> {
        let conn = self.lock()?;
        let pricing = conn
            .query_row(
                r#"
                SELECT amount, description FROM catalog_actions
                WHERE resource_id = ?1 AND action_key = ?2
                "#,
                params![resource_id, action_key],
                |row| {
                    Ok(Pricing {
                        amount: row.get(0)?,
                        description: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(pricing)
    }
}

impl Blocklist for Database {
    fn is_blocked(&self, resource_id: &str, sender: &Address) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM blocklist WHERE resource_id = ?1 AND sender = ?2",
            params![resource_id, format!("{:#x}", sender)],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

impl Aggregates for Database {
    fn add_revenue(&self, resource_id: &str, delta: u128) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let now = chrono::Utc::now().timestamp();

        // Revenue is a u128 decimal string; SQLite integers are only 64-bit.
        let current: Option<String> = conn
            .query_row(
                "SELECT revenue_total FROM resource_stats WHERE resource_id = ?1",
                params![resource_id],
                |row| row.get(0),
            )
            .optional()?;
        let current: u128 = match current {
            Some(s) => s
                .parse()
                .map_err(|_| StoreError::Corrupt(format!("revenue_total for {resource_id}: {s}")))?,
            None => 0,
        };
        let total = current.saturating_add(delta).to_string();

        conn.execute(
            r#"
            INSERT INTO resource_stats (resource_id, payment_count, revenue_total, last_payment_at)
            VALUES (?1, 1, ?2, ?3)
            ON CONFLICT(resource_id) DO UPDATE SET
                payment_count = payment_count + 1,
                revenue_total = ?2,
                last_payment_at = ?3
            "#,
            params![resource_id, total, now],
        )?;
        Ok(())
    }
}
