//! Narrow interfaces to the catalog, blocklist and aggregate counters.
//!
//! Managing these entities is someone else's job; the settlement pipeline
//! only reads prices, checks senders and bumps counters. [`Database`](crate::db::Database)
//! implements all three over SQLite and can be seeded from a JSON file.

use alloy::primitives::Address;
use serde::Deserialize;

use crate::error::StoreError;

/// A payable resource (e.g. one live stage).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub id: String,
    pub name: String,
    pub pay_to: Address,
    pub network: String,
    /// Overrides the network's default asset when set.
    pub asset: Option<Address>,
}

/// Price of one action on a resource, in base units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pricing {
    pub amount: String,
    pub description: String,
}

pub trait Catalog: Send + Sync {
    fn resource(&self, resource_id: &str) -> Result<Option<Resource>, StoreError>;

    fn pricing(&self, resource_id: &str, action_key: &str) -> Result<Option<Pricing>, StoreError>;
}

pub trait Blocklist: Send + Sync {
    fn is_blocked(&self, resource_id: &str, sender: &Address) -> Result<bool, StoreError>;
}

pub trait Aggregates: Send + Sync {
    /// Add one settled payment of `delta` base units to the resource totals.
    fn add_revenue(&self, resource_id: &str, delta: u128) -> Result<(), StoreError>;
}

/// Catalog seed file, loaded at startup from `CATALOG_PATH`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSeed {
    pub resources: Vec<ResourceSeed>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSeed {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub pay_to: Address,
    pub network: String,
    #[serde(default)]
    pub asset: Option<Address>,
    #[serde(default)]
    pub actions: Vec<ActionSeed>,
    #[serde(default)]
    pub blocked: Vec<Address>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSeed {
    pub key: String,
    pub amount: String,
    pub description: String,
}

impl CatalogSeed {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
