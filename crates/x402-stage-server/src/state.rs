use std::sync::Arc;

use x402::Oracle;

use crate::broker::EventBroker;
use crate::config::ServerConfig;
use crate::context::ActionKind;
use crate::db::Database;
use crate::orchestrator::{SettlementDeps, SettlementOrchestrator};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub db: Arc<Database>,
    pub broker: Arc<EventBroker>,
    pub effects: Arc<SettlementOrchestrator>,
    pub questions: Arc<SettlementOrchestrator>,
    pub donations: Arc<SettlementOrchestrator>,
    pub memberships: Arc<SettlementOrchestrator>,
}

impl AppState {
    /// Wire the SQLite database in as catalog, blocklist and aggregates.
    pub fn new(config: ServerConfig, db: Database, oracle: Arc<dyn Oracle>) -> Self {
        let db = Arc::new(db);
        let deps = SettlementDeps {
            store: db.payments(),
            catalog: db.clone(),
            blocklist: db.clone(),
            aggregates: db.clone(),
            oracle,
            broker: Arc::new(EventBroker::new()),
            inflight: Arc::default(),
        };
        Self::with_deps(config, db, deps)
    }

    /// Build from explicit collaborators.
    pub fn with_deps(config: ServerConfig, db: Arc<Database>, deps: SettlementDeps) -> Self {
        let orchestrator = |kind| Arc::new(SettlementOrchestrator::new(kind, deps.clone()));
        Self {
            config: Arc::new(config),
            db,
            broker: deps.broker.clone(),
            effects: orchestrator(ActionKind::Effect),
            questions: orchestrator(ActionKind::Question),
            donations: orchestrator(ActionKind::Donation),
            memberships: orchestrator(ActionKind::Membership),
        }
    }
}
