use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use consulta_store::chats::ChatRepo;
use consulta_store::Database;

use crate::cache::FingerprintCache;
use crate::config::MaintenanceConfig;
use crate::ledger::LicenseLedger;
use crate::meter::SessionMeter;
use crate::orchestrator::close_swept_record;

/// What one maintenance pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub cache_purged: usize,
    pub zombies_swept: usize,
    pub grants_expired: usize,
}

/// Periodic housekeeping: expired cache entries, zombie sessions, stale grants.
#[derive(Clone)]
pub struct Maintenance {
    chats: Arc<ChatRepo>,
    cache: FingerprintCache,
    meter: SessionMeter,
    ledger: LicenseLedger,
    config: MaintenanceConfig,
}

impl Maintenance {
    pub fn new(
        db: Database,
        cache: FingerprintCache,
        meter: SessionMeter,
        config: MaintenanceConfig,
    ) -> Self {
        let ledger = meter.ledger().clone();
        Self {
            chats: Arc::new(ChatRepo::new(db)),
            cache,
            meter,
            ledger,
            config,
        }
    }

    pub fn run_once(&self) -> MaintenanceReport {
        let cache_purged = self.cache.purge_expired();
        // zombies first, so their debits land before grants are swept
        let swept = self.meter.sweep_zombies(self.config.zombie_max_age_hours);
        for session in &swept {
            close_swept_record(&self.chats, session);
        }
        let zombies_swept = swept.len();
        let grants_expired = match self.ledger.expire_stale() {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "grant expiry sweep failed");
                0
            }
        };
        let report = MaintenanceReport {
            cache_purged,
            zombies_swept,
            grants_expired,
        };
        if report != MaintenanceReport::default() {
            info!(
                cache_purged,
                zombies_swept,
                grants_expired,
                "maintenance pass"
            );
        }
        report
    }

    /// Run a pass every `interval` until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("maintenance loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_once();
                }
            }
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
