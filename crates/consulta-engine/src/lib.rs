//! Hour-metered consultation core: fingerprint cache, legal-area classifier,
//! license ledger, session meter and the orchestrator that ties them together.

pub mod cache;
pub mod classifier;
pub mod config;
pub mod error;
pub mod ledger;
pub mod maintenance;
pub mod meter;
pub mod orchestrator;

pub use cache::{compute_fingerprint, normalize_query, CachedReply, FingerprintCache};
pub use classifier::{AreaClassifier, KeywordClassifier, LegalArea};
pub use config::{CacheConfig, MaintenanceConfig, MeterConfig, OrchestratorConfig};
pub use error::{ConsultError, LedgerError, MeterError, StartRejection};
pub use ledger::{DebitReceipt, LicenseLedger};
pub use maintenance::{Maintenance, MaintenanceReport};
pub use meter::{
    ActiveSession, EndReport, InMemoryRegistry, SessionMeter, SessionRegistry, SweptSession,
};
pub use orchestrator::{
    CloseOutcome, Consultation, ConsultationOrchestrator, OpenedSession, SendOutcome,
};
