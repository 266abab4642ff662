use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

use consulta_core::clock::{Clock, SystemClock};
use consulta_core::events::LogNotifier;
use consulta_core::ids::UserId;
use consulta_core::types::{Actor, SessionType};
use consulta_engine::{
    CacheConfig, Consultation, ConsultationOrchestrator, FingerprintCache, InMemoryRegistry,
    LicenseLedger, Maintenance, MaintenanceConfig, MeterConfig, OrchestratorConfig, SessionMeter,
};
use consulta_llm::{HttpResponder, HttpResponderConfig};
use consulta_store::templates::TemplateRepo;
use consulta_store::Database;
use consulta_telemetry::{init_telemetry, LogFormat, TelemetryConfig};

#[derive(Parser)]
#[command(name = "consulta", version, about = "Hour-metered legal consultation core")]
struct Cli {
    /// SQLite database path. Defaults to ~/.consulta/consulta.db
    #[arg(long)]
    db: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    #[arg(long, default_value = "json")]
    log_format: LogFormat,

    #[arg(long, default_value_t = 900)]
    maintenance_interval_secs: u64,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the maintenance loop until ctrl-c (default).
    Run,
    /// Delete expired cache entries.
    PurgeCache,
    /// Expire stale grants.
    Sweep,
    /// Print cache statistics and the most requested queries.
    Stats {
        #[arg(long, default_value_t = 10)]
        top: u32,
    },
    /// Issue the trial license to a user.
    GrantTrial { user: String },
    /// List a user's grants and usage.
    Grants { user: String },
    /// Ask a one-off question in a fresh AI session, billed to the user's license.
    Ask { user: String, question: String },
}

struct App {
    db: Database,
    clock: Arc<dyn Clock>,
    ledger: LicenseLedger,
    meter: SessionMeter,
    cache: FingerprintCache,
}

impl App {
    fn open(path: &std::path::Path) -> anyhow::Result<Self> {
        let db = Database::open(path).context("opening database")?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let seeded = TemplateRepo::new(db.clone()).seed_defaults(clock.now())?;
        if seeded > 0 {
            tracing::info!(count = seeded, "seeded default license templates");
        }

        let ledger = LicenseLedger::new(db.clone(), clock.clone());
        let meter = SessionMeter::new(
            Arc::new(InMemoryRegistry::new()),
            ledger.clone(),
            clock.clone(),
            MeterConfig::default(),
        );
        let cache = FingerprintCache::new(db.clone(), clock.clone(), CacheConfig::default());
        Ok(Self {
            db,
            clock,
            ledger,
            meter,
            cache,
        })
    }

    fn orchestrator(&self) -> anyhow::Result<ConsultationOrchestrator> {
        let responder = HttpResponder::new(responder_config_from_env()?)
            .map_err(|e| anyhow!("building responder: {e}"))?;
        Ok(ConsultationOrchestrator::new(
            self.db.clone(),
            self.meter.clone(),
            self.cache.clone(),
            Arc::new(responder),
            Arc::new(LogNotifier),
            self.clock.clone(),
            OrchestratorConfig::default(),
        ))
    }
}

fn responder_config_from_env() -> anyhow::Result<HttpResponderConfig> {
    let key = std::env::var("CONSULTA_API_KEY").context("CONSULTA_API_KEY is not set")?;
    let mut config = HttpResponderConfig::new(SecretString::from(key));
    if let Ok(url) = std::env::var("CONSULTA_API_URL") {
        config.base_url = url;
    }
    if let Ok(model) = std::env::var("CONSULTA_MODEL") {
        config.model = model;
    }
    Ok(config)
}

fn default_db_path() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".consulta")
        .join("consulta.db")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        format: cli.log_format,
        ..TelemetryConfig::default()
    });

    let db_path = cli.db.clone().unwrap_or_else(default_db_path);
    let app = App::open(&db_path)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let config = MaintenanceConfig {
                interval: Duration::from_secs(cli.maintenance_interval_secs),
                ..MaintenanceConfig::default()
            };
            let cancel = CancellationToken::new();
            let handle = Maintenance::new(
                app.db.clone(),
                app.cache.clone(),
                app.meter.clone(),
                config,
            )
            .spawn(cancel.clone());
            tracing::info!(path = %db_path.display(), "consulta maintenance running");

            tokio::signal::ctrl_c()
                .await
                .context("listening for ctrl-c")?;
            tracing::info!("shutting down");
            cancel.cancel();
            handle.await?;
        }
        Command::PurgeCache => {
            println!("purged {} expired cache entries", app.cache.purge_expired());
        }
        Command::Sweep => {
            println!("expired {} stale grants", app.ledger.expire_stale()?);
        }
        Command::Stats { top } => {
            let stats = app.cache.stats();
            println!(
                "entries: {}  hits: {}  expired: {}",
                stats.entries, stats.total_hits, stats.expired
            );
            for entry in app.cache.top(top) {
                let area = entry.legal_area.as_deref().unwrap_or("-");
                println!("{:>6}  {:<15} {}", entry.hit_count, area, entry.query);
            }
        }
        Command::GrantTrial { user } => {
            let grant = app.ledger.issue_trial(&UserId::from_raw(user))?;
            println!(
                "{}  {}h  expires {}",
                grant.id,
                grant.hours_remaining,
                grant
                    .expires_at
                    .map(|e| e.to_rfc3339())
                    .unwrap_or_else(|| "never".into())
            );
        }
        Command::Grants { user } => {
            let user = UserId::from_raw(user);
            for grant in app.ledger.list_grants(&user)? {
                println!(
                    "{}  {:<16} {:<7} {:>6}h  {}",
                    grant.id,
                    grant.template_name,
                    grant.status.to_string(),
                    grant.hours_remaining.to_string(),
                    grant.tier
                );
            }
            let usage = app.ledger.usage(&user)?;
            println!(
                "used {}h over {} sessions",
                usage.hours_used, usage.session_count
            );
        }
        Command::Ask { user, question } => {
            let orchestrator = app.orchestrator()?;
            let user = UserId::from_raw(user);
            let actor = Actor::user(user.clone());
            orchestrator
                .validate_message(&question)
                .map_err(|e| anyhow!("{} ({e})", e.user_message()))?;

            let opened = orchestrator
                .open_session(&user, SessionType::AiChat, None)
                .await
                .map_err(|e| anyhow!("{} ({e})", e.user_message()))?;
            let session_id = opened.session.id;

            let sent = orchestrator.send_message(&session_id, &actor, &question).await;
            let closed = orchestrator
                .close_session(&session_id, &actor, None)
                .await
                .map_err(|e| anyhow!("{} ({e})", e.user_message()))?;
            let sent = sent.map_err(|e| anyhow!("{} ({e})", e.user_message()))?;

            if let Some(reply) = sent.assistant_message {
                println!("{}", reply.content);
            }
            println!(
                "\n[{}h consumed, {} remaining]",
                closed.hours_consumed,
                closed
                    .hours_remaining
                    .map(|h| format!("{h}h"))
                    .unwrap_or_else(|| "?".into())
            );
        }
    }

    Ok(())
}
