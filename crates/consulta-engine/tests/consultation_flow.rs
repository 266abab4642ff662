use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use consulta_core::clock::{Clock, ManualClock};
use consulta_core::events::{BroadcastNotifier, ConsultEvent};
use consulta_core::ids::{SessionId, UserId};
use consulta_core::types::{Actor, GrantSource, LicenseKind, SessionType};
use consulta_engine::{
    compute_fingerprint, CacheConfig, ConsultError, Consultation, ConsultationOrchestrator,
    FingerprintCache, InMemoryRegistry, LedgerError, LicenseLedger, MeterConfig, MeterError,
    OrchestratorConfig, SessionMeter, StartRejection,
};
use consulta_llm::{MockReply, MockResponder};
use consulta_store::cache::CacheRepo;
use consulta_store::chats::MessageRole;
use consulta_store::templates::TemplateRepo;
use consulta_store::Database;

struct Harness {
    db: Database,
    clock: Arc<ManualClock>,
    ledger: LicenseLedger,
    meter: SessionMeter,
    responder: Arc<MockResponder>,
    notifier: BroadcastNotifier,
    orchestrator: ConsultationOrchestrator,
}

fn start_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-05-04T10:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn harness(replies: Vec<MockReply>) -> Harness {
    let db = Database::in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(start_time()));
    TemplateRepo::new(db.clone()).seed_defaults(clock.now()).unwrap();

    let ledger = LicenseLedger::new(db.clone(), clock.clone());
    let meter = SessionMeter::new(
        Arc::new(InMemoryRegistry::new()),
        ledger.clone(),
        clock.clone(),
        MeterConfig::default(),
    );
    let cache = FingerprintCache::new(db.clone(), clock.clone(), CacheConfig::default());
    let responder = Arc::new(MockResponder::new(replies));
    let notifier = BroadcastNotifier::new(64);
    let orchestrator = ConsultationOrchestrator::new(
        db.clone(),
        meter.clone(),
        cache,
        responder.clone(),
        Arc::new(notifier.clone()),
        clock.clone(),
        OrchestratorConfig::default(),
    );

    Harness {
        db,
        clock,
        ledger,
        meter,
        responder,
        notifier,
        orchestrator,
    }
}

fn hours(s: &str) -> Decimal {
    s.parse().unwrap()
}

#[tokio::test]
async fn trial_user_consults_and_is_billed() {
    let h = harness(vec![MockReply::text(
        "Para despedir a un empleado debe comunicarse la carta de despido por escrito.",
    )]);
    let mut events = h.notifier.subscribe();

    let user = UserId::new();
    let trial = h.ledger.issue_trial(&user).unwrap();
    assert_eq!(trial.hours_remaining, hours("2"));

    let opened = h
        .orchestrator
        .open_session(&user, SessionType::AiChat, None)
        .await
        .unwrap();
    let sid = opened.session.id.clone();
    assert_eq!(opened.session.grant_id, trial.id);

    let query = "¿Cómo despido a un empleado?";
    let out = h
        .orchestrator
        .send_message(&sid, &Actor::user(user.clone()), query)
        .await
        .unwrap();

    assert_eq!(out.user_message.role, MessageRole::User);
    assert_eq!(out.user_message.sequence, 1);
    let reply = out.assistant_message.unwrap();
    assert_eq!(reply.sequence, 2);
    assert_eq!(reply.role, MessageRole::Assistant);
    assert!(!reply.from_cache);
    assert!(reply.content.starts_with("Para despedir"));
    assert!(reply.content.contains("Aviso legal"));
    assert_eq!(reply.legal_area.as_deref(), Some("laboral"));
    assert_eq!(h.responder.call_count(), 1);

    // cached under the normalized fingerprint, with the disclaimer included
    let entry = CacheRepo::new(h.db.clone())
        .peek(&compute_fingerprint("cómo despido a un empleado"))
        .unwrap()
        .unwrap();
    assert_eq!(entry.response, reply.content);
    assert_eq!(entry.hit_count, 1);
    assert_eq!(entry.expires_at, start_time() + Duration::hours(168));

    // nothing is debited while the session is open
    let grant = h.ledger.resolve_active_grant(&user).unwrap().unwrap();
    assert_eq!(grant.hours_remaining, hours("2"));

    let pushed = events.recv().await.unwrap();
    assert_eq!(pushed.recipient, user);
    assert!(matches!(pushed.event, ConsultEvent::MessageCreated { from_cache: false, .. }));

    h.clock.advance(Duration::minutes(12));
    let closed = h
        .orchestrator
        .close_session(&sid, &Actor::user(user.clone()), None)
        .await
        .unwrap();
    assert_eq!(closed.hours_consumed, hours("0.2"));
    assert_eq!(closed.hours_remaining, Some(hours("1.8")));
    assert_eq!(
        closed.session.metadata.hours_consumed_at_close,
        Some(hours("0.2"))
    );
    assert_eq!(closed.session.ended_at, Some(start_time() + Duration::minutes(12)));

    let grant = h.ledger.resolve_active_grant(&user).unwrap().unwrap();
    assert_eq!(grant.hours_remaining, hours("1.8"));
    let usage = h.ledger.usage(&user).unwrap();
    assert_eq!(usage.session_count, 1);
    assert_eq!(usage.hours_used, hours("0.2"));

    let pushed = events.recv().await.unwrap();
    assert_eq!(
        pushed.event,
        ConsultEvent::SessionClosed {
            session_id: sid,
            hours_consumed: hours("0.2"),
        }
    );
}

#[tokio::test]
async fn equivalent_query_is_served_from_cache() {
    let h = harness(vec![MockReply::text("Respuesta original.")]);
    let user = UserId::new();
    h.ledger.issue_trial(&user).unwrap();
    let actor = Actor::user(user.clone());

    let sid = h
        .orchestrator
        .open_session(&user, SessionType::AiChat, None)
        .await
        .unwrap()
        .session
        .id;
    let first = h
        .orchestrator
        .send_message(&sid, &actor, "¿Cómo despido a un empleado?")
        .await
        .unwrap()
        .assistant_message
        .unwrap();

    h.clock.advance(Duration::hours(1));
    let second = h
        .orchestrator
        .send_message(&sid, &actor, "  cómo DESPIDO a un   empleado ")
        .await
        .unwrap()
        .assistant_message
        .unwrap();

    assert!(second.from_cache);
    assert_eq!(second.content, first.content);
    assert_eq!(second.legal_area.as_deref(), Some("laboral"));
    assert_eq!(h.responder.call_count(), 1);

    let entry = CacheRepo::new(h.db.clone())
        .peek(&compute_fingerprint("¿Cómo despido a un empleado?"))
        .unwrap()
        .unwrap();
    assert_eq!(entry.hit_count, 2);
    assert_eq!(entry.last_used_at, start_time() + Duration::hours(1));

    let history = h.orchestrator.history(&sid, &actor).await.unwrap();
    let sequences: Vec<u32> = history.iter().map(|m| m.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn expired_cache_entry_calls_the_responder_again() {
    let h = harness(vec![MockReply::text("v1"), MockReply::text("v2")]);
    let user = UserId::new();
    h.ledger.issue_trial(&user).unwrap();
    let actor = Actor::user(user.clone());
    let sid = h
        .orchestrator
        .open_session(&user, SessionType::AiChat, None)
        .await
        .unwrap()
        .session
        .id;

    h.orchestrator.send_message(&sid, &actor, "pregunta").await.unwrap();
    h.clock.advance(Duration::hours(169));
    let out = h
        .orchestrator
        .send_message(&sid, &actor, "Pregunta")
        .await
        .unwrap();
    let reply = out.assistant_message.unwrap();
    assert!(!reply.from_cache);
    assert!(reply.content.starts_with("v2"));
    assert_eq!(h.responder.call_count(), 2);
}

#[tokio::test]
async fn short_session_bills_the_minimum() {
    let h = harness(vec![]);
    let user = UserId::new();
    h.ledger.issue_trial(&user).unwrap();
    let sid = h
        .orchestrator
        .open_session(&user, SessionType::AiChat, None)
        .await
        .unwrap()
        .session
        .id;

    h.clock.advance(Duration::seconds(90));
    let closed = h
        .orchestrator
        .close_session(&sid, &Actor::user(user.clone()), Some("breve"))
        .await
        .unwrap();
    assert_eq!(closed.hours_consumed, hours("0.1"));
    assert_eq!(closed.hours_remaining, Some(hours("1.9")));
}

#[tokio::test]
async fn one_active_session_per_user() {
    let h = harness(vec![]);
    let user = UserId::new();
    let standard = TemplateRepo::new(h.db.clone())
        .find_by_kind(LicenseKind::Standard)
        .unwrap()
        .unwrap();
    h.ledger
        .issue_grant(&user, &standard.id, GrantSource::Purchase)
        .unwrap();

    let s1 = SessionId::new();
    h.meter.start(&user, SessionType::AiChat, &s1).unwrap();
    let err = h
        .meter
        .start(&user, SessionType::LawyerChat, &SessionId::new())
        .unwrap_err();
    assert!(matches!(
        err,
        MeterError::Rejected(StartRejection::SessionAlreadyActive)
    ));

    // through the orchestrator the rejection surfaces as access denied
    let err = h
        .orchestrator
        .open_session(&user, SessionType::LawyerChat, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ConsultError::AccessDenied(_)));
    assert!(!err.user_message().is_empty());

    h.meter.end(&s1).unwrap();
    h.orchestrator
        .open_session(&user, SessionType::LawyerChat, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn grants_do_not_stack_and_trial_is_single_use() {
    let h = harness(vec![]);
    let user = UserId::new();
    h.ledger.issue_trial(&user).unwrap();

    let premium = TemplateRepo::new(h.db.clone())
        .find_by_kind(LicenseKind::Premium)
        .unwrap()
        .unwrap();
    assert!(matches!(
        h.ledger.issue_grant(&user, &premium.id, GrantSource::Purchase),
        Err(LedgerError::AlreadyHasActiveGrant)
    ));

    // once the trial lapses a purchase goes through, but the trial never comes back
    h.clock.advance(Duration::days(7));
    let bought = h
        .ledger
        .issue_grant(&user, &premium.id, GrantSource::Purchase)
        .unwrap();
    assert_eq!(bought.expires_at, None);

    h.clock.advance(Duration::days(1));
    assert!(matches!(
        h.ledger.issue_trial(&user),
        Err(LedgerError::TrialAlreadyClaimed)
    ));
}

#[tokio::test]
async fn exhausted_balance_keeps_session_open_until_topped_up() {
    let h = harness(vec![]);
    let user = UserId::new();
    h.ledger.issue_trial(&user).unwrap();
    let sid = h
        .orchestrator
        .open_session(&user, SessionType::AiChat, None)
        .await
        .unwrap()
        .session
        .id;

    h.clock.advance(Duration::minutes(150));
    let err = h
        .orchestrator
        .close_session(&sid, &Actor::user(user.clone()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ConsultError::InsufficientResource(_)));
    assert!(h.meter.get(&sid).is_some());

    let grant = h.ledger.resolve_active_grant(&user).unwrap().unwrap();
    assert_eq!(grant.hours_remaining, hours("2"));

    h.ledger.credit(&user, hours("1")).unwrap();
    let closed = h
        .orchestrator
        .close_session(&sid, &Actor::admin(UserId::new()), None)
        .await
        .unwrap();
    assert_eq!(closed.hours_consumed, hours("2.5"));
    assert_eq!(closed.hours_remaining, Some(hours("0.5")));
}
