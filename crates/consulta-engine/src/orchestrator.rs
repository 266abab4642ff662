//! Consultation orchestrator: ties the ledger, meter, cache, classifier and
//! responder together into the per-message and per-session flows.
//!
//! `Consultation` is the interface transport layers call. `ConsultationOrchestrator`
//! is the production implementation.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, info, instrument, warn};

use consulta_core::clock::Clock;
use consulta_core::errors::{FailureClass, ResponderError};
use consulta_core::events::{ConsultEvent, Notifier};
use consulta_core::ids::{SessionId, UserId};
use consulta_core::responder::{ChatTurn, Responder};
use consulta_core::types::{Actor, Role, SessionType};
use consulta_store::chats::{
    ChatMessageRow, ChatRepo, ChatSessionRow, ChatStatus, MessageRole, NewChatSession, NewMessage,
};
use consulta_store::Database;

use crate::cache::FingerprintCache;
use crate::classifier::{AreaClassifier, KeywordClassifier, LegalArea};
use crate::config::OrchestratorConfig;
use crate::error::{ConsultError, MeterError};
use crate::meter::{ActiveSession, SessionMeter, SweptSession};

const DISCLAIMER: &str = "\n\n---\nAviso legal: esta respuesta tiene carácter meramente informativo \
y no constituye asesoramiento jurídico profesional. Para analizar tu caso concreto, consulta con un abogado.";

// Lower-cased phrases that already count as a disclaimer.
const DISCLAIMER_MARKERS: &[&str] = &[
    "aviso legal",
    "no constituye asesoramiento",
    "carácter meramente informativo",
    "caracter meramente informativo",
];

/// A session that was persisted and is now being metered.
#[derive(Clone, Debug)]
pub struct OpenedSession {
    pub session: ChatSessionRow,
    pub metering: ActiveSession,
}

/// What `send_message` persisted.
#[derive(Clone, Debug)]
pub struct SendOutcome {
    pub user_message: ChatMessageRow,
    pub assistant_message: Option<ChatMessageRow>,
}

#[derive(Clone, Debug)]
pub struct CloseOutcome {
    pub session: ChatSessionRow,
    pub hours_consumed: Decimal,
    /// `None` when the session was no longer metered (swept or force-closed).
    pub hours_remaining: Option<Decimal>,
}

/// Interface for running consultations.
#[async_trait]
pub trait Consultation: Send + Sync {
    async fn open_session(
        &self,
        user_id: &UserId,
        session_type: SessionType,
        lawyer_id: Option<UserId>,
    ) -> Result<OpenedSession, ConsultError>;

    async fn send_message(
        &self,
        session_id: &SessionId,
        sender: &Actor,
        content: &str,
    ) -> Result<SendOutcome, ConsultError>;

    async fn close_session(
        &self,
        session_id: &SessionId,
        closer: &Actor,
        summary: Option<&str>,
    ) -> Result<CloseOutcome, ConsultError>;

    async fn history(
        &self,
        session_id: &SessionId,
        viewer: &Actor,
    ) -> Result<Vec<ChatMessageRow>, ConsultError>;
}

/// Production orchestrator.
pub struct ConsultationOrchestrator {
    chats: Arc<ChatRepo>,
    cache: FingerprintCache,
    classifier: Arc<dyn AreaClassifier>,
    meter: SessionMeter,
    responder: Arc<dyn Responder>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
}

impl ConsultationOrchestrator {
    pub fn new(
        db: Database,
        meter: SessionMeter,
        cache: FingerprintCache,
        responder: Arc<dyn Responder>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            chats: Arc::new(ChatRepo::new(db)),
            cache,
            classifier: Arc::new(KeywordClassifier::new()),
            meter,
            responder,
            notifier,
            clock,
            config,
        }
    }

    /// Swap the keyword classifier for another implementation.
    pub fn with_classifier(mut self, classifier: Arc<dyn AreaClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn meter(&self) -> &SessionMeter {
        &self.meter
    }

    pub fn cache(&self) -> &FingerprintCache {
        &self.cache
    }

    /// Check a message against the length limit and deny-list without persisting anything.
    pub fn validate_message(&self, content: &str) -> Result<(), ConsultError> {
        if content.trim().is_empty() {
            return Err(ConsultError::Validation("message is empty".into()));
        }
        let len = content.chars().count();
        if len > self.config.max_message_chars {
            return Err(ConsultError::Validation(format!(
                "message is {len} characters, limit is {}",
                self.config.max_message_chars
            )));
        }
        let lowered = content.to_lowercase();
        if let Some(term) = self
            .config
            .deny_list
            .iter()
            .find(|term| lowered.contains(term.as_str()))
        {
            return Err(ConsultError::Validation(format!("message contains forbidden content: {term}")));
        }
        Ok(())
    }

    fn build_prompt(&self, area: Option<LegalArea>, query: &str) -> String {
        let mut prompt = self.config.system_prompt.clone();
        prompt.push_str("\n\n");
        if let Some(area) = area {
            prompt.push_str(&self.classifier.context_for(area));
            prompt.push('\n');
        }
        prompt.push_str("Consulta del usuario:\n");
        prompt.push_str(query);
        prompt
    }

    /// Previous messages, oldest first, without the one just persisted.
    fn conversation_history(
        &self,
        session_id: &SessionId,
        current: &ChatMessageRow,
    ) -> Vec<ChatTurn> {
        let window = self.config.history_window.saturating_add(1);
        let messages = match self.chats.recent_messages(session_id, window) {
            Ok(m) => m,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "history unavailable, sending none");
                return Vec::new();
            }
        };
        let mut turns: Vec<ChatTurn> = messages
            .iter()
            .filter(|m| m.id != current.id)
            .filter_map(|m| match m.role {
                MessageRole::User => Some(ChatTurn::user(&m.content)),
                MessageRole::Assistant | MessageRole::Lawyer => Some(ChatTurn::assistant(&m.content)),
                MessageRole::System => None,
            })
            .collect();
        let excess = turns.len().saturating_sub(self.config.history_window as usize);
        turns.drain(..excess);
        turns
    }

    /// Produce the assistant reply text: from cache, from the responder, or an apology.
    async fn answer(
        &self,
        session_id: &SessionId,
        user_message: &ChatMessageRow,
    ) -> (String, bool, Option<LegalArea>) {
        let query = user_message.content.as_str();
        if let Some(hit) = self.cache.lookup(query) {
            debug!(session_id = %session_id, hits = hit.hit_count, "answered from cache");
            return (hit.response, true, hit.legal_area);
        }

        let area = self.classifier.classify(query);
        let prompt = self.build_prompt(area, query);
        let history = self.conversation_history(session_id, user_message);

        let result = match tokio::time::timeout(
            self.config.responder_timeout,
            self.responder.generate(&prompt, &history),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ResponderError::Timeout(self.config.responder_timeout)),
        };

        match result {
            Ok(text) => {
                let reply = with_disclaimer(&text);
                self.cache.store_default(query, &reply, area);
                (reply, false, area)
            }
            Err(e) => {
                warn!(
                    session_id = %session_id,
                    responder = self.responder.name(),
                    error_kind = e.error_kind(),
                    error = %e,
                    "responder failed, replying with apology"
                );
                (apology(e.failure_class()).to_string(), false, area)
            }
        }
    }
}

#[async_trait]
impl Consultation for ConsultationOrchestrator {
    /// Persist a chat session bound to the user's active grant and start metering it.
    #[instrument(skip(self), fields(user_id = %user_id, session_type = %session_type))]
    async fn open_session(
        &self,
        user_id: &UserId,
        session_type: SessionType,
        lawyer_id: Option<UserId>,
    ) -> Result<OpenedSession, ConsultError> {
        let grant = self
            .meter
            .ledger()
            .resolve_active_grant(user_id)?
            .ok_or_else(|| ConsultError::AccessDenied("no active license".into()))?;

        let session_id = SessionId::new();
        let session = self.chats.create_session(
            NewChatSession {
                id: session_id.clone(),
                user_id: user_id.clone(),
                grant_id: grant.id,
                lawyer_id,
                chat_type: session_type,
            },
            self.clock.now(),
        )?;

        match self.meter.start(user_id, session_type, &session_id) {
            Ok(metering) => {
                info!(session_id = %session_id, "consultation opened");
                Ok(OpenedSession { session, metering })
            }
            Err(e) => {
                if let Err(cleanup) = self.chats.delete_session(&session_id) {
                    warn!(session_id = %session_id, error = %cleanup, "failed to roll back rejected session");
                }
                Err(e.into())
            }
        }
    }

    #[instrument(skip(self, sender, content), fields(session_id = %session_id, sender = %sender.user_id))]
    async fn send_message(
        &self,
        session_id: &SessionId,
        sender: &Actor,
        content: &str,
    ) -> Result<SendOutcome, ConsultError> {
        let session = self.chats.get_session(session_id)?;
        if session.status != ChatStatus::Active {
            return Err(ConsultError::AccessDenied("session is closed".into()));
        }
        if self.meter.get(session_id).is_none() {
            return Err(ConsultError::AccessDenied("session is no longer metered".into()));
        }
        if !may_post(&session, sender) {
            return Err(ConsultError::AccessDenied(format!(
                "{} may not post in this session",
                sender.user_id
            )));
        }

        self.validate_message(content)?;

        let is_owner = sender.user_id == session.user_id;
        let role = if is_owner {
            MessageRole::User
        } else {
            match sender.role {
                Role::User | Role::Lawyer => MessageRole::Lawyer,
                Role::Admin => MessageRole::System,
                Role::System => MessageRole::Assistant,
            }
        };

        let user_message = self.chats.append_message(
            NewMessage {
                session_id: session_id.clone(),
                sender_id: sender.user_id.clone(),
                role,
                content: content.to_string(),
                from_cache: false,
                legal_area: None,
            },
            self.clock.now(),
        )?;

        if session.chat_type() != SessionType::AiChat || !is_owner {
            let recipient = if is_owner {
                session.lawyer_id.clone()
            } else {
                Some(session.user_id.clone())
            };
            if let Some(recipient) = recipient {
                self.notifier.notify(
                    &recipient,
                    ConsultEvent::MessageCreated {
                        session_id: session_id.clone(),
                        message_id: user_message.id.clone(),
                        from_cache: false,
                    },
                );
            }
            return Ok(SendOutcome {
                user_message,
                assistant_message: None,
            });
        }

        let (reply, from_cache, area) = self.answer(session_id, &user_message).await;
        let assistant_message = self.chats.append_message(
            NewMessage {
                session_id: session_id.clone(),
                sender_id: Actor::system().user_id,
                role: MessageRole::Assistant,
                content: reply,
                from_cache,
                legal_area: area.map(|a| a.to_string()),
            },
            self.clock.now(),
        )?;

        self.notifier.notify(
            &session.user_id,
            ConsultEvent::MessageCreated {
                session_id: session_id.clone(),
                message_id: assistant_message.id.clone(),
                from_cache,
            },
        );

        Ok(SendOutcome {
            user_message,
            assistant_message: Some(assistant_message),
        })
    }

    /// Stop metering, bill the elapsed time and mark the session closed.
    #[instrument(skip(self, closer, summary), fields(session_id = %session_id, closer = %closer.user_id))]
    async fn close_session(
        &self,
        session_id: &SessionId,
        closer: &Actor,
        summary: Option<&str>,
    ) -> Result<CloseOutcome, ConsultError> {
        let session = self.chats.get_session(session_id)?;
        if session.status == ChatStatus::Closed {
            return Err(ConsultError::Validation("session is already closed".into()));
        }
        if !may_close(&session, closer) {
            return Err(ConsultError::AccessDenied(format!(
                "{} may not close this session",
                closer.user_id
            )));
        }

        let (hours_consumed, hours_remaining) = match self.meter.end(session_id) {
            Ok(report) => (report.hours_consumed, Some(report.hours_remaining)),
            Err(MeterError::NotFound(_)) => {
                warn!(session_id = %session_id, "session no longer metered, closing record only");
                (Decimal::ZERO, None)
            }
            Err(e) => return Err(e.into()),
        };

        let summary = match summary {
            Some(s) if !s.trim().is_empty() => s.to_string(),
            _ => self.auto_summary(&session, hours_consumed),
        };
        let closed = self
            .chats
            .close_session(session_id, &summary, hours_consumed, self.clock.now())?;

        let event = ConsultEvent::SessionClosed {
            session_id: session_id.clone(),
            hours_consumed,
        };
        self.notifier.notify(&closed.user_id, event.clone());
        if let Some(lawyer) = &closed.lawyer_id {
            self.notifier.notify(lawyer, event);
        }

        info!(hours = %hours_consumed, "consultation closed");
        Ok(CloseOutcome {
            session: closed,
            hours_consumed,
            hours_remaining,
        })
    }

    async fn history(
        &self,
        session_id: &SessionId,
        viewer: &Actor,
    ) -> Result<Vec<ChatMessageRow>, ConsultError> {
        let session = self.chats.get_session(session_id)?;
        if !may_post(&session, viewer) {
            return Err(ConsultError::AccessDenied(format!(
                "{} may not read this session",
                viewer.user_id
            )));
        }
        Ok(self.chats.list_messages(session_id)?)
    }
}

impl ConsultationOrchestrator {
    /// Sweep zombie sessions off the meter and close their chat records.
    #[instrument(skip(self))]
    pub fn sweep_zombies(&self, max_age_hours: i64) -> Vec<SweptSession> {
        let swept = self.meter.sweep_zombies(max_age_hours);
        for session in &swept {
            if close_swept_record(&self.chats, session).is_some() {
                self.notifier.notify(
                    &session.user_id,
                    ConsultEvent::SessionClosed {
                        session_id: session.session_id.clone(),
                        hours_consumed: session.hours_consumed,
                    },
                );
            }
        }
        swept
    }

    fn auto_summary(&self, session: &ChatSessionRow, hours: Decimal) -> String {
        let count = self
            .chats
            .list_messages(&session.id)
            .map(|m| m.len())
            .unwrap_or_default();
        let kind = match session.chat_type() {
            SessionType::AiChat => "con el asistente",
            SessionType::LawyerChat => "con abogado",
        };
        format!("Consulta {kind} finalizada. Mensajes: {count}. Horas consumidas: {hours}.")
    }
}

/// Close the chat record of a session the meter swept. Returns the closed row, or
/// `None` if it was already closed or could not be written.
pub(crate) fn close_swept_record(chats: &ChatRepo, swept: &SweptSession) -> Option<ChatSessionRow> {
    let session = match chats.get_session(&swept.session_id) {
        Ok(s) if s.status == ChatStatus::Active => s,
        Ok(_) => return None,
        Err(e) => {
            warn!(session_id = %swept.session_id, error = %e, "swept session has no readable record");
            return None;
        }
    };
    let summary = if swept.billed {
        format!(
            "Consulta cerrada automáticamente por inactividad. Horas consumidas: {}.",
            swept.hours_consumed
        )
    } else {
        "Consulta cerrada automáticamente por inactividad sin saldo suficiente.".to_string()
    };
    match chats.close_session(&session.id, &summary, swept.hours_consumed, swept.ended_at) {
        Ok(closed) => Some(closed),
        Err(e) => {
            warn!(session_id = %swept.session_id, error = %e, "failed to close swept session record");
            None
        }
    }
}

fn may_post(session: &ChatSessionRow, actor: &Actor) -> bool {
    actor.user_id == session.user_id
        || session.lawyer_id.as_ref() == Some(&actor.user_id)
        || matches!(actor.role, Role::Admin | Role::System)
}

fn may_close(session: &ChatSessionRow, actor: &Actor) -> bool {
    actor.user_id == session.user_id
        || session.lawyer_id.as_ref() == Some(&actor.user_id)
        || actor.role == Role::Admin
}

/// Append the standard disclaimer unless the text already carries one.
pub fn with_disclaimer(text: &str) -> String {
    let lowered = text.to_lowercase();
    if DISCLAIMER_MARKERS.iter().any(|m| lowered.contains(m)) {
        return text.to_string();
    }
    format!("{}{DISCLAIMER}", text.trim_end())
}

/// Reply persisted when the responder could not answer.
pub fn apology(class: FailureClass) -> &'static str {
    match class {
        FailureClass::Unavailable => {
            "Lo sentimos, el asistente no está disponible en este momento. \
             Inténtalo de nuevo en unos minutos o solicita una consulta con un abogado."
        }
        FailureClass::Safety => {
            "Lo sentimos, no podemos responder a la consulta tal y como está formulada. \
             ¿Puedes reformularla con otras palabras?"
        }
        FailureClass::Quota => {
            "Lo sentimos, el asistente está recibiendo demasiadas consultas. \
             Inténtalo de nuevo más tarde."
        }
        FailureClass::Generic => {
            "Lo sentimos, se ha producido un error al procesar tu consulta. Inténtalo de nuevo."
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;
    use consulta_core::clock::ManualClock;
    use consulta_core::events::BroadcastNotifier;
    use consulta_core::types::{GrantSource, LicenseKind};
    use consulta_llm::{MockReply, MockResponder};
    use consulta_store::templates::TemplateRepo;

    use crate::config::{CacheConfig, MeterConfig};
    use crate::ledger::LicenseLedger;
    use crate::meter::InMemoryRegistry;

    struct Fixture {
        orchestrator: ConsultationOrchestrator,
        responder: Arc<MockResponder>,
        notifier: BroadcastNotifier,
        clock: Arc<ManualClock>,
        db: Database,
    }

    fn fixture(replies: Vec<MockReply>) -> Fixture {
        fixture_with(replies, OrchestratorConfig::default())
    }

    fn fixture_with(replies: Vec<MockReply>, config: OrchestratorConfig) -> Fixture {
        let db = Database::in_memory().unwrap();
        let clock = Arc::new(ManualClock::default());
        TemplateRepo::new(db.clone()).seed_defaults(clock.now()).unwrap();
        let ledger = LicenseLedger::new(db.clone(), clock.clone());
        let meter = SessionMeter::new(
            Arc::new(InMemoryRegistry::new()),
            ledger,
            clock.clone(),
            MeterConfig::default(),
        );
        let cache = FingerprintCache::new(db.clone(), clock.clone(), CacheConfig::default());
        let responder = Arc::new(MockResponder::new(replies));
        let notifier = BroadcastNotifier::new(16);
        let orchestrator = ConsultationOrchestrator::new(
            db.clone(),
            meter,
            cache,
            responder.clone(),
            Arc::new(notifier.clone()),
            clock.clone(),
            config,
        );
        Fixture {
            orchestrator,
            responder,
            notifier,
            clock,
            db,
        }
    }

    async fn open_trial(f: &Fixture) -> (UserId, SessionId) {
        let user = UserId::new();
        f.orchestrator.meter().ledger().issue_trial(&user).unwrap();
        let opened = f
            .orchestrator
            .open_session(&user, SessionType::AiChat, None)
            .await
            .unwrap();
        (user, opened.session.id)
    }

    async fn open_premium(f: &Fixture) -> (UserId, SessionId) {
        let user = UserId::new();
        let premium = TemplateRepo::new(f.db.clone())
            .find_by_kind(LicenseKind::Premium)
            .unwrap()
            .unwrap();
        f.orchestrator
            .meter()
            .ledger()
            .issue_grant(&user, &premium.id, GrantSource::Purchase)
            .unwrap();
        let opened = f
            .orchestrator
            .open_session(&user, SessionType::AiChat, None)
            .await
            .unwrap();
        (user, opened.session.id)
    }

    #[test]
    fn disclaimer_is_appended_once() {
        let with = with_disclaimer("Respuesta.");
        assert!(with.starts_with("Respuesta."));
        assert!(with.contains("Aviso legal"));
        assert_eq!(with_disclaimer(&with), with);
        let own = "Texto. Esto no constituye asesoramiento jurídico.";
        assert_eq!(with_disclaimer(own), own);
    }

    #[test]
    fn apologies_differ_by_class() {
        assert!(apology(FailureClass::Safety).contains("reformularla"));
        assert!(apology(FailureClass::Unavailable).contains("abogado"));
        assert!(apology(FailureClass::Quota).contains("más tarde"));
        assert_ne!(apology(FailureClass::Generic), apology(FailureClass::Quota));
    }

    #[tokio::test]
    async fn open_without_license_is_denied() {
        let f = fixture(vec![]);
        let err = f
            .orchestrator
            .open_session(&UserId::new(), SessionType::AiChat, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ConsultError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn rejected_start_rolls_back_the_session_row() {
        let f = fixture(vec![]);
        let user = UserId::new();
        f.orchestrator.meter().ledger().issue_trial(&user).unwrap();
        // trial does not cover lawyer chats
        let err = f
            .orchestrator
            .open_session(&user, SessionType::LawyerChat, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ConsultError::AccessDenied(_)));
        assert!(f.orchestrator.meter().list_active().is_empty());
    }

    #[tokio::test]
    async fn validation_happens_before_persistence() {
        let f = fixture(vec![]);
        let (user, sid) = open_trial(&f).await;
        let actor = Actor::user(user.clone());

        for bad in ["", "   ", "<SCRIPT>alert(1)</script>"] {
            let err = f.orchestrator.send_message(&sid, &actor, bad).await.unwrap_err();
            assert!(matches!(err, ConsultError::Validation(_)), "{bad:?}");
        }
        let long = "a".repeat(2001);
        assert!(matches!(
            f.orchestrator.send_message(&sid, &actor, &long).await,
            Err(ConsultError::Validation(_))
        ));
        assert!(f.orchestrator.history(&sid, &actor).await.unwrap().is_empty());
        assert_eq!(f.responder.call_count(), 0);

        assert!(f.orchestrator.validate_message("¿Puedo recurrir una multa?").is_ok());
        assert!(matches!(
            f.orchestrator.validate_message("drop table users"),
            Err(ConsultError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn strangers_cannot_post_or_close() {
        let f = fixture(vec![]);
        let (_, sid) = open_trial(&f).await;
        let stranger = Actor::user(UserId::new());
        assert!(matches!(
            f.orchestrator.send_message(&sid, &stranger, "hola").await,
            Err(ConsultError::AccessDenied(_))
        ));
        assert!(matches!(
            f.orchestrator.close_session(&sid, &stranger, None).await,
            Err(ConsultError::AccessDenied(_))
        ));
        assert!(matches!(
            f.orchestrator.close_session(&sid, &Actor::system(), None).await,
            Err(ConsultError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn responder_failure_yields_apology() {
        let f = fixture(vec![MockReply::Error(ResponderError::SafetyBlocked(
            "blocked".into(),
        ))]);
        let (user, sid) = open_trial(&f).await;
        let out = f
            .orchestrator
            .send_message(&sid, &Actor::user(user), "¿Puedo reclamar una deuda?")
            .await
            .unwrap();
        let reply = out.assistant_message.unwrap();
        assert_eq!(reply.content, apology(FailureClass::Safety));
        assert!(!reply.from_cache);
        assert_eq!(reply.legal_area.as_deref(), Some("civil"));
        // failures are not cached
        assert!(f.orchestrator.cache().lookup("¿Puedo reclamar una deuda?").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_responder_times_out_to_apology() {
        let config = OrchestratorConfig {
            responder_timeout: Duration::from_secs(5),
            ..OrchestratorConfig::default()
        };
        let f = fixture_with(
            vec![MockReply::delayed(Duration::from_secs(30), MockReply::text("tarde"))],
            config,
        );
        let (user, sid) = open_trial(&f).await;
        let out = f
            .orchestrator
            .send_message(&sid, &Actor::user(user), "consulta lenta")
            .await
            .unwrap();
        assert_eq!(out.assistant_message.unwrap().content, apology(FailureClass::Generic));
    }

    #[tokio::test]
    async fn prompt_carries_area_context_and_history() {
        let f = fixture(vec![MockReply::text("Primera."), MockReply::text("Segunda.")]);
        let (user, sid) = open_trial(&f).await;
        let actor = Actor::user(user);

        f.orchestrator.send_message(&sid, &actor, "Hola").await.unwrap();
        f.orchestrator
            .send_message(&sid, &actor, "Me quieren despedir")
            .await
            .unwrap();

        let calls = f.responder.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].history.is_empty());
        assert!(calls[1].prompt.contains("Estatuto de los Trabajadores"));
        assert!(calls[1].prompt.ends_with("Me quieren despedir"));
        assert_eq!(calls[1].history.len(), 2);
        assert_eq!(calls[1].history[0], ChatTurn::user("Hola"));
        assert!(calls[1].history[1].text.starts_with("Primera."));
    }

    #[tokio::test]
    async fn history_window_is_bounded() {
        let config = OrchestratorConfig {
            history_window: 2,
            ..OrchestratorConfig::default()
        };
        let replies = (0..4).map(|i| MockReply::Text(format!("r{i}"))).collect();
        let f = fixture_with(replies, config);
        let (user, sid) = open_trial(&f).await;
        let actor = Actor::user(user);
        for i in 0..4 {
            f.orchestrator
                .send_message(&sid, &actor, &format!("pregunta {i}"))
                .await
                .unwrap();
        }
        let last = f.responder.calls().pop().unwrap();
        assert_eq!(last.history.len(), 2);
        assert_eq!(last.history[0], ChatTurn::user("pregunta 2"));
    }

    #[tokio::test]
    async fn reply_is_pushed_to_the_user() {
        let f = fixture(vec![MockReply::text("ok")]);
        let mut rx = f.notifier.subscribe();
        let (user, sid) = open_trial(&f).await;
        let out = f
            .orchestrator
            .send_message(&sid, &Actor::user(user.clone()), "hola")
            .await
            .unwrap();
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.recipient, user);
        assert_eq!(
            envelope.event,
            ConsultEvent::MessageCreated {
                session_id: sid,
                message_id: out.assistant_message.unwrap().id,
                from_cache: false,
            }
        );
    }

    #[tokio::test]
    async fn lawyer_chat_relays_without_responder() {
        let f = fixture(vec![]);
        let user = UserId::new();
        let lawyer = UserId::new();
        let standard = TemplateRepo::new(f.db.clone())
            .find_by_kind(LicenseKind::Standard)
            .unwrap()
            .unwrap();
        f.orchestrator
            .meter()
            .ledger()
            .issue_grant(&user, &standard.id, GrantSource::Purchase)
            .unwrap();

        let mut rx = f.notifier.subscribe();
        let opened = f
            .orchestrator
            .open_session(&user, SessionType::LawyerChat, Some(lawyer.clone()))
            .await
            .unwrap();
        let sid = opened.session.id;

        let out = f
            .orchestrator
            .send_message(&sid, &Actor::user(user.clone()), "Necesito ayuda con un contrato")
            .await
            .unwrap();
        assert!(out.assistant_message.is_none());
        assert_eq!(rx.recv().await.unwrap().recipient, lawyer);

        let out = f
            .orchestrator
            .send_message(&sid, &Actor::lawyer(lawyer.clone()), "Envíeme el contrato")
            .await
            .unwrap();
        assert_eq!(out.user_message.role, MessageRole::Lawyer);
        assert_eq!(rx.recv().await.unwrap().recipient, user);
        assert_eq!(f.responder.call_count(), 0);

        f.clock.advance(ChronoDuration::minutes(30));
        let closed = f
            .orchestrator
            .close_session(&sid, &Actor::lawyer(lawyer), Some("Revisión de contrato"))
            .await
            .unwrap();
        assert_eq!(closed.hours_consumed, "0.5".parse::<Decimal>().unwrap());
        assert_eq!(closed.session.summary.as_deref(), Some("Revisión de contrato"));
    }

    #[tokio::test]
    async fn closing_twice_is_rejected() {
        let f = fixture(vec![]);
        let (user, sid) = open_trial(&f).await;
        let actor = Actor::user(user);
        let closed = f.orchestrator.close_session(&sid, &actor, None).await.unwrap();
        assert_eq!(closed.hours_consumed, "0.1".parse::<Decimal>().unwrap());
        assert!(closed.session.summary.unwrap().contains("Mensajes: 0"));
        assert!(matches!(
            f.orchestrator.close_session(&sid, &actor, None).await,
            Err(ConsultError::Validation(_))
        ));
        assert!(matches!(
            f.orchestrator.send_message(&sid, &actor, "hola").await,
            Err(ConsultError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn unmetered_session_gets_no_replies() {
        let f = fixture(vec![MockReply::text("no debería responder")]);
        let (user, sid) = open_premium(&f).await;
        f.clock.advance(ChronoDuration::hours(25));
        assert_eq!(f.orchestrator.meter().sweep_zombies(24).len(), 1);

        let err = f
            .orchestrator
            .send_message(&sid, &Actor::user(user), "¿Sigue abierta?")
            .await
            .unwrap_err();
        assert!(matches!(err, ConsultError::AccessDenied(_)));
        assert_eq!(f.responder.call_count(), 0);
    }

    #[tokio::test]
    async fn sweep_closes_chat_records() {
        let f = fixture(vec![]);
        let (user, sid) = open_premium(&f).await;
        let mut rx = f.notifier.subscribe();
        f.clock.advance(ChronoDuration::hours(25));

        let swept = f.orchestrator.sweep_zombies(24);
        assert_eq!(swept.len(), 1);
        assert!(swept[0].billed);

        let record = ChatRepo::new(f.db.clone()).get_session(&sid).unwrap();
        assert_eq!(record.status, ChatStatus::Closed);
        assert_eq!(
            record.metadata.hours_consumed_at_close,
            Some("25.0".parse::<Decimal>().unwrap())
        );
        assert!(record.summary.unwrap().contains("automáticamente"));

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.recipient, user);
        assert!(matches!(envelope.event, ConsultEvent::SessionClosed { .. }));

        let actor = Actor::user(user);
        assert!(matches!(
            f.orchestrator.send_message(&sid, &actor, "hola").await,
            Err(ConsultError::AccessDenied(_))
        ));
        assert!(matches!(
            f.orchestrator.close_session(&sid, &actor, None).await,
            Err(ConsultError::Validation(_))
        ));
        // a second sweep finds nothing left to close
        assert!(f.orchestrator.sweep_zombies(24).is_empty());
    }

    #[tokio::test]
    async fn cache_outage_does_not_block_replies() {
        let f = fixture(vec![MockReply::text("Primera."), MockReply::text("Segunda.")]);
        let (user, sid) = open_trial(&f).await;
        f.db
            .with_conn(|c| Ok(c.execute_batch("DROP TABLE cache_entries")?))
            .unwrap();
        let actor = Actor::user(user);

        let first = f
            .orchestrator
            .send_message(&sid, &actor, "¿Puedo reclamar una deuda?")
            .await
            .unwrap()
            .assistant_message
            .unwrap();
        assert!(first.content.starts_with("Primera."));
        assert!(!first.from_cache);

        let second = f
            .orchestrator
            .send_message(&sid, &actor, "¿Puedo reclamar una deuda?")
            .await
            .unwrap()
            .assistant_message
            .unwrap();
        assert!(second.content.starts_with("Segunda."));
        assert_eq!(f.responder.call_count(), 2);
    }

    #[tokio::test]
    async fn swept_session_still_closes_its_record() {
        let f = fixture(vec![]);
        let (_, sid) = open_trial(&f).await;
        f.orchestrator.meter().force_close(&sid, "admin").unwrap();
        let closed = f
            .orchestrator
            .close_session(&sid, &Actor::admin(UserId::new()), None)
            .await
            .unwrap();
        assert_eq!(closed.hours_consumed, Decimal::ZERO);
        assert_eq!(closed.hours_remaining, None);
        assert_eq!(closed.session.status, ChatStatus::Closed);
    }
}
