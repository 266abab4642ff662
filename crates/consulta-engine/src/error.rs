use rust_decimal::Decimal;

use consulta_core::errors::ResponderError;
use consulta_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("user already holds an active license")]
    AlreadyHasActiveGrant,

    #[error("trial already claimed")]
    TrialAlreadyClaimed,

    #[error("license template not found: {0}")]
    TemplateNotFound(String),

    #[error("insufficient hours: requested {requested}, remaining {remaining}")]
    InsufficientHours { requested: Decimal, remaining: Decimal },

    #[error("no active license")]
    NoActiveGrant,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Why the meter refused to start a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartRejection {
    NoValidLicense,
    SessionAlreadyActive,
}

impl std::fmt::Display for StartRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoValidLicense => write!(f, "no valid license for this session type"),
            Self::SessionAlreadyActive => write!(f, "user already has an active session"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MeterError {
    #[error("session rejected: {0}")]
    Rejected(StartRejection),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session {0} is already being closed")]
    AlreadyClosing(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Errors surfaced by the consultation flow. Each maps to a user-facing message.
#[derive(Debug, thiserror::Error)]
pub enum ConsultError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("insufficient resource: {0}")]
    InsufficientResource(String),

    #[error("upstream failure: {0}")]
    Upstream(#[from] ResponderError),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl ConsultError {
    /// Localized text safe to show an end user.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Validation(_) => "El mensaje no es válido. Revísalo e inténtalo de nuevo.",
            Self::AccessDenied(_) => {
                "No tienes acceso a esta consulta. Comprueba que tu licencia esté activa."
            }
            Self::NotFound(_) => "La consulta solicitada no existe.",
            Self::InsufficientResource(_) => {
                "No te quedan horas disponibles. Adquiere una nueva licencia para continuar."
            }
            Self::Upstream(_) => {
                "El asistente no está disponible en este momento. Inténtalo más tarde."
            }
            Self::Storage(_) => "No hemos podido guardar los cambios. Inténtalo de nuevo.",
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::AccessDenied(_) => "access_denied",
            Self::NotFound(_) => "not_found",
            Self::InsufficientResource(_) => "insufficient_resource",
            Self::Upstream(_) => "upstream",
            Self::Storage(_) => "storage",
        }
    }
}

impl From<StoreError> for ConsultError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self::NotFound(what),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<LedgerError> for ConsultError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::InsufficientHours { .. } => Self::InsufficientResource(e.to_string()),
            LedgerError::NoActiveGrant
            | LedgerError::AlreadyHasActiveGrant
            | LedgerError::TrialAlreadyClaimed => Self::AccessDenied(e.to_string()),
            LedgerError::TemplateNotFound(what) => Self::NotFound(what),
            LedgerError::Store(store) => store.into(),
        }
    }
}

impl From<MeterError> for ConsultError {
    fn from(e: MeterError) -> Self {
        match e {
            MeterError::Rejected(reason) => Self::AccessDenied(reason.to_string()),
            MeterError::NotFound(id) => Self::NotFound(format!("active session {id}")),
            MeterError::AlreadyClosing(id) => {
                Self::Validation(format!("session {id} is already being closed"))
            }
            MeterError::Ledger(ledger) => ledger.into(),
        }
    }
}
