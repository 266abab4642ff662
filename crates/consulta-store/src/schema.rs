/// SQL DDL for the consulta store.
/// WAL mode + foreign keys enabled at connection time.
/// Hours are stored as decimal TEXT, timestamps as fixed-width RFC 3339 UTC TEXT
/// so lexical comparison matches chronological order.
pub const SCHEMA_VERSION: u32 = 1;

/// `validity_days` value meaning "never expires".
pub const UNLIMITED_VALIDITY_DAYS: i64 = 36_500;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS license_templates (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL,
    hours_total TEXT NOT NULL,
    validity_days INTEGER NOT NULL,
    tier TEXT NOT NULL,
    price_cents INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS license_grants (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    template_id TEXT NOT NULL REFERENCES license_templates(id),
    hours_remaining TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    source TEXT NOT NULL,
    issued_at TEXT NOT NULL,
    expires_at TEXT
);

CREATE TABLE IF NOT EXISTS usage_metrics (
    user_id TEXT PRIMARY KEY,
    hours_used TEXT NOT NULL,
    session_count INTEGER NOT NULL DEFAULT 0,
    last_session_at TEXT
);

CREATE TABLE IF NOT EXISTS cache_entries (
    fingerprint TEXT PRIMARY KEY,
    query TEXT NOT NULL,
    response TEXT NOT NULL,
    legal_area TEXT,
    hit_count INTEGER NOT NULL DEFAULT 1,
    last_used_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chat_sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    grant_id TEXT NOT NULL REFERENCES license_grants(id),
    lawyer_id TEXT,
    chat_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    metadata TEXT NOT NULL,
    summary TEXT,
    started_at TEXT NOT NULL,
    ended_at TEXT
);

CREATE TABLE IF NOT EXISTS chat_messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES chat_sessions(id),
    sequence INTEGER NOT NULL,
    sender_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    from_cache INTEGER NOT NULL DEFAULT 0,
    legal_area TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    action TEXT NOT NULL,
    session_id TEXT,
    session_type TEXT,
    duration_secs INTEGER,
    hours TEXT,
    detail TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_grants_user_status ON license_grants(user_id, status);
CREATE INDEX IF NOT EXISTS idx_grants_source ON license_grants(user_id, source);
CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache_entries(expires_at);
CREATE INDEX IF NOT EXISTS idx_chat_sessions_user ON chat_sessions(user_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_session_seq ON chat_messages(session_id, sequence);
CREATE INDEX IF NOT EXISTS idx_audit_user ON audit_log(user_id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
