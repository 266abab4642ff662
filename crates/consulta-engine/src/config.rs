use std::time::Duration;

use rust_decimal::Decimal;

#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Lifetime of a stored reply.
    pub ttl_hours: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_hours: 168 }
    }
}

#[derive(Clone, Debug)]
pub struct MeterConfig {
    /// Smallest amount any session is billed.
    pub min_billable_hours: Decimal,
    /// Elapsed time is rounded to the nearest multiple of this.
    pub rounding_step_hours: Decimal,
    /// Sessions older than this are swept as zombies.
    pub zombie_max_age_hours: i64,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            min_billable_hours: Decimal::new(1, 1),
            rounding_step_hours: Decimal::new(1, 1),
            zombie_max_age_hours: 24,
        }
    }
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub max_message_chars: usize,
    /// How many previous messages are sent to the responder as context.
    pub history_window: u32,
    pub responder_timeout: Duration,
    /// Lower-cased substrings that make a message invalid.
    pub deny_list: Vec<String>,
    pub system_prompt: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_message_chars: 2000,
            history_window: 10,
            responder_timeout: Duration::from_secs(60),
            deny_list: vec![
                "<script".to_string(),
                "javascript:".to_string(),
                "drop table".to_string(),
            ],
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = "Eres un asistente jurídico especializado en derecho español. \
Responde en español, con claridad y citando la normativa aplicable cuando sea posible. \
Si la consulta requiere el análisis de documentos o una estrategia procesal, recomienda hablar con un abogado.";

#[derive(Clone, Debug)]
pub struct MaintenanceConfig {
    pub interval: Duration,
    pub zombie_max_age_hours: i64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
            zombie_max_age_hours: 24,
        }
    }
}
