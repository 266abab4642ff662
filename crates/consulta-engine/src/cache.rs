use std::sync::{Arc, LazyLock};

use chrono::Duration;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use consulta_core::clock::Clock;
use consulta_store::cache::{CacheEntryRow, CacheRead, CacheRepo, CacheStats};
use consulta_store::Database;

use crate::classifier::LegalArea;
use crate::config::CacheConfig;

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace pattern"));
static NON_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s]").expect("valid non-word pattern"));

/// Lowercase, trim, collapse whitespace runs, then drop everything that is
/// neither a word character nor whitespace.
pub fn normalize_query(query: &str) -> String {
    let lowered = query.to_lowercase();
    let collapsed = WHITESPACE.replace_all(lowered.trim(), " ");
    NON_WORD.replace_all(&collapsed, "").into_owned()
}

/// SHA-256 of the normalized query, as lowercase hex. Stable across restarts.
pub fn compute_fingerprint(query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_query(query).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A reply served from the cache.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedReply {
    pub response: String,
    pub legal_area: Option<LegalArea>,
    pub hit_count: u32,
}

/// Response cache keyed by query fingerprint.
///
/// Storage failures never escape: reads degrade to a miss and writes to a no-op.
#[derive(Clone)]
pub struct FingerprintCache {
    repo: Arc<CacheRepo>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
}

impl FingerprintCache {
    pub fn new(db: Database, clock: Arc<dyn Clock>, config: CacheConfig) -> Self {
        Self {
            repo: Arc::new(CacheRepo::new(db)),
            clock,
            config,
        }
    }

    pub fn default_ttl_hours(&self) -> i64 {
        self.config.ttl_hours
    }

    /// Look up a previous reply. Counts the hit, or evicts the entry if it has expired.
    #[instrument(skip_all)]
    pub fn lookup(&self, query: &str) -> Option<CachedReply> {
        let fingerprint = compute_fingerprint(query);
        match self.repo.read_and_touch(&fingerprint, self.clock.now()) {
            Ok(CacheRead::Hit(entry)) => {
                debug!(fingerprint = %fingerprint, hits = entry.hit_count, "cache hit");
                Some(CachedReply {
                    legal_area: entry.legal_area.as_deref().and_then(|a| a.parse().ok()),
                    response: entry.response,
                    hit_count: entry.hit_count,
                })
            }
            Ok(CacheRead::Expired) => {
                debug!(fingerprint = %fingerprint, "cache entry expired, evicted");
                None
            }
            Ok(CacheRead::Miss) => None,
            Err(e) => {
                warn!(fingerprint = %fingerprint, error = %e, "cache lookup failed, treating as miss");
                None
            }
        }
    }

    /// Upsert a reply. Re-storing an existing fingerprint resets its hit count to 1.
    #[instrument(skip(self, query, response))]
    pub fn store(&self, query: &str, response: &str, area: Option<LegalArea>, ttl_hours: i64) {
        let now = self.clock.now();
        let entry = CacheEntryRow {
            fingerprint: compute_fingerprint(query),
            query: query.to_string(),
            response: response.to_string(),
            legal_area: area.map(|a| a.to_string()),
            hit_count: 1,
            last_used_at: now,
            expires_at: now + Duration::hours(ttl_hours),
            created_at: now,
        };
        if let Err(e) = self.repo.upsert(&entry) {
            warn!(fingerprint = %entry.fingerprint, error = %e, "cache store failed");
        }
    }

    /// Store with the configured TTL.
    pub fn store_default(&self, query: &str, response: &str, area: Option<LegalArea>) {
        self.store(query, response, area, self.config.ttl_hours);
    }

    /// Delete every expired entry. Returns 0 when the store is unavailable.
    pub fn purge_expired(&self) -> usize {
        match self.repo.purge_expired(self.clock.now()) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "cache purge failed");
                0
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.repo.stats(self.clock.now()).unwrap_or_else(|e| {
            warn!(error = %e, "cache stats unavailable");
            CacheStats::default()
        })
    }

    /// Most-hit entries first.
    pub fn top(&self, limit: u32) -> Vec<CacheEntryRow> {
        self.repo.top(limit).unwrap_or_else(|e| {
            warn!(error = %e, "cache top unavailable");
            Vec::new()
        })
    }

    /// Drop the entry for `query`, if any.
    pub fn invalidate(&self, query: &str) -> bool {
        let fingerprint = compute_fingerprint(query);
        self.repo.delete(&fingerprint).unwrap_or_else(|e| {
            warn!(fingerprint = %fingerprint, error = %e, "cache invalidate failed");
            false
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consulta_core::clock::ManualClock;

    fn cache() -> (FingerprintCache, Arc<ManualClock>) {
        let db = Database::in_memory().unwrap();
        let clock = Arc::new(ManualClock::default());
        let cache = FingerprintCache::new(db, clock.clone(), CacheConfig::default());
        (cache, clock)
    }

    #[test]
    fn normalize_strips_case_punctuation_and_spacing() {
        assert_eq!(normalize_query("  ¿Puedo  demandar? "), "puedo demandar");
        assert_eq!(normalize_query("¿Cómo DESPIDO a un empleado?"), "cómo despido a un empleado");
        assert_eq!(normalize_query("a\t\nb"), "a b");
    }

    #[test]
    fn equivalent_queries_share_a_fingerprint() {
        assert_eq!(
            compute_fingerprint("¿Puedo  demandar?"),
            compute_fingerprint("puedo demandar")
        );
        assert_ne!(
            compute_fingerprint("puedo demandar"),
            compute_fingerprint("puedo recurrir")
        );
    }

    #[test]
    fn fingerprint_is_sha256_hex() {
        // sha256("")
        assert_eq!(
            compute_fingerprint("  ?? "),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(compute_fingerprint("hola").len(), 64);
    }

    #[test]
    fn store_then_lookup_counts_hits() {
        let (cache, _) = cache();
        assert!(cache.lookup("¿Qué es un ERE?").is_none());
        cache.store("¿Qué es un ERE?", "Un expediente...", Some(LegalArea::Laboral), 168);

        // accents are word characters, so they are kept
        assert!(cache.lookup("que es un ere").is_none());

        let hit = cache.lookup("qué es un ERE").unwrap();
        assert_eq!(hit.response, "Un expediente...");
        assert_eq!(hit.legal_area, Some(LegalArea::Laboral));
        assert_eq!(hit.hit_count, 2);
        assert_eq!(cache.lookup("¿QUÉ ES UN ERE?").unwrap().hit_count, 3);
    }

    #[test]
    fn zero_ttl_entry_expires_and_is_evicted() {
        let (cache, clock) = cache();
        cache.store("pregunta", "respuesta", None, 0);
        clock.advance(Duration::seconds(1));
        assert!(cache.lookup("pregunta").is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn restore_resets_hit_count() {
        let (cache, _) = cache();
        cache.store("q", "v1", None, 168);
        cache.lookup("q");
        cache.lookup("q");
        cache.store("q", "v2", None, 168);
        let hit = cache.lookup("q").unwrap();
        assert_eq!(hit.response, "v2");
        assert_eq!(hit.hit_count, 2);
    }

    #[test]
    fn purge_and_invalidate() {
        let (cache, clock) = cache();
        cache.store("old", "x", None, 1);
        cache.store("new", "y", None, 48);
        clock.advance(Duration::hours(2));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.purge_expired(), 0);
        assert!(cache.invalidate("NEW"));
        assert!(!cache.invalidate("new"));
    }

    #[test]
    fn storage_failure_degrades_to_miss() {
        let db = Database::in_memory().unwrap();
        let cache = FingerprintCache::new(
            db.clone(),
            Arc::new(ManualClock::default()),
            CacheConfig::default(),
        );
        db.with_conn(|c| Ok(c.execute_batch("DROP TABLE cache_entries")?))
            .unwrap();

        cache.store_default("pregunta", "respuesta", None);
        assert!(cache.lookup("pregunta").is_none());
        assert_eq!(cache.purge_expired(), 0);
        assert!(!cache.invalidate("pregunta"));
        assert!(cache.top(5).is_empty());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn top_orders_by_hits() {
        let (cache, _) = cache();
        cache.store("a", "1", None, 168);
        cache.store("b", "2", None, 168);
        cache.lookup("b");
        let top = cache.top(10);
        assert_eq!(top[0].query, "b");
        assert_eq!(cache.stats().total_hits, 3);
    }
}
