//! Server-side response cache with weak ETags and conditional-request
//! handling. Only successful GET responses with a body are stored.

use crate::settings::CacheSettings;
use axum::http::Method;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::hash::Hasher;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub etag: String,
    created: Instant,
    ttl: Duration,
}

impl CachedResponse {
    fn is_expired(&self) -> bool {
        self.created.elapsed() > self.ttl
    }
}

/// The outcome of a cache probe.
#[derive(Debug)]
pub enum CacheLookup {
    /// Serve the stored response with `X-Cache: HIT`.
    Hit(CachedResponse),
    /// The client's `If-None-Match` matched; serve 304 with this ETag.
    NotModified(String),
    /// Invoke the downstream handler.
    Miss,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

#[derive(Debug, Default)]
struct CacheState {
    map: HashMap<String, CachedResponse>,
    // insertion order, oldest first
    order: VecDeque<String>,
    total_bytes: usize,
}

#[derive(Debug)]
pub struct ResponseCache {
    settings: CacheSettings,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResponseCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(CacheState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn ttl(&self) -> Duration {
        self.settings.default_ttl
    }

    /// The canonical fingerprint of a request: method, path, query
    /// parameters sorted by key, and the negotiation headers.
    pub fn fingerprint(
        method: &Method,
        path: &str,
        query_pairs: &[(String, String)],
        accept: Option<&str>,
        accept_charset: Option<&str>,
    ) -> String {
        let mut pairs = query_pairs.to_vec();
        pairs.sort();
        let query: Vec<String> = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!(
            "{} {}?{} accept={} charset={}",
            method,
            path,
            query.join("&"),
            accept.unwrap_or(""),
            accept_charset.unwrap_or(""),
        )
    }

    pub fn lookup(&self, key: &str, if_none_match: Option<&str>) -> CacheLookup {
        if !self.settings.enabled {
            return CacheLookup::Miss;
        }
        let entry = {
            let mut state = self.state.lock().unwrap();
            match state.map.get(key) {
                Some(entry) if entry.is_expired() => {
                    remove_entry(&mut state, key);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    None
                }
                Some(entry) => Some(entry.clone()),
                None => None,
            }
        };
        let Some(entry) = entry else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return CacheLookup::Miss;
        };
        self.hits.fetch_add(1, Ordering::Relaxed);
        if let Some(condition) = if_none_match {
            if etag_matches(condition, &entry.etag) {
                return CacheLookup::NotModified(entry.etag);
            }
        }
        CacheLookup::Hit(entry)
    }

    /// Store a successful response, returning the entry (with its ETag) to
    /// decorate the outgoing response. Anything other than a 200 with a
    /// non-empty body passes through unstored.
    pub fn store(
        &self,
        key: &str,
        status: u16,
        headers: &[(String, String)],
        body: &Bytes,
    ) -> Option<CachedResponse> {
        if !self.settings.enabled || status != 200 || body.is_empty() {
            return None;
        }
        let etag = weak_etag(key, body);
        let mut stored_headers: Vec<(String, String)> = headers
            .iter()
            .filter(|(name, _)| {
                !name.eq_ignore_ascii_case("etag") && !name.eq_ignore_ascii_case("cache-control")
            })
            .cloned()
            .collect();
        stored_headers.push(("ETag".to_string(), etag.clone()));
        stored_headers.push((
            "Cache-Control".to_string(),
            format!("public, max-age={}", self.settings.default_ttl.as_secs()),
        ));
        let entry = CachedResponse {
            status,
            headers: stored_headers,
            body: body.clone(),
            etag,
            created: Instant::now(),
            ttl: self.settings.default_ttl,
        };

        let mut state = self.state.lock().unwrap();
        if state.map.contains_key(key) {
            remove_entry(&mut state, key);
        }
        while !state.map.is_empty()
            && (state.map.len() >= self.settings.max_entries
                || state.total_bytes + body.len() > self.settings.max_bytes)
        {
            let Some(oldest) = state.order.front().cloned() else {
                break;
            };
            remove_entry(&mut state, &oldest);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = oldest, "evicted cache entry");
        }
        state.total_bytes += entry.body.len();
        state.order.push_back(key.to_string());
        state.map.insert(key.to_string(), entry.clone());
        Some(entry)
    }

    /// Drop entries touching one study: its own resources and the study
    /// collection searches that may list it.
    pub fn invalidate_study(&self, study_uid: &str) {
        let needle = format!("/studies/{study_uid}");
        let mut state = self.state.lock().unwrap();
        let keys: Vec<String> = state
            .map
            .keys()
            .filter(|k| k.contains(&needle) || k.contains("/studies?"))
            .cloned()
            .collect();
        for key in keys {
            remove_entry(&mut state, &key);
        }
    }

    pub fn invalidate_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.map.clear();
        state.order.clear();
        state.total_bytes = 0;
    }

    /// Invalidation hook for mutating requests. Called for every POST, PUT
    /// and DELETE that reached a handler.
    pub fn invalidate_for(&self, method: &Method, path: &str) {
        if *method != Method::POST && *method != Method::PUT && *method != Method::DELETE {
            return;
        }
        if let Some(study_uid) = path
            .split_once("/studies/")
            .map(|(_, rest)| rest.split('/').next().unwrap_or(rest))
            .filter(|uid| !uid.is_empty())
        {
            self.invalidate_study(study_uid);
        } else {
            self.invalidate_all();
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.state.lock().unwrap().map.len(),
        }
    }
}

fn remove_entry(state: &mut CacheState, key: &str) {
    if let Some(entry) = state.map.remove(key) {
        state.total_bytes -= entry.body.len();
        state.order.retain(|k| k != key);
    }
}

fn weak_etag(key: &str, body: &Bytes) -> String {
    let mut hasher = seahash::SeaHasher::new();
    hasher.write(key.as_bytes());
    hasher.write(body);
    format!("W/\"{:016x}\"", hasher.finish())
}

/// An `If-None-Match` value matches when it is `*` or lists the stored ETag.
fn etag_matches(condition: &str, etag: &str) -> bool {
    condition.trim() == "*" || condition.split(',').any(|c| c.trim() == etag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::*;

    fn key_for(path: &str) -> String {
        ResponseCache::fingerprint(&Method::GET, path, &[], Some("application/dicom+json"), None)
    }

    #[fixture]
    fn cache() -> ResponseCache {
        ResponseCache::new(CacheSettings::default())
    }

    #[rstest]
    fn test_store_then_lookup_returns_same_body(cache: ResponseCache) {
        let key = key_for("/dicom-web/studies");
        let body = Bytes::from_static(b"[]");
        let entry = cache.store(&key, 200, &[], &body).expect("stored");
        match cache.lookup(&key, None) {
            CacheLookup::Hit(hit) => {
                assert_eq!(hit.body, body);
                assert_eq!(hit.etag, entry.etag);
                assert!(hit.etag.starts_with("W/\""));
            }
            other => panic!("expected hit, got {other:?}"),
        }
    }

    #[rstest]
    fn test_if_none_match_yields_not_modified(cache: ResponseCache) {
        let key = key_for("/dicom-web/studies");
        let entry = cache.store(&key, 200, &[], &Bytes::from_static(b"[]")).unwrap();
        assert!(matches!(
            cache.lookup(&key, Some(&entry.etag)),
            CacheLookup::NotModified(_)
        ));
        assert!(matches!(
            cache.lookup(&key, Some("*")),
            CacheLookup::NotModified(_)
        ));
        assert!(matches!(
            cache.lookup(&key, Some("W/\"something-else\"")),
            CacheLookup::Hit(_)
        ));
    }

    #[rstest]
    fn test_non_200_and_empty_bodies_not_stored(cache: ResponseCache) {
        assert!(cache.store("a", 404, &[], &Bytes::from_static(b"x")).is_none());
        assert!(cache.store("b", 200, &[], &Bytes::new()).is_none());
        assert!(matches!(cache.lookup("a", None), CacheLookup::Miss));
    }

    #[test]
    fn test_capacity_eviction_is_oldest_first() {
        let cache = ResponseCache::new(CacheSettings {
            max_entries: 2,
            ..Default::default()
        });
        cache.store("k1", 200, &[], &Bytes::from_static(b"1")).unwrap();
        cache.store("k2", 200, &[], &Bytes::from_static(b"2")).unwrap();
        cache.store("k3", 200, &[], &Bytes::from_static(b"3")).unwrap();
        assert!(matches!(cache.lookup("k1", None), CacheLookup::Miss));
        assert!(matches!(cache.lookup("k2", None), CacheLookup::Hit(_)));
        assert!(matches!(cache.lookup("k3", None), CacheLookup::Hit(_)));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_disabled_cache_is_pass_through() {
        let cache = ResponseCache::new(CacheSettings::disabled());
        assert!(cache.store("k", 200, &[], &Bytes::from_static(b"x")).is_none());
        assert!(matches!(cache.lookup("k", None), CacheLookup::Miss));
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[rstest]
    fn test_invalidate_by_study(cache: ResponseCache) {
        let study_key = key_for("/dicom-web/studies/1.2.3/metadata");
        let other_key = key_for("/dicom-web/studies/9.9.9/metadata");
        cache.store(&study_key, 200, &[], &Bytes::from_static(b"m")).unwrap();
        cache.store(&other_key, 200, &[], &Bytes::from_static(b"m")).unwrap();
        cache.invalidate_for(&Method::POST, "/dicom-web/studies/1.2.3");
        assert!(matches!(cache.lookup(&study_key, None), CacheLookup::Miss));
        assert!(matches!(cache.lookup(&other_key, None), CacheLookup::Hit(_)));
    }

    #[rstest]
    fn test_workitem_mutation_invalidates_all(cache: ResponseCache) {
        let key = key_for("/dicom-web/workitems");
        cache.store(&key, 200, &[], &Bytes::from_static(b"[]")).unwrap();
        cache.invalidate_for(&Method::PUT, "/dicom-web/workitems/1.2.3/state");
        assert!(matches!(cache.lookup(&key, None), CacheLookup::Miss));
    }

    #[rstest]
    fn test_get_does_not_invalidate(cache: ResponseCache) {
        let key = key_for("/dicom-web/studies");
        cache.store(&key, 200, &[], &Bytes::from_static(b"[]")).unwrap();
        cache.invalidate_for(&Method::GET, "/dicom-web/studies");
        assert!(matches!(cache.lookup(&key, None), CacheLookup::Hit(_)));
    }

    #[rstest]
    fn test_stats_count_hits_and_misses(cache: ResponseCache) {
        let key = key_for("/dicom-web/studies");
        cache.lookup(&key, None);
        cache.store(&key, 200, &[], &Bytes::from_static(b"[]")).unwrap();
        cache.lookup(&key, None);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
    }
}
