use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;

use crate::logger::Logger;
use crate::response::{self, CacheMode, Response};

// capacity bound and sweep cadence of the shared cache.
pub const DEFAULT_MAX_ENTRIES: usize = 50;
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Outcome of a cache lookup, and the classification used for the lifecycle
/// log's cache events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    NotInCache,
    Expired,
    RequiresValidation,
    Valid,
    NotCacheable,
    WillExpire,
    Revalidation,
}

struct CacheEntry {
    response: Arc<Response>,
    /// Instant of the most recent freshness check on this entry.
    #[allow(dead_code)]
    last_checked: SystemTime,
}

struct CacheState {
    map: HashMap<String, CacheEntry>,
    // front is most recently used; the set of urls here always equals the
    // map's key set.
    lru: VecDeque<String>,
    last_cleanup: Instant,
}

/// Shared response cache keyed by canonical url, bounded by `max_entries`
/// with LRU eviction and a periodic expiry sweep amortized onto inserts.
/// Stored responses are shared out by `Arc` so a reader's copy stays valid
/// however the store mutates underneath it.
pub struct Cache {
    state: RwLock<CacheState>,
    max_entries: usize,
    cleanup_interval: Duration,
}

impl Cache {
    pub fn new(max_entries: usize, cleanup_interval: Duration) -> Cache {
        Cache {
            state: RwLock::new(CacheState {
                map: HashMap::new(),
                lru: VecDeque::new(),
                last_cleanup: Instant::now(),
            }),
            max_entries,
            cleanup_interval,
        }
    }

    /// Looks up `url`. Expired entries are still returned so the engine can
    /// reuse their validators; fresh normal entries get their LRU position
    /// and last-checked time refreshed.
    pub fn get(&self, url: &str) -> (CacheStatus, Option<Arc<Response>>) {
        let state = self.state.read().unwrap();
        let response = match state.map.get(url) {
            Some(entry) => Arc::clone(&entry.response),
            None => return (CacheStatus::NotInCache, None),
        };

        if is_expired(&response) {
            drop(state);
            let state = self.state.write().unwrap();
            // the entry may have been evicted while the lock was released;
            // if so this is a plain miss.
            return match state.map.get(url) {
                Some(entry) => (CacheStatus::Expired, Some(Arc::clone(&entry.response))),
                None => (CacheStatus::NotInCache, None),
            };
        }

        if response.cache_mode == CacheMode::Immutable {
            drop(state);
            return self.touch(url);
        }

        if response.cache_mode == CacheMode::MustRevalidate {
            return (CacheStatus::RequiresValidation, Some(response));
        }

        drop(state);
        self.touch(url)
    }

    // upgrade to the write lock and refresh the entry's recency. the key is
    // looked up again because another writer may have evicted it in between.
    fn touch(&self, url: &str) -> (CacheStatus, Option<Arc<Response>>) {
        let mut state = self.state.write().unwrap();
        let state = &mut *state;
        match state.map.get_mut(url) {
            Some(entry) => {
                entry.last_checked = SystemTime::now();
                let response = Arc::clone(&entry.response);
                update_lru(&mut state.lru, url);
                (CacheStatus::Valid, Some(response))
            }
            None => (CacheStatus::NotInCache, None),
        }
    }

    /// Inserts `response` under `url`. No-store responses are never admitted.
    /// When the sweep interval has elapsed, expired entries are cleared first;
    /// when the store is full, LRU tails are evicted to make room.
    pub fn put(&self, url: &str, response: Arc<Response>, logger: &Logger) {
        if response.cache_mode == CacheMode::NoStore {
            return;
        }

        let mut state = self.state.write().unwrap();
        let state = &mut *state;

        if state.last_cleanup.elapsed() >= self.cleanup_interval {
            sweep_expired(state, logger);
        }

        if let Some(entry) = state.map.get_mut(url) {
            entry.response = response;
            entry.last_checked = SystemTime::now();
            update_lru(&mut state.lru, url);
            return;
        }

        while state.map.len() >= self.max_entries {
            let Some(victim) = state.lru.pop_back() else {
                break;
            };
            state.map.remove(&victim);
            logger.log_note(-1, &format!("evicted {} from cache", victim));
        }

        state.map.insert(
            url.to_string(),
            CacheEntry {
                response,
                last_checked: SystemTime::now(),
            },
        );
        update_lru(&mut state.lru, url);
    }

    pub fn size(&self) -> usize {
        self.state.read().unwrap().map.len()
    }
}

fn update_lru(lru: &mut VecDeque<String>, url: &str) {
    lru.retain(|u| u != url);
    lru.push_front(url.to_string());
}

fn sweep_expired(state: &mut CacheState, logger: &Logger) {
    state.last_cleanup = Instant::now();
    let expired: Vec<String> = state
        .map
        .iter()
        .filter(|(_, entry)| is_expired(&entry.response))
        .map(|(url, _)| url.clone())
        .collect();
    for url in expired {
        state.map.remove(&url);
        state.lru.retain(|u| u != &url);
        logger.log_note(-1, &format!("removing expired entry: {}", url));
    }
}

/// An entry with no expiration instant, or one that fails to parse, counts
/// as expired; otherwise it is compared against the wall clock.
pub fn is_expired(response: &Response) -> bool {
    if response.expire_time.is_empty() {
        return true;
    }
    match response::parse_http_date(&response.expire_time) {
        Some(expires) => Utc::now() > expires,
        None => true,
    }
}
