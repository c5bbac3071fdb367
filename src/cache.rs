// =============================================================================
// Single-flight TTL cache — dedups concurrent fetches of the same resource
// =============================================================================
//
// A `TtlCell` holds one cached value. Concurrent callers of `get_or_fetch`
// queue on an async mutex: the first runs the fetch, the rest find a fresh
// value when they acquire the lock and return it without touching the
// network. Used for the exchange client's mids/account/open-orders caches
// and the recovery monitor's data fetch.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One cached value with a freshness deadline.
pub struct TtlCell<T: Clone> {
    ttl: Duration,
    state: tokio::sync::Mutex<Option<(T, Instant)>>,
}

impl<T: Clone> TtlCell<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: tokio::sync::Mutex::new(None),
        }
    }

    /// Return the cached value if fresh, otherwise run `fetch` and cache its
    /// result. The lock is held across the fetch, which is what serializes
    /// concurrent callers onto a single flight.
    pub async fn get_or_fetch<F, Fut, E>(&self, fetch: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut slot = self.state.lock().await;
        if let Some((value, fetched_at)) = slot.as_ref() {
            if fetched_at.elapsed() < self.ttl {
                return Ok(value.clone());
            }
        }
        let value = fetch().await?;
        *slot = Some((value.clone(), Instant::now()));
        Ok(value)
    }

    /// Peek without fetching. Returns `None` when empty or stale.
    pub async fn peek(&self) -> Option<T> {
        let slot = self.state.lock().await;
        slot.as_ref()
            .filter(|(_, at)| at.elapsed() < self.ttl)
            .map(|(v, _)| v.clone())
    }

    /// Drop any cached value so the next reader re-fetches.
    pub async fn invalidate(&self) {
        *self.state.lock().await = None;
    }
}

/// Keyed variant: one `TtlCell` per key, created on first use.
pub struct SingleFlight<K, T: Clone> {
    ttl: Duration,
    cells: parking_lot::Mutex<HashMap<K, Arc<TtlCell<T>>>>,
}

impl<K: Eq + Hash + Clone, T: Clone> SingleFlight<K, T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cells: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn cell(&self, key: &K) -> Arc<TtlCell<T>> {
        let mut cells = self.cells.lock();
        cells
            .entry(key.clone())
            .or_insert_with(|| Arc::new(TtlCell::new(self.ttl)))
            .clone()
    }

    pub async fn get_or_fetch<F, Fut, E>(&self, key: &K, fetch: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.cell(key).get_or_fetch(fetch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn second_read_within_ttl_is_cached() {
        let cell = TtlCell::new(Duration::from_secs(60));
        let fetches = AtomicU32::new(0);

        for _ in 0..3 {
            let v: Result<u32, ()> = cell
                .get_or_fetch(|| async {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await;
            assert_eq!(v.unwrap(), 7);
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_readers_share_one_flight() {
        let cell = Arc::new(TtlCell::new(Duration::from_secs(60)));
        let fetches = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cell = cell.clone();
            let fetches = fetches.clone();
            handles.push(tokio::spawn(async move {
                let v: Result<u32, ()> = cell
                    .get_or_fetch(|| async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(1)
                    })
                    .await;
                v.unwrap()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), 1);
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let cell = TtlCell::new(Duration::from_secs(60));
        let fetches = AtomicU32::new(0);

        let _: Result<u32, ()> = cell
            .get_or_fetch(|| async {
                fetches.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await;
        cell.invalidate().await;
        assert!(cell.peek().await.is_none());

        let _: Result<u32, ()> = cell
            .get_or_fetch(|| async {
                fetches.fetch_add(1, Ordering::SeqCst);
                Ok(2)
            })
            .await;
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fetch_error_is_not_cached() {
        let cell = TtlCell::new(Duration::from_secs(60));

        let first: Result<u32, &str> = cell.get_or_fetch(|| async { Err("boom") }).await;
        assert!(first.is_err());

        let second: Result<u32, &str> = cell.get_or_fetch(|| async { Ok(3) }).await;
        assert_eq!(second.unwrap(), 3);
    }

    #[tokio::test]
    async fn keyed_cells_are_independent() {
        let flight: SingleFlight<String, u32> = SingleFlight::new(Duration::from_secs(60));

        let a: Result<u32, ()> = flight
            .get_or_fetch(&"BTC".to_string(), || async { Ok(1) })
            .await;
        let b: Result<u32, ()> = flight
            .get_or_fetch(&"ETH".to_string(), || async { Ok(2) })
            .await;
        assert_eq!(a.unwrap(), 1);
        assert_eq!(b.unwrap(), 2);
    }
}
