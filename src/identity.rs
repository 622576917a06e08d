use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use log::{debug, info, warn};
use mac_address::MacAddress;

use crate::cache::{CacheStore, DeviceIdentity};

/// An advertising peripheral whose name matched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Discovered {
    pub address: MacAddress,
    pub name: String,
}

#[async_trait]
pub trait Scanner: Send + Sync {
    /// Scan for up to `window`, returning the first peripheral whose
    /// advertised name matches any keyword.
    async fn discover(
        &self,
        keywords: &[String],
        window: Duration,
    ) -> anyhow::Result<Option<Discovered>>;
}

#[async_trait]
impl<T: Scanner + ?Sized> Scanner for std::sync::Arc<T> {
    async fn discover(
        &self,
        keywords: &[String],
        window: Duration,
    ) -> anyhow::Result<Option<Discovered>> {
        (**self).discover(keywords, window).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no matching device advertised within {window:?}")]
    NotFound { window: Duration },
    #[error("discovery failed: {0:#}")]
    Transport(#[from] anyhow::Error),
}

/// Case-insensitive substring match of `name` against any keyword.
pub fn matches_keywords(name: &str, keywords: &[String]) -> bool {
    let name = name.to_lowercase();
    keywords
        .iter()
        .filter(|k| !k.is_empty())
        .any(|k| name.contains(&k.to_lowercase()))
}

pub struct IdentityResolver<S> {
    scanner: S,
    scan_timeout: Duration,
    failure_limit: u32,
    consecutive_failures: u32,
}

impl<S: Scanner> IdentityResolver<S> {
    pub fn new(scanner: S, scan_timeout: Duration, failure_limit: u32) -> Self {
        IdentityResolver {
            scanner,
            scan_timeout,
            failure_limit,
            consecutive_failures: 0,
        }
    }

    /// Return the cached identity, or scan for one when there is none or
    /// `force_rescan` is set. A successful scan overwrites the cache entry.
    pub async fn resolve(
        &mut self,
        cache: &mut CacheStore,
        keywords: &[String],
        force_rescan: bool,
    ) -> Result<DeviceIdentity, ResolveError> {
        if !force_rescan {
            if let Some(identity) = cache.device() {
                debug!("Using cached address {} for {}", identity.address, identity.name);
                return Ok(identity.clone());
            }
        }

        info!(
            "Scanning for {:?} (timeout={}s)",
            keywords,
            self.scan_timeout.as_secs()
        );
        let discovered = self
            .scanner
            .discover(keywords, self.scan_timeout)
            .await?
            .ok_or(ResolveError::NotFound {
                window: self.scan_timeout,
            })?;

        info!("Found device: {} [{}]", discovered.name, discovered.address);
        let identity = DeviceIdentity {
            name: discovered.name,
            address: discovered.address,
            resolved_at: SystemTime::now(),
        };
        self.consecutive_failures = 0;
        cache.set_device(identity.clone());
        Ok(identity)
    }

    /// Drop the cached address so the next `resolve` scans.
    pub fn invalidate(&mut self, cache: &mut CacheStore) {
        self.consecutive_failures = 0;
        cache.clear_device();
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Count a failed direct read against the cached address. Returns true
    /// when the limit was reached and the address was invalidated.
    pub fn record_failure(&mut self, cache: &mut CacheStore) -> bool {
        self.consecutive_failures += 1;
        if self.consecutive_failures < self.failure_limit {
            debug!(
                "Direct read failed ({}/{})",
                self.consecutive_failures, self.failure_limit
            );
            return false;
        }
        warn!(
            "{} consecutive direct read failures; forgetting cached address",
            self.consecutive_failures
        );
        self.invalidate(cache);
        true
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Replays scripted discovery results, then keeps returning the last one.
    pub(crate) struct FakeScanner {
        pub results: Mutex<Vec<Option<Discovered>>>,
        pub calls: AtomicUsize,
    }

    impl FakeScanner {
        pub(crate) fn new(results: Vec<Option<Discovered>>) -> Self {
            FakeScanner {
                results: Mutex::new(results),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Scanner for FakeScanner {
        async fn discover(
            &self,
            _keywords: &[String],
            _window: Duration,
        ) -> anyhow::Result<Option<Discovered>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().unwrap();
            if results.len() > 1 {
                Ok(results.remove(0))
            } else {
                Ok(results.first().cloned().flatten())
            }
        }
    }

    pub(crate) fn discovered(last: u8, name: &str) -> Discovered {
        Discovered {
            address: MacAddress::new([0xC0, 0xFF, 0xEE, 0x00, 0x00, last]),
            name: name.to_string(),
        }
    }

    fn keywords() -> Vec<String> {
        vec!["MX Master".to_string()]
    }

    #[test]
    fn test_matches_keywords() {
        let keywords = vec!["MX Anywhere".to_string(), "logitech".to_string()];
        assert!(matches_keywords("MX Anywhere 3S", &keywords));
        assert!(matches_keywords("LOGITECH Pebble", &keywords));
        assert!(!matches_keywords("Keychron K2", &keywords));
        assert!(!matches_keywords("anything", &[String::new()]));
    }

    #[tokio::test]
    async fn test_cached_identity_skips_scan() {
        let scanner = Arc::new(FakeScanner::new(vec![Some(discovered(1, "MX Master 3"))]));
        let mut resolver = IdentityResolver::new(scanner.clone(), Duration::from_secs(1), 3);
        let mut cache = CacheStore::in_memory();

        let first = resolver.resolve(&mut cache, &keywords(), false).await.unwrap();
        let second = resolver.resolve(&mut cache, &keywords(), false).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(scanner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.device(), Some(&first));
    }

    #[tokio::test]
    async fn test_force_rescan_overwrites_cache() {
        let scanner = Arc::new(FakeScanner::new(vec![
            Some(discovered(1, "MX Master 3")),
            Some(discovered(2, "MX Master 3S")),
        ]));
        let mut resolver = IdentityResolver::new(scanner.clone(), Duration::from_secs(1), 3);
        let mut cache = CacheStore::in_memory();

        resolver.resolve(&mut cache, &keywords(), false).await.unwrap();
        let rescanned = resolver.resolve(&mut cache, &keywords(), true).await.unwrap();

        assert_eq!(rescanned.name, "MX Master 3S");
        assert_eq!(cache.device().map(|d| d.address), Some(discovered(2, "").address));
        assert_eq!(scanner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_not_found_leaves_cache_untouched() {
        let scanner = Arc::new(FakeScanner::new(vec![None]));
        let mut resolver = IdentityResolver::new(scanner, Duration::from_secs(2), 3);
        let mut cache = CacheStore::in_memory();

        let err = resolver.resolve(&mut cache, &keywords(), false).await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound { window } if window == Duration::from_secs(2)));
        assert!(cache.device().is_none());
    }

    #[tokio::test]
    async fn test_failure_limit_invalidates_cache() {
        let scanner = Arc::new(FakeScanner::new(vec![Some(discovered(1, "MX Master 3"))]));
        let mut resolver = IdentityResolver::new(scanner, Duration::from_secs(1), 3);
        let mut cache = CacheStore::in_memory();
        resolver.resolve(&mut cache, &keywords(), false).await.unwrap();

        assert!(!resolver.record_failure(&mut cache));
        assert!(!resolver.record_failure(&mut cache));
        resolver.record_success();
        assert!(!resolver.record_failure(&mut cache));
        assert!(!resolver.record_failure(&mut cache));
        assert!(cache.device().is_some());
        assert!(resolver.record_failure(&mut cache));
        assert!(cache.device().is_none());
    }
}
