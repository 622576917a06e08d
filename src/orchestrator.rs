use std::collections::HashSet;
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};
use tokio::time::timeout;

use crate::ble::{LowEnergyReader, LowEnergyResult};
use crate::cache::{CacheStore, DeviceIdentity};
use crate::device_store::{DeviceStore, FallbackResult};
use crate::identity::{IdentityResolver, ResolveError, Scanner};
use crate::reading::{BatteryReading, Source};

const DEFAULT_DEVICE_NAME: &str = "Bluetooth device";

#[derive(Clone, Debug)]
pub struct AcquireOptions {
    pub keywords: Vec<String>,
    /// Shown until the device has been resolved once.
    pub device_name: Option<String>,
    pub connect_timeout: Duration,
    pub fallback_timeout: Duration,
    pub stale_after: Duration,
}

/// Sequences the direct read and the device-store fallback and turns their
/// outcomes into exactly one [`BatteryReading`] per cycle.
pub struct Orchestrator<S, L, F> {
    resolver: IdentityResolver<S>,
    low_energy: L,
    fallback: F,
    cache: CacheStore,
    options: AcquireOptions,
    last_good: Option<BatteryReading>,
    rescan_requested: bool,
}

impl<S, L, F> Orchestrator<S, L, F>
where
    S: Scanner,
    L: LowEnergyReader,
    F: DeviceStore,
{
    pub fn new(
        resolver: IdentityResolver<S>,
        low_energy: L,
        fallback: F,
        cache: CacheStore,
        options: AcquireOptions,
    ) -> Self {
        let last_good = cache
            .last_reading()
            .filter(|r| r.is_fresh_source() && r.percent.is_some())
            .cloned();
        if let Some(reading) = &last_good {
            debug!("Restored last reading {}", reading);
        }
        Orchestrator {
            resolver,
            low_energy,
            fallback,
            cache,
            options,
            last_good,
            rescan_requested: false,
        }
    }

    pub fn device_name(&self) -> String {
        self.cache
            .device()
            .map(|d| d.name.clone())
            .or_else(|| self.options.device_name.clone())
            .unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_string())
    }

    /// Forget the cached address; the next cycle always scans.
    pub fn rescan(&mut self) {
        info!("Rescan requested");
        self.resolver.invalidate(&mut self.cache);
        self.rescan_requested = true;
    }

    pub async fn acquire(&mut self) -> BatteryReading {
        self.acquire_at(SystemTime::now()).await
    }

    pub async fn acquire_at(&mut self, now: SystemTime) -> BatteryReading {
        let force_rescan = std::mem::take(&mut self.rescan_requested);
        let resolved = self
            .resolver
            .resolve(&mut self.cache, &self.options.keywords, force_rescan)
            .await;

        let identity = match resolved {
            Ok(identity) => Some(identity),
            Err(err @ ResolveError::NotFound { .. }) => {
                info!("{}", err);
                None
            }
            Err(err) => {
                warn!("{}", err);
                None
            }
        };

        if let Some(identity) = &identity {
            if let Some(reading) = self.read_low_energy(identity, now).await {
                return self.accept(reading);
            }
        }

        if let Some(reading) = self.read_fallback(identity.as_ref(), now).await {
            return self.accept(reading);
        }

        self.degrade(now)
    }

    async fn read_low_energy(
        &mut self,
        identity: &DeviceIdentity,
        now: SystemTime,
    ) -> Option<BatteryReading> {
        match self
            .low_energy
            .read_battery(identity, self.options.connect_timeout)
            .await
        {
            LowEnergyResult::Success(percent) => {
                self.resolver.record_success();
                Some(BatteryReading::fresh(
                    percent,
                    identity.name.clone(),
                    Source::LowEnergy,
                    now,
                ))
            }
            LowEnergyResult::Unavailable(reason) => {
                info!("{} unreachable over BLE: {}", identity.name, reason);
                self.resolver.record_failure(&mut self.cache);
                None
            }
            LowEnergyResult::Error(detail) => {
                warn!(
                    "BLE read from {} [{}] failed: {}",
                    identity.name, identity.address, detail
                );
                self.resolver.record_failure(&mut self.cache);
                None
            }
        }
    }

    /// The resolved name first, then the configured name, then each keyword,
    /// without case-insensitive repeats.
    fn fallback_hints(&self, identity: Option<&DeviceIdentity>) -> Vec<String> {
        let mut hints: Vec<String> = identity.map(|i| i.name.clone()).into_iter().collect();
        hints.extend(self.options.device_name.clone());
        hints.extend(self.options.keywords.iter().cloned());

        let mut seen = HashSet::new();
        hints.retain(|hint| !hint.trim().is_empty() && seen.insert(hint.trim().to_lowercase()));
        hints
    }

    /// Query the device store with each hint, stopping at the first hit.
    async fn read_fallback(
        &self,
        identity: Option<&DeviceIdentity>,
        now: SystemTime,
    ) -> Option<BatteryReading> {
        for hint in self.fallback_hints(identity) {
            match timeout(self.options.fallback_timeout, self.fallback.read_battery(&hint)).await {
                Ok(FallbackResult::Success(percent, name)) => {
                    let name = identity.map(|i| i.name.clone()).unwrap_or(name);
                    return Some(BatteryReading::fresh(percent, name, Source::Fallback, now));
                }
                Ok(FallbackResult::Unavailable) => debug!("Device store has nothing for {:?}", hint),
                Err(_) => {
                    debug!("Device store query for {:?} timed out", hint);
                    break;
                }
            }
        }
        None
    }

    fn accept(&mut self, reading: BatteryReading) -> BatteryReading {
        self.cache.set_last_reading(&reading);
        self.last_good = Some(reading.clone());
        reading
    }

    fn degrade(&mut self, now: SystemTime) -> BatteryReading {
        if let Some(previous) = &self.last_good {
            let age = previous.age_at(now);
            if age < self.options.stale_after {
                info!("Both readers failed; keeping last reading ({}s old)", age.as_secs());
                return previous.as_stale();
            }
            info!("Last reading is {}s old; reporting unknown", age.as_secs());
        }
        BatteryReading::unknown(self.device_name(), now)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::identity::tests::{FakeScanner, discovered};
    use crate::reading::Percent;

    /// Replays scripted results, repeating the last one.
    pub(crate) struct Scripted<T> {
        results: Mutex<Vec<T>>,
        pub calls: AtomicUsize,
    }

    impl<T: Clone> Scripted<T> {
        pub(crate) fn new(results: Vec<T>) -> Arc<Self> {
            Arc::new(Scripted {
                results: Mutex::new(results),
                calls: AtomicUsize::new(0),
            })
        }

        fn next(&self) -> T {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().unwrap();
            if results.len() > 1 {
                results.remove(0)
            } else {
                results[0].clone()
            }
        }
    }

    #[async_trait]
    impl LowEnergyReader for Scripted<LowEnergyResult> {
        async fn read_battery(&self, _identity: &DeviceIdentity, _timeout: Duration) -> LowEnergyResult {
            self.next()
        }
    }

    #[async_trait]
    impl DeviceStore for Scripted<FallbackResult> {
        async fn read_battery(&self, _name_hint: &str) -> FallbackResult {
            self.next()
        }
    }

    type TestOrchestrator = Orchestrator<
        Arc<FakeScanner>,
        Arc<Scripted<LowEnergyResult>>,
        Arc<Scripted<FallbackResult>>,
    >;

    fn percent(value: u8) -> Percent {
        Percent::new(value).unwrap()
    }

    fn options() -> AcquireOptions {
        AcquireOptions {
            keywords: vec!["MX Master".to_string()],
            device_name: None,
            connect_timeout: Duration::from_secs(1),
            fallback_timeout: Duration::from_secs(1),
            stale_after: Duration::from_secs(600),
        }
    }

    fn orchestrator(
        scanner: &Arc<FakeScanner>,
        low_energy: &Arc<Scripted<LowEnergyResult>>,
        fallback: &Arc<Scripted<FallbackResult>>,
    ) -> TestOrchestrator {
        Orchestrator::new(
            IdentityResolver::new(scanner.clone(), Duration::from_secs(1), 3),
            low_energy.clone(),
            fallback.clone(),
            CacheStore::in_memory(),
            options(),
        )
    }

    fn found() -> Arc<FakeScanner> {
        Arc::new(FakeScanner::new(vec![Some(discovered(1, "MX Master 3"))]))
    }

    fn unavailable() -> LowEnergyResult {
        LowEnergyResult::Unavailable("out of range".to_string())
    }

    #[tokio::test]
    async fn test_low_energy_value_passes_through() {
        for value in [0, 1, 50, 99, 100] {
            let low_energy = Scripted::new(vec![LowEnergyResult::Success(percent(value))]);
            let fallback = Scripted::new(vec![FallbackResult::Unavailable]);
            let mut orchestrator = orchestrator(&found(), &low_energy, &fallback);

            let reading = orchestrator.acquire().await;
            assert_eq!(reading.percent, Some(percent(value)));
            assert_eq!(reading.source, Source::LowEnergy);
            assert_eq!(reading.device_name, "MX Master 3");
            assert!(!reading.stale);
            assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn test_unavailable_falls_back_to_device_store() {
        let low_energy = Scripted::new(vec![unavailable()]);
        let fallback = Scripted::new(vec![FallbackResult::Success(percent(42), "MX Master 3".into())]);
        let mut orchestrator = orchestrator(&found(), &low_energy, &fallback);

        let reading = orchestrator.acquire().await;
        assert_eq!(reading.percent, Some(percent(42)));
        assert_eq!(reading.source, Source::Fallback);
        assert!(!reading.stale);
    }

    #[tokio::test]
    async fn test_protocol_error_also_falls_back() {
        let low_energy = Scripted::new(vec![LowEnergyResult::Error("battery service not found".into())]);
        let fallback = Scripted::new(vec![FallbackResult::Success(percent(7), "MX Master 3".into())]);
        let mut orchestrator = orchestrator(&found(), &low_energy, &fallback);

        let reading = orchestrator.acquire().await;
        assert_eq!(reading.source, Source::Fallback);
        assert_eq!(reading.percent, Some(percent(7)));
    }

    #[tokio::test]
    async fn test_both_fail_without_history_is_unknown() {
        let low_energy = Scripted::new(vec![unavailable()]);
        let fallback = Scripted::new(vec![FallbackResult::Unavailable]);
        let mut orchestrator = orchestrator(&found(), &low_energy, &fallback);

        let reading = orchestrator.acquire().await;
        assert_eq!(reading.percent, None);
        assert_eq!(reading.source, Source::None);
    }

    #[tokio::test]
    async fn test_both_fail_with_recent_reading_reports_stale() {
        let low_energy = Scripted::new(vec![LowEnergyResult::Success(percent(60)), unavailable()]);
        let fallback = Scripted::new(vec![FallbackResult::Unavailable]);
        let mut orchestrator = orchestrator(&found(), &low_energy, &fallback);
        let start = SystemTime::now();

        let first = orchestrator.acquire_at(start).await;
        let second = orchestrator.acquire_at(start + Duration::from_secs(300)).await;

        assert_eq!(second.percent, first.percent);
        assert!(second.stale);
        assert_eq!(second.source, Source::Cached);
        assert_eq!(second.observed_at, first.observed_at);
    }

    #[tokio::test]
    async fn test_expired_reading_becomes_unknown() {
        let low_energy = Scripted::new(vec![LowEnergyResult::Success(percent(60)), unavailable()]);
        let fallback = Scripted::new(vec![FallbackResult::Unavailable]);
        let mut orchestrator = orchestrator(&found(), &low_energy, &fallback);
        let start = SystemTime::now();

        orchestrator.acquire_at(start).await;
        let stale = orchestrator.acquire_at(start + Duration::from_secs(599)).await;
        let expired = orchestrator.acquire_at(start + Duration::from_secs(600)).await;

        assert!(stale.stale);
        assert_eq!(expired.percent, None);
        assert_eq!(expired.source, Source::None);
    }

    #[tokio::test]
    async fn test_resolution_failure_still_tries_device_store() {
        let scanner = Arc::new(FakeScanner::new(vec![None]));
        let low_energy = Scripted::new(vec![LowEnergyResult::Success(percent(90))]);
        let fallback = Scripted::new(vec![FallbackResult::Success(percent(33), "MX Master 3S".into())]);
        let mut orchestrator = orchestrator(&scanner, &low_energy, &fallback);

        let reading = orchestrator.acquire().await;
        assert_eq!(reading.source, Source::Fallback);
        assert_eq!(reading.device_name, "MX Master 3S");
        assert_eq!(low_energy.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_fallback_hints_skip_repeats() {
        let low_energy = Scripted::new(vec![unavailable()]);
        let fallback = Scripted::new(vec![FallbackResult::Unavailable]);
        let mut orchestrator = orchestrator(&found(), &low_energy, &fallback);
        orchestrator.options.device_name = Some("MX Master 3".to_string());
        orchestrator.options.keywords =
            vec!["MX Master".to_string(), "mx master 3".to_string(), "MX Master".to_string()];

        let identity = DeviceIdentity {
            name: "MX Master 3".to_string(),
            address: discovered(1, "MX Master 3").address,
            resolved_at: SystemTime::UNIX_EPOCH,
        };
        assert_eq!(
            orchestrator.fallback_hints(Some(&identity)),
            vec!["MX Master 3".to_string(), "MX Master".to_string()]
        );
    }

    #[tokio::test]
    async fn test_missing_adapter_still_reads_device_store() {
        let fallback = Scripted::new(vec![FallbackResult::Success(percent(55), "MX Master 3".into())]);
        let mut orchestrator = Orchestrator::new(
            IdentityResolver::new(crate::ble::NoAdapter, Duration::from_secs(1), 3),
            crate::ble::NoAdapter,
            fallback.clone(),
            CacheStore::in_memory(),
            options(),
        );

        let reading = orchestrator.acquire().await;
        assert_eq!(reading.source, Source::Fallback);
        assert_eq!(reading.percent, Some(percent(55)));
    }

    #[tokio::test]
    async fn test_resolution_failure_without_fallback_is_unknown() {
        let scanner = Arc::new(FakeScanner::new(vec![None]));
        let low_energy = Scripted::new(vec![LowEnergyResult::Success(percent(90))]);
        let fallback = Scripted::new(vec![FallbackResult::Unavailable]);
        let mut orchestrator = orchestrator(&scanner, &low_energy, &fallback);

        let reading = orchestrator.acquire().await;
        assert_eq!(reading.source, Source::None);
        assert_eq!(reading.percent, None);
    }

    #[tokio::test]
    async fn test_rescan_always_scans_again() {
        let scanner = Arc::new(FakeScanner::new(vec![
            Some(discovered(1, "MX Master 3")),
            Some(discovered(2, "MX Master 3S")),
        ]));
        let low_energy = Scripted::new(vec![LowEnergyResult::Success(percent(80))]);
        let fallback = Scripted::new(vec![FallbackResult::Unavailable]);
        let mut orchestrator = orchestrator(&scanner, &low_energy, &fallback);

        orchestrator.acquire().await;
        orchestrator.acquire().await;
        assert_eq!(scanner.calls.load(Ordering::SeqCst), 1);

        orchestrator.rescan();
        let reading = orchestrator.acquire().await;
        assert_eq!(scanner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(reading.device_name, "MX Master 3S");
        assert_eq!(orchestrator.cache.device().map(|d| d.address), Some(discovered(2, "").address));
    }

    #[tokio::test]
    async fn test_repeated_failures_trigger_rediscovery() {
        let scanner = found();
        let low_energy = Scripted::new(vec![unavailable()]);
        let fallback = Scripted::new(vec![FallbackResult::Unavailable]);
        let mut orchestrator = orchestrator(&scanner, &low_energy, &fallback);

        for _ in 0..3 {
            orchestrator.acquire().await;
        }
        assert_eq!(scanner.calls.load(Ordering::SeqCst), 1);
        assert!(orchestrator.cache.device().is_none());

        orchestrator.acquire().await;
        assert_eq!(scanner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_persisted_reading_seeds_staleness() {
        let mut cache = CacheStore::in_memory();
        let earlier = SystemTime::now() - Duration::from_secs(60);
        cache.set_last_reading(&BatteryReading::fresh(
            percent(55),
            "MX Master 3".into(),
            Source::LowEnergy,
            earlier,
        ));
        let mut orchestrator = Orchestrator::new(
            IdentityResolver::new(Arc::new(FakeScanner::new(vec![None])), Duration::from_secs(1), 3),
            Scripted::new(vec![unavailable()]),
            Scripted::new(vec![FallbackResult::Unavailable]),
            cache,
            options(),
        );

        let reading = orchestrator.acquire().await;
        assert_eq!(reading.percent, Some(percent(55)));
        assert!(reading.stale);
    }
}
