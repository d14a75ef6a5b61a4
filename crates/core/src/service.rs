//! The upscaler service: model pool, result cache and request de-duplication.
//!
//! One service is built by the composition root and shared as
//! `Arc<UpscalerService>`. Every request resolves to a [`CacheKey`]; a hit
//! returns the stored bitmap, a miss runs the model for the request's
//! settings. Concurrent requests for the same key share one computation,
//! which runs as its own task: a caller that gives up does not cancel it.
//!
//! # Priority
//!
//! Background work ([`UpscalerService::preload`]) must hold a background
//! permit while it runs. Foreground calls never take one, so they are never
//! queued behind preloads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, OnceCell, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bitmap::Bitmap;
use crate::cache::{CacheKey, ResultCache};
use crate::error::{UpscaleError, UpscaleResult};
use crate::model::{ModelAdapter, ModelLoader};
use crate::settings::UpscaleSettings;
use crate::tiling::{TileConfig, TilingEngine};

pub const DEFAULT_BACKGROUND_PERMITS: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceOptions {
    pub tiling: TileConfig,
    /// Preloads allowed to run at once.
    pub background_permits: usize,
    /// Result-cache capacity; 0 is unbounded.
    pub max_cache_entries: usize,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            tiling: TileConfig::default(),
            background_permits: DEFAULT_BACKGROUND_PERMITS,
            max_cache_entries: 0,
        }
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Requests that waited on another caller's in-flight computation.
    pub coalesced: u64,
    pub inference_runs: u64,
    pub models_loaded: usize,
    pub cached_entries: usize,
}

impl ServiceStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    coalesced: AtomicU64,
    inference_runs: AtomicU64,
}

type Outcome = UpscaleResult<Bitmap>;

pub struct UpscalerService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    loader: Arc<dyn ModelLoader>,
    engine: TilingEngine,
    models: DashMap<UpscaleSettings, Arc<OnceCell<ModelAdapter>>>,
    cache: ResultCache,
    /// One sender per key being computed; waiters subscribe to it.
    in_flight: DashMap<CacheKey, broadcast::Sender<Outcome>>,
    background: Semaphore,
    counters: Counters,
}

/// Drops the in-flight entry when its computation task ends, even by panic.
struct InFlightGuard<'a> {
    in_flight: &'a DashMap<CacheKey, broadcast::Sender<Outcome>>,
    key: &'a CacheKey,
    sender: &'a broadcast::Sender<Outcome>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .remove_if(self.key, |_, current| current.same_channel(self.sender));
    }
}

impl UpscalerService {
    pub fn new(loader: Arc<dyn ModelLoader>, options: ServiceOptions) -> UpscaleResult<Self> {
        let engine = TilingEngine::new(options.tiling)?;
        Ok(Self {
            inner: Arc::new(ServiceInner {
                loader,
                engine,
                models: DashMap::new(),
                cache: ResultCache::new(options.max_cache_entries),
                in_flight: DashMap::new(),
                background: Semaphore::new(options.background_permits.max(1)),
                counters: Counters::default(),
            }),
        })
    }

    /// Best-effort upscale: any failure returns the original image.
    pub async fn upscale(&self, image: &Bitmap, settings: UpscaleSettings) -> Bitmap {
        match self.inner.resolve(image, settings).await {
            Ok(result) => result,
            Err(err) => {
                warn!(
                    settings = %settings,
                    identity = image.identity(),
                    error = %err,
                    "Upscale failed, returning original"
                );
                image.clone()
            }
        }
    }

    /// Guaranteed-attempt upscale: failures come back to the caller.
    ///
    /// Never waits for a background permit. Settings without a model pass
    /// the image through unchanged. Dropping the returned future does not
    /// cancel the computation; it still completes and fills the cache.
    pub async fn upscale_now(&self, image: &Bitmap, settings: UpscaleSettings) -> UpscaleResult<Bitmap> {
        self.inner.resolve(image, settings).await
    }

    /// Warms the cache in the background. `None` when the result is already
    /// cached or no runtime is available to spawn on.
    pub fn preload(&self, image: Bitmap, settings: UpscaleSettings) -> Option<JoinHandle<()>> {
        let key = CacheKey::new(&image, settings);
        if self.inner.cache.contains(&key) {
            debug!(key = %key, "Preload skipped, result already cached");
            return None;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(err) => {
                warn!(key = %key, error = %err, "Preload needs a tokio runtime, skipping");
                return None;
            }
        };

        let inner = Arc::clone(&self.inner);
        Some(handle.spawn(async move {
            let Ok(_permit) = inner.background.acquire().await else {
                return;
            };
            if let Err(err) = inner.resolve(&image, settings).await {
                debug!(key = %key, error = %err, "Preload failed");
            }
        }))
    }

    /// Drops every cached result. Loaded models are kept, and computations
    /// already running finish without storing their results.
    pub fn clear_cache(&self) {
        let dropped = self.inner.cache.len();
        self.inner.cache.clear();
        self.inner.in_flight.clear();
        info!(dropped, "Result cache cleared");
    }

    pub fn is_cached(&self, image: &Bitmap, settings: UpscaleSettings) -> bool {
        self.inner.cache.contains(&CacheKey::new(image, settings))
    }

    pub fn tile_config(&self) -> &TileConfig {
        self.inner.engine.config()
    }

    pub fn stats(&self) -> ServiceStats {
        let inner = &self.inner;
        ServiceStats {
            cache_hits: inner.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: inner.counters.cache_misses.load(Ordering::Relaxed),
            coalesced: inner.counters.coalesced.load(Ordering::Relaxed),
            inference_runs: inner.counters.inference_runs.load(Ordering::Relaxed),
            models_loaded: inner
                .models
                .iter()
                .filter(|entry| entry.value().get().is_some_and(|a| a.is_available()))
                .count(),
            cached_entries: inner.cache.len(),
        }
    }
}

impl ServiceInner {
    /// Cache lookup, then subscribe to the key's computation, starting it if
    /// none is running.
    async fn resolve(self: &Arc<Self>, image: &Bitmap, settings: UpscaleSettings) -> Outcome {
        let key = CacheKey::new(image, settings);
        if let Some(hit) = self.cache.get(&key) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Cache hit");
            return Ok(hit);
        }
        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
        let generation = self.cache.generation();

        let mut rx = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => {
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Joined in-flight request");
                entry.get().subscribe()
            }
            Entry::Vacant(entry) => {
                let (tx, rx) = broadcast::channel(1);
                entry.insert(tx.clone());
                self.spawn_compute(image.clone(), key, tx, generation);
                rx
            }
        };

        rx.recv().await.unwrap_or_else(|_| {
            Err(UpscaleError::Inference(
                "upscale task ended without a result".to_string(),
            ))
        })
    }

    /// Runs the computation as its own task so no waiter owns it.
    fn spawn_compute(
        self: &Arc<Self>,
        image: Bitmap,
        key: CacheKey,
        tx: broadcast::Sender<Outcome>,
        generation: u64,
    ) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let result = {
                let _guard = InFlightGuard {
                    in_flight: &inner.in_flight,
                    key: &key,
                    sender: &tx,
                };
                inner.compute(&image, &key, generation).await
            };
            // Waiters that all went away leave no receivers; that is fine.
            let _ = tx.send(result);
        });
    }

    async fn compute(&self, image: &Bitmap, key: &CacheKey, generation: u64) -> Outcome {
        // A request that finished between the lookup and the spawn may have filled it.
        if let Some(hit) = self.cache.get(key) {
            return Ok(hit);
        }

        let adapter = self.adapter(key.settings()).await;
        if !adapter.is_available() {
            return Ok(image.clone());
        }

        self.counters.inference_runs.fetch_add(1, Ordering::Relaxed);
        let result = adapter.try_upscale(image).await?;
        if !self.cache.insert_if_current(key.clone(), result.clone(), generation) {
            debug!(key = %key, "Cache cleared during inference, result not stored");
        }
        Ok(result)
    }

    /// The memoized adapter for `settings`, loading the model on first use.
    ///
    /// Only reached from computation tasks, which waiters cannot cancel.
    async fn adapter(&self, settings: UpscaleSettings) -> ModelAdapter {
        let cell = self
            .models
            .entry(settings)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        cell.get_or_init(|| self.load_adapter(settings))
            .await
            .clone()
    }

    async fn load_adapter(&self, settings: UpscaleSettings) -> ModelAdapter {
        let loader = Arc::clone(&self.loader);
        let loaded = tokio::task::spawn_blocking(move || loader.load(settings)).await;

        match loaded {
            Ok(Ok(model)) if model.scale() == settings.scale() => {
                ModelAdapter::new(settings, model, self.engine.clone())
            }
            Ok(Ok(model)) => {
                warn!(
                    settings = %settings,
                    model_scale = model.scale(),
                    "Model scale does not match settings, treating as unavailable"
                );
                ModelAdapter::unavailable(settings, self.engine.clone())
            }
            Ok(Err(err)) => {
                warn!(settings = %settings, error = %err, "Model unavailable, images will pass through");
                ModelAdapter::unavailable(settings, self.engine.clone())
            }
            Err(err) => {
                warn!(settings = %settings, error = %err, "Model loader task failed");
                ModelAdapter::unavailable(settings, self.engine.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{DenoiseLevel, ModelFamily, ScaleFactor};
    use crate::test_support::{FailingModel, NearestModel, StaticLoader};
    use image::{Rgba, RgbaImage};
    use std::time::Duration;

    fn page(id: &str) -> Bitmap {
        Bitmap::from_rgba(RgbaImage::from_pixel(16, 12, Rgba([30, 60, 90, 255]))).with_reference_id(id)
    }

    fn service_with(model: Arc<NearestModel>) -> (Arc<UpscalerService>, Arc<StaticLoader>) {
        let loader = Arc::new(StaticLoader::default().with(UpscaleSettings::default(), model));
        let service = UpscalerService::new(loader.clone(), ServiceOptions::default()).unwrap();
        (Arc::new(service), loader)
    }

    #[tokio::test]
    async fn second_upscale_is_a_cache_hit() {
        let model = Arc::new(NearestModel::new(2));
        let (service, _) = service_with(model.clone());
        let input = page("p1");

        let first = service.upscale(&input, UpscaleSettings::default()).await;
        let second = service.upscale(&input, UpscaleSettings::default()).await;

        assert_eq!(first.dimensions(), (32, 24));
        assert!(first.ptr_eq(&second));
        assert_eq!(model.calls(), 1);
        let stats = service.stats();
        assert_eq!((stats.cache_hits, stats.cache_misses), (1, 1));
        assert_eq!(stats.inference_runs, 1);
        assert_eq!(stats.models_loaded, 1);
    }

    #[tokio::test]
    async fn different_settings_miss_the_cache() {
        let model = Arc::new(NearestModel::new(2));
        let other = UpscaleSettings::new(ModelFamily::Anime, ScaleFactor::X2, DenoiseLevel::High);
        let other_model = Arc::new(NearestModel::new(2));
        let loader = StaticLoader::default()
            .with(UpscaleSettings::default(), model.clone())
            .with(other, other_model.clone());
        let service = UpscalerService::new(Arc::new(loader), ServiceOptions::default()).unwrap();
        let input = page("p1");

        service.upscale(&input, UpscaleSettings::default()).await;
        service.upscale(&input, other).await;

        assert_eq!(model.calls(), 1);
        assert_eq!(other_model.calls(), 1);
        assert_eq!(service.stats().cached_entries, 2);
    }

    #[tokio::test]
    async fn preload_then_upscale_hits_cache() {
        let model = Arc::new(NearestModel::new(2));
        let (service, _) = service_with(model.clone());
        let input = page("p2");

        let handle = service.preload(input.clone(), UpscaleSettings::default());
        let result = service.upscale(&input, UpscaleSettings::default()).await;
        if let Some(handle) = handle {
            handle.await.unwrap();
        }

        assert_eq!(result.dimensions(), (32, 24));
        assert_eq!(model.calls(), 1);
        assert!(service.preload(input, UpscaleSettings::default()).is_none());
    }

    #[tokio::test]
    async fn clear_cache_forces_new_inference() {
        let model = Arc::new(NearestModel::new(2));
        let (service, loader) = service_with(model.clone());
        let input = page("p3");

        service.upscale(&input, UpscaleSettings::default()).await;
        service.clear_cache();
        assert!(!service.is_cached(&input, UpscaleSettings::default()));
        service.upscale(&input, UpscaleSettings::default()).await;

        assert_eq!(model.calls(), 2);
        assert_eq!(loader.loads(), 1, "models survive clear_cache");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_identical_requests_share_one_inference() {
        let model = Arc::new(NearestModel::with_delay(2, Duration::from_millis(100)));
        let (service, loader) = service_with(model.clone());
        let input = page("p4");

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let service = Arc::clone(&service);
                let input = input.clone();
                tokio::spawn(async move { service.upscale_now(&input, UpscaleSettings::default()).await })
            })
            .collect();

        let mut outputs = Vec::new();
        for task in tasks {
            outputs.push(task.await.unwrap().unwrap());
        }

        assert_eq!(model.calls(), 1);
        assert_eq!(loader.loads(), 1);
        assert!(outputs.iter().all(|out| out.ptr_eq(&outputs[0])));
        let stats = service.stats();
        assert_eq!(stats.inference_runs, 1);
        assert_eq!(stats.cache_hits + stats.cache_misses, 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn aborting_the_leading_request_does_not_restart_inference() {
        let model = Arc::new(NearestModel::with_delay(2, Duration::from_millis(400)));
        let (service, loader) = service_with(model.clone());
        let input = page("p4-abort");

        let leader = {
            let service = Arc::clone(&service);
            let input = input.clone();
            tokio::spawn(async move { service.upscale_now(&input, UpscaleSettings::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let follower = {
            let service = Arc::clone(&service);
            let input = input.clone();
            tokio::spawn(async move { service.upscale_now(&input, UpscaleSettings::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        leader.abort();

        let output = follower.await.unwrap().unwrap();
        assert_eq!(output.dimensions(), (32, 24));
        assert_eq!(model.calls(), 1);
        assert_eq!(loader.loads(), 1);
        assert_eq!(service.stats().coalesced, 1);
        assert!(service.is_cached(&input, UpscaleSettings::default()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_request_still_fills_the_cache() {
        let model = Arc::new(NearestModel::with_delay(2, Duration::from_millis(100)));
        let (service, _loader) = service_with(model.clone());
        let input = page("p4-dropped");

        let request = service.upscale_now(&input, UpscaleSettings::default());
        assert!(tokio::time::timeout(Duration::from_millis(10), request).await.is_err());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(service.is_cached(&input, UpscaleSettings::default()));
        service.upscale(&input, UpscaleSettings::default()).await;
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn clear_during_inference_discards_the_result() {
        let model = Arc::new(NearestModel::with_delay(2, Duration::from_millis(200)));
        let (service, _loader) = service_with(model.clone());
        let input = page("p4-clear");

        let request = {
            let service = Arc::clone(&service);
            let input = input.clone();
            tokio::spawn(async move { service.upscale_now(&input, UpscaleSettings::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(80)).await;
        service.clear_cache();

        let output = request.await.unwrap().unwrap();
        assert_eq!(output.dimensions(), (32, 24), "the waiting caller still gets its result");
        assert!(!service.is_cached(&input, UpscaleSettings::default()));
        assert_eq!(service.stats().cached_entries, 0);

        service.upscale(&input, UpscaleSettings::default()).await;
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn unavailable_model_passes_through_without_error() {
        let loader = Arc::new(StaticLoader::default());
        let service = UpscalerService::new(loader.clone(), ServiceOptions::default()).unwrap();
        let input = page("p5");

        let best_effort = service.upscale(&input, UpscaleSettings::default()).await;
        let now = service.upscale_now(&input, UpscaleSettings::default()).await.unwrap();

        assert!(best_effort.ptr_eq(&input));
        assert!(now.ptr_eq(&input));
        assert_eq!(loader.loads(), 1, "missing models are not retried");
        assert_eq!(service.stats().cached_entries, 0);
        assert_eq!(service.stats().models_loaded, 0);
    }

    #[tokio::test]
    async fn failures_surface_only_in_upscale_now() {
        let model = Arc::new(FailingModel::new(2));
        let loader = StaticLoader::default().with(UpscaleSettings::default(), model.clone());
        let service = UpscalerService::new(Arc::new(loader), ServiceOptions::default()).unwrap();
        let input = page("p6");

        let fallback = service.upscale(&input, UpscaleSettings::default()).await;
        assert!(fallback.ptr_eq(&input));

        let err = service
            .upscale_now(&input, UpscaleSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, UpscaleError::Inference(_)));
        assert_eq!(model.calls(), 2, "failures are not cached");
    }

    #[tokio::test]
    async fn mismatched_model_scale_is_unavailable() {
        let settings = UpscaleSettings::new(ModelFamily::Anime, ScaleFactor::X4, DenoiseLevel::Medium);
        let model = Arc::new(NearestModel::new(2));
        let loader = StaticLoader::default().with(settings, model.clone());
        let service = UpscalerService::new(Arc::new(loader), ServiceOptions::default()).unwrap();
        let input = page("p7");

        let output = service.upscale(&input, settings).await;

        assert!(output.ptr_eq(&input));
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn bounded_cache_evicts_old_results() {
        let model = Arc::new(NearestModel::new(2));
        let loader = StaticLoader::default().with(UpscaleSettings::default(), model.clone());
        let options = ServiceOptions {
            max_cache_entries: 1,
            ..ServiceOptions::default()
        };
        let service = UpscalerService::new(Arc::new(loader), options).unwrap();

        service.upscale(&page("a"), UpscaleSettings::default()).await;
        service.upscale(&page("b"), UpscaleSettings::default()).await;
        service.upscale(&page("a"), UpscaleSettings::default()).await;

        assert_eq!(model.calls(), 3);
        assert_eq!(service.stats().cached_entries, 1);
    }

    #[test]
    fn invalid_tiling_is_rejected_at_construction() {
        let options = ServiceOptions {
            tiling: TileConfig {
                tile_size: 16,
                overlap: 8,
                pixel_threshold: 0,
            },
            ..ServiceOptions::default()
        };
        let result = UpscalerService::new(Arc::new(StaticLoader::default()), options);
        assert!(matches!(result, Err(UpscaleError::InvalidTileConfig(_))));
    }

    #[test]
    fn preload_without_runtime_is_skipped() {
        let (service, loader) = service_with(Arc::new(NearestModel::new(2)));
        assert!(service.preload(page("p8"), UpscaleSettings::default()).is_none());
        assert_eq!(loader.loads(), 0);
    }

    #[test]
    fn hit_ratio() {
        let stats = ServiceStats {
            cache_hits: 3,
            cache_misses: 1,
            ..ServiceStats::default()
        };
        assert!((stats.hit_ratio() - 0.75).abs() < f64::EPSILON);
        assert_eq!(ServiceStats::default().hit_ratio(), 0.0);
    }
}
