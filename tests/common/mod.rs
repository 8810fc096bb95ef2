#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tower::ServiceExt;

use scooter_fleet::cache::MemoryCache;
use scooter_fleet::config::Config;
use scooter_fleet::models::{Location, NewTrip, Scooter, ScooterStatus, Trip, TripCompletion};
use scooter_fleet::propagator::ChangePropagator;
use scooter_fleet::reservation::ReleaseReceiver;
use scooter_fleet::store::{
    FleetStore, MemoryFleetStore, ScooterFilter, StoreError, StoreResult,
};
use scooter_fleet::{AppState, app};

/// 内存存储的包装，可以让车辆释放写入失败
pub struct FlakyStore {
    inner: Arc<MemoryFleetStore>,
    fail_releases: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryFleetStore>) -> Self {
        Self {
            inner,
            fail_releases: AtomicBool::new(false),
        }
    }

    pub fn fail_releases(&self, fail: bool) {
        self.fail_releases.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl FleetStore for FlakyStore {
    async fn get_scooter(&self, scooter_id: &str) -> StoreResult<Option<Scooter>> {
        self.inner.get_scooter(scooter_id).await
    }

    async fn put_scooter(&self, scooter: &Scooter) -> StoreResult<()> {
        self.inner.put_scooter(scooter).await
    }

    async fn scan_scooters(&self, filter: ScooterFilter) -> StoreResult<Vec<Scooter>> {
        self.inner.scan_scooters(filter).await
    }

    async fn get_scooters(&self, scooter_ids: &[String]) -> StoreResult<Vec<Scooter>> {
        self.inner.get_scooters(scooter_ids).await
    }

    async fn get_trip(&self, trip_id: &str) -> StoreResult<Option<Trip>> {
        self.inner.get_trip(trip_id).await
    }

    async fn find_trip_by_idempotency_key(&self, key: &str) -> StoreResult<Option<Trip>> {
        self.inner.find_trip_by_idempotency_key(key).await
    }

    async fn reserve_scooter(&self, trip: NewTrip) -> StoreResult<(Scooter, Trip)> {
        self.inner.reserve_scooter(trip).await
    }

    async fn complete_trip(&self, trip_id: &str, completion: TripCompletion) -> StoreResult<Trip> {
        self.inner.complete_trip(trip_id, completion).await
    }

    async fn release_scooter(&self, scooter_id: &str, location: Location) -> StoreResult<Scooter> {
        if self.fail_releases.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection reset".into()));
        }
        self.inner.release_scooter(scooter_id, location).await
    }

    async fn release_if_idle(
        &self,
        scooter_id: &str,
        location: Option<Location>,
    ) -> StoreResult<Option<Scooter>> {
        self.inner.release_if_idle(scooter_id, location).await
    }

    async fn scan_stuck_scooters(&self, ended_after: DateTime<Utc>) -> StoreResult<Vec<Scooter>> {
        self.inner.scan_stuck_scooters(ended_after).await
    }

    async fn user_total_distance(&self, user_id: &str) -> StoreResult<Option<f64>> {
        self.inner.user_total_distance(user_id).await
    }
}

pub struct Harness {
    pub memory: Arc<MemoryFleetStore>,
    pub store: Arc<FlakyStore>,
    pub cache: Arc<MemoryCache>,
    pub config: Config,
    pub router: Router,
    pub pending_releases: ReleaseReceiver,
    pub propagator: Option<Arc<ChangePropagator>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(false)
    }

    /// 同时在后台运行变更传播，缓存由存储的变更流维护
    pub fn with_propagator() -> Self {
        Self::build(true)
    }

    fn build(propagate: bool) -> Self {
        let config = Config::for_tests();
        let memory = Arc::new(MemoryFleetStore::new());
        let store = Arc::new(FlakyStore::new(memory.clone()));
        let cache = Arc::new(MemoryCache::new());

        let propagator = propagate.then(|| {
            let feed = memory.change_feed();
            let propagator = Arc::new(ChangePropagator::new(store.clone(), cache.clone(), &config));
            let worker = propagator.clone();
            tokio::spawn(async move { worker.run(feed).await });
            propagator
        });

        let (state, pending_releases) = AppState::new(config.clone(), store.clone(), cache.clone());
        Self {
            memory,
            store,
            cache,
            config,
            router: app(state),
            pending_releases,
            propagator,
        }
    }

    pub async fn seed_scooter(&self, id: &str, latitude: f64, longitude: f64) {
        self.memory
            .put_scooter(&Scooter {
                scooter_id: id.into(),
                status: ScooterStatus::Available,
                location: Location::new(latitude, longitude),
                battery_level: 75,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    pub async fn scooter(&self, id: &str) -> Scooter {
        self.memory.get_scooter(id).await.unwrap().unwrap()
    }

    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let (status, _, body) = self.request_with_headers(method, uri, body).await;
        (status, body)
    }

    pub async fn request_with_headers(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, header::HeaderMap, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(payload) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&payload).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.send(req).await
    }

    pub async fn send(&self, req: Request<Body>) -> (StatusCode, header::HeaderMap, Value) {
        let response = self.router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, headers, body)
    }
}

/// 轮询直到条件成立，用于等待后台变更传播
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition was not reached in time");
}
