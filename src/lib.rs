use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use cache::FleetCache;
use config::Config;
use reservation::{ReleaseReceiver, ReservationCoordinator, release_queue};
use search::{GeoSearchEngine, SearchSettings};
use store::FleetStore;

pub mod cache;
pub mod config;
pub mod error;
pub mod middleware;
pub mod models;
pub mod propagator;
pub mod reservation;
pub mod routes;
pub mod search;
pub mod store;
pub mod utils;

#[derive(Clone)]
pub struct AppState {
    pub reservations: Arc<ReservationCoordinator>,
    pub search: Arc<GeoSearchEngine>,
    pub cache: Arc<dyn FleetCache>,
    pub config: Config,
}

impl AppState {
    /// 组装请求路径上的组件，返回的接收端交给对账任务
    pub fn new(
        config: Config,
        store: Arc<dyn FleetStore>,
        cache: Arc<dyn FleetCache>,
    ) -> (Self, ReleaseReceiver) {
        let (releases, pending) = release_queue();
        let reservations = Arc::new(ReservationCoordinator::new(
            store.clone(),
            releases,
            config.store_timeout(),
        ));
        let search = Arc::new(GeoSearchEngine::new(
            store,
            cache.clone(),
            SearchSettings::from_config(&config),
        ));

        let state = Self {
            reservations,
            search,
            cache,
            config,
        };
        (state, pending)
    }
}

pub fn app(state: AppState) -> Router {
    let router = Router::new()
        .route("/health", get(routes::health))
        .route("/trip/start", post(routes::trip::start_trip))
        .route("/trip/end", post(routes::trip::end_trip))
        .route("/trip/{trip_id}", get(routes::trip::get_trip))
        .route("/search-scooters", get(routes::search::search_scooters))
        .route("/leaderboard/top-riders", get(routes::leaderboard::top_riders))
        .route("/leaderboard/rank", get(routes::leaderboard::rank))
        .layer(axum::middleware::from_fn(middleware::log_errors))
        .layer(TraceLayer::new_for_http());

    // 开发环境允许所有来源
    #[cfg(debug_assertions)]
    let router = router.layer(tower_http::cors::CorsLayer::permissive());

    router.with_state(state)
}
