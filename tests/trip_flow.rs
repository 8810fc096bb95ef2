// 行程开始与结束的 HTTP 集成测试

mod common;

use std::sync::Arc;

use axum::http::{Method, StatusCode};
use chrono::Utc;
use serde_json::json;
use tokio::task::JoinSet;

use common::Harness;
use scooter_fleet::models::{Location, ScooterStatus};
use scooter_fleet::reservation::{Reconciler, release_queue};
use scooter_fleet::store::{FleetStore, StoreError};

async fn start(h: &Harness, user: &str, scooter: &str) -> (StatusCode, serde_json::Value) {
    h.request(
        Method::POST,
        "/trip/start",
        Some(json!({ "userId": user, "scooterId": scooter })),
    )
    .await
}

async fn end(h: &Harness, trip_id: &str, lat: f64, lon: f64) -> (StatusCode, serde_json::Value) {
    h.request(
        Method::POST,
        "/trip/end",
        Some(json!({ "tripId": trip_id, "endLatitude": lat, "endLongitude": lon })),
    )
    .await
}

#[tokio::test]
async fn start_reserves_scooter_and_second_start_conflicts() {
    let h = Harness::new();
    h.seed_scooter("s1", 40.7128, -74.0060).await;

    let (status, body) = start(&h, "u1", "s1").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["tripId"].as_str().is_some_and(|id| !id.is_empty()));
    assert!(body["startTime"].is_string());
    assert_eq!(body["scooter"]["status"], "IN_USE");
    assert_eq!(body["message"], "Trip started successfully");

    let (status, body) = start(&h, "u2", "s1").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "CONFLICT");
    assert_eq!(h.scooter("s1").await.status, ScooterStatus::InUse);
}

#[tokio::test]
async fn concurrent_starts_have_exactly_one_winner() {
    let h = Arc::new(Harness::new());
    h.seed_scooter("s1", 40.7128, -74.0060).await;

    let mut tasks = JoinSet::new();
    for i in 0..16 {
        let h = h.clone();
        tasks.spawn(async move { start(&h, &format!("user-{i}"), "s1").await });
    }

    let mut winners = Vec::new();
    let mut conflicts = 0;
    while let Some(result) = tasks.join_next().await {
        let (status, body) = result.unwrap();
        match status {
            StatusCode::OK => winners.push(body["tripId"].as_str().unwrap().to_string()),
            StatusCode::BAD_REQUEST => {
                assert_eq!(body["kind"], "CONFLICT");
                conflicts += 1;
            }
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(conflicts, 15);

    let (status, trip) = h
        .request(Method::GET, &format!("/trip/{}", winners[0]), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(trip["status"], "ACTIVE");
    assert_eq!(h.scooter("s1").await.status, ScooterStatus::InUse);
}

#[tokio::test]
async fn end_completes_trip_and_frees_scooter() {
    let h = Harness::new();
    h.seed_scooter("s1", 40.7128, -74.0060).await;
    let (_, started) = start(&h, "u1", "s1").await;
    let trip_id = started["tripId"].as_str().unwrap().to_string();

    let (status, body) = end(&h, &trip_id, 40.71, -74.00).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["trip"]["status"], "COMPLETED");
    assert!(body["trip"]["endTime"].is_string());
    assert!(body["trip"]["distance"].as_f64().unwrap() > 0.0);

    let scooter = h.scooter("s1").await;
    assert_eq!(scooter.status, ScooterStatus::Available);
    assert_eq!(scooter.location, Location::new(40.71, -74.00));

    // 已结束的行程不能再次结束，也不会改变任何状态
    let (status, body) = end(&h, &trip_id, 41.0, -75.0).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "CONFLICT");
    assert_eq!(h.scooter("s1").await.location, Location::new(40.71, -74.00));

    let (status, body) = end(&h, "no-such-trip", 40.71, -74.00).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "NOT_FOUND");
}

#[tokio::test]
async fn malformed_requests_are_validation_errors() {
    let h = Harness::new();
    h.seed_scooter("s1", 40.7128, -74.0060).await;

    let (status, body) = h
        .request(Method::POST, "/trip/start", Some(json!({ "scooterId": "s1" })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "VALIDATION_ERROR");
    assert_eq!(body["message"], "Missing required parameter userId");

    let (status, body) = h
        .request(
            Method::POST,
            "/trip/end",
            Some(json!({ "tripId": "t1", "endLatitude": "north", "endLongitude": -74.0 })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "VALIDATION_ERROR");

    let (status, body) = h
        .request(Method::POST, "/trip/end", Some(json!({ "tripId": "t1", "endLatitude": 40.0 })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Missing required parameter endLongitude");

    assert_eq!(h.scooter("s1").await.status, ScooterStatus::Available);
}

#[tokio::test]
async fn unknown_scooter_is_not_found() {
    let h = Harness::new();
    let (status, body) = start(&h, "u1", "ghost").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "NOT_FOUND");
}

#[tokio::test]
async fn retried_start_with_same_key_returns_original_trip() {
    let h = Harness::new();
    h.seed_scooter("s1", 40.7128, -74.0060).await;
    let request = json!({ "userId": "u1", "scooterId": "s1", "idempotencyKey": "req-42" });

    let (status, first) = h.request(Method::POST, "/trip/start", Some(request.clone())).await;
    assert_eq!(status, StatusCode::OK);
    let (status, retry) = h.request(Method::POST, "/trip/start", Some(request)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["tripId"], retry["tripId"]);
    assert_eq!(first["startTime"], retry["startTime"]);
}

#[tokio::test]
async fn failed_release_is_reported_and_repaired() {
    let mut h = Harness::new();
    h.seed_scooter("s1", 40.7128, -74.0060).await;
    let (_, started) = start(&h, "u1", "s1").await;
    let trip_id = started["tripId"].as_str().unwrap().to_string();

    h.store.fail_releases(true);
    let (status, body) = end(&h, &trip_id, 40.72, -74.01).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["trip"]["status"], "COMPLETED");
    assert_eq!(h.scooter("s1").await.status, ScooterStatus::InUse);

    h.store.fail_releases(false);
    let pending = std::mem::replace(
        &mut h.pending_releases,
        release_queue().1,
    );
    let mut reconciler = Reconciler::new(h.store.clone(), pending, &h.config);
    let report = reconciler.drain_queue().await;
    assert_eq!(report.queued_repaired, 1);

    let scooter = h.scooter("s1").await;
    assert_eq!(scooter.status, ScooterStatus::Available);
    assert_eq!(scooter.location, Location::new(40.72, -74.01));
    assert_eq!(reconciler.sweep().await.swept_repaired, 0);
}

#[tokio::test]
async fn sweep_repairs_scooters_without_queued_release() {
    let h = Harness::new();
    h.seed_scooter("s1", 40.7128, -74.0060).await;
    let (_, started) = start(&h, "u1", "s1").await;
    let trip_id = started["tripId"].as_str().unwrap().to_string();

    h.store.fail_releases(true);
    end(&h, &trip_id, 40.72, -74.01).await;
    h.store.fail_releases(false);

    // 宽限期为零，扫描立即接管
    let mut config = h.config.clone();
    config.reconcile_grace_ms = 0;
    let (_tx, empty_queue) = release_queue();
    let reconciler = Reconciler::new(h.store.clone(), empty_queue, &config);
    let report = reconciler.sweep().await;
    assert_eq!(report.swept_repaired, 1);
    assert_eq!(h.scooter("s1").await.status, ScooterStatus::Available);
}

#[tokio::test]
async fn late_release_cannot_free_a_re_reserved_scooter() {
    let h = Harness::new();
    h.seed_scooter("s1", 40.7128, -74.0060).await;
    let (_, first) = start(&h, "u1", "s1").await;
    let first_id = first["tripId"].as_str().unwrap().to_string();

    // EndTrip 的第一次写入已提交，车辆释放还没到
    let trip = h.store.get_trip(&first_id).await.unwrap().unwrap();
    let end = Location::new(40.72, -74.01);
    h.store
        .complete_trip(&first_id, trip.completion(end, Utc::now()))
        .await
        .unwrap();

    // 默认宽限期内，扫描不碰这辆车
    let (_tx, queue) = release_queue();
    let patient = Reconciler::new(h.store.clone(), queue, &h.config);
    assert_eq!(patient.sweep().await.swept_repaired, 0);
    assert_eq!(h.scooter("s1").await.status, ScooterStatus::InUse);

    // 即使扫描抢先释放、车辆又被别人借走，迟到的释放也不能覆盖新行程
    let mut config = h.config.clone();
    config.reconcile_grace_ms = 0;
    let (_tx, queue) = release_queue();
    let eager = Reconciler::new(h.store.clone(), queue, &config);
    assert_eq!(eager.sweep().await.swept_repaired, 1);

    let (status, second) = start(&h, "u2", "s1").await;
    assert_eq!(status, StatusCode::OK);
    let second_id = second["tripId"].as_str().unwrap().to_string();

    let late = h.store.release_scooter("s1", end).await;
    assert!(matches!(late, Err(StoreError::ConditionFailed)));
    assert_eq!(h.scooter("s1").await.status, ScooterStatus::InUse);

    let (status, body) = start(&h, "u3", "s1").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "CONFLICT");

    let (_, trip) = h
        .request(Method::GET, &format!("/trip/{second_id}"), None)
        .await;
    assert_eq!(trip["status"], "ACTIVE");
}
