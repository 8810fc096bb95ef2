use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use super::feed::{BroadcastChangeFeed, ChangeEvent, ChangeEventType};
use super::{FleetStore, ScooterFilter, StoreError, StoreResult};
use crate::models::{
    Location, NewTrip, Scooter, ScooterRecord, ScooterStatus, Trip, TripCompletion, TripRecord,
    TripStatus,
};

const EVENT_CAPACITY: usize = 1024;

#[derive(Default)]
struct Tables {
    scooters: HashMap<String, Scooter>,
    trips: HashMap<String, Trip>,
    // 幂等键 -> 行程ID
    trip_keys: HashMap<String, String>,
}

impl Tables {
    fn has_active_trip(&self, scooter_id: &str) -> bool {
        self.trips
            .values()
            .any(|t| t.scooter_id == scooter_id && t.is_active())
    }

    fn ended_after(&self, scooter_id: &str, cutoff: DateTime<Utc>) -> bool {
        self.trips
            .values()
            .any(|t| t.scooter_id == scooter_id && t.end_time.is_some_and(|end| end > cutoff))
    }
}

/// 进程内权威存储。所有条件更新在同一把锁内完成，
/// 变更事件在持锁期间广播，保证事件顺序与提交顺序一致
pub struct MemoryFleetStore {
    tables: Mutex<Tables>,
    events: broadcast::Sender<ChangeEvent>,
    fleet_table: String,
    trip_table: String,
    scans: AtomicUsize,
}

impl Default for MemoryFleetStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFleetStore {
    pub fn new() -> Self {
        Self::with_tables("scooters", "trips")
    }

    /// 指定变更事件中使用的来源表名
    pub fn with_tables(fleet_table: &str, trip_table: &str) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tables: Mutex::new(Tables::default()),
            events,
            fleet_table: fleet_table.to_string(),
            trip_table: trip_table.to_string(),
            scans: AtomicUsize::new(0),
        }
    }

    /// 订阅变更流，只能收到订阅之后的事件
    pub fn change_feed(&self) -> BroadcastChangeFeed {
        BroadcastChangeFeed::new(self.events.subscribe())
    }

    /// scan_scooters 被调用的次数
    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    fn emit_scooter(&self, event_type: ChangeEventType, scooter: &Scooter) {
        self.emit(ChangeEvent::new(
            event_type,
            &self.fleet_table,
            &ScooterRecord::from(scooter),
        ));
    }

    fn emit_trip(&self, event_type: ChangeEventType, trip: &Trip) {
        self.emit(ChangeEvent::new(
            event_type,
            &self.trip_table,
            &TripRecord::from(trip),
        ));
    }

    fn emit(&self, event: Result<ChangeEvent, serde_json::Error>) {
        match event {
            // 没有订阅者时发送失败是正常情况
            Ok(event) => {
                let _ = self.events.send(event);
            }
            Err(e) => tracing::error!("Failed to encode change event: {}", e),
        }
    }

    fn release_locked(
        &self,
        tables: &mut Tables,
        scooter_id: &str,
        location: Option<Location>,
    ) -> StoreResult<Scooter> {
        let scooter = tables
            .scooters
            .get_mut(scooter_id)
            .ok_or(StoreError::NotFound)?;
        scooter.status = ScooterStatus::Available;
        if let Some(location) = location {
            scooter.location = location;
        }
        scooter.updated_at = Utc::now();
        let scooter = scooter.clone();
        self.emit_scooter(ChangeEventType::Modify, &scooter);
        Ok(scooter)
    }
}

#[async_trait]
impl FleetStore for MemoryFleetStore {
    async fn get_scooter(&self, scooter_id: &str) -> StoreResult<Option<Scooter>> {
        Ok(self.lock()?.scooters.get(scooter_id).cloned())
    }

    async fn put_scooter(&self, scooter: &Scooter) -> StoreResult<()> {
        let mut tables = self.lock()?;
        let event_type = if tables.scooters.contains_key(&scooter.scooter_id) {
            ChangeEventType::Modify
        } else {
            ChangeEventType::Insert
        };
        tables
            .scooters
            .insert(scooter.scooter_id.clone(), scooter.clone());
        self.emit_scooter(event_type, scooter);
        Ok(())
    }

    async fn scan_scooters(&self, filter: ScooterFilter) -> StoreResult<Vec<Scooter>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .lock()?
            .scooters
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect())
    }

    async fn get_scooters(&self, scooter_ids: &[String]) -> StoreResult<Vec<Scooter>> {
        let tables = self.lock()?;
        Ok(scooter_ids
            .iter()
            .filter_map(|id| tables.scooters.get(id).cloned())
            .collect())
    }

    async fn get_trip(&self, trip_id: &str) -> StoreResult<Option<Trip>> {
        Ok(self.lock()?.trips.get(trip_id).cloned())
    }

    async fn find_trip_by_idempotency_key(&self, key: &str) -> StoreResult<Option<Trip>> {
        let tables = self.lock()?;
        Ok(tables
            .trip_keys
            .get(key)
            .and_then(|trip_id| tables.trips.get(trip_id))
            .cloned())
    }

    async fn reserve_scooter(&self, trip: NewTrip) -> StoreResult<(Scooter, Trip)> {
        let mut tables = self.lock()?;

        let scooter = tables
            .scooters
            .get(&trip.scooter_id)
            .ok_or(StoreError::NotFound)?;
        // 与 one_active_idx 一致：车辆状态之外，同一车辆也不能有第二个 ACTIVE 行程
        if scooter.status != ScooterStatus::Available || tables.has_active_trip(&trip.scooter_id) {
            return Err(StoreError::ConditionFailed);
        }
        if let Some(key) = &trip.idempotency_key {
            if tables.trip_keys.contains_key(key) {
                return Err(StoreError::DuplicateIdempotencyKey(key.clone()));
            }
        }

        // 以上检查都通过后才写入，失败路径不留下任何修改
        let scooter = tables
            .scooters
            .get_mut(&trip.scooter_id)
            .ok_or(StoreError::NotFound)?;
        scooter.status = ScooterStatus::InUse;
        scooter.updated_at = Utc::now();
        let scooter = scooter.clone();

        let trip = trip.into_trip(scooter.location);
        if let Some(key) = &trip.idempotency_key {
            tables.trip_keys.insert(key.clone(), trip.trip_id.clone());
        }
        tables.trips.insert(trip.trip_id.clone(), trip.clone());

        self.emit_scooter(ChangeEventType::Modify, &scooter);
        self.emit_trip(ChangeEventType::Insert, &trip);
        Ok((scooter, trip))
    }

    async fn complete_trip(&self, trip_id: &str, completion: TripCompletion) -> StoreResult<Trip> {
        let mut tables = self.lock()?;
        let trip = tables.trips.get_mut(trip_id).ok_or(StoreError::NotFound)?;
        if trip.status != TripStatus::Active {
            return Err(StoreError::ConditionFailed);
        }

        trip.status = TripStatus::Completed;
        trip.end_time = Some(completion.end_time);
        trip.end_location = Some(completion.end_location);
        trip.distance = completion.distance;
        let trip = trip.clone();

        self.emit_trip(ChangeEventType::Modify, &trip);
        Ok(trip)
    }

    async fn release_scooter(&self, scooter_id: &str, location: Location) -> StoreResult<Scooter> {
        let mut tables = self.lock()?;
        if !tables.scooters.contains_key(scooter_id) {
            return Err(StoreError::NotFound);
        }
        if tables.has_active_trip(scooter_id) {
            return Err(StoreError::ConditionFailed);
        }
        self.release_locked(&mut tables, scooter_id, Some(location))
    }

    async fn release_if_idle(
        &self,
        scooter_id: &str,
        location: Option<Location>,
    ) -> StoreResult<Option<Scooter>> {
        let mut tables = self.lock()?;
        let scooter = tables.scooters.get(scooter_id).ok_or(StoreError::NotFound)?;
        if scooter.status != ScooterStatus::InUse || tables.has_active_trip(scooter_id) {
            return Ok(None);
        }
        self.release_locked(&mut tables, scooter_id, location)
            .map(Some)
    }

    async fn scan_stuck_scooters(&self, ended_after: DateTime<Utc>) -> StoreResult<Vec<Scooter>> {
        let tables = self.lock()?;
        Ok(tables
            .scooters
            .values()
            .filter(|s| {
                s.status == ScooterStatus::InUse
                    && !tables.has_active_trip(&s.scooter_id)
                    && !tables.ended_after(&s.scooter_id, ended_after)
            })
            .cloned()
            .collect())
    }

    async fn user_total_distance(&self, user_id: &str) -> StoreResult<Option<f64>> {
        let tables = self.lock()?;
        let mut completed = tables
            .trips
            .values()
            .filter(|t| t.user_id == user_id && t.status == TripStatus::Completed)
            .peekable();
        if completed.peek().is_none() {
            return Ok(None);
        }
        Ok(Some(completed.map(|t| t.distance).sum()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChangeFeed;

    fn scooter(id: &str, status: ScooterStatus) -> Scooter {
        Scooter {
            scooter_id: id.into(),
            status,
            location: Location::new(40.71, -74.0),
            battery_level: 90,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn reserve_is_conditional_on_availability() {
        let store = MemoryFleetStore::new();
        store.put_scooter(&scooter("s1", ScooterStatus::Available)).await.unwrap();

        let (reserved, trip) = store.reserve_scooter(NewTrip::new("u1", "s1", None)).await.unwrap();
        assert_eq!(reserved.status, ScooterStatus::InUse);
        assert_eq!(trip.start_location, reserved.location);

        let second = store.reserve_scooter(NewTrip::new("u2", "s1", None)).await;
        assert!(matches!(second, Err(StoreError::ConditionFailed)));

        let missing = store.reserve_scooter(NewTrip::new("u2", "nope", None)).await;
        assert!(matches!(missing, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn duplicate_key_leaves_scooter_untouched() {
        let store = MemoryFleetStore::new();
        store.put_scooter(&scooter("s1", ScooterStatus::Available)).await.unwrap();
        store.put_scooter(&scooter("s2", ScooterStatus::Available)).await.unwrap();
        store
            .reserve_scooter(NewTrip::new("u1", "s1", Some("k1".into())))
            .await
            .unwrap();

        let dup = store
            .reserve_scooter(NewTrip::new("u1", "s2", Some("k1".into())))
            .await;
        assert!(matches!(dup, Err(StoreError::DuplicateIdempotencyKey(_))));
        let s2 = store.get_scooter("s2").await.unwrap().unwrap();
        assert_eq!(s2.status, ScooterStatus::Available);
    }

    #[tokio::test]
    async fn complete_trip_only_once() {
        let store = MemoryFleetStore::new();
        store.put_scooter(&scooter("s1", ScooterStatus::Available)).await.unwrap();
        let (_, trip) = store.reserve_scooter(NewTrip::new("u1", "s1", None)).await.unwrap();

        let completion = trip.completion(Location::new(40.72, -74.0), Utc::now());
        let done = store.complete_trip(&trip.trip_id, completion).await.unwrap();
        assert_eq!(done.status, TripStatus::Completed);

        let again = store.complete_trip(&trip.trip_id, completion).await;
        assert!(matches!(again, Err(StoreError::ConditionFailed)));
        let missing = store.complete_trip("nope", completion).await;
        assert!(matches!(missing, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn stuck_scooters_are_in_use_without_active_trip() {
        let store = MemoryFleetStore::new();
        store.put_scooter(&scooter("busy", ScooterStatus::Available)).await.unwrap();
        store.put_scooter(&scooter("stuck", ScooterStatus::InUse)).await.unwrap();
        store.reserve_scooter(NewTrip::new("u1", "busy", None)).await.unwrap();

        let stuck = store.scan_stuck_scooters(Utc::now()).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].scooter_id, "stuck");

        assert!(store.release_if_idle("busy", None).await.unwrap().is_none());
        let repaired = store.release_if_idle("stuck", None).await.unwrap().unwrap();
        assert_eq!(repaired.status, ScooterStatus::Available);
        assert!(store.release_if_idle("stuck", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recently_ended_trips_hide_scooter_from_scan() {
        let store = MemoryFleetStore::new();
        store.put_scooter(&scooter("s1", ScooterStatus::Available)).await.unwrap();
        let (_, trip) = store.reserve_scooter(NewTrip::new("u1", "s1", None)).await.unwrap();
        let ended = Utc::now();
        let completion = trip.completion(Location::new(40.72, -74.0), ended);
        store.complete_trip(&trip.trip_id, completion).await.unwrap();

        // 车辆仍为 IN_USE，但行程刚结束，释放可能还在路上
        let cutoff = ended - chrono::Duration::seconds(5);
        assert!(store.scan_stuck_scooters(cutoff).await.unwrap().is_empty());
        let later = ended + chrono::Duration::seconds(1);
        assert_eq!(store.scan_stuck_scooters(later).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn one_active_trip_per_scooter() {
        let store = MemoryFleetStore::new();
        store.put_scooter(&scooter("s1", ScooterStatus::Available)).await.unwrap();
        store.reserve_scooter(NewTrip::new("u1", "s1", None)).await.unwrap();

        // 车队录入把车辆改回 AVAILABLE，但 ACTIVE 行程仍在
        store.put_scooter(&scooter("s1", ScooterStatus::Available)).await.unwrap();
        let second = store.reserve_scooter(NewTrip::new("u2", "s1", None)).await;
        assert!(matches!(second, Err(StoreError::ConditionFailed)));
    }

    #[tokio::test]
    async fn release_refuses_scooter_held_by_active_trip() {
        let store = MemoryFleetStore::new();
        store.put_scooter(&scooter("s1", ScooterStatus::Available)).await.unwrap();
        let (_, trip) = store.reserve_scooter(NewTrip::new("u1", "s1", None)).await.unwrap();

        let held = store.release_scooter("s1", Location::new(1.0, 1.0)).await;
        assert!(matches!(held, Err(StoreError::ConditionFailed)));
        assert_eq!(
            store.get_scooter("s1").await.unwrap().unwrap().status,
            ScooterStatus::InUse
        );

        let completion = trip.completion(Location::new(40.72, -74.0), Utc::now());
        store.complete_trip(&trip.trip_id, completion).await.unwrap();
        let released = store.release_scooter("s1", Location::new(40.72, -74.0)).await.unwrap();
        assert_eq!(released.status, ScooterStatus::Available);
        assert!(matches!(
            store.release_scooter("ghost", Location::new(0.0, 0.0)).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn total_distance_sums_completed_trips_only() {
        let store = MemoryFleetStore::new();
        store.put_scooter(&scooter("s1", ScooterStatus::Available)).await.unwrap();
        assert_eq!(store.user_total_distance("u1").await.unwrap(), None);

        let (_, trip) = store.reserve_scooter(NewTrip::new("u1", "s1", None)).await.unwrap();
        assert_eq!(store.user_total_distance("u1").await.unwrap(), None);

        let completion = trip.completion(Location::new(40.72, -74.0), Utc::now());
        store.complete_trip(&trip.trip_id, completion).await.unwrap();
        let total = store.user_total_distance("u1").await.unwrap().unwrap();
        assert!((total - completion.distance).abs() < 1e-9);
    }

    #[tokio::test]
    async fn mutations_are_broadcast_in_commit_order() {
        let store = MemoryFleetStore::new();
        let mut feed = store.change_feed();
        store.put_scooter(&scooter("s1", ScooterStatus::Available)).await.unwrap();
        store.reserve_scooter(NewTrip::new("u1", "s1", None)).await.unwrap();

        let first = feed.next_event().await.unwrap().unwrap();
        assert_eq!(first.event_type, ChangeEventType::Insert);
        assert_eq!(first.source, "scooters");
        let second = feed.next_event().await.unwrap().unwrap();
        assert_eq!(second.image["status"], "IN_USE");
        let third = feed.next_event().await.unwrap().unwrap();
        assert_eq!(third.source, "trips");
        assert_eq!(third.image["status"], "ACTIVE");
    }
}
