use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{FleetStore, ScooterFilter, StoreError, StoreResult};
use crate::models::{
    Location, NewTrip, Scooter, ScooterRecord, ScooterStatus, Trip, TripCompletion, TripRecord,
};

const SCHEMA: &str = include_str!("../../migrations/schema.sql");

const SCOOTER_COLUMNS: &str = "scooter_id, status, latitude, longitude, battery_level, updated_at";

const TRIP_COLUMNS: &str = "trip_id, user_id, scooter_id, status, start_time, end_time, \
     start_latitude, start_longitude, end_latitude, end_longitude, distance, idempotency_key";

/// Postgres 权威存储。表名来自配置，已在加载配置时校验为合法标识符
#[derive(Clone)]
pub struct PgFleetStore {
    pool: PgPool,
    fleet_table: String,
    trip_table: String,
}

fn db_error(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        other => {
            tracing::error!("Database error: {}", other);
            StoreError::Unavailable(other.to_string())
        }
    }
}

fn to_scooters(records: Vec<ScooterRecord>) -> StoreResult<Vec<Scooter>> {
    records
        .into_iter()
        .map(|r| Scooter::try_from(r).map_err(StoreError::from))
        .collect()
}

impl PgFleetStore {
    pub fn new(pool: PgPool, fleet_table: &str, trip_table: &str) -> Self {
        Self {
            pool,
            fleet_table: fleet_table.to_string(),
            trip_table: trip_table.to_string(),
        }
    }

    /// 建表并安装变更流触发器，可重复执行
    pub async fn ensure_schema(&self, channel: &str) -> Result<(), sqlx::Error> {
        let sql = SCHEMA
            .replace("__FLEET_TABLE__", &self.fleet_table)
            .replace("__TRIP_TABLE__", &self.trip_table)
            .replace("__CHANNEL__", channel);
        sqlx::raw_sql(&sql).execute(&self.pool).await?;
        tracing::info!(
            "Schema ready for tables {} and {}",
            self.fleet_table,
            self.trip_table
        );
        Ok(())
    }

    async fn scooter_exists(&self, scooter_id: &str) -> StoreResult<bool> {
        sqlx::query_scalar::<_, bool>(&format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE scooter_id = $1)",
            self.fleet_table
        ))
        .bind(scooter_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn trip_exists(&self, trip_id: &str) -> StoreResult<bool> {
        sqlx::query_scalar::<_, bool>(&format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE trip_id = $1)",
            self.trip_table
        ))
        .bind(trip_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)
    }

    /// 车辆没有 ACTIVE 行程时置为 AVAILABLE，条件不成立返回 None。
    /// `only_in_use` 为 true 时还要求车辆当前为 IN_USE
    async fn release_unless_active(
        &self,
        scooter_id: &str,
        location: Option<Location>,
        only_in_use: bool,
    ) -> StoreResult<Option<Scooter>> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        // 先锁住车辆行，之后的查询使用新快照，能看到并发提交的行程
        let current = sqlx::query_as::<_, ScooterRecord>(&format!(
            "SELECT {} FROM {} WHERE scooter_id = $1 FOR UPDATE",
            SCOOTER_COLUMNS, self.fleet_table
        ))
        .bind(scooter_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?
        .ok_or(StoreError::NotFound)?;

        if only_in_use && Scooter::try_from(current)?.status != ScooterStatus::InUse {
            tx.rollback().await.map_err(db_error)?;
            return Ok(None);
        }

        let has_active_trip = sqlx::query_scalar::<_, bool>(&format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE scooter_id = $1 AND status = 'ACTIVE')",
            self.trip_table
        ))
        .bind(scooter_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;

        if has_active_trip {
            tx.rollback().await.map_err(db_error)?;
            return Ok(None);
        }

        let record = sqlx::query_as::<_, ScooterRecord>(&format!(
            r#"
            UPDATE {} SET
                status = 'AVAILABLE',
                latitude = COALESCE($2, latitude),
                longitude = COALESCE($3, longitude),
                updated_at = NOW()
            WHERE scooter_id = $1
            RETURNING {}
            "#,
            self.fleet_table, SCOOTER_COLUMNS
        ))
        .bind(scooter_id)
        .bind(location.map(|l| l.latitude))
        .bind(location.map(|l| l.longitude))
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(Some(Scooter::try_from(record)?))
    }

    // 插入行程时的唯一约束冲突：幂等键重复，或同一车辆已有 ACTIVE 行程
    fn trip_insert_error(&self, e: sqlx::Error, key: Option<&str>) -> StoreError {
        if let sqlx::Error::Database(db) = &e {
            if db.is_unique_violation() {
                let key_index = format!("{}_idempotency_key_idx", self.trip_table);
                return match (db.constraint(), key) {
                    (Some(constraint), Some(key)) if constraint == key_index => {
                        StoreError::DuplicateIdempotencyKey(key.to_string())
                    }
                    _ => StoreError::ConditionFailed,
                };
            }
        }
        db_error(e)
    }
}

#[async_trait]
impl FleetStore for PgFleetStore {
    async fn get_scooter(&self, scooter_id: &str) -> StoreResult<Option<Scooter>> {
        let record = sqlx::query_as::<_, ScooterRecord>(&format!(
            "SELECT {} FROM {} WHERE scooter_id = $1",
            SCOOTER_COLUMNS, self.fleet_table
        ))
        .bind(scooter_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(record.map(Scooter::try_from).transpose()?)
    }

    async fn put_scooter(&self, scooter: &Scooter) -> StoreResult<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (scooter_id, status, latitude, longitude, battery_level, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (scooter_id) DO UPDATE SET
                status = EXCLUDED.status,
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                battery_level = EXCLUDED.battery_level,
                updated_at = EXCLUDED.updated_at
            "#,
            self.fleet_table
        ))
        .bind(&scooter.scooter_id)
        .bind(scooter.status.as_str())
        .bind(scooter.location.latitude)
        .bind(scooter.location.longitude)
        .bind(scooter.battery_level)
        .bind(scooter.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn scan_scooters(&self, filter: ScooterFilter) -> StoreResult<Vec<Scooter>> {
        let records = match filter.status {
            Some(status) => {
                sqlx::query_as::<_, ScooterRecord>(&format!(
                    "SELECT {} FROM {} WHERE status = $1",
                    SCOOTER_COLUMNS, self.fleet_table
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, ScooterRecord>(&format!(
                    "SELECT {} FROM {}",
                    SCOOTER_COLUMNS, self.fleet_table
                ))
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(db_error)?;

        to_scooters(records)
    }

    async fn get_scooters(&self, scooter_ids: &[String]) -> StoreResult<Vec<Scooter>> {
        if scooter_ids.is_empty() {
            return Ok(Vec::new());
        }
        let records = sqlx::query_as::<_, ScooterRecord>(&format!(
            "SELECT {} FROM {} WHERE scooter_id = ANY($1)",
            SCOOTER_COLUMNS, self.fleet_table
        ))
        .bind(scooter_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        to_scooters(records)
    }

    async fn get_trip(&self, trip_id: &str) -> StoreResult<Option<Trip>> {
        let record = sqlx::query_as::<_, TripRecord>(&format!(
            "SELECT {} FROM {} WHERE trip_id = $1",
            TRIP_COLUMNS, self.trip_table
        ))
        .bind(trip_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(record.map(Trip::try_from).transpose()?)
    }

    async fn find_trip_by_idempotency_key(&self, key: &str) -> StoreResult<Option<Trip>> {
        let record = sqlx::query_as::<_, TripRecord>(&format!(
            "SELECT {} FROM {} WHERE idempotency_key = $1",
            TRIP_COLUMNS, self.trip_table
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(record.map(Trip::try_from).transpose()?)
    }

    async fn reserve_scooter(&self, trip: NewTrip) -> StoreResult<(Scooter, Trip)> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        // 条件更新，同一车辆的并发请求在行锁上串行化，只有一个能满足 status = 'AVAILABLE'
        let updated = sqlx::query_as::<_, ScooterRecord>(&format!(
            r#"
            UPDATE {} SET status = 'IN_USE', updated_at = NOW()
            WHERE scooter_id = $1 AND status = 'AVAILABLE'
            RETURNING {}
            "#,
            self.fleet_table, SCOOTER_COLUMNS
        ))
        .bind(&trip.scooter_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;

        let Some(record) = updated else {
            tx.rollback().await.map_err(db_error)?;
            return Err(if self.scooter_exists(&trip.scooter_id).await? {
                StoreError::ConditionFailed
            } else {
                StoreError::NotFound
            });
        };
        let scooter = Scooter::try_from(record)?;

        let inserted = sqlx::query_as::<_, TripRecord>(&format!(
            r#"
            INSERT INTO {} (
                trip_id, user_id, scooter_id, status, start_time,
                start_latitude, start_longitude, distance, idempotency_key
            )
            VALUES ($1, $2, $3, 'ACTIVE', $4, $5, $6, 0, $7)
            RETURNING {}
            "#,
            self.trip_table, TRIP_COLUMNS
        ))
        .bind(&trip.trip_id)
        .bind(&trip.user_id)
        .bind(&trip.scooter_id)
        .bind(trip.start_time)
        .bind(scooter.location.latitude)
        .bind(scooter.location.longitude)
        .bind(trip.idempotency_key.as_deref())
        .fetch_one(&mut *tx)
        .await;

        let record = match inserted {
            Ok(record) => record,
            Err(e) => {
                let err = self.trip_insert_error(e, trip.idempotency_key.as_deref());
                tx.rollback().await.map_err(db_error)?;
                return Err(err);
            }
        };

        tx.commit().await.map_err(db_error)?;
        Ok((scooter, Trip::try_from(record)?))
    }

    async fn complete_trip(&self, trip_id: &str, completion: TripCompletion) -> StoreResult<Trip> {
        let updated = sqlx::query_as::<_, TripRecord>(&format!(
            r#"
            UPDATE {} SET
                status = 'COMPLETED',
                end_time = $2,
                end_latitude = $3,
                end_longitude = $4,
                distance = $5
            WHERE trip_id = $1 AND status = 'ACTIVE'
            RETURNING {}
            "#,
            self.trip_table, TRIP_COLUMNS
        ))
        .bind(trip_id)
        .bind(completion.end_time)
        .bind(completion.end_location.latitude)
        .bind(completion.end_location.longitude)
        .bind(completion.distance)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match updated {
            Some(record) => Ok(Trip::try_from(record)?),
            None if self.trip_exists(trip_id).await? => Err(StoreError::ConditionFailed),
            None => Err(StoreError::NotFound),
        }
    }

    async fn release_scooter(&self, scooter_id: &str, location: Location) -> StoreResult<Scooter> {
        self.release_unless_active(scooter_id, Some(location), false)
            .await?
            .ok_or(StoreError::ConditionFailed)
    }

    async fn release_if_idle(
        &self,
        scooter_id: &str,
        location: Option<Location>,
    ) -> StoreResult<Option<Scooter>> {
        self.release_unless_active(scooter_id, location, true).await
    }

    async fn scan_stuck_scooters(&self, ended_after: DateTime<Utc>) -> StoreResult<Vec<Scooter>> {
        let records = sqlx::query_as::<_, ScooterRecord>(&format!(
            r#"
            SELECT {columns} FROM {fleet}
            WHERE status = 'IN_USE'
              AND NOT EXISTS (
                  SELECT 1 FROM {trips} t
                  WHERE t.scooter_id = {fleet}.scooter_id
                    AND (t.status = 'ACTIVE' OR t.end_time > $1)
              )
            "#,
            columns = SCOOTER_COLUMNS,
            fleet = self.fleet_table,
            trips = self.trip_table
        ))
        .bind(ended_after)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        to_scooters(records)
    }

    async fn user_total_distance(&self, user_id: &str) -> StoreResult<Option<f64>> {
        sqlx::query_scalar::<_, Option<f64>>(&format!(
            "SELECT SUM(distance) FROM {} WHERE user_id = $1 AND status = 'COMPLETED'",
            self.trip_table
        ))
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)
    }
}
