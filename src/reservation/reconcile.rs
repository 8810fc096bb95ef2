// 对账任务
// 修复“行程已完成但车辆仍为 IN_USE”的状态：消费释放队列，并定期扫描存储

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{StreamExt, stream};

use super::{PendingRelease, ReleaseReceiver};
use crate::config::Config;
use crate::models::Location;
use crate::store::{FleetStore, StoreError};
use crate::utils::timed;

const SWEEP_CONCURRENCY: usize = 8;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// 来自释放队列并已修复
    pub queued_repaired: usize,
    /// 扫描发现并已修复
    pub swept_repaired: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RepairOutcome {
    Repaired,
    NotNeeded,
    Failed,
}

pub struct Reconciler {
    store: Arc<dyn FleetStore>,
    releases: ReleaseReceiver,
    interval: Duration,
    grace: Duration,
    store_timeout: Duration,
}

impl Reconciler {
    pub fn new(store: Arc<dyn FleetStore>, releases: ReleaseReceiver, config: &Config) -> Self {
        Self {
            store,
            releases,
            interval: config.reconcile_interval(),
            grace: config.reconcile_grace(),
            store_timeout: config.store_timeout(),
        }
    }

    async fn repair(&self, scooter_id: String, location: Option<Location>) -> RepairOutcome {
        match timed(
            self.store_timeout,
            self.store.release_if_idle(&scooter_id, location),
        )
        .await
        {
            Ok(Some(_)) => {
                tracing::warn!(scooter_id = %scooter_id, "Released scooter stuck in use");
                RepairOutcome::Repaired
            }
            Ok(None) => RepairOutcome::NotNeeded,
            Err(StoreError::NotFound) => {
                tracing::error!(scooter_id = %scooter_id, "Cannot repair unknown scooter");
                RepairOutcome::Failed
            }
            Err(e) => {
                tracing::error!(scooter_id = %scooter_id, "Scooter repair failed: {}", e);
                RepairOutcome::Failed
            }
        }
    }

    async fn repair_queued(&self, pending: PendingRelease) -> RepairOutcome {
        tracing::debug!(
            trip_id = %pending.trip_id,
            scooter_id = %pending.scooter_id,
            "Retrying scooter release"
        );
        self.repair(pending.scooter_id, Some(pending.location)).await
    }

    /// 处理队列中已有的全部释放请求，不等待新请求。
    /// 修复失败的车辆不再入队，定期扫描会再次发现它们
    pub async fn drain_queue(&mut self) -> SweepReport {
        let mut report = SweepReport::default();
        while let Ok(pending) = self.releases.try_recv() {
            match self.repair_queued(pending).await {
                RepairOutcome::Repaired => report.queued_repaired += 1,
                RepairOutcome::NotNeeded => {}
                RepairOutcome::Failed => report.failed += 1,
            }
        }
        report
    }

    /// 扫描 IN_USE 但没有 ACTIVE 行程的车辆并释放。
    /// 宽限期内刚结束行程的车辆留给 EndTrip 自己释放
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let grace = chrono::Duration::from_std(self.grace).unwrap_or(chrono::Duration::MAX);
        let ended_after = Utc::now()
            .checked_sub_signed(grace)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let scan = self.store.scan_stuck_scooters(ended_after);
        let stuck = match timed(self.store_timeout, scan).await {
            Ok(stuck) => stuck,
            Err(e) => {
                tracing::error!("Reconciliation scan failed: {}", e);
                report.failed += 1;
                return report;
            }
        };
        if stuck.is_empty() {
            return report;
        }

        let outcomes: Vec<RepairOutcome> = stream::iter(stuck)
            .map(|scooter| self.repair(scooter.scooter_id, None))
            .buffer_unordered(SWEEP_CONCURRENCY)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                RepairOutcome::Repaired => report.swept_repaired += 1,
                RepairOutcome::NotNeeded => {}
                RepairOutcome::Failed => report.failed += 1,
            }
        }
        report
    }

    pub async fn run(mut self) {
        tracing::info!("Reconciler started, sweeping every {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut queue_open = true;

        loop {
            tokio::select! {
                pending = self.releases.recv(), if queue_open => match pending {
                    Some(pending) => {
                        self.repair_queued(pending).await;
                    }
                    None => {
                        tracing::warn!("Release queue closed, continuing with periodic sweeps only");
                        queue_open = false;
                    }
                },
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    if report != SweepReport::default() {
                        tracing::info!(
                            repaired = report.swept_repaired,
                            failed = report.failed,
                            "Reconciliation sweep finished"
                        );
                    }
                }
            }
        }
    }
}
