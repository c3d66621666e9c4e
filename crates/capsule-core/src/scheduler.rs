//! Periodic driver for [`UnlockEngine::scan_and_unlock_due`].
//!
//! One background task per scheduler, started and stopped explicitly. The
//! first tick fires immediately so capsules that fell due while the process
//! was down are released at startup. Scans never overlap: a forced run waits
//! for an in-flight tick and vice versa.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::engine::{ScanReport, UnlockEngine};

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub interval_secs: u64,
    pub scans_completed: u64,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub next_scan_at: Option<DateTime<Utc>>,
    pub last_report: Option<ScanReport>,
}

struct Shared {
    engine: Arc<UnlockEngine>,
    status: RwLock<SchedulerStatus>,
    scan_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    fn update(&self, f: impl FnOnce(&mut SchedulerStatus)) {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut status);
    }

    async fn scan(&self, now: DateTime<Utc>) -> ScanReport {
        let _guard = self.scan_lock.lock().await;
        let report = self.engine.scan_and_unlock_due(now).await;
        self.update(|status| {
            status.scans_completed += 1;
            status.last_scan_at = Some(report.finished_at);
            status.last_report = Some(report.clone());
        });
        report
    }
}

struct Worker {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct UnlockScheduler {
    shared: Arc<Shared>,
    interval: Duration,
    worker: Mutex<Option<Worker>>,
}

impl UnlockScheduler {
    pub fn new(engine: Arc<UnlockEngine>, interval: Duration) -> Self {
        let interval = interval.max(Duration::from_secs(1));
        let status = SchedulerStatus {
            is_running: false,
            interval_secs: interval.as_secs(),
            scans_completed: 0,
            last_scan_at: None,
            next_scan_at: None,
            last_report: None,
        };
        Self {
            shared: Arc::new(Shared {
                engine,
                status: RwLock::new(status),
                scan_lock: tokio::sync::Mutex::new(()),
            }),
            interval,
            worker: Mutex::new(None),
        }
    }

    /// Spawn the background task. Returns `false` if it is already running.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return false;
        }

        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();
        let shared = self.shared.clone();
        let period = self.interval;
        let step = chrono::Duration::from_std(period).unwrap_or(chrono::Duration::seconds(600));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        shared.scan(Utc::now()).await;
                        shared.update(|status| status.next_scan_at = Some(Utc::now() + step));
                    }
                }
            }
        });

        *worker = Some(Worker { shutdown, handle });
        self.shared.update(|status| status.is_running = true);
        info!(interval_secs = period.as_secs(), "Unlock scheduler started");
        true
    }

    /// Stop the background task, letting an in-flight scan finish first.
    pub async fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(worker) = worker else {
            return;
        };

        let _ = worker.shutdown.send(());
        if let Err(e) = worker.handle.await {
            error!(error = %e, "Unlock scheduler task failed");
        }

        self.shared.update(|status| {
            status.is_running = false;
            status.next_scan_at = None;
        });
        info!("Unlock scheduler stopped");
    }

    /// Run one scan now, independent of the timer.
    pub async fn run_once(&self, now: DateTime<Utc>) -> ScanReport {
        self.shared.scan(now).await
    }

    pub fn is_running(&self) -> bool {
        self.status().is_running
    }

    pub fn status(&self) -> SchedulerStatus {
        self.shared
            .status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for UnlockScheduler {
    fn drop(&mut self) {
        if let Some(worker) = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = worker.shutdown.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::shared;
    use crate::payload::{PayloadStore, SqlitePayloadStore};
    use crate::records::{CapsuleRecords, SqliteRecords};
    use capsule_shared::crypto;
    use capsule_shared::{CapsuleId, ContentKind, Recipient, UserId};
    use capsule_store::{Capsule, CapsuleState, Database};

    async fn engine_with_due_capsule() -> (Arc<UnlockEngine>, Arc<SqliteRecords>, CapsuleId) {
        let db = shared(Database::open_in_memory().unwrap());
        let records = Arc::new(SqliteRecords::new(db.clone()));
        let payloads = Arc::new(SqlitePayloadStore::new(db));
        let key = crypto::generate_symmetric_key();

        let sealed = crypto::encrypt(&key, b"tick").unwrap();
        let now = Utc::now();
        let capsule = Capsule {
            id: CapsuleId::new(),
            owner_id: UserId::from("alice"),
            recipient: Recipient::Email("friend@example.com".into()),
            unlock_at: now - chrono::Duration::minutes(1),
            state: CapsuleState::Locked,
            unlocked_at: None,
            ciphertext_ref: payloads.put(&sealed.ciphertext).await.unwrap(),
            nonce: sealed.nonce,
            description: None,
            filename: "message.txt".into(),
            content_kind: ContentKind::Text,
            original_size: 4,
            created_at: now - chrono::Duration::days(1),
        };
        records.insert(&capsule).await.unwrap();

        let engine = Arc::new(UnlockEngine::new(records.clone(), payloads, key));
        (engine, records, capsule.id)
    }

    #[tokio::test]
    async fn run_once_without_timer() {
        let (engine, records, id) = engine_with_due_capsule().await;
        let scheduler = UnlockScheduler::new(engine, Duration::from_secs(3600));

        let report = scheduler.run_once(Utc::now()).await;
        assert_eq!(report.unlocked, vec![id]);
        assert!(records.get(id).await.unwrap().is_unlocked());

        let status = scheduler.status();
        assert!(!status.is_running);
        assert_eq!(status.scans_completed, 1);
        assert!(status.last_report.is_some());
    }

    #[tokio::test]
    async fn start_scans_immediately_and_stops() {
        let (engine, records, id) = engine_with_due_capsule().await;
        let scheduler = UnlockScheduler::new(engine, Duration::from_secs(3600));

        assert!(scheduler.start());
        assert!(!scheduler.start());
        assert!(scheduler.is_running());

        for _ in 0..200 {
            if scheduler.status().scans_completed > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(records.get(id).await.unwrap().is_unlocked());

        scheduler.stop().await;
        let status = scheduler.status();
        assert!(!status.is_running);
        assert_eq!(status.next_scan_at, None);
        assert_eq!(status.interval_secs, 3600);
    }

    #[tokio::test]
    async fn stop_without_start_is_noop() {
        let (engine, _records, _id) = engine_with_due_capsule().await;
        let scheduler = UnlockScheduler::new(engine, Duration::from_secs(60));
        scheduler.stop().await;
        assert!(!scheduler.is_running());
    }
}
