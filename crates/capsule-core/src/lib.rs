//! # capsule-core
//!
//! The unlock lifecycle of Time Capsule Cloud.
//!
//! - [`records`]: the capsule record seam, whose conditional unlock write is
//!   the only guard against double release.
//! - [`payload`]: where ciphertext lives (filesystem or SQLite).
//! - [`engine`]: the `Locked -> Unlocked` state machine and due scan.
//! - [`scheduler`]: the background driver that runs scans on a cadence.
//! - [`service`]: the capsule operations the HTTP layer calls.
//! - [`notify`]: release notifications fired by fresh unlocks.
//! - [`dashboard`]: per-user counts and upcoming unlocks.

pub mod dashboard;
pub mod db;
pub mod engine;
pub mod notify;
pub mod payload;
pub mod records;
pub mod scheduler;
pub mod service;

pub use dashboard::{Dashboard, DashboardStats};
pub use db::{shared, DbError, SharedDb};
pub use engine::{ScanFailure, ScanReport, UnlockEngine, UnlockError, UnlockOutcome};
pub use notify::{NotificationCenter, UnlockListener};
pub use payload::{FsPayloadStore, PayloadError, PayloadStore, SqlitePayloadStore};
pub use records::{CapsuleRecords, RecordError, SqliteRecords};
pub use scheduler::{SchedulerStatus, UnlockScheduler};
pub use service::{CapsuleChanges, CapsuleContent, CapsuleError, CapsuleService, NewCapsule, OpenedCapsule};
