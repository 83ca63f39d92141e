//! Backups: service fan-out, kernel snapshots, storage, encryption, schedules

pub mod coordinator;
pub mod crypto;
pub mod kernel_backup;
pub mod r2;
pub mod schedule;
pub mod storage;

pub use coordinator::{BackupCoordinator, SKIPPED_UNHEALTHY};
pub use crypto::{decrypt_backup, encrypt_backup, generate_key, KeyManager};
pub use kernel_backup::KernelBackups;
pub use r2::{R2Config, R2Store};
pub use schedule::{validate_cron_expression, ScheduleStore};
pub use storage::{BackupStorage, ObjectStore};
