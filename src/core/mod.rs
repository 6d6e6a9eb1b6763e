pub mod archive;
pub mod backup;
pub mod checksum;
pub mod cleanup;
pub mod command;
pub mod config;
pub mod error;
pub mod mysql;
pub mod naming;
pub mod prereq;
pub mod prompt;
pub mod restore;
pub mod retention;
pub mod storage;
pub mod workspace;

pub use backup::BackupRunner;
pub use config::Config;
pub use error::SiteBackupError;
pub use restore::{RestoreArgs, Restorer};
