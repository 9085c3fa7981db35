pub mod config;
pub mod core;
pub mod error;
pub mod ftp;
pub mod logging;

pub use config::BackupConfig;
pub use core::{BackupEngine, BackupReport};
pub use error::{BackupError, Result};
