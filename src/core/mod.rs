//! 备份核心：树扫描、差异分析、压缩暂存与传输

pub mod comparator;
pub mod compress;
pub mod engine;
pub mod entry;
pub mod listing;
pub mod scanner;
pub mod transfer;

pub use comparator::{DiffEngine, TransferCandidate, UploadPlan};
pub use compress::{Compressor, GzipCompressor};
pub use engine::{BackupEngine, BackupReport};
pub use entry::{EntryKind, FileEntry};
pub use listing::{ListingParser, ListingRecord};
pub use scanner::{LocalScanner, RemoteScanner, ScanSummary};
pub use transfer::{DirectoryCreationTracker, TransferSession};
