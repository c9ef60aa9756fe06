// Background schedulers feeding the dispatcher with fresh session scans.
// Each one coordinates across processes through scheduler_locks, so many
// workers can run the same configuration against one database.

pub mod recovery;
pub mod scan;

pub use recovery::RecoveryScheduler;
pub use scan::ScanScheduler;
