pub mod detector;
pub mod listing;
pub mod scheduler;

pub use detector::{diff_entries, ChangeDetector, Delta, ScanReport};
pub use listing::{list_children, FsEntry};
pub use scheduler::{PassSummary, ScanScheduler};
