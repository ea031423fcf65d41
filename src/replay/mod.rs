//! Time-ordered archive replay: a lazy [`ArchiveReader`] paced onto the Bus
//! by a [`ReplayScheduler`] (spec.md §4.4).

pub mod archive;
pub mod scheduler;

pub use archive::{ArchiveEntry, ArchiveReader, JsonLinesArchiveReader};
pub use scheduler::{EntryFilter, ReplayScheduler};
