pub mod codec;
pub mod block;
pub mod error;
pub mod io_stream;
pub mod index;
pub mod rewrite;
pub mod archive;
pub mod recovery;

pub use archive::{Archive, ArchiveOptions, EntryInfo, OpenMode};
pub use block::{Block, EntryHeader, EntryKind};
pub use error::{ArchiveError, Result};
pub use index::EntryIndex;
pub use recovery::{repair, RecoveryReport};
