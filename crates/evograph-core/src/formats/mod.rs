//! # Formats
//!
//! Binary encodings of the event log: the postcard records stored by the
//! redb backend and the portable archive used for export and import.

pub mod persistence;

pub use persistence::{
    ArchiveHeader, EventRecord, MAX_ARCHIVE_SIZE, SnapshotRecord, archive_from_bytes,
    archive_to_bytes, export_store, import_store,
};
