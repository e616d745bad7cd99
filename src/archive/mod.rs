//! Archive transfer: a tar+gzip producer that streams while it encodes, and
//! the matching extractor.

pub mod extract;
pub mod pipe;
pub mod producer;

pub use extract::extract;
pub use producer::{ArchiveProducer, ArchiveStats, ArchiveStream, ARCHIVE_CHUNK_SIZE};
