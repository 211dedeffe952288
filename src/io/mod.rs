//! Chunked reading and writing over registered drivers.

mod info;
mod reader;
mod writer;

pub use info::{dataset_info, info_batch, DatasetInfo};
pub use reader::{ChunkedReader, GeometryFilter, ReaderOptions, DEFAULT_CHUNK_SIZE};
pub use writer::ChunkedWriter;
