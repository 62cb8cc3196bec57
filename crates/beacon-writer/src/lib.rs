mod backoff;
mod chain;
mod error;
mod sbb;
mod sink;
mod writer;

pub use error::BufferFull;
pub use sink::{OutputSink, TcpSink};
pub use writer::{BufferedWriter, WriteBufGuard, WriterConfig, DEFAULT_CHUNK_BYTES};
