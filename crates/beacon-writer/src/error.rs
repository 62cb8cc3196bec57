use thiserror::Error;

/// Returned by [`crate::sbb::SegmentedByteBuffer::append`] when the buffer's
/// current capacity cannot hold the requested bytes.
#[derive(Debug, Error)]
#[error("segmented byte buffer has no room for the requested write")]
pub struct BufferFull;
