use crate::sbb::SegmentedByteBuffer;

/// One node in the circular producer/consumer ring. `next` is an index into
/// the writer's arena rather than a pointer or `Rc`, so the whole ring lives
/// behind the single mutex that guards the arena and can be mutated freely
/// while that lock is held.
pub(crate) struct ChainLink {
    pub sbb: SegmentedByteBuffer,
    pub target_size: usize,
    pub next: usize,
    pub reading: bool,
}

impl ChainLink {
    pub fn new(target_size: usize, next: usize) -> Self {
        Self { sbb: SegmentedByteBuffer::new(target_size), target_size, next, reading: false }
    }
}
