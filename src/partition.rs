use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Chunks per worker produced by [`PartitionPolicy::Balanced`].
pub const CHUNKS_PER_WORKER: usize = 4;

/// Contiguous range of source indices owned by a single worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub start: usize,
    pub end: usize,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn indices(&self) -> Range<usize> {
        self.start .. self.end
    }
}

/// How a source is cut into chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PartitionPolicy {
    /// One chunk per worker.
    Range,
    /// Several smaller chunks per worker, pulled on demand so that fast
    /// workers take over the ranges slow workers have not reached yet.
    #[default]
    Balanced,
    /// Chunks of the given size; the last one may be shorter.
    Fixed(usize),
}

/// Splits `len` indices into non-empty chunks covering every index exactly once.
pub fn partition(len: usize, workers: usize, policy: PartitionPolicy) -> Vec<Chunk> {
    if len == 0 || workers == 0 {
        return Vec::new();
    }

    match policy {
        PartitionPolicy::Range =>
            even_split(len, workers.min(len)),
        PartitionPolicy::Balanced =>
            even_split(len, workers.saturating_mul(CHUNKS_PER_WORKER).min(len)),
        PartitionPolicy::Fixed(size) => {
            let size = size.max(1);
            (0 .. len)
                .step_by(size)
                .map(|start| Chunk { start, end: (start + size).min(len) })
                .collect()
        },
    }
}

fn even_split(len: usize, count: usize) -> Vec<Chunk> {
    let base = len / count;
    let extra = len % count;
    let mut chunks = Vec::with_capacity(count);
    let mut start = 0;
    for i in 0 .. count {
        let size = if i < extra { base + 1 } else { base };
        chunks.push(Chunk { start, end: start + size });
        start += size;
    }
    chunks
}

/// Chunks shared between workers; each chunk is handed out once.
pub struct ChunkQueue {
    chunks: Vec<Chunk>,
    cursor: AtomicUsize,
}

impl ChunkQueue {
    pub fn new(chunks: Vec<Chunk>) -> ChunkQueue {
        ChunkQueue {
            chunks,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn pull(&self) -> Pull<'_> {
        Pull { queue: self }
    }
}

/// Worker-side view of a [`ChunkQueue`].
pub struct Pull<'q> {
    queue: &'q ChunkQueue,
}

impl Iterator for Pull<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let current = self.queue.cursor.fetch_add(1, Ordering::Relaxed);
        self.queue.chunks.get(current).copied()
    }
}
