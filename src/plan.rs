/// Below this many bytes per chunk, splitting costs more than it saves.
pub const MIN_CHUNK_SIZE: u64 = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub index: usize,
    pub start: u64,
    /// Inclusive, as in the `Range` header.
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    content_length: u64,
    chunks: Vec<ChunkRange>,
}

/// Number of chunks worth using for `content_length` bytes.
pub fn chunk_count(requested: usize, content_length: u64) -> usize {
    let by_size = content_length / MIN_CHUNK_SIZE;
    (requested as u64).min(by_size).max(1) as usize
}

impl ChunkPlan {
    /// Splits `[0, content_length)` into contiguous ranges. Leftover bytes go to the
    /// first chunks, one each, so sizes differ by at most one byte.
    pub fn new(content_length: u64, requested: usize) -> Self {
        if content_length == 0 {
            return Self {
                content_length,
                chunks: vec![],
            };
        }

        let count = chunk_count(requested, content_length) as u64;
        let base = content_length / count;
        let remainder = content_length % count;

        let mut chunks = Vec::with_capacity(count as usize);
        let mut offset = 0;
        for i in 0..count {
            let size = base + u64::from(i < remainder);
            chunks.push(ChunkRange {
                index: i as usize,
                start: offset,
                end: offset + size - 1,
            });
            offset += size;
        }

        Self {
            content_length,
            chunks,
        }
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn chunks(&self) -> &[ChunkRange] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
