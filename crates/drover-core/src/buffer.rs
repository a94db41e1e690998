//! Copy buffer sizing.
//!
//! Chunk sizes are tiered by file size; the small-file tier is further
//! bounded by an adaptive limit derived once from available memory.

use once_cell::sync::OnceCell;

const KB: usize = 1024;
const MB: usize = 1024 * KB;

pub struct BufferPolicy {
    adaptive: OnceCell<usize>,
}

impl BufferPolicy {
    pub fn new() -> Self {
        Self {
            adaptive: OnceCell::new(),
        }
    }

    #[cfg(test)]
    fn with_memory(available_bytes: u64) -> Self {
        let policy = Self::new();
        let _ = policy.adaptive.set(adaptive_from(available_bytes));
        policy
    }

    /// 10% of available memory, clamped to [4 MiB, 64 MiB]. Computed once.
    pub fn adaptive_limit(&self) -> usize {
        *self.adaptive.get_or_init(|| {
            use sysinfo::System;
            let mut sys = System::new();
            sys.refresh_memory();
            adaptive_from(sys.available_memory())
        })
    }

    /// Chunk size for one read/write (or sendfile) step of a file copy.
    pub fn chunk_size(&self, file_size: u64) -> usize {
        if file_size >= 64 * MB as u64 {
            MB
        } else if file_size >= MB as u64 {
            64 * KB
        } else {
            (8 * KB).min(self.adaptive_limit())
        }
    }
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self::new()
    }
}

fn adaptive_from(available_bytes: u64) -> usize {
    let tenth = available_bytes / 10;
    (tenth as usize).clamp(4 * MB, 64 * MB)
}
