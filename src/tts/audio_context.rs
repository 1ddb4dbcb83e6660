//! Per-generation audio context tracking.
//!
//! Every synthesis gets an opaque context id; inbound audio is only
//! accepted while its id is the current one or still present here. The
//! table is the arbiter for stale-chunk suppression after interruptions.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// A word boundary reported by the vendor.
#[derive(Debug, Clone, PartialEq)]
pub struct WordTimestamp {
    /// The spoken word.
    pub word: String,
    /// Offset from the start of the synthesis.
    pub start_time: Duration,
}

/// Bookkeeping for one synthesis generation.
#[derive(Debug)]
pub struct AudioContext {
    /// Opaque context id.
    pub id: String,
    /// When the context was created.
    pub created_at: Instant,
    /// Number of audio chunks received.
    pub chunk_count: usize,
    /// Total audio bytes received.
    pub total_bytes: usize,
    /// Word boundaries received so far.
    pub words: Vec<WordTimestamp>,
}

impl AudioContext {
    fn new(id: String) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            chunk_count: 0,
            total_bytes: 0,
            words: Vec::new(),
        }
    }
}

/// Live audio contexts, keyed by id.
///
/// Look-ups on the audio-receiving path take the read lock only.
#[derive(Debug, Default)]
pub struct AudioContextTable {
    inner: RwLock<HashMap<String, AudioContext>>,
}

impl AudioContextTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh context.
    pub fn create(&self, id: &str) {
        write(&self.inner).insert(id.to_owned(), AudioContext::new(id.to_owned()));
    }

    /// Whether `id` is live.
    pub fn contains(&self, id: &str) -> bool {
        read(&self.inner).contains_key(id)
    }

    /// Number of live contexts.
    pub fn len(&self) -> usize {
        read(&self.inner).len()
    }

    /// Whether no contexts are live.
    pub fn is_empty(&self) -> bool {
        read(&self.inner).is_empty()
    }

    /// Drop a context, returning its bookkeeping.
    pub fn remove(&self, id: &str) -> Option<AudioContext> {
        write(&self.inner).remove(id)
    }

    /// Account one received audio chunk against `id`.
    ///
    /// Returns false if the context is not live.
    pub fn record_chunk(&self, id: &str, bytes: usize) -> bool {
        let mut table = write(&self.inner);
        match table.get_mut(id) {
            Some(context) => {
                context.chunk_count += 1;
                context.total_bytes += bytes;
                true
            }
            None => false,
        }
    }

    /// Record a word boundary against `id`.
    pub fn add_word(&self, id: &str, word: &str, start_time: Duration) {
        if let Some(context) = write(&self.inner).get_mut(id) {
            context.words.push(WordTimestamp {
                word: word.to_owned(),
                start_time,
            });
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
