//! Scoped write sessions.

use std::sync::Arc;

use tracing::warn;

use crate::cache::ObjectCache;
use crate::error::StoreResult;

/// Flushes its cache when finished or dropped, so every exit path of a
/// write scope (including `?` returns and panics unwinding through it)
/// persists what was written.
///
/// Prefer [`WriteSession::finish`]: a flush failure on drop can only be
/// logged.
pub struct WriteSession {
    cache: Arc<ObjectCache>,
    finished: bool,
}

impl WriteSession {
    pub fn new(cache: Arc<ObjectCache>) -> StoreResult<Self> {
        cache.check_writable()?;
        Ok(Self {
            cache,
            finished: false,
        })
    }

    pub fn cache(&self) -> &Arc<ObjectCache> {
        &self.cache
    }

    /// Flush now and end the session. Returns the number of keys written.
    pub fn finish(mut self) -> StoreResult<usize> {
        self.finished = true;
        self.cache.flush()
    }
}

impl Drop for WriteSession {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Err(e) = self.cache.flush() {
            warn!(error = %e, "flush on session drop failed");
        }
    }
}

impl std::fmt::Debug for WriteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteSession")
            .field("cache", &self.cache)
            .field("finished", &self.finished)
            .finish()
    }
}
