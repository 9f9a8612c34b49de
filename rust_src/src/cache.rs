//! Time-to-live cache for external lookups (item bank, acceptance maps).

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::Result;

struct Entry<T> {
    value: Arc<T>,
    loaded_at: Instant,
}

impl<T> Entry<T> {
    fn fresh(&self, ttl: Duration) -> bool {
        self.loaded_at.elapsed() < ttl
    }
}

/// Holds one value and reloads it after `ttl`.
///
/// One caller reloads at a time and the loader runs outside the value lock;
/// while a stale value exists everyone else keeps getting it. Callers only
/// wait when the cache is empty. A failed reload keeps serving the stale
/// value if there is one.
pub struct TtlCache<T> {
    name: &'static str,
    ttl: Duration,
    entry: RwLock<Option<Entry<T>>>,
    refresh: Mutex<()>,
}

impl<T> TtlCache<T> {
    pub fn new(name: &'static str, ttl: Duration) -> Self {
        Self {
            name,
            ttl,
            entry: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    fn snapshot(&self) -> (Option<Arc<T>>, bool) {
        match self.entry.read().as_ref() {
            Some(entry) => (Some(entry.value.clone()), entry.fresh(self.ttl)),
            None => (None, false),
        }
    }

    pub fn get_or_load<F>(&self, load: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        let (stale, fresh) = self.snapshot();
        if let (Some(value), true) = (&stale, fresh) {
            return Ok(value.clone());
        }

        let _refresh = match &stale {
            Some(value) => match self.refresh.try_lock() {
                Some(guard) => guard,
                None => return Ok(value.clone()),
            },
            None => {
                let guard = self.refresh.lock();
                // Another caller may have filled it while we waited.
                if let (Some(value), _) = self.snapshot() {
                    return Ok(value);
                }
                guard
            }
        };

        match load() {
            Ok(value) => {
                let value = Arc::new(value);
                debug!(cache = self.name, "cache refreshed");
                *self.entry.write() = Some(Entry {
                    value: value.clone(),
                    loaded_at: Instant::now(),
                });
                Ok(value)
            }
            Err(err) => match stale {
                Some(stale) => {
                    warn!(cache = self.name, error = %err, "reload failed, serving stale value");
                    Ok(stale)
                }
                None => Err(err),
            },
        }
    }

    pub fn invalidate(&self) {
        *self.entry.write() = None;
    }
}
