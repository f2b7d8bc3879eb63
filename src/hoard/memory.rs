//! In-memory hoard with a background sweeper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time;
use tracing::trace;

use super::{Hoard, HoardEntry};
use crate::error::{Result, SspError};
use crate::nut::Nut;

const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// The sweeper re-checks its time budget every this many entries.
const SWEEP_BATCH: usize = 100;

/// Longest the sweeper will hold the map lock in one tick. Whatever it did
/// not reach resumes on the next tick.
const SWEEP_BUDGET: Duration = Duration::from_millis(50);

struct Stored {
    entry: HoardEntry,
    expires_at: Instant,
}

impl Stored {
    fn expired(&self) -> bool {
        self.expires_at <= Instant::now()
    }
}

/// Mutex-guarded map hoard.
///
/// Construct inside a tokio runtime; the sweeper task exits on its own once
/// the hoard is dropped.
pub struct MemoryHoard {
    inner: Arc<Mutex<HashMap<Nut, Stored>>>,
}

impl MemoryHoard {
    pub fn new() -> Self {
        let inner = Arc::new(Mutex::new(HashMap::new()));
        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut tick = time::interval(SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                let Some(map) = weak.upgrade() else { return };
                sweep(&map);
            }
        });
        Self { inner }
    }
}

impl Default for MemoryHoard {
    fn default() -> Self {
        Self::new()
    }
}

fn sweep(map: &Mutex<HashMap<Nut, Stored>>) {
    let started = Instant::now();
    let mut guard = map.lock();
    let mut expired = Vec::new();
    for (scanned, (nut, stored)) in guard.iter().enumerate() {
        if stored.expired() {
            expired.push(nut.clone());
        }
        if (scanned + 1) % SWEEP_BATCH == 0 && started.elapsed() > SWEEP_BUDGET {
            break;
        }
    }
    if !expired.is_empty() {
        trace!(evicted = expired.len(), "sweeping expired nuts");
        for nut in &expired {
            guard.remove(nut);
        }
    }
}

#[async_trait]
impl Hoard for MemoryHoard {
    async fn get(&self, nut: &Nut) -> Result<Option<HoardEntry>> {
        let mut guard = self.inner.lock();
        match guard.get(nut) {
            Some(stored) if !stored.expired() => Ok(Some(stored.entry.clone())),
            Some(_) => {
                guard.remove(nut);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn get_and_delete(&self, nut: &Nut) -> Result<Option<HoardEntry>> {
        let mut guard = self.inner.lock();
        match guard.remove(nut) {
            Some(stored) if !stored.expired() => Ok(Some(stored.entry)),
            _ => Ok(None),
        }
    }

    async fn save(&self, nut: &Nut, entry: HoardEntry, ttl: Duration) -> Result<()> {
        if nut.is_empty() {
            return Err(SspError::EmptyNut);
        }
        let stored = Stored {
            entry,
            expires_at: Instant::now() + ttl,
        };
        self.inner.lock().insert(nut.clone(), stored);
        Ok(())
    }
}
