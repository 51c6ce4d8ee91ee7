//! Process-wide channel registry.
//!
//! Maps 16-bit channel numbers to live channels under one short mutex.
//! Publication keeps a strong reference; `take`/`sweep` unpublish a channel
//! without destroying it; outstanding lookups keep it alive until the last
//! reference drops.

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::types::{ChanId, OwnerToken};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub(crate) struct ChannelRegistry {
    channels: Mutex<HashMap<ChanId, Arc<Channel>>>,
    /// First ID handed out when the caller requests automatic allocation.
    /// IDs below this are reserved for explicit requests.
    chan_start: ChanId,
}

impl ChannelRegistry {
    pub fn new(chan_start: ChanId) -> Self {
        ChannelRegistry {
            channels: Mutex::new(HashMap::new()),
            chan_start,
        }
    }

    /// Allocate an ID and publish the channel `make` builds for it.
    ///
    /// `requested != 0` reserves exactly that ID; `requested == 0` takes the
    /// lowest free ID at or above the dynamic start.
    ///
    /// # Errors
    /// `Busy` when the requested ID is taken or the dynamic range is
    /// exhausted.
    pub fn publish_new(
        &self,
        requested: ChanId,
        make: impl FnOnce(ChanId) -> Channel,
    ) -> Result<Arc<Channel>> {
        let mut map = self.channels.lock();
        let id = if requested != 0 {
            if map.contains_key(&requested) {
                return Err(Error::Busy);
            }
            requested
        } else {
            (self.chan_start..=ChanId::MAX)
                .find(|id| !map.contains_key(id))
                .ok_or(Error::Busy)?
        };
        let ch = Arc::new(make(id));
        map.insert(id, ch.clone());
        Ok(ch)
    }

    /// Strong reference to a published channel.
    pub fn get(&self, id: ChanId) -> Option<Arc<Channel>> {
        self.channels.lock().get(&id).cloned()
    }

    /// Unpublish a channel, returning it if it was present.
    pub fn take(&self, id: ChanId) -> Option<Arc<Channel>> {
        self.channels.lock().remove(&id)
    }

    /// Unpublish for a local close, verifying ownership in the same
    /// critical section. `Ok(None)` when the ID is not published (closing
    /// twice is not an error).
    ///
    /// # Errors
    /// `Invalid` when the channel belongs to a different owner.
    pub fn close_take(
        &self,
        id: ChanId,
        owner: Option<OwnerToken>,
    ) -> Result<Option<Arc<Channel>>> {
        let mut map = self.channels.lock();
        let Some(ch) = map.get(&id) else {
            return Ok(None);
        };
        if ch.lock().owner != owner {
            return Err(Error::Invalid);
        }
        Ok(map.remove(&id))
    }

    /// Unpublish every channel `pred` selects, in one critical section, and
    /// hand them back for closing. The predicate may transition channel
    /// state while it decides.
    pub fn sweep(&self, mut pred: impl FnMut(&Arc<Channel>) -> bool) -> Vec<Arc<Channel>> {
        let mut map = self.channels.lock();
        let ids: Vec<ChanId> = map
            .iter()
            .filter(|&(_, ch)| pred(ch))
            .map(|(id, _)| *id)
            .collect();
        let removed: Vec<Arc<Channel>> = ids.iter().filter_map(|id| map.remove(id)).collect();
        if !removed.is_empty() {
            debug!(count = removed.len(), "channels unpublished by sweep");
        }
        removed
    }

    /// Visit every published channel without unpublishing.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Channel>)) {
        for ch in self.channels.lock().values() {
            f(ch);
        }
    }
}
