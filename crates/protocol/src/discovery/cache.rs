use std::collections::btree_map::{BTreeMap, Entry};
use std::sync::Arc;
use std::time::Duration;

use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

/// A peer sighted on the local network. Listings hand out copies; the
/// cache alone owns the live records.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiscoveredPeer {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

#[derive(Debug)]
struct CacheEntry {
    peer: DiscoveredPeer,
    /// Bumped on every re-sighting. An expiry task only evicts the entry
    /// if the generation it was armed for is still current, so a reset
    /// racing a firing timer always resolves in favour of the reset.
    generation: u64,
    expiry: JoinHandle<()>,
}

/// Concurrency-safe map of sighted peers with per-entry expiry tasks.
/// Mutated by the sighting callback and by firing timers, read by
/// listings; all under one lock, never holding it across an await.
#[derive(Debug)]
pub(crate) struct PeerCache {
    entries: Mutex<BTreeMap<PeerId, CacheEntry>>,
    gc_window: Duration,
}

impl PeerCache {
    pub(crate) fn new(gc_window: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(BTreeMap::new()),
            gc_window,
        })
    }

    pub(crate) fn on_peer_found(self: &Arc<Self>, peer: DiscoveredPeer) {
        let mut entries = self.entries.lock();

        match entries.entry(peer.peer_id) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.generation = entry.generation.wrapping_add(1);
                entry.expiry.abort();
                entry.expiry = self.arm_expiry(peer.peer_id, entry.generation);
                entry.peer = peer;
            }
            Entry::Vacant(vacant) => {
                debug!(peer_id = %peer.peer_id, "caching newly discovered peer");

                let expiry = self.arm_expiry(peer.peer_id, 0);
                let _ = vacant.insert(CacheEntry {
                    peer,
                    generation: 0,
                    expiry,
                });
            }
        }
    }

    fn arm_expiry(self: &Arc<Self>, peer_id: PeerId, generation: u64) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        let window = self.gc_window;

        tokio::spawn(async move {
            sleep(window).await;

            let Some(cache) = cache.upgrade() else {
                return;
            };
            cache.evict(peer_id, generation);
        })
    }

    fn evict(&self, peer_id: PeerId, generation: u64) {
        let mut entries = self.entries.lock();

        if let Entry::Occupied(occupied) = entries.entry(peer_id) {
            if occupied.get().generation == generation {
                debug!(%peer_id, "evicting peer not seen within the GC window");
                drop(occupied.remove());
            }
        }
    }

    /// Copies of all current entries, ascending by peer id.
    pub(crate) fn list(&self) -> Vec<DiscoveredPeer> {
        self.entries
            .lock()
            .values()
            .map(|entry| entry.peer.clone())
            .collect()
    }

    /// Cancels every pending expiry task and drops all entries.
    pub(crate) fn clear(&self) {
        let mut entries = self.entries.lock();

        for entry in entries.values() {
            entry.expiry.abort();
        }
        entries.clear();
    }
}
