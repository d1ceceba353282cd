#[cfg(test)]
#[path = "tests/discovery.rs"]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::types::ProtocolError;

pub(crate) mod cache;

pub use cache::DiscoveredPeer;
use cache::PeerCache;

/// How long a sighted peer stays cached without being seen again.
pub const DEFAULT_GC_WINDOW: Duration = Duration::from_secs(5);

/// Invoked by the discovery substrate for every sighting of a peer that
/// advertises the service tag.
pub type SightingCallback = Arc<dyn Fn(DiscoveredPeer) + Send + Sync>;

/// The local-network substrate that notices peers. Implementations invoke
/// the callback from their own task whenever a peer advertising `service`
/// is seen.
pub trait DiscoverySubstrate: Send + Sync {
    fn start(&self, service: &str, on_peer_found: SightingCallback) -> Result<(), ProtocolError>;

    fn stop(&self) -> Result<(), ProtocolError>;
}

/// Tracks recently seen peers. Each sighting (re)arms a per-peer expiry
/// timer; a peer that is not re-sighted within the GC window is dropped.
pub struct Discovery {
    cache: Arc<PeerCache>,
    substrate: Arc<dyn DiscoverySubstrate>,
    started: Mutex<bool>,
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("cache", &self.cache)
            .field("started", &*self.started.lock())
            .finish_non_exhaustive()
    }
}

impl Discovery {
    #[must_use]
    pub fn new(substrate: Arc<dyn DiscoverySubstrate>) -> Self {
        Self::with_gc_window(substrate, DEFAULT_GC_WINDOW)
    }

    #[must_use]
    pub fn with_gc_window(substrate: Arc<dyn DiscoverySubstrate>, gc_window: Duration) -> Self {
        Self {
            cache: PeerCache::new(gc_window),
            substrate,
            started: Mutex::new(false),
        }
    }

    /// Starts listening for sightings. A no-op if already started.
    pub fn start(&self) -> Result<(), ProtocolError> {
        let mut started = self.started.lock();
        if *started {
            return Ok(());
        }

        let cache = Arc::clone(&self.cache);
        self.substrate
            .start(crate::SERVICE_TAG, Arc::new(move |peer| cache.on_peer_found(peer)))?;

        *started = true;
        Ok(())
    }

    /// Stops listening, cancels every pending expiry timer, and clears
    /// the cache. A no-op if not started.
    pub fn stop(&self) -> Result<(), ProtocolError> {
        let mut started = self.started.lock();
        if !*started {
            return Ok(());
        }

        self.substrate.stop()?;
        self.cache.clear();

        *started = false;
        Ok(())
    }

    /// All currently cached peers, ascending by peer id regardless of the
    /// order they were sighted in.
    #[must_use]
    pub fn peers(&self) -> Vec<DiscoveredPeer> {
        self.cache.list()
    }
}
