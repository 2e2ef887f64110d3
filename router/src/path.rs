//! # Paths
//!
//! Path building lives outside the router. What the router owns is the
//! decision of which hops may be used and how often: [`PathBuildLimiter`]
//! refuses a second build through the same hop inside
//! [`PATH_BUILD_RATE_LIMIT`], and the consensus gate refuses hops that are
//! not whitelisted.

use serde_json::Value;

use crate::config::{ms, PATH_BUILD_RATE_LIMIT};
use crate::crypto::RouterId;
use crate::time::Millis;
use crate::util::DecayingHashSet;

pub trait PathContext: Send {
    /// Start accepting transit paths (service nodes).
    fn allow_transit(&mut self);

    fn pump_upstream(&mut self);

    fn pump_downstream(&mut self);

    fn tick(&mut self, now: Millis);

    fn expire_paths(&mut self, now: Millis);

    fn transit_path_count(&self) -> usize;

    fn owned_path_count(&self) -> usize;

    /// `(successes, attempts)` of our own path builds.
    fn build_stats(&self) -> (u64, u64);

    fn extract_status(&self) -> Value;
}

/// Rate limit on path builds through a given first hop.
#[derive(Debug, Clone)]
pub struct PathBuildLimiter {
    recent: DecayingHashSet<RouterId>,
}

impl Default for PathBuildLimiter {
    fn default() -> Self {
        Self::new(ms(PATH_BUILD_RATE_LIMIT))
    }
}

impl PathBuildLimiter {
    pub fn new(window: Millis) -> Self {
        Self {
            recent: DecayingHashSet::new(window),
        }
    }

    /// Records a build through `hop`. `false` means one happened too
    /// recently and this one should wait.
    pub fn attempt(&mut self, hop: RouterId, now: Millis) -> bool {
        self.recent.insert(hop, now)
    }

    pub fn decay(&mut self, now: Millis) {
        self.recent.decay(now);
    }

    pub fn limited_count(&self) -> usize {
        self.recent.len()
    }
}
