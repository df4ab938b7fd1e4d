//! Per-host recently used plugins.

use parking_lot::Mutex;
use remotefx_protocol::{descriptions_to_lines, PluginDescription};
use std::collections::{HashMap, VecDeque};

pub const DEFAULT_NUM_RECENTS: usize = 10;

/// Process-wide recents, keyed by remote host.
///
/// Most recently used first, deduplicated by identifier, capped at
/// `capacity` entries per host. Constructed once and shared by all sessions.
pub struct RecentsRegistry {
    capacity: usize,
    hosts: Mutex<HashMap<String, VecDeque<PluginDescription>>>,
}

impl RecentsRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn add(&self, host: &str, plugin: PluginDescription) {
        let mut hosts = self.hosts.lock();
        let list = hosts.entry(host.to_string()).or_default();
        list.retain(|p| p.identifier != plugin.identifier);
        list.push_front(plugin);
        list.truncate(self.capacity);
    }

    pub fn list(&self, host: &str) -> Vec<PluginDescription> {
        self.hosts
            .lock()
            .get(host)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The host's recents in description-line format.
    pub fn lines(&self, host: &str) -> String {
        descriptions_to_lines(&self.list(host))
    }
}

impl Default for RecentsRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_NUM_RECENTS)
    }
}
