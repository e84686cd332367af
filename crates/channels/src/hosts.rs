//! Host selection strategies for the bridge client. A strategy owns its own
//! cursor, so two clients never share rotation state.

use std::sync::atomic::{AtomicUsize, Ordering};

pub trait HostSelector: Send + Sync {
    /// Pick the host for the next unqualified request.
    fn select<'a>(&self, hosts: &'a [String]) -> Option<&'a str>;
}

/// Cycles through the configured hosts in order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostSelector for RoundRobin {
    fn select<'a>(&self, hosts: &'a [String]) -> Option<&'a str> {
        if hosts.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % hosts.len();
        Some(hosts[idx].as_str())
    }
}

/// Always the first configured host.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrimaryFirst;

impl HostSelector for PrimaryFirst {
    fn select<'a>(&self, hosts: &'a [String]) -> Option<&'a str> {
        hosts.first().map(String::as_str)
    }
}
