//! In-memory agent registry: name to address, last write wins.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Registration {
    pub address: String,
    pub registered_at: DateTime<Utc>,
    seen: Instant,
}

/// Result of looking an agent up for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Live(String),
    /// Registered, but no heartbeat within the staleness window.
    Stale { address: String, age: Duration },
    Unknown,
}

/// Serializable view of one registration.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AgentInfo {
    pub name: String,
    pub address: String,
    pub registered_at: DateTime<Utc>,
    pub last_seen_secs: u64,
    pub stale: bool,
}

#[derive(Debug)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Registration>,
    stale_after: Duration,
}

impl AgentRegistry {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            agents: BTreeMap::new(),
            stale_after,
        }
    }

    /// Record `address` for `name`, replacing any earlier registration.
    pub fn register(&mut self, name: &str, address: &str) -> Option<String> {
        self.register_at(name, address, Instant::now())
    }

    pub(crate) fn register_at(&mut self, name: &str, address: &str, now: Instant) -> Option<String> {
        let previous = self.agents.insert(
            name.to_string(),
            Registration {
                address: address.to_string(),
                registered_at: Utc::now(),
                seen: now,
            },
        );
        previous.map(|r| r.address)
    }

    pub fn lookup(&self, name: &str) -> Lookup {
        self.lookup_at(name, Instant::now())
    }

    pub(crate) fn lookup_at(&self, name: &str, now: Instant) -> Lookup {
        match self.agents.get(name) {
            None => Lookup::Unknown,
            Some(reg) => {
                let age = now.saturating_duration_since(reg.seen);
                if age > self.stale_after {
                    Lookup::Stale {
                        address: reg.address.clone(),
                        age,
                    }
                } else {
                    Lookup::Live(reg.address.clone())
                }
            }
        }
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.agents.keys().map(String::as_str).collect()
    }

    /// Sorted, comma-separated names for chat replies; `none` when empty.
    pub fn known_names(&self) -> String {
        if self.agents.is_empty() {
            "none".to_string()
        } else {
            self.names().join(", ")
        }
    }

    pub fn snapshot(&self) -> Vec<AgentInfo> {
        self.snapshot_at(Instant::now())
    }

    fn snapshot_at(&self, now: Instant) -> Vec<AgentInfo> {
        self.agents
            .iter()
            .map(|(name, reg)| {
                let age = now.saturating_duration_since(reg.seen);
                AgentInfo {
                    name: name.clone(),
                    address: reg.address.clone(),
                    registered_at: reg.registered_at,
                    last_seen_secs: age.as_secs(),
                    stale: age > self.stale_after,
                }
            })
            .collect()
    }
}
