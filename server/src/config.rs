//! Relay configuration.
//!
//! The core consumes a plain [`RelayConfig`]; where it comes from (file,
//! flags, embedding process) is the caller's business. The few settings the
//! network tasks read directly live in [`Gate`] so the operator can change
//! them at runtime without restarting the transport.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use roomlink_protocol::GameType;
use serde::{Deserialize, Serialize};

/// Everything the relay core consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Port for both TCP and UDP.
    pub port: u16,
    /// Packets allowed per connection per 3-second window; 0 disables.
    pub spam_limit: u32,
    /// Join attempts allowed per address per minute; 0 disables.
    pub join_limit: u32,
    /// How long a state request to a host may stay unanswered.
    pub state_timeout_ms: u64,
    /// How long a received state stays fresh.
    pub state_lifetime_ms: u64,
    /// How long a list refresh may wait for missing states.
    pub list_timeout_ms: u64,
    /// How long a built list stays fresh.
    pub list_lifetime_ms: u64,
    /// Grace period between the closing notice and the actual shutdown.
    pub close_wait_secs: u64,
    /// Whether to notify rooms before shutting down.
    pub warn_closing: bool,
    /// Whether clients without a game type may join typed rooms.
    pub accept_no_type: bool,
    /// Game types that may not host rooms here.
    pub blacklisted_types: HashSet<GameType>,
    /// Addresses that may not connect at all.
    pub blacklist: HashSet<IpAddr>,
    /// Whether pre-protocol clients get an upgrade notice before the kick.
    pub warn_deprecated: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 4600,
            spam_limit: 300,
            join_limit: 24,
            state_timeout_ms: 5_000,
            state_lifetime_ms: 30_000,
            list_timeout_ms: 8_000,
            list_lifetime_ms: 10_000,
            close_wait_secs: 10,
            warn_closing: true,
            accept_no_type: false,
            blacklisted_types: HashSet::new(),
            blacklist: HashSet::new(),
            warn_deprecated: true,
        }
    }
}

impl RelayConfig {
    pub fn state_timeout(&self) -> Duration {
        Duration::from_millis(self.state_timeout_ms)
    }

    pub fn state_lifetime(&self) -> Duration {
        Duration::from_millis(self.state_lifetime_ms)
    }

    pub fn list_timeout(&self) -> Duration {
        Duration::from_millis(self.list_timeout_ms)
    }

    pub fn list_lifetime(&self) -> Duration {
        Duration::from_millis(self.list_lifetime_ms)
    }

    pub fn close_wait(&self) -> Duration {
        Duration::from_secs(self.close_wait_secs)
    }
}

/// Settings the network tasks consult on their own thread.
///
/// The dispatcher is the only writer; the accept loop and the per-connection
/// readers only read, so plain atomics and an `RwLock` around the blacklist
/// are enough.
#[derive(Debug)]
pub struct Gate {
    closed: AtomicBool,
    spam_limit: AtomicU32,
    blacklist: RwLock<HashSet<IpAddr>>,
}

impl Gate {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            closed: AtomicBool::new(false),
            spam_limit: AtomicU32::new(config.spam_limit),
            blacklist: RwLock::new(config.blacklist.clone()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub fn spam_limit(&self) -> u32 {
        self.spam_limit.load(Ordering::Relaxed)
    }

    pub fn set_spam_limit(&self, limit: u32) {
        self.spam_limit.store(limit, Ordering::Relaxed);
    }

    pub fn is_blacklisted(&self, addr: &IpAddr) -> bool {
        self.blacklist
            .read()
            .map(|set| set.contains(addr))
            .unwrap_or(false)
    }

    pub fn blacklist_add(&self, addr: IpAddr) -> bool {
        self.blacklist
            .write()
            .map(|mut set| set.insert(addr))
            .unwrap_or(false)
    }

    pub fn blacklist_remove(&self, addr: &IpAddr) -> bool {
        self.blacklist
            .write()
            .map(|mut set| set.remove(addr))
            .unwrap_or(false)
    }

    pub fn blacklist_snapshot(&self) -> Vec<IpAddr> {
        self.blacklist
            .read()
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}
