use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;

use crate::relay::messages::StateEntry;

/// One joined peer of the presence session, keyed in the registry by its
///  remote endpoint. Everything here is owned by the relay's main loop.
pub struct Client {
    /// server-assigned, unique for the lifetime of the process
    pub network_id: i16,
    /// opaque identifier vouched for by the identity service
    pub user_id: String,

    /// network ids whose voice this client wants to receive. Voice is only
    ///  relayed when both endpoints list each other.
    pub can_hear: FxHashSet<i16>,

    /// per-peer update rate negotiation, replaced wholesale by every
    ///  client-state frame
    pub update_rates: FxHashMap<i16, UpdateRate>,

    /// last position payload as received, still carrying the sender-supplied
    ///  id prefix
    pub last_position: Option<Bytes>,
    pub last_skeletal: Option<Bytes>,
}

/// How often this client wants to hear about one particular peer, and when the
///  server last told it.
pub struct UpdateRate {
    pub per_second: u8,
    /// `None` until the first telemetry frame for this pairing goes out
    pub last_sent: Option<Instant>,
}

impl Client {
    pub fn new(network_id: i16, user_id: String) -> Client {
        Client {
            network_id,
            user_id,
            can_hear: Default::default(),
            update_rates: Default::default(),
            last_position: None,
            last_skeletal: None,
        }
    }

    /// Replaces the audibility set and the rate table with the content of a
    ///  client-state frame. Previous pacing stamps do not survive.
    pub fn apply_state(&mut self, entries: Vec<StateEntry>) {
        self.can_hear.clear();
        self.update_rates.clear();
        for entry in entries {
            if entry.audible {
                self.can_hear.insert(entry.peer_id);
            }
            self.update_rates
                .insert(entry.peer_id, UpdateRate { per_second: entry.rate, last_sent: None });
        }
    }
}
