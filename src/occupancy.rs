use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::info;

use crate::mac::MacAddress;
use crate::metrics::ACTIVE_SESSIONS;

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// One viewer consuming an upstream link through a MAC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OccupancyEntry {
    pub id: u64,
    pub portal_id: String,
    pub portal_name: String,
    pub mac: MacAddress,
    pub channel_id: String,
    pub channel_name: String,
    pub client_ip: String,
    pub started_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Per-viewer details recorded when a reserved slot is committed.
#[derive(Debug, Clone, Default)]
pub struct ViewerInfo {
    pub portal_name: String,
    pub channel_name: String,
    pub client_ip: String,
    pub user: Option<String>,
}

#[derive(Default)]
struct Inner {
    entries: Vec<OccupancyEntry>,
    pending: HashMap<(String, MacAddress), usize>,
    next_id: u64,
}

impl Inner {
    fn in_use(&self, portal_id: &str, mac: &MacAddress) -> usize {
        let active = self
            .entries
            .iter()
            .filter(|e| e.portal_id == portal_id && &e.mac == mac)
            .count();
        let pending = self
            .pending
            .get(&(portal_id.to_string(), mac.clone()))
            .copied()
            .unwrap_or(0);
        active + pending
    }

    fn release_pending(&mut self, portal_id: &str, mac: &MacAddress) {
        let key = (portal_id.to_string(), mac.clone());
        if let Some(n) = self.pending.get_mut(&key) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.pending.remove(&key);
            }
        }
    }

    fn publish(&self, portal_id: &str) {
        let n = self.entries.iter().filter(|e| e.portal_id == portal_id).count();
        ACTIVE_SESSIONS.with_label_values(&[portal_id]).set(n as f64);
    }
}

/// Registry of active (portal, MAC, channel, viewer) tuples.
///
/// Slots are taken in two steps: [`try_reserve`](Self::try_reserve) while a MAC
/// is being tried, then [`SlotReservation::commit`] once the stream process is
/// running. Reservations count against the per-MAC limit, so two concurrent
/// requests can never both pass the check for the last free slot.
#[derive(Clone, Default)]
pub struct OccupancyTracker {
    inner: Arc<Mutex<Inner>>,
}

impl OccupancyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the maps half-updated.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Active entries plus outstanding reservations for one MAC.
    pub fn in_use(&self, portal_id: &str, mac: &MacAddress) -> usize {
        self.lock().in_use(portal_id, mac)
    }

    pub fn is_free(&self, portal_id: &str, mac: &MacAddress, limit: usize) -> bool {
        limit == 0 || self.in_use(portal_id, mac) < limit
    }

    pub fn try_reserve(
        &self,
        portal_id: &str,
        mac: &MacAddress,
        limit: usize,
    ) -> Option<SlotReservation> {
        let mut inner = self.lock();
        if limit != 0 && inner.in_use(portal_id, mac) >= limit {
            return None;
        }
        *inner
            .pending
            .entry((portal_id.to_string(), mac.clone()))
            .or_default() += 1;
        Some(SlotReservation {
            tracker: self.clone(),
            portal_id: portal_id.to_string(),
            mac: mac.clone(),
            channel_id: None,
            armed: true,
        })
    }

    pub fn snapshot(&self) -> BTreeMap<String, Vec<OccupancyEntry>> {
        let inner = self.lock();
        let mut out: BTreeMap<String, Vec<OccupancyEntry>> = BTreeMap::new();
        for entry in &inner.entries {
            out.entry(entry.portal_id.clone()).or_default().push(entry.clone());
        }
        out
    }

    pub fn active_count(&self) -> usize {
        self.lock().entries.len()
    }

    fn remove(&self, id: u64) -> bool {
        let mut inner = self.lock();
        let Some(pos) = inner.entries.iter().position(|e| e.id == id) else {
            return false;
        };
        let entry = inner.entries.remove(pos);
        inner.publish(&entry.portal_id);
        info!(
            "Unoccupied: portal={} mac={} channel={} client={}",
            entry.portal_id, entry.mac, entry.channel_id, entry.client_ip
        );
        true
    }
}

/// A held slot that has not been turned into an occupancy entry yet.
/// Dropping it gives the slot back.
pub struct SlotReservation {
    tracker: OccupancyTracker,
    portal_id: String,
    mac: MacAddress,
    channel_id: Option<String>,
    armed: bool,
}

impl SlotReservation {
    pub fn mac(&self) -> &MacAddress {
        &self.mac
    }

    pub fn portal_id(&self) -> &str {
        &self.portal_id
    }

    pub(crate) fn for_channel(mut self, channel_id: &str) -> Self {
        self.channel_id = Some(channel_id.to_string());
        self
    }

    /// Converts the reservation into a visible occupancy entry.
    pub fn commit(mut self, viewer: ViewerInfo) -> OccupancyGuard {
        self.armed = false;
        let mut inner = self.tracker.lock();
        inner.release_pending(&self.portal_id, &self.mac);
        inner.next_id += 1;
        let id = inner.next_id;
        inner.entries.push(OccupancyEntry {
            id,
            portal_id: self.portal_id.clone(),
            portal_name: viewer.portal_name,
            mac: self.mac.clone(),
            channel_id: self.channel_id.clone().unwrap_or_default(),
            channel_name: viewer.channel_name,
            client_ip: viewer.client_ip,
            started_at: now_epoch_secs(),
            user: viewer.user,
        });
        inner.publish(&self.portal_id);
        drop(inner);

        info!(
            "Occupied: portal={} mac={} channel={}",
            self.portal_id,
            self.mac,
            self.channel_id.as_deref().unwrap_or("")
        );
        OccupancyGuard {
            tracker: self.tracker.clone(),
            id,
            released: false,
        }
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if self.armed {
            self.tracker.lock().release_pending(&self.portal_id, &self.mac);
        }
    }
}

/// Keeps an occupancy entry alive; released exactly once, explicitly or on drop.
pub struct OccupancyGuard {
    tracker: OccupancyTracker,
    id: u64,
    released: bool,
}

impl OccupancyGuard {
    /// Returns `true` only for the call that actually removed the entry.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.tracker.remove(self.id)
    }
}

impl Drop for OccupancyGuard {
    fn drop(&mut self) {
        self.release();
    }
}
