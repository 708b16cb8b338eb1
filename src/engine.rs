use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::mac::MacAddress;
use crate::metrics::{EXHAUSTED, MAC_ROTATIONS};
use crate::occupancy::{OccupancyTracker, SlotReservation};
use crate::portal::{PortalChannel, PortalClient, PortalError};
use crate::store::{Portal, PortalStore};

/// Marker for channel commands that must go through `create_link`.
const LOOPBACK_MARKER: &str = "http://localhost/";

#[derive(Debug, Clone)]
pub struct EnginePolicy {
    /// Keep going through the pool after the first attempted MAC fails.
    pub try_all_macs: bool,
    /// Probe each resolved link before handing it out.
    pub test_streams: bool,
    pub probe_timeout: Duration,
}

impl Default for EnginePolicy {
    fn default() -> Self {
        Self {
            try_all_macs: true,
            test_streams: true,
            probe_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionReason {
    /// Every MAC was at its stream limit; nothing was tried.
    NoFreeMac,
    /// At least one MAC was tried and none produced a link.
    AllFailed,
}

impl ExhaustionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExhaustionReason::NoFreeMac => "no_free_mac",
            ExhaustionReason::AllFailed => "all_failed",
        }
    }
}

impl fmt::Display for ExhaustionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error("portal not found: {0}")]
    PortalNotFound(String),
    #[error("portal disabled: {0}")]
    PortalDisabled(String),
    #[error("no streams available ({0})")]
    Exhausted(ExhaustionReason),
}

/// Where a single MAC attempt fell over.
#[derive(Debug, thiserror::Error)]
enum AttemptFailure {
    #[error("handshake: {0}")]
    Authenticate(PortalError),
    #[error("channel list: {0}")]
    ChannelList(PortalError),
    #[error("channel not in list")]
    ChannelMissing,
    #[error("link: {0}")]
    ResolveLink(PortalError),
    #[error("unusable cmd {0:?}")]
    BadCommand(String),
    #[error("probe: {0}")]
    Probe(PortalError),
}

/// A resolved upstream link plus the MAC slot that serves it.
pub struct ReadySession {
    pub portal: Portal,
    pub channel: PortalChannel,
    pub link: String,
    pub reservation: SlotReservation,
}

impl ReadySession {
    pub fn mac(&self) -> &MacAddress {
        self.reservation.mac()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MacTestResult {
    pub mac: MacAddress,
    pub valid: bool,
    pub expiry: Option<String>,
}

/// Picks a working MAC for a channel, rotating failed ones to the back.
pub struct SessionEngine {
    store: Arc<PortalStore>,
    occupancy: OccupancyTracker,
    client: Arc<dyn PortalClient>,
    policy: EnginePolicy,
}

impl SessionEngine {
    pub fn new(
        store: Arc<PortalStore>,
        occupancy: OccupancyTracker,
        client: Arc<dyn PortalClient>,
        policy: EnginePolicy,
    ) -> Self {
        Self {
            store,
            occupancy,
            client,
            policy,
        }
    }

    pub fn store(&self) -> &Arc<PortalStore> {
        &self.store
    }

    pub fn occupancy(&self) -> &OccupancyTracker {
        &self.occupancy
    }

    pub async fn acquire(&self, portal_id: &str, channel_id: &str) -> Result<ReadySession, AcquireError> {
        let portal = self
            .store
            .portal(portal_id)
            .await
            .ok_or_else(|| AcquireError::PortalNotFound(portal_id.to_string()))?;
        if !portal.enabled {
            return Err(AcquireError::PortalDisabled(portal_id.to_string()));
        }

        let candidates = portal.macs.clone();
        let mut attempted = false;
        for entry in &candidates {
            let Some(reservation) =
                self.occupancy
                    .try_reserve(&portal.id, &entry.mac, portal.streams_per_mac)
            else {
                debug!(
                    "MAC at stream limit, skipping: portal={} mac={} limit={}",
                    portal.id, entry.mac, portal.streams_per_mac
                );
                continue;
            };
            attempted = true;

            info!(
                "Trying portal={} mac={} channel={}",
                portal.id, entry.mac, channel_id
            );
            match self.attempt(&portal, &entry.mac, channel_id).await {
                Ok((channel, link)) => {
                    info!(
                        "Link ready: portal={} mac={} channel={} link={}",
                        portal.id, entry.mac, channel_id, link
                    );
                    return Ok(ReadySession {
                        reservation: reservation.for_channel(channel_id),
                        portal,
                        channel,
                        link,
                    });
                }
                Err(failure) => {
                    drop(reservation);
                    info!(
                        "Unable to connect: portal={} mac={} channel={} failed_at={}",
                        portal.id, entry.mac, channel_id, failure
                    );
                    self.rotate(&portal.id, &entry.mac).await;
                }
            }

            if !self.policy.try_all_macs {
                break;
            }
        }

        let reason = if attempted {
            ExhaustionReason::AllFailed
        } else {
            ExhaustionReason::NoFreeMac
        };
        match reason {
            ExhaustionReason::AllFailed => info!(
                "No working streams found: portal={} channel={}",
                portal.id, channel_id
            ),
            ExhaustionReason::NoFreeMac => info!(
                "No free MAC: portal={} channel={}",
                portal.id, channel_id
            ),
        }
        EXHAUSTED
            .with_label_values(&[portal.id.as_str(), reason.as_str()])
            .inc();
        Err(AcquireError::Exhausted(reason))
    }

    /// Authenticate, find the channel, resolve and optionally probe its link.
    async fn attempt(
        &self,
        portal: &Portal,
        mac: &MacAddress,
        channel_id: &str,
    ) -> Result<(PortalChannel, String), AttemptFailure> {
        let proxy = portal.proxy();
        let token = self
            .client
            .handshake(&portal.url, mac, proxy)
            .await
            .map_err(AttemptFailure::Authenticate)?;

        // Some portals refuse channel calls until the profile has been fetched.
        if let Err(e) = self.client.get_profile(&portal.url, mac, &token, proxy).await {
            debug!("Profile fetch failed (continuing): portal={} mac={} err={}", portal.id, mac, e);
        }

        let channels = self
            .client
            .list_channels(&portal.url, mac, &token, proxy)
            .await
            .map_err(AttemptFailure::ChannelList)?;
        let channel = channels
            .into_iter()
            .find(|c| c.id == channel_id)
            .ok_or(AttemptFailure::ChannelMissing)?;

        let link = if channel.cmd.contains(LOOPBACK_MARKER) {
            self.client
                .resolve_link(&portal.url, mac, &token, &channel.cmd, proxy)
                .await
                .map_err(AttemptFailure::ResolveLink)?
        } else {
            direct_link(&channel.cmd).ok_or_else(|| AttemptFailure::BadCommand(channel.cmd.clone()))?
        };

        if self.policy.test_streams {
            self.client
                .probe(&link, proxy, self.policy.probe_timeout)
                .await
                .map_err(AttemptFailure::Probe)?;
        }
        Ok((channel, link))
    }

    /// Moves a failing MAC to the back of its pool. Never fails the caller.
    pub async fn rotate(&self, portal_id: &str, mac: &MacAddress) {
        match self.store.rotate_to_back(portal_id, mac).await {
            Ok(true) => {
                MAC_ROTATIONS.with_label_values(&[portal_id]).inc();
                info!("MAC rotated to back: portal={} mac={}", portal_id, mac);
            }
            Ok(false) => debug!("MAC no longer in pool, not rotated: portal={} mac={}", portal_id, mac),
            Err(e) => error!("MAC rotation failed: portal={} mac={} err={}", portal_id, mac, e),
        }
    }

    /// Handshakes every MAC of a portal and records the expiry each one reports.
    pub async fn test_macs(&self, portal_id: &str) -> Result<Vec<MacTestResult>, AcquireError> {
        let portal = self
            .store
            .portal(portal_id)
            .await
            .ok_or_else(|| AcquireError::PortalNotFound(portal_id.to_string()))?;
        let proxy = portal.proxy();

        let mut results = Vec::with_capacity(portal.macs.len());
        for entry in &portal.macs {
            let mac = &entry.mac;
            let expiry = match self.client.handshake(&portal.url, mac, proxy).await {
                Ok(token) => {
                    let _ = self.client.get_profile(&portal.url, mac, &token, proxy).await;
                    match self.client.get_expires(&portal.url, mac, &token, proxy).await {
                        Ok(expiry) => Some(expiry),
                        Err(e) => {
                            warn!("MAC got token but no expiry: portal={} mac={} err={}", portal.id, mac, e);
                            None
                        }
                    }
                }
                Err(e) => {
                    warn!("MAC failed handshake: portal={} mac={} err={}", portal.id, mac, e);
                    None
                }
            };

            if expiry.is_some() {
                if let Err(e) = self.store.set_expiry(&portal.id, mac, expiry.clone()).await {
                    error!("Failed to record expiry: portal={} mac={} err={}", portal.id, mac, e);
                }
            }
            results.push(MacTestResult {
                mac: mac.clone(),
                valid: expiry.is_some(),
                expiry,
            });
        }
        Ok(results)
    }
}

/// URL carried directly in a `cmd` such as `"ffmpeg http://host/stream"`.
fn direct_link(cmd: &str) -> Option<String> {
    let mut tokens = cmd.split_whitespace();
    let first = tokens.next()?;
    Some(tokens.next().unwrap_or(first).to_string())
}
