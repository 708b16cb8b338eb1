use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::mac::{MacAddress, MacEntry};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("portal store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("portal store is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown portal: {0}")]
    UnknownPortal(String),
}

fn default_streams_per_mac() -> usize {
    1
}

fn default_enabled() -> bool {
    true
}

/// An upstream Stalker portal and its MAC pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portal {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub macs: Vec<MacEntry>,
    /// Concurrent streams allowed per MAC; 0 means unlimited.
    #[serde(default = "default_streams_per_mac")]
    pub streams_per_mac: usize,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Portal {
    /// Outbound proxy, treating an empty string as "no proxy".
    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref().map(str::trim).filter(|p| !p.is_empty())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    portals: Vec<Portal>,
}

/// Portal records plus the MAC rotation state, optionally backed by a JSON file.
///
/// Every mutation holds the store lock across the file write, so concurrent
/// rotations for the same portal are applied one after another and none is lost.
pub struct PortalStore {
    portals: Mutex<Vec<Portal>>,
    path: Option<PathBuf>,
}

impl PortalStore {
    pub fn in_memory(portals: Vec<Portal>) -> Self {
        Self {
            portals: Mutex::new(portals),
            path: None,
        }
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let doc = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<StoreDocument>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Portal store not found, starting empty: path={}", path.display());
                StoreDocument::default()
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            "Portal store loaded: path={} portals={}",
            path.display(),
            doc.portals.len()
        );
        Ok(Self {
            portals: Mutex::new(doc.portals),
            path: Some(path),
        })
    }

    pub async fn portals(&self) -> Vec<Portal> {
        self.portals.lock().await.clone()
    }

    pub async fn portal(&self, id: &str) -> Option<Portal> {
        self.portals.lock().await.iter().find(|p| p.id == id).cloned()
    }

    /// Snapshot of the MAC try-order for one play attempt.
    pub async fn candidates(&self, id: &str) -> Option<Vec<MacEntry>> {
        self.portals
            .lock()
            .await
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.macs.clone())
    }

    /// Moves `mac` to the end of the portal's pool and persists the new order.
    /// Returns `Ok(false)` when the MAC is no longer part of the pool.
    pub async fn rotate_to_back(&self, id: &str, mac: &MacAddress) -> Result<bool, StoreError> {
        let mut portals = self.portals.lock().await;
        let portal = portals
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| StoreError::UnknownPortal(id.to_string()))?;

        let Some(pos) = portal.macs.iter().position(|e| &e.mac == mac) else {
            return Ok(false);
        };
        let entry = portal.macs.remove(pos);
        portal.macs.push(entry);
        debug!(
            "MAC order updated: portal={} order={:?}",
            id,
            portal.macs.iter().map(|e| e.mac.as_str()).collect::<Vec<_>>()
        );

        self.persist(&portals).await?;
        Ok(true)
    }

    pub async fn set_expiry(
        &self,
        id: &str,
        mac: &MacAddress,
        expires: Option<String>,
    ) -> Result<(), StoreError> {
        let mut portals = self.portals.lock().await;
        let portal = portals
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| StoreError::UnknownPortal(id.to_string()))?;
        if let Some(entry) = portal.macs.iter_mut().find(|e| &e.mac == mac) {
            entry.expires = expires;
        }
        self.persist(&portals).await
    }

    /// Inserts or replaces a portal record by id.
    pub async fn upsert(&self, portal: Portal) -> Result<(), StoreError> {
        let mut portals = self.portals.lock().await;
        match portals.iter_mut().find(|p| p.id == portal.id) {
            Some(existing) => *existing = portal,
            None => portals.push(portal),
        }
        self.persist(&portals).await
    }

    async fn persist(&self, portals: &[Portal]) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let doc = StoreDocument {
            portals: portals.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&doc)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename keeps the previous document intact if we die mid-write.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}
