//! Scripted portal used by unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::mac::{MacAddress, MacEntry};
use crate::portal::{PortalChannel, PortalClient, PortalError};
use crate::store::Portal;

#[derive(Debug, Clone, Default)]
pub struct MacScript {
    pub token: bool,
    pub channels: Vec<PortalChannel>,
    /// Answer to `create_link`.
    pub created_link: Option<String>,
    pub probe_ok: bool,
    pub expires: Option<String>,
}

impl MacScript {
    pub fn working(channel_id: &str, cmd: &str) -> Self {
        Self {
            token: true,
            channels: vec![channel(channel_id, cmd)],
            created_link: None,
            probe_ok: true,
            expires: Some("January 1, 2030, 12:00 am".into()),
        }
    }

    pub fn no_token() -> Self {
        Self::default()
    }
}

pub fn channel(id: &str, cmd: &str) -> PortalChannel {
    PortalChannel {
        id: id.to_string(),
        name: format!("Channel {id}"),
        number: Some(id.to_string()),
        cmd: cmd.to_string(),
        tv_genre_id: None,
        logo: None,
    }
}

pub fn portal(id: &str, macs: &[&str], streams_per_mac: usize) -> Portal {
    Portal {
        id: id.to_string(),
        name: format!("Portal {id}"),
        url: "http://portal.test/stalker_portal/server/load.php".to_string(),
        proxy: None,
        macs: macs
            .iter()
            .map(|m| MacEntry::new(m.parse().unwrap()))
            .collect(),
        streams_per_mac,
        enabled: true,
    }
}

#[derive(Default)]
pub struct FakePortal {
    scripts: HashMap<String, MacScript>,
    pub calls: Mutex<Vec<String>>,
}

impl FakePortal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, mac: &str, script: MacScript) -> Self {
        let mac: MacAddress = mac.parse().unwrap();
        self.scripts.insert(mac.to_string(), script);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, op: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(op)).count()
    }

    fn record(&self, op: &str, mac: &MacAddress) {
        self.calls.lock().unwrap().push(format!("{op} {mac}"));
    }

    fn script(&self, mac: &MacAddress) -> MacScript {
        self.scripts.get(mac.as_str()).cloned().unwrap_or_default()
    }

    fn token_for(mac: &MacAddress) -> String {
        format!("token-{mac}")
    }

    fn check_token(&self, mac: &MacAddress, token: &str) -> Result<(), PortalError> {
        if token == Self::token_for(mac) {
            Ok(())
        } else {
            Err(PortalError::NoToken)
        }
    }
}

fn fail(call: &'static str) -> PortalError {
    PortalError::Unexpected {
        call,
        reason: "scripted failure".into(),
    }
}

#[async_trait]
impl PortalClient for FakePortal {
    async fn handshake(
        &self,
        _url: &str,
        mac: &MacAddress,
        _proxy: Option<&str>,
    ) -> Result<String, PortalError> {
        self.record("handshake", mac);
        if self.script(mac).token {
            Ok(Self::token_for(mac))
        } else {
            Err(PortalError::NoToken)
        }
    }

    async fn get_profile(
        &self,
        _url: &str,
        mac: &MacAddress,
        token: &str,
        _proxy: Option<&str>,
    ) -> Result<Value, PortalError> {
        self.record("profile", mac);
        self.check_token(mac, token)?;
        Ok(serde_json::json!({ "id": 1 }))
    }

    async fn list_channels(
        &self,
        _url: &str,
        mac: &MacAddress,
        token: &str,
        _proxy: Option<&str>,
    ) -> Result<Vec<PortalChannel>, PortalError> {
        self.record("channels", mac);
        self.check_token(mac, token)?;
        let channels = self.script(mac).channels;
        if channels.is_empty() {
            Err(fail("get_all_channels"))
        } else {
            Ok(channels)
        }
    }

    async fn resolve_link(
        &self,
        _url: &str,
        mac: &MacAddress,
        token: &str,
        _cmd: &str,
        _proxy: Option<&str>,
    ) -> Result<String, PortalError> {
        self.record("link", mac);
        self.check_token(mac, token)?;
        self.script(mac).created_link.ok_or_else(|| fail("create_link"))
    }

    async fn get_expires(
        &self,
        _url: &str,
        mac: &MacAddress,
        token: &str,
        _proxy: Option<&str>,
    ) -> Result<String, PortalError> {
        self.record("expires", mac);
        self.check_token(mac, token)?;
        self.script(mac).expires.ok_or_else(|| fail("get_main_info"))
    }

    async fn probe(
        &self,
        link: &str,
        _proxy: Option<&str>,
        _timeout: Duration,
    ) -> Result<(), PortalError> {
        self.calls.lock().unwrap().push(format!("probe {link}"));
        let ok = self
            .scripts
            .values()
            .any(|s| s.probe_ok && s.channels.iter().any(|c| c.cmd.contains(link)));
        let created = self
            .scripts
            .values()
            .any(|s| s.probe_ok && s.created_link.as_deref() == Some(link));
        if ok || created {
            Ok(())
        } else {
            Err(PortalError::Probe("scripted probe failure".into()))
        }
    }
}
