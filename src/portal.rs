use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, COOKIE, REFERER, USER_AGENT};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::mac::MacAddress;

const STB_USER_AGENT: &str = "Mozilla/5.0 (QtEmbedded; U; Linux; C) AppleWebKit/533.3 (KHTML, like Gecko) MAG200 stbapp ver: 2 rev: 250 Safari/533.3";
const STB_X_USER_AGENT: &str = "Model: MAG250; Link: WiFi";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);
const PROFILE_TIMEOUT: Duration = Duration::from_secs(10);
const CHANNELS_TIMEOUT: Duration = Duration::from_secs(30);
const LINK_TIMEOUT: Duration = Duration::from_secs(10);
const EXPIRY_TIMEOUT: Duration = Duration::from_secs(15);
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

const XPCOM_PATHS: &[&str] = &[
    "/c/xpcom.common.js",
    "/client/xpcom.common.js",
    "/c_/xpcom.common.js",
    "/stalker_portal/c/xpcom.common.js",
    "/stalker_portal/c_/xpcom.common.js",
    "/portal/c/xpcom.common.js",
    "/server/c/xpcom.common.js",
];

const HANDSHAKE_QUERY: &str = "type=stb&action=handshake&JsHttpRequest=1-xml";

const RETRY_STATUSES: [StatusCode; 4] = [
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];
const MAX_RETRIES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum PortalError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid portal url {0:?}")]
    InvalidUrl(String),
    #[error("unexpected response ({call}): {reason}")]
    Unexpected { call: &'static str, reason: String },
    #[error("no handshake endpoint returned a token")]
    NoToken,
    #[error("probe failed: {0}")]
    Probe(String),
}

impl PortalError {
    fn unexpected(call: &'static str, reason: impl Into<String>) -> Self {
        Self::Unexpected {
            call,
            reason: reason.into(),
        }
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    lenient_string(deserializer)?.ok_or_else(|| serde::de::Error::custom("channel id missing"))
}

/// One entry of a portal's `get_all_channels` listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortalChannel {
    #[serde(deserialize_with = "lenient_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub number: Option<String>,
    #[serde(default)]
    pub cmd: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub tv_genre_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub logo: Option<String>,
}

/// Calls made against an upstream portal. Every failure comes back as an
/// `Err`; callers decide whether that means "try the next MAC".
#[async_trait]
pub trait PortalClient: Send + Sync {
    async fn handshake(
        &self,
        url: &str,
        mac: &MacAddress,
        proxy: Option<&str>,
    ) -> Result<String, PortalError>;

    async fn get_profile(
        &self,
        url: &str,
        mac: &MacAddress,
        token: &str,
        proxy: Option<&str>,
    ) -> Result<Value, PortalError>;

    async fn list_channels(
        &self,
        url: &str,
        mac: &MacAddress,
        token: &str,
        proxy: Option<&str>,
    ) -> Result<Vec<PortalChannel>, PortalError>;

    async fn resolve_link(
        &self,
        url: &str,
        mac: &MacAddress,
        token: &str,
        cmd: &str,
        proxy: Option<&str>,
    ) -> Result<String, PortalError>;

    async fn get_expires(
        &self,
        url: &str,
        mac: &MacAddress,
        token: &str,
        proxy: Option<&str>,
    ) -> Result<String, PortalError>;

    async fn probe(
        &self,
        link: &str,
        proxy: Option<&str>,
        timeout: Duration,
    ) -> Result<(), PortalError>;
}

/// `reqwest`-backed client speaking the Stalker middleware protocol.
pub struct StalkerClient {
    clients: Mutex<HashMap<Option<String>, Client>>,
    ffprobe_path: String,
}

impl StalkerClient {
    pub fn new(ffprobe_path: impl Into<String>) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            ffprobe_path: ffprobe_path.into(),
        }
    }

    /// One pooled client per outbound proxy.
    fn client(&self, proxy: Option<&str>) -> Result<Client, PortalError> {
        let key = proxy.map(str::to_string);
        let mut clients = self.clients.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(c) = clients.get(&key) {
            return Ok(c.clone());
        }

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(STB_USER_AGENT));
        headers.insert("X-User-Agent", HeaderValue::from_static(STB_X_USER_AGENT));
        headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        let mut builder = Client::builder()
            .danger_accept_invalid_certs(true)
            .default_headers(headers);
        if let Some(p) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(p)?);
        }
        let client = builder.build()?;
        clients.insert(key, client.clone());
        Ok(client)
    }

    fn stb_headers(mac: &MacAddress, token: Option<&str>, referer: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let cookie = format!("mac={}; stb_lang=en; timezone=Europe/London", mac);
        if let Ok(v) = HeaderValue::from_str(&cookie) {
            headers.insert(COOKIE, v);
        }
        if let Some(token) = token {
            if let Ok(v) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(AUTHORIZATION, v);
            }
        }
        if let Some(referer) = referer.and_then(|r| HeaderValue::from_str(r).ok()) {
            headers.insert(REFERER, referer);
        }
        headers
    }

    /// GETs the endpoint and runs `extract` on the `js` member. When the GET
    /// fails at any stage, including `extract` rejecting the payload, the
    /// same call is retried as a form POST if the request allows it.
    async fn call_js<T>(
        &self,
        request: JsRequest<'_>,
        mac: &MacAddress,
        token: &str,
        proxy: Option<&str>,
        extract: impl Fn(Value) -> Result<T, PortalError>,
    ) -> Result<T, PortalError> {
        let client = self.client(proxy)?;
        let headers = Self::stb_headers(mac, Some(token), None);
        let call = request.call;

        let get = client
            .get(request.url)
            .query(request.params)
            .headers(headers.clone())
            .timeout(request.timeout);
        let err = match read_js(call, get).await.and_then(&extract) {
            Ok(value) => return Ok(value),
            Err(e) if request.post_fallback => e,
            Err(e) => return Err(e),
        };
        debug!("{} GET failed for mac={}: {}; retrying with POST", call, mac, err);

        let post = client
            .post(request.url)
            .form(request.params)
            .headers(headers)
            .timeout(request.timeout);
        read_js(call, post).await.and_then(&extract)
    }

    /// Finds the `load.php`/`portal.php` endpoint for a portal given only its
    /// landing URL, by reading the `xpcom.common.js` the STB firmware loads.
    pub async fn discover_endpoint(&self, url: &str, proxy: Option<&str>) -> Option<String> {
        let parsed = Url::parse(url).ok()?;
        let origin = parsed.origin().ascii_serialization();
        let path = parsed.path().trim_end_matches('/');

        let mut paths: Vec<String> = Vec::new();
        if !path.is_empty() {
            paths.push(format!("{path}/xpcom.common.js"));
            paths.push(format!("{path}xpcom.common.js"));
        }
        paths.extend(XPCOM_PATHS.iter().map(|p| p.to_string()));

        // Some portals reject proxied clients, so a second pass goes direct.
        let mut passes = vec![proxy];
        if proxy.is_some() {
            passes.push(None);
        }
        for pass_proxy in passes {
            let Ok(client) = self.client(pass_proxy) else {
                continue;
            };
            for p in &paths {
                let page_url = format!("{origin}{p}");
                debug!("Trying xpcom.common.js at {}", page_url);
                let resp = client
                    .get(&page_url)
                    .header(REFERER, format!("{origin}/"))
                    .timeout(DISCOVERY_TIMEOUT)
                    .send()
                    .await;
                let Ok(resp) = resp else { continue };
                if !resp.status().is_success() {
                    continue;
                }
                let Ok(body) = resp.text().await else { continue };
                if let Some(endpoint) = parse_xpcom(&page_url, &body) {
                    info!("Discovered portal endpoint: url={} endpoint={}", url, endpoint);
                    return Some(endpoint);
                }
            }
        }
        warn!("Could not discover portal endpoint for {}", url);
        None
    }
}

/// One `JsHttpRequest` style portal call.
struct JsRequest<'a> {
    call: &'static str,
    url: &'a str,
    params: &'a [(&'a str, &'a str)],
    timeout: Duration,
    post_fallback: bool,
}

/// Sends `request`, retrying gateway-style 5xx answers with exponential backoff.
async fn send_with_retry(request: RequestBuilder) -> Result<Response, PortalError> {
    let mut retries = 0;
    loop {
        let Some(attempt) = request.try_clone() else {
            return Ok(request.send().await?);
        };
        let resp = attempt.send().await?;
        let status = resp.status();
        if retries >= MAX_RETRIES || !RETRY_STATUSES.contains(&status) {
            return Ok(resp);
        }
        let delay = RETRY_BACKOFF * 2u32.pow(retries);
        retries += 1;
        debug!("Portal answered {}, retry {} in {:?}", status, retries, delay);
        tokio::time::sleep(delay).await;
    }
}

async fn read_js(call: &'static str, request: RequestBuilder) -> Result<Value, PortalError> {
    let resp = send_with_retry(request).await?.error_for_status()?;
    extract_js(call, resp.json::<Value>().await?)
}

fn extract_js(call: &'static str, body: Value) -> Result<Value, PortalError> {
    match body.get("js") {
        Some(Value::Null) | None => Err(PortalError::unexpected(call, "missing js payload")),
        Some(js) => Ok(js.clone()),
    }
}

/// Candidate handshake URLs in try-order.
pub fn handshake_urls(url: &str) -> Result<Vec<String>, PortalError> {
    let parsed = Url::parse(url).map_err(|_| PortalError::InvalidUrl(url.to_string()))?;
    let origin = parsed.origin().ascii_serialization();
    let path = parsed.path().trim_end_matches('/');

    let mut out = Vec::new();
    if !path.is_empty() {
        if path.ends_with(".php") {
            out.push(format!("{origin}{path}?{HANDSHAKE_QUERY}"));
        }
        out.push(format!("{origin}{path}/portal.php?{HANDSHAKE_QUERY}"));
        out.push(format!("{origin}{path}/server/load.php?{HANDSHAKE_QUERY}"));
        if !path.ends_with(".php") {
            out.push(format!("{origin}{path}?{HANDSHAKE_QUERY}"));
        }
    }
    for suffix in [
        "",
        "/portal.php",
        "/server/load.php",
        "/stalker_portal/server/load.php",
        "/c/portal.php",
    ] {
        let candidate = format!("{origin}{suffix}?{HANDSHAKE_QUERY}");
        if !out.contains(&candidate) {
            out.push(candidate);
        }
    }
    Ok(out)
}

/// Extracts the ajax loader URL from an `xpcom.common.js` body.
pub fn parse_xpcom(page_url: &str, js: &str) -> Option<String> {
    let java: String = js
        .chars()
        .filter(|c| !matches!(c, ' ' | '\'' | '"' | '+'))
        .collect();

    let pattern_re = Regex::new(r"varpattern.*/(\(http.*)/;").ok()?;
    let raw_pattern = pattern_re.captures(&java)?.get(1)?.as_str().replace("\\/", "/");
    let url_re = Regex::new(&raw_pattern).ok()?;
    let parts = url_re.captures(page_url)?;

    let index_of = |field: &str| -> Option<usize> {
        let re = Regex::new(&format!(r"this\.{field}.*(\d).*;")).ok()?;
        re.captures(&java)?.get(1)?.as_str().parse().ok()
    };
    let protocol = parts.get(index_of("portal_protocol")?)?.as_str();
    let ip = parts.get(index_of("portal_ip")?)?.as_str();
    let path = parts.get(index_of("portal_path")?)?.as_str();

    let loader_re = Regex::new(r"this\.ajax_loader=(.*\.php);").ok()?;
    let loader = loader_re.captures(&java)?.get(1)?.as_str();
    Some(
        loader
            .replace("this.portal_protocol", protocol)
            .replace("this.portal_ip", ip)
            .replace("this.portal_path", path),
    )
}

/// Channels from a `get_all_channels` payload; an empty or null list is an error.
fn parse_channels(js: Value) -> Result<Vec<PortalChannel>, PortalError> {
    let data = js
        .get("data")
        .filter(|d| !d.is_null())
        .cloned()
        .ok_or_else(|| PortalError::unexpected("get_all_channels", "missing data"))?;
    let channels: Vec<PortalChannel> = serde_json::from_value(data)
        .map_err(|e| PortalError::unexpected("get_all_channels", e.to_string()))?;
    if channels.is_empty() {
        return Err(PortalError::unexpected("get_all_channels", "empty channel list"));
    }
    Ok(channels)
}

/// The playable URL inside a portal `cmd`, e.g. `"ffmpeg http://host/ch/5"`.
pub fn link_from_cmd(cmd: &str) -> Option<String> {
    cmd.split_whitespace().last().map(str::to_string)
}

#[async_trait]
impl PortalClient for StalkerClient {
    async fn handshake(
        &self,
        url: &str,
        mac: &MacAddress,
        proxy: Option<&str>,
    ) -> Result<String, PortalError> {
        let client = self.client(proxy)?;
        let referer = Url::parse(url)
            .map(|u| format!("{}/", u.origin().ascii_serialization()))
            .ok();
        let headers = Self::stb_headers(mac, None, referer.as_deref());

        for endpoint in handshake_urls(url)? {
            debug!("Trying handshake endpoint {} for mac={}", endpoint, mac);
            let request = client
                .get(&endpoint)
                .headers(headers.clone())
                .timeout(HANDSHAKE_TIMEOUT);
            let resp = match send_with_retry(request).await {
                Ok(r) if r.status().is_success() => r,
                Ok(r) => {
                    debug!("Handshake status {} at {}", r.status(), endpoint);
                    continue;
                }
                Err(e) => {
                    debug!("Handshake request error at {}: {}", endpoint, e);
                    continue;
                }
            };
            let Ok(body) = resp.json::<Value>().await else {
                continue;
            };
            if let Some(token) = body
                .pointer("/js/token")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
            {
                info!("Got token for mac={} via {}", mac, endpoint);
                return Ok(token.to_string());
            }
        }
        warn!("Failed to get token for mac={} from all endpoints", mac);
        Err(PortalError::NoToken)
    }

    async fn get_profile(
        &self,
        url: &str,
        mac: &MacAddress,
        token: &str,
        proxy: Option<&str>,
    ) -> Result<Value, PortalError> {
        let params = [
            ("type", "stb"),
            ("action", "get_profile"),
            ("JsHttpRequest", "1-xml"),
        ];
        let request = JsRequest {
            call: "get_profile",
            url,
            params: &params,
            timeout: PROFILE_TIMEOUT,
            post_fallback: false,
        };
        self.call_js(request, mac, token, proxy, Ok).await
    }

    async fn list_channels(
        &self,
        url: &str,
        mac: &MacAddress,
        token: &str,
        proxy: Option<&str>,
    ) -> Result<Vec<PortalChannel>, PortalError> {
        let params = [
            ("type", "itv"),
            ("action", "get_all_channels"),
            ("force_ch_link_check", ""),
            ("JsHttpRequest", "1-xml"),
        ];
        let request = JsRequest {
            call: "get_all_channels",
            url,
            params: &params,
            timeout: CHANNELS_TIMEOUT,
            post_fallback: true,
        };
        let channels = self.call_js(request, mac, token, proxy, parse_channels).await?;
        info!("Got {} channels for mac={}", channels.len(), mac);
        Ok(channels)
    }

    async fn resolve_link(
        &self,
        url: &str,
        mac: &MacAddress,
        token: &str,
        cmd: &str,
        proxy: Option<&str>,
    ) -> Result<String, PortalError> {
        let params = [
            ("type", "itv"),
            ("action", "create_link"),
            ("cmd", cmd),
            ("series", "0"),
            ("forced_storage", "false"),
            ("disable_ad", "false"),
            ("download", "false"),
            ("force_ch_link_check", "false"),
            ("JsHttpRequest", "1-xml"),
        ];
        let request = JsRequest {
            call: "create_link",
            url,
            params: &params,
            timeout: LINK_TIMEOUT,
            post_fallback: true,
        };
        self.call_js(request, mac, token, proxy, |js| {
            js.get("cmd")
                .and_then(Value::as_str)
                .and_then(link_from_cmd)
                .ok_or_else(|| PortalError::unexpected("create_link", "missing cmd"))
        })
        .await
    }

    async fn get_expires(
        &self,
        url: &str,
        mac: &MacAddress,
        token: &str,
        proxy: Option<&str>,
    ) -> Result<String, PortalError> {
        let params = [
            ("type", "account_info"),
            ("action", "get_main_info"),
            ("JsHttpRequest", "1-xml"),
        ];
        let request = JsRequest {
            call: "get_main_info",
            url,
            params: &params,
            timeout: EXPIRY_TIMEOUT,
            post_fallback: false,
        };
        self.call_js(request, mac, token, proxy, |js| {
            js.get("phone")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| PortalError::unexpected("get_main_info", "missing expiry"))
        })
        .await
    }

    async fn probe(
        &self,
        link: &str,
        proxy: Option<&str>,
        timeout: Duration,
    ) -> Result<(), PortalError> {
        let mut cmd = Command::new(&self.ffprobe_path);
        if let Some(p) = proxy {
            cmd.args(["-http_proxy", p]);
        }
        let micros = timeout.as_micros().to_string();
        cmd.args(["-timeout", micros.as_str(), "-i", link])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        // ffprobe's own -timeout only covers socket reads; cap the whole run too.
        let limit = timeout + Duration::from_secs(10);
        let status = match tokio::time::timeout(limit, cmd.status()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(PortalError::Probe(format!("spawn {}: {e}", self.ffprobe_path))),
            Err(_) => return Err(PortalError::Probe(format!("timed out after {limit:?}"))),
        };
        if status.success() {
            Ok(())
        } else {
            Err(PortalError::Probe(format!("ffprobe exited with {status}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::http::StatusCode as HttpStatus;
    use axum::routing::get;
    use axum::{Json, Router};

    use super::*;

    fn mac() -> MacAddress {
        "00:1A:79:00:00:01".parse().unwrap()
    }

    /// Serves `app` on a loopback port and returns the portal URL for it.
    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/server/load.php")
    }

    #[tokio::test]
    async fn empty_channel_list_on_get_falls_back_to_post() {
        let app = Router::new().route(
            "/server/load.php",
            get(|| async { Json(serde_json::json!({"js": {"data": []}})) }).post(|| async {
                Json(serde_json::json!({"js": {"data": [
                    {"id": 1, "name": "One", "cmd": "ffmpeg http://cdn/1.ts"}
                ]}}))
            }),
        );
        let url = serve(app).await;

        let client = StalkerClient::new("ffprobe");
        let channels = client.list_channels(&url, &mac(), "tok", None).await.unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].id, "1");
    }

    #[tokio::test]
    async fn missing_link_on_get_falls_back_to_post() {
        let app = Router::new().route(
            "/server/load.php",
            get(|| async { Json(serde_json::json!({"js": {"cmd": ""}})) }).post(|| async {
                Json(serde_json::json!({"js": {"cmd": "ffmpeg http://cdn/1.ts?token=abc"}}))
            }),
        );
        let url = serve(app).await;

        let client = StalkerClient::new("ffprobe");
        let link = client
            .resolve_link(&url, &mac(), "tok", "ffmpeg http://localhost/ch/1", None)
            .await
            .unwrap();
        assert_eq!(link, "http://cdn/1.ts?token=abc");
    }

    #[tokio::test]
    async fn transient_server_error_is_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/server/load.php",
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        (HttpStatus::SERVICE_UNAVAILABLE, Json(serde_json::json!({})))
                    } else {
                        (HttpStatus::OK, Json(serde_json::json!({"js": {"id": 7}})))
                    }
                }
            }),
        );
        let url = serve(app).await;

        let client = StalkerClient::new("ffprobe");
        let profile = client.get_profile(&url, &mac(), "tok", None).await.unwrap();
        assert_eq!(profile["id"], 7);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persistent_server_error_gives_up_after_retries() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/server/load.php",
            get(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { HttpStatus::BAD_GATEWAY }
            }),
        );
        let url = serve(app).await;

        let client = StalkerClient::new("ffprobe");
        assert!(client.get_profile(&url, &mac(), "tok", None).await.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 1 + MAX_RETRIES as usize);
    }

    #[test]
    fn channel_list_accepts_numeric_ids() {
        let json = r#"[
            {"id": 5, "name": "News", "number": "5", "cmd": "ffmpeg http://localhost/ch/5", "tv_genre_id": 3, "logo": ""},
            {"id": "6", "name": "Sport", "cmd": "ffmpeg http://cdn/6.ts"}
        ]"#;
        let channels: Vec<PortalChannel> = serde_json::from_str(json).unwrap();
        assert_eq!(channels[0].id, "5");
        assert_eq!(channels[0].tv_genre_id.as_deref(), Some("3"));
        assert_eq!(channels[1].id, "6");
        assert_eq!(channels[1].number, None);
    }

    #[test]
    fn link_is_last_cmd_token() {
        assert_eq!(link_from_cmd("ffmpeg http://cdn/x.ts").as_deref(), Some("http://cdn/x.ts"));
        assert_eq!(link_from_cmd("http://cdn/y.ts").as_deref(), Some("http://cdn/y.ts"));
        assert_eq!(link_from_cmd("   "), None);
    }

    #[test]
    fn handshake_urls_prefer_configured_php_path() {
        let urls = handshake_urls("http://portal.example:8080/stalker_portal/server/load.php").unwrap();
        assert_eq!(
            urls[0],
            "http://portal.example:8080/stalker_portal/server/load.php?type=stb&action=handshake&JsHttpRequest=1-xml"
        );
        assert!(urls.contains(&"http://portal.example:8080/c/portal.php?type=stb&action=handshake&JsHttpRequest=1-xml".to_string()));
        let unique: std::collections::HashSet<_> = urls.iter().collect();
        assert_eq!(unique.len(), urls.len());
        assert!(handshake_urls("not a url").is_err());
    }

    #[test]
    fn xpcom_loader_is_derived_from_page_url() {
        let js = r#"
            var pattern = /(https?):\/\/([^\/]+)\/(.*)\/c\//;
            var result = pattern.exec(window.location.href);
            this.portal_protocol = result[1];
            this.portal_ip = result[2];
            this.portal_path = result[3];
            this.ajax_loader = this.portal_protocol + '://' + this.portal_ip + '/' + this.portal_path + '/server/load.php';
        "#;
        let endpoint = parse_xpcom("http://portal.example/stalker_portal/c/xpcom.common.js", js);
        assert_eq!(
            endpoint.as_deref(),
            Some("http://portal.example/stalker_portal/server/load.php")
        );
        assert_eq!(parse_xpcom("http://portal.example/c/xpcom.common.js", "nothing here"), None);
    }
}
