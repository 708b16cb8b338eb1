use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::{Duration, Instant},
};

use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::HlsConfig;
use crate::metrics::HLS_SESSIONS;
use crate::transcoder::{hls_args, terminate_child, StderrRing, StreamInput};

pub const MEDIA_PLAYLIST: &str = "stream.m3u8";
pub const MASTER_PLAYLIST: &str = "master.m3u8";

const POLL_STEP: Duration = Duration::from_millis(100);
const TRANSCODED_PLAYLIST_POLLS: u32 = 100;
const PASSTHROUGH_PLAYLIST_POLLS: u32 = 10;
const SEGMENT_POLLS: u32 = 30;

#[derive(Debug, thiserror::Error)]
pub enum HlsError {
    #[error("HLS capacity reached ({0} sessions)")]
    Capacity(usize),
    #[error("HLS working directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to spawn ffmpeg for HLS: {0}")]
    Spawn(std::io::Error),
}

/// Content type served for an HLS file name.
pub fn content_type(filename: &str) -> &'static str {
    match Path::new(filename).extension().and_then(|e| e.to_str()) {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("ts") => "video/mp2t",
        Some("m4s") => "video/iso.segment",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// Whether an upstream link already points at an HLS playlist.
pub fn is_hls_url(url: &str) -> bool {
    let url = url.to_ascii_lowercase();
    url.contains(".m3u8") || url.contains("hls") || url.contains("stitcher") || url.contains("/manifest/")
}

/// Top-level manifest that hands the player straight to the upstream playlist.
pub fn passthrough_manifest(url: &str) -> String {
    format!(
        "#EXTM3U\n#EXT-X-VERSION:7\n#EXT-X-STREAM-INF:BANDWIDTH=15000000,CODECS=\"avc1.640028,mp4a.40.2\"\n{url}\n"
    )
}

fn safe_file_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('\\') && !name.contains("..")
}

fn dir_prefix(portal_id: &str, channel_id: &str) -> String {
    let clean = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    };
    format!("stbrelay_hls_{}_{}_", clean(portal_id), clean(channel_id))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    portal_id: String,
    channel_id: String,
}

impl SessionKey {
    fn new(portal_id: &str, channel_id: &str) -> Self {
        Self {
            portal_id: portal_id.to_string(),
            channel_id: channel_id.to_string(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.portal_id, self.channel_id)
    }
}

struct HlsSession {
    dir: TempDir,
    /// `None` for passthrough sessions.
    child: Option<Child>,
    stderr: StderrRing,
    last_access: Instant,
}

enum Liveness {
    Running,
    Exited(ExitStatus),
    Unknown(std::io::Error),
}

impl HlsSession {
    fn passthrough(&self) -> bool {
        self.child.is_none()
    }

    /// Passthrough sessions have no process and always count as running.
    fn liveness(&mut self) -> Liveness {
        match self.child.as_mut().map(Child::try_wait) {
            None | Some(Ok(None)) => Liveness::Running,
            Some(Ok(Some(status))) => Liveness::Exited(status),
            Some(Err(e)) => Liveness::Unknown(e),
        }
    }
}

/// What a caller learns about a started or reused session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HlsSessionInfo {
    pub dir: PathBuf,
    pub passthrough: bool,
    pub reused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HlsFile {
    pub path: PathBuf,
    pub content_type: &'static str,
}

/// One repackaging session per (portal, channel), shared by every viewer of it.
#[derive(Clone)]
pub struct HlsManager {
    inner: Arc<Inner>,
}

struct Inner {
    sessions: Mutex<HashMap<SessionKey, HlsSession>>,
    config: HlsConfig,
    ffmpeg_path: String,
    timeout: Duration,
}

impl HlsManager {
    pub fn new(config: HlsConfig, ffmpeg_path: impl Into<String>, timeout: Duration) -> Self {
        info!(
            "HLS manager initialized: max_streams={} inactive_timeout={}s segment_type={}",
            config.max_streams,
            config.inactive_timeout,
            config.segment_type.as_str()
        );
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                config,
                ffmpeg_path: ffmpeg_path.into(),
                timeout,
            }),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// `Some(passthrough)` if a running session exists for the key. A
    /// transcoder that has exited reads as no session.
    pub async fn session_kind(&self, portal_id: &str, channel_id: &str) -> Option<bool> {
        let mut sessions = self.inner.sessions.lock().await;
        let session = sessions.get_mut(&SessionKey::new(portal_id, channel_id))?;
        match session.liveness() {
            Liveness::Running => Some(session.passthrough()),
            Liveness::Exited(_) | Liveness::Unknown(_) => None,
        }
    }

    /// Returns the live session for the key or creates one for `link`.
    /// The registry lock is held across creation, so racing callers for the
    /// same key all end up on a single session. A session whose ffmpeg has
    /// exited is torn down and replaced.
    pub async fn start_or_reuse(
        &self,
        portal_id: &str,
        channel_id: &str,
        link: &str,
        proxy: Option<&str>,
    ) -> Result<HlsSessionInfo, HlsError> {
        let key = SessionKey::new(portal_id, channel_id);
        let mut sessions = loop {
            let mut sessions = self.inner.sessions.lock().await;
            if !sessions.contains_key(&key) {
                break sessions;
            }
            let mut exit = None;
            if let Some(existing) = sessions.get_mut(&key) {
                match existing.liveness() {
                    Liveness::Running => {
                        existing.last_access = Instant::now();
                        info!("Reusing HLS session: key={}", key);
                        return Ok(HlsSessionInfo {
                            dir: existing.dir.path().to_path_buf(),
                            passthrough: existing.passthrough(),
                            reused: true,
                        });
                    }
                    Liveness::Exited(status) => exit = Some(status),
                    Liveness::Unknown(e) => {
                        error!("HLS process status check failed: key={} err={}", key, e);
                    }
                }
            }
            warn!("Replacing dead HLS session: key={}", key);
            let dead = sessions.remove(&key);
            HLS_SESSIONS.set(sessions.len() as f64);
            drop(sessions);
            if let Some(dead) = dead {
                retire(&key, dead, exit).await;
            }
        };

        let max = self.inner.config.max_streams;
        if sessions.len() >= max {
            error!("HLS capacity reached: max_streams={} key={}", max, key);
            return Err(HlsError::Capacity(max));
        }

        let prefix = dir_prefix(portal_id, channel_id);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match &self.inner.config.base_dir {
            Some(base) => {
                tokio::fs::create_dir_all(base).await?;
                builder.tempdir_in(base)?
            }
            None => builder.tempdir()?,
        };

        let session = if is_hls_url(link) {
            info!("Creating HLS passthrough: key={} link={}", key, link);
            tokio::fs::write(dir.path().join(MASTER_PLAYLIST), passthrough_manifest(link)).await?;
            HlsSession {
                dir,
                child: None,
                stderr: StderrRing::default(),
                last_access: Instant::now(),
            }
        } else {
            self.spawn_transcoder(&key, dir, link, proxy)?
        };

        let info = HlsSessionInfo {
            dir: session.dir.path().to_path_buf(),
            passthrough: session.passthrough(),
            reused: false,
        };
        sessions.insert(key, session);
        HLS_SESSIONS.set(sessions.len() as f64);
        Ok(info)
    }

    fn spawn_transcoder(
        &self,
        key: &SessionKey,
        dir: TempDir,
        link: &str,
        proxy: Option<&str>,
    ) -> Result<HlsSession, HlsError> {
        let config = &self.inner.config;
        let input = StreamInput {
            url: link,
            proxy,
            timeout: self.inner.timeout,
        };
        let args = hls_args(
            &input,
            config.segment_type,
            config.segment_duration,
            config.playlist_size,
            dir.path(),
            MEDIA_PLAYLIST,
        );

        info!("Starting HLS ffmpeg: key={} link={}", key, link);
        // On error `dir` is dropped here and takes the directory with it.
        let mut child = Command::new(&self.inner.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(HlsError::Spawn)?;

        let stderr = child
            .stderr
            .take()
            .map(|s| StderrRing::capture(s, key.to_string()))
            .unwrap_or_default();
        info!("HLS ffmpeg spawned: key={} pid={:?}", key, child.id());

        Ok(HlsSession {
            dir,
            child: Some(child),
            stderr,
            last_access: Instant::now(),
        })
    }

    /// Resolves `filename` inside the session directory, refreshing the
    /// session's last access. `None` if the session or the file is missing.
    pub async fn fetch(&self, portal_id: &str, channel_id: &str, filename: &str) -> Option<HlsFile> {
        if !safe_file_name(filename) {
            warn!("Rejected HLS file name: {}", filename);
            return None;
        }
        let path = {
            let mut sessions = self.inner.sessions.lock().await;
            let session = sessions.get_mut(&SessionKey::new(portal_id, channel_id))?;
            session.last_access = Instant::now();
            session.dir.path().join(filename)
        };
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Some(HlsFile {
                path,
                content_type: content_type(filename),
            }),
            _ => None,
        }
    }

    /// Polls `fetch` until the file shows up. Playlists of a fresh
    /// transcoding session get the longest budget.
    pub async fn fetch_when_ready(
        &self,
        portal_id: &str,
        channel_id: &str,
        filename: &str,
        passthrough: bool,
    ) -> Option<HlsFile> {
        let polls = if filename.ends_with(".m3u8") {
            if passthrough {
                PASSTHROUGH_PLAYLIST_POLLS
            } else {
                TRANSCODED_PLAYLIST_POLLS
            }
        } else {
            SEGMENT_POLLS
        };
        for attempt in 0..polls {
            if let Some(file) = self.fetch(portal_id, channel_id, filename).await {
                return Some(file);
            }
            if attempt + 1 < polls {
                tokio::time::sleep(POLL_STEP).await;
            }
        }
        None
    }

    /// One eviction pass: drops crashed and idle sessions, tearing them down
    /// after the registry lock is released.
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Instant::now()).await
    }

    pub(crate) async fn sweep_at(&self, now: Instant) -> usize {
        let idle_limit = Duration::from_secs(self.inner.config.inactive_timeout);
        let mut removed: Vec<(SessionKey, HlsSession, Option<ExitStatus>)> = Vec::new();
        {
            let mut sessions = self.inner.sessions.lock().await;
            let mut doomed: Vec<(SessionKey, Option<ExitStatus>)> = Vec::new();
            for (key, session) in sessions.iter_mut() {
                match session.liveness() {
                    Liveness::Exited(status) => {
                        doomed.push((key.clone(), Some(status)));
                        continue;
                    }
                    Liveness::Unknown(e) => {
                        error!("HLS process status check failed: key={} err={}", key, e);
                        doomed.push((key.clone(), None));
                        continue;
                    }
                    Liveness::Running => {}
                }

                let idle = now.saturating_duration_since(session.last_access);
                if idle > idle_limit {
                    let kind = if session.passthrough() { "passthrough" } else { "ffmpeg" };
                    info!(
                        "Evicting inactive HLS session: key={} kind={} idle={:.1}s",
                        key,
                        kind,
                        idle.as_secs_f64()
                    );
                    doomed.push((key.clone(), None));
                }
            }
            for (key, exit) in doomed {
                if let Some(session) = sessions.remove(&key) {
                    removed.push((key, session, exit));
                }
            }
            HLS_SESSIONS.set(sessions.len() as f64);
        }

        let count = removed.len();
        for (key, session, exit) in removed {
            retire(&key, session, exit).await;
        }
        count
    }

    /// Runs `sweep` every `interval` for as long as the task lives.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = manager.sweep().await;
                if evicted > 0 {
                    debug!("HLS sweep evicted {} session(s)", evicted);
                }
            }
        })
    }

    /// Tears down every session, e.g. on shutdown.
    pub async fn shutdown(&self) {
        let drained: Vec<(SessionKey, HlsSession)> = {
            let mut sessions = self.inner.sessions.lock().await;
            HLS_SESSIONS.set(0.0);
            sessions.drain().collect()
        };
        for (key, session) in drained {
            stop_session(&key, session).await;
        }
    }

    #[cfg(test)]
    async fn set_last_access(&self, portal_id: &str, channel_id: &str, at: Instant) {
        let mut sessions = self.inner.sessions.lock().await;
        if let Some(s) = sessions.get_mut(&SessionKey::new(portal_id, channel_id)) {
            s.last_access = at;
        }
    }
}

/// Logs how a session's process ended, then tears the session down.
async fn retire(key: &SessionKey, session: HlsSession, exit: Option<ExitStatus>) {
    if let Some(status) = exit {
        if status.success() {
            info!("HLS ffmpeg ended normally: key={}", key);
        } else {
            error!("HLS ffmpeg crashed: key={} exit_code={:?}", key, status.code());
            session.stderr.log_exit(&key.to_string(), status).await;
        }
    }
    stop_session(key, session).await;
}

async fn stop_session(key: &SessionKey, mut session: HlsSession) {
    let label = key.to_string();
    if let Some(child) = session.child.as_mut() {
        terminate_child(child, &label).await;
    }
    let dir = session.dir.path().to_path_buf();
    if let Err(e) = session.dir.close() {
        debug!("HLS directory cleanup failed: key={} dir={} err={}", key, dir.display(), e);
    }
    info!("HLS session stopped: key={}", key);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base: &Path, max_streams: usize) -> HlsConfig {
        HlsConfig {
            max_streams,
            inactive_timeout: 30,
            base_dir: Some(base.to_path_buf()),
            ..HlsConfig::default()
        }
    }

    #[test]
    fn hls_url_heuristics() {
        assert!(is_hls_url("https://cdn/x/master.m3u8"));
        assert!(is_hls_url("http://cdn/HLS/live"));
        assert!(is_hls_url("http://cdn/stitcher/abc"));
        assert!(is_hls_url("http://cdn/manifest/abc"));
        assert!(!is_hls_url("http://src/5.ts"));
    }

    #[test]
    fn content_types_follow_extension() {
        assert_eq!(content_type("master.m3u8"), "application/vnd.apple.mpegurl");
        assert_eq!(content_type("seg_001.ts"), "video/mp2t");
        assert_eq!(content_type("seg_001.m4s"), "video/iso.segment");
        assert_eq!(content_type("init.mp4"), "video/mp4");
        assert_eq!(content_type("notes.txt"), "application/octet-stream");
    }

    #[tokio::test]
    async fn hls_source_becomes_passthrough() {
        let base = tempfile::tempdir().unwrap();
        let manager = HlsManager::new(config(base.path(), 4), "ffmpeg", Duration::from_secs(5));

        let info = manager
            .start_or_reuse("p", "5", "https://cdn/x/master.m3u8", None)
            .await
            .unwrap();
        assert!(info.passthrough);
        assert!(!info.reused);

        let file = manager.fetch("p", "5", MASTER_PLAYLIST).await.unwrap();
        assert_eq!(file.content_type, "application/vnd.apple.mpegurl");
        let body = std::fs::read_to_string(&file.path).unwrap();
        assert!(body.starts_with("#EXTM3U\n"));
        assert!(body.lines().any(|l| l == "https://cdn/x/master.m3u8"));

        assert!(manager.fetch("p", "5", MEDIA_PLAYLIST).await.is_none());
        assert!(manager.fetch("p", "5", "../secret").await.is_none());
        assert!(manager.fetch("p", "6", MASTER_PLAYLIST).await.is_none());
    }

    #[tokio::test]
    async fn capacity_is_enforced_and_reuse_is_free() {
        let base = tempfile::tempdir().unwrap();
        let manager = HlsManager::new(config(base.path(), 1), "ffmpeg", Duration::from_secs(5));

        manager.start_or_reuse("p", "1", "http://a/1.m3u8", None).await.unwrap();
        let again = manager.start_or_reuse("p", "1", "http://a/1.m3u8", None).await.unwrap();
        assert!(again.reused);

        let err = manager
            .start_or_reuse("p", "2", "http://a/2.m3u8", None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HlsError::Capacity(1)));
    }

    #[tokio::test]
    async fn concurrent_starts_share_one_session() {
        let base = tempfile::tempdir().unwrap();
        let manager = HlsManager::new(config(base.path(), 4), "ffmpeg", Duration::from_secs(5));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let m = manager.clone();
            tasks.push(tokio::spawn(async move {
                m.start_or_reuse("p", "5", "https://cdn/x/master.m3u8", None)
                    .await
                    .unwrap()
            }));
        }
        let mut dirs = Vec::new();
        let mut fresh = 0;
        for t in tasks {
            let info = t.await.unwrap();
            if !info.reused {
                fresh += 1;
            }
            dirs.push(info.dir);
        }
        assert_eq!(fresh, 1);
        dirs.dedup();
        assert_eq!(dirs.len(), 1);
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted_by_sweep() {
        let base = tempfile::tempdir().unwrap();
        let manager = HlsManager::new(config(base.path(), 4), "ffmpeg", Duration::from_secs(5));

        let stale = manager.start_or_reuse("p", "a", "http://a/a.m3u8", None).await.unwrap();
        let fresh = manager.start_or_reuse("p", "b", "http://a/b.m3u8", None).await.unwrap();
        let t0 = Instant::now();
        manager.set_last_access("p", "a", t0).await;
        manager.set_last_access("p", "b", t0 + Duration::from_secs(2)).await;

        let evicted = manager.sweep_at(t0 + Duration::from_secs(31)).await;
        assert_eq!(evicted, 1);
        assert!(!stale.dir.exists());
        assert!(fresh.dir.exists());
        assert_eq!(manager.session_kind("p", "a").await, None);
        assert_eq!(manager.session_kind("p", "b").await, Some(true));

        manager.shutdown().await;
        assert!(!fresh.dir.exists());
        assert!(manager.is_empty().await);
    }

    #[cfg(unix)]
    fn fake_ffmpeg(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-ffmpeg");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn crashed_transcoder_is_swept() {
        let tools = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        let ffmpeg = fake_ffmpeg(tools.path(), "echo boom >&2; exit 1");
        let manager = HlsManager::new(
            config(base.path(), 4),
            ffmpeg.to_string_lossy(),
            Duration::from_secs(5),
        );

        let info = manager.start_or_reuse("p", "5", "http://src/5", None).await.unwrap();
        assert!(!info.passthrough);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(manager.sweep().await, 1);
        assert!(!info.dir.exists());
        assert!(manager.is_empty().await);
    }

    #[cfg(unix)]
    fn spawn_count(log: &Path) -> usize {
        std::fs::read_to_string(log).map(|s| s.lines().count()).unwrap_or(0)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn concurrent_transcoded_starts_spawn_once() {
        let tools = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        let log = tools.path().join("spawns");
        let ffmpeg = fake_ffmpeg(
            tools.path(),
            &format!("echo spawned >> '{}'; exec sleep 30", log.display()),
        );
        let manager = HlsManager::new(
            config(base.path(), 4),
            ffmpeg.to_string_lossy(),
            Duration::from_secs(5),
        );

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let m = manager.clone();
            tasks.push(tokio::spawn(async move {
                m.start_or_reuse("p", "5", "http://src/5", None).await.unwrap()
            }));
        }
        let mut fresh = 0;
        for t in tasks {
            let info = t.await.unwrap();
            assert!(!info.passthrough);
            if !info.reused {
                fresh += 1;
            }
        }
        assert_eq!(fresh, 1);
        assert_eq!(manager.len().await, 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(spawn_count(&log), 1);

        manager.shutdown().await;
        assert!(manager.is_empty().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_transcoder_is_replaced_on_next_start() {
        let tools = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        let log = tools.path().join("spawns");
        let ffmpeg = fake_ffmpeg(
            tools.path(),
            &format!("echo spawned >> '{}'; exit 1", log.display()),
        );
        let manager = HlsManager::new(
            config(base.path(), 4),
            ffmpeg.to_string_lossy(),
            Duration::from_secs(5),
        );

        let first = manager.start_or_reuse("p", "5", "http://src/5", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(manager.session_kind("p", "5").await, None);

        let second = manager.start_or_reuse("p", "5", "http://src/5", None).await.unwrap();
        assert!(!second.reused);
        assert_ne!(first.dir, second.dir);
        assert!(!first.dir.exists());
        assert_eq!(manager.len().await, 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(spawn_count(&log), 2);

        manager.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn transcoded_playlist_is_served_once_written() {
        let tools = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        // The playlist path is the last argument.
        let ffmpeg = fake_ffmpeg(
            tools.path(),
            "for last; do :; done; printf '#EXTM3U\\n' > \"$last\"; exec sleep 30",
        );
        let manager = HlsManager::new(
            config(base.path(), 4),
            ffmpeg.to_string_lossy(),
            Duration::from_secs(5),
        );

        manager.start_or_reuse("p", "5", "http://src/5", None).await.unwrap();
        let file = manager
            .fetch_when_ready("p", "5", MEDIA_PLAYLIST, false)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(file.path).unwrap(), "#EXTM3U\n");
        assert_eq!(manager.sweep().await, 0);

        manager.shutdown().await;
        assert!(manager.is_empty().await);
    }
}
