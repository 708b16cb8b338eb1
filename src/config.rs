use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::transcoder::{CommandTemplate, DEFAULT_FFMPEG_COMMAND};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub hls: HlsConfig,
}

impl Settings {
    /// Reads `path` (any format the `config` crate knows) and layers
    /// `STBRELAY__SECTION__KEY` environment overrides on top.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("STBRELAY")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8001
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/portals.json")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMethod {
    /// Relay through a supervised ffmpeg process.
    #[default]
    Ffmpeg,
    /// Send the player a redirect to the upstream link.
    Redirect,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    #[serde(default)]
    pub method: StreamMethod,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    #[serde(default = "default_ffmpeg_command")]
    pub ffmpeg_command: String,
    /// Seconds.
    #[serde(default = "default_ffmpeg_timeout")]
    pub ffmpeg_timeout: u64,
    #[serde(default = "default_true")]
    pub test_streams: bool,
    #[serde(default = "default_true")]
    pub try_all_macs: bool,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_ffmpeg_command() -> String {
    DEFAULT_FFMPEG_COMMAND.to_string()
}

fn default_ffmpeg_timeout() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            method: StreamMethod::default(),
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            ffmpeg_command: default_ffmpeg_command(),
            ffmpeg_timeout: default_ffmpeg_timeout(),
            test_streams: true,
            try_all_macs: true,
        }
    }
}

impl StreamingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.ffmpeg_timeout)
    }

    pub fn template(&self) -> anyhow::Result<CommandTemplate> {
        Ok(self.ffmpeg_command.parse()?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentType {
    #[default]
    Mpegts,
    Fmp4,
}

impl SegmentType {
    pub fn as_str(self) -> &'static str {
        match self {
            SegmentType::Mpegts => "mpegts",
            SegmentType::Fmp4 => "fmp4",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            SegmentType::Mpegts => "ts",
            SegmentType::Fmp4 => "m4s",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HlsConfig {
    #[serde(default)]
    pub segment_type: SegmentType,
    #[serde(default = "default_segment_duration")]
    pub segment_duration: u32,
    #[serde(default = "default_playlist_size")]
    pub playlist_size: u32,
    #[serde(default = "default_max_streams")]
    pub max_streams: usize,
    /// Seconds without a fetch before a session is evicted.
    #[serde(default = "default_inactive_timeout")]
    pub inactive_timeout: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,
    /// Parent of the per-session working directories; system temp dir if unset.
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
}

fn default_segment_duration() -> u32 {
    4
}

fn default_playlist_size() -> u32 {
    6
}

fn default_max_streams() -> usize {
    10
}

fn default_inactive_timeout() -> u64 {
    30
}

fn default_sweep_interval() -> u64 {
    10
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            segment_type: SegmentType::default(),
            segment_duration: default_segment_duration(),
            playlist_size: default_playlist_size(),
            max_streams: default_max_streams(),
            inactive_timeout: default_inactive_timeout(),
            sweep_interval: default_sweep_interval(),
            base_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stbrelay.toml");
        std::fs::write(
            &path,
            r#"
[streaming]
method = "redirect"
try_all_macs = false

[hls]
segment_type = "fmp4"
inactive_timeout = 45
"#,
        )
        .unwrap();

        let settings = Settings::load(path.to_str().unwrap()).unwrap();
        assert_eq!(settings.server.port, 8001);
        assert_eq!(settings.streaming.method, StreamMethod::Redirect);
        assert!(!settings.streaming.try_all_macs);
        assert!(settings.streaming.test_streams);
        assert_eq!(settings.streaming.timeout(), Duration::from_secs(5));
        assert_eq!(settings.hls.segment_type, SegmentType::Fmp4);
        assert_eq!(settings.hls.inactive_timeout, 45);
        assert_eq!(settings.hls.max_streams, 10);
        assert!(settings.streaming.template().is_ok());
    }
}
