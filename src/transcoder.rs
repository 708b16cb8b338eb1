use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, ChildStderr};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::SegmentType;

pub const DEFAULT_FFMPEG_COMMAND: &str = "-re -http_proxy <proxy> -timeout <timeout> -i <url> -map 0 -codec copy -f mpegts -flush_packets 0 -fflags +nobuffer -flags low_delay -strict experimental -analyzeduration 0 -probesize 32 -copyts -threads 12 pipe:";

const TERM_GRACE: Duration = Duration::from_secs(5);
const KILL_GRACE: Duration = Duration::from_secs(2);
const STDERR_RING_LINES: usize = 50;

/// What a repackaging process reads from.
#[derive(Debug, Clone, Copy)]
pub struct StreamInput<'a> {
    pub url: &'a str,
    pub proxy: Option<&'a str>,
    /// Socket timeout; ffmpeg takes it in microseconds.
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateArg {
    Literal(String),
    Url,
    Proxy,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("ffmpeg command template has no <url> placeholder")]
    MissingUrl,
    #[error("ffmpeg command template is empty")]
    Empty,
}

/// Operator-supplied ffmpeg arguments, parsed once into literals and placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    args: Vec<TemplateArg>,
}

impl FromStr for CommandTemplate {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let args: Vec<TemplateArg> = s
            .split_whitespace()
            .map(|tok| match tok {
                "<url>" => TemplateArg::Url,
                "<proxy>" => TemplateArg::Proxy,
                "<timeout>" => TemplateArg::Timeout,
                other => TemplateArg::Literal(other.to_string()),
            })
            .collect();
        if args.is_empty() {
            return Err(TemplateError::Empty);
        }
        if !args.contains(&TemplateArg::Url) {
            return Err(TemplateError::MissingUrl);
        }
        Ok(Self { args })
    }
}

impl Default for CommandTemplate {
    fn default() -> Self {
        DEFAULT_FFMPEG_COMMAND
            .parse()
            .unwrap_or_else(|_| Self { args: vec![TemplateArg::Url] })
    }
}

impl CommandTemplate {
    /// Builds the argument vector. Without a proxy the `<proxy>` placeholder is
    /// dropped together with the flag in front of it.
    pub fn render(&self, input: &StreamInput<'_>) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(self.args.len());
        for (i, arg) in self.args.iter().enumerate() {
            match arg {
                TemplateArg::Literal(s) => out.push(s.clone()),
                TemplateArg::Url => out.push(input.url.to_string()),
                TemplateArg::Timeout => out.push(input.timeout.as_micros().to_string()),
                TemplateArg::Proxy => match input.proxy {
                    Some(p) => out.push(p.to_string()),
                    None => {
                        let prev_is_flag = i > 0
                            && matches!(&self.args[i - 1], TemplateArg::Literal(f) if f.starts_with('-'));
                        if prev_is_flag {
                            out.pop();
                        }
                    }
                },
            }
        }
        out
    }
}

/// Program plus arguments, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfmpegInvocation {
    pub program: String,
    pub args: Vec<String>,
}

impl fmt::Display for FfmpegInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.program, self.args.join(" "))
    }
}

/// Browser playback needs fragmented MP4 on stdout regardless of the operator template.
pub fn web_args(input: &StreamInput<'_>) -> Vec<String> {
    let mut args: Vec<String> = vec!["-loglevel".into(), "panic".into(), "-hide_banner".into()];
    if let Some(p) = input.proxy {
        args.extend(["-http_proxy".into(), p.to_string()]);
    }
    args.extend([
        "-i".into(),
        input.url.to_string(),
        "-vcodec".into(),
        "copy".into(),
        "-f".into(),
        "mp4".into(),
        "-movflags".into(),
        "frag_keyframe+empty_moov".into(),
        "pipe:".into(),
    ]);
    args
}

/// Segmenting remux into `dir`, writing `playlist_name` and rolling segments.
pub fn hls_args(
    input: &StreamInput<'_>,
    segment_type: SegmentType,
    segment_duration: u32,
    playlist_size: u32,
    dir: &Path,
    playlist_name: &str,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-fflags".into(), "+genpts+igndts+nobuffer".into(),
        "-err_detect".into(), "aggressive".into(),
        "-flags".into(), "low_delay".into(),
        "-reconnect".into(), "1".into(),
        "-reconnect_at_eof".into(), "1".into(),
        "-reconnect_streamed".into(), "1".into(),
        "-reconnect_delay_max".into(), "15".into(),
    ];
    if let Some(p) = input.proxy {
        args.extend(["-http_proxy".into(), p.to_string()]);
    }
    args.extend(["-timeout".into(), input.timeout.as_micros().to_string()]);

    args.extend([
        "-i".into(), input.url.to_string(),
        "-map".into(), "0".into(),
        "-c:v".into(), "copy".into(),
        "-copyts".into(),
        "-start_at_zero".into(),
        "-c:a".into(), "aac".into(),
        "-b:a".into(), "256k".into(),
        "-af".into(), "aresample=async=1".into(),
    ]);

    let mut hls_flags = String::from("independent_segments+omit_endlist");
    if segment_type == SegmentType::Mpegts {
        hls_flags.push_str("+program_date_time");
        args.extend([
            "-mpegts_flags".into(), "pat_pmt_at_frames".into(),
            "-pcr_period".into(), "20".into(),
        ]);
    }

    let segment_pattern = dir
        .join(format!("seg_%03d.{}", segment_type.extension()))
        .to_string_lossy()
        .to_string();
    args.extend([
        "-f".into(), "hls".into(),
        "-hls_time".into(), segment_duration.to_string(),
        "-hls_list_size".into(), playlist_size.to_string(),
        "-hls_flags".into(), hls_flags,
        "-hls_segment_type".into(), segment_type.as_str().into(),
        "-hls_segment_filename".into(), segment_pattern,
        "-start_number".into(), "0".into(),
        "-flush_packets".into(), "0".into(),
    ]);
    if segment_type == SegmentType::Fmp4 {
        args.extend(["-hls_fmp4_init_filename".into(), "init.mp4".into()]);
    }
    args.push(dir.join(playlist_name).to_string_lossy().to_string());
    args
}

/// Last lines an ffmpeg process wrote to stderr.
#[derive(Clone, Default)]
pub struct StderrRing(Arc<Mutex<VecDeque<String>>>);

impl StderrRing {
    /// Drains `stderr` in the background, echoing each line at debug level.
    pub fn capture(stderr: ChildStderr, label: String) -> Self {
        let ring = Self::default();
        let lines = ring.0.clone();
        tokio::spawn(async move {
            let mut reader = tokio::io::BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                debug!("ffmpeg[{}]: {}", label, line);
                let mut ring = lines.lock().await;
                if ring.len() >= STDERR_RING_LINES {
                    ring.pop_front();
                }
                ring.push_back(line);
            }
        });
        ring
    }

    pub async fn tail(&self) -> String {
        let ring = self.0.lock().await;
        ring.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Logs a nonzero exit together with whatever stderr was captured.
    pub async fn log_exit(&self, label: &str, status: std::process::ExitStatus) {
        if status.success() {
            debug!("ffmpeg exited cleanly: {} status={}", label, status);
            return;
        }
        let tail = self.tail().await;
        if tail.is_empty() {
            warn!("ffmpeg exited with error: {} status={} (no stderr captured)", label, status);
        } else {
            warn!(
                "ffmpeg exited with error: {} status={} last_stderr_lines=\n{}",
                label, status, tail
            );
        }
    }
}

/// Stops a child: SIGTERM, wait, then SIGKILL. Errors are logged, not returned;
/// an already-exited child is left alone.
pub async fn terminate_child(child: &mut Child, label: &str) {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!("Process already exited: {} status={}", label, status);
            return;
        }
        Ok(None) => {}
        Err(e) => warn!("try_wait failed: {} err={}", label, e),
    }

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we have not reaped yet.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        match tokio::time::timeout(TERM_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Process terminated gracefully: {} status={}", label, status);
                return;
            }
            Ok(Err(e)) => warn!("wait after SIGTERM failed: {} err={}", label, e),
            Err(_) => warn!("Process ignored SIGTERM, killing: {}", label),
        }
    }

    match tokio::time::timeout(KILL_GRACE, child.kill()).await {
        Ok(Ok(())) => debug!("Process killed: {}", label),
        Ok(Err(e)) => warn!("kill failed: {} err={}", label, e),
        Err(_) => warn!("Process did not exit after SIGKILL: {}", label),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(proxy: Option<&'static str>) -> StreamInput<'static> {
        StreamInput {
            url: "http://src/5",
            proxy,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn default_template_renders_with_proxy_and_micros() {
        let args = CommandTemplate::default().render(&input(Some("http://proxy:3128")));
        let pos = args.iter().position(|a| a == "-http_proxy").unwrap();
        assert_eq!(args[pos + 1], "http://proxy:3128");
        let pos = args.iter().position(|a| a == "-timeout").unwrap();
        assert_eq!(args[pos + 1], "5000000");
        let pos = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[pos + 1], "http://src/5");
        assert_eq!(args.last().map(String::as_str), Some("pipe:"));
    }

    #[test]
    fn missing_proxy_drops_flag_pair() {
        let args = CommandTemplate::default().render(&input(None));
        assert!(!args.iter().any(|a| a == "-http_proxy"));
        assert!(!args.iter().any(|a| a.is_empty() || a == "<proxy>"));
        assert_eq!(&args[..2], &["-re".to_string(), "-timeout".to_string()]);
    }

    #[test]
    fn url_with_spaces_stays_one_argument() {
        let t: CommandTemplate = "-i <url> -f mpegts pipe:".parse().unwrap();
        let args = t.render(&StreamInput {
            url: "http://src/a b",
            proxy: None,
            timeout: Duration::from_secs(1),
        });
        assert_eq!(args, vec!["-i", "http://src/a b", "-f", "mpegts", "pipe:"]);
    }

    #[test]
    fn template_requires_url() {
        assert_eq!("-f mpegts pipe:".parse::<CommandTemplate>(), Err(TemplateError::MissingUrl));
        assert_eq!("   ".parse::<CommandTemplate>(), Err(TemplateError::Empty));
    }

    #[test]
    fn web_args_are_fixed_fragmented_mp4() {
        let args = web_args(&input(None));
        assert!(args.windows(2).any(|w| w == ["-movflags", "frag_keyframe+empty_moov"]));
        assert!(args.windows(2).any(|w| w == ["-vcodec", "copy"]));
        assert!(!args.iter().any(|a| a == "-http_proxy"));
        let with_proxy = web_args(&input(Some("http://p")));
        assert_eq!(&with_proxy[3..5], &["-http_proxy".to_string(), "http://p".to_string()]);
    }

    #[test]
    fn hls_args_follow_segment_type() {
        let dir = Path::new("/tmp/x");
        let ts = hls_args(&input(None), SegmentType::Mpegts, 4, 6, dir, "stream.m3u8");
        assert!(ts.iter().any(|a| a.ends_with("seg_%03d.ts")));
        assert!(ts.iter().any(|a| a.contains("program_date_time")));
        assert!(!ts.iter().any(|a| a == "-hls_fmp4_init_filename"));
        assert_eq!(ts.last().map(String::as_str), Some("/tmp/x/stream.m3u8"));

        let fmp4 = hls_args(&input(None), SegmentType::Fmp4, 2, 10, dir, "stream.m3u8");
        assert!(fmp4.iter().any(|a| a.ends_with("seg_%03d.m4s")));
        assert!(fmp4.windows(2).any(|w| w == ["-hls_time", "2"]));
        assert!(fmp4.windows(2).any(|w| w == ["-hls_fmp4_init_filename", "init.mp4"]));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_ring_keeps_last_lines() {
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "i=0; while [ $i -lt 60 ]; do echo line$i >&2; i=$((i+1)); done"])
            .stderr(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let ring = StderrRing::capture(child.stderr.take().unwrap(), "test".into());
        child.wait().await.unwrap();

        let mut tail = String::new();
        for _ in 0..50 {
            tail = ring.tail().await;
            if tail.ends_with("line59") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let lines: Vec<&str> = tail.lines().collect();
        assert_eq!(lines.len(), STDERR_RING_LINES);
        assert_eq!(lines[0], "line10");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_child_stops_a_running_process() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        terminate_child(&mut child, "sleep").await;
        assert!(child.try_wait().unwrap().is_some());
        // Second call on an exited child is a no-op.
        terminate_child(&mut child, "sleep").await;
    }
}
