use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context as _};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::engine::{ReadySession, SessionEngine};
use crate::mac::MacAddress;
use crate::occupancy::{OccupancyGuard, ViewerInfo};
use crate::transcoder::{terminate_child, web_args, CommandTemplate, FfmpegInvocation, StderrRing, StreamInput};

const CHUNK_SIZE: usize = 1024;
const CHANNEL_DEPTH: usize = 64;
const EXIT_WAIT: Duration = Duration::from_secs(5);
const BANDWIDTH_LOG_EVERY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Fixed fragmented-MP4 arguments a browser `<video>` can play.
    Web,
    /// The operator's command template.
    Player,
}

/// Runs one ffmpeg per viewer and relays its stdout.
pub struct StreamSupervisor {
    engine: Arc<SessionEngine>,
    ffmpeg_path: String,
    template: CommandTemplate,
    timeout: Duration,
}

impl StreamSupervisor {
    pub fn new(
        engine: Arc<SessionEngine>,
        ffmpeg_path: impl Into<String>,
        template: CommandTemplate,
        timeout: Duration,
    ) -> Self {
        Self {
            engine,
            ffmpeg_path: ffmpeg_path.into(),
            template,
            timeout,
        }
    }

    pub fn invocation(&self, session: &ReadySession, mode: OutputMode) -> FfmpegInvocation {
        let input = StreamInput {
            url: &session.link,
            proxy: session.portal.proxy(),
            timeout: self.timeout,
        };
        let args = match mode {
            OutputMode::Web => web_args(&input),
            OutputMode::Player => self.template.render(&input),
        };
        FfmpegInvocation {
            program: self.ffmpeg_path.clone(),
            args,
        }
    }

    pub fn start(
        &self,
        session: ReadySession,
        viewer: ViewerInfo,
        mode: OutputMode,
    ) -> anyhow::Result<SupervisedStream> {
        let invocation = self.invocation(&session, mode);
        self.start_with(session, viewer, invocation)
    }

    /// Spawns `invocation` for `session`. The slot becomes a visible occupancy
    /// entry only once the process is running.
    pub fn start_with(
        &self,
        session: ReadySession,
        viewer: ViewerInfo,
        invocation: FfmpegInvocation,
    ) -> anyhow::Result<SupervisedStream> {
        let ReadySession {
            portal,
            channel,
            link,
            reservation,
        } = session;
        let label = format!("portal={} channel={} mac={}", portal.id, channel.id, reservation.mac());
        debug!("Spawning: {} cmd={}", label, invocation);

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", invocation.program))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .map(|s| StderrRing::capture(s, label.clone()))
            .unwrap_or_default();
        let pid = child.id();

        let mac = reservation.mac().clone();
        let guard = reservation.commit(viewer);
        info!("ffmpeg spawned: pid={:?} {} link={}", pid, label, link);

        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let relay = Relay {
            engine: self.engine.clone(),
            portal_id: portal.id.clone(),
            mac: mac.clone(),
            label: label.clone(),
            child,
            guard,
            stderr,
        };
        tokio::spawn(relay.run(stdout, tx));

        Ok(SupervisedStream {
            inner: ReceiverStream::new(rx),
            label,
            mac,
            pid,
            last_log_time: Instant::now(),
            bytes_since_last_log: 0,
        })
    }
}

enum RelayEnd {
    Eof,
    ViewerGone,
    ReadError,
}

/// Owns everything one viewer's process needs torn down.
struct Relay {
    engine: Arc<SessionEngine>,
    portal_id: String,
    mac: MacAddress,
    label: String,
    child: Child,
    guard: OccupancyGuard,
    stderr: StderrRing,
}

impl Relay {
    async fn run(mut self, stdout: ChildStdout, tx: mpsc::Sender<std::io::Result<Bytes>>) {
        let mut chunks = ReaderStream::with_capacity(stdout, CHUNK_SIZE);
        let end = loop {
            tokio::select! {
                _ = tx.closed() => break RelayEnd::ViewerGone,
                chunk = chunks.next() => match chunk {
                    None => break RelayEnd::Eof,
                    Some(Ok(bytes)) => {
                        if tx.send(Ok(bytes)).await.is_err() {
                            break RelayEnd::ViewerGone;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Error reading ffmpeg stdout: {} err={}", self.label, e);
                        let _ = tx.send(Err(e)).await;
                        break RelayEnd::ReadError;
                    }
                },
            }
        };
        drop(tx);

        match end {
            RelayEnd::Eof | RelayEnd::ReadError => self.after_exit().await,
            RelayEnd::ViewerGone => info!("Viewer disconnected: {}", self.label),
        }

        self.guard.release();
        terminate_child(&mut self.child, &self.label).await;
    }

    /// Output ended on its own; a failing exit status sends the MAC to the back.
    async fn after_exit(&mut self) {
        match tokio::time::timeout(EXIT_WAIT, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.stderr.log_exit(&self.label, status).await;
                if !status.success() {
                    self.engine.rotate(&self.portal_id, &self.mac).await;
                }
            }
            Ok(Err(e)) => warn!("ffmpeg wait() failed: {} err={}", self.label, e),
            Err(_) => warn!("ffmpeg closed stdout but kept running: {}", self.label),
        }
    }
}

/// Response body for one viewer. Dropping it stops the process behind it.
pub struct SupervisedStream {
    inner: ReceiverStream<std::io::Result<Bytes>>,
    label: String,
    mac: MacAddress,
    pid: Option<u32>,
    last_log_time: Instant,
    bytes_since_last_log: usize,
}

impl SupervisedStream {
    pub fn mac(&self) -> &MacAddress {
        &self.mac
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Stream for SupervisedStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let res = Pin::new(&mut self.inner).poll_next(cx);
        if let Poll::Ready(Some(Ok(ref bytes))) = res {
            self.bytes_since_last_log += bytes.len();
            let elapsed = self.last_log_time.elapsed();
            if elapsed >= BANDWIDTH_LOG_EVERY {
                let rate_kb = (self.bytes_since_last_log as f64 / elapsed.as_secs_f64()) / 1024.0;
                debug!("Stream bandwidth: {} rate={:.2} KB/s", self.label, rate_kb);
                self.last_log_time = Instant::now();
                self.bytes_since_last_log = 0;
            }
        }
        res
    }
}
