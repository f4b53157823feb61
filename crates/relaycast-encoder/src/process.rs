//! Supervised encoder subprocess sink.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};

use relaycast_audio::AudioFrame;
use relaycast_capture::VideoFrame;
use relaycast_ipc::{InstanceConfig, MediaType, RelayError, SinkKind};

use crate::args::FfmpegArgsBuilder;
use crate::error::EncoderError;
use crate::policy::encoder_params;
use crate::supervisor::{locate_alternate, CrashSupervisor, ExitKind, RecoveryAction};
use crate::{
    EncoderResult, AUDIO_CONNECT_TIMEOUT, INPUT_QUEUE_CAPACITY, TERMINATE_GRACE, WRITE_TIMEOUT,
};

/// Called once when the encoder failed for good.
pub type FatalCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Everything needed to launch the encoder for one instance.
#[derive(Debug, Clone)]
pub struct SubprocessParams {
    pub binary: PathBuf,
    pub working_dir: Option<PathBuf>,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub video: bool,
    pub audio: bool,
    pub format: String,
    pub mode: relaycast_ipc::RateControlMode,
    pub extra_args: String,
    /// Binary used after an illegal-instruction crash; searched on the path
    /// when unset.
    pub alternate: Option<PathBuf>,
    pub write_timeout: Duration,
    pub terminate_grace: Duration,
    pub audio_connect_timeout: Duration,
}

impl From<&InstanceConfig> for SubprocessParams {
    fn from(config: &InstanceConfig) -> Self {
        Self {
            binary: PathBuf::from(&config.encoder.binary),
            working_dir: config.encoder.working_dir.clone(),
            width: config.width,
            height: config.height,
            frame_rate: config.frame_rate,
            sample_rate: config.sample_rate,
            channels: config.channels,
            video: config.encoder.video,
            audio: config.encoder.audio && config.channels > 0,
            format: config.encoder.format.clone(),
            mode: config.encoder.mode,
            extra_args: config.encoder.args.clone(),
            alternate: None,
            write_timeout: WRITE_TIMEOUT,
            terminate_grace: TERMINATE_GRACE,
            audio_connect_timeout: AUDIO_CONNECT_TIMEOUT,
        }
    }
}

impl SubprocessParams {
    fn args(&self, audio_port: Option<u16>) -> EncoderResult<Vec<String>> {
        let mut builder = FfmpegArgsBuilder::new(self.width, self.height, self.frame_rate)
            .with_video(self.video)
            .with_format(self.format.clone())
            .with_params(encoder_params(self.width, self.height, self.frame_rate, self.mode))
            .with_extra_args(&self.extra_args)?;
        if let Some(port) = audio_port {
            builder = builder.with_audio(self.sample_rate, self.channels, port);
        }
        Ok(builder.build())
    }
}

/// Write statistics of a sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkCounters {
    pub video_written: u64,
    pub audio_written: u64,
    /// Writes that failed, timed out or found the input backlogged.
    pub failed: u64,
    /// Frames discarded while an input had no connected encoder.
    pub dropped: u64,
    pub restarts: u64,
}

struct SinkInner {
    accepting: AtomicBool,
    stopping: AtomicBool,
    video_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    audio_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    audio_connected: AtomicBool,
    video_written: AtomicU64,
    audio_written: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    restarts: AtomicU64,
    write_timeout: Duration,
}

impl SinkInner {
    fn new(write_timeout: Duration) -> Self {
        Self {
            accepting: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
            video_tx: Mutex::new(None),
            audio_tx: Mutex::new(None),
            audio_connected: AtomicBool::new(false),
            video_written: AtomicU64::new(0),
            audio_written: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            write_timeout,
        }
    }

    /// Queues a frame for its input without waiting for the write.
    fn enqueue(&self, media: MediaType, data: Bytes) -> bool {
        if !self.accepting.load(Ordering::Acquire) {
            return false;
        }

        let queue = match media {
            MediaType::Video => self.video_tx.lock(),
            MediaType::Audio => self.audio_tx.lock(),
        };
        let Some(tx) = queue.as_ref() else {
            return false;
        };

        match tx.try_send(data) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.write_failed(media, "input backlogged, frame dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Ends the input queues; the writers flush what is queued and close.
    fn close_inputs(&self) {
        self.video_tx.lock().take();
        self.audio_tx.lock().take();
    }

    fn written(&self, media: MediaType) {
        match media {
            MediaType::Video => self.video_written.fetch_add(1, Ordering::Relaxed),
            MediaType::Audio => self.audio_written.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn write_failed(&self, media: MediaType, message: &str) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        let error = RelayError::SinkWriteFailure {
            sink: SinkKind::Subprocess,
            media,
            message: message.to_string(),
        };
        warn!("{}", error);
    }
}

/// Feeds an external encoder process and keeps it alive.
///
/// Every input has its own writer task behind a bounded queue, so a stalled
/// encoder costs dropped frames rather than a blocked caller.
pub struct SubprocessSink {
    inner: Arc<SinkInner>,
    stop_tx: watch::Sender<bool>,
    audio_port: Option<u16>,
    writers: Mutex<Vec<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SubprocessSink {
    /// Launches the encoder.
    ///
    /// Must be called from within a tokio runtime. `on_fatal` fires at most
    /// once, when crash recovery gives up.
    #[instrument(name = "subprocess_start", skip_all, fields(binary = %params.binary.display()))]
    pub async fn start(params: SubprocessParams, on_fatal: FatalCallback) -> EncoderResult<Self> {
        let listener = if params.audio {
            let listener = TcpListener::bind(("127.0.0.1", 0))
                .await
                .map_err(EncoderError::AudioInput)?;
            Some(listener)
        } else {
            None
        };
        let audio_port = match &listener {
            Some(l) => Some(l.local_addr().map_err(EncoderError::AudioInput)?.port()),
            None => None,
        };
        let args = params.args(audio_port)?;

        let child = launch(&params.binary, &params, &args)?;

        let inner = Arc::new(SinkInner::new(params.write_timeout));
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut writers = Vec::new();
        let mut tasks = Vec::new();

        let (stdin_tx, stdin_rx) = mpsc::channel::<ChildStdin>(2);
        if params.video {
            let (tx, rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);
            *inner.video_tx.lock() = Some(tx);
            writers.push(tokio::spawn(write_input(inner.clone(), MediaType::Video, rx, stdin_rx)));
        }

        if let Some(listener) = listener {
            let (tx, rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);
            let (stream_tx, stream_rx) = mpsc::channel::<TcpStream>(2);
            *inner.audio_tx.lock() = Some(tx);
            writers.push(tokio::spawn(write_input(inner.clone(), MediaType::Audio, rx, stream_rx)));
            tasks.push(tokio::spawn(accept_audio(
                inner.clone(),
                listener,
                stream_tx,
                params.audio_connect_timeout,
                stop_rx.clone(),
            )));
        }

        let child = attach(child, &stdin_tx).await;

        let supervisor = CrashSupervisor::new(params.binary.clone());
        tasks.push(tokio::spawn(supervise(
            inner.clone(),
            child,
            supervisor,
            params,
            args,
            stdin_tx,
            on_fatal,
            stop_rx,
        )));

        info!("Encoder started");

        Ok(Self {
            inner,
            stop_tx,
            audio_port,
            writers: Mutex::new(writers),
            tasks: Mutex::new(tasks),
        })
    }

    /// Queues one RGBA frame for the video input.
    ///
    /// Returns false if the frame was not accepted. Write failures are logged
    /// and counted, never returned.
    pub fn video(&self, frame: &VideoFrame) -> bool {
        let queued = self.inner.enqueue(MediaType::Video, frame.data.clone());
        if queued {
            trace!(timecode = frame.timecode, "Video frame queued for encoder");
        }
        queued
    }

    /// Queues one interleaved 16-bit audio frame for the audio input.
    pub fn audio(&self, frame: &AudioFrame) -> bool {
        self.inner.enqueue(MediaType::Audio, frame.data.clone())
    }

    /// Loopback port the encoder reads audio from.
    pub fn audio_port(&self) -> Option<u16> {
        self.audio_port
    }

    /// Returns true while writes are accepted.
    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    /// Current write statistics.
    pub fn counters(&self) -> SinkCounters {
        SinkCounters {
            video_written: self.inner.video_written.load(Ordering::Relaxed),
            audio_written: self.inner.audio_written.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            restarts: self.inner.restarts.load(Ordering::Relaxed),
        }
    }

    /// Stops the encoder.
    ///
    /// Rejects new writes, lets the inputs drain and close so the encoder can
    /// flush, sends the termination signal and force-kills after the grace
    /// period. Returns only once the process is gone. Safe to call more than
    /// once.
    #[instrument(name = "subprocess_stop", skip(self))]
    pub async fn stop(&self) {
        self.inner.accepting.store(false, Ordering::Release);
        if self.inner.stopping.swap(true, Ordering::AcqRel) {
            debug!("Encoder already stopping");
        }

        self.inner.close_inputs();
        let writers = std::mem::take(&mut *self.writers.lock());
        for writer in writers {
            let abort = writer.abort_handle();
            if tokio::time::timeout(self.inner.write_timeout, writer).await.is_err() {
                debug!("Encoder input did not drain, closing it");
                abort.abort();
            }
        }

        let _ = self.stop_tx.send(true);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Encoder task failed: {}", e);
                }
            }
        }
        info!("Encoder stopped");
    }
}

impl Drop for SubprocessSink {
    fn drop(&mut self) {
        self.inner.accepting.store(false, Ordering::Release);
        self.inner.stopping.store(true, Ordering::Release);
        self.inner.close_inputs();
        let _ = self.stop_tx.send(true);
        for writer in self.writers.lock().drain(..) {
            writer.abort();
        }
    }
}

fn launch(
    binary: &std::path::Path,
    params: &SubprocessParams,
    args: &[String],
) -> EncoderResult<Child> {
    info!("Launching encoder: {} {}", binary.display(), args.join(" "));

    let mut command = Command::new(binary);
    command
        .args(args)
        .stdin(if params.video {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &params.working_dir {
        command.current_dir(dir);
    }

    command.spawn().map_err(|source| EncoderError::Spawn {
        binary: binary.display().to_string(),
        source,
    })
}

/// Wires a freshly launched child to the video writer and diagnostics.
async fn attach(mut child: Child, stdin_tx: &mpsc::Sender<ChildStdin>) -> Child {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(log_lines(stdout, "stdout"));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(log_lines(stderr, "stderr"));
    }
    if let Some(stdin) = child.stdin.take() {
        if stdin_tx.send(stdin).await.is_err() {
            debug!("Video writer gone, encoder stdin dropped");
        }
    }
    child
}

/// Accepts encoder connections to the audio input until the sink stops.
///
/// A relaunched encoder connects again and replaces the previous stream.
async fn accept_audio(
    inner: Arc<SinkInner>,
    listener: TcpListener,
    streams: mpsc::Sender<TcpStream>,
    connect_timeout: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = tokio::time::timeout(connect_timeout, listener.accept()) => match accepted {
                Ok(Ok((stream, peer))) => {
                    let _ = stream.set_nodelay(true);
                    debug!("Encoder audio input connected from {}", peer);
                    if streams.send(stream).await.is_err() {
                        return;
                    }
                }
                Ok(Err(e)) => {
                    warn!("Encoder audio input accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(_) => {
                    if !inner.audio_connected.load(Ordering::Acquire)
                        && !inner.stopping.load(Ordering::Acquire)
                    {
                        inner.write_failed(MediaType::Audio, "encoder has not connected to its audio input");
                    }
                }
            },
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    return;
                }
            }
        }
    }
}

/// Writes queued frames to whatever input the current encoder process
/// exposes. Ends when the queue is closed.
async fn write_input<W>(
    inner: Arc<SinkInner>,
    media: MediaType,
    mut frames: mpsc::Receiver<Bytes>,
    mut inputs: mpsc::Receiver<W>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut input: Option<W> = None;

    loop {
        tokio::select! {
            biased;

            Some(next) = inputs.recv() => {
                if input.replace(next).is_some() {
                    debug!(?media, "Encoder input replaced");
                }
                set_connected(&inner, media, true);
            }
            data = frames.recv() => {
                let Some(data) = data else {
                    break;
                };
                match input.as_mut() {
                    Some(writer) => {
                        if !write_frame(&inner, media, writer, &data).await {
                            input = None;
                            set_connected(&inner, media, false);
                        }
                    }
                    None => {
                        inner.dropped.fetch_add(1, Ordering::Relaxed);
                        trace!(?media, "Encoder input not connected, frame dropped");
                    }
                }
            }
        }
    }

    if let Some(mut writer) = input {
        let _ = writer.shutdown().await;
    }
    set_connected(&inner, media, false);
}

fn set_connected(inner: &SinkInner, media: MediaType, connected: bool) {
    if media == MediaType::Audio {
        inner.audio_connected.store(connected, Ordering::Release);
    }
}

/// Writes one whole frame. Returns false if the input is unusable.
///
/// A write over the timeout is reported but still completed, so the raw
/// stream never carries a partial frame.
async fn write_frame<W>(inner: &SinkInner, media: MediaType, writer: &mut W, data: &[u8]) -> bool
where
    W: AsyncWrite + Unpin,
{
    let write = writer.write_all(data);
    tokio::pin!(write);

    match tokio::time::timeout(inner.write_timeout, &mut write).await {
        Ok(Ok(())) => {
            inner.written(media);
            true
        }
        Ok(Err(e)) => {
            inner.write_failed(media, &e.to_string());
            false
        }
        Err(_) => {
            inner.write_failed(media, "timed out");
            match write.await {
                Ok(()) => true,
                Err(e) => {
                    inner.write_failed(media, &e.to_string());
                    false
                }
            }
        }
    }
}

async fn log_lines<R: AsyncRead + Unpin>(reader: R, stream: &'static str) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if !line.is_empty() {
            debug!(target: "relaycast_encoder::ffmpeg", "{}: {}", stream, line);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    inner: Arc<SinkInner>,
    mut child: Child,
    mut supervisor: CrashSupervisor,
    params: SubprocessParams,
    args: Vec<String>,
    stdin_tx: mpsc::Sender<ChildStdin>,
    on_fatal: FatalCallback,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            status = child.wait() => {
                if inner.stopping.load(Ordering::Acquire) {
                    debug!("Encoder exited during stop");
                    return;
                }

                let exit = status.map(ExitKind::from_status).unwrap_or(ExitKind::Unknown);
                let alternate = params.alternate.clone();
                let locate = |current: &std::path::Path| alternate.or_else(|| locate_alternate(current));

                let message = match supervisor.on_unexpected_exit(exit, locate) {
                    RecoveryAction::Restart(binary) => {
                        match launch(&binary, &params, &args) {
                            Ok(next) => {
                                child = attach(next, &stdin_tx).await;
                                inner.restarts.fetch_add(1, Ordering::Relaxed);
                                info!("Encoder restarted with {}", binary.display());
                                continue;
                            }
                            Err(e) => e.to_string(),
                        }
                    }
                    RecoveryAction::Fatal(message) => message,
                };

                inner.accepting.store(false, Ordering::Release);
                inner.close_inputs();
                error!("Encoder failed: {}", message);
                on_fatal(message);
                return;
            }
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    terminate(&mut child, params.terminate_grace).await;
                    return;
                }
            }
        }
    }
}

/// Graceful termination signal, bounded wait, then forced kill.
async fn terminate(child: &mut Child, grace: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!("Encoder already exited: {}", ExitKind::from_status(status));
        return;
    }

    signal_terminate(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!("Encoder exited: {}", ExitKind::from_status(status)),
        Ok(Err(e)) => warn!("Failed to wait for encoder: {}", e),
        Err(_) => {
            warn!("Encoder did not exit within {:?}, killing", grace);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill encoder: {}", e);
            }
        }
    }
}

#[cfg(unix)]
fn signal_terminate(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: plain signal delivery to a child we spawned and have not reaped.
        let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if result != 0 {
            warn!("Failed to signal encoder: {}", std::io::Error::last_os_error());
        }
    }
}

#[cfg(not(unix))]
fn signal_terminate(_child: &Child) {}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use relaycast_audio::SampleFormat;
    use relaycast_capture::PixelFormat;
    use tokio::io::AsyncReadExt;

    fn params(binary: &str) -> SubprocessParams {
        let config = InstanceConfig {
            title: "t".to_string(),
            source: "s".to_string(),
            subprocess: true,
            channels: 0,
            ..Default::default()
        };
        let mut params = SubprocessParams::from(&config);
        params.binary = PathBuf::from(binary);
        params.terminate_grace = Duration::from_millis(500);
        params
    }

    fn frame_of(data: Bytes) -> VideoFrame {
        VideoFrame {
            width: 1,
            height: 1,
            timecode: 1,
            frame_rate_n: 30_000,
            frame_rate_d: 1000,
            aspect_ratio: 1.0,
            format: PixelFormat::Rgba,
            stride: 4,
            data,
        }
    }

    fn frame() -> VideoFrame {
        frame_of(Bytes::from_static(&[0, 0, 0, 255]))
    }

    fn collect_fatal() -> (FatalCallback, Arc<SyncMutex<Vec<String>>>) {
        let messages = Arc::new(SyncMutex::new(Vec::new()));
        let sink_messages = messages.clone();
        let on_fatal: FatalCallback = Arc::new(move |m| sink_messages.lock().push(m));
        (on_fatal, messages)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[cfg(unix)]
    fn script(name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = std::env::temp_dir().join(format!("relaycast-{}-{}", std::process::id(), name));
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_params_from_config() {
        let config = InstanceConfig {
            channels: 2,
            ..Default::default()
        };
        let params = SubprocessParams::from(&config);
        assert!(params.audio);
        assert_eq!(params.binary, PathBuf::from("ffmpeg"));
        assert_eq!(params.alternate, None);

        let args = params.args(Some(1234)).unwrap();
        assert!(args.contains(&"tcp://127.0.0.1:1234".to_string()));
    }

    #[tokio::test]
    async fn test_missing_binary_fails_to_start() {
        let on_fatal: FatalCallback = Arc::new(|_| {});
        let result = SubprocessSink::start(params("/nonexistent/relaycast-encoder"), on_fatal).await;
        assert!(matches!(result, Err(EncoderError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unexpected_exit_is_fatal_once() {
        let (on_fatal, messages) = collect_fatal();
        let sink = SubprocessSink::start(params("false"), on_fatal).await.unwrap();

        assert!(wait_until(|| !sink.is_accepting()).await);
        assert!(!sink.video(&frame()));
        assert_eq!(messages.lock().len(), 1);

        sink.stop().await;
        sink.stop().await;
        assert_eq!(messages.lock().len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_terminates_running_encoder() {
        let (on_fatal, messages) = collect_fatal();
        // `yes` ignores its arguments and runs until signalled.
        let sink = SubprocessSink::start(params("yes"), on_fatal).await.unwrap();

        assert!(sink.video(&frame()));
        assert!(wait_until(|| sink.counters().video_written == 1).await);
        assert!(sink.is_accepting());

        tokio::time::timeout(Duration::from_secs(5), sink.stop())
            .await
            .unwrap();
        assert!(!sink.is_accepting());
        assert!(!sink.video(&frame()));
        assert!(messages.lock().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_timeout_keeps_encoder_running() {
        let (on_fatal, messages) = collect_fatal();
        let mut params = params("yes");
        params.write_timeout = Duration::from_millis(100);
        // `yes` never reads its input, so a frame larger than the pipe stalls.
        let sink = SubprocessSink::start(params, on_fatal).await.unwrap();
        let big = frame_of(Bytes::from(vec![0u8; 1 << 20]));

        assert!(sink.video(&big));
        assert!(wait_until(|| sink.counters().failed >= 1).await);

        // The caller is never blocked: excess frames are rejected at once.
        let accepted = (0..INPUT_QUEUE_CAPACITY + 2)
            .filter(|_| sink.video(&big))
            .count();
        assert!(accepted <= INPUT_QUEUE_CAPACITY);
        assert!(sink.counters().failed >= 2);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(sink.is_accepting());
        assert!(messages.lock().is_empty());

        tokio::time::timeout(Duration::from_secs(5), sink.stop())
            .await
            .unwrap();
        assert!(messages.lock().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_illegal_instruction_restarts_with_alternate() {
        let crashing = script("crash", "kill -ILL $$");
        let alternate = script("alternate", "exec cat > /dev/null");
        let (on_fatal, messages) = collect_fatal();

        let mut params = params(crashing.to_str().unwrap());
        params.alternate = Some(alternate.clone());
        let sink = SubprocessSink::start(params, on_fatal).await.unwrap();

        assert!(wait_until(|| sink.counters().restarts == 1).await);
        assert!(sink.is_accepting());

        assert!(sink.video(&frame()));
        assert!(wait_until(|| sink.counters().video_written >= 1).await);
        assert!(messages.lock().is_empty());

        tokio::time::timeout(Duration::from_secs(5), sink.stop())
            .await
            .unwrap();
        assert!(messages.lock().is_empty());
        assert_eq!(sink.counters().restarts, 1);

        let _ = std::fs::remove_file(crashing);
        let _ = std::fs::remove_file(alternate);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_audio_input_accepts_reconnect() {
        let (on_fatal, messages) = collect_fatal();
        let mut params = params("yes");
        params.channels = 2;
        params.audio = true;
        params.audio_connect_timeout = Duration::from_millis(200);
        let sink = SubprocessSink::start(params, on_fatal).await.unwrap();
        let port = sink.audio_port().unwrap();

        // A missing connection is reported, and accepting goes on.
        assert!(wait_until(|| sink.counters().failed >= 1).await);

        let audio = AudioFrame::from_pcm(&[1, -1, 2, -2], SampleFormat::S16Interleaved, 48_000, 2, 1)
            .unwrap();

        for _ in 0..2 {
            let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;

            assert!(sink.audio(&audio));
            let mut received = vec![0u8; audio.data.len()];
            tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut received))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&received[..], &audio.data[..]);
        }
        assert_eq!(sink.counters().audio_written, 2);

        tokio::time::timeout(Duration::from_secs(5), sink.stop())
            .await
            .unwrap();
        assert!(messages.lock().is_empty());
    }
}
