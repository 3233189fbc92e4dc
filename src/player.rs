use std::fs::OpenOptions;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use once_cell::sync::OnceCell;
use serde_json::json;

#[cfg(any(unix, target_os = "windows"))]
use rand::{distributions::Alphanumeric, Rng};
#[cfg(unix)]
use std::io::{BufRead, BufReader};
#[cfg(unix)]
use std::os::unix::net::UnixStream;

use crate::archive::{MediaKind, Post};

fn player_debug_enabled() -> bool {
    static FLAG: OnceCell<bool> = OnceCell::new();
    *FLAG.get_or_init(|| {
        std::env::var("ARCHFEED_DEBUG_PLAYER")
            .map(|val| {
                let trimmed = val.trim();
                !(trimmed.is_empty()
                    || trimmed.eq_ignore_ascii_case("0")
                    || trimmed.eq_ignore_ascii_case("false")
                    || trimmed.eq_ignore_ascii_case("no")
                    || trimmed.eq_ignore_ascii_case("off"))
            })
            .unwrap_or(false)
    })
}

fn player_debug_writer() -> Option<&'static Mutex<std::fs::File>> {
    static WRITER: OnceCell<Option<Mutex<std::fs::File>>> = OnceCell::new();
    WRITER
        .get_or_init(|| {
            std::env::var("ARCHFEED_DEBUG_PLAYER_LOG")
                .ok()
                .and_then(|path| {
                    OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)
                        .map(Mutex::new)
                        .ok()
                })
        })
        .as_ref()
}

pub fn debug_log(message: impl AsRef<str>) {
    if !player_debug_enabled() {
        return;
    }
    if let Some(writer) = player_debug_writer() {
        if let Ok(mut file) = writer.lock() {
            let _ = writeln!(file, "{}", message.as_ref());
            return;
        }
    }
    eprintln!("{}", message.as_ref());
}

#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    /// The runtime declined to start playback on its own. Not a failure:
    /// the slot keeps its resource and offers a manual start.
    #[error("playback denied by the runtime")]
    Denied,
    #[error("decode failure: {0}")]
    Decode(String),
    #[error("player spawn failed: {0}")]
    Spawn(String),
}

/// Resolved playback target for one slot: the archived file when the
/// download finished, the raw source URL otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSource {
    pub location: String,
    pub label: String,
    pub archived: bool,
}

fn sanitize_url(raw: &str) -> String {
    raw.trim().replace("&amp;", "&")
}

/// Picks the playback source for a post's first video item. Returns `None`
/// when the post has no video, or when its video has neither an archived
/// path nor a usable source URL, in which case the slot must render a
/// pending affordance instead of an empty player.
pub fn playback_source(post: &Post) -> Option<MediaSource> {
    let mut videos: Vec<_> = post
        .media_items
        .iter()
        .filter(|item| item.media_type == MediaKind::Video)
        .collect();
    videos.sort_by_key(|item| item.position);
    let item = videos.first()?;

    let label = if post.title.trim().is_empty() {
        "Archived video".to_string()
    } else {
        post.title.trim().to_string()
    };

    if item.downloaded {
        if let Some(path) = item.download_path.as_deref() {
            if !path.trim().is_empty() {
                return Some(MediaSource {
                    location: path.trim().to_string(),
                    label,
                    archived: true,
                });
            }
        }
    }

    let url = sanitize_url(&item.url);
    if url.is_empty() {
        return None;
    }
    Some(MediaSource {
        location: url,
        label,
        archived: false,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerEventKind {
    /// Enough data buffered to start playback without stalling.
    Buffered,
    /// Autonomous playback was declined after buffering completed.
    Denied,
    /// Genuine decode or transport failure.
    Failed,
}

/// Completion signal from a decode resource. `serial` identifies the exact
/// player instance so stale continuations can be dropped after eviction.
#[derive(Debug, Clone)]
pub struct PlayerEvent {
    pub slot: String,
    pub serial: u64,
    pub kind: PlayerEventKind,
    pub detail: Option<String>,
}

/// Creates decode resources. The lifecycle manager owns exactly one handle
/// per slot and releases it on eviction.
pub trait PlayerBackend: Send {
    fn create(
        &mut self,
        slot: &str,
        source: &MediaSource,
        serial: u64,
        events: Sender<PlayerEvent>,
    ) -> Result<Box<dyn PlayerHandle>, PlayerError>;
}

pub trait PlayerHandle: Send {
    fn resume(&mut self) -> Result<(), PlayerError>;
    fn pause(&mut self) -> Result<(), PlayerError>;
    fn set_muted(&mut self, muted: bool) -> Result<(), PlayerError>;
    fn seek_start(&mut self) -> Result<(), PlayerError>;
    /// Releases the underlying resource. Must be safe to call exactly once;
    /// the manager guarantees it never calls it twice.
    fn stop(self: Box<Self>);
}

#[derive(Clone, Copy)]
enum IpcCommand {
    SetPause(bool),
    SetMute(bool),
    SeekStart,
}

fn command_payload(command: IpcCommand) -> serde_json::Value {
    match command {
        IpcCommand::SetPause(paused) => json!(["set_property", "pause", paused]),
        IpcCommand::SetMute(muted) => json!(["set_property", "mute", muted]),
        IpcCommand::SeekStart => json!(["seek", 0, "absolute"]),
    }
}

fn send_ipc_command(path: &str, command: IpcCommand) -> Result<(), PlayerError> {
    let payload = json!({ "command": command_payload(command) });
    let serialized = serde_json::to_string(&payload)
        .map_err(|err| PlayerError::Decode(format!("serialize mpv command: {err}")))?;
    send_ipc_command_inner(path, &serialized)
}

#[cfg(unix)]
fn send_ipc_command_inner(path: &str, serialized: &str) -> Result<(), PlayerError> {
    let mut stream = UnixStream::connect(path)
        .map_err(|err| PlayerError::Decode(format!("connect mpv ipc socket {path}: {err}")))?;
    stream
        .write_all(serialized.as_bytes())
        .and_then(|_| stream.write_all(b"\n"))
        .map_err(|err| PlayerError::Decode(format!("write mpv ipc command: {err}")))
}

#[cfg(target_os = "windows")]
fn send_ipc_command_inner(path: &str, serialized: &str) -> Result<(), PlayerError> {
    use std::io::ErrorKind;

    const PIPE_RETRIES: usize = 5;
    const PIPE_RETRY_DELAY: Duration = Duration::from_millis(100);

    for attempt in 0..PIPE_RETRIES {
        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(mut pipe) => {
                pipe.write_all(serialized.as_bytes())
                    .and_then(|_| pipe.write_all(b"\n"))
                    .map_err(|err| {
                        PlayerError::Decode(format!("write mpv ipc command to {path}: {err}"))
                    })?;
                let _ = pipe.flush();
                return Ok(());
            }
            Err(err) if err.kind() == ErrorKind::NotFound && attempt + 1 < PIPE_RETRIES => {
                thread::sleep(PIPE_RETRY_DELAY);
            }
            Err(err) => {
                return Err(PlayerError::Decode(format!(
                    "connect mpv ipc pipe {path}: {err}"
                )))
            }
        }
    }

    Err(PlayerError::Decode(format!("connect mpv ipc pipe {path}")))
}

#[cfg(all(not(unix), not(target_os = "windows")))]
fn send_ipc_command_inner(_path: &str, _serialized: &str) -> Result<(), PlayerError> {
    Err(PlayerError::Denied)
}

#[cfg(unix)]
fn unique_ipc_path() -> Option<String> {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    let mut path = std::env::temp_dir();
    path.push(format!("archfeed-mpv-{}-{suffix}.sock", std::process::id()));
    Some(path.to_string_lossy().to_string())
}

#[cfg(target_os = "windows")]
fn unique_ipc_path() -> Option<String> {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    Some(format!(
        r"\\.\pipe\archfeed-mpv-{}-{suffix}",
        std::process::id()
    ))
}

#[cfg(all(not(unix), not(target_os = "windows")))]
fn unique_ipc_path() -> Option<String> {
    None
}

#[cfg(unix)]
fn cleanup_ipc_path(path: &str) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound && player_debug_enabled() {
            debug_log(format!("failed to remove mpv ipc path {path}: {err}"));
        }
    }
}

#[cfg(not(unix))]
fn cleanup_ipc_path(_path: &str) {}

/// Spawns one `mpv` process per admitted slot: paused, muted, looping, with
/// an IPC socket for control. Readiness and failure are reported through
/// the event channel once mpv loads the file.
pub struct MpvBackend {
    mpv_path: String,
}

impl MpvBackend {
    pub fn new(mpv_path: impl Into<String>) -> Self {
        Self {
            mpv_path: mpv_path.into(),
        }
    }
}

impl PlayerBackend for MpvBackend {
    fn create(
        &mut self,
        slot: &str,
        source: &MediaSource,
        serial: u64,
        events: Sender<PlayerEvent>,
    ) -> Result<Box<dyn PlayerHandle>, PlayerError> {
        let ipc_path =
            unique_ipc_path().ok_or(PlayerError::Denied)?;
        #[cfg(unix)]
        cleanup_ipc_path(&ipc_path);

        let mut args = vec![
            source.location.clone(),
            format!("--input-ipc-server={ipc_path}"),
            "--pause".to_string(),
            "--mute=yes".to_string(),
            "--loop-file=inf".to_string(),
            "--keep-open=yes".to_string(),
            "--force-window=yes".to_string(),
            "--really-quiet".to_string(),
            "--no-config".to_string(),
            "--ytdl=no".to_string(),
            "--osc=no".to_string(),
            "--osd-level=0".to_string(),
        ];
        if !source.label.is_empty() {
            args.push(format!("--force-media-title={}", source.label));
        }

        debug_log(format!(
            "spawning mpv slot={slot} serial={serial} source={} ipc={ipc_path}",
            source.location
        ));

        let mut command = Command::new(&self.mpv_path);
        for arg in &args {
            command.arg(arg);
        }
        command.stdin(Stdio::null());
        command.stdout(Stdio::null());
        command.stderr(Stdio::null());

        let child = command
            .spawn()
            .map_err(|err| PlayerError::Spawn(format!("launch {}: {err}", self.mpv_path)))?;

        let (kill_tx, kill_rx) = bounded::<()>(1);
        let slot_name = slot.to_string();
        let ipc_for_thread = ipc_path.clone();
        let supervisor = thread::spawn(move || {
            supervise(
                child,
                slot_name,
                serial,
                ipc_for_thread,
                events,
                kill_rx,
            );
        });

        Ok(Box::new(MpvPlayer {
            ipc_path,
            kill_tx,
            supervisor: Some(supervisor),
        }))
    }
}

fn supervise(
    mut child: std::process::Child,
    slot: String,
    serial: u64,
    ipc_path: String,
    events: Sender<PlayerEvent>,
    kill_rx: crossbeam_channel::Receiver<()>,
) {
    let mut reported = wait_for_load(&slot, serial, &ipc_path, &events, &kill_rx, &mut child);

    loop {
        if kill_rx.try_recv().is_ok() {
            let _ = child.kill();
            let _ = child.wait();
            break;
        }
        match child.try_wait() {
            Ok(Some(status)) => {
                debug_log(format!(
                    "mpv slot={slot} exited with status {:?}",
                    status.code()
                ));
                if !reported {
                    let _ = events.send(PlayerEvent {
                        slot: slot.clone(),
                        serial,
                        kind: PlayerEventKind::Failed,
                        detail: Some(format!("mpv exited: {:?}", status.code())),
                    });
                    reported = true;
                }
                break;
            }
            Ok(None) => thread::sleep(Duration::from_millis(30)),
            Err(err) => {
                debug_log(format!("mpv slot={slot} poll error: {err}"));
                break;
            }
        }
    }
    cleanup_ipc_path(&ipc_path);
}

/// Blocks until mpv reports `file-loaded` on the IPC socket, then emits
/// `Buffered`. Returns true once a terminal event has been sent. There is
/// deliberately no timeout here: a stalled load stays in Loading until the
/// slot is evicted.
#[cfg(unix)]
fn wait_for_load(
    slot: &str,
    serial: u64,
    ipc_path: &str,
    events: &Sender<PlayerEvent>,
    kill_rx: &crossbeam_channel::Receiver<()>,
    child: &mut std::process::Child,
) -> bool {
    let stream = loop {
        if kill_rx.try_recv().is_ok() {
            let _ = child.kill();
            let _ = child.wait();
            return true;
        }
        if let Ok(Some(_)) = child.try_wait() {
            let _ = events.send(PlayerEvent {
                slot: slot.to_string(),
                serial,
                kind: PlayerEventKind::Failed,
                detail: Some("mpv exited before the ipc socket came up".into()),
            });
            return true;
        }
        match UnixStream::connect(ipc_path) {
            Ok(stream) => break stream,
            Err(_) => thread::sleep(Duration::from_millis(50)),
        }
    };

    let reader = BufReader::new(stream);
    for line in reader.lines().map_while(Result::ok) {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) else {
            continue;
        };
        match value.get("event").and_then(|e| e.as_str()) {
            Some("file-loaded") => {
                let _ = events.send(PlayerEvent {
                    slot: slot.to_string(),
                    serial,
                    kind: PlayerEventKind::Buffered,
                    detail: None,
                });
                return true;
            }
            Some("end-file") => {
                let reason = value
                    .get("reason")
                    .and_then(|r| r.as_str())
                    .unwrap_or("unknown");
                if reason == "error" {
                    let detail = value
                        .get("file_error")
                        .and_then(|e| e.as_str())
                        .unwrap_or("playback failed")
                        .to_string();
                    let _ = events.send(PlayerEvent {
                        slot: slot.to_string(),
                        serial,
                        kind: PlayerEventKind::Failed,
                        detail: Some(detail),
                    });
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}

/// Named pipes offer no event stream worth parsing here; first successful
/// command connection stands in for readiness.
#[cfg(not(unix))]
fn wait_for_load(
    slot: &str,
    serial: u64,
    ipc_path: &str,
    events: &Sender<PlayerEvent>,
    kill_rx: &crossbeam_channel::Receiver<()>,
    child: &mut std::process::Child,
) -> bool {
    loop {
        if kill_rx.try_recv().is_ok() {
            let _ = child.kill();
            let _ = child.wait();
            return true;
        }
        if let Ok(Some(_)) = child.try_wait() {
            let _ = events.send(PlayerEvent {
                slot: slot.to_string(),
                serial,
                kind: PlayerEventKind::Failed,
                detail: Some("mpv exited before the ipc pipe came up".into()),
            });
            return true;
        }
        if send_ipc_command(ipc_path, IpcCommand::SetMute(true)).is_ok() {
            let _ = events.send(PlayerEvent {
                slot: slot.to_string(),
                serial,
                kind: PlayerEventKind::Buffered,
                detail: None,
            });
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

struct MpvPlayer {
    ipc_path: String,
    kill_tx: Sender<()>,
    supervisor: Option<thread::JoinHandle<()>>,
}

impl PlayerHandle for MpvPlayer {
    fn resume(&mut self) -> Result<(), PlayerError> {
        send_ipc_command(&self.ipc_path, IpcCommand::SetPause(false))
    }

    fn pause(&mut self) -> Result<(), PlayerError> {
        send_ipc_command(&self.ipc_path, IpcCommand::SetPause(true))
    }

    fn set_muted(&mut self, muted: bool) -> Result<(), PlayerError> {
        send_ipc_command(&self.ipc_path, IpcCommand::SetMute(muted))
    }

    fn seek_start(&mut self) -> Result<(), PlayerError> {
        send_ipc_command(&self.ipc_path, IpcCommand::SeekStart)
    }

    fn stop(mut self: Box<Self>) {
        let _ = self.kill_tx.send(());
        if let Some(handle) = self.supervisor.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MpvPlayer {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            let _ = self.kill_tx.send(());
            let _ = handle.join();
        }
    }
}
