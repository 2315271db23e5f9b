//! IPC between the workspace daemon and its views via Unix sockets
//!
//! Every message is a length-prefixed JSON frame (u32 little-endian length,
//! then the payload). Framing and decoding are separate steps so a frame
//! that fails to decode can be logged and skipped without losing sync.

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

use crate::constants::app::APP_DIR;
use crate::constants::ipc::{MAX_MESSAGE_SIZE, SOCKET_EXT};
use crate::protocol::{InboundMessage, OutboundMessage};

/// Socket for a workspace (XDG_RUNTIME_DIR with fallback to cache)
pub fn socket_path(workspace_hash: &str) -> Result<PathBuf> {
    let file = format!("{workspace_hash}.{SOCKET_EXT}");
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return Ok(PathBuf::from(runtime_dir).join(APP_DIR).join(file));
    }

    let cache = dirs::cache_dir()
        .context("Failed to determine cache directory (no XDG_RUNTIME_DIR or HOME)")?;
    Ok(cache.join(APP_DIR).join(file))
}

/// Daemon side of one view connection
pub struct ViewConnection {
    stream: UnixStream,
}

impl ViewConnection {
    /// Independent handle for a writer, so reads and writes can live on
    /// different threads
    pub fn try_clone(&self) -> Result<Self> {
        let stream = self.stream.try_clone().context("Failed to clone view stream")?;
        Ok(Self { stream })
    }

    pub fn send(&mut self, msg: &InboundMessage) -> Result<()> {
        write_message(&mut self.stream, msg)
    }

    /// Next raw frame; `Ok(None)` on a clean disconnect
    pub fn recv_frame(&mut self) -> Result<Option<Vec<u8>>> {
        read_frame(&mut self.stream)
    }

    /// Shut the socket down in both directions; the peer and any reader
    /// blocked on this connection see end of stream
    pub fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// Move writes onto a dedicated thread fed by a queue of `capacity` frames
    ///
    /// A write blocked for longer than `write_timeout` ends the thread. The
    /// connection is closed when the thread ends, whether from a failed
    /// write or because the [`ViewWriter`] was dropped.
    pub fn into_writer(mut self, capacity: usize, write_timeout: Duration) -> Result<ViewWriter> {
        self.stream
            .set_write_timeout(Some(write_timeout))
            .context("Failed to set view write timeout")?;
        let (tx, rx) = mpsc::sync_channel::<InboundMessage>(capacity);
        std::thread::Builder::new()
            .name("view-writer".to_string())
            .spawn(move || {
                for message in rx.iter() {
                    if let Err(e) = self.send(&message) {
                        warn!(error = ?e, "Failed to write to view, closing connection");
                        break;
                    }
                }
                self.close();
            })
            .context("Failed to spawn view writer thread")?;
        Ok(ViewWriter { tx })
    }
}

/// Non-blocking sending half of a view connection
///
/// State messages are split so each object buffer gets its own frame. When
/// the queue is full the view has stopped reading and `send` fails.
pub struct ViewWriter {
    tx: SyncSender<InboundMessage>,
}

impl ViewWriter {
    pub fn send(&self, message: &InboundMessage) -> Result<()> {
        let frames = match message {
            InboundMessage::State(delta) => delta
                .clone()
                .into_frames()
                .into_iter()
                .map(InboundMessage::State)
                .collect(),
            other => vec![other.clone()],
        };
        for frame in frames {
            match self.tx.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => bail!("View is not reading, send queue is full"),
                Err(TrySendError::Disconnected(_)) => bail!("View connection is closed"),
            }
        }
        Ok(())
    }
}

/// View side of a connection
pub struct ViewClient {
    stream: UnixStream,
}

impl ViewClient {
    pub fn connect(workspace_hash: &str) -> Result<Self> {
        let path = socket_path(workspace_hash)?;
        Self::connect_to(&path)
    }

    pub fn connect_to(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .context(format!("Failed to connect to workspace daemon at {}", path.display()))?;
        Ok(Self { stream })
    }

    pub fn send(&mut self, msg: &OutboundMessage) -> Result<()> {
        write_message(&mut self.stream, msg)
    }

    /// Receive the next message from the daemon (blocking)
    pub fn recv(&mut self) -> Result<InboundMessage> {
        let frame = read_frame(&mut self.stream)?
            .ok_or_else(|| anyhow!("Workspace daemon closed the connection"))?;
        serde_json::from_slice(&frame).context("Failed to deserialize message from JSON")
    }

    /// Receive messages until `pick` accepts one
    pub fn recv_until<T>(&mut self, mut pick: impl FnMut(InboundMessage) -> Option<T>) -> Result<T> {
        loop {
            if let Some(found) = pick(self.recv()?) {
                return Ok(found);
            }
        }
    }
}

/// Listening socket of the workspace daemon
pub struct ViewServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl ViewServer {
    pub fn bind(workspace_hash: &str) -> Result<Self> {
        let socket_path = socket_path(workspace_hash)?;
        Self::bind_to(socket_path)
    }

    pub fn bind_to(socket_path: PathBuf) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .context(format!("Failed to create socket directory: {}", parent.display()))?;
        }

        // Remove stale socket if exists
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)
                .context(format!("Failed to remove stale socket: {}", socket_path.display()))?;
        }

        let listener = UnixListener::bind(&socket_path)
            .context(format!("Failed to bind socket at {}", socket_path.display()))?;

        // Owner only
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o700))
                .context("Failed to set socket permissions")?;
        }

        Ok(Self {
            listener,
            socket_path,
        })
    }

    /// Accept incoming connection (blocking)
    pub fn accept(&self) -> Result<ViewConnection> {
        let (stream, _addr) = self.listener.accept().context("Failed to accept IPC connection")?;
        Ok(ViewConnection { stream })
    }

    /// Accept connections on a background thread until the listener fails
    pub fn spawn_accept_loop<F>(&self, mut on_connect: F) -> Result<JoinHandle<()>>
    where
        F: FnMut(ViewConnection) + Send + 'static,
    {
        let listener = self.listener.try_clone().context("Failed to clone listener")?;
        std::thread::Builder::new()
            .name("ipc-accept".to_string())
            .spawn(move || {
                for stream in listener.incoming() {
                    match stream {
                        Ok(stream) => {
                            debug!("View connected");
                            on_connect(ViewConnection { stream });
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to accept view connection");
                            break;
                        }
                    }
                }
            })
            .context("Failed to spawn accept thread")
    }

    pub fn path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for ViewServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Write length-prefixed message to stream
pub fn write_message<W: Write, T: Serialize>(stream: &mut W, msg: &T) -> Result<()> {
    let json = serde_json::to_vec(msg).context("Failed to serialize message to JSON")?;
    if json.len() > MAX_MESSAGE_SIZE {
        return Err(anyhow!(
            "Message too large: {} bytes (max: {})",
            json.len(),
            MAX_MESSAGE_SIZE
        ));
    }

    let len = json.len() as u32;
    stream
        .write_all(&len.to_le_bytes())
        .context("Failed to write message length")?;
    stream
        .write_all(&json)
        .context("Failed to write message payload")?;
    stream.flush().context("Failed to flush stream")?;

    Ok(())
}

/// Read one length-prefixed frame; `Ok(None)` if the peer closed between frames
pub fn read_frame<R: Read>(stream: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("Failed to read message length"),
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    // Sanity check (prevent DoS via huge allocation)
    if len > MAX_MESSAGE_SIZE {
        return Err(anyhow!("Message too large: {} bytes (max: {})", len, MAX_MESSAGE_SIZE));
    }

    let mut json_buf = vec![0u8; len];
    stream
        .read_exact(&mut json_buf)
        .context("Failed to read message payload")?;
    Ok(Some(json_buf))
}

/// Read and decode one message
pub fn read_message<R: Read, T: DeserializeOwned>(stream: &mut R) -> Result<Option<T>> {
    match read_frame(stream)? {
        Some(frame) => serde_json::from_slice(&frame)
            .map(Some)
            .context("Failed to deserialize message from JSON"),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::StateBroadcaster;
    use crate::protocol::{NotifyLevel, ObjectData, StateDelta, WorkspaceState};
    use std::io::{Cursor, ErrorKind};
    use std::time::Instant;
    use tempfile::tempdir;

    #[test]
    fn test_frames_back_to_back() {
        let mut buf = Vec::new();
        write_message(&mut buf, &OutboundMessage::Ready).unwrap();
        write_message(&mut buf, &OutboundMessage::QuickPickUnit).unwrap();

        let mut cursor = Cursor::new(buf);
        let first: Option<OutboundMessage> = read_message(&mut cursor).unwrap();
        let second: Option<OutboundMessage> = read_message(&mut cursor).unwrap();
        let end: Option<OutboundMessage> = read_message(&mut cursor).unwrap();
        assert_eq!(first, Some(OutboundMessage::Ready));
        assert_eq!(second, Some(OutboundMessage::QuickPickUnit));
        assert_eq!(end, None);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = ((MAX_MESSAGE_SIZE + 1) as u32).to_le_bytes().to_vec();
        buf.extend_from_slice(b"{}");
        assert!(read_frame(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn test_truncated_payload_is_error() {
        let mut buf = 10u32.to_le_bytes().to_vec();
        buf.extend_from_slice(b"{}");
        assert!(read_frame(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn test_server_client_exchange() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run/test.sock");
        let server = ViewServer::bind_to(path.clone()).unwrap();

        let mut client = ViewClient::connect_to(&path).unwrap();
        let mut conn = server.accept().unwrap();

        client.send(&OutboundMessage::Ready).unwrap();
        let frame = conn.recv_frame().unwrap().unwrap();
        let msg: OutboundMessage = serde_json::from_slice(&frame).unwrap();
        assert_eq!(msg, OutboundMessage::Ready);

        let mut writer = conn.try_clone().unwrap();
        writer
            .send(&InboundMessage::Notify {
                level: NotifyLevel::Info,
                message: "hello".to_string(),
                action: None,
            })
            .unwrap();
        writer
            .send(&InboundMessage::State(StateDelta {
                build_running: Some(true),
                ..Default::default()
            }))
            .unwrap();
        let running = client
            .recv_until(|msg| match msg {
                InboundMessage::State(delta) => delta.build_running,
                _ => None,
            })
            .unwrap();
        assert!(running);

        drop(client);
        assert!(conn.recv_frame().unwrap().is_none());
    }

    fn object_delta(object: &ObjectData) -> StateDelta {
        StateDelta {
            right_object: Some(Some(object.clone())),
            ..Default::default()
        }
    }

    #[test]
    fn test_stalled_view_is_dropped_without_blocking() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stall.sock");
        let server = ViewServer::bind_to(path.clone()).unwrap();
        let mut client = ViewClient::connect_to(&path).unwrap();
        let writer = server
            .accept()
            .unwrap()
            .into_writer(4, Duration::from_millis(200))
            .unwrap();

        let mut views = StateBroadcaster::default();
        views.attach(1, Box::new(writer));
        views.ready(1);

        // The client never reads, so the socket buffer fills on the first object
        let object = ObjectData::from(vec![0u8; 4 * 1024 * 1024]);
        let start = Instant::now();
        for _ in 0..16 {
            views.publish(object_delta(&object));
        }
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(views.view_count(), 0);

        // Once the blocked write times out the connection is closed
        std::thread::sleep(Duration::from_millis(500));
        client
            .stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let err = loop {
            if let Err(e) = client.recv() {
                break e;
            }
        };
        let kind = err
            .root_cause()
            .downcast_ref::<std::io::Error>()
            .map(|e| e.kind());
        assert!(
            !matches!(kind, Some(ErrorKind::WouldBlock | ErrorKind::TimedOut)),
            "connection was left open: {err:#}"
        );
    }

    #[test]
    fn test_large_objects_reach_reading_view() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("large.sock");
        let server = ViewServer::bind_to(path.clone()).unwrap();
        let mut client = ViewClient::connect_to(&path).unwrap();
        let writer = server
            .accept()
            .unwrap()
            .into_writer(16, Duration::from_secs(30))
            .unwrap();

        let mut views = StateBroadcaster::default();
        views.attach(1, Box::new(writer));
        views.ready(1);

        let object = ObjectData::from(vec![7u8; 25 * 1024 * 1024]);
        views.publish(StateDelta {
            build_running: Some(false),
            left_object: Some(Some(object.clone())),
            right_object: Some(Some(object.clone())),
            ..Default::default()
        });
        assert_eq!(views.view_count(), 1);

        let mut mirror = WorkspaceState::default();
        let mut frames = 0;
        while frames < 4 {
            if let InboundMessage::State(delta) = client.recv().unwrap() {
                mirror.apply(delta);
                frames += 1;
            }
        }
        assert_eq!(mirror.left_object.as_ref().map(ObjectData::len), Some(object.len()));
        assert_eq!(mirror.right_object.as_ref().map(ObjectData::len), Some(object.len()));
    }

    #[test]
    fn test_dropping_writer_closes_connection() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("close.sock");
        let server = ViewServer::bind_to(path.clone()).unwrap();
        let mut client = ViewClient::connect_to(&path).unwrap();
        let writer = server
            .accept()
            .unwrap()
            .into_writer(4, Duration::from_secs(5))
            .unwrap();

        writer
            .send(&InboundMessage::Clipboard {
                text: "foo".to_string(),
            })
            .unwrap();
        drop(writer);

        assert_eq!(
            client.recv().unwrap(),
            InboundMessage::Clipboard {
                text: "foo".to_string()
            }
        );
        assert!(client.recv().is_err());
    }

    #[test]
    fn test_server_drop_removes_socket() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.sock");
        std::fs::write(&path, b"stale").unwrap();
        let server = ViewServer::bind_to(path.clone()).unwrap();
        assert!(path.exists());
        drop(server);
        assert!(!path.exists());
    }
}
