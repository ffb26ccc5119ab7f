//! IPC (Inter-Process Communication) via Unix sockets
//!
//! A newly launched delegate hands its flag field to the running owner over
//! a Unix domain socket. Each connection carries exactly one request and one
//! reply, both length-prefixed JSON.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub mod flags;
mod messages;
pub use flags::{FlagOverrides, IpcFlags};
pub use messages::{Envelope, Reply, Request};

use crate::constants::app;
use crate::constants::ipc::{DELIVERY_TIMEOUT, MAX_MESSAGE_SIZE};

/// Get default runtime directory (XDG_RUNTIME_DIR with fallback to cache)
pub fn default_runtime_dir() -> Result<PathBuf> {
    runtime_dir_from(std::env::var_os("XDG_RUNTIME_DIR"))
}

/// An empty or relative XDG_RUNTIME_DIR counts as unset
fn runtime_dir_from(xdg_runtime_dir: Option<OsString>) -> Result<PathBuf> {
    if let Some(runtime_dir) = xdg_runtime_dir
        .map(PathBuf::from)
        .filter(|dir| dir.is_absolute())
    {
        return Ok(runtime_dir.join(app::RUNTIME_DIR));
    }

    // Fallback to cache dir
    let cache = dirs::cache_dir()
        .context("Failed to determine cache directory (no XDG_RUNTIME_DIR or HOME)")?;
    Ok(cache.join(app::RUNTIME_DIR))
}

/// Delegate-side connection to the owner's socket
pub struct OwnerClient {
    stream: UnixStream,
}

impl OwnerClient {
    /// Connect to the owner socket, bounding every later read and write by `timeout`
    pub fn connect_to(path: &Path, timeout: Duration) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .context(format!("Failed to connect to owner at {}", path.display()))?;
        stream
            .set_read_timeout(Some(timeout))
            .context("Failed to set read timeout")?;
        stream
            .set_write_timeout(Some(timeout))
            .context("Failed to set write timeout")?;
        Ok(Self { stream })
    }

    /// Send one envelope and block until the owner has processed it
    pub fn deliver(mut self, envelope: &Envelope) -> Result<Reply> {
        write_message(&mut self.stream, envelope)?;
        read_message(&mut self.stream)
    }
}

/// Owner-side listener
///
/// The socket file is removed again when the server is dropped.
pub struct OwnerServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl OwnerServer {
    /// Bind the owner socket. Callers must already hold the instance lock,
    /// since any file at `socket_path` is treated as stale and removed.
    pub fn bind_to(socket_path: PathBuf) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .context(format!("Failed to create socket directory: {}", parent.display()))?;
        }

        if socket_path.exists() {
            warn!(path = %socket_path.display(), "Removing stale socket left by a previous owner");
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

    pub fn path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for OwnerServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// A decoded request waiting for the control loop, plus the channel the
/// loop answers on. The delegate stays blocked until `ack` is used.
#[derive(Debug)]
pub struct Delivery {
    pub request: Request,
    pub ack: mpsc::SyncSender<Reply>,
}

/// Spawn the accept thread. Each connection is served on its own thread so
/// a peer that never writes cannot hold up later delegates. Deliveries are
/// forwarded into the owner's event queue; protocol violations are answered
/// without reaching it.
pub fn spawn_listener<E>(
    server: &OwnerServer,
    events: mpsc::Sender<E>,
) -> Result<thread::JoinHandle<()>>
where
    E: From<Delivery> + Send + 'static,
{
    let listener = server
        .listener
        .try_clone()
        .context("Failed to clone owner socket")?;
    let path = server.socket_path.clone();

    thread::Builder::new()
        .name("ipc-listener".into())
        .spawn(move || {
            info!(socket = %path.display(), "IPC listener started");
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept IPC connection");
                        continue;
                    }
                };
                if let Err(e) = bound_io(&stream, DELIVERY_TIMEOUT) {
                    warn!(error = %e, "Failed to set IPC connection timeouts");
                    continue;
                }

                let events = events.clone();
                let spawned = thread::Builder::new()
                    .name("ipc-connection".into())
                    .spawn(move || match serve_connection(stream, &events) {
                        Ok(true) => {}
                        Ok(false) => info!("Event loop closed, delivery rejected"),
                        Err(e) => warn!(error = ?e, "IPC connection failed"),
                    });
                if let Err(e) = spawned {
                    warn!(error = %e, "Failed to spawn IPC connection thread");
                }
            }
        })
        .context("Failed to spawn IPC listener thread")
}

/// Bound every read and write on an accepted stream
fn bound_io(stream: &UnixStream, timeout: Duration) -> io::Result<()> {
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))
}

/// Handle one delegate connection. Returns `Ok(false)` once the event loop
/// has gone away.
fn serve_connection<E: From<Delivery>>(
    mut stream: UnixStream,
    events: &mpsc::Sender<E>,
) -> Result<bool> {
    let envelope: Envelope = read_message(&mut stream)?;
    debug!(kind = envelope.kind, len = envelope.payload.len(), "Received envelope");

    let request = match envelope.decode() {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Rejecting IPC message");
            write_message(&mut stream, &Reply::Rejected)?;
            return Ok(true);
        }
    };

    let (ack_tx, ack_rx) = mpsc::sync_channel(1);
    if events.send(E::from(Delivery { request, ack: ack_tx })).is_err() {
        write_message(&mut stream, &Reply::Rejected)?;
        return Ok(false);
    }

    let reply = ack_rx.recv().unwrap_or_else(|_| {
        error!("Event loop dropped a delivery without answering");
        Reply::Rejected
    });
    write_message(&mut stream, &reply)?;
    Ok(true)
}

/// Write length-prefixed message to stream
pub(crate) fn write_message<T: Serialize, W: Write>(stream: &mut W, msg: &T) -> Result<()> {
    let json = serde_json::to_vec(msg).context("Failed to serialize message to JSON")?;

    // Write length prefix (u32 little-endian)
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

/// Read length-prefixed message from stream
pub(crate) fn read_message<T: for<'de> Deserialize<'de>, R: Read>(stream: &mut R) -> Result<T> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .context("Failed to read message length")?;
    let len = u32::from_le_bytes(len_buf) as usize;

    if len > MAX_MESSAGE_SIZE {
        return Err(anyhow!("Message too large: {} bytes (max: {})", len, MAX_MESSAGE_SIZE));
    }

    let mut json_buf = vec![0u8; len];
    stream
        .read_exact(&mut json_buf)
        .context("Failed to read message payload")?;

    serde_json::from_slice(&json_buf).context("Failed to deserialize message from JSON")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[derive(Debug)]
    struct Wrapped(Delivery);

    impl From<Delivery> for Wrapped {
        fn from(delivery: Delivery) -> Self {
            Wrapped(delivery)
        }
    }

    #[test]
    fn test_message_framing_over_buffer() {
        let envelope = Envelope::flags_update(IpcFlags::ENABLE);
        let mut buf = Vec::new();
        write_message(&mut buf, &envelope).unwrap();

        let len = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
        assert_eq!(len, buf.len() - 4);

        let decoded: Envelope = read_message(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_MESSAGE_SIZE as u32) + 1).to_le_bytes());
        let result: Result<Envelope> = read_message(&mut Cursor::new(buf));
        assert!(result.is_err());
    }

    #[test]
    fn test_serve_connection_forwards_delivery_and_returns_ack() {
        let (mut client, server_side) = UnixStream::pair().unwrap();
        let (tx, rx) = mpsc::channel::<Wrapped>();

        let worker = thread::spawn(move || serve_connection(server_side, &tx).unwrap());

        write_message(&mut client, &Envelope::flags_update(IpcFlags::SET_DISPLAY)).unwrap();
        let Wrapped(delivery) = rx.recv().unwrap();
        assert_eq!(delivery.request, Request::FlagsUpdate(IpcFlags::SET_DISPLAY));
        delivery.ack.send(Reply::Handled).unwrap();

        let reply: Reply = read_message(&mut client).unwrap();
        assert_eq!(reply, Reply::Handled);
        assert!(worker.join().unwrap());
    }

    #[test]
    fn test_serve_connection_rejects_unknown_kind_without_forwarding() {
        let (mut client, server_side) = UnixStream::pair().unwrap();
        let (tx, rx) = mpsc::channel::<Wrapped>();

        write_message(&mut client, &Envelope { kind: 7, payload: vec![0; 4] }).unwrap();
        assert!(serve_connection(server_side, &tx).unwrap());

        let reply: Reply = read_message(&mut client).unwrap();
        assert_eq!(reply, Reply::Rejected);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_bind_replaces_stale_socket_and_cleans_up_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/instance.sock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"stale").unwrap();

        let server = OwnerServer::bind_to(path.clone()).unwrap();
        assert_eq!(server.path(), path.as_path());
        assert!(OwnerClient::connect_to(&path, Duration::from_secs(1)).is_ok());

        drop(server);
        assert!(!path.exists());
    }

    #[test]
    fn test_idle_peer_times_out() {
        let (_idle, server_side) = UnixStream::pair().unwrap();
        let (tx, _rx) = mpsc::channel::<Wrapped>();

        bound_io(&server_side, Duration::from_millis(50)).unwrap();
        assert!(serve_connection(server_side, &tx).is_err());
    }

    #[test]
    fn test_idle_peer_does_not_block_next_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instance.sock");
        let server = OwnerServer::bind_to(path.clone()).unwrap();
        let (tx, rx) = mpsc::channel::<Wrapped>();
        spawn_listener(&server, tx).unwrap();

        // Connected but silent, like a delegate suspended right after connect
        let _idle = UnixStream::connect(&path).unwrap();

        let answer = thread::spawn(move || {
            let Wrapped(delivery) = rx.recv().unwrap();
            delivery.ack.send(Reply::Handled).unwrap();
        });

        let started = std::time::Instant::now();
        let client = OwnerClient::connect_to(&path, DELIVERY_TIMEOUT).unwrap();
        let reply = client.deliver(&Envelope::flags_update(IpcFlags::ENABLE)).unwrap();
        assert_eq!(reply, Reply::Handled);
        assert!(started.elapsed() < DELIVERY_TIMEOUT / 2);
        answer.join().unwrap();
    }

    #[test]
    fn test_runtime_dir_uses_absolute_xdg_value() {
        let dir = runtime_dir_from(Some(OsString::from("/run/user/1000"))).unwrap();
        assert_eq!(dir, PathBuf::from("/run/user/1000").join(app::RUNTIME_DIR));
    }

    #[test]
    fn test_runtime_dir_ignores_empty_or_relative_xdg_value() {
        for value in ["", "relative/run"] {
            if let Ok(dir) = runtime_dir_from(Some(OsString::from(value))) {
                assert!(dir.is_absolute(), "value={value:?} dir={dir:?}");
                assert_eq!(dir, runtime_dir_from(None).unwrap());
            }
        }
    }
}
