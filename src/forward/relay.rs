//! Unix-socket relay: one listener, one fresh upstream dial per client.

use anyhow::anyhow;
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::io;
use std::net::Shutdown;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::error::{ForwardError, ForwardResult};
use crate::security::{GPG_PROXY_PREFIX, SSH_PROXY_PREFIX, TMUX_PROXY_PREFIX, create_owned_dir};

/// Socket name used when the upstream path has no file name component.
const FALLBACK_SOCKET_NAME: &str = "agent.sock";

/// Back-off after an unexpected accept error (e.g. EMFILE).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Serves one relayed connection.
///
/// Called on a dedicated thread with the accepted client stream and a freshly
/// dialed upstream stream. Both streams are closed when the call returns.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(&self, client: UnixStream, upstream: UnixStream) -> io::Result<()>;
}

/// Byte-exact forwarding without interpretation.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl ConnectionHandler for Passthrough {
    fn handle(&self, client: UnixStream, upstream: UnixStream) -> io::Result<()> {
        pump(&client, &upstream)
    }
}

/// Copy bytes in both directions until the connection is done.
///
/// Each direction runs on its own thread and both are joined before this
/// returns. Client EOF half-closes the upstream so its reply still flows
/// back; the end of the upstream stream (or any error) closes both sides.
pub fn pump(client: &UnixStream, upstream: &UnixStream) -> io::Result<()> {
    thread::scope(|scope| {
        let inbound = thread::Builder::new()
            .name("relay-inbound".to_string())
            .spawn_scoped(scope, || {
                let mut from = client;
                let mut to = upstream;
                match io::copy(&mut from, &mut to) {
                    Ok(n) => {
                        let _ = upstream.shutdown(Shutdown::Write);
                        debug!("client->upstream finished after {} bytes", n);
                    }
                    Err(e) => {
                        debug!("client->upstream copy ended: {}", e);
                        close_both(client, upstream);
                    }
                }
            });
        if let Err(e) = inbound {
            close_both(client, upstream);
            return Err(e);
        }

        let outbound = thread::Builder::new()
            .name("relay-outbound".to_string())
            .spawn_scoped(scope, || {
                let mut from = upstream;
                let mut to = client;
                match io::copy(&mut from, &mut to) {
                    Ok(n) => debug!("upstream->client finished after {} bytes", n),
                    Err(e) => debug!("upstream->client copy ended: {}", e),
                }
                close_both(client, upstream);
            });
        if let Err(e) = outbound {
            close_both(client, upstream);
            return Err(e);
        }

        Ok(())
    })
}

fn close_both(client: &UnixStream, upstream: &UnixStream) {
    let _ = client.shutdown(Shutdown::Both);
    let _ = upstream.shutdown(Shutdown::Both);
}

/// Verify that `path` is a socket with a live listener behind it.
pub fn check_upstream(path: &Path) -> ForwardResult<()> {
    let unavailable = |reason: String| ForwardError::UpstreamUnavailable {
        path: path.to_path_buf(),
        reason,
    };

    let metadata = fs::metadata(path).map_err(|e| unavailable(e.to_string()))?;
    if !metadata.file_type().is_socket() {
        return Err(unavailable("not a socket".to_string()));
    }
    UnixStream::connect(path).map_err(|e| unavailable(format!("nothing listening: {}", e)))?;
    Ok(())
}

/// A bound local socket relaying to a fixed upstream socket.
pub struct SocketRelay {
    local: PathBuf,
    upstream: PathBuf,
    listener: Arc<UnixListener>,
    handler: Arc<dyn ConnectionHandler>,
    shutdown: Arc<AtomicBool>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl SocketRelay {
    /// Bind `local` (which must not exist) with owner-only permissions.
    pub fn bind(
        local: &Path,
        upstream: &Path,
        handler: Arc<dyn ConnectionHandler>,
    ) -> ForwardResult<Self> {
        let listener = UnixListener::bind(local)
            .map_err(|e| ForwardError::setup(format!("bind {}", local.display()), e))?;

        if let Err(e) = fs::set_permissions(local, fs::Permissions::from_mode(0o600)) {
            let _ = fs::remove_file(local);
            return Err(ForwardError::setup(
                format!("restrict permissions on {}", local.display()),
                e,
            ));
        }

        Ok(Self {
            local: local.to_path_buf(),
            upstream: upstream.to_path_buf(),
            listener: Arc::new(listener),
            handler,
            shutdown: Arc::new(AtomicBool::new(false)),
            accept_thread: Mutex::new(None),
            connections: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn local_path(&self) -> &Path {
        &self.local
    }

    pub fn upstream_path(&self) -> &Path {
        &self.upstream
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::SeqCst) && lock(&self.accept_thread).is_some()
    }

    /// Launch the accept loop. A second call is a no-op.
    pub fn start(&self) -> ForwardResult<()> {
        let mut accept_thread = lock(&self.accept_thread);
        if accept_thread.is_some() {
            debug!("Relay {} already started", self.local.display());
            return Ok(());
        }
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(ForwardError::setup(
                format!("start relay {}", self.local.display()),
                anyhow!("relay already stopped"),
            ));
        }

        let listener = Arc::clone(&self.listener);
        let handler = Arc::clone(&self.handler);
        let shutdown = Arc::clone(&self.shutdown);
        let connections = Arc::clone(&self.connections);
        let upstream = self.upstream.clone();

        let handle = thread::Builder::new()
            .name("relay-accept".to_string())
            .spawn(move || accept_loop(&listener, &upstream, handler, &shutdown, &connections))
            .map_err(|e| ForwardError::setup("spawn accept thread", e))?;
        *accept_thread = Some(handle);

        Ok(())
    }

    /// Stop accepting, wait for in-flight connections, remove the socket file.
    ///
    /// Safe to call before [`start`](Self::start), more than once, and from
    /// any thread.
    pub fn stop(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        // SAFETY: the fd belongs to the listener, which outlives this call.
        // shutdown(2) on a listening socket wakes a blocked accept on Linux.
        unsafe {
            libc::shutdown(self.listener.as_raw_fd(), libc::SHUT_RDWR);
        }
        // Elsewhere a connection attempt wakes it; failure is fine.
        let _ = UnixStream::connect(&self.local);

        if let Some(handle) = lock(&self.accept_thread).take()
            && handle.join().is_err()
        {
            warn!("Accept thread for {} panicked", self.local.display());
        }

        let in_flight = std::mem::take(&mut *lock(&self.connections));
        if !in_flight.is_empty() {
            debug!(
                "Waiting for {} connection(s) on {}",
                in_flight.len(),
                self.local.display()
            );
        }
        for handle in in_flight {
            if handle.join().is_err() {
                warn!("Connection thread for {} panicked", self.local.display());
            }
        }

        match fs::remove_file(&self.local) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove socket {}: {}", self.local.display(), e),
        }
    }
}

impl Drop for SocketRelay {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for SocketRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketRelay")
            .field("local", &self.local)
            .field("upstream", &self.upstream)
            .field("shutdown", &self.shutdown.load(Ordering::SeqCst))
            .finish()
    }
}

fn accept_loop(
    listener: &UnixListener,
    upstream: &Path,
    handler: Arc<dyn ConnectionHandler>,
    shutdown: &AtomicBool,
    connections: &Mutex<Vec<JoinHandle<()>>>,
) {
    loop {
        let accepted = listener.accept();
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let client = match accepted {
            Ok((client, _)) => client,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Accept failed on relay socket: {}", e);
                thread::sleep(ACCEPT_ERROR_BACKOFF);
                continue;
            }
        };

        let handler = Arc::clone(&handler);
        let upstream = upstream.to_path_buf();
        let spawned = thread::Builder::new()
            .name("relay-conn".to_string())
            .spawn(move || serve_connection(client, &upstream, handler.as_ref()));

        match spawned {
            Ok(handle) => {
                let mut connections = lock(connections);
                connections.retain(|h| !h.is_finished());
                connections.push(handle);
            }
            Err(e) => warn!("Failed to spawn connection thread: {}", e),
        }
    }
    debug!("Accept loop exiting");
}

fn serve_connection(client: UnixStream, upstream: &Path, handler: &dyn ConnectionHandler) {
    let upstream_stream = match UnixStream::connect(upstream) {
        Ok(stream) => stream,
        Err(e) => {
            debug!("Failed to dial upstream {}: {}", upstream.display(), e);
            let _ = client.shutdown(Shutdown::Both);
            return;
        }
    };

    if let Err(e) = handler.handle(client, upstream_stream) {
        debug!("Relayed connection ended with error: {}", e);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Which credential channel a [`ForwardChannel`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    SshAgent,
    GpgAgent,
    Tmux,
}

impl ChannelKind {
    /// Name prefix of the channel's resource directory.
    pub fn dir_prefix(self) -> &'static str {
        match self {
            ChannelKind::SshAgent => SSH_PROXY_PREFIX,
            ChannelKind::GpgAgent => GPG_PROXY_PREFIX,
            ChannelKind::Tmux => TMUX_PROXY_PREFIX,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelKind::SshAgent => "SSH agent",
            ChannelKind::GpgAgent => "GPG agent",
            ChannelKind::Tmux => "tmux",
        };
        f.write_str(name)
    }
}

/// A relay living in its own leased directory.
///
/// The socket is named after the upstream socket so tools inside the sandbox
/// find it where they expect. Socket and directory are removed together by
/// [`stop`](Self::stop), which also runs on drop.
#[derive(Debug)]
pub struct ForwardChannel {
    kind: ChannelKind,
    dir: PathBuf,
    relay: SocketRelay,
    dir_removed: AtomicBool,
}

impl ForwardChannel {
    /// Validate the upstream, create the leased directory and bind the socket.
    /// Nothing is accepted until [`start`](Self::start).
    pub fn new(
        kind: ChannelKind,
        base: &Path,
        upstream: &Path,
        handler: Arc<dyn ConnectionHandler>,
    ) -> ForwardResult<Self> {
        check_upstream(upstream)?;

        let dir = create_owned_dir(base, kind.dir_prefix())
            .map_err(|e| ForwardError::setup(format!("create {} proxy directory", kind), e))?;

        let name = upstream
            .file_name()
            .unwrap_or_else(|| OsStr::new(FALLBACK_SOCKET_NAME));
        let relay = match SocketRelay::bind(&dir.join(name), upstream, handler) {
            Ok(relay) => relay,
            Err(e) => {
                let _ = fs::remove_dir_all(&dir);
                return Err(e);
            }
        };

        Ok(Self {
            kind,
            dir,
            relay,
            dir_removed: AtomicBool::new(false),
        })
    }

    /// [`new`](Self::new) followed by [`start`](Self::start).
    pub fn open(
        kind: ChannelKind,
        base: &Path,
        upstream: &Path,
        handler: Arc<dyn ConnectionHandler>,
    ) -> ForwardResult<Self> {
        let channel = Self::new(kind, base, upstream, handler)?;
        channel.start()?;
        Ok(channel)
    }

    pub fn start(&self) -> ForwardResult<()> {
        self.relay.start()?;
        info!(
            "{} proxy listening on {} (upstream {})",
            self.kind,
            self.relay.local_path().display(),
            self.relay.upstream_path().display()
        );
        Ok(())
    }

    /// Stop the relay, then remove the directory holding the socket.
    pub fn stop(&self) {
        self.relay.stop();

        if self.dir_removed.swap(true, Ordering::SeqCst) {
            return;
        }
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!("{} proxy stopped, removed {}", self.kind, self.dir.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", self.dir.display(), e),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn socket_path(&self) -> &Path {
        self.relay.local_path()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn upstream_path(&self) -> &Path {
        self.relay.upstream_path()
    }

    pub fn is_running(&self) -> bool {
        self.relay.is_running()
    }
}

impl Drop for ForwardChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Plain byte relay for a terminal-multiplexer control socket.
pub fn tmux_relay(base: &Path, upstream: &Path) -> ForwardResult<ForwardChannel> {
    ForwardChannel::open(ChannelKind::Tmux, base, upstream, Arc::new(Passthrough))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::test_support::spawn_upstream;
    use crate::security::LEASE_FILENAME;
    use std::io::{Read, Write};

    fn echo(stream: UnixStream) {
        let mut from = &stream;
        let mut to = &stream;
        let _ = io::copy(&mut from, &mut to);
    }

    #[test]
    fn ping_pong() {
        let tmp = tempfile::tempdir().unwrap();
        let upstream = spawn_upstream(tmp.path(), "upstream.sock", |mut stream| {
            let mut buf = [0u8; 5];
            if stream.read_exact(&mut buf).is_ok() && &buf == b"PING\n" {
                let _ = stream.write_all(b"PONG\n");
            }
        });

        let channel = tmux_relay(&tmp.path().join("base"), &upstream).unwrap();
        let mut client = UnixStream::connect(channel.socket_path()).unwrap();
        client.write_all(b"PING\n").unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"PONG\n");
    }

    #[test]
    fn large_payload_is_byte_exact() {
        let tmp = tempfile::tempdir().unwrap();
        let upstream = spawn_upstream(tmp.path(), "echo.sock", echo);
        let channel = tmux_relay(&tmp.path().join("base"), &upstream).unwrap();

        let payload: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
        let client = UnixStream::connect(channel.socket_path()).unwrap();

        let mut writer = client.try_clone().unwrap();
        let sent = payload.clone();
        let write_thread = thread::spawn(move || {
            // Many small writes so the relay sees partial reads.
            for chunk in sent.chunks(7919) {
                writer.write_all(chunk).unwrap();
            }
            writer.shutdown(Shutdown::Write).unwrap();
        });

        let mut received = Vec::new();
        (&client).read_to_end(&mut received).unwrap();
        write_thread.join().unwrap();

        assert_eq!(received.len(), payload.len());
        assert!(received == payload);
    }

    #[test]
    fn socket_named_after_upstream_with_private_permissions() {
        let tmp = tempfile::tempdir().unwrap();
        let upstream = spawn_upstream(tmp.path(), "S.gpg-agent", echo);
        let channel = ForwardChannel::open(
            ChannelKind::GpgAgent,
            &tmp.path().join("base"),
            &upstream,
            Arc::new(Passthrough),
        )
        .unwrap();

        assert_eq!(channel.socket_path().file_name().unwrap(), "S.gpg-agent");
        assert!(
            channel
                .dir()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with(GPG_PROXY_PREFIX)
        );
        assert!(channel.dir().join(LEASE_FILENAME).exists());

        let socket_mode = fs::metadata(channel.socket_path()).unwrap().permissions().mode();
        assert_eq!(socket_mode & 0o777, 0o600);
        let dir_mode = fs::metadata(channel.dir()).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        assert!(channel.is_running());
    }

    #[test]
    fn stop_removes_socket_and_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let upstream = spawn_upstream(tmp.path(), "echo.sock", echo);
        let channel = tmux_relay(&tmp.path().join("base"), &upstream).unwrap();
        let socket = channel.socket_path().to_path_buf();
        let dir = channel.dir().to_path_buf();

        channel.stop();

        assert!(!socket.exists());
        assert!(!dir.exists());
        assert!(UnixStream::connect(&socket).is_err());
        assert!(!channel.is_running());

        // Second stop is harmless.
        channel.stop();
    }

    #[test]
    fn stop_without_start() {
        let tmp = tempfile::tempdir().unwrap();
        let upstream = spawn_upstream(tmp.path(), "echo.sock", echo);
        let channel = ForwardChannel::new(
            ChannelKind::SshAgent,
            &tmp.path().join("base"),
            &upstream,
            Arc::new(Passthrough),
        )
        .unwrap();
        let dir = channel.dir().to_path_buf();
        assert!(!channel.is_running());

        channel.stop();
        assert!(!dir.exists());
        assert!(channel.start().is_err());
    }

    #[test]
    fn drop_tears_down() {
        let tmp = tempfile::tempdir().unwrap();
        let upstream = spawn_upstream(tmp.path(), "echo.sock", echo);
        let dir = {
            let channel = tmux_relay(&tmp.path().join("base"), &upstream).unwrap();
            channel.dir().to_path_buf()
        };
        assert!(!dir.exists());
    }

    #[test]
    fn stop_from_another_thread_waits_for_in_flight_connection() {
        let tmp = tempfile::tempdir().unwrap();
        let upstream = spawn_upstream(tmp.path(), "echo.sock", echo);
        let channel = Arc::new(tmux_relay(&tmp.path().join("base"), &upstream).unwrap());

        let mut client = UnixStream::connect(channel.socket_path()).unwrap();
        client.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        let stopper = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.stop())
        };
        thread::sleep(Duration::from_millis(200));
        assert!(!stopper.is_finished(), "stop returned while a connection was in flight");

        drop(client);
        stopper.join().unwrap();
        assert!(!channel.dir().exists());
    }

    #[test]
    fn failed_connection_does_not_affect_siblings() {
        let tmp = tempfile::tempdir().unwrap();
        let upstream = spawn_upstream(tmp.path(), "echo.sock", echo);
        let channel = tmux_relay(&tmp.path().join("base"), &upstream).unwrap();

        let mut idle = UnixStream::connect(channel.socket_path()).unwrap();
        let aborted = UnixStream::connect(channel.socket_path()).unwrap();
        (&aborted).write_all(b"partial").unwrap();
        aborted.shutdown(Shutdown::Both).unwrap();
        drop(aborted);

        let mut fresh = UnixStream::connect(channel.socket_path()).unwrap();
        fresh.write_all(b"still works").unwrap();
        let mut buf = [0u8; 11];
        fresh.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"still works");

        idle.write_all(b"idle").unwrap();
        let mut buf = [0u8; 4];
        idle.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"idle");
    }

    #[test]
    fn vanished_upstream_closes_only_the_client() {
        let tmp = tempfile::tempdir().unwrap();
        let upstream = spawn_upstream(tmp.path(), "echo.sock", echo);
        let channel = tmux_relay(&tmp.path().join("base"), &upstream).unwrap();

        fs::remove_file(&upstream).unwrap();

        let mut client = UnixStream::connect(channel.socket_path()).unwrap();
        let mut buf = Vec::new();
        assert_eq!(client.read_to_end(&mut buf).unwrap(), 0);
        assert!(channel.is_running());
    }

    #[test]
    fn missing_upstream_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let err = tmux_relay(&tmp.path().join("base"), &tmp.path().join("nope.sock")).unwrap_err();
        assert!(err.is_upstream_unavailable(), "{err}");
        assert!(!tmp.path().join("base").exists());
    }

    #[test]
    fn regular_file_upstream_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("not-a-socket");
        fs::write(&file, b"").unwrap();

        let err = tmux_relay(&tmp.path().join("base"), &file).unwrap_err();
        assert!(err.is_upstream_unavailable(), "{err}");
        assert!(err.to_string().contains("not a socket"));
    }

    #[test]
    fn stale_socket_upstream_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let stale = tmp.path().join("stale.sock");
        drop(UnixListener::bind(&stale).unwrap());
        assert!(stale.exists());

        let err = tmux_relay(&tmp.path().join("base"), &stale).unwrap_err();
        assert!(err.is_upstream_unavailable(), "{err}");
    }

    #[test]
    fn bind_refuses_existing_path() {
        let tmp = tempfile::tempdir().unwrap();
        let local = tmp.path().join("taken");
        fs::write(&local, b"").unwrap();

        let err = SocketRelay::bind(&local, Path::new("/nonexistent"), Arc::new(Passthrough))
            .unwrap_err();
        assert!(matches!(err, ForwardError::Setup { .. }), "{err}");
        assert!(local.exists());
    }
}
