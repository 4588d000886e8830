//! Shell↔server local IPC.
//!
//! The desktop agent runs as two processes: a long-lived server owning the
//! engine and a thin shell that tunnels text commands to it. Every command
//! uses a two-socket handshake:
//!
//! 1. the shell connects to the **control socket** and sends the command
//!    (prefixed `X` when it comes from an interactive shell),
//! 2. the server answers with the number of a freshly bound **data socket**,
//! 3. on the data socket the server sends a 32-bit outcome; while it is
//!    [`OutCode::ReqConfirm`] a prompt follows and a single confirmation byte
//!    is expected back,
//! 4. the remaining output streams until EOF.
//!
//! Frames are length-prefixed (u32 little-endian); the numeric handshake
//! values travel as raw 32-bit little-endian integers. State is UTF-8
//! internally; the Windows named-pipe edge converts to UTF-16 and back.
//!
//! A separate long-lived data socket carries server-pushed state strings:
//! the shell registers with the single command `registerstatelistener` and
//! re-registers lazily after the server is detected down.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

use crate::error::OutCode;

/// Largest accepted frame; anything bigger is a protocol violation.
const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// How long the server waits for the shell to connect its data socket.
const DATA_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the agent endpoints live.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// UNIX-domain sockets `srv` / `srv_<N>` inside a per-user directory.
    #[cfg(unix)]
    Unix { dir: PathBuf },
    /// Loopback TCP on `base_port + N`.
    Tcp { base_port: u16 },
    /// Windows named pipes `\\.\pipe\<name><N>`.
    #[cfg(windows)]
    NamedPipe { name: String },
}

impl Endpoint {
    /// Default per-user endpoint for an application name.
    pub fn for_current_user(app: &str) -> Self {
        #[cfg(unix)]
        {
            Endpoint::Unix {
                dir: PathBuf::from(format!("/tmp/{app}_{}", current_uid())),
            }
        }
        #[cfg(windows)]
        {
            let user = std::env::var("USERNAME").unwrap_or_else(|_| "default".into());
            Endpoint::NamedPipe {
                name: format!("{app}pipe_{user}"),
            }
        }
    }

    #[cfg(unix)]
    fn socket_path(dir: &Path, number: u32) -> PathBuf {
        if number == 0 {
            dir.join("srv")
        } else {
            dir.join(format!("srv_{number}"))
        }
    }
}

#[cfg(unix)]
fn current_uid() -> u32 {
    use std::os::unix::fs::MetadataExt;
    static UID: once_cell::sync::Lazy<u32> = once_cell::sync::Lazy::new(|| {
        std::fs::metadata("/proc/self")
            .map(|m| m.uid())
            .unwrap_or(0)
    });
    *UID
}

trait IpcIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IpcIo for T {}

type IpcStream = Box<dyn IpcIo>;

async fn connect(endpoint: &Endpoint, number: u32) -> std::io::Result<IpcStream> {
    match endpoint {
        #[cfg(unix)]
        Endpoint::Unix { dir } => {
            let path = Endpoint::socket_path(dir, number);
            Ok(Box::new(UnixStream::connect(path).await?))
        }
        Endpoint::Tcp { base_port } => {
            let stream =
                TcpStream::connect(("127.0.0.1", base_port + number as u16)).await?;
            Ok(Box::new(stream))
        }
        #[cfg(windows)]
        Endpoint::NamedPipe { name } => {
            let path = pipe_path(name, number);
            let client = tokio::net::windows::named_pipe::ClientOptions::new().open(path)?;
            Ok(Box::new(client))
        }
    }
}

#[cfg(windows)]
fn pipe_path(name: &str, number: u32) -> String {
    if number == 0 {
        format!(r"\\.\pipe\{name}")
    } else {
        format!(r"\\.\pipe\{name}{number}")
    }
}

enum IpcListener {
    #[cfg(unix)]
    Unix {
        listener: UnixListener,
        path: PathBuf,
    },
    Tcp(TcpListener),
    #[cfg(windows)]
    Pipe {
        path: String,
        next: Option<tokio::net::windows::named_pipe::NamedPipeServer>,
    },
}

impl IpcListener {
    async fn bind(endpoint: &Endpoint, number: u32) -> std::io::Result<Self> {
        match endpoint {
            #[cfg(unix)]
            Endpoint::Unix { dir } => {
                std::fs::create_dir_all(dir)?;
                let path = Endpoint::socket_path(dir, number);
                // a stale socket file from a crashed server blocks the bind
                let _ = std::fs::remove_file(&path);
                Ok(IpcListener::Unix {
                    listener: UnixListener::bind(&path)?,
                    path,
                })
            }
            Endpoint::Tcp { base_port } => {
                let listener =
                    TcpListener::bind(("127.0.0.1", base_port + number as u16)).await?;
                Ok(IpcListener::Tcp(listener))
            }
            #[cfg(windows)]
            Endpoint::NamedPipe { name } => {
                let path = pipe_path(name, number);
                let server = tokio::net::windows::named_pipe::ServerOptions::new()
                    .first_pipe_instance(number == 0)
                    .create(&path)?;
                Ok(IpcListener::Pipe {
                    path,
                    next: Some(server),
                })
            }
        }
    }

    async fn accept(&mut self) -> std::io::Result<IpcStream> {
        match self {
            #[cfg(unix)]
            IpcListener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            IpcListener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            #[cfg(windows)]
            IpcListener::Pipe { path, next } => {
                let server = match next.take() {
                    Some(server) => server,
                    None => tokio::net::windows::named_pipe::ServerOptions::new().create(&*path)?,
                };
                server.connect().await?;
                *next = tokio::net::windows::named_pipe::ServerOptions::new()
                    .create(&*path)
                    .ok();
                Ok(Box::new(server))
            }
        }
    }

    /// Removes the socket file once its single expected peer has connected.
    fn cleanup(&self) {
        #[cfg(unix)]
        if let IpcListener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

// ---- framing ----------------------------------------------------------------

async fn write_frame<S: AsyncWrite + Unpin + ?Sized>(
    stream: &mut S,
    payload: &[u8],
) -> std::io::Result<()> {
    stream.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

async fn read_frame<S: AsyncRead + Unpin + ?Sized>(stream: &mut S) -> std::io::Result<Vec<u8>> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await?;
    let len = u32::from_le_bytes(len);
    if len > MAX_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "oversized IPC frame",
        ));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

async fn write_i32<S: AsyncWrite + Unpin + ?Sized>(
    stream: &mut S,
    value: i32,
) -> std::io::Result<()> {
    stream.write_all(&value.to_le_bytes()).await?;
    stream.flush().await
}

async fn read_i32<S: AsyncRead + Unpin + ?Sized>(stream: &mut S) -> std::io::Result<i32> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    Ok(i32::from_le_bytes(buf))
}

/// Platform text encoding at the wire edge: UTF-8 everywhere except Windows
/// named pipes, which speak UTF-16LE.
#[cfg(not(windows))]
fn encode_text(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}

#[cfg(not(windows))]
fn decode_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(windows)]
fn encode_text(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

#[cfg(windows)]
fn decode_text(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

// ---- server -----------------------------------------------------------------

/// Command handler verdict: finish with an outcome, or ask the shell a
/// yes/no question first.
pub enum ServerReply {
    Done(OutCode, Vec<u8>),
    Confirm {
        prompt: String,
        then: Box<dyn FnOnce(bool) -> ServerReply + Send>,
    },
}

type Handler = Arc<dyn Fn(&str) -> ServerReply + Send + Sync>;

/// The agent's server side: accepts shell connections, runs commands through
/// the installed handler, and pushes state strings to registered listeners.
#[derive(Clone)]
pub struct AgentServer {
    endpoint: Endpoint,
    handler: Handler,
    state_tx: tokio::sync::broadcast::Sender<String>,
    shutdown_tx: Arc<tokio::sync::watch::Sender<bool>>,
    next_data_socket: Arc<AtomicU32>,
}

impl AgentServer {
    pub fn new(endpoint: Endpoint, handler: impl Fn(&str) -> ServerReply + Send + Sync + 'static) -> Self {
        let (state_tx, _) = tokio::sync::broadcast::channel(64);
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);
        Self {
            endpoint,
            handler: Arc::new(handler),
            state_tx,
            shutdown_tx: Arc::new(shutdown_tx),
            next_data_socket: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Broadcasts a state change to every registered listener.
    pub fn push_state(&self, state: &str) {
        let _ = self.state_tx.send(state.to_string());
    }

    /// Stops the accept loop and closes long-lived listener connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Accept loop; runs until [`AgentServer::shutdown`].
    pub async fn run(&self) -> std::io::Result<()> {
        let mut control = IpcListener::bind(&self.endpoint, 0).await?;
        tracing::info!(endpoint = ?self.endpoint, "agent server listening");
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            let stream = tokio::select! {
                accepted = control.accept() => accepted?,
                _ = shutdown_rx.changed() => return Ok(()),
            };
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(err) = server.handle_connection(stream).await {
                    tracing::debug!(%err, "agent connection ended with error");
                }
            });
        }
    }

    async fn handle_connection(&self, mut control: IpcStream) -> std::io::Result<()> {
        let command = decode_text(&read_frame(&mut control).await?);

        let number = self.next_data_socket.fetch_add(1, Ordering::Relaxed) + 1;
        let mut data_listener = IpcListener::bind(&self.endpoint, number).await?;
        write_i32(&mut control, number as i32).await?;

        let mut data = tokio::time::timeout(DATA_ACCEPT_TIMEOUT, data_listener.accept())
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "shell never connected")
            })??;
        data_listener.cleanup();

        if command == "registerstatelistener" {
            let mut rx = self.state_tx.subscribe();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            loop {
                let received = tokio::select! {
                    received = rx.recv() => received,
                    _ = shutdown_rx.changed() => return Ok(()),
                };
                match received {
                    Ok(state) => {
                        if write_frame(&mut data, &encode_text(&state)).await.is_err() {
                            break; // listener went away
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "state listener lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            return Ok(());
        }

        let text = command.strip_prefix('X').unwrap_or(&command);
        let mut reply = (self.handler)(text);
        loop {
            match reply {
                ServerReply::Confirm { prompt, then } => {
                    write_i32(&mut data, OutCode::ReqConfirm.as_raw()).await?;
                    write_frame(&mut data, &encode_text(&prompt)).await?;
                    let mut answer = [0u8; 1];
                    data.read_exact(&mut answer).await?;
                    reply = then(answer[0] != 0);
                }
                ServerReply::Done(code, output) => {
                    write_i32(&mut data, code.as_raw()).await?;
                    data.write_all(&output).await?;
                    data.shutdown().await?;
                    return Ok(());
                }
            }
        }
    }
}

// ---- client -----------------------------------------------------------------

/// Yes/no prompt callback invoked during a REQCONFIRM exchange.
pub type ConfirmFn = Box<dyn FnMut(&str) -> bool + Send>;

/// The shell's side of the IPC: one connection per command, lazy server
/// autostart, and a background state-change listener.
pub struct ShellClient {
    endpoint: Endpoint,
    server_exe: Option<PathBuf>,
    register_again_required: Arc<AtomicBool>,
    server_initiated: Arc<AtomicBool>,
    stop_listener: Arc<AtomicBool>,
    down_grace: Duration,
}

impl ShellClient {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            server_exe: None,
            register_again_required: Arc::new(AtomicBool::new(false)),
            server_initiated: Arc::new(AtomicBool::new(false)),
            stop_listener: Arc::new(AtomicBool::new(false)),
            down_grace: Duration::from_secs(30),
        }
    }

    /// Enables spawning this executable when the server is not running.
    pub fn with_autostart(mut self, server_exe: impl Into<PathBuf>) -> Self {
        self.server_exe = Some(server_exe.into());
        self
    }

    /// Shortens the silence window after which the server counts as down.
    pub fn with_down_grace(mut self, grace: Duration) -> Self {
        self.down_grace = grace;
        self
    }

    /// True when the state listener lost its server and a re-registration is
    /// pending; cleared by the next successful registration.
    pub fn register_again_required(&self) -> bool {
        self.register_again_required.load(Ordering::Relaxed)
    }

    /// True when this shell forked the server itself.
    pub fn server_initiated(&self) -> bool {
        self.server_initiated.load(Ordering::Relaxed)
    }

    async fn connect_control(&self) -> std::io::Result<IpcStream> {
        match connect(&self.endpoint, 0).await {
            Ok(stream) => Ok(stream),
            Err(first_err) => {
                let Some(exe) = &self.server_exe else {
                    return Err(first_err);
                };

                tracing::info!("server not running, initiating in the background");
                spawn_server(exe)?;
                self.server_initiated.store(true, Ordering::Relaxed);
                self.register_again_required.store(true, Ordering::Relaxed);

                // exponential backoff, bounded to roughly twelve seconds
                let mut delay = Duration::from_millis(100);
                let mut waited = Duration::ZERO;
                loop {
                    tokio::time::sleep(delay).await;
                    waited += delay;
                    match connect(&self.endpoint, 0).await {
                        Ok(stream) => return Ok(stream),
                        Err(err) if waited >= Duration::from_secs(12) => {
                            tracing::error!(%err, "unable to connect to service");
                            return Err(err);
                        }
                        Err(_) => delay *= 2,
                    }
                }
            }
        }
    }

    /// Runs one command through the two-socket handshake. Returns the final
    /// outcome and the streamed output bytes.
    pub async fn execute_command(
        &self,
        command: &str,
        interactive: bool,
        mut confirm: Option<ConfirmFn>,
    ) -> std::io::Result<(OutCode, Vec<u8>)> {
        let mut control = self.connect_control().await?;

        let payload = if interactive {
            format!("X{command}")
        } else {
            command.to_string()
        };
        write_frame(&mut control, &encode_text(&payload)).await?;

        let number = read_i32(&mut control).await?;
        if number <= 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "server refused a data socket",
            ));
        }
        let mut data = connect(&self.endpoint, number as u32).await?;

        let mut outcode = read_i32(&mut data).await?;
        while outcode == OutCode::ReqConfirm.as_raw() {
            let prompt = decode_text(&read_frame(&mut data).await?);
            let answer = confirm.as_mut().map(|f| f(&prompt)).unwrap_or(false);
            data.write_all(&[u8::from(answer)]).await?;
            data.flush().await?;
            outcode = read_i32(&mut data).await?;
        }

        let mut output = Vec::new();
        data.read_to_end(&mut output).await?;
        Ok((OutCode::from_raw(outcode), output))
    }

    /// Opens the long-lived state channel. The handler runs on a background
    /// task for every pushed state string; when the channel dies the client
    /// flags itself for re-registration after the grace period.
    pub async fn register_state_listener(
        &self,
        handler: impl Fn(String) + Send + 'static,
    ) -> std::io::Result<tokio::task::JoinHandle<()>> {
        let mut control = self.connect_control().await?;
        write_frame(&mut control, &encode_text("registerstatelistener")).await?;
        let number = read_i32(&mut control).await?;
        if number <= 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "server refused a listener socket",
            ));
        }
        let mut data = connect(&self.endpoint, number as u32).await?;

        self.stop_listener.store(false, Ordering::Relaxed);
        let stop = Arc::clone(&self.stop_listener);
        let register_again = Arc::clone(&self.register_again_required);
        let grace = self.down_grace;

        let handle = tokio::spawn(async move {
            loop {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                match read_frame(&mut data).await {
                    Ok(frame) => handler(decode_text(&frame)),
                    Err(_) => {
                        tracing::warn!(
                            "server is probably down; commands will respawn or reconnect"
                        );
                        tokio::time::sleep(grace).await;
                        register_again.store(true, Ordering::Relaxed);
                        break;
                    }
                }
            }
        });

        self.register_again_required.store(false, Ordering::Relaxed);
        Ok(handle)
    }

    /// Stops the state listener task at its next wakeup.
    pub fn stop_state_listener(&self) {
        self.stop_listener.store(true, Ordering::Relaxed);
    }
}

/// Spawns the server executable detached, in its own process group so the
/// shell keeps exclusive SIGINT handling.
fn spawn_server(exe: &Path) -> std::io::Result<()> {
    let mut command = std::process::Command::new(exe);
    command
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    command.spawn().map(|_| ())
}
