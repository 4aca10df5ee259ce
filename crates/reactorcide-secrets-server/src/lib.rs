//! Secret-registration server (C3): a per-job Unix-domain-socket service
//! that accepts length-prefixed JSON registration messages and feeds a
//! [`reactorcide_mask::Masker`] at runtime, so a job can register secrets
//! it only learns about after launch (e.g. a generated token).
//!
//! Wire protocol: `[u32 big-endian length][JSON body]`. Request
//! `{"action":"register","secrets":[...]|"..."}`, response
//! `{"status":"ok","registered":N}\n` or `ERROR: ...\n`.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reactorcide_log::Logger;
use reactorcide_mask::Masker;
use serde::{Deserialize, Serialize};

/// Messages larger than this are dropped without a response.
const MAX_MESSAGE_BYTES: u32 = 1024 * 1024;
/// Per-connection read/write timeout.
const CONN_TIMEOUT: Duration = Duration::from_secs(5);
/// How often the accept loop wakes to check the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(500);
/// How long `stop` waits for the server thread to notice the flag.
const STOP_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    action: String,
    #[serde(default)]
    secrets: Option<SecretsField>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SecretsField {
    One(String),
    Many(Vec<String>),
}

impl SecretsField {
    fn into_vec(self) -> Vec<String> {
        match self {
            SecretsField::One(s) => vec![s],
            SecretsField::Many(v) => v,
        }
    }
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    status: &'static str,
    registered: usize,
}

/// Binds at `start`, serves connections on a background OS thread, and
/// unlinks the socket on `stop`. The socket path is conventionally exported
/// to the container as `REACTORCIDE_SECRETS_SOCKET`.
pub struct SecretsServer {
    socket_path: PathBuf,
    shutdown: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl SecretsServer {
    /// Binds a Unix-domain socket at `socket_path`, mode `0666` (so a
    /// containerized client can reach it after `/tmp` is bind-mounted in),
    /// and spawns the accept loop. Does not block.
    pub fn start(
        socket_path: impl Into<PathBuf>,
        masker: Arc<Masker>,
        logger: Arc<Logger>,
    ) -> std::io::Result<Self> {
        let socket_path = socket_path.into();
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }
        let listener = UnixListener::bind(&socket_path)?;
        listener.set_nonblocking(true)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o666))?;
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = shutdown.clone();
        let thread_path = socket_path.clone();
        let handle = std::thread::spawn(move || {
            accept_loop(listener, thread_shutdown, masker, logger, &thread_path);
        });

        Ok(Self {
            socket_path,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Signals shutdown, waits up to [`STOP_GRACE`] for the accept loop to
    /// exit, then unlinks the socket regardless.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let start = std::time::Instant::now();
            while !handle.is_finished() && start.elapsed() < STOP_GRACE {
                std::thread::sleep(Duration::from_millis(20));
            }
            let _ = handle.join();
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

impl Drop for SecretsServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

fn accept_loop(
    listener: UnixListener,
    shutdown: Arc<AtomicBool>,
    masker: Arc<Masker>,
    logger: Arc<Logger>,
    socket_path: &Path,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                if let Err(e) = handle_connection(stream, &masker) {
                    logger.warn(
                        "secrets-server",
                        "connection handling failed",
                        &[("error", &e.to_string())],
                    );
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                logger.warn(
                    "secrets-server",
                    "accept failed",
                    &[("error", &e.to_string()), ("socket", &socket_path.display().to_string())],
                );
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn handle_connection(mut stream: UnixStream, masker: &Masker) -> std::io::Result<()> {
    stream.set_read_timeout(Some(CONN_TIMEOUT))?;
    stream.set_write_timeout(Some(CONN_TIMEOUT))?;

    let mut len_buf = [0u8; 4];
    if stream.read_exact(&mut len_buf).is_err() {
        return Ok(());
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_MESSAGE_BYTES {
        return Ok(());
    }

    let mut body = vec![0u8; len as usize];
    if stream.read_exact(&mut body).is_err() {
        return Ok(());
    }

    let response = match serde_json::from_slice::<RegisterRequest>(&body) {
        Ok(req) if req.action == "register" => {
            let secrets = req.secrets.map(SecretsField::into_vec).unwrap_or_default();
            masker.register_many(secrets.iter().cloned());
            serde_json::to_string(&RegisterResponse {
                status: "ok",
                registered: secrets.len(),
            })
            .unwrap_or_else(|_| "ERROR: Invalid JSON".to_string())
        }
        Ok(_) => "ERROR: Unknown action".to_string(),
        Err(_) => "ERROR: Invalid JSON".to_string(),
    };

    stream.write_all(response.as_bytes())?;
    stream.write_all(b"\n")?;
    Ok(())
}

/// Client-side helper: encodes and sends a registration request over an
/// already-connected stream. Used by tests and by any in-process caller
/// that wants to register without shelling out.
pub fn send_register(stream: &mut UnixStream, secrets: &[String]) -> std::io::Result<String> {
    let body = serde_json::json!({ "action": "register", "secrets": secrets });
    let bytes = serde_json::to_vec(&body)?;
    stream.write_all(&(bytes.len() as u32).to_be_bytes())?;
    stream.write_all(&bytes)?;

    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte)?;
        if byte[0] == b'\n' {
            break;
        }
        response.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&response).into_owned())
}
