use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{tcp::OwnedWriteHalf, TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Bound on a single relay write; slow consumers never stall a pipeline
/// longer than this.
const WRITE_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("client with key {0} not found")]
    NotFound(String),
    #[error("write to client timed out")]
    Timeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Session-keyed TCP hub. A client registers with `connect|<key>` and the
/// connection becomes write-only from the server side; messages addressed to
/// the key are forwarded as newline-terminated lines, FIFO per key.
pub struct SessionRelay {
    conns: RwLock<HashMap<String, Arc<Mutex<OwnedWriteHalf>>>>,
}

impl Default for SessionRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRelay {
    pub fn new() -> Self {
        Self { conns: RwLock::new(HashMap::new()) }
    }

    pub async fn serve(self: Arc<Self>, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_on(listener).await
    }

    pub async fn serve_on(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "session relay listening");
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    let hub = Arc::clone(&self);
                    tokio::spawn(async move { hub.handle_conn(stream).await });
                }
                Err(e) => warn!(error = %e, "failed to accept relay connection"),
            }
        }
    }

    /// Read lines until a `connect|<key>` frame arrives, then register the
    /// write half and stop reading. Other lines are ignored.
    async fn handle_conn(&self, stream: TcpStream) {
        let (read, write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(key) = parse_connect(line.trim()) {
                        self.register(key, write);
                        return;
                    }
                }
                Ok(None) | Err(_) => return,
            }
        }
    }

    /// Store a connection under a key. A prior registration for the same key
    /// is superseded; the old connection is abandoned, not closed.
    pub fn register(&self, key: String, conn: OwnedWriteHalf) {
        info!(%key, "registering relay connection");
        let mut conns = self.conns.write().unwrap_or_else(|e| e.into_inner());
        conns.insert(key, Arc::new(Mutex::new(conn)));
    }

    /// Write one message line to the connection registered under `key`. The
    /// map lock is never held across the socket write. A failed write is
    /// reported but does not evict the registration.
    pub async fn write(&self, key: &str, msg: &str) -> Result<(), RelayError> {
        let conn = {
            let conns = self.conns.read().unwrap_or_else(|e| e.into_inner());
            conns.get(key).cloned()
        };
        let conn = conn.ok_or_else(|| RelayError::NotFound(key.to_string()))?;
        let frame = format!("{msg}\n");
        let mut guard = conn.lock().await;
        match tokio::time::timeout(WRITE_DEADLINE, guard.write_all(frame.as_bytes())).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(RelayError::Timeout),
        }
    }

    pub fn count(&self) -> usize {
        self.conns.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn parse_connect(line: &str) -> Option<String> {
    let mut parts = line.splitn(2, '|');
    let action = parts.next()?.trim();
    let key = parts.next()?.trim();
    if action == "connect" && !key.is_empty() {
        Some(key.to_string())
    } else {
        None
    }
}
