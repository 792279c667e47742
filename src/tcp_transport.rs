use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::ChainMulticast;
use crate::peer::PeerIdentity;
use crate::transport::{Connection, Transport};

/// generous upper bound for the route part of a frame, on top of the payload capacity
const MAX_ROUTE_BYTES: usize = 256 * 1024;

/// Resolves a peer's name to the socket address its listener is bound to.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NameService: Send + Sync {
    async fn lookup(&self, name: &str) -> anyhow::Result<SocketAddr>;
}

/// A fixed name -> address table, for deployments where addresses are known up front.
pub struct StaticNameService {
    addrs: std::sync::Mutex<FxHashMap<String, SocketAddr>>,
}

impl StaticNameService {
    pub fn new() -> StaticNameService {
        StaticNameService {
            addrs: std::sync::Mutex::new(FxHashMap::default()),
        }
    }

    pub fn add(&self, name: impl Into<String>, addr: SocketAddr) {
        self.addrs.lock().unwrap().insert(name.into(), addr);
    }
}

impl Default for StaticNameService {
    fn default() -> Self {
        StaticNameService::new()
    }
}

#[async_trait]
impl NameService for StaticNameService {
    async fn lookup(&self, name: &str) -> anyhow::Result<SocketAddr> {
        self.addrs.lock().unwrap().get(name).copied()
            .ok_or_else(|| anyhow!("no address registered for {}", name))
    }
}

/// TCP transport: one outgoing stream connection per chain neighbor, frames length-prefixed.
pub struct TcpTransport {
    name_service: Arc<dyn NameService>,
}

impl TcpTransport {
    pub fn new(name_service: Arc<dyn NameService>) -> TcpTransport {
        TcpTransport {
            name_service,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, to: &PeerIdentity, timeout: Duration) -> anyhow::Result<Arc<dyn Connection>> {
        let stream = tokio::time::timeout(timeout, async {
            let addr = self.name_service.lookup(&to.name).await?;
            let stream = TcpStream::connect(addr).await?;
            anyhow::Ok(stream)
        }).await
            .map_err(|_| anyhow!("connecting to {:?} timed out", to))??;

        stream.set_nodelay(true)?;
        debug!("connected to {:?}", to);

        let conn: Arc<dyn Connection> = Arc::new(TcpConnection {
            stream: tokio::sync::Mutex::new(stream),
        });
        Ok(conn)
    }

    async fn report_suspect_dead(&self, peer: &PeerIdentity) {
        // no failure detector to notify over plain TCP
        debug!("peer {:?} is suspected dead", peer);
    }
}

struct TcpConnection {
    stream: tokio::sync::Mutex<TcpStream>,
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send_packet(&self, data: &[u8]) -> anyhow::Result<()> {
        let mut stream = self.stream.lock().await;
        stream.write_u32(data.len() as u32).await?;
        stream.write_all(data).await?;
        Ok(())
    }

    async fn close(&self) {
        let _ = self.stream.lock().await
            .shutdown().await;
    }
}

/// Bind a listener and feed every frame arriving on any inbound connection to the engine.
///  Returns the actual bound address (for port 0) and the accept task's handle.
pub async fn listen(bind_addr: SocketAddr, engine: Arc<ChainMulticast>) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(bind_addr).await?;
    let local_addr = listener.local_addr()?;
    debug!("listening on {}", local_addr);

    let handle = tokio::spawn(accept_loop(listener, engine));
    Ok((local_addr, handle))
}

async fn accept_loop(listener: TcpListener, engine: Arc<ChainMulticast>) {
    loop {
        match listener.accept().await {
            Ok((stream, from)) => {
                debug!("inbound connection from {}", from);
                tokio::spawn(read_loop(stream, engine.clone()));
            }
            Err(e) => {
                warn!("accepting a connection failed: {}", e);
            }
        }
    }
}

async fn read_loop(mut stream: TcpStream, engine: Arc<ChainMulticast>) {
    let max_frame = engine.pool().buf_size() + MAX_ROUTE_BYTES;
    let mut buf = Vec::new();

    loop {
        let len = match stream.read_u32().await {
            Ok(len) => len as usize,
            Err(_) => break, // peer closed the connection
        };
        if len > max_frame {
            warn!("dropping inbound connection: announced frame of {} bytes exceeds the limit", len);
            break;
        }

        buf.resize(len, 0);
        if let Err(e) = stream.read_exact(&mut buf).await {
            debug!("inbound connection failed mid-frame: {}", e);
            break;
        }

        engine.on_packet(&buf).await;
    }
}
