//! Byte-stream transports: Unix domain sockets and TCP.

use engine_protocol::{Compartment, PROTOCOL_VERSION};
use pin_project_lite::pin_project;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

/// Where a compartment can be reached.
///
/// Written as `unix:/path/to.sock` or `tcp:host:port`. A bare absolute path
/// is taken as a Unix socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EndpointAddr {
    Unix(PathBuf),
    Tcp(String),
}

impl EndpointAddr {
    /// Opens a stream to this address.
    pub async fn connect(&self) -> io::Result<EngineStream> {
        match self {
            EndpointAddr::Unix(path) => {
                let stream = UnixStream::connect(path).await?;
                Ok(EngineStream::Unix { stream })
            }
            EndpointAddr::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                Ok(EngineStream::Tcp { stream })
            }
        }
    }
}

impl fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointAddr::Unix(path) => write!(f, "unix:{}", path.display()),
            EndpointAddr::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

impl FromStr for EndpointAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err("empty unix socket path".to_string());
            }
            return Ok(EndpointAddr::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp:") {
            if !addr.contains(':') {
                return Err(format!("tcp address must be host:port, got '{}'", addr));
            }
            return Ok(EndpointAddr::Tcp(addr.to_string()));
        }
        if s.starts_with('/') {
            return Ok(EndpointAddr::Unix(PathBuf::from(s)));
        }
        Err(format!(
            "invalid endpoint address '{}': expected unix:<path> or tcp:<host:port>",
            s
        ))
    }
}

impl Serialize for EndpointAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EndpointAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn default_protocol_version() -> u16 {
    PROTOCOL_VERSION
}

/// A compartment pairing: the address plus who must be on the other end.
///
/// On the dialing side `peer` is the compartment expected to answer; on the
/// listening side it is the compartment allowed to connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub addr: EndpointAddr,
    pub peer: Compartment,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u16,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, addr: EndpointAddr, peer: Compartment) -> Self {
        Self {
            name: name.into(),
            addr,
            peer,
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn unix(name: impl Into<String>, path: impl Into<PathBuf>, peer: Compartment) -> Self {
        Self::new(name, EndpointAddr::Unix(path.into()), peer)
    }

    pub fn tcp(name: impl Into<String>, addr: impl Into<String>, peer: Compartment) -> Self {
        Self::new(name, EndpointAddr::Tcp(addr.into()), peer)
    }
}

pin_project! {
    /// A connected stream over either transport.
    #[project = EngineStreamProj]
    pub enum EngineStream {
        Unix { #[pin] stream: UnixStream },
        Tcp { #[pin] stream: TcpStream },
    }
}

impl EngineStream {
    /// Human-readable description of the remote side, for logs.
    pub fn peer_label(&self) -> String {
        match self {
            EngineStream::Unix { .. } => "unix-peer".to_string(),
            EngineStream::Tcp { stream } => stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp-peer".to_string()),
        }
    }
}

impl AsyncRead for EngineStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            EngineStreamProj::Unix { stream } => stream.poll_read(cx, buf),
            EngineStreamProj::Tcp { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for EngineStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            EngineStreamProj::Unix { stream } => stream.poll_write(cx, buf),
            EngineStreamProj::Tcp { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            EngineStreamProj::Unix { stream } => stream.poll_flush(cx),
            EngineStreamProj::Tcp { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            EngineStreamProj::Unix { stream } => stream.poll_shutdown(cx),
            EngineStreamProj::Tcp { stream } => stream.poll_shutdown(cx),
        }
    }
}

/// A bound listener over either transport.
///
/// A Unix listener removes its socket file when dropped.
#[derive(Debug)]
pub enum EngineListener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp { listener: TcpListener },
}

impl EngineListener {
    /// Binds to `addr`.
    ///
    /// A leftover Unix socket file with nobody listening on it is removed
    /// first; one that still accepts connections yields `AddrInUse`.
    pub async fn bind(addr: &EndpointAddr) -> io::Result<Self> {
        match addr {
            EndpointAddr::Unix(path) => {
                remove_stale_socket(path).await?;
                let listener = UnixListener::bind(path)?;
                Ok(EngineListener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            EndpointAddr::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str()).await?;
                Ok(EngineListener::Tcp { listener })
            }
        }
    }

    /// Accepts the next connection.
    pub async fn accept(&self) -> io::Result<(EngineStream, String)> {
        match self {
            EngineListener::Unix { listener, path } => {
                let (stream, _) = listener.accept().await?;
                Ok((EngineStream::Unix { stream }, path.display().to_string()))
            }
            EngineListener::Tcp { listener } => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((EngineStream::Tcp { stream }, addr.to_string()))
            }
        }
    }

    /// Returns the bound address, with the real port for `tcp:host:0`.
    pub fn local_addr(&self) -> io::Result<EndpointAddr> {
        match self {
            EngineListener::Unix { path, .. } => Ok(EndpointAddr::Unix(path.clone())),
            EngineListener::Tcp { listener } => {
                Ok(EndpointAddr::Tcp(listener.local_addr()?.to_string()))
            }
        }
    }
}

impl Drop for EngineListener {
    fn drop(&mut self) {
        if let EngineListener::Unix { path, .. } = self {
            if let Err(e) = std::fs::remove_file(path.as_path()) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove socket {}: {}", path.display(), e);
                }
            }
        }
    }
}

async fn remove_stale_socket(path: &Path) -> io::Result<()> {
    if tokio::fs::symlink_metadata(path).await.is_err() {
        return Ok(());
    }
    if UnixStream::connect(path).await.is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("socket {} is in use by a live listener", path.display()),
        ));
    }
    tracing::info!("Removing stale socket {}", path.display());
    tokio::fs::remove_file(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_parse_endpoint_addr() {
        assert_eq!(
            "unix:/tmp/engine.sock".parse::<EndpointAddr>().unwrap(),
            EndpointAddr::Unix(PathBuf::from("/tmp/engine.sock"))
        );
        assert_eq!(
            "/tmp/app.sock".parse::<EndpointAddr>().unwrap(),
            EndpointAddr::Unix(PathBuf::from("/tmp/app.sock"))
        );
        assert_eq!(
            "tcp:127.0.0.1:7401".parse::<EndpointAddr>().unwrap(),
            EndpointAddr::Tcp("127.0.0.1:7401".to_string())
        );
        assert!("tcp:localhost".parse::<EndpointAddr>().is_err());
        assert!("http://x".parse::<EndpointAddr>().is_err());
        assert!("unix:".parse::<EndpointAddr>().is_err());
    }

    #[test]
    fn test_endpoint_display_roundtrips() {
        let addr = EndpointAddr::Tcp("10.0.0.2:9000".to_string());
        assert_eq!(addr.to_string().parse::<EndpointAddr>().unwrap(), addr);
    }

    #[test]
    fn test_endpoint_deserializes_with_default_version() {
        let yaml = r#"{"name": "app", "addr": "unix:/tmp/app.sock", "peer": "application"}"#;
        let endpoint: Endpoint = serde_json::from_str(yaml).unwrap();
        assert_eq!(endpoint.peer, Compartment::Application);
        assert_eq!(endpoint.protocol_version, PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_unix_listener_roundtrip_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.sock");
        let addr = EndpointAddr::Unix(path.clone());

        let listener = EngineListener::bind(&addr).await.unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            listener
        });

        let mut client = addr.connect().await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let listener = server.await.unwrap();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");

        // A socket file left behind by a process that is gone.
        let std_listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        drop(std_listener);
        assert!(path.exists());

        let listener = EngineListener::bind(&EndpointAddr::Unix(path.clone()))
            .await
            .unwrap();
        assert!(matches!(listener, EngineListener::Unix { .. }));
    }

    #[tokio::test]
    async fn test_live_socket_is_not_stolen() {
        let dir = tempfile::tempdir().unwrap();
        let addr = EndpointAddr::Unix(dir.path().join("live.sock"));

        let _first = EngineListener::bind(&addr).await.unwrap();
        let err = EngineListener::bind(&addr).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn test_tcp_local_addr_reports_port() {
        let listener = EngineListener::bind(&EndpointAddr::Tcp("127.0.0.1:0".to_string()))
            .await
            .unwrap();
        match listener.local_addr().unwrap() {
            EndpointAddr::Tcp(addr) => assert!(!addr.ends_with(":0")),
            other => panic!("unexpected address {}", other),
        }
    }
}
