//! C1: Link & Framing.
//!
//! Owns one bidirectional TCP connection. Every operation takes an
//! absolute deadline (spec.md §4.1, §5 "Suspension points") and is
//! implemented over `tokio`, the teacher's async runtime family (the
//! teacher drove `tokio_core::net::TcpStream` directly in
//! `SccacheScheduler::start`/`SccacheDaemonServer::start`; this is the
//! same idea ported to the current `tokio` API).

use std::net::SocketAddr;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::errors::*;

/// Implemented by anything the line-oriented codec in `protocol.rs` can
/// read from: a whole `Link` during the handshake, or a `LinkReader` once
/// a session has split its connection into independent read/write halves.
#[async_trait]
pub trait LinkRead: Send {
    async fn read_line(&mut self, max: usize, deadline: Instant) -> Result<String>;
    async fn read_exact(&mut self, n: usize, deadline: Instant) -> Result<Vec<u8>>;

    async fn read_verb_line(&mut self, max: usize, deadline: Instant) -> Result<(String, Vec<String>)> {
        let line = self.read_line(max, deadline).await?;
        let mut tokens = line.split_whitespace();
        let verb = tokens.next().unwrap_or("").to_string();
        let rest = tokens.map(|s| s.to_string()).collect();
        Ok((verb, rest))
    }
}

/// Implemented by anything the line-oriented codec can write to: a whole
/// `Link`, or a `LinkWriter` half.
#[async_trait]
pub trait LinkWrite: Send {
    async fn write_all(&mut self, buf: &[u8], deadline: Instant) -> Result<()>;

    async fn write_line(&mut self, line: &str, deadline: Instant) -> Result<()> {
        if line.len() > CONTROL_LINE_MAX {
            bail!(ErrorKind::Protocol(format!("outgoing line exceeds {} bytes", CONTROL_LINE_MAX)));
        }
        let mut framed = String::with_capacity(line.len() + 1);
        framed.push_str(line);
        framed.push('\n');
        self.write_all(framed.as_bytes(), deadline).await
    }
}

/// Control-message line limit (spec.md §4.1: "conventionally 1024 bytes").
pub const CONTROL_LINE_MAX: usize = 1024;
/// File-header line limit (spec.md §4.1: "up to 1 MiB for file headers").
pub const HEADER_LINE_MAX: usize = 1024 * 1024;

/// One bidirectional connection, stateless with respect to protocol
/// semantics (spec.md §4.1: "The caller specifies the deadline; the link
/// itself is stateless").
pub struct Link {
    stream: BufReader<TcpStream>,
    peer: SocketAddr,
    local: SocketAddr,
}

fn deadline_to_duration(deadline: Instant) -> std::time::Duration {
    deadline.saturating_duration_since(Instant::now())
}

impl Link {
    pub fn new(stream: TcpStream) -> Result<Self> {
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        Ok(Link { stream: BufReader::new(stream), peer, local })
    }

    pub async fn connect(addr: SocketAddr, deadline: Instant) -> Result<Self> {
        let stream = timeout(deadline_to_duration(deadline), TcpStream::connect(addr))
            .await
            .map_err(|_| ErrorKind::Timeout(format!("connect to {}", addr)))??;
        Link::new(stream)
    }

    /// Read one newline-terminated line, with trailing CR/LF stripped.
    /// Fails with `Timeout` if `deadline` elapses, `PeerGone` on clean
    /// close, `Protocol` if the line exceeds `max`.
    pub async fn read_line(&mut self, max: usize, deadline: Instant) -> Result<String> {
        let mut buf = String::new();
        let read = timeout(deadline_to_duration(deadline), self.stream.read_line(&mut buf))
            .await
            .map_err(|_| ErrorKind::Timeout(format!("read_line from {}", self.peer)))??;
        if read == 0 {
            bail!(ErrorKind::PeerGone(format!("{} closed while reading a line", self.peer)));
        }
        while buf.ends_with('\n') || buf.ends_with('\r') {
            buf.pop();
        }
        if buf.len() > max {
            bail!(ErrorKind::Protocol(format!("line exceeds {} bytes", max)));
        }
        Ok(buf)
    }

    /// Read a line and split it into a verb and the remaining
    /// whitespace-tokenized arguments.
    pub async fn read_verb_line(&mut self, max: usize, deadline: Instant) -> Result<(String, Vec<String>)> {
        let line = self.read_line(max, deadline).await?;
        let mut tokens = line.split_whitespace();
        let verb = tokens.next().unwrap_or("").to_string();
        let rest = tokens.map(|s| s.to_string()).collect();
        Ok((verb, rest))
    }

    /// Read exactly `n` bytes.
    pub async fn read_exact(&mut self, n: usize, deadline: Instant) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        timeout(deadline_to_duration(deadline), self.stream.read_exact(&mut buf))
            .await
            .map_err(|_| ErrorKind::Timeout(format!("read_exact({}) from {}", n, self.peer)))?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    Error::from(ErrorKind::PeerGone(format!("{} closed mid-transfer", self.peer)))
                } else {
                    Error::from(e)
                }
            })?;
        Ok(buf)
    }

    /// Write the exact bytes given.
    pub async fn write_all(&mut self, buf: &[u8], deadline: Instant) -> Result<()> {
        timeout(deadline_to_duration(deadline), self.stream.write_all(buf))
            .await
            .map_err(|_| ErrorKind::Timeout(format!("write_all to {}", self.peer)))??;
        Ok(())
    }

    /// Format and write one newline-terminated control line, bounded by
    /// `CONTROL_LINE_MAX` (spec.md §4.1 "printf").
    pub async fn write_line(&mut self, line: &str, deadline: Instant) -> Result<()> {
        if line.len() > CONTROL_LINE_MAX {
            bail!(ErrorKind::Protocol(format!("outgoing line exceeds {} bytes", CONTROL_LINE_MAX)));
        }
        let mut framed = String::with_capacity(line.len() + 1);
        framed.push_str(line);
        framed.push('\n');
        self.write_all(framed.as_bytes(), deadline).await
    }

    pub async fn flush(&mut self, deadline: Instant) -> Result<()> {
        timeout(deadline_to_duration(deadline), self.stream.flush())
            .await
            .map_err(|_| ErrorKind::Timeout(format!("flush to {}", self.peer)))??;
        Ok(())
    }

    pub fn remote_address(&self) -> (String, u16) {
        (self.peer.ip().to_string(), self.peer.port())
    }

    pub fn local_address(&self) -> (String, u16) {
        (self.local.ip().to_string(), self.local.port())
    }

    /// A no-op: `tokio`'s sockets are always non-blocking at the OS level,
    /// so there is no mode to switch. Kept as a documented stub for the
    /// `Link` operation named in spec.md §4.1 rather than silently dropped.
    pub fn set_nonblocking(&self, _nonblocking: bool) -> Result<()> {
        Ok(())
    }

    /// Split into an owned read half and write half, so that once the
    /// auth handshake and `ready` negotiation (which need request/response
    /// turn-taking on the whole stream) are done, a session can run a
    /// dedicated reader task and a dedicated writer task concurrently
    /// (spec.md §5: the manager multiplexes many links; each link still
    /// delivers messages strictly FIFO in each direction).
    pub fn into_split(self) -> (LinkReader, LinkWriter) {
        let peer = self.peer;
        let local = self.local;
        let stream = self.stream.into_inner();
        let (read_half, write_half) = stream.into_split();
        (
            LinkReader { stream: BufReader::new(read_half), peer },
            LinkWriter { stream: write_half, peer, local },
        )
    }
}

#[async_trait]
impl LinkRead for Link {
    async fn read_line(&mut self, max: usize, deadline: Instant) -> Result<String> {
        Link::read_line(self, max, deadline).await
    }
    async fn read_exact(&mut self, n: usize, deadline: Instant) -> Result<Vec<u8>> {
        Link::read_exact(self, n, deadline).await
    }
}

#[async_trait]
impl LinkWrite for Link {
    async fn write_all(&mut self, buf: &[u8], deadline: Instant) -> Result<()> {
        Link::write_all(self, buf, deadline).await
    }
}

/// The read half of a split `Link`.
pub struct LinkReader {
    stream: BufReader<OwnedReadHalf>,
    peer: SocketAddr,
}

impl LinkReader {
    pub async fn read_line(&mut self, max: usize, deadline: Instant) -> Result<String> {
        let mut buf = String::new();
        let read = timeout(deadline_to_duration(deadline), self.stream.read_line(&mut buf))
            .await
            .map_err(|_| ErrorKind::Timeout(format!("read_line from {}", self.peer)))??;
        if read == 0 {
            bail!(ErrorKind::PeerGone(format!("{} closed while reading a line", self.peer)));
        }
        while buf.ends_with('\n') || buf.ends_with('\r') {
            buf.pop();
        }
        if buf.len() > max {
            bail!(ErrorKind::Protocol(format!("line exceeds {} bytes", max)));
        }
        Ok(buf)
    }

    pub async fn read_verb_line(&mut self, max: usize, deadline: Instant) -> Result<(String, Vec<String>)> {
        let line = self.read_line(max, deadline).await?;
        let mut tokens = line.split_whitespace();
        let verb = tokens.next().unwrap_or("").to_string();
        let rest = tokens.map(|s| s.to_string()).collect();
        Ok((verb, rest))
    }

    pub async fn read_exact(&mut self, n: usize, deadline: Instant) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        timeout(deadline_to_duration(deadline), self.stream.read_exact(&mut buf))
            .await
            .map_err(|_| ErrorKind::Timeout(format!("read_exact({}) from {}", n, self.peer)))?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    Error::from(ErrorKind::PeerGone(format!("{} closed mid-transfer", self.peer)))
                } else {
                    Error::from(e)
                }
            })?;
        Ok(buf)
    }

    pub fn remote_address(&self) -> (String, u16) {
        (self.peer.ip().to_string(), self.peer.port())
    }
}

#[async_trait]
impl LinkRead for LinkReader {
    async fn read_line(&mut self, max: usize, deadline: Instant) -> Result<String> {
        LinkReader::read_line(self, max, deadline).await
    }
    async fn read_exact(&mut self, n: usize, deadline: Instant) -> Result<Vec<u8>> {
        LinkReader::read_exact(self, n, deadline).await
    }
}

/// The write half of a split `Link`.
pub struct LinkWriter {
    stream: OwnedWriteHalf,
    peer: SocketAddr,
    local: SocketAddr,
}

impl LinkWriter {
    pub async fn write_all(&mut self, buf: &[u8], deadline: Instant) -> Result<()> {
        timeout(deadline_to_duration(deadline), self.stream.write_all(buf))
            .await
            .map_err(|_| ErrorKind::Timeout(format!("write_all to {}", self.peer)))??;
        Ok(())
    }

    pub async fn write_line(&mut self, line: &str, deadline: Instant) -> Result<()> {
        if line.len() > CONTROL_LINE_MAX {
            bail!(ErrorKind::Protocol(format!("outgoing line exceeds {} bytes", CONTROL_LINE_MAX)));
        }
        let mut framed = String::with_capacity(line.len() + 1);
        framed.push_str(line);
        framed.push('\n');
        self.write_all(framed.as_bytes(), deadline).await
    }

    pub async fn flush(&mut self, deadline: Instant) -> Result<()> {
        timeout(deadline_to_duration(deadline), self.stream.flush())
            .await
            .map_err(|_| ErrorKind::Timeout(format!("flush to {}", self.peer)))??;
        Ok(())
    }

    pub fn remote_address(&self) -> (String, u16) {
        (self.peer.ip().to_string(), self.peer.port())
    }

    pub fn local_address(&self) -> (String, u16) {
        (self.local.ip().to_string(), self.local.port())
    }
}

#[async_trait]
impl LinkWrite for LinkWriter {
    async fn write_all(&mut self, buf: &[u8], deadline: Instant) -> Result<()> {
        LinkWriter::write_all(self, buf, deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn line_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut link = Link::new(stream).unwrap();
            let deadline = Instant::now() + std::time::Duration::from_secs(2);
            let line = link.read_line(CONTROL_LINE_MAX, deadline).await.unwrap();
            assert_eq!(line, "hello worker");
            link.write_line("ack", deadline).await.unwrap();
        });

        let deadline = Instant::now() + std::time::Duration::from_secs(2);
        let mut client = Link::connect(addr, deadline).await.unwrap();
        client.write_line("hello worker", deadline).await.unwrap();
        let resp = client.read_line(CONTROL_LINE_MAX, deadline).await.unwrap();
        assert_eq!(resp, "ack");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn read_line_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Hold the connection open without sending anything.
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            drop(stream);
        });

        let connect_deadline = Instant::now() + std::time::Duration::from_secs(2);
        let mut client = Link::connect(addr, connect_deadline).await.unwrap();
        let short_deadline = Instant::now() + std::time::Duration::from_millis(50);
        let err = client.read_line(CONTROL_LINE_MAX, short_deadline).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Timeout(_)));
    }
}
