// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! In-memory HTTP/3 substrate for end-to-end tests.
//!
//! Implements the `masque::h3` traits over channels: paired request streams
//! carry datagrams and stream bytes between a client connector and a server
//! acceptor, with UDP-like silent dropping of oversize datagrams. Doubles as
//! the reference for binding a real HTTP/3 stack.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use bytes::{Buf, Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use masque::h3::{
    ClientRequestStream, Connection, Connector, H3Request, RequestStream, ResponseHead,
    ResponseWriter, Settings, TransportConfig,
};
use masque::{Proxy, UriTemplate, MAX_UDP_PAYLOAD};

/// Context-id byte plus a full UDP payload.
pub const DEFAULT_MAX_DATAGRAM: usize = MAX_UDP_PAYLOAD + 1;

/// Settings of a spec-compliant CONNECT-UDP proxy.
pub fn h3_settings() -> Settings {
    Settings {
        enable_extended_connect: true,
        enable_datagrams: true,
    }
}

struct ByteReader {
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: BytesMut,
}

/// One half of a paired request stream.
pub struct MemoryStream {
    dgram_rx: AsyncMutex<mpsc::UnboundedReceiver<Bytes>>,
    dgram_tx: mpsc::UnboundedSender<Bytes>,
    bytes_rx: AsyncMutex<ByteReader>,
    bytes_tx: StdMutex<Option<mpsc::UnboundedSender<Bytes>>>,
    stopped: CancellationToken,
    peer_stopped: CancellationToken,
    max_datagram: usize,
}

impl MemoryStream {
    /// Push raw bytes (e.g. a capsule frame) onto the peer's byte stream.
    pub fn send_stream_bytes(&self, data: &[u8]) -> bool {
        let tx = self.bytes_tx.lock().unwrap();
        match tx.as_ref() {
            Some(tx) => tx.send(Bytes::copy_from_slice(data)).is_ok(),
            None => false,
        }
    }

    /// Whether the peer stopped its receive side.
    pub fn peer_stopped(&self) -> bool {
        self.peer_stopped.is_cancelled()
    }
}

impl RequestStream for MemoryStream {
    async fn recv_datagram(&self) -> io::Result<Bytes> {
        let mut rx = self.dgram_rx.lock().await;
        tokio::select! {
            _ = self.stopped.cancelled() => Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "receive side stopped",
            )),
            data = rx.recv() => data.ok_or_else(|| {
                io::Error::new(io::ErrorKind::BrokenPipe, "peer closed")
            }),
        }
    }

    async fn send_datagram(&self, data: Bytes) -> io::Result<()> {
        if self.peer_stopped.is_cancelled() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "peer stopped receiving",
            ));
        }
        // Oversize datagrams vanish, matching UDP send-side behavior.
        if data.len() > self.max_datagram {
            return Ok(());
        }
        self.dgram_tx
            .send(data)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"))
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut reader = self.bytes_rx.lock().await;
        loop {
            if !reader.pending.is_empty() {
                let n = buf.len().min(reader.pending.len());
                buf[..n].copy_from_slice(&reader.pending[..n]);
                reader.pending.advance(n);
                return Ok(n);
            }
            tokio::select! {
                _ = self.stopped.cancelled() => return Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "receive side stopped",
                )),
                chunk = reader.rx.recv() => match chunk {
                    Some(chunk) => reader.pending.extend_from_slice(&chunk),
                    None => return Ok(0),
                },
            }
        }
    }

    fn stop(&self, _code: u64) {
        self.stopped.cancel();
    }

    fn finish(&self) {
        self.bytes_tx.lock().unwrap().take();
    }
}

/// Build a connected pair of streams. `parent` ties the first half's receive
/// lifetime to a connection token.
fn stream_pair_inner(
    max_datagram: usize,
    parent: Option<&CancellationToken>,
) -> (MemoryStream, MemoryStream) {
    let (a_dgram_tx, b_dgram_rx) = mpsc::unbounded_channel();
    let (b_dgram_tx, a_dgram_rx) = mpsc::unbounded_channel();
    let (a_bytes_tx, b_bytes_rx) = mpsc::unbounded_channel();
    let (b_bytes_tx, a_bytes_rx) = mpsc::unbounded_channel();
    let a_stopped = match parent {
        Some(parent) => parent.child_token(),
        None => CancellationToken::new(),
    };
    let b_stopped = CancellationToken::new();
    let a = MemoryStream {
        dgram_rx: AsyncMutex::new(a_dgram_rx),
        dgram_tx: a_dgram_tx,
        bytes_rx: AsyncMutex::new(ByteReader {
            rx: a_bytes_rx,
            pending: BytesMut::new(),
        }),
        bytes_tx: StdMutex::new(Some(a_bytes_tx)),
        stopped: a_stopped.clone(),
        peer_stopped: b_stopped.clone(),
        max_datagram,
    };
    let b = MemoryStream {
        dgram_rx: AsyncMutex::new(b_dgram_rx),
        dgram_tx: b_dgram_tx,
        bytes_rx: AsyncMutex::new(ByteReader {
            rx: b_bytes_rx,
            pending: BytesMut::new(),
        }),
        bytes_tx: StdMutex::new(Some(b_bytes_tx)),
        stopped: b_stopped,
        peer_stopped: a_stopped,
        max_datagram,
    };
    (a, b)
}

/// A connected pair of raw request streams.
pub fn stream_pair() -> (MemoryStream, MemoryStream) {
    stream_pair_inner(DEFAULT_MAX_DATAGRAM, None)
}

/// A client-side request stream: the raw stream plus the head exchange.
pub struct ClientStream {
    inner: MemoryStream,
    head_tx: StdMutex<Option<oneshot::Sender<H3Request>>>,
    resp_rx: AsyncMutex<Option<oneshot::Receiver<ResponseHead>>>,
}

impl RequestStream for ClientStream {
    async fn recv_datagram(&self) -> io::Result<Bytes> {
        self.inner.recv_datagram().await
    }

    async fn send_datagram(&self, data: Bytes) -> io::Result<()> {
        self.inner.send_datagram(data).await
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).await
    }

    fn stop(&self, code: u64) {
        self.inner.stop(code);
    }

    fn finish(&self) {
        self.inner.finish();
    }
}

impl ClientRequestStream for ClientStream {
    async fn send_request(&self, head: &H3Request) -> io::Result<()> {
        let tx = self.head_tx.lock().unwrap().take();
        match tx {
            Some(tx) => tx
                .send(head.clone())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "server gone")),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "request already sent",
            )),
        }
    }

    async fn read_response(&self) -> io::Result<ResponseHead> {
        let rx = self.resp_rx.lock().await.take();
        match rx {
            Some(rx) => rx
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "server gone")),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "response already read",
            )),
        }
    }
}

struct IncomingStream {
    head_rx: oneshot::Receiver<H3Request>,
    stream: MemoryStream,
    resp_tx: oneshot::Sender<ResponseHead>,
}

/// A client-side in-memory HTTP/3 connection.
pub struct MemoryConnection {
    settings: Settings,
    accept_tx: mpsc::UnboundedSender<IncomingStream>,
    token: CancellationToken,
    max_datagram: usize,
}

impl Connection for MemoryConnection {
    type Stream = ClientStream;

    async fn remote_settings(&self) -> io::Result<Settings> {
        Ok(self.settings)
    }

    async fn open_request_stream(&self) -> io::Result<ClientStream> {
        if self.token.is_cancelled() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed",
            ));
        }
        let (client_half, server_half) = stream_pair_inner(self.max_datagram, Some(&self.token));
        let (head_tx, head_rx) = oneshot::channel();
        let (resp_tx, resp_rx) = oneshot::channel();
        self.accept_tx
            .send(IncomingStream {
                head_rx,
                stream: server_half,
                resp_tx,
            })
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "server gone"))?;
        Ok(ClientStream {
            inner: client_half,
            head_tx: StdMutex::new(Some(head_tx)),
            resp_rx: AsyncMutex::new(Some(resp_rx)),
        })
    }

    fn close(&self, _code: u64) {
        self.token.cancel();
    }
}

/// Connects clients to the in-memory server endpoint.
pub struct MemoryConnector {
    settings: Settings,
    accept_tx: mpsc::UnboundedSender<IncomingStream>,
    max_datagram: usize,
}

impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(
        &self,
        _authority: &str,
        _config: &TransportConfig,
    ) -> io::Result<MemoryConnection> {
        Ok(MemoryConnection {
            settings: self.settings,
            accept_tx: self.accept_tx.clone(),
            token: CancellationToken::new(),
            max_datagram: self.max_datagram,
        })
    }
}

/// Server-side writer for one request's response head.
pub struct MemoryResponseWriter {
    headers: HeaderMap,
    resp_tx: Option<oneshot::Sender<ResponseHead>>,
    stream: Option<MemoryStream>,
}

impl ResponseWriter for MemoryResponseWriter {
    type Stream = MemoryStream;

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    async fn write_head(&mut self, status: StatusCode) -> io::Result<()> {
        if let Some(tx) = self.resp_tx.take() {
            let _ = tx.send(ResponseHead {
                status,
                headers: self.headers.clone(),
            });
        }
        Ok(())
    }

    fn into_stream(mut self) -> MemoryStream {
        self.stream.take().expect("request stream already taken")
    }
}

/// Accepts request streams on the in-memory server endpoint.
pub struct Acceptor {
    rx: mpsc::UnboundedReceiver<IncomingStream>,
}

impl Acceptor {
    /// Next request head plus its response writer; `None` once all
    /// connectors are gone.
    pub async fn accept(&mut self) -> Option<(H3Request, MemoryResponseWriter)> {
        loop {
            let incoming = self.rx.recv().await?;
            // The client may drop the stream before sending the head.
            let Ok(head) = incoming.head_rx.await else {
                continue;
            };
            return Some((
                head,
                MemoryResponseWriter {
                    headers: HeaderMap::new(),
                    resp_tx: Some(incoming.resp_tx),
                    stream: Some(incoming.stream),
                },
            ));
        }
    }
}

/// An in-memory substrate endpoint pair with the default datagram ceiling.
pub fn substrate(settings: Settings) -> (MemoryConnector, Acceptor) {
    substrate_with_max_datagram(settings, DEFAULT_MAX_DATAGRAM)
}

/// An in-memory substrate endpoint pair with an explicit datagram ceiling.
pub fn substrate_with_max_datagram(
    settings: Settings,
    max_datagram: usize,
) -> (MemoryConnector, Acceptor) {
    let (accept_tx, rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            settings,
            accept_tx,
            max_datagram,
        },
        Acceptor { rx },
    )
}

/// Serve CONNECT-UDP upgrades for every accepted request stream.
pub fn spawn_proxy(proxy: Arc<Proxy<MemoryStream>>, template: UriTemplate, mut acceptor: Acceptor) {
    tokio::spawn(async move {
        let template = Arc::new(template);
        while let Some((head, writer)) = acceptor.accept().await {
            let proxy = Arc::clone(&proxy);
            let template = Arc::clone(&template);
            tokio::spawn(async move {
                let _ = proxy.upgrade(writer, &head, &template).await;
            });
        }
    });
}

/// A UDP echo server on localhost; returns its address.
pub async fn udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind echo");
    let addr = socket.local_addr().expect("echo addr");
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}
