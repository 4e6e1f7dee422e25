// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! The seam towards the HTTP/3 + QUIC-datagram substrate.
//!
//! This crate does not ship an HTTP/3 implementation. It codes against the
//! small set of operations an upgraded Extended-CONNECT request stream has to
//! provide: sending and receiving HTTP datagrams, reading the capsule byte
//! stream, and cancelling or finishing either direction. Bindings implement
//! these traits on top of their HTTP/3 library of choice; the integration
//! tests carry an in-memory implementation that doubles as a reference.
//!
//! All async trait methods must be cancel-safe: the proxy engine and the
//! proxied packet connection drop in-flight futures when a flow is torn down
//! or a read deadline fires.

use std::future::Future;
use std::io;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use url::Url;

/// The HTTP/3 "no error" application error code (H3_NO_ERROR).
///
/// Used for benign stream cancellation when a tunnel closes.
pub const H3_NO_ERROR: u64 = 0x100;

/// HTTP/3 settings relevant to CONNECT-UDP, as negotiated by the peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Settings {
    /// Whether the peer enabled Extended CONNECT (RFC 9220)
    pub enable_extended_connect: bool,
    /// Whether the peer enabled HTTP datagrams (RFC 9297)
    pub enable_datagrams: bool,
}

/// Transport parameters the dialer requests from the substrate.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Whether QUIC datagram support is negotiated. Must be `true` for
    /// CONNECT-UDP to function.
    pub enable_datagrams: bool,
    /// Initial QUIC packet size. Raised above the 1200-byte default so that
    /// tunneled full-size UDP payloads fit without IP fragmentation when
    /// proxying is nested.
    pub initial_packet_size: u16,
    /// ALPN protocols offered during the TLS handshake.
    pub alpn: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            enable_datagrams: true,
            initial_packet_size: 1350,
            alpn: vec!["h3".to_owned()],
        }
    }
}

/// An Extended-CONNECT request head.
///
/// On the server side this is what the substrate hands to the request
/// validator; on the client side it is what the dialer sends.
#[derive(Debug, Clone)]
pub struct H3Request {
    /// `:method`
    pub method: Method,
    /// `:protocol` pseudo-header, when present
    pub protocol: Option<String>,
    /// `:authority`
    pub authority: String,
    /// The full request URL (scheme, authority, path, query)
    pub url: Url,
    /// Regular header fields
    pub headers: HeaderMap,
}

/// A response head as read from a request stream.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// HTTP status code
    pub status: StatusCode,
    /// Response header fields
    pub headers: HeaderMap,
}

/// An upgraded HTTP/3 request stream carrying capsules and HTTP datagrams.
///
/// The byte stream itself carries only capsules; UDP payloads travel as HTTP
/// datagrams flow-associated with the stream. One stream is shared by up to
/// three concurrent tasks, so every method takes `&self`.
pub trait RequestStream: Send + Sync + 'static {
    /// Receive the next HTTP datagram associated with this stream.
    ///
    /// Errors once the receive side was cancelled or the connection is gone.
    fn recv_datagram(&self) -> impl Future<Output = io::Result<Bytes>> + Send;

    /// Send an HTTP datagram associated with this stream.
    ///
    /// Datagrams are unreliable; the substrate may drop them under
    /// backpressure or when they exceed the session's datagram size limit.
    fn send_datagram(&self, data: Bytes) -> impl Future<Output = io::Result<()>> + Send;

    /// Read bytes from the request stream (the capsule sequence).
    ///
    /// Returns `Ok(0)` once the peer finished the stream cleanly. Only one
    /// task reads the byte stream at a time.
    fn read(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Cancel the receive side with an application error code.
    ///
    /// Must promptly unblock pending [`recv_datagram`](Self::recv_datagram)
    /// and [`read`](Self::read) calls.
    fn stop(&self, code: u64);

    /// Close the send direction of the stream. Idempotent.
    fn finish(&self);
}

/// A client-side request stream before and during the CONNECT handshake.
pub trait ClientRequestStream: RequestStream {
    /// Send the request head.
    fn send_request(&self, head: &H3Request) -> impl Future<Output = io::Result<()>> + Send;

    /// Read the response head.
    fn read_response(&self) -> impl Future<Output = io::Result<ResponseHead>> + Send;
}

/// Server-side handle for writing the response head of one request.
///
/// The proxy engine writes the status; callers may only add auxiliary headers
/// (e.g. `Proxy-Status`) before handing the writer over. The upgraded stream
/// is only reachable through [`into_stream`](Self::into_stream), after the
/// head was written.
pub trait ResponseWriter: Send {
    /// The upgraded stream type this writer yields.
    type Stream: RequestStream;

    /// Response headers, mutable until the head is written.
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Write the response head with the given status.
    fn write_head(&mut self, status: StatusCode) -> impl Future<Output = io::Result<()>> + Send;

    /// Take the upgraded request stream.
    fn into_stream(self) -> Self::Stream;
}

/// A client-side HTTP/3 connection.
pub trait Connection: Send + Sync + 'static {
    /// The request stream type opened on this connection.
    type Stream: ClientRequestStream;

    /// Wait for and return the peer's HTTP/3 SETTINGS.
    fn remote_settings(&self) -> impl Future<Output = io::Result<Settings>> + Send;

    /// Open a new request stream.
    fn open_request_stream(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// Close the connection with an application error code.
    fn close(&self, code: u64);
}

/// Establishes HTTP/3 connections for the client dialer.
pub trait Connector: Send + Sync + 'static {
    /// The connection type produced by this connector.
    type Connection: Connection;

    /// Dial a QUIC connection to `authority` and attach an HTTP/3 client
    /// with datagram support per `config`.
    fn connect(
        &self,
        authority: &str,
        config: &TransportConfig,
    ) -> impl Future<Output = io::Result<Self::Connection>> + Send;
}
