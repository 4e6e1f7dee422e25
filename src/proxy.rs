// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! The CONNECT-UDP proxy: upgrades validated requests into bidirectional
//! UDP ↔ HTTP-datagram bridges and drives them to completion.
//!
//! Each proxied flow runs three tasks: the uplink copies HTTP datagrams to
//! the connected UDP socket, the downlink copies UDP reads back as HTTP
//! datagrams, and the capsule drain discards capsules from the request
//! stream. The drain's clean EOF is the liveness signal that the peer closed
//! the stream; any task exiting tears the flow down and unblocks the other
//! two. [`Proxy::proxy`] returns only after all three have quit.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use http::{HeaderValue, StatusCode};
use thiserror::Error;
use tokio::net::{lookup_host, UdpSocket};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::capsule::skip_capsules;
use crate::coding::VarInt;
use crate::h3::{H3Request, RequestStream, ResponseWriter, H3_NO_ERROR};
use crate::proxy_status::{
    ProxyStatus, ERROR_DESTINATION_UNROUTABLE, ERROR_DNS_ERROR, ERROR_DNS_TIMEOUT, PROXY_STATUS,
    RCODE_NEGATIVE_RESPONSE,
};
use crate::request::{
    parse_connect_udp_request, CapsuleProtocolPolicy, ConnectUdpRequest, RequestParseError,
    CAPSULE_PROTOCOL, CAPSULE_PROTOCOL_HEADER_VALUE,
};
use crate::template::UriTemplate;

/// Read buffer size for the downlink, sized to the conventional Ethernet MTU.
/// Larger UDP payloads would not survive the tunnel unfragmented.
pub const MAX_UDP_PAYLOAD: usize = 1500;

/// Callback deciding whether a resolved target may be proxied.
pub type AllowFn = dyn Fn(&SocketAddr) -> bool + Send + Sync;

/// Configuration for a [`Proxy`].
#[derive(Clone)]
pub struct ProxyConfig {
    /// The proxy's own authority, reported in `Proxy-Status` items
    pub authority: String,
    /// How the Capsule-Protocol request header is validated
    pub capsule_protocol: CapsuleProtocolPolicy,
    /// Whether the Connect-Udp-Bind extension is recognised by the validator.
    /// Bound flows are still refused by the forwarding engine.
    pub enable_bind: bool,
    /// Time limit for resolving and dialing the target
    pub dial_timeout: Duration,
    /// Optional predicate gating resolved targets; rejected targets get 403
    pub allow: Option<Arc<AllowFn>>,
}

impl ProxyConfig {
    /// Configuration with defaults for the given proxy authority.
    pub fn new(authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            capsule_protocol: CapsuleProtocolPolicy::default(),
            enable_bind: false,
            dial_timeout: Duration::from_secs(10),
            allow: None,
        }
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("authority", &self.authority)
            .field("capsule_protocol", &self.capsule_protocol)
            .field("enable_bind", &self.enable_bind)
            .field("dial_timeout", &self.dial_timeout)
            .field("allow", &self.allow.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Statistics for a running proxy
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Flows successfully upgraded
    pub flows_started: AtomicU64,
    /// Flows fully torn down
    pub flows_closed: AtomicU64,
    /// Datagrams forwarded to targets
    pub datagrams_to_target: AtomicU64,
    /// Bytes forwarded to targets
    pub bytes_to_target: AtomicU64,
    /// Datagrams forwarded back to clients
    pub datagrams_to_client: AtomicU64,
    /// Bytes forwarded back to clients
    pub bytes_to_client: AtomicU64,
    /// Datagrams dropped for carrying an unknown context id
    pub dropped_unknown_context: AtomicU64,
}

impl ProxyStats {
    fn record_flow_started(&self) {
        self.flows_started.fetch_add(1, Ordering::Relaxed);
    }

    fn record_flow_closed(&self) {
        self.flows_closed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_to_target(&self, bytes: usize) {
        self.datagrams_to_target.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_target.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_to_client(&self, bytes: usize) {
        self.datagrams_to_client.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_client.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_dropped_context(&self) {
        self.dropped_unknown_context.fetch_add(1, Ordering::Relaxed);
    }

    /// Flows currently alive (started minus closed)
    pub fn active_flows(&self) -> u64 {
        self.flows_started
            .load(Ordering::Relaxed)
            .saturating_sub(self.flows_closed.load(Ordering::Relaxed))
    }
}

/// Why a flow could not be established or why the proxy refused it.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The proxy was closed before or while the flow was set up
    #[error("proxy closed")]
    Closed,

    /// The request asked for a bound flow, which this engine does not forward
    #[error("bind flows are not supported")]
    BindUnsupported,

    /// The request failed validation (status already written)
    #[error(transparent)]
    Request(#[from] RequestParseError),

    /// The allow predicate rejected the resolved target
    #[error("target {0} not allowed")]
    Forbidden(SocketAddr),

    /// The target was not a resolvable `host:port`
    #[error("invalid target {target}: {source}")]
    InvalidTarget {
        /// The offending target
        target: String,
        /// The resolver's complaint
        source: io::Error,
    },

    /// Resolving the target did not finish within the dial timeout
    #[error("resolving {target} timed out")]
    ResolveTimeout {
        /// The target that timed out
        target: String,
    },

    /// Resolving the target failed
    #[error("failed to resolve {target}: {source}")]
    Resolve {
        /// The target that failed to resolve
        target: String,
        /// The underlying resolver error
        source: io::Error,
    },

    /// Dialing the resolved target failed
    #[error("failed to dial {target}: {source}")]
    Dial {
        /// The resolved target
        target: SocketAddr,
        /// The underlying socket error
        source: io::Error,
    },

    /// Writing the HTTP response failed
    #[error("writing response failed: {0}")]
    Io(#[source] io::Error),
}

struct FlowEntry<S> {
    stream: Arc<S>,
    cancel: CancellationToken,
}

/// A CONNECT-UDP proxy over a generic HTTP/3 substrate.
///
/// One `Proxy` serves many concurrent flows. [`close`](Self::close)
/// terminates all of them and waits for every forwarding task to quit.
pub struct Proxy<S: RequestStream> {
    config: ProxyConfig,
    closed: AtomicBool,
    next_flow_id: AtomicU64,
    flows: Mutex<HashMap<u64, FlowEntry<S>>>,
    tasks: TaskTracker,
    stats: Arc<ProxyStats>,
}

impl<S: RequestStream> fmt::Debug for Proxy<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<S: RequestStream> Proxy<S> {
    /// Create a proxy with the given configuration.
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            closed: AtomicBool::new(false),
            next_flow_id: AtomicU64::new(0),
            flows: Mutex::new(HashMap::new()),
            tasks: TaskTracker::new(),
            stats: Arc::new(ProxyStats::default()),
        }
    }

    /// Statistics for this proxy
    pub fn stats(&self) -> Arc<ProxyStats> {
        Arc::clone(&self.stats)
    }

    /// Number of currently registered flows
    pub fn active_flows(&self) -> usize {
        self.flows.lock().expect("flow map lock").len()
    }

    /// Validate a raw Extended-CONNECT request and, on success, proxy it.
    ///
    /// On validation failure the corresponding status is written together
    /// with a details-only `Proxy-Status` item, and the parse error is
    /// returned.
    pub async fn upgrade<W>(
        &self,
        mut w: W,
        req: &H3Request,
        template: &UriTemplate,
    ) -> Result<(), ProxyError>
    where
        W: ResponseWriter<Stream = S>,
    {
        match parse_connect_udp_request(
            req,
            template,
            self.config.capsule_protocol,
            self.config.enable_bind,
        ) {
            Ok(parsed) => self.proxy(w, &parsed).await,
            Err(e) => {
                let ps = ProxyStatus::new(&self.config.authority).details(e.to_string());
                self.refuse(&mut w, e.status(), ps).await?;
                Err(e.into())
            }
        }
    }

    /// Proxy a validated CONNECT-UDP request.
    ///
    /// Resolves the target, dials a connected UDP socket, writes the 200
    /// response with `Capsule-Protocol: ?1`, and runs the datagram bridge
    /// until either side closes. The response status is written here; the
    /// caller must not write it.
    pub async fn proxy<W>(&self, mut w: W, req: &ConnectUdpRequest) -> Result<(), ProxyError>
    where
        W: ResponseWriter<Stream = S>,
    {
        if self.closed.load(Ordering::SeqCst) {
            w.write_head(StatusCode::SERVICE_UNAVAILABLE)
                .await
                .map_err(ProxyError::Io)?;
            return Err(ProxyError::Closed);
        }
        if req.bind {
            let ps = ProxyStatus::new(&self.config.authority).details("bind flows not supported");
            self.refuse(&mut w, StatusCode::NOT_IMPLEMENTED, ps).await?;
            return Err(ProxyError::BindUnsupported);
        }

        let target = req.target.as_str();
        let resolved =
            match tokio::time::timeout(self.config.dial_timeout, lookup_host(target)).await {
                Err(_) => {
                    let ps = ProxyStatus::new(&self.config.authority)
                        .error(ERROR_DNS_TIMEOUT)
                        .details(format!("resolving {target} timed out"));
                    self.refuse(&mut w, StatusCode::GATEWAY_TIMEOUT, ps).await?;
                    return Err(ProxyError::ResolveTimeout {
                        target: target.to_owned(),
                    });
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::InvalidInput => {
                    let ps = ProxyStatus::new(&self.config.authority).details(e.to_string());
                    self.refuse(&mut w, StatusCode::BAD_REQUEST, ps).await?;
                    return Err(ProxyError::InvalidTarget {
                        target: target.to_owned(),
                        source: e,
                    });
                }
                Ok(Err(e)) => {
                    let ps = ProxyStatus::new(&self.config.authority)
                        .error(ERROR_DNS_ERROR)
                        .rcode(RCODE_NEGATIVE_RESPONSE)
                        .details(e.to_string());
                    self.refuse(&mut w, StatusCode::BAD_GATEWAY, ps).await?;
                    return Err(ProxyError::Resolve {
                        target: target.to_owned(),
                        source: e,
                    });
                }
                Ok(Ok(mut addrs)) => match addrs.next() {
                    Some(addr) => addr,
                    None => {
                        let e = io::Error::new(io::ErrorKind::NotFound, "no addresses");
                        let ps = ProxyStatus::new(&self.config.authority)
                            .error(ERROR_DNS_ERROR)
                            .rcode(RCODE_NEGATIVE_RESPONSE)
                            .details(e.to_string());
                        self.refuse(&mut w, StatusCode::BAD_GATEWAY, ps).await?;
                        return Err(ProxyError::Resolve {
                            target: target.to_owned(),
                            source: e,
                        });
                    }
                },
            };

        if let Some(allow) = &self.config.allow {
            if !allow(&resolved) {
                let ps = ProxyStatus::new(&self.config.authority).details("target not allowed");
                self.refuse(&mut w, StatusCode::FORBIDDEN, ps).await?;
                return Err(ProxyError::Forbidden(resolved));
            }
        }

        let socket = match dial_udp(resolved).await {
            Ok(socket) => socket,
            Err(e) => {
                let ps = ProxyStatus::new(&self.config.authority)
                    .error(ERROR_DESTINATION_UNROUTABLE)
                    .details(e.to_string());
                self.refuse(&mut w, StatusCode::BAD_GATEWAY, ps).await?;
                return Err(ProxyError::Dial {
                    target: resolved,
                    source: e,
                });
            }
        };

        self.run_flow(w, socket, Some(resolved)).await
    }

    /// Proxy a validated request over a caller-supplied connected socket.
    ///
    /// Skips resolution and dialing; everything else matches
    /// [`proxy`](Self::proxy).
    pub async fn proxy_connected_socket<W>(
        &self,
        mut w: W,
        req: &ConnectUdpRequest,
        socket: UdpSocket,
    ) -> Result<(), ProxyError>
    where
        W: ResponseWriter<Stream = S>,
    {
        if self.closed.load(Ordering::SeqCst) {
            w.write_head(StatusCode::SERVICE_UNAVAILABLE)
                .await
                .map_err(ProxyError::Io)?;
            return Err(ProxyError::Closed);
        }
        if req.bind {
            let ps = ProxyStatus::new(&self.config.authority).details("bind flows not supported");
            self.refuse(&mut w, StatusCode::NOT_IMPLEMENTED, ps).await?;
            return Err(ProxyError::BindUnsupported);
        }
        let next_hop = socket.peer_addr().ok();
        self.run_flow(w, socket, next_hop).await
    }

    /// Terminate all active flows and wait for every forwarding task.
    ///
    /// New [`proxy`](Self::proxy) calls fail with 503 once this was called;
    /// the flow map is empty when it returns.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let entries: Vec<FlowEntry<S>> = {
                let mut flows = self.flows.lock().expect("flow map lock");
                flows.drain().map(|(_, entry)| entry).collect()
            };
            info!(flows = entries.len(), "closing proxy");
            for entry in &entries {
                entry.stream.stop(H3_NO_ERROR);
                entry.stream.finish();
                entry.cancel.cancel();
            }
        }
        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn refuse<W>(
        &self,
        w: &mut W,
        status: StatusCode,
        ps: ProxyStatus,
    ) -> Result<(), ProxyError>
    where
        W: ResponseWriter<Stream = S>,
    {
        w.headers_mut().insert(&PROXY_STATUS, ps.to_header_value());
        w.write_head(status).await.map_err(ProxyError::Io)
    }

    async fn run_flow<W>(
        &self,
        mut w: W,
        socket: UdpSocket,
        next_hop: Option<SocketAddr>,
    ) -> Result<(), ProxyError>
    where
        W: ResponseWriter<Stream = S>,
    {
        w.headers_mut().insert(
            &CAPSULE_PROTOCOL,
            HeaderValue::from_static(CAPSULE_PROTOCOL_HEADER_VALUE),
        );
        if let Some(hop) = next_hop {
            w.headers_mut().insert(
                &PROXY_STATUS,
                ProxyStatus::new(&self.config.authority)
                    .next_hop(hop)
                    .to_header_value(),
            );
        }
        w.write_head(StatusCode::OK).await.map_err(ProxyError::Io)?;

        let stream = Arc::new(w.into_stream());
        let cancel = CancellationToken::new();
        let flow_id = self.next_flow_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut flows = self.flows.lock().expect("flow map lock");
            if self.closed.load(Ordering::SeqCst) {
                drop(flows);
                stream.stop(H3_NO_ERROR);
                stream.finish();
                return Err(ProxyError::Closed);
            }
            flows.insert(
                flow_id,
                FlowEntry {
                    stream: Arc::clone(&stream),
                    cancel: cancel.clone(),
                },
            );
        }
        self.stats.record_flow_started();
        debug!(flow_id, next_hop = ?next_hop, "proxying flow");

        let socket = Arc::new(socket);
        let uplink = self.tasks.spawn(uplink(
            Arc::clone(&stream),
            Arc::clone(&socket),
            cancel.clone(),
            Arc::clone(&self.stats),
        ));
        let downlink = self.tasks.spawn(downlink(
            Arc::clone(&stream),
            Arc::clone(&socket),
            cancel.clone(),
            Arc::clone(&self.stats),
        ));
        let drain = self.tasks.spawn(drain_capsules(Arc::clone(&stream), cancel.clone()));
        // All three tasks must quit before we return.
        let _ = tokio::join!(uplink, downlink, drain);

        self.flows.lock().expect("flow map lock").remove(&flow_id);
        self.stats.record_flow_closed();
        debug!(flow_id, "flow finished");
        Ok(())
    }
}

async fn dial_udp(target: SocketAddr) -> io::Result<UdpSocket> {
    let local: SocketAddr = if target.is_ipv4() {
        (IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).into()
    } else {
        (IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(target).await?;
    Ok(socket)
}

/// Stream datagram → UDP socket.
async fn uplink<S: RequestStream>(
    stream: Arc<S>,
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
    stats: Arc<ProxyStats>,
) {
    loop {
        let mut data = tokio::select! {
            _ = cancel.cancelled() => break,
            data = stream.recv_datagram() => match data {
                Ok(data) => data,
                Err(e) => {
                    debug!(error = %e, "uplink receive ended");
                    break;
                }
            },
        };
        let context_id = match VarInt::decode(&mut data) {
            Ok(id) => id,
            Err(_) => {
                debug!("dropping malformed datagram");
                continue;
            }
        };
        if context_id.into_inner() != 0 {
            // Unknown context ids are dropped, never a protocol error.
            stats.record_dropped_context();
            continue;
        }
        if let Err(e) = socket.send(&data).await {
            debug!(error = %e, "uplink UDP write failed");
            break;
        }
        stats.record_to_target(data.len());
    }
    stream.finish();
    cancel.cancel();
}

/// UDP socket → stream datagram.
async fn downlink<S: RequestStream>(
    stream: Arc<S>,
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
    stats: Arc<ProxyStats>,
) {
    let mut buf = [0u8; MAX_UDP_PAYLOAD];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            n = socket.recv(&mut buf) => match n {
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "downlink UDP read failed");
                    break;
                }
            },
        };
        let mut data = BytesMut::with_capacity(1 + n);
        data.put_u8(0); // context id zero
        data.put_slice(&buf[..n]);
        if let Err(e) = stream.send_datagram(data.freeze()).await {
            debug!(error = %e, "downlink datagram send failed");
            break;
        }
        stats.record_to_client(n);
    }
    stream.finish();
    cancel.cancel();
}

/// Discard all capsules sent on the request stream; its exit signals that
/// the peer closed the stream.
async fn drain_capsules<S: RequestStream>(stream: Arc<S>, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        res = skip_capsules(stream.as_ref()) => {
            if let Err(e) = res {
                // A teardown racing the read surfaces as a benign error.
                if !cancel.is_cancelled() {
                    warn!(error = %e, "reading from request stream failed");
                }
            }
        }
    }
    stream.finish();
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderMap, Method};
    use url::Url;

    use crate::h3::H3Request;
    use crate::request::CONNECT_UDP_PROTOCOL;

    /// Stream stub for refusal paths; no I/O ever happens on it.
    struct NullStream;

    impl RequestStream for NullStream {
        async fn recv_datagram(&self) -> io::Result<Bytes> {
            std::future::pending().await
        }

        async fn send_datagram(&self, _data: Bytes) -> io::Result<()> {
            Ok(())
        }

        async fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
            std::future::pending().await
        }

        fn stop(&self, _code: u64) {}

        fn finish(&self) {}
    }

    /// Records the response head the engine writes.
    struct RecordingWriter {
        headers: HeaderMap,
        written: Arc<Mutex<Option<(StatusCode, HeaderMap)>>>,
    }

    fn recording_writer() -> (RecordingWriter, Arc<Mutex<Option<(StatusCode, HeaderMap)>>>) {
        let written = Arc::new(Mutex::new(None));
        (
            RecordingWriter {
                headers: HeaderMap::new(),
                written: Arc::clone(&written),
            },
            written,
        )
    }

    impl ResponseWriter for RecordingWriter {
        type Stream = NullStream;

        fn headers_mut(&mut self) -> &mut HeaderMap {
            &mut self.headers
        }

        async fn write_head(&mut self, status: StatusCode) -> io::Result<()> {
            *self.written.lock().unwrap() = Some((status, self.headers.clone()));
            Ok(())
        }

        fn into_stream(self) -> NullStream {
            NullStream
        }
    }

    fn test_proxy() -> Proxy<NullStream> {
        Proxy::new(ProxyConfig::new("localhost:1234"))
    }

    #[tokio::test]
    async fn closed_proxy_writes_503() {
        let proxy = test_proxy();
        proxy.close().await;

        let (writer, written) = recording_writer();
        let req = ConnectUdpRequest {
            target: "localhost:443".to_owned(),
            bind: false,
        };
        let err = proxy.proxy(writer, &req).await.unwrap_err();
        assert!(matches!(err, ProxyError::Closed));
        let (status, _) = written.lock().unwrap().clone().unwrap();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn bind_flows_are_refused_with_501() {
        let proxy = test_proxy();
        let (writer, written) = recording_writer();
        let req = ConnectUdpRequest {
            target: "*:*".to_owned(),
            bind: true,
        };
        let err = proxy.proxy(writer, &req).await.unwrap_err();
        assert!(matches!(err, ProxyError::BindUnsupported));
        let (status, headers) = written.lock().unwrap().clone().unwrap();
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert!(headers.contains_key(&PROXY_STATUS));
        proxy.close().await;
    }

    #[tokio::test]
    async fn upgrade_writes_validator_status_and_details() {
        let proxy = test_proxy();
        let template =
            UriTemplate::parse("https://localhost:1234/masque?h={target_host}&p={target_port}")
                .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(&CAPSULE_PROTOCOL, HeaderValue::from_static("?1"));
        let req = H3Request {
            method: Method::HEAD,
            protocol: Some(CONNECT_UDP_PROTOCOL.to_owned()),
            authority: "localhost:1234".to_owned(),
            url: Url::parse("https://localhost:1234/masque?h=localhost&p=443").unwrap(),
            headers,
        };

        let (writer, written) = recording_writer();
        let err = proxy.upgrade(writer, &req, &template).await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Request(RequestParseError::MethodMismatch(_))
        ));
        let (status, headers) = written.lock().unwrap().clone().unwrap();
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        let ps = headers.get(&PROXY_STATUS).unwrap().to_str().unwrap();
        assert!(ps.contains("details="), "{ps}");
        assert!(!ps.contains("; error="), "{ps}");
        proxy.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let proxy = test_proxy();
        proxy.close().await;
        proxy.close().await;
        assert_eq!(proxy.active_flows(), 0);
    }
}
