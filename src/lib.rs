// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! CONNECT-UDP proxying over HTTP/3 (RFC 9298).
//!
//! A client tunnels UDP datagrams to an arbitrary `host:port` target through
//! an HTTP/3 proxy. Three cooperating roles live in this crate:
//!
//! - [`Client`]: dials the proxy once, then opens one Extended-CONNECT
//!   request stream per tunneled flow and hands back a [`ProxiedConn`], a
//!   UDP-socket-like packet connection with read deadlines.
//! - The request validator ([`parse_connect_udp_request`]): checks method,
//!   `:protocol`, authority, and the `Capsule-Protocol` header against the
//!   proxy's URI template and extracts the target. A CONNECT-IP sibling
//!   ([`parse_connect_ip_request`]) validates IP-proxying requests and the
//!   [`capsule`] module parses its typed control capsules.
//! - [`Proxy`]: upgrades validated requests into a three-task datagram
//!   bridge between the request stream and a connected UDP socket, with
//!   `Proxy-Status` reporting on failures and coordinated shutdown.
//!
//! # Wire format
//!
//! UDP payloads travel as HTTP datagrams: a context-id varint (zero for UDP)
//! followed by the payload. The request stream itself only carries capsules
//! (`type`/`length`/`value` frames), which both sides drain and discard.
//!
//! ```text
//! client app ── UDP-like API ──► ProxiedConn ──► HTTP datagram (0x00 ‖ payload)
//!                                                        │
//!                                              QUIC datagram, request stream
//!                                                        ▼
//!                                                      Proxy
//!                                                        │
//!                                               connected UDP socket
//!                                                        ▼
//!                                                  target host:port
//! ```
//!
//! # Substrate
//!
//! The QUIC/HTTP-3 machinery itself is pluggable: everything is generic over
//! the traits in [`h3`] ([`h3::RequestStream`], [`h3::Connector`], ...),
//! which mirror what any HTTP/3 library with Extended CONNECT and datagram
//! support exposes.
//!
//! # Example
//!
//! ```rust,ignore
//! use masque::{Client, UriTemplate};
//!
//! let template =
//!     UriTemplate::parse("https://proxy.example:443/masque?h={target_host}&p={target_port}")?;
//! let client = Client::new(template, connector)?;
//! let conn = client.dial("192.0.2.7:7777".parse()?).await?;
//! conn.write_to(b"ping", "192.0.2.7:7777".parse()?).await?;
//! let mut buf = [0u8; 1500];
//! let (n, from) = conn.read_from(&mut buf).await?;
//! ```

#![warn(missing_docs)]

pub mod capsule;
mod client;
pub mod coding;
mod conn;
pub mod h3;
mod proxy;
mod proxy_status;
mod request;
mod template;

pub use client::{Client, DialError};
pub use conn::ProxiedConn;
pub use proxy::{
    AllowFn, Proxy, ProxyConfig, ProxyError, ProxyStats, MAX_UDP_PAYLOAD,
};
pub use proxy_status::{
    ProxyStatus, ERROR_DESTINATION_UNROUTABLE, ERROR_DNS_ERROR, ERROR_DNS_TIMEOUT, PROXY_STATUS,
    RCODE_NEGATIVE_RESPONSE, RCODE_SERVFAIL,
};
pub use request::{
    parse_connect_ip_request, parse_connect_udp_request, CapsuleProtocolPolicy, ConnectIpRequest,
    ConnectUdpRequest, RequestParseError, CAPSULE_PROTOCOL, CAPSULE_PROTOCOL_HEADER_VALUE,
    CONNECT_IP_PROTOCOL, CONNECT_UDP_BIND, CONNECT_UDP_PROTOCOL, TEMPLATE_TARGET_HOST,
    TEMPLATE_TARGET_PORT,
};
pub use template::{TemplateError, UriTemplate};
