// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! The CONNECT-UDP client: dials the proxy once, then opens one
//! Extended-CONNECT request stream per tunneled flow.

use std::io;
use std::net::SocketAddr;

use http::{HeaderMap, HeaderValue, Method};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::debug;
use url::Url;

use crate::conn::ProxiedConn;
use crate::h3::{
    ClientRequestStream, Connection, Connector, H3Request, RequestStream, ResponseHead,
    TransportConfig, H3_NO_ERROR,
};
use crate::request::{
    template_authority, CAPSULE_PROTOCOL, CAPSULE_PROTOCOL_HEADER_VALUE, CONNECT_UDP_PROTOCOL,
    TEMPLATE_TARGET_HOST, TEMPLATE_TARGET_PORT,
};
use crate::template::{TemplateError, UriTemplate};

type StreamOf<C> = <<C as Connector>::Connection as Connection>::Stream;

/// Why dialing a proxied flow failed.
#[derive(Debug, Error)]
pub enum DialError {
    /// The transport configuration disables QUIC datagrams
    #[error("transport config needs to enable datagrams")]
    DatagramsDisabled,

    /// The template could not provide the proxy authority
    #[error("invalid URI template: {0}")]
    InvalidTemplate(String),

    /// Expanding the URI template failed
    #[error("failed to expand URI template: {0}")]
    Template(#[from] TemplateError),

    /// The expanded URI was not a valid URL
    #[error("failed to parse expanded URI: {0}")]
    InvalidUri(String),

    /// The target was not a `host:port` pair
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// Establishing the QUIC/HTTP-3 connection failed
    #[error("dialing QUIC connection failed: {0}")]
    Connect(#[source] io::Error),

    /// The proxy did not enable Extended CONNECT in its settings
    #[error("server didn't enable Extended CONNECT")]
    ExtendedConnectDisabled,

    /// The proxy did not enable HTTP datagrams in its settings
    #[error("server didn't enable Datagrams")]
    DatagramsNotNegotiated,

    /// Opening the request stream failed
    #[error("failed to open request stream: {0}")]
    OpenStream(#[source] io::Error),

    /// Sending the request head failed
    #[error("failed to send request: {0}")]
    SendRequest(#[source] io::Error),

    /// Reading the response head failed
    #[error("failed to read response: {0}")]
    ReadResponse(#[source] io::Error),

    /// The proxy answered with a non-2xx status. The response head stays
    /// inspectable.
    #[error("server responded with {}", .response.status)]
    Refused {
        /// The refusing response
        response: ResponseHead,
    },
}

/// A CONNECT-UDP client bound to one proxy.
///
/// The first [`dial`](Self::dial) establishes the QUIC/HTTP-3 connection;
/// later dials reuse it, one request stream per flow.
pub struct Client<C: Connector> {
    template: UriTemplate,
    authority: String,
    connector: C,
    transport: TransportConfig,
    conn: OnceCell<C::Connection>,
}

impl<C: Connector> std::fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("authority", &self.authority)
            .field("template", &self.template.raw())
            .field("connected", &self.conn.initialized())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> Client<C> {
    /// Create a client with the default transport configuration.
    pub fn new(template: UriTemplate, connector: C) -> Result<Self, DialError> {
        Self::with_transport(template, connector, TransportConfig::default())
    }

    /// Create a client with an explicit transport configuration.
    ///
    /// Fails if the configuration disables QUIC datagrams.
    pub fn with_transport(
        template: UriTemplate,
        connector: C,
        transport: TransportConfig,
    ) -> Result<Self, DialError> {
        if !transport.enable_datagrams {
            return Err(DialError::DatagramsDisabled);
        }
        let authority =
            template_authority(&template).map_err(|e| DialError::InvalidTemplate(e.to_string()))?;
        Ok(Self {
            template,
            authority,
            connector,
            transport,
            conn: OnceCell::new(),
        })
    }

    /// The proxy authority this client dials
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Tunnel a flow to a resolved target address.
    pub async fn dial(&self, target: SocketAddr) -> Result<ProxiedConn<StreamOf<C>>, DialError> {
        let host = target.ip().to_string();
        let port = target.port().to_string();
        self.dial_target(&host, &port, Some(target)).await
    }

    /// Tunnel a flow to a `host:port` target.
    ///
    /// Hostnames are forwarded to the proxy without local resolution.
    pub async fn dial_addr(&self, target: &str) -> Result<ProxiedConn<StreamOf<C>>, DialError> {
        let (host, port) =
            split_host_port(target).ok_or_else(|| DialError::InvalidTarget(target.to_owned()))?;
        let remote = target.parse().ok();
        self.dial_target(host, port, remote).await
    }

    async fn dial_target(
        &self,
        host: &str,
        port: &str,
        remote: Option<SocketAddr>,
    ) -> Result<ProxiedConn<StreamOf<C>>, DialError> {
        // Colons in IP literals are escaped as %3A by simple string expansion.
        let expanded = self
            .template
            .expand(&[(TEMPLATE_TARGET_HOST, host), (TEMPLATE_TARGET_PORT, port)])?;
        let url = Url::parse(&expanded).map_err(|e| DialError::InvalidUri(e.to_string()))?;

        let conn = self
            .conn
            .get_or_try_init(|| async {
                debug!(authority = %self.authority, "dialing proxy");
                self.connector
                    .connect(&self.authority, &self.transport)
                    .await
                    .map_err(DialError::Connect)
            })
            .await?;

        let settings = conn.remote_settings().await.map_err(DialError::Connect)?;
        if !settings.enable_extended_connect {
            return Err(DialError::ExtendedConnectDisabled);
        }
        if !settings.enable_datagrams {
            return Err(DialError::DatagramsNotNegotiated);
        }

        let stream = conn
            .open_request_stream()
            .await
            .map_err(DialError::OpenStream)?;
        let mut headers = HeaderMap::new();
        headers.insert(
            &CAPSULE_PROTOCOL,
            HeaderValue::from_static(CAPSULE_PROTOCOL_HEADER_VALUE),
        );
        let head = H3Request {
            method: Method::CONNECT,
            protocol: Some(CONNECT_UDP_PROTOCOL.to_owned()),
            authority: self.authority.clone(),
            url,
            headers,
        };
        stream
            .send_request(&head)
            .await
            .map_err(DialError::SendRequest)?;
        let response = stream
            .read_response()
            .await
            .map_err(DialError::ReadResponse)?;
        debug!(status = %response.status, "received CONNECT-UDP response");
        if !response.status.is_success() {
            stream.stop(H3_NO_ERROR);
            stream.finish();
            return Err(DialError::Refused { response });
        }
        Ok(ProxiedConn::new(stream, remote))
    }

    /// Close the underlying connection with the benign error code.
    ///
    /// Waits for an in-flight first dial before closing. Established flows
    /// fail once the connection is gone.
    pub async fn close(&self) {
        let conn = self
            .conn
            .get_or_try_init(|| async { Err::<C::Connection, ()>(()) })
            .await;
        if let Ok(conn) = conn {
            conn.close(H3_NO_ERROR);
        }
    }
}

/// Split `host:port`, handling bracketed IPv6 literals. The returned host has
/// its brackets stripped.
fn split_host_port(target: &str) -> Option<(&str, &str)> {
    if let Some(rest) = target.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        let port = rest.strip_prefix(':')?;
        if host.is_empty() || port.is_empty() {
            return None;
        }
        return Some((host, port));
    }
    let (host, port) = target.rsplit_once(':')?;
    if host.is_empty() || port.is_empty() || host.contains(':') {
        return None;
    }
    Some((host, port))
}
