// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! CONNECT-UDP and CONNECT-IP request validation (RFC 9298 §3, RFC 9484 §4).
//!
//! Validates an Extended-CONNECT request head against the proxy's URI
//! template and extracts the target the client asked for. Every rejection
//! maps to exactly one HTTP status code, so handlers can respond with
//! [`RequestParseError::status`] directly.

use http::header::HeaderName;
use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;
use url::Url;

use crate::h3::H3Request;
use crate::template::UriTemplate;

/// The `:protocol` pseudo-header value for UDP proxying
pub const CONNECT_UDP_PROTOCOL: &str = "connect-udp";
/// The `:protocol` pseudo-header value for IP proxying
pub const CONNECT_IP_PROTOCOL: &str = "connect-ip";

/// URI template variable naming the target host
pub const TEMPLATE_TARGET_HOST: &str = "target_host";
/// URI template variable naming the target port
pub const TEMPLATE_TARGET_PORT: &str = "target_port";

/// The `Capsule-Protocol` header (RFC 9297 §4)
pub const CAPSULE_PROTOCOL: HeaderName = HeaderName::from_static("capsule-protocol");
/// The `Connect-Udp-Bind` extension header
pub const CONNECT_UDP_BIND: HeaderName = HeaderName::from_static("connect-udp-bind");

/// The structured-fields encoding of the boolean item `true`
pub const CAPSULE_PROTOCOL_HEADER_VALUE: &str = "?1";

/// How the `Capsule-Protocol` request header is validated.
///
/// Both variants interoperate with spec-compliant clients; the difference is
/// whether a request without the header is accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CapsuleProtocolPolicy {
    /// The header must be present and be the boolean item `?1`
    #[default]
    Strict,
    /// The header is optional, but must be `?1` when present
    Lenient,
}

/// A parsed CONNECT-UDP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectUdpRequest {
    /// The target the client requests to connect to, as `host:port`.
    /// `host` is a DNS name, an IPv4 literal, or a bracketed IPv6 literal.
    /// `*:*` for bind requests.
    pub target: String,
    /// Whether the Connect-Udp-Bind extension was negotiated
    pub bind: bool,
}

/// A parsed CONNECT-IP request.
///
/// Carries no fields: IP flow forwarding is not supported, so templates with
/// variables are rejected outright.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectIpRequest {}

/// Rejection of a CONNECT request, with the HTTP status to respond with.
#[derive(Debug, Error)]
pub enum RequestParseError {
    /// The method was not CONNECT
    #[error("expected CONNECT request, got {0}")]
    MethodMismatch(Method),

    /// The `:protocol` pseudo-header did not name the expected protocol
    #[error("unexpected protocol: {0}")]
    ProtocolMismatch(String),

    /// `:authority` did not equal the template's authority
    #[error("host in :authority ({authority}) does not match template host ({expected})")]
    AuthorityMismatch {
        /// The request's `:authority`
        authority: String,
        /// The authority the template declares
        expected: String,
    },

    /// The Capsule-Protocol header was absent under the strict policy
    #[error("missing Capsule-Protocol header")]
    MissingCapsuleHeader,

    /// The Capsule-Protocol header did not parse as a structured-fields item
    #[error("invalid capsule header value: {0}")]
    MalformedCapsuleHeader(String),

    /// The Capsule-Protocol header parsed, but not as the boolean `true`
    #[error("incorrect capsule header value: {0}")]
    WrongCapsuleHeaderValue(String),

    /// The request URL did not yield both target variables
    #[error("expected target_host and target_port")]
    MissingTarget,

    /// The target port was not a decimal integer in [0, 65535]
    #[error("invalid port {0:?}")]
    MalformedPort(String),

    /// A bind request carried non-wildcard target variables
    #[error("bind requests require wildcard target_host and target_port")]
    BindTargetMismatch,

    /// The URI template's raw URI could not be parsed
    #[error("failed to parse template: {0}")]
    TemplateParse(String),

    /// The template declares variables, which IP flow forwarding would need
    #[error("IP flow forwarding not supported")]
    IpFlowForwarding,
}

impl RequestParseError {
    /// The HTTP status code this rejection maps to. Each kind corresponds to
    /// exactly one status.
    pub fn status(&self) -> StatusCode {
        use RequestParseError::*;
        match self {
            MethodMismatch(_) => StatusCode::METHOD_NOT_ALLOWED,
            ProtocolMismatch(_) | IpFlowForwarding => StatusCode::NOT_IMPLEMENTED,
            AuthorityMismatch { .. }
            | MissingCapsuleHeader
            | MalformedCapsuleHeader(_)
            | WrongCapsuleHeaderValue(_)
            | MissingTarget
            | MalformedPort(_)
            | BindTargetMismatch => StatusCode::BAD_REQUEST,
            TemplateParse(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// The authority (`host[:port]`) a template's raw URI declares.
pub(crate) fn template_authority(template: &UriTemplate) -> Result<String, RequestParseError> {
    let url =
        Url::parse(template.raw()).map_err(|e| RequestParseError::TemplateParse(e.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| RequestParseError::TemplateParse("template URI has no host".into()))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    })
}

/// A minimal structured-fields item classification, enough to tell a boolean
/// from the other bare item types (RFC 8941 §3.3).
enum SfItem {
    True,
    False,
    OtherType,
    Malformed,
}

fn classify_sf_item(value: &str) -> SfItem {
    let value = value.trim_matches(' ');
    let bare = match value.find(';') {
        Some(i) => value[..i].trim_end_matches(' '),
        None => value,
    };
    match bare {
        "?1" => SfItem::True,
        "?0" => SfItem::False,
        bare => match bare.as_bytes().first() {
            Some(b'-' | b'0'..=b'9') | Some(b'"') | Some(b':')
            | Some(b'a'..=b'z' | b'A'..=b'Z' | b'*') => SfItem::OtherType,
            _ => SfItem::Malformed,
        },
    }
}

fn check_capsule_protocol(
    headers: &HeaderMap,
    policy: CapsuleProtocolPolicy,
) -> Result<(), RequestParseError> {
    let mut values = headers.get_all(&CAPSULE_PROTOCOL).iter();
    let value = match (values.next(), policy) {
        (None, CapsuleProtocolPolicy::Strict) => {
            return Err(RequestParseError::MissingCapsuleHeader)
        }
        (None, CapsuleProtocolPolicy::Lenient) => return Ok(()),
        (Some(v), _) => v,
    };
    if values.next().is_some() {
        return Err(RequestParseError::MalformedCapsuleHeader(
            "repeated header".into(),
        ));
    }
    let text = value
        .to_str()
        .map_err(|_| RequestParseError::MalformedCapsuleHeader("non-ASCII value".into()))?;
    match classify_sf_item(text) {
        SfItem::True => Ok(()),
        SfItem::False | SfItem::OtherType => {
            Err(RequestParseError::WrongCapsuleHeaderValue(text.to_owned()))
        }
        SfItem::Malformed => Err(RequestParseError::MalformedCapsuleHeader(text.to_owned())),
    }
}

/// Checks shared between CONNECT-UDP and CONNECT-IP, in order: template
/// parse, method, `:protocol` (when one is expected here), authority, and
/// the Capsule-Protocol header. A request that is wrong on several counts
/// reports the earliest failure, so a non-CONNECT method wins over a bad
/// protocol.
fn verify_connect_request(
    req: &H3Request,
    template: &UriTemplate,
    protocol: Option<&str>,
    policy: CapsuleProtocolPolicy,
) -> Result<(), RequestParseError> {
    let expected = template_authority(template)?;
    if req.method != Method::CONNECT {
        return Err(RequestParseError::MethodMismatch(req.method.clone()));
    }
    if let Some(expected_protocol) = protocol {
        match &req.protocol {
            Some(p) if p == expected_protocol => {}
            other => {
                return Err(RequestParseError::ProtocolMismatch(
                    other.clone().unwrap_or_default(),
                ))
            }
        }
    }
    if req.authority != expected {
        return Err(RequestParseError::AuthorityMismatch {
            authority: req.authority.clone(),
            expected,
        });
    }
    check_capsule_protocol(&req.headers, policy)
}

fn unescape_colons(s: &str) -> String {
    s.replace("%3A", ":").replace("%3a", ":")
}

fn is_wildcard(s: &str) -> bool {
    s == "*" || s.eq_ignore_ascii_case("%2a")
}

fn bind_requested(headers: &HeaderMap) -> bool {
    headers
        .get(&CONNECT_UDP_BIND)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| matches!(classify_sf_item(v), SfItem::True))
}

/// Parse and validate a CONNECT-UDP request against the proxy's template.
///
/// `enable_bind` opts into the Connect-Udp-Bind extension; when disabled the
/// extension header is ignored for forward compatibility.
pub fn parse_connect_udp_request(
    req: &H3Request,
    template: &UriTemplate,
    policy: CapsuleProtocolPolicy,
    enable_bind: bool,
) -> Result<ConnectUdpRequest, RequestParseError> {
    verify_connect_request(req, template, Some(CONNECT_UDP_PROTOCOL), policy)?;

    let values = template
        .matches(req.url.as_str())
        .ok_or(RequestParseError::MissingTarget)?;
    let find = |name: &str| {
        values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    };
    let (host_raw, port_raw) = match (find(TEMPLATE_TARGET_HOST), find(TEMPLATE_TARGET_PORT)) {
        (Some(h), Some(p)) => (h, p),
        _ => return Err(RequestParseError::MissingTarget),
    };

    if enable_bind && bind_requested(&req.headers) {
        if is_wildcard(host_raw) && is_wildcard(port_raw) {
            return Ok(ConnectUdpRequest {
                target: "*:*".to_owned(),
                bind: true,
            });
        }
        return Err(RequestParseError::BindTargetMismatch);
    }

    // IPv6 literals arrive with template-escaped colons; unescape and bracket
    // them so the result is a resolvable authority component.
    let mut host = unescape_colons(host_raw);
    if host.contains(':') {
        host = format!("[{host}]");
    }
    let port: u16 = port_raw
        .parse()
        .map_err(|_| RequestParseError::MalformedPort(port_raw.to_owned()))?;

    Ok(ConnectUdpRequest {
        target: format!("{host}:{port}"),
        bind: false,
    })
}

/// Parse and validate a CONNECT-IP request against the proxy's template.
///
/// Templates that declare variables would require IP flow forwarding, which
/// is not supported; such templates are rejected.
pub fn parse_connect_ip_request(
    req: &H3Request,
    template: &UriTemplate,
    policy: CapsuleProtocolPolicy,
) -> Result<ConnectIpRequest, RequestParseError> {
    if !template.var_names().is_empty() {
        return Err(RequestParseError::IpFlowForwarding);
    }
    match &req.protocol {
        Some(p) if p == CONNECT_IP_PROTOCOL => {}
        other => {
            return Err(RequestParseError::ProtocolMismatch(
                other.clone().unwrap_or_default(),
            ))
        }
    }
    verify_connect_request(req, template, None, policy)?;
    Ok(ConnectIpRequest {})
}
