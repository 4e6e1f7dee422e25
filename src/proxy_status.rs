// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! The `Proxy-Status` response header (RFC 9209).
//!
//! Communicates why a proxied flow could not be established (or, on success,
//! which next hop was selected). The header is a structured-fields list with
//! a single item: the proxy's name, parameterised with `error`, `rcode`,
//! `details`, and `next-hop` as applicable.

use std::fmt::Write;
use std::net::SocketAddr;

use http::header::HeaderName;
use http::HeaderValue;

/// The `Proxy-Status` header
pub const PROXY_STATUS: HeaderName = HeaderName::from_static("proxy-status");

/// `error` token for DNS resolution failures
pub const ERROR_DNS_ERROR: &str = "dns_error";
/// `error` token for DNS resolution timeouts
pub const ERROR_DNS_TIMEOUT: &str = "dns_timeout";
/// `error` token for unroutable or undialable destinations
pub const ERROR_DESTINATION_UNROUTABLE: &str = "destination_ip_unroutable";

/// `rcode` value reported for name-not-found resolution failures
pub const RCODE_NEGATIVE_RESPONSE: &str = "Negative response";
/// `rcode` value reported for other resolution failures
pub const RCODE_SERVFAIL: &str = "SERVFAIL";

/// Builder for one `Proxy-Status` item.
#[derive(Debug, Clone)]
pub struct ProxyStatus {
    authority: String,
    error: Option<&'static str>,
    rcode: Option<String>,
    details: Option<String>,
    next_hop: Option<SocketAddr>,
}

impl ProxyStatus {
    /// Start an item naming the proxy by its authority.
    pub fn new(authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            error: None,
            rcode: None,
            details: None,
            next_hop: None,
        }
    }

    /// Attach a proxy error type token.
    pub fn error(mut self, token: &'static str) -> Self {
        self.error = Some(token);
        self
    }

    /// Attach a DNS response code.
    pub fn rcode(mut self, rcode: impl Into<String>) -> Self {
        self.rcode = Some(rcode.into());
        self
    }

    /// Attach free-form failure details.
    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Attach the resolved next hop of a successful flow.
    pub fn next_hop(mut self, addr: SocketAddr) -> Self {
        self.next_hop = Some(addr);
        self
    }

    /// Serialize to a header value.
    pub fn to_header_value(&self) -> HeaderValue {
        let mut out = String::new();
        write_sf_string(&mut out, &self.authority);
        if let Some(error) = self.error {
            let _ = write!(out, "; error={error}");
        }
        if let Some(rcode) = &self.rcode {
            out.push_str("; rcode=");
            write_sf_string(&mut out, rcode);
        }
        if let Some(details) = &self.details {
            out.push_str("; details=");
            write_sf_string(&mut out, details);
        }
        if let Some(next_hop) = self.next_hop {
            out.push_str("; next-hop=");
            write_sf_string(&mut out, &next_hop.to_string());
        }
        match HeaderValue::from_str(&out) {
            Ok(v) => v,
            Err(_) => {
                // Unreachable: write_sf_string only emits visible ASCII.
                debug_assert!(false, "unserializable Proxy-Status: {out}");
                HeaderValue::from_static("\"\"")
            }
        }
    }
}

/// Append a structured-fields string: quoted, with `\` and `"` escaped and
/// everything outside visible ASCII replaced.
fn write_sf_string(out: &mut String, value: &str) {
    out.push('"');
    for c in value.chars() {
        match c {
            '"' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            ' '..='~' => out.push(c),
            _ => out.push(' '),
        }
    }
    out.push('"');
}
