// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! The proxied packet connection: a UDP-socket-like view of a CONNECT-UDP
//! request stream.
//!
//! Payload travels exclusively as HTTP datagrams prefixed with a context-id
//! varint; the stream itself carries only capsules, which a background task
//! drains and discards. Reads honor a settable deadline, drop datagrams with
//! foreign context ids, and truncate payloads that exceed the caller's
//! buffer, mirroring the behavior of large UDP datagrams received on a
//! connected socket (on Linux).

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{BufMut, BytesMut};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::capsule::skip_capsules;
use crate::coding::VarInt;
use crate::h3::{RequestStream, H3_NO_ERROR};

/// Placeholder local address: proxied connections have no socket of their own.
const UNSPECIFIED_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

struct DeadlineState {
    deadline: Option<Instant>,
    read_token: CancellationToken,
    timer: Option<JoinHandle<()>>,
}

/// A packet connection tunneled through a CONNECT-UDP request stream.
///
/// Mirrors a connected UDP socket: [`write_to`](Self::write_to) ignores the
/// address argument and [`read_from`](Self::read_from) reports the pre-dialed
/// remote. Dropping the connection does not tear the stream down; call
/// [`close`](Self::close).
pub struct ProxiedConn<S: RequestStream> {
    stream: Arc<S>,
    local_addr: SocketAddr,
    remote_addr: Option<SocketAddr>,
    closed: Arc<AtomicBool>,
    drain_done: CancellationToken,
    deadline: Arc<Mutex<DeadlineState>>,
}

impl<S: RequestStream> fmt::Debug for ProxiedConn<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxiedConn")
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn closed_err() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed")
}

fn deadline_err() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "read deadline exceeded")
}

impl<S: RequestStream> ProxiedConn<S> {
    /// Wrap an established CONNECT-UDP request stream.
    ///
    /// Spawns the capsule-drain task; `remote_addr` is what reads report as
    /// the datagram source (the pre-dialed target, when known).
    pub fn new(stream: S, remote_addr: Option<SocketAddr>) -> Self {
        let stream = Arc::new(stream);
        let closed = Arc::new(AtomicBool::new(false));
        let drain_done = CancellationToken::new();
        {
            let stream = Arc::clone(&stream);
            let closed = Arc::clone(&closed);
            let done = drain_done.clone();
            tokio::spawn(async move {
                // Discard all capsules sent on the request stream. Clean EOF
                // doubles as the peer-closed signal.
                if let Err(e) = skip_capsules(stream.as_ref()).await {
                    if !closed.load(Ordering::Relaxed) {
                        warn!(error = %e, "reading from request stream failed");
                    }
                }
                stream.finish();
                done.cancel();
            });
        }
        Self {
            stream,
            local_addr: UNSPECIFIED_ADDR,
            remote_addr,
            closed,
            drain_done,
            deadline: Arc::new(Mutex::new(DeadlineState {
                deadline: None,
                read_token: CancellationToken::new(),
                timer: None,
            })),
        }
    }

    /// Receive the next UDP payload.
    ///
    /// Datagrams with a context id other than zero are dropped and the read
    /// retries, bounded only by the read deadline. If `buf` is shorter than
    /// the payload the excess is discarded. The returned address is the
    /// pre-dialed remote, or the unspecified address when none is known.
    pub async fn read_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        loop {
            let token = {
                let state = self.deadline.lock().expect("deadline lock");
                state.read_token.clone()
            };
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    if self.closed.load(Ordering::Relaxed) {
                        return Err(closed_err());
                    }
                    // The timer fires asynchronously; the deadline may have
                    // been extended or cleared before we woke up.
                    let mut state = self.deadline.lock().expect("deadline lock");
                    let expired = state.deadline.is_some_and(|d| d <= Instant::now());
                    if expired {
                        return Err(deadline_err());
                    }
                    if state.read_token.is_cancelled() {
                        state.read_token = CancellationToken::new();
                    }
                }
                data = self.stream.recv_datagram() => {
                    let mut data = data?;
                    let context_id = VarInt::decode(&mut data).map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidData, "malformed datagram")
                    })?;
                    if context_id.into_inner() != 0 {
                        // Only UDP payloads are proxied on this flow.
                        trace!(context_id = %context_id, "dropping datagram with unknown context id");
                        continue;
                    }
                    let n = buf.len().min(data.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    return Ok((n, self.remote_addr.unwrap_or(UNSPECIFIED_ADDR)));
                }
            }
        }
    }

    /// Send a UDP payload to the pre-dialed target.
    ///
    /// The address argument is ignored: the connection mirrors a connected
    /// UDP socket. Returns the payload length. The payload is never
    /// fragmented; oversize datagrams are refused or dropped by the
    /// substrate.
    pub async fn write_to(&self, payload: &[u8], _addr: SocketAddr) -> io::Result<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(closed_err());
        }
        let mut data = BytesMut::with_capacity(1 + payload.len());
        data.put_u8(0); // context id zero
        data.put_slice(payload);
        self.stream.send_datagram(data.freeze()).await?;
        Ok(payload.len())
    }

    /// The placeholder local address of this connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The pre-dialed remote, when known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Set the read deadline. `None` clears it.
    ///
    /// A deadline at or before now fails the pending read immediately; a
    /// future deadline (re)arms the single deadline timer. Extending the
    /// deadline while the timer fires is resolved by re-checking the
    /// deadline under the lock, so a blocked read never errors early.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        let mut state = self.deadline.lock().expect("deadline lock");
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.deadline = deadline;
        let deadline = match deadline {
            None => {
                // Re-arm reads that were woken by an earlier deadline.
                if state.read_token.is_cancelled() && !self.closed.load(Ordering::Relaxed) {
                    state.read_token = CancellationToken::new();
                }
                return;
            }
            Some(d) if d <= Instant::now() => {
                state.read_token.cancel();
                return;
            }
            Some(d) => d,
        };
        if state.read_token.is_cancelled() && !self.closed.load(Ordering::Relaxed) {
            state.read_token = CancellationToken::new();
        }
        let shared = Arc::clone(&self.deadline);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let state = shared.lock().expect("deadline lock");
            // Only cancel if the deadline is still in effect and in the past;
            // guards against racing with a subsequent set_read_deadline.
            if state.deadline.is_some_and(|d| d <= Instant::now()) {
                state.read_token.cancel();
            }
        }));
    }

    /// Set both deadlines. The write half is a stub (see
    /// [`set_write_deadline`](Self::set_write_deadline)).
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_write_deadline(deadline);
        self.set_read_deadline(deadline);
    }

    /// Accepted but not enforced: the substrate does not yet expose write
    /// cancellation for datagrams.
    pub fn set_write_deadline(&self, _deadline: Option<Instant>) {}

    /// Close the connection. Idempotent.
    ///
    /// Cancels the stream's receive side with the benign error code, closes
    /// the send direction, waits for the capsule drain to finish, and fails
    /// any pending read.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stream.stop(H3_NO_ERROR);
        self.stream.finish();
        self.drain_done.cancelled().await;
        let mut state = self.deadline.lock().expect("deadline lock");
        state.read_token.cancel();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        debug!("proxied connection closed");
    }
}
