//! Raw ICMP socket backend.
//!
//! One socket per backend instance. Probes are written from the engine's
//! transmitter; a dedicated OS thread blocks on the socket and forwards every
//! reply that carries this instance's identifier.

use parking_lot::Mutex;
use socket2::Socket;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::BackendKind;
use crate::error::{Error, Result};
use crate::probe::{
    ProbeBackend, ProbeRequest, Reply, ReplySender, build_echo_request, is_poll_timeout,
    next_identifier, open_icmp_socket, parse_icmp_response, recv_icmp, send_icmp, set_ttl,
};

/// Maximum consecutive errors before the receive loop gives up
const MAX_CONSECUTIVE_ERRORS: u32 = 50;

struct OpenSocket {
    socket: Arc<Socket>,
    cancel: CancellationToken,
    receiver: Option<JoinHandle<()>>,
}

/// Probe backend that owns an ICMP socket
pub struct RawSocketBackend {
    ipv6: bool,
    payload_size: usize,
    identifier: u16,
    open: Mutex<Option<OpenSocket>>,
    /// Serializes set-TTL + send so concurrent probes keep their own TTL
    send_lock: Mutex<()>,
}

impl RawSocketBackend {
    pub fn new(ipv6: bool, payload_size: usize) -> Self {
        Self {
            ipv6,
            payload_size,
            identifier: next_identifier(),
            open: Mutex::new(None),
            send_lock: Mutex::new(()),
        }
    }

    pub fn kind(&self) -> BackendKind {
        BackendKind::Raw
    }

    /// ICMP identifier stamped on this instance's probes
    pub fn identifier(&self) -> u16 {
        self.identifier
    }
}

impl ProbeBackend for RawSocketBackend {
    fn name(&self) -> &'static str {
        "raw-socket"
    }

    fn open(&self, replies: ReplySender) -> Result<()> {
        let mut open = self.open.lock();
        if open.is_some() {
            return Ok(());
        }

        let info = open_icmp_socket(self.ipv6)?;
        let socket = Arc::new(info.socket);
        let cancel = CancellationToken::new();

        let receive_loop = ReceiveLoop {
            socket: socket.clone(),
            is_dgram: info.is_dgram,
            identifier: self.identifier,
            replies,
            cancel: cancel.clone(),
        };
        let receiver = std::thread::Builder::new()
            .name("hopwatch-recv".into())
            .spawn(move || receive_loop.run())
            .map_err(|e| Error::BackendUnavailable(format!("cannot spawn receive thread: {e}")))?;

        tracing::debug!(
            identifier = self.identifier,
            dgram = info.is_dgram,
            ipv6 = self.ipv6,
            "raw socket backend opened"
        );
        *open = Some(OpenSocket {
            socket,
            cancel,
            receiver: Some(receiver),
        });
        Ok(())
    }

    fn send(&self, request: &ProbeRequest) -> Result<()> {
        let socket = match self.open.lock().as_ref() {
            Some(open) => open.socket.clone(),
            None => return Err(Error::NotRunning),
        };

        let packet = build_echo_request(
            self.identifier,
            request.sequence,
            self.payload_size,
            self.ipv6,
        );

        let _guard = self.send_lock.lock();
        set_ttl(&socket, request.ttl, self.ipv6)?;
        send_icmp(&socket, &packet, request.address)?;
        Ok(())
    }

    fn close(&self) {
        let Some(mut open) = self.open.lock().take() else {
            return;
        };
        open.cancel.cancel();
        if let Some(receiver) = open.receiver.take()
            && receiver.join().is_err()
        {
            tracing::error!("receive thread panicked");
        }
        tracing::debug!(identifier = self.identifier, "raw socket backend closed");
    }
}

impl Drop for RawSocketBackend {
    fn drop(&mut self) {
        self.close();
    }
}

/// Blocking receive loop run on its own thread
struct ReceiveLoop {
    socket: Arc<Socket>,
    is_dgram: bool,
    identifier: u16,
    replies: ReplySender,
    cancel: CancellationToken,
}

impl ReceiveLoop {
    fn run(self) {
        let mut buffer = [0u8; 1500];
        let mut consecutive_errors = 0u32;

        while !self.cancel.is_cancelled() {
            let recv = match recv_icmp(&self.socket, &mut buffer) {
                Ok(recv) => recv,
                Err(e) if is_poll_timeout(&e) => continue,
                Err(e) => {
                    consecutive_errors += 1;
                    tracing::warn!(
                        error = %e,
                        consecutive_errors,
                        "ICMP receive failed"
                    );
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        tracing::error!(
                            "receive loop stopped after {MAX_CONSECUTIVE_ERRORS} consecutive errors"
                        );
                        break;
                    }
                    continue;
                }
            };
            consecutive_errors = 0;
            let received_at = Instant::now();

            match parse_icmp_response(
                &buffer[..recv.len],
                recv.source,
                self.identifier,
                self.is_dgram,
            ) {
                Ok(parsed) => {
                    tracing::trace!(
                        sequence = parsed.sequence,
                        responder = %parsed.responder,
                        kind = ?parsed.kind,
                        "reply received"
                    );
                    let reply = Reply {
                        sequence: parsed.sequence,
                        destination: parsed.destination,
                        responder: parsed.responder,
                        received_at,
                        kind: parsed.kind,
                    };
                    if self.replies.send(reply).is_err() {
                        // Matcher is gone; nothing left to deliver to
                        break;
                    }
                }
                Err(e) => {
                    tracing::trace!(source = %recv.source, reason = %e, "dropped packet");
                }
            }
        }
    }
}
