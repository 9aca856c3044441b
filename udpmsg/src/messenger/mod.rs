// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Datagram messaging on top of a pumped network stack

use alloc::sync::Arc;
use core::fmt;
use core::net::{Ipv4Addr, SocketAddrV4};
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;

use crate::platform::{self, debug_log_println};

pub mod errors;
mod fragment;
mod pump;
mod queue;


use errors::{BindError, ReceiveError, SendError};
use fragment::fragments;
use pump::{pump, pumped_delay};
use queue::PacketQueue;

pub use queue::{Packet, PacketMap};

/// Largest payload sent as a single datagram; anything bigger is split into chunks of this size.
pub const MAX_USER_DATA: usize = 1400;

/// How many times a single chunk is handed to the stack before the send gives up.
pub const SEND_ATTEMPTS: u8 = 5;

/// Delay between two attempts at the same chunk.
pub const SEND_RETRY_BACKOFF: Duration = Duration::from_micros(100);

/// Pumped delay between two consecutive chunks of one payload.
pub const CHUNK_PACING: Duration = Duration::from_millis(1);

/// Number of empty polls a receive makes before it starts sleeping between polls.
pub const BUSY_SPIN_ITERATIONS: u32 = 700;

/// Poll interval used by callers that have no better idea.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Buffer size requested by [`UdpMessenger::bind_default`].
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// A UDP messenger bound to (at most) one local port.
///
/// All work is cooperative: the stack only makes progress while one of the messenger's
/// operations is pumping it, or while someone else calls
/// [`DatagramStackProvider::pump`](platform::DatagramStackProvider::pump).
///
/// Dropping the messenger releases its socket.
pub struct UdpMessenger<Platform: platform::Provider + 'static> {
    platform: &'static Platform,
    /// The endpoint, present exactly when the socket is open
    socket: Option<Platform::Endpoint>,
    port: u16,
    buffer_size: usize,
    /// Cleared to cut a waiting receive short
    go: Arc<AtomicBool>,
    /// Filled by the dispatch callback, drained by the receive operations
    queue: Arc<PacketQueue>,
}

impl<Platform: platform::Provider + 'static> UdpMessenger<Platform> {
    /// A closed messenger on `platform`.
    pub fn new(platform: &'static Platform) -> Self {
        Self {
            platform,
            socket: None,
            port: 0,
            buffer_size: 0,
            go: Arc::new(AtomicBool::new(true)),
            queue: Arc::new(PacketQueue::default()),
        }
    }

    /// Open the socket on `port`, on any local address.
    ///
    /// Binding the port the socket is already open on does nothing. Binding a different port
    /// releases the current socket first. On failure the socket is left closed.
    ///
    /// `buffer_size` is passed to the stack as a hint and reported back by
    /// [`buffer_size`](Self::buffer_size).
    pub fn bind(&mut self, port: u16, buffer_size: usize) -> Result<(), BindError> {
        if self.socket.is_some() {
            if self.port == port {
                return Ok(());
            }
            self.release();
        }
        let Some(mut endpoint) = self.platform.new_endpoint(buffer_size) else {
            debug_log_println!(self.platform, "udpmsg: no endpoint available for port {port}");
            return Err(BindError::EndpointAllocation);
        };
        if let Err(source) = self.platform.bind_endpoint(&mut endpoint, port) {
            debug_log_println!(self.platform, "udpmsg: bind to port {port} failed: {source}");
            self.platform.remove_endpoint(endpoint);
            return Err(BindError::Bind { port, source });
        }
        self.platform
            .register_receive_callback(&mut endpoint, queue::dispatch_callback(self.queue.clone()));
        self.socket = Some(endpoint);
        self.port = port;
        self.buffer_size = buffer_size;
        Ok(())
    }

    /// [`bind`](Self::bind) with [`DEFAULT_BUFFER_SIZE`].
    pub fn bind_default(&mut self, port: u16) -> Result<(), BindError> {
        self.bind(port, DEFAULT_BUFFER_SIZE)
    }

    /// Close the socket, if open.
    ///
    /// Packets already queued stay queued.
    pub fn release(&mut self) {
        if let Some(endpoint) = self.socket.take() {
            self.platform.remove_endpoint(endpoint);
        }
    }

    /// Whether the socket is currently bound.
    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// The address the socket is bound to, for diagnostics.
    ///
    /// Reports what the stack says the endpoint is bound to; a stack that cannot tell is taken to
    /// have bound the requested port on any address.
    pub fn bound_address(&self) -> BoundAddress {
        match self.socket.as_ref() {
            Some(endpoint) => BoundAddress::Bound(
                self.platform
                    .local_address(endpoint)
                    .unwrap_or(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.port)),
            ),
            None => BoundAddress::NotOpen,
        }
    }

    /// The last port successfully bound.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The buffer size requested by the last successful bind.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Send `message` to `destination`, on the same port this messenger is bound to.
    pub fn send_str_to(&self, destination: Ipv4Addr, message: &str) -> Result<(), SendError> {
        self.send_to(destination, message.as_bytes())
    }

    /// Send `payload` to `destination`, on the same port this messenger is bound to.
    ///
    /// See [`send_to_endpoint`](Self::send_to_endpoint).
    pub fn send_to(&self, destination: Ipv4Addr, payload: &[u8]) -> Result<(), SendError> {
        self.send_to_endpoint(SocketAddrV4::new(destination, self.port), payload)
    }

    /// Send `payload` to `destination`.
    ///
    /// The stack is pumped after every datagram handed to it, so that a stack which only
    /// transmits while pumped gets it onto the wire. Payloads over [`MAX_USER_DATA`] bytes go out
    /// as several datagrams, in order, separated by a [`CHUNK_PACING`] pumped delay. The
    /// datagrams carry no framing. If a chunk cannot be sent, the remaining chunks are abandoned;
    /// the ones already sent are not recalled.
    pub fn send_to_endpoint(
        &self,
        destination: SocketAddrV4,
        payload: &[u8],
    ) -> Result<(), SendError> {
        let Some(endpoint) = self.socket.as_ref() else {
            debug_log_println!(self.platform, "udpmsg: send to {destination} on closed socket");
            return Err(SendError::NotOpen);
        };
        let mut chunks = fragments(payload).peekable();
        while let Some(chunk) = chunks.next() {
            self.send_chunk(endpoint, destination, chunk)?;
            pump(self.platform);
            if chunks.peek().is_some() {
                pumped_delay(self.platform, CHUNK_PACING);
            }
        }
        Ok(())
    }

    fn send_chunk(
        &self,
        endpoint: &Platform::Endpoint,
        destination: SocketAddrV4,
        chunk: &[u8],
    ) -> Result<(), SendError> {
        let Some(mut buffer) = self.platform.alloc_transport_buffer(chunk.len()) else {
            debug_log_println!(
                self.platform,
                "udpmsg: no transport buffer for {} bytes",
                chunk.len()
            );
            return Err(SendError::BufferAllocation { len: chunk.len() });
        };
        buffer.copy_from_slice(chunk);
        let mut attempt = 1;
        loop {
            match self.platform.send_datagram(endpoint, destination, &*buffer) {
                Ok(()) => return Ok(()),
                Err(source) => {
                    debug_log_println!(
                        self.platform,
                        "udpmsg: send attempt {attempt}/{SEND_ATTEMPTS} to {destination} failed: {source}"
                    );
                    if attempt >= SEND_ATTEMPTS {
                        return Err(SendError::RetriesExhausted {
                            attempts: attempt,
                            source,
                        });
                    }
                    self.platform.delay(SEND_RETRY_BACKOFF);
                    attempt += 1;
                }
            }
        }
    }

    /// Total payload bytes waiting to be received.
    ///
    /// Pumps the stack once first, so anything it was holding is counted.
    pub fn available_bytes(&self) -> usize {
        pump(self.platform);
        self.queue.queued_bytes()
    }

    /// Pump once, then move everything queued into `destination` without waiting.
    pub fn receive_waiting(&self, destination: &mut PacketMap) {
        pump(self.platform);
        self.queue.drain_into(destination);
    }

    /// Wait up to `timeout` for one datagram and append it to `destination`.
    ///
    /// `destination` is untouched on failure.
    pub fn receive_into(
        &self,
        destination: &mut PacketMap,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<(), ReceiveError> {
        let packet = self.receive(timeout, poll_interval)?;
        queue::append(destination, packet);
        Ok(())
    }

    /// Wait up to `timeout` for the oldest queued datagram.
    ///
    /// Polls flat out for the first [`BUSY_SPIN_ITERATIONS`] rounds, then sleeps `poll_interval`
    /// (pumping around the sleep) between rounds. Returns [`ReceiveError::NoResponse`] once the
    /// timeout passes or someone calls [`interrupt`](Self::interrupt). An interrupt that lands
    /// before the wait starts is forgotten.
    pub(crate) fn receive(
        &self,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Packet, ReceiveError> {
        if self.socket.is_none() {
            return Err(ReceiveError::NotOpen);
        }
        let limit = platform::ticks_for(timeout, Platform::COUNTS_PER_SECOND);
        self.go.store(true, Ordering::Release);
        let start = self.platform.now();
        let mut idle_rounds: u32 = 0;
        while self.platform.now().ticks_since(start) <= limit && self.go.load(Ordering::Acquire) {
            pump(self.platform);
            // Checked for emptiness rather than byte count; an empty datagram is still one.
            if let Some(packet) = self.queue.pop_front() {
                return Ok(packet);
            }
            idle_rounds = idle_rounds.saturating_add(1);
            if idle_rounds > BUSY_SPIN_ITERATIONS {
                pumped_delay(self.platform, poll_interval);
            }
        }
        Err(ReceiveError::NoResponse)
    }

    /// Make a receive in progress give up at its next check.
    pub fn interrupt(&self) {
        self.go.store(false, Ordering::Release);
    }

    /// A handle that can [`interrupt`](Self::interrupt) this messenger from any context.
    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            go: self.go.clone(),
        }
    }
}

impl<Platform: platform::Provider + 'static> Drop for UdpMessenger<Platform> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Cross-context handle to [`UdpMessenger::interrupt`].
///
/// The messenger notices within one poll interval.
#[derive(Clone, Debug)]
pub struct Interrupter {
    go: Arc<AtomicBool>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        self.go.store(false, Ordering::Release);
    }
}

/// Result of [`UdpMessenger::bound_address`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundAddress {
    Bound(SocketAddrV4),
    NotOpen,
}

impl fmt::Display for BoundAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundAddress::Bound(addr) => write!(f, "{addr}"),
            BoundAddress::NotOpen => f.write_str("socket not open"),
        }
    }
}
