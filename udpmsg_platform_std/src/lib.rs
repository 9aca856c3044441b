// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A [udpmsg platform](../udpmsg/platform/index.html) for running udpmsg on a hosted OS.
//!
//! Each endpoint is a non-blocking [`UdpSocket`]; pumping drains every socket, up to a bounded
//! number of datagrams each, and hands what it finds to the registered callbacks.

use std::io::{ErrorKind, Write as _};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Mutex;
use std::time::Duration;

use udpmsg::platform::{
    BindEndpointError, DatagramStackProvider, DebugLogProvider, DelayProvider, Provider,
    ReceiveCallback, SendDatagramError, Ticks, TimeProvider,
};

/// Largest datagram a pump can pick up
const MAX_DATAGRAM_SIZE: usize = 65536;

/// Datagrams drained from any one endpoint by a single pump, at most
const MAX_DATAGRAMS_PER_PUMP: usize = 64;

/// The hosted platform.
///
/// This implements the main [`udpmsg::platform::Provider`] trait, i.e., implements all platform
/// traits.
pub struct StdPlatform {
    origin: std::time::Instant,
    /// Local address every endpoint binds to
    bind_address: Ipv4Addr,
    state: Mutex<State>,
}

struct State {
    slots: Vec<Option<Slot>>,
    scratch: Box<[u8]>,
}

#[derive(Default)]
struct Slot {
    socket: Option<UdpSocket>,
    callback: Option<ReceiveCallback>,
}

/// An endpoint handed out by the [`StdPlatform`].
#[derive(Debug)]
pub struct StdEndpoint {
    index: usize,
}

impl StdPlatform {
    /// Create a new hosted platform whose endpoints bind to `bind_address`.
    ///
    /// Use [`Ipv4Addr::UNSPECIFIED`] to listen on every interface.
    pub fn new(bind_address: Ipv4Addr) -> &'static Self {
        Box::leak(Box::new(Self {
            origin: std::time::Instant::now(),
            bind_address,
            state: Mutex::new(State {
                slots: Vec::new(),
                scratch: vec![0u8; MAX_DATAGRAM_SIZE].into_boxed_slice(),
            }),
        }))
    }
}

impl Provider for StdPlatform {}

impl TimeProvider for StdPlatform {
    const COUNTS_PER_SECOND: u64 = 1_000_000_000;

    fn now(&self) -> Ticks {
        Ticks(u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX))
    }
}

impl DelayProvider for StdPlatform {
    fn delay(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

impl DebugLogProvider for StdPlatform {
    fn debug_log_print(&self, msg: &str) {
        let _ = std::io::stderr().write_all(msg.as_bytes());
    }
}

impl DatagramStackProvider for StdPlatform {
    type Endpoint = StdEndpoint;
    type TransportBuffer = Vec<u8>;

    fn new_endpoint(&self, _buffer_size: usize) -> Option<Self::Endpoint> {
        let mut state = self.state.lock().unwrap();
        let index = if let Some(free) = state.slots.iter().position(Option::is_none) {
            state.slots[free] = Some(Slot::default());
            free
        } else {
            state.slots.push(Some(Slot::default()));
            state.slots.len() - 1
        };
        Some(StdEndpoint { index })
    }

    fn bind_endpoint(
        &self,
        endpoint: &mut Self::Endpoint,
        port: u16,
    ) -> Result<(), BindEndpointError> {
        let socket = UdpSocket::bind(SocketAddrV4::new(self.bind_address, port)).map_err(|e| {
            match e.kind() {
                ErrorKind::AddrInUse => BindEndpointError::AddressInUse(port),
                _ => BindEndpointError::Unaddressable,
            }
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|_| BindEndpointError::Unaddressable)?;
        let mut state = self.state.lock().unwrap();
        let slot = state
            .slots
            .get_mut(endpoint.index)
            .and_then(Option::as_mut)
            .ok_or(BindEndpointError::Unaddressable)?;
        slot.socket = Some(socket);
        Ok(())
    }

    fn register_receive_callback(&self, endpoint: &mut Self::Endpoint, callback: ReceiveCallback) {
        let mut state = self.state.lock().unwrap();
        if let Some(Some(slot)) = state.slots.get_mut(endpoint.index) {
            slot.callback = Some(callback);
        }
    }

    fn alloc_transport_buffer(&self, len: usize) -> Option<Self::TransportBuffer> {
        let mut buffer = Vec::new();
        buffer.try_reserve_exact(len).ok()?;
        buffer.resize(len, 0);
        Some(buffer)
    }

    fn send_datagram(
        &self,
        endpoint: &Self::Endpoint,
        destination: SocketAddrV4,
        datagram: &[u8],
    ) -> Result<(), SendDatagramError> {
        let state = self.state.lock().unwrap();
        let socket = state
            .slots
            .get(endpoint.index)
            .and_then(Option::as_ref)
            .and_then(|slot| slot.socket.as_ref())
            .ok_or(SendDatagramError::Unaddressable)?;
        match socket.send_to(datagram, destination) {
            Ok(n) if n == datagram.len() => Ok(()),
            Ok(_) => Err(SendDatagramError::Link),
            Err(e) => Err(match e.kind() {
                ErrorKind::WouldBlock => SendDatagramError::BufferFull,
                ErrorKind::AddrNotAvailable | ErrorKind::InvalidInput => {
                    SendDatagramError::Unaddressable
                }
                _ => SendDatagramError::Link,
            }),
        }
    }

    fn remove_endpoint(&self, endpoint: Self::Endpoint) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.slots.get_mut(endpoint.index) {
            *slot = None;
        }
    }

    fn local_address(&self, endpoint: &Self::Endpoint) -> Option<SocketAddrV4> {
        let state = self.state.lock().unwrap();
        let socket = state.slots.get(endpoint.index)?.as_ref()?.socket.as_ref()?;
        match socket.local_addr() {
            Ok(SocketAddr::V4(addr)) => Some(addr),
            _ => None,
        }
    }

    fn pump(&self) {
        let mut state = self.state.lock().unwrap();
        let State { slots, scratch } = &mut *state;
        for slot in slots.iter_mut().flatten() {
            let (Some(socket), Some(callback)) = (slot.socket.as_ref(), slot.callback.as_mut())
            else {
                continue;
            };
            // Whatever is left over waits for the next pump
            for _ in 0..MAX_DATAGRAMS_PER_PUMP {
                match socket.recv_from(scratch) {
                    Ok((n, SocketAddr::V4(source))) => callback(&scratch[..n], source),
                    Ok((_, SocketAddr::V6(_))) => {}
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    // Some hosts report an earlier ICMP rejection here; the socket is still fine.
                    Err(e) if e.kind() == ErrorKind::ConnectionReset => {}
                    Err(e) => {
                        self.debug_log_print(&format!("udpmsg: receive failed: {e}\n"));
                        break;
                    }
                }
            }
        }
    }
}
