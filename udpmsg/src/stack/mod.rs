// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A pumped UDP stack built from [`smoltcp`] on top of an IP-level platform.
//!
//! [`IpStack`] turns any platform that can move raw IP packets (an
//! [`IPInterfaceProvider`](platform::IPInterfaceProvider)) into a full [`platform::Provider`], so
//! that a [`UdpMessenger`](crate::UdpMessenger) can run on it.

use alloc::vec;
use alloc::vec::Vec;
use core::net::{Ipv4Addr, SocketAddrV4};
use core::time::Duration;

use smoltcp::iface::{Interface, SocketHandle, SocketSet};
use smoltcp::socket::udp;
use smoltcp::wire::{IpAddress, IpCidr, IpEndpoint};

use crate::platform::{
    self, BindEndpointError, ReceiveCallback, SendDatagramError, Ticks, debug_log_println,
};

mod phy;


/// Maximum number of endpoints that can ever be active
const MAX_NUMBER_OF_ENDPOINTS: usize = 1024;

/// Largest payload storage given to either direction of an endpoint
const SOCKET_BUFFER_SIZE: usize = 65536;

/// Limits maximum number of datagrams in a buffer
const MAX_PACKET_COUNT: usize = 32;

/// Inbound IP packets processed by a single pump, at most
const MAX_INGRESS_PER_PUMP: usize = 64;

/// Addressing of the stack's single interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpStackConfig {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Option<Ipv4Addr>,
}

impl Default for IpStackConfig {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::new(10, 0, 0, 2),
            prefix_len: 24,
            gateway: Some(Ipv4Addr::new(10, 0, 0, 1)),
        }
    }
}

/// Everything an [`IpStack`] needs from the platform below it.
pub trait IpPlatform:
    platform::IPInterfaceProvider
    + platform::TimeProvider
    + platform::DelayProvider
    + platform::DebugLogProvider
{
}

impl<P> IpPlatform for P where
    P: platform::IPInterfaceProvider
        + platform::TimeProvider
        + platform::DelayProvider
        + platform::DebugLogProvider
{
}

/// A UDP-only smoltcp stack that is a [`platform::Provider`].
///
/// Time, delays, and debug output are passed straight through to the underlying platform.
pub struct IpStack<P: IpPlatform + 'static> {
    platform: &'static P,
    /// The interface's own address, which every endpoint is bound on
    address: Ipv4Addr,
    /// Initial instant of creation, used as an arbitrary stop point from when time begins
    zero_time: Ticks,
    inner: spin::Mutex<Inner<P>>,
}

struct Inner<P: IpPlatform + 'static> {
    /// The actual "physical" device, that connects to the platform
    device: phy::Device<P>,
    interface: Interface,
    socket_set: SocketSet<'static>,
    registrations: Vec<Registration>,
}

struct Registration {
    handle: SocketHandle,
    port: Option<u16>,
    callback: Option<ReceiveCallback>,
}

/// An endpoint handed out by an [`IpStack`].
#[derive(Debug)]
pub struct StackEndpoint {
    handle: SocketHandle,
}

impl<P: IpPlatform + 'static> IpStack<P> {
    /// Construct a new stack with a single interface addressed per `config`.
    pub fn new(platform: &'static P, config: IpStackConfig) -> Self {
        let mut device = phy::Device::new(platform);
        let iface_config = smoltcp::iface::Config::new(smoltcp::wire::HardwareAddress::Ip);
        let mut interface =
            Interface::new(iface_config, &mut device, smoltcp::time::Instant::ZERO);
        interface.update_ip_addrs(|ip_addrs| {
            match ip_addrs.push(IpCidr::new(
                IpAddress::Ipv4(config.address),
                config.prefix_len,
            )) {
                Ok(()) => {}
                Err(_) => unreachable!(),
            }
        });
        if let Some(gateway) = config.gateway {
            match interface.routes_mut().add_default_ipv4_route(gateway) {
                Ok(None) => {}
                _ => unreachable!(),
            }
        }
        Self {
            platform,
            address: config.address,
            zero_time: platform.now(),
            inner: spin::Mutex::new(Inner {
                device,
                interface,
                socket_set: SocketSet::new(vec![]),
                registrations: vec![],
            }),
        }
    }

    /// Current time, in the form smoltcp wants it
    fn timestamp(&self) -> smoltcp::time::Instant {
        let elapsed = platform::duration_for(
            self.platform.now().ticks_since(self.zero_time),
            P::COUNTS_PER_SECOND,
        );
        smoltcp::time::Instant::from_micros(i64::try_from(elapsed.as_micros()).unwrap_or(i64::MAX))
    }
}

impl<P: IpPlatform + 'static> Inner<P> {
    fn registration(&mut self, handle: SocketHandle) -> Option<&mut Registration> {
        self.registrations.iter_mut().find(|r| r.handle == handle)
    }

    fn egress(&mut self, timestamp: smoltcp::time::Instant) {
        let _ = self
            .interface
            .poll_egress(timestamp, &mut self.device, &mut self.socket_set);
    }

    /// Hand every datagram waiting on a registered socket to its callback.
    fn deliver(&mut self) {
        let Inner {
            socket_set,
            registrations,
            ..
        } = self;
        for registration in registrations.iter_mut() {
            let Some(callback) = registration.callback.as_mut() else {
                continue;
            };
            let socket = socket_set.get_mut::<udp::Socket>(registration.handle);
            while let Ok((payload, meta)) = socket.recv() {
                #[allow(irrefutable_let_patterns, reason = "only IPv4 is enabled")]
                let IpAddress::Ipv4(ip) = meta.endpoint.addr else {
                    continue;
                };
                callback(payload, SocketAddrV4::new(ip, meta.endpoint.port));
            }
        }
    }
}

impl<P: IpPlatform + 'static> platform::Provider for IpStack<P> {}

impl<P: IpPlatform + 'static> platform::TimeProvider for IpStack<P> {
    const COUNTS_PER_SECOND: u64 = P::COUNTS_PER_SECOND;

    fn now(&self) -> Ticks {
        self.platform.now()
    }
}

impl<P: IpPlatform + 'static> platform::DelayProvider for IpStack<P> {
    fn delay(&self, duration: Duration) {
        self.platform.delay(duration);
    }
}

impl<P: IpPlatform + 'static> platform::DebugLogProvider for IpStack<P> {
    fn debug_log_print(&self, msg: &str) {
        self.platform.debug_log_print(msg);
    }
}

impl<P: IpPlatform + 'static> platform::DatagramStackProvider for IpStack<P> {
    type Endpoint = StackEndpoint;
    type TransportBuffer = Vec<u8>;

    fn new_endpoint(&self, buffer_size: usize) -> Option<Self::Endpoint> {
        let mut inner = self.inner.lock();
        if inner.registrations.len() >= MAX_NUMBER_OF_ENDPOINTS {
            return None;
        }
        let size = buffer_size.clamp(phy::DEVICE_MTU, SOCKET_BUFFER_SIZE);
        let socket = udp::Socket::new(
            smoltcp::storage::PacketBuffer::new(
                vec![smoltcp::storage::PacketMetadata::EMPTY; MAX_PACKET_COUNT],
                vec![0u8; size],
            ),
            smoltcp::storage::PacketBuffer::new(
                vec![smoltcp::storage::PacketMetadata::EMPTY; MAX_PACKET_COUNT],
                vec![0u8; size],
            ),
        );
        let handle = inner.socket_set.add(socket);
        inner.registrations.push(Registration {
            handle,
            port: None,
            callback: None,
        });
        Some(StackEndpoint { handle })
    }

    fn bind_endpoint(
        &self,
        endpoint: &mut Self::Endpoint,
        port: u16,
    ) -> Result<(), BindEndpointError> {
        let mut inner = self.inner.lock();
        if inner.registrations.iter().any(|r| r.port == Some(port)) {
            return Err(BindEndpointError::AddressInUse(port));
        }
        inner
            .socket_set
            .get_mut::<udp::Socket>(endpoint.handle)
            .bind(port)
            .map_err(|_| BindEndpointError::Unaddressable)?;
        if let Some(registration) = inner.registration(endpoint.handle) {
            registration.port = Some(port);
        }
        Ok(())
    }

    fn register_receive_callback(&self, endpoint: &mut Self::Endpoint, callback: ReceiveCallback) {
        if let Some(registration) = self.inner.lock().registration(endpoint.handle) {
            registration.callback = Some(callback);
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
        let timestamp = self.timestamp();
        let mut inner = self.inner.lock();
        inner
            .socket_set
            .get_mut::<udp::Socket>(endpoint.handle)
            .send_slice(
                datagram,
                IpEndpoint::new(IpAddress::Ipv4(*destination.ip()), destination.port()),
            )
            .map_err(|e| match e {
                udp::SendError::BufferFull => SendDatagramError::BufferFull,
                udp::SendError::Unaddressable => SendDatagramError::Unaddressable,
            })?;
        inner.egress(timestamp);
        Ok(())
    }

    fn remove_endpoint(&self, endpoint: Self::Endpoint) {
        let mut inner = self.inner.lock();
        inner.registrations.retain(|r| r.handle != endpoint.handle);
        inner.socket_set.remove(endpoint.handle);
    }

    fn local_address(&self, endpoint: &Self::Endpoint) -> Option<SocketAddrV4> {
        let port = self
            .inner
            .lock()
            .registrations
            .iter()
            .find(|r| r.handle == endpoint.handle)?
            .port?;
        Some(SocketAddrV4::new(self.address, port))
    }

    fn pump(&self) {
        let timestamp = self.timestamp();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut processed = 0;
        while processed < MAX_INGRESS_PER_PUMP {
            match inner.interface.poll_ingress_single(
                timestamp,
                &mut inner.device,
                &mut inner.socket_set,
            ) {
                smoltcp::iface::PollIngressSingleResult::None => break,
                smoltcp::iface::PollIngressSingleResult::PacketProcessed
                | smoltcp::iface::PollIngressSingleResult::SocketStateChanged => processed += 1,
            }
        }
        if processed == MAX_INGRESS_PER_PUMP {
            debug_log_println!(self.platform, "udpmsg: ingress backlog left for next pump");
        }
        inner.egress(timestamp);
        inner.deliver();
    }
}
