// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The underlying platform upon which a messenger resides.
//!
//! The top-level trait that denotes something is a valid platform is [`Provider`]. This trait is
//! merely a collection of subtraits that could be composed independently from various other crates
//! that implement them upon various types.

#[cfg(test)]
pub(crate) mod mock;

use alloc::boxed::Box;
use core::net::SocketAddrV4;
use core::time::Duration;

use thiserror::Error;

/// A provider of a platform upon which a [`UdpMessenger`](crate::UdpMessenger) can execute.
///
/// Ideally, a [`Provider`] is zero-sized, and only exists to provide access to functionality
/// provided by it. _However_, most of the provided APIs within the provider act upon an `&self` to
/// allow storage of any useful "globals" within it necessary.
pub trait Provider: TimeProvider + DelayProvider + DatagramStackProvider + DebugLogProvider {}

/// A monotonic hardware tick counter.
///
/// Used only for timeout arithmetic; the counter is allowed to wrap.
pub trait TimeProvider {
    /// How many ticks the counter advances per second.
    const COUNTS_PER_SECOND: u64;
    /// Returns the current tick count.
    fn now(&self) -> Ticks;
}

/// A raw reading of a [`TimeProvider`] counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ticks(pub u64);

impl Ticks {
    /// Ticks elapsed from `earlier` to `self`, tolerating a single counter wrap.
    #[must_use]
    pub fn ticks_since(self, earlier: Ticks) -> u64 {
        self.0.wrapping_sub(earlier.0)
    }
}

/// Convert `duration` into a tick delta for a clock running at `counts_per_second`.
///
/// Saturates at `u64::MAX` rather than overflowing.
#[must_use]
pub fn ticks_for(duration: Duration, counts_per_second: u64) -> u64 {
    let ticks = duration
        .as_nanos()
        .saturating_mul(u128::from(counts_per_second))
        / 1_000_000_000;
    u64::try_from(ticks).unwrap_or(u64::MAX)
}

/// Convert a tick delta back into a [`Duration`] for a clock running at `counts_per_second`.
#[must_use]
pub fn duration_for(ticks: u64, counts_per_second: u64) -> Duration {
    let nanos = u128::from(ticks).saturating_mul(1_000_000_000) / u128::from(counts_per_second.max(1));
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// An interface to sleeping for a (short) interval.
///
/// Implementations may busy-wait; nothing is pumped while sleeping, that is the caller's job.
pub trait DelayProvider {
    /// Sleep for at least `duration`.
    fn delay(&self, duration: Duration);
}

/// Callback invoked by a [`DatagramStackProvider`] for every inbound datagram on an endpoint.
///
/// Receives the raw payload (only valid for the duration of the call) and the sender's address.
/// A callback must not block, and must never invoke [`DatagramStackProvider::pump`].
pub type ReceiveCallback = Box<dyn FnMut(&[u8], SocketAddrV4) + Send>;

/// A UDP-style network stack that is driven by explicit pumping.
///
/// Nothing in this interface blocks. Inbound datagrams are only ever delivered (via the registered
/// [`ReceiveCallback`]) from within [`pump`](Self::pump).
pub trait DatagramStackProvider {
    /// Opaque ownership of one endpoint inside the stack.
    type Endpoint;
    /// A buffer handed to the stack for transmission; released when dropped.
    type TransportBuffer: core::ops::DerefMut<Target = [u8]>;

    /// Allocate a new, unbound endpoint. `buffer_size` is advisory.
    ///
    /// Returns `None` if the stack has no room for another endpoint.
    fn new_endpoint(&self, buffer_size: usize) -> Option<Self::Endpoint>;

    /// Bind `endpoint` to `port` on any local address.
    fn bind_endpoint(&self, endpoint: &mut Self::Endpoint, port: u16)
    -> Result<(), BindEndpointError>;

    /// Register the function to invoke for every datagram received on `endpoint`.
    ///
    /// Replaces any previously registered callback.
    fn register_receive_callback(&self, endpoint: &mut Self::Endpoint, callback: ReceiveCallback);

    /// Allocate a transport buffer of exactly `len` bytes, or `None` if out of buffers.
    fn alloc_transport_buffer(&self, len: usize) -> Option<Self::TransportBuffer>;

    /// Hand a single datagram to the stack, addressed to `destination`.
    fn send_datagram(
        &self,
        endpoint: &Self::Endpoint,
        destination: SocketAddrV4,
        datagram: &[u8],
    ) -> Result<(), SendDatagramError>;

    /// Relinquish `endpoint`, dropping its callback.
    fn remove_endpoint(&self, endpoint: Self::Endpoint);

    /// The local address `endpoint` is actually bound to, if the stack knows it.
    ///
    /// The default knows nothing.
    fn local_address(&self, endpoint: &Self::Endpoint) -> Option<SocketAddrV4> {
        let _ = endpoint;
        None
    }

    /// Process pending timers and inbound frames, delivering datagrams to registered callbacks.
    fn pump(&self);
}

/// Errors that can be returned by [`DatagramStackProvider::bind_endpoint`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum BindEndpointError {
    #[error("port {0} is already in use")]
    AddressInUse(u16),
    #[error("endpoint cannot be bound to that address")]
    Unaddressable,
}

/// Errors that can be returned by [`DatagramStackProvider::send_datagram`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SendDatagramError {
    #[error("transmit buffer is full")]
    BufferFull,
    #[error("destination is unaddressable")]
    Unaddressable,
    #[error("link rejected the datagram")]
    Link,
}

/// An IP packet interface to the outside world.
///
/// This could be implemented via a `read`/`write` to a TUN device, or directly on top of an
/// Ethernet MAC's DMA rings.
pub trait IPInterfaceProvider {
    /// Send the IP packet.
    ///
    /// Returns `Ok(())` when entire packet is sent, or a [`IpSendError`] if it is unable to send
    /// the entire packet.
    fn send_ip_packet(&self, packet: &[u8]) -> Result<(), IpSendError>;

    /// Receive an IP packet into `packet`.
    ///
    /// Returns size of packet received, or a [`IpReceiveError`] if unable to receive an entire
    /// packet.
    fn receive_ip_packet(&self, packet: &mut [u8]) -> Result<usize, IpReceiveError>;
}

/// A non-exhaustive list of errors that can be thrown by [`IPInterfaceProvider::send_ip_packet`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum IpSendError {
    #[error("link is down")]
    LinkDown,
}

/// A non-exhaustive list of errors that can be thrown by
/// [`IPInterfaceProvider::receive_ip_packet`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum IpReceiveError {
    #[error("Receive operation would block")]
    WouldBlock,
}

/// An interface to dumping debug output for tracing purposes.
pub trait DebugLogProvider {
    /// Print `msg` to the debug log
    ///
    /// Newlines are *not* automatically appended to `msg`, thus the caller must make sure to
    /// include newlines if necessary.
    fn debug_log_print(&self, msg: &str);
}

// A `println!` style macro that uses `debug_log_print` but gives a nicer interface.
//
// Messages longer than the `ArrayString` capacity are truncated rather than allocating.
macro_rules! debug_log_println {
    ($platform:expr, $($tt:tt)*) => {{
        use core::fmt::Write as _;
        let mut t: ::arrayvec::ArrayString<256> = ::arrayvec::ArrayString::new();
        let _ = writeln!(t, $($tt)*);
        $crate::platform::DebugLogProvider::debug_log_print($platform, &t);
    }};
}
pub(crate) use debug_log_println;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_conversions() {
        assert_eq!(ticks_for(Duration::from_millis(200), 1_000_000), 200_000);
        assert_eq!(ticks_for(Duration::from_millis(1), 333_333_333), 333_333);
        assert_eq!(ticks_for(Duration::MAX, u64::MAX), u64::MAX);
        assert_eq!(duration_for(50_000, 1_000_000), Duration::from_millis(50));
    }

    #[test]
    fn ticks_wrap() {
        let before = Ticks(u64::MAX - 4);
        let after = Ticks(5);
        assert_eq!(after.ticks_since(before), 10);
    }
}
