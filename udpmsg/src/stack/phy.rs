// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Connection to the physical (i.e., "lower") side of the stack.

use crate::platform::{self, debug_log_println};

/// The maximum transmission unit for a device
pub(crate) const DEVICE_MTU: usize = 1600;

pub(crate) struct Device<Platform>
where
    Platform: platform::IPInterfaceProvider + platform::DebugLogProvider + 'static,
{
    platform: &'static Platform,
    receive_buffer: [u8; DEVICE_MTU],
    send_buffer: [u8; DEVICE_MTU],
}

impl<Platform> Device<Platform>
where
    Platform: platform::IPInterfaceProvider + platform::DebugLogProvider,
{
    pub(crate) fn new(platform: &'static Platform) -> Self {
        Self {
            platform,
            receive_buffer: [0u8; DEVICE_MTU],
            send_buffer: [0u8; DEVICE_MTU],
        }
    }
}

impl<Platform> smoltcp::phy::Device for Device<Platform>
where
    Platform: platform::IPInterfaceProvider + platform::DebugLogProvider,
{
    type RxToken<'a>
        = RxToken<'a>
    where
        Self: 'a;
    type TxToken<'a>
        = TxToken<'a, Platform>
    where
        Self: 'a;

    fn receive(
        &mut self,
        _timestamp: smoltcp::time::Instant,
    ) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        match self.platform.receive_ip_packet(&mut self.receive_buffer) {
            Ok(size) => Some((
                RxToken {
                    buffer: &self.receive_buffer[..size],
                },
                TxToken {
                    platform: self.platform,
                    buffer: &mut self.send_buffer,
                },
            )),
            Err(platform::IpReceiveError::WouldBlock) => None,
        }
    }

    fn transmit(&mut self, _timestamp: smoltcp::time::Instant) -> Option<Self::TxToken<'_>> {
        Some(TxToken {
            platform: self.platform,
            buffer: &mut self.send_buffer,
        })
    }

    fn capabilities(&self) -> smoltcp::phy::DeviceCapabilities {
        let mut caps = smoltcp::phy::DeviceCapabilities::default();
        caps.medium = smoltcp::phy::Medium::Ip;
        caps.max_transmission_unit = DEVICE_MTU;
        caps
    }
}

pub(crate) struct RxToken<'a> {
    buffer: &'a [u8],
}

impl smoltcp::phy::RxToken for RxToken<'_> {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(self.buffer)
    }
}

pub(crate) struct TxToken<'a, Platform>
where
    Platform: platform::IPInterfaceProvider + platform::DebugLogProvider,
{
    platform: &'a Platform,
    buffer: &'a mut [u8],
}

impl<Platform> smoltcp::phy::TxToken for TxToken<'_, Platform>
where
    Platform: platform::IPInterfaceProvider + platform::DebugLogProvider,
{
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let packet = &mut self.buffer[..len];
        let res = f(packet);
        // UDP promises nothing, so a packet the link refuses is simply lost.
        if let Err(e) = self.platform.send_ip_packet(packet) {
            debug_log_println!(self.platform, "udpmsg: dropped {len}-byte IP packet: {e}");
        }
        res
    }
}
