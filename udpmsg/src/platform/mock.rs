// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Crate-local test-only mock platform for easily running tests in the various modules.

// Pull in `std` for the test-only world, so that we have a nicer/easier time writing tests
extern crate std;

use std::collections::VecDeque;
use std::string::String;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::vec::Vec;

use super::*;

/// Hook run at the start of every [`MockPlatform::pump`], given the 1-based pump count.
pub(crate) type PumpHook = Box<dyn FnMut(usize) + Send>;

/// A mock platform that is a [`platform::Provider`](Provider), useful purely for testing within
/// this crate.
///
/// Some great features of this mock platform are:
///
/// - Full determinism
///   + time moves at one microsecond per "now" call, and by exactly the requested amount per
///     "delay" call
///   + inbound datagrams are only ever delivered from within `pump`, possibly a set number of
///     pumps after being injected
///   + IP packets are placed into a deterministic ring buffer and spin back around
/// - Every successful datagram send, every delay, and every debug line is recorded
/// - Failures can be injected for endpoint allocation, binding, buffer allocation, and the next
///   N datagram sends
/// - A pump hook stands in for a foreign execution context (e.g., an interrupt handler)
pub(crate) struct MockPlatform {
    current_time: AtomicU64,
    ip_packets: Mutex<VecDeque<Vec<u8>>>,
    endpoints: Mutex<Vec<MockSlot>>,
    next_endpoint: AtomicUsize,
    pending: Mutex<VecDeque<PendingDatagram>>,
    pumps: AtomicUsize,
    pump_hook: Mutex<Option<PumpHook>>,
    removed: AtomicUsize,
    send_attempts: AtomicUsize,
    pub(crate) sent: Mutex<Vec<(SocketAddrV4, Vec<u8>)>>,
    pub(crate) delays: Mutex<Vec<Duration>>,
    /// Pump count at the moment of each recorded delay
    pub(crate) delay_pumps: Mutex<Vec<usize>>,
    pub(crate) log: Mutex<Vec<String>>,
    pub(crate) fail_endpoint_alloc: AtomicBool,
    pub(crate) fail_bind: AtomicBool,
    pub(crate) fail_buffer_alloc: AtomicBool,
    pub(crate) send_failures: AtomicUsize,
}

struct MockSlot {
    id: usize,
    port: Option<u16>,
    callback: Option<ReceiveCallback>,
}

struct PendingDatagram {
    pumps_left: usize,
    payload: Vec<u8>,
    source: SocketAddrV4,
}

/// An endpoint handed out by the [`MockPlatform`].
#[derive(Debug)]
pub(crate) struct MockEndpoint {
    id: usize,
}

impl MockPlatform {
    pub(crate) fn new() -> &'static Self {
        //  Since this is used entirely for tests, leaking a bit of memory is perfectly fine in
        //  order to give ourselves a statically lived platform easily.
        Box::leak(Box::new(MockPlatform {
            current_time: AtomicU64::new(0),
            ip_packets: Mutex::new(VecDeque::new()),
            endpoints: Mutex::new(Vec::new()),
            next_endpoint: AtomicUsize::new(0),
            pending: Mutex::new(VecDeque::new()),
            pumps: AtomicUsize::new(0),
            pump_hook: Mutex::new(None),
            removed: AtomicUsize::new(0),
            send_attempts: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            delays: Mutex::new(Vec::new()),
            delay_pumps: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
            fail_endpoint_alloc: AtomicBool::new(false),
            fail_bind: AtomicBool::new(false),
            fail_buffer_alloc: AtomicBool::new(false),
            send_failures: AtomicUsize::new(0),
        }))
    }

    /// Deliver `payload` from `source` on the next pump.
    pub(crate) fn inject(&self, payload: &[u8], source: SocketAddrV4) {
        self.inject_after_pumps(0, payload, source);
    }

    /// Deliver `payload` from `source` once `pumps` further pumps have gone by.
    pub(crate) fn inject_after_pumps(&self, pumps: usize, payload: &[u8], source: SocketAddrV4) {
        self.pending.lock().unwrap().push_back(PendingDatagram {
            pumps_left: pumps,
            payload: payload.into(),
            source,
        });
    }

    pub(crate) fn set_pump_hook(&self, hook: impl FnMut(usize) + Send + 'static) {
        *self.pump_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub(crate) fn pump_count(&self) -> usize {
        self.pumps.load(Ordering::SeqCst)
    }

    pub(crate) fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn live_endpoints(&self) -> usize {
        self.endpoints.lock().unwrap().len()
    }

    pub(crate) fn removed_endpoints(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }

    /// Ports of every live endpoint that is currently bound.
    pub(crate) fn bound_ports(&self) -> Vec<u16> {
        self.endpoints
            .lock()
            .unwrap()
            .iter()
            .filter_map(|s| s.port)
            .collect()
    }

    /// The current reading of the clock, without advancing it.
    pub(crate) fn peek_time(&self) -> u64 {
        self.current_time.load(Ordering::SeqCst)
    }

    pub(crate) fn sent_payloads(&self) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, p)| p.clone())
            .collect()
    }
}

impl Provider for MockPlatform {}

impl TimeProvider for MockPlatform {
    const COUNTS_PER_SECOND: u64 = 1_000_000;

    fn now(&self) -> Ticks {
        Ticks(self.current_time.fetch_add(1, Ordering::SeqCst))
    }
}

impl DelayProvider for MockPlatform {
    fn delay(&self, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap();
        self.current_time.fetch_add(micros, Ordering::SeqCst);
        self.delays.lock().unwrap().push(duration);
        self.delay_pumps.lock().unwrap().push(self.pump_count());
    }
}

impl DatagramStackProvider for MockPlatform {
    type Endpoint = MockEndpoint;
    type TransportBuffer = Vec<u8>;

    fn new_endpoint(&self, _buffer_size: usize) -> Option<Self::Endpoint> {
        if self.fail_endpoint_alloc.load(Ordering::SeqCst) {
            return None;
        }
        let id = self.next_endpoint.fetch_add(1, Ordering::SeqCst);
        self.endpoints.lock().unwrap().push(MockSlot {
            id,
            port: None,
            callback: None,
        });
        Some(MockEndpoint { id })
    }

    fn bind_endpoint(
        &self,
        endpoint: &mut Self::Endpoint,
        port: u16,
    ) -> Result<(), BindEndpointError> {
        if self.fail_bind.load(Ordering::SeqCst) {
            return Err(BindEndpointError::AddressInUse(port));
        }
        let mut endpoints = self.endpoints.lock().unwrap();
        if endpoints.iter().any(|s| s.port == Some(port)) {
            return Err(BindEndpointError::AddressInUse(port));
        }
        let slot = endpoints.iter_mut().find(|s| s.id == endpoint.id).unwrap();
        slot.port = Some(port);
        Ok(())
    }

    fn register_receive_callback(&self, endpoint: &mut Self::Endpoint, callback: ReceiveCallback) {
        let mut endpoints = self.endpoints.lock().unwrap();
        let slot = endpoints.iter_mut().find(|s| s.id == endpoint.id).unwrap();
        slot.callback = Some(callback);
    }

    fn alloc_transport_buffer(&self, len: usize) -> Option<Self::TransportBuffer> {
        if self.fail_buffer_alloc.load(Ordering::SeqCst) {
            None
        } else {
            Some(alloc::vec![0; len])
        }
    }

    fn send_datagram(
        &self,
        endpoint: &Self::Endpoint,
        destination: SocketAddrV4,
        datagram: &[u8],
    ) -> Result<(), SendDatagramError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        assert!(
            self.endpoints
                .lock()
                .unwrap()
                .iter()
                .any(|s| s.id == endpoint.id),
            "send on a removed endpoint"
        );
        if self
            .send_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SendDatagramError::BufferFull);
        }
        self.sent
            .lock()
            .unwrap()
            .push((destination, datagram.into()));
        Ok(())
    }

    fn remove_endpoint(&self, endpoint: Self::Endpoint) {
        let mut endpoints = self.endpoints.lock().unwrap();
        let before = endpoints.len();
        endpoints.retain(|s| s.id != endpoint.id);
        assert_eq!(endpoints.len() + 1, before, "endpoint removed twice");
        self.removed.fetch_add(1, Ordering::SeqCst);
    }

    fn pump(&self) {
        let count = self.pumps.fetch_add(1, Ordering::SeqCst) + 1;
        // Taken out for the duration of the call, so that the hook may itself inject datagrams.
        let hook = self.pump_hook.lock().unwrap().take();
        if let Some(mut hook) = hook {
            hook(count);
            let mut slot = self.pump_hook.lock().unwrap();
            if slot.is_none() {
                *slot = Some(hook);
            }
        }

        let ready: Vec<PendingDatagram> = {
            let mut pending = self.pending.lock().unwrap();
            let mut ready = Vec::new();
            let mut waiting = VecDeque::new();
            while let Some(mut d) = pending.pop_front() {
                if d.pumps_left == 0 {
                    ready.push(d);
                } else {
                    d.pumps_left -= 1;
                    waiting.push_back(d);
                }
            }
            *pending = waiting;
            ready
        };
        let mut endpoints = self.endpoints.lock().unwrap();
        for d in ready {
            // Newest bound endpoint with a callback gets the datagram; otherwise it is dropped,
            // just as an unbound port would drop it.
            if let Some(cb) = endpoints
                .iter_mut()
                .rev()
                .filter(|s| s.port.is_some())
                .find_map(|s| s.callback.as_mut())
            {
                cb(&d.payload, d.source);
            }
        }
    }
}

impl IPInterfaceProvider for MockPlatform {
    fn send_ip_packet(&self, packet: &[u8]) -> Result<(), IpSendError> {
        self.ip_packets.lock().unwrap().push_back(packet.into());
        Ok(())
    }

    fn receive_ip_packet(&self, packet: &mut [u8]) -> Result<usize, IpReceiveError> {
        let Some(v) = self.ip_packets.lock().unwrap().pop_front() else {
            return Err(IpReceiveError::WouldBlock);
        };
        assert!(v.len() <= packet.len());
        packet[..v.len()].copy_from_slice(&v);
        Ok(v.len())
    }
}

impl DebugLogProvider for MockPlatform {
    fn debug_log_print(&self, msg: &str) {
        std::eprint!("{msg}");
        self.log.lock().unwrap().push(msg.into());
    }
}
