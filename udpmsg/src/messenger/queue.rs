// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Inbound packet queue shared between the dispatch callback and the messenger.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::{String, ToString as _};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::net::SocketAddrV4;

use crate::platform::ReceiveCallback;

/// One datagram as it arrived from the stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub bytes: Vec<u8>,
    pub source: SocketAddrV4,
}

/// Received payloads, grouped by the textual IPv4 address of their sender, each group in
/// arrival order.
pub type PacketMap = BTreeMap<String, VecDeque<Vec<u8>>>;

/// FIFO of [`Packet`]s.
///
/// The stack may run the dispatch callback from a different context than the one draining the
/// queue, hence the lock.
#[derive(Default)]
pub(crate) struct PacketQueue {
    inner: spin::Mutex<VecDeque<Packet>>,
}

impl PacketQueue {
    pub(crate) fn push(&self, packet: Packet) {
        self.inner.lock().push_back(packet);
    }

    pub(crate) fn pop_front(&self) -> Option<Packet> {
        self.inner.lock().pop_front()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Total payload bytes currently queued.
    pub(crate) fn queued_bytes(&self) -> usize {
        self.inner.lock().iter().map(|p| p.bytes.len()).sum()
    }

    /// Move every queued packet into `map`, oldest first.
    pub(crate) fn drain_into(&self, map: &mut PacketMap) {
        // Taken under the lock and appended outside it, so the callback is never held up by
        // the map's allocations.
        let drained = core::mem::take(&mut *self.inner.lock());
        for packet in drained {
            append(map, packet);
        }
    }
}

/// Append `packet`'s payload to the group for its source address.
pub(crate) fn append(map: &mut PacketMap, packet: Packet) {
    map.entry(packet.source.ip().to_string())
        .or_default()
        .push_back(packet.bytes);
}

/// The callback to register with the stack: copies each datagram into `queue`.
pub(crate) fn dispatch_callback(queue: Arc<PacketQueue>) -> ReceiveCallback {
    Box::new(move |payload: &[u8], source: SocketAddrV4| {
        queue.push(Packet {
            bytes: payload.to_vec(),
            source,
        });
    })
}
