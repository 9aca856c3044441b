// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! # udpmsg
//!
//! > Datagram messaging for endpoints without threads or blocking sockets.
//!
//! `udpmsg` opens a single UDP-style endpoint, sends payloads of any size by splitting them into
//! link-sized chunks, and exposes an inbound packet queue that is filled whenever the underlying
//! network stack is pumped.
//!
//! To use `udpmsg`, provide a type implementing [`platform::Provider`] (or build one out of an
//! IP-level platform with [`stack::IpStack`]); then hand a `'static` reference to it to
//! [`messenger::UdpMessenger::new`].

#![no_std]

extern crate alloc;

pub mod messenger;
pub mod platform;
pub mod stack;

pub use messenger::{Interrupter, UdpMessenger};
