// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Possible errors from [`UdpMessenger`]

use crate::platform::{BindEndpointError, SendDatagramError};

#[expect(
    unused_imports,
    reason = "used for doc string links to work out, but not for code"
)]
use super::UdpMessenger;

use thiserror::Error;

/// Possible errors from [`UdpMessenger::bind`]
#[non_exhaustive]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindError {
    #[error("Unable to allocate a network endpoint")]
    EndpointAllocation,
    #[error("Unable to bind to port {port}")]
    Bind {
        port: u16,
        #[source]
        source: BindEndpointError,
    },
}

/// Possible errors from [`UdpMessenger::send_to`] and friends
#[non_exhaustive]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("Socket is not open")]
    NotOpen,
    #[error("Unable to allocate a {len}-byte transport buffer")]
    BufferAllocation { len: usize },
    #[error("Gave up after {attempts} send attempts")]
    RetriesExhausted {
        attempts: u8,
        #[source]
        source: SendDatagramError,
    },
}

/// Possible errors from [`UdpMessenger::receive_into`]
#[non_exhaustive]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveError {
    #[error("Socket is not open")]
    NotOpen,
    #[error("No datagram arrived before the wait ended")]
    NoResponse,
}

/// Coarse result code for any messenger operation.
///
/// `NoResponse` means "try again later"; `SocketError` means the socket needs re-binding or is
/// structurally broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok,
    SocketError,
    NoResponse,
}

/// Anything that can be collapsed into an [`ErrorCode`].
pub trait Coded {
    fn code(&self) -> ErrorCode;
}

impl Coded for BindError {
    fn code(&self) -> ErrorCode {
        ErrorCode::SocketError
    }
}

impl Coded for SendError {
    fn code(&self) -> ErrorCode {
        ErrorCode::SocketError
    }
}

impl Coded for ReceiveError {
    fn code(&self) -> ErrorCode {
        match self {
            ReceiveError::NotOpen => ErrorCode::SocketError,
            ReceiveError::NoResponse => ErrorCode::NoResponse,
        }
    }
}

impl<T, E: Coded> Coded for Result<T, E> {
    fn code(&self) -> ErrorCode {
        match self {
            Ok(_) => ErrorCode::Ok,
            Err(e) => e.code(),
        }
    }
}
