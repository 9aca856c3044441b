// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Splitting of outbound payloads into datagram-sized chunks.
//!
//! Chunks carry no framing of any kind; a peer that needs the original message back must be
//! told its boundaries by some other means.

use core::iter::Once;
use core::slice::Chunks;

use either::Either;

use super::MAX_USER_DATA;

/// The chunks `payload` is sent as, in order.
///
/// A payload of at most [`MAX_USER_DATA`] bytes (including an empty one) is a single chunk.
/// Anything larger becomes `ceil(len / MAX_USER_DATA)` chunks, all full except possibly the last.
pub(crate) fn fragments(payload: &[u8]) -> Either<Once<&[u8]>, Chunks<'_, u8>> {
    if payload.len() <= MAX_USER_DATA {
        Either::Left(core::iter::once(payload))
    } else {
        Either::Right(payload.chunks(MAX_USER_DATA))
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use alloc::vec::Vec;

    fn sizes(len: usize) -> Vec<usize> {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let chunks: Vec<&[u8]> = fragments(&payload).collect();
        assert_eq!(chunks.concat(), payload);
        chunks.iter().map(|c| c.len()).collect()
    }

    #[test]
    fn small_payloads_are_one_chunk() {
        assert_eq!(sizes(0), [0]);
        assert_eq!(sizes(1), [1]);
        assert_eq!(sizes(MAX_USER_DATA), [MAX_USER_DATA]);
    }

    #[test]
    fn large_payloads_split() {
        assert_eq!(sizes(MAX_USER_DATA + 1), [1400, 1]);
        assert_eq!(sizes(3000), [1400, 1400, 200]);
    }

    #[test]
    fn exact_multiple_has_no_trailing_empty_chunk() {
        assert_eq!(sizes(2 * MAX_USER_DATA), [1400, 1400]);
        assert_eq!(sizes(5 * MAX_USER_DATA), [1400; 5]);
    }
}
