// Copyright 2021 Locha Mesh Developers <contact@locha.io>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! MT/ZNP frame encoding and scanning.
//!
//! ```text
//! | SOF (0xFE) | len | cmd0 | cmd1 | payload[len] | fcs |
//! ```
//!
//! `fcs` is the XOR of `len`, `cmd0`, `cmd1` and the payload bytes.

use std::fmt;

use crate::{link::Feed, Error, Result};

/// Start of frame.
pub const SOF: u8 = 0xFE;
/// Bytes of a frame besides the payload.
pub const OVERHEAD: usize = 5;
/// Largest payload a frame can carry.
pub const MAX_PAYLOAD: usize = u8::MAX as usize;

/// XOR frame check sequence.
pub fn fcs(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// A decoded MT/ZNP frame.
#[derive(Clone, Eq, PartialEq)]
pub struct Frame {
    pub cmd0: u8,
    pub cmd1: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(cmd0: u8, cmd1: u8, payload: &[u8]) -> Self {
        Frame {
            cmd0,
            cmd1,
            payload: payload.to_vec(),
        }
    }

    /// Serialize the frame.
    ///
    /// # Errors
    ///
    /// [`Error::PayloadTooLarge`] if the payload doesn't fit the one byte
    /// length field.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(Error::PayloadTooLarge(self.payload.len()));
        }

        let mut out = Vec::with_capacity(OVERHEAD + self.payload.len());
        out.push(SOF);
        out.push(self.payload.len() as u8);
        out.push(self.cmd0);
        out.push(self.cmd1);
        out.extend_from_slice(&self.payload);
        out.push(fcs(&out[1..]));

        Ok(out)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame({:02X} {:02X} [{}])",
            self.cmd0,
            self.cmd1,
            hex::encode(&self.payload)
        )
    }
}

/// Incremental frame parser.
///
/// Bytes are appended with [`Feed::feed`] in whatever grouping they arrive
/// and complete frames are taken out with
/// [`FrameScanner::try_extract_frame`]. Bytes before a start of frame are
/// dropped, a frame failing the FCS check is dropped up to and including
/// its start of frame so the scan resumes at the next `0xFE`.
#[derive(Debug, Default)]
pub struct FrameScanner {
    buf: Vec<u8>,
}

impl Feed for FrameScanner {
    fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every buffered byte.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Number of buffered bytes.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Take the first valid frame out of the buffer, if any.
    pub fn try_extract_frame(&mut self) -> Option<Frame> {
        loop {
            let start = match self.buf.iter().position(|b| *b == SOF) {
                Some(start) => start,
                None => {
                    self.buf.clear();
                    return None;
                }
            };
            self.buf.drain(..start);

            if self.buf.len() < OVERHEAD {
                return None;
            }

            let len = usize::from(self.buf[1]);
            let frame_len = OVERHEAD + len;
            if self.buf.len() < frame_len {
                return None;
            }

            let expected = fcs(&self.buf[1..frame_len - 1]);
            let found = self.buf[frame_len - 1];
            if expected != found {
                log::debug!(
                    "MT frame FCS mismatch (expected {:#04X}, found {:#04X}), resyncing",
                    expected,
                    found
                );
                self.buf.drain(..1);
                continue;
            }

            let frame = Frame {
                cmd0: self.buf[2],
                cmd1: self.buf[3],
                payload: self.buf[4..frame_len - 1].to_vec(),
            };
            self.buf.drain(..frame_len);

            log::trace!("MT rx {:?}", frame);
            return Some(frame);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_encode() {
        let frame = Frame::new(0x21, 0x13, &[0x03, 0x00]).encode().unwrap();
        assert_eq!(frame, vec![0xFE, 0x02, 0x21, 0x13, 0x03, 0x00, 0x33]);
        assert_eq!(fcs(&frame[1..frame.len() - 1]), frame[frame.len() - 1]);

        let frame = Frame::new(0x21, 0x01, &[]).encode().unwrap();
        assert_eq!(frame, vec![0xFE, 0x00, 0x21, 0x01, 0x20]);

        assert!(matches!(
            Frame::new(0x21, 0x34, &[0u8; 256]).encode(),
            Err(Error::PayloadTooLarge(256))
        ));
    }

    #[test]
    fn test_extract_split_and_noise() {
        let frame = Frame::new(0x61, 0x02, &[1, 2, 3]).encode().unwrap();

        let mut scanner = FrameScanner::new();
        scanner.feed(&[0x00, 0x13]);
        scanner.feed(&frame[..3]);
        assert!(scanner.try_extract_frame().is_none());
        scanner.feed(&frame[3..]);

        let got = scanner.try_extract_frame().unwrap();
        assert_eq!(got, Frame::new(0x61, 0x02, &[1, 2, 3]));
        assert!(scanner.try_extract_frame().is_none());
        assert_eq!(scanner.pending(), 0);
    }

    #[test]
    fn test_two_frames_in_one_chunk() {
        let mut data = Frame::new(0x61, 0x01, &[0x79, 0x01]).encode().unwrap();
        data.extend(Frame::new(0x41, 0x80, &[0x00]).encode().unwrap());

        let mut scanner = FrameScanner::new();
        scanner.feed(&data);
        assert_eq!(scanner.try_extract_frame().unwrap().cmd1, 0x01);
        assert_eq!(scanner.try_extract_frame().unwrap().cmd0, 0x41);
        assert!(scanner.try_extract_frame().is_none());
    }

    #[test]
    fn test_corrupted_frame_is_skipped() {
        let good = Frame::new(0x61, 0x99, &[]);
        let good_bytes = good.encode().unwrap();
        let original = Frame::new(0x61, 0x02, &[0x10, 0x20, 0x30]).encode().unwrap();

        for i in 0..original.len() {
            let mut corrupted = original.clone();
            corrupted[i] ^= 0x01;

            let mut scanner = FrameScanner::new();
            scanner.feed(&corrupted);
            scanner.feed(&good_bytes);

            assert_eq!(
                scanner.try_extract_frame(),
                Some(good.clone()),
                "corrupted byte #{}",
                i
            );
            assert!(scanner.try_extract_frame().is_none());
        }
    }

    #[test]
    fn test_resync_inside_bad_frame() {
        // A bad frame whose payload hides a valid one.
        let inner = Frame::new(0x61, 0x13, &[0x10, 0x00]).encode().unwrap();
        let mut data = vec![SOF, inner.len() as u8, 0x61, 0x00];
        data.extend_from_slice(&inner);
        data.push(0x00);

        let mut scanner = FrameScanner::new();
        scanner.feed(&data);
        assert_eq!(
            scanner.try_extract_frame(),
            Some(Frame::new(0x61, 0x13, &[0x10, 0x00]))
        );
    }
}
