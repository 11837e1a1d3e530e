// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


pub mod code;

use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(thiserror::Error, Debug)]
pub enum Error {
  #[error("invalid compression flag: {0}")]
  InvalidCompressionFlag(u8),
  #[error("frame of {size} bytes exceeds the maximum of {max} bytes")]
  FrameTooLarge { size: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

// Compression byte + 4 message size bytes.
pub const GRPC_MESSAGE_PREFIX_LEN: usize = 5;

// Upper bound on a single received frame unless configured otherwise. This only guards memory, the
// payload itself is never inspected.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

//
// Frame
//

// A single gRPC message as it appears on the wire, minus the length prefix. The payload is opaque
// and is forwarded as is. If the compressed flag is set the payload is encoded with whatever
// grpc-encoding the peers negotiated, which travels separately as metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
  pub compressed: bool,
  pub payload: Bytes,
}

impl Frame {
  #[must_use]
  pub fn new(payload: impl Into<Bytes>) -> Self {
    Self {
      compressed: false,
      payload: payload.into(),
    }
  }

  // The number of bytes this frame occupies on the wire, including the prefix.
  #[must_use]
  pub fn wire_len(&self) -> usize {
    self.payload.len() + GRPC_MESSAGE_PREFIX_LEN
  }
}

//
// Encoder
//

#[derive(Debug, Default)]
pub struct Encoder {
  tx_frames: u64,
  tx_bytes: u64,
}

impl Encoder {
  // Converts a frame back into its length prefixed wire form.
  // See https://github.com/grpc/grpc/blob/master/doc/PROTOCOL-HTTP2.md#requests for an
  // explanation of the gRPC wire format.
  pub fn encode(&mut self, frame: &Frame) -> Bytes {
    let mut buffer = BytesMut::with_capacity(frame.wire_len());
    buffer.put_u8(u8::from(frame.compressed));
    #[allow(clippy::cast_possible_truncation)]
    buffer.put_u32(frame.payload.len() as u32);
    buffer.put_slice(&frame.payload);
    log::trace!(
      "writing frame len={} compressed={}",
      frame.payload.len(),
      frame.compressed
    );

    self.tx_frames += 1;
    self.tx_bytes += buffer.len() as u64;
    buffer.freeze()
  }

  // (frames, bytes) written so far.
  #[must_use]
  pub const fn stats(&self) -> (u64, u64) {
    (self.tx_frames, self.tx_bytes)
  }
}

//
// Decoder
//

// A stateful gRPC frame decoder. As data is added for decoding, the decoder returns as many
// complete frames as possible. Partial data (a split prefix or a payload spread over multiple DATA
// frames) is retained and combined with the data added on the next call.
#[derive(Debug)]
pub struct Decoder {
  buffer: BytesMut,
  current: Option<(bool, usize)>,
  max_frame_size: usize,
  rx_frames: u64,
  rx_bytes: u64,
}

impl Default for Decoder {
  fn default() -> Self {
    Self::new(DEFAULT_MAX_FRAME_SIZE)
  }
}

impl Decoder {
  #[must_use]
  pub fn new(max_frame_size: usize) -> Self {
    Self {
      buffer: BytesMut::new(),
      current: None,
      max_frame_size,
      rx_frames: 0,
      rx_bytes: 0,
    }
  }

  // Decodes data, returning all complete frames parsed from the incoming data plus any leftover
  // data from previous calls.
  pub fn decode_data(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
    self.buffer.extend_from_slice(data);
    self.rx_bytes += data.len() as u64;

    let mut frames = Vec::new();
    loop {
      match self.current {
        None => {
          if self.buffer.len() < GRPC_MESSAGE_PREFIX_LEN {
            return Ok(frames);
          }

          let compressed = match self.buffer.get_u8() {
            0 => false,
            1 => true,
            flag => return Err(Error::InvalidCompressionFlag(flag)),
          };
          let size = self.buffer.get_u32() as usize;
          if size > self.max_frame_size {
            return Err(Error::FrameTooLarge {
              size,
              max: self.max_frame_size,
            });
          }
          log::trace!("next frame len={size} compressed={compressed}");
          self.current = Some((compressed, size));
        },
        Some((compressed, size)) => {
          if self.buffer.len() < size {
            // Make sure the remainder of the payload fits without reallocating on every chunk.
            self.buffer.reserve(size - self.buffer.len());
            return Ok(frames);
          }

          self.current = None;
          self.rx_frames += 1;
          frames.push(Frame {
            compressed,
            payload: self.buffer.split_to(size).freeze(),
          });
        },
      }
    }
  }

  // Whether the decoder holds no partial frame. A stream that ends while this is false was cut
  // off in the middle of a frame.
  #[must_use]
  pub fn is_idle(&self) -> bool {
    self.current.is_none() && self.buffer.is_empty()
  }

  // (frames, bytes) read so far.
  #[must_use]
  pub const fn stats(&self) -> (u64, u64) {
    (self.rx_frames, self.rx_bytes)
  }
}
