// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::status::Status;
use axum::BoxError;
use gb_grpc_codec::code::Code;

//
// Error
//

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("Body stream error ocurred: {0}")]
  BodyStream(BoxError),
  #[error("Stream has closed")]
  Closed,
  #[error("A codec error occurred: {0}")]
  Codec(#[from] gb_grpc_codec::Error),
  #[error("A gRPC error occurred: {0}")]
  Grpc(#[from] Status),
  #[error("The call was cancelled")]
  Cancelled,
  #[error("Stream ended in the middle of a frame")]
  TruncatedFrame,
  #[error("Response headers have already been sent")]
  HeadersAlreadySent,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
  // The status a caller sees when this error ends a call. Downstream statuses are relayed as is,
  // anything produced by the proxy itself is INTERNAL.
  #[must_use]
  pub fn into_status(self) -> Status {
    match self {
      Self::Grpc(status) => status,
      Self::Cancelled => Status::new(Code::Cancelled, self.to_string()),
      Self::BodyStream(_)
      | Self::Closed
      | Self::Codec(_)
      | Self::TruncatedFrame
      | Self::HeadersAlreadySent => Status::new(Code::Internal, self.to_string()),
    }
  }

  // A message worth a (rate limited) warning. Statuses relayed from downstream and callers going
  // away are routine.
  #[must_use]
  pub fn warn_every_message(&self) -> Option<String> {
    match self {
      Self::Grpc(status) => (status.code == Code::Internal).then(|| {
        format!(
          "gRPC internal error ({})",
          status.message.as_deref().unwrap_or_default()
        )
      }),
      Self::Closed | Self::Cancelled => None,
      Self::BodyStream(e) => Some(format!("body stream error: {e}")),
      Self::Codec(e) => Some(format!("codec error: {e}")),
      Self::TruncatedFrame | Self::HeadersAlreadySent => Some(self.to_string()),
    }
  }
}
