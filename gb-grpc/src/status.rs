// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::{GRPC_MESSAGE, GRPC_STATUS};
use gb_grpc_codec::code::Code;
use http::{HeaderMap, HeaderValue, StatusCode};

//
// Status
//

// Wrapper for a gRPC status including a code and optional message.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct Status {
  pub code: Code,
  pub message: Option<String>,
}

impl Status {
  #[must_use]
  pub fn new(code: Code, message: impl Into<String>) -> Self {
    Self {
      code,
      message: Some(message.into()),
    }
  }

  #[must_use]
  pub const fn ok() -> Self {
    Self {
      code: Code::Ok,
      message: None,
    }
  }

  // Parse the status out of a trailer block (or the headers of a trailers-only response). Returns
  // None if there is no grpc-status. The message is percent-decoded.
  #[must_use]
  pub fn from_trailers(headers: &HeaderMap) -> Option<Self> {
    let code = Code::from_string(headers.get(GRPC_STATUS)?.to_str().unwrap_or_default());
    let message = headers
      .get(GRPC_MESSAGE)
      .and_then(|value| value.to_str().ok())
      .map(|value| {
        urlencoding::decode(value).map_or_else(|_| value.to_string(), |m| m.into_owned())
      });
    Some(Self { code, message })
  }

  // Status to use when a gRPC response comes back with a non-200 HTTP status.
  // See https://github.com/grpc/grpc/blob/master/doc/http-grpc-status-mapping.md.
  #[must_use]
  pub fn from_http(status: StatusCode) -> Self {
    let code = match status {
      StatusCode::BAD_REQUEST => Code::Internal,
      StatusCode::UNAUTHORIZED => Code::Unauthenticated,
      StatusCode::FORBIDDEN => Code::PermissionDenied,
      StatusCode::NOT_FOUND => Code::Unimplemented,
      StatusCode::TOO_MANY_REQUESTS
      | StatusCode::BAD_GATEWAY
      | StatusCode::SERVICE_UNAVAILABLE
      | StatusCode::GATEWAY_TIMEOUT => Code::Unavailable,
      _ => Code::Unknown,
    };
    Self::new(code, format!("unexpected HTTP status: {status}"))
  }

  // Writes grpc-status and grpc-message into a trailer block that already holds the metadata to
  // send back. Any status keys already present in the metadata are replaced.
  #[must_use]
  pub fn to_trailers(&self, mut metadata: HeaderMap) -> HeaderMap {
    metadata.insert(GRPC_STATUS, HeaderValue::from(self.code.to_int()));
    metadata.remove(GRPC_MESSAGE);
    if let Some(message) = &self.message {
      // We need to make sure the message is a valid header so we URL encode it to be sure.
      if let Ok(value) = HeaderValue::from_str(&urlencoding::encode(message)) {
        metadata.insert(GRPC_MESSAGE, value);
      }
    }
    metadata
  }
}

impl std::fmt::Display for Status {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "code: {}, message: {}",
      self.code,
      self.message.as_deref().unwrap_or("<none>")
    )
  }
}

impl std::error::Error for Status {}
