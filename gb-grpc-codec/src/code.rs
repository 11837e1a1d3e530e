// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

//
// Code
//

// The full set of gRPC status codes. A proxy has to carry whatever the downstream returns, so
// unlike a service implementation every code is represented. Values that are not valid codes map
// to Unknown.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub enum Code {
  Ok,
  Cancelled,
  Unknown,
  InvalidArgument,
  DeadlineExceeded,
  NotFound,
  AlreadyExists,
  PermissionDenied,
  ResourceExhausted,
  FailedPrecondition,
  Aborted,
  OutOfRange,
  Unimplemented,
  Internal,
  Unavailable,
  DataLoss,
  Unauthenticated,
}

impl Code {
  // Convert to an int via https://grpc.github.io/grpc/core/md_doc_statuscodes.html.
  #[must_use]
  pub const fn to_int(self) -> i32 {
    match self {
      Self::Ok => 0,
      Self::Cancelled => 1,
      Self::Unknown => 2,
      Self::InvalidArgument => 3,
      Self::DeadlineExceeded => 4,
      Self::NotFound => 5,
      Self::AlreadyExists => 6,
      Self::PermissionDenied => 7,
      Self::ResourceExhausted => 8,
      Self::FailedPrecondition => 9,
      Self::Aborted => 10,
      Self::OutOfRange => 11,
      Self::Unimplemented => 12,
      Self::Internal => 13,
      Self::Unavailable => 14,
      Self::DataLoss => 15,
      Self::Unauthenticated => 16,
    }
  }

  #[must_use]
  pub const fn from_int(value: i32) -> Self {
    match value {
      0 => Self::Ok,
      1 => Self::Cancelled,
      3 => Self::InvalidArgument,
      4 => Self::DeadlineExceeded,
      5 => Self::NotFound,
      6 => Self::AlreadyExists,
      7 => Self::PermissionDenied,
      8 => Self::ResourceExhausted,
      9 => Self::FailedPrecondition,
      10 => Self::Aborted,
      11 => Self::OutOfRange,
      12 => Self::Unimplemented,
      13 => Self::Internal,
      14 => Self::Unavailable,
      15 => Self::DataLoss,
      16 => Self::Unauthenticated,
      _ => Self::Unknown,
    }
  }

  // Convert from the decimal form used in the grpc-status header.
  #[must_use]
  pub fn from_string(status: &str) -> Self {
    status.trim().parse().map_or(Self::Unknown, Self::from_int)
  }

  // Canonical upper snake case name, as used in service configs and logs.
  #[must_use]
  pub const fn name(self) -> &'static str {
    match self {
      Self::Ok => "OK",
      Self::Cancelled => "CANCELLED",
      Self::Unknown => "UNKNOWN",
      Self::InvalidArgument => "INVALID_ARGUMENT",
      Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
      Self::NotFound => "NOT_FOUND",
      Self::AlreadyExists => "ALREADY_EXISTS",
      Self::PermissionDenied => "PERMISSION_DENIED",
      Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
      Self::FailedPrecondition => "FAILED_PRECONDITION",
      Self::Aborted => "ABORTED",
      Self::OutOfRange => "OUT_OF_RANGE",
      Self::Unimplemented => "UNIMPLEMENTED",
      Self::Internal => "INTERNAL",
      Self::Unavailable => "UNAVAILABLE",
      Self::DataLoss => "DATA_LOSS",
      Self::Unauthenticated => "UNAUTHENTICATED",
    }
  }
}

impl std::fmt::Display for Code {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.name())
  }
}
