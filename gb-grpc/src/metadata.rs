// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./metadata_test.rs"]
mod metadata_test;

use crate::{GRPC_MESSAGE, GRPC_STATUS};
use http::HeaderMap;
use http::header::{
  CONNECTION,
  CONTENT_LENGTH,
  CONTENT_TYPE,
  HOST,
  HeaderName,
  TE,
  TRANSFER_ENCODING,
  UPGRADE,
};

// Hop-by-hop headers. These describe a single HTTP connection and are regenerated by the transport
// on the other side, so they never travel as call metadata.
const CONNECTION_HEADERS: &[&str] = &["keep-alive", "proxy-connection"];

fn is_connection_header(name: &HeaderName) -> bool {
  [CONNECTION, TE, HOST, CONTENT_LENGTH, TRANSFER_ENCODING, UPGRADE].contains(name)
    || CONNECTION_HEADERS.contains(&name.as_str())
}

// Copy every header that is call metadata. Multi-valued keys keep their value order. The source
// map is left untouched.
fn copy_filtered(headers: &HeaderMap, keep: impl Fn(&HeaderName) -> bool) -> HeaderMap {
  let mut metadata = HeaderMap::with_capacity(headers.len());
  for (name, value) in headers {
    if keep(name) {
      metadata.append(name.clone(), value.clone());
    }
  }
  metadata
}

// Metadata of an inbound request, to be forwarded downstream as is. Includes content-type,
// grpc-timeout, grpc-encoding and binary (-bin) keys.
#[must_use]
pub fn request_metadata(headers: &HeaderMap) -> HeaderMap {
  copy_filtered(headers, |name| !is_connection_header(name))
}

// Metadata of a downstream response head, to be sent back to the caller.
#[must_use]
pub fn response_metadata(headers: &HeaderMap) -> HeaderMap {
  copy_filtered(headers, |name| !is_connection_header(name))
}

// Metadata of a trailer block. The status keys are dropped as they are re-derived from the final
// status of the call.
#[must_use]
pub fn trailer_metadata(trailers: &HeaderMap) -> HeaderMap {
  copy_filtered(trailers, |name| {
    !is_connection_header(name)
      && *name != CONTENT_TYPE
      && name != GRPC_STATUS
      && name != GRPC_MESSAGE
  })
}
