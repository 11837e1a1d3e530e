// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod grpc_backend;
pub mod grpc_client;

use axum::BoxError;
use bytes::Bytes;
use tokio::sync::mpsc;

pub const CONTENT_TYPE_GRPC: &str = "application/grpc";

type BodySender = mpsc::Sender<Result<http_body::Frame<Bytes>, BoxError>>;

pub fn test_global_init() {
  gb_log::initialize();
}
