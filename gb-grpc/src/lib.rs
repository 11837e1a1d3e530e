// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


pub mod axum_helper;
pub mod balancer;
pub mod client;
pub mod error;
pub mod inbound;
pub mod metadata;
pub mod resolver;
pub mod retry;
pub mod status;
pub mod target;

use axum::BoxError;
use bytes::Bytes;
use http_body::Frame;
use tokio::sync::mpsc;

pub use error::{Error, Result};
pub use status::Status;

pub const GRPC_STATUS: &str = "grpc-status";
pub const GRPC_MESSAGE: &str = "grpc-message";
pub const CONTENT_TYPE_GRPC: &str = "application/grpc";
pub const TRANSFER_ENCODING: &str = "te";
pub const TRANSFER_ENCODING_TRAILERS: &str = "trailers";

pub type BodySender = mpsc::Sender<std::result::Result<Frame<Bytes>, BoxError>>;
