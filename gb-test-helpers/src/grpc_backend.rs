// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::{BodySender, CONTENT_TYPE_GRPC};
use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use gb_grpc_codec::code::Code;
use gb_grpc_codec::{Decoder, Encoder};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue};
use http_body_util::{BodyExt, StreamBody};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

// Request headers that steer the backend.
// Finish the call with this status (after echoing) instead of OK.
pub const STATUS_HEADER: &str = "x-backend-status";
// Message to go with STATUS_HEADER or TRAILERS_ONLY_HEADER.
pub const MESSAGE_HEADER: &str = "x-backend-message";
// Reply immediately with a trailers-only response carrying this status.
pub const TRAILERS_ONLY_HEADER: &str = "x-backend-trailers-only";
// Never finish the call. Once the client half-closes the backend waits for the call to be
// cancelled, see TestBackend::cancelled_calls.
pub const HOLD_OPEN_HEADER: &str = "x-backend-hold-open";

// Response metadata added by the backend. Both carry the backend name.
pub const NAME_HEADER: &str = "x-backend";
pub const NAME_TRAILER: &str = "x-backend-trailer";

//
// BackendOptions
//

#[derive(Clone, Debug)]
pub struct BackendOptions {
  pub name: String,
  // The first N calls are rejected with `fail_code` as a trailers-only response.
  pub fail_first: usize,
  pub fail_code: Code,
  // Read the whole request before rejecting a call.
  pub fail_after_request: bool,
}

impl BackendOptions {
  #[must_use]
  pub fn named(name: &str) -> Self {
    Self {
      name: name.to_string(),
      fail_first: 0,
      fail_code: Code::Unavailable,
      fail_after_request: false,
    }
  }
}

//
// RecordedCall
//

#[derive(Clone, Debug)]
pub struct RecordedCall {
  pub method: String,
  pub headers: HeaderMap,
}

struct BackendState {
  options: BackendOptions,
  calls: Mutex<Vec<RecordedCall>>,
  failures_remaining: AtomicUsize,
  cancelled_calls: AtomicUsize,
}

//
// TestBackend
//

// An in-process gRPC server that knows nothing about any schema. It echoes every request frame
// back as soon as it arrives, and ends the call once the client half-closes. Behavior can be
// changed per call with the headers above.
pub struct TestBackend {
  address: SocketAddr,
  state: Arc<BackendState>,
  server: JoinHandle<()>,
}

impl TestBackend {
  pub async fn start(options: BackendOptions) -> Self {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    log::debug!("binding test backend {} to {address}", options.name);

    let state = Arc::new(BackendState {
      failures_remaining: AtomicUsize::new(options.fail_first),
      options,
      calls: Mutex::default(),
      cancelled_calls: AtomicUsize::new(0),
    });
    let router_state = state.clone();
    let router = axum::Router::new().fallback(move |request: Request| {
      let state = router_state.clone();
      handle(state, request)
    });
    let server = tokio::spawn(async move {
      let _ignored = axum::serve(listener, router.into_make_service()).await;
    });

    Self {
      address,
      state,
      server,
    }
  }

  #[must_use]
  pub const fn address(&self) -> SocketAddr {
    self.address
  }

  #[must_use]
  pub fn calls(&self) -> Vec<RecordedCall> {
    self.state.calls.lock().clone()
  }

  // Held open calls that have since been cancelled by the client.
  #[must_use]
  pub fn cancelled_calls(&self) -> usize {
    self.state.cancelled_calls.load(Ordering::SeqCst)
  }
}

impl Drop for TestBackend {
  fn drop(&mut self) {
    self.server.abort();
  }
}

fn header_code(headers: &HeaderMap, name: &str) -> Option<Code> {
  headers
    .get(name)
    .and_then(|value| value.to_str().ok())
    .map(Code::from_string)
}

fn status_trailers(name: &str, code: Code, message: Option<&HeaderValue>) -> HeaderMap {
  let mut trailers = HeaderMap::new();
  trailers.insert(NAME_TRAILER, HeaderValue::from_str(name).unwrap());
  trailers.insert("grpc-status", HeaderValue::from(code.to_int()));
  if let Some(message) = message {
    trailers.insert("grpc-message", message.clone());
  }
  trailers
}

async fn handle(state: Arc<BackendState>, request: Request) -> Response {
  let (parts, mut body) = request.into_parts();
  state.calls.lock().push(RecordedCall {
    method: parts.uri.path().to_string(),
    headers: parts.headers.clone(),
  });
  let name = state.options.name.clone();

  let injected_failure = state
    .failures_remaining
    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
      remaining.checked_sub(1)
    })
    .is_ok();
  let trailers_only = if injected_failure {
    Some(status_trailers(
      &name,
      state.options.fail_code,
      Some(&HeaderValue::from_static("injected%20failure")),
    ))
  } else {
    header_code(&parts.headers, TRAILERS_ONLY_HEADER)
      .map(|code| status_trailers(&name, code, parts.headers.get(MESSAGE_HEADER)))
  };
  if let Some(mut trailers) = trailers_only {
    if injected_failure && state.options.fail_after_request {
      while let Some(Ok(_)) = body.frame().await {}
    }
    trailers.insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_GRPC));
    let mut response = Response::new(Body::empty());
    *response.headers_mut() = trailers;
    return response;
  }

  let final_trailers = status_trailers(
    &name,
    header_code(&parts.headers, STATUS_HEADER).unwrap_or(Code::Ok),
    parts.headers.get(MESSAGE_HEADER),
  );
  let hold_open = parts.headers.contains_key(HOLD_OPEN_HEADER);
  let (tx, rx): (BodySender, _) = mpsc::channel(1);
  tokio::spawn(async move {
    let echoed = echo(&mut body, &tx).await;
    if hold_open {
      tx.closed().await;
      log::debug!("held open call was cancelled");
      state.cancelled_calls.fetch_add(1, Ordering::SeqCst);
      return;
    }
    if echoed {
      let _ignored = tx.send(Ok(http_body::Frame::trailers(final_trailers))).await;
    }
  });

  let mut response = Response::new(Body::new(StreamBody::new(ReceiverStream::new(rx))));
  response
    .headers_mut()
    .insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_GRPC));
  response
    .headers_mut()
    .insert(NAME_HEADER, HeaderValue::from_str(&name).unwrap());
  response
}

// Echo request frames until the client half-closes. Returns false if the call broke off first.
async fn echo(body: &mut Body, tx: &BodySender) -> bool {
  let mut decoder = Decoder::default();
  let mut encoder = Encoder::default();
  while let Some(frame) = body.frame().await {
    let Ok(frame) = frame else {
      return false;
    };
    let Some(data) = frame.data_ref() else {
      continue;
    };
    let Ok(frames) = decoder.decode_data(data) else {
      return false;
    };
    for frame in frames {
      if tx
        .send(Ok(http_body::Frame::data(encoder.encode(&frame))))
        .await
        .is_err()
      {
        return false;
      }
    }
  }
  true
}
