// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::error::{Error, Result};
use crate::metadata::request_metadata;
use crate::status::Status;
use crate::{BodySender, CONTENT_TYPE_GRPC};
use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use gb_grpc_codec::code::Code;
use gb_grpc_codec::{Decoder, Encoder, Frame};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue};
use http_body_util::{BodyExt, StreamBody};
use std::collections::VecDeque;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

// Returns the path if it has the /service/method form.
fn method_from_path(path: &str) -> Option<String> {
  let (service, method) = path.strip_prefix('/')?.split_once('/')?;
  (!service.is_empty() && !method.is_empty() && !method.contains('/')).then(|| path.to_string())
}

//
// ResponseHead
//

pub enum ResponseHead {
  // Response headers, followed by frames and a trailer block in the body.
  Headers(HeaderMap),
  // The call ended before anything was sent. The status and trailer metadata travel as the
  // response headers and the body is empty.
  TrailersOnly(HeaderMap),
}

//
// InboundCall
//

// A call accepted by the server, for any method. The response is produced through the sink, and
// is handed to the server by PendingResponse once its head is known.
pub struct InboundCall {
  method: Option<String>,
  metadata: HeaderMap,
  source: InboundSource,
  sink: InboundSink,
}

impl InboundCall {
  #[must_use]
  pub fn new(request: Request, max_frame_size: usize) -> (Self, PendingResponse) {
    let (parts, body) = request.into_parts();
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(1);

    (
      Self {
        method: method_from_path(parts.uri.path()),
        metadata: request_metadata(&parts.headers),
        source: InboundSource {
          body,
          decoder: Decoder::new(max_frame_size),
          pending: VecDeque::new(),
        },
        sink: InboundSink {
          head_tx: Some(head_tx),
          body_tx,
          encoder: Encoder::default(),
        },
      },
      PendingResponse { head_rx, body_rx },
    )
  }

  // The fully qualified method (/package.Service/Method), if the request path has that form.
  #[must_use]
  pub fn method(&self) -> Option<&str> {
    self.method.as_deref()
  }

  // Request metadata, minus connection level headers.
  #[must_use]
  pub const fn metadata(&self) -> &HeaderMap {
    &self.metadata
  }

  #[must_use]
  pub fn into_parts(self) -> (Option<String>, HeaderMap, InboundSource, InboundSink) {
    (self.method, self.metadata, self.source, self.sink)
  }
}

//
// PendingResponse
//

pub struct PendingResponse {
  head_rx: oneshot::Receiver<ResponseHead>,
  body_rx: mpsc::Receiver<std::result::Result<http_body::Frame<bytes::Bytes>, axum::BoxError>>,
}

fn with_grpc_content_type(mut response: Response) -> Response {
  response
    .headers_mut()
    .entry(CONTENT_TYPE)
    .or_insert(HeaderValue::from_static(CONTENT_TYPE_GRPC));
  response
}

impl PendingResponse {
  // Wait until the call decides on its response head.
  pub async fn into_response(self) -> Response {
    let (headers, body) = match self.head_rx.await {
      Ok(ResponseHead::Headers(headers)) => (
        headers,
        Body::new(StreamBody::new(ReceiverStream::new(self.body_rx))),
      ),
      Ok(ResponseHead::TrailersOnly(trailers)) => (trailers, Body::empty()),
      Err(_) => {
        log::debug!("call ended without producing a response");
        (
          Status::new(Code::Internal, "call ended without a response").to_trailers(HeaderMap::new()),
          Body::empty(),
        )
      },
    };

    let mut response = Response::new(body);
    *response.headers_mut() = headers;
    with_grpc_content_type(response)
  }
}

//
// InboundSource
//

pub struct InboundSource {
  body: Body,
  decoder: Decoder,
  pending: VecDeque<Frame>,
}

impl InboundSource {
  // Receive the next request frame. None once the caller has half-closed.
  pub async fn recv(&mut self) -> Result<Option<Frame>> {
    loop {
      if let Some(frame) = self.pending.pop_front() {
        return Ok(Some(frame));
      }

      match self.body.frame().await {
        None => {
          if !self.decoder.is_idle() {
            return Err(Error::TruncatedFrame);
          }
          return Ok(None);
        },
        Some(Err(e)) => return Err(Error::BodyStream(e.into())),
        Some(Ok(frame)) => {
          // Request trailers carry nothing for gRPC and are dropped.
          if let Some(data) = frame.data_ref() {
            self.pending.extend(self.decoder.decode_data(data)?);
          }
        },
      }
    }
  }

  // (frames, bytes) read so far.
  #[must_use]
  pub const fn stats(&self) -> (u64, u64) {
    self.decoder.stats()
  }
}

//
// InboundSink
//

pub struct InboundSink {
  head_tx: Option<oneshot::Sender<ResponseHead>>,
  body_tx: BodySender,
  encoder: Encoder,
}

impl InboundSink {
  #[must_use]
  pub const fn headers_sent(&self) -> bool {
    self.head_tx.is_none()
  }

  // Send the response headers. Allowed once, and only before the first frame.
  pub fn send_headers(&mut self, headers: HeaderMap) -> Result<()> {
    let head_tx = self.head_tx.take().ok_or(Error::HeadersAlreadySent)?;
    head_tx
      .send(ResponseHead::Headers(headers))
      .map_err(|_| Error::Closed)
  }

  // Send one frame. If no headers have been sent yet, default headers go first.
  pub async fn send(&mut self, frame: Frame) -> Result<()> {
    if !self.headers_sent() {
      self.send_headers(HeaderMap::new())?;
    }
    self
      .body_tx
      .send(Ok(http_body::Frame::data(self.encoder.encode(&frame))))
      .await
      .map_err(|_| Error::Closed)
  }

  // End the response with a status and trailer metadata. Becomes a trailers-only response if
  // nothing has been sent yet.
  pub async fn finish(mut self, status: &Status, metadata: HeaderMap) -> Result<()> {
    let trailers = status.to_trailers(metadata);
    if let Some(head_tx) = self.head_tx.take() {
      return head_tx
        .send(ResponseHead::TrailersOnly(trailers))
        .map_err(|_| Error::Closed);
    }
    self
      .body_tx
      .send(Ok(http_body::Frame::trailers(trailers)))
      .await
      .map_err(|_| Error::Closed)
  }

  // Resolves once the caller can no longer receive the response, because the call was reset or
  // its connection went away.
  pub async fn closed(&self) {
    self.body_tx.closed().await;
  }
}
