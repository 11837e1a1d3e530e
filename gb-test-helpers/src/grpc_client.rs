// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::{BodySender, CONTENT_TYPE_GRPC};
use axum::body::Body;
use gb_grpc_codec::code::Code;
use gb_grpc_codec::{Decoder, Encoder, Frame};
use http::header::{CONTENT_TYPE, TE};
use http::{HeaderMap, HeaderValue, Method, Request, Response};
use http_body_util::{BodyExt, StreamBody};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::collections::VecDeque;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

type ResponseResult =
  Result<Response<hyper::body::Incoming>, hyper_util::client::legacy::Error>;

//
// TestResponse
//

// Everything a caller observed for one call.
#[derive(Debug, Default)]
pub struct TestResponse {
  pub headers: HeaderMap,
  pub frames: Vec<Frame>,
  // The final trailer block. For a trailers-only response this is the response head.
  pub trailers: HeaderMap,
  pub trailers_only: bool,
  pub code: Option<Code>,
  pub message: Option<String>,
}

impl TestResponse {
  #[must_use]
  pub fn payloads(&self) -> Vec<String> {
    self
      .frames
      .iter()
      .map(|frame| String::from_utf8_lossy(&frame.payload).to_string())
      .collect()
  }

  fn set_status(&mut self, trailers: HeaderMap) {
    self.code = trailers
      .get("grpc-status")
      .and_then(|value| value.to_str().ok())
      .map(Code::from_string);
    self.message = trailers
      .get("grpc-message")
      .and_then(|value| value.to_str().ok())
      .and_then(|value| urlencoding::decode(value).ok())
      .map(|value| value.into_owned());
    self.trailers = trailers;
  }
}

//
// TestClient
//

// A raw gRPC client over HTTP/2 without any schema. Frames are sent and received as opaque bytes.
pub struct TestClient {
  client: Client<HttpConnector, Body>,
}

impl Default for TestClient {
  fn default() -> Self {
    Self {
      client: Client::builder(TokioExecutor::new())
        .http2_only(true)
        .build(HttpConnector::new()),
    }
  }
}

impl TestClient {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  // Start a call. The request is driven on its own task so that frames can be sent before the
  // response head is awaited.
  #[must_use]
  pub fn start_call(&self, address: SocketAddr, method: &str, metadata: HeaderMap) -> TestCall {
    let (tx, rx): (BodySender, _) = mpsc::channel(16);
    let mut request = Request::new(Body::new(StreamBody::new(ReceiverStream::new(rx))));
    *request.method_mut() = Method::POST;
    *request.uri_mut() = format!("http://{address}{method}").parse().unwrap();
    *request.headers_mut() = metadata;
    request
      .headers_mut()
      .entry(CONTENT_TYPE)
      .or_insert(HeaderValue::from_static(CONTENT_TYPE_GRPC));
    request
      .headers_mut()
      .insert(TE, HeaderValue::from_static("trailers"));

    TestCall {
      tx: Some(tx),
      encoder: Encoder::default(),
      response: Some(tokio::spawn(self.client.request(request))),
      body: None,
      decoder: Decoder::default(),
      pending: VecDeque::new(),
      result: TestResponse::default(),
    }
  }

  // Send all frames, half-close and collect the response.
  pub async fn call(
    &self,
    address: SocketAddr,
    method: &str,
    metadata: HeaderMap,
    frames: Vec<Frame>,
  ) -> TestResponse {
    let mut call = self.start_call(address, method, metadata);
    for frame in frames {
      if !call.send(frame).await {
        break;
      }
    }
    call.close_send();
    call.finish().await
  }
}

//
// TestCall
//

pub struct TestCall {
  tx: Option<BodySender>,
  encoder: Encoder,
  response: Option<JoinHandle<ResponseResult>>,
  body: Option<hyper::body::Incoming>,
  decoder: Decoder,
  pending: VecDeque<Frame>,
  result: TestResponse,
}

impl TestCall {
  // Returns false if the server is no longer reading the request.
  pub async fn send(&mut self, frame: Frame) -> bool {
    let Some(tx) = &self.tx else {
      return false;
    };
    tx.send(Ok(http_body::Frame::data(self.encoder.encode(&frame))))
      .await
      .is_ok()
  }

  pub fn close_send(&mut self) {
    self.tx = None;
  }

  async fn await_head(&mut self) {
    let Some(response) = self.response.take() else {
      return;
    };
    match response.await.unwrap() {
      Ok(response) => {
        let (parts, body) = response.into_parts();
        if parts.headers.contains_key("grpc-status") {
          self.result.trailers_only = true;
          self.result.set_status(parts.headers);
        } else {
          self.result.headers = parts.headers;
          self.body = Some(body);
        }
      },
      Err(e) => {
        self.result.code = Some(Code::Unavailable);
        self.result.message = Some(e.to_string());
      },
    }
  }

  // Response headers. Waits for the response head.
  pub async fn headers(&mut self) -> HeaderMap {
    self.await_head().await;
    self.result.headers.clone()
  }

  // The next response frame, or None once the response is complete.
  pub async fn recv(&mut self) -> Option<Frame> {
    self.await_head().await;
    loop {
      if let Some(frame) = self.pending.pop_front() {
        return Some(frame);
      }
      let body = self.body.as_mut()?;
      match body.frame().await {
        Some(Ok(frame)) => {
          if let Some(data) = frame.data_ref() {
            self.pending.extend(self.decoder.decode_data(data).unwrap());
          } else if let Ok(trailers) = frame.into_trailers() {
            self.result.set_status(trailers);
            self.body = None;
          }
        },
        Some(Err(e)) => {
          self.result.message = Some(format!("body error: {e}"));
          self.body = None;
        },
        None => self.body = None,
      }
    }
  }

  // Collect any remaining frames and the final status.
  pub async fn finish(mut self) -> TestResponse {
    while let Some(frame) = self.recv().await {
      self.result.frames.push(frame);
    }
    self.result
  }
}
