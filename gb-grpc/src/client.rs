// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::balancer::RoundRobin;
use crate::error::{Error, Result};
use crate::metadata::{response_metadata, trailer_metadata};
use crate::resolver::{DnsResolver, Resolver};
use crate::retry::{MAX_REPLAY_BUFFER_BYTES, RetryPolicy};
use crate::status::Status;
use crate::target::Target;
use crate::{BodySender, CONTENT_TYPE_GRPC, TRANSFER_ENCODING, TRANSFER_ENCODING_TRAILERS};
use axum::body::Body;
use backoff::backoff::Backoff;
use bytes::Bytes;
use gb_grpc_codec::code::Code;
use gb_grpc_codec::{DEFAULT_MAX_FRAME_SIZE, Decoder, Encoder, Frame};
use gb_shutdown::{Shutdown, ShutdownTrigger};
use http::header::CONTENT_TYPE;
use http::uri::{PathAndQuery, Scheme};
use http::{HeaderMap, HeaderValue, Method, Request, Response, Uri};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::{Client, ResponseFuture};
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use time::Duration;
use time::ext::NumericalDuration;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;

//
// OutboundConfig
//

#[derive(Clone, Debug)]
pub struct OutboundConfig {
  pub resolver_refresh_interval: Duration,
  pub retry_policy: RetryPolicy,
  pub max_receive_frame_size: usize,
}

impl Default for OutboundConfig {
  fn default() -> Self {
    Self {
      resolver_refresh_interval: 30.seconds(),
      retry_policy: RetryPolicy::default(),
      max_receive_frame_size: DEFAULT_MAX_FRAME_SIZE,
    }
  }
}

struct Shared {
  name: String,
  client: Client<HttpConnector, Body>,
  balancer: Arc<RoundRobin>,
  config: OutboundConfig,
}

//
// OutboundConnection
//

// A long lived, shared HTTP/2 client for one downstream target. Calls are spread round robin over
// the resolved endpoints, with one pooled connection per endpoint. Dropping the connection stops
// background resolution.
pub struct OutboundConnection {
  shared: Arc<Shared>,
  _resolver_shutdown: ShutdownTrigger,
}

impl OutboundConnection {
  // Create a connection for a target string. This does no I/O: resolution happens when the first
  // call is made, and connections are established per endpoint on first use.
  pub fn new(target: &str, config: OutboundConfig) -> anyhow::Result<Self> {
    let target: Target = target.parse()?;
    Ok(Self::new_with_resolver(
      &target.to_string(),
      Arc::new(DnsResolver::new(&target)),
      config,
    ))
  }

  // Must be called from within a tokio runtime.
  #[must_use]
  pub fn new_with_resolver(
    name: &str,
    resolver: Arc<dyn Resolver>,
    config: OutboundConfig,
  ) -> Self {
    let mut connector = HttpConnector::new();
    connector.set_nodelay(true);
    let client = Client::builder(TokioExecutor::new())
      .http2_only(true)
      .build(connector);

    let balancer = RoundRobin::new(name, resolver);
    let resolver_shutdown = ShutdownTrigger::default();
    tokio::spawn(balancer.clone().refresh_loop(
      config.resolver_refresh_interval,
      resolver_shutdown.make_shutdown(),
    ));

    Self {
      shared: Arc::new(Shared {
        name: name.to_string(),
        client,
        balancer,
        config,
      }),
      _resolver_shutdown: resolver_shutdown,
    }
  }

  #[must_use]
  pub fn name(&self) -> &str {
    &self.shared.name
  }

  // Open a bi-directional call for a method path (/package.Service/Method). The metadata is sent
  // as the request headers of every attempt. The first attempt starts immediately; the source has
  // to be polled for the call to make progress. Once the shutdown fires every pending operation on
  // the returned halves fails with Cancelled.
  pub async fn open(
    &self,
    method: &str,
    metadata: HeaderMap,
    shutdown: Shutdown,
  ) -> Result<(OutboundSink, OutboundSource)> {
    let path: PathAndQuery = method
      .parse()
      .map_err(|_| Status::new(Code::Internal, format!("invalid method path: {method}")))?;

    let state = Arc::new(Mutex::new(CallState::default()));
    let (generation_tx, generation_rx) = watch::channel(0);
    let mut source = OutboundSource {
      shared: self.shared.clone(),
      state: state.clone(),
      generation_tx,
      path,
      metadata,
      attempts: 0,
      backoff: self.shared.config.retry_policy.backoff(),
      phase: Phase::Done,
      decoder: Decoder::new(self.shared.config.max_receive_frame_size),
      pending: VecDeque::new(),
      headers: None,
      trailers: HeaderMap::new(),
      shutdown: shutdown.clone(),
    };
    source.phase = source.start_attempt().await;

    Ok((
      OutboundSink {
        state,
        generation_rx,
        encoder: Encoder::default(),
        shutdown,
      },
      source,
    ))
  }
}

//
// CallState
//

// Request side state of a call, shared between the sink (which writes frames) and the source
// (which runs attempts).
#[derive(Default)]
struct CallState {
  // Request body of the current attempt. None between attempts and once the send side is closed.
  tx: Option<BodySender>,
  // Encoded request frames to replay into a new attempt. Emptied on commit.
  replay: Vec<Bytes>,
  replay_bytes: usize,
  committed: bool,
  send_closed: bool,
  // The call has concluded (successfully or not). No new attempts will start.
  finished: bool,
}

impl CallState {
  fn commit(&mut self) {
    self.committed = true;
    self.replay = Vec::new();
    self.replay_bytes = 0;
  }
}

//
// OutboundSink
//

pub struct OutboundSink {
  state: Arc<Mutex<CallState>>,
  // Bumped by the source whenever the attempt changes or the call finishes.
  generation_rx: watch::Receiver<u64>,
  encoder: Encoder,
  shutdown: Shutdown,
}

impl OutboundSink {
  // Send one frame. Fails with Closed once the downstream is no longer accepting request frames,
  // which happens when the call has concluded.
  pub async fn send(&mut self, frame: Frame) -> Result<()> {
    let bytes = self.encoder.encode(&frame);
    loop {
      let current = {
        let mut state = self.state.lock();
        if state.finished || state.send_closed {
          return Err(Error::Closed);
        }
        // Anything after this point is a new change to wait for.
        self.generation_rx.borrow_and_update();
        state.tx.clone().map(|tx| {
          let replayable = !state.committed;
          if replayable {
            state.replay_bytes += bytes.len();
            if state.replay_bytes > MAX_REPLAY_BUFFER_BYTES {
              log::debug!("replay buffer full, committing call");
              state.commit();
              return (tx, false);
            }
            state.replay.push(bytes.clone());
          }
          (tx, replayable)
        })
      };

      let Some((tx, replayable)) = current else {
        // Between attempts. Wait for the next one (or for the call to end).
        tokio::select! {
          changed = self.generation_rx.changed() => {
            if changed.is_err() {
              return Err(Error::Closed);
            }
          },
          () = self.shutdown.cancelled() => return Err(Error::Cancelled),
        }
        continue;
      };

      // A frame that is in the replay buffer has been delivered as far as the caller is concerned:
      // if this attempt fails or is replaced the next attempt replays it.
      return tokio::select! {
        result = tx.send(Ok(http_body::Frame::data(bytes.clone()))) => {
          if result.is_ok() || replayable { Ok(()) } else { Err(Error::Closed) }
        },
        _ = self.generation_rx.changed() => {
          if replayable { Ok(()) } else { Err(Error::Closed) }
        },
        () = self.shutdown.cancelled() => Err(Error::Cancelled),
      };
    }
  }

  // Half-close the call. Later attempts replay the close along with the buffered frames.
  // Idempotent.
  pub fn close_send(&mut self) {
    let mut state = self.state.lock();
    if !state.send_closed {
      log::trace!("closing downstream send side");
      state.send_closed = true;
      state.tx = None;
    }
  }
}

//
// OutboundSource
//

enum Phase {
  // Waiting for the response head of the current attempt.
  Pending(ResponseFuture),
  // The current attempt failed before committing. Trailer metadata is kept in case the failure is
  // final.
  Failed(Status, HeaderMap),
  Streaming(Incoming),
  Done,
}

pub struct OutboundSource {
  shared: Arc<Shared>,
  state: Arc<Mutex<CallState>>,
  generation_tx: watch::Sender<u64>,
  path: PathAndQuery,
  metadata: HeaderMap,
  attempts: u32,
  backoff: backoff::ExponentialBackoff,
  phase: Phase,
  decoder: Decoder,
  pending: VecDeque<Frame>,
  headers: Option<HeaderMap>,
  trailers: HeaderMap,
  shutdown: Shutdown,
}

impl OutboundSource {
  fn bump_generation(&self) {
    self.generation_tx.send_modify(|generation| *generation += 1);
  }

  fn build_request(
    &self,
    endpoint: SocketAddr,
    rx: mpsc::Receiver<BodyItem>,
  ) -> Result<Request<Body>> {
    let uri = Uri::builder()
      .scheme(Scheme::HTTP)
      .authority(endpoint.to_string())
      .path_and_query(self.path.clone())
      .build()
      .map_err(|e| Status::new(Code::Internal, format!("invalid downstream uri: {e}")))?;

    let mut request = Request::new(Body::new(StreamBody::new(ReceiverStream::new(rx))));
    *request.method_mut() = Method::POST;
    *request.uri_mut() = uri;
    *request.headers_mut() = self.metadata.clone();
    request
      .headers_mut()
      .entry(CONTENT_TYPE)
      .or_insert(HeaderValue::from_static(CONTENT_TYPE_GRPC));
    request.headers_mut().insert(
      TRANSFER_ENCODING,
      HeaderValue::from_static(TRANSFER_ENCODING_TRAILERS),
    );
    Ok(request)
  }

  // Start the next attempt: pick an endpoint, replay what has been sent so far and issue the
  // request.
  async fn start_attempt(&mut self) -> Phase {
    self.attempts += 1;
    let Some(endpoint) = self.shared.balancer.pick().await else {
      return Phase::Failed(
        Status::new(
          Code::Unavailable,
          format!("no endpoints resolved for {}", self.shared.name),
        ),
        HeaderMap::new(),
      );
    };
    log::trace!(
      "starting attempt {} of {} against {endpoint}",
      self.attempts,
      self.path
    );

    let rx = {
      let mut state = self.state.lock();
      let (tx, rx) = mpsc::channel(state.replay.len() + 1);
      for bytes in &state.replay {
        // Capacity covers the whole replay buffer.
        let _ignored = tx.try_send(Ok(http_body::Frame::data(bytes.clone())));
      }
      if !state.send_closed {
        state.tx = Some(tx);
      }
      self.bump_generation();
      rx
    };

    match self.build_request(endpoint, rx) {
      Ok(request) => Phase::Pending(self.shared.client.request(request)),
      Err(e) => Phase::Failed(e.into_status(), HeaderMap::new()),
    }
  }

  // Record the final outcome of the call. The sink gets Closed from here on.
  fn finish(&mut self, status: &Status, trailers: HeaderMap) {
    log::trace!(
      "call {} finished after {} attempts: {status}",
      self.path,
      self.attempts
    );
    self.trailers = trailers;
    {
      let mut state = self.state.lock();
      state.finished = true;
      state.tx = None;
    }
    self.bump_generation();
  }

  // Conclude the call with a local (non downstream) failure.
  fn fail(&mut self, error: Error) -> Error {
    self.finish(
      &Status::new(Code::Internal, error.to_string()),
      HeaderMap::new(),
    );
    error
  }

  fn on_response(
    &mut self,
    response: std::result::Result<Response<Incoming>, hyper_util::client::legacy::Error>,
  ) -> Phase {
    let response = match response {
      Ok(response) => response,
      Err(e) => {
        log::debug!("downstream attempt for {} failed: {e}", self.path);
        return Phase::Failed(
          Status::new(Code::Unavailable, format!("downstream connection error: {e}")),
          HeaderMap::new(),
        );
      },
    };

    // Trailers-only response.
    if let Some(status) = Status::from_trailers(response.headers()) {
      let trailers = trailer_metadata(response.headers());
      if status.code == Code::Ok {
        self.finish(&status, trailers);
        return Phase::Done;
      }
      return Phase::Failed(status, trailers);
    }

    if !response.status().is_success() {
      return Phase::Failed(Status::from_http(response.status()), HeaderMap::new());
    }

    // Response headers commit the call to this attempt.
    self.state.lock().commit();
    self.headers = Some(response_metadata(response.headers()));
    Phase::Streaming(response.into_body())
  }

  // Retry a failed attempt if the policy allows, otherwise conclude the call with the failure.
  async fn retry_or_fail(&mut self, status: Status, trailers: HeaderMap) -> Result<Phase> {
    let policy = &self.shared.config.retry_policy;
    let retry = policy.is_retryable(status.code)
      && self.attempts < policy.max_attempts
      && !self.state.lock().committed;
    if !retry {
      self.finish(&status, trailers);
      return Err(Error::Grpc(status));
    }

    // The failed attempt's request body goes away. The sink waits for the next attempt.
    self.state.lock().tx = None;
    let delay = self
      .backoff
      .next_backoff()
      .unwrap_or_else(|| policy.max_backoff.unsigned_abs());
    log::debug!(
      "retrying {} after {delay:?} (attempt {}): {status}",
      self.path,
      self.attempts
    );
    tokio::select! {
      () = tokio::time::sleep(delay) => {},
      () = self.shutdown.cancelled() => return Err(Error::Cancelled),
    }
    Ok(self.start_attempt().await)
  }

  // Receive the next response frame. None means the downstream finished with OK. A downstream
  // failure status is returned as Error::Grpc; in both cases the trailer metadata is available
  // from trailers() afterwards.
  pub async fn recv(&mut self) -> Result<Option<Frame>> {
    loop {
      if let Some(frame) = self.pending.pop_front() {
        return Ok(Some(frame));
      }

      // Any early return leaves the source done.
      match std::mem::replace(&mut self.phase, Phase::Done) {
        Phase::Pending(response) => {
          let response = tokio::select! {
            response = response => response,
            () = self.shutdown.cancelled() => return Err(Error::Cancelled),
          };
          self.phase = self.on_response(response);
        },
        Phase::Failed(status, trailers) => {
          self.phase = self.retry_or_fail(status, trailers).await?;
        },
        Phase::Streaming(mut body) => {
          let frame = tokio::select! {
            frame = body.frame() => frame,
            () = self.shutdown.cancelled() => return Err(Error::Cancelled),
          };
          match frame {
            None => {
              let status = Status::new(
                Code::Internal,
                "downstream ended the stream without trailers",
              );
              self.finish(&status, HeaderMap::new());
              return Err(Error::Grpc(status));
            },
            Some(Err(e)) => return Err(self.fail(Error::BodyStream(e.into()))),
            Some(Ok(frame)) => match frame.into_data() {
              Ok(data) => match self.decoder.decode_data(&data) {
                Ok(frames) => {
                  self.pending.extend(frames);
                  self.phase = Phase::Streaming(body);
                },
                Err(e) => return Err(self.fail(e.into())),
              },
              Err(frame) => {
                let Ok(trailers) = frame.into_trailers() else {
                  self.phase = Phase::Streaming(body);
                  continue;
                };
                if !self.decoder.is_idle() {
                  return Err(self.fail(Error::TruncatedFrame));
                }
                let status = Status::from_trailers(&trailers).unwrap_or_else(|| {
                  Status::new(Code::Internal, "downstream trailers are missing grpc-status")
                });
                self.finish(&status, trailer_metadata(&trailers));
                if status.code != Code::Ok {
                  return Err(Error::Grpc(status));
                }
              },
            },
          }
        },
        Phase::Done => return Ok(None),
      }
    }
  }

  // Response header metadata. Available once the call has committed, which is always the case
  // after the first frame has been received.
  #[must_use]
  pub const fn headers(&self) -> Option<&HeaderMap> {
    self.headers.as_ref()
  }

  // Trailer metadata. Empty until the call has concluded.
  #[must_use]
  pub const fn trailers(&self) -> &HeaderMap {
    &self.trailers
  }

  #[must_use]
  pub const fn attempts(&self) -> u32 {
    self.attempts
  }

  // (frames, bytes) read so far.
  #[must_use]
  pub const fn stats(&self) -> (u64, u64) {
    self.decoder.stats()
  }
}

type BodyItem = std::result::Result<http_body::Frame<Bytes>, axum::BoxError>;
