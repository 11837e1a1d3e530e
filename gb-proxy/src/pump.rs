// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./pump_test.rs"]
mod pump_test;

use crate::stats::DirectionStats;
use async_trait::async_trait;
use gb_grpc::client::{OutboundSink, OutboundSource};
use gb_grpc::inbound::{InboundSink, InboundSource};
use gb_grpc::{Error, Result};
use gb_grpc_codec::Frame;
use gb_shutdown::Shutdown;
use http::HeaderMap;
use tokio::sync::oneshot;

//
// FrameSource
//

// The receiving half of a call.
#[async_trait]
pub trait FrameSource: Send + 'static {
  // The next frame, or None at a clean end of stream.
  async fn recv(&mut self) -> Result<Option<Frame>>;

  // Header metadata to forward ahead of the first frame.
  fn headers(&self) -> Option<HeaderMap> {
    None
  }

  // Trailer metadata, once the stream has ended.
  fn trailers(&self) -> HeaderMap {
    HeaderMap::new()
  }

  // Wire bytes received so far.
  fn received_bytes(&self) -> u64 {
    0
  }
}

//
// FrameSink
//

// The sending half of a call.
#[async_trait]
pub trait FrameSink: Send + 'static {
  async fn send(&mut self, frame: Frame) -> Result<()>;

  async fn send_headers(&mut self, _headers: HeaderMap) -> Result<()> {
    Ok(())
  }

  // Signal that no more frames follow.
  fn close_send(&mut self) {}

  // Resolves once the other end has gone away and nothing sent can be delivered anymore.
  async fn closed(&mut self) {
    std::future::pending::<()>().await;
  }
}

#[async_trait]
impl FrameSource for InboundSource {
  async fn recv(&mut self) -> Result<Option<Frame>> {
    Self::recv(self).await
  }

  fn received_bytes(&self) -> u64 {
    self.stats().1
  }
}

#[async_trait]
impl FrameSink for InboundSink {
  async fn send(&mut self, frame: Frame) -> Result<()> {
    Self::send(self, frame).await
  }

  async fn send_headers(&mut self, headers: HeaderMap) -> Result<()> {
    Self::send_headers(self, headers)
  }

  async fn closed(&mut self) {
    Self::closed(self).await;
  }
}

#[async_trait]
impl FrameSource for OutboundSource {
  async fn recv(&mut self) -> Result<Option<Frame>> {
    Self::recv(self).await
  }

  fn headers(&self) -> Option<HeaderMap> {
    Self::headers(self).cloned()
  }

  fn trailers(&self) -> HeaderMap {
    Self::trailers(self).clone()
  }

  fn received_bytes(&self) -> u64 {
    self.stats().1
  }
}

#[async_trait]
impl FrameSink for OutboundSink {
  async fn send(&mut self, frame: Frame) -> Result<()> {
    Self::send(self, frame).await
  }

  fn close_send(&mut self) {
    Self::close_send(self);
  }
}

//
// PumpOutcome
//

#[derive(Debug)]
pub enum PumpOutcome {
  CleanEnd,
  Failure(Error),
}

// What a finished pump hands back: both halves, so the caller can close or finish them, and how
// the pump ended.
pub struct PumpCompletion<S, D> {
  pub source: S,
  pub destination: D,
  pub outcome: PumpOutcome,
}

// Run a pump on its own task. The completion is delivered exactly once through the returned
// receiver.
pub fn spawn_pump<S: FrameSource, D: FrameSink>(
  source: S,
  destination: D,
  flush_headers: bool,
  stats: DirectionStats,
  shutdown: Shutdown,
) -> oneshot::Receiver<PumpCompletion<S, D>> {
  let (completion_tx, completion_rx) = oneshot::channel();
  tokio::spawn(async move {
    let completion = pump(source, destination, flush_headers, &stats, shutdown).await;
    let _ignored = completion_tx.send(completion);
  });
  completion_rx
}

// Move frames from source to destination until the source ends, either side fails, the
// destination goes away, or the shutdown fires. With `flush_headers` the source's header metadata is sent to the destination
// right before the first frame.
pub async fn pump<S: FrameSource, D: FrameSink>(
  mut source: S,
  mut destination: D,
  flush_headers: bool,
  stats: &DirectionStats,
  mut shutdown: Shutdown,
) -> PumpCompletion<S, D> {
  let outcome = pump_frames(
    &mut source,
    &mut destination,
    flush_headers,
    stats,
    &mut shutdown,
  )
  .await;
  PumpCompletion {
    source,
    destination,
    outcome,
  }
}

async fn pump_frames<S: FrameSource, D: FrameSink>(
  source: &mut S,
  destination: &mut D,
  flush_headers: bool,
  stats: &DirectionStats,
  shutdown: &mut Shutdown,
) -> PumpOutcome {
  let mut first_frame = true;
  let mut counted_bytes = source.received_bytes();
  loop {
    let received = tokio::select! {
      received = source.recv() => received,
      () = destination.closed() => return PumpOutcome::Failure(Error::Cancelled),
      () = shutdown.cancelled() => return PumpOutcome::Failure(Error::Cancelled),
    };
    let frame = match received {
      Ok(Some(frame)) => frame,
      Ok(None) => return PumpOutcome::CleanEnd,
      Err(e) => return PumpOutcome::Failure(e),
    };

    if first_frame && flush_headers {
      let headers = source.headers().unwrap_or_default();
      if let Err(e) = destination.send_headers(headers).await {
        return PumpOutcome::Failure(e);
      }
    }
    first_frame = false;

    let sent = tokio::select! {
      sent = destination.send(frame) => sent,
      () = shutdown.cancelled() => Err(Error::Cancelled),
    };
    if let Err(e) = sent {
      return PumpOutcome::Failure(e);
    }
    stats.frames.inc();
    let received_bytes = source.received_bytes();
    stats.bytes.inc_by(received_bytes.saturating_sub(counted_bytes));
    counted_bytes = received_bytes;
  }
}
