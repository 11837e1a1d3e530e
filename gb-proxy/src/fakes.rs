// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

// In-memory call halves for exercising pumps and the call handler.

use crate::handler::{Downstream, Responder};
use crate::pump::{FrameSink, FrameSource};
use async_trait::async_trait;
use gb_grpc::{Error, Result, Status};
use gb_grpc_codec::Frame;
use gb_shutdown::Shutdown;
use http::HeaderMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Notify, mpsc};

pub fn frame(payload: &str) -> Frame {
  Frame::new(payload.to_string())
}

pub fn payload(frame: &Frame) -> String {
  String::from_utf8(frame.payload.to_vec()).unwrap()
}

pub fn header_map(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
  pairs
    .iter()
    .map(|(name, value)| {
      (
        http::HeaderName::from_static(name),
        http::HeaderValue::from_static(value),
      )
    })
    .collect()
}

//
// ScriptedSource
//

// Yields a fixed list of results. Once the list runs out it either ends cleanly or never returns.
// Each frame counts as its payload plus the 5 byte prefix.
#[derive(Default)]
pub struct ScriptedSource {
  items: VecDeque<Result<Option<Frame>>>,
  received_bytes: u64,
  hang: bool,
  headers: Option<HeaderMap>,
  trailers: HeaderMap,
}

impl ScriptedSource {
  pub fn frames(payloads: &[&str]) -> Self {
    Self {
      items: payloads.iter().map(|p| Ok(Some(frame(p)))).collect(),
      ..Default::default()
    }
  }

  pub fn then_fail(mut self, error: Error) -> Self {
    self.items.push_back(Err(error));
    self
  }

  pub fn then_hang(mut self) -> Self {
    self.hang = true;
    self
  }

  pub fn with_headers(mut self, headers: HeaderMap) -> Self {
    self.headers = Some(headers);
    self
  }

  pub fn with_trailers(mut self, trailers: HeaderMap) -> Self {
    self.trailers = trailers;
    self
  }
}

#[async_trait]
impl FrameSource for ScriptedSource {
  async fn recv(&mut self) -> Result<Option<Frame>> {
    if let Some(item) = self.items.pop_front() {
      if let Ok(Some(frame)) = &item {
        self.received_bytes += 5 + frame.payload.len() as u64;
      }
      return item;
    }
    if self.hang {
      std::future::pending::<()>().await;
    }
    Ok(None)
  }

  fn headers(&self) -> Option<HeaderMap> {
    self.headers.clone()
  }

  fn trailers(&self) -> HeaderMap {
    self.trailers.clone()
  }

  fn received_bytes(&self) -> u64 {
    self.received_bytes
  }
}

//
// RecordingSink
//

#[derive(Default)]
pub struct Recorded {
  pub headers: Vec<HeaderMap>,
  pub frames: Vec<String>,
  pub closes: usize,
  // Set when headers were sent after a frame.
  pub late_headers: bool,
  pub finished: Option<(Status, HeaderMap)>,
}

// Records everything sent through it. Can be told to refuse frames, and notified through `gone`
// to act like a caller that went away.
#[derive(Clone, Default)]
pub struct RecordingSink {
  pub recorded: Arc<Mutex<Recorded>>,
  pub refuse_frames: bool,
  pub gone: Arc<Notify>,
}

impl RecordingSink {
  pub fn refusing() -> Self {
    Self {
      refuse_frames: true,
      ..Default::default()
    }
  }

  pub fn frames(&self) -> Vec<String> {
    self.recorded.lock().frames.clone()
  }

  pub fn finished(&self) -> Option<(Status, HeaderMap)> {
    self.recorded.lock().finished.clone()
  }
}

#[async_trait]
impl FrameSink for RecordingSink {
  async fn send(&mut self, frame: Frame) -> Result<()> {
    if self.refuse_frames {
      return Err(Error::Closed);
    }
    self.recorded.lock().frames.push(payload(&frame));
    Ok(())
  }

  async fn send_headers(&mut self, headers: HeaderMap) -> Result<()> {
    let mut recorded = self.recorded.lock();
    recorded.late_headers |= !recorded.frames.is_empty();
    recorded.headers.push(headers);
    Ok(())
  }

  fn close_send(&mut self) {
    self.recorded.lock().closes += 1;
  }

  async fn closed(&mut self) {
    self.gone.notified().await;
  }
}

#[async_trait]
impl Responder for RecordingSink {
  async fn finish(self, status: &Status, trailers: HeaderMap) -> Result<()> {
    self.recorded.lock().finished = Some((status.clone(), trailers));
    Ok(())
  }
}

//
// EchoDownstream
//

#[derive(Default)]
pub struct DownstreamRecord {
  pub opened: Vec<(String, HeaderMap)>,
  pub closes: usize,
  // Whether the call's shutdown had fired when the response half was dropped.
  pub cancelled_on_drop: Option<bool>,
}

// A downstream that echoes request frames back. Once the request side closes it sends
// `after_close` and then ends with `end_status` (OK if unset).
#[derive(Default)]
pub struct EchoDownstream {
  pub record: Arc<Mutex<DownstreamRecord>>,
  pub headers: HeaderMap,
  pub trailers: HeaderMap,
  pub after_close: Vec<&'static str>,
  pub end_status: Option<Status>,
  // End the call after echoing this many frames, without waiting for the request side.
  pub finish_after: Option<usize>,
  // Never end the call once the request side closes.
  pub hang_after_close: bool,
  pub open_error: Option<Status>,
}

impl EchoDownstream {
  pub fn opened(&self) -> Vec<(String, HeaderMap)> {
    self.record.lock().opened.clone()
  }
}

#[async_trait]
impl Downstream for EchoDownstream {
  type Sink = EchoSink;
  type Source = EchoSource;

  async fn open(
    &self,
    method: &str,
    metadata: HeaderMap,
    shutdown: Shutdown,
  ) -> Result<(EchoSink, EchoSource)> {
    self
      .record
      .lock()
      .opened
      .push((method.to_string(), metadata));
    if let Some(status) = &self.open_error {
      return Err(Error::Grpc(status.clone()));
    }

    let (tx, rx) = mpsc::unbounded_channel();
    Ok((
      EchoSink {
        tx: Some(tx),
        record: self.record.clone(),
      },
      EchoSource {
        rx,
        echoed: 0,
        after_close: self.after_close.iter().map(|p| frame(p)).collect(),
        end_status: self.end_status.clone(),
        finish_after: self.finish_after,
        hang_after_close: self.hang_after_close,
        headers: self.headers.clone(),
        trailers: self.trailers.clone(),
        record: self.record.clone(),
        shutdown,
      },
    ))
  }
}

pub struct EchoSink {
  tx: Option<mpsc::UnboundedSender<Frame>>,
  record: Arc<Mutex<DownstreamRecord>>,
}

#[async_trait]
impl FrameSink for EchoSink {
  async fn send(&mut self, frame: Frame) -> Result<()> {
    let tx = self.tx.as_ref().ok_or(Error::Closed)?;
    tx.send(frame).map_err(|_| Error::Closed)
  }

  fn close_send(&mut self) {
    self.record.lock().closes += 1;
    self.tx = None;
  }
}

pub struct EchoSource {
  rx: mpsc::UnboundedReceiver<Frame>,
  echoed: usize,
  after_close: VecDeque<Frame>,
  end_status: Option<Status>,
  finish_after: Option<usize>,
  hang_after_close: bool,
  headers: HeaderMap,
  trailers: HeaderMap,
  record: Arc<Mutex<DownstreamRecord>>,
  shutdown: Shutdown,
}

impl EchoSource {
  fn end(&mut self) -> Result<Option<Frame>> {
    match self.end_status.take() {
      Some(status) => Err(Error::Grpc(status)),
      None => Ok(None),
    }
  }
}

#[async_trait]
impl FrameSource for EchoSource {
  async fn recv(&mut self) -> Result<Option<Frame>> {
    if self.finish_after == Some(self.echoed) {
      return self.end();
    }
    if let Some(frame) = self.rx.recv().await {
      self.echoed += 1;
      return Ok(Some(frame));
    }
    if let Some(frame) = self.after_close.pop_front() {
      return Ok(Some(frame));
    }
    if self.hang_after_close {
      std::future::pending::<()>().await;
    }
    self.end()
  }

  fn headers(&self) -> Option<HeaderMap> {
    Some(self.headers.clone())
  }

  fn trailers(&self) -> HeaderMap {
    self.trailers.clone()
  }
}

impl Drop for EchoSource {
  fn drop(&mut self) {
    self.record.lock().cancelled_on_drop = Some(self.shutdown.is_cancelled());
  }
}
