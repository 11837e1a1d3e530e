// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./handler_test.rs"]
mod handler_test;

use crate::pump::{FrameSink, FrameSource, PumpCompletion, PumpOutcome, spawn_pump};
use crate::stats::ProxyStats;
use async_trait::async_trait;
use gb_grpc::client::{OutboundConnection, OutboundSink, OutboundSource};
use gb_grpc::inbound::InboundSink;
use gb_grpc::{Error, Result, Status};
use gb_grpc_codec::code::Code;
use gb_log::warn_every;
use gb_server_stats::stats::AutoGauge;
use gb_shutdown::{Shutdown, ShutdownTrigger};
use http::HeaderMap;
use time::ext::NumericalDuration;

//
// Downstream
//

// Where calls are forwarded to.
#[async_trait]
pub trait Downstream: Send + Sync + 'static {
  type Sink: FrameSink;
  type Source: FrameSource;

  async fn open(
    &self,
    method: &str,
    metadata: HeaderMap,
    shutdown: Shutdown,
  ) -> Result<(Self::Sink, Self::Source)>;
}

#[async_trait]
impl Downstream for OutboundConnection {
  type Sink = OutboundSink;
  type Source = OutboundSource;

  async fn open(
    &self,
    method: &str,
    metadata: HeaderMap,
    shutdown: Shutdown,
  ) -> Result<(OutboundSink, OutboundSource)> {
    Self::open(self, method, metadata, shutdown).await
  }
}

//
// Responder
//

// The caller facing sink, which also ends the call.
#[async_trait]
pub trait Responder: FrameSink + Sized {
  async fn finish(self, status: &Status, trailers: HeaderMap) -> Result<()>;
}

#[async_trait]
impl Responder for InboundSink {
  async fn finish(self, status: &Status, trailers: HeaderMap) -> Result<()> {
    Self::finish(self, status, trailers).await
  }
}

// How a call ended. The responder is gone only if a pump task died.
struct Conclusion<R> {
  status: Status,
  trailers: HeaderMap,
  responder: Option<R>,
}

impl<R> Conclusion<R> {
  fn new(status: Status, responder: Option<R>) -> Self {
    Self {
      status,
      trailers: HeaderMap::new(),
      responder,
    }
  }
}

// Proxy one call: open the same method downstream with a copy of the caller's metadata, pump
// frames both ways, and end the call with the downstream's status and trailers. Any work started
// for the call has stopped by the time this returns.
pub async fn handle_call<D: Downstream, S: FrameSource, R: Responder>(
  downstream: &D,
  method: Option<String>,
  metadata: HeaderMap,
  source: S,
  responder: R,
  stats: &ProxyStats,
) {
  stats.calls_total.inc();
  let _active = AutoGauge::new(stats.calls_active.clone());

  let trigger = ShutdownTrigger::default();
  let conclusion = proxy_call(
    downstream, method, metadata, source, responder, stats, &trigger,
  )
  .await;
  trigger.shutdown().await;

  if conclusion.status.code == Code::Ok {
    stats.call_success.inc();
  } else {
    stats.call_failure.inc();
  }
  let Some(responder) = conclusion.responder else {
    log::debug!("call ended without a responder: {}", conclusion.status);
    return;
  };
  if let Err(e) = responder
    .finish(&conclusion.status, conclusion.trailers)
    .await
  {
    log::debug!("failed to finish call: {e}");
  }
}

async fn proxy_call<D: Downstream, S: FrameSource, R: Responder>(
  downstream: &D,
  method: Option<String>,
  metadata: HeaderMap,
  source: S,
  responder: R,
  stats: &ProxyStats,
  trigger: &ShutdownTrigger,
) -> Conclusion<R> {
  let Some(method) = method else {
    return Conclusion::new(
      Status::new(
        Code::Internal,
        "method name could not be resolved from the request",
      ),
      Some(responder),
    );
  };
  log::trace!("proxying {method}");

  let (outbound_sink, outbound_source) = match downstream
    .open(&method, metadata, trigger.make_shutdown())
    .await
  {
    Ok(halves) => halves,
    Err(e) => {
      log::debug!("failed to open downstream call for {method}: {e}");
      return Conclusion::new(e.into_status(), Some(responder));
    },
  };

  let mut upstream = spawn_pump(
    source,
    outbound_sink,
    false,
    stats.upstream.clone(),
    trigger.make_shutdown(),
  );
  let mut downstream = spawn_pump(
    outbound_source,
    responder,
    true,
    stats.downstream.clone(),
    trigger.make_shutdown(),
  );

  let mut upstream_done = false;
  loop {
    tokio::select! {
      completion = &mut upstream, if !upstream_done => {
        upstream_done = true;
        let failure = match completion {
          // A closed downstream has already concluded the call. The response side reports how.
          Ok(PumpCompletion {
            mut destination,
            outcome: PumpOutcome::CleanEnd | PumpOutcome::Failure(Error::Closed),
            ..
          }) => {
            log::trace!("caller half-closed {method}");
            destination.close_send();
            continue;
          },
          Ok(PumpCompletion { outcome: PumpOutcome::Failure(e), .. }) => e.to_string(),
          Err(_) => "inbound pump ended unexpectedly".to_string(),
        };

        trigger.initiate();
        warn_every!(15.seconds(), "failed proxying inbound to downstream: {}", failure);
        let responder = downstream.await.ok().map(|completion| completion.destination);
        return Conclusion::new(
          Status::new(
            Code::Internal,
            format!("failed proxying inbound to downstream: {failure}"),
          ),
          responder,
        );
      },
      completion = &mut downstream => {
        // Stop the inbound side too, and wait for it so nothing outlives the call.
        trigger.initiate();
        if !upstream_done {
          let _ignored = (&mut upstream).await;
        }

        let Ok(PumpCompletion { source, destination, outcome }) = completion else {
          return Conclusion::new(
            Status::new(Code::Internal, "downstream pump ended unexpectedly"),
            None,
          );
        };
        let status = match outcome {
          PumpOutcome::CleanEnd => Status::ok(),
          PumpOutcome::Failure(e) => {
            if let Some(message) = e.warn_every_message() {
              warn_every!(15.seconds(), "failed proxying downstream to caller: {}", message);
            }
            e.into_status()
          },
        };
        return Conclusion {
          status,
          trailers: source.trailers(),
          responder: Some(destination),
        };
      },
    }
  }
}
