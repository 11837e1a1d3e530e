// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
mod fakes;
#[cfg(test)]
#[path = "./proxy_test.rs"]
mod proxy_test;

pub mod handler;
pub mod pump;
pub mod stats;

use axum::Router;
use axum::extract::Request;
use axum::response::Response;
use gb_grpc::axum_helper::serve_with_connect_info;
use gb_grpc::client::{OutboundConfig, OutboundConnection};
use gb_grpc::inbound::InboundCall;
use gb_grpc::resolver::Resolver;
use gb_grpc::retry::RetryPolicy;
use gb_grpc_codec::DEFAULT_MAX_FRAME_SIZE;
use gb_server_stats::stats::Scope;
use gb_shutdown::{Shutdown, ShutdownTrigger};
use handler::handle_call;
use parking_lot::Mutex;
use stats::ProxyStats;
use std::net::SocketAddr;
use std::sync::Arc;
use time::Duration;
use time::ext::NumericalDuration;
use tokio::net::TcpListener;

//
// ProxyConfig
//

#[derive(Clone, Debug)]
pub struct ProxyConfig {
  // Address to listen on, e.g. 0.0.0.0:8080.
  pub listen_address: String,
  // Where calls are forwarded, see gb_grpc::target::Target for the accepted forms.
  pub target: String,
  pub resolver_refresh_interval: Duration,
  pub retry_policy: RetryPolicy,
  pub max_receive_frame_size: usize,
}

impl ProxyConfig {
  #[must_use]
  pub fn new(listen_address: impl Into<String>, target: impl Into<String>) -> Self {
    Self {
      listen_address: listen_address.into(),
      target: target.into(),
      resolver_refresh_interval: 30.seconds(),
      retry_policy: RetryPolicy::default(),
      max_receive_frame_size: DEFAULT_MAX_FRAME_SIZE,
    }
  }

  fn outbound_config(&self) -> OutboundConfig {
    OutboundConfig {
      resolver_refresh_interval: self.resolver_refresh_interval,
      retry_policy: self.retry_policy.clone(),
      max_receive_frame_size: self.max_receive_frame_size,
    }
  }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProxyState {
  Created,
  Serving,
  Stopping,
  Stopped,
}

struct Shared {
  connection: OutboundConnection,
  stats: ProxyStats,
  max_receive_frame_size: usize,
}

//
// Proxy
//

// Accepts gRPC calls for any method on one listener and forwards them to one target.
pub struct Proxy {
  shared: Arc<Shared>,
  listener: Mutex<Option<TcpListener>>,
  local_address: SocketAddr,
  state: Mutex<ProxyState>,
  stop_trigger: ShutdownTrigger,
}

impl Proxy {
  // Bind the listener and set up the outbound connection. Nothing is dialed until the first call.
  pub async fn new(config: ProxyConfig, scope: &Scope) -> anyhow::Result<Self> {
    let connection = OutboundConnection::new(&config.target, config.outbound_config())?;
    Self::with_connection(config, connection, scope).await
  }

  // Like new, but endpoints come from the given resolver instead of the target's address.
  pub async fn new_with_resolver(
    config: ProxyConfig,
    resolver: Arc<dyn Resolver>,
    scope: &Scope,
  ) -> anyhow::Result<Self> {
    let connection =
      OutboundConnection::new_with_resolver(&config.target, resolver, config.outbound_config());
    Self::with_connection(config, connection, scope).await
  }

  async fn with_connection(
    config: ProxyConfig,
    connection: OutboundConnection,
    scope: &Scope,
  ) -> anyhow::Result<Self> {
    let listener = TcpListener::bind(&config.listen_address)
      .await
      .map_err(|e| anyhow::anyhow!("failed to listen on {}: {e}", config.listen_address))?;
    let local_address = listener.local_addr()?;
    log::info!(
      "proxy listening on {local_address}, forwarding to {}",
      connection.name()
    );

    Ok(Self {
      shared: Arc::new(Shared {
        connection,
        stats: ProxyStats::new(scope, &config.listen_address),
        max_receive_frame_size: config.max_receive_frame_size,
      }),
      listener: Mutex::new(Some(listener)),
      local_address,
      state: Mutex::new(ProxyState::Created),
      stop_trigger: ShutdownTrigger::default(),
    })
  }

  #[must_use]
  pub const fn local_address(&self) -> SocketAddr {
    self.local_address
  }

  #[must_use]
  pub fn state(&self) -> ProxyState {
    *self.state.lock()
  }

  // Accept and proxy calls until stopped. Returns Ok once a stop has drained every in flight call,
  // or an error if the listener fails. A proxy can only be served once.
  pub async fn serve(&self) -> anyhow::Result<()> {
    let Some(listener) = self.listener.lock().take() else {
      anyhow::bail!("proxy on {} has already been served", self.local_address);
    };
    {
      let mut state = self.state.lock();
      if *state == ProxyState::Created {
        *state = ProxyState::Serving;
      }
    }

    // Held by every call handler, so that serving only ends once the last one has.
    let calls = ShutdownTrigger::default();
    let shared = self.shared.clone();
    let in_flight = calls.make_shutdown();
    let router = Router::new().fallback(move |request: Request| {
      proxy_request(shared.clone(), in_flight.clone(), request)
    });
    let mut shutdown = self.stop_trigger.make_shutdown();
    let result = serve_with_connect_info(
      router,
      listener,
      self.shared.stats.cx_total.clone(),
      self.shared.stats.cx_active.clone(),
      async move { shutdown.cancelled().await },
    )
    .await;
    calls.shutdown().await;

    *self.state.lock() = ProxyState::Stopped;
    match &result {
      Ok(()) => log::info!("proxy on {} stopped", self.local_address),
      Err(e) => log::error!("proxy on {} failed: {e}", self.local_address),
    }
    result
  }

  // Stop accepting calls. In flight calls are allowed to finish; serve returns once they have.
  // Does not wait.
  pub fn stop(&self) {
    {
      let mut state = self.state.lock();
      if matches!(*state, ProxyState::Created | ProxyState::Serving) {
        *state = ProxyState::Stopping;
      }
    }
    self.stop_trigger.initiate();
  }
}

async fn proxy_request(shared: Arc<Shared>, in_flight: Shutdown, request: Request) -> Response {
  let (call, pending) = InboundCall::new(request, shared.max_receive_frame_size);
  tokio::spawn(async move {
    let _in_flight = in_flight;
    let (method, metadata, source, sink) = call.into_parts();
    handle_call(
      &shared.connection,
      method,
      metadata,
      source,
      sink,
      &shared.stats,
    )
    .await;
  });
  pending.into_response().await
}
