// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./admin_test.rs"]
mod admin_test;

use anyhow::Context;
use axum::Router;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use gb_grpc::axum_helper::serve_with_connect_info;
use gb_server_stats::stats::Collector;
use gb_shutdown::Shutdown;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

// /metrics in Prometheus text format, and /ready which turns 503 once the process starts
// shutting down.
pub fn router(collector: Collector, ready: Arc<AtomicBool>) -> Router {
  Router::new()
    .route("/metrics", get(move || metrics(collector.clone())))
    .route("/ready", get(move || readiness(ready.clone())))
}

async fn metrics(collector: Collector) -> impl IntoResponse {
  (
    [(CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
    collector.prometheus_output(),
  )
}

async fn readiness(ready: Arc<AtomicBool>) -> StatusCode {
  if ready.load(Ordering::Relaxed) {
    StatusCode::OK
  } else {
    StatusCode::SERVICE_UNAVAILABLE
  }
}

// Bind the admin listener and serve it on a new task until the shutdown fires.
pub async fn start(
  address: &str,
  collector: Collector,
  ready: Arc<AtomicBool>,
  mut shutdown: Shutdown,
) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
  let listener = TcpListener::bind(address)
    .await
    .with_context(|| format!("failed to listen on admin address {address}"))?;
  log::info!("admin server listening on {}", listener.local_addr()?);

  let scope = collector.scope("admin");
  let router = router(collector, ready);
  Ok(tokio::spawn(async move {
    serve_with_connect_info(
      router,
      listener,
      scope.counter("cx_total"),
      scope.gauge("cx_active"),
      async move { shutdown.cancelled().await },
    )
    .await
  }))
}
