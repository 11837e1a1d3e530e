// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use axum::Router;
use futures::future::FutureExt;
use gb_server_stats::stats::AutoGauge;
use gb_shutdown::ShutdownTrigger;
use http::Request;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use prometheus::{IntCounter, IntGauge};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower::util::ServiceExt;
use unwrap_infallible::UnwrapInfallible;

// Accept loop for a router. Connections are counted, and once `shutdown` resolves the listener is
// closed and every open connection is drained with a graceful HTTP/2 shutdown: in flight calls are
// allowed to finish, new streams are refused. Returns once every connection has closed, or with
// an error if accepting fails.
pub async fn serve_with_connect_info(
  router: Router,
  listener: TcpListener,
  cx_total: IntCounter,
  cx_active: IntGauge,
  shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
  let mut make_service = router.into_make_service_with_connect_info::<SocketAddr>();
  tokio::pin!(shutdown);

  let cx_shutdown_trigger = ShutdownTrigger::default();

  let result = loop {
    let (socket, remote_addr) = tokio::select! {
      result = listener.accept() => match result {
        Ok(accepted) => accepted,
        Err(e) => {
          log::warn!("listener accept failure, shutting down: {e}");
          break Err(e.into());
        },
      },
      () = &mut shutdown => break Ok(()),
    };
    log::trace!("accepted connection from {remote_addr}");

    // IntoMakeServiceWithConnectInfo is always ready.
    let tower_service = tower::Service::call(&mut make_service, remote_addr)
      .await
      .unwrap_infallible();

    let mut cx_shutdown = cx_shutdown_trigger.make_shutdown();
    cx_total.inc();
    let cx_active = AutoGauge::new(cx_active.clone());

    tokio::spawn(async move {
      let socket = TokioIo::new(socket);
      let hyper_service = hyper::service::service_fn(move |request: Request<Incoming>| {
        tower_service.clone().oneshot(request)
      });

      let builder = Builder::new(TokioExecutor::new());
      let cx = builder.serve_connection(socket, hyper_service);
      tokio::pin!(cx);
      let start_shutdown = cx_shutdown.cancelled().fuse();
      tokio::pin!(start_shutdown);

      loop {
        tokio::select! {
          result = &mut cx => {
            if let Err(e) = result {
              log::debug!("connection serve failure from {remote_addr}: {e}");
            }
            break;
          },
          () = &mut start_shutdown => {
            log::debug!("draining connection from {remote_addr}");
            cx.as_mut().graceful_shutdown();
          }
        }
      }

      drop(cx_active);
    });
  };

  drop(listener);
  cx_shutdown_trigger.shutdown().await;

  result
}
