// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::fakes::header_map;
use gb_grpc::resolver::StaticResolver;
use gb_grpc_codec::Frame;
use gb_grpc_codec::code::Code;
use gb_server_stats::test_util::Helper;
use gb_test_helpers::grpc_backend::{
  BackendOptions,
  HOLD_OPEN_HEADER,
  MESSAGE_HEADER,
  NAME_HEADER,
  NAME_TRAILER,
  STATUS_HEADER,
  TRAILERS_ONLY_HEADER,
  TestBackend,
};
use gb_test_helpers::grpc_client::{TestClient, TestResponse};
use http::HeaderMap;
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use tokio::task::JoinHandle;

#[ctor::ctor]
fn test_global_init() {
  gb_test_helpers::test_global_init();
}

const LISTENER: &str = "127.0.0.1:0";

fn fast_config() -> ProxyConfig {
  let mut config = ProxyConfig::new(LISTENER, "test-backends");
  config.retry_policy.initial_backoff = 1.milliseconds();
  config.retry_policy.max_backoff = 5.milliseconds();
  config
}

struct Setup {
  helper: Helper,
  proxy: Arc<Proxy>,
  serve: Option<JoinHandle<anyhow::Result<()>>>,
  client: TestClient,
}

impl Setup {
  async fn new(endpoints: Vec<SocketAddr>) -> Self {
    let helper = Helper::new();
    let proxy = Arc::new(
      Proxy::new_with_resolver(
        fast_config(),
        Arc::new(StaticResolver::new(endpoints)),
        &helper.collector().scope(""),
      )
      .await
      .unwrap(),
    );
    assert_eq!(proxy.state(), ProxyState::Created);

    let serving = proxy.clone();
    let serve = tokio::spawn(async move { serving.serve().await });
    Self {
      helper,
      proxy,
      serve: Some(serve),
      client: TestClient::new(),
    }
  }

  async fn with_backends(backends: &[&TestBackend]) -> Self {
    Self::new(backends.iter().map(|backend| backend.address()).collect()).await
  }

  async fn call(&self, method: &str, metadata: HeaderMap, payloads: &[&str]) -> TestResponse {
    self
      .client
      .call(
        self.proxy.local_address(),
        method,
        metadata,
        payloads.iter().map(|p| Frame::new(p.to_string())).collect(),
      )
      .await
  }

  async fn stop(&mut self) -> anyhow::Result<()> {
    self.proxy.stop();
    self.serve.take().unwrap().await.unwrap()
  }

  fn labels(extra: Option<(&'static str, &'static str)>) -> HashMap<&'static str, &'static str> {
    let mut labels = HashMap::from([("listener", LISTENER)]);
    labels.extend(extra);
    labels
  }
}

#[tokio::test]
async fn echo_through_proxy() {
  let backend = TestBackend::start(BackendOptions::named("one")).await;
  let mut setup = Setup::with_backends(&[&backend]).await;

  let response = setup.call("/Echo/Stream", HeaderMap::new(), &["a", "b"]).await;
  assert_eq!(response.payloads(), vec!["a", "b"]);
  assert_eq!(response.code, Some(Code::Ok));
  assert!(!response.trailers_only);
  assert_eq!(response.headers.get(NAME_HEADER).unwrap(), "one");
  assert_eq!(response.trailers.get(NAME_TRAILER).unwrap(), "one");

  setup.stop().await.unwrap();
  setup
    .helper
    .assert_counter_eq(1, "proxy:calls_total", &Setup::labels(None));
  setup.helper.assert_counter_eq(
    1,
    "proxy:call_completions_total",
    &Setup::labels(Some(("result", "success"))),
  );
  setup.helper.assert_counter_eq(
    2,
    "proxy:frames_total",
    &Setup::labels(Some(("direction", "upstream"))),
  );
  setup.helper.assert_counter_eq(
    2,
    "proxy:frames_total",
    &Setup::labels(Some(("direction", "downstream"))),
  );
  for direction in ["upstream", "downstream"] {
    setup.helper.assert_counter_eq(
      12,
      "proxy:bytes_total",
      &Setup::labels(Some(("direction", direction))),
    );
  }
  setup
    .helper
    .assert_counter_eq(1, "proxy:cx_total", &Setup::labels(None));
  setup
    .helper
    .assert_gauge_eq(0, "proxy:cx_active", &Setup::labels(None));
  setup
    .helper
    .assert_gauge_eq(0, "proxy:calls_active", &Setup::labels(None));
}

#[tokio::test]
async fn any_method_and_metadata_forwarded() {
  let backend = TestBackend::start(BackendOptions::named("one")).await;
  let setup = Setup::with_backends(&[&backend]).await;

  let mut metadata = header_map(&[("x-request-id", "42"), ("x-multi", "1")]);
  metadata.append("x-multi", "2".parse().unwrap());
  metadata.append("x-bin-bin", "AAEC".parse().unwrap());
  let response = setup
    .call("/some.pkg.Unknown/Whatever", metadata, &["a"])
    .await;
  assert_eq!(response.code, Some(Code::Ok));

  let calls = backend.calls();
  assert_eq!(calls.len(), 1);
  assert_eq!(calls[0].method, "/some.pkg.Unknown/Whatever");
  assert_eq!(calls[0].headers.get("x-request-id").unwrap(), "42");
  let multi: Vec<_> = calls[0].headers.get_all("x-multi").iter().collect();
  assert_eq!(multi, vec!["1", "2"]);
  assert_eq!(calls[0].headers.get("x-bin-bin").unwrap(), "AAEC");
  assert_eq!(calls[0].headers.get_all("te").iter().count(), 1);
}

#[tokio::test]
async fn failure_status_and_trailers_relayed() {
  let backend = TestBackend::start(BackendOptions::named("one")).await;
  let setup = Setup::with_backends(&[&backend]).await;

  let response = setup
    .call(
      "/Echo/Stream",
      header_map(&[(STATUS_HEADER, "7"), (MESSAGE_HEADER, "not%20allowed")]),
      &["a"],
    )
    .await;
  assert_eq!(response.payloads(), vec!["a"]);
  assert_eq!(response.code, Some(Code::PermissionDenied));
  assert_eq!(response.message.as_deref(), Some("not allowed"));
  assert_eq!(response.trailers.get(NAME_TRAILER).unwrap(), "one");
  setup.helper.assert_counter_eq(
    1,
    "proxy:call_completions_total",
    &Setup::labels(Some(("result", "failure"))),
  );
}

#[tokio::test]
async fn trailers_only_relayed() {
  let backend = TestBackend::start(BackendOptions::named("one")).await;
  let setup = Setup::with_backends(&[&backend]).await;

  let response = setup
    .call(
      "/Echo/Stream",
      header_map(&[(TRAILERS_ONLY_HEADER, "5"), (MESSAGE_HEADER, "nothing")]),
      &[],
    )
    .await;
  assert!(response.trailers_only);
  assert!(response.frames.is_empty());
  assert_eq!(response.code, Some(Code::NotFound));
  assert_eq!(response.message.as_deref(), Some("nothing"));
  assert_eq!(response.trailers.get(NAME_TRAILER).unwrap(), "one");
}

#[tokio::test]
async fn transient_failures_retried() {
  let backend = TestBackend::start(BackendOptions {
    fail_first: 2,
    ..BackendOptions::named("one")
  })
  .await;
  let setup = Setup::with_backends(&[&backend]).await;

  let response = setup.call("/Echo/Stream", HeaderMap::new(), &["a", "b"]).await;
  assert_eq!(response.code, Some(Code::Ok));
  assert_eq!(response.payloads(), vec!["a", "b"]);
  assert_eq!(backend.calls().len(), 3);
}

#[tokio::test]
async fn unreachable_downstream() {
  let closed = {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
  };
  let setup = Setup::new(vec![closed]).await;

  let response = setup.call("/Echo/Stream", HeaderMap::new(), &["a"]).await;
  assert!(response.trailers_only);
  assert_eq!(response.code, Some(Code::Unavailable));
}

#[tokio::test]
async fn unparseable_method() {
  let backend = TestBackend::start(BackendOptions::named("one")).await;
  let setup = Setup::with_backends(&[&backend]).await;

  let response = setup.call("/not-a-method", HeaderMap::new(), &["a"]).await;
  assert_eq!(response.code, Some(Code::Internal));
  assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn interleaved_streaming() {
  let backend = TestBackend::start(BackendOptions::named("one")).await;
  let setup = Setup::with_backends(&[&backend]).await;

  let mut call = setup
    .client
    .start_call(setup.proxy.local_address(), "/Echo/Stream", HeaderMap::new());
  for payload in ["a", "b", "c"] {
    assert!(call.send(Frame::new(payload)).await);
    assert_eq!(call.recv().await.unwrap().payload, payload);
  }
  assert_eq!(call.headers().await.get(NAME_HEADER).unwrap(), "one");

  // Half-closing lets the downstream finish the call.
  call.close_send();
  let response = call.finish().await;
  assert!(response.frames.is_empty());
  assert_eq!(response.code, Some(Code::Ok));
}

#[tokio::test]
async fn concurrent_calls_isolated() {
  let first = TestBackend::start(BackendOptions::named("first")).await;
  let second = TestBackend::start(BackendOptions::named("second")).await;
  let setup = Setup::with_backends(&[&first, &second]).await;

  let payloads: Vec<Vec<String>> = (0 .. 8)
    .map(|call| (0 .. 3).map(|frame| format!("{call}-{frame}")).collect())
    .collect();
  let setup = &setup;
  let responses = futures::future::join_all(payloads.iter().map(|payloads| {
    let payloads: Vec<&str> = payloads.iter().map(String::as_str).collect();
    async move { setup.call("/Echo/Stream", HeaderMap::new(), &payloads).await }
  }))
  .await;

  for (response, expected) in responses.iter().zip(&payloads) {
    assert_eq!(response.code, Some(Code::Ok));
    assert_eq!(&response.payloads(), expected);
  }
  assert_eq!(first.calls().len() + second.calls().len(), 8);
  assert_eq!(first.calls().len(), 4);
}

#[tokio::test]
async fn stop_drains_in_flight_calls() {
  let backend = TestBackend::start(BackendOptions::named("one")).await;
  let mut setup = Setup::with_backends(&[&backend]).await;

  let mut call = setup
    .client
    .start_call(setup.proxy.local_address(), "/Echo/Stream", HeaderMap::new());
  assert!(call.send(Frame::new("a")).await);
  assert_eq!(call.recv().await.unwrap().payload, "a");
  assert_eq!(setup.proxy.state(), ProxyState::Serving);

  setup.proxy.stop();
  assert_eq!(setup.proxy.state(), ProxyState::Stopping);
  let serve = setup.serve.take().unwrap();

  assert!(call.send(Frame::new("b")).await);
  call.close_send();
  let response = call.finish().await;
  assert_eq!(response.payloads(), vec!["b"]);
  assert_eq!(response.code, Some(Code::Ok));

  serve.await.unwrap().unwrap();
  assert_eq!(setup.proxy.state(), ProxyState::Stopped);
  assert!(setup.proxy.serve().await.is_err());
}

#[tokio::test]
async fn caller_going_away_cancels_downstream() {
  let backend = TestBackend::start(BackendOptions::named("one")).await;
  let mut setup = Setup::with_backends(&[&backend]).await;

  let mut call = setup.client.start_call(
    setup.proxy.local_address(),
    "/Echo/Stream",
    header_map(&[(HOLD_OPEN_HEADER, "1")]),
  );
  assert!(call.send(Frame::new("a")).await);
  call.close_send();
  assert_eq!(call.recv().await.unwrap().payload, "a");
  drop(call);

  tokio::time::timeout(std::time::Duration::from_secs(5), async {
    while backend.cancelled_calls() == 0 {
      tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
  })
  .await
  .unwrap();

  setup.stop().await.unwrap();
  setup.helper.assert_counter_eq(
    1,
    "proxy:call_completions_total",
    &Setup::labels(Some(("result", "failure"))),
  );
  setup
    .helper
    .assert_gauge_eq(0, "proxy:calls_active", &Setup::labels(None));
}

#[tokio::test]
async fn stop_before_serve() {
  let helper = Helper::new();
  let proxy = Proxy::new_with_resolver(
    fast_config(),
    Arc::new(StaticResolver::default()),
    &helper.collector().scope(""),
  )
  .await
  .unwrap();
  proxy.stop();
  proxy.serve().await.unwrap();
  assert_eq!(proxy.state(), ProxyState::Stopped);
}

#[tokio::test]
async fn construction_failures() {
  let helper = Helper::new();
  let scope = helper.collector().scope("");

  assert!(
    Proxy::new(ProxyConfig::new(LISTENER, "dns:backend:443"), &scope)
      .await
      .is_err()
  );

  let taken = tokio::net::TcpListener::bind(LISTENER).await.unwrap();
  let config = ProxyConfig::new(taken.local_addr().unwrap().to_string(), "localhost:50051");
  assert!(Proxy::new(config, &scope).await.is_err());
}
