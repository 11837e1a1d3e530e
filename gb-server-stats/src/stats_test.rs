// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::test_util::Helper;
use pretty_assertions::assert_eq;
use prometheus::labels;

#[ctor::ctor]
fn test_global_init() {
  gb_log::initialize();
}

#[test]
fn scoped_metrics_share_registrations() {
  let helper = Helper::new();
  let scope = helper.collector().scope("proxy").scope_with_labels(
    "",
    HashMap::from([("listener".to_string(), "a".to_string())]),
  );

  scope.counter("calls_total").inc();
  // Fetching the same metric again returns the registered instance.
  scope.counter("calls_total").inc();
  helper.assert_counter_eq(2, "proxy:calls_total", &labels!("listener" => "a"));

  let completions = scope.counter_vec("call_completions_total", &["result"]);
  completions.with_label_values(&["success"]).inc();
  scope
    .counter_vec("call_completions_total", &["result"])
    .with_label_values(&["failure"])
    .inc_by(3);
  helper.assert_counter_eq(
    1,
    "proxy:call_completions_total",
    &labels!("listener" => "a", "result" => "success"),
  );
  helper.assert_counter_eq(
    3,
    "proxy:call_completions_total",
    &labels!("listener" => "a", "result" => "failure"),
  );
}

#[test]
fn same_name_different_scope_labels() {
  let helper = Helper::new();
  let make_scope = |listener: &str| {
    helper.collector().scope("proxy").scope_with_labels(
      "",
      HashMap::from([("listener".to_string(), listener.to_string())]),
    )
  };

  make_scope("a").counter("cx_total").inc();
  make_scope("b").counter("cx_total").inc_by(2);
  helper.assert_counter_eq(1, "proxy:cx_total", &labels!("listener" => "a"));
  helper.assert_counter_eq(2, "proxy:cx_total", &labels!("listener" => "b"));
}

#[test]
fn auto_gauge() {
  let helper = Helper::new();
  let gauge = helper.collector().scope("proxy").gauge("calls_active");
  {
    let _first = AutoGauge::new(gauge.clone());
    let _second = AutoGauge::new(gauge.clone());
    helper.assert_gauge_eq(2, "proxy:calls_active", &labels!());
  }
  helper.assert_gauge_eq(0, "proxy:calls_active", &labels!());

  let output = String::from_utf8(helper.collector().prometheus_output()).unwrap();
  assert_eq!(output.lines().last(), Some("proxy:calls_active 0"));
}
