// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use gb_server_stats::stats::Scope;
use prometheus::{IntCounter, IntGauge};
use std::collections::HashMap;

//
// DirectionStats
//

#[derive(Clone)]
pub struct DirectionStats {
  pub frames: IntCounter,
  // Wire bytes of the relayed frames, including the length prefix.
  pub bytes: IntCounter,
}

//
// ProxyStats
//

// Per listener stats. Upstream frames travel from the caller to the target, downstream frames
// travel back.
#[derive(Clone)]
pub struct ProxyStats {
  pub calls_total: IntCounter,
  pub calls_active: IntGauge,
  pub call_success: IntCounter,
  pub call_failure: IntCounter,
  pub upstream: DirectionStats,
  pub downstream: DirectionStats,
  pub cx_total: IntCounter,
  pub cx_active: IntGauge,
}

impl ProxyStats {
  #[must_use]
  pub fn new(scope: &Scope, listener: &str) -> Self {
    let scope = scope.scope_with_labels(
      "proxy",
      HashMap::from([("listener".to_string(), listener.to_string())]),
    );
    let completions = scope.counter_vec("call_completions_total", &["result"]);
    let frames = scope.counter_vec("frames_total", &["direction"]);
    let bytes = scope.counter_vec("bytes_total", &["direction"]);

    Self {
      calls_total: scope.counter("calls_total"),
      calls_active: scope.gauge("calls_active"),
      call_success: completions.with_label_values(&["success"]),
      call_failure: completions.with_label_values(&["failure"]),
      upstream: DirectionStats {
        frames: frames.with_label_values(&["upstream"]),
        bytes: bytes.with_label_values(&["upstream"]),
      },
      downstream: DirectionStats {
        frames: frames.with_label_values(&["downstream"]),
        bytes: bytes.with_label_values(&["downstream"]),
      },
      cx_total: scope.counter("cx_total"),
      cx_active: scope.gauge("cx_active"),
    }
  }
}
