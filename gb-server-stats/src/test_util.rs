// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::stats;
use prometheus::proto::{Counter, Gauge, Metric};
use std::collections::HashMap;

//
// Helper
//

// General helper for verifying emitted stats in tests.
#[derive(Clone, Default)]
pub struct Helper {
  collector: stats::Collector,
}

impl Helper {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  #[must_use]
  pub const fn collector(&self) -> &stats::Collector {
    &self.collector
  }

  fn labels_equal(metric: &Metric, labels: &HashMap<&str, &str>) -> bool {
    metric.get_label().len() == labels.len()
      && metric
        .get_label()
        .iter()
        .all(|pair| labels.get(pair.name()) == Some(&pair.value()))
  }

  fn find_metric(&self, name: &str, labels: &HashMap<&str, &str>) -> Option<Metric> {
    self
      .collector
      .gather()
      .into_iter()
      .filter(|family| family.name() == name)
      .find_map(|family| {
        family
          .get_metric()
          .iter()
          .find(|metric| Self::labels_equal(metric, labels))
          .cloned()
      })
  }

  #[must_use]
  pub fn find_counter(&self, name: &str, labels: &HashMap<&str, &str>) -> Option<Counter> {
    self
      .find_metric(name, labels)
      .and_then(|metric| metric.counter.into_option())
  }

  #[must_use]
  pub fn find_gauge(&self, name: &str, labels: &HashMap<&str, &str>) -> Option<Gauge> {
    self
      .find_metric(name, labels)
      .and_then(|metric| metric.gauge.into_option())
  }

  // Assert that a counter is equal to a value.
  #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
  pub fn assert_counter_eq(&self, value: u64, name: &str, labels: &HashMap<&str, &str>) {
    let actual = self
      .find_counter(name, labels)
      .unwrap_or_else(|| panic!("counter '{name}' with labels '{labels:?}' not found"))
      .value() as u64;
    assert_eq!(
      value, actual,
      "counter '{name}' with labels '{labels:?}' not equal to '{value}', was '{actual}'",
    );
  }

  // Assert that a gauge is equal to a value.
  #[allow(clippy::cast_possible_truncation)]
  pub fn assert_gauge_eq(&self, value: i64, name: &str, labels: &HashMap<&str, &str>) {
    let actual = self
      .find_gauge(name, labels)
      .unwrap_or_else(|| panic!("gauge '{name}' with labels '{labels:?}' not found"))
      .value() as i64;
    assert_eq!(
      value, actual,
      "gauge '{name}' with labels '{labels:?}' not equal to '{value}', was '{actual}'",
    );
  }
}
