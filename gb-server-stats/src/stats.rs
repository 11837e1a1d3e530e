// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./stats_test.rs"]
mod stats_test;

use dashmap::DashMap;
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

// Name plus const labels. Sorted so that equal label sets always produce the same key.
type MetricKey = (String, BTreeMap<String, String>);

//
// Scope
//

// Named metrics scope used to create metrics. Every metric created through a scope carries the
// scope's labels as const labels.
#[derive(Clone)]
#[allow(clippy::struct_field_names)]
pub struct Scope {
  name: String,
  collector: Collector,
  labels: HashMap<String, String>,
}

const SEP: &str = ":";

impl Scope {
  // Create a sub-scope.
  #[must_use]
  pub fn scope(&self, extend: &str) -> Self {
    self.scope_with_labels(extend, HashMap::new())
  }

  // Create a sub-scope with a set of fixed labels.
  #[must_use]
  pub fn scope_with_labels(&self, extend: &str, labels: HashMap<String, String>) -> Self {
    let name = if extend.is_empty() {
      self.name.clone()
    } else {
      self.metric_name(extend)
    };

    let mut final_labels = self.labels.clone();
    final_labels.extend(labels);
    Self {
      name,
      collector: self.collector.clone(),
      labels: final_labels,
    }
  }

  // Create or fetch a counter with scope labels.
  #[must_use]
  pub fn counter(&self, name: &str) -> IntCounter {
    let name = self.metric_name(name);
    self
      .collector
      .inner
      .counters
      .entry(self.key(&name))
      .or_insert_with(|| {
        let counter = IntCounter::with_opts(self.opts(name)).unwrap();
        self.collector.register(counter.clone());
        counter
      })
      .clone()
  }

  // Create or fetch a counter vec whose children carry the scope labels plus the listed dynamic
  // labels.
  #[must_use]
  pub fn counter_vec(&self, name: &str, labels: &[&str]) -> IntCounterVec {
    let name = self.metric_name(name);
    self
      .collector
      .inner
      .counter_vecs
      .entry(self.key(&name))
      .or_insert_with(|| {
        let counter_vec = IntCounterVec::new(self.opts(name), labels).unwrap();
        self.collector.register(counter_vec.clone());
        counter_vec
      })
      .clone()
  }

  // Create or fetch a gauge with scope labels.
  #[must_use]
  pub fn gauge(&self, name: &str) -> IntGauge {
    let name = self.metric_name(name);
    self
      .collector
      .inner
      .gauges
      .entry(self.key(&name))
      .or_insert_with(|| {
        let gauge = IntGauge::with_opts(self.opts(name)).unwrap();
        self.collector.register(gauge.clone());
        gauge
      })
      .clone()
  }

  fn key(&self, name: &str) -> MetricKey {
    (
      name.to_string(),
      self
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect(),
    )
  }

  fn opts(&self, name: String) -> Opts {
    Opts::new(name, "-").const_labels(self.labels.clone())
  }

  // Build the final metric name from the current scope.
  fn metric_name(&self, name: &str) -> String {
    if self.name.is_empty() {
      name.to_string()
    } else {
      format!("{}{SEP}{name}", self.name)
    }
  }
}

//
// Collector
//

struct CollectorInner {
  registry: Registry,
  counters: DashMap<MetricKey, IntCounter>,
  counter_vecs: DashMap<MetricKey, IntCounterVec>,
  gauges: DashMap<MetricKey, IntGauge>,
}

// Wrapper around a prometheus registry. Cheap to clone, all clones share the registry.
#[derive(Clone)]
pub struct Collector {
  inner: Arc<CollectorInner>,
}

impl Default for Collector {
  fn default() -> Self {
    Self {
      inner: Arc::new(CollectorInner {
        registry: Registry::default(),
        counters: DashMap::new(),
        counter_vecs: DashMap::new(),
        gauges: DashMap::new(),
      }),
    }
  }
}

impl Collector {
  // Create a named scope.
  #[must_use]
  pub fn scope(&self, name: &str) -> Scope {
    Scope {
      name: name.to_string(),
      collector: self.clone(),
      labels: HashMap::new(),
    }
  }

  // Dump prometheus text output.
  #[must_use]
  pub fn prometheus_output(&self) -> Vec<u8> {
    let mut buffer = vec![];
    TextEncoder::new()
      .encode(&self.gather(), &mut buffer)
      .unwrap();
    buffer
  }

  // Gather all metrics in proto form.
  #[must_use]
  pub fn gather(&self) -> Vec<MetricFamily> {
    self.inner.registry.gather()
  }

  // Metrics are deduplicated by key before getting here, so a failure is a name/label schema
  // conflict between two call sites.
  fn register(&self, metric: impl prometheus::core::Collector + 'static) {
    self.inner.registry.register(Box::new(metric)).unwrap();
  }
}

//
// AutoGauge
//

// Helper to increment a gauge and decrement it on destruction.
pub struct AutoGauge {
  gauge: IntGauge,
}

impl AutoGauge {
  #[must_use]
  pub fn new(gauge: IntGauge) -> Self {
    gauge.inc();
    Self { gauge }
  }
}

impl Drop for AutoGauge {
  fn drop(&mut self) {
    debug_assert!(self.gauge.get() > 0);
    self.gauge.dec();
  }
}
