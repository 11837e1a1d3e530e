// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./balancer_test.rs"]
mod balancer_test;

use crate::resolver::Resolver;
use arc_swap::ArcSwap;
use gb_log::warn_every;
use gb_shutdown::Shutdown;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use time::Duration;
use time::ext::NumericalDuration;

//
// RoundRobin
//

// Client side round robin over the resolved endpoints of one target. Picking is lock free; the
// endpoint set is swapped wholesale whenever resolution produces a new one.
pub struct RoundRobin {
  name: String,
  resolver: Arc<dyn Resolver>,
  endpoints: ArcSwap<Vec<SocketAddr>>,
  cursor: AtomicUsize,
  // Serializes resolution so that a burst of calls with no endpoints triggers a single lookup.
  resolve_lock: tokio::sync::Mutex<()>,
}

impl RoundRobin {
  #[must_use]
  pub fn new(name: &str, resolver: Arc<dyn Resolver>) -> Arc<Self> {
    Arc::new(Self {
      name: name.to_string(),
      resolver,
      endpoints: ArcSwap::default(),
      cursor: AtomicUsize::new(0),
      resolve_lock: tokio::sync::Mutex::new(()),
    })
  }

  #[must_use]
  pub fn endpoints(&self) -> Arc<Vec<SocketAddr>> {
    self.endpoints.load_full()
  }

  fn next(&self) -> Option<SocketAddr> {
    let endpoints = self.endpoints.load();
    if endpoints.is_empty() {
      return None;
    }
    let index = self.cursor.fetch_add(1, Ordering::Relaxed) % endpoints.len();
    Some(endpoints[index])
  }

  // Pick the next endpoint. If nothing has been resolved yet (or the last good resolution was
  // empty) this resolves inline first.
  pub async fn pick(&self) -> Option<SocketAddr> {
    if let Some(endpoint) = self.next() {
      return Some(endpoint);
    }

    let _guard = self.resolve_lock.lock().await;
    if self.endpoints.load().is_empty() {
      self.resolve().await;
    }
    self.next()
  }

  // Re-resolve now. Failures and empty results keep the previous endpoint set.
  pub async fn refresh(&self) {
    let _guard = self.resolve_lock.lock().await;
    self.resolve().await;
  }

  async fn resolve(&self) {
    match self.resolver.resolve().await {
      Ok(endpoints) if endpoints.is_empty() => {
        warn_every!(
          15.seconds(),
          "target {} resolved to no endpoints, keeping {} previous endpoints",
          self.name,
          self.endpoints.load().len()
        );
      },
      Ok(endpoints) => {
        if **self.endpoints.load() != endpoints {
          log::info!("target {} resolved to {endpoints:?}", self.name);
          self.endpoints.store(Arc::new(endpoints));
        }
      },
      Err(e) => {
        warn_every!(
          15.seconds(),
          "failed to resolve target {}, keeping {} previous endpoints: {e}",
          self.name,
          self.endpoints.load().len()
        );
      },
    }
  }

  // Re-resolves on a fixed interval until shutdown. The first resolution happens on demand when the
  // first call is made, so the loop starts with a wait.
  pub async fn refresh_loop(self: Arc<Self>, interval: Duration, mut shutdown: Shutdown) {
    loop {
      tokio::select! {
        () = shutdown.cancelled() => {
          log::debug!("stopping resolver for target {}", self.name);
          return;
        },
        () = tokio::time::sleep(interval.unsigned_abs()) => self.refresh().await,
      }
    }
  }
}
