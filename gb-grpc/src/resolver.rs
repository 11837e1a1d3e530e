// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::target::Target;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;

//
// Resolver
//

// Produces the current endpoint set for a target. Called periodically and whenever a call finds
// no endpoints, so implementations should return the full current set every time.
#[async_trait]
pub trait Resolver: Send + Sync {
  async fn resolve(&self) -> anyhow::Result<Vec<SocketAddr>>;
}

//
// DnsResolver
//

pub struct DnsResolver {
  lookup_name: String,
}

impl DnsResolver {
  #[must_use]
  pub fn new(target: &Target) -> Self {
    Self {
      lookup_name: target.lookup_name(),
    }
  }
}

#[async_trait]
impl Resolver for DnsResolver {
  async fn resolve(&self) -> anyhow::Result<Vec<SocketAddr>> {
    let mut endpoints: Vec<_> = tokio::net::lookup_host(&self.lookup_name).await?.collect();
    // Sorted so that an unchanged record set compares equal across lookups.
    endpoints.sort_unstable();
    endpoints.dedup();
    Ok(endpoints)
  }
}

//
// StaticResolver
//

// A fixed endpoint set that can be replaced at runtime.
#[derive(Default)]
pub struct StaticResolver {
  endpoints: Mutex<Vec<SocketAddr>>,
}

impl StaticResolver {
  #[must_use]
  pub fn new(endpoints: Vec<SocketAddr>) -> Self {
    Self {
      endpoints: Mutex::new(endpoints),
    }
  }

  pub fn set(&self, endpoints: Vec<SocketAddr>) {
    *self.endpoints.lock() = endpoints;
  }
}

#[async_trait]
impl Resolver for StaticResolver {
  async fn resolve(&self) -> anyhow::Result<Vec<SocketAddr>> {
    Ok(self.endpoints.lock().clone())
  }
}
