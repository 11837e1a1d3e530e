// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./cli_test.rs"]
mod cli_test;

use clap::Parser;
use std::str::FromStr;
use std::time::Duration;

//
// ProxyPair
//

// A LISTEN-TARGET pair. The pair is split at the first '-', so the listen address cannot contain
// one while the target can.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyPair {
  pub listen: String,
  pub target: String,
}

impl ProxyPair {
  // The address to bind. A bare ":port" listens on every interface.
  #[must_use]
  pub fn listen_address(&self) -> String {
    if self.listen.starts_with(':') {
      format!("0.0.0.0{}", self.listen)
    } else {
      self.listen.clone()
    }
  }
}

impl FromStr for ProxyPair {
  type Err = anyhow::Error;

  fn from_str(pair: &str) -> anyhow::Result<Self> {
    match pair.split_once('-') {
      Some((listen, target)) if !listen.is_empty() && !target.is_empty() => Ok(Self {
        listen: listen.to_string(),
        target: target.to_string(),
      }),
      _ => anyhow::bail!("invalid proxy '{pair}', expected LISTEN-TARGET"),
    }
  }
}

impl std::fmt::Display for ProxyPair {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}-{}", self.listen, self.target)
  }
}

#[derive(Debug, Parser)]
#[command(version, about = "Transparent gRPC proxy", long_about = None)]
pub struct Options {
  /// Proxy to run, as LISTEN-TARGET (e.g. :8080-dns:///backend:50051). Repeat the flag, or
  /// separate pairs with commas, to run several.
  #[arg(
    short = 'p',
    long = "proxy",
    env = "GB_PROXY",
    value_delimiter = ',',
    required = true
  )]
  pub proxies: Vec<ProxyPair>,

  /// How long to keep serving after a stop signal before draining.
  #[arg(
    short = 'd',
    long,
    env = "GB_SHUTDOWN_DELAY",
    default_value = "5s",
    value_parser = humantime::parse_duration
  )]
  pub shutdown_delay: Duration,

  /// How often targets are re-resolved.
  #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
  pub resolver_refresh_interval: Duration,

  /// Serve /metrics and /ready on this address.
  #[arg(long, env = "GB_ADMIN_ADDRESS")]
  pub admin_address: Option<String>,
}
