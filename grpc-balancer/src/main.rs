// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

mod admin;
mod cli;

use anyhow::Context;
use clap::Parser;
use cli::Options;
use gb_proxy::{Proxy, ProxyConfig};
use gb_server_stats::stats::Collector;
use gb_shutdown::ShutdownTrigger;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinSet;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  gb_log::initialize();
}

#[tokio::main]
async fn main() -> ExitCode {
  gb_log::initialize();

  let options = match Options::try_parse() {
    Ok(options) => options,
    Err(e) => {
      let _ignored = e.print();
      return if e.use_stderr() {
        ExitCode::FAILURE
      } else {
        ExitCode::SUCCESS
      };
    },
  };

  match run(options).await {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      log::error!("{e:#}");
      ExitCode::FAILURE
    },
  }
}

async fn run(options: Options) -> anyhow::Result<()> {
  let collector = Collector::default();
  let scope = collector.scope("");
  let resolver_refresh_interval: time::Duration = options.resolver_refresh_interval.try_into()?;

  log::info!("bringing up {} proxies", options.proxies.len());
  let mut proxies = Vec::with_capacity(options.proxies.len());
  for pair in &options.proxies {
    let mut config = ProxyConfig::new(pair.listen_address(), &pair.target);
    config.resolver_refresh_interval = resolver_refresh_interval;
    let proxy = Proxy::new(config, &scope)
      .await
      .with_context(|| format!("failed to set up proxy {pair}"))?;
    proxies.push(Arc::new(proxy));
  }

  let ready = Arc::new(AtomicBool::new(true));
  let admin_trigger = ShutdownTrigger::default();
  let admin = match &options.admin_address {
    Some(address) => Some(
      admin::start(
        address,
        collector.clone(),
        ready.clone(),
        admin_trigger.make_shutdown(),
      )
      .await?,
    ),
    None => None,
  };

  let mut serving = JoinSet::new();
  for proxy in &proxies {
    let proxy = proxy.clone();
    serving.spawn(async move { (proxy.local_address(), proxy.serve().await) });
  }
  log::info!("ready");

  let mut failed = false;
  tokio::select! {
    signal = gb_shutdown::wait_for_signal() => {
      if let Err(e) = signal {
        log::error!("failed to wait for signals: {e}");
        failed = true;
      }
    },
    Some(joined) = serving.join_next() => {
      failed = true;
      log_serve_result(joined);
    },
  }

  ready.store(false, Ordering::Relaxed);
  log::info!(
    "cooling down for {}",
    humantime::format_duration(options.shutdown_delay)
  );
  tokio::time::sleep(options.shutdown_delay).await;

  log::info!("stopping");
  for proxy in &proxies {
    proxy.stop();
  }
  while let Some(joined) = serving.join_next().await {
    failed |= !log_serve_result(joined);
  }

  admin_trigger.shutdown().await;
  if let Some(admin) = admin {
    match admin.await {
      Ok(Ok(())) => {},
      Ok(Err(e)) => log::warn!("admin server failed: {e}"),
      Err(e) => log::warn!("admin server task failed: {e}"),
    }
  }

  log::info!("bye");
  if failed {
    anyhow::bail!("one or more proxies failed");
  }
  Ok(())
}

// Returns whether the proxy stopped cleanly.
fn log_serve_result(
  joined: Result<(SocketAddr, anyhow::Result<()>), tokio::task::JoinError>,
) -> bool {
  match joined {
    Ok((address, Ok(()))) => {
      log::debug!("proxy on {address} finished");
      true
    },
    Ok((address, Err(e))) => {
      log::error!("proxy on {address} failed: {e:#}");
      false
    },
    Err(e) => {
      log::error!("proxy task failed: {e}");
      false
    },
  }
}
