// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod rate_limit_log;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_FILTER_RULES: &str = "info,h2=warn,hyper=warn,hyper_util=warn";

// Initialize the process wide logger. Logs go to stderr. This should be called as early as possible
// in the program. Subsequent calls are ignored, which lets every test binary call it from its global
// init.
pub fn initialize() {
  // Gate ANSI on whether GB_LOG_ANSI is set. This avoids using this feature by default (e.g.
  // in k8s) but allows it to be enabled for local development should the user want it.
  let stderr = tracing_subscriber::fmt::layer()
    .with_writer(std::io::stderr)
    .with_ansi(std::env::var("GB_LOG_ANSI").is_ok())
    .with_line_number(true)
    .with_thread_ids(true)
    .compact();

  let filter = EnvFilter::new(
    std::env::var("RUST_LOG")
      .as_deref()
      .unwrap_or(DEFAULT_FILTER_RULES),
  );

  // The fmt layer installs the log -> tracing bridge so that log macros used across the workspace
  // end up here as well.
  if let Err(e) = tracing_subscriber::registry()
    .with(filter)
    .with(stderr)
    .try_init()
  {
    tracing::debug!("logger already initialized: {e}");
  }
}
