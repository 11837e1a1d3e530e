// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./lib_test.rs"]
mod lib_test;

use std::sync::Arc;
use tokio::sync::watch;

//
// Signal
//

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Signal {
  Interrupt,
  Terminate,
}

// Waits for SIGINT or SIGTERM and reports which one arrived.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<Signal> {
  use tokio::signal::unix::{SignalKind, signal};

  let mut sigterm_stream = signal(SignalKind::terminate())?;
  let mut sigint_stream = signal(SignalKind::interrupt())?;
  let signal = tokio::select! {
    _ = sigterm_stream.recv() => Signal::Terminate,
    _ = sigint_stream.recv() => Signal::Interrupt,
  };

  log::info!("received {signal:?}");
  Ok(signal)
}

#[cfg(windows)]
pub async fn wait_for_signal() -> std::io::Result<Signal> {
  tokio::signal::ctrl_c().await?;
  log::info!("received CTRL-C");
  Ok(Signal::Interrupt)
}

//
// ComponentStatus
//

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ComponentStatus {
  Running,
  PendingShutdown,
}

//
// ShutdownTrigger
//

// Owner side of a cancellation scope. Any number of `Shutdown` handles can be derived from it; the
// trigger can then ask them to stop and wait until every one of them has been dropped, which is how
// callers know that the work holding them has actually finished.
#[derive(Debug)]
pub struct ShutdownTrigger {
  status_tx: Arc<watch::Sender<ComponentStatus>>,
}

impl Default for ShutdownTrigger {
  fn default() -> Self {
    let (status_tx, _) = watch::channel(ComponentStatus::Running);
    Self {
      status_tx: Arc::new(status_tx),
    }
  }
}

impl ShutdownTrigger {
  #[must_use]
  pub fn make_shutdown(&self) -> Shutdown {
    Shutdown {
      status_rx: self.status_tx.subscribe(),
    }
  }

  // Flags shutdown without waiting. Idempotent.
  pub fn initiate(&self) {
    self
      .status_tx
      .send_replace(ComponentStatus::PendingShutdown);
  }

  #[must_use]
  pub fn is_initiated(&self) -> bool {
    *self.status_tx.borrow() == ComponentStatus::PendingShutdown
  }

  // Flags shutdown (if not already flagged) and waits for every derived handle to be dropped.
  pub async fn shutdown(self) {
    self.initiate();
    self.status_tx.closed().await;
  }
}

//
// Shutdown
//

/// Handle held by a unit of work that must stop when its trigger fires. The trigger only
/// considers the work finished once every clone of this handle has been dropped.
#[derive(Clone, Debug)]
pub struct Shutdown {
  status_rx: watch::Receiver<ComponentStatus>,
}

impl Shutdown {
  /// Returns once shutdown has been initiated. Also returns if the trigger has been dropped, as
  /// nothing can be waiting on the work anymore.
  pub async fn cancelled(&mut self) {
    let _ignored = self
      .status_rx
      .wait_for(|status| *status == ComponentStatus::PendingShutdown)
      .await;
  }

  #[must_use]
  pub fn is_cancelled(&self) -> bool {
    *self.status_rx.borrow() == ComponentStatus::PendingShutdown
  }
}
