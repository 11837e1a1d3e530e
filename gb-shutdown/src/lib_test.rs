// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::ShutdownTrigger;
use futures::poll;
use std::task::Poll;

#[tokio::test]
async fn shutdown_waits_for_all_handles() {
  let trigger = ShutdownTrigger::default();
  let mut first = trigger.make_shutdown();
  let second = first.clone();
  assert!(!first.is_cancelled());

  let (done_tx, mut done_rx) = tokio::sync::oneshot::channel::<()>();
  let worker = tokio::spawn(async move {
    first.cancelled().await;
    done_rx.try_recv().unwrap_err();
  });

  let shutdown = trigger.shutdown();
  tokio::pin!(shutdown);
  assert_eq!(poll!(&mut shutdown), Poll::Pending);

  worker.await.unwrap();
  assert!(second.is_cancelled());
  assert_eq!(poll!(&mut shutdown), Poll::Pending);

  drop(second);
  shutdown.await;
  drop(done_tx);
}

#[tokio::test]
async fn initiate_is_idempotent() {
  let trigger = ShutdownTrigger::default();
  let mut shutdown = trigger.make_shutdown();
  assert!(!trigger.is_initiated());

  trigger.initiate();
  trigger.initiate();
  assert!(trigger.is_initiated());
  shutdown.cancelled().await;

  // Handles made after the fact are already cancelled.
  assert!(trigger.make_shutdown().is_cancelled());
  drop(shutdown);
  trigger.shutdown().await;
}

#[tokio::test]
async fn dropped_trigger_releases_waiters() {
  let trigger = ShutdownTrigger::default();
  let mut shutdown = trigger.make_shutdown();
  drop(trigger);
  shutdown.cancelled().await;
}
