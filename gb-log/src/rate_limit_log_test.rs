// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::WarnTracker;
use crate::warn_every;
use time::ext::NumericalDuration;

#[ctor::ctor]
fn test_global_init() {
  crate::initialize();
}

#[tokio::test(start_paused = true)]
async fn tracker_limits_per_window() {
  let tracker = WarnTracker::default();
  assert!(tracker.should_warn(1.seconds()));
  assert!(!tracker.should_warn(1.seconds()));

  tokio::time::sleep(std::time::Duration::from_millis(500)).await;
  assert!(!tracker.should_warn(1.seconds()));

  tokio::time::sleep(std::time::Duration::from_millis(501)).await;
  assert!(tracker.should_warn(1.seconds()));
}

#[tokio::test(start_paused = true)]
async fn macro_call_sites_are_independent() {
  // Both log at warn level since they are different call sites.
  warn_every!(1.seconds(), "{}", "upstream");
  warn_every!(1.seconds(), "downstream {}", 1);

  for _ in 0 .. 3 {
    warn_every!(1.seconds(), "repeated");
  }
}
