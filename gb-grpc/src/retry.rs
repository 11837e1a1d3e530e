// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use gb_grpc_codec::code::Code;
use time::Duration;
use time::ext::NumericalDuration;

// Request frames are kept for replay until the call commits. Past this many bytes the call commits
// early and later failures are final.
pub const MAX_REPLAY_BUFFER_BYTES: usize = 256 * 1024;

//
// RetryPolicy
//

// Retry policy for downstream calls. A call is only retried before it commits, which happens when
// the downstream sends response headers or the replay buffer overflows.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
  // Total attempts including the first one.
  pub max_attempts: u32,
  pub initial_backoff: Duration,
  pub max_backoff: Duration,
  pub backoff_multiplier: f64,
  pub retryable_codes: Vec<Code>,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      initial_backoff: 100.milliseconds(),
      max_backoff: 1.seconds(),
      backoff_multiplier: 2.0,
      retryable_codes: vec![Code::ResourceExhausted, Code::Unavailable],
    }
  }
}

impl RetryPolicy {
  #[must_use]
  pub fn is_retryable(&self, code: Code) -> bool {
    self.retryable_codes.contains(&code)
  }

  // Backoff for the waits between the attempts of a single call. Bounded by the attempt count,
  // not by elapsed time.
  #[must_use]
  pub fn backoff(&self) -> backoff::ExponentialBackoff {
    backoff::ExponentialBackoffBuilder::new()
      .with_initial_interval(self.initial_backoff.unsigned_abs())
      .with_max_interval(self.max_backoff.unsigned_abs())
      .with_multiplier(self.backoff_multiplier)
      .with_randomization_factor(0.2)
      .with_max_elapsed_time(None)
      .build()
  }
}
