use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timing record of one processor.
///
/// Stamps are only ever moved forward, so creation <= ready <= execution <=
/// completion holds even if the wall clock steps backwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorInfo {
  pub creation_time: DateTime<Utc>,
  pub ready_time: Option<DateTime<Utc>>,
  pub execution_time: Option<DateTime<Utc>>,
  pub completion_time: Option<DateTime<Utc>>,
}

impl ProcessorInfo {
  pub fn new(creation_time: DateTime<Utc>) -> Self {
    Self {
      creation_time,
      ready_time: None,
      execution_time: None,
      completion_time: None,
    }
  }

  fn latest(&self) -> DateTime<Utc> {
    self
      .completion_time
      .or(self.execution_time)
      .or(self.ready_time)
      .unwrap_or(self.creation_time)
  }

  pub fn mark_ready(&mut self, now: DateTime<Utc>) {
    if self.ready_time.is_none() {
      self.ready_time = Some(now.max(self.latest()));
    }
  }

  pub fn mark_executing(&mut self, now: DateTime<Utc>) {
    if self.ready_time.is_none() {
      self.mark_ready(now);
    }
    if self.execution_time.is_none() {
      self.execution_time = Some(now.max(self.latest()));
    }
  }

  pub fn mark_completed(&mut self, now: DateTime<Utc>) {
    if self.completion_time.is_none() {
      self.completion_time = Some(now.max(self.latest()));
    }
  }

  /// Forget execution progress so the processor can run again.
  pub fn clear_execution(&mut self) {
    self.execution_time = None;
    self.completion_time = None;
  }

  /// Minutes from creation until completion, or until `now` if still running.
  pub fn wall_clock_minutes(&self, now: DateTime<Utc>) -> f64 {
    minutes_between(self.creation_time, self.completion_time.unwrap_or(now))
  }

  /// Minutes spent executing, or 0.0 if execution never started.
  pub fn execution_minutes(&self, now: DateTime<Utc>) -> f64 {
    match self.execution_time {
      Some(start) => minutes_between(start, self.completion_time.unwrap_or(now)),
      None => 0.0,
    }
  }
}

fn minutes_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
  let millis = (end - start).num_milliseconds().max(0);
  millis as f64 / 60_000.0
}
