//! Composite outcome rules.
//!
//! A composite with `R` non-excused children needs `required` of them to
//! succeed, where `required` is its `min_required_successful` or `R` when
//! unset. Excused children never count towards the quorum and never fail
//! it, but they still run: a composite only concludes once every child,
//! excused or not, is terminal.

/// Observed outcome of one child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildOutcome {
  Pending,
  Success,
  Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumStatus {
  /// Some children are still running and success is reachable.
  Pending,
  /// Every child is terminal and enough non-excused ones succeeded.
  Met,
  /// Success is no longer reachable.
  Unreachable,
}

/// Counts of non-excused children by outcome, plus the excused children
/// still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumTally {
  pub succeeded: usize,
  pub failed: usize,
  pub pending: usize,
  pub excused_pending: usize,
  pub required: usize,
}

impl QuorumTally {
  pub fn tally(
    outcomes: impl IntoIterator<Item = (ChildOutcome, bool)>,
    min_required: Option<usize>,
  ) -> Self {
    let mut tally = QuorumTally {
      succeeded: 0,
      failed: 0,
      pending: 0,
      excused_pending: 0,
      required: 0,
    };
    for (outcome, excused) in outcomes {
      if excused {
        if outcome == ChildOutcome::Pending {
          tally.excused_pending += 1;
        }
        continue;
      }
      match outcome {
        ChildOutcome::Pending => tally.pending += 1,
        ChildOutcome::Success => tally.succeeded += 1,
        ChildOutcome::Failure => tally.failed += 1,
      }
    }
    let counted = tally.succeeded + tally.failed + tally.pending;
    tally.required = min_required.unwrap_or(counted);
    tally
  }

  pub fn status(&self) -> QuorumStatus {
    if self.succeeded + self.pending < self.required {
      QuorumStatus::Unreachable
    } else if self.pending == 0 && self.excused_pending == 0 {
      QuorumStatus::Met
    } else {
      QuorumStatus::Pending
    }
  }
}
