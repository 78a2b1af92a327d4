//! Task lifecycle phases.

/// Lifecycle phase of a task.
///
/// Phases only move forward: `NotSubmitted → Submitted → Started → Ended`.
/// A task may also end straight from `Submitted` when the connection closes
/// before it got to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TaskPhase {
    /// Created, not yet handed to a scheduler.
    #[default]
    NotSubmitted,
    /// Queued in a scheduler.
    Submitted,
    /// Its start hook ran; it owns the connection.
    Started,
    /// Terminal.
    Ended,
}

impl TaskPhase {
    /// Whether `self → next` is a legal transition.
    pub fn can_advance_to(self, next: TaskPhase) -> bool {
        matches!(
            (self, next),
            (TaskPhase::NotSubmitted, TaskPhase::Submitted)
                | (TaskPhase::Submitted, TaskPhase::Started)
                | (TaskPhase::Submitted, TaskPhase::Ended)
                | (TaskPhase::Started, TaskPhase::Ended)
        )
    }

    /// Move to `next`. Illegal transitions are a scheduler bug.
    pub fn advance(&mut self, next: TaskPhase) {
        debug_assert!(
            self.can_advance_to(next),
            "illegal task phase transition {:?} -> {:?}",
            self,
            next
        );
        *self = next;
    }

    /// Whether the task reached its terminal phase.
    pub fn is_ended(self) -> bool {
        self == TaskPhase::Ended
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use TaskPhase::*;
        let all = [NotSubmitted, Submitted, Started, Ended];
        let legal = [
            (NotSubmitted, Submitted),
            (Submitted, Started),
            (Submitted, Ended),
            (Started, Ended),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_advance_to(to),
                    legal.contains(&(from, to)),
                    "{from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn test_ended_is_terminal() {
        for next in [
            TaskPhase::NotSubmitted,
            TaskPhase::Submitted,
            TaskPhase::Started,
            TaskPhase::Ended,
        ] {
            assert!(!TaskPhase::Ended.can_advance_to(next));
        }
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "illegal task phase transition")]
    fn test_advance_rejects_resubmission() {
        let mut phase = TaskPhase::Ended;
        phase.advance(TaskPhase::Submitted);
    }
}
