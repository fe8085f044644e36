// marker-bridge: per-command timeout policy
//
// Long-running marker work (marking a job, walking a sequence) gets a
// longer leash than a status toggle. SET_JOB scales with the text being
// downloaded. Everything clamps at one minute.

use std::time::Duration;

use marker_protocol::{CommandKind, MarkerCommand};

use crate::config::TimeoutsSection;

/// Hard ceiling on any single operation.
const MAX_OP_TIMEOUT_MS: u64 = 60_000;

/// Extra budget per character of a SET_JOB text.
const SET_JOB_PER_CHAR_MS: u64 = 100;

/// Computes operation deadlines from command kind and payload hints.
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    cfg: TimeoutsSection,
}

impl TimeoutPolicy {
    pub fn new(cfg: TimeoutsSection) -> Self {
        Self { cfg }
    }

    /// Deadline for one operation, measured from the moment the frame is
    /// handed to the writer.
    pub fn for_command(&self, cmd: &MarkerCommand) -> Duration {
        let base = match cmd.kind {
            CommandKind::Home | CommandKind::Reset | CommandKind::MoveAxis => {
                self.cfg.sc_complete_ms
            }
            CommandKind::SetJob | CommandKind::SetSequence => 8_000,
            CommandKind::GetJob => self.cfg.get_job_ms,
            CommandKind::StartJob => 15_000,
            CommandKind::StartSequence => 30_000,
            CommandKind::ToggleEcho => 3_000,
        };
        let scaled = if cmd.kind == CommandKind::SetJob {
            base + cmd.text_len as u64 * SET_JOB_PER_CHAR_MS
        } else {
            base
        };
        Duration::from_millis(scaled.min(MAX_OP_TIMEOUT_MS))
    }

    /// Fallback deadline for request paths with no command in hand.
    pub fn ui_default(&self) -> Duration {
        Duration::from_millis(self.cfg.ui_op_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marker_protocol::JobFields;

    fn policy() -> TimeoutPolicy {
        TimeoutPolicy::new(TimeoutsSection::default())
    }

    #[test]
    fn sequences_get_the_longest_leash() {
        let start_seq = MarkerCommand::start_sequence(1).expect("build");
        let home = MarkerCommand::home();
        assert!(policy().for_command(&start_seq) > policy().for_command(&home));
    }

    #[test]
    fn set_job_scales_with_text() {
        let short = MarkerCommand::set_job(1, &JobFields::default(), None).expect("build");
        let fields = JobFields {
            character_string: "X".repeat(40),
            ..JobFields::default()
        };
        let long = MarkerCommand::set_job(1, &fields, None).expect("build");
        let delta = policy().for_command(&long) - policy().for_command(&short);
        assert_eq!(delta, Duration::from_millis(40 * SET_JOB_PER_CHAR_MS));
    }

    #[test]
    fn everything_clamps_at_one_minute() {
        let fields = JobFields {
            character_string: "X".repeat(10_000),
            ..JobFields::default()
        };
        let cmd = MarkerCommand::set_job(1, &fields, None).expect("build");
        assert_eq!(
            policy().for_command(&cmd),
            Duration::from_millis(MAX_OP_TIMEOUT_MS)
        );
    }

    #[test]
    fn get_job_uses_configured_budget() {
        let cmd = MarkerCommand::get_job(2).expect("build");
        assert_eq!(policy().for_command(&cmd), Duration::from_millis(4_000));
    }
}
