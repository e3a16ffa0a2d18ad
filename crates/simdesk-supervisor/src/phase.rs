use serde::{Deserialize, Serialize};

/// Startup/shutdown progression of the supervised worker, one run per
/// application lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SupervisorPhase {
    #[default]
    NotStarted,
    EnvironmentChecking,
    EnvironmentInstalling,
    EnvironmentUpdating,
    Spawning,
    AwaitingLiveness,
    Alive,
    Terminating,
    Terminated,
    Failed,
}

impl SupervisorPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::SupervisorPhase;

    #[test]
    fn default_phase_is_not_started() {
        assert_eq!(SupervisorPhase::default(), SupervisorPhase::NotStarted);
    }

    #[test]
    fn only_terminated_and_failed_are_terminal() {
        let terminal = [SupervisorPhase::Terminated, SupervisorPhase::Failed];
        let active = [
            SupervisorPhase::NotStarted,
            SupervisorPhase::EnvironmentChecking,
            SupervisorPhase::EnvironmentInstalling,
            SupervisorPhase::EnvironmentUpdating,
            SupervisorPhase::Spawning,
            SupervisorPhase::AwaitingLiveness,
            SupervisorPhase::Alive,
            SupervisorPhase::Terminating,
        ];

        for phase in terminal {
            assert!(phase.is_terminal(), "{phase:?}");
        }
        for phase in active {
            assert!(!phase.is_terminal(), "{phase:?}");
        }
    }
}
