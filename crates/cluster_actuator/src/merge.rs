use crate::types::ProvisioningState;
use crate::upstream::{DesiredSnapshot, DesiredState, RealizedSnapshot, RealizedState};

/// A convergence action the merge wants taken against the fleet. Recorded on
/// the document and surfaced as a metric; publication to Maestro is the
/// fleet layer's responsibility.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConvergenceIntent {
    Reprovision,
    Deprovision,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeOutcome {
    pub state: ProvisioningState,
    pub progress: Option<String>,
    pub intent: Option<ConvergenceIntent>,
}

/// Merge desired (Cluster-Service) and realized (Maestro) snapshots into the
/// persisted provisioning state.
///
/// Agreement yields `Ready`/`Deleted` per intent; a lagging realized state
/// yields the interim state with Maestro's progress; a contradiction is
/// resolved in favor of desired with a convergence intent.
pub fn merge(desired: Option<&DesiredSnapshot>, realized: Option<&RealizedSnapshot>) -> MergeOutcome {
    match (desired, realized) {
        // both gone: deletion is complete
        (None, None) => MergeOutcome {
            state: ProvisioningState::Deleted,
            progress: None,
            intent: None,
        },
        // realized outlives desired: deprovision
        (None, Some(realized)) => MergeOutcome {
            state: ProvisioningState::Deleting,
            progress: realized.progress.clone(),
            intent: if realized.state == RealizedState::Deleting {
                None
            } else {
                Some(ConvergenceIntent::Deprovision)
            },
        },
        (Some(desired), realized) => merge_with_desired(desired, realized),
    }
}

fn merge_with_desired(desired: &DesiredSnapshot, realized: Option<&RealizedSnapshot>) -> MergeOutcome {
    let progress = realized.and_then(|r| r.progress.clone());
    let realized_state = realized.map(|r| r.state);

    if desired.state == DesiredState::Deleting {
        return MergeOutcome {
            state: match realized_state {
                None | Some(RealizedState::Deleted) => ProvisioningState::Deleted,
                _ => ProvisioningState::Deleting,
            },
            progress,
            intent: None,
        };
    }

    match realized_state {
        // realized deleted or missing while desired present: desired wins
        None | Some(RealizedState::Deleted) | Some(RealizedState::Deleting) => MergeOutcome {
            state: interim_state(desired.state),
            progress,
            intent: Some(ConvergenceIntent::Reprovision),
        },
        Some(RealizedState::Applied) => MergeOutcome {
            state: ProvisioningState::Ready,
            progress: None,
            intent: None,
        },
        Some(RealizedState::Failed) => MergeOutcome {
            state: ProvisioningState::Failed,
            progress,
            intent: Some(ConvergenceIntent::Reprovision),
        },
        // realized lagging behind desired
        Some(RealizedState::Pending) | Some(RealizedState::Progressing) => MergeOutcome {
            state: interim_state(desired.state),
            progress,
            intent: None,
        },
    }
}

fn interim_state(desired: DesiredState) -> ProvisioningState {
    match desired {
        DesiredState::Provisioning => ProvisioningState::Provisioning,
        DesiredState::Updating | DesiredState::Ready => ProvisioningState::Updating,
        DesiredState::Deleting => ProvisioningState::Deleting,
    }
}
