use serde::Serialize;

/// Where a launch currently is.
///
/// `Idle → Acquiring → Reclaiming? → Spawning → Probing → Ready →
/// Exited | Crashed → Cleanup → Idle`. Any phase may jump straight to
/// `Cleanup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::EnumIs)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Acquiring,
    Reclaiming,
    Spawning,
    Probing,
    Ready,
    /// Service exited after readiness resolved
    Exited(i32),
    /// Service exited before it became ready
    Crashed(i32),
    Cleanup,
}

impl Phase {
    /// Whether moving from `self` to `next` is a legal step
    pub fn can_advance_to(self, next: Phase) -> bool {
        use Phase::*;
        if next == Cleanup {
            return !matches!(self, Idle | Cleanup);
        }
        matches!(
            (self, next),
            (Idle, Acquiring)
                | (Acquiring, Reclaiming)
                | (Acquiring, Spawning)
                | (Reclaiming, Spawning)
                | (Spawning, Probing)
                | (Probing, Ready)
                | (Probing, Crashed(_))
                | (Ready, Exited(_))
                | (Cleanup, Idle)
        )
    }
}
