use serde::{Deserialize, Serialize};

/// The lifecycle state of a component.
///
/// Transitions:
///   Created → Initializing → Ready → Running → Stopping → Ready
///   any non-sink state → Error
///   any state → Disposed
///   Error → Initializing (recovery re-initialize only)
///
/// `Disposed` is absolute; `Error` is a sink for normal operation and is only
/// left through the recovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Created,
    Initializing,
    Ready,
    Running,
    Stopping,
    Error,
    Disposed,
}

impl LifecycleState {
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Disposed, _) => false,
            (_, Disposed) => true,
            (Error, Initializing) => true,
            (Error, _) => false,
            (_, Error) => true,
            (Created, Initializing) => true,
            (Initializing, Ready) => true,
            (Ready, Running) => true,
            (Running, Stopping) => true,
            (Stopping, Ready) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Disposed)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleState::Created => "created",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Ready => "ready",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Error => "error",
            LifecycleState::Disposed => "disposed",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    #[test]
    fn normal_path_is_permitted() {
        assert!(Created.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Ready));
    }

    #[test]
    fn disposed_is_absolute() {
        assert!(!Disposed.can_transition_to(Created));
        assert!(!Disposed.can_transition_to(Error));
        assert!(Running.can_transition_to(Disposed));
    }

    #[test]
    fn error_only_leaves_through_reinitialize() {
        assert!(Error.can_transition_to(Initializing));
        assert!(Error.can_transition_to(Disposed));
        assert!(!Error.can_transition_to(Running));
        assert!(!Error.can_transition_to(Ready));
    }

    #[test]
    fn no_state_skipping() {
        assert!(!Created.can_transition_to(Running));
        assert!(!Initializing.can_transition_to(Running));
        assert!(!Ready.can_transition_to(Stopping));
    }
}
