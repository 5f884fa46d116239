use thiserror::Error;

/// Observable lifecycle of an instance. Derived from disk and the process
/// table on every question; never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    NotExisting,
    Stopped,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Create,
    Delete,
    Start,
    Stop,
    Kill,
    Restart,
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} from {1:?}")]
    InvalidTransition(Transition, State),
}

impl State {
    pub fn observe(exists: bool, up: bool) -> Self {
        match (exists, up) {
            (_, true) => State::Running,
            (true, false) => State::Stopped,
            (false, false) => State::NotExisting,
        }
    }
}

impl Transition {
    /// `verify` tests gating this transition, checked in order.
    pub fn guards(&self) -> &'static [&'static str] {
        match self {
            Transition::Create => &["!exists", "!up"],
            Transition::Delete | Transition::Start => &["exists", "!up"],
            Transition::Stop | Transition::Kill | Transition::Restart => &["exists", "up"],
        }
    }

    pub fn target(&self) -> State {
        match self {
            Transition::Create | Transition::Stop | Transition::Kill => State::Stopped,
            Transition::Delete => State::NotExisting,
            Transition::Start | Transition::Restart => State::Running,
        }
    }
}

pub fn can_transition(from: State, transition: Transition) -> bool {
    matches!(
        (from, transition),
        (State::NotExisting, Transition::Create)
            | (State::Stopped, Transition::Delete)
            | (State::Stopped, Transition::Start)
            | (State::Running, Transition::Stop)
            | (State::Running, Transition::Kill)
            | (State::Running, Transition::Restart)
    )
}

pub fn check(from: State, transition: Transition) -> Result<State, TransitionError> {
    if can_transition(from, transition) {
        Ok(transition.target())
    } else {
        Err(TransitionError::InvalidTransition(transition, from))
    }
}
