//! Client state machine
//!
//! Every legal transition and its effect on the owning multi's
//! `active_count` is listed in [`ClientState::transition`]. Anything not
//! listed there is rejected.

use serde::{Deserialize, Serialize};

use crate::transport::PcmDirection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    /// Registered, buffers not yet allocated
    Init,
    /// Initialized, not contributing
    Idle,
    /// Transferring audio
    Running,
    /// Paused by the application, waiting for Resume
    Paused,
    /// Drain requested, remaining input still being mixed
    Draining1,
    /// Input fully mixed, waiting for the device to play out
    Draining2,
    /// Pipe or control socket closed
    Finished,
}

/// Side effects of an accepted transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ClientState,
    pub to: ClientState,
    /// Change applied to the multi's active client count
    pub active_delta: isize,
    /// Playback cursor must be re-aligned with the reported delay
    pub realign: bool,
}

impl ClientState {
    /// Whether a client in this state is counted in `active_count`.
    ///
    /// A paused playback client stays counted: its audio is still queued in
    /// the mix ahead of the read cursor.
    pub fn is_active(self, direction: PcmDirection) -> bool {
        match self {
            ClientState::Running | ClientState::Draining1 => true,
            ClientState::Paused => direction == PcmDirection::Playback,
            _ => false,
        }
    }

    /// Validate `self -> to` for a client of the given direction.
    ///
    /// Returns `None` for a transition to the current state and for any
    /// transition not in the table. Leaving `Draining1` for `Running` is
    /// accepted by callers as a no-op and also yields `None`.
    pub fn transition(self, to: ClientState, direction: PcmDirection) -> Option<Transition> {
        use ClientState::*;
        let playback = direction == PcmDirection::Playback;

        let legal = match (self, to) {
            (a, b) if a == b => false,
            (Finished, _) => false,
            (_, Finished) => true,
            (Init, Idle) => true,
            (Init, Running) => !playback,
            (Idle, Running) => true,
            (Running, Idle) => true,
            (Running, Paused) => true,
            (Paused, Running) => true,
            (Paused, Idle) => playback,
            (Running, Draining1) => playback,
            (Draining1, Draining2) => playback,
            (Draining1, Idle) | (Draining2, Idle) => playback,
            _ => false,
        };
        if !legal {
            return None;
        }

        let before = self.is_active(direction) as isize;
        let after = to.is_active(direction) as isize;
        Some(Transition {
            from: self,
            to,
            active_delta: after - before,
            realign: playback && self == Idle && to == Running,
        })
    }
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ClientState::Init => "INIT",
            ClientState::Idle => "IDLE",
            ClientState::Running => "RUNNING",
            ClientState::Paused => "PAUSED",
            ClientState::Draining1 => "DRAINING1",
            ClientState::Draining2 => "DRAINING2",
            ClientState::Finished => "FINISHED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ClientState::*;

    const ALL: [ClientState; 7] = [Init, Idle, Running, Paused, Draining1, Draining2, Finished];

    fn delta(from: ClientState, to: ClientState, direction: PcmDirection) -> Option<isize> {
        from.transition(to, direction).map(|t| t.active_delta)
    }

    #[test]
    fn test_playback_lifecycle_counts() {
        let p = PcmDirection::Playback;
        assert_eq!(delta(Init, Idle, p), Some(0));
        assert_eq!(delta(Idle, Running, p), Some(1));
        assert!(Idle.transition(Running, p).unwrap().realign);
        assert_eq!(delta(Running, Paused, p), Some(0));
        assert_eq!(delta(Paused, Running, p), Some(0));
        assert_eq!(delta(Running, Draining1, p), Some(0));
        assert_eq!(delta(Draining1, Draining2, p), Some(-1));
        assert_eq!(delta(Draining2, Idle, p), Some(0));
        assert_eq!(delta(Running, Idle, p), Some(-1));
        assert_eq!(delta(Paused, Idle, p), Some(-1));
        assert_eq!(delta(Draining1, Finished, p), Some(-1));
    }

    #[test]
    fn test_capture_lifecycle_counts() {
        let c = PcmDirection::Capture;
        assert_eq!(delta(Init, Running, c), Some(1));
        assert_eq!(delta(Running, Paused, c), Some(-1));
        assert_eq!(delta(Paused, Running, c), Some(1));
        assert_eq!(delta(Paused, Finished, c), Some(0));
        assert_eq!(delta(Running, Finished, c), Some(-1));
        assert_eq!(delta(Running, Draining1, c), None);
        assert!(!Running.transition(Idle, c).unwrap().realign);
    }

    #[test]
    fn test_repeated_and_unlisted_transitions_are_rejected() {
        for direction in [PcmDirection::Playback, PcmDirection::Capture] {
            for state in ALL {
                assert_eq!(state.transition(state, direction), None);
                if state != Finished {
                    assert_eq!(Finished.transition(state, direction), None);
                }
            }
            assert_eq!(Idle.transition(Paused, direction), None);
            assert_eq!(Draining1.transition(Running, direction), None);
            assert_eq!(Draining2.transition(Running, direction), None);
            assert_eq!(Init.transition(Paused, direction), None);
        }
    }

    #[test]
    fn test_round_trips_leave_count_balanced() {
        // any accepted path that returns to its start nets to zero
        for direction in [PcmDirection::Playback, PcmDirection::Capture] {
            let mut total = 0;
            let mut state = Init;
            let path = [Idle, Running, Paused, Running, Draining1, Draining2, Idle, Running, Idle];
            for to in path {
                if let Some(t) = state.transition(to, direction) {
                    total += t.active_delta;
                    state = to;
                }
            }
            assert_eq!(total, state.is_active(direction) as isize);
        }
    }
}
