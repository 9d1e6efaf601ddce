use std::sync::atomic::{AtomicU8, Ordering};

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum SessionState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

/// Lifecycle of a session. The only way out of `Open` is a single compare-and-set, so exactly one
///  caller gets to run the teardown.
#[derive(Debug)]
pub struct AtomicSessionState(AtomicU8);

impl AtomicSessionState {
    pub fn new() -> AtomicSessionState {
        AtomicSessionState(AtomicU8::new(SessionState::Open.into()))
    }

    pub fn get(&self) -> SessionState {
        SessionState::try_from(self.0.load(Ordering::Acquire))
            .unwrap_or(SessionState::Closed)
    }

    pub fn is_open(&self) -> bool {
        self.get() == SessionState::Open
    }

    /// Returns `true` for exactly one caller, which must then run the teardown and call
    ///  [AtomicSessionState::finish_close]
    #[must_use]
    pub fn begin_close(&self) -> bool {
        self.0.compare_exchange(SessionState::Open.into(), SessionState::Closing.into(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn finish_close(&self) {
        self.0.store(SessionState::Closed.into(), Ordering::Release);
    }
}

impl Default for AtomicSessionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use super::*;

    #[test]
    fn test_transitions() {
        let state = AtomicSessionState::new();
        assert!(state.is_open());

        assert!(state.begin_close());
        assert_eq!(state.get(), SessionState::Closing);
        assert!(!state.begin_close());

        state.finish_close();
        assert_eq!(state.get(), SessionState::Closed);
        assert!(!state.begin_close());
    }

    #[test]
    fn test_concurrent_close() {
        let state = Arc::new(AtomicSessionState::new());
        let handles = (0..8)
            .map(|_| {
                let state = state.clone();
                std::thread::spawn(move || state.begin_close())
            })
            .collect::<Vec<_>>();

        let winners = handles.into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(winners, 1);
    }
}
