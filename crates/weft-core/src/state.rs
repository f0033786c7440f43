//! Fiber lifecycle states

use core::fmt;

/// State of a fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Created or reset, context initialized, never resumed since
    Init = 0,

    /// Runnable, waiting in (or headed for) a run queue
    Ready = 1,

    /// Suspended waiting on an external wakeup (timer, fd event)
    Hold = 2,

    /// Currently executing on some thread
    Executing = 3,

    /// Entry closure returned normally
    Terminated = 4,

    /// Entry closure panicked
    Exception = 5,
}

impl FiberState {
    /// A fiber in this state may be resumed by a scheduler
    #[inline]
    pub const fn is_resumable(&self) -> bool {
        matches!(
            self,
            FiberState::Init | FiberState::Ready | FiberState::Hold
        )
    }

    /// The fiber has finished, normally or via panic
    #[inline]
    pub const fn is_done(&self) -> bool {
        matches!(self, FiberState::Terminated | FiberState::Exception)
    }

    /// The fiber may be re-armed with a new entry via `reset`
    #[inline]
    pub const fn is_resettable(&self) -> bool {
        matches!(
            self,
            FiberState::Init | FiberState::Terminated | FiberState::Exception
        )
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Ready,
            2 => FiberState::Hold,
            3 => FiberState::Executing,
            4 => FiberState::Terminated,
            _ => FiberState::Exception,
        }
    }
}

impl From<FiberState> for u8 {
    fn from(s: FiberState) -> u8 {
        s as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FiberState::Init => "INIT",
            FiberState::Ready => "READY",
            FiberState::Hold => "HOLD",
            FiberState::Executing => "EXEC",
            FiberState::Terminated => "TERM",
            FiberState::Exception => "EXCEPT",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resumable_states() {
        assert!(FiberState::Init.is_resumable());
        assert!(FiberState::Ready.is_resumable());
        assert!(FiberState::Hold.is_resumable());
        assert!(!FiberState::Executing.is_resumable());
        assert!(!FiberState::Terminated.is_resumable());
        assert!(!FiberState::Exception.is_resumable());
    }

    #[test]
    fn done_states() {
        assert!(FiberState::Terminated.is_done());
        assert!(FiberState::Exception.is_done());
        assert!(!FiberState::Hold.is_done());
    }

    #[test]
    fn resettable_states() {
        assert!(FiberState::Init.is_resettable());
        assert!(FiberState::Terminated.is_resettable());
        assert!(FiberState::Exception.is_resettable());
        assert!(!FiberState::Ready.is_resettable());
        assert!(!FiberState::Executing.is_resettable());
    }

    #[test]
    fn u8_round_trip() {
        for s in [
            FiberState::Init,
            FiberState::Ready,
            FiberState::Hold,
            FiberState::Executing,
            FiberState::Terminated,
            FiberState::Exception,
        ] {
            assert_eq!(FiberState::from(u8::from(s)), s);
        }
        // Out-of-range values decay to Exception
        assert_eq!(FiberState::from(200), FiberState::Exception);
    }
}
