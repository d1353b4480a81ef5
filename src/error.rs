//! Error taxonomy (spec §7).
//!
//! `thiserror` leaf enums where a caller needs to `match` on a specific
//! failure kind (the perf_event_open fallback ladder is the main
//! consumer), `anyhow` everywhere else — the same split the teacher uses
//! (`cognitod` never builds a closed error enum; it propagates
//! `anyhow::Error` throughout). This crate adds the enum only where spec §7
//! explicitly names a closed set of recoverable outcomes.

use thiserror::Error;

/// Outcome of a single `perf_event_open` attempt, used by the exclude-bits
/// fallback ladder (spec §4.5.4, §7).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PerfOpenError {
    /// EACCES/EPERM/ENOTSUP — retry with the next exclude-bit pattern.
    #[error("permission denied for this exclude-bit pattern")]
    Permission,
    /// EMFILE/ENOMEM — resource exhaustion, fatal for the session.
    #[error("resource exhaustion opening perf event")]
    ResourceExhausted,
    /// ENODEV — CPU went offline mid-open.
    #[error("device gone (cpu offline)")]
    DeviceGone,
    /// ESRCH — watched pid died mid-open.
    #[error("no such process")]
    NoSuchProcess,
    /// EINVAL — fatal, usually a competing PMU consumer in system-wide mode.
    #[error("invalid configuration (possible competing PMU consumer)")]
    InvalidConfig,
    /// Any other errno; treated as terminal for that event.
    #[error("perf_event_open failed: errno {0}")]
    Other(i32),
}

impl PerfOpenError {
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EACCES | libc::EPERM | libc::ENOTSUP => PerfOpenError::Permission,
            libc::EMFILE | libc::ENOMEM => PerfOpenError::ResourceExhausted,
            libc::ENODEV => PerfOpenError::DeviceGone,
            libc::ESRCH => PerfOpenError::NoSuchProcess,
            libc::EINVAL => PerfOpenError::InvalidConfig,
            other => PerfOpenError::Other(other),
        }
    }

    pub fn is_permission(self) -> bool {
        matches!(self, PerfOpenError::Permission)
    }
}

/// Classification used to decide how an I/O error from any source's hot
/// path should be handled (spec §7's five-way split, minus Signals which is
/// handled directly by the signal-mask setup in `child.rs`).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    #[error("transient (EINTR/EAGAIN), retry at call site")]
    Transient,
    #[error("resource exhaustion, fatal for this session")]
    ResourceExhaustion,
    #[error("permission denied")]
    Permission,
    #[error("device gone, drop and continue")]
    DeviceGone,
    #[error("invalid configuration, fatal")]
    InvalidConfig,
    #[error("protocol violation from host, ignored")]
    ProtocolViolation,
}

impl ErrorClass {
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EINTR | libc::EAGAIN => ErrorClass::Transient,
            libc::EMFILE | libc::ENOMEM => ErrorClass::ResourceExhaustion,
            libc::EACCES | libc::EPERM => ErrorClass::Permission,
            libc::ENODEV | libc::ESRCH => ErrorClass::DeviceGone,
            libc::EINVAL => ErrorClass::InvalidConfig,
            _ => ErrorClass::InvalidConfig,
        }
    }
}

/// Exit codes documented in spec §6 "CLI surface".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Ok = 0,
    Exception = 1,
    SecondException = 2,
    SecondSignal = 3,
    Alarm = 4,
    NoSingleton = 5,
    SignalSetupFailed = 6,
    ExitOk = 7,
    CommandFailed = 8,
    ChildAfterCapture = 9,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_classification_matches_spec_table() {
        assert_eq!(PerfOpenError::from_errno(libc::EACCES), PerfOpenError::Permission);
        assert_eq!(PerfOpenError::from_errno(libc::ENODEV), PerfOpenError::DeviceGone);
        assert_eq!(PerfOpenError::from_errno(libc::ESRCH), PerfOpenError::NoSuchProcess);
        assert_eq!(PerfOpenError::from_errno(libc::EINVAL), PerfOpenError::InvalidConfig);
        assert_eq!(PerfOpenError::from_errno(libc::EMFILE), PerfOpenError::ResourceExhausted);
        assert!(matches!(PerfOpenError::from_errno(9999), PerfOpenError::Other(9999)));
    }

    #[test]
    fn permission_predicate() {
        assert!(PerfOpenError::Permission.is_permission());
        assert!(!PerfOpenError::DeviceGone.is_permission());
    }
}
