//! gatord: a user-space profiling daemon that captures CPU (perf_event),
//! GPU, ftrace, and vendor-socket telemetry into a length-prefixed wire
//! stream for a connected host, or into a local `.apc` capture directory.
//!
//! Module layout mirrors the component table: `ring`/`sem`/`frame`/`sender`
//! are the plumbing every source shares; `perf`, `external`, `userspace`,
//! `gpu` are the four capture sources; `annotate` is the in-band annotation
//! channel; `session`/`config`/`apc` are the data model and its on-disk/CLI
//! inputs; `child`/`supervisor` are the two process roles; `error`/
//! `metrics`/`logging` are the ambient stack.

pub mod annotate;
pub mod apc;
pub mod child;
pub mod config;
pub mod error;
pub mod external;
pub mod frame;
pub mod gpu;
pub mod logging;
pub mod metrics;
pub mod monitor;
pub mod perf;
pub mod ring;
pub mod sem;
pub mod sender;
pub mod session;
pub mod supervisor;
pub mod userspace;
pub mod varint;

/// Sets the calling thread's `comm` field via `prctl(PR_SET_NAME, ...)`.
/// Every source thread and the sender/stop/duration threads call this on
/// entry (spec §5 "All thread functions set their thread name").
pub fn set_thread_name(name: &str) {
    if let Ok(cname) = std::ffi::CString::new(name) {
        unsafe {
            libc::prctl(libc::PR_SET_NAME, cname.as_ptr());
        }
    }
}

/// Monotonic nanoseconds since an unspecified epoch, used to timestamp every
/// ring event and drive the commit-elision window (spec §3, §4.1).
pub fn monotonic_now_ns() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
}
