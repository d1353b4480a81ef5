//! Per-CPU group activation state machine (spec §4.5.3, §4.5.4).
//!
//! Grounded on `examples/Thaumy-perf-event-open/src/count/group.rs`'s
//! leader/sibling shape (`CounterGroup::from(leader).add(event, opts)`,
//! `PERF_IOC_FLAG_GROUP` enable/disable) — reworked here into the typed
//! `Result<fd, PerfOpenError>` + table-driven exclude-bit ladder that spec
//! §9's REDESIGN FLAGS calls for, replacing that crate's (and the original
//! agent's) goto-style unwind.

use std::os::fd::RawFd;
use std::time::Duration;

use memmap2::MmapRaw;

use crate::error::PerfOpenError;
use crate::perf::sys::{self, PerfEventAttr};
use crate::session::PerfEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuState {
    Offline,
    Armed,
    Enabled,
}

/// Exclude-bit triples tried in order: `(exclude_kernel, exclude_hv,
/// exclude_idle)`. Matches spec §4.5.4 exactly, prepending the
/// kernel-inclusive patterns only when kernel profiling is allowed.
pub fn exclude_bit_ladder(allow_kernel: bool) -> Vec<(bool, bool, bool)> {
    let mut ladder = Vec::new();
    if allow_kernel {
        ladder.push((false, false, false));
        ladder.push((false, true, false));
    }
    ladder.push((true, true, true));
    ladder.push((true, true, false));
    ladder.push((true, false, true));
    ladder.push((true, false, false));
    ladder
}

/// Opens one event, retrying down the exclude-bit ladder on
/// EACCES/EPERM/ENOTSUP. Any other error is terminal for this event.
pub fn open_with_fallback(
    mut attr: PerfEventAttr,
    pid: libc::pid_t,
    cpu: libc::c_int,
    group_fd: RawFd,
    allow_kernel: bool,
) -> Result<RawFd, PerfOpenError> {
    let mut last_err = PerfOpenError::Other(0);
    for (exclude_kernel, exclude_hv, exclude_idle) in exclude_bit_ladder(allow_kernel) {
        attr.set_flag(sys::attr_flag::EXCLUDE_KERNEL, exclude_kernel);
        attr.set_flag(sys::attr_flag::EXCLUDE_HV, exclude_hv);
        attr.set_flag(sys::attr_flag::EXCLUDE_IDLE, exclude_idle);
        match sys::perf_event_open(&attr, pid, cpu, group_fd, sys::PERF_FLAG_FD_CLOEXEC) {
            Ok(fd) => return Ok(fd),
            Err(e) => {
                let classified = PerfOpenError::from_errno(e.raw_os_error().unwrap_or(0));
                if !classified.is_permission() {
                    return Err(classified);
                }
                last_err = classified;
            }
        }
    }
    Err(last_err)
}

/// A group leader's mmap'd kernel ring. Data region is
/// `(1 + 2^mmap_size_pages) * page_size` (spec §4.5.4).
pub struct GroupMapping {
    pub leader_fd: RawFd,
    pub member_fds: Vec<RawFd>,
    pub mmap: MmapRaw,
    pub data_size: usize,
}

impl GroupMapping {
    pub fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    pub fn data_region_len(mmap_size_pages: u32) -> usize {
        (1 + 2usize.pow(mmap_size_pages)) * Self::page_size()
    }
}

/// Activates one group on one CPU: opens the leader and every sibling with
/// the fallback ladder, mmaps the leader's ring, and redirects every
/// sibling into it via `PERF_EVENT_IOC_SET_OUTPUT`.
pub fn activate_group(
    events: &[PerfEvent],
    leader_attr: PerfEventAttr,
    sibling_attrs: &[PerfEventAttr],
    pid: libc::pid_t,
    cpu: libc::c_int,
    mmap_size_pages: u32,
    allow_kernel: bool,
) -> Result<GroupMapping, PerfOpenError> {
    let _ = events; // keys consulted by the caller when labeling samples
    let leader_fd = open_with_fallback(leader_attr, pid, cpu, -1, allow_kernel)?;

    let len = GroupMapping::data_region_len(mmap_size_pages);
    let mmap = unsafe {
        memmap2::MmapOptions::new()
            .len(len)
            .map_raw(leader_fd)
            .map_err(|_| PerfOpenError::ResourceExhausted)?
    };

    let mut member_fds = Vec::with_capacity(sibling_attrs.len());
    for attr in sibling_attrs {
        let fd = open_with_fallback(*attr, pid, cpu, leader_fd, allow_kernel)?;
        sys::set_output(fd, leader_fd).map_err(|e| {
            PerfOpenError::from_errno(e.raw_os_error().unwrap_or(0))
        })?;
        member_fds.push(fd);
    }

    Ok(GroupMapping {
        leader_fd,
        member_fds,
        mmap,
        data_size: len,
    })
}

pub fn online(mapping: &GroupMapping) -> std::io::Result<()> {
    sys::enable_group(mapping.leader_fd)
}

pub fn offline(mapping: &GroupMapping) -> std::io::Result<()> {
    sys::disable_group(mapping.leader_fd)
}

pub fn close_group(mapping: GroupMapping) {
    unsafe {
        libc::close(mapping.leader_fd);
        for fd in &mapping.member_fds {
            libc::close(*fd);
        }
    }
}

/// Legacy-id fallback (spec §4.5.7): on kernels without
/// `PERF_EVENT_IOC_ID`, obtain ids with one `read()` using
/// `PERF_FORMAT_ID | PERF_FORMAT_GROUP`. Up to ten retries to tolerate
/// pinning races.
pub fn read_group_ids(leader_fd: RawFd, member_count: usize) -> std::io::Result<Vec<u64>> {
    // Layout for PERF_FORMAT_ID|PERF_FORMAT_GROUP:
    // { u64 nr; { u64 value; u64 id; } values[nr]; }
    let max_entries = member_count + 1;
    let mut buf = vec![0u64; 1 + max_entries * 2];
    let mut attempt = 0;
    loop {
        attempt += 1;
        let n = unsafe {
            libc::read(
                leader_fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len() * std::mem::size_of::<u64>(),
            )
        };
        if n >= 0 {
            let nr = buf[0] as usize;
            let mut ids = Vec::with_capacity(nr);
            for i in 0..nr.min(max_entries) {
                ids.push(buf[1 + i * 2 + 1]);
            }
            return Ok(ids);
        }
        let err = std::io::Error::last_os_error();
        if attempt >= 10 || err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_without_kernel_profiling_has_four_entries() {
        let ladder = exclude_bit_ladder(false);
        assert_eq!(ladder.len(), 4);
        assert_eq!(ladder[0], (true, true, true));
        assert_eq!(*ladder.last().unwrap(), (true, false, false));
    }

    #[test]
    fn ladder_with_kernel_profiling_prepends_two_entries() {
        let ladder = exclude_bit_ladder(true);
        assert_eq!(ladder.len(), 6);
        assert_eq!(ladder[0], (false, false, false));
        assert_eq!(ladder[1], (false, true, false));
    }

    #[test]
    fn data_region_len_matches_formula() {
        let expected = (1 + 2usize.pow(4)) * GroupMapping::page_size();
        assert_eq!(GroupMapping::data_region_len(4), expected);
    }

    #[test]
    fn open_with_fallback_reaches_terminal_classification() {
        // config is intentionally nonsensical so the kernel rejects it with
        // something other than a permission error, exercising the
        // non-permission early-return path without requiring CAP_PERFMON.
        let attr = PerfEventAttr::new(sys::PERF_TYPE_HARDWARE, u64::MAX - 1);
        let result = open_with_fallback(attr, 0, -1, -1, false);
        assert!(result.is_err());
    }
}
