//! Thin wrappers around the handful of raw `bpf(2)` syscall commands the
//! control plane needs that `aya`'s safe API has no room for: querying which
//! programs are attached to a cgroup we don't hold an owned link/fd for, and
//! detaching one of them by id. Mirrors
//! `original_source/src/limiter/bpf.c`'s `detach_limit_egress` (itself a
//! thin wrapper around libbpf's `bpf_prog_query`/`bpf_prog_get_fd_by_id`/
//! `bpf_prog_detach2`) at the syscall layer `aya-obj` itself is built on.
use std::io;
use std::mem;
use std::os::unix::io::RawFd;

const BPF_PROG_DETACH: u64 = 9;
const BPF_PROG_GET_FD_BY_ID: u64 = 13;
const BPF_PROG_QUERY: u64 = 16;

/// `enum bpf_attach_type::BPF_CGROUP_INET_EGRESS`, the hook `CgroupSkb`
/// programs in this system attach to — stable UAPI value, independent of
/// whatever `aya::programs::CgroupSkbAttachType` resolves to internally.
const BPF_CGROUP_INET_EGRESS: u32 = 1;

/// Max number of attached program ids `prog_query` will report per cgroup,
/// matching the fixed-size buffer `detach_limit_egress` uses.
const MAX_QUERIED_PROGS: usize = 256;

#[repr(C)]
struct ProgQueryAttr {
    target_fd: u32,
    attach_type: u32,
    query_flags: u32,
    attach_flags: u32,
    prog_ids: u64,
    prog_cnt: u32,
}

#[repr(C)]
struct ProgGetFdByIdAttr {
    prog_id: u32,
    next_id: u32,
    open_flags: u32,
}

#[repr(C)]
struct ProgDetachAttr {
    target_fd: u32,
    attach_bpf_fd: u32,
    attach_type: u32,
    attach_flags: u32,
    replace_bpf_fd: u32,
}

fn bpf_syscall<T>(cmd: u64, attr: &mut T) -> io::Result<i64> {
    // Safety: `attr` is a `repr(C)` struct matching the layout the kernel
    // expects for this specific `cmd`'s anonymous `union bpf_attr` member;
    // its size is passed alongside the pointer so the kernel never reads
    // past it.
    let ret = unsafe { libc::syscall(libc::SYS_bpf, cmd, attr as *mut T as u64, mem::size_of::<T>() as u32) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Program ids currently attached to `cgroup_fd`'s `BPF_CGROUP_INET_EGRESS`
/// hook, regardless of which process attached them or in which mode.
pub(crate) fn prog_query_egress(cgroup_fd: RawFd) -> io::Result<Vec<u32>> {
    let mut ids = [0u32; MAX_QUERIED_PROGS];
    let mut attr = ProgQueryAttr {
        target_fd: cgroup_fd as u32,
        attach_type: BPF_CGROUP_INET_EGRESS,
        query_flags: 0,
        attach_flags: 0,
        prog_ids: ids.as_mut_ptr() as u64,
        prog_cnt: ids.len() as u32,
    };
    bpf_syscall(BPF_PROG_QUERY, &mut attr)?;
    let count = (attr.prog_cnt as usize).min(ids.len());
    Ok(ids[..count].to_vec())
}

/// Opens an fd for an already-loaded program by its kernel id. Caller owns
/// the returned fd and must close it.
pub(crate) fn prog_get_fd_by_id(id: u32) -> io::Result<RawFd> {
    let mut attr = ProgGetFdByIdAttr { prog_id: id, next_id: 0, open_flags: 0 };
    let fd = bpf_syscall(BPF_PROG_GET_FD_BY_ID, &mut attr)?;
    Ok(fd as RawFd)
}

/// `BPF_PROG_DETACH`: detaches `prog_fd` from `cgroup_fd`'s egress hook.
/// This is the legacy-attach counterpart to dropping a pinned link — needed
/// because a direct-attach program has no link object for us to close.
pub(crate) fn prog_detach_egress(prog_fd: RawFd, cgroup_fd: RawFd) -> io::Result<()> {
    let mut attr = ProgDetachAttr {
        target_fd: cgroup_fd as u32,
        attach_bpf_fd: prog_fd as u32,
        attach_type: BPF_CGROUP_INET_EGRESS,
        attach_flags: 0,
        replace_bpf_fd: 0,
    };
    bpf_syscall(BPF_PROG_DETACH, &mut attr)?;
    Ok(())
}

pub(crate) fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}
