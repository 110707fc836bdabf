//! In-kernel egress token-bucket filter (FilterCore).
//!
//! Mirrors `original_source/src/bpf/limiter.bpf.c` instruction for
//! instruction: two keyed hash maps (config, state), looked up by the
//! cgroup id of the packet's originating socket, with token regeneration
//! computed from the wall-clock delta since the last update under a
//! per-record spinlock.
#![no_std]
#![no_main]

use aya_ebpf::{
    helpers::{bpf_ktime_get_ns, bpf_spin_lock, bpf_spin_unlock},
    macros::{cgroup_skb, map},
    maps::HashMap,
    programs::SkBuffContext,
};
use aya_log_ebpf::debug;
use speedlimit_common::{RateLimitConfig, RateLimitState, MAX_RULES};

#[map]
static RATE_LIMIT_CONFIG: HashMap<u64, RateLimitConfig> = HashMap::with_max_entries(MAX_RULES, 0);

#[map]
static RATE_LIMIT_STATE: HashMap<u64, RateLimitState> = HashMap::with_max_entries(MAX_RULES, 0);

/// Allow verdict for `cgroup_skb/egress` programs.
const ALLOW: i32 = 1;
/// Drop verdict for `cgroup_skb/egress` programs.
const DROP: i32 = 0;

#[cgroup_skb]
pub fn limit_egress(ctx: SkBuffContext) -> i32 {
    match try_limit_egress(ctx) {
        Ok(verdict) => verdict,
        // A lookup/helper failure is not a policy decision; fail open so a
        // verifier or transient kernel error never turns into a host-wide
        // network outage.
        Err(_) => ALLOW,
    }
}

fn try_limit_egress(ctx: SkBuffContext) -> Result<i32, i64> {
    let cgid = skb_cgroup_id(&ctx);
    if cgid == 0 {
        return Ok(ALLOW);
    }

    let cfg = match unsafe { RATE_LIMIT_CONFIG.get(&cgid) } {
        Some(cfg) => *cfg,
        None => return Ok(ALLOW),
    };

    let now = unsafe { bpf_ktime_get_ns() };
    let packet_len = ctx.len() as u64;

    let state_ptr = RATE_LIMIT_STATE.get_ptr_mut(&cgid);
    let state_ptr = match state_ptr {
        Some(p) => p,
        None => {
            let init = RateLimitState {
                lock: 0,
                tokens: cfg.bucket_size,
                last_update_ns: now,
            };
            let _ = RATE_LIMIT_STATE.insert(&cgid, &init, 0);
            return Ok(ALLOW);
        }
    };

    // Safety: `state_ptr` comes from a just-checked map lookup for the
    // current CPU's invocation and is not shared outside the spinlock
    // critical section below.
    let st = unsafe { &mut *state_ptr };

    unsafe { bpf_spin_lock(&mut st.lock as *mut _) };

    // 64-bit arithmetic throughout, matching limiter.bpf.c: the BPF ISA has
    // no 128-bit divide, so the wider intermediate used by
    // `speedlimit_common::refill_and_admit` (userspace-only) isn't an
    // option here. Saturating multiply bounds the same way the original
    // does by keeping rates and deltas in a sane range for u64 overflow.
    let delta_ns = now.saturating_sub(st.last_update_ns);
    let added = delta_ns.saturating_mul(cfg.rate_bps) / 1_000_000_000u64;
    st.tokens = st.tokens.saturating_add(added).min(cfg.bucket_size);
    st.last_update_ns = now;

    let verdict = if st.tokens >= packet_len {
        st.tokens -= packet_len;
        ALLOW
    } else {
        DROP
    };

    unsafe { bpf_spin_unlock(&mut st.lock as *mut _) };

    if verdict == DROP {
        debug!(&ctx, "dropping packet for cgroup {}, len {}", cgid, packet_len);
    }

    Ok(verdict)
}

/// Reads the cgroup id associated with the packet's originating socket via
/// the kernel's dedicated `bpf_skb_cgroup_id` helper — the same quantity
/// `cgroup_id(2)` on a directory fd returns, and the same value `Keying`
/// derives from the rule directory's inode.
fn skb_cgroup_id(ctx: &SkBuffContext) -> u64 {
    unsafe { aya_ebpf::helpers::bpf_skb_cgroup_id(ctx.as_ptr() as *mut _) }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";
