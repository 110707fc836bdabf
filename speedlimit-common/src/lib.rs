//! Types shared bit-for-bit between `speedlimit-ebpf` and the userspace
//! control plane. Layouts must match `original_source/src/include/limiter.h`
//! exactly since they are the value types of the kernel hash maps.
#![no_std]

/// Name of the cgroup-egress filter program, as compiled into the object
/// file. Used both to find the program at load time and to recognise it
/// among unrelated attached programs during enumeration/detach.
pub const PROG_NAME: &str = "limit_egress";

/// Name of the rate-limit configuration map, as pinned under the bpffs
/// namespace.
pub const CONFIG_MAP_NAME: &str = "RATE_LIMIT_CONFIG";

/// Name of the rate-limit state map, as pinned under the bpffs namespace.
pub const STATE_MAP_NAME: &str = "RATE_LIMIT_STATE";

/// Maximum number of distinct rule keys either map will hold.
pub const MAX_RULES: u32 = 4096;

/// Per-key configuration, written by the control plane and read by the
/// filter. `rate > 0` and `bucket_size >= rate` are invariants enforced by
/// the control plane, not the map itself.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub rate_bps: u64,
    pub bucket_size: u64,
}

/// Per-key token-bucket state, owned exclusively by the filter. `lock` is a
/// `bpf_spin_lock`, represented here as its underlying `u32` so the struct
/// layout matches the kernel side without depending on `aya-ebpf` from
/// userspace.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct RateLimitState {
    pub lock: u32,
    pub tokens: u64,
    pub last_update_ns: u64,
}

#[cfg(feature = "user")]
mod pod_impls {
    use super::*;

    // Safety: both types are `repr(C)`, contain only plain integer fields,
    // and have no padding-sensitive invariants the kernel doesn't already
    // rely on for the same layout.
    unsafe impl aya::Pod for RateLimitConfig {}
    unsafe impl aya::Pod for RateLimitState {}
}

/// Pure host-side model of the token-bucket algorithm FilterCore runs in
/// kernel space (`speedlimit-ebpf/src/main.rs`). Exists so the arithmetic
/// can be unit-tested without a kernel, and so the eBPF program's logic is
/// transcribed from (and kept in sync with) a single source of truth.
pub fn refill_and_admit(
    state: &mut RateLimitState,
    cfg: &RateLimitConfig,
    now_ns: u64,
    packet_len: u64,
) -> bool {
    let delta_ns = now_ns.saturating_sub(state.last_update_ns);
    let added = (delta_ns as u128 * cfg.rate_bps as u128 / 1_000_000_000u128) as u64;
    state.tokens = state.tokens.saturating_add(added).min(cfg.bucket_size);
    state.last_update_ns = now_ns;

    if state.tokens >= packet_len {
        state.tokens -= packet_len;
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(rate: u64, bucket: u64) -> RateLimitConfig {
        RateLimitConfig {
            rate_bps: rate,
            bucket_size: bucket,
        }
    }

    fn fresh_state(tokens: u64, t0: u64) -> RateLimitState {
        RateLimitState {
            lock: 0,
            tokens,
            last_update_ns: t0,
        }
    }

    #[test]
    fn admits_when_enough_tokens() {
        let c = cfg(1024, 2048);
        let mut s = fresh_state(2048, 0);
        assert!(refill_and_admit(&mut s, &c, 0, 1500));
        assert_eq!(s.tokens, 548);
    }

    #[test]
    fn drops_when_insufficient_tokens() {
        let c = cfg(1024, 2048);
        let mut s = fresh_state(100, 0);
        assert!(!refill_and_admit(&mut s, &c, 0, 1500));
        // tokens are not consumed on drop
        assert_eq!(s.tokens, 100);
    }

    #[test]
    fn refills_proportional_to_elapsed_time_capped_at_bucket() {
        let c = cfg(1_048_576, 1_048_576); // 1 MiB/s, bucket = rate
        let mut s = fresh_state(0, 0);
        // half a second elapses: should add ~half the rate, not overflow bucket
        assert!(refill_and_admit(&mut s, &c, 500_000_000, 100));
        assert_eq!(s.tokens, 1_048_576 / 2 - 100);

        // another full second: tokens must saturate at bucket_size, not exceed it
        let mut s2 = fresh_state(0, 0);
        assert!(refill_and_admit(&mut s2, &c, 10_000_000_000, 1));
        assert_eq!(s2.tokens, c.bucket_size - 1);
    }

    #[test]
    fn packet_larger_than_bucket_is_always_dropped() {
        let c = cfg(1024, 1024);
        let mut s = fresh_state(1024, 0);
        assert!(!refill_and_admit(&mut s, &c, 0, 2000));
    }

    #[test]
    fn monotonicity_tokens_never_exceed_bucket() {
        let c = cfg(500, 1000);
        let mut s = fresh_state(1000, 0);
        let mut t = 0u64;
        for _ in 0..100 {
            t += 10_000_000; // 10ms steps
            let _ = refill_and_admit(&mut s, &c, t, 0);
            assert!(s.tokens <= c.bucket_size);
        }
    }
}
