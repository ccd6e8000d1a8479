//! Derived session status.
//!
//! Status is a pure function of stored state and the clock; computing it
//! never requires a network call. Every `(kernel_state, activity, recency,
//! quota)` combination is covered explicitly so nothing falls through to
//! `Unknown` silently.

use cgpu_protocol::{KernelState, Session, SessionStatus};

/// How long a `disconnected` session stays undecided before it is
/// considered stale.
pub const STALE_GRACE_SECS: u64 = 300;

/// Whether the session's backing runtime is presumed unreachable, judged
/// from stored state alone.
pub fn is_stale(session: &Session, now: u64) -> bool {
    if matches!(
        session.kernel_state,
        KernelState::Dead | KernelState::InitFailed
    ) {
        return true;
    }
    if let Some(expires_at) = session.runtime.expires_at {
        if now >= expires_at {
            return true;
        }
    }
    session.kernel_state == KernelState::Disconnected
        && now.saturating_sub(session.last_used_at) > STALE_GRACE_SECS
}

/// Classify a session's display status from its stored record.
pub fn compute_status(session: &Session, now: u64) -> SessionStatus {
    if is_stale(session, now) {
        return SessionStatus::Stale;
    }
    match session.kernel_state {
        KernelState::Idle | KernelState::Busy | KernelState::Starting => {
            if session.is_active {
                SessionStatus::Active
            } else {
                SessionStatus::Connected
            }
        }
        // Within the grace window reachability is genuinely undecided.
        KernelState::Disconnected | KernelState::Unknown => SessionStatus::Unknown,
        // Covered by the staleness check above.
        KernelState::Dead | KernelState::InitFailed => SessionStatus::Stale,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgpu_protocol::{AcceleratorVariant, RuntimeInfo};

    const NOW: u64 = 1_700_000_000;

    fn session(kernel_state: KernelState) -> Session {
        Session {
            id: "s-1".into(),
            label: "s".into(),
            variant: AcceleratorVariant::Gpu,
            runtime: RuntimeInfo {
                accelerator: "T4".into(),
                endpoint: "wss://runtime.test/kernel".into(),
                expires_at: None,
            },
            kernel_state,
            is_active: false,
            created_at: NOW - 100,
            last_used_at: NOW - 10,
        }
    }

    #[test]
    fn live_kernel_states_are_connected() {
        for state in [KernelState::Idle, KernelState::Busy, KernelState::Starting] {
            assert_eq!(compute_status(&session(state), NOW), SessionStatus::Connected);
        }
    }

    #[test]
    fn active_flag_promotes_connected_to_active() {
        let mut s = session(KernelState::Idle);
        s.is_active = true;
        assert_eq!(compute_status(&s, NOW), SessionStatus::Active);
    }

    #[test]
    fn dead_and_init_failed_are_immediately_stale() {
        for state in [KernelState::Dead, KernelState::InitFailed] {
            assert_eq!(compute_status(&session(state), NOW), SessionStatus::Stale);
        }
    }

    #[test]
    fn disconnected_is_undecided_within_grace() {
        let s = session(KernelState::Disconnected);
        assert_eq!(compute_status(&s, NOW), SessionStatus::Unknown);
        assert!(!is_stale(&s, NOW));
    }

    #[test]
    fn disconnected_goes_stale_past_grace() {
        let mut s = session(KernelState::Disconnected);
        s.last_used_at = NOW - STALE_GRACE_SECS - 1;
        assert_eq!(compute_status(&s, NOW), SessionStatus::Stale);
    }

    #[test]
    fn grace_boundary_is_exclusive() {
        let mut s = session(KernelState::Disconnected);
        s.last_used_at = NOW - STALE_GRACE_SECS;
        assert_eq!(compute_status(&s, NOW), SessionStatus::Unknown);
    }

    #[test]
    fn expired_quota_makes_any_state_stale() {
        let mut s = session(KernelState::Idle);
        s.is_active = true;
        s.runtime.expires_at = Some(NOW - 1);
        assert_eq!(compute_status(&s, NOW), SessionStatus::Stale);
    }

    #[test]
    fn unknown_kernel_state_is_unknown() {
        assert_eq!(
            compute_status(&session(KernelState::Unknown), NOW),
            SessionStatus::Unknown
        );
    }

    #[test]
    fn recovered_kernel_leaves_staleness_behind() {
        // A session that failed during init reads stale...
        let mut s = session(KernelState::InitFailed);
        assert_eq!(compute_status(&s, NOW), SessionStatus::Stale);
        // ...until a successful reconnect refreshes its stored state.
        s.kernel_state = KernelState::Idle;
        assert_eq!(compute_status(&s, NOW), SessionStatus::Connected);
    }
}
