use crate::logs::INFO;
use crate::state::mutate_state;
use candid::Principal;
use ic_canister_log::log;
use std::marker::PhantomData;

const MAX_CONCURRENT: usize = 100;

/// A guard older than this is considered stuck and evicted.
const GUARD_TIMEOUT_NANOS: u64 = 5 * 60 * 1_000_000_000;

/// Guards a block from executing twice when called by the same user and from
/// being executed [MAX_CONCURRENT] or more times in parallel.
#[must_use]
pub struct GuardPrincipal {
    principal: Principal,
    _marker: PhantomData<GuardPrincipal>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum GuardError {
    AlreadyProcessing,
    TooManyConcurrentRequests,
}

impl GuardPrincipal {
    /// Attempts to create a new guard for the current block. Fails if there
    /// is already a pending request for the specified principal or if there
    /// are at least [MAX_CONCURRENT] pending requests.
    pub fn new(principal: Principal, operation_name: &str) -> Result<Self, GuardError> {
        mutate_state(|s| {
            let now = ic_cdk::api::time();

            // Evict guards whose operation never released (e.g. a trap
            // between awaits).
            let stale: Vec<Principal> = s
                .principal_guards
                .iter()
                .filter(|p| {
                    s.principal_guard_timestamps
                        .get(p)
                        .map(|ts| now.saturating_sub(*ts) > GUARD_TIMEOUT_NANOS)
                        .unwrap_or(true)
                })
                .copied()
                .collect();
            for p in stale {
                log!(
                    INFO,
                    "[guard] evicting stale guard for principal {} (operation {})",
                    p,
                    s.operation_names.get(&p).cloned().unwrap_or_default()
                );
                s.principal_guards.remove(&p);
                s.principal_guard_timestamps.remove(&p);
                s.operation_names.remove(&p);
            }

            if s.principal_guards.contains(&principal) {
                return Err(GuardError::AlreadyProcessing);
            }
            if s.principal_guards.len() >= MAX_CONCURRENT {
                return Err(GuardError::TooManyConcurrentRequests);
            }
            s.principal_guards.insert(principal);
            s.principal_guard_timestamps.insert(principal, now);
            s.operation_names
                .insert(principal, operation_name.to_string());
            Ok(Self {
                principal,
                _marker: PhantomData,
            })
        })
    }
}

impl Drop for GuardPrincipal {
    fn drop(&mut self) {
        mutate_state(|s| {
            s.principal_guards.remove(&self.principal);
            s.principal_guard_timestamps.remove(&self.principal);
            s.operation_names.remove(&self.principal);
        });
    }
}

/// Keeps the payout-processing timer from re-entering itself.
#[must_use]
pub struct TimerLogicGuard(());

impl TimerLogicGuard {
    pub fn new() -> Option<Self> {
        mutate_state(|s| {
            if s.is_timer_running {
                return None;
            }
            s.is_timer_running = true;
            Some(TimerLogicGuard(()))
        })
    }
}

impl Drop for TimerLogicGuard {
    fn drop(&mut self) {
        mutate_state(|s| {
            s.is_timer_running = false;
        });
    }
}

#[must_use]
pub struct FetchXrcGuard(());

impl FetchXrcGuard {
    pub fn new() -> Option<Self> {
        mutate_state(|s| {
            if s.is_fetching_rate {
                return None;
            }
            s.is_fetching_rate = true;
            Some(FetchXrcGuard(()))
        })
    }
}

impl Drop for FetchXrcGuard {
    fn drop(&mut self) {
        mutate_state(|s| {
            s.is_fetching_rate = false;
        });
    }
}
