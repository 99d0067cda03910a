/// Dev fee cycling
///
/// Each session alternates between a user phase and a short operator phase.
/// The schedule is a pure function of elapsed time; the scheduler only
/// remembers when it started and which phase it last reported, so callers
/// drive it with whatever clock they run on (tokio's, paused in tests).
///
/// A flip does not touch any socket. The session reacts to the returned
/// phase by re-logging in upstream with the newly active identity.

use std::time::Duration;
use tokio::time::Instant;

/// Wallet + worker pair sent in a login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub login: String,
    pub pass: String,
}

impl Identity {
    pub fn new(login: impl Into<String>, pass: impl Into<String>) -> Self {
        Self { login: login.into(), pass: pass.into() }
    }

    /// Wallet prefix for logs.
    pub fn short(&self) -> &str {
        let end = self
            .login
            .char_indices()
            .nth(20)
            .map(|(i, _)| i)
            .unwrap_or(self.login.len());
        &self.login[..end]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeePhase {
    User,
    Fee,
}

impl std::fmt::Display for FeePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeePhase::User => write!(f, "user"),
            FeePhase::Fee => write!(f, "fee"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSchedule {
    user: Duration,
    fee: Duration,
}

impl FeeSchedule {
    pub fn new(user: Duration, fee: Duration) -> Self {
        Self { user, fee }
    }

    pub fn cycle(&self) -> Duration {
        self.user + self.fee
    }

    /// Phase at `elapsed` since the schedule started. User first, then fee.
    pub fn phase_at(&self, elapsed: Duration) -> FeePhase {
        let cycle = self.cycle().as_nanos();
        if cycle == 0 || self.fee.is_zero() {
            return FeePhase::User;
        }
        let offset = elapsed.as_nanos() % cycle;
        if offset < self.user.as_nanos() {
            FeePhase::User
        } else {
            FeePhase::Fee
        }
    }

    /// Time from `elapsed` until the phase next changes.
    pub fn until_next_flip(&self, elapsed: Duration) -> Duration {
        let cycle = self.cycle().as_nanos();
        if cycle == 0 {
            return Duration::MAX;
        }
        let offset = elapsed.as_nanos() % cycle;
        let user = self.user.as_nanos();
        let remaining = if offset < user { user - offset } else { cycle - offset };
        // remaining < cycle, and cycle came from a Duration
        Duration::from_nanos(remaining as u64)
    }
}

/// Per-session oscillator. Dropping it cancels it.
#[derive(Debug)]
pub struct FeeScheduler {
    schedule: FeeSchedule,
    started: Instant,
    phase: FeePhase,
}

impl FeeScheduler {
    /// Starts in the user phase at `now`.
    pub fn start(schedule: FeeSchedule, now: Instant) -> Self {
        tracing::info!("[DevFee] Mining to user wallet");
        Self { schedule, started: now, phase: FeePhase::User }
    }

    pub fn phase(&self) -> FeePhase {
        self.phase
    }

    pub fn is_fee_active(&self) -> bool {
        self.phase == FeePhase::Fee
    }

    /// Instant of the next phase flip after `now`.
    pub fn deadline(&self, now: Instant) -> Instant {
        let elapsed = now.saturating_duration_since(self.started);
        now + self.schedule.until_next_flip(elapsed)
    }

    /// Recomputes the phase at `now`. Returns the new phase if it changed.
    pub fn poll(&mut self, now: Instant) -> Option<FeePhase> {
        let phase = self.schedule.phase_at(now.saturating_duration_since(self.started));
        if phase == self.phase {
            return None;
        }
        self.phase = phase;
        match phase {
            FeePhase::Fee => tracing::info!(
                "[DevFee] 💎 Dev fee period ({}s)",
                self.schedule.fee.as_secs()
            ),
            FeePhase::User => tracing::info!("[DevFee] Mining to user wallet"),
        }
        Some(phase)
    }

    pub fn active_identity<'a>(&self, user: &'a Identity, fee: &'a Identity) -> &'a Identity {
        match self.phase {
            FeePhase::Fee => fee,
            FeePhase::User => user,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ten_second_cycle() -> FeeSchedule {
        FeeSchedule::new(Duration::from_secs(8), Duration::from_secs(2))
    }

    #[test]
    fn test_phase_boundaries() {
        let s = ten_second_cycle();
        assert_eq!(s.cycle(), Duration::from_secs(10));
        assert_eq!(s.phase_at(Duration::ZERO), FeePhase::User);
        assert_eq!(s.phase_at(Duration::from_millis(7_999)), FeePhase::User);
        assert_eq!(s.phase_at(Duration::from_secs(8)), FeePhase::Fee);
        assert_eq!(s.phase_at(Duration::from_millis(9_999)), FeePhase::Fee);
        assert_eq!(s.phase_at(Duration::from_secs(10)), FeePhase::User);
        assert_eq!(s.phase_at(Duration::from_secs(18)), FeePhase::Fee);
    }

    #[test]
    fn test_until_next_flip() {
        let s = ten_second_cycle();
        assert_eq!(s.until_next_flip(Duration::ZERO), Duration::from_secs(8));
        assert_eq!(s.until_next_flip(Duration::from_secs(3)), Duration::from_secs(5));
        assert_eq!(s.until_next_flip(Duration::from_secs(8)), Duration::from_secs(2));
        assert_eq!(s.until_next_flip(Duration::from_millis(9_500)), Duration::from_millis(500));
    }

    #[test]
    fn test_zero_fee_never_flips() {
        let s = FeeSchedule::new(Duration::from_secs(10), Duration::ZERO);
        for secs in 0..30 {
            assert_eq!(s.phase_at(Duration::from_secs(secs)), FeePhase::User);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_follows_clock() {
        let user = Identity::new("4UserWallet", "rig1");
        let fee = Identity::new("4FeeWallet", "webfee");

        let start = Instant::now();
        let mut sched = FeeScheduler::start(ten_second_cycle(), start);
        assert!(!sched.is_fee_active());
        assert_eq!(sched.deadline(start), start + Duration::from_secs(8));
        assert_eq!(sched.active_identity(&user, &fee), &user);

        tokio::time::advance(Duration::from_millis(7_999)).await;
        assert_eq!(sched.poll(Instant::now()), None);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(sched.poll(Instant::now()), Some(FeePhase::Fee));
        assert_eq!(sched.active_identity(&user, &fee), &fee);
        assert_eq!(sched.deadline(Instant::now()), start + Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(sched.poll(Instant::now()), Some(FeePhase::User));
        assert_eq!(sched.phase(), FeePhase::User);
    }

    #[test]
    fn test_identity_short() {
        let id = Identity::new("44AFFq5kSiGBoZ4NMDwYtN18obc8AemS33DBLWs3H7otXft3XjrpDtQGv7SqSsaBYBb98uNbr2VBBEt7f2wfn3RVGQBEP3A", "x");
        assert_eq!(id.short(), "44AFFq5kSiGBoZ4NMDwY");
        assert_eq!(Identity::new("abc", "x").short(), "abc");
    }
}
