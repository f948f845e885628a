//! Countdown for the open question.
//!
//! The server owns the deadline (`serverEndTime`). Between `timer_update` pushes the
//! reconciler estimates the remaining time from the local clock; right after a push it
//! trusts the pushed value, aged by the time elapsed since it arrived, until that value
//! is older than the staleness window. Past the window the estimate takes over, except
//! that a pushed value lower than the estimate keeps ageing until the estimate catches
//! up, so the display does not freeze at the pushed value. Whatever the source, the
//! displayed number of seconds never goes up within a question and never drops below
//! zero.

use crate::dto::duel::TimerSnapshot;

/// Default window during which a pushed value is preferred over the local estimate.
pub const DEFAULT_SYNC_STALENESS_MS: i64 = 1_500;

/// Where the displayed value currently comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerSource {
    /// Derived from `serverEndTime - now`.
    Estimated,
    /// Derived from the last `timer_update`.
    Authoritative {
        /// Remaining time pushed by the server, in milliseconds.
        remaining_ms: i64,
        /// Local time the push was received at.
        received_at: i64,
    },
}

/// Result of advancing the local clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Still counting down; carries the displayed seconds.
    Running(u64),
    /// The deadline passed on this tick. Reported once.
    Expired,
    /// The countdown was already stopped.
    Idle,
}

/// Countdown for a single question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerReconciler {
    question_index: usize,
    server_start_time: i64,
    server_end_time: i64,
    source: TimerSource,
    displayed_secs: u64,
    staleness_ms: i64,
    running: bool,
}

impl TimerReconciler {
    /// Start counting down towards `server_end_time`.
    pub fn start(
        question_index: usize,
        server_start_time: i64,
        server_end_time: i64,
        now: i64,
        staleness_ms: i64,
    ) -> Self {
        Self {
            question_index,
            server_start_time,
            server_end_time,
            source: TimerSource::Estimated,
            displayed_secs: ceil_secs(server_end_time - now),
            staleness_ms: staleness_ms.max(0),
            running: true,
        }
    }

    /// Round this countdown belongs to.
    pub fn question_index(&self) -> usize {
        self.question_index
    }

    /// Whether the local tick is still needed.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Seconds currently displayed.
    pub fn displayed_secs(&self) -> u64 {
        self.displayed_secs
    }

    /// Current source of the displayed value.
    pub fn source(&self) -> TimerSource {
        self.source
    }

    /// Whether a server push was received within the staleness window.
    pub fn is_synced(&self, now: i64) -> bool {
        match self.source {
            TimerSource::Authoritative { received_at, .. } => {
                now.saturating_sub(received_at) <= self.staleness_ms
            }
            TimerSource::Estimated => false,
        }
    }

    /// Advance the local clock.
    pub fn tick(&mut self, now: i64) -> Tick {
        if !self.running {
            return Tick::Idle;
        }

        if self.server_end_time - now <= 0 {
            self.running = false;
            self.displayed_secs = 0;
            return Tick::Expired;
        }

        let candidate = self.candidate_ms(now);
        self.lower_display(candidate);
        Tick::Running(self.displayed_secs)
    }

    /// Apply a `timer_update`. Pushes for another round are ignored and reported as
    /// `false`.
    pub fn apply_server_update(
        &mut self,
        question_index: usize,
        time_remaining_secs: u64,
        now: i64,
    ) -> bool {
        if question_index != self.question_index {
            return false;
        }

        let remaining_ms = i64::try_from(time_remaining_secs.saturating_mul(1_000))
            .unwrap_or(i64::MAX);
        self.source = TimerSource::Authoritative {
            remaining_ms,
            received_at: now,
        };
        self.lower_display(remaining_ms);
        true
    }

    /// Apply a `question_time_up`: display zero and stop ticking. Pushes for another
    /// round are ignored and reported as `false`.
    pub fn force_expire(&mut self, question_index: usize) -> bool {
        if question_index != self.question_index {
            return false;
        }
        self.running = false;
        self.displayed_secs = 0;
        true
    }

    /// Stop ticking, keeping the displayed value.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Milliseconds between the window opening and `now`, capped at the window length.
    pub fn time_taken_ms(&self, now: i64) -> u64 {
        let elapsed = now.min(self.server_end_time) - self.server_start_time;
        u64::try_from(elapsed).unwrap_or(0)
    }

    /// Consumer view.
    pub fn snapshot(&self, now: i64) -> TimerSnapshot {
        TimerSnapshot {
            server_start_time: self.server_start_time,
            server_end_time: self.server_end_time,
            time_left_seconds: self.displayed_secs,
            is_synced: self.is_synced(now),
        }
    }

    fn candidate_ms(&self, now: i64) -> i64 {
        let estimate = self.server_end_time - now;
        match self.source {
            TimerSource::Authoritative {
                remaining_ms,
                received_at,
            } => {
                let age = now.saturating_sub(received_at).max(0);
                let aged = remaining_ms.saturating_sub(age);
                if age <= self.staleness_ms {
                    aged
                } else {
                    aged.min(estimate)
                }
            }
            TimerSource::Estimated => estimate,
        }
    }

    fn lower_display(&mut self, remaining_ms: i64) {
        self.displayed_secs = self.displayed_secs.min(ceil_secs(remaining_ms));
    }
}

fn ceil_secs(remaining_ms: i64) -> u64 {
    let clamped = u64::try_from(remaining_ms).unwrap_or(0);
    clamped.div_ceil(1_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: i64 = 1_700_000_000_000;

    fn timer_at(now: i64) -> TimerReconciler {
        TimerReconciler::start(0, T, T + 60_000, now, DEFAULT_SYNC_STALENESS_MS)
    }

    #[test]
    fn initial_display_is_rounded_up_and_clamped() {
        assert_eq!(timer_at(T + 5_000).displayed_secs(), 55);
        assert_eq!(timer_at(T + 5_001).displayed_secs(), 55);
        assert_eq!(timer_at(T + 70_000).displayed_secs(), 0);
    }

    #[test]
    fn server_update_overrides_estimate() {
        let mut timer = timer_at(T + 5_000);
        assert_eq!(timer.tick(T + 6_000), Tick::Running(54));

        assert!(timer.apply_server_update(0, 40, T + 6_100));
        assert_eq!(timer.displayed_secs(), 40);
        assert!(timer.is_synced(T + 6_100));
        assert_eq!(timer.tick(T + 6_200), Tick::Running(40));
        assert_eq!(timer.tick(T + 7_100), Tick::Running(39));
    }

    #[test]
    fn stale_update_falls_back_to_estimate_without_going_up() {
        let mut timer = timer_at(T);
        // Pushed 62s while 60s is shown: the display stays at 60.
        assert!(timer.apply_server_update(0, 62, T + 1_000));
        assert_eq!(timer.displayed_secs(), 60);
        assert!(!timer.is_synced(T + 1_000 + DEFAULT_SYNC_STALENESS_MS + 1));

        assert_eq!(timer.tick(T + 3_000), Tick::Running(57));
        assert_eq!(timer.source(), TimerSource::Authoritative {
            remaining_ms: 62_000,
            received_at: T + 1_000
        });
        assert!(!timer.snapshot(T + 3_000).is_synced);
    }

    #[test]
    fn low_server_value_keeps_counting_after_the_window() {
        let mut timer = timer_at(T);
        assert_eq!(timer.tick(T + 10_000), Tick::Running(50));

        // Server is 20s behind the local estimate and then goes quiet.
        assert!(timer.apply_server_update(0, 30, T + 10_000));
        assert_eq!(timer.tick(T + 11_000), Tick::Running(29));
        assert_eq!(timer.tick(T + 15_000), Tick::Running(25));
        assert_eq!(timer.tick(T + 20_000), Tick::Running(20));
        assert!(!timer.is_synced(T + 20_000));

        // The estimate only takes over once it is the lower value.
        assert_eq!(timer.tick(T + 39_500), Tick::Running(1));
        assert_eq!(timer.tick(T + 40_000), Tick::Running(0));
        assert_eq!(timer.tick(T + 60_000), Tick::Expired);
    }

    #[test]
    fn updates_for_other_rounds_are_ignored() {
        let mut timer = timer_at(T);
        assert!(!timer.apply_server_update(1, 10, T + 100));
        assert_eq!(timer.displayed_secs(), 60);
        assert!(!timer.force_expire(3));
        assert!(timer.is_running());
    }

    #[test]
    fn expiry_is_reported_once() {
        let mut timer = timer_at(T + 59_950);
        assert_eq!(timer.tick(T + 59_990), Tick::Running(1));
        assert_eq!(timer.tick(T + 60_000), Tick::Expired);
        assert_eq!(timer.displayed_secs(), 0);
        assert_eq!(timer.tick(T + 60_100), Tick::Idle);
        assert_eq!(timer.time_taken_ms(T + 60_100), 60_000);
    }

    #[test]
    fn display_never_increases_nor_goes_negative() {
        let mut timer = timer_at(T + 1_000);
        let mut last = timer.displayed_secs();
        let pushes = [(3_000, 58), (9_000, 59), (12_000, 30), (20_000, 45), (40_000, 2)];
        let mut now = T + 1_000;

        while now < T + 62_000 {
            now += 100;
            if let Some((_, secs)) = pushes.iter().find(|(at, _)| T + at == now) {
                timer.apply_server_update(0, *secs, now);
            }
            timer.tick(now);
            let shown = timer.displayed_secs();
            assert!(shown <= last, "display went from {last} to {shown} at {now}");
            last = shown;
        }
        assert_eq!(last, 0);
    }

    #[test]
    fn force_expire_stops_ticking() {
        let mut timer = timer_at(T + 10_000);
        assert!(timer.force_expire(0));
        assert_eq!(timer.displayed_secs(), 0);
        assert_eq!(timer.tick(T + 11_000), Tick::Idle);
    }
}
