//! Policy gates consulted before any push display and before server-side
//! channel dispatch.
//!
//! All functions are pure. Quiet hours and rate limiting only apply to the
//! push channel; email and SMS are gated by the global toggle, the
//! category x channel matrix and the priority filter. In-app is never gated.

use std::fmt;

use chrono::{NaiveTime, Timelike};
use chrono_tz::Tz;

use crate::channels::Channel;
use crate::notification::{Category, Priority};
use crate::preferences::Preferences;
use crate::types::Timestamp;

/// Trailing window, in minutes, used for push rate limiting.
pub const RATE_LIMIT_WINDOW_MINUTES: i64 = 60;

/// Start of the rate-limit window ending at `now`.
pub fn rate_limit_window_start(now: Timestamp) -> Timestamp {
    now - chrono::Duration::minutes(RATE_LIMIT_WINDOW_MINUTES)
}

/// Why a channel was not attempted. Not an error: the channel is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    ChannelDisabled,
    CategoryNotAllowed,
    PriorityFiltered,
    QuietHours,
    RateLimited,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DenyReason::ChannelDisabled => "channel disabled",
            DenyReason::CategoryNotAllowed => "category not allowed on channel",
            DenyReason::PriorityFiltered => "priority filtered",
            DenyReason::QuietHours => "quiet hours",
            DenyReason::RateLimited => "rate limited",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Deny(DenyReason),
}

impl GateDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, GateDecision::Allow)
    }
}

fn minutes_since_midnight(t: NaiveTime) -> u32 {
    t.hour() * 60 + t.minute()
}

/// Whether `local` falls inside the user's quiet-hours window `[start, end)`.
///
/// A window with `start > end` wraps midnight (e.g. 22:00-08:00).
pub fn in_quiet_hours(prefs: &Preferences, local: NaiveTime) -> bool {
    if !prefs.quiet_hours_enabled {
        return false;
    }
    let now = minutes_since_midnight(local);
    let start = minutes_since_midnight(prefs.quiet_hours_start);
    let end = minutes_since_midnight(prefs.quiet_hours_end);

    if start <= end {
        now >= start && now < end
    } else {
        now >= start || now < end
    }
}

/// Wall-clock time for the user, using their configured timezone.
///
/// Unknown timezone names fall back to UTC.
pub fn local_time(prefs: &Preferences, now: Timestamp) -> NaiveTime {
    match prefs.timezone.parse::<Tz>() {
        Ok(tz) => now.with_timezone(&tz).time(),
        Err(_) => now.time(),
    }
}

/// True iff `recent_sent_count` push deliveries in the trailing hour have
/// reached the user's hourly cap.
pub fn is_rate_limited(prefs: &Preferences, recent_sent_count: u32) -> bool {
    recent_sent_count >= prefs.max_notifications_per_hour
}

/// Matrix lookup. A missing category or channel entry fails closed.
pub fn category_channel_allowed(prefs: &Preferences, category: Category, channel: Channel) -> bool {
    prefs
        .channel_matrix
        .get(&category)
        .and_then(|row| row.get(&channel))
        .copied()
        .unwrap_or(false)
}

pub fn priority_allowed(prefs: &Preferences, priority: Priority) -> bool {
    prefs.priority_filter.contains(&priority)
}

/// Combined gate for one delivery attempt.
///
/// `recent_sent_count` is only consulted for push.
pub fn evaluate(
    prefs: &Preferences,
    category: Category,
    priority: Priority,
    channel: Channel,
    now: Timestamp,
    recent_sent_count: u32,
) -> GateDecision {
    if channel == Channel::InApp {
        return GateDecision::Allow;
    }
    if !prefs.channel_enabled(channel) {
        return GateDecision::Deny(DenyReason::ChannelDisabled);
    }
    if !category_channel_allowed(prefs, category, channel) {
        return GateDecision::Deny(DenyReason::CategoryNotAllowed);
    }
    if !priority_allowed(prefs, priority) {
        return GateDecision::Deny(DenyReason::PriorityFiltered);
    }
    if channel == Channel::Push {
        if in_quiet_hours(prefs, local_time(prefs, now)) {
            return GateDecision::Deny(DenyReason::QuietHours);
        }
        if is_rate_limited(prefs, recent_sent_count) {
            return GateDecision::Deny(DenyReason::RateLimited);
        }
    }
    GateDecision::Allow
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn quiet(start: NaiveTime, end: NaiveTime) -> Preferences {
        let mut prefs = Preferences::defaults_for(1);
        prefs.quiet_hours_enabled = true;
        prefs.quiet_hours_start = start;
        prefs.quiet_hours_end = end;
        prefs
    }

    #[test]
    fn overnight_window_wraps_midnight() {
        let prefs = quiet(t(22, 0), t(8, 0));
        assert!(in_quiet_hours(&prefs, t(23, 30)));
        assert!(in_quiet_hours(&prefs, t(3, 0)));
        assert!(!in_quiet_hours(&prefs, t(12, 0)));
    }

    #[test]
    fn window_is_half_open() {
        let prefs = quiet(t(22, 0), t(8, 0));
        assert!(in_quiet_hours(&prefs, t(22, 0)));
        assert!(!in_quiet_hours(&prefs, t(8, 0)));
    }

    #[test]
    fn same_day_window() {
        let prefs = quiet(t(13, 0), t(14, 0));
        assert!(in_quiet_hours(&prefs, t(13, 30)));
        assert!(!in_quiet_hours(&prefs, t(14, 30)));
        assert!(!in_quiet_hours(&prefs, t(12, 59)));
    }

    #[test]
    fn disabled_quiet_hours_never_match() {
        let mut prefs = quiet(t(0, 0), t(23, 59));
        prefs.quiet_hours_enabled = false;
        assert!(!in_quiet_hours(&prefs, t(12, 0)));
    }

    #[test]
    fn local_time_uses_timezone() {
        let mut prefs = Preferences::defaults_for(1);
        prefs.timezone = "Asia/Tokyo".into();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 15, 0, 0).unwrap();
        assert_eq!(local_time(&prefs, now), t(0, 0));

        prefs.timezone = "Not/AZone".into();
        assert_eq!(local_time(&prefs, now), t(15, 0));
    }

    #[test]
    fn rate_limit_is_inclusive_of_cap() {
        let mut prefs = Preferences::defaults_for(1);
        prefs.max_notifications_per_hour = 3;
        assert!(!is_rate_limited(&prefs, 2));
        assert!(is_rate_limited(&prefs, 3));
    }

    #[test]
    fn missing_matrix_entry_fails_closed() {
        let mut prefs = Preferences::defaults_for(1);
        prefs.channel_matrix.remove(&Category::Chat);
        assert!(!category_channel_allowed(&prefs, Category::Chat, Channel::Email));
        assert!(category_channel_allowed(&prefs, Category::Task, Channel::Email));
    }

    #[test]
    fn quiet_hours_only_gate_push() {
        let mut prefs = quiet(t(0, 0), t(23, 59));
        prefs.timezone = "UTC".into();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        assert_eq!(
            evaluate(&prefs, Category::Task, Priority::High, Channel::Push, now, 0),
            GateDecision::Deny(DenyReason::QuietHours)
        );
        assert!(evaluate(&prefs, Category::Task, Priority::High, Channel::Email, now, 0).is_allowed());
    }

    #[test]
    fn rate_limit_only_gates_push() {
        let prefs = Preferences::defaults_for(1);
        let now = Utc::now();
        assert_eq!(
            evaluate(&prefs, Category::Task, Priority::Low, Channel::Push, now, 10),
            GateDecision::Deny(DenyReason::RateLimited)
        );
        assert!(evaluate(&prefs, Category::Task, Priority::Low, Channel::Email, now, 10).is_allowed());
    }

    #[test]
    fn priority_and_toggle_gate_email_and_sms() {
        let mut prefs = Preferences::defaults_for(1);
        let now = Utc::now();
        assert_eq!(
            evaluate(&prefs, Category::Task, Priority::Low, Channel::Sms, now, 0),
            GateDecision::Deny(DenyReason::ChannelDisabled)
        );

        prefs.priority_filter.remove(&Priority::Low);
        assert_eq!(
            evaluate(&prefs, Category::Task, Priority::Low, Channel::Email, now, 0),
            GateDecision::Deny(DenyReason::PriorityFiltered)
        );
    }

    #[test]
    fn in_app_is_never_gated() {
        let mut prefs = Preferences::defaults_for(1);
        prefs.priority_filter.clear();
        prefs.channel_matrix.clear();
        assert!(evaluate(&prefs, Category::Task, Priority::Low, Channel::InApp, Utc::now(), 99).is_allowed());
    }
}
