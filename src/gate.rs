use std::collections::HashMap;

/// Minimum gap between two accepted events from the same user in the same
/// chat. Absorbs the companion bot's resend behavior.
pub const COOLDOWN_SECS: i64 = 60;

/// Outcome of the live admission check. The per-user cooldown and the
/// chat-global watermark are deliberately separate guards; callers can tell
/// them apart in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    /// Within [`COOLDOWN_SECS`] of the user's last accepted event.
    Cooldown,
    /// Strictly earlier than the chat's global watermark.
    OutOfOrder,
}

/// Decides whether a candidate with timestamp `ts` passes the gate given the
/// per-user watermark and the chat-global watermark. A watermark of 0 means
/// "never updated" and does not trigger the cooldown.
pub fn check(user_last_update: i64, chat_last_update: i64, ts: i64) -> Verdict {
    if user_last_update > 0 && ts - user_last_update < COOLDOWN_SECS {
        return Verdict::Cooldown;
    }
    if ts < chat_last_update {
        return Verdict::OutOfOrder;
    }
    Verdict::Accept
}

/// In-memory per-user watermarks for one backfill pass. Records must be fed
/// chronologically; the gate does not reorder them.
#[derive(Debug, Default)]
pub struct BatchGate {
    seen: HashMap<String, i64>,
}

impl BatchGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts the candidate and advances the user's watermark, or rejects
    /// it as a near-duplicate of the previously accepted event. Unlike the
    /// live path, a watermark here is set the moment a user has any accepted
    /// event in the batch, even one at t=0.
    pub fn admit(&mut self, user_key: &str, ts: i64) -> bool {
        if let Some(&last) = self.seen.get(user_key) {
            if ts - last < COOLDOWN_SECS {
                return false;
            }
        }
        self.seen.insert(user_key.to_owned(), ts);
        true
    }

    /// Final watermark per user, for the profile rows of the bulk write.
    pub fn watermarks(&self) -> &HashMap<String, i64> {
        &self.seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_when_no_watermarks() {
        assert_eq!(check(0, 0, 100), Verdict::Accept);
    }

    #[test]
    fn cooldown_boundary() {
        // 59 seconds apart: rejected. Exactly 60: accepted.
        assert_eq!(check(1000, 0, 1059), Verdict::Cooldown);
        assert_eq!(check(1000, 0, 1060), Verdict::Accept);
        assert_eq!(check(1000, 0, 1061), Verdict::Accept);
    }

    #[test]
    fn stale_delivery_is_out_of_order() {
        assert_eq!(check(0, 2000, 1999), Verdict::OutOfOrder);
        assert_eq!(check(0, 2000, 2000), Verdict::Accept);
    }

    #[test]
    fn cooldown_wins_over_ordering() {
        // Both guards would fire; the per-user check runs first.
        assert_eq!(check(1990, 2000, 1999), Verdict::Cooldown);
    }

    #[test]
    fn batch_gate_dedups_per_user() {
        let mut gate = BatchGate::new();
        assert!(gate.admit("1", 0));
        assert!(!gate.admit("1", 30));
        assert!(gate.admit("1", 120));
        // Independent user is unaffected.
        assert!(gate.admit("2", 125));
        assert_eq!(gate.watermarks().get("1"), Some(&120));
        assert_eq!(gate.watermarks().get("2"), Some(&125));
    }

    #[test]
    fn batch_gate_watermark_at_epoch_still_counts() {
        let mut gate = BatchGate::new();
        assert!(gate.admit("1", 0));
        assert!(!gate.admit("1", 10));
        assert!(gate.admit("1", 60));
    }
}
