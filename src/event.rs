use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

/// Username of the inline bot whose results we track. Messages sent via
/// anything else are ignored.
pub const COMPANION_BOT: &str = "HowGayBot";

static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"I am (\d+)% gay").unwrap());

/// Sender identity as far as we can resolve it. Telegram exports use
/// `user<digits>` strings, live updates give us the integer directly, and
/// some records (deleted accounts, channels) resolve to nothing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UserId {
    Id(i64),
    Unknown,
}

impl UserId {
    pub fn parse(raw: &str) -> Self {
        let digits = raw.strip_prefix("user").unwrap_or(raw);
        match digits.parse::<i64>() {
            Ok(id) => Self::Id(id),
            Err(_) => Self::Unknown,
        }
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// One normalized observation, ready for the rate gate and the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatEvent {
    pub message_id: i64,
    pub user_id: UserId,
    pub username: String,
    pub name: String,
    pub percentage: u8,
    /// Whole seconds since epoch.
    pub timestamp: i64,
}

/// Raw fields of a live message as handed over by the transport.
#[derive(Debug, Clone)]
pub struct LiveMessage {
    pub message_id: i64,
    pub via_bot: Option<String>,
    pub text: String,
    /// Seconds since epoch.
    pub date: i64,
    pub user_id: i64,
    pub username: Option<String>,
    pub full_name: String,
}

/// Pulls the percentage out of a "I am N% gay" message. Values over 100 are
/// never stored, so they are rejected here along with non-matching text.
pub fn extract_percentage(text: &str) -> Option<u8> {
    let caps = PERCENT_RE.captures(text)?;
    let percent: u32 = caps[1].parse().ok()?;
    if percent > 100 {
        return None;
    }
    Some(percent as u8)
}

/// Exact-match check against the companion bot, tolerating the leading `@`
/// the export format carries.
pub fn is_companion(via_bot: Option<&str>) -> bool {
    match via_bot {
        Some(v) => v.strip_prefix('@').unwrap_or(v) == COMPANION_BOT,
        None => false,
    }
}

/// Normalizes a live message, or returns `None` when it is not an
/// observation at all (wrong bot, no percentage).
pub fn normalize_live(msg: &LiveMessage) -> Option<StatEvent> {
    if !is_companion(msg.via_bot.as_deref()) {
        return None;
    }
    let percentage = extract_percentage(&msg.text)?;

    Some(StatEvent {
        message_id: msg.message_id,
        user_id: UserId::Id(msg.user_id),
        username: msg.username.clone().unwrap_or_default(),
        name: msg.full_name.clone(),
        percentage,
        timestamp: msg.date,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live(text: &str, via_bot: Option<&str>) -> LiveMessage {
        LiveMessage {
            message_id: 42,
            via_bot: via_bot.map(str::to_owned),
            text: text.to_owned(),
            date: 1_750_000_000,
            user_id: 123,
            username: Some("alice".to_owned()),
            full_name: "Alice A".to_owned(),
        }
    }

    #[test]
    fn extracts_percentage() {
        assert_eq!(extract_percentage("I am 69% gay"), Some(69));
        assert_eq!(extract_percentage("wow. I am 0% gay today"), Some(0));
        assert_eq!(extract_percentage("I am 100% gay"), Some(100));
    }

    #[test]
    fn rejects_non_matching_text() {
        assert_eq!(extract_percentage("I am gay"), None);
        assert_eq!(extract_percentage("I am maybe% gay"), None);
        assert_eq!(extract_percentage(""), None);
    }

    #[test]
    fn rejects_out_of_range_percentage() {
        assert_eq!(extract_percentage("I am 150% gay"), None);
        assert_eq!(extract_percentage("I am 101% gay"), None);
    }

    #[test]
    fn parses_user_ids() {
        assert_eq!(UserId::parse("user12345"), UserId::Id(12345));
        assert_eq!(UserId::parse("12345"), UserId::Id(12345));
        assert_eq!(UserId::parse("channel99"), UserId::Unknown);
        assert_eq!(UserId::parse(""), UserId::Unknown);
        assert_eq!(UserId::Id(7).to_string(), "7");
        assert_eq!(UserId::Unknown.to_string(), "unknown");
    }

    #[test]
    fn companion_check_is_exact() {
        assert!(is_companion(Some("HowGayBot")));
        assert!(is_companion(Some("@HowGayBot")));
        assert!(!is_companion(Some("HowGayBot2")));
        assert!(!is_companion(Some("howgaybot")));
        assert!(!is_companion(None));
    }

    #[test]
    fn normalizes_live_message() {
        let ev = normalize_live(&live("I am 88% gay", Some("HowGayBot"))).unwrap();
        assert_eq!(ev.message_id, 42);
        assert_eq!(ev.user_id, UserId::Id(123));
        assert_eq!(ev.username, "alice");
        assert_eq!(ev.name, "Alice A");
        assert_eq!(ev.percentage, 88);
        assert_eq!(ev.timestamp, 1_750_000_000);
    }

    #[test]
    fn live_message_from_other_bot_is_dropped() {
        assert!(normalize_live(&live("I am 88% gay", Some("OtherBot"))).is_none());
        assert!(normalize_live(&live("I am 88% gay", None)).is_none());
    }

    #[test]
    fn live_message_without_username() {
        let mut msg = live("I am 1% gay", Some("HowGayBot"));
        msg.username = None;
        assert_eq!(normalize_live(&msg).unwrap().username, "");
    }
}
