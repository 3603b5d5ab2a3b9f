use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use time::PrimitiveDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

use crate::error::ImportError;
use crate::event::{self, StatEvent, UserId};
use crate::gate::BatchGate;
use crate::store::{EventRow, ProfileRow, StatStore};

const EXPORT_DATE_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");

/// Top-level shape of a Telegram chat-history export.
#[derive(Debug, Deserialize)]
pub struct ChatExport {
    pub messages: Vec<ExportMessage>,
}

/// One raw export record. Everything is optional; non-conforming records are
/// silently skipped during normalization.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ExportMessage {
    pub id: i64,
    pub via_bot: Option<String>,
    pub text: ExportText,
    pub date_unixtime: Option<UnixTime>,
    pub date: Option<String>,
    pub from_id: Option<FromId>,
    #[serde(rename = "from")]
    pub from_name: Option<String>,
}

/// Message text arrives flat or as a list of styled fragments.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ExportText {
    Plain(String),
    Fragments(Vec<TextFragment>),
}

impl Default for ExportText {
    fn default() -> Self {
        Self::Plain(String::new())
    }
}

impl ExportText {
    pub fn flatten(&self) -> String {
        match self {
            Self::Plain(text) => text.clone(),
            Self::Fragments(parts) => parts
                .iter()
                .map(|part| match part {
                    TextFragment::Styled { text } => text.as_str(),
                    TextFragment::Plain(text) => text.as_str(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TextFragment {
    Plain(String),
    Styled { text: String },
}

/// `from_id` is either a plain integer or a `user<digits>` string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum FromId {
    Int(i64),
    Str(String),
}

/// `date_unixtime` is a string of digits in real exports, but accept an
/// integer too.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum UnixTime {
    Int(i64),
    Str(String),
}

impl UnixTime {
    fn seconds(&self) -> Option<i64> {
        match self {
            Self::Int(ts) => Some(*ts),
            Self::Str(raw) => raw.parse().ok(),
        }
    }
}

impl ExportMessage {
    /// Normalizes one export record, or `None` when it is not a companion-bot
    /// observation (wrong sender, no percentage, no usable timestamp).
    pub fn normalize(&self) -> Option<StatEvent> {
        if !event::is_companion(self.via_bot.as_deref()) {
            return None;
        }
        let percentage = event::extract_percentage(&self.text.flatten())?;
        let timestamp = self.timestamp()?;

        let user_id = match &self.from_id {
            Some(FromId::Int(id)) => UserId::Id(*id),
            Some(FromId::Str(raw)) => UserId::parse(raw),
            None => UserId::Unknown,
        };

        Some(StatEvent {
            message_id: self.id,
            user_id,
            // Exports carry no usernames.
            username: String::new(),
            name: self.from_name.clone().unwrap_or_default(),
            percentage,
            timestamp,
        })
    }

    fn timestamp(&self) -> Option<i64> {
        if let Some(ts) = self.date_unixtime.as_ref().and_then(UnixTime::seconds) {
            return Some(ts);
        }
        let date = self.date.as_deref()?;
        PrimitiveDateTime::parse(date, &EXPORT_DATE_FORMAT)
            .ok()
            .map(|dt| dt.assume_utc().unix_timestamp())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub added: usize,
    pub skipped: usize,
}

/// Runs a whole export through normalization and the in-memory dedup gate,
/// then issues one bulk write with the accepted events and one profile row
/// per user. Records are assumed chronological; nothing is reordered.
///
/// Not synchronized against live traffic for the same chat; callers should
/// avoid running both at once.
pub async fn import(
    store: &StatStore,
    chat_id: &str,
    raw: &[u8],
) -> Result<ImportSummary, ImportError> {
    let export: ChatExport = serde_json::from_slice(raw)?;

    let mut gate = BatchGate::new();
    let mut events = Vec::new();
    let mut latest_profile: HashMap<String, (String, String)> = HashMap::new();
    let mut summary = ImportSummary::default();

    for message in &export.messages {
        let Some(ev) = message.normalize() else {
            continue;
        };
        let user_key = ev.user_id.to_string();
        if !gate.admit(&user_key, ev.timestamp) {
            summary.skipped += 1;
            continue;
        }
        summary.added += 1;
        latest_profile.insert(user_key.clone(), (ev.username.clone(), ev.name.clone()));
        events.push(EventRow {
            message_id: ev.message_id,
            user_id: user_key,
            percentage: ev.percentage as i64,
            timestamp: ev.timestamp,
        });
    }

    let profiles: Vec<ProfileRow> = gate
        .watermarks()
        .iter()
        .map(|(user_id, &last_update)| {
            let (username, name) = latest_profile.remove(user_id).unwrap_or_default();
            ProfileRow {
                user_id: user_id.clone(),
                username,
                name,
                last_update,
            }
        })
        .collect();

    store.bulk_log(chat_id, &events, &profiles).await?;
    tracing::info!(
        "backfill for chat {chat_id}: {} added, {} skipped",
        summary.added,
        summary.skipped
    );
    Ok(summary)
}

/// Filters an export down to the companion bot's matching messages, keeping
/// each kept record byte-for-byte. Returns the cleaned document and the
/// number of messages kept.
pub fn clean(raw: &[u8]) -> Result<(Value, usize), ImportError> {
    let doc: Value = serde_json::from_slice(raw)?;
    let Some(messages) = doc.get("messages").and_then(Value::as_array) else {
        return Err(ImportError::MissingMessages);
    };

    let kept: Vec<Value> = messages
        .iter()
        .filter(|msg| matches_companion(msg))
        .cloned()
        .collect();
    let count = kept.len();

    let name = doc
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("Filtered Chat");
    let cleaned = serde_json::json!({
        "name": name,
        "messages": kept,
    });
    Ok((cleaned, count))
}

fn matches_companion(msg: &Value) -> bool {
    if !event::is_companion(msg.get("via_bot").and_then(Value::as_str)) {
        return false;
    }
    let text = match msg.get("text") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .map(|part| match part {
                Value::String(text) => text.clone(),
                Value::Object(obj) => obj
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                other => other.to_string(),
            })
            .collect(),
        _ => return false,
    };
    event::extract_percentage(&text).is_some()
}
