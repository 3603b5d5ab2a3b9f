use std::collections::HashMap;

use time::OffsetDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

use crate::error::StoreError;
use crate::store::StatStore;

/// The four distinguished percentages, in display order.
pub const NICE_PERCENTAGES: [i64; 4] = [100, 88, 69, 0];

const LAST_ON_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]");

fn nice_label(percent: i64) -> &'static str {
    match percent {
        100 => "💯 100% GAY 👨‍❤️‍💋‍👨",
        88 => "🐉 88% Huat Gay 🍀",
        69 => "☯️ 69% Gay 👯",
        _ => "🙅‍♂️ 0% Gay 🚫",
    }
}

fn leaderboard_label(percent: i64) -> &'static str {
    match percent {
        100 => "💯The Great Gays 👨‍❤️‍💋‍👨100%",
        88 => "🐉 88% Huat Gays 🍀",
        69 => "☯️ 69 Gays 👯",
        _ => "🙅‍♂️ 0% Gays 🚫",
    }
}

fn format_last_on(ts: i64) -> String {
    OffsetDateTime::from_unix_timestamp(ts)
        .ok()
        .and_then(|dt| dt.format(&LAST_ON_FORMAT).ok())
        .unwrap_or_else(|| ts.to_string())
}

/// One line per percentage 0→100, full range, zero counts included.
pub async fn personal_histogram(
    store: &StatStore,
    chat_id: &str,
    user_id: &str,
) -> Result<String, StoreError> {
    let rows = store.percent_counts(chat_id, user_id).await?;
    if rows.is_empty() {
        return Ok("No stats yet!".to_owned());
    }

    let mut counts = [0i64; 101];
    for (percent, count) in rows {
        if (0..=100).contains(&percent) {
            counts[percent as usize] = count;
        }
    }

    let lines: Vec<String> = (0..=100)
        .map(|p| format!("{p}% Gay: {} times", counts[p]))
        .collect();
    Ok(lines.join("\n"))
}

/// Count and most recent occurrence for each nice percentage the user has
/// hit, high to low, zero-count values omitted.
pub async fn personal_nice_summary(
    store: &StatStore,
    chat_id: &str,
    user_id: &str,
) -> Result<String, StoreError> {
    let rows = store
        .percent_counts_in(chat_id, user_id, &NICE_PERCENTAGES)
        .await?;
    let by_percent: HashMap<i64, (i64, i64)> = rows
        .into_iter()
        .map(|(percent, count, latest)| (percent, (count, latest)))
        .collect();

    let mut out = Vec::new();
    for percent in NICE_PERCENTAGES {
        if let Some(&(count, latest)) = by_percent.get(&percent) {
            out.push(format!(
                "{}\n→ {count} times (last on {})",
                nice_label(percent),
                format_last_on(latest)
            ));
        }
    }

    if out.is_empty() {
        return Ok("No nice stats yet!".to_owned());
    }
    Ok(out.join("\n\n"))
}

/// Group leaderboard over the nice percentages: one block per percentage in
/// display order, users by descending count, empty blocks omitted.
pub async fn leaderboard(store: &StatStore, chat_id: &str) -> Result<String, StoreError> {
    let rows = store.group_counts_in(chat_id, &NICE_PERCENTAGES).await?;
    let names = store.display_names(chat_id).await?;

    let mut by_percent: HashMap<i64, Vec<(String, i64)>> = HashMap::new();
    for (percent, user_id, count) in rows {
        by_percent.entry(percent).or_default().push((user_id, count));
    }

    let mut out: Vec<String> = Vec::new();
    for percent in NICE_PERCENTAGES {
        let Some(mut users) = by_percent.remove(&percent) else {
            continue;
        };
        users.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        out.push(leaderboard_label(percent).to_owned());
        for (user_id, count) in users {
            let handle = names
                .get(&user_id)
                .map(|(username, name)| {
                    if !username.is_empty() {
                        username.as_str()
                    } else if !name.is_empty() {
                        name.as_str()
                    } else {
                        "Unknown"
                    }
                })
                .unwrap_or("Unknown");
            out.push(format!("@{handle} x{count}"));
        }
        out.push(String::new());
    }

    if out.is_empty() {
        return Ok(
            "No leaderboard yet! Use @HowGayBot to start contributing your stats.".to_owned(),
        );
    }
    Ok(out.join("\n"))
}

/// Converts a read result into the user-facing text, logging the detail
/// server-side. `what` names the view for the generic error message, e.g.
/// "stats" → "Error retrieving stats.".
pub fn render(result: Result<String, StoreError>, what: &str) -> String {
    match result {
        Ok(text) => text,
        Err(StoreError::ChatNotFound(chat_id)) => {
            tracing::error!("chat {chat_id} does not exist");
            "Chat not found.".to_owned()
        }
        Err(err) => {
            tracing::error!("failed to retrieve {what}: {err}");
            format!("Error retrieving {what}.")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{StatEvent, UserId};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> StatStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = StatStore::new(pool);
        store.init().await.unwrap();
        store
    }

    async fn log(store: &StatStore, message_id: i64, user: i64, username: &str, percent: u8, ts: i64) {
        store
            .log_event(
                "g",
                &StatEvent {
                    message_id,
                    user_id: UserId::Id(user),
                    username: username.to_owned(),
                    name: format!("User {user}"),
                    percentage: percent,
                    timestamp: ts,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn histogram_covers_full_range() {
        let s = store().await;
        log(&s, 1, 7, "alice", 69, 1000).await;
        log(&s, 2, 7, "alice", 69, 2000).await;
        log(&s, 3, 7, "alice", 0, 3000).await;

        let text = personal_histogram(&s, "g", "7").await.unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 101);
        assert_eq!(lines[0], "0% Gay: 1 times");
        assert_eq!(lines[69], "69% Gay: 2 times");
        assert_eq!(lines[100], "100% Gay: 0 times");

        let total: i64 = lines
            .iter()
            .map(|l| l.rsplit_once(": ").unwrap().1.strip_suffix(" times").unwrap().parse::<i64>().unwrap())
            .sum();
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn histogram_without_events() {
        let s = store().await;
        s.ensure_chat("g").await.unwrap();
        assert_eq!(personal_histogram(&s, "g", "7").await.unwrap(), "No stats yet!");
    }

    #[tokio::test]
    async fn nice_summary_formats_verbatim() {
        let s = store().await;
        log(&s, 1, 7, "alice", 69, 1_700_000_000).await;
        log(&s, 2, 7, "alice", 69, 1_700_000_120).await;
        log(&s, 3, 7, "alice", 100, 1_700_000_240).await;
        log(&s, 4, 7, "alice", 42, 1_700_000_360).await;

        let text = personal_nice_summary(&s, "g", "7").await.unwrap();
        assert_eq!(
            text,
            "💯 100% GAY 👨‍❤️‍💋‍👨\n→ 1 times (last on 2023-11-14 22:17)\n\n\
             ☯️ 69% Gay 👯\n→ 2 times (last on 2023-11-14 22:15)"
        );
    }

    #[tokio::test]
    async fn nice_summary_without_nice_events() {
        let s = store().await;
        log(&s, 1, 7, "alice", 42, 1000).await;
        assert_eq!(
            personal_nice_summary(&s, "g", "7").await.unwrap(),
            "No nice stats yet!"
        );
    }

    #[tokio::test]
    async fn leaderboard_orders_blocks_and_users() {
        let s = store().await;
        // alice: 69 twice; bob: 69 once, 100 once; carol: no username.
        log(&s, 1, 1, "alice", 69, 1000).await;
        log(&s, 2, 1, "alice", 69, 2000).await;
        log(&s, 3, 2, "bob", 69, 3000).await;
        log(&s, 4, 2, "bob", 100, 4000).await;
        log(&s, 5, 3, "", 0, 5000).await;

        let text = leaderboard(&s, "g").await.unwrap();
        assert_eq!(
            text,
            "💯The Great Gays 👨‍❤️‍💋‍👨100%\n@bob x1\n\n\
             ☯️ 69 Gays 👯\n@alice x2\n@bob x1\n\n\
             🙅‍♂️ 0% Gays 🚫\n@User 3 x1\n"
        );
    }

    #[tokio::test]
    async fn leaderboard_without_nice_events_prompts() {
        let s = store().await;
        log(&s, 1, 1, "alice", 42, 1000).await;
        assert_eq!(
            leaderboard(&s, "g").await.unwrap(),
            "No leaderboard yet! Use @HowGayBot to start contributing your stats."
        );
    }

    #[tokio::test]
    async fn render_distinguishes_error_kinds() {
        let s = store().await;
        // Uninitialized chat: specific message.
        let out = render(personal_histogram(&s, "missing", "7").await, "stats");
        assert_eq!(out, "Chat not found.");

        assert_eq!(
            render(Err(StoreError::ChatNotFound("g".into())), "leaderboard"),
            "Chat not found."
        );
        assert_eq!(
            render(Err(StoreError::Unavailable(sqlx::Error::PoolClosed)), "nice stats"),
            "Error retrieving nice stats."
        );
        assert_eq!(render(Ok("hi".into()), "stats"), "hi");
    }
}
