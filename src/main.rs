use anyhow::{Context, bail};
use gaystats::event::{self, COMPANION_BOT, LiveMessage};
use gaystats::{StatStore, backfill, stats};
use sqlx::sqlite::SqlitePoolOptions;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
usage: gaystats <command> [args]

  init <chat>                             create the chat record
  ingest <chat> <msg_id> <user_id> <ts> <text..>  run a live message through the gate
  mystats <chat> <user> [nice]            personal stats
  leaderboard <chat>                      group leaderboard
  backfill <chat> <export.json>           import a chat-history export
  delete <chat>                           drop all data for a chat
  dump <chat>                             raw event and user listing
  clean <in.json> <out.json>              strip an export down to bot messages
";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    // No database needed for export cleaning.
    if let ["clean", input, output] = args.as_slice() {
        let raw = std::fs::read(input).with_context(|| format!("reading {input}"))?;
        let (cleaned, kept) = backfill::clean(&raw)?;
        std::fs::write(output, serde_json::to_vec_pretty(&cleaned)?)
            .with_context(|| format!("writing {output}"))?;
        println!("Cleaned JSON saved to: {output} ({kept} messages kept)");
        return Ok(());
    }

    let url = dotenv::var("DATABASE_URL").context("DATABASE_URL is missing")?;
    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .connect(&url)
        .await
        .with_context(|| format!("connecting to {url}"))?;
    let store = StatStore::new(pool);
    store.init().await?;

    match args.as_slice() {
        ["init", chat] => {
            store.ensure_chat(chat).await?;
            println!("Chat {chat} ready.");
        }
        ["ingest", chat, msg_id, user_id, ts, text @ ..] if !text.is_empty() => {
            // Stand-in for the transport: it has already established the
            // message came via the companion bot.
            let msg = LiveMessage {
                message_id: msg_id.parse().context("bad message id")?,
                via_bot: Some(COMPANION_BOT.to_owned()),
                text: text.join(" "),
                date: ts.parse().context("bad timestamp")?,
                user_id: user_id.parse().context("bad user id")?,
                username: None,
                full_name: String::new(),
            };
            match event::normalize_live(&msg) {
                Some(ev) => {
                    let admission = store.admit_live(chat, &ev).await?;
                    println!("{admission:?}");
                }
                None => println!("Not a stat message."),
            }
        }
        ["mystats", chat, user] => {
            println!("{}", stats::render(stats::personal_histogram(&store, chat, user).await, "stats"));
        }
        ["mystats", chat, user, "nice"] => {
            println!(
                "{}",
                stats::render(stats::personal_nice_summary(&store, chat, user).await, "nice stats")
            );
        }
        ["leaderboard", chat] => {
            println!("{}", stats::render(stats::leaderboard(&store, chat).await, "leaderboard"));
        }
        ["backfill", chat, path] => {
            let raw = std::fs::read(path).with_context(|| format!("reading {path}"))?;
            let summary = backfill::import(&store, chat, &raw).await?;
            println!(
                "Backfill complete. {} messages added. {} duplicates removed.",
                summary.added, summary.skipped
            );
        }
        ["delete", chat] => {
            store.delete_chat(chat).await?;
            println!("Chat data deleted.");
        }
        ["dump", chat] => {
            for line in store.dump_events(chat).await? {
                println!("{line}");
            }
            for line in store.dump_users(chat).await? {
                println!("{line}");
            }
        }
        _ => bail!("{USAGE}"),
    }

    Ok(())
}
