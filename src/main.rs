use anyhow::Result;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "mts", version, about = "Mail Thread Sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one end-to-end mailbox sync
    Sync(SyncArgs),
    /// List persisted threads
    Threads(ThreadsArgs),
    /// Show all messages in one thread
    Thread { thread_id: String },
    /// Show document store stats
    Stats,
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// Keep running, syncing once per minute
    #[arg(long, default_value_t = false)]
    watch: bool,
}

#[derive(Debug, Args)]
struct ThreadsArgs {
    #[arg(long, default_value_t = 50)]
    limit: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use anyhow::{anyhow, Context, Result};

    use mts::config::SyncConfig;
    use mts::store::Store;
    use mts::sync::{run_sync, CancelFlag};

    use super::{Cli, Commands, SyncArgs, ThreadsArgs};

    pub async fn dispatch(cli: Cli) -> Result<()> {
        match cli.command {
            Commands::Sync(args) => handle_sync(args, cli.json).await,
            Commands::Threads(args) => handle_threads(args, cli.json).await,
            Commands::Thread { thread_id } => handle_thread(&thread_id, cli.json).await,
            Commands::Stats => handle_stats(cli.json).await,
        }
    }

    fn open_store() -> Result<Store> {
        let config = SyncConfig::from_env().context("read sync configuration")?;
        Store::open(&config.db_path)
            .with_context(|| format!("open document store at {}", config.db_path.display()))
    }

    async fn handle_sync(args: SyncArgs, json: bool) -> Result<()> {
        let config = SyncConfig::from_env().context("read sync configuration")?;

        let cancel = CancelFlag::new();
        let signal_flag = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("interrupt received, finishing current conversation");
                signal_flag.cancel();
            }
        });

        loop {
            let stats = run_sync(&config, cancel.clone()).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!(
                    "sync: +{}/{} threads, +{}/{} messages, {} images, {} failures",
                    stats.threads_created,
                    stats.threads_updated,
                    stats.messages_created,
                    stats.messages_updated,
                    stats.images_processed,
                    stats.failed,
                );
            }

            if !args.watch || cancel.is_cancelled() {
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        }
    }

    async fn handle_threads(args: ThreadsArgs, json: bool) -> Result<()> {
        let store = open_store()?;
        let threads = store.list_threads(args.limit)?;

        if json {
            println!("{}", serde_json::to_string_pretty(&threads)?);
            return Ok(());
        }

        if threads.is_empty() {
            println!("No threads synced yet.");
            return Ok(());
        }
        for thread in threads {
            println!(
                "{}  [{} msgs]  {}  (updated {})",
                thread.id, thread.message_count, thread.subject, thread.updated_at
            );
        }
        Ok(())
    }

    async fn handle_thread(thread_id: &str, json: bool) -> Result<()> {
        let store = open_store()?;
        let thread = store
            .get_thread(thread_id)?
            .ok_or_else(|| anyhow!("thread not found: {thread_id}"))?;
        let messages = store.get_messages_by_thread(thread_id)?;

        if json {
            #[derive(serde::Serialize)]
            struct ThreadDetail {
                thread: mts::store::models::Thread,
                messages: Vec<mts::store::models::MailMessage>,
            }
            println!(
                "{}",
                serde_json::to_string_pretty(&ThreadDetail { thread, messages })?
            );
            return Ok(());
        }

        println!("{}  ({} messages)", thread.subject, thread.message_count);
        println!(
            "participants: {}",
            thread
                .participants
                .iter()
                .map(|p| p.address.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        for message in messages {
            let from = message
                .from
                .as_ref()
                .map(|a| a.address.as_str())
                .unwrap_or("-");
            let quoted = if message.has_quoted {
                " [quoted history]"
            } else {
                ""
            };
            println!("{}  {}  {}{}", message.sent_at, from, message.subject, quoted);
        }
        Ok(())
    }

    async fn handle_stats(json: bool) -> Result<()> {
        let store = open_store()?;
        let stats = store.get_stats()?;

        if json {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        } else {
            println!("Threads: {}", stats.total_threads);
            println!("Messages: {}", stats.total_messages);
        }
        Ok(())
    }
}
