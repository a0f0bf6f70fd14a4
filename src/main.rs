use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;

use mrsync::config::Config;
use mrsync::queue::{OfflineQueue, SqliteQueue};

#[derive(Parser, Debug)]
#[command(name = "mrsync")]
#[command(about = "Inspect the offline write queue of the maintenance-request store")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/mrsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show the queue location, pending writes and store settings
  Status,
  /// Inspect or edit queued writes
  Queue {
    #[command(subcommand)]
    action: QueueAction,
  },
}

#[derive(Subcommand, Debug)]
enum QueueAction {
  /// List pending writes in replay order
  List,
  /// Drop a pending write without replaying it
  Discard {
    /// Offline entry key, as printed by `queue list`
    key: String,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let _log_guard = mrsync::logging::init(&config.logging)?;

  if !config.store.durable_queue {
    return Err(eyre!(
      "store.durable_queue is disabled; queued writes only live inside the running application"
    ));
  }

  let path = config.store.queue_path()?;
  let queue = OfflineQueue::new(SqliteQueue::open(&path)?)
    .with_max_attempts(config.store.max_drain_attempts);

  match args.command {
    Command::Status => {
      println!("queue:              {}", path.display());
      println!("pending writes:     {}", queue.len()?);
      println!("remote timeout:     {} ms", config.store.remote_timeout_ms);
      println!("max drain attempts: {}", config.store.max_drain_attempts);
    }
    Command::Queue {
      action: QueueAction::List,
    } => {
      let entries = queue.entries()?;
      if entries.is_empty() {
        println!("no pending writes");
      }
      for entry in entries {
        println!(
          "{}  {}/{}  enqueued {}  attempts {}",
          entry.key,
          entry.write.collection,
          entry.write.effective_id().unwrap_or("<new>"),
          entry.write.timestamp.to_rfc3339(),
          entry.attempts
        );
      }
    }
    Command::Queue {
      action: QueueAction::Discard { key },
    } => {
      if !queue.discard(&key)? {
        return Err(eyre!("No pending write with key {}", key));
      }
      println!("discarded {}", key);
    }
  }

  Ok(())
}
