//! qsnap: offline maintenance for persisted queue snapshots.
//!
//! Usage: qsnap [--dir <path> | --redb <path>] <command> [args]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;

use qsnap::settings::SettingsHandle;
use qsnap::storage::{FileStore, KeyValueStore, RedbStore};
use qsnap::store::SnapshotStore;

const USAGE: &str = "Usage: qsnap [--dir <path> | --redb <path>] <command>

Commands:
  list                  List snapshots, newest first
  show <id>             Print one snapshot as JSON
  settings              Print the current settings
  clear-autos           Delete every auto snapshot
  prune [max]           Keep only the newest [max] auto snapshots
  rename <id> <name>    Set a snapshot's name
  reset-name <id>       Go back to the generated name
  delete <id>           Delete a snapshot";

enum Backend {
    Default,
    Dir(PathBuf),
    Redb(PathBuf),
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("QSNAP_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_args(args: &[String]) -> Result<(Backend, Vec<String>)> {
    let mut backend = Backend::Default;
    let mut rest = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--dir" => {
                let path = iter.next().context("--dir needs a path")?;
                backend = Backend::Dir(PathBuf::from(path));
            }
            "--redb" => {
                let path = iter.next().context("--redb needs a path")?;
                backend = Backend::Redb(PathBuf::from(path));
            }
            _ => rest.push(arg.clone()),
        }
    }
    Ok((backend, rest))
}

fn open_backend(backend: Backend) -> Result<Arc<dyn KeyValueStore>> {
    Ok(match backend {
        Backend::Default => Arc::new(FileStore::open_default()?),
        Backend::Dir(dir) => Arc::new(FileStore::new(dir)?),
        Backend::Redb(path) => Arc::new(RedbStore::create(&path)?),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (backend, command) = parse_args(&args)?;
    let Some(cmd) = command.first() else {
        eprintln!("{USAGE}");
        std::process::exit(1);
    };

    let backend = open_backend(backend)?;
    let settings = SettingsHandle::load(backend.clone()).await;
    let store = SnapshotStore::new(backend);

    match (cmd.as_str(), &command[1..]) {
        ("list", []) => cmd_list(&store, &settings).await,
        ("show", [id]) => cmd_show(&store, id).await,
        ("settings", []) => cmd_settings(&settings),
        ("clear-autos", []) => {
            let removed = store.clear_autos().await?;
            println!("Removed {removed} auto snapshots");
            Ok(())
        }
        ("prune", rest) if rest.len() <= 1 => cmd_prune(&store, &settings, rest.first()).await,
        ("rename", [id, name @ ..]) if !name.is_empty() => {
            cmd_rename(&store, id, Some(name.join(" "))).await
        }
        ("reset-name", [id]) => cmd_rename(&store, id, None).await,
        ("delete", [id]) => cmd_delete(&store, &settings, id).await,
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    }
}

async fn cmd_list(store: &SnapshotStore, settings: &SettingsHandle) -> Result<()> {
    let synced_id = settings.get().synced_snapshot_id;
    let snapshots = store.load().await;
    if snapshots.is_empty() {
        println!("No snapshots");
        return Ok(());
    }
    for snap in snapshots {
        let marker = if synced_id.as_deref() == Some(snap.id.as_str()) {
            "*"
        } else {
            " "
        };
        println!(
            "{marker} {:<22} {:<7} {:>5} items  {}",
            snap.id,
            snap.kind.as_str(),
            snap.items.len(),
            snap.display_name()
        );
    }
    Ok(())
}

async fn cmd_show(store: &SnapshotStore, id: &str) -> Result<()> {
    let Some(snap) = store.find(id).await else {
        bail!("Snapshot not found: {id}");
    };
    println!("{}", serde_json::to_string_pretty(&snap)?);
    Ok(())
}

fn cmd_settings(settings: &SettingsHandle) -> Result<()> {
    print!("{}", settings.get().to_toml()?);
    Ok(())
}

async fn cmd_prune(
    store: &SnapshotStore,
    settings: &SettingsHandle,
    max: Option<&String>,
) -> Result<()> {
    let max = match max {
        Some(raw) => match raw.parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => bail!("prune needs a positive number, got {raw}"),
        },
        None => settings.get().max_autosnapshots,
    };
    let evicted = store.prune_autos_to_max(max).await?;
    println!("Evicted {evicted} auto snapshots (keeping at most {max})");
    Ok(())
}

async fn cmd_rename(store: &SnapshotStore, id: &str, name: Option<String>) -> Result<()> {
    match store.rename(id, name).await? {
        Some(snap) => {
            println!("{} is now \"{}\"", snap.id, snap.display_name());
            Ok(())
        }
        None => bail!("Snapshot not found: {id}"),
    }
}

async fn cmd_delete(store: &SnapshotStore, settings: &SettingsHandle, id: &str) -> Result<()> {
    let Some(removed) = store.delete(id).await? else {
        bail!("Snapshot not found: {id}");
    };
    if settings.get().synced_snapshot_id.as_deref() == Some(id) {
        settings.update(|s| s.synced_snapshot_id = None).await?;
        println!("Sync mode turned off");
    }
    println!("Deleted {} ({})", removed.id, removed.display_name());
    Ok(())
}
