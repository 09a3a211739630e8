//! CLI for issuing and revoking relay sessions
//!
//! Usage:
//!   natbridge-admin create <owner-id> <owner-name>   # Issue a session id
//!   natbridge-admin show <owner-id>                  # Session id issued to an owner
//!   natbridge-admin list                             # All issued sessions
//!   natbridge-admin revoke <session-id>              # Revoke a session id
//!   natbridge-admin stats                            # Live stats from a running relay

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use natbridge_store::SqliteSessionStore;

#[derive(Debug, Parser)]
#[command(about = "Manage natbridge relay sessions")]
struct Opts {
    /// Path to the session store
    #[arg(long = "db", env = "NATBRIDGE_RELAY_DB", default_value = "relay.db", global = true)]
    db_path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Issue a new session id
    Create { owner_id: String, owner_name: String },
    /// Show the session id issued to an owner
    Show { owner_id: String },
    /// List all issued sessions
    List,
    /// Revoke a session id
    Revoke { session_id: String },
    /// Ask a running relay for live stats
    Stats {
        #[arg(long, default_value = "/tmp/natbridge_relay.sock")]
        socket: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let opts = Opts::parse();

    match opts.command {
        Command::Create {
            owner_id,
            owner_name,
        } => cmd_create(&open(&opts.db_path)?, &owner_id, &owner_name),
        Command::Show { owner_id } => cmd_show(&open(&opts.db_path)?, &owner_id),
        Command::List => cmd_list(&open(&opts.db_path)?),
        Command::Revoke { session_id } => cmd_revoke(&open(&opts.db_path)?, &session_id),
        Command::Stats { socket } => cmd_stats(&socket),
    }
}

fn open(path: &Path) -> Result<SqliteSessionStore> {
    SqliteSessionStore::open(path).context("Failed to open session store")
}

fn cmd_create(store: &SqliteSessionStore, owner_id: &str, owner_name: &str) -> Result<()> {
    if let Some(existing) = store.get(owner_id)? {
        println!("{} already has session {}", owner_name, existing);
        return Ok(());
    }
    let id = store.create(owner_id, owner_name)?;
    println!("{}", id);
    Ok(())
}

fn cmd_show(store: &SqliteSessionStore, owner_id: &str) -> Result<()> {
    match store.get(owner_id)? {
        Some(id) => println!("{}", id),
        None => bail!("No session issued to {}", owner_id),
    }
    Ok(())
}

fn cmd_list(store: &SqliteSessionStore) -> Result<()> {
    let sessions = store.list().context("Failed to load sessions")?;
    if sessions.is_empty() {
        println!("No sessions issued.");
        return Ok(());
    }

    println!("Sessions ({}):", sessions.len());
    println!();
    for session in sessions {
        let created = chrono::DateTime::<chrono::Utc>::from_timestamp(session.created_at, 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "Unknown".to_string());
        println!("  {}  {} ({})  {}", session.id, session.owner_name, session.owner_id, created);
    }
    Ok(())
}

fn cmd_revoke(store: &SqliteSessionStore, session_id: &str) -> Result<()> {
    if !store.remove(session_id)? {
        bail!("Session {} not found", session_id);
    }
    println!("Session {} revoked", session_id);
    println!("Peers already on the relay keep their mapping until it expires.");
    Ok(())
}

#[cfg(unix)]
fn cmd_stats(socket: &Path) -> Result<()> {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    let mut stream = UnixStream::connect(socket)
        .with_context(|| format!("Failed to connect to {}", socket.display()))?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(b"stats")?;
    stream.shutdown(std::net::Shutdown::Write)?;

    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let stats: serde_json::Value =
        serde_json::from_str(&response).context("Relay answered with invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

#[cfg(not(unix))]
fn cmd_stats(_socket: &Path) -> Result<()> {
    bail!("stats requires a unix control socket")
}
