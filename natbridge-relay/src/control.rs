//! Local control socket. Accepts one command per connection and answers
//! with JSON.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

use crate::registry::PeerRegistry;
use crate::relay::RouteTable;
use crate::stats;

const MAX_COMMAND_LEN: usize = 1024;

pub async fn serve(
    path: PathBuf,
    registry: Arc<PeerRegistry>,
    routes: Arc<RouteTable>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    remove_stale(&path)?;
    let listener = UnixListener::bind(&path)
        .with_context(|| format!("binding control socket {}", path.display()))?;
    log::info!("control socket listening on {}", path.display());

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let registry = Arc::clone(&registry);
                    let routes = Arc::clone(&routes);
                    tokio::spawn(async move {
                        if let Err(err) = handle_client(stream, &registry, &routes).await {
                            log::warn!("control client failed: {:#}", err);
                        }
                    });
                }
                Err(err) => log::error!("control accept failed: {}", err),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    drop(listener);
    remove_stale(&path)
}

async fn handle_client(
    mut stream: UnixStream,
    registry: &PeerRegistry,
    routes: &RouteTable,
) -> Result<()> {
    let mut buf = vec![0u8; MAX_COMMAND_LEN];
    let len = stream.read(&mut buf).await.context("reading command")?;
    let command = String::from_utf8_lossy(&buf[..len]);

    let response = execute(command.trim(), registry, routes)?;
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Runs one control command and renders its JSON response.
pub fn execute(command: &str, registry: &PeerRegistry, routes: &RouteTable) -> Result<String> {
    let response = match command {
        "stats" => serde_json::to_string(&stats::snapshot(registry, routes))?,
        other => {
            log::debug!("unknown control command {:?}", other);
            json!({ "error": "Unknown command" }).to_string()
        }
    };
    Ok(response)
}

fn remove_stale(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use natbridge_store::MemorySessionStore;

    #[test]
    fn unknown_command_is_reported() {
        let registry = PeerRegistry::new(Arc::new(MemorySessionStore::new()));
        let routes = RouteTable::new();

        let response = execute("reboot", &registry, &routes).unwrap();
        let value: serde_json::Value = serde_json::from_str(&response).unwrap();
        assert_eq!(value["error"], "Unknown command");

        let response = execute("stats", &registry, &routes).unwrap();
        let value: serde_json::Value = serde_json::from_str(&response).unwrap();
        assert_eq!(value["sessions"], 0);
    }

    #[tokio::test]
    async fn serves_stats_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.sock");
        let registry = Arc::new(PeerRegistry::new(Arc::new(MemorySessionStore::new())));
        let routes = Arc::new(RouteTable::new());
        let (stop_tx, stop_rx) = watch::channel(false);

        let server = tokio::spawn(serve(path.clone(), registry, routes, stop_rx));

        let mut stream = loop {
            match UnixStream::connect(&path).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            }
        };
        stream.write_all(b"stats").await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&response).unwrap();
        assert_eq!(value["routes"], 0);

        stop_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
        assert!(!path.exists());
    }
}
