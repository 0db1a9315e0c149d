//!
//! Debounced change notifications for a single file.
//!
//! Editors and config management tools rewrite files in bursts (truncate,
//! write, rename); the debounce window folds each burst into one event.
//! Watcher errors are delivered as events too, so the listener sees
//! everything on one channel. Listeners must tolerate spurious events.
//!

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// One delivered notification.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub timestamp: DateTime<Utc>,
    /// Set when the OS watcher itself failed.
    pub error: Option<String>,
}

/// Watches exactly one path. Dropping the watcher stops it.
pub struct FileWatcher {
    // Held alive for the subscription; the OS watcher stops on drop.
    _watcher: notify::RecommendedWatcher,
}

enum Raw {
    Touched,
    Failed(String),
}

impl FileWatcher {
    /// Start watching `path`. Write and create events are debounced by
    /// `debounce` and delivered on the returned channel.
    pub fn start(
        path: &Path,
        debounce: Duration,
    ) -> Result<(Self, mpsc::Receiver<WatchEvent>), notify::Error> {
        let (raw_tx, mut raw_rx) = mpsc::channel::<Raw>(16);
        let (event_tx, event_rx) = mpsc::channel::<WatchEvent>(16);

        let mut watcher =
            notify::recommended_watcher(move |outcome: Result<notify::Event, notify::Error>| {
                let raw = match outcome {
                    Ok(event) if event.kind.is_modify() || event.kind.is_create() => Raw::Touched,
                    Ok(_) => return,
                    Err(error) => Raw::Failed(error.to_string()),
                };
                let _ = raw_tx.blocking_send(raw);
            })?;
        watcher.watch(path, RecursiveMode::NonRecursive)?;

        let watched = path.to_path_buf();
        tokio::spawn(async move {
            let mut deadline: Option<tokio::time::Instant> = None;
            loop {
                tokio::select! {
                    raw = raw_rx.recv() => {
                        match raw {
                            Some(Raw::Touched) => {
                                deadline = Some(tokio::time::Instant::now() + debounce);
                            }
                            Some(Raw::Failed(error)) => {
                                // Errors skip the debounce; the listener
                                // decides what to do with them.
                                let event = WatchEvent {
                                    path: watched.clone(),
                                    timestamp: Utc::now(),
                                    error: Some(error),
                                };
                                if event_tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                            None => return,
                        }
                    }
                    _ = async {
                        match deadline {
                            Some(at) => tokio::time::sleep_until(at).await,
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        deadline = None;
                        let event = WatchEvent {
                            path: watched.clone(),
                            timestamp: Utc::now(),
                            error: None,
                        };
                        if event_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok((Self { _watcher: watcher }, event_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_burst_of_writes_is_one_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "a: 1\n").unwrap();

        let (_watcher, mut events) =
            FileWatcher::start(&path, Duration::from_millis(100)).unwrap();

        for i in 0..5 {
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(file, "b{i}: {i}").unwrap();
        }

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("an event within the timeout")
            .expect("channel open");
        assert_eq!(event.path, path);
        assert!(event.error.is_none());

        // The burst was folded: nothing else arrives within the window.
        let extra = tokio::time::timeout(Duration::from_millis(300), events.recv()).await;
        assert!(extra.is_err(), "expected the burst to collapse into one event");
    }

    #[tokio::test]
    async fn test_separate_writes_produce_separate_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "a: 1\n").unwrap();

        let (_watcher, mut events) = FileWatcher::start(&path, Duration::from_millis(50)).unwrap();

        std::fs::write(&path, "a: 2\n").unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), events.recv()).await;
        assert!(first.is_ok());

        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(&path, "a: 3\n").unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), events.recv()).await;
        assert!(second.is_ok());
    }
}
