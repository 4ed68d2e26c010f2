//! Watches the classes directory and calls back once per burst of changes.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

const EVENTS_CHANNEL_SIZE: usize = 100;

/// Called after the classes directory changed and stayed quiet for the delay.
#[async_trait]
pub trait OnChange: Send + Sync {
    async fn on_change(&self);
}

/// Keeps the filesystem watch alive. Dropping it stops watching.
pub struct ClassesWatcher {
    _watcher: RecommendedWatcher,
    debouncer: JoinHandle<()>,
}

impl Drop for ClassesWatcher {
    fn drop(&mut self) {
        self.debouncer.abort();
    }
}

/// The paths to watch: the directory itself, the `..data` symlink kubelet swaps on
/// updates, and every regular entry. Other `..` prefixed entries are kubelet's
/// timestamped directories and come and go.
pub fn watch_targets(directory: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut targets = vec![directory.to_path_buf()];

    let entries = fs::read_dir(directory)
        .with_context(|| format!("unable to list directory {}", directory.display()))?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == "..data" || (name != "." && !name.starts_with("..")) {
            targets.push(entry.path());
        }
    }

    Ok(targets)
}

/// Starts watching `directory`. `on_change` runs once the directory has been quiet
/// for `delay` after a change, so a burst of events results in a single call.
pub fn spawn_watcher(
    directory: &Path,
    delay: Duration,
    on_change: Arc<dyn OnChange>,
) -> anyhow::Result<ClassesWatcher> {
    let counter = Arc::new(AtomicU64::new(0));
    let (tx, rx) = mpsc::channel(EVENTS_CHANNEL_SIZE);

    let event_counter = counter.clone();
    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Access(_)) {
                    return;
                }
                debug!("classes directory event: {:?}", event);
                event_counter.fetch_add(1, Ordering::SeqCst);
                // A full channel already has a wakeup queued.
                let _ = tx.try_send(());
            }
            Err(err) => error!("error watching classes directory: {}", err),
        }
    })?;

    for target in watch_targets(directory)? {
        watcher
            .watch(&target, RecursiveMode::NonRecursive)
            .with_context(|| format!("unable to watch {}", target.display()))?;
    }

    info!(
        "watching {} for changes with a delay of {:?}",
        directory.display(),
        delay
    );

    let debouncer = tokio::spawn(debounce(rx, counter, delay, on_change));

    Ok(ClassesWatcher {
        _watcher: watcher,
        debouncer,
    })
}

/// Waits for wakeups, lets the events settle for `delay` and calls back once for
/// everything counted so far. Wakeups for events already handled are ignored.
async fn debounce(
    mut events: mpsc::Receiver<()>,
    counter: Arc<AtomicU64>,
    delay: Duration,
    on_change: Arc<dyn OnChange>,
) {
    let mut previous = 0;

    while events.recv().await.is_some() {
        if counter.load(Ordering::SeqCst) == previous {
            continue;
        }

        tokio::time::sleep(delay).await;
        let current = counter.load(Ordering::SeqCst);

        info!("classes directory changed, running update");
        on_change.on_change().await;
        previous = current;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Default)]
    struct CountingCallback(AtomicUsize);

    #[async_trait]
    impl OnChange for CountingCallback {
        async fn on_change(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl CountingCallback {
        fn calls(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    const DELAY: Duration = Duration::from_millis(50);

    fn start_debounce() -> (mpsc::Sender<()>, Arc<AtomicU64>, Arc<CountingCallback>) {
        let counter = Arc::new(AtomicU64::new(0));
        let callback = Arc::new(CountingCallback::default());
        let (tx, rx) = mpsc::channel(EVENTS_CHANNEL_SIZE);
        tokio::spawn(debounce(rx, counter.clone(), DELAY, callback.clone()));
        (tx, counter, callback)
    }

    async fn send_event(tx: &mpsc::Sender<()>, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::SeqCst);
        tx.send(()).await.unwrap();
    }

    #[tokio::test]
    async fn test_single_event() {
        let (tx, counter, callback) = start_debounce();

        send_event(&tx, &counter).await;
        tokio::time::sleep(DELAY * 4).await;

        assert_eq!(callback.calls(), 1);
    }

    #[tokio::test]
    async fn test_burst_calls_back_once() {
        let (tx, counter, callback) = start_debounce();

        for _ in 0..3 {
            send_event(&tx, &counter).await;
        }
        tokio::time::sleep(DELAY * 4).await;

        assert_eq!(callback.calls(), 1);
    }

    #[tokio::test]
    async fn test_separate_bursts() {
        let (tx, counter, callback) = start_debounce();

        for _ in 0..3 {
            send_event(&tx, &counter).await;
            send_event(&tx, &counter).await;
            tokio::time::sleep(DELAY * 4).await;
        }

        assert_eq!(callback.calls(), 3);
    }

    #[tokio::test]
    async fn test_no_events_no_callback() {
        let (_tx, _counter, callback) = start_debounce();
        tokio::time::sleep(DELAY * 2).await;
        assert_eq!(callback.calls(), 0);
    }

    #[tokio::test]
    async fn test_wakeup_without_new_events() {
        let (tx, _counter, callback) = start_debounce();

        tx.send(()).await.unwrap();
        tokio::time::sleep(DELAY * 4).await;

        assert_eq!(callback.calls(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_watch_atomic_symlink_swap() {
        use std::os::unix::fs::symlink;

        // Layout used by kubelet for secret volumes.
        let dir = tempfile::tempdir().unwrap();
        let v1 = dir.path().join("..v1");
        fs::create_dir(&v1).unwrap();
        fs::write(v1.join("basic"), "[agent]\n").unwrap();
        symlink("..v1", dir.path().join("..data")).unwrap();
        symlink("..data/basic", dir.path().join("basic")).unwrap();

        let callback = Arc::new(CountingCallback::default());
        let _watcher = spawn_watcher(dir.path(), DELAY, callback.clone()).unwrap();

        // kubelet writes the new version aside and swaps `..data` with a rename.
        let v2 = dir.path().join("..v2");
        fs::create_dir(&v2).unwrap();
        fs::write(v2.join("basic"), "[agent]\n  interval = \"5s\"\n").unwrap();
        symlink("..v2", dir.path().join("..data_tmp")).unwrap();
        fs::rename(dir.path().join("..data_tmp"), dir.path().join("..data")).unwrap();
        fs::remove_dir_all(&v1).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(callback.calls(), 1);
        assert!(fs::read_to_string(dir.path().join("basic"))
            .unwrap()
            .contains("5s"));
    }

    #[cfg(unix)]
    #[test]
    fn test_watch_targets() {
        let dir = tempfile::tempdir().unwrap();
        let version = dir.path().join("..2024_01_01_00_00_00.000000000");
        fs::create_dir(&version).unwrap();
        fs::write(version.join("basic"), "").unwrap();
        std::os::unix::fs::symlink(&version, dir.path().join("..data")).unwrap();
        std::os::unix::fs::symlink("..data/basic", dir.path().join("basic")).unwrap();

        let mut targets = watch_targets(dir.path()).unwrap();
        targets.sort();

        let mut want = vec![
            dir.path().to_path_buf(),
            dir.path().join("..data"),
            dir.path().join("basic"),
        ];
        want.sort();
        assert_eq!(targets, want);
    }

    #[test]
    fn test_watch_targets_missing_directory() {
        assert!(watch_targets(Path::new("/nonexistent/classes")).is_err());
    }

    #[tokio::test]
    async fn test_watch_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("basic"), "").unwrap();

        let callback = Arc::new(CountingCallback::default());
        let _watcher = spawn_watcher(dir.path(), DELAY, callback.clone()).unwrap();

        fs::write(dir.path().join("basic"), "[agent]\n").unwrap();
        fs::write(dir.path().join("other"), "[agent]\n").unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(callback.calls(), 1);
    }
}
