//! Optional config-file watching.
//!
//! The watcher never mutates a live [`Resolved`](super::Resolved) snapshot;
//! it invokes the caller's callback, and the caller re-resolves.

use std::path::PathBuf;

use log::warn;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};

/// Handle keeping the underlying filesystem watcher alive.
///
/// Dropping it stops the watch.
pub struct Watcher {
    _inner: RecommendedWatcher,
}

/// Watch the given config files and invoke `on_change` whenever any of them
/// is created, modified, or removed.
///
/// # Errors
///
/// Returns an error if the watcher cannot be created or a path cannot be
/// watched.
pub fn watch(
    paths: Vec<PathBuf>,
    mut on_change: impl FnMut(&PathBuf) + Send + 'static,
) -> notify::Result<Watcher> {
    let watched = paths.clone();
    let mut inner = notify::recommended_watcher(move |event: notify::Result<Event>| {
        let event = match event {
            Ok(event) => event,
            Err(error) => {
                warn!("config watcher error: {error}");
                return;
            }
        };
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_),
        ) {
            return;
        }
        for path in &event.paths {
            if let Some(changed) = watched.iter().find(|watched| watched.as_path() == path) {
                on_change(changed);
            }
        }
    })?;

    for path in &paths {
        inner.watch(path, RecursiveMode::NonRecursive)?;
    }

    Ok(Watcher { _inner: inner })
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        sync::mpsc,
        time::Duration,
    };

    use super::*;

    #[test]
    fn change_triggers_callback() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let config = dir.path().join("config.yaml");
        fs::write(&config, "server:\n  port: 3000\n").expect("write config");

        let (sender, receiver) = mpsc::channel();
        let _watcher = watch(vec![config.clone()], move |changed| {
            let _ = sender.send(changed.clone());
        })
        .expect("watcher starts");

        fs::write(&config, "server:\n  port: 4000\n").expect("rewrite config");

        let changed = receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("change observed");
        assert_eq!(changed, config);
    }
}
