// Append Log
// Single-writer, multi-reader buffer that observers follow with independent cursors

use futures::stream::{self, Stream};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;

struct LogState<T> {
    entries: Vec<T>,
    sealed: bool,
}

/// Append-only log. Readers never block the writer; a sealed log accepts no
/// more entries and every cursor ends once it has read the last one.
pub struct AppendLog<T> {
    state: RwLock<LogState<T>>,
    /// Bumped on every push and on seal
    version: watch::Sender<u64>,
}

enum Read<T> {
    Item(T),
    Closed,
    Pending,
}

impl<T: Clone + Send + Sync + 'static> AppendLog<T> {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            state: RwLock::new(LogState {
                entries: Vec::new(),
                sealed: false,
            }),
            version,
        }
    }

    /// Append an entry; returns false if the log is already sealed
    pub fn push(&self, entry: T) -> bool {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if state.sealed {
                return false;
            }
            state.entries.push(entry);
        }
        self.version.send_modify(|v| *v += 1);
        true
    }

    pub fn seal(&self) {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if state.sealed {
                return;
            }
            state.sealed = true;
        }
        self.version.send_modify(|v| *v += 1);
    }

    pub fn is_sealed(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sealed
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clone()
    }

    /// New cursor positioned at the first entry
    pub fn cursor(self: &Arc<Self>) -> LogCursor<T> {
        LogCursor {
            log: Arc::clone(self),
            position: 0,
            version: self.version.subscribe(),
        }
    }

    fn read_at(&self, position: usize) -> Read<T> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        match state.entries.get(position) {
            Some(entry) => Read::Item(entry.clone()),
            None if state.sealed => Read::Closed,
            None => Read::Pending,
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for AppendLog<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Independent read position over an [`AppendLog`]
pub struct LogCursor<T> {
    log: Arc<AppendLog<T>>,
    position: usize,
    version: watch::Receiver<u64>,
}

impl<T: Clone + Send + Sync + 'static> LogCursor<T> {
    /// Next entry, waiting while caught up; `None` once the log is sealed and drained
    pub async fn next(&mut self) -> Option<T> {
        loop {
            // Mark the current version seen before reading so a push racing
            // the read still wakes `changed()`
            self.version.borrow_and_update();
            match self.log.read_at(self.position) {
                Read::Item(entry) => {
                    self.position += 1;
                    return Some(entry);
                }
                Read::Closed => return None,
                Read::Pending => {
                    if self.version.changed().await.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn into_stream(self) -> impl Stream<Item = T> + Send + 'static {
        stream::unfold(self, |mut cursor| async move {
            cursor.next().await.map(|entry| (entry, cursor))
        })
    }
}
