//! In-process window buffer between a producer and its consumers.
//!
//! Windows are retained until the coordinator purges them, so a
//! restarted consumer can re-read everything after its checkpoint. A
//! window is only ever published once; a restarted producer
//! re-publishing what it already produced is silently ignored. That's
//! the windowId dedup that keeps replay from reaching further
//! downstream.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::operators::Tuple;
use crate::window::WindowId;

/// Result of waiting for the window after a cursor.
#[derive(Debug, Clone)]
pub enum Next {
    Window(WindowId, Arc<Vec<Tuple>>),
    /// Nothing yet; try again after checking for control requests.
    Pending,
    /// The producer finished and every window was read.
    Ended,
}

#[derive(Debug, Default)]
struct Windows {
    windows: BTreeMap<WindowId, Arc<Vec<Tuple>>>,
    /// Everything at or before this was purged.
    purged_through: Option<WindowId>,
    ended: bool,
}

impl Windows {
    fn contains(&self, window: WindowId) -> bool {
        self.windows.contains_key(&window) || self.purged_through.map_or(false, |p| window <= p)
    }

    fn last(&self) -> Option<WindowId> {
        self.windows
            .keys()
            .next_back()
            .copied()
            .or(self.purged_through)
    }
}

#[derive(Debug)]
pub struct StreamBuffer {
    name: String,
    inner: Mutex<Windows>,
    published: Condvar,
}

impl StreamBuffer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Windows::default()),
            published: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a window's tuples. Returns `false` without changing
    /// anything if the window was already published, or is not after
    /// the last published window.
    pub fn publish(&self, window: WindowId, tuples: Vec<Tuple>) -> bool {
        let mut inner = self.inner.lock();
        if inner.contains(window) {
            tracing::trace!("Dropping replayed window {window} on stream {}", self.name);
            return false;
        }
        if inner.last().map_or(false, |last| window < last) {
            tracing::warn!(
                "Dropping out of order window {window} on stream {}; already at {:?}",
                self.name,
                inner.last()
            );
            return false;
        }
        inner.windows.insert(window, Arc::new(tuples));
        self.published.notify_all();
        true
    }

    /// No windows will be published anymore.
    pub fn end(&self) {
        let mut inner = self.inner.lock();
        if !inner.ended {
            tracing::debug!("Stream {} ended", self.name);
            inner.ended = true;
            self.published.notify_all();
        }
    }

    /// The first window after `cursor`, waiting at most `timeout` for
    /// one to arrive. A `None` cursor reads from the start.
    pub fn next_after(&self, cursor: Option<WindowId>, timeout: Duration) -> Next {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            let found = match cursor {
                None => inner.windows.iter().next(),
                Some(cursor) => inner
                    .windows
                    .range((std::ops::Bound::Excluded(cursor), std::ops::Bound::Unbounded))
                    .next(),
            };
            if let Some((window, tuples)) = found {
                return Next::Window(*window, tuples.clone());
            }
            if inner.ended {
                return Next::Ended;
            }
            if self.published.wait_until(&mut inner, deadline).timed_out() {
                return Next::Pending;
            }
        }
    }

    /// Drop every window at or before `window`.
    pub fn purge_through(&self, window: WindowId) -> usize {
        let mut inner = self.inner.lock();
        if inner.purged_through.map_or(false, |p| window <= p) {
            return 0;
        }
        let keep = match window.next() {
            Some(after) => inner.windows.split_off(&after),
            None => BTreeMap::new(),
        };
        let purged = std::mem::replace(&mut inner.windows, keep);
        inner.purged_through = Some(window);
        purged.len()
    }

    /// Windows currently retained.
    pub fn len(&self) -> usize {
        self.inner.lock().windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().windows.is_empty()
    }
}

#[cfg(test)]
fn tuples(window: WindowId, n: u32) -> Vec<Tuple> {
    use crate::operators::TupleId;

    (0..n)
        .map(|index| Tuple {
            id: TupleId { window, index },
            payload: serde_json::json!(index),
        })
        .collect()
}

#[cfg(test)]
fn w(seq: u32) -> WindowId {
    WindowId::new(7, seq)
}

#[test]
fn republished_windows_are_ignored() {
    let buf = StreamBuffer::new("s");
    assert!(buf.publish(w(1), tuples(w(1), 2)));
    assert!(buf.publish(w(2), tuples(w(2), 1)));
    assert!(!buf.publish(w(1), tuples(w(1), 5)));

    match buf.next_after(None, Duration::ZERO) {
        Next::Window(window, tuples) => {
            assert_eq!(window, w(1));
            assert_eq!(tuples.len(), 2);
        }
        other => panic!("expected a window, got {other:?}"),
    }
}

#[test]
fn reads_after_cursor_then_pending_then_ended() {
    let buf = StreamBuffer::new("s");
    buf.publish(w(1), vec![]);
    buf.publish(w(2), vec![]);

    assert!(matches!(buf.next_after(Some(w(1)), Duration::ZERO), Next::Window(found, _) if found == w(2)));
    assert!(matches!(buf.next_after(Some(w(2)), Duration::from_millis(5)), Next::Pending));
    buf.end();
    assert!(matches!(buf.next_after(Some(w(2)), Duration::from_secs(5)), Next::Ended));
    assert!(matches!(buf.next_after(Some(w(1)), Duration::ZERO), Next::Window(..)));
}

#[test]
fn purged_windows_stay_deduped() {
    let buf = StreamBuffer::new("s");
    for seq in 1..=4 {
        buf.publish(w(seq), vec![]);
    }
    assert_eq!(buf.purge_through(w(2)), 2);
    assert_eq!(buf.len(), 2);
    assert!(!buf.publish(w(2), vec![]));
    assert!(matches!(buf.next_after(None, Duration::ZERO), Next::Window(found, _) if found == w(3)));
    assert_eq!(buf.purge_through(w(1)), 0);
}

#[test]
fn waiting_reader_wakes_on_publish() {
    let buf = Arc::new(StreamBuffer::new("s"));
    let reader = {
        let buf = buf.clone();
        std::thread::spawn(move || buf.next_after(None, Duration::from_secs(10)))
    };
    std::thread::sleep(Duration::from_millis(20));
    buf.publish(w(1), tuples(w(1), 1));
    assert!(matches!(reader.join().unwrap(), Next::Window(found, _) if found == w(1)));
}
