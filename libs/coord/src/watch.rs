//! One-shot watches.

use tokio::sync::oneshot;

/// What happened to a watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Deleted,
    DataChanged,
    ChildrenChanged,
    /// The session that armed the watch ended before anything else happened.
    Session,
}

/// Notification delivered to a fired watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub path: String,
}

impl Event {
    pub fn new(kind: EventKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }

    /// Returns true if the watch ended because the session went away.
    pub fn is_session(&self) -> bool {
        self.kind == EventKind::Session
    }
}

/// A watch armed by one of the `*_w` connection calls.
///
/// Awaiting consumes the watch, so a watch that already fired can never be
/// awaited again; dropping it disarms it.
#[derive(Debug)]
pub struct Watch {
    path: String,
    rx: oneshot::Receiver<Event>,
}

/// Driver-side half of a [`Watch`].
#[derive(Debug)]
pub struct WatchTrigger {
    tx: oneshot::Sender<Event>,
}

impl Watch {
    /// Creates a connected trigger/watch pair for `path`.
    pub fn channel(path: impl Into<String>) -> (WatchTrigger, Watch) {
        let (tx, rx) = oneshot::channel();
        (
            WatchTrigger { tx },
            Watch {
                path: path.into(),
                rx,
            },
        )
    }

    /// The path the watch was armed on.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Waits for the watch to fire.
    ///
    /// A trigger dropped without firing is reported as a session event.
    pub async fn wait(self) -> Event {
        match self.rx.await {
            Ok(event) => event,
            Err(_) => Event::new(EventKind::Session, self.path),
        }
    }
}

impl WatchTrigger {
    /// Fires the watch. Does nothing if the watch was dropped.
    pub fn fire(self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Returns true if nobody is waiting on the watch any more.
    pub fn is_disarmed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fired_watch_delivers_event() {
        let (trigger, watch) = Watch::channel("/a");
        trigger.fire(Event::new(EventKind::Deleted, "/a"));
        assert_eq!(watch.wait().await.kind, EventKind::Deleted);
    }

    #[tokio::test]
    async fn test_dropped_trigger_reports_session() {
        let (trigger, watch) = Watch::channel("/a");
        drop(trigger);
        let event = watch.wait().await;
        assert!(event.is_session());
        assert_eq!(event.path, "/a");
    }

    #[test]
    fn test_dropped_watch_disarms_trigger() {
        let (trigger, watch) = Watch::channel("/a");
        assert!(!trigger.is_disarmed());
        drop(watch);
        assert!(trigger.is_disarmed());
    }
}
