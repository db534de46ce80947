//! Host platform boundary.
//!
//! The engine consumes visibility, focus and connectivity predicates plus a
//! stream of change events, but never implements them. A non-interactive
//! host uses [`HeadlessHost`]: everything is visible, focused and online, and
//! no events are ever delivered.

use tokio::sync::mpsc;

/// Events a host can deliver to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostEvent {
    /// Window or tab regained focus.
    Focus,
    /// Document visibility changed; consult [`Host::is_visible`].
    VisibilityChange,
    /// Network connectivity came back.
    Reconnect,
    /// Network connectivity was lost.
    Offline,
}

/// Channel end handed to [`Host::subscribe`].
pub type HostEventSender = mpsc::UnboundedSender<HostEvent>;

/// Platform predicates and event subscription.
pub trait Host: Send + Sync {
    fn is_visible(&self) -> bool {
        true
    }

    fn has_focus(&self) -> bool {
        true
    }

    fn is_online(&self) -> bool {
        true
    }

    /// Visible and online.
    fn is_active(&self) -> bool {
        self.is_visible() && self.is_online()
    }

    /// Register an event sink. Hosts should drop senders once
    /// `is_closed()` reports the engine went away.
    fn subscribe(&self, events: HostEventSender) {
        let _ = events;
    }
}

/// Stub host for non-interactive environments.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadlessHost;

impl Host for HeadlessHost {}
