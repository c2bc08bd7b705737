//! Typed notifications about bookkeeping changes.
//!
//! The manager publishes on a `tokio::sync::broadcast` channel. Publishing never blocks
//! and never fails the operation that triggered it; slow subscribers see `Lagged`.

use tokio::sync::broadcast;

use crate::descriptor::ModuleId;
use crate::manager::ModuleState;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    ModuleAdded(ModuleId),
    ModuleRemoved(ModuleId),
    ModuleLoaded(ModuleId),
    ModuleUnloaded(ModuleId),
    ModuleActivated(ModuleId),
    ModuleDeactivated(ModuleId),
    ModuleStateChanged { module: ModuleId, state: ModuleState },
    ModuleShared(ModuleId),
    ModuleUnshared(ModuleId),
    ConfigChanged,
    ManagerQuit,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ManagerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ManagerEvent) {
        if let Err(broadcast::error::SendError(event)) = self.tx.send(event) {
            tracing::trace!(?event, "No event subscribers");
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::descriptor::ModuleBase;

    #[test]
    fn subscribers_see_events_in_order() {
        let bus = EventBus::default();
        bus.publish(ManagerEvent::ConfigChanged);

        let mut rx = bus.subscribe();
        let id = ModuleId::new(ModuleBase::Hardware, "counter");
        bus.publish(ManagerEvent::ModuleLoaded(id.clone()));
        bus.publish(ManagerEvent::ModuleActivated(id.clone()));

        assert_eq!(rx.try_recv().unwrap(), ManagerEvent::ModuleLoaded(id.clone()));
        assert_eq!(rx.try_recv().unwrap(), ManagerEvent::ModuleActivated(id));
        assert!(rx.try_recv().is_err());
    }
}
