//! Observer lists backed by unbounded channels

use tokio::sync::mpsc;

/// Handle returned when an observer is added
pub type ObserverId = u64;

/// Fan-out list of event receivers.
///
/// Notification iterates over a snapshot taken before the first send, so
/// observers added or removed while an event is being delivered do not
/// affect that delivery. Observers whose receiver has been dropped are
/// pruned afterwards.
pub struct ObserverList<E> {
    observers: Vec<(ObserverId, mpsc::UnboundedSender<E>)>,
    next_id: ObserverId,
}

impl<E: Clone> ObserverList<E> {
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
            next_id: 1,
        }
    }

    pub fn add_observer(&mut self, sender: mpsc::UnboundedSender<E>) -> ObserverId {
        let id = self.next_id;
        self.next_id += 1;
        self.observers.push((id, sender));
        id
    }

    /// Add an observer and return the receiving end of its channel
    pub fn subscribe(&mut self) -> (ObserverId, mpsc::UnboundedReceiver<E>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (self.add_observer(sender), receiver)
    }

    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(observer_id, _)| *observer_id != id);
        self.observers.len() != before
    }

    pub fn notify(&mut self, event: E) {
        let snapshot: Vec<_> = self
            .observers
            .iter()
            .map(|(id, sender)| (*id, sender.clone()))
            .collect();

        let mut closed = Vec::new();
        for (id, sender) in snapshot {
            if sender.send(event.clone()).is_err() {
                closed.push(id);
            }
        }

        if !closed.is_empty() {
            self.observers.retain(|(id, _)| !closed.contains(id));
        }
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl<E: Clone> Default for ObserverList<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_reaches_every_observer() {
        let mut list = ObserverList::new();
        let (_, mut first) = list.subscribe();
        let (_, mut second) = list.subscribe();

        list.notify(5u32);
        assert_eq!(first.try_recv().unwrap(), 5);
        assert_eq!(second.try_recv().unwrap(), 5);
    }

    #[test]
    fn test_closed_observers_are_pruned() {
        let mut list = ObserverList::new();
        let (_, receiver) = list.subscribe();
        let (_, mut kept) = list.subscribe();
        drop(receiver);

        list.notify("stopped");
        assert_eq!(list.len(), 1);
        assert_eq!(kept.try_recv().unwrap(), "stopped");
    }

    #[test]
    fn test_remove_observer() {
        let mut list = ObserverList::new();
        let (id, mut receiver) = list.subscribe();
        assert!(list.remove_observer(id));
        assert!(!list.remove_observer(id));
        assert!(list.is_empty());

        list.notify(1u8);
        assert!(receiver.try_recv().is_err());
    }
}
