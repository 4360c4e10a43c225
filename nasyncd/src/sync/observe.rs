use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::watch;

/// A family of `watch` channels keyed by folder id. Late subscribers immediately see
/// the latest published value.
pub struct KeyedWatch<V> {
    channels: Mutex<HashMap<String, watch::Sender<V>>>,
}

impl<V: Clone + Default + PartialEq> KeyedWatch<V> {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, key: &str) -> watch::Receiver<V> {
        self.channels()
            .entry(key.to_string())
            .or_insert_with(|| watch::Sender::new(V::default()))
            .subscribe()
    }

    /// Replaces the value; receivers are only woken when it actually changed.
    pub fn publish(&self, key: &str, value: V) {
        let mut channels = self.channels();
        let sender = channels
            .entry(key.to_string())
            .or_insert_with(|| watch::Sender::new(V::default()));
        sender.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });
    }

    pub fn current(&self, key: &str) -> V {
        self.channels()
            .get(key)
            .map(|sender| sender.borrow().clone())
            .unwrap_or_default()
    }

    /// Publishes the default value and forgets the key.
    pub fn remove(&self, key: &str) {
        if let Some(sender) = self.channels().remove(key) {
            sender.send_replace(V::default());
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, watch::Sender<V>>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<V: Clone + Default + PartialEq> Default for KeyedWatch<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_latest_value() {
        let watch = KeyedWatch::<Vec<u32>>::new();
        watch.publish("f1", vec![1]);

        let mut rx = watch.subscribe("f1");
        assert_eq!(*rx.borrow_and_update(), vec![1]);

        watch.publish("f1", vec![1, 2]);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), vec![1, 2]);
        assert_eq!(watch.current("f2"), Vec::<u32>::new());
    }

    #[tokio::test]
    async fn unchanged_values_do_not_wake_receivers() {
        let watch = KeyedWatch::<Vec<u32>>::new();
        let mut rx = watch.subscribe("f1");
        rx.borrow_and_update();
        watch.publish("f1", Vec::new());
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn remove_resets_subscribers() {
        let watch = KeyedWatch::<Vec<u32>>::new();
        let mut rx = watch.subscribe("f1");
        watch.publish("f1", vec![7]);
        watch.remove("f1");
        assert_eq!(*rx.borrow_and_update(), Vec::<u32>::new());
    }
}
