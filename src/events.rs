//! Project event bus.
//!
//! Every [`Project`](crate::project::Project) owns one [`EventBus`]. The partial store
//! publishes cache events on it, the project publishes structure changes, and the
//! rendering engine subscribes to decide whether it must repaint or prepare again.
//!
//! Subscriptions are plain broadcast receivers: dropping one unsubscribes it. A slow
//! subscriber that falls more than the channel capacity behind gets a
//! `RecvError::Lagged` and should treat it as "something changed".

use tokio::sync::broadcast;

use crate::project::layer_index::LayerId;
use crate::project::layout::LayoutId;

/// A handle for receiving project notifications.
pub type Subscription = broadcast::Receiver<ProjectEvent>;

#[derive(Debug, Clone, PartialEq)]
pub enum ProjectEvent {
    /// New partials were rendered and committed to the cache
    NewPartials { layers: Vec<LayerId>, count: usize },
    /// Cached partials were invalidated
    PartialsDeleted { layer: LayerId, count: usize },
    /// Layers, layouts or the active layer changed
    Structure(StructureChange),
}

impl ProjectEvent {
    /// New partials only need a repaint, everything else needs a new preparation.
    pub fn needs_prepare(&self) -> bool {
        !matches!(self, ProjectEvent::NewPartials { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StructureChange {
    LayerAdded(LayerId),
    LayerRemoved(LayerId),
    /// Zindex of one or more layers changed
    LayersReordered,
    /// Name, visibility or opacity changed
    LayerUpdated(LayerId),
    /// Features or tiles of a layer changed
    LayerDataChanged(LayerId),
    ActiveLayerChanged(LayerId),
    LayoutAdded(LayoutId),
    LayoutRemoved(LayoutId),
    ProjectClosed,
}

#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<ProjectEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> Subscription {
        self.tx.subscribe()
    }

    pub fn publish(&self, ev: ProjectEvent) {
        log::debug!("project event: {:?}", ev);
        // send() only fails when nobody listens, which is fine.
        let _ = self.tx.send(ev);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(ProjectEvent::Structure(StructureChange::ProjectClosed));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let layer = LayerId::from("LAYER_FEATURE_test");

        bus.publish(ProjectEvent::NewPartials { layers: vec![layer.clone()], count: 2 });
        bus.publish(ProjectEvent::PartialsDeleted { layer: layer.clone(), count: 1 });

        let first = rx.recv().await.unwrap();
        assert!(!first.needs_prepare());
        assert_eq!(first, ProjectEvent::NewPartials { layers: vec![layer.clone()], count: 2 });

        let second = rx.recv().await.unwrap();
        assert!(second.needs_prepare());
    }

    #[test]
    fn dropping_a_subscription_unsubscribes() {
        let bus = EventBus::default();
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
