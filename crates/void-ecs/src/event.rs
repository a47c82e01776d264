//! Structural-change notifications.
//!
//! Every structural change a scene applies (spawn, destroy, component added,
//! component removed) queues an [`EcsEvent`]. Nothing is delivered until the
//! owner calls [`EventQueue::flush`], which hands every pending event to each
//! subscriber in FIFO order and returns them.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::component::ComponentTypeId;
use crate::entity::Entity;

/// A structural change to a scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EcsEvent {
    EntityCreated {
        entity: Entity,
    },
    EntityDestroyed {
        entity: Entity,
    },
    ComponentAdded {
        entity: Entity,
        component: ComponentTypeId,
    },
    ComponentRemoved {
        entity: Entity,
        component: ComponentTypeId,
    },
}

impl EcsEvent {
    /// The entity the event is about.
    pub fn entity(&self) -> Entity {
        match *self {
            EcsEvent::EntityCreated { entity }
            | EcsEvent::EntityDestroyed { entity }
            | EcsEvent::ComponentAdded { entity, .. }
            | EcsEvent::ComponentRemoved { entity, .. } => entity,
        }
    }
}

/// Handle returned by [`EventQueue::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type Handler = Box<dyn FnMut(&EcsEvent)>;

/// Pending events plus the handlers they are delivered to on flush.
#[derive(Default)]
pub struct EventQueue {
    pending: VecDeque<EcsEvent>,
    subscribers: Vec<(SubscriberId, Handler)>,
    next_subscriber: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Queue an event for the next flush.
    #[inline]
    pub fn push(&mut self, event: EcsEvent) {
        self.pending.push_back(event);
    }

    /// Register a handler. Handlers run in subscription order.
    pub fn subscribe(&mut self, handler: impl FnMut(&EcsEvent) + 'static) -> SubscriberId {
        let id = SubscriberId(self.next_subscriber);
        self.next_subscriber += 1;
        self.subscribers.push((id, Box::new(handler)));
        id
    }

    /// Remove a handler. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(existing, _)| *existing != id);
        self.subscribers.len() != before
    }

    /// Deliver every pending event to every subscriber, then return them.
    pub fn flush(&mut self) -> Vec<EcsEvent> {
        let events: Vec<EcsEvent> = self.pending.drain(..).collect();
        for event in &events {
            for (_, handler) in &mut self.subscribers {
                handler(event);
            }
        }
        events
    }

    /// Events queued since the last flush, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = &EcsEvent> {
        self.pending.iter()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop pending events without delivering them. Subscribers are kept.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue")
            .field("pending", &self.pending)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
