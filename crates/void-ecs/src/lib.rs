//! Void ECS -- archetype-based Entity Component System storage core.
//!
//! Entities are grouped into archetypes (one per unique set of component
//! types) with one column per component type, so iteration walks contiguous
//! slices. Entity handles are generational: a destroyed handle never aliases
//! the entity that later reuses its slot.
//!
//! A [`Scene`](scene::Scene) ties the pieces together. Structural changes made
//! while iterating a query are queued on a [`Commands`](command::Commands)
//! handle and applied in order when the iteration ends.
//!
//! # Quick Start
//!
//! ```
//! use void_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
//! struct Position { x: f32, y: f32 }
//!
//! #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
//! struct Velocity { dx: f32, dy: f32 }
//!
//! let mut scene = Scene::new();
//! scene.register_component::<Position>("position");
//! scene.register_component::<Velocity>("velocity");
//!
//! let entity = scene
//!     .spawn()
//!     .with(Position { x: 0.0, y: 0.0 })
//!     .with(Velocity { dx: 1.0, dy: 0.0 })
//!     .build();
//!
//! scene
//!     .query::<(&mut Position, &Velocity)>()
//!     .for_each(|_, (position, velocity), _| position.x += velocity.dx);
//!
//! assert_eq!(scene.get_component::<Position>(entity), Some(&Position { x: 1.0, y: 0.0 }));
//! ```

#![deny(unsafe_code)]

pub mod archetype;
pub mod builder;
pub mod command;
pub mod component;
pub mod config;
pub mod entity;
pub mod event;
pub mod graph;
pub mod query;
pub mod scene;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by ECS operations.
///
/// Dead entity handles are not errors: operations on them are silent no-ops
/// reported through `bool` / `Option` returns.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// A component name was referenced that has not been registered.
    #[error("component type '{name}' not registered. Registered components: [{registered}]")]
    UnknownComponent { name: String, registered: String },

    /// Deserialization of a component value failed.
    #[error("failed to deserialize component '{component}': {details}")]
    ComponentDeserialization { component: String, details: String },

    /// Serialization of a stored component value failed.
    #[error("failed to serialize component '{component}': {details}")]
    ComponentSerialization { component: String, details: String },

    /// A scene configuration document could not be parsed.
    #[error("invalid scene config: {0}")]
    Config(#[source] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::archetype::{Archetype, ArchetypeId};
    pub use crate::builder::{EntityBuilder, SpawnCallback, Spawner};
    pub use crate::command::{ApplyReport, Command, CommandBuffer, Commands};
    pub use crate::component::{Component, ComponentInfo, ComponentRegistry, ComponentTypeId};
    pub use crate::config::SceneConfig;
    pub use crate::entity::{Entity, EntityLocation};
    pub use crate::event::{EcsEvent, SubscriberId};
    pub use crate::graph::ArchetypeGraph;
    pub use crate::query::{matches_query, QueryData, QueryDescriptor};
    pub use crate::scene::{QueryBuilder, Scene};
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    // -- test component types -----------------------------------------------

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Velocity {
        dx: f32,
        dy: f32,
    }

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Health(u32);

    fn setup_scene() -> Scene {
        let mut scene = Scene::new();
        scene.register_component::<Position>("position");
        scene.register_component::<Velocity>("velocity");
        scene.register_component::<Health>("health");
        scene
    }

    // -- spawn / destroy integration ----------------------------------------

    #[test]
    fn spawn_entities_with_components_and_query_back() {
        let mut scene = setup_scene();
        let e = scene
            .spawn()
            .with(Position { x: 1.0, y: 2.0 })
            .with(Velocity { dx: 3.0, dy: 4.0 })
            .build();

        let mut seen = Vec::new();
        scene
            .query::<(&Position, &Velocity)>()
            .for_each(|entity, (pos, vel), _| seen.push((entity, pos.clone(), vel.clone())));

        assert_eq!(
            seen,
            vec![(e, Position { x: 1.0, y: 2.0 }, Velocity { dx: 3.0, dy: 4.0 })]
        );
    }

    #[test]
    fn query_skips_entities_missing_required() {
        let mut scene = setup_scene();
        for i in 0..5 {
            scene.spawn_with(Position {
                x: i as f32,
                y: 0.0,
            });
        }
        assert_eq!(scene.query::<(&Position, &Velocity)>().count(), 0);
        assert_eq!(scene.query::<&Position>().count(), 5);
    }

    // -- scale test ---------------------------------------------------------

    #[test]
    fn scale_10k_entities() {
        let mut scene = setup_scene();

        let mut entities = Vec::with_capacity(10_000);
        for i in 0..10_000u32 {
            let e = scene
                .spawn()
                .with(Position {
                    x: i as f32,
                    y: i as f32 * 2.0,
                })
                .with(Velocity { dx: 1.0, dy: -1.0 })
                .build();
            entities.push(e);
        }

        assert_eq!(scene.query::<(&Position, &Velocity)>().count(), 10_000);

        scene.query::<&mut Velocity>().for_each(|_, vel, _| {
            vel.dx *= 2.0;
            vel.dy *= 2.0;
        });

        let vel = scene.get_component::<Velocity>(entities[0]).unwrap();
        assert_eq!(vel.dx, 2.0);
        assert_eq!(vel.dy, -2.0);

        for e in entities.iter().take(5_000) {
            assert!(scene.destroy(*e));
        }

        assert_eq!(scene.query::<(&Position, &Velocity)>().count(), 5_000);
        assert_eq!(scene.entity_count(), 5_000);
        for e in entities.iter().skip(5_000) {
            assert!(scene.is_alive(*e));
        }
    }

    // -- deferred mutation --------------------------------------------------

    #[test]
    fn spawning_during_iteration_is_not_visited() {
        let mut scene = setup_scene();
        scene.spawn_with(Health(1));
        scene.spawn_with(Health(2));

        let mut visits = 0;
        scene.query::<&Health>().for_each(|_, health, commands| {
            visits += 1;
            commands.spawn().with(Health(health.0 * 10)).build();
        });

        assert_eq!(visits, 2);
        assert_eq!(scene.entity_count(), 4);
        assert_eq!(scene.last_apply_report().applied, 2);
        assert_eq!(scene.query::<&Health>().count(), 4);
    }

    #[test]
    fn transitions_during_iteration_keep_every_entity_visited_once() {
        let mut scene = setup_scene();
        let entities: Vec<Entity> = (0..8).map(|i| scene.spawn_with(Health(i))).collect();

        let mut visited = Vec::new();
        scene.query::<&Health>().for_each(|entity, health, commands| {
            visited.push(entity);
            if health.0 % 2 == 0 {
                commands.add_component(entity, Position { x: 0.0, y: 0.0 });
            } else {
                commands.destroy(entity);
            }
        });

        assert_eq!(visited, entities);
        assert_eq!(scene.entity_count(), 4);
        assert_eq!(scene.query::<(&Health, &Position)>().count(), 4);
    }

    // -- events -------------------------------------------------------------

    #[test]
    fn events_report_every_structural_change() {
        let mut scene = setup_scene();
        let e = scene.spawn_with(Health(1));
        scene.add_component(e, Position { x: 0.0, y: 0.0 });
        scene.destroy(e);

        let kinds: Vec<&str> = scene
            .flush_events()
            .iter()
            .map(|event| match event {
                EcsEvent::EntityCreated { .. } => "created",
                EcsEvent::EntityDestroyed { .. } => "destroyed",
                EcsEvent::ComponentAdded { .. } => "added",
                EcsEvent::ComponentRemoved { .. } => "removed",
            })
            .collect();
        assert_eq!(kinds, vec!["created", "added", "added", "destroyed"]);
    }

    // -- errors -------------------------------------------------------------

    #[test]
    fn error_messages_name_the_component() {
        let mut scene = setup_scene();
        let e = scene.spawn().build();
        let err = scene
            .add_component_json(e, "mana", &serde_json::json!(3))
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("'mana'"), "{message}");
        assert!(message.contains("health, position, velocity"), "{message}");
    }
}
