//! Deferred structural mutations.
//!
//! While a query is iterating, the scene's storage is borrowed and cannot be
//! restructured. Callbacks instead receive a [`Commands`] handle that records
//! each intended mutation as a [`Command`] in the scene's [`CommandBuffer`].
//! When the iteration ends (normally, through an early `Err`, or by
//! unwinding) the buffer is replayed against the scene in strict FIFO order
//! through the same code paths direct callers use.
//!
//! Spawns are the one operation that returns something synchronously: the
//! entity identity is reserved immediately so callers can refer to it in
//! later commands, but it has no storage until its `Spawn` command replays.
//!
//! # Example
//!
//! ```
//! use void_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
//! struct Health(u32);
//!
//! let mut scene = Scene::new();
//! scene.register_component::<Health>("health");
//! let a = scene.spawn_with(Health(0));
//! let b = scene.spawn_with(Health(7));
//!
//! scene.query::<&Health>().for_each(|entity, health, commands| {
//!     if health.0 == 0 {
//!         commands.destroy(entity);
//!     }
//! });
//!
//! assert!(!scene.is_alive(a));
//! assert!(scene.is_alive(b));
//! assert_eq!(scene.last_apply_report().applied, 1);
//! ```

use std::collections::VecDeque;
use std::fmt;

use tracing::{debug, warn};

use crate::builder::{EntityBuilder, SpawnCallback, Spawner};
use crate::component::{
    BoxedComponent, Component, ComponentMap, ComponentRegistry, ComponentTypeId,
};
use crate::entity::{Entity, EntityAllocator};
use crate::scene::Scene;
use crate::EcsError;

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// A single deferred mutation.
pub enum Command {
    /// Place a reserved entity into storage with `components`, then run
    /// `callback`.
    Spawn {
        components: ComponentMap,
        callback: Option<SpawnCallback>,
        reserved: Entity,
    },
    /// Destroy an entity.
    Destroy { entity: Entity },
    /// Add a component, or overwrite it if already present.
    AddComponent {
        entity: Entity,
        component: ComponentTypeId,
        data: BoxedComponent,
    },
    /// Remove a component if present.
    RemoveComponent {
        entity: Entity,
        component: ComponentTypeId,
    },
}

impl Command {
    /// The entity this command targets.
    pub fn target(&self) -> Entity {
        match *self {
            Command::Spawn { reserved, .. } => reserved,
            Command::Destroy { entity }
            | Command::AddComponent { entity, .. }
            | Command::RemoveComponent { entity, .. } => entity,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Command::Spawn { .. } => "spawn",
            Command::Destroy { .. } => "destroy",
            Command::AddComponent { .. } => "add_component",
            Command::RemoveComponent { .. } => "remove_component",
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Spawn {
                components,
                callback,
                reserved,
            } => f
                .debug_struct("Spawn")
                .field("components", &components.keys().collect::<Vec<_>>())
                .field("callback", &callback.is_some())
                .field("reserved", reserved)
                .finish(),
            Command::Destroy { entity } => {
                f.debug_struct("Destroy").field("entity", entity).finish()
            }
            Command::AddComponent {
                entity, component, ..
            } => f
                .debug_struct("AddComponent")
                .field("entity", entity)
                .field("component", component)
                .finish_non_exhaustive(),
            Command::RemoveComponent { entity, component } => f
                .debug_struct("RemoveComponent")
                .field("entity", entity)
                .field("component", component)
                .finish(),
        }
    }
}

// ---------------------------------------------------------------------------
// ApplyReport
// ---------------------------------------------------------------------------

/// Summary of the most recent command replay.
///
/// A command is skipped when its target entity was already dead by the time
/// it replayed. That is the normal outcome of, for example, two callbacks
/// destroying the same entity, and is not treated as an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Commands that reached a live target.
    pub applied: usize,
    /// Commands whose target was dead.
    pub skipped: usize,
}

impl ApplyReport {
    /// Fold another replay's counts into this one.
    pub fn merge(&mut self, other: ApplyReport) {
        self.applied += other.applied;
        self.skipped += other.skipped;
    }
}

// ---------------------------------------------------------------------------
// CommandBuffer
// ---------------------------------------------------------------------------

/// FIFO queue of deferred commands.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    commands: VecDeque<Command>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push(&mut self, command: Command) {
        self.commands.push_back(command);
    }

    /// Queued commands, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Drop every queued command. Reserved spawn entities are not released;
    /// the caller owns that decision.
    pub fn clear(&mut self) {
        self.commands.clear();
    }

    /// Replay every command against `scene`, oldest first, leaving the
    /// buffer empty.
    pub(crate) fn apply(&mut self, scene: &mut Scene) -> ApplyReport {
        debug_assert!(
            !scene.is_iterating(),
            "commands must not replay while a query is iterating"
        );
        let mut report = ApplyReport::default();

        while let Some(command) = self.commands.pop_front() {
            let target = command.target();
            if !scene.is_alive(target) {
                report.skipped += 1;
                if matches!(command, Command::Spawn { .. }) {
                    warn!(
                        entity = %target,
                        "deferred spawn skipped: reserved entity was destroyed before replay"
                    );
                } else {
                    debug!(
                        entity = %target,
                        command = command.kind(),
                        "deferred command skipped: target is dead"
                    );
                }
                continue;
            }

            match command {
                Command::Spawn {
                    components,
                    callback,
                    reserved,
                } => {
                    scene.place_reserved(reserved, components);
                    if let Some(callback) = callback {
                        scene.take_apply_report();
                        callback(scene, reserved);
                        report.merge(scene.take_apply_report());
                    }
                }
                Command::Destroy { entity } => {
                    scene.destroy(entity);
                }
                Command::AddComponent {
                    entity,
                    component,
                    data,
                } => {
                    scene.insert_boxed(entity, component, data);
                }
                Command::RemoveComponent { entity, component } => {
                    scene.remove_boxed(entity, component);
                }
            }
            report.applied += 1;
        }

        report
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Mutation handle passed to query callbacks.
///
/// Every method records a [`Command`]; nothing touches storage until the
/// iteration that produced the handle ends.
pub struct Commands<'w> {
    buffer: &'w mut CommandBuffer,
    entities: &'w mut EntityAllocator,
    registry: &'w ComponentRegistry,
}

impl<'w> Commands<'w> {
    pub(crate) fn new(
        buffer: &'w mut CommandBuffer,
        entities: &'w mut EntityAllocator,
        registry: &'w ComponentRegistry,
    ) -> Self {
        Self {
            buffer,
            entities,
            registry,
        }
    }

    /// Start building a deferred spawn. The returned entity from
    /// [`EntityBuilder::build`] is reserved immediately.
    pub fn spawn(&mut self) -> EntityBuilder<'_, Commands<'w>> {
        EntityBuilder::new(self)
    }

    /// Reserve an entity identity with no components and no pending spawn.
    /// It stays invisible to queries until a component is added to it.
    pub fn reserve_entity(&mut self) -> Entity {
        self.entities.allocate()
    }

    /// Queue a destroy.
    pub fn destroy(&mut self, entity: Entity) {
        self.buffer.push(Command::Destroy { entity });
    }

    /// Queue a component add (or overwrite).
    ///
    /// # Panics
    ///
    /// Panics if `T` is not registered.
    pub fn add_component<T: Component>(&mut self, entity: Entity, value: T) {
        let component = self.registry.lookup::<T>().unwrap_or_else(|| {
            panic!(
                "component type {} is not registered",
                std::any::type_name::<T>()
            )
        });
        self.buffer.push(Command::AddComponent {
            entity,
            component,
            data: Box::new(value),
        });
    }

    /// Queue a component add from serialized data, resolved by registered
    /// name.
    pub fn add_component_json(
        &mut self,
        entity: Entity,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<(), EcsError> {
        let (component, data) = crate::builder::deserialize_named(self.registry, name, value)?;
        self.buffer.push(Command::AddComponent {
            entity,
            component,
            data,
        });
        Ok(())
    }

    /// Queue a component removal. An unregistered `T` cannot be present on
    /// any entity, so nothing is queued.
    pub fn remove_component<T: Component>(&mut self, entity: Entity) {
        if let Some(component) = self.registry.lookup::<T>() {
            self.buffer
                .push(Command::RemoveComponent { entity, component });
        }
    }

    /// Number of commands queued so far in this iteration.
    pub fn queued(&self) -> usize {
        self.buffer.len()
    }
}

impl Spawner for Commands<'_> {
    fn registry(&self) -> &ComponentRegistry {
        self.registry
    }

    fn spawn_components(
        &mut self,
        components: ComponentMap,
        callback: Option<SpawnCallback>,
    ) -> Entity {
        let reserved = self.entities.allocate();
        self.buffer.push(Command::Spawn {
            components,
            callback,
            reserved,
        });
        reserved
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EcsEvent;
    use std::cell::Cell;
    use std::rc::Rc;

    // -- test component types -----------------------------------------------

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Health(u32);

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Marker;

    fn setup_scene() -> Scene {
        let mut scene = Scene::new();
        scene.register_component::<Health>("health");
        scene.register_component::<Marker>("marker");
        scene
    }

    // -- 1. Commands queue instead of applying ----------------------------

    #[test]
    fn commands_are_invisible_until_iteration_ends() {
        let mut scene = setup_scene();
        let e = scene.spawn_with(Health(1));

        scene.query::<&Health>().for_each(|entity, _, commands| {
            commands.add_component(entity, Marker);
            commands.spawn().with(Health(2)).build();
            assert_eq!(commands.queued(), 2);
        });

        assert!(scene.has_component::<Marker>(e));
        assert_eq!(scene.query::<&Health>().count(), 2);
    }

    // -- 2. FIFO order ----------------------------------------------------

    #[test]
    fn replay_is_fifo() {
        let mut scene = setup_scene();
        let e = scene.spawn_with(Health(1));
        scene.flush_events();

        scene.query::<()>().with::<Health>().for_each(|entity, (), commands| {
            commands.add_component(entity, Marker);
            commands.remove_component::<Marker>(entity);
            commands.add_component(entity, Health(9));
        });

        assert!(!scene.has_component::<Marker>(e));
        assert_eq!(scene.get_component::<Health>(e), Some(&Health(9)));
        let events = scene.flush_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], EcsEvent::ComponentAdded { .. }));
        assert!(matches!(events[1], EcsEvent::ComponentRemoved { .. }));
    }

    // -- 3. Destroy then add on the same entity -----------------------------

    #[test]
    fn add_after_destroy_is_skipped() {
        let mut scene = setup_scene();
        let e = scene.spawn_with(Health(1));

        scene.query::<&Health>().for_each(|entity, _, commands| {
            commands.destroy(entity);
            commands.add_component(entity, Marker);
        });

        assert!(!scene.is_alive(e));
        assert_eq!(
            scene.last_apply_report(),
            ApplyReport {
                applied: 1,
                skipped: 1
            }
        );
    }

    // -- 4. Double destroy --------------------------------------------------

    #[test]
    fn double_destroy_counts_one_skip() {
        let mut scene = setup_scene();
        let e = scene.spawn_with(Health(1));

        scene.query::<()>().for_each(|_, (), commands| {
            commands.destroy(e);
            commands.destroy(e);
        });

        assert_eq!(scene.last_apply_report().applied, 1);
        assert_eq!(scene.last_apply_report().skipped, 1);
    }

    // -- 5. Reserved spawn --------------------------------------------------

    #[test]
    fn reserved_spawn_handle_is_usable_in_later_commands() {
        let mut scene = setup_scene();
        scene.spawn_with(Health(1));
        let mut spawned = None;

        scene.query::<&Health>().for_each(|_, _, commands| {
            let child = commands.spawn().with(Health(5)).build();
            commands.add_component(child, Marker);
            spawned = Some(child);
        });

        let child = spawned.unwrap();
        assert!(scene.is_alive(child));
        assert_eq!(scene.get_component::<Health>(child), Some(&Health(5)));
        assert!(scene.has_component::<Marker>(child));
    }

    #[test]
    fn reserved_entity_has_no_storage_until_replay() {
        let mut scene = setup_scene();
        scene.spawn_with(Health(1));

        scene.query::<&Health>().for_each(|_, _, commands| {
            let child = commands.spawn().with(Health(5)).build();
            assert!(commands.entities.is_alive(child));
            assert_eq!(commands.entities.location(child), None);
        });
    }

    // -- 6. on_spawn callback -------------------------------------------------

    #[test]
    fn on_spawn_runs_after_placement() {
        let mut scene = setup_scene();
        scene.spawn_with(Health(1));

        scene.query::<&Health>().for_each(|_, _, commands| {
            commands
                .spawn()
                .with(Health(3))
                .on_spawn(|scene, entity| {
                    let health = scene.get_component::<Health>(entity).cloned();
                    scene.add_component(entity, Health(health.map_or(0, |h| h.0 * 10)));
                })
                .build();
        });

        let results: Vec<u32> = scene
            .query::<&Health>()
            .entities()
            .into_iter()
            .filter_map(|e| scene.get_component::<Health>(e).map(|h| h.0))
            .collect();
        assert!(results.contains(&30));
    }

    // -- 7. Spawn whose reservation changed before replay ------------------

    #[test]
    fn spawn_of_destroyed_reservation_is_skipped() {
        let mut scene = setup_scene();
        scene.spawn_with(Health(1));
        let target: Rc<Cell<Option<Entity>>> = Rc::new(Cell::new(None));

        scene.query::<&Health>().for_each(|_, _, commands| {
            let slot = Rc::clone(&target);
            commands
                .spawn()
                .on_spawn(move |scene, _| {
                    if let Some(doomed) = slot.get() {
                        scene.destroy(doomed);
                    }
                })
                .build();
            let doomed = commands.spawn().with(Marker).build();
            target.set(Some(doomed));
        });

        let doomed = target.get().unwrap();
        assert!(!scene.is_alive(doomed));
        assert_eq!(scene.query::<&Marker>().count(), 0);
        assert_eq!(
            scene.last_apply_report(),
            ApplyReport {
                applied: 1,
                skipped: 1
            }
        );
    }

    #[test]
    fn add_to_reservation_destroyed_before_replay_is_skipped() {
        let mut scene = setup_scene();
        scene.spawn_with(Health(1));

        scene.query::<&Health>().for_each(|_, _, commands| {
            let later = commands.reserve_entity();
            commands
                .spawn()
                .on_spawn(move |scene, _| {
                    scene.destroy(later);
                })
                .build();
            commands.add_component(later, Marker);
        });

        assert_eq!(scene.query::<&Marker>().count(), 0);
        assert_eq!(scene.last_apply_report().skipped, 1);
    }

    #[test]
    fn spawn_of_reservation_placed_early_merges_into_one_row() {
        let mut scene = setup_scene();
        scene.spawn_with(Health(1));
        let later: Rc<Cell<Option<Entity>>> = Rc::new(Cell::new(None));

        scene.query::<&Health>().for_each(|_, _, commands| {
            let slot = Rc::clone(&later);
            commands
                .spawn()
                .on_spawn(move |scene, _| {
                    if let Some(later) = slot.get() {
                        scene.add_component(later, Marker);
                    }
                })
                .build();
            later.set(Some(commands.spawn().with(Health(5)).build()));
        });

        let later = later.get().unwrap();
        let rows = scene
            .archetypes()
            .iter()
            .flat_map(|archetype| archetype.entities())
            .filter(|&&e| e == later)
            .count();
        assert_eq!(rows, 1);
        assert_eq!(scene.query::<&Health>().count(), 2);
        assert_eq!(scene.get_component::<Health>(later), Some(&Health(5)));
        assert!(scene.has_component::<Marker>(later));

        let created = scene
            .flush_events()
            .iter()
            .filter(|event| {
                matches!(event, EcsEvent::EntityCreated { entity } if *entity == later)
            })
            .count();
        assert_eq!(created, 1);

        assert!(scene.destroy(later));
        let rows = scene
            .archetypes()
            .iter()
            .flat_map(|archetype| archetype.entities())
            .filter(|&&e| e == later)
            .count();
        assert_eq!(rows, 0);
    }

    #[test]
    fn clear_from_spawn_callback_skips_the_rest() {
        let mut scene = setup_scene();
        let first = scene.spawn_with(Health(1));

        scene.query::<&Health>().for_each(|entity, _, commands| {
            commands.spawn().on_spawn(|scene, _| scene.clear()).build();
            commands.add_component(entity, Marker);
            commands.spawn().with(Health(2)).build();
        });

        assert!(!scene.is_alive(first));
        assert_eq!(scene.entity_count(), 0);
        assert_eq!(
            scene.last_apply_report(),
            ApplyReport {
                applied: 1,
                skipped: 2
            }
        );
    }

    // -- 8. Reports across nested and empty replays -------------------------

    #[test]
    fn nested_replay_counts_toward_outer_report() {
        let mut scene = setup_scene();
        let victim = scene.spawn_with(Marker);
        scene.spawn_with(Health(1));

        scene.query::<&Health>().for_each(|_, _, commands| {
            commands
                .spawn()
                .on_spawn(|scene, _| {
                    scene.query::<&Marker>().for_each(|entity, _, commands| {
                        commands.destroy(entity);
                    });
                })
                .build();
        });

        assert!(!scene.is_alive(victim));
        assert_eq!(
            scene.last_apply_report(),
            ApplyReport {
                applied: 2,
                skipped: 0
            }
        );
    }

    #[test]
    fn empty_replay_resets_report() {
        let mut scene = setup_scene();
        scene.spawn_with(Health(1));

        scene.query::<&Health>().for_each(|entity, _, commands| {
            commands.add_component(entity, Marker);
        });
        assert_eq!(scene.last_apply_report().applied, 1);

        scene.query::<&Health>().for_each(|_, _, _| {});
        assert_eq!(scene.last_apply_report(), ApplyReport::default());
    }

    // -- 9. Removing an unregistered type queues nothing --------------------

    #[test]
    fn remove_unregistered_queues_nothing() {
        #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
        struct Unknown;

        let mut scene = setup_scene();
        scene.spawn_with(Health(1));
        scene.query::<()>().for_each(|entity, (), commands| {
            commands.remove_component::<Unknown>(entity);
            assert_eq!(commands.queued(), 0);
        });
        assert_eq!(scene.last_apply_report(), ApplyReport::default());
    }

    // -- 10. JSON payloads --------------------------------------------------

    #[test]
    fn add_component_json_resolves_by_name() {
        let mut scene = setup_scene();
        let e = scene.spawn_with(Marker);

        scene.query::<&Marker>().for_each(|entity, _, commands| {
            commands
                .add_component_json(entity, "health", &serde_json::json!(12))
                .unwrap();
            assert!(commands
                .add_component_json(entity, "mana", &serde_json::json!(1))
                .is_err());
        });

        assert_eq!(scene.get_component::<Health>(e), Some(&Health(12)));
    }

    // -- 11. Debug output ---------------------------------------------------

    #[test]
    fn command_debug_lists_component_ids() {
        let command = Command::RemoveComponent {
            entity: Entity::new(1, 0),
            component: ComponentTypeId(3),
        };
        assert_eq!(
            format!("{command:?}"),
            "RemoveComponent { entity: Entity(1v0), component: ComponentTypeId(3) }"
        );
        assert_eq!(command.target(), Entity::new(1, 0));
    }
}
