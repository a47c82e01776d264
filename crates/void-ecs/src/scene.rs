//! The [`Scene`] is the top-level container for the ECS. It owns the entity
//! allocator, the component registry, the archetype graph, the query cache,
//! the deferred command buffer, and the event queue, and it is the only code
//! that moves entities between archetypes.
//!
//! Every storage move goes through [`Scene::detach`], which swap-removes the
//! row *and* patches the location of whichever entity was moved into the
//! gap. No other code path touches row indices, so the archetype's
//! row -> entity list and the allocator's entity -> row record cannot drift
//! apart.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::trace;

use crate::archetype::{Archetype, ArchetypeId};
use crate::builder::{EntityBuilder, SpawnCallback, Spawner};
use crate::command::{ApplyReport, CommandBuffer, Commands};
use crate::component::{
    BoxedComponent, Component, ComponentMap, ComponentRegistry, ComponentTypeId,
};
use crate::config::SceneConfig;
use crate::entity::{Entity, EntityAllocator, EntityLocation};
use crate::event::{EcsEvent, EventQueue, SubscriberId};
use crate::graph::ArchetypeGraph;
use crate::query::{resolve_access, QueryCache, QueryData, QueryDescriptor};
use crate::EcsError;

// ---------------------------------------------------------------------------
// Scene
// ---------------------------------------------------------------------------

/// An independent ECS instance.
#[derive(Debug)]
pub struct Scene {
    config: SceneConfig,
    entities: EntityAllocator,
    registry: ComponentRegistry,
    graph: ArchetypeGraph,
    cache: QueryCache,
    commands: CommandBuffer,
    events: EventQueue,
    iterating: bool,
    last_apply_report: ApplyReport,
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl Scene {
    /// Create an empty scene with default capacities.
    pub fn new() -> Self {
        Self::with_config(SceneConfig::default())
    }

    /// Create an empty scene sized by `config`.
    pub fn with_config(config: SceneConfig) -> Self {
        Self {
            entities: EntityAllocator::with_capacity(config.entity_capacity),
            registry: ComponentRegistry::new(),
            graph: ArchetypeGraph::new(config.row_capacity),
            cache: QueryCache::new(),
            commands: CommandBuffer::new(),
            events: EventQueue::with_capacity(config.event_capacity),
            iterating: false,
            last_apply_report: ApplyReport::default(),
            config,
        }
    }

    pub fn config(&self) -> &SceneConfig {
        &self.config
    }

    /// Register a component type so it can be stored in this scene.
    ///
    /// See [`ComponentRegistry::register`].
    pub fn register_component<T: Component>(&mut self, name: &str) -> ComponentTypeId {
        self.registry.register::<T>(name)
    }

    #[inline]
    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    fn component_id<T: Component>(&self) -> ComponentTypeId {
        self.registry.lookup::<T>().unwrap_or_else(|| {
            panic!(
                "component type {} is not registered",
                std::any::type_name::<T>()
            )
        })
    }

    // -- entity lifecycle ---------------------------------------------------

    /// Start building an entity. Nothing is created until
    /// [`EntityBuilder::build`].
    pub fn spawn(&mut self) -> EntityBuilder<'_, Scene> {
        EntityBuilder::new(self)
    }

    /// Spawn an entity with a single component.
    ///
    /// # Panics
    ///
    /// Panics if `T` has not been registered.
    pub fn spawn_with<T: Component>(&mut self, component: T) -> Entity {
        self.spawn().with(component).build()
    }

    /// Allocate an entity identity without placing it into storage. The
    /// entity is alive but invisible to queries until a component is added.
    pub fn reserve_entity(&mut self) -> Entity {
        self.entities.allocate()
    }

    /// Destroy an entity. Returns `false` (and does nothing) if it was
    /// already dead.
    ///
    /// `EntityDestroyed` is only emitted for entities that had been placed
    /// into storage, matching the `EntityCreated` they emitted.
    pub fn destroy(&mut self, entity: Entity) -> bool {
        if !self.entities.is_alive(entity) {
            return false;
        }
        if let Some(location) = self.entities.location(entity) {
            self.detach_and_drop(entity, location);
            self.events.push(EcsEvent::EntityDestroyed { entity });
        }
        self.entities.deallocate(entity);
        true
    }

    /// `true` if `entity` has not been destroyed.
    #[inline]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    /// Number of live entities, reserved ones included.
    #[inline]
    pub fn entity_count(&self) -> usize {
        self.entities.alive_count()
    }

    /// Every live entity, in slot order.
    pub fn alive_entities(&self) -> Vec<Entity> {
        self.entities.alive_entities()
    }

    /// Where a live, placed entity's components are stored.
    #[inline]
    pub fn location(&self, entity: Entity) -> Option<EntityLocation> {
        self.entities.location(entity)
    }

    // -- component access ---------------------------------------------------

    /// Add a component, or overwrite it in place if the entity already has
    /// one of this type (no transition and no event in that case).
    ///
    /// Returns `false` if the entity is dead.
    ///
    /// # Panics
    ///
    /// Panics if `T` has not been registered.
    pub fn add_component<T: Component>(&mut self, entity: Entity, value: T) -> bool {
        let component = self.component_id::<T>();
        self.insert_boxed(entity, component, Box::new(value))
    }

    /// Add a component from serialized data, resolved by registered name.
    ///
    /// Returns `Ok(false)` if the entity is dead.
    pub fn add_component_json(
        &mut self,
        entity: Entity,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<bool, EcsError> {
        let (component, data) = crate::builder::deserialize_named(&self.registry, name, value)?;
        Ok(self.insert_boxed(entity, component, data))
    }

    /// Remove a component and return its value. `None` if the entity is dead
    /// or does not have it.
    pub fn remove_component<T: Component>(&mut self, entity: Entity) -> Option<T> {
        let component = self.registry.lookup::<T>()?;
        let value = self.remove_boxed(entity, component)?;
        value.downcast::<T>().ok().map(|boxed| *boxed)
    }

    /// Borrow a component.
    pub fn get_component<T: Component>(&self, entity: Entity) -> Option<&T> {
        let component = self.registry.lookup::<T>()?;
        let location = self.entities.location(entity)?;
        self.graph
            .archetype(location.archetype)?
            .get::<T>(location.row, component)
    }

    /// Mutably borrow a component. Changing it in place emits no event.
    pub fn get_component_mut<T: Component>(&mut self, entity: Entity) -> Option<&mut T> {
        let component = self.registry.lookup::<T>()?;
        let location = self.entities.location(entity)?;
        self.graph
            .archetype_mut(location.archetype)?
            .get_mut::<T>(location.row, component)
    }

    /// Overwrite a component the entity already has. Returns `false` if the
    /// entity is dead or lacks the component; nothing is added in that case.
    pub fn set_component<T: Component>(&mut self, entity: Entity, value: T) -> bool {
        match self.get_component_mut::<T>(entity) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn has_component<T: Component>(&self, entity: Entity) -> bool {
        let Some(component) = self.registry.lookup::<T>() else {
            return false;
        };
        self.entities
            .location(entity)
            .and_then(|location| self.graph.archetype(location.archetype))
            .is_some_and(|archetype| archetype.has_component(component))
    }

    /// The sorted component set of a live entity. Reserved entities report
    /// an empty set.
    pub fn component_ids(&self, entity: Entity) -> Option<&[ComponentTypeId]> {
        match self.entities.metadata(entity)?.location {
            Some(location) => self
                .graph
                .archetype(location.archetype)
                .map(Archetype::component_types),
            None => Some(&[]),
        }
    }

    /// Every component of a live entity, serialized and keyed by registered
    /// name. `Ok(None)` if the entity is dead.
    pub fn all_components(
        &self,
        entity: Entity,
    ) -> Result<Option<BTreeMap<String, serde_json::Value>>, EcsError> {
        let Some(meta) = self.entities.metadata(entity) else {
            return Ok(None);
        };
        let mut out = BTreeMap::new();
        let Some(location) = meta.location else {
            return Ok(Some(out));
        };
        let archetype = self
            .graph
            .archetype(location.archetype)
            .expect("entity location points at a missing archetype");
        for &component in archetype.component_types() {
            let name = self.registry.name(component).unwrap_or("<unregistered>");
            let value = archetype
                .to_json(location.row, component)
                .expect("archetype is missing a column for its own component type")
                .map_err(|e| EcsError::ComponentSerialization {
                    component: name.to_owned(),
                    details: e.to_string(),
                })?;
            out.insert(name.to_owned(), value);
        }
        Ok(Some(out))
    }

    // -- archetypes and queries ---------------------------------------------

    /// Start a typed query. See [`QueryBuilder`].
    pub fn query<Q: QueryData>(&mut self) -> QueryBuilder<'_, Q> {
        QueryBuilder::new(self)
    }

    /// Archetypes matching `query`, from the cache when it is current.
    pub fn matched_archetypes(&mut self, query: &QueryDescriptor) -> Arc<[ArchetypeId]> {
        self.cache.matched(query, &self.graph)
    }

    pub fn archetypes(&self) -> &[Archetype] {
        self.graph.archetypes()
    }

    pub fn archetype(&self, id: ArchetypeId) -> Option<&Archetype> {
        self.graph.archetype(id)
    }

    /// Number of archetypes, the empty archetype included.
    pub fn archetype_count(&self) -> usize {
        self.graph.len()
    }

    /// Whether a query iteration is in progress.
    #[inline]
    pub fn is_iterating(&self) -> bool {
        self.iterating
    }

    /// Outcome of the deferred-command replay that ended the most recent
    /// query iteration.
    ///
    /// An iteration that queued nothing resets this to the default. Commands
    /// replayed by queries nested in `on_spawn` callbacks count toward the
    /// outer replay.
    pub fn last_apply_report(&self) -> ApplyReport {
        self.last_apply_report
    }

    /// Take the current report, leaving the default behind.
    pub(crate) fn take_apply_report(&mut self) -> ApplyReport {
        std::mem::take(&mut self.last_apply_report)
    }

    // -- events ---------------------------------------------------------------

    /// Deliver pending events to subscribers and return them.
    pub fn flush_events(&mut self) -> Vec<EcsEvent> {
        self.events.flush()
    }

    /// Number of events waiting for the next flush.
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    pub fn subscribe(&mut self, handler: impl FnMut(&EcsEvent) + 'static) -> SubscriberId {
        self.events.subscribe(handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        self.events.unsubscribe(id)
    }

    // -- reset --------------------------------------------------------------

    /// Destroy every entity and archetype.
    ///
    /// Handles from before the clear stay dead. Cached queries and pending
    /// events are discarded; no events are emitted. Registered component
    /// types and event subscribers are kept.
    ///
    /// Called from an `on_spawn` callback during command replay, the
    /// commands still waiting to replay target dead entities afterwards and
    /// are skipped.
    pub fn clear(&mut self) {
        self.entities.clear();
        self.graph.clear();
        self.cache.clear();
        self.events.clear();
    }

    // -- internal storage moves ---------------------------------------------

    /// Place an alive entity into the archetype for `components`.
    ///
    /// A reservation can already have been placed by the time its deferred
    /// spawn replays (an earlier `on_spawn` callback may add to it). The
    /// spawn's components are then merged one by one, so the entity keeps a
    /// single row.
    pub(crate) fn place_reserved(&mut self, entity: Entity, components: ComponentMap) {
        debug_assert!(self.entities.is_alive(entity));
        if self.entities.location(entity).is_some() {
            for (component, data) in components {
                self.insert_boxed(entity, component, data);
            }
            return;
        }

        let ids: Vec<ComponentTypeId> = components.keys().copied().collect();
        let archetype = self.graph.get_or_create(&ids, &self.registry);
        let row = self
            .graph
            .archetype_mut(archetype)
            .expect("freshly resolved archetype must exist")
            .add_entity(entity, components);
        self.entities
            .set_location(entity, EntityLocation { archetype, row });

        self.events.push(EcsEvent::EntityCreated { entity });
        for component in ids {
            self.events
                .push(EcsEvent::ComponentAdded { entity, component });
        }
    }

    /// Add or overwrite one type-erased component. Returns `false` if the
    /// entity is dead.
    pub(crate) fn insert_boxed(
        &mut self,
        entity: Entity,
        component: ComponentTypeId,
        data: BoxedComponent,
    ) -> bool {
        if !self.entities.is_alive(entity) {
            return false;
        }
        let Some(location) = self.entities.location(entity) else {
            let mut components = ComponentMap::new();
            components.insert(component, data);
            self.place_reserved(entity, components);
            return true;
        };

        let source = self
            .graph
            .archetype_mut(location.archetype)
            .expect("entity location points at a missing archetype");
        if source.has_component(component) {
            source.set_boxed(location.row, component, data);
            return true;
        }

        let target = self
            .graph
            .archetype_after_add(location.archetype, component, &self.registry);
        let mut values = self.detach(entity, location);
        values.insert(component, data);
        self.attach(entity, target, values);
        trace!(
            entity = %entity,
            from = location.archetype.0,
            to = target.0,
            "archetype transition (add)"
        );
        self.events
            .push(EcsEvent::ComponentAdded { entity, component });
        true
    }

    /// Remove one type-erased component. `None` if the entity is dead or
    /// lacks it.
    pub(crate) fn remove_boxed(
        &mut self,
        entity: Entity,
        component: ComponentTypeId,
    ) -> Option<BoxedComponent> {
        let location = self.entities.location(entity)?;
        if !self.graph.archetype(location.archetype)?.has_component(component) {
            return None;
        }
        let target = self
            .graph
            .archetype_after_remove(location.archetype, component, &self.registry);

        let mut values = self.detach(entity, location);
        let removed = values.remove(&component);
        self.attach(entity, target, values);
        trace!(
            entity = %entity,
            from = location.archetype.0,
            to = target.0,
            "archetype transition (remove)"
        );
        self.events
            .push(EcsEvent::ComponentRemoved { entity, component });
        removed
    }

    fn attach(&mut self, entity: Entity, archetype: ArchetypeId, values: ComponentMap) {
        let row = self
            .graph
            .archetype_mut(archetype)
            .expect("transition target archetype must exist")
            .add_entity(entity, values);
        self.entities
            .set_location(entity, EntityLocation { archetype, row });
    }

    /// Swap-remove `entity` from its archetype and return its values,
    /// patching the location of the entity that filled the gap.
    fn detach(&mut self, entity: Entity, location: EntityLocation) -> ComponentMap {
        let archetype = self
            .graph
            .archetype_mut(location.archetype)
            .expect("entity location points at a missing archetype");
        debug_assert_eq!(
            archetype.entities().get(location.row),
            Some(&entity),
            "row/entity mapping drifted"
        );
        let (values, moved) = archetype.remove_entity(location.row);
        if let Some(moved) = moved {
            self.entities.set_location(moved, location);
        }
        values
    }

    /// Like [`detach`](Self::detach), dropping the values.
    fn detach_and_drop(&mut self, entity: Entity, location: EntityLocation) {
        let archetype = self
            .graph
            .archetype_mut(location.archetype)
            .expect("entity location points at a missing archetype");
        debug_assert_eq!(
            archetype.entities().get(location.row),
            Some(&entity),
            "row/entity mapping drifted"
        );
        if let Some(moved) = archetype.drop_entity(location.row) {
            self.entities.set_location(moved, location);
        }
    }

    fn flush_commands(&mut self) {
        let mut pending = std::mem::take(&mut self.commands);
        self.last_apply_report = pending.apply(self);
    }
}

impl Spawner for Scene {
    fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    fn spawn_components(
        &mut self,
        components: ComponentMap,
        callback: Option<SpawnCallback>,
    ) -> Entity {
        let entity = self.entities.allocate();
        self.place_reserved(entity, components);
        if let Some(callback) = callback {
            callback(self, entity);
        }
        entity
    }
}

// ---------------------------------------------------------------------------
// QueryBuilder
// ---------------------------------------------------------------------------

/// A typed query over a [`Scene`], built with filters and consumed by a
/// terminal operation.
///
/// The fetched types in `Q` are always required. `with`, `without`, and
/// `any_of` add filters that do not fetch. `exclusive` restricts matching to
/// archetypes whose component set is exactly the fetched plus `with` types.
///
/// A filter or fetch naming an unregistered type that *must* be present
/// makes the query match nothing; an unregistered `without` type is ignored.
#[must_use = "queries do nothing until a terminal operation is called"]
pub struct QueryBuilder<'s, Q: QueryData> {
    scene: &'s mut Scene,
    with: Vec<ComponentTypeId>,
    without: Vec<ComponentTypeId>,
    any: Vec<ComponentTypeId>,
    any_requested: bool,
    exclusive: bool,
    unsatisfiable: bool,
    _marker: PhantomData<fn() -> Q>,
}

impl<'s, Q: QueryData> QueryBuilder<'s, Q> {
    fn new(scene: &'s mut Scene) -> Self {
        Self {
            scene,
            with: Vec::new(),
            without: Vec::new(),
            any: Vec::new(),
            any_requested: false,
            exclusive: false,
            unsatisfiable: false,
            _marker: PhantomData,
        }
    }

    /// Require `T` without fetching it.
    pub fn with<T: Component>(mut self) -> Self {
        match self.scene.registry.lookup::<T>() {
            Some(id) => self.with.push(id),
            None => self.unsatisfiable = true,
        }
        self
    }

    /// Skip entities that have `T`.
    pub fn without<T: Component>(mut self) -> Self {
        if let Some(id) = self.scene.registry.lookup::<T>() {
            self.without.push(id);
        }
        self
    }

    /// Require at least one of the `any_of` types.
    pub fn any_of<T: Component>(mut self) -> Self {
        self.any_requested = true;
        if let Some(id) = self.scene.registry.lookup::<T>() {
            self.any.push(id);
        }
        self
    }

    /// Match only archetypes holding exactly the fetched and `with` types.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// The descriptor this query resolves to, or `None` if it cannot match
    /// any archetype.
    ///
    /// # Panics
    ///
    /// Panics if `Q` fetches the same component type twice.
    pub fn descriptor(&self) -> Option<QueryDescriptor> {
        let mut required = resolve_access::<Q>(&self.scene.registry)?;
        if self.unsatisfiable || (self.any_requested && self.any.is_empty()) {
            return None;
        }
        required.extend_from_slice(&self.with);
        let descriptor = if self.exclusive {
            QueryDescriptor::new().exclusive(required)
        } else {
            QueryDescriptor::new()
                .all(required)
                .any(self.any.iter().copied())
                .none(self.without.iter().copied())
        };
        Some(descriptor)
    }

    /// Matching archetypes, through the scene's query cache.
    pub fn matched(mut self) -> Arc<[ArchetypeId]> {
        match self.descriptor() {
            Some(descriptor) => self.scene.matched_archetypes(&descriptor),
            None => Arc::from(Vec::new()),
        }
    }

    /// Matching entities, in archetype then row order.
    pub fn entities(mut self) -> Vec<Entity> {
        let Some(descriptor) = self.descriptor() else {
            return Vec::new();
        };
        let matched = self.scene.matched_archetypes(&descriptor);
        matched
            .iter()
            .filter_map(|&id| self.scene.graph.archetype(id))
            .flat_map(|archetype| archetype.entities().iter().copied())
            .collect()
    }

    /// Number of matching entities.
    pub fn count(mut self) -> usize {
        let Some(descriptor) = self.descriptor() else {
            return 0;
        };
        let matched = self.scene.matched_archetypes(&descriptor);
        matched
            .iter()
            .filter_map(|&id| self.scene.graph.archetype(id))
            .map(Archetype::len)
            .sum()
    }

    /// Run `f` for every matching entity.
    ///
    /// `f` receives the entity, the fetched components, and a [`Commands`]
    /// handle for structural changes. Those changes are applied in the
    /// order they were queued once the iteration ends, including when `f`
    /// panics.
    pub fn for_each<F>(self, f: F)
    where
        F: for<'a> FnMut(Entity, Q::Item<'a>, &mut Commands<'_>),
    {
        match self.run(Infallibly(f)) {
            Ok(()) => {}
            Err(never) => match never {},
        }
    }

    /// Like [`for_each`](Self::for_each), stopping at the first `Err`.
    /// Commands queued before the error are still applied.
    pub fn try_for_each<E, F>(self, f: F) -> Result<(), E>
    where
        F: for<'a> FnMut(Entity, Q::Item<'a>, &mut Commands<'_>) -> Result<(), E>,
    {
        self.run(Fallibly(f))
    }

    fn run<E, R: RowFn<Q, E>>(mut self, mut row: R) -> Result<(), E> {
        let Some(descriptor) = self.descriptor() else {
            return Ok(());
        };
        let matched = self.scene.matched_archetypes(&descriptor);

        let mut guard = IterationGuard::new(self.scene);
        let Scene {
            ref mut graph,
            ref mut entities,
            ref mut commands,
            ref registry,
            ..
        } = *guard.scene;
        let mut commands = Commands::new(commands, entities, registry);
        let archetypes = graph.archetypes_mut();

        for &id in matched.iter() {
            let archetype = &mut archetypes[id.index()];
            if archetype.is_empty() {
                continue;
            }
            let (rows, mut slots) = archetype.query_slots();
            let Some(mut fetch) = Q::fetch(registry, &mut slots) else {
                continue;
            };
            for &entity in rows {
                let Some(item) = Q::next(&mut fetch) else {
                    break;
                };
                row.call(entity, item, &mut commands)?;
            }
        }
        Ok(())
    }
}

/// Per-row callback shared by [`QueryBuilder::for_each`] and
/// [`QueryBuilder::try_for_each`].
trait RowFn<Q: QueryData, E> {
    fn call<'a>(
        &mut self,
        entity: Entity,
        item: Q::Item<'a>,
        commands: &mut Commands<'_>,
    ) -> Result<(), E>;
}

struct Infallibly<F>(F);

impl<Q, F> RowFn<Q, Infallible> for Infallibly<F>
where
    Q: QueryData,
    F: for<'a> FnMut(Entity, Q::Item<'a>, &mut Commands<'_>),
{
    #[inline]
    fn call<'a>(
        &mut self,
        entity: Entity,
        item: Q::Item<'a>,
        commands: &mut Commands<'_>,
    ) -> Result<(), Infallible> {
        (self.0)(entity, item, commands);
        Ok(())
    }
}

struct Fallibly<F>(F);

impl<Q, E, F> RowFn<Q, E> for Fallibly<F>
where
    Q: QueryData,
    F: for<'a> FnMut(Entity, Q::Item<'a>, &mut Commands<'_>) -> Result<(), E>,
{
    #[inline]
    fn call<'a>(
        &mut self,
        entity: Entity,
        item: Q::Item<'a>,
        commands: &mut Commands<'_>,
    ) -> Result<(), E> {
        (self.0)(entity, item, commands)
    }
}

// ---------------------------------------------------------------------------
// IterationGuard
// ---------------------------------------------------------------------------

/// Marks the scene as iterating for its lifetime and replays queued commands
/// when dropped, on every exit path.
struct IterationGuard<'s> {
    scene: &'s mut Scene,
}

impl<'s> IterationGuard<'s> {
    fn new(scene: &'s mut Scene) -> Self {
        debug_assert!(!scene.iterating, "nested query iteration");
        scene.iterating = true;
        Self { scene }
    }
}

impl Drop for IterationGuard<'_> {
    fn drop(&mut self) {
        self.scene.iterating = false;
        self.scene.flush_commands();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
