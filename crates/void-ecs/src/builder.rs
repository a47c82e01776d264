//! Fluent entity construction.
//!
//! [`EntityBuilder`] collects component values and hands the finished set to
//! a [`Spawner`]. [`Scene`] spawns immediately; [`Commands`] reserves the
//! entity and defers placement until the current query iteration ends.
//!
//! [`Commands`]: crate::command::Commands

use crate::component::{
    BoxedComponent, Component, ComponentMap, ComponentRegistry, ComponentTypeId,
};
use crate::entity::Entity;
use crate::scene::Scene;
use crate::EcsError;

/// Runs once, right after a spawned entity has been placed into storage.
pub type SpawnCallback = Box<dyn FnOnce(&mut Scene, Entity)>;

/// Something an [`EntityBuilder`] can finish into.
pub trait Spawner {
    /// Registry used to resolve component types while building.
    fn registry(&self) -> &ComponentRegistry;

    /// Create an entity holding exactly `components`.
    fn spawn_components(
        &mut self,
        components: ComponentMap,
        callback: Option<SpawnCallback>,
    ) -> Entity;
}

/// Look up `name` in `registry` and deserialize `value` as that component.
pub(crate) fn deserialize_named(
    registry: &ComponentRegistry,
    name: &str,
    value: &serde_json::Value,
) -> Result<(ComponentTypeId, BoxedComponent), EcsError> {
    let info = registry
        .lookup_by_name(name)
        .and_then(|id| registry.info(id))
        .ok_or_else(|| EcsError::UnknownComponent {
            name: name.to_owned(),
            registered: registry.registered_names().join(", "),
        })?;
    let data = (info.ops.deserialize)(value).map_err(|e| EcsError::ComponentDeserialization {
        component: name.to_owned(),
        details: e.to_string(),
    })?;
    Ok((info.id, data))
}

/// Builder returned by `spawn()` on a [`Scene`] or a
/// [`Commands`](crate::command::Commands) handle.
///
/// Adding the same component type twice keeps the last value.
#[must_use = "an entity is only created by calling `build`"]
pub struct EntityBuilder<'s, S: Spawner> {
    spawner: &'s mut S,
    components: ComponentMap,
    callback: Option<SpawnCallback>,
}

impl<'s, S: Spawner> EntityBuilder<'s, S> {
    pub(crate) fn new(spawner: &'s mut S) -> Self {
        Self {
            spawner,
            components: ComponentMap::new(),
            callback: None,
        }
    }

    /// Add a component value.
    ///
    /// # Panics
    ///
    /// Panics if `T` has not been registered.
    pub fn with<T: Component>(mut self, value: T) -> Self {
        let id = self.spawner.registry().lookup::<T>().unwrap_or_else(|| {
            panic!(
                "component type {} is not registered",
                std::any::type_name::<T>()
            )
        });
        self.components.insert(id, Box::new(value));
        self
    }

    /// Add a component from serialized data, resolved by registered name.
    pub fn with_json(mut self, name: &str, value: &serde_json::Value) -> Result<Self, EcsError> {
        let (id, data) = deserialize_named(self.spawner.registry(), name, value)?;
        self.components.insert(id, data);
        Ok(self)
    }

    /// Run `callback` once the entity has been placed. For deferred spawns
    /// this happens during command replay.
    pub fn on_spawn(mut self, callback: impl FnOnce(&mut Scene, Entity) + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Number of distinct components collected so far.
    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Create the entity.
    pub fn build(self) -> Entity {
        self.spawner.spawn_components(self.components, self.callback)
    }
}
