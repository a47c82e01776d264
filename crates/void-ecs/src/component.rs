//! Component type registration and metadata.
//!
//! Every component type used in a [`Scene`](crate::scene::Scene) must be
//! registered in that scene's [`ComponentRegistry`]. Registration produces a
//! dense [`ComponentTypeId`] that keys archetype columns and query matching,
//! plus a [`ComponentInfo`] holding the function pointers needed to build a
//! column for the type and to rebuild values from serialized data.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::archetype::{Column, TypedColumn};

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

/// Bound shared by every storable component type.
///
/// Blanket-implemented; there is nothing to implement by hand.
pub trait Component: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Component for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A type-erased component value in flight between archetypes or through the
/// command buffer.
pub type BoxedComponent = Box<dyn Any + Send + Sync>;

/// One entity's full component set, keyed (and therefore ordered) by id.
pub type ComponentMap = BTreeMap<ComponentTypeId, BoxedComponent>;

// ---------------------------------------------------------------------------
// ComponentTypeId
// ---------------------------------------------------------------------------

/// Opaque, lightweight identifier for a registered component type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentTypeId(pub(crate) u32);

impl ComponentTypeId {
    /// Position of this type in its registry's slot table.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ComponentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentTypeId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// ComponentOps / ComponentInfo
// ---------------------------------------------------------------------------

/// Per-type operations resolved once at registration time.
#[derive(Clone, Copy)]
pub struct ComponentOps {
    /// Build an empty column for this type with the given row capacity.
    pub new_column: fn(usize) -> Box<dyn Column>,
    /// Rebuild a boxed value from its serialized JSON form.
    pub deserialize: fn(&serde_json::Value) -> Result<BoxedComponent, serde_json::Error>,
}

impl ComponentOps {
    fn of<T: Component>() -> Self {
        fn new_column<T: Component>(capacity: usize) -> Box<dyn Column> {
            Box::new(TypedColumn::<T>::with_capacity(capacity))
        }

        fn deserialize<T: Component>(
            value: &serde_json::Value,
        ) -> Result<BoxedComponent, serde_json::Error> {
            let typed: T = T::deserialize(value)?;
            Ok(Box::new(typed))
        }

        Self {
            new_column: new_column::<T>,
            deserialize: deserialize::<T>,
        }
    }
}

impl fmt::Debug for ComponentOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentOps").finish_non_exhaustive()
    }
}

/// Metadata about a registered component type.
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    /// Unique ID assigned at registration time.
    pub id: ComponentTypeId,
    /// Name supplied by the caller; used for serialized component maps.
    pub name: String,
    /// `std::any::type_name::<T>()`, for diagnostics.
    pub type_name: &'static str,
    /// Rust `TypeId` for runtime type checking.
    pub type_id: TypeId,
    /// Column construction and deserialization for this type.
    pub ops: ComponentOps,
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Registry mapping Rust types and names to [`ComponentTypeId`]s.
///
/// A type can only be registered once; subsequent registrations of the same
/// Rust type return the existing [`ComponentTypeId`].
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    /// TypeId -> ComponentTypeId for dedup.
    by_type: HashMap<TypeId, ComponentTypeId>,
    /// Name -> ComponentTypeId for lookups from serialized data.
    by_name: HashMap<String, ComponentTypeId>,
    /// Indexed by ComponentTypeId.0.
    infos: Vec<ComponentInfo>,
}

impl ComponentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component type under the given `name`.
    ///
    /// If the type has already been registered, the existing
    /// [`ComponentTypeId`] is returned and `name` is ignored.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered for a different type.
    pub fn register<T: Component>(&mut self, name: &str) -> ComponentTypeId {
        let rust_type_id = TypeId::of::<T>();
        if let Some(&existing) = self.by_type.get(&rust_type_id) {
            return existing;
        }
        if self.by_name.contains_key(name) {
            panic!(
                "component name '{}' is already registered for a different type",
                name
            );
        }

        let id = ComponentTypeId(self.infos.len() as u32);
        self.infos.push(ComponentInfo {
            id,
            name: name.to_owned(),
            type_name: std::any::type_name::<T>(),
            type_id: rust_type_id,
            ops: ComponentOps::of::<T>(),
        });
        self.by_type.insert(rust_type_id, id);
        self.by_name.insert(name.to_owned(), id);
        tracing::debug!(component = %name, id = id.0, "registered component type");
        id
    }

    /// Look up a component type by its Rust type.
    #[inline]
    pub fn lookup<T: 'static>(&self) -> Option<ComponentTypeId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Look up a component type by its registered name.
    pub fn lookup_by_name(&self, name: &str) -> Option<ComponentTypeId> {
        self.by_name.get(name).copied()
    }

    /// Get the [`ComponentInfo`] for a registered component type ID.
    #[inline]
    pub fn info(&self, id: ComponentTypeId) -> Option<&ComponentInfo> {
        self.infos.get(id.index())
    }

    /// Registered name of a component type.
    pub fn name(&self, id: ComponentTypeId) -> Option<&str> {
        self.info(id).map(|info| info.name.as_str())
    }

    /// Total number of registered component types.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Whether any component types have been registered.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Returns the names of all registered component types, sorted.
    pub fn registered_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_name.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
