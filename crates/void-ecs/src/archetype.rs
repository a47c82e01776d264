//! Archetype storage.
//!
//! An [`Archetype`] stores all entities that share the exact same set of
//! component types. Within each archetype, components are laid out in a
//! Structure-of-Arrays (SoA) pattern: one [`Column`] per component type, plus
//! a parallel `Vec<Entity>` that maps row index to entity.
//!
//! Columns are type-erased behind the [`Column`] trait object and recovered
//! with `Any` downcasts, so the storage layer needs no `unsafe`. Rows are kept
//! dense with swap-remove; the caller is told which entity was moved so it
//! can patch that entity's recorded location.

use std::any::Any;
use std::fmt;

use crate::component::{
    BoxedComponent, Component, ComponentMap, ComponentRegistry, ComponentTypeId,
};
use crate::entity::Entity;

// ---------------------------------------------------------------------------
// ArchetypeId
// ---------------------------------------------------------------------------

/// Identifies an archetype within a scene. Indexes the archetype graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchetypeId(pub(crate) u32);

impl ArchetypeId {
    /// The archetype every entity starts in: no components at all.
    pub const EMPTY: ArchetypeId = ArchetypeId(0);

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// ---------------------------------------------------------------------------
// Column
// ---------------------------------------------------------------------------

/// A type-erased, densely packed column of one component type.
///
/// The only implementation is [`TypedColumn<T>`]; the trait exists so an
/// archetype can hold columns of different types side by side.
pub trait Column: Any + Send + Sync {
    /// Number of rows.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a value.
    ///
    /// # Panics
    ///
    /// Panics if `value` is not of this column's component type.
    fn push_boxed(&mut self, value: BoxedComponent);

    /// Overwrite the value at `row`.
    ///
    /// # Panics
    ///
    /// Panics if `value` is not of this column's component type or `row` is
    /// out of bounds.
    fn set_boxed(&mut self, row: usize, value: BoxedComponent);

    /// Swap-remove `row` and hand the value back.
    fn swap_remove_boxed(&mut self, row: usize) -> BoxedComponent;

    /// Swap-remove `row` and drop the value.
    fn swap_remove_drop(&mut self, row: usize);

    /// Serialize the value at `row`.
    fn to_json(&self, row: usize) -> Result<serde_json::Value, serde_json::Error>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Column backed by a plain `Vec<T>`.
#[derive(Debug, Clone)]
pub struct TypedColumn<T>(Vec<T>);

impl<T: Component> TypedColumn<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.0
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.0
    }

    fn unbox(value: BoxedComponent) -> T {
        match value.downcast::<T>() {
            Ok(typed) => *typed,
            Err(_) => panic!(
                "value pushed into a column of {}",
                std::any::type_name::<T>()
            ),
        }
    }
}

impl<T: Component> Column for TypedColumn<T> {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn push_boxed(&mut self, value: BoxedComponent) {
        self.0.push(Self::unbox(value));
    }

    fn set_boxed(&mut self, row: usize, value: BoxedComponent) {
        self.0[row] = Self::unbox(value);
    }

    fn swap_remove_boxed(&mut self, row: usize) -> BoxedComponent {
        Box::new(self.0.swap_remove(row))
    }

    fn swap_remove_drop(&mut self, row: usize) {
        self.0.swap_remove(row);
    }

    fn to_json(&self, row: usize) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(&self.0[row])
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Archetype
// ---------------------------------------------------------------------------

/// An archetype stores all entities that share the exact same set of
/// component types. Components are laid out SoA-style: one [`Column`] per
/// type, plus a parallel entity vector.
///
/// `component_types` is sorted and deduplicated, and `columns[i]` always
/// holds values of `component_types[i]`. Every column has exactly
/// `entities.len()` rows.
pub struct Archetype {
    id: ArchetypeId,
    component_types: Vec<ComponentTypeId>,
    columns: Vec<Box<dyn Column>>,
    entities: Vec<Entity>,
}

impl Archetype {
    /// Create an empty archetype with one column per component type.
    ///
    /// `component_types` must be sorted and free of duplicates.
    ///
    /// # Panics
    ///
    /// Panics if a component type is not registered in `registry`.
    pub fn new(
        id: ArchetypeId,
        component_types: Vec<ComponentTypeId>,
        registry: &ComponentRegistry,
        row_capacity: usize,
    ) -> Self {
        debug_assert!(component_types.windows(2).all(|w| w[0] < w[1]));
        let columns = component_types
            .iter()
            .map(|&ty| {
                let info = registry
                    .info(ty)
                    .unwrap_or_else(|| panic!("component type {ty:?} is not registered"));
                (info.ops.new_column)(row_capacity)
            })
            .collect();
        Self {
            id,
            component_types,
            columns,
            entities: Vec::with_capacity(row_capacity),
        }
    }

    #[inline]
    fn column_index(&self, type_id: ComponentTypeId) -> Option<usize> {
        self.component_types.binary_search(&type_id).ok()
    }

    /// The archetype's unique ID.
    #[inline]
    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    /// The sorted set of component type IDs that define this archetype.
    #[inline]
    pub fn component_types(&self) -> &[ComponentTypeId] {
        &self.component_types
    }

    /// Whether this archetype contains the given component type.
    #[inline]
    pub fn has_component(&self, type_id: ComponentTypeId) -> bool {
        self.column_index(type_id).is_some()
    }

    /// Number of entities stored in this archetype.
    #[inline]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Entities in row order.
    #[inline]
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// Append `entity` as a new row and return that row.
    ///
    /// # Panics
    ///
    /// Panics unless `components` holds exactly one value for each of this
    /// archetype's component types.
    pub fn add_entity(&mut self, entity: Entity, mut components: ComponentMap) -> usize {
        assert_eq!(
            components.len(),
            self.component_types.len(),
            "component set does not match archetype {:?}",
            self.id
        );
        for (ty, column) in self.component_types.iter().zip(&mut self.columns) {
            let value = components
                .remove(ty)
                .unwrap_or_else(|| panic!("missing {ty:?} for archetype {:?}", self.id));
            column.push_boxed(value);
        }
        self.entities.push(entity);
        self.entities.len() - 1
    }

    /// Swap-remove the entity at `row` and return its component values.
    ///
    /// The second element is the entity that was moved into `row` to fill
    /// the gap, or `None` if `row` was the last row.
    pub fn remove_entity(&mut self, row: usize) -> (ComponentMap, Option<Entity>) {
        let values = self
            .component_types
            .iter()
            .zip(&mut self.columns)
            .map(|(&ty, column)| (ty, column.swap_remove_boxed(row)))
            .collect();
        self.entities.swap_remove(row);
        (values, self.entities.get(row).copied())
    }

    /// Swap-remove the entity at `row`, dropping its component values.
    ///
    /// Returns the entity moved into `row`, as for
    /// [`remove_entity`](Self::remove_entity).
    pub fn drop_entity(&mut self, row: usize) -> Option<Entity> {
        for column in &mut self.columns {
            column.swap_remove_drop(row);
        }
        self.entities.swap_remove(row);
        self.entities.get(row).copied()
    }

    /// Drop every row.
    pub(crate) fn clear(&mut self) {
        while !self.entities.is_empty() {
            self.drop_entity(self.entities.len() - 1);
        }
    }

    /// Typed read access to one value.
    pub fn get<T: Component>(&self, row: usize, type_id: ComponentTypeId) -> Option<&T> {
        let column = &self.columns[self.column_index(type_id)?];
        column
            .as_any()
            .downcast_ref::<TypedColumn<T>>()?
            .as_slice()
            .get(row)
    }

    /// Typed write access to one value.
    pub fn get_mut<T: Component>(
        &mut self,
        row: usize,
        type_id: ComponentTypeId,
    ) -> Option<&mut T> {
        let index = self.column_index(type_id)?;
        self.columns[index]
            .as_any_mut()
            .downcast_mut::<TypedColumn<T>>()?
            .as_mut_slice()
            .get_mut(row)
    }

    /// Typed view of a whole column.
    pub fn column<T: Component>(&self, type_id: ComponentTypeId) -> Option<&[T]> {
        let column = &self.columns[self.column_index(type_id)?];
        Some(column.as_any().downcast_ref::<TypedColumn<T>>()?.as_slice())
    }

    /// Overwrite one value. Returns `false` if this archetype has no column
    /// for `type_id`.
    pub fn set_boxed(
        &mut self,
        row: usize,
        type_id: ComponentTypeId,
        value: BoxedComponent,
    ) -> bool {
        match self.column_index(type_id) {
            Some(index) => {
                self.columns[index].set_boxed(row, value);
                true
            }
            None => false,
        }
    }

    /// Serialize one value, or `None` if this archetype has no such column.
    pub fn to_json(
        &self,
        row: usize,
        type_id: ComponentTypeId,
    ) -> Option<Result<serde_json::Value, serde_json::Error>> {
        let index = self.column_index(type_id)?;
        Some(self.columns[index].to_json(row))
    }

    /// Split the archetype into its entity list and individually claimable
    /// columns, for query iteration.
    pub(crate) fn query_slots(&mut self) -> (&[Entity], ColumnSlots<'_>) {
        let slots = ColumnSlots {
            types: &self.component_types,
            columns: self.columns.iter_mut().map(Some).collect(),
        };
        (&self.entities, slots)
    }
}

impl fmt::Debug for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archetype")
            .field("id", &self.id)
            .field("component_types", &self.component_types)
            .field("len", &self.entities.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ColumnSlots
// ---------------------------------------------------------------------------

/// Columns of one archetype, each of which can be claimed at most once.
///
/// Claiming hands out a borrow for the full lifetime of the split, which is
/// what lets a query hold `&mut` to several columns at the same time.
pub struct ColumnSlots<'a> {
    types: &'a [ComponentTypeId],
    columns: Vec<Option<&'a mut Box<dyn Column>>>,
}

impl<'a> ColumnSlots<'a> {
    fn claim<T: Component>(&mut self, type_id: ComponentTypeId) -> Option<&'a mut TypedColumn<T>> {
        let index = self.types.binary_search(&type_id).ok()?;
        let column: &'a mut Box<dyn Column> = self.columns[index].take()?;
        column.as_any_mut().downcast_mut::<TypedColumn<T>>()
    }

    /// Claim a column for reading. `None` if absent or already claimed.
    pub fn take_ref<T: Component>(&mut self, type_id: ComponentTypeId) -> Option<&'a [T]> {
        self.claim::<T>(type_id).map(|column| &*column.as_mut_slice())
    }

    /// Claim a column for writing. `None` if absent or already claimed.
    pub fn take_mut<T: Component>(&mut self, type_id: ComponentTypeId) -> Option<&'a mut [T]> {
        self.claim::<T>(type_id).map(TypedColumn::as_mut_slice)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
