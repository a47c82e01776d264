//! The archetype graph: every archetype a scene has seen, keyed by its
//! canonical component set, plus memoized add/remove transitions.
//!
//! Archetype identity is a pure function of the *set* of component types, so
//! `[B, A, A]` and `[A, B]` resolve to the same archetype. A transition edge
//! `(from, component) -> to` is computed once and reused for the lifetime of
//! the graph (until [`ArchetypeGraph::clear`]).

use std::collections::HashMap;

use crate::archetype::{Archetype, ArchetypeId};
use crate::component::{ComponentRegistry, ComponentTypeId};

type Edge = (ArchetypeId, ComponentTypeId);

/// Registry of archetypes with memoized transitions between them.
///
/// Archetype `0` is always the empty archetype.
#[derive(Debug)]
pub struct ArchetypeGraph {
    archetypes: Vec<Archetype>,
    index: HashMap<Vec<ComponentTypeId>, ArchetypeId>,
    add_edges: HashMap<Edge, ArchetypeId>,
    remove_edges: HashMap<Edge, ArchetypeId>,
    /// Bumped on every archetype creation and on `clear`. Query caches
    /// compare against it.
    version: u64,
    row_capacity: usize,
}

impl Default for ArchetypeGraph {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ArchetypeGraph {
    /// Create a graph holding only the empty archetype. New archetypes
    /// reserve `row_capacity` rows per column up front.
    pub fn new(row_capacity: usize) -> Self {
        let empty = Archetype::new(
            ArchetypeId::EMPTY,
            Vec::new(),
            &ComponentRegistry::new(),
            row_capacity,
        );
        let mut index = HashMap::new();
        index.insert(Vec::new(), ArchetypeId::EMPTY);
        Self {
            archetypes: vec![empty],
            index,
            add_edges: HashMap::new(),
            remove_edges: HashMap::new(),
            version: 0,
            row_capacity,
        }
    }

    /// Resolve the archetype for a component set, creating it on first use.
    ///
    /// `component_types` may be in any order and may contain duplicates.
    ///
    /// # Panics
    ///
    /// Panics if a component type is not registered in `registry`.
    pub fn get_or_create(
        &mut self,
        component_types: &[ComponentTypeId],
        registry: &ComponentRegistry,
    ) -> ArchetypeId {
        let mut key = component_types.to_vec();
        key.sort_unstable();
        key.dedup();
        self.get_or_create_sorted(key, registry)
    }

    fn get_or_create_sorted(
        &mut self,
        key: Vec<ComponentTypeId>,
        registry: &ComponentRegistry,
    ) -> ArchetypeId {
        if let Some(&id) = self.index.get(&key) {
            return id;
        }
        let id = ArchetypeId(self.archetypes.len() as u32);
        let names: Vec<&str> = key.iter().filter_map(|&ty| registry.name(ty)).collect();
        tracing::debug!(archetype = id.0, components = ?names, "created archetype");
        self.archetypes
            .push(Archetype::new(id, key.clone(), registry, self.row_capacity));
        self.index.insert(key, id);
        self.version += 1;
        id
    }

    /// The archetype reached from `from` by adding `component`.
    ///
    /// Returns `from` itself if it already has the component. The edge is
    /// memoized in both directions.
    pub fn archetype_after_add(
        &mut self,
        from: ArchetypeId,
        component: ComponentTypeId,
        registry: &ComponentRegistry,
    ) -> ArchetypeId {
        if let Some(&to) = self.add_edges.get(&(from, component)) {
            return to;
        }
        let source = &self.archetypes[from.index()];
        if source.has_component(component) {
            return from;
        }
        let mut key = source.component_types().to_vec();
        let at = key.partition_point(|&ty| ty < component);
        key.insert(at, component);

        let to = self.get_or_create_sorted(key, registry);
        tracing::trace!(from = from.0, to = to.0, component = component.0, "memoized add edge");
        self.add_edges.insert((from, component), to);
        self.remove_edges.insert((to, component), from);
        to
    }

    /// The archetype reached from `from` by removing `component`.
    ///
    /// Returns `from` itself if it does not have the component. The edge is
    /// memoized in both directions.
    pub fn archetype_after_remove(
        &mut self,
        from: ArchetypeId,
        component: ComponentTypeId,
        registry: &ComponentRegistry,
    ) -> ArchetypeId {
        if let Some(&to) = self.remove_edges.get(&(from, component)) {
            return to;
        }
        let source = &self.archetypes[from.index()];
        if !source.has_component(component) {
            return from;
        }
        let key: Vec<ComponentTypeId> = source
            .component_types()
            .iter()
            .copied()
            .filter(|&ty| ty != component)
            .collect();

        let to = self.get_or_create_sorted(key, registry);
        tracing::trace!(from = from.0, to = to.0, component = component.0, "memoized remove edge");
        self.remove_edges.insert((from, component), to);
        self.add_edges.insert((to, component), from);
        to
    }

    /// Look up an archetype by id.
    #[inline]
    pub fn archetype(&self, id: ArchetypeId) -> Option<&Archetype> {
        self.archetypes.get(id.index())
    }

    #[inline]
    pub(crate) fn archetype_mut(&mut self, id: ArchetypeId) -> Option<&mut Archetype> {
        self.archetypes.get_mut(id.index())
    }

    /// Every archetype, in creation order.
    #[inline]
    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    pub(crate) fn archetypes_mut(&mut self) -> &mut [Archetype] {
        &mut self.archetypes
    }

    /// Number of archetypes, the empty one included.
    #[inline]
    pub fn len(&self) -> usize {
        self.archetypes.len()
    }

    /// Always `false`: the empty archetype is permanent.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.archetypes.is_empty()
    }

    /// Monotonic counter of structural changes to the archetype set.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Drop every archetype except the (emptied) empty archetype, and every
    /// memoized edge.
    pub fn clear(&mut self) {
        self.archetypes.truncate(1);
        self.archetypes[0].clear();
        self.index.retain(|key, _| key.is_empty());
        self.add_edges.clear();
        self.remove_edges.clear();
        self.version += 1;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
