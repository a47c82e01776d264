//! Query matching, the matched-archetype cache, and typed column fetches.
//!
//! A [`QueryDescriptor`] names four sets of component types (`all`, `any`,
//! `none`, `exclusive`). [`matches_query`] decides whether one archetype
//! satisfies it, and [`QueryCache`] remembers the matched archetype list per
//! descriptor until the archetype graph's version moves on. Entities moving
//! between *existing* archetypes never invalidate a cached result; only the
//! creation of a new archetype (or a graph clear) does.
//!
//! [`QueryData`] is implemented for `&T`, `&mut T`, `()` and tuples of up to
//! eight of those. It describes which columns a typed query reads and how to
//! walk them row by row.

use std::collections::HashMap;
use std::sync::Arc;

use crate::archetype::{ArchetypeId, ColumnSlots};
use crate::component::{Component, ComponentRegistry, ComponentTypeId};
use crate::graph::ArchetypeGraph;

// ---------------------------------------------------------------------------
// QueryDescriptor
// ---------------------------------------------------------------------------

/// Four component-type filters, kept sorted and deduplicated so that two
/// descriptors naming the same sets compare (and hash) equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct QueryDescriptor {
    all: Vec<ComponentTypeId>,
    any: Vec<ComponentTypeId>,
    none: Vec<ComponentTypeId>,
    exclusive: Vec<ComponentTypeId>,
}

fn normalize(ids: &mut Vec<ComponentTypeId>) {
    ids.sort_unstable();
    ids.dedup();
}

impl QueryDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require every one of `ids`.
    pub fn all(mut self, ids: impl IntoIterator<Item = ComponentTypeId>) -> Self {
        self.all.extend(ids);
        normalize(&mut self.all);
        self
    }

    /// Require at least one of `ids`.
    pub fn any(mut self, ids: impl IntoIterator<Item = ComponentTypeId>) -> Self {
        self.any.extend(ids);
        normalize(&mut self.any);
        self
    }

    /// Reject archetypes holding any of `ids`.
    pub fn none(mut self, ids: impl IntoIterator<Item = ComponentTypeId>) -> Self {
        self.none.extend(ids);
        normalize(&mut self.none);
        self
    }

    /// Require the archetype's component set to be exactly `ids`. When this
    /// set is non-empty the other three are ignored.
    pub fn exclusive(mut self, ids: impl IntoIterator<Item = ComponentTypeId>) -> Self {
        self.exclusive.extend(ids);
        normalize(&mut self.exclusive);
        self
    }

    pub fn all_ids(&self) -> &[ComponentTypeId] {
        &self.all
    }

    pub fn any_ids(&self) -> &[ComponentTypeId] {
        &self.any
    }

    pub fn none_ids(&self) -> &[ComponentTypeId] {
        &self.none
    }

    pub fn exclusive_ids(&self) -> &[ComponentTypeId] {
        &self.exclusive
    }
}

/// Whether an archetype with the sorted component set `types` satisfies
/// `query`.
pub fn matches_query(types: &[ComponentTypeId], query: &QueryDescriptor) -> bool {
    let has = |id: &ComponentTypeId| types.binary_search(id).is_ok();

    if !query.exclusive.is_empty() {
        return types.len() == query.exclusive.len() && query.exclusive.iter().all(has);
    }
    query.all.iter().all(has)
        && !query.none.iter().any(has)
        && (query.any.is_empty() || query.any.iter().any(has))
}

// ---------------------------------------------------------------------------
// QueryCache
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct CachedQuery {
    archetypes: Arc<[ArchetypeId]>,
    version: u64,
}

/// Matched-archetype lists, keyed by descriptor and stamped with the graph
/// version they were computed at.
#[derive(Debug, Default)]
pub struct QueryCache {
    entries: HashMap<QueryDescriptor, CachedQuery>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Archetypes matching `query`, in creation order.
    ///
    /// A hit returns the very same `Arc` as the previous call; a stale or
    /// missing entry is recomputed from `graph` and stored.
    pub fn matched(
        &mut self,
        query: &QueryDescriptor,
        graph: &ArchetypeGraph,
    ) -> Arc<[ArchetypeId]> {
        if let Some(cached) = self.entries.get(query) {
            if cached.version == graph.version() {
                return Arc::clone(&cached.archetypes);
            }
        }

        let archetypes: Arc<[ArchetypeId]> = graph
            .archetypes()
            .iter()
            .filter(|archetype| matches_query(archetype.component_types(), query))
            .map(|archetype| archetype.id())
            .collect();
        tracing::debug!(
            version = graph.version(),
            matched = archetypes.len(),
            "query cache miss"
        );
        self.entries.insert(
            query.clone(),
            CachedQuery {
                archetypes: Arc::clone(&archetypes),
                version: graph.version(),
            },
        );
        archetypes
    }

    /// Number of cached descriptors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ---------------------------------------------------------------------------
// QueryData
// ---------------------------------------------------------------------------

/// The fetched part of a typed query: `&T`, `&mut T`, `()`, or a tuple of
/// those.
pub trait QueryData {
    /// What the callback receives for one row.
    type Item<'a>;
    /// Per-archetype cursor over the claimed columns.
    type Fetch<'a>;

    /// Append the component ids this query reads, in declaration order.
    /// Returns `false` if any of them is not registered.
    fn component_access(registry: &ComponentRegistry, access: &mut Vec<ComponentTypeId>) -> bool;

    /// Claim this query's columns from one archetype.
    fn fetch<'a>(
        registry: &ComponentRegistry,
        slots: &mut ColumnSlots<'a>,
    ) -> Option<Self::Fetch<'a>>;

    /// Advance to the next row.
    fn next<'a>(fetch: &mut Self::Fetch<'a>) -> Option<Self::Item<'a>>;
}

/// Resolve the component ids a typed query reads.
///
/// Returns `None` if any of them is unregistered, in which case the query
/// can match nothing.
///
/// # Panics
///
/// Panics if the same component type is requested twice, which would hand
/// out aliasing references to one column.
pub fn resolve_access<Q: QueryData>(registry: &ComponentRegistry) -> Option<Vec<ComponentTypeId>> {
    let mut access = Vec::new();
    if !Q::component_access(registry, &mut access) {
        return None;
    }
    let mut sorted = access.clone();
    sorted.sort_unstable();
    if let Some(pair) = sorted.windows(2).find(|pair| pair[0] == pair[1]) {
        panic!(
            "query requests component '{}' more than once",
            registry.name(pair[0]).unwrap_or("<unknown>")
        );
    }
    Some(access)
}

impl<T: Component> QueryData for &T {
    type Item<'a> = &'a T;
    type Fetch<'a> = std::slice::Iter<'a, T>;

    fn component_access(registry: &ComponentRegistry, access: &mut Vec<ComponentTypeId>) -> bool {
        registry.lookup::<T>().map(|id| access.push(id)).is_some()
    }

    fn fetch<'a>(
        registry: &ComponentRegistry,
        slots: &mut ColumnSlots<'a>,
    ) -> Option<Self::Fetch<'a>> {
        let id = registry.lookup::<T>()?;
        slots.take_ref::<T>(id).map(|column| column.iter())
    }

    #[inline]
    fn next<'a>(fetch: &mut Self::Fetch<'a>) -> Option<Self::Item<'a>> {
        fetch.next()
    }
}

impl<T: Component> QueryData for &mut T {
    type Item<'a> = &'a mut T;
    type Fetch<'a> = std::slice::IterMut<'a, T>;

    fn component_access(registry: &ComponentRegistry, access: &mut Vec<ComponentTypeId>) -> bool {
        registry.lookup::<T>().map(|id| access.push(id)).is_some()
    }

    fn fetch<'a>(
        registry: &ComponentRegistry,
        slots: &mut ColumnSlots<'a>,
    ) -> Option<Self::Fetch<'a>> {
        let id = registry.lookup::<T>()?;
        slots.take_mut::<T>(id).map(|column| column.iter_mut())
    }

    #[inline]
    fn next<'a>(fetch: &mut Self::Fetch<'a>) -> Option<Self::Item<'a>> {
        fetch.next()
    }
}

impl QueryData for () {
    type Item<'a> = ();
    type Fetch<'a> = ();

    fn component_access(
        _registry: &ComponentRegistry,
        _access: &mut Vec<ComponentTypeId>,
    ) -> bool {
        true
    }

    fn fetch<'a>(
        _registry: &ComponentRegistry,
        _slots: &mut ColumnSlots<'a>,
    ) -> Option<Self::Fetch<'a>> {
        Some(())
    }

    #[inline]
    fn next<'a>(_fetch: &mut Self::Fetch<'a>) -> Option<Self::Item<'a>> {
        Some(())
    }
}

macro_rules! impl_query_data_tuple {
    ($($name:ident),+) => {
        impl<$($name: QueryData),+> QueryData for ($($name,)+) {
            type Item<'a> = ($($name::Item<'a>,)+);
            type Fetch<'a> = ($($name::Fetch<'a>,)+);

            fn component_access(
                registry: &ComponentRegistry,
                access: &mut Vec<ComponentTypeId>,
            ) -> bool {
                true $(&& $name::component_access(registry, access))+
            }

            fn fetch<'a>(
                registry: &ComponentRegistry,
                slots: &mut ColumnSlots<'a>,
            ) -> Option<Self::Fetch<'a>> {
                Some(($($name::fetch(registry, slots)?,)+))
            }

            #[inline]
            #[allow(non_snake_case)]
            fn next<'a>(fetch: &mut Self::Fetch<'a>) -> Option<Self::Item<'a>> {
                let ($($name,)+) = fetch;
                Some(($($name::next($name)?,)+))
            }
        }
    };
}

impl_query_data_tuple!(A);
impl_query_data_tuple!(A, B);
impl_query_data_tuple!(A, B, C);
impl_query_data_tuple!(A, B, C, D);
impl_query_data_tuple!(A, B, C, D, E);
impl_query_data_tuple!(A, B, C, D, E, F);
impl_query_data_tuple!(A, B, C, D, E, F, G);
impl_query_data_tuple!(A, B, C, D, E, F, G, H);

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{BoxedComponent, ComponentMap};
    use crate::entity::Entity;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Pos(f32);
    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Vel(f32);
    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Tag;

    fn ids(raw: &[u32]) -> Vec<ComponentTypeId> {
        raw.iter().map(|&n| ComponentTypeId(n)).collect()
    }

    fn setup() -> (ComponentRegistry, ComponentTypeId, ComponentTypeId, ComponentTypeId) {
        let mut reg = ComponentRegistry::new();
        let p = reg.register::<Pos>("pos");
        let v = reg.register::<Vel>("vel");
        let t = reg.register::<Tag>("tag");
        (reg, p, v, t)
    }

    // -- matching -----------------------------------------------------------

    #[test]
    fn all_requires_every_component() {
        let q = QueryDescriptor::new().all(ids(&[0, 1]));
        assert!(matches_query(&ids(&[0, 1, 2]), &q));
        assert!(!matches_query(&ids(&[0, 2]), &q));
    }

    #[test]
    fn none_rejects_any_overlap() {
        let q = QueryDescriptor::new().all(ids(&[0])).none(ids(&[2]));
        assert!(matches_query(&ids(&[0, 1]), &q));
        assert!(!matches_query(&ids(&[0, 2]), &q));
    }

    #[test]
    fn any_only_applies_when_non_empty() {
        let open = QueryDescriptor::new();
        assert!(matches_query(&ids(&[]), &open));

        let q = QueryDescriptor::new().any(ids(&[1, 2]));
        assert!(matches_query(&ids(&[0, 2]), &q));
        assert!(!matches_query(&ids(&[0]), &q));
    }

    #[test]
    fn exclusive_is_set_equality() {
        let q = QueryDescriptor::new().exclusive(ids(&[1, 0]));
        assert!(matches_query(&ids(&[0, 1]), &q));
        assert!(!matches_query(&ids(&[0, 1, 2]), &q));
        assert!(!matches_query(&ids(&[0]), &q));
        assert!(!matches_query(&ids(&[0, 2]), &q));
    }

    #[test]
    fn exclusive_overrides_other_filters() {
        let q = QueryDescriptor::new()
            .exclusive(ids(&[0]))
            .none(ids(&[0]));
        assert!(matches_query(&ids(&[0]), &q));
    }

    #[test]
    fn descriptors_normalize_to_same_key() {
        let a = QueryDescriptor::new().all(ids(&[2, 0, 0]));
        let b = QueryDescriptor::new().all(ids(&[0])).all(ids(&[2]));
        assert_eq!(a, b);
        assert_eq!(a.all_ids(), &ids(&[0, 2])[..]);
    }

    // -- cache --------------------------------------------------------------

    #[test]
    fn cache_hit_returns_same_arc() {
        let (reg, p, _, _) = setup();
        let mut graph = ArchetypeGraph::new(0);
        graph.get_or_create(&[p], &reg);
        let mut cache = QueryCache::new();
        let q = QueryDescriptor::new().all([p]);

        let first = cache.matched(&q, &graph);
        let second = cache.matched(&q, &graph);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn new_archetype_invalidates_cache() {
        let (reg, p, v, _) = setup();
        let mut graph = ArchetypeGraph::new(0);
        let only_p = graph.get_or_create(&[p], &reg);
        let mut cache = QueryCache::new();
        let q = QueryDescriptor::new().all([p]);

        let before = cache.matched(&q, &graph);
        assert_eq!(&before[..], &[only_p]);

        let pv = graph.archetype_after_add(only_p, v, &reg);
        let after = cache.matched(&q, &graph);
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(&after[..], &[only_p, pv]);
    }

    #[test]
    fn unrelated_archetype_still_recomputes_but_same_contents() {
        let (reg, p, _, t) = setup();
        let mut graph = ArchetypeGraph::new(0);
        let only_p = graph.get_or_create(&[p], &reg);
        let mut cache = QueryCache::new();
        let q = QueryDescriptor::new().all([p]);

        let before = cache.matched(&q, &graph);
        graph.get_or_create(&[t], &reg);
        let after = cache.matched(&q, &graph);
        assert_eq!(&before[..], &after[..]);
        assert_eq!(&after[..], &[only_p]);
    }

    // -- typed fetch ----------------------------------------------------------

    #[test]
    fn resolve_access_keeps_declaration_order() {
        let (reg, p, v, _) = setup();
        let access = resolve_access::<(&Vel, &mut Pos)>(&reg).unwrap();
        assert_eq!(access, vec![v, p]);
    }

    #[test]
    fn resolve_access_unregistered_is_none() {
        #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
        struct Unknown;
        let (reg, _, _, _) = setup();
        assert!(resolve_access::<(&Pos, &Unknown)>(&reg).is_none());
    }

    #[test]
    #[should_panic(expected = "more than once")]
    fn duplicate_component_panics() {
        let (reg, _, _, _) = setup();
        resolve_access::<(&mut Pos, &Pos)>(&reg);
    }

    #[test]
    fn fetch_walks_rows_in_order() {
        let (reg, p, v, _) = setup();
        let mut graph = ArchetypeGraph::new(0);
        let pv = graph.get_or_create(&[p, v], &reg);
        let archetype = graph.archetype_mut(pv).unwrap();
        for i in 0..3 {
            let mut map = ComponentMap::new();
            map.insert(p, Box::new(Pos(i as f32)) as BoxedComponent);
            map.insert(v, Box::new(Vel(1.0)) as BoxedComponent);
            archetype.add_entity(Entity::new(i, 0), map);
        }

        let (entities, mut slots) = archetype.query_slots();
        let mut fetch = <(&mut Pos, &Vel)>::fetch(&reg, &mut slots).unwrap();
        let mut seen = Vec::new();
        for &entity in entities {
            let (pos, vel) = <(&mut Pos, &Vel)>::next(&mut fetch).unwrap();
            pos.0 += vel.0;
            seen.push((entity.index(), pos.0));
        }
        assert_eq!(seen, vec![(0, 1.0), (1, 2.0), (2, 3.0)]);
    }
}
