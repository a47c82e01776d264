//! Entity handles, identity allocation and location tracking.
//!
//! An [`Entity`] is a 64-bit handle that packs a *generation* counter in the
//! high 32 bits and a slot *index* in the low 32 bits. The generation of a slot
//! is bumped every time the slot is freed, so a handle taken before a destroy
//! never compares equal to the handle of whatever is spawned into the slot
//! afterwards.
//!
//! The [`EntityAllocator`] is also the single owner of every entity's
//! [`EntityLocation`]. Archetypes only know which entity sits in which row;
//! the reverse mapping lives here and is only written by the scene.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::archetype::ArchetypeId;

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A generational entity handle.
///
/// Layout: `[generation: u32 | index: u32]`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity(u64);

impl Entity {
    /// Construct an `Entity` from an index and generation.
    #[inline]
    pub fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    /// The slot index (low 32 bits).
    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    /// The generation (high 32 bits).
    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Raw `u64` representation.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Reconstruct from a raw `u64`.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{})", self.index(), self.generation())
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

// ---------------------------------------------------------------------------
// EntityLocation / EntityMeta
// ---------------------------------------------------------------------------

/// Where an entity's components are stored: which archetype, which row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityLocation {
    pub archetype: ArchetypeId,
    pub row: usize,
}

/// Snapshot of a live slot, as returned by [`EntityAllocator::metadata`].
///
/// `location` is `None` for an entity whose identity has been reserved but
/// which has not been placed into storage yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityMeta {
    pub location: Option<EntityLocation>,
    pub generation: u32,
}

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    alive: bool,
    location: Option<EntityLocation>,
}

// ---------------------------------------------------------------------------
// EntityAllocator
// ---------------------------------------------------------------------------

/// Allocates and recycles [`Entity`] handles and records their locations.
///
/// Free indices are kept in a FIFO queue so that generations are spread out
/// over time rather than concentrated on a hot index.
#[derive(Debug, Default)]
pub struct EntityAllocator {
    slots: Vec<Slot>,
    free_indices: VecDeque<u32>,
    alive_count: usize,
}

impl EntityAllocator {
    /// Create a new, empty allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an allocator with room for `capacity` slots before reallocating.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free_indices: VecDeque::new(),
            alive_count: 0,
        }
    }

    /// Allocate a fresh handle.
    ///
    /// A freed slot is reused if one exists; its generation was already
    /// bumped when it was freed. The new entity has no location.
    pub fn allocate(&mut self) -> Entity {
        self.alive_count += 1;
        if let Some(index) = self.free_indices.pop_front() {
            let slot = &mut self.slots[index as usize];
            slot.alive = true;
            slot.location = None;
            Entity::new(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                alive: true,
                location: None,
            });
            Entity::new(index, 0)
        }
    }

    /// Free an entity's slot, bumping its generation so that every
    /// outstanding handle to it becomes stale.
    ///
    /// Returns the location the entity had, or `None` if the entity was
    /// already dead (in which case nothing changes) or was never placed.
    /// Use [`is_alive`](Self::is_alive) beforehand to tell those apart.
    pub fn deallocate(&mut self, entity: Entity) -> Option<EntityLocation> {
        let slot = self.live_slot_mut(entity)?;
        slot.alive = false;
        slot.generation = slot.generation.wrapping_add(1);
        let location = slot.location.take();
        self.free_indices.push_back(entity.index());
        self.alive_count -= 1;
        location
    }

    /// `true` if `entity` refers to a live slot with a matching generation.
    #[inline]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.live_slot(entity).is_some()
    }

    /// Record where a live entity's components now live. No-op for a stale
    /// handle.
    pub fn set_location(&mut self, entity: Entity, location: EntityLocation) {
        if let Some(slot) = self.live_slot_mut(entity) {
            slot.location = Some(location);
        }
    }

    /// Current location of a live entity, if it has been placed.
    #[inline]
    pub fn location(&self, entity: Entity) -> Option<EntityLocation> {
        self.live_slot(entity)?.location
    }

    /// Location and generation of a live entity.
    pub fn metadata(&self, entity: Entity) -> Option<EntityMeta> {
        self.live_slot(entity).map(|slot| EntityMeta {
            location: slot.location,
            generation: slot.generation,
        })
    }

    /// Number of live entities (placed or merely reserved).
    #[inline]
    pub fn alive_count(&self) -> usize {
        self.alive_count
    }

    /// Handles of every live entity, in slot order.
    pub fn alive_entities(&self) -> Vec<Entity> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.alive)
            .map(|(index, slot)| Entity::new(index as u32, slot.generation))
            .collect()
    }

    /// Free every live slot. Generations are bumped exactly as in
    /// [`deallocate`](Self::deallocate), so handles from before the clear
    /// stay dead after their slots are reused.
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.alive {
                slot.alive = false;
                slot.generation = slot.generation.wrapping_add(1);
                slot.location = None;
                self.free_indices.push_back(index as u32);
            }
        }
        self.alive_count = 0;
    }

    // -- internal helpers ---------------------------------------------------

    fn live_slot(&self, entity: Entity) -> Option<&Slot> {
        self.slots
            .get(entity.index() as usize)
            .filter(|slot| slot.alive && slot.generation == entity.generation())
    }

    fn live_slot_mut(&mut self, entity: Entity) -> Option<&mut Slot> {
        self.slots
            .get_mut(entity.index() as usize)
            .filter(|slot| slot.alive && slot.generation == entity.generation())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
