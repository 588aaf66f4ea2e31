//! Pool - arena allocation with generation-tagged indices
//!
//! An alternative to refcounted handles for graphs with many back edges:
//! nodes live in one arena and refer to each other by `PoolIndex`. Removing
//! a node bumps its slot generation, so stale indices are detected instead
//! of aliasing whatever reuses the slot (the ABA problem).

use std::fmt;

/// Slot generation. Starts at 1; 0 is never handed out.
pub type Generation = u32;

const FIRST_GENERATION: Generation = 1;

/// Index into a `Pool`, valid until the entry is removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolIndex {
    slot: u32,
    generation: Generation,
}

impl PoolIndex {
    #[inline]
    pub fn slot(&self) -> u32 {
        self.slot
    }

    #[inline]
    pub fn generation(&self) -> Generation {
        self.generation
    }
}

impl fmt::Display for PoolIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.slot, self.generation)
    }
}

enum Entry<T> {
    Occupied { generation: Generation, value: T },
    Vacant { generation: Generation, next_free: Option<u32> },
}

/// Generational arena
pub struct Pool<T> {
    entries: Vec<Entry<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Pool<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            free_head: None,
            len: 0,
        }
    }

    /// Store `value`, reusing a vacant slot when one exists
    pub fn insert(&mut self, value: T) -> PoolIndex {
        self.len += 1;

        if let Some(slot) = self.free_head {
            let entry = &mut self.entries[slot as usize];
            if let Entry::Vacant { generation, next_free } = *entry {
                self.free_head = next_free;
                *entry = Entry::Occupied { generation, value };
                return PoolIndex { slot, generation };
            }
        }

        let slot = u32::try_from(self.entries.len()).unwrap_or_else(|_| panic!("pool exceeded u32::MAX slots"));
        self.entries.push(Entry::Occupied {
            generation: FIRST_GENERATION,
            value,
        });
        PoolIndex {
            slot,
            generation: FIRST_GENERATION,
        }
    }

    pub fn get(&self, index: PoolIndex) -> Option<&T> {
        match self.entries.get(index.slot as usize)? {
            Entry::Occupied { generation, value } if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, index: PoolIndex) -> Option<&mut T> {
        match self.entries.get_mut(index.slot as usize)? {
            Entry::Occupied { generation, value } if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    /// Remove and return the value. Every copy of `index` goes stale.
    pub fn remove(&mut self, index: PoolIndex) -> Option<T> {
        let entry = self.entries.get_mut(index.slot as usize)?;
        match entry {
            Entry::Occupied { generation, .. } if *generation == index.generation => {}
            _ => return None,
        }

        // A slot whose generation would wrap is retired instead of reused
        let next = index.generation.checked_add(1);
        let vacant = Entry::Vacant {
            generation: next.unwrap_or(Generation::MAX),
            next_free: None,
        };
        let Entry::Occupied { value, .. } = std::mem::replace(entry, vacant) else {
            return None;
        };

        if next.is_some() {
            if let Entry::Vacant { next_free, .. } = entry {
                *next_free = self.free_head;
            }
            self.free_head = Some(index.slot);
        }
        self.len -= 1;
        Some(value)
    }

    pub fn contains(&self, index: PoolIndex) -> bool {
        self.get(index).is_some()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Live entries in slot order
    pub fn iter(&self) -> impl Iterator<Item = (PoolIndex, &T)> {
        self.entries.iter().enumerate().filter_map(|(slot, entry)| match entry {
            Entry::Occupied { generation, value } => Some((
                PoolIndex {
                    slot: slot as u32,
                    generation: *generation,
                },
                value,
            )),
            Entry::Vacant { .. } => None,
        })
    }

    /// Remove every entry. Outstanding indices all go stale.
    pub fn clear(&mut self) {
        let occupied: Vec<PoolIndex> = self.iter().map(|(index, _)| index).collect();
        for index in occupied {
            self.remove(index);
        }
    }
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("len", &self.len)
            .field("slots", &self.entries.len())
            .finish()
    }
}
