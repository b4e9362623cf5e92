//! A slot arena with generation-checked ids.
//!
//! Entries live in a contiguous `Vec`, vacated slots are reused, and every reuse bumps the slot's
//!  generation so that an id handed out for a previous occupant no longer resolves. Ids are small
//!  `Copy` values that can be stored in lookup maps and recency lists instead of pointers.

use std::fmt::{Debug, Formatter};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArenaId {
    index: u32,
    generation: u32,
}
impl ArenaId {
    /// the position of the entry in the arena, stable for the entry's lifetime
    pub fn index(&self) -> usize {
        self.index as usize
    }
}
impl Debug for ArenaId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}@{}", self.index, self.generation)
    }
}

enum Entry<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

pub struct Arena<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Arena<T> {
        Arena {
            entries: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Arena<T> {
        Arena {
            entries: Vec::with_capacity(capacity),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, value: T) -> ArenaId {
        self.len += 1;

        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            let generation = match entry {
                Entry::Vacant { generation } => generation.wrapping_add(1),
                Entry::Occupied { .. } => unreachable!("free list points to an occupied slot"),
            };
            *entry = Entry::Occupied { generation, value };
            return ArenaId { index, generation };
        }

        let index: u32 = self.entries.len().try_into()
            .expect("arena exceeds u32::MAX entries");
        self.entries.push(Entry::Occupied { generation: 0, value });
        ArenaId { index, generation: 0 }
    }

    pub fn remove(&mut self, id: ArenaId) -> Option<T> {
        let entry = self.entries.get_mut(id.index())?;
        match entry {
            Entry::Occupied { generation, .. } if *generation == id.generation => {}
            _ => return None,
        }

        let prev = std::mem::replace(entry, Entry::Vacant { generation: id.generation });
        self.free.push(id.index);
        self.len -= 1;

        match prev {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Vacant { .. } => unreachable!(),
        }
    }

    pub fn contains(&self, id: ArenaId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: ArenaId) -> Option<&T> {
        match self.entries.get(id.index()) {
            Some(Entry::Occupied { generation, value }) if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: ArenaId) -> Option<&mut T> {
        match self.entries.get_mut(id.index()) {
            Some(Entry::Occupied { generation, value }) if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    /// resolve the id of the current occupant of a slot position
    pub fn id_at(&self, index: usize) -> Option<ArenaId> {
        match self.entries.get(index) {
            Some(Entry::Occupied { generation, .. }) => Some(ArenaId {
                index: index as u32,
                generation: *generation,
            }),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArenaId, &T)> {
        self.entries.iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry {
                Entry::Occupied { generation, value } => Some((ArenaId { index: index as u32, generation: *generation }, value)),
                Entry::Vacant { .. } => None,
            })
    }

    pub fn drain(&mut self) -> Vec<T> {
        let mut result = Vec::with_capacity(self.len);
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if let Entry::Occupied { generation, .. } = entry {
                let generation = *generation;
                if let Entry::Occupied { value, .. } = std::mem::replace(entry, Entry::Vacant { generation }) {
                    result.push(value);
                    self.free.push(index as u32);
                }
            }
        }
        self.len = 0;
        result
    }
}
