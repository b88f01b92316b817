//! Generation-checked slot map holding the client set
//!
//! Keys stay valid until their entry is removed. A removed slot is reused
//! with a bumped generation, so a stale key (for example one carried by an
//! epoll event queued before the removal) never aliases a newer entry.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientKey {
    index: u32,
    generation: u32,
}

impl ClientKey {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub(crate) fn from_parts(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub struct Registry<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
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

    /// Insert a value built from its future key.
    ///
    /// If `build` fails nothing is inserted and the slot stays free.
    pub fn insert_with<E>(
        &mut self,
        build: impl FnOnce(ClientKey) -> Result<T, E>,
    ) -> Result<ClientKey, E> {
        let index = match self.free.last() {
            Some(&index) => index,
            None => self.slots.len() as u32,
        };
        let generation = self
            .slots
            .get(index as usize)
            .map_or(0, |slot| slot.generation);
        let key = ClientKey { index, generation };
        let value = build(key)?;

        if index as usize == self.slots.len() {
            self.slots.push(Slot {
                generation,
                value: Some(value),
            });
        } else {
            self.free.pop();
            self.slots[index as usize].value = Some(value);
        }
        self.len += 1;
        Ok(key)
    }

    pub fn get(&self, key: ClientKey) -> Option<&T> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn remove(&mut self, key: ClientKey) -> Option<T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.len -= 1;
        Some(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClientKey, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.value.as_ref().map(|v| {
                (
                    ClientKey {
                        index: i as u32,
                        generation: slot.generation,
                    },
                    v,
                )
            })
        })
    }

    pub fn keys(&self) -> Vec<ClientKey> {
        self.iter().map(|(key, _)| key).collect()
    }

    /// Remove every entry, returning them in slot order
    pub fn drain(&mut self) -> Vec<T> {
        let keys = self.keys();
        keys.into_iter().filter_map(|key| self.remove(key)).collect()
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}
