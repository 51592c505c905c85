use std::collections::BTreeSet;

use ssh1_proto::LocalChannelId;

use crate::TunnelError;

/// Number of slots appended when every slot is taken.
const GROWTH_STEP: usize = 16;

/// Channel IDs are `u32` on the wire.
const MAX_SLOTS: usize = u32::MAX as usize;

#[derive(Debug)]
enum Slot<T> {
    Free,
    Reserved,
    Occupied(T),
}

/// Slot map indexed by local channel ID.
///
/// A slot goes through `Free -> Reserved -> Occupied -> Free`. Allocation always returns the
/// lowest free index, so IDs are reused as soon as they are released.
#[derive(Debug)]
pub(crate) struct ChannelTable<T> {
    slots: Vec<Slot<T>>,
    free: BTreeSet<u32>,
    live: usize,
}

impl<T> Default for ChannelTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ChannelTable<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: BTreeSet::new(),
            live: 0,
        }
    }

    /// Reserves the lowest free ID, growing the table when it is full.
    pub(crate) fn allocate(&mut self) -> Result<LocalChannelId, TunnelError> {
        if self.free.is_empty() {
            self.grow()?;
        }

        let index = self.free.pop_first().ok_or(TunnelError::Exhausted)?;
        self.slots[index as usize] = Slot::Reserved;

        Ok(LocalChannelId::from(index))
    }

    fn grow(&mut self) -> Result<(), TunnelError> {
        let start = self.slots.len();
        let end = core::cmp::min(start + GROWTH_STEP, MAX_SLOTS);

        if start == end {
            return Err(TunnelError::Exhausted);
        }

        for index in start..end {
            self.slots.push(Slot::Free);
            self.free.insert(u32::try_from(index).map_err(|_| TunnelError::Exhausted)?);
        }

        Ok(())
    }

    /// Stores `value` at a previously reserved ID.
    pub(crate) fn register(&mut self, id: LocalChannelId, value: T) -> Result<(), TunnelError> {
        let slot = self
            .slots
            .get_mut(u32::from(id) as usize)
            .ok_or(TunnelError::UnknownChannel { id })?;

        match slot {
            Slot::Reserved => {
                *slot = Slot::Occupied(value);
                self.live += 1;
                Ok(())
            }
            Slot::Free | Slot::Occupied(_) => Err(TunnelError::UnknownChannel { id }),
        }
    }

    /// Clears an occupied slot and returns its value.
    pub(crate) fn deregister(&mut self, id: LocalChannelId) -> Result<T, TunnelError> {
        let index = u32::from(id);
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or(TunnelError::UnknownChannel { id })?;

        match core::mem::replace(slot, Slot::Free) {
            Slot::Occupied(value) => {
                self.free.insert(index);
                self.live -= 1;
                Ok(value)
            }
            other => {
                *slot = other;
                Err(TunnelError::UnknownChannel { id })
            }
        }
    }

    pub(crate) fn get(&self, id: LocalChannelId) -> Option<&T> {
        match self.slots.get(u32::from(id) as usize) {
            Some(Slot::Occupied(value)) => Some(value),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, id: LocalChannelId) -> Option<&mut T> {
        match self.slots.get_mut(u32::from(id) as usize) {
            Some(Slot::Occupied(value)) => Some(value),
            _ => None,
        }
    }

    /// Number of registered values.
    pub(crate) fn len(&self) -> usize {
        self.live
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.live == 0
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Registered values, in ascending ID order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (LocalChannelId, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| match slot {
            Slot::Occupied(value) => u32::try_from(index).ok().map(|index| (LocalChannelId::from(index), value)),
            _ => None,
        })
    }

    pub(crate) fn ids(&self) -> Vec<LocalChannelId> {
        self.iter().map(|(id, _)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;

    fn occupy(table: &mut ChannelTable<&'static str>, value: &'static str) -> LocalChannelId {
        let id = table.allocate().unwrap();
        table.register(id, value).unwrap();
        id
    }

    #[test]
    fn allocation_is_unique() {
        let mut table = ChannelTable::new();
        let mut ids = std::collections::HashSet::new();

        for _ in 0..100 {
            assert!(ids.insert(occupy(&mut table, "x")));
        }

        assert_eq!(100, table.len());
    }

    #[test]
    fn grows_by_sixteen_slots() {
        let mut table = ChannelTable::<()>::new();
        assert_eq!(0, table.capacity());

        let first = table.allocate().unwrap();
        assert_eq!(LocalChannelId::from(0), first);
        assert_eq!(16, table.capacity());

        for _ in 1..16 {
            table.allocate().unwrap();
        }
        assert_eq!(16, table.capacity());

        let next = table.allocate().unwrap();
        assert_eq!(LocalChannelId::from(16), next);
        assert_eq!(32, table.capacity());
    }

    #[test]
    fn lowest_released_id_is_reused() {
        let mut table = ChannelTable::new();

        let ids: Vec<_> = (0..5).map(|_| occupy(&mut table, "x")).collect();

        table.deregister(ids[3]).unwrap();
        table.deregister(ids[1]).unwrap();

        assert_eq!(LocalChannelId::from(1), table.allocate().unwrap());
        assert_eq!(LocalChannelId::from(3), table.allocate().unwrap());
        assert_eq!(LocalChannelId::from(5), table.allocate().unwrap());
    }

    #[test]
    fn deregister_unknown_channel() {
        let mut table = ChannelTable::<()>::new();

        let error = table.deregister(LocalChannelId::from(99)).unwrap_err();
        assert!(matches!(error, TunnelError::UnknownChannel { .. }));

        // Reserved but never registered.
        let id = table.allocate().unwrap();
        let error = table.deregister(id).unwrap_err();
        assert!(matches!(error, TunnelError::UnknownChannel { .. }));
    }

    #[test]
    fn deregister_twice() {
        let mut table = ChannelTable::new();
        let id = occupy(&mut table, "x");

        assert_eq!("x", table.deregister(id).unwrap());
        assert!(table.deregister(id).is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn register_requires_reservation() {
        let mut table = ChannelTable::new();
        let id = occupy(&mut table, "a");

        assert!(table.register(id, "b").is_err());
        assert!(table.register(LocalChannelId::from(7), "c").is_err());
        assert_eq!(Some(&"a"), table.get(id));
    }

    #[test]
    fn iteration_is_ordered() {
        let mut table = ChannelTable::new();
        let a = occupy(&mut table, "a");
        let b = occupy(&mut table, "b");
        let c = occupy(&mut table, "c");
        table.deregister(b).unwrap();

        assert_eq!(vec![a, c], table.ids());
        assert_eq!(vec!["a", "c"], table.iter().map(|(_, v)| *v).collect::<Vec<_>>());
    }

    #[test]
    fn allocation_uniqueness_under_churn() {
        use proptest::prelude::*;

        proptest!(|(ops in proptest::collection::vec(any::<bool>(), 1..200))| {
            let mut table = ChannelTable::new();
            let mut live: Vec<LocalChannelId> = Vec::new();

            for allocate in ops {
                if allocate || live.is_empty() {
                    let id = table.allocate().unwrap();
                    prop_assert!(!live.contains(&id));
                    table.register(id, ()).unwrap();
                    live.push(id);
                } else {
                    let id = live.swap_remove(0);
                    table.deregister(id).unwrap();
                }

                prop_assert_eq!(live.len(), table.len());
            }
        })
    }
}
