use std::sync::{Arc, RwLock};
use tracing::debug;
use uuid::Uuid;
use crate::package::{Package, PackageHeader};
use crate::send_job::SendJob;

/// Refers to a slot in a [`JobPool`] for the duration of one admission. A slot's generation
///  changes whenever it is admitted again, so a reference from an earlier admission goes stale
///  instead of silently pointing at somebody else's job.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum SlotRef {
    Pooled { index: usize, generation: u64 },
    Heartbeat,
}

pub(crate) struct Slot {
    pub(crate) send_job: Arc<SendJob>,
    pub(crate) header: Option<PackageHeader>,
    /// only retained while the slot is active
    pub(crate) package: Option<Package>,
    pub(crate) is_active: bool,
    /// next slot in the active queue, `None` for the tail and for inactive slots
    pub(crate) next: Option<usize>,
}

impl Slot {
    fn new() -> Slot {
        Slot {
            send_job: Arc::new(SendJob::new()),
            header: None,
            package: None,
            is_active: false,
            next: None,
        }
    }

    fn heartbeat() -> Slot {
        let package = Package::heartbeat();
        Slot {
            send_job: Arc::new(SendJob::new()),
            header: Some(package.header),
            package: Some(package),
            is_active: false,
            next: None,
        }
    }

    /// Is there a [`crate::send_job::SendJobHandle`] for this slot's job outside the pool?
    pub(crate) fn is_externally_held(&self) -> bool {
        Arc::strong_count(&self.send_job) > 1
    }

    pub(crate) fn is_free(&self) -> bool {
        !self.is_externally_held() && !self.is_active
    }
}

struct Entry {
    generation: u64,
    slot: Option<Slot>,
}

/// The arena of slots and the active queue threaded through it. Indices of live slots are
///  stable: removing a slot leaves a vacant entry that is recycled when the pool grows again.
pub(crate) struct JobPoolInner {
    entries: Vec<Entry>,
    vacant: Vec<usize>,
    num_slots: usize,

    pub(crate) active_head: Option<usize>,
    pub(crate) active_tail: Option<usize>,
    pub(crate) active_count: usize,

    pub(crate) heartbeat: Slot,
}

impl JobPoolInner {
    pub(crate) fn new(initial_size: usize) -> JobPoolInner {
        let mut entries = Vec::with_capacity(initial_size);
        for _ in 0..initial_size {
            entries.push(Entry {
                generation: 0,
                slot: Some(Slot::new()),
            });
        }

        JobPoolInner {
            entries,
            vacant: Vec::new(),
            num_slots: initial_size,
            active_head: None,
            active_tail: None,
            active_count: 0,
            heartbeat: Slot::heartbeat(),
        }
    }

    pub(crate) fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub(crate) fn slots(&self) -> impl Iterator<Item = (usize, &Slot)> {
        self.entries.iter()
            .enumerate()
            .filter_map(|(index, entry)| entry.slot.as_ref().map(|slot| (index, slot)))
    }

    pub(crate) fn slot(&self, index: usize) -> &Slot {
        self.entries[index].slot.as_ref()
            .expect("referring to a vacant entry")
    }

    pub(crate) fn slot_ref(&self, index: usize) -> SlotRef {
        SlotRef::Pooled {
            index,
            generation: self.entries[index].generation,
        }
    }

    pub(crate) fn resolve(&self, slot_ref: SlotRef) -> Option<&Slot> {
        match slot_ref {
            SlotRef::Heartbeat => Some(&self.heartbeat),
            SlotRef::Pooled { index, generation } => {
                let entry = self.entries.get(index)?;
                if entry.generation != generation {
                    return None;
                }
                entry.slot.as_ref()
            }
        }
    }

    /// Returns the index of the first free slot, and the total number of free slots
    pub(crate) fn find_free(&self) -> (Option<usize>, usize) {
        let mut first_free = None;
        let mut num_free = 0;

        for (index, slot) in self.slots() {
            if slot.is_free() {
                num_free += 1;
                if first_free.is_none() {
                    first_free = Some(index);
                }
            }
        }
        (first_free, num_free)
    }

    /// Adds a new slot, returning `None` if memory for it can not be allocated
    pub(crate) fn add_slot(&mut self) -> Option<usize> {
        if let Some(index) = self.vacant.pop() {
            self.entries[index].slot = Some(Slot::new());
            self.num_slots += 1;
            return Some(index);
        }

        if self.entries.try_reserve(1).is_err() {
            return None;
        }
        self.entries.push(Entry {
            generation: 0,
            slot: Some(Slot::new()),
        });
        self.num_slots += 1;
        Some(self.entries.len() - 1)
    }

    /// Removes up to `max_removed` free slots, scanning forward from the slot after `keep`. The
    ///  slot at `keep` itself is never removed. Returns the number of removed slots.
    pub(crate) fn remove_free_after(&mut self, keep: usize, max_removed: usize) -> usize {
        let mut removed = 0;

        for index in keep + 1..self.entries.len() {
            if removed >= max_removed {
                break;
            }

            let entry = &mut self.entries[index];
            if entry.slot.as_ref().map(|s| s.is_free()).unwrap_or(false) {
                // references to the removed slot must not resolve to whatever recycles the entry
                entry.generation = entry.generation.wrapping_add(1);
                entry.slot = None;
                self.vacant.push(index);
                self.num_slots -= 1;
                removed += 1;
            }
        }
        removed
    }

    /// Appends an inactive slot to the tail of the active queue
    pub(crate) fn push_active(&mut self, index: usize, header: PackageHeader, package: Package) -> SlotRef {
        let entry = &mut self.entries[index];
        entry.generation = entry.generation.wrapping_add(1);

        let slot = entry.slot.as_mut()
            .expect("pushing a vacant entry to the active queue");
        assert!(!slot.is_active, "slot {} is already active", index);
        assert!(slot.next.is_none());

        slot.is_active = true;
        slot.header = Some(header);
        slot.package = Some(package);

        match self.active_tail {
            Some(tail) => {
                let tail_slot = self.slot_mut(tail);
                assert!(tail_slot.next.is_none());
                tail_slot.next = Some(index);
            }
            None => {
                assert!(self.active_head.is_none());
                self.active_head = Some(index);
            }
        }
        self.active_tail = Some(index);
        self.active_count += 1;

        self.slot_ref(index)
    }

    /// Removes the head of the active queue and releases its package
    pub(crate) fn pop_active(&mut self) {
        let Some(head) = self.active_head else {
            panic!("popping from an empty active queue");
        };

        let slot = self.slot_mut(head);
        let next = slot.next.take();
        slot.is_active = false;
        slot.package = None;

        self.active_head = next;
        self.active_count -= 1;

        if self.active_head.is_none() {
            assert_eq!(self.active_count, 0);
            self.active_tail = None;
        }
    }

    /// The active queue in FIFO order
    pub(crate) fn active_indices(&self) -> ActiveIter<'_> {
        ActiveIter {
            inner: self,
            cur: self.active_head,
        }
    }

    fn slot_mut(&mut self, index: usize) -> &mut Slot {
        self.entries[index].slot.as_mut()
            .expect("active queue refers to a vacant entry")
    }
}

pub(crate) struct ActiveIter<'a> {
    inner: &'a JobPoolInner,
    cur: Option<usize>,
}

impl Iterator for ActiveIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let index = self.cur?;
        self.cur = self.inner.entries[index].slot.as_ref()
            .and_then(|slot| slot.next);
        Some(index)
    }
}

/// The jobs of a single connection: a pool of reusable slots, the FIFO queue of slots that are
///  waiting to be sent, and a dedicated heartbeat slot outside of both.
///
/// All operations on a pool go through [`crate::job_manager::JobManager`].
pub struct JobPool {
    id: Uuid,
    pub(crate) inner: RwLock<JobPoolInner>,
}

impl JobPool {
    pub(crate) fn new(id: Uuid, initial_size: usize) -> JobPool {
        debug!("creating job pool {} with {} slots", id, initial_size);
        JobPool {
            id,
            inner: RwLock::new(JobPoolInner::new(initial_size)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// number of slots, free or not, excluding the heartbeat slot
    pub fn num_slots(&self) -> usize {
        self.inner.read().unwrap().num_slots()
    }

    pub fn active_count(&self) -> usize {
        self.inner.read().unwrap().active_count
    }
}
