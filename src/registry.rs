//! Opaque-handle tables and the process-wide session registry.
//!
//! Managed objects never hold native pointers. They hold a 64-bit key into a
//! [`HandleTable`]; a key is an index plus a generation, so a key that outlives its slot
//! resolves to nothing instead of to whatever reused the slot.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::{
    managed::{JValue, ManagedEnv, ObjectRef},
    metadata::MetaData,
    session::Session,
    Error, Result,
};

const HANDLE_GEN_BITS: u64 = 16;
const HANDLE_INDEX_BITS: u64 = 47 - HANDLE_GEN_BITS;
const HANDLE_INDEX_MASK: u64 = (1u64 << HANDLE_INDEX_BITS) - 1;
const HANDLE_GEN_MASK: u64 = (1u64 << HANDLE_GEN_BITS) - 1;

fn encode_handle(index: u32, gen: u16) -> u64 {
    ((gen as u64) << HANDLE_INDEX_BITS) | (index as u64)
}

fn decode_handle(handle: u64) -> Option<(u32, u16)> {
    if handle == 0 || handle >> (HANDLE_INDEX_BITS + HANDLE_GEN_BITS) != 0 {
        return None;
    }
    let index = (handle & HANDLE_INDEX_MASK) as u32;
    let gen = ((handle >> HANDLE_INDEX_BITS) & HANDLE_GEN_MASK) as u16;
    if gen == 0 {
        return None;
    }
    Some((index, gen))
}

fn next_gen(gen: u16) -> u16 {
    let next = gen.wrapping_add(1);
    if next == 0 {
        1
    } else {
        next
    }
}

struct Slot<T> {
    value: Option<T>,
    gen: u16,
}

struct Slots<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

/// Thread-safe generational table. Handle `0` is never issued.
pub struct HandleTable<T> {
    inner: RwLock<Slots<T>>,
}

impl<T: Clone> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Slots {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    pub fn insert(&self, value: T) -> u64 {
        let mut t = self.inner.write();
        t.live += 1;
        if let Some(index) = t.free.pop() {
            let slot = &mut t.slots[index as usize];
            slot.gen = next_gen(slot.gen);
            slot.value = Some(value);
            return encode_handle(index, slot.gen);
        }
        let index = t.slots.len() as u32;
        t.slots.push(Slot {
            value: Some(value),
            gen: 1,
        });
        encode_handle(index, 1)
    }

    pub fn get(&self, handle: u64) -> Option<T> {
        let (index, gen) = decode_handle(handle)?;
        let t = self.inner.read();
        let slot = t.slots.get(index as usize)?;
        if slot.gen != gen {
            return None;
        }
        slot.value.clone()
    }

    /// Removes and returns the value; `None` if the handle is stale or unknown.
    pub fn remove(&self, handle: u64) -> Option<T> {
        let (index, gen) = decode_handle(handle)?;
        let mut t = self.inner.write();
        let slot = t.slots.get_mut(index as usize)?;
        if slot.gen != gen {
            return None;
        }
        let value = slot.value.take()?;
        t.free.push(index);
        t.live -= 1;
        Some(value)
    }

    /// Removes every value. Outstanding handles become stale.
    pub fn drain(&self) -> Vec<T> {
        let mut t = self.inner.write();
        let mut out = Vec::with_capacity(t.live);
        let mut freed = Vec::new();
        for (index, slot) in t.slots.iter_mut().enumerate() {
            if let Some(v) = slot.value.take() {
                out.push(v);
                freed.push(index as u32);
            }
        }
        t.free.extend(freed);
        t.live = 0;
        out
    }

    pub fn len(&self) -> usize {
        self.inner.read().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps the managed service's `serviceHandle` field to the native session.
#[derive(Default)]
pub struct SessionRegistry {
    table: HandleTable<Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<Session>) -> u64 {
        let handle = self.table.insert(session.clone());
        session.set_handle(handle);
        handle
    }

    pub fn lookup(&self, handle: u64) -> Result<Arc<Session>> {
        self.table.get(handle).ok_or_else(|| {
            Error::InvalidState(format!("no live session for handle {handle:#x}"))
        })
    }

    pub fn unregister(&self, handle: u64) -> Option<Arc<Session>> {
        self.table.remove(handle)
    }

    /// Resolves the session behind a managed service object.
    pub fn get_from_object(
        &self,
        env: &dyn ManagedEnv,
        meta: &MetaData,
        service: ObjectRef,
    ) -> Result<Arc<Session>> {
        let handle = read_handle(env, service, meta.wmi_service_handle_field)?;
        if handle == 0 {
            return Err(Error::InvalidState(
                "service is not initialized or already released".into(),
            ));
        }
        self.lookup(handle)
    }

    pub fn drain(&self) -> Vec<Arc<Session>> {
        self.table.drain()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

pub(crate) fn read_handle(
    env: &dyn ManagedEnv,
    obj: ObjectRef,
    field: crate::managed::FieldId,
) -> Result<u64> {
    match env.get_field(obj, field)? {
        JValue::Long(v) => Ok(v as u64),
        other => Err(Error::Managed(format!(
            "handle field holds {other:?}, expected a long"
        ))),
    }
}
