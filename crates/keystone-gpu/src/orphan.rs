//! Deferred disposal of command buffers the GPU may still be executing.
//!
//! Orphans live in a generational arena. A slot is vacated, and its key invalidated, only when
//! an explicit [`OrphanList::sweep`] observes the paired fence signalled.

use crate::command::CommandBuffer;
use crate::sync::{Fence, HostSync};
use std::sync::Arc;

/// Handle to an orphaned command buffer.
///
/// Stays unique for the life of the list: a reused slot gets a new generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrphanKey {
    index: u32,
    generation: u32,
}

/// The fence guarding an orphan, and whether the orphan owns it.
#[derive(Debug)]
pub enum OrphanFence {
    /// Destroyed together with the buffer.
    Owned(Fence),
    /// Still referenced elsewhere; only the orphan's reference is released.
    Shared(Arc<Fence>),
}

impl OrphanFence {
    pub fn fence(&self) -> &Fence {
        match self {
            Self::Owned(fence) => fence,
            Self::Shared(fence) => fence,
        }
    }
}

// Field order matters: the buffer is freed before an owned fence is destroyed.
struct Orphan {
    buffer: CommandBuffer,
    fence: OrphanFence,
}

struct Slot {
    generation: u32,
    orphan: Option<Orphan>,
}

/// Command buffers waiting for their fence before they may be freed.
#[derive(Default)]
pub struct OrphanList {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl OrphanList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffers waiting for disposal.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `key` still refers to a pending orphan.
    pub fn contains(&self, key: OrphanKey) -> bool {
        self.slots
            .get(key.index as usize)
            .is_some_and(|slot| slot.generation == key.generation && slot.orphan.is_some())
    }

    /// Take ownership of `buffer` until `fence` signals.
    pub fn insert(&mut self, buffer: CommandBuffer, fence: OrphanFence) -> OrphanKey {
        let orphan = Some(Orphan { buffer, fence });
        self.len += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.orphan = orphan;
            return OrphanKey {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            orphan,
        });
        OrphanKey {
            index,
            generation: 0,
        }
    }

    /// Dispose every orphan whose fence polls signalled. Never blocks on the GPU.
    ///
    /// Returns the number of buffers disposed.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn sweep(&mut self) -> usize {
        let mut disposed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(orphan) = &slot.orphan else {
                continue;
            };

            match orphan.fence.fence().host_poll() {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!("Failed to poll orphan fence: {e}");
                    continue;
                }
            }

            slot.orphan = None;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(index as u32);
            disposed += 1;
        }

        self.len -= disposed;
        if disposed > 0 {
            tracing::debug!(disposed, remaining = self.len, "Swept orphaned command buffers");
        }
        disposed
    }

    /// Dispose every orphan without looking at its fence.
    ///
    /// Only valid once the device is known to be idle.
    pub fn release_all(&mut self) -> usize {
        let released = self.len;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.orphan.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.len = 0;
        released
    }
}

impl std::fmt::Debug for OrphanList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrphanList")
            .field("len", &self.len)
            .field("slots", &self.slots.len())
            .finish()
    }
}
