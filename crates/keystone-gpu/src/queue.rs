//! Queue identities, queue family selection and per-queue submission locking.

use crate::device::{RawDevice, SubmitBatch};
use crate::error::{GpuError, Result};
use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;
use std::sync::Arc;

/// Immutable description of one device queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueInfo {
    pub family: u32,
    pub index: u32,
    pub flags: vk::QueueFlags,
    pub min_image_transfer_granularity: vk::Extent3D,
    pub queue: vk::Queue,
}

/// A device queue together with the lock that serializes every operation on it.
///
/// Submission, presentation and wait-idle all take the lock. Command pool access does not.
#[derive(Debug)]
pub struct Queue {
    info: QueueInfo,
    lock: Mutex<()>,
}

impl Queue {
    /// Wrap a queue retrieved from the device.
    pub fn new(info: QueueInfo) -> Arc<Self> {
        Arc::new(Self {
            info,
            lock: Mutex::new(()),
        })
    }

    pub fn info(&self) -> &QueueInfo {
        &self.info
    }

    /// Get the raw queue handle.
    pub fn handle(&self) -> vk::Queue {
        self.info.queue
    }

    /// Identity used to match command buffers to the queue they must be submitted on.
    pub fn id(&self) -> u64 {
        self.info.queue.as_raw()
    }

    pub fn family(&self) -> u32 {
        self.info.family
    }

    pub fn flags(&self) -> vk::QueueFlags {
        self.info.flags
    }

    /// Submit a batch while holding the queue lock.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit(
        &self,
        device: &dyn RawDevice,
        batch: &SubmitBatch<'_>,
        fence: vk::Fence,
    ) -> Result<()> {
        let _guard = self.lock.lock();
        // SAFETY: the queue belongs to `device` and the lock gives exclusive host access to it.
        unsafe { device.queue_submit(self.info.queue, batch, fence) }
    }

    /// Wait for the queue to drain while holding the queue lock.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_idle(&self, device: &dyn RawDevice) -> Result<()> {
        let _guard = self.lock.lock();
        // SAFETY: see `submit`.
        unsafe { device.queue_wait_idle(self.info.queue) }
    }

    /// Run `f` with exclusive access to the raw queue (used for presentation).
    pub fn with_exclusive<R>(&self, f: impl FnOnce(vk::Queue) -> R) -> R {
        let _guard = self.lock.lock();
        f(self.info.queue)
    }
}

/// Check that a requested image transfer granularity is compatible with a queue's minimum.
///
/// A zero axis in the request means "don't care".
pub fn supports_granularity(min: vk::Extent3D, requested: vk::Extent3D) -> bool {
    (requested.width == 0 || min.width <= requested.width)
        && (requested.height == 0 || min.height <= requested.height)
        && (requested.depth == 0 || min.depth <= requested.depth)
}

/// Find the queue family best suited for `required`.
///
/// Families that carry all required bits qualify; among those the one with the fewest of the
/// required-relevant bits wins, so specialized families are preferred. Families listed in
/// `not_preferred` are skipped on the first pass and only considered if nothing else qualifies.
pub fn find_queue_family(
    families: &[vk::QueueFamilyProperties],
    required: vk::QueueFlags,
    not_preferred: &[u32],
) -> Option<u32> {
    let relevant = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER;

    let pick = |skip: &[u32]| {
        families
            .iter()
            .enumerate()
            .filter(|(i, family)| {
                family.queue_count > 0
                    && family.queue_flags.contains(required)
                    && !skip.contains(&(*i as u32))
            })
            .min_by_key(|(_, family)| (family.queue_flags & relevant).as_raw().count_ones())
            .map(|(i, _)| i as u32)
    };

    pick(not_preferred).or_else(|| pick(&[]))
}

/// Where each logical queue role lives on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSlot {
    pub family: u32,
    pub index: u32,
}

/// Queue layout computed before device creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePlan {
    pub graphics: QueueSlot,
    pub transfer: QueueSlot,
    pub compute: QueueSlot,
    /// `(family, queue count)` pairs to request at device creation.
    pub requests: Vec<(u32, u32)>,
}

impl QueuePlan {
    /// Lay out graphics, transfer and compute queues.
    ///
    /// Transfer avoids the graphics family and compute avoids both when possible. When a role
    /// lands on an already used family it gets its own queue index if the family exposes one,
    /// otherwise it shares the first queue of that family.
    pub fn new(families: &[vk::QueueFamilyProperties]) -> Result<Self> {
        let graphics = find_queue_family(families, vk::QueueFlags::GRAPHICS, &[])
            .ok_or_else(|| GpuError::NoSuitableQueue("graphics".to_string()))?;
        let transfer = find_queue_family(families, vk::QueueFlags::TRANSFER, &[graphics])
            .ok_or_else(|| GpuError::NoSuitableQueue("transfer".to_string()))?;
        let compute = find_queue_family(families, vk::QueueFlags::COMPUTE, &[graphics, transfer])
            .ok_or_else(|| GpuError::NoSuitableQueue("compute".to_string()))?;

        let mut requests: Vec<(u32, u32)> = Vec::new();
        let mut slot_for = |family: u32| {
            let available = families[family as usize].queue_count;
            match requests.iter_mut().find(|(f, _)| *f == family) {
                Some((_, count)) if *count < available => {
                    *count += 1;
                    QueueSlot {
                        family,
                        index: *count - 1,
                    }
                }
                Some(_) => QueueSlot { family, index: 0 },
                None => {
                    requests.push((family, 1));
                    QueueSlot { family, index: 0 }
                }
            }
        };

        let graphics = slot_for(graphics);
        let transfer = slot_for(transfer);
        let compute = slot_for(compute);

        Ok(Self {
            graphics,
            transfer,
            compute,
            requests,
        })
    }

    /// Distinct queue families in use.
    pub fn families(&self) -> Vec<u32> {
        self.requests.iter().map(|(family, _)| *family).collect()
    }

    /// Resource sharing mode implied by the plan.
    pub fn sharing_mode(&self) -> vk::SharingMode {
        if self.requests.len() == 1 {
            vk::SharingMode::EXCLUSIVE
        } else {
            vk::SharingMode::CONCURRENT
        }
    }
}

/// The queues of a created device, one per role.
///
/// Roles that share a hardware queue share the same [`Queue`] and therefore the same lock.
#[derive(Debug, Clone)]
pub struct DeviceQueues {
    pub graphics: Arc<Queue>,
    pub transfer: Arc<Queue>,
    pub compute: Arc<Queue>,
    pub sharing_mode: vk::SharingMode,
    pub families: Vec<u32>,
}

impl DeviceQueues {
    /// Build the role queues for a plan, fetching raw handles through `get_queue`.
    pub fn from_plan(
        plan: &QueuePlan,
        families: &[vk::QueueFamilyProperties],
        mut get_queue: impl FnMut(u32, u32) -> vk::Queue,
    ) -> Self {
        let mut created: Vec<(QueueSlot, Arc<Queue>)> = Vec::new();
        let mut queue_for = |slot: QueueSlot| {
            if let Some((_, queue)) = created.iter().find(|(s, _)| *s == slot) {
                return queue.clone();
            }
            let props = &families[slot.family as usize];
            let queue = Queue::new(QueueInfo {
                family: slot.family,
                index: slot.index,
                flags: props.queue_flags,
                min_image_transfer_granularity: props.min_image_transfer_granularity,
                queue: get_queue(slot.family, slot.index),
            });
            created.push((slot, queue.clone()));
            queue
        };

        Self {
            graphics: queue_for(plan.graphics),
            transfer: queue_for(plan.transfer),
            compute: queue_for(plan.compute),
            sharing_mode: plan.sharing_mode(),
            families: plan.families(),
        }
    }

    /// The three role queues with duplicates removed.
    pub fn unique(&self) -> Vec<&Arc<Queue>> {
        let mut unique: Vec<&Arc<Queue>> = Vec::with_capacity(3);
        for queue in [&self.graphics, &self.transfer, &self.compute] {
            if !unique.iter().any(|q| Arc::ptr_eq(q, queue)) {
                unique.push(queue);
            }
        }
        unique
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            timestamp_valid_bits: 64,
            min_image_transfer_granularity: vk::Extent3D {
                width: 1,
                height: 1,
                depth: 1,
            },
        }
    }

    const ALL: vk::QueueFlags = vk::QueueFlags::from_raw(
        vk::QueueFlags::GRAPHICS.as_raw()
            | vk::QueueFlags::COMPUTE.as_raw()
            | vk::QueueFlags::TRANSFER.as_raw(),
    );

    #[test]
    fn prefers_specialized_families() {
        let families = [
            family(ALL, 16),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 4),
            family(vk::QueueFlags::TRANSFER, 2),
        ];

        let plan = QueuePlan::new(&families).unwrap();
        assert_eq!(plan.graphics, QueueSlot { family: 0, index: 0 });
        assert_eq!(plan.transfer, QueueSlot { family: 2, index: 0 });
        assert_eq!(plan.compute, QueueSlot { family: 1, index: 0 });
        assert_eq!(plan.sharing_mode(), vk::SharingMode::CONCURRENT);
    }

    #[test]
    fn single_family_gets_distinct_indices_when_available() {
        let families = [family(ALL, 3)];

        let plan = QueuePlan::new(&families).unwrap();
        assert_eq!(plan.graphics.index, 0);
        assert_eq!(plan.transfer.index, 1);
        assert_eq!(plan.compute.index, 2);
        assert_eq!(plan.requests, vec![(0, 3)]);
        assert_eq!(plan.sharing_mode(), vk::SharingMode::EXCLUSIVE);
    }

    #[test]
    fn single_queue_is_shared() {
        let families = [family(ALL, 1)];

        let plan = QueuePlan::new(&families).unwrap();
        assert_eq!(plan.graphics, plan.transfer);
        assert_eq!(plan.transfer, plan.compute);
        assert_eq!(plan.requests, vec![(0, 1)]);

        let mut fetched = 0;
        let queues = DeviceQueues::from_plan(&plan, &families, |_, _| {
            fetched += 1;
            vk::Queue::from_raw(0x10)
        });
        assert_eq!(fetched, 1);
        assert!(Arc::ptr_eq(&queues.graphics, &queues.compute));
        assert_eq!(queues.unique().len(), 1);
    }

    #[test]
    fn missing_graphics_is_a_configuration_error() {
        let families = [family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 1)];
        assert!(matches!(
            QueuePlan::new(&families),
            Err(GpuError::NoSuitableQueue(_))
        ));
    }

    #[test]
    fn granularity_zero_axes_are_ignored() {
        let min = vk::Extent3D {
            width: 8,
            height: 8,
            depth: 1,
        };
        assert!(supports_granularity(min, vk::Extent3D::default()));
        assert!(supports_granularity(
            min,
            vk::Extent3D {
                width: 16,
                height: 0,
                depth: 0
            }
        ));
        assert!(!supports_granularity(
            min,
            vk::Extent3D {
                width: 4,
                height: 8,
                depth: 1
            }
        ));
    }
}
