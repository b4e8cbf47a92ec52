// Queue families - classification and two-phase allocation
//
// Queue counts must be declared when the logical device is created, so
// allocation happens in two steps: `reserve` against the classified families,
// then `populate` once the device exists. `populate` consumes the allocator,
// which freezes the reservations.

use ash::vk;
use std::collections::BTreeMap;
use std::fmt;

use crate::config::DuplicateFamilyPolicy;
use crate::error::{EngineError, Result};

/// What a queue family can be used for. Graphics implies compute and
/// transfer, Compute implies transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CapabilityClass {
    Graphics,
    Compute,
    Transfer,
}

impl CapabilityClass {
    pub const ALL: [Self; 3] = [Self::Graphics, Self::Compute, Self::Transfer];

    /// Sparse binding, protected and video bits do not take part.
    pub fn classify(flags: vk::QueueFlags) -> Option<Self> {
        let graphics = flags.contains(vk::QueueFlags::GRAPHICS);
        let compute = flags.contains(vk::QueueFlags::COMPUTE);
        let transfer = flags.contains(vk::QueueFlags::TRANSFER);

        if graphics && compute {
            Some(Self::Graphics)
        } else if compute && !graphics {
            Some(Self::Compute)
        } else if transfer && !graphics && !compute {
            Some(Self::Transfer)
        } else {
            None
        }
    }
}

impl fmt::Display for CapabilityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Graphics => "graphics",
            Self::Compute => "compute",
            Self::Transfer => "transfer",
        })
    }
}

/// Raw queue family data as reported by the device.
#[derive(Debug, Clone, Copy)]
pub struct FamilyProbe {
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
    pub present_support: bool,
}

#[derive(Debug, Clone)]
pub struct QueueFamilyDescriptor {
    pub index: u32,
    pub capacity: u32,
    reserved: u32,
    pub class: CapabilityClass,
    pub present_support: bool,
    pub flags: vk::QueueFlags,
}

impl QueueFamilyDescriptor {
    pub fn reserved(&self) -> u32 {
        self.reserved
    }

    pub fn available(&self) -> u32 {
        self.capacity - self.reserved
    }

    fn specificity(&self) -> u32 {
        self.flags.as_raw().count_ones()
    }
}

/// Classified families of one device plus the reservations made against them.
#[derive(Debug, Clone)]
pub struct QueueAllocator {
    /// Device name, for error context.
    device: String,
    /// Per class, the selected family first, then alternates.
    families: BTreeMap<CapabilityClass, Vec<QueueFamilyDescriptor>>,
    present_class: Option<CapabilityClass>,
}

impl QueueAllocator {
    /// Classify the queue families of `device`.
    pub fn classify(
        device: &str,
        probes: &[FamilyProbe],
        policy: DuplicateFamilyPolicy,
    ) -> Result<Self> {
        let mut families: BTreeMap<CapabilityClass, Vec<QueueFamilyDescriptor>> = BTreeMap::new();

        for (index, probe) in probes.iter().enumerate() {
            let index = index as u32;
            log::debug!(
                "Queue family [{}]: count {}, present {}, flags {:?}",
                index,
                probe.queue_count,
                probe.present_support,
                probe.flags
            );

            let Some(class) = CapabilityClass::classify(probe.flags) else {
                log::debug!("Queue family [{}] matches no capability class, skipping", index);
                continue;
            };
            if probe.queue_count == 0 {
                continue;
            }

            let entry = families.entry(class).or_default();
            if let (DuplicateFamilyPolicy::Reject, Some(first)) = (policy, entry.first()) {
                return Err(EngineError::DuplicateClass {
                    device: device.to_string(),
                    class,
                    first: first.index,
                    second: index,
                });
            }

            entry.push(QueueFamilyDescriptor {
                index,
                capacity: probe.queue_count,
                reserved: 0,
                class,
                present_support: probe.present_support,
                flags: probe.flags,
            });
        }

        // Most specific first, then lowest index. The sort is stable and the
        // families were pushed in index order.
        for candidates in families.values_mut() {
            candidates.sort_by_key(|family| (family.specificity(), family.index));
            if candidates.len() > 1 {
                log::info!(
                    "{} families map to {}: using family {}",
                    candidates.len(),
                    candidates[0].class,
                    candidates[0].index
                );
            }
        }

        Ok(Self {
            device: device.to_string(),
            families,
            present_class: None,
        })
    }

    /// The family used for `class`, if the device has one.
    pub fn family(&self, class: CapabilityClass) -> Option<&QueueFamilyDescriptor> {
        self.families.get(&class).and_then(|list| list.first())
    }

    /// Families of `class` that were classified but not selected.
    pub fn alternates(&self, class: CapabilityClass) -> &[QueueFamilyDescriptor] {
        self.families
            .get(&class)
            .map(|list| list.get(1..).unwrap_or(&[]))
            .unwrap_or(&[])
    }

    pub fn reserve(&mut self, class: CapabilityClass, count: u32) -> Result<()> {
        let family = self
            .families
            .get_mut(&class)
            .and_then(|list| list.first_mut())
            .ok_or(EngineError::QueueUnavailable { class })?;

        match family.reserved.checked_add(count) {
            Some(total) if total <= family.capacity => {
                family.reserved = total;
                Ok(())
            }
            _ => Err(EngineError::QueueCapacityExceeded {
                device: self.device.clone(),
                class,
                family: family.index,
                requested: count,
                reserved: family.reserved,
                capacity: family.capacity,
            }),
        }
    }

    /// Pick the class whose queue will present. Prefers the graphics family;
    /// otherwise the lowest-index present-capable family, reserving one queue
    /// there if nothing was reserved yet.
    pub fn resolve_present(&mut self) -> Result<CapabilityClass> {
        let class = match self.family(CapabilityClass::Graphics) {
            Some(graphics) if graphics.present_support => CapabilityClass::Graphics,
            _ => self
                .families
                .values()
                .filter_map(|list| list.first())
                .filter(|family| family.present_support)
                .min_by_key(|family| family.index)
                .map(|family| family.class)
                .ok_or_else(|| {
                    EngineError::Surface(
                        "no classified queue family can present to the surface".to_string(),
                    )
                })?,
        };

        if self.family(class).map_or(0, |family| family.reserved) == 0 {
            self.reserve(class, 1)?;
        }
        self.present_class = Some(class);
        Ok(class)
    }

    /// Unique `(family index, queue count)` pairs to declare at device creation.
    pub fn queue_requests(&self) -> Vec<(u32, u32)> {
        let mut requests: Vec<(u32, u32)> = self
            .families
            .values()
            .filter_map(|list| list.first())
            .filter(|family| family.reserved > 0)
            .map(|family| (family.index, family.reserved))
            .collect();
        requests.sort_unstable();
        requests
    }

    /// Fetch the reserved queues from the created device. `get_queue` receives
    /// `(family index, queue index)`.
    pub fn populate<F>(self, mut get_queue: F) -> QueueAllocation
    where
        F: FnMut(u32, u32) -> vk::Queue,
    {
        let mut queues = BTreeMap::new();
        let mut families = BTreeMap::new();

        for (class, mut list) in self.families {
            if list.is_empty() {
                continue;
            }
            let selected = list.swap_remove(0);
            if selected.reserved > 0 {
                let handles = (0..selected.reserved)
                    .map(|i| get_queue(selected.index, i))
                    .collect::<Vec<_>>();
                log::debug!(
                    "Allocated {} {} queue(s) from family {}",
                    handles.len(),
                    class,
                    selected.index
                );
                queues.insert(class, handles);
            }
            families.insert(class, selected);
        }

        QueueAllocation {
            queues,
            families,
            present_class: self.present_class,
        }
    }
}

/// Live queue handles by class. Read-only once built.
#[derive(Debug, Clone)]
pub struct QueueAllocation {
    queues: BTreeMap<CapabilityClass, Vec<vk::Queue>>,
    families: BTreeMap<CapabilityClass, QueueFamilyDescriptor>,
    present_class: Option<CapabilityClass>,
}

impl QueueAllocation {
    pub fn queues(&self, class: CapabilityClass) -> &[vk::Queue] {
        self.queues.get(&class).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn queue(&self, class: CapabilityClass, index: usize) -> Option<vk::Queue> {
        self.queues(class).get(index).copied()
    }

    pub fn family(&self, class: CapabilityClass) -> Option<&QueueFamilyDescriptor> {
        self.families.get(&class)
    }

    pub fn family_index(&self, class: CapabilityClass) -> Option<u32> {
        self.family(class).map(|family| family.index)
    }

    pub fn graphics(&self) -> Result<vk::Queue> {
        self.queue(CapabilityClass::Graphics, 0)
            .ok_or(EngineError::QueueUnavailable {
                class: CapabilityClass::Graphics,
            })
    }

    pub fn present_class(&self) -> Option<CapabilityClass> {
        self.present_class
    }

    /// Falls back to the graphics queue when no present class was resolved.
    pub fn present(&self) -> Result<vk::Queue> {
        let class = self.present_class.unwrap_or(CapabilityClass::Graphics);
        self.queue(class, 0)
            .ok_or(EngineError::QueueUnavailable { class })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use pretty_assertions::assert_eq;

    const G: vk::QueueFlags = vk::QueueFlags::GRAPHICS;
    const C: vk::QueueFlags = vk::QueueFlags::COMPUTE;
    const T: vk::QueueFlags = vk::QueueFlags::TRANSFER;
    const S: vk::QueueFlags = vk::QueueFlags::SPARSE_BINDING;
    const GPU: &str = "Radeon RX 7600";

    fn probe(flags: vk::QueueFlags, queue_count: u32, present_support: bool) -> FamilyProbe {
        FamilyProbe {
            flags,
            queue_count,
            present_support,
        }
    }

    fn graphics_only(queue_count: u32) -> QueueAllocator {
        QueueAllocator::classify(
            GPU,
            &[probe(G | C | T, queue_count, true)],
            DuplicateFamilyPolicy::Reject,
        )
        .unwrap()
    }

    #[test]
    fn classification_follows_rule_precedence() {
        assert_eq!(CapabilityClass::classify(G | C | T), Some(CapabilityClass::Graphics));
        assert_eq!(CapabilityClass::classify(G | C), Some(CapabilityClass::Graphics));
        assert_eq!(CapabilityClass::classify(C | T), Some(CapabilityClass::Compute));
        assert_eq!(CapabilityClass::classify(T), Some(CapabilityClass::Transfer));
        assert_eq!(CapabilityClass::classify(T | S), Some(CapabilityClass::Transfer));
        assert_eq!(CapabilityClass::classify(G), None);
        assert_eq!(CapabilityClass::classify(vk::QueueFlags::PROTECTED), None);
    }

    #[test]
    fn duplicate_graphics_families_are_rejected_under_strict_policy() {
        let probes = [probe(G | C | T, 16, true), probe(G | C, 4, false)];

        let err =
            QueueAllocator::classify(GPU, &probes, DuplicateFamilyPolicy::Reject).unwrap_err();

        assert!(matches!(
            err,
            EngineError::DuplicateClass {
                ref device,
                class: CapabilityClass::Graphics,
                first: 0,
                second: 1
            } if device == GPU
        ));
    }

    #[test]
    fn duplicate_families_resolve_to_most_specific_then_lowest_index() {
        let probes = [
            probe(G | C | T | S, 16, true),
            probe(T | S, 2, false),
            probe(C | T, 8, false),
            probe(T, 1, false),
            probe(T, 4, false),
        ];

        let allocator =
            QueueAllocator::classify(GPU, &probes, DuplicateFamilyPolicy::MostSpecific).unwrap();

        assert_eq!(allocator.family(CapabilityClass::Graphics).unwrap().index, 0);
        assert_eq!(allocator.family(CapabilityClass::Compute).unwrap().index, 2);
        assert_eq!(allocator.family(CapabilityClass::Transfer).unwrap().index, 3);
        let alternates: Vec<u32> = allocator
            .alternates(CapabilityClass::Transfer)
            .iter()
            .map(|family| family.index)
            .collect();
        assert_eq!(alternates, vec![4, 1]);
    }

    #[test]
    fn reserve_increments_exactly_within_capacity() {
        let mut allocator = graphics_only(2);

        allocator.reserve(CapabilityClass::Graphics, 1).unwrap();
        allocator.reserve(CapabilityClass::Graphics, 1).unwrap();
        assert_eq!(allocator.family(CapabilityClass::Graphics).unwrap().reserved(), 2);

        let err = allocator.reserve(CapabilityClass::Graphics, 1).unwrap_err();
        assert!(matches!(
            err,
            EngineError::QueueCapacityExceeded {
                ref device,
                requested: 1,
                reserved: 2,
                capacity: 2,
                ..
            } if device == GPU
        ));
        assert_eq!(allocator.family(CapabilityClass::Graphics).unwrap().reserved(), 2);
    }

    #[test]
    fn oversized_reservation_leaves_count_untouched() {
        let mut allocator = graphics_only(4);

        assert!(allocator.reserve(CapabilityClass::Graphics, 5).is_err());
        assert!(allocator.reserve(CapabilityClass::Graphics, u32::MAX).is_err());
        assert_eq!(allocator.family(CapabilityClass::Graphics).unwrap().reserved(), 0);
    }

    #[test]
    fn reserving_a_missing_class_fails() {
        let mut allocator = graphics_only(4);

        assert!(matches!(
            allocator.reserve(CapabilityClass::Transfer, 1),
            Err(EngineError::QueueUnavailable {
                class: CapabilityClass::Transfer
            })
        ));
    }

    #[test]
    fn present_prefers_graphics_family() {
        let mut allocator = QueueAllocator::classify(
            GPU,
            &[probe(G | C | T, 4, true), probe(C | T, 2, true)],
            DuplicateFamilyPolicy::Reject,
        )
        .unwrap();
        allocator.reserve(CapabilityClass::Graphics, 1).unwrap();

        assert_eq!(allocator.resolve_present().unwrap(), CapabilityClass::Graphics);
        assert_eq!(allocator.queue_requests(), vec![(0, 1)]);
    }

    #[test]
    fn present_falls_back_to_another_family_and_reserves_it() {
        let mut allocator = QueueAllocator::classify(
            GPU,
            &[probe(G | C | T, 4, false), probe(C | T, 2, true)],
            DuplicateFamilyPolicy::Reject,
        )
        .unwrap();
        allocator.reserve(CapabilityClass::Graphics, 1).unwrap();

        assert_eq!(allocator.resolve_present().unwrap(), CapabilityClass::Compute);
        assert_eq!(allocator.queue_requests(), vec![(0, 1), (1, 1)]);
    }

    #[test]
    fn populate_fetches_every_reserved_queue() {
        let mut allocator = QueueAllocator::classify(
            GPU,
            &[probe(G | C | T, 4, true), probe(C | T, 2, false), probe(T, 2, false)],
            DuplicateFamilyPolicy::Reject,
        )
        .unwrap();
        allocator.reserve(CapabilityClass::Graphics, 2).unwrap();
        allocator.reserve(CapabilityClass::Transfer, 1).unwrap();
        allocator.resolve_present().unwrap();

        let mut calls = Vec::new();
        let allocation = allocator.populate(|family, index| {
            calls.push((family, index));
            vk::Queue::from_raw(u64::from(family * 10 + index + 1))
        });

        assert_eq!(calls, vec![(0, 0), (0, 1), (2, 0)]);
        assert_eq!(allocation.queues(CapabilityClass::Graphics).len(), 2);
        assert!(allocation.queues(CapabilityClass::Compute).is_empty());
        assert_eq!(allocation.queue(CapabilityClass::Transfer, 0), Some(vk::Queue::from_raw(21)));
        assert_eq!(allocation.present().unwrap(), allocation.graphics().unwrap());
        assert_eq!(allocation.family(CapabilityClass::Graphics).unwrap().reserved(), 2);
    }
}
