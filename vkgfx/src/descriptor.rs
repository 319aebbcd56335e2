//! Descriptor set allocation and the pool growth policy backing it (§4.8).

use std::sync::Arc;
use std::thread;

use ash::vk;
use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::context::{DeviceHandle, ALLOC};
use crate::error::Error;
use crate::image::{Image, Sampler};
use crate::pipeline::PipelineState;

/// Default `maxSets`/per-type descriptor count the first pool is sized at;
/// every subsequent pool doubles the previous one's capacity (§4.8).
const DEFAULT_POOL_CAPACITY: u32 = 1000;

struct Pool {
    handle: vk::DescriptorPool,
    capacity: u32,
    /// Number of descriptor sets currently allocated from this pool.
    size: u32,
}

/// Grows a chain of `VkDescriptorPool`s on demand. Allocation scans pools
/// most-recently-used first (a hit promotes that pool to the front). On
/// exhaustion, growth is gated by the pools' own reported free-slot count
/// rather than unconditional doubling: `OUT_OF_POOL_MEMORY`/`FRAGMENTED_POOL`
/// mean the allocation failed despite the pool's bookkeeping, which can
/// happen to an under-fragmented pool well before its set count runs out.
/// If every exhausted pool still reports plenty of free slots (`capacity -
/// size >= P`), the failure is fragmentation, not exhaustion, so another
/// pool at the same capacity `P` is allocated; otherwise `P` is doubled
/// (§4.8).
pub struct DescriptorSetPool {
    device: Arc<DeviceHandle>,
    pools: Vec<Pool>,
    current_capacity: u32,
}

impl DescriptorSetPool {
    pub(crate) fn new(device: Arc<DeviceHandle>) -> Self {
        Self {
            device,
            pools: Vec::new(),
            current_capacity: DEFAULT_POOL_CAPACITY,
        }
    }

    fn pool_sizes(capacity: u32) -> Vec<vk::DescriptorPoolSize> {
        let share = |tenths: u32| (capacity * tenths / 10).max(1);
        vec![
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: share(3),
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: share(3),
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: share(3),
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: share(2),
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: share(1),
            },
        ]
    }

    fn create_pool(&self, capacity: u32) -> Result<vk::DescriptorPool, Error> {
        let sizes = Self::pool_sizes(capacity);
        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(capacity)
            .pool_sizes(&sizes)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);
        // SAFETY: `info` is a valid descriptor pool create info.
        unsafe { Ok(self.device.device.create_descriptor_pool(&info, ALLOC)?) }
    }

    /// Allocates one descriptor set matching `layout`, growing the pool
    /// chain if every existing pool is full or fragmented.
    fn allocate(
        &mut self,
        layout: vk::DescriptorSetLayout,
    ) -> Result<(vk::DescriptorSet, vk::DescriptorPool), Error> {
        let mut max_free_observed: u32 = 0;

        for index in 0..self.pools.len() {
            let handle = self.pools[index].handle;
            let layouts = [layout];
            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(handle)
                .set_layouts(&layouts);
            // SAFETY: `handle` is a live pool owned by `self`; `layout` is
            // owned by the caller's `PipelineState` for the duration of
            // this call.
            match unsafe { self.device.device.allocate_descriptor_sets(&alloc_info) } {
                Ok(sets) => {
                    self.pools[index].size += 1;
                    if index != 0 {
                        self.pools.swap(0, index);
                    }
                    return Ok((sets[0], handle));
                }
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
                    let free = self.pools[index].capacity - self.pools[index].size;
                    max_free_observed = max_free_observed.max(free);
                    continue;
                }
                Err(e) => return Err(Error::from(e)),
            }
        }

        // Every existing pool (if any) failed above. If the exhausted pools
        // still report at least a full `P` worth of free slots, the failure
        // is fragmentation rather than true exhaustion: allocate another
        // pool at the same capacity. Otherwise the working set has outgrown
        // `P`; double it.
        if !self.pools.is_empty() {
            if max_free_observed < self.current_capacity {
                self.current_capacity *= 2;
            }
        }

        let new_pool = self.create_pool(self.current_capacity)?;
        self.pools.insert(
            0,
            Pool {
                handle: new_pool,
                capacity: self.current_capacity,
                size: 0,
            },
        );

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(new_pool)
            .set_layouts(&layouts);
        // SAFETY: `new_pool` was just created with room for `self.current_capacity` sets.
        let sets = unsafe {
            self.device
                .device
                .allocate_descriptor_sets(&alloc_info)
                .map_err(Error::from)?
        };
        self.pools[0].size += 1;
        Ok((sets[0], new_pool))
    }

    fn free(&mut self, pool: vk::DescriptorPool, set: vk::DescriptorSet) {
        // SAFETY: `pool` was created with `FREE_DESCRIPTOR_SET` and `set` was
        // allocated from it by `allocate` above.
        unsafe {
            let _ = self.device.device.free_descriptor_sets(pool, &[set]);
        }
        if let Some(entry) = self.pools.iter_mut().find(|p| p.handle == pool) {
            entry.size = entry.size.saturating_sub(1);
        }
    }
}

impl Drop for DescriptorSetPool {
    fn drop(&mut self) {
        if thread::panicking() {
            return;
        }
        // SAFETY: every `DescriptorSet` allocated from these pools must have
        // been dropped before the `Context` that owns this pool.
        unsafe {
            for pool in &self.pools {
                self.device.device.destroy_descriptor_pool(pool.handle, ALLOC);
            }
        }
    }
}

/// What a single binding in a [`DescriptorSetDescriptor`] is bound to (§3).
pub enum DescriptorResource {
    UniformBuffer {
        buffer: Arc<Buffer>,
        offset: u64,
        range: u64,
    },
    StorageBuffer {
        buffer: Arc<Buffer>,
        offset: u64,
        range: u64,
    },
    Sampler(Arc<Sampler>),
    SampledImage(Arc<Image>),
    CombinedImageSampler {
        image: Arc<Image>,
        sampler: Arc<Sampler>,
    },
}

pub struct DescriptorSetBinding {
    pub binding: u32,
    pub resource: DescriptorResource,
}

pub struct DescriptorSetDescriptor<'a> {
    pub pipeline: &'a PipelineState,
    pub set_index: u32,
    pub bindings: Vec<DescriptorSetBinding>,
}

/// A bound set of resources matching one of a [`PipelineState`]'s descriptor
/// set layouts (§3, §4.8).
pub struct DescriptorSet {
    device: Arc<DeviceHandle>,
    pool: Arc<Mutex<DescriptorSetPool>>,
    descriptor_set: vk::DescriptorSet,
    backing_pool: vk::DescriptorPool,
    // Kept alive so the bound resources outlive the descriptor set using them.
    _resources: Vec<DescriptorResource>,
}

impl DescriptorSet {
    pub(crate) fn new(
        device: Arc<DeviceHandle>,
        pool: &Arc<Mutex<DescriptorSetPool>>,
        desc: DescriptorSetDescriptor<'_>,
    ) -> Result<Self, Error> {
        // Set 0 is reserved for push descriptors (`CommandBuffer::bind_descriptor`)
        // and its layout cannot be allocated from a pool.
        if desc.set_index == 0 {
            return Err(Error::InternalError);
        }
        let layouts = desc.pipeline.descriptor_set_layouts();
        let layout = *layouts
            .get(desc.set_index as usize)
            .ok_or(Error::InternalError)?;

        let (descriptor_set, backing_pool) = pool.lock().allocate(layout)?;

        let mut buffer_infos = Vec::with_capacity(desc.bindings.len());
        let mut image_infos = Vec::with_capacity(desc.bindings.len());
        for binding in &desc.bindings {
            match &binding.resource {
                DescriptorResource::UniformBuffer { buffer, offset, range }
                | DescriptorResource::StorageBuffer { buffer, offset, range } => {
                    buffer_infos.push((
                        binding.binding,
                        matches!(binding.resource, DescriptorResource::StorageBuffer { .. }),
                        vk::DescriptorBufferInfo::default()
                            .buffer(buffer.raw())
                            .offset(*offset)
                            .range(*range),
                    ));
                }
                DescriptorResource::Sampler(sampler) => {
                    image_infos.push((
                        binding.binding,
                        vk::DescriptorType::SAMPLER,
                        vk::DescriptorImageInfo::default().sampler(sampler.raw()),
                    ));
                }
                DescriptorResource::SampledImage(image) => {
                    image_infos.push((
                        binding.binding,
                        vk::DescriptorType::SAMPLED_IMAGE,
                        vk::DescriptorImageInfo::default()
                            .image_view(image.view())
                            .image_layout(image.current_layout()),
                    ));
                }
                DescriptorResource::CombinedImageSampler { image, sampler } => {
                    image_infos.push((
                        binding.binding,
                        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                        vk::DescriptorImageInfo::default()
                            .sampler(sampler.raw())
                            .image_view(image.view())
                            .image_layout(image.current_layout()),
                    ));
                }
            }
        }

        let mut writes = Vec::with_capacity(buffer_infos.len() + image_infos.len());
        for (binding, is_storage, info) in &buffer_infos {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(descriptor_set)
                    .dst_binding(*binding)
                    .descriptor_type(if *is_storage {
                        vk::DescriptorType::STORAGE_BUFFER
                    } else {
                        vk::DescriptorType::UNIFORM_BUFFER
                    })
                    .buffer_info(std::slice::from_ref(info)),
            );
        }
        for (binding, ty, info) in &image_infos {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(descriptor_set)
                    .dst_binding(*binding)
                    .descriptor_type(*ty)
                    .image_info(std::slice::from_ref(info)),
            );
        }

        // SAFETY: every `DescriptorBufferInfo`/`DescriptorImageInfo` above
        // stays alive until this call returns; `descriptor_set` was just
        // allocated with a compatible layout.
        unsafe {
            device.device.update_descriptor_sets(&writes, &[]);
        }

        let resources = desc.bindings.into_iter().map(|b| b.resource).collect();

        Ok(Self {
            device,
            pool: pool.clone(),
            descriptor_set,
            backing_pool,
            _resources: resources,
        })
    }

    pub(crate) fn raw(&self) -> vk::DescriptorSet {
        self.descriptor_set
    }
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        if thread::panicking() {
            return;
        }
        let _ = &self.device;
        self.pool.lock().free(self.backing_pool, self.descriptor_set);
    }
}
