//! A Vulkan queue plus its transient command pools and the worker thread
//! that reclaims staging buffers once their submission's fence signals
//! (§4.10).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use ash::vk;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::command::CommandBuffer;
use crate::context::{DeviceHandle, ALLOC};
use crate::error::Error;
use crate::staging::StagingPool;
use crate::sync::Semaphore;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Graphics,
    Compute,
    Transfer,
}

/// A submission's fence, owned either by the caller (who wants to observe
/// completion themselves) or internally (created solely to gate staging
/// buffer reclamation).
enum ReclaimFence {
    Owned(vk::Fence),
    Borrowed(vk::Fence),
}

impl ReclaimFence {
    fn raw(&self) -> vk::Fence {
        match self {
            Self::Owned(f) | Self::Borrowed(f) => *f,
        }
    }
}

struct Reclaim {
    fence: ReclaimFence,
    staging_buffers: Vec<Arc<Buffer>>,
}

pub struct CommandBufferSubmitInfo<'a> {
    pub command_buffer: &'a CommandBuffer,
    pub wait_semaphores: Vec<(&'a Semaphore, vk::PipelineStageFlags)>,
    pub signal_semaphores: Vec<&'a Semaphore>,
}

/// A queue plus a per-calling-thread map of transient command pools (each
/// command pool may only be used from the thread that created it) and the
/// single reclamation worker draining completed submissions (REDESIGN
/// FLAGS: one long-running thread rather than a task spawned per submission).
pub struct CommandQueue {
    device: Arc<DeviceHandle>,
    role: QueueRole,
    family_index: u32,
    queue: Mutex<vk::Queue>,
    command_pools: Mutex<HashMap<ThreadId, vk::CommandPool>>,
    reclaim_tx: Option<Sender<Reclaim>>,
    staging_pool: Arc<Mutex<Option<Arc<StagingPool>>>>,
    worker: Option<thread::JoinHandle<()>>,
    /// Count of submissions handed to the reclamation worker but not yet
    /// drained; `wait_idle` spins on this reaching zero after
    /// `vkQueueWaitIdle` returns (§4.10).
    in_flight: Arc<AtomicUsize>,
}

impl CommandQueue {
    pub(crate) fn new(
        device: Arc<DeviceHandle>,
        role: QueueRole,
        family_index: u32,
        queue: vk::Queue,
    ) -> Self {
        let (reclaim_tx, reclaim_rx): (Sender<Reclaim>, Receiver<Reclaim>) =
            crossbeam_channel::unbounded();
        let staging_pool: Arc<Mutex<Option<Arc<StagingPool>>>> = Arc::new(Mutex::new(None));

        let in_flight = Arc::new(AtomicUsize::new(0));

        let worker_device = device.clone();
        let worker_staging_pool = staging_pool.clone();
        let worker_in_flight = in_flight.clone();
        let worker = thread::Builder::new()
            .name(format!("vkgfx-reclaim-{role:?}"))
            .spawn(move || reclaim_worker(worker_device, reclaim_rx, worker_staging_pool, worker_in_flight))
            .expect("failed to spawn reclamation worker thread");

        Self {
            device,
            role,
            family_index,
            queue: Mutex::new(queue),
            command_pools: Mutex::new(HashMap::new()),
            reclaim_tx: Some(reclaim_tx),
            staging_pool,
            worker: Some(worker),
            in_flight,
        }
    }

    pub fn role(&self) -> QueueRole {
        self.role
    }

    /// The raw queue handle, for presenting a swapchain image on this queue.
    /// Presentation and submission both lock the same queue mutex, so a
    /// present can never race a submit on the same `VkQueue` (§4.12).
    pub(crate) fn raw_for_present(&self) -> vk::Queue {
        *self.queue.lock()
    }

    fn pool_for_current_thread(&self) -> Result<vk::CommandPool, Error> {
        let thread_id = thread::current().id();
        let mut pools = self.command_pools.lock();
        if let Some(&pool) = pools.get(&thread_id) {
            return Ok(pool);
        }

        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.family_index)
            .flags(
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            );
        // SAFETY: `info` is a valid command pool create info.
        let pool = unsafe { self.device.device.create_command_pool(&info, ALLOC)? };
        pools.insert(thread_id, pool);
        Ok(pool)
    }

    pub(crate) fn create_command_buffer(
        &self,
        staging_pool: Arc<StagingPool>,
    ) -> Result<CommandBuffer, Error> {
        *self.staging_pool.lock() = Some(staging_pool.clone());
        let pool = self.pool_for_current_thread()?;

        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        // SAFETY: `pool` is a live command pool owned by this queue.
        let command_buffers = unsafe { self.device.device.allocate_command_buffers(&info)? };

        Ok(CommandBuffer::new(
            self.device.clone(),
            pool,
            command_buffers[0],
            staging_pool,
        ))
    }

    /// Submits one command buffer, optionally waiting on/signaling
    /// semaphores. If the caller supplies `fence`, it is used for the
    /// submission and the caller owns observing/resetting it; otherwise an
    /// internal fence is created solely to gate returning the command
    /// buffer's staging buffers to the pool.
    pub fn submit(
        &self,
        info: CommandBufferSubmitInfo<'_>,
        fence: Option<&crate::sync::Fence>,
    ) -> Result<(), Error> {
        let wait_semaphores: Vec<vk::Semaphore> =
            info.wait_semaphores.iter().map(|(s, _)| s.raw()).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> =
            info.wait_semaphores.iter().map(|(_, stage)| *stage).collect();
        let signal_semaphores: Vec<vk::Semaphore> =
            info.signal_semaphores.iter().map(|s| s.raw()).collect();
        let command_buffers = [info.command_buffer.raw()];

        // Every wait/signal semaphore gets a timeline value here, even the
        // binary ones the swapchain's WSI ring hands in: the struct is
        // ignored per-index for binary semaphores, so a uniform 0/advance()
        // call is harmless for them (§5).
        let wait_values: Vec<u64> = info
            .wait_semaphores
            .iter()
            .map(|(s, _)| s.submit_wait_value())
            .collect();
        let signal_values: Vec<u64> = info
            .signal_semaphores
            .iter()
            .map(|s| s.submit_signal_value())
            .collect();
        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .signal_semaphores(&signal_semaphores)
            .command_buffers(&command_buffers)
            .push_next(&mut timeline_info);

        let staging_buffers = info.command_buffer.take_staging_buffers();

        let reclaim_fence = if let Some(fence) = fence {
            ReclaimFence::Borrowed(fence.raw())
        } else if !staging_buffers.is_empty() {
            let create_info = vk::FenceCreateInfo::default();
            // SAFETY: `create_info` is a valid, unsignaled fence create info.
            let raw = unsafe { self.device.device.create_fence(&create_info, ALLOC)? };
            ReclaimFence::Owned(raw)
        } else {
            ReclaimFence::Borrowed(vk::Fence::null())
        };

        let queue = self.queue.lock();
        // SAFETY: `command_buffers` contains one executable command buffer
        // recorded against this queue's family; the fence (if any) is
        // unsignaled.
        unsafe {
            self.device
                .device
                .queue_submit(*queue, &[submit_info], reclaim_fence.raw())?;
        }
        drop(queue);

        if !staging_buffers.is_empty() {
            if let Some(tx) = &self.reclaim_tx {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(Reclaim {
                    fence: reclaim_fence,
                    staging_buffers,
                });
            }
        } else if let ReclaimFence::Owned(raw) = reclaim_fence {
            // No staging buffers to gate; nothing else needs this fence.
            // SAFETY: `raw` was just created above and used only in the
            // submit call; no one else references it.
            unsafe { self.device.device.destroy_fence(raw, ALLOC) };
        }

        Ok(())
    }

    /// Blocks until the queue has no outstanding work, including staging
    /// buffers still owned by the reclamation worker: `vkQueueWaitIdle`
    /// guarantees every submitted fence has signaled, but the worker thread
    /// may not have drained its channel and returned those buffers to the
    /// pool yet (§4.10, §8).
    pub fn wait_idle(&self) -> Result<(), Error> {
        {
            let queue = self.queue.lock();
            // SAFETY: `queue` is a valid, live queue handle.
            unsafe { self.device.device.queue_wait_idle(*queue)? };
        }
        while self.in_flight.load(Ordering::SeqCst) != 0 {
            thread::yield_now();
        }
        Ok(())
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        if thread::panicking() {
            return;
        }
        self.reclaim_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        // SAFETY: every command buffer allocated from these pools must have
        // stopped executing before the owning `Context` is torn down.
        unsafe {
            for &pool in self.command_pools.lock().values() {
                self.device.device.destroy_command_pool(pool, ALLOC);
            }
        }
    }
}

/// Waits for each submission's fence in turn and returns its staging buffers
/// to the pool. Runs for the lifetime of the owning `CommandQueue`; the
/// channel closing (on `CommandQueue::drop`) ends the loop.
fn reclaim_worker(
    device: Arc<DeviceHandle>,
    receiver: Receiver<Reclaim>,
    staging_pool: Arc<Mutex<Option<Arc<StagingPool>>>>,
    in_flight: Arc<AtomicUsize>,
) {
    while let Ok(entry) = receiver.recv() {
        let raw = entry.fence.raw();
        // SAFETY: `raw` is a valid fence from a completed or pending submission.
        let _ = unsafe { device.device.wait_for_fences(&[raw], true, u64::MAX) };

        if let ReclaimFence::Owned(raw) = entry.fence {
            // SAFETY: this fence was created solely for this submission and
            // is not referenced anywhere else.
            unsafe { device.device.destroy_fence(raw, ALLOC) };
        }

        if let Some(pool) = staging_pool.lock().as_ref() {
            pool.return_buffers(entry.staging_buffers);
        }
        in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
