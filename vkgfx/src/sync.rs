//! Host↔GPU and GPU↔GPU synchronization primitives (§3, §5).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ash::vk;

use crate::context::{DeviceHandle, ALLOC};
use crate::error::Error;

/// Host-waitable, resettable binary fence.
///
/// `Fence::wait` blocks the calling thread until the GPU signals the fence;
/// the timeout is unbounded, matching §5's "suspension points" note.
#[derive(Debug)]
pub struct Fence {
    pub(crate) device: Arc<DeviceHandle>,
    pub(crate) fence: vk::Fence,
}

impl Fence {
    pub(crate) fn new(device: Arc<DeviceHandle>, signaled: bool) -> Result<Self, Error> {
        let mut info = vk::FenceCreateInfo::default();
        if signaled {
            info = info.flags(vk::FenceCreateFlags::SIGNALED);
        }
        // SAFETY: `info` describes a valid fence create info.
        let fence = unsafe { device.device.create_fence(&info, ALLOC)? };
        Ok(Self { device, fence })
    }

    pub(crate) fn raw(&self) -> vk::Fence {
        self.fence
    }

    /// Blocks the host thread until the fence is signaled. Unbounded timeout.
    pub fn wait(&self) -> Result<(), Error> {
        // SAFETY: `self.fence` was created by `self.device` and is not destroyed
        // while this call is in flight (we hold `&self`).
        unsafe {
            self.device
                .device
                .wait_for_fences(&[self.fence], true, u64::MAX)?;
        }
        Ok(())
    }

    /// Returns `true` without blocking if the fence is already signaled.
    pub fn is_signaled(&self) -> Result<bool, Error> {
        // SAFETY: same as `wait`.
        let status = unsafe { self.device.device.get_fence_status(self.fence) };
        match status {
            Ok(signaled) => Ok(signaled),
            Err(err) => Err(err.into()),
        }
    }

    /// Resets the fence to the unsignaled state.
    pub fn reset(&self) -> Result<(), Error> {
        // SAFETY: the fence is not in use by a pending queue submission when
        // `reset` is called by a well-behaved caller (spec §3: the caller owns
        // fence lifecycle around a single submit/wait cycle).
        unsafe { self.device.device.reset_fences(&[self.fence])? };
        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        if thread::panicking() {
            return;
        }
        // SAFETY: `self.fence` is not referenced by any pending submission;
        // the caller is responsible for waiting before dropping an in-flight
        // fence, matching the teacher's `Swapchain`/`Buffer` drop convention.
        unsafe {
            self.device.device.destroy_fence(self.fence, ALLOC);
        }
    }
}

/// A binary semaphore can only ever be waited on by the GPU (another queue
/// submission or a WSI call); a timeline semaphore additionally exposes a
/// monotonic counter the host can block on via `vkWaitSemaphores` (§5).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SemaphoreKind {
    Binary,
    Timeline,
}

/// GPU↔GPU (and, for timeline semaphores, host↔GPU) synchronization
/// primitive.
///
/// General-purpose semaphores created via [`crate::context::Context::create_semaphore`]
/// are timeline semaphores: each submission that signals one advances its
/// counter, and [`Self::wait`] blocks the host until that counter is
/// reached via `vkWaitSemaphores`. The swapchain's own acquire/present ring
/// ([`crate::swapchain::Swapchain`]) uses plain binary semaphores instead,
/// since `vkAcquireNextImageKHR`/`vkQueuePresentKHR` require them.
#[derive(Debug)]
pub struct Semaphore {
    pub(crate) device: Arc<DeviceHandle>,
    pub(crate) semaphore: vk::Semaphore,
    kind: SemaphoreKind,
    /// For timeline semaphores, the value most recently handed out by
    /// [`Self::advance`] as a submission's signal target.
    value: AtomicU64,
}

impl Semaphore {
    pub(crate) fn new(device: Arc<DeviceHandle>) -> Result<Self, Error> {
        Self::create(device, SemaphoreKind::Timeline)
    }

    /// A plain binary semaphore for WSI acquire/present use; cannot be
    /// host-waited (§4.12).
    pub(crate) fn new_binary(device: Arc<DeviceHandle>) -> Result<Self, Error> {
        Self::create(device, SemaphoreKind::Binary)
    }

    fn create(device: Arc<DeviceHandle>, kind: SemaphoreKind) -> Result<Self, Error> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(match kind {
                SemaphoreKind::Binary => vk::SemaphoreType::BINARY,
                SemaphoreKind::Timeline => vk::SemaphoreType::TIMELINE,
            })
            .initial_value(0);
        let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        // SAFETY: `info` describes a valid semaphore create info; the device
        // negotiated `timeline_semaphore` at creation (§4.13).
        let semaphore = unsafe { device.device.create_semaphore(&info, ALLOC)? };
        Ok(Self {
            device,
            semaphore,
            kind,
            value: AtomicU64::new(0),
        })
    }

    pub(crate) fn raw(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Advances this semaphore's timeline value and returns the new target;
    /// the caller submits with this value as the signal value. A no-op
    /// value (0) for binary semaphores, which `VkTimelineSemaphoreSubmitInfo`
    /// ignores at their index (§5).
    pub(crate) fn submit_signal_value(&self) -> u64 {
        match self.kind {
            SemaphoreKind::Binary => 0,
            SemaphoreKind::Timeline => self.value.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }

    /// The value a submission waiting on this semaphore should wait for:
    /// the most recent value handed out by `submit_signal_value`. Ignored
    /// for binary semaphores.
    pub(crate) fn submit_wait_value(&self) -> u64 {
        match self.kind {
            SemaphoreKind::Binary => 0,
            SemaphoreKind::Timeline => self.value.load(Ordering::SeqCst),
        }
    }

    /// Blocks the calling thread until this semaphore's timeline counter
    /// reaches the value most recently assigned by `submit_signal_value`
    /// (i.e. the signal target of the latest submission that signals this
    /// semaphore), or until `timeout` elapses (default: unbounded).
    ///
    /// Binary semaphores cannot be host-waited; calling this on one returns
    /// `Error::InternalError`.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), Error> {
        if self.kind == SemaphoreKind::Binary {
            return Err(Error::InternalError);
        }
        let value = self.value.load(Ordering::SeqCst);
        let timeout_ns = timeout.map(|d| d.as_nanos().min(u64::MAX as u128) as u64).unwrap_or(u64::MAX);
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(std::slice::from_ref(&self.semaphore))
            .values(std::slice::from_ref(&value));
        // SAFETY: `self.semaphore` is a live timeline semaphore owned by
        // `self.device`.
        unsafe { self.device.device.wait_semaphores(&wait_info, timeout_ns)? };
        Ok(())
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        if thread::panicking() {
            return;
        }
        // SAFETY: the caller does not drop a semaphore that is still the
        // wait/signal target of a pending submission.
        unsafe {
            self.device.device.destroy_semaphore(self.semaphore, ALLOC);
        }
    }
}
