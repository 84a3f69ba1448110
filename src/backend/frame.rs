// Frame synchronization engine
//
// Drives one iteration per displayed frame over a fixed ring of frame slots:
//
//   wait(slot fence) -> acquire -> reset + record -> submit -> present -> advance
//
// Any soft failure returns before the advance, so the same slot is retried.
//
// The slot index cycles 0..N independently of the acquired image index. The
// GPU work itself sits behind FrameBackend so the sequencing can be checked
// without a device.

use anyhow::Result;
use ash::prelude::VkResult;
use ash::vk;

use crate::window::PresentationWindow;

/// Frames the CPU may run ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    OutOfDate,
    Failed(vk::Result),
}

impl From<VkResult<(u32, bool)>> for AcquireOutcome {
    fn from(result: VkResult<(u32, bool)>) -> Self {
        match result {
            Ok((image_index, suboptimal)) => Self::Acquired {
                image_index,
                suboptimal,
            },
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Self::OutOfDate,
            Err(e) => Self::Failed(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
    Failed(vk::Result),
}

impl From<VkResult<bool>> for PresentOutcome {
    fn from(result: VkResult<bool>) -> Self {
        match result {
            Ok(false) => Self::Presented,
            Ok(true) => Self::Suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Self::OutOfDate,
            Err(e) => Self::Failed(e),
        }
    }
}

/// What happened to one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented,
    /// The swapchain was rebuilt, either instead of or after presenting.
    Rebuilt,
    /// A soft failure skipped the rest of the frame.
    Dropped,
}

/// GPU side of a frame, addressed by frame slot.
///
/// Errors returned here are fatal; soft failures travel as outcomes or as
/// `vk::Result` from `record`/`submit`.
pub trait FrameBackend {
    /// Block until the slot's last submission has completed.
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;

    /// Acquire the next image, signaling the slot's image-available semaphore.
    fn acquire_image(&mut self, slot: usize) -> AcquireOutcome;

    /// Unsignal the slot's fence and reset its command buffer.
    fn reset_slot(&mut self, slot: usize) -> Result<()>;

    /// Record the draw into the slot's command buffer, targeting `image_index`.
    fn record(&mut self, slot: usize, image_index: u32) -> VkResult<()>;

    /// Submit the slot's command buffer, signaling its render-finished
    /// semaphore and fence.
    fn submit(&mut self, slot: usize) -> VkResult<()>;

    /// Restore a slot whose frame was abandoned after `reset_slot`.
    fn rearm_slot(&mut self, slot: usize) -> Result<()>;

    fn present(&mut self, slot: usize, image_index: u32) -> PresentOutcome;

    fn rebuild_swapchain(&mut self, window: &mut dyn PresentationWindow) -> Result<()>;
}

/// The ring of frame slots and the current position in it.
#[derive(Debug)]
pub struct FrameLoop {
    slot_count: usize,
    current_slot: usize,
}

impl FrameLoop {
    pub fn new(slot_count: usize) -> Self {
        assert!(slot_count >= 1, "need at least one frame slot");
        Self {
            slot_count,
            current_slot: 0,
        }
    }

    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    pub fn draw_frame<B, W>(&mut self, gpu: &mut B, window: &mut W) -> Result<FrameStatus>
    where
        B: FrameBackend + ?Sized,
        W: PresentationWindow,
    {
        let slot = self.current_slot;

        // Throttle: the slot's previous frame must be finished on the GPU
        gpu.wait_for_slot(slot)?;

        let image_index = match gpu.acquire_image(slot) {
            AcquireOutcome::Acquired { image_index, .. } => image_index,
            AcquireOutcome::OutOfDate => {
                log::debug!("Swapchain out of date on acquire, rebuilding");
                gpu.rebuild_swapchain(window)?;
                return Ok(FrameStatus::Rebuilt);
            }
            AcquireOutcome::Failed(e) => {
                log::warn!("Failed to acquire swapchain image: {}", e);
                return Ok(FrameStatus::Dropped);
            }
        };

        // Only now is the fence reset; an early return above leaves it signaled
        gpu.reset_slot(slot)?;

        // On record/submit failure the acquired image is never presented and
        // stays held until the next rebuild. Accepted: these failures are rare
        // and each one already stalls the device in rearm.
        if let Err(e) = gpu.record(slot, image_index) {
            log::warn!("Failed to record command buffer: {}", e);
            gpu.rearm_slot(slot)?;
            return Ok(FrameStatus::Dropped);
        }
        if let Err(e) = gpu.submit(slot) {
            log::warn!("Failed to submit draw command buffer: {}", e);
            gpu.rearm_slot(slot)?;
            return Ok(FrameStatus::Dropped);
        }

        let presented = gpu.present(slot, image_index);

        // Always drained here so a resize can't outlive this checkpoint
        let resized = window.take_resize_request();

        let status = match presented {
            PresentOutcome::OutOfDate | PresentOutcome::Suboptimal => {
                log::debug!("Present reported {:?}, rebuilding", presented);
                gpu.rebuild_swapchain(window)?;
                FrameStatus::Rebuilt
            }
            _ if resized => {
                log::debug!("Window resized, rebuilding");
                gpu.rebuild_swapchain(window)?;
                FrameStatus::Rebuilt
            }
            PresentOutcome::Failed(e) => {
                // Soft failure: the slot is not advanced
                log::warn!("Failed to present swapchain image: {}", e);
                return Ok(FrameStatus::Dropped);
            }
            PresentOutcome::Presented => FrameStatus::Presented,
        };

        self.current_slot = (slot + 1) % self.slot_count;
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::testing::FakeWindow;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Wait(usize),
        Acquire(usize),
        Reset(usize),
        Record(usize, u32),
        Submit(usize),
        Rearm(usize),
        Present(usize, u32),
        Rebuild,
    }

    /// In-memory GPU. Submitted work only completes when its slot is waited
    /// on, which is the worst case the fence discipline has to survive.
    struct FakeGpu {
        calls: Vec<Call>,
        image_count: u32,
        next_image: u32,
        acquire_script: VecDeque<AcquireOutcome>,
        present_script: VecDeque<PresentOutcome>,
        submit_script: VecDeque<VkResult<()>>,
        fence_signaled: Vec<bool>,
        pending: Vec<bool>,
        max_in_flight: usize,
    }

    impl FakeGpu {
        fn new(slots: usize, image_count: u32) -> Self {
            Self {
                calls: Vec::new(),
                image_count,
                next_image: 0,
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                submit_script: VecDeque::new(),
                fence_signaled: vec![true; slots],
                pending: vec![false; slots],
                max_in_flight: 0,
            }
        }

        fn in_flight(&self) -> usize {
            self.pending.iter().filter(|&&p| p).count()
        }

        fn count(&self, wanted: fn(&Call) -> bool) -> usize {
            self.calls.iter().filter(|c| wanted(c)).count()
        }
    }

    impl FrameBackend for FakeGpu {
        fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Wait(slot));
            // The GPU drains the slot's work
            if self.pending[slot] {
                self.pending[slot] = false;
                self.fence_signaled[slot] = true;
            }
            anyhow::ensure!(self.fence_signaled[slot], "waited on a fence that will never signal");
            Ok(())
        }

        fn acquire_image(&mut self, slot: usize) -> AcquireOutcome {
            self.calls.push(Call::Acquire(slot));
            self.acquire_script.pop_front().unwrap_or_else(|| {
                let image_index = self.next_image;
                self.next_image = (self.next_image + 1) % self.image_count;
                AcquireOutcome::Acquired {
                    image_index,
                    suboptimal: false,
                }
            })
        }

        fn reset_slot(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Reset(slot));
            assert!(!self.pending[slot], "reset a slot the GPU is still using");
            self.fence_signaled[slot] = false;
            Ok(())
        }

        fn record(&mut self, slot: usize, image_index: u32) -> VkResult<()> {
            self.calls.push(Call::Record(slot, image_index));
            Ok(())
        }

        fn submit(&mut self, slot: usize) -> VkResult<()> {
            self.calls.push(Call::Submit(slot));
            let result = self.submit_script.pop_front().unwrap_or(Ok(()));
            if result.is_ok() {
                self.pending[slot] = true;
                self.max_in_flight = self.max_in_flight.max(self.in_flight());
            }
            result
        }

        fn rearm_slot(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Rearm(slot));
            self.fence_signaled[slot] = true;
            Ok(())
        }

        fn present(&mut self, slot: usize, image_index: u32) -> PresentOutcome {
            self.calls.push(Call::Present(slot, image_index));
            self.present_script.pop_front().unwrap_or(PresentOutcome::Presented)
        }

        fn rebuild_swapchain(&mut self, _window: &mut dyn PresentationWindow) -> Result<()> {
            self.calls.push(Call::Rebuild);
            self.next_image = 0;
            Ok(())
        }
    }

    fn window() -> FakeWindow {
        FakeWindow::with_sizes(&[(800, 600)])
    }

    #[test]
    fn steady_state_frame_follows_protocol_order() {
        let mut gpu = FakeGpu::new(2, 3);
        let mut frames = FrameLoop::new(2);

        let status = frames.draw_frame(&mut gpu, &mut window()).unwrap();

        assert_eq!(status, FrameStatus::Presented);
        assert_eq!(
            gpu.calls,
            vec![
                Call::Wait(0),
                Call::Acquire(0),
                Call::Reset(0),
                Call::Record(0, 0),
                Call::Submit(0),
                Call::Present(0, 0),
            ]
        );
        assert_eq!(frames.current_slot(), 1);
    }

    #[test]
    fn out_of_date_acquire_rebuilds_without_submit_or_present() {
        let mut gpu = FakeGpu::new(2, 3);
        gpu.acquire_script.push_back(AcquireOutcome::OutOfDate);
        let mut frames = FrameLoop::new(2);

        let status = frames.draw_frame(&mut gpu, &mut window()).unwrap();

        assert_eq!(status, FrameStatus::Rebuilt);
        assert_eq!(gpu.calls, vec![Call::Wait(0), Call::Acquire(0), Call::Rebuild]);
        // The slot was never used, its fence is still signaled
        assert_eq!(frames.current_slot(), 0);
        assert!(gpu.fence_signaled[0]);
    }

    #[test]
    fn failed_acquire_drops_frame_without_rebuilding() {
        let mut gpu = FakeGpu::new(2, 3);
        gpu.acquire_script
            .push_back(AcquireOutcome::Failed(vk::Result::TIMEOUT));
        let mut frames = FrameLoop::new(2);
        let mut window = window();

        assert_eq!(frames.draw_frame(&mut gpu, &mut window).unwrap(), FrameStatus::Dropped);
        assert_eq!(gpu.count(|c| matches!(c, Call::Rebuild | Call::Submit(_))), 0);

        // The next tick carries on normally with the same slot
        assert_eq!(frames.draw_frame(&mut gpu, &mut window).unwrap(), FrameStatus::Presented);
        assert_eq!(gpu.calls.last(), Some(&Call::Present(0, 0)));
    }

    #[test]
    fn suboptimal_acquire_still_renders() {
        let mut gpu = FakeGpu::new(2, 3);
        gpu.acquire_script.push_back(AcquireOutcome::Acquired {
            image_index: 1,
            suboptimal: true,
        });
        let mut frames = FrameLoop::new(2);

        assert_eq!(frames.draw_frame(&mut gpu, &mut window()).unwrap(), FrameStatus::Presented);
        assert!(gpu.calls.contains(&Call::Present(0, 1)));
    }

    #[test]
    fn present_out_of_date_or_suboptimal_rebuilds() {
        for outcome in [PresentOutcome::OutOfDate, PresentOutcome::Suboptimal] {
            let mut gpu = FakeGpu::new(2, 3);
            gpu.present_script.push_back(outcome);
            let mut frames = FrameLoop::new(2);

            assert_eq!(frames.draw_frame(&mut gpu, &mut window()).unwrap(), FrameStatus::Rebuilt);
            assert_eq!(gpu.calls.last(), Some(&Call::Rebuild));
            assert_eq!(frames.current_slot(), 1);
        }
    }

    #[test]
    fn resize_flag_rebuilds_at_present_and_is_cleared() {
        let mut gpu = FakeGpu::new(2, 3);
        let mut frames = FrameLoop::new(2);
        let mut window = window();
        window.resized = true;

        assert_eq!(frames.draw_frame(&mut gpu, &mut window).unwrap(), FrameStatus::Rebuilt);
        assert!(!window.resized);

        assert_eq!(frames.draw_frame(&mut gpu, &mut window).unwrap(), FrameStatus::Presented);
        assert_eq!(gpu.count(|c| *c == Call::Rebuild), 1);
    }

    #[test]
    fn resize_flag_is_consumed_even_when_present_is_out_of_date() {
        let mut gpu = FakeGpu::new(2, 3);
        gpu.present_script.push_back(PresentOutcome::OutOfDate);
        let mut frames = FrameLoop::new(2);
        let mut window = window();
        window.resized = true;

        frames.draw_frame(&mut gpu, &mut window).unwrap();
        frames.draw_frame(&mut gpu, &mut window).unwrap();

        assert_eq!(gpu.count(|c| *c == Call::Rebuild), 1);
    }

    #[test]
    fn failed_present_is_soft() {
        let mut gpu = FakeGpu::new(2, 3);
        gpu.present_script
            .push_back(PresentOutcome::Failed(vk::Result::ERROR_SURFACE_LOST_KHR));
        let mut frames = FrameLoop::new(2);

        let mut window = window();

        assert_eq!(frames.draw_frame(&mut gpu, &mut window).unwrap(), FrameStatus::Dropped);
        assert_eq!(gpu.count(|c| *c == Call::Rebuild), 0);
        assert_eq!(frames.current_slot(), 0);

        // The submitted work still signals the fence, so the slot is reusable
        assert_eq!(frames.draw_frame(&mut gpu, &mut window).unwrap(), FrameStatus::Presented);
        assert_eq!(gpu.calls.last(), Some(&Call::Present(0, 1)));
        assert_eq!(frames.current_slot(), 1);
    }

    #[test]
    fn resize_wins_over_failed_present() {
        let mut gpu = FakeGpu::new(2, 3);
        gpu.present_script
            .push_back(PresentOutcome::Failed(vk::Result::ERROR_SURFACE_LOST_KHR));
        let mut frames = FrameLoop::new(2);
        let mut window = window();
        window.resized = true;

        assert_eq!(frames.draw_frame(&mut gpu, &mut window).unwrap(), FrameStatus::Rebuilt);
        assert_eq!(frames.current_slot(), 1);
        assert!(!window.resized);
    }

    #[test]
    fn failed_submit_rearms_slot_and_skips_present() {
        let mut gpu = FakeGpu::new(2, 3);
        gpu.submit_script
            .push_back(Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY));
        let mut frames = FrameLoop::new(2);
        let mut window = window();

        assert_eq!(frames.draw_frame(&mut gpu, &mut window).unwrap(), FrameStatus::Dropped);
        assert_eq!(gpu.calls.last(), Some(&Call::Rearm(0)));
        assert_eq!(gpu.count(|c| matches!(c, Call::Present(..))), 0);

        // Without the rearm this wait would never return
        assert_eq!(frames.draw_frame(&mut gpu, &mut window).unwrap(), FrameStatus::Presented);
    }

    #[test]
    fn never_more_than_n_frames_in_flight() {
        for slots in 1..=4 {
            let mut gpu = FakeGpu::new(slots, 3);
            let mut frames = FrameLoop::new(slots);
            let mut window = window();

            for _ in 0..25 {
                frames.draw_frame(&mut gpu, &mut window).unwrap();
                assert!(gpu.in_flight() <= slots);
            }
            assert_eq!(gpu.max_in_flight, slots);
        }
    }

    #[test]
    fn image_index_and_slot_index_cycle_independently() {
        let mut gpu = FakeGpu::new(2, 3);
        let mut frames = FrameLoop::new(2);
        let mut window = window();

        for _ in 0..6 {
            frames.draw_frame(&mut gpu, &mut window).unwrap();
        }

        let records: Vec<_> = gpu
            .calls
            .iter()
            .filter_map(|c| match *c {
                Call::Record(slot, image) => Some((slot, image)),
                _ => None,
            })
            .collect();
        assert_eq!(records, vec![(0, 0), (1, 1), (0, 2), (1, 0), (0, 1), (1, 2)]);

        // Each present goes out with the image its slot recorded against
        let presents: Vec<_> = gpu
            .calls
            .iter()
            .filter_map(|c| match *c {
                Call::Present(slot, image) => Some((slot, image)),
                _ => None,
            })
            .collect();
        assert_eq!(presents, records);
    }

    #[test]
    fn outcomes_map_from_vulkan_results() {
        assert_eq!(
            AcquireOutcome::from(Ok((2, true))),
            AcquireOutcome::Acquired {
                image_index: 2,
                suboptimal: true
            }
        );
        assert_eq!(
            AcquireOutcome::from(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)),
            AcquireOutcome::OutOfDate
        );
        assert_eq!(PresentOutcome::from(Ok(true)), PresentOutcome::Suboptimal);
        assert_eq!(
            PresentOutcome::from(Err(vk::Result::ERROR_DEVICE_LOST)),
            PresentOutcome::Failed(vk::Result::ERROR_DEVICE_LOST)
        );
    }
}
