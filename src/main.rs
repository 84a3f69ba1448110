// =============================================================================
// QUAD PRESENTER - Vulkan presentation loop
// =============================================================================
//
// Draws one vertex-colored quad every frame and keeps presenting through
// resizes, minimization and out-of-date swapchains.
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  AppWindow (winit, pumped on this thread)                       │
// │    └── Renderer                                                 │
// │          └── Vulkan Device + static quad buffers                │
// │                └── SwapchainManager (swapchain, pipeline)       │
// │                      └── FrameSlots (fences, semaphores)        │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW (FrameLoop::draw_frame):
// 1. Wait for the slot's previous submission
// 2. Acquire swapchain image
// 3. Record and submit the quad draw
// 4. Present, then rebuild if the surface or window changed
//
// =============================================================================

mod backend;
mod config;
mod renderer;
mod window;

use anyhow::Result;
use backend::frame::{FrameLoop, MAX_FRAMES_IN_FLIGHT};
use config::Config;
use renderer::Renderer;
use std::process::ExitCode;
use window::{AppWindow, PresentationWindow};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> ExitCode {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting quad presenter");
    log::info!("Present mode: {}", config.graphics.present_mode);

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Fatal: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Configured level, overridable through RUST_LOG.
fn init_logging(config: &Config) {
    env_logger::Builder::new()
        .filter_level(config.log_level())
        .parse_default_env()
        .init();
}

fn run(config: &Config) -> Result<()> {
    let mut window = AppWindow::open(&config.window)?;
    let mut renderer = Renderer::new(config, &mut window)?;
    let mut frames = FrameLoop::new(MAX_FRAMES_IN_FLIGHT);

    let mut frame_count: u64 = 0;
    while !window.close_requested() {
        window.poll_events();
        if window.close_requested() {
            break;
        }

        let status = frames.draw_frame(&mut renderer, &mut window)?;
        log::trace!("Frame {}: {:?}", frame_count, status);
        frame_count += 1;
    }

    log::info!("Shutting down after {} frames", frame_count);
    renderer.wait_idle()?;
    Ok(())
}
