// Window collaborator
//
// A winit window driven by pump_app_events so one thread owns both event
// polling and the frame loop. Resize notifications only raise a flag; the
// frame engine drains it at the present checkpoint.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    window::{Window, WindowAttributes, WindowId},
};

use crate::config::WindowConfig;

/// What the swapchain manager and frame engine need from the window.
pub trait PresentationWindow {
    /// Current drawable size in pixels; 0×0 while minimized.
    fn framebuffer_size(&self) -> (u32, u32);

    /// Block until at least one event arrives and process it.
    fn wait_events(&mut self);

    /// Whether a resize was reported since the last call. Clears the flag.
    fn take_resize_request(&mut self) -> bool;

    fn close_requested(&self) -> bool;
}

pub struct AppWindow {
    window: Arc<Window>,
    state: WindowState,
    event_loop: EventLoop<()>,
}

impl AppWindow {
    /// Create the event loop and pump it until the window exists.
    pub fn open(config: &WindowConfig) -> Result<Self> {
        let mut event_loop = EventLoop::new().context("Failed to create event loop")?;
        let mut state = WindowState::new(config);

        let window = loop {
            if let Some(window) = state.window.clone() {
                break window;
            }
            if let Some(error) = state.create_error.take() {
                anyhow::bail!("Failed to create window: {}", error);
            }
            if let PumpStatus::Exit(code) = event_loop.pump_app_events(Some(Duration::ZERO), &mut state) {
                anyhow::bail!("Event loop exited with code {} before the window was created", code);
            }
        };

        log::info!(
            "Window: {}x{} \"{}\"",
            config.width,
            config.height,
            config.title
        );

        Ok(Self {
            window,
            state,
            event_loop,
        })
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    /// Process pending events without blocking.
    pub fn poll_events(&mut self) {
        self.pump(Some(Duration::ZERO));
    }

    fn pump(&mut self, timeout: Option<Duration>) {
        if let PumpStatus::Exit(_) = self.event_loop.pump_app_events(timeout, &mut self.state) {
            self.state.close_requested = true;
        }
    }
}

impl PresentationWindow for AppWindow {
    fn framebuffer_size(&self) -> (u32, u32) {
        let size = self.window.inner_size();
        (size.width, size.height)
    }

    fn wait_events(&mut self) {
        self.pump(None);
    }

    fn take_resize_request(&mut self) -> bool {
        std::mem::take(&mut self.state.resized)
    }

    fn close_requested(&self) -> bool {
        self.state.close_requested
    }
}

struct WindowState {
    attributes: WindowAttributes,
    window: Option<Arc<Window>>,
    create_error: Option<String>,
    resized: bool,
    close_requested: bool,
}

impl WindowState {
    fn new(config: &WindowConfig) -> Self {
        let attributes = WindowAttributes::default()
            .with_title(&config.title)
            .with_inner_size(PhysicalSize::new(config.width, config.height))
            .with_resizable(config.resizable);

        Self {
            attributes,
            window: None,
            create_error: None,
            resized: false,
            close_requested: false,
        }
    }
}

impl ApplicationHandler for WindowState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        match event_loop.create_window(self.attributes.clone()) {
            Ok(window) => self.window = Some(Arc::new(window)),
            Err(e) => self.create_error = Some(e.to_string()),
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested");
                self.close_requested = true;
            }
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.resized = true;
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if event.state.is_pressed() && event.physical_key == PhysicalKey::Code(KeyCode::Escape) {
                    log::info!("ESC pressed, exiting...");
                    self.close_requested = true;
                }
            }
            _ => {}
        }
    }
}
