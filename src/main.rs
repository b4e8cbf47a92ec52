// =============================================================================
// FRAME ENGINE - window harness
// =============================================================================
//
// Opens a winit window, brings up the Vulkan context on it and drives the
// frame scheduler from RedrawRequested.
//
// FRAME FLOW (per redraw):
// 1. Scheduler waits for the slot's fence
// 2. Acquires a swapchain image
// 3. Submits the pre-recorded clear for that image
// 4. Presents, rebuilding the swapchain if it went stale
//
// Resizes need no handling here: the scheduler compares the surface extent
// with the chain on every call.
//
// =============================================================================

use anyhow::{Context, Result};
use frame_engine::backend::debug::LogSink;
use frame_engine::backend::sync::CancelToken;
use frame_engine::{Config, FrameOutcome, FrameScheduler, VulkanContext};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting frame engine");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

fn init_logging(config: &Config) {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);

    if config.debug.log_to_file {
        match open_log_file(Path::new(&config.debug.log_file)) {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {:?}: {}", config.debug.log_file, e),
        }
    }
    builder.init();
}

/// Truncate the log file and stamp it with a session header.
fn open_log_file(path: &Path) -> std::io::Result<File> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    writeln!(file, "=== Frame Engine Log ===")?;
    writeln!(file, "Started: {:?}", std::time::SystemTime::now())?;
    writeln!(file)?;
    Ok(file)
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the scheduler (and the context inside it)
/// must go before the window it renders to.
struct App {
    config: Config,
    scheduler: Option<FrameScheduler<VulkanContext>>,
    cancel: Option<CancelToken>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            scheduler: None,
            cancel: None,
            window: None,
            is_fullscreen,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn init_vulkan(&mut self, window: Arc<Window>) -> Result<()> {
        let context = VulkanContext::new(window, &self.config, Box::new(LogSink))
            .context("Failed to create Vulkan context")?;
        log::info!(
            "Rendering on \"{}\" (validation {})",
            context.device_name(),
            if context.validation_enabled() { "on" } else { "off" }
        );
        log::debug!("Shader directory: {:?}", context.shaders().root());

        let scheduler = FrameScheduler::new(context, &self.config.frame)
            .context("Failed to create frame scheduler")?;
        self.cancel = Some(scheduler.cancel_token());
        self.scheduler = Some(scheduler);
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
        if let Some(mut scheduler) = self.scheduler.take() {
            if let Err(e) = scheduler.shutdown() {
                log::error!("Shutdown failed: {}", e);
            }
        }
    }

    fn render_frame(&mut self) -> Result<Option<FrameOutcome>> {
        let Some(scheduler) = self.scheduler.as_mut() else {
            return Ok(None);
        };
        let outcome = scheduler.draw_frame()?;
        if outcome == FrameOutcome::Rebuilt {
            log::debug!(
                "Swapchain rebuilt (generation {}, extent {:?})",
                scheduler.generation(),
                scheduler.extent()
            );
        }
        Ok(Some(outcome))
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    mode
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_vulkan(window.clone()) {
            log::error!("Failed to initialize Vulkan: {:#}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown();
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(Some(FrameOutcome::Presented | FrameOutcome::Rebuilt)) => self.update_fps(),
                Ok(_) => {}
                Err(e) => {
                    log::error!("Render error: {}", e);
                    self.shutdown();
                    event_loop.exit();
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                self.shutdown();
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.shutdown();
        log::info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_starts_with_a_fresh_header() {
        let path = std::env::temp_dir()
            .join(format!("frame-engine-log-{}.log", std::process::id()));
        std::fs::write(&path, "stale contents from a previous run\n").unwrap();

        let mut file = open_log_file(&path).unwrap();
        writeln!(file, "[INFO] first record").unwrap();
        drop(file);

        let written = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(written.starts_with("=== Frame Engine Log ===\nStarted: "));
        assert!(written.ends_with("\n\n[INFO] first record\n"));
        assert!(!written.contains("stale"));
    }
}
