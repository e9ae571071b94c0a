//! Keystone Demo
//!
//! Opens a window and clears every swapchain image to a slowly cycling colour. Each frame is
//! recorded through `CommandSystem::run_commands`, so the command buffers it submits are handed to
//! the orphan list and reclaimed once their fence signals. Resizing or minimising the window
//! exercises swapchain rebuilds.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p keystone-demo -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--mailbox`: Request mailbox presentation (falls back to FIFO)
//! - `--frames-in-flight <N>`: Frames the CPU may run ahead of the GPU (default: 2)
//! - `--validation`: Enable Vulkan validation layers
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use ash::vk;
use keystone_gpu::{
    CommandBufferDesc, FrameSyncManager, GpuContext, GpuContextBuilder, GpuError, HostSync,
    RunOptions, SurfaceProvider, Swapchain, SwapchainDesc, SyncObject, WindowSurface,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

#[derive(Debug, Clone)]
struct DemoConfig {
    mailbox: bool,
    frames_in_flight: usize,
    validation: bool,
}

impl DemoConfig {
    fn from_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        let mut config = Self {
            mailbox: false,
            frames_in_flight: 2,
            validation: cfg!(debug_assertions),
        };

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--mailbox" => config.mailbox = true,
                "--validation" => config.validation = true,
                "--frames-in-flight" => {
                    let value = args
                        .next()
                        .context("--frames-in-flight expects a value")?;
                    config.frames_in_flight = value
                        .parse()
                        .with_context(|| format!("invalid frame count: {value}"))?;
                }
                other => anyhow::bail!("unknown option: {other}"),
            }
        }

        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DemoConfig::from_args(std::env::args().skip(1))?;
    info!(?config, "Keystone demo starting...");

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = DemoRunner {
        config,
        demo: None,
    };
    event_loop.run_app(&mut runner)?;

    Ok(())
}

fn print_help() {
    eprintln!(
        "Keystone Demo

USAGE:
    cargo run -p keystone-demo -- [OPTIONS]

OPTIONS:
    --mailbox               Request mailbox presentation (falls back to FIFO)
    --frames-in-flight <N>  Frames the CPU may run ahead of the GPU (default: 2)
    --validation            Enable Vulkan validation layers
    -h, --help              Print this help message

ENVIRONMENT:
    RUST_LOG                Log filter (e.g. info, debug, keystone_gpu=trace)"
    );
}

struct DemoRunner {
    config: DemoConfig,
    demo: Option<Demo>,
}

impl ApplicationHandler for DemoRunner {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.demo.is_some() {
            return;
        }

        match Demo::new(event_loop, &self.config) {
            Ok(demo) => {
                info!("Demo ready");
                self.demo = Some(demo);
            }
            Err(e) => {
                error!("Failed to initialize demo: {e:#}");
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                self.demo = None;
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                if let Some(demo) = &mut self.demo {
                    if let Err(e) = demo.render_frame() {
                        error!("Render error: {e}");
                        self.demo = None;
                        event_loop.exit();
                    }
                }
            }
            WindowEvent::Resized(size) => {
                if let Some(demo) = &mut self.demo {
                    if let Err(e) = demo.handle_resize(size) {
                        error!("Resize error: {e}");
                    }
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(demo) = &self.demo {
            demo.window.request_redraw();
        }
    }
}

// Field order is drop order: the swapchain and frame sync objects go before the context.
struct Demo {
    swapchain: Swapchain,
    frames: FrameSyncManager,
    window: Arc<Window>,
    ctx: GpuContext,
    started: Instant,
    frame_count: u64,
}

impl Demo {
    fn new(event_loop: &ActiveEventLoop, config: &DemoConfig) -> anyhow::Result<Self> {
        let attributes = Window::default_attributes()
            .with_title("Keystone Demo")
            .with_inner_size(PhysicalSize::new(WIDTH, HEIGHT));
        let window = Arc::new(event_loop.create_window(attributes)?);

        let provider = Arc::new(WindowSurface::new(window.clone(), |window: &Window| {
            let size = window.inner_size();
            (size.width, size.height)
        }));

        let ctx = GpuContextBuilder::new()
            .app_name("Keystone Demo")
            .validation(config.validation)
            .instance_extensions(provider.required_instance_extensions()?)
            .build()?;
        info!(
            device = %ctx.capabilities().device_name,
            "GPU context created"
        );

        let present_mode = if config.mailbox {
            vk::PresentModeKHR::MAILBOX
        } else {
            vk::PresentModeKHR::FIFO
        };
        let mut swapchain = ctx.create_swapchain(
            provider,
            SwapchainDesc {
                present_mode,
                ..SwapchainDesc::default()
            },
        )?;
        swapchain.on_rebuild(|info| {
            info!(
                width = info.extent.width,
                height = info.extent.height,
                images = info.images.len(),
                "Swapchain rebuilt"
            );
        });

        let frames = FrameSyncManager::new(&ctx.raw_device(), config.frames_in_flight)?;

        Ok(Self {
            swapchain,
            frames,
            window,
            ctx,
            started: Instant::now(),
            frame_count: 0,
        })
    }

    fn render_frame(&mut self) -> keystone_gpu::Result<()> {
        let frame = self.frames.current();
        frame.in_flight.host_wait(Duration::MAX)?;

        let image_index = match self
            .swapchain
            .begin_frame(Some(SyncObject::Semaphore(&frame.image_available)))
        {
            Ok(index) => index,
            // Minimised: nothing to draw into until the window comes back.
            Err(GpuError::NotPresentable) => return Ok(()),
            Err(e) => return Err(e),
        };

        let image = self.swapchain.images()[image_index as usize];
        let color = clear_color(self.started.elapsed());
        let device = self.ctx.device();

        self.ctx.commands().run_commands(
            &CommandBufferDesc::graphics(),
            |recording| {
                record_clear(device, recording.handle(), image, color);
                Ok(())
            },
            RunOptions {
                wait: &[(
                    SyncObject::Semaphore(&frame.image_available),
                    vk::PipelineStageFlags::TRANSFER,
                )],
                signal: &[SyncObject::Semaphore(&frame.render_finished)],
                fence: Some(frame.in_flight.clone()),
            },
        )?;

        self.swapchain
            .end_frame(None, &[SyncObject::Semaphore(&frame.render_finished)])?;

        self.frames.advance();
        self.frame_count += 1;
        if self.frame_count % 600 == 0 {
            tracing::debug!(
                frames = self.frame_count,
                orphans = self.ctx.commands().orphan_count(),
                "Frame stats"
            );
        }

        Ok(())
    }

    fn handle_resize(&mut self, size: PhysicalSize<u32>) -> keystone_gpu::Result<()> {
        info!(width = size.width, height = size.height, "Window resized");
        self.ctx.wait_idle()?;
        self.swapchain.recreate_swapchain()?;
        Ok(())
    }
}

impl Drop for Demo {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.wait_idle() {
            error!("Failed to drain the device on shutdown: {e}");
        }
    }
}

fn clear_color(elapsed: Duration) -> [f32; 4] {
    let t = elapsed.as_secs_f32();
    [
        0.5f32.mul_add((t * 0.7).sin(), 0.5),
        0.5f32.mul_add((t * 1.1).sin(), 0.5),
        0.5f32.mul_add((t * 1.3).sin(), 0.5),
        1.0,
    ]
}

/// Clear `image` and leave it ready for presentation.
fn record_clear(device: &ash::Device, cmd: vk::CommandBuffer, image: vk::Image, color: [f32; 4]) {
    let range = vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .level_count(1)
        .layer_count(1);

    let to_transfer = vk::ImageMemoryBarrier::default()
        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range);

    let to_present = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range);

    let clear = vk::ClearColorValue { float32: color };

    // SAFETY: `cmd` is in the recording state and `image` belongs to the live swapchain.
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_transfer],
        );
        device.cmd_clear_color_image(
            cmd,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &clear,
            &[range],
        );
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_present],
        );
    }
}
