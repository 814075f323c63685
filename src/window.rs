//! Window management using winit

use std::sync::Arc;
use std::time::Instant;

use winit::{
    dpi::PhysicalSize,
    event::{Event, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget},
    window::{Window as WinitWindow, WindowBuilder},
};

/// What the frame callback wants the loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    Continue,
    Exit,
}

/// Wrapper around winit window with additional state
pub struct Window {
    window: Arc<WinitWindow>,
    width: u32,
    height: u32,
    resized: bool,
    close_requested: bool,
}

impl Window {
    /// Create a window at the requested inner size; the stored size is what winit granted.
    pub fn new(event_loop: &EventLoop<()>, title: &str, width: u32, height: u32) -> Self {
        let window = Arc::new(
            WindowBuilder::new()
                .with_title(title)
                .with_inner_size(PhysicalSize::new(width, height))
                .build(event_loop)
                .expect("Failed to create window"),
        );
        let size = window.inner_size();

        Self {
            window,
            width: size.width,
            height: size.height,
            resized: false,
            close_requested: false,
        }
    }

    /// Raw winit window, for surface creation
    pub fn window(&self) -> &WinitWindow {
        &self.window
    }

    /// Shared handle for surface creation
    pub fn window_arc(&self) -> Arc<WinitWindow> {
        Arc::clone(&self.window)
    }

    /// Current inner size in physical pixels
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// A minimized window has a zero-sized surface and nothing to draw into.
    pub fn is_minimized(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Returns the new size once per resize, then `None` until the next one.
    pub fn take_resize(&mut self) -> Option<(u32, u32)> {
        std::mem::take(&mut self.resized).then_some((self.width, self.height))
    }

    /// Whether the user asked to close the window
    pub fn should_close(&self) -> bool {
        self.close_requested
    }

    /// Track resizes, scale changes and close requests
    pub fn handle_event(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::Resized(size) => {
                self.width = size.width;
                self.height = size.height;
                self.resized = true;
            }
            WindowEvent::ScaleFactorChanged { .. } => {
                let size = self.window.inner_size();
                self.width = size.width;
                self.height = size.height;
                self.resized = true;
            }
            WindowEvent::CloseRequested => {
                self.close_requested = true;
            }
            _ => {}
        }
    }

    /// Schedule the next frame
    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }
}

/// Open a window and call `frame` with the seconds elapsed since the previous
/// call until the window closes or `frame` asks to exit.
///
/// `setup` runs once with the window before the first frame and builds the
/// state every frame receives.
pub fn run<S, Setup, Frame>(title: &str, width: u32, height: u32, setup: Setup, mut frame: Frame)
where
    S: 'static,
    Setup: FnOnce(&Window) -> S,
    Frame: FnMut(&mut S, &mut Window, f32) -> LoopAction + 'static,
{
    let event_loop = EventLoop::new().expect("Failed to create event loop");
    let mut window = Window::new(&event_loop, title, width, height);
    let mut state = setup(&window);
    let mut last_frame = Instant::now();

    event_loop
        .run(move |event, elwt: &EventLoopWindowTarget<()>| {
            elwt.set_control_flow(ControlFlow::Poll);

            match event {
                Event::WindowEvent { event, .. } => {
                    window.handle_event(&event);
                    if window.should_close() {
                        elwt.exit();
                    }
                }
                Event::AboutToWait => {
                    let now = Instant::now();
                    let dt = now.duration_since(last_frame).as_secs_f32();
                    last_frame = now;

                    if window.is_minimized() {
                        return;
                    }
                    if frame(&mut state, &mut window, dt) == LoopAction::Exit {
                        elwt.exit();
                        return;
                    }
                    window.request_redraw();
                }
                _ => {}
            }
        })
        .expect("Event loop failed");
}
