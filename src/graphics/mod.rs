//! Graphics interception
//!
//! The replacement functions run on the target's render thread, so they only
//! touch atomics and a short-lived lock. Everything they need hangs off one
//! [`GraphicsContext`], published with [`activate`] for the lifetime of the
//! engine and withdrawn with [`deactivate`] before interceptions are detached.

#[cfg(windows)]
pub mod d3d9;
#[cfg(windows)]
pub mod ddraw;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use crate::address::VirtualAddress;
use crate::config::ResolutionTarget;
use crate::hook::InterceptionEngine;
use crate::scanner::EffectCheck;

/// `D3DPRESENT_PARAMETERS`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresentParameters {
    pub back_buffer_width: u32,
    pub back_buffer_height: u32,
    pub back_buffer_format: u32,
    pub back_buffer_count: u32,
    pub multi_sample_type: u32,
    pub multi_sample_quality: u32,
    pub swap_effect: u32,
    pub device_window: usize,
    pub windowed: i32,
    pub enable_auto_depth_stencil: i32,
    pub auto_depth_stencil_format: u32,
    pub flags: u32,
    pub fullscreen_refresh_rate: u32,
    pub presentation_interval: u32,
}

impl PresentParameters {
    /// Force the desired back buffer size in a window. Fullscreen refresh
    /// must be zero for a windowed device.
    pub fn force(&mut self, target: &ResolutionTarget) {
        self.back_buffer_width = target.width;
        self.back_buffer_height = target.height;
        self.windowed = 1;
        self.fullscreen_refresh_rate = 0;
    }
}

/// `D3DVIEWPORT9`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub min_z: f32,
    pub max_z: f32,
}

impl Viewport {
    pub fn full(target: &ResolutionTarget) -> Self {
        Self {
            x: 0,
            y: 0,
            width: target.width,
            height: target.height,
            min_z: 0.0,
            max_z: 1.0,
        }
    }
}

/// What the render thread has seen and what it still owes
#[derive(Debug, Default)]
pub struct SurfaceState {
    requested_width: AtomicU32,
    requested_height: AtomicU32,
    reset_pending: AtomicBool,
    viewport_pending: AtomicBool,
    /// Parameters of the live device, replayed on a forced reset
    parameters: Mutex<Option<PresentParameters>>,
}

impl SurfaceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size the target itself asked for, before any override
    pub fn record_request(&self, width: u32, height: u32) {
        self.requested_width.store(width, Ordering::SeqCst);
        self.requested_height.store(height, Ordering::SeqCst);
    }

    pub fn requested(&self) -> Option<(u32, u32)> {
        let width = self.requested_width.load(Ordering::SeqCst);
        let height = self.requested_height.load(Ordering::SeqCst);
        (width != 0 && height != 0).then_some((width, height))
    }

    /// A device exists with these (already forced) parameters
    pub fn record_device(&self, parameters: PresentParameters) {
        if let Ok(mut saved) = self.parameters.lock() {
            *saved = Some(parameters);
        }
        self.viewport_pending.store(true, Ordering::SeqCst);
    }

    pub fn has_device(&self) -> bool {
        self.parameters.lock().is_ok_and(|saved| saved.is_some())
    }

    pub fn forget_device(&self) {
        if let Ok(mut saved) = self.parameters.lock() {
            *saved = None;
        }
    }

    /// Ask the render thread to reset the device at its next present
    pub fn request_reset(&self) {
        if self.has_device() {
            self.reset_pending.store(true, Ordering::SeqCst);
        }
    }

    /// Parameters to reset with, if a reset was requested
    pub fn take_reset(&self) -> Option<PresentParameters> {
        if !self.reset_pending.swap(false, Ordering::SeqCst) {
            return None;
        }
        self.parameters.lock().ok().and_then(|saved| *saved)
    }

    /// True once per device (re)creation
    pub fn take_viewport(&self) -> bool {
        self.viewport_pending.swap(false, Ordering::SeqCst)
    }
}

/// The scanner's effect: the target now asks for the desired size on its own
pub struct SurfaceCheck {
    surface: Arc<SurfaceState>,
    desired: ResolutionTarget,
}

impl SurfaceCheck {
    pub fn new(surface: Arc<SurfaceState>, desired: ResolutionTarget) -> Self {
        Self { surface, desired }
    }
}

impl EffectCheck for SurfaceCheck {
    fn effect_observed(&self) -> bool {
        self.surface.requested() == Some((self.desired.width, self.desired.height))
    }
}

/// Saved original entry points, as raw addresses.
///
/// Kept outside [`GraphicsContext`]: a replacement must still reach its
/// original after the context is withdrawn and before its slot is restored.
#[derive(Debug, Default)]
pub struct Originals {
    pub direct3d_create9: AtomicUsize,
    pub create_device: AtomicUsize,
    pub reset: AtomicUsize,
    pub present: AtomicUsize,
    pub direct_draw_create: AtomicUsize,
    pub direct_draw_create_ex: AtomicUsize,
    pub set_display_mode: AtomicUsize,
}

pub static ORIGINALS: Originals = Originals::new();

impl Originals {
    pub const fn new() -> Self {
        Self {
            direct3d_create9: AtomicUsize::new(0),
            create_device: AtomicUsize::new(0),
            reset: AtomicUsize::new(0),
            present: AtomicUsize::new(0),
            direct_draw_create: AtomicUsize::new(0),
            direct_draw_create_ex: AtomicUsize::new(0),
            set_display_mode: AtomicUsize::new(0),
        }
    }

    pub fn load(slot: &AtomicUsize) -> Option<usize> {
        match slot.load(Ordering::SeqCst) {
            0 => None,
            address => Some(address),
        }
    }

    pub fn store(slot: &AtomicUsize, original: VirtualAddress) {
        slot.store(original.value(), Ordering::SeqCst);
    }
}

type Nudge = Box<dyn Fn() + Send + Sync>;

/// Everything the replacement functions reach for
pub struct GraphicsContext {
    pub interceptor: Arc<InterceptionEngine>,
    pub surface: Arc<SurfaceState>,
    pub resolution: ResolutionTarget,
    nudge: Option<Nudge>,
}

impl GraphicsContext {
    pub fn new(
        interceptor: Arc<InterceptionEngine>,
        surface: Arc<SurfaceState>,
        resolution: ResolutionTarget,
    ) -> Self {
        Self {
            interceptor,
            surface,
            resolution,
            nudge: None,
        }
    }

    /// Run after a display mode change, to bring the window along
    pub fn with_nudge<F: Fn() + Send + Sync + 'static>(mut self, nudge: F) -> Self {
        self.nudge = Some(Box::new(nudge));
        self
    }

    pub fn nudge_window(&self) {
        if let Some(nudge) = &self.nudge {
            nudge();
        }
    }
}

static ACTIVE: RwLock<Option<Arc<GraphicsContext>>> = RwLock::new(None);

pub fn activate(context: Arc<GraphicsContext>) {
    if let Ok(mut active) = ACTIVE.write() {
        *active = Some(context);
        debug!("Graphics context activated");
    }
}

/// Withdraw the context; replacements still in flight keep their `Arc`
pub fn deactivate() {
    if let Ok(mut active) = ACTIVE.write() {
        *active = None;
    }
}

pub fn active() -> Option<Arc<GraphicsContext>> {
    ACTIVE.read().ok().and_then(|active| active.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hd() -> ResolutionTarget {
        ResolutionTarget {
            width: 1280,
            height: 720,
            enabled: true,
        }
    }

    #[test]
    fn test_force_present_parameters() {
        let mut parameters = PresentParameters {
            back_buffer_width: 800,
            back_buffer_height: 600,
            back_buffer_count: 1,
            windowed: 0,
            fullscreen_refresh_rate: 60,
            ..Default::default()
        };
        parameters.force(&hd());

        assert_eq!(parameters.back_buffer_width, 1280);
        assert_eq!(parameters.back_buffer_height, 720);
        assert_eq!(parameters.windowed, 1);
        assert_eq!(parameters.fullscreen_refresh_rate, 0);
        assert_eq!(parameters.back_buffer_count, 1);
    }

    #[test]
    fn test_present_parameters_layout() {
        let expected = if cfg!(target_pointer_width = "64") { 64 } else { 56 };
        assert_eq!(size_of::<PresentParameters>(), expected);
        assert_eq!(size_of::<Viewport>(), 24);
    }

    #[test]
    fn test_reset_requires_device_and_fires_once() {
        let surface = SurfaceState::new();
        surface.request_reset();
        assert_eq!(surface.take_reset(), None);

        let mut parameters = PresentParameters::default();
        parameters.force(&hd());
        surface.record_device(parameters);
        surface.request_reset();

        assert_eq!(surface.take_reset(), Some(parameters));
        assert_eq!(surface.take_reset(), None);

        assert!(surface.take_viewport());
        assert!(!surface.take_viewport());

        surface.forget_device();
        surface.request_reset();
        assert_eq!(surface.take_reset(), None);
    }

    #[test]
    fn test_surface_check() {
        let surface = Arc::new(SurfaceState::new());
        let check = SurfaceCheck::new(Arc::clone(&surface), hd());
        assert!(!check.effect_observed());

        surface.record_request(800, 600);
        assert!(!check.effect_observed());

        surface.record_request(1280, 720);
        assert!(check.effect_observed());
    }

    #[test]
    fn test_originals_slots() {
        let originals = Originals::new();
        assert_eq!(Originals::load(&originals.present), None);
        Originals::store(&originals.present, VirtualAddress::new(0x6b00_1234));
        assert_eq!(Originals::load(&originals.present), Some(0x6b00_1234));
    }

    struct NoModules;

    impl crate::hook::ModuleResolver for NoModules {
        fn module_base(&self, _module: &str) -> Option<VirtualAddress> {
            None
        }

        fn importers(&self) -> Vec<VirtualAddress> {
            Vec::new()
        }
    }

    #[test]
    fn test_context_activation_and_nudge() {
        let memory = Arc::new(crate::testing::MockMemory::new());
        let interceptor = Arc::new(InterceptionEngine::new(memory, Arc::new(NoModules)));
        let nudges = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&nudges);

        let context = Arc::new(
            GraphicsContext::new(interceptor, Arc::new(SurfaceState::new()), hd()).with_nudge(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            ),
        );
        context.nudge_window();
        assert_eq!(nudges.load(Ordering::SeqCst), 1);

        activate(Arc::clone(&context));
        assert!(active().is_some_and(|active| Arc::ptr_eq(&active, &context)));
        deactivate();
        assert!(active().is_none());
    }
}
