//! Direct3D 9 path
//!
//! `Direct3DCreate9` is redirected so every `IDirect3D9` the target creates
//! gets its `CreateDevice` slot redirected; each new device then gets `Reset`
//! and `Present` redirected. Creation and reset force the back buffer size
//! and windowed mode. `Present` applies the viewport once per device and
//! performs resets requested by the window enforcer.

use std::ffi::c_void;
use std::sync::atomic::AtomicUsize;

use tracing::{debug, info, warn};

use super::{GraphicsContext, ORIGINALS, Originals, PresentParameters, Viewport, active};
use crate::address::VirtualAddress;
use crate::error::HookError;
use crate::hook::InterceptionTarget;

pub const MODULE: &str = "d3d9.dll";
pub const CREATE_EXPORT: &str = "Direct3DCreate9";

/// `IDirect3D9::CreateDevice`
pub const CREATE_DEVICE_SLOT: usize = 16;
/// `IDirect3DDevice9::Reset`
pub const RESET_SLOT: usize = 16;
/// `IDirect3DDevice9::Present`
pub const PRESENT_SLOT: usize = 17;
/// `IDirect3DDevice9::SetViewport`
pub const SET_VIEWPORT_SLOT: usize = 47;

const D3DERR_INVALIDCALL: i32 = 0x8876_086C_u32 as i32;

type Direct3DCreate9Fn = unsafe extern "system" fn(u32) -> *mut c_void;
type CreateDeviceFn = unsafe extern "system" fn(
    *mut c_void,
    u32,
    u32,
    *mut c_void,
    u32,
    *mut PresentParameters,
    *mut *mut c_void,
) -> i32;
type ResetFn = unsafe extern "system" fn(*mut c_void, *mut PresentParameters) -> i32;
type PresentFn = unsafe extern "system" fn(
    *mut c_void,
    *const c_void,
    *const c_void,
    *mut c_void,
    *const c_void,
) -> i32;
type SetViewportFn = unsafe extern "system" fn(*mut c_void, *const Viewport) -> i32;

/// Redirect the factory export
pub fn install(context: &GraphicsContext) -> Result<(), HookError> {
    let attached = context.interceptor.install(
        InterceptionTarget::export(MODULE, CREATE_EXPORT),
        VirtualAddress::new(direct3d_create9 as usize),
    )?;
    Originals::store(&ORIGINALS.direct3d_create9, attached.original);
    info!("Direct3D 9 factory redirected");
    Ok(())
}

/// Redirect one slot of `object`'s table. Sibling objects share the table,
/// so a slot already redirected is expected and only logged.
pub(super) fn redirect_slot(
    context: &GraphicsContext,
    object: *mut c_void,
    slot_index: usize,
    replacement: usize,
    original: &AtomicUsize,
) {
    let target = InterceptionTarget::vtable(VirtualAddress::new(object as usize), slot_index);
    match context.interceptor.install(target, VirtualAddress::new(replacement)) {
        Ok(attached) => Originals::store(original, attached.original),
        Err(HookError::AlreadyInstalled(site)) => debug!("{} already redirected", site),
        Err(e) => warn!("Failed to redirect slot {}: {}", slot_index, e),
    }
}

/// Method `slot_index` of a live COM object
unsafe fn method(object: *mut c_void, slot_index: usize) -> usize {
    unsafe {
        let table = *(object as *const *const usize);
        *table.add(slot_index)
    }
}

unsafe extern "system" fn direct3d_create9(sdk_version: u32) -> *mut c_void {
    let Some(original) = Originals::load(&ORIGINALS.direct3d_create9) else {
        return std::ptr::null_mut();
    };
    let original = unsafe { std::mem::transmute::<usize, Direct3DCreate9Fn>(original) };
    let d3d = unsafe { original(sdk_version) };

    if !d3d.is_null()
        && let Some(context) = active()
    {
        debug!("Direct3DCreate9({}) -> {:p}", sdk_version, d3d);
        redirect_slot(
            &context,
            d3d,
            CREATE_DEVICE_SLOT,
            create_device as usize,
            &ORIGINALS.create_device,
        );
    }
    d3d
}

unsafe extern "system" fn create_device(
    d3d: *mut c_void,
    adapter: u32,
    device_type: u32,
    focus_window: *mut c_void,
    behavior_flags: u32,
    parameters: *mut PresentParameters,
    device: *mut *mut c_void,
) -> i32 {
    let Some(original) = Originals::load(&ORIGINALS.create_device) else {
        return D3DERR_INVALIDCALL;
    };
    let original = unsafe { std::mem::transmute::<usize, CreateDeviceFn>(original) };
    let context = active();

    if let (Some(context), Some(pp)) = (&context, unsafe { parameters.as_mut() }) {
        context
            .surface
            .record_request(pp.back_buffer_width, pp.back_buffer_height);
        if context.resolution.enabled {
            info!(
                "CreateDevice {}x{} windowed={} -> {}x{} windowed",
                pp.back_buffer_width,
                pp.back_buffer_height,
                pp.windowed,
                context.resolution.width,
                context.resolution.height
            );
            pp.force(&context.resolution);
        }
    }

    let hr = unsafe {
        original(
            d3d,
            adapter,
            device_type,
            focus_window,
            behavior_flags,
            parameters,
            device,
        )
    };

    if hr >= 0
        && let Some(context) = &context
        && let Some(created) = unsafe { device.as_ref() }.copied().filter(|d| !d.is_null())
    {
        if let Some(pp) = unsafe { parameters.as_ref() } {
            context.surface.record_device(*pp);
        }
        redirect_slot(context, created, RESET_SLOT, reset as usize, &ORIGINALS.reset);
        redirect_slot(context, created, PRESENT_SLOT, present as usize, &ORIGINALS.present);
    } else if hr < 0 {
        warn!("CreateDevice failed: {:#010x}", hr as u32);
    }
    hr
}

unsafe extern "system" fn reset(device: *mut c_void, parameters: *mut PresentParameters) -> i32 {
    let Some(original) = Originals::load(&ORIGINALS.reset) else {
        return D3DERR_INVALIDCALL;
    };
    let original = unsafe { std::mem::transmute::<usize, ResetFn>(original) };
    let context = active();

    if let (Some(context), Some(pp)) = (&context, unsafe { parameters.as_mut() }) {
        context
            .surface
            .record_request(pp.back_buffer_width, pp.back_buffer_height);
        if context.resolution.enabled {
            pp.force(&context.resolution);
        }
    }

    let hr = unsafe { original(device, parameters) };
    if hr >= 0
        && let (Some(context), Some(pp)) = (&context, unsafe { parameters.as_ref() })
    {
        context.surface.record_device(*pp);
    }
    hr
}

unsafe extern "system" fn present(
    device: *mut c_void,
    source: *const c_void,
    destination: *const c_void,
    window: *mut c_void,
    dirty: *const c_void,
) -> i32 {
    if let Some(context) = active() {
        if let Some(mut pp) = context.surface.take_reset()
            && let Some(original_reset) = Originals::load(&ORIGINALS.reset)
        {
            let original_reset = unsafe { std::mem::transmute::<usize, ResetFn>(original_reset) };
            pp.force(&context.resolution);
            if unsafe { original_reset(device, &mut pp) } >= 0 {
                context.surface.record_device(pp);
            }
        }

        if context.resolution.enabled && context.surface.take_viewport() {
            let viewport = Viewport::full(&context.resolution);
            let set_viewport = unsafe {
                std::mem::transmute::<usize, SetViewportFn>(method(device, SET_VIEWPORT_SLOT))
            };
            unsafe { set_viewport(device, &viewport) };
        }
    }

    match Originals::load(&ORIGINALS.present) {
        Some(original) => unsafe {
            std::mem::transmute::<usize, PresentFn>(original)(device, source, destination, window, dirty)
        },
        None => D3DERR_INVALIDCALL,
    }
}
