//! DirectDraw path
//!
//! Redirects `DirectDrawCreate` and `DirectDrawCreateEx`. The created object
//! is queried for `IDirectDraw7`, whose `SetDisplayMode` is redirected to
//! substitute the desired width and height.

use std::ffi::c_void;

use tracing::{debug, info, warn};
use windows_sys::core::GUID;

use super::d3d9::redirect_slot;
use super::{GraphicsContext, ORIGINALS, Originals, active};
use crate::address::VirtualAddress;
use crate::error::HookError;
use crate::hook::InterceptionTarget;

pub const MODULE: &str = "ddraw.dll";
pub const CREATE_EXPORT: &str = "DirectDrawCreate";
pub const CREATE_EX_EXPORT: &str = "DirectDrawCreateEx";

const IID_IDIRECTDRAW7: GUID = GUID::from_u128(0x15e65ec0_3b9c_11d2_b92f_00609797ea5b);

/// `IUnknown::QueryInterface`
const QUERY_INTERFACE_SLOT: usize = 0;
/// `IUnknown::Release`
const RELEASE_SLOT: usize = 2;
/// `IDirectDraw7::SetDisplayMode`
pub const SET_DISPLAY_MODE_SLOT: usize = 21;

const DDERR_GENERIC: i32 = 0x8000_4005_u32 as i32;

type DirectDrawCreateFn = unsafe extern "system" fn(*mut GUID, *mut *mut c_void, *mut c_void) -> i32;
type DirectDrawCreateExFn =
    unsafe extern "system" fn(*mut GUID, *mut *mut c_void, *const GUID, *mut c_void) -> i32;
type QueryInterfaceFn = unsafe extern "system" fn(*mut c_void, *const GUID, *mut *mut c_void) -> i32;
type ReleaseFn = unsafe extern "system" fn(*mut c_void) -> u32;
type SetDisplayModeFn = unsafe extern "system" fn(*mut c_void, u32, u32, u32, u32, u32) -> i32;

/// Redirect both factory exports. Either one succeeding is enough.
pub fn install(context: &GraphicsContext) -> Result<(), HookError> {
    let mut transaction = context.interceptor.begin();
    let create = transaction.attach(
        InterceptionTarget::export(MODULE, CREATE_EXPORT),
        VirtualAddress::new(direct_draw_create as usize),
    )?;
    let create_ex = match transaction.attach(
        InterceptionTarget::export(MODULE, CREATE_EX_EXPORT),
        VirtualAddress::new(direct_draw_create_ex as usize),
    ) {
        Ok(attached) => Some(attached),
        Err(e) => {
            debug!("{} not redirected: {}", CREATE_EX_EXPORT, e);
            None
        }
    };
    transaction.commit()?;

    Originals::store(&ORIGINALS.direct_draw_create, create.original);
    if let Some(attached) = create_ex {
        Originals::store(&ORIGINALS.direct_draw_create_ex, attached.original);
    }
    info!("DirectDraw factory redirected");
    Ok(())
}

unsafe fn method(object: *mut c_void, slot_index: usize) -> usize {
    unsafe {
        let table = *(object as *const *const usize);
        *table.add(slot_index)
    }
}

/// Find the `IDirectDraw7` behind `object` and redirect its display mode
fn redirect_display_mode(context: &GraphicsContext, object: *mut c_void) {
    let mut dd7: *mut c_void = std::ptr::null_mut();
    let hr = unsafe {
        let query = std::mem::transmute::<usize, QueryInterfaceFn>(method(object, QUERY_INTERFACE_SLOT));
        query(object, &IID_IDIRECTDRAW7, &mut dd7)
    };
    if hr < 0 || dd7.is_null() {
        warn!("QueryInterface(IDirectDraw7) failed: {:#010x}", hr as u32);
        return;
    }

    redirect_slot(
        context,
        dd7,
        SET_DISPLAY_MODE_SLOT,
        set_display_mode as usize,
        &ORIGINALS.set_display_mode,
    );

    // The table is shared by every IDirectDraw7, so the redirect outlives this reference
    unsafe {
        let release = std::mem::transmute::<usize, ReleaseFn>(method(dd7, RELEASE_SLOT));
        release(dd7);
    }
}

unsafe extern "system" fn direct_draw_create(
    guid: *mut GUID,
    direct_draw: *mut *mut c_void,
    outer: *mut c_void,
) -> i32 {
    let Some(original) = Originals::load(&ORIGINALS.direct_draw_create) else {
        return DDERR_GENERIC;
    };
    let original = unsafe { std::mem::transmute::<usize, DirectDrawCreateFn>(original) };
    let hr = unsafe { original(guid, direct_draw, outer) };

    if hr >= 0
        && let Some(context) = active()
        && let Some(object) = unsafe { direct_draw.as_ref() }.copied().filter(|o| !o.is_null())
    {
        redirect_display_mode(&context, object);
    }
    hr
}

unsafe extern "system" fn direct_draw_create_ex(
    guid: *mut GUID,
    direct_draw: *mut *mut c_void,
    iid: *const GUID,
    outer: *mut c_void,
) -> i32 {
    let Some(original) = Originals::load(&ORIGINALS.direct_draw_create_ex) else {
        return DDERR_GENERIC;
    };
    let original = unsafe { std::mem::transmute::<usize, DirectDrawCreateExFn>(original) };
    let hr = unsafe { original(guid, direct_draw, iid, outer) };

    if hr >= 0
        && let Some(context) = active()
        && let Some(object) = unsafe { direct_draw.as_ref() }.copied().filter(|o| !o.is_null())
    {
        redirect_display_mode(&context, object);
    }
    hr
}

unsafe extern "system" fn set_display_mode(
    direct_draw: *mut c_void,
    width: u32,
    height: u32,
    bits_per_pixel: u32,
    refresh_rate: u32,
    flags: u32,
) -> i32 {
    let Some(original) = Originals::load(&ORIGINALS.set_display_mode) else {
        return DDERR_GENERIC;
    };
    let original = unsafe { std::mem::transmute::<usize, SetDisplayModeFn>(original) };

    let Some(context) = active() else {
        return unsafe { original(direct_draw, width, height, bits_per_pixel, refresh_rate, flags) };
    };
    context.surface.record_request(width, height);
    if !context.resolution.enabled {
        return unsafe { original(direct_draw, width, height, bits_per_pixel, refresh_rate, flags) };
    }

    info!(
        "SetDisplayMode {}x{}x{} -> {}x{}",
        width, height, bits_per_pixel, context.resolution.width, context.resolution.height
    );
    let hr = unsafe {
        original(
            direct_draw,
            context.resolution.width,
            context.resolution.height,
            bits_per_pixel,
            refresh_rate,
            flags,
        )
    };
    context.nudge_window();
    hr
}
