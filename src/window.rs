//! Window geometry enforcer
//!
//! Sizes the target's top-level window so its *client* area matches the
//! desired resolution, centered on the primary display. The target resets
//! its own geometry after startup, so [`WindowEnforcer::run`] reapplies it
//! on an interval until cancelled.

use std::fmt;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::ResolutionTarget;
use crate::signal::CancelToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub const fn width(&self) -> i32 {
        self.right - self.left
    }

    pub const fn height(&self) -> i32 {
        self.bottom - self.top
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} at ({},{})",
            self.width(),
            self.height(),
            self.left,
            self.top
        )
    }
}

/// Outer window rectangle for a `width` x `height` client area.
///
/// `frame` is the client rectangle `(0, 0, width, height)` grown by the
/// window's non-client borders, as the OS reports it for the current style.
pub fn centered_outer_rect(frame: Rect, screen_width: i32, screen_height: i32) -> Rect {
    let x = (screen_width - frame.width()) / 2;
    let y = (screen_height - frame.height()) / 2;
    Rect::new(x, y, x + frame.width(), y + frame.height())
}

/// How to recognise the target's window
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowMatch {
    Class(String),
    /// Any visible, unowned top-level window of a process with this image name
    Executable(String),
    Process(u32),
}

/// What one enforcement pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforceOutcome {
    WindowNotFound,
    Unchanged,
    Adjusted(Rect),
    /// The OS refused the move
    Failed,
}

/// Windowing primitives the enforcer needs
pub trait WindowSystem {
    type Window: Copy + fmt::Debug;

    fn find(&self, matcher: &WindowMatch) -> Option<Self::Window>;

    /// Client rect `(0, 0, width, height)` grown by this window's borders
    fn frame_for_client(&self, window: Self::Window, width: i32, height: i32) -> Option<Rect>;

    fn window_rect(&self, window: Self::Window) -> Option<Rect>;

    fn screen_size(&self) -> (i32, i32);

    fn move_window(&self, window: Self::Window, rect: Rect) -> bool;

    /// Tell the window its client area changed
    fn notify_resized(&self, window: Self::Window, width: i32, height: i32);
}

type ResizeCallback = Box<dyn Fn(u32, u32) + Send + Sync>;

pub struct WindowEnforcer<S: WindowSystem> {
    system: S,
    matcher: WindowMatch,
    resolution: ResolutionTarget,
    on_resize: Option<ResizeCallback>,
}

impl<S: WindowSystem> WindowEnforcer<S> {
    pub fn new(system: S, matcher: WindowMatch, resolution: ResolutionTarget) -> Self {
        Self {
            system,
            matcher,
            resolution,
            on_resize: None,
        }
    }

    /// Called after every adjustment, e.g. to reset an active graphics surface
    pub fn on_resize<F>(mut self, callback: F) -> Self
    where
        F: Fn(u32, u32) + Send + Sync + 'static,
    {
        self.on_resize = Some(Box::new(callback));
        self
    }

    /// One idempotent pass: a window already at the target geometry is left alone
    pub fn enforce(&self) -> EnforceOutcome {
        let Some(window) = self.system.find(&self.matcher) else {
            debug!("Window {:?} not found", self.matcher);
            return EnforceOutcome::WindowNotFound;
        };

        let width = self.resolution.width as i32;
        let height = self.resolution.height as i32;
        let frame = self
            .system
            .frame_for_client(window, width, height)
            .unwrap_or(Rect::new(0, 0, width, height));

        let (screen_width, screen_height) = self.system.screen_size();
        let target = centered_outer_rect(frame, screen_width, screen_height);

        if self.system.window_rect(window) == Some(target) {
            return EnforceOutcome::Unchanged;
        }

        info!("Adjusting window {:?} to {}", window, target);
        if !self.system.move_window(window, target) {
            return EnforceOutcome::Failed;
        }

        if let Some(callback) = &self.on_resize {
            callback(self.resolution.width, self.resolution.height);
        }
        self.system.notify_resized(window, width, height);
        EnforceOutcome::Adjusted(target)
    }

    /// Enforce every `interval` until `cancel` fires
    pub fn run(&self, interval: Duration, cancel: &CancelToken) {
        info!("Window enforcer started ({:?} interval)", interval);
        loop {
            if self.resolution.enabled {
                self.enforce();
            }
            if cancel.wait(interval) {
                break;
            }
        }
        info!("Window enforcer stopped");
    }
}

#[cfg(windows)]
mod win {
    use std::collections::HashMap;

    use windows_sys::Win32::Foundation::*;
    use windows_sys::Win32::UI::WindowsAndMessaging::*;

    use super::{Rect, WindowMatch, WindowSystem};
    use crate::process::exe_name_of;

    fn to_wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    fn from_rect(rect: &RECT) -> Rect {
        Rect::new(rect.left, rect.top, rect.right, rect.bottom)
    }

    struct Search<'a> {
        matcher: &'a WindowMatch,
        names: HashMap<u32, bool>,
        found: HWND,
    }

    impl Search<'_> {
        fn owner_matches(&mut self, pid: u32) -> bool {
            match self.matcher {
                WindowMatch::Process(target) => pid == *target,
                WindowMatch::Executable(exe) => *self.names.entry(pid).or_insert_with(|| {
                    exe_name_of(pid).is_some_and(|name| name.eq_ignore_ascii_case(exe))
                }),
                WindowMatch::Class(_) => false,
            }
        }
    }

    unsafe extern "system" fn enum_proc(hwnd: HWND, lparam: LPARAM) -> BOOL {
        let search = unsafe { &mut *(lparam as *mut Search) };

        let visible = unsafe { IsWindowVisible(hwnd) } != 0;
        let owned = !unsafe { GetWindow(hwnd, GW_OWNER) }.is_null();
        if !visible || owned {
            return TRUE;
        }

        let mut pid = 0u32;
        unsafe { GetWindowThreadProcessId(hwnd, &mut pid) };
        if search.owner_matches(pid) {
            search.found = hwnd;
            return FALSE;
        }
        TRUE
    }

    /// Win32 windowing; handles are carried as integers so the enforcer is `Send`
    #[derive(Debug, Default, Clone, Copy)]
    pub struct Win32Windows;

    impl WindowSystem for Win32Windows {
        type Window = usize;

        fn find(&self, matcher: &WindowMatch) -> Option<usize> {
            let hwnd = match matcher {
                WindowMatch::Class(class) => {
                    let class = to_wide(class);
                    unsafe { FindWindowW(class.as_ptr(), std::ptr::null()) }
                }
                _ => {
                    let mut search = Search {
                        matcher,
                        names: HashMap::new(),
                        found: std::ptr::null_mut(),
                    };
                    unsafe { EnumWindows(Some(enum_proc), &mut search as *mut Search as LPARAM) };
                    search.found
                }
            };
            (!hwnd.is_null()).then_some(hwnd as usize)
        }

        fn frame_for_client(&self, window: usize, width: i32, height: i32) -> Option<Rect> {
            let hwnd = window as HWND;
            let style = unsafe { GetWindowLongW(hwnd, GWL_STYLE) } as u32;
            let ex_style = unsafe { GetWindowLongW(hwnd, GWL_EXSTYLE) } as u32;

            let mut rect = RECT {
                left: 0,
                top: 0,
                right: width,
                bottom: height,
            };
            let ok = unsafe { AdjustWindowRectEx(&mut rect, style, FALSE, ex_style) };
            (ok != 0).then(|| from_rect(&rect))
        }

        fn window_rect(&self, window: usize) -> Option<Rect> {
            let mut rect: RECT = unsafe { std::mem::zeroed() };
            let ok = unsafe { GetWindowRect(window as HWND, &mut rect) };
            (ok != 0).then(|| from_rect(&rect))
        }

        fn screen_size(&self) -> (i32, i32) {
            unsafe { (GetSystemMetrics(SM_CXSCREEN), GetSystemMetrics(SM_CYSCREEN)) }
        }

        fn move_window(&self, window: usize, rect: Rect) -> bool {
            unsafe {
                SetWindowPos(
                    window as HWND,
                    std::ptr::null_mut(),
                    rect.left,
                    rect.top,
                    rect.width(),
                    rect.height(),
                    SWP_NOZORDER | SWP_NOACTIVATE | SWP_FRAMECHANGED,
                ) != 0
            }
        }

        fn notify_resized(&self, window: usize, width: i32, height: i32) {
            let lparam = ((height as u32 & 0xffff) << 16 | (width as u32 & 0xffff)) as LPARAM;
            unsafe {
                SendMessageW(window as HWND, WM_SIZE, SIZE_RESTORED as WPARAM, lparam);
            }
        }
    }
}

#[cfg(windows)]
pub use win::Win32Windows;
