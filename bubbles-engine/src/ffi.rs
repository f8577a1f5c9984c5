//! C ABI over an opaque engine handle.
//!
//! Every function tolerates a null handle. Strings are NUL-terminated UTF-8;
//! a null or non-UTF-8 string is a failure, never a crash. Colors cross the
//! boundary as ARGB with the alpha byte set.
//!
//! Callbacks run on a dedicated dispatcher thread, never on the caller's
//! thread. A callback must not free the engine it was called for.

use std::ffi::{c_char, c_void, CStr};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;

use crate::lifecycle::LifecycleState;
use crate::mapper;
use crate::session::{Session, SessionEndpoint, SessionEvent};
use crate::transport::CredentialBundle;

/// Opaque handle type for C FFI
#[repr(C)]
pub struct BubblesEngine {
    _private: [u8; 0],
}

/// Upward notifications. Any entry may be null.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BubblesCallbacks {
    pub user_data: *mut c_void,
    pub redraw: Option<extern "C" fn(user_data: *mut c_void)>,
    pub autopilot_moved: Option<extern "C" fn(user_data: *mut c_void, x: i32, y: i32)>,
    pub session_failed: Option<extern "C" fn(user_data: *mut c_void)>,
}

impl Default for BubblesCallbacks {
    fn default() -> Self {
        Self {
            user_data: std::ptr::null_mut(),
            redraw: None,
            autopilot_moved: None,
            session_failed: None,
        }
    }
}

// The embedder owns `user_data` and promises it may be used from the
// dispatcher thread.
unsafe impl Send for BubblesCallbacks {}

impl BubblesCallbacks {
    fn dispatch(&self, event: &SessionEvent) {
        match event {
            SessionEvent::Redraw | SessionEvent::Reconnected => {
                if let Some(redraw) = self.redraw {
                    redraw(self.user_data);
                }
            }
            SessionEvent::AutopilotMoved { x, y } => {
                if let Some(moved) = self.autopilot_moved {
                    moved(self.user_data, *x, *y);
                }
                if let Some(redraw) = self.redraw {
                    redraw(self.user_data);
                }
            }
            SessionEvent::Failed { .. } => {
                if let Some(failed) = self.session_failed {
                    failed(self.user_data);
                }
            }
        }
    }
}

struct Engine {
    session: Session,
    callbacks: Arc<Mutex<BubblesCallbacks>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.session.stop();
    }
}

fn spawn_dispatcher(
    mut events: mpsc::Receiver<SessionEvent>,
    callbacks: Arc<Mutex<BubblesCallbacks>>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("bubbles-callbacks".into())
        .spawn(move || {
            while let Some(event) = events.blocking_recv() {
                let current = *callbacks.lock().unwrap_or_else(PoisonError::into_inner);
                current.dispatch(&event);
            }
            log::debug!("Callback dispatcher exited");
        })
}

fn into_ffi_handle(engine: Engine) -> *mut BubblesEngine {
    Box::into_raw(Box::new(engine)) as *mut BubblesEngine
}

/// SAFETY: `ptr` must be null or a live handle from `bubbles_engine_new`.
unsafe fn engine_ref<'a>(ptr: *const BubblesEngine) -> Option<&'a Engine> {
    (ptr as *const Engine).as_ref()
}

fn with_session<T>(ptr: *const BubblesEngine, fallback: T, f: impl FnOnce(&Session) -> T) -> T {
    match unsafe { engine_ref(ptr) } {
        Some(engine) => f(&engine.session),
        None => fallback,
    }
}

/// `None` for null or invalid UTF-8.
unsafe fn str_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

fn argb(rgb: u32) -> u32 {
    0xFF00_0000 | (rgb & 0x00FF_FFFF)
}

/// Create an engine. Returns null if the I/O runtime could not start.
#[no_mangle]
pub extern "C" fn bubbles_engine_new() -> *mut BubblesEngine {
    let session = match Session::with_defaults() {
        Ok(session) => session,
        Err(e) => {
            log::error!("Failed to create engine: {e}");
            return std::ptr::null_mut();
        }
    };
    let callbacks = Arc::new(Mutex::new(BubblesCallbacks::default()));
    let dispatcher = session
        .take_event_rx()
        .and_then(|rx| match spawn_dispatcher(rx, callbacks.clone()) {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::error!("Failed to start callback dispatcher: {e}");
                None
            }
        });

    into_ffi_handle(Engine {
        session,
        callbacks,
        dispatcher,
    })
}

/// Stop the session and release the handle. Null is ignored.
#[no_mangle]
pub extern "C" fn bubbles_engine_free(ptr: *mut BubblesEngine) {
    if ptr.is_null() {
        return;
    }
    let mut engine = unsafe { Box::from_raw(ptr as *mut Engine) };
    let dispatcher = engine.dispatcher.take();
    // Dropping the session closes the event channel, which ends the dispatcher.
    drop(engine);
    if let Some(handle) = dispatcher {
        let _ = handle.join();
    }
}

/// Replace the callback set. Takes effect for the next event.
#[no_mangle]
pub extern "C" fn bubbles_set_callbacks(ptr: *mut BubblesEngine, callbacks: BubblesCallbacks) -> bool {
    match unsafe { engine_ref(ptr) } {
        Some(engine) => {
            *engine.callbacks.lock().unwrap_or_else(PoisonError::into_inner) = callbacks;
            true
        }
        None => false,
    }
}

/// Connect and join. Credentials may be null when `secure` is false.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub extern "C" fn bubbles_start(
    ptr: *mut BubblesEngine,
    endpoint: *const c_char,
    room: *const c_char,
    secure: bool,
    compressed: bool,
    autopilot: bool,
    ca_cert: *const c_char,
    client_cert: *const c_char,
    client_key: *const c_char,
) -> bool {
    let (Some(endpoint), Some(room)) = (unsafe { str_arg(endpoint) }, unsafe { str_arg(room) }) else {
        log::error!("bubbles_start: endpoint and room must be valid UTF-8");
        return false;
    };
    let pem = |p: *const c_char| unsafe { str_arg(p) }.unwrap_or_default();
    let credentials = CredentialBundle::new(pem(ca_cert), pem(client_cert), pem(client_key));
    let target = SessionEndpoint::new(endpoint, room)
        .secure(secure)
        .compressed(compressed)
        .autopilot(autopilot);

    with_session(ptr, false, |session| session.start(&target, &credentials).is_ok())
}

#[no_mangle]
pub extern "C" fn bubbles_pause(ptr: *mut BubblesEngine) -> bool {
    with_session(ptr, false, |s| s.pause().is_ok())
}

#[no_mangle]
pub extern "C" fn bubbles_resume(ptr: *mut BubblesEngine) -> bool {
    with_session(ptr, false, |s| s.resume().is_ok())
}

#[no_mangle]
pub extern "C" fn bubbles_stop(ptr: *mut BubblesEngine) {
    with_session(ptr, (), |s| s.stop());
}

/// Current lifecycle state: 0 Uninitialized, 1 Starting, 2 Running,
/// 3 Paused, 4 Stopped, 5 Failed; -1 for a null handle.
#[no_mangle]
pub extern "C" fn bubbles_state(ptr: *const BubblesEngine) -> i32 {
    with_session(ptr, -1, |s| match s.state() {
        LifecycleState::Uninitialized => 0,
        LifecycleState::Starting => 1,
        LifecycleState::Running => 2,
        LifecycleState::Paused => 3,
        LifecycleState::Stopped => 4,
        LifecycleState::Failed => 5,
    })
}

// ── Local input ──────────────────────────────────────────────────────

#[no_mangle]
pub extern "C" fn bubbles_move(ptr: *mut BubblesEngine, x: i32, y: i32) {
    with_session(ptr, (), |s| s.move_to(x, y));
}

#[no_mangle]
pub extern "C" fn bubbles_touch_down(ptr: *mut BubblesEngine, x: i32, y: i32) {
    with_session(ptr, (), |s| s.touch_down(x, y));
}

#[no_mangle]
pub extern "C" fn bubbles_touch_up(ptr: *mut BubblesEngine, x: i32, y: i32) {
    with_session(ptr, (), |s| s.touch_up(x, y));
}

#[no_mangle]
pub extern "C" fn bubbles_set_frame(ptr: *mut BubblesEngine, width: i32, height: i32) {
    with_session(ptr, (), |s| s.set_frame(width, height));
}

// ── Plot cursor ──────────────────────────────────────────────────────
//
// Misuse is logged by the session and reported here as the neutral value;
// `bubbles_plot_end` reports true so a render loop terminates.

#[no_mangle]
pub extern "C" fn bubbles_plot_start(ptr: *mut BubblesEngine) -> bool {
    with_session(ptr, false, |s| s.plot_start().is_ok())
}

#[no_mangle]
pub extern "C" fn bubbles_plot_end(ptr: *mut BubblesEngine) -> bool {
    with_session(ptr, true, |s| s.plot_end().unwrap_or(true))
}

#[no_mangle]
pub extern "C" fn bubbles_plot_x(ptr: *mut BubblesEngine) -> i32 {
    with_session(ptr, 0, |s| s.plot_x().unwrap_or(0))
}

#[no_mangle]
pub extern "C" fn bubbles_plot_y(ptr: *mut BubblesEngine) -> i32 {
    with_session(ptr, 0, |s| s.plot_y().unwrap_or(0))
}

#[no_mangle]
pub extern "C" fn bubbles_plot_color(ptr: *mut BubblesEngine) -> u32 {
    with_session(ptr, 0, |s| s.plot_color().map(argb).unwrap_or(0))
}

#[no_mangle]
pub extern "C" fn bubbles_plot_my_color(ptr: *mut BubblesEngine) -> u32 {
    with_session(ptr, 0, |s| argb(s.plot_my_color()))
}

#[no_mangle]
pub extern "C" fn bubbles_plot_next(ptr: *mut BubblesEngine) -> bool {
    with_session(ptr, false, |s| s.plot_next().is_ok())
}

#[no_mangle]
pub extern "C" fn bubbles_plot_done(ptr: *mut BubblesEngine) -> bool {
    with_session(ptr, false, |s| s.plot_done().is_ok())
}

// ── Coordinate mapper ────────────────────────────────────────────────

#[no_mangle]
pub extern "C" fn bubbles_scale_x(logical: i32, width: i32) -> i32 {
    mapper::scale(logical, width)
}

#[no_mangle]
pub extern "C" fn bubbles_scale_y(logical: i32, height: i32) -> i32 {
    mapper::scale(logical, height)
}

#[no_mangle]
pub extern "C" fn bubbles_reverse_scale_x(pixel: i32, width: i32) -> i32 {
    mapper::reverse_scale(pixel, width)
}

#[no_mangle]
pub extern "C" fn bubbles_reverse_scale_y(pixel: i32, height: i32) -> i32 {
    mapper::reverse_scale(pixel, height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::ptr;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_ffi_lifecycle() {
        let engine = bubbles_engine_new();
        assert!(!engine.is_null());
        assert_eq!(bubbles_state(engine), 0);
        bubbles_stop(engine);
        assert_eq!(bubbles_state(engine), 4);
        bubbles_engine_free(engine);
    }

    #[test]
    fn test_null_handle_is_failure() {
        let null = ptr::null_mut();
        let room = CString::new("r").unwrap();
        assert!(!bubbles_start(
            null,
            room.as_ptr(),
            room.as_ptr(),
            false,
            false,
            false,
            ptr::null(),
            ptr::null(),
            ptr::null()
        ));
        assert!(!bubbles_pause(null));
        assert!(!bubbles_resume(null));
        assert!(!bubbles_plot_start(null));
        assert!(bubbles_plot_end(null));
        assert_eq!(bubbles_plot_x(null), 0);
        assert_eq!(bubbles_plot_my_color(null), 0);
        assert!(!bubbles_set_callbacks(null, BubblesCallbacks::default()));
        assert_eq!(bubbles_state(null), -1);
        bubbles_move(null, 1, 2);
        bubbles_stop(null);
        bubbles_engine_free(null);
    }

    #[test]
    fn test_null_strings_fail_start() {
        let engine = bubbles_engine_new();
        let room = CString::new("r").unwrap();
        assert!(!bubbles_start(
            engine,
            ptr::null(),
            room.as_ptr(),
            false,
            false,
            false,
            ptr::null(),
            ptr::null(),
            ptr::null()
        ));
        // Rejected before the session was touched.
        assert_eq!(bubbles_state(engine), 0);
        bubbles_engine_free(engine);
    }

    #[test]
    fn test_secure_start_without_credentials_fails() {
        let engine = bubbles_engine_new();
        let endpoint = CString::new("127.0.0.1:1").unwrap();
        let room = CString::new("r").unwrap();
        let empty = CString::new("").unwrap();
        assert!(!bubbles_start(
            engine,
            endpoint.as_ptr(),
            room.as_ptr(),
            true,
            false,
            false,
            empty.as_ptr(),
            empty.as_ptr(),
            empty.as_ptr()
        ));
        assert_eq!(bubbles_state(engine), 5);
        bubbles_engine_free(engine);
    }

    #[test]
    fn test_plot_cycle_over_ffi() {
        let engine = bubbles_engine_new();
        bubbles_move(engine, 10, 20);
        assert!(bubbles_plot_start(engine));
        // A second cycle before done is misuse.
        assert!(!bubbles_plot_start(engine));

        let mut seen = 0;
        while !bubbles_plot_end(engine) {
            assert_eq!(bubbles_plot_color(engine) >> 24, 0xFF);
            seen += 1;
            assert!(bubbles_plot_next(engine));
        }
        assert_eq!(bubbles_plot_my_color(engine) >> 24, 0xFF);
        assert!(bubbles_plot_done(engine));
        assert!(!bubbles_plot_done(engine));
        assert!(seen <= 1);
        bubbles_engine_free(engine);
    }

    #[test]
    fn test_pure_mapper() {
        assert_eq!(bubbles_scale_x(500, 2000), 1000);
        assert_eq!(bubbles_reverse_scale_x(1000, 2000), 500);
        assert_eq!(bubbles_scale_y(-250, 400), -100);
        assert_eq!(bubbles_reverse_scale_y(-100, 400), -250);
    }

    static MOVED: AtomicU32 = AtomicU32::new(0);
    static REDRAWS: AtomicU32 = AtomicU32::new(0);

    extern "C" fn on_moved(_: *mut c_void, _x: i32, _y: i32) {
        MOVED.fetch_add(1, Ordering::SeqCst);
    }

    extern "C" fn on_redraw(_: *mut c_void) {
        REDRAWS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_autopilot_moved_dispatches_both_callbacks() {
        let callbacks = BubblesCallbacks {
            redraw: Some(on_redraw),
            autopilot_moved: Some(on_moved),
            ..BubblesCallbacks::default()
        };
        callbacks.dispatch(&SessionEvent::AutopilotMoved { x: 1, y: 2 });
        callbacks.dispatch(&SessionEvent::Failed {
            reason: "x".into(),
        });
        assert_eq!(MOVED.load(Ordering::SeqCst), 1);
        assert_eq!(REDRAWS.load(Ordering::SeqCst), 1);
        assert_eq!(argb(0x123456), 0xFF12_3456);
    }
}
