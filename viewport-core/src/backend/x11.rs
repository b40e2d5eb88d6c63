//! X11 backend: RandR enumeration, `GetImage` capture, XTest injection.
//!
//! Each enabled CRTC with a connected output becomes one [`Display`],
//! named after its output (`HDMI-1`, `eDP-1`). Frames are cut from the
//! root window in Z-pixmap format (BGRX on little-endian servers).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info};
use x11rb::connection::Connection;
use x11rb::errors::ReplyError;
use x11rb::protocol::Event;
use x11rb::protocol::randr::{self, ConnectionExt as RandrExt};
use x11rb::protocol::xproto::{self, ConnectionExt as XprotoExt, ImageFormat, Window};
use x11rb::protocol::xtest::ConnectionExt as XtestExt;
use x11rb::rust_connection::RustConnection;

use crate::backend::{CursorState, DisplayBackend, NativeMouseEvent};
use crate::display::{Display, Rect};
use crate::error::BackendError;
use crate::frame::{Frame, PixelFormat};
use crate::protocol::{KeyAction, KeyboardInput, MouseButton, MouseEventKind};

struct X11Session {
    conn: Arc<RustConnection>,
    root: Window,
}

impl X11Session {
    fn open() -> Result<Self, BackendError> {
        let (conn, screen_num) = RustConnection::connect(None)
            .map_err(|e| BackendError::Unavailable(format!("X11 connect failed: {e}")))?;
        let root = conn.setup().roots[screen_num].root;

        conn.randr_query_version(1, 5)
            .map_err(other)?
            .reply()
            .map_err(|e| BackendError::Unavailable(format!("RandR missing: {e}")))?;
        conn.xtest_get_version(2, 2)
            .map_err(other)?
            .reply()
            .map_err(|e| BackendError::Unavailable(format!("XTest missing: {e}")))?;

        conn.randr_select_input(
            root,
            randr::NotifyMask::SCREEN_CHANGE
                | randr::NotifyMask::CRTC_CHANGE
                | randr::NotifyMask::OUTPUT_CHANGE,
        )
        .map_err(other)?;
        conn.flush().map_err(other)?;

        Ok(Self {
            conn: Arc::new(conn),
            root,
        })
    }
}

fn other(e: impl std::fmt::Display) -> BackendError {
    BackendError::Other(e.to_string())
}

fn lost(e: impl std::fmt::Display) -> BackendError {
    BackendError::DeviceLost(e.to_string())
}

/// A dead connection is a lost device; a protocol error means the region
/// no longer lies on the screen.
fn image_error(display_name: &str, e: ReplyError) -> BackendError {
    match e {
        ReplyError::ConnectionError(e) => lost(e),
        ReplyError::X11Error(e) => {
            BackendError::NoSuchDisplay(format!("{display_name}: {:?}", e.error_kind))
        }
    }
}

// ── X11Backend ───────────────────────────────────────────────────

pub struct X11Backend {
    session: RwLock<X11Session>,
    topology_dirty: AtomicBool,
}

impl X11Backend {
    /// Connect to the display named by `$DISPLAY`.
    pub fn connect() -> Result<Self, BackendError> {
        let session = X11Session::open()?;
        info!(root = session.root, "connected to X11 server");
        Ok(Self {
            session: RwLock::new(session),
            topology_dirty: AtomicBool::new(false),
        })
    }

    fn session(&self) -> RwLockReadGuard<'_, X11Session> {
        self.session.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn fake_input(&self, kind: u8, detail: u8, x: i16, y: i16) -> Result<(), BackendError> {
        let session = self.session();
        session
            .conn
            .xtest_fake_input(kind, detail, x11rb::CURRENT_TIME, session.root, x, y, 0)
            .map_err(|e| BackendError::Injection(e.to_string()))?;
        Ok(())
    }

    fn flush(&self) -> Result<(), BackendError> {
        self.session()
            .conn
            .flush()
            .map_err(|e| BackendError::Injection(e.to_string()))
    }
}

impl DisplayBackend for X11Backend {
    fn name(&self) -> &'static str {
        "x11"
    }

    fn enumerate(&self) -> Result<Vec<Display>, BackendError> {
        let session = self.session();
        let conn = &session.conn;
        let resources = conn
            .randr_get_screen_resources_current(session.root)
            .map_err(lost)?
            .reply()
            .map_err(other)?;
        let primary = conn
            .randr_get_output_primary(session.root)
            .map_err(lost)?
            .reply()
            .map(|r| r.output)
            .unwrap_or(0);

        let mut displays = Vec::new();
        for crtc in &resources.crtcs {
            let info = conn
                .randr_get_crtc_info(*crtc, resources.config_timestamp)
                .map_err(lost)?
                .reply()
                .map_err(other)?;
            if info.outputs.is_empty() || info.width == 0 || info.height == 0 {
                continue;
            }

            let mut name = None;
            let mut is_primary = false;
            for output in &info.outputs {
                let Ok(out) = conn
                    .randr_get_output_info(*output, resources.config_timestamp)
                    .map_err(lost)?
                    .reply()
                else {
                    continue;
                };
                if out.connection != randr::Connection::CONNECTED {
                    continue;
                }
                if name.is_none() {
                    name = Some(String::from_utf8_lossy(&out.name).into_owned());
                }
                is_primary |= *output == primary;
            }

            if let Some(name) = name {
                displays.push(Display::new(
                    name,
                    Rect::new(info.x as i32, info.y as i32, info.width as u32, info.height as u32),
                    is_primary,
                ));
            }
        }

        // Servers without RandR outputs (Xvfb) expose only the root screen.
        if displays.is_empty() {
            let screen = &conn.setup().roots[0];
            displays.push(Display::new(
                "screen-0",
                Rect::new(0, 0, screen.width_in_pixels as u32, screen.height_in_pixels as u32),
                true,
            ));
        }
        Ok(displays)
    }

    fn acquire_frame(&self, display: &Display, timeout: Duration) -> Result<Frame, BackendError> {
        let started = Instant::now();
        let session = self.session();
        let b = display.bounds;
        let reply = session
            .conn
            .get_image(
                ImageFormat::Z_PIXMAP,
                session.root,
                b.x as i16,
                b.y as i16,
                b.width as u16,
                b.height as u16,
                !0,
            )
            .map_err(lost)?
            .reply()
            .map_err(|e| image_error(&display.name, e))?;

        let elapsed = started.elapsed();
        if elapsed > timeout {
            let name = &display.name;
            debug!(display = %name, ?elapsed, "GetImage exceeded acquire timeout");
            return Err(BackendError::Timeout(timeout));
        }

        let expected = b.width as usize * b.height as usize * 4;
        if reply.data.len() < expected {
            return Err(BackendError::Other(format!(
                "unexpected image size {} for depth {} (want {expected})",
                reply.data.len(),
                reply.depth
            )));
        }
        let mut data = reply.data;
        data.truncate(expected);
        // X pads the fourth byte with garbage; force opaque.
        for px in data.chunks_exact_mut(4) {
            px[3] = 0xFF;
        }

        Ok(Frame::packed(
            display.name.clone(),
            b.width,
            b.height,
            PixelFormat::Bgra8,
            data,
        ))
    }

    fn cursor(&self) -> Option<CursorState> {
        let session = self.session();
        let reply = session.conn.query_pointer(session.root).ok()?.reply().ok()?;
        Some(CursorState {
            x: reply.root_x as i32,
            y: reply.root_y as i32,
            visible: reply.same_screen,
        })
    }

    fn take_topology_change(&self) -> bool {
        let session = self.session();
        while let Ok(Some(event)) = session.conn.poll_for_event() {
            if matches!(event, Event::RandrScreenChangeNotify(_) | Event::RandrNotify(_)) {
                self.topology_dirty.store(true, Ordering::SeqCst);
            }
        }
        self.topology_dirty.swap(false, Ordering::SeqCst)
    }

    fn reinitialize(&self) -> Result<(), BackendError> {
        let fresh = X11Session::open()?;
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        info!("X11 connection re-established");
        Ok(())
    }

    fn inject_mouse(&self, event: &NativeMouseEvent) -> Result<(), BackendError> {
        let (x, y) = (event.x as i16, event.y as i16);
        self.fake_input(xproto::MOTION_NOTIFY_EVENT, 0, x, y)?;

        match event.kind {
            MouseEventKind::Move => {}
            MouseEventKind::Press | MouseEventKind::Release => {
                if let Some(button) = x_button(event.button) {
                    let kind = if event.kind == MouseEventKind::Press {
                        xproto::BUTTON_PRESS_EVENT
                    } else {
                        xproto::BUTTON_RELEASE_EVENT
                    };
                    self.fake_input(kind, button, x, y)?;
                }
            }
            MouseEventKind::Wheel => {
                // Buttons 4/5 scroll one notch per press/release pair.
                let button = if event.wheel_delta > 0 { 4 } else { 5 };
                let notches = (event.wheel_delta.unsigned_abs() / 120).max(1);
                for _ in 0..notches {
                    self.fake_input(xproto::BUTTON_PRESS_EVENT, button, x, y)?;
                    self.fake_input(xproto::BUTTON_RELEASE_EVENT, button, x, y)?;
                }
            }
        }
        self.flush()
    }

    fn inject_keyboard(&self, event: &KeyboardInput) -> Result<(), BackendError> {
        let keycode = scan_code_to_keycode(event.scan_code)
            .or_else(|| virtual_key_to_scan_code(event.virtual_key).and_then(scan_code_to_keycode))
            .ok_or(BackendError::Unsupported("key without a known scan code"))?;
        let kind = match event.action {
            KeyAction::Press => xproto::KEY_PRESS_EVENT,
            KeyAction::Release => xproto::KEY_RELEASE_EVENT,
        };
        self.fake_input(kind, keycode, 0, 0)?;
        self.flush()
    }
}

fn x_button(button: MouseButton) -> Option<u8> {
    match button {
        MouseButton::Left => Some(1),
        MouseButton::Middle => Some(2),
        MouseButton::Right => Some(3),
        MouseButton::X1 => Some(8),
        MouseButton::X2 => Some(9),
        MouseButton::None => None,
    }
}

/// Translate a PC set-1 scan code into an X keycode (evdev code + 8).
fn scan_code_to_keycode(scan_code: u16) -> Option<u8> {
    if scan_code == 0 {
        return None;
    }
    let evdev: u16 = if scan_code <= 0xFF {
        // Non-extended set-1 codes coincide with evdev codes.
        scan_code
    } else {
        match scan_code {
            0xE01C => 96,  // keypad enter
            0xE01D => 97,  // right ctrl
            0xE035 => 98,  // keypad slash
            0xE038 => 100, // right alt
            0xE047 => 102, // home
            0xE048 => 103, // up
            0xE049 => 104, // page up
            0xE04B => 105, // left
            0xE04D => 106, // right
            0xE04F => 107, // end
            0xE050 => 108, // down
            0xE051 => 109, // page down
            0xE052 => 110, // insert
            0xE053 => 111, // delete
            0xE05B => 125, // left meta
            0xE05C => 126, // right meta
            0xE05D => 127, // menu
            _ => return None,
        }
    };
    u8::try_from(evdev + 8).ok()
}

/// Set-1 scan code for a Windows virtual-key code, for viewers that only
/// send `virtual_key`.
fn virtual_key_to_scan_code(vk: u16) -> Option<u16> {
    const LETTERS: [u16; 26] = [
        0x1E, 0x30, 0x2E, 0x20, 0x12, 0x21, 0x22, 0x23, 0x17, 0x24, 0x25, 0x26, 0x32, // A-M
        0x31, 0x18, 0x19, 0x10, 0x13, 0x1F, 0x14, 0x16, 0x2F, 0x11, 0x2D, 0x15, 0x2C, // N-Z
    ];
    let code = match vk {
        0x41..=0x5A => LETTERS[(vk - 0x41) as usize],
        0x30 => 0x0B,
        0x31..=0x39 => vk - 0x31 + 0x02,
        0x70..=0x79 => vk - 0x70 + 0x3B, // F1-F10
        0x7A => 0x57,                    // F11
        0x7B => 0x58,                    // F12
        0x08 => 0x0E,                    // backspace
        0x09 => 0x0F,                    // tab
        0x0D => 0x1C,                    // enter
        0x10 | 0xA0 => 0x2A,             // shift
        0xA1 => 0x36,                    // right shift
        0x11 | 0xA2 => 0x1D,             // ctrl
        0x12 | 0xA4 => 0x38,             // alt
        0x14 => 0x3A,                    // caps lock
        0x1B => 0x01,                    // escape
        0x20 => 0x39,                    // space
        0x21 => 0xE049,
        0x22 => 0xE051,
        0x23 => 0xE04F,
        0x24 => 0xE047,
        0x25 => 0xE04B,
        0x26 => 0xE048,
        0x27 => 0xE04D,
        0x28 => 0xE050,
        0x2D => 0xE052,
        0x2E => 0xE053,
        0x5B => 0xE05B,
        0x5C => 0xE05C,
        _ => return None,
    };
    Some(code)
}
