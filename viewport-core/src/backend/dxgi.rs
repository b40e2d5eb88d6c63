//! DXGI Desktop Duplication capture and `SendInput` injection for Windows.
//!
//! One D3D11 device is shared by every output. Each monitor gets its own
//! `IDXGIOutputDuplication` plus a CPU-readable staging texture, created
//! lazily on first acquisition and dropped on `DXGI_ERROR_ACCESS_LOST`.
//!
//! # Safety
//!
//! All unsafe FFI calls are confined to this module. COM handles are
//! only touched while holding the state mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, warn};
use windows::{
    core::Interface,
    Win32::Foundation::RECT,
    Win32::Graphics::{
        Direct3D::D3D_DRIVER_TYPE_HARDWARE,
        Direct3D11::*,
        Dxgi::{Common::*, *},
    },
    Win32::UI::Input::KeyboardAndMouse::*,
    Win32::UI::WindowsAndMessaging::*,
};

use crate::backend::{CursorState, DisplayBackend, NativeMouseEvent};
use crate::display::{Display, Rect};
use crate::error::BackendError;
use crate::frame::{Frame, PixelFormat};
use crate::protocol::{KeyAction, KeyboardInput, MouseButton, MouseEventKind};

struct Duplication {
    duplication: IDXGIOutputDuplication,
    staging: ID3D11Texture2D,
    width: u32,
    height: u32,
}

struct DxgiState {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    duplications: HashMap<String, Duplication>,
    last_enumeration: Vec<Display>,
}

/// Desktop Duplication backend covering every output of the default adapter.
pub struct DxgiBackend {
    state: Mutex<DxgiState>,
    topology_dirty: AtomicBool,
}

// SAFETY: the COM interfaces are only used while `state` is locked, so no
// two threads touch the device context concurrently.
unsafe impl Send for DxgiBackend {}
unsafe impl Sync for DxgiBackend {}

fn other(what: &str, e: windows::core::Error) -> BackendError {
    BackendError::Other(format!("{what} failed: {e}"))
}

fn rect_of(r: &RECT) -> Rect {
    Rect::new(
        r.left,
        r.top,
        (r.right - r.left).max(0) as u32,
        (r.bottom - r.top).max(0) as u32,
    )
}

fn device_name(raw: &[u16]) -> String {
    let end = raw.iter().position(|&c| c == 0).unwrap_or(raw.len());
    String::from_utf16_lossy(&raw[..end])
}

unsafe fn create_device() -> Result<(ID3D11Device, ID3D11DeviceContext), BackendError> {
    let mut device = None;
    let mut context = None;
    unsafe {
        D3D11CreateDevice(
            None,
            D3D_DRIVER_TYPE_HARDWARE,
            None,
            D3D11_CREATE_DEVICE_BGRA_SUPPORT,
            None,
            D3D11_SDK_VERSION,
            Some(&mut device),
            None,
            Some(&mut context),
        )
        .map_err(|e| BackendError::Unavailable(format!("D3D11CreateDevice failed: {e}")))?;
    }
    let device = device.ok_or_else(|| BackendError::Unavailable("D3D11 device is None".into()))?;
    let context =
        context.ok_or_else(|| BackendError::Unavailable("D3D11 context is None".into()))?;
    Ok((device, context))
}

unsafe fn outputs(device: &ID3D11Device) -> Result<Vec<(Display, IDXGIOutput1)>, BackendError> {
    let dxgi_device: IDXGIDevice = device
        .cast()
        .map_err(|e| other("cast to IDXGIDevice", e))?;
    let adapter = unsafe { dxgi_device.GetAdapter() }.map_err(|e| other("GetAdapter", e))?;

    let mut found = Vec::new();
    let mut index = 0;
    // EnumOutputs fails with DXGI_ERROR_NOT_FOUND past the last output.
    while let Ok(output) = unsafe { adapter.EnumOutputs(index) } {
        index += 1;
        let desc = unsafe { output.GetDesc() }.map_err(|e| other("IDXGIOutput::GetDesc", e))?;
        if !desc.AttachedToDesktop.as_bool() {
            continue;
        }
        let bounds = rect_of(&desc.DesktopCoordinates);
        // The primary monitor always sits at the virtual-desktop origin.
        let is_primary = bounds.x == 0 && bounds.y == 0;
        let output1: IDXGIOutput1 = output
            .cast()
            .map_err(|e| other("cast to IDXGIOutput1", e))?;
        found.push((Display::new(device_name(&desc.DeviceName), bounds, is_primary), output1));
    }
    Ok(found)
}

impl DxgiState {
    unsafe fn duplicate(&self, display: &Display) -> Result<Duplication, BackendError> {
        let output = unsafe { outputs(&self.device)? }
            .into_iter()
            .find(|(d, _)| d.name == display.name)
            .map(|(_, o)| o)
            .ok_or_else(|| BackendError::NoSuchDisplay(display.name.clone()))?;

        let duplication = unsafe { output.DuplicateOutput(&self.device) }
            .map_err(|e| BackendError::DeviceLost(format!("DuplicateOutput failed: {e}")))?;
        let dup_desc = unsafe { duplication.GetDesc() };
        let width = dup_desc.ModeDesc.Width;
        let height = dup_desc.ModeDesc.Height;

        let staging_desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_STAGING,
            BindFlags: 0,
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            MiscFlags: 0,
        };
        let mut staging = None;
        unsafe {
            self.device
                .CreateTexture2D(&staging_desc, None, Some(&mut staging))
                .map_err(|e| other("CreateTexture2D (staging)", e))?;
        }
        let staging =
            staging.ok_or_else(|| BackendError::Other("staging texture is None".into()))?;

        let name = &display.name;
        debug!(display = %name, width, height, "output duplicated");
        Ok(Duplication {
            duplication,
            staging,
            width,
            height,
        })
    }

    unsafe fn acquire(
        &mut self,
        display: &Display,
        timeout: Duration,
    ) -> Result<Frame, BackendError> {
        if !self.duplications.contains_key(&display.name) {
            let dup = unsafe { self.duplicate(display)? };
            self.duplications.insert(display.name.clone(), dup);
        }
        let Some(dup) = self.duplications.get(&display.name) else {
            return Err(BackendError::NoSuchDisplay(display.name.clone()));
        };

        let timeout_ms = timeout.as_millis().min(u32::MAX as u128) as u32;
        let mut frame_info = DXGI_OUTDUPL_FRAME_INFO::default();
        let mut resource = None;
        match unsafe {
            dup.duplication
                .AcquireNextFrame(timeout_ms, &mut frame_info, &mut resource)
        } {
            Ok(()) => {}
            Err(e) if e.code() == DXGI_ERROR_WAIT_TIMEOUT => {
                return Err(BackendError::Timeout(timeout));
            }
            Err(e) if e.code() == DXGI_ERROR_ACCESS_LOST => {
                self.duplications.remove(&display.name);
                return Err(BackendError::DeviceLost(format!("{}: access lost", display.name)));
            }
            Err(e) => return Err(other("AcquireNextFrame", e)),
        }

        let resource =
            resource.ok_or_else(|| BackendError::Other("acquired resource is None".into()))?;
        let texture: ID3D11Texture2D = resource.cast().map_err(|e| {
            let _ = unsafe { dup.duplication.ReleaseFrame() };
            other("cast to ID3D11Texture2D", e)
        })?;

        unsafe { self.context.CopyResource(&dup.staging, &texture) };
        // Release the DXGI frame as early as possible.
        let _ = unsafe { dup.duplication.ReleaseFrame() };

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe {
            self.context
                .Map(&dup.staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
                .map_err(|e| other("Map", e))?;
        }
        let stride = mapped.RowPitch;
        let total = stride as usize * dup.height as usize;
        let data =
            unsafe { std::slice::from_raw_parts(mapped.pData as *const u8, total) }.to_vec();
        unsafe { self.context.Unmap(&dup.staging, 0) };

        Ok(Frame {
            display_name: display.name.clone(),
            width: dup.width,
            height: dup.height,
            stride,
            format: PixelFormat::Bgra8,
            payload: Bytes::from(data),
            timestamp: Instant::now(),
            sequence: 0,
        })
    }
}

impl DxgiBackend {
    pub fn new() -> Result<Self, BackendError> {
        let (device, context) = unsafe { create_device()? };
        let last_enumeration = unsafe { outputs(&device)? }
            .into_iter()
            .map(|(d, _)| d)
            .collect::<Vec<_>>();
        info!(outputs = last_enumeration.len(), "DXGI device created");
        Ok(Self {
            state: Mutex::new(DxgiState {
                device,
                context,
                duplications: HashMap::new(),
                last_enumeration,
            }),
            topology_dirty: AtomicBool::new(false),
        })
    }

    fn state(&self) -> MutexGuard<'_, DxgiState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(inputs: &[INPUT], what: &str) -> Result<(), BackendError> {
        let sent = unsafe { SendInput(inputs, std::mem::size_of::<INPUT>() as i32) };
        if sent as usize != inputs.len() {
            return Err(BackendError::Injection(format!(
                "SendInput ({what}) injected {sent} of {}",
                inputs.len()
            )));
        }
        Ok(())
    }
}

impl DisplayBackend for DxgiBackend {
    fn name(&self) -> &'static str {
        "dxgi"
    }

    fn enumerate(&self) -> Result<Vec<Display>, BackendError> {
        let mut state = self.state();
        let displays: Vec<Display> = unsafe { outputs(&state.device)? }
            .into_iter()
            .map(|(d, _)| d)
            .collect();
        state.last_enumeration = displays.clone();
        Ok(displays)
    }

    fn acquire_frame(&self, display: &Display, timeout: Duration) -> Result<Frame, BackendError> {
        let result = unsafe { self.state().acquire(display, timeout) };
        if matches!(result, Err(BackendError::DeviceLost(_))) {
            // Mode changes and monitor hot-plug surface as access loss.
            self.topology_dirty.store(true, Ordering::SeqCst);
        }
        result
    }

    fn cursor(&self) -> Option<CursorState> {
        let mut info = CURSORINFO {
            cbSize: std::mem::size_of::<CURSORINFO>() as u32,
            ..Default::default()
        };
        unsafe { GetCursorInfo(&mut info) }.ok()?;
        Some(CursorState {
            x: info.ptScreenPos.x,
            y: info.ptScreenPos.y,
            visible: info.flags.0 & CURSOR_SHOWING.0 != 0,
        })
    }

    fn take_topology_change(&self) -> bool {
        let flagged = self.topology_dirty.swap(false, Ordering::SeqCst);
        let state = self.state();
        let current: Vec<Display> = match unsafe { outputs(&state.device) } {
            Ok(found) => found.into_iter().map(|(d, _)| d).collect(),
            Err(e) => {
                warn!("output enumeration failed: {e}");
                return flagged;
            }
        };
        flagged || current != state.last_enumeration
    }

    fn reinitialize(&self) -> Result<(), BackendError> {
        let (device, context) = unsafe { create_device()? };
        let mut state = self.state();
        state.device = device;
        state.context = context;
        state.duplications.clear();
        info!("DXGI device re-created");
        Ok(())
    }

    fn inject_mouse(&self, event: &NativeMouseEvent) -> Result<(), BackendError> {
        // MOUSEEVENTF_VIRTUALDESK normalizes over the whole virtual screen.
        let (vx, vy, vw, vh) = unsafe {
            (
                GetSystemMetrics(SM_XVIRTUALSCREEN),
                GetSystemMetrics(SM_YVIRTUALSCREEN),
                GetSystemMetrics(SM_CXVIRTUALSCREEN),
                GetSystemMetrics(SM_CYVIRTUALSCREEN),
            )
        };
        if vw <= 1 || vh <= 1 {
            return Err(BackendError::Injection("GetSystemMetrics returned 0".into()));
        }
        let abs_x = ((event.x - vx) as i64 * 65535 / (vw - 1) as i64) as i32;
        let abs_y = ((event.y - vy) as i64 * 65535 / (vh - 1) as i64) as i32;

        let mut flags = MOUSEEVENTF_MOVE | MOUSEEVENTF_ABSOLUTE | MOUSEEVENTF_VIRTUALDESK;
        let mut mouse_data: i32 = 0;
        match event.kind {
            MouseEventKind::Move => {}
            MouseEventKind::Press => {
                flags |= match event.button {
                    MouseButton::Left => MOUSEEVENTF_LEFTDOWN,
                    MouseButton::Right => MOUSEEVENTF_RIGHTDOWN,
                    MouseButton::Middle => MOUSEEVENTF_MIDDLEDOWN,
                    MouseButton::X1 => {
                        mouse_data = 1; // XBUTTON1
                        MOUSEEVENTF_XDOWN
                    }
                    MouseButton::X2 => {
                        mouse_data = 2; // XBUTTON2
                        MOUSEEVENTF_XDOWN
                    }
                    MouseButton::None => MOUSE_EVENT_FLAGS(0),
                };
            }
            MouseEventKind::Release => {
                flags |= match event.button {
                    MouseButton::Left => MOUSEEVENTF_LEFTUP,
                    MouseButton::Right => MOUSEEVENTF_RIGHTUP,
                    MouseButton::Middle => MOUSEEVENTF_MIDDLEUP,
                    MouseButton::X1 => {
                        mouse_data = 1;
                        MOUSEEVENTF_XUP
                    }
                    MouseButton::X2 => {
                        mouse_data = 2;
                        MOUSEEVENTF_XUP
                    }
                    MouseButton::None => MOUSE_EVENT_FLAGS(0),
                };
            }
            MouseEventKind::Wheel => {
                flags |= MOUSEEVENTF_WHEEL;
                mouse_data = event.wheel_delta;
            }
        }

        let input = INPUT {
            r#type: INPUT_MOUSE,
            Anonymous: INPUT_0 {
                mi: MOUSEINPUT {
                    dx: abs_x,
                    dy: abs_y,
                    mouseData: mouse_data as u32,
                    dwFlags: flags,
                    time: 0,
                    dwExtraInfo: 0,
                },
            },
        };
        Self::send(&[input], "mouse")
    }

    fn inject_keyboard(&self, event: &KeyboardInput) -> Result<(), BackendError> {
        let mut flags = KEYBD_EVENT_FLAGS(0);
        // Scan codes survive keyboard-layout differences; prefer them.
        if event.scan_code != 0 {
            flags |= KEYEVENTF_SCANCODE;
        }
        if event.action == KeyAction::Release {
            flags |= KEYEVENTF_KEYUP;
        }
        // Extended keys carry the 0xE0 prefix.
        if event.scan_code > 0xFF {
            flags |= KEYEVENTF_EXTENDEDKEY;
        }

        let input = INPUT {
            r#type: INPUT_KEYBOARD,
            Anonymous: INPUT_0 {
                ki: KEYBDINPUT {
                    wVk: VIRTUAL_KEY(event.virtual_key),
                    wScan: event.scan_code & 0xFF,
                    dwFlags: flags,
                    time: 0,
                    dwExtraInfo: 0,
                },
            },
        };
        Self::send(&[input], "keyboard")
    }

    fn block_user_input(&self, block: bool) -> Result<(), BackendError> {
        // BlockInput needs an elevated process; it fails otherwise.
        unsafe { BlockInput(block) }
            .map_err(|e| BackendError::Injection(format!("BlockInput({block}) failed: {e}")))
    }
}
