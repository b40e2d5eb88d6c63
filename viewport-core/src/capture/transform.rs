//! Per-viewer transform stage: cursor, overlays, encode.
//!
//! Always works on a private [`Canvas`] copy of the shared frame.

use std::time::Instant;

use bytes::Bytes;

use crate::backend::CursorState;
use crate::capture::encoder;
use crate::display::Display;
use crate::error::CoreError;
use crate::frame::{Canvas, Frame};
use crate::registry::ViewerTarget;

/// Arrow pointer, 12 px tall. `#` outline, `o` fill.
const ARROW: [&str; 12] = [
    "#",
    "##",
    "#o#",
    "#oo#",
    "#ooo#",
    "#oooo#",
    "#ooooo#",
    "#oooooo#",
    "#ooo####",
    "#o#o#",
    "## #o#",
    "#   ##",
];

/// Draw the arrow with its tip at canvas-local `(x, y)`.
pub fn draw_cursor(canvas: &mut Canvas, x: i64, y: i64) {
    for (dy, row) in ARROW.iter().enumerate() {
        for (dx, cell) in row.bytes().enumerate() {
            let rgba = match cell {
                b'#' => [0, 0, 0, 255],
                b'o' => [255, 255, 255, 255],
                _ => continue,
            };
            canvas.blend(x + dx as i64, y + dy as i64, rgba);
        }
    }
}

/// Build one viewer's encoded image from the shared frame.
pub fn render_for_viewer(
    frame: &Frame,
    display: &Display,
    cursor: Option<CursorState>,
    target: &ViewerTarget,
    now: Instant,
) -> Result<Bytes, CoreError> {
    let mut canvas = frame.to_canvas();

    if target.context.is_cursor_visible {
        if let Some(c) = cursor.filter(|c| c.visible && display.bounds.contains(c.x, c.y)) {
            draw_cursor(
                &mut canvas,
                (c.x - display.bounds.x) as i64,
                (c.y - display.bounds.y) as i64,
            );
        }
    }

    target.overlays.composite(&mut canvas, now);

    encoder::encode(
        &canvas,
        target.context.selected_codec,
        target.context.image_quality,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::capture::FrameSlot;
    use crate::context::{CapturingContext, Codec};
    use crate::display::Rect;
    use crate::frame::PixelFormat;
    use crate::overlay::{ClickMark, OverlaySet, CLICK_INDICATOR};

    fn target(cursor_visible: bool) -> ViewerTarget {
        let mut context = CapturingContext::new("v").with_codec(Codec::Png);
        context.is_cursor_visible = cursor_visible;
        ViewerTarget {
            connection_id: "v".into(),
            context,
            overlays: OverlaySet::default(),
            slot: Arc::new(FrameSlot::new()),
        }
    }

    fn decode(data: &Bytes) -> image::RgbaImage {
        image::load_from_memory(data).unwrap().to_rgba8()
    }

    fn setup() -> (Frame, Display) {
        // A display at x=100 on the virtual desktop.
        let display = Display::new("B", Rect::new(100, 0, 32, 32), false);
        let frame = Frame::packed("B", 32, 32, PixelFormat::Bgra8, [128u8, 128, 128, 255].repeat(32 * 32));
        (frame, display)
    }

    #[test]
    fn cursor_is_drawn_in_display_local_space() {
        let (frame, display) = setup();
        let cursor = Some(CursorState { x: 110, y: 5, visible: true });
        let img = decode(&render_for_viewer(&frame, &display, cursor, &target(true), Instant::now()).unwrap());
        // Arrow tip at local (10, 5) is outline black.
        assert_eq!(img.get_pixel(10, 5).0, [0, 0, 0, 255]);
        assert_eq!(img.get_pixel(0, 0).0, [128, 128, 128, 255]);
    }

    #[test]
    fn hidden_cursor_setting_skips_drawing() {
        let (frame, display) = setup();
        let cursor = Some(CursorState { x: 110, y: 5, visible: true });
        let img = decode(&render_for_viewer(&frame, &display, cursor, &target(false), Instant::now()).unwrap());
        assert_eq!(img.get_pixel(10, 5).0, [128, 128, 128, 255]);
    }

    #[test]
    fn cursor_on_another_display_is_ignored() {
        let (frame, display) = setup();
        let cursor = Some(CursorState { x: 5, y: 5, visible: true });
        let img = decode(&render_for_viewer(&frame, &display, cursor, &target(true), Instant::now()).unwrap());
        assert!(img.pixels().all(|p| p.0 == [128, 128, 128, 255]));
    }

    #[test]
    fn overlays_only_touch_the_private_copy() {
        let (frame, display) = setup();
        let before = frame.payload.clone();
        let now = Instant::now();
        let mut ringed = target(false);
        ringed.overlays = overlay_with_click(16, 16, now);

        let plain = decode(&render_for_viewer(&frame, &display, None, &target(false), now).unwrap());
        let drawn = decode(&render_for_viewer(&frame, &display, None, &ringed, now).unwrap());
        assert_ne!(plain, drawn);
        assert_eq!(frame.payload, before);
    }

    fn overlay_with_click(x: i32, y: i32, at: Instant) -> OverlaySet {
        let mut set = OverlaySet::default();
        set.activate(CLICK_INDICATOR);
        set.set_click(ClickMark { x, y, at });
        set
    }
}
