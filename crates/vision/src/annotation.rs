//! Drawing primitives used by the processing stages.
//!
//! Frames stay in BGR byte order; an [`image::Rgb`] pixel here holds
//! `[b, g, r]`, and the colour constants are written that way.

use std::hash::{DefaultHasher, Hash, Hasher};

use image::{ImageBuffer, Rgb};
use imageproc::{
    drawing::{draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_rect_mut},
    rect::Rect,
};
use video_ingest::Frame;

use crate::{
    error::PipelineError,
    tracker::{BoundingBox, Centroid},
};

/// Image buffer over BGR pixels.
pub type BgrImage = ImageBuffer<Rgb<u8>, Vec<u8>>;

pub const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
pub const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

/// Height of a rendered text line in pixels.
pub const GLYPH_HEIGHT: i32 = 7;
/// Horizontal advance per character in pixels.
pub const GLYPH_ADVANCE: i32 = 6;

/// Run `draw` over the frame's pixels in place.
pub fn annotate<F>(frame: &mut Frame, draw: F) -> Result<(), PipelineError>
where
    F: FnOnce(&mut BgrImage),
{
    let data = std::mem::take(&mut frame.data);
    let mut image = BgrImage::from_raw(frame.width, frame.height, data).ok_or_else(|| {
        PipelineError::InvalidFrame(format!(
            "pixel buffer does not match {}x{}",
            frame.width, frame.height
        ))
    })?;
    draw(&mut image);
    frame.data = image.into_raw();
    Ok(())
}

/// `bbox` with every edge pulled inside the image, or `None` when the box
/// does not overlap it at all.
pub fn clamp_to_image(image: &BgrImage, bbox: &BoundingBox) -> Option<BoundingBox> {
    let right = image.width() as i32 - 1;
    let bottom = image.height() as i32 - 1;
    if bbox.x_max < 0 || bbox.y_max < 0 || bbox.x_min > right || bbox.y_min > bottom {
        return None;
    }
    Some(BoundingBox::new(
        bbox.x_min.max(0),
        bbox.y_min.max(0),
        bbox.x_max.min(right),
        bbox.y_max.min(bottom),
    ))
}

/// Outline `bbox` (corners inclusive) with a border `thickness` pixels wide,
/// growing inward. Edges past the image border are drawn along it.
pub fn draw_box(image: &mut BgrImage, bbox: &BoundingBox, colour: Rgb<u8>, thickness: u32) {
    let Some(bbox) = clamp_to_image(image, bbox) else {
        return;
    };
    for inset in 0..thickness.max(1) as i32 {
        let width = bbox.width() - 2 * inset + 1;
        let height = bbox.height() - 2 * inset + 1;
        if width <= 0 || height <= 0 {
            break;
        }
        let rect = Rect::at(bbox.x_min + inset, bbox.y_min + inset)
            .of_size(width as u32, height as u32);
        draw_hollow_rect_mut(image, rect, colour);
    }
}

pub fn draw_dot(image: &mut BgrImage, centre: Centroid, radius: i32, colour: Rgb<u8>) {
    draw_filled_circle_mut(image, (centre.x, centre.y), radius, colour);
}

pub fn fill_rect(
    image: &mut BgrImage,
    left: i32,
    top: i32,
    width: i32,
    height: i32,
    colour: Rgb<u8>,
) {
    if width <= 0 || height <= 0 {
        return;
    }
    let rect = Rect::at(left, top).of_size(width as u32, height as u32);
    draw_filled_rect_mut(image, rect, colour);
}

pub fn text_width(text: &str) -> i32 {
    text.chars().count() as i32 * GLYPH_ADVANCE
}

/// Render `text` with its top-left corner at `(x, y)` using the built-in 5x7
/// font. Lowercase is drawn as uppercase; unknown characters leave a gap.
pub fn draw_label(image: &mut BgrImage, mut x: i32, y: i32, text: &str, colour: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = y + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        let px = x + col;
                        if px >= 0 && px < width {
                            image.put_pixel(px as u32, py as u32, colour);
                        }
                    }
                }
            }
        }
        x += GLYPH_ADVANCE;
    }
}

/// Label text on a dark backing strip.
pub fn draw_tag(image: &mut BgrImage, x: i32, y: i32, text: &str, colour: Rgb<u8>) {
    fill_rect(image, x - 1, y - 1, text_width(text) + 1, GLYPH_HEIGHT + 2, BLACK);
    draw_label(image, x, y, text, colour);
}

/// Stable colour for a class label, spread around the hue circle.
pub fn label_colour(label: &str) -> Rgb<u8> {
    let mut hasher = DefaultHasher::new();
    label.hash(&mut hasher);
    let index = (hasher.finish() % 360) as f32;
    let hue = (index * 137.508) % 360.0;
    let (r, g, b) = hsv_to_rgb(hue, 0.8, 0.9);
    Rgb([b, g, r])
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (u8, u8, u8) {
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;
    let (r, g, b) = match h {
        h if h < 60.0 => (c, x, 0.0),
        h if h < 120.0 => (x, c, 0.0),
        h if h < 180.0 => (0.0, c, x),
        h if h < 240.0 => (0.0, x, c),
        h if h < 300.0 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    (
        ((r + m) * 255.0).round() as u8,
        ((g + m) * 255.0).round() as u8,
        ((b + m) * 255.0).round() as u8,
    )
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let bits = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '%' => [0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        ':' => [0, 0b01100, 0b01100, 0, 0b01100, 0b01100, 0],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '_' => [0, 0, 0, 0, 0, 0, 0b11111],
        '/' => [0b00001, 0b00010, 0b00010, 0b00100, 0b01000, 0b01000, 0b10000],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank(width: u32, height: u32) -> BgrImage {
        BgrImage::new(width, height)
    }

    #[test]
    fn box_outline_respects_thickness() {
        let mut image = blank(20, 20);
        draw_box(&mut image, &BoundingBox::new(2, 2, 12, 12), GREEN, 2);
        assert_eq!(*image.get_pixel(2, 2), GREEN);
        assert_eq!(*image.get_pixel(12, 12), GREEN);
        assert_eq!(*image.get_pixel(3, 7), GREEN);
        assert_eq!(*image.get_pixel(4, 7), BLACK);
        assert_eq!(*image.get_pixel(7, 7), BLACK);
        assert_eq!(*image.get_pixel(13, 13), BLACK);
    }

    #[test]
    fn drawing_off_canvas_is_clipped() {
        let mut image = blank(10, 10);
        draw_box(&mut image, &BoundingBox::new(-5, -5, 30, 30), GREEN, 2);
        draw_label(&mut image, 8, 8, "ID 12", GREEN);
        draw_dot(&mut image, Centroid::new(-3, 9), 4, GREEN);
        draw_tag(&mut image, -20, -20, "PERSON 99.00%", GREEN);
    }

    #[test]
    fn partly_visible_box_is_drawn_along_the_border() {
        let mut image = blank(20, 20);
        draw_box(&mut image, &BoundingBox::new(-10, 5, 8, 40), GREEN, 1);
        assert_eq!(*image.get_pixel(0, 5), GREEN);
        assert_eq!(*image.get_pixel(8, 19), GREEN);
        assert_eq!(*image.get_pixel(0, 19), GREEN);
        assert_eq!(*image.get_pixel(4, 10), BLACK);
    }

    #[test]
    fn box_outside_the_image_draws_nothing() {
        let mut image = blank(20, 20);
        assert_eq!(clamp_to_image(&image, &BoundingBox::new(25, 0, 40, 10)), None);
        draw_box(&mut image, &BoundingBox::new(25, 0, 40, 10), GREEN, 2);
        draw_box(&mut image, &BoundingBox::new(-9, -9, -1, 30), GREEN, 2);
        assert!(image.pixels().all(|p| *p == BLACK));
    }

    #[test]
    fn clamping_keeps_boxes_already_inside() {
        let image = blank(20, 20);
        let bbox = BoundingBox::new(2, 3, 10, 12);
        assert_eq!(clamp_to_image(&image, &bbox), Some(bbox));
        assert_eq!(
            clamp_to_image(&image, &BoundingBox::new(-4, 15, 30, 50)),
            Some(BoundingBox::new(0, 15, 19, 19))
        );
    }

    #[test]
    fn labels_render_known_glyphs() {
        let mut image = blank(40, 10);
        draw_label(&mut image, 0, 0, "id 7", GREEN);
        let lit = image.pixels().filter(|p| **p == GREEN).count();
        assert!(lit > 10);
        // 'I' has a full-width top bar at columns 1..=3.
        assert_eq!(*image.get_pixel(1, 0), GREEN);
        assert_eq!(text_width("id 7"), 24);
    }

    #[test]
    fn annotate_round_trips_the_frame_buffer() {
        let mut frame = Frame::filled(8, 6, [1, 2, 3]);
        annotate(&mut frame, |image| draw_dot(image, Centroid::new(4, 3), 1, GREEN)).unwrap();
        assert_eq!(frame.data.len(), 8 * 6 * 3);
        let offset = (3 * 8 + 4) * 3;
        assert_eq!(&frame.data[offset..offset + 3], &[0, 255, 0]);
        assert_eq!(&frame.data[0..3], &[1, 2, 3]);
    }

    #[test]
    fn label_colours_are_stable() {
        assert_eq!(label_colour("person"), label_colour("person"));
    }
}
