//! Frame annotation for the recorder
//!
//! Draws the key ROIs, every detection box with its track id and confidence,
//! and a local wall-clock stamp in the bottom-right corner. Pipes inside the
//! load-cell are red, other pipes green, everything else blue.

use crate::domain::roi::{gate_open_roi, RoiManager, RoiName};
use crate::domain::types::{Frame, TrackDet};
use crate::infra::config::Config;
use chrono::{DateTime, Local};
use image::Rgb;
use std::sync::Arc;

const ROI_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
const PIPE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const PIPE_IN_CELL_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const OTHER_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
const STAMP_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

/// Glyph cell, 5x7 pixels plus one column of spacing
const GLYPH_W: i32 = 6;
const GLYPH_H: i32 = 7;

/// Stateless annotator built once per run
#[derive(Debug, Clone)]
pub struct Overlay {
    rois: Arc<RoiManager>,
    roi_names: Vec<String>,
    pipe_class: String,
}

impl Overlay {
    pub fn new(rois: Arc<RoiManager>, config: &Config) -> Self {
        let mut roi_names: Vec<String> = [RoiName::Loadcell, RoiName::CasterOrigin, RoiName::RightOrigin]
            .iter()
            .map(|r| r.as_str().to_string())
            .collect();
        roi_names.extend(config.gate().names.iter().map(|g| gate_open_roi(g)));

        Self { rois, roi_names, pipe_class: config.pipe_flow().pipe_class.clone() }
    }

    /// Annotated copy of `frame`; the input is left untouched
    pub fn draw(&self, frame: &Frame, dets: &[TrackDet], ts: f64) -> Frame {
        let mut out = frame.clone();
        // Thicker strokes and text on large frames
        let scale = (out.height() as i32 / 360).max(1);

        for roi in self.roi_names.iter().filter_map(|n| self.rois.get(n)) {
            draw_polygon(&mut out, roi.points(), scale, ROI_COLOR);
        }

        for det in dets {
            let color = self.color_for(det);
            let b = &det.bbox;
            let (x1, y1, x2, y2) =
                (b.x1.round() as i32, b.y1.round() as i32, b.x2.round() as i32, b.y2.round() as i32);
            draw_rect(&mut out, x1, y1, x2, y2, scale, color);

            let tid = det.track_id.map_or(-1, |t| t.0);
            let label = format!("{tid} {:.2}", det.conf);
            let label_y = (y1 - (GLYPH_H + 2) * scale).max(0);
            draw_text(&mut out, x1, label_y, &label, scale, color);
        }

        let stamp = local_stamp(ts);
        let w = out.width() as i32;
        let h = out.height() as i32;
        let text_w = stamp.chars().count() as i32 * GLYPH_W * scale;
        let x = (w - text_w - 4).max(0);
        let y = (h - (GLYPH_H + 3) * scale).max(0);
        draw_text(&mut out, x, y, &stamp, scale, STAMP_COLOR);

        out
    }

    fn color_for(&self, det: &TrackDet) -> Rgb<u8> {
        if !det.is_class(&self.pipe_class) {
            return OTHER_COLOR;
        }
        let (cx, cy) = det.bbox.centroid();
        let in_cell =
            self.rois.get(RoiName::Loadcell.as_str()).is_some_and(|roi| roi.contains(cx, cy));
        if in_cell {
            PIPE_IN_CELL_COLOR
        } else {
            PIPE_COLOR
        }
    }
}

fn local_stamp(ts: f64) -> String {
    DateTime::from_timestamp_millis((ts * 1000.0) as i64)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

/// Square brush of side `size`, clipped to the frame
fn plot(img: &mut Frame, x: i32, y: i32, size: i32, color: Rgb<u8>) {
    let (w, h) = (img.width() as i32, img.height() as i32);
    for py in y..y + size {
        for px in x..x + size {
            if px >= 0 && py >= 0 && px < w && py < h {
                img.put_pixel(px as u32, py as u32, color);
            }
        }
    }
}

/// Bresenham line
fn draw_line(img: &mut Frame, (x0, y0): (i32, i32), (x1, y1): (i32, i32), size: i32, color: Rgb<u8>) {
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let (mut x, mut y) = (x0, y0);
    let mut err = dx + dy;

    loop {
        plot(img, x, y, size, color);
        if x == x1 && y == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

fn draw_polygon(img: &mut Frame, points: &[(i32, i32)], size: i32, color: Rgb<u8>) {
    for (i, &a) in points.iter().enumerate() {
        let b = points[(i + 1) % points.len()];
        draw_line(img, a, b, size, color);
    }
}

fn draw_rect(img: &mut Frame, x1: i32, y1: i32, x2: i32, y2: i32, size: i32, color: Rgb<u8>) {
    draw_polygon(img, &[(x1, y1), (x2, y1), (x2, y2), (x1, y2)], size, color);
}

fn draw_text(img: &mut Frame, mut x: i32, y: i32, text: &str, scale: i32, color: Rgb<u8>) {
    for ch in text.chars() {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, &pattern) in (0i32..).zip(glyph.iter()) {
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        plot(img, x + col * scale, y + row * scale, scale, color);
                    }
                }
            }
        }
        x += GLYPH_W * scale;
    }
}

/// Digits and the punctuation used by stamps and labels
fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    Some(match ch {
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
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        ':' => [0, 0b00110, 0b00110, 0, 0b00110, 0b00110, 0],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        _ => return None,
    })
}
