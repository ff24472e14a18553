//! Text and indicator overlays burned into frames.
//!
//! Drawing mutates pixels in place, so order matters: timestamp, then battery, then the recording
//! indicator, which therefore always sits on top.

use chrono::{DateTime, Local};
use image::{Rgb, RgbImage};
use rusttype::{point, Font, Scale};

use crate::telemetry::TelemetryReading;

const TIMESTAMP_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BATTERY_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
const RECORDING_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

const TIMESTAMP_PX: f32 = 22.0;
const LABEL_PX: f32 = 16.0;

const INDICATOR_RADIUS: i32 = 10;

#[derive(Debug, thiserror::Error)]
#[error("bundled overlay font could not be parsed")]
pub struct FontError;

pub struct Overlay {
    font: Font<'static>,
}

pub fn timestamp_label(at: DateTime<Local>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn battery_label(reading: &TelemetryReading) -> String {
    format!(
        "Battery: {:.2}V | {:.3}A | {:.2}W",
        reading.voltage, reading.current, reading.power
    )
}

impl Overlay {
    pub fn new() -> Result<Self, FontError> {
        let font = Font::try_from_bytes(ttf_firacode::REGULAR as &[u8]).ok_or(FontError)?;
        Ok(Self { font })
    }

    /// Live-view annotation: timestamp, battery line and, while recording, the REC indicator.
    pub fn annotate_live(
        &self,
        mut frame: RgbImage,
        at: DateTime<Local>,
        reading: &TelemetryReading,
        recording: bool,
    ) -> RgbImage {
        self.stamp_timestamp(&mut frame, at);
        self.draw_text(&mut frame, &battery_label(reading), 10.0, 60.0, LABEL_PX, BATTERY_COLOR);
        if recording {
            let width = frame.width() as i32;
            fill_circle(&mut frame, width - 30, 30, INDICATOR_RADIUS, RECORDING_COLOR);
            self.draw_text(
                &mut frame,
                "REC",
                (width - 70) as f32,
                35.0,
                LABEL_PX,
                RECORDING_COLOR,
            );
        }
        frame
    }

    /// Recorded frames only carry the wall-clock time.
    pub fn stamp_timestamp(&self, frame: &mut RgbImage, at: DateTime<Local>) {
        self.draw_text(frame, &timestamp_label(at), 10.0, 30.0, TIMESTAMP_PX, TIMESTAMP_COLOR);
    }

    /// Draws `text` with its baseline starting at (`x`, `baseline`).
    fn draw_text(&self, frame: &mut RgbImage, text: &str, x: f32, baseline: f32, px: f32, color: Rgb<u8>) {
        let scale = Scale::uniform(px);
        for glyph in self.font.layout(text, scale, point(x, baseline)) {
            if let Some(bounding_box) = glyph.pixel_bounding_box() {
                glyph.draw(|gx, gy, coverage| {
                    blend(
                        frame,
                        bounding_box.min.x + gx as i32,
                        bounding_box.min.y + gy as i32,
                        color,
                        coverage,
                    )
                });
            }
        }
    }
}

fn blend(frame: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>, coverage: f32) {
    if x < 0 || y < 0 || x as u32 >= frame.width() || y as u32 >= frame.height() {
        return;
    }
    let q = coverage.clamp(0.0, 1.0);
    let p = 1.0 - q;
    let pixel = frame.get_pixel_mut(x as u32, y as u32);
    for (old, new) in pixel.0.iter_mut().zip(color.0) {
        *old = (f32::from(*old) * p + f32::from(new) * q).round() as u8;
    }
}

fn fill_circle(frame: &mut RgbImage, cx: i32, cy: i32, radius: i32, color: Rgb<u8>) {
    for y in (cy - radius)..=(cy + radius) {
        for x in (cx - radius)..=(cx + radius) {
            let (dx, dy) = (x - cx, y - cy);
            if dx * dx + dy * dy <= radius * radius {
                blend(frame, x, y, color, 1.0);
            }
        }
    }
}
