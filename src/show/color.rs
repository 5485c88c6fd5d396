//! Float color math. Colors are `[r, g, b]` with components nominally in 0-255.

use super::model::Rgb;

pub type Color = [f32; 3];

pub const RED: Color = [255.0, 0.0, 0.0];
pub const GREEN: Color = [0.0, 255.0, 0.0];
pub const BLUE: Color = [0.0, 0.0, 255.0];
pub const BLACK: Color = [0.0, 0.0, 0.0];

/// Weighted average of colors. Zero total weight yields black.
pub fn mix(weighted: &[(Color, f32)]) -> Color {
    let total: f32 = weighted.iter().map(|(_, w)| w.max(0.0)).sum();
    if !(total > 0.0) {
        return BLACK;
    }
    let mut out = BLACK;
    for (color, weight) in weighted {
        let w = weight.max(0.0);
        for c in 0..3 {
            out[c] += color[c] * w;
        }
    }
    out.map(|c| c / total)
}

pub fn scale(color: Color, intensity: f32) -> Color {
    color.map(|c| c * intensity)
}

/// Rotate hue by `degrees`, keeping saturation and value.
pub fn shift_hue(color: Color, degrees: f32) -> Color {
    let [r, g, b] = color.map(|c| (c / 255.0).clamp(0.0, 1.0));
    let (h, s, v) = rgb_to_hsv(r, g, b);
    let h = (h + degrees / 360.0).rem_euclid(1.0);
    let (r, g, b) = hsv_to_rgb(h, s, v);
    [r * 255.0, g * 255.0, b * 255.0]
}

/// Coerce to an integer pixel. Non-finite components become 0.
pub fn to_pixel(color: Color) -> Rgb {
    color.map(|c| if c.is_finite() { c.clamp(0.0, 255.0) as u8 } else { 0 })
}

fn rgb_to_hsv(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let v = max;
    if max == min {
        return (0.0, 0.0, v);
    }
    let delta = max - min;
    let s = delta / max;
    let rc = (max - r) / delta;
    let gc = (max - g) / delta;
    let bc = (max - b) / delta;
    let h = if r == max {
        bc - gc
    } else if g == max {
        2.0 + rc - bc
    } else {
        4.0 + gc - rc
    };
    ((h / 6.0).rem_euclid(1.0), s, v)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (v, v, v);
    }
    let sector = (h * 6.0).floor();
    let f = h * 6.0 - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    match sector as i32 % 6 {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    }
}
