//! Linear RGBA helpers shared by the blend algebra and the software renderer.

use half::f16;
use serde::{Deserialize, Serialize};

/// Linear, straight-alpha RGBA.
pub type Rgba = [f32; 4];

pub const TRANSPARENT: Rgba = [0.0, 0.0, 0.0, 0.0];
pub const BLACK: Rgba = [0.0, 0.0, 0.0, 1.0];
pub const WHITE: Rgba = [1.0, 1.0, 1.0, 1.0];

/// Storage precision of an off-screen color buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferPrecision {
    /// 8 bits per channel, unsigned normalized.
    Low,
    /// 16-bit float per channel.
    #[default]
    Half,
    /// 32-bit float per channel.
    Full,
}

impl BufferPrecision {
    /// Name of the define injected into fused programs for this precision.
    pub fn define_name(self) -> &'static str {
        match self {
            BufferPrecision::Low => "FRAMEBUFFER_PRECISION_LOW",
            BufferPrecision::Half => "FRAMEBUFFER_PRECISION_HALF",
            BufferPrecision::Full => "FRAMEBUFFER_PRECISION_FULL",
        }
    }

    /// Round-trips one channel through this storage format.
    pub fn quantize(self, x: f32) -> f32 {
        match self {
            BufferPrecision::Low => (clamp01(x) * 255.0).round() / 255.0,
            BufferPrecision::Half => f16::from_f32(x).to_f32(),
            BufferPrecision::Full => x,
        }
    }

    pub fn quantize_rgba(self, c: Rgba) -> Rgba {
        [
            self.quantize(c[0]),
            self.quantize(c[1]),
            self.quantize(c[2]),
            self.quantize(c[3]),
        ]
    }
}

pub(crate) fn clamp01(x: f32) -> f32 {
    x.clamp(0.0, 1.0)
}

pub fn linear_to_srgb_channel(x: f32) -> f32 {
    // https://en.wikipedia.org/wiki/SRGB
    if x <= 0.003_130_8 {
        12.92 * x
    } else {
        1.055 * x.powf(1.0 / 2.4) - 0.055
    }
}

pub fn srgb_to_linear_channel(x: f32) -> f32 {
    if x <= 0.040_45 {
        x / 12.92
    } else {
        ((x + 0.055) / 1.055).powf(2.4)
    }
}

pub fn mix(a: Rgba, b: Rgba, t: f32) -> Rgba {
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
        a[3] + (b[3] - a[3]) * t,
    ]
}

/// Encodes a linear color to 8-bit sRGB for display or PNG export.
pub fn to_srgb8(c: Rgba) -> [u8; 4] {
    let enc = |x: f32| (clamp01(linear_to_srgb_channel(x)) * 255.0).round() as u8;
    [enc(c[0]), enc(c[1]), enc(c[2]), (clamp01(c[3]) * 255.0).round() as u8]
}

pub fn approx_eq(a: Rgba, b: Rgba, eps: f32) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() <= eps)
}
