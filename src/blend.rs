//! Blend algebra: combine a base color with a newly computed color under an opacity.
//!
//! The same formulas exist twice: as plain Rust for the software renderer and as a
//! WGSL library linked into every fused program. The function is selected at run
//! time from a uniform, so switching modes never forces a recompile.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::color::{Rgba, clamp01};
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BlendFunction {
    #[default]
    Normal,
    Add,
    Multiply,
    Screen,
    Alpha,
    Average,
    Darken,
    Lighten,
    Difference,
    Exclusion,
    Overlay,
    SoftLight,
    ColorBurn,
    ColorDodge,
    Divide,
    Negation,
    Subtract,
    Skip,
}

impl BlendFunction {
    pub const ALL: [BlendFunction; 18] = [
        BlendFunction::Normal,
        BlendFunction::Add,
        BlendFunction::Multiply,
        BlendFunction::Screen,
        BlendFunction::Alpha,
        BlendFunction::Average,
        BlendFunction::Darken,
        BlendFunction::Lighten,
        BlendFunction::Difference,
        BlendFunction::Exclusion,
        BlendFunction::Overlay,
        BlendFunction::SoftLight,
        BlendFunction::ColorBurn,
        BlendFunction::ColorDodge,
        BlendFunction::Divide,
        BlendFunction::Negation,
        BlendFunction::Subtract,
        BlendFunction::Skip,
    ];

    /// Stable id used as the run-time selector in WGSL.
    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BlendFunction::Normal => "normal",
            BlendFunction::Add => "add",
            BlendFunction::Multiply => "multiply",
            BlendFunction::Screen => "screen",
            BlendFunction::Alpha => "alpha",
            BlendFunction::Average => "average",
            BlendFunction::Darken => "darken",
            BlendFunction::Lighten => "lighten",
            BlendFunction::Difference => "difference",
            BlendFunction::Exclusion => "exclusion",
            BlendFunction::Overlay => "overlay",
            BlendFunction::SoftLight => "soft-light",
            BlendFunction::ColorBurn => "color-burn",
            BlendFunction::ColorDodge => "color-dodge",
            BlendFunction::Divide => "divide",
            BlendFunction::Negation => "negation",
            BlendFunction::Subtract => "subtract",
            BlendFunction::Skip => "skip",
        }
    }

    /// Per-channel formula for the modes that interpolate toward their result.
    fn channel(self, x: f32, y: f32) -> f32 {
        match self {
            BlendFunction::Multiply => x * y,
            BlendFunction::Screen => 1.0 - (1.0 - x) * (1.0 - y),
            BlendFunction::Average => (x + y) * 0.5,
            BlendFunction::Darken => x.min(y),
            BlendFunction::Lighten => x.max(y),
            BlendFunction::Difference => (x - y).abs(),
            BlendFunction::Exclusion => x + y - 2.0 * x * y,
            BlendFunction::Overlay => {
                if x < 0.5 {
                    2.0 * x * y
                } else {
                    1.0 - 2.0 * (1.0 - x) * (1.0 - y)
                }
            }
            BlendFunction::SoftLight => (1.0 - 2.0 * y) * x * x + 2.0 * y * x,
            BlendFunction::ColorBurn => {
                if x >= 1.0 {
                    1.0
                } else if y <= 0.0 {
                    0.0
                } else {
                    (1.0 - (1.0 - x) / y).max(0.0)
                }
            }
            BlendFunction::ColorDodge => {
                if x <= 0.0 {
                    0.0
                } else if y >= 1.0 {
                    1.0
                } else {
                    (x / (1.0 - y)).min(1.0)
                }
            }
            BlendFunction::Divide => {
                if y > 0.0 {
                    (x / y).min(1.0)
                } else {
                    1.0
                }
            }
            BlendFunction::Negation => 1.0 - (1.0 - x - y).abs(),
            BlendFunction::Subtract => (x - y).max(0.0),
            // Normal, plus the three direct modes which never reach here.
            _ => y,
        }
    }
}

fn normalize_blend_token(s: &str) -> String {
    s.trim().to_ascii_lowercase().replace('_', "-")
}

impl FromStr for BlendFunction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let token = normalize_blend_token(s);
        Ok(match token.as_str() {
            "normal" | "set" => BlendFunction::Normal,
            "add" | "additive" => BlendFunction::Add,
            "multiply" => BlendFunction::Multiply,
            "screen" => BlendFunction::Screen,
            "alpha" => BlendFunction::Alpha,
            "average" => BlendFunction::Average,
            "darken" => BlendFunction::Darken,
            "lighten" => BlendFunction::Lighten,
            "difference" => BlendFunction::Difference,
            "exclusion" => BlendFunction::Exclusion,
            "overlay" => BlendFunction::Overlay,
            "soft-light" | "softlight" => BlendFunction::SoftLight,
            "color-burn" | "colorburn" => BlendFunction::ColorBurn,
            "color-dodge" | "colordodge" => BlendFunction::ColorDodge,
            "divide" => BlendFunction::Divide,
            "negation" => BlendFunction::Negation,
            "subtract" => BlendFunction::Subtract,
            "skip" => BlendFunction::Skip,
            other => {
                return Err(Error::configuration(
                    "blend function",
                    format!("unsupported blend function: {other}"),
                ));
            }
        })
    }
}

impl TryFrom<String> for BlendFunction {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<BlendFunction> for String {
    fn from(value: BlendFunction) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for BlendFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A blend function together with an opacity in `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlendMode {
    pub function: BlendFunction,
    opacity: f32,
}

impl Default for BlendMode {
    fn default() -> Self {
        Self {
            function: BlendFunction::Normal,
            opacity: 1.0,
        }
    }
}

impl BlendMode {
    pub fn new(function: BlendFunction) -> Self {
        Self {
            function,
            opacity: 1.0,
        }
    }

    pub fn with_opacity(function: BlendFunction, opacity: f32) -> Self {
        let mut mode = Self::new(function);
        mode.set_opacity(opacity);
        mode
    }

    pub fn opacity(&self) -> f32 {
        clamp01(self.opacity)
    }

    pub fn set_opacity(&mut self, opacity: f32) {
        self.opacity = if opacity.is_nan() { 0.0 } else { clamp01(opacity) };
    }

    /// Packed as `vec4f(opacity, function id, 0, 0)` in the fused uniform block.
    pub fn packed(&self) -> [f32; 4] {
        [self.opacity(), self.function.id() as f32, 0.0, 0.0]
    }

    pub fn combine(&self, base: Rgba, blended: Rgba) -> Rgba {
        combine(self.function, base, blended, self.opacity())
    }
}

/// Combines `base` with `blended` under `function` and `opacity`.
pub fn combine(function: BlendFunction, base: Rgba, blended: Rgba, opacity: f32) -> Rgba {
    let x = base;
    let y = blended;
    match function {
        BlendFunction::Skip => x,
        BlendFunction::Add => [
            x[0] + y[0] * opacity,
            x[1] + y[1] * opacity,
            x[2] + y[2] * opacity,
            x[3] + y[3] * opacity,
        ],
        BlendFunction::Alpha => {
            let t = y[3] * opacity;
            crate::color::mix(x, y, t)
        }
        f => {
            let lerp = |a: f32, b: f32| a + (b - a) * opacity;
            [
                lerp(x[0], f.channel(x[0], y[0])),
                lerp(x[1], f.channel(x[1], y[1])),
                lerp(x[2], f.channel(x[2], y[2])),
                lerp(x[3], y[3]),
            ]
        }
    }
}

/// WGSL twin of [`combine`]. Linked verbatim into every fused program.
pub const WGSL_BLEND_LIBRARY: &str = r#"
fn fx_blend_rgb(f: u32, x: vec3f, y: vec3f) -> vec3f {
    let one = vec3f(1.0);
    let zero = vec3f(0.0);
    switch f {
        case 2u: { return x * y; }
        case 3u: { return one - (one - x) * (one - y); }
        case 5u: { return (x + y) * 0.5; }
        case 6u: { return min(x, y); }
        case 7u: { return max(x, y); }
        case 8u: { return abs(x - y); }
        case 9u: { return x + y - 2.0 * x * y; }
        case 10u: {
            return select(one - 2.0 * (one - x) * (one - y), 2.0 * x * y, x < vec3f(0.5));
        }
        case 11u: { return (one - 2.0 * y) * x * x + 2.0 * y * x; }
        case 12u: {
            let burn = max(one - (one - x) / max(y, vec3f(1e-6)), zero);
            return select(select(burn, zero, y <= zero), one, x >= one);
        }
        case 13u: {
            let dodge = min(x / max(one - y, vec3f(1e-6)), one);
            return select(select(dodge, one, y >= one), zero, x <= zero);
        }
        case 14u: {
            return select(one, min(x / max(y, vec3f(1e-6)), one), y > zero);
        }
        case 15u: { return one - abs(one - x - y); }
        case 16u: { return max(x - y, zero); }
        default: { return y; }
    }
}

fn fx_blend(packed: vec4f, x: vec4f, y: vec4f) -> vec4f {
    let opacity = packed.x;
    let f = u32(packed.y);
    switch f {
        case 1u: { return x + y * opacity; }
        case 4u: { return mix(x, y, y.a * opacity); }
        case 17u: { return x; }
        default: {
            return vec4f(mix(x.rgb, fx_blend_rgb(f, x.rgb, y.rgb), opacity), mix(x.a, y.a, opacity));
        }
    }
}
"#;
