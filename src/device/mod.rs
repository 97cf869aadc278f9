//! The graphics driver seam.
//!
//! Passes never talk to a GPU API directly. They allocate targets, compile
//! programs and issue draws through [`Renderer`]; a backend decides what those
//! mean. [`software::SoftwareRenderer`] is a CPU emulation of the color pipeline.

pub mod software;

use serde::{Deserialize, Serialize};

use crate::color::{BufferPrecision, Rgba};
use crate::effect::{ColorKernel, UniformValue};
use crate::error::Result;
use crate::selection::Layers;
use crate::shader::SlotKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramId(pub(crate) u64);

/// Handle to a scene owned by the host renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SceneId(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub struct TargetDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub precision: BufferPrecision,
    pub alpha: bool,
    /// Allocate a depth plane next to the color plane.
    pub depth: bool,
}

impl TargetDesc {
    pub fn color(label: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            label: label.into(),
            width,
            height,
            precision: BufferPrecision::default(),
            alpha: true,
            depth: false,
        }
    }
}

/// Slot layout shared by every program: frame data first, then per-stage data.
pub mod frame_slots {
    /// `vec4f(time, delta_time, 0, 0)`
    pub const FRAME: usize = 0;
    /// `vec4f(width, height, 1 / width, 1 / height)`
    pub const RESOLUTION: usize = 1;
    /// `vec4f(near, far, 0, 0)`
    pub const CAMERA: usize = 2;
    pub const COUNT: usize = 3;

    /// Near and far planes used until a host provides its camera.
    pub const DEFAULT_CAMERA_PLANES: [f32; 2] = [0.3, 1000.0];
}

/// A block of `slot_count` zeroed slots with the frame slots filled in.
pub(crate) fn frame_values(
    slot_count: usize,
    time: f32,
    delta_time: f32,
    (width, height): (u32, u32),
    camera: [f32; 2],
) -> Vec<UniformValue> {
    let mut values = vec![UniformValue::Vec4([0.0; 4]); slot_count.max(frame_slots::COUNT)];
    let (w, h) = (width.max(1) as f32, height.max(1) as f32);
    values[frame_slots::FRAME] = UniformValue::Vec4([time, delta_time, 0.0, 0.0]);
    values[frame_slots::RESOLUTION] = UniformValue::Vec4([w, h, 1.0 / w, 1.0 / h]);
    values[frame_slots::CAMERA] = UniformValue::Vec4([camera[0], camera[1], 0.0, 0.0]);
    values
}

/// One color transform inside a program.
#[derive(Clone)]
pub struct ProgramStage {
    pub label: String,
    pub kernel: Option<ColorKernel>,
    /// Effect-local uniform name → slot index.
    pub uniforms: Vec<(String, usize)>,
    /// Slot holding `BlendMode::packed`; `None` replaces the running color.
    pub blend_slot: Option<usize>,
    pub reads_depth: bool,
}

impl std::fmt::Debug for ProgramStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramStage")
            .field("label", &self.label)
            .field("has_kernel", &self.kernel.is_some())
            .field("uniforms", &self.uniforms)
            .field("blend_slot", &self.blend_slot)
            .field("reads_depth", &self.reads_depth)
            .finish()
    }
}

/// Everything a backend needs to build an executable program.
#[derive(Clone, Debug)]
pub struct ProgramSource {
    pub label: String,
    pub wgsl: String,
    /// Member name of each uniform slot, in block order.
    pub slots: Vec<String>,
    /// Component type of each slot, parallel to `slots`.
    pub slot_kinds: Vec<SlotKind>,
    pub stages: Vec<ProgramStage>,
    pub reads_depth: bool,
    /// Force alpha to one on output (pipelines without an alpha channel).
    pub opaque_output: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneMode {
    Color,
    Depth,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SceneDraw {
    pub scene: SceneId,
    pub layers: Layers,
    pub mode: SceneMode,
    /// `None` renders to the display.
    pub target: Option<TargetId>,
    /// Clear color written where no object covers the texel; `None` keeps
    /// existing contents there.
    pub background: Option<Rgba>,
}

#[derive(Debug, Clone, Copy)]
pub struct FullscreenDraw<'a> {
    pub program: ProgramId,
    /// The packed uniform block, as built by [`pack_uniform_block`](crate::shader::pack_uniform_block).
    pub uniforms: &'a [u8],
    pub input: Option<TargetId>,
    pub depth: Option<TargetId>,
    /// `None` renders to the display.
    pub output: Option<TargetId>,
}

/// Counters a backend keeps for inspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RendererStats {
    pub draw_calls: u64,
    pub color_scene_renders: u64,
    pub depth_scene_renders: u64,
    pub clears: u64,
    pub programs_compiled: u64,
    pub programs_released: u64,
    pub targets_created: u64,
    pub targets_released: u64,
}

impl RendererStats {
    pub fn live_targets(&self) -> u64 {
        self.targets_created - self.targets_released
    }

    pub fn live_programs(&self) -> u64 {
        self.programs_compiled - self.programs_released
    }
}

pub trait Renderer {
    fn output_size(&self) -> (u32, u32);

    fn set_output_size(&mut self, width: u32, height: u32) -> Result<()>;

    /// Whether targets of this precision can be allocated.
    fn supports_precision(&self, _precision: BufferPrecision) -> bool {
        true
    }

    fn create_target(&mut self, desc: &TargetDesc) -> Result<TargetId>;

    /// Reallocates `target`; contents are undefined afterwards.
    fn resize_target(&mut self, target: TargetId, width: u32, height: u32) -> Result<()>;

    /// Returns `false` if the target was unknown or already released.
    fn release_target(&mut self, target: TargetId) -> bool;

    fn target_size(&self, target: TargetId) -> Option<(u32, u32)>;

    fn compile_program(&mut self, source: &ProgramSource) -> Result<ProgramId>;

    fn release_program(&mut self, program: ProgramId) -> bool;

    fn clear(&mut self, target: Option<TargetId>, color: Option<Rgba>, depth: Option<f32>) -> Result<()>;

    fn render_scene(&mut self, draw: &SceneDraw) -> Result<()>;

    fn draw_fullscreen(&mut self, draw: &FullscreenDraw<'_>) -> Result<()>;

    fn stats(&self) -> RendererStats;
}
