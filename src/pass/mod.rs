//! Pipeline stages.
//!
//! Every stage implements [`Stage`]; the pipeline stores them as the closed
//! [`Pass`] variant so it can tell producers (depth) and presenters apart
//! without downcasting.

mod clear;
mod depth;
mod render;
mod shader;

pub use clear::ClearPass;
pub use depth::DepthPass;
pub use render::RenderPass;
pub use shader::{ShaderMaterial, ShaderPass};

use crate::color::BufferPrecision;
use crate::device::{Renderer, TargetId};
use crate::effect::EffectAttributes;
use crate::effect_pass::EffectPass;
use crate::error::Result;

/// Flags shared by all stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassSettings {
    pub enabled: bool,
    /// The stage writes new color data into the write buffer, so the pipeline
    /// swaps read and write afterwards.
    pub needs_swap: bool,
    /// The stage renders straight to the display even if it is not last.
    pub render_to_screen: bool,
}

impl PassSettings {
    pub fn swapping() -> Self {
        Self {
            enabled: true,
            needs_swap: true,
            render_to_screen: false,
        }
    }

    pub fn in_place() -> Self {
        Self {
            enabled: true,
            needs_swap: false,
            render_to_screen: false,
        }
    }
}

/// Buffers a stage sees for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassIo {
    /// The current read buffer.
    pub input: TargetId,
    /// The write buffer; `None` when the stage is terminal and renders to the display.
    pub output: Option<TargetId>,
    /// Scene depth produced earlier in this frame.
    pub depth: Option<TargetId>,
}

impl PassIo {
    pub fn is_terminal(&self) -> bool {
        self.output.is_none()
    }

    /// Where an in-place stage draws: the read buffer, or the display when terminal.
    pub fn in_place_target(&self) -> Option<TargetId> {
        self.output.map(|_| self.input)
    }

    /// Size of whatever a swapping stage draws into.
    pub(crate) fn output_size(&self, renderer: &dyn Renderer) -> (u32, u32) {
        self.output
            .and_then(|t| renderer.target_size(t))
            .unwrap_or_else(|| renderer.output_size())
    }
}

pub trait Stage {
    fn name(&self) -> &str;

    fn settings(&self) -> &PassSettings;

    fn settings_mut(&mut self) -> &mut PassSettings;

    /// One-time capability negotiation before the first render.
    fn initialize(
        &mut self,
        _renderer: &mut dyn Renderer,
        _alpha: bool,
        _precision: BufferPrecision,
    ) -> Result<()> {
        Ok(())
    }

    /// Runs between frames; expensive rebuilds happen here, never mid-frame.
    fn prepare(&mut self, _renderer: &mut dyn Renderer) -> Result<()> {
        Ok(())
    }

    fn render(&mut self, renderer: &mut dyn Renderer, io: &PassIo, delta_time: f32) -> Result<()>;

    /// Resizes owned buffers. The only place a stage reallocates.
    fn set_size(&mut self, _renderer: &mut dyn Renderer, _width: u32, _height: u32) -> Result<()> {
        Ok(())
    }

    /// Releases owned resources. Returns `false` if already disposed.
    fn dispose(&mut self, renderer: &mut dyn Renderer) -> bool;

    /// Requirements on shared buffers.
    fn attributes(&self) -> EffectAttributes {
        EffectAttributes::empty()
    }

    /// The depth buffer this stage filled during its last render, if any.
    fn depth_output(&self) -> Option<TargetId> {
        None
    }
}

pub enum Pass {
    Clear(ClearPass),
    Render(RenderPass),
    Depth(DepthPass),
    Shader(ShaderPass),
    Effect(EffectPass),
}

impl Pass {
    pub fn stage(&self) -> &dyn Stage {
        match self {
            Pass::Clear(p) => p,
            Pass::Render(p) => p,
            Pass::Depth(p) => p,
            Pass::Shader(p) => p,
            Pass::Effect(p) => p,
        }
    }

    pub fn stage_mut(&mut self) -> &mut dyn Stage {
        match self {
            Pass::Clear(p) => p,
            Pass::Render(p) => p,
            Pass::Depth(p) => p,
            Pass::Shader(p) => p,
            Pass::Effect(p) => p,
        }
    }

    pub fn name(&self) -> &str {
        self.stage().name()
    }

    pub fn is_enabled(&self) -> bool {
        self.stage().settings().enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.stage_mut().settings_mut().enabled = enabled;
    }

    /// Depth passes only produce an auxiliary buffer; they never present.
    pub fn presents(&self) -> bool {
        !matches!(self, Pass::Depth(_))
    }

    pub fn is_depth_producer(&self) -> bool {
        matches!(self, Pass::Depth(_))
    }

    pub fn as_effect_pass(&self) -> Option<&EffectPass> {
        match self {
            Pass::Effect(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_effect_pass_mut(&mut self) -> Option<&mut EffectPass> {
        match self {
            Pass::Effect(p) => Some(p),
            _ => None,
        }
    }
}

impl From<ClearPass> for Pass {
    fn from(p: ClearPass) -> Self {
        Pass::Clear(p)
    }
}

impl From<RenderPass> for Pass {
    fn from(p: RenderPass) -> Self {
        Pass::Render(p)
    }
}

impl From<DepthPass> for Pass {
    fn from(p: DepthPass) -> Self {
        Pass::Depth(p)
    }
}

impl From<ShaderPass> for Pass {
    fn from(p: ShaderPass) -> Self {
        Pass::Shader(p)
    }
}

impl From<EffectPass> for Pass {
    fn from(p: EffectPass) -> Self {
        Pass::Effect(p)
    }
}
