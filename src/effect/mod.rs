//! Declarative effects: a shader fragment plus the data it needs.
//!
//! An [`Effect`] contributes a `main_image` color transform (and optional helper
//! functions) written in WGSL, a blend mode, uniforms, defines and an attribute
//! mask. Uniform, opacity and blend-function changes are cheap and picked up on
//! the next frame. Define, attribute and shader changes bump the effect's
//! version, which the owning [`EffectPass`](crate::effect_pass::EffectPass)
//! polls before its next render.

mod uniform;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::blend::{BlendFunction, BlendMode};
use crate::color::Rgba;
use crate::error::{Error, Result};

pub use uniform::{OrderedMap, UniformValue};

bitflags! {
    /// Capabilities an effect requires from the fused program.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct EffectAttributes: u8 {
        /// Reads the shared scene depth buffer.
        const DEPTH = 1 << 0;
        /// Samples several neighbouring texels of the input buffer.
        const CONVOLUTION = 1 << 1;
    }
}

impl EffectAttributes {
    /// Attributes at most one member of a fused pass may carry.
    pub const EXCLUSIVE: EffectAttributes = EffectAttributes::CONVOLUTION;

    pub fn parse(token: &str) -> Result<Self> {
        match token.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "depth" => Ok(EffectAttributes::DEPTH),
            "convolution" | "multi-tap" => Ok(EffectAttributes::CONVOLUTION),
            other => Err(Error::configuration(
                "effect attributes",
                format!("unknown attribute: {other}"),
            )),
        }
    }
}

/// Process-unique identity of an effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EffectId(u64);

impl EffectId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        EffectId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Per-texel inputs handed to a software [`ColorKernel`].
pub struct KernelInput<'a> {
    /// Running color: the input texel blended with every earlier effect.
    pub color: Rgba,
    pub uv: [f32; 2],
    /// Scene depth in `[0, 1]`; `1.0` where no depth is bound.
    pub depth: f32,
    pub time: f32,
    pub delta_time: f32,
    pub texel_size: [f32; 2],
    pub(crate) uniforms: UniformLookup<'a>,
    pub(crate) sampler: &'a dyn Fn([f32; 2]) -> Rgba,
}

impl KernelInput<'_> {
    pub fn uniform(&self, name: &str) -> Option<&UniformValue> {
        self.uniforms.get(name)
    }

    pub fn f32(&self, name: &str) -> f32 {
        self.uniform(name).map_or(0.0, UniformValue::as_f32)
    }

    pub fn vec4(&self, name: &str) -> [f32; 4] {
        self.uniform(name).map_or([0.0; 4], UniformValue::as_vec4)
    }

    pub fn flag(&self, name: &str) -> bool {
        self.uniform(name).is_some_and(UniformValue::as_bool)
    }

    /// Reads the pass input buffer (not the running color) at `uv`.
    pub fn sample(&self, uv: [f32; 2]) -> Rgba {
        (self.sampler)(uv)
    }
}

/// Maps effect-local uniform names to the fused slot values of one draw.
#[derive(Clone, Copy)]
pub(crate) struct UniformLookup<'a> {
    pub names: &'a [(String, usize)],
    pub values: &'a [UniformValue],
}

impl<'a> UniformLookup<'a> {
    fn get(&self, name: &str) -> Option<&'a UniformValue> {
        self.names
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, slot)| self.values.get(*slot))
    }
}

/// Software twin of an effect's `main_image`, used by the CPU renderer.
pub type ColorKernel = Arc<dyn Fn(&KernelInput<'_>) -> Rgba + Send + Sync>;

pub struct Effect {
    id: EffectId,
    name: String,
    fragment_shader: String,
    blend_mode: BlendMode,
    attributes: EffectAttributes,
    uniforms: OrderedMap<UniformValue>,
    defines: OrderedMap<String>,
    kernel: Option<ColorKernel>,
    version: u64,
    acknowledged: u64,
    disposed: bool,
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("blend_mode", &self.blend_mode)
            .field("attributes", &self.attributes)
            .field("uniforms", &self.uniforms)
            .field("defines", &self.defines)
            .field("has_kernel", &self.kernel.is_some())
            .field("version", &self.version)
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl Effect {
    /// `fragment_shader` must define
    /// `fn main_image(input_color: vec4f, uv: vec2f) -> vec4f`, or with the
    /// depth attribute `fn main_image(input_color: vec4f, uv: vec2f, depth: f32) -> vec4f`.
    pub fn new(name: impl Into<String>, fragment_shader: impl Into<String>) -> Self {
        Self {
            id: EffectId::next(),
            name: name.into(),
            fragment_shader: fragment_shader.into(),
            blend_mode: BlendMode::default(),
            attributes: EffectAttributes::empty(),
            uniforms: OrderedMap::new(),
            defines: OrderedMap::new(),
            kernel: None,
            version: 0,
            acknowledged: 0,
            disposed: false,
        }
    }

    pub fn with_blend_mode(mut self, blend_mode: BlendMode) -> Self {
        self.blend_mode = blend_mode;
        self
    }

    pub fn with_attributes(mut self, attributes: EffectAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_uniform(mut self, name: impl Into<String>, value: impl Into<UniformValue>) -> Self {
        self.uniforms.insert(name, value.into());
        self
    }

    pub fn with_define(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.defines.insert(name, value.into());
        self
    }

    pub fn with_kernel(
        mut self,
        kernel: impl Fn(&KernelInput<'_>) -> Rgba + Send + Sync + 'static,
    ) -> Self {
        self.kernel = Some(Arc::new(kernel));
        self
    }

    pub fn from_descriptor(desc: &EffectDescriptor) -> Result<Self> {
        let mut attributes = EffectAttributes::empty();
        for token in &desc.attributes {
            attributes |= EffectAttributes::parse(token)?;
        }
        let mut effect = Effect::new(desc.name.clone(), desc.fragment_shader.clone())
            .with_blend_mode(desc.blend)
            .with_attributes(attributes);
        for u in &desc.uniforms {
            if effect.uniforms.insert(u.name.clone(), u.value).is_some() {
                return Err(Error::configuration(
                    format!("effect {}", desc.name),
                    format!("duplicate uniform {}", u.name),
                ));
            }
        }
        for d in &desc.defines {
            effect.defines.insert(d.name.clone(), d.value.clone());
        }
        Ok(effect)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let desc: EffectDescriptor = serde_json::from_str(text)
            .map_err(|e| Error::configuration("effect descriptor", e.to_string()))?;
        Self::from_descriptor(&desc)
    }

    pub fn id(&self) -> EffectId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shader_text(&self) -> &str {
        &self.fragment_shader
    }

    pub fn uniforms(&self) -> &OrderedMap<UniformValue> {
        &self.uniforms
    }

    pub fn defines(&self) -> &OrderedMap<String> {
        &self.defines
    }

    pub fn blend_mode(&self) -> &BlendMode {
        &self.blend_mode
    }

    pub fn attributes(&self) -> EffectAttributes {
        self.attributes
    }

    pub fn kernel(&self) -> Option<&ColorKernel> {
        self.kernel.as_ref()
    }

    /// Cheap: reflected on the next render, no recompilation.
    ///
    /// Replacing a uniform with a value of another kind changes the program
    /// layout and therefore counts as a structural change.
    pub fn set_uniform(&mut self, name: impl Into<String>, value: impl Into<UniformValue>) {
        let value = value.into();
        let layout_changed = match self.uniforms.insert(name, value) {
            Some(old) => !old.same_kind(&value),
            None => true,
        };
        if layout_changed {
            self.mark_changed();
        }
    }

    pub fn uniform(&self, name: &str) -> Option<&UniformValue> {
        self.uniforms.get(name)
    }

    /// Expensive: the owning pass recompiles before its next render.
    pub fn set_define(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        let name = name.into();
        if self.defines.get(&name) != Some(&value) {
            self.defines.insert(name, value);
            self.mark_changed();
        }
    }

    pub fn remove_define(&mut self, name: &str) -> Option<String> {
        let old = self.defines.remove(name);
        if old.is_some() {
            self.mark_changed();
        }
        old
    }

    /// Expensive: the owning pass re-validates and recompiles.
    pub fn set_attributes(&mut self, attributes: EffectAttributes) {
        if self.attributes != attributes {
            self.attributes = attributes;
            self.mark_changed();
        }
    }

    pub fn set_fragment_shader(&mut self, fragment_shader: impl Into<String>) {
        self.fragment_shader = fragment_shader.into();
        self.mark_changed();
    }

    pub fn set_kernel(&mut self, kernel: impl Fn(&KernelInput<'_>) -> Rgba + Send + Sync + 'static) {
        self.kernel = Some(Arc::new(kernel));
        self.mark_changed();
    }

    /// Cheap: blend function and opacity travel in the uniform block.
    pub fn set_blend_function(&mut self, function: BlendFunction) {
        self.blend_mode.function = function;
    }

    pub fn set_opacity(&mut self, opacity: f32) {
        self.blend_mode.set_opacity(opacity);
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn mark_changed(&mut self) {
        self.version += 1;
    }

    pub fn is_changed(&self) -> bool {
        self.version != self.acknowledged
    }

    /// Consumed by the owning pass once it has compiled against this version.
    pub fn acknowledge_change(&mut self) -> u64 {
        self.acknowledged = self.version;
        self.version
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Releases the software kernel. Returns `false` if already disposed.
    pub fn dispose(&mut self) -> bool {
        if self.disposed {
            return false;
        }
        self.disposed = true;
        self.kernel = None;
        self.mark_changed();
        log::debug!("effect {} disposed", self.name);
        true
    }
}

/// Serializable description of an effect (everything but the software kernel).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectDescriptor {
    pub name: String,
    pub fragment_shader: String,
    pub blend: BlendMode,
    pub attributes: Vec<String>,
    pub uniforms: Vec<UniformDescriptor>,
    pub defines: Vec<DefineDescriptor>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UniformDescriptor {
    pub name: String,
    pub value: UniformValue,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DefineDescriptor {
    pub name: String,
    #[serde(default)]
    pub value: String,
}
