pub mod blend;
pub mod color;
pub mod device;
pub mod effect;
pub mod effect_pass;
pub mod error;
pub mod pass;
pub mod pipeline;
pub mod resolution;
pub mod selection;
pub mod shader;

pub use blend::{BlendFunction, BlendMode};
pub use color::{BufferPrecision, Rgba};
pub use device::software::{Fragment, SoftwareRenderer, SoftwareScene};
pub use device::{Renderer, RendererStats, SceneId, TargetId};
pub use effect::{Effect, EffectAttributes, EffectDescriptor, EffectId, KernelInput, UniformValue};
pub use effect_pass::EffectPass;
pub use error::{Error, Result};
pub use pass::{ClearPass, DepthPass, Pass, PassIo, PassSettings, RenderPass, ShaderMaterial, ShaderPass, Stage};
pub use pipeline::{PassId, Pipeline, PipelineOptions};
pub use resolution::{Resolution, ResolutionParams, ResolutionWatcher};
pub use selection::{Layers, ObjectHandle, SceneLayers, Selection};
