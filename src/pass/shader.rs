use std::sync::Arc;

use crate::color::{BufferPrecision, Rgba};
use crate::device::{FullscreenDraw, ProgramId, Renderer, frame_slots, frame_values};
use crate::effect::{ColorKernel, EffectAttributes, KernelInput, OrderedMap, UniformValue};
use crate::effect_pass::compiler::{FuseOptions, FuseUnit, fuse};
use crate::error::{Error, Result};
use crate::shader::pack_uniform_block;

use super::{PassIo, PassSettings, Stage};

const COPY_SHADER: &str = "\
fn main_image(input_color: vec4f, uv: vec2f) -> vec4f {
    return input_color;
}
";

/// A raw full-screen shader: its `main_image` output replaces the input color.
#[derive(Clone)]
pub struct ShaderMaterial {
    name: String,
    fragment_shader: String,
    uniforms: OrderedMap<UniformValue>,
    defines: OrderedMap<String>,
    reads_depth: bool,
    kernel: Option<ColorKernel>,
}

impl std::fmt::Debug for ShaderMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderMaterial")
            .field("name", &self.name)
            .field("uniforms", &self.uniforms)
            .field("defines", &self.defines)
            .field("reads_depth", &self.reads_depth)
            .field("has_kernel", &self.kernel.is_some())
            .finish()
    }
}

impl ShaderMaterial {
    pub fn new(name: impl Into<String>, fragment_shader: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fragment_shader: fragment_shader.into(),
            uniforms: OrderedMap::new(),
            defines: OrderedMap::new(),
            reads_depth: false,
            kernel: None,
        }
    }

    /// Passes the input through unchanged.
    pub fn copy() -> Self {
        Self::new("copy", COPY_SHADER).with_kernel(|input| input.color)
    }

    pub fn with_uniform(mut self, name: impl Into<String>, value: impl Into<UniformValue>) -> Self {
        self.uniforms.insert(name, value.into());
        self
    }

    pub fn with_define(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.defines.insert(name, value.into());
        self
    }

    /// Binds the shared depth buffer and passes it to `main_image` as a third argument.
    pub fn with_depth(mut self) -> Self {
        self.reads_depth = true;
        self
    }

    pub fn with_kernel(mut self, kernel: impl Fn(&KernelInput<'_>) -> Rgba + Send + Sync + 'static) -> Self {
        self.kernel = Some(Arc::new(kernel));
        self
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

    pub fn uniform(&self, name: &str) -> Option<&UniformValue> {
        self.uniforms.get(name)
    }

    fn attributes(&self) -> EffectAttributes {
        if self.reads_depth {
            EffectAttributes::DEPTH
        } else {
            EffectAttributes::empty()
        }
    }

    fn unit(&self) -> FuseUnit<'_> {
        FuseUnit {
            name: &self.name,
            shader: &self.fragment_shader,
            uniforms: &self.uniforms,
            defines: &self.defines,
            attributes: self.attributes(),
            kernel: self.kernel.as_ref(),
            blended: false,
        }
    }
}

struct CompiledShader {
    id: ProgramId,
    uniforms: Vec<(String, usize)>,
    slot_count: usize,
}

/// Runs one [`ShaderMaterial`] as a full-screen draw into the write buffer.
pub struct ShaderPass {
    name: String,
    settings: PassSettings,
    material: ShaderMaterial,
    options: FuseOptions,
    program: Option<CompiledShader>,
    dirty: bool,
    last_error: Option<Error>,
    elapsed: f32,
    camera: [f32; 2],
    disposed: bool,
}

impl std::fmt::Debug for ShaderPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderPass")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .field("material", &self.material)
            .field("compiled", &self.program.is_some())
            .field("last_error", &self.last_error)
            .finish()
    }
}

impl ShaderPass {
    pub fn new(material: ShaderMaterial) -> Self {
        Self {
            name: format!("ShaderPass({})", material.name()),
            settings: PassSettings::swapping(),
            material,
            options: FuseOptions::default(),
            program: None,
            dirty: true,
            last_error: None,
            elapsed: 0.0,
            camera: frame_slots::DEFAULT_CAMERA_PLANES,
            disposed: false,
        }
    }

    /// The standard copy stage, usually last in a pipeline to present the read buffer.
    pub fn copy() -> Self {
        Self::new(ShaderMaterial::copy())
    }

    pub fn material(&self) -> &ShaderMaterial {
        &self.material
    }

    /// Replaces the material; the program is rebuilt before the next render.
    pub fn set_material(&mut self, material: ShaderMaterial) {
        self.material = material;
        self.dirty = true;
    }

    /// Updates a uniform value. Declaring a new uniform or changing a
    /// uniform's kind rebuilds the program.
    pub fn set_uniform(&mut self, name: impl Into<String>, value: impl Into<UniformValue>) {
        let value = value.into();
        let name = name.into();
        let same_layout = self.material.uniforms.get(&name).is_some_and(|v| v.same_kind(&value));
        self.material.uniforms.insert(name, value);
        if !same_layout {
            self.dirty = true;
        }
    }

    pub fn set_camera_planes(&mut self, near: f32, far: f32) {
        self.camera = [near, far];
    }

    pub fn is_compiled(&self) -> bool {
        self.program.is_some()
    }

    /// The error of the most recent failed compile, cleared by a successful one.
    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// Builds the material's program once per change.
    ///
    /// On failure the pass keeps its previous program; without one it is
    /// disabled.
    fn compile(&mut self, renderer: &mut dyn Renderer) -> Result<()> {
        let result = self.build(renderer);
        self.dirty = false;
        match result {
            Ok(compiled) => {
                if let Some(old) = self.program.replace(compiled) {
                    renderer.release_program(old.id);
                }
                self.last_error = None;
                log::debug!("{}: program rebuilt", self.name);
                Ok(())
            }
            Err(err) => {
                if self.program.is_some() {
                    log::warn!("{}: recompilation failed, keeping last good program: {err}", self.name);
                } else {
                    log::warn!("{}: compilation failed, pass disabled: {err}", self.name);
                    self.settings.enabled = false;
                }
                self.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    fn build(&self, renderer: &mut dyn Renderer) -> Result<CompiledShader> {
        let fused = fuse(&self.name, &[self.material.unit()], self.options)?;
        let id = renderer.compile_program(&fused.source)?;
        let uniforms = fused.layout.into_iter().next().map(|l| l.uniforms).unwrap_or_default();
        Ok(CompiledShader {
            id,
            uniforms,
            slot_count: fused.source.slots.len(),
        })
    }
}

impl Stage for ShaderPass {
    fn name(&self) -> &str {
        &self.name
    }

    fn settings(&self) -> &PassSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut PassSettings {
        &mut self.settings
    }

    fn initialize(
        &mut self,
        _renderer: &mut dyn Renderer,
        alpha: bool,
        precision: BufferPrecision,
    ) -> Result<()> {
        if self.options.alpha != alpha || self.options.precision != precision {
            self.options = FuseOptions { precision, alpha };
            self.dirty = true;
        }
        Ok(())
    }

    fn prepare(&mut self, renderer: &mut dyn Renderer) -> Result<()> {
        if self.disposed {
            return Err(Error::resource(format!("{} has been disposed", self.name)));
        }
        if self.dirty {
            return self.compile(renderer);
        }
        match (&self.program, &self.last_error) {
            (None, Some(err)) => Err(err.clone()),
            (None, None) => self.compile(renderer),
            (Some(_), _) => Ok(()),
        }
    }

    fn render(&mut self, renderer: &mut dyn Renderer, io: &PassIo, delta_time: f32) -> Result<()> {
        self.prepare(renderer)?;
        self.elapsed += delta_time;
        let Some(program) = &self.program else {
            return Err(Error::compile(&self.name, "no compiled program"));
        };
        let mut values = frame_values(
            program.slot_count,
            self.elapsed,
            delta_time,
            io.output_size(&*renderer),
            self.camera,
        );
        for (name, slot) in &program.uniforms {
            if let (Some(value), Some(cell)) = (self.material.uniform(name), values.get_mut(*slot)) {
                *cell = *value;
            }
        }
        renderer.draw_fullscreen(&FullscreenDraw {
            program: program.id,
            uniforms: &pack_uniform_block(&values),
            input: Some(io.input),
            depth: io.depth,
            output: io.output,
        })
    }

    fn dispose(&mut self, renderer: &mut dyn Renderer) -> bool {
        if std::mem::replace(&mut self.disposed, true) {
            return false;
        }
        if let Some(program) = self.program.take() {
            renderer.release_program(program.id);
        }
        true
    }

    fn attributes(&self) -> EffectAttributes {
        self.material.attributes()
    }
}
