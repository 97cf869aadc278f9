//! The fused effect pass: many effects, one program, one draw call.
//!
//! Structural changes (membership, order, defines, attributes, shader text)
//! only mark the pass dirty. The program is rebuilt on [`EffectPass::commit`]
//! or right before the next render, whichever comes first, so a burst of
//! mutations costs one compile.

pub(crate) mod compiler;
mod preprocess;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::color::BufferPrecision;
use crate::device::{FullscreenDraw, ProgramId, Renderer, frame_slots, frame_values};
use crate::effect::{Effect, EffectAttributes, EffectId};
use crate::error::{Error, Result};
use crate::pass::{PassIo, PassSettings, Stage};
use crate::shader::pack_uniform_block;

use compiler::{FuseOptions, FuseUnit, UnitSlots, fuse, validate_members};

/// What a compiled program depends on. Uniform values and blend settings are
/// deliberately absent: they travel in the uniform block.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ProgramKey {
    effects: Vec<EffectSignature>,
    precision: BufferPrecision,
    alpha: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct EffectSignature {
    id: EffectId,
    shader: u64,
    defines: Vec<(String, String)>,
    attributes: EffectAttributes,
    uniform_layout: Vec<(String, &'static str)>,
    kernel: usize,
}

impl EffectSignature {
    fn of(effect: &Effect) -> Self {
        let mut hasher = DefaultHasher::new();
        effect.shader_text().hash(&mut hasher);
        Self {
            id: effect.id(),
            shader: hasher.finish(),
            defines: effect
                .defines()
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            attributes: effect.attributes(),
            uniform_layout: effect
                .uniforms()
                .iter()
                .map(|(k, v)| (k.to_string(), v.kind_name()))
                .collect(),
            kernel: effect
                .kernel()
                .map_or(0, |k| Arc::as_ptr(k) as *const () as usize),
        }
    }
}

struct CompiledProgram {
    id: ProgramId,
    key: ProgramKey,
    layout: Vec<UnitSlots>,
    slot_count: usize,
    wgsl: String,
}

pub struct EffectPass {
    name: String,
    settings: PassSettings,
    effects: Vec<Effect>,
    options: FuseOptions,
    compiled: Option<CompiledProgram>,
    membership_dirty: bool,
    last_error: Option<Error>,
    program_version: u64,
    elapsed: f32,
    camera: [f32; 2],
    disposed: bool,
}

impl std::fmt::Debug for EffectPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectPass")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .field("effects", &self.effects)
            .field("program_version", &self.program_version)
            .field("compiled", &self.compiled.is_some())
            .field("last_error", &self.last_error)
            .finish()
    }
}

impl EffectPass {
    /// Fails with [`Error::Configuration`] if the effects cannot share a program.
    pub fn new(name: impl Into<String>, effects: Vec<Effect>) -> Result<Self> {
        let name = name.into();
        validate_members(&name, &effects)?;
        Ok(Self {
            name,
            settings: PassSettings::swapping(),
            effects,
            options: FuseOptions::default(),
            compiled: None,
            membership_dirty: true,
            last_error: None,
            program_version: 0,
            elapsed: 0.0,
            camera: frame_slots::DEFAULT_CAMERA_PLANES,
            disposed: false,
        })
    }

    pub fn effects(&self) -> &[Effect] {
        &self.effects
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn effect(&self, id: EffectId) -> Option<&Effect> {
        self.effects.iter().find(|e| e.id() == id)
    }

    /// Mutations through this reference follow the effect's cheap/expensive
    /// rules. Attribute changes are re-validated on the next compile; use
    /// [`EffectPass::set_effect_attributes`] to validate eagerly.
    pub fn effect_mut(&mut self, id: EffectId) -> Option<&mut Effect> {
        self.effects.iter_mut().find(|e| e.id() == id)
    }

    pub fn effect_by_name_mut(&mut self, name: &str) -> Option<&mut Effect> {
        self.effects.iter_mut().find(|e| e.name() == name)
    }

    /// Appends `effect`; it runs after every current member.
    pub fn add_effect(&mut self, effect: Effect) -> Result<EffectId> {
        let index = self.effects.len();
        self.insert_effect(index, effect)
    }

    pub fn insert_effect(&mut self, index: usize, effect: Effect) -> Result<EffectId> {
        validate_members(&self.name, self.effects.iter().chain([&effect]))?;
        let id = effect.id();
        let index = index.min(self.effects.len());
        log::debug!("{}: effect {} inserted at {index}", self.name, effect.name());
        self.effects.insert(index, effect);
        self.membership_dirty = true;
        Ok(id)
    }

    pub fn remove_effect(&mut self, id: EffectId) -> Option<Effect> {
        let index = self.effects.iter().position(|e| e.id() == id)?;
        self.membership_dirty = true;
        Some(self.effects.remove(index))
    }

    /// Replaces all members at once. On error the current members stay.
    pub fn set_effects(&mut self, effects: Vec<Effect>) -> Result<Vec<Effect>> {
        validate_members(&self.name, &effects)?;
        self.membership_dirty = true;
        Ok(std::mem::replace(&mut self.effects, effects))
    }

    /// Changes an effect's attributes after checking the pass stays fusable.
    pub fn set_effect_attributes(&mut self, id: EffectId, attributes: EffectAttributes) -> Result<()> {
        let index = self
            .effects
            .iter()
            .position(|e| e.id() == id)
            .ok_or_else(|| Error::configuration(&self.name, format!("no effect with id {}", id.get())))?;
        let previous = self.effects[index].attributes();
        self.effects[index].set_attributes(attributes);
        if let Err(err) = validate_members(&self.name, &self.effects) {
            self.effects[index].set_attributes(previous);
            return Err(err);
        }
        Ok(())
    }

    /// Union of the members' attributes.
    pub fn attributes(&self) -> EffectAttributes {
        self.effects
            .iter()
            .fold(EffectAttributes::empty(), |acc, e| acc | e.attributes())
    }

    /// Incremented on every successful compile.
    pub fn program_version(&self) -> u64 {
        self.program_version
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }

    /// WGSL of the program currently in use.
    pub fn fused_source(&self) -> Option<&str> {
        self.compiled.as_ref().map(|c| c.wgsl.as_str())
    }

    /// The error of the most recent failed compile, cleared by a successful one.
    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    pub fn set_camera_planes(&mut self, near: f32, far: f32) {
        self.camera = [near, far];
    }

    pub fn is_dirty(&self) -> bool {
        self.membership_dirty || self.effects.iter().any(Effect::is_changed)
    }

    /// Rebuilds the program if anything structural changed since the last
    /// compile. Returns `true` if a new program was built.
    ///
    /// On failure the pass keeps its previous program; without one it is
    /// disabled and the error is reported again on every later commit until a
    /// change fixes it.
    pub fn commit(&mut self, renderer: &mut dyn Renderer) -> Result<bool> {
        if self.disposed {
            return Err(Error::resource(format!("{} has been disposed", self.name)));
        }
        if !self.is_dirty() {
            if self.compiled.is_some() {
                return Ok(false);
            }
            if let Some(err) = &self.last_error {
                return Err(err.clone());
            }
        }

        let key = self.program_key();
        if self.compiled.as_ref().is_some_and(|c| c.key == key) {
            self.acknowledge_all();
            self.last_error = None;
            return Ok(false);
        }

        let result = validate_members(&self.name, &self.effects).and_then(|_| self.build(renderer, key));
        self.acknowledge_all();
        match result {
            Ok(compiled) => {
                if let Some(old) = self.compiled.replace(compiled) {
                    renderer.release_program(old.id);
                }
                self.program_version += 1;
                self.last_error = None;
                log::debug!(
                    "{}: fused {} effect(s), program version {}",
                    self.name,
                    self.effects.len(),
                    self.program_version
                );
                Ok(true)
            }
            Err(err) => {
                if self.compiled.is_some() {
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

    fn program_key(&self) -> ProgramKey {
        ProgramKey {
            effects: self.effects.iter().map(EffectSignature::of).collect(),
            precision: self.options.precision,
            alpha: self.options.alpha,
        }
    }

    fn acknowledge_all(&mut self) {
        self.membership_dirty = false;
        for effect in &mut self.effects {
            effect.acknowledge_change();
        }
    }

    fn build(&self, renderer: &mut dyn Renderer, key: ProgramKey) -> Result<CompiledProgram> {
        let units: Vec<FuseUnit<'_>> = self.effects.iter().map(FuseUnit::from).collect();
        let fused = fuse(&self.name, &units, self.options)?;
        let id = renderer.compile_program(&fused.source)?;
        Ok(CompiledProgram {
            id,
            key,
            layout: fused.layout,
            slot_count: fused.source.slots.len(),
            wgsl: fused.source.wgsl,
        })
    }
}

impl Stage for EffectPass {
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
            self.membership_dirty = true;
        }
        Ok(())
    }

    fn prepare(&mut self, renderer: &mut dyn Renderer) -> Result<()> {
        self.commit(renderer).map(|_| ())
    }

    fn render(&mut self, renderer: &mut dyn Renderer, io: &PassIo, delta_time: f32) -> Result<()> {
        self.commit(renderer)?;
        self.elapsed += delta_time;
        let Some(compiled) = &self.compiled else {
            return Err(Error::compile(&self.name, "no compiled program"));
        };

        let mut values = frame_values(
            compiled.slot_count,
            self.elapsed,
            delta_time,
            io.output_size(&*renderer),
            self.camera,
        );
        for (effect, slots) in self.effects.iter().zip(&compiled.layout) {
            if let Some(cell) = slots.blend.and_then(|slot| values.get_mut(slot)) {
                *cell = effect.blend_mode().packed().into();
            }
            for (name, slot) in &slots.uniforms {
                if let (Some(value), Some(cell)) = (effect.uniform(name), values.get_mut(*slot)) {
                    *cell = *value;
                }
            }
        }

        renderer.draw_fullscreen(&FullscreenDraw {
            program: compiled.id,
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
        if let Some(compiled) = self.compiled.take() {
            renderer.release_program(compiled.id);
        }
        for effect in &mut self.effects {
            effect.dispose();
        }
        log::debug!("{}: disposed", self.name);
        true
    }

    fn attributes(&self) -> EffectAttributes {
        EffectPass::attributes(self)
    }
}
