use crate::color::BufferPrecision;
use crate::device::{Renderer, SceneDraw, SceneId, SceneMode, TargetDesc, TargetId};
use crate::error::{Error, Result};
use crate::resolution::{Resolution, ResolutionWatcher};
use crate::selection::Layers;

use super::{PassIo, PassSettings, Stage};

/// Renders scene depth into a buffer it owns.
///
/// The pipeline runs at most one depth pass per frame and hands its buffer to
/// every later stage that reads depth.
#[derive(Debug)]
pub struct DepthPass {
    name: String,
    settings: PassSettings,
    pub scene: SceneId,
    pub layers: Layers,
    resolution: Resolution,
    watcher: ResolutionWatcher,
    target: Option<TargetId>,
    rendered: bool,
    disposed: bool,
}

impl DepthPass {
    pub fn new(scene: SceneId) -> Self {
        let mut resolution = Resolution::scaled(1.0);
        let watcher = resolution.subscribe();
        Self {
            name: "DepthPass".into(),
            settings: PassSettings::in_place(),
            scene,
            layers: Layers::ALL,
            resolution,
            watcher,
            target: None,
            rendered: false,
            disposed: false,
        }
    }

    pub fn with_layers(mut self, layers: Layers) -> Self {
        self.layers = layers;
        self
    }

    /// Size settings of the depth buffer. Changes apply on the next `set_size`.
    pub fn resolution(&self) -> &Resolution {
        &self.resolution
    }

    pub fn resolution_mut(&mut self) -> &mut Resolution {
        &mut self.resolution
    }

    pub fn target(&self) -> Option<TargetId> {
        self.target
    }
}

impl Stage for DepthPass {
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
        renderer: &mut dyn Renderer,
        _alpha: bool,
        _precision: BufferPrecision,
    ) -> Result<()> {
        if self.disposed {
            return Err(Error::resource(format!("{} has been disposed", self.name)));
        }
        if self.target.is_some() {
            return Ok(());
        }
        let (w, h) = renderer.output_size();
        self.resolution.set_base_size(w, h);
        self.watcher.take_changed();
        let (width, height) = self.resolution.size();
        let desc = TargetDesc {
            label: format!("{}.depth", self.name),
            width,
            height,
            precision: BufferPrecision::Full,
            alpha: false,
            depth: true,
        };
        self.target = Some(renderer.create_target(&desc)?);
        log::debug!("{}: allocated depth buffer {width}x{height}", self.name);
        Ok(())
    }

    fn render(&mut self, renderer: &mut dyn Renderer, _io: &PassIo, _delta_time: f32) -> Result<()> {
        self.rendered = false;
        let target = self
            .target
            .ok_or_else(|| Error::resource(format!("{} has no depth buffer", self.name)))?;
        renderer.clear(Some(target), None, Some(1.0))?;
        renderer.render_scene(&SceneDraw {
            scene: self.scene,
            layers: self.layers,
            mode: SceneMode::Depth,
            target: Some(target),
            background: None,
        })?;
        self.rendered = true;
        Ok(())
    }

    fn set_size(&mut self, renderer: &mut dyn Renderer, width: u32, height: u32) -> Result<()> {
        self.resolution.set_base_size(width, height);
        if self.watcher.take_changed() {
            self.rendered = false;
        }
        // Compared every time so a failed resize is retried.
        if let Some(target) = self.target {
            let (w, h) = self.resolution.size();
            if renderer.target_size(target) != Some((w, h)) {
                self.rendered = false;
                renderer.resize_target(target, w, h)?;
                log::debug!("{}: depth buffer resized to {w}x{h}", self.name);
            }
        }
        Ok(())
    }

    fn dispose(&mut self, renderer: &mut dyn Renderer) -> bool {
        if std::mem::replace(&mut self.disposed, true) {
            return false;
        }
        if let Some(target) = self.target.take() {
            renderer.release_target(target);
        }
        self.rendered = false;
        self.resolution.unsubscribe(&self.watcher);
        true
    }

    fn depth_output(&self) -> Option<TargetId> {
        self.target.filter(|_| self.rendered)
    }
}
