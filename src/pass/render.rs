use crate::color::Rgba;
use crate::device::{Renderer, SceneDraw, SceneId, SceneMode};
use crate::error::Result;
use crate::selection::Layers;

use super::{PassIo, PassSettings, Stage};

/// Renders a scene into the read buffer.
///
/// Scene passes draw in place, so they never swap buffers; following effect
/// passes read what they wrote.
#[derive(Debug, Clone)]
pub struct RenderPass {
    name: String,
    settings: PassSettings,
    disposed: bool,
    pub scene: SceneId,
    pub layers: Layers,
    /// Written where no object covers the texel; `None` keeps earlier contents.
    pub background: Option<Rgba>,
}

impl RenderPass {
    pub fn new(scene: SceneId) -> Self {
        Self {
            name: "RenderPass".into(),
            settings: PassSettings::in_place(),
            disposed: false,
            scene,
            layers: Layers::ALL,
            background: Some(crate::color::TRANSPARENT),
        }
    }

    pub fn with_layers(mut self, layers: Layers) -> Self {
        self.layers = layers;
        self
    }

    pub fn with_background(mut self, background: Option<Rgba>) -> Self {
        self.background = background;
        self
    }
}

impl Stage for RenderPass {
    fn name(&self) -> &str {
        &self.name
    }

    fn settings(&self) -> &PassSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut PassSettings {
        &mut self.settings
    }

    fn render(&mut self, renderer: &mut dyn Renderer, io: &PassIo, _delta_time: f32) -> Result<()> {
        renderer.render_scene(&SceneDraw {
            scene: self.scene,
            layers: self.layers,
            mode: SceneMode::Color,
            target: io.in_place_target(),
            background: self.background,
        })
    }

    fn dispose(&mut self, _renderer: &mut dyn Renderer) -> bool {
        !std::mem::replace(&mut self.disposed, true)
    }
}
