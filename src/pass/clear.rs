use crate::color::Rgba;
use crate::device::Renderer;
use crate::error::Result;

use super::{PassIo, PassSettings, Stage};

/// Clears the read buffer (or the display when terminal).
#[derive(Debug, Clone)]
pub struct ClearPass {
    name: String,
    settings: PassSettings,
    disposed: bool,
    pub color: Option<Rgba>,
    pub depth: bool,
}

impl ClearPass {
    pub fn new(color: Option<Rgba>, depth: bool) -> Self {
        Self {
            name: "ClearPass".into(),
            settings: PassSettings::in_place(),
            disposed: false,
            color,
            depth,
        }
    }
}

impl Default for ClearPass {
    fn default() -> Self {
        Self::new(Some(crate::color::TRANSPARENT), true)
    }
}

impl Stage for ClearPass {
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
        let depth = self.depth.then_some(1.0);
        if self.color.is_none() && depth.is_none() {
            return Ok(());
        }
        renderer.clear(io.in_place_target(), self.color, depth)
    }

    fn dispose(&mut self, _renderer: &mut dyn Renderer) -> bool {
        !std::mem::replace(&mut self.disposed, true)
    }
}
