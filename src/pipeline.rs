//! The frame scheduler.
//!
//! A [`Pipeline`] owns an ordered list of passes and two ping-pong color
//! buffers. Each frame, enabled passes run in list order; after a pass that
//! writes new color data the read and write buffers swap. Terminal passes
//! draw straight to the display.

use serde::{Deserialize, Serialize};

use crate::color::BufferPrecision;
use crate::device::{Renderer, TargetDesc, TargetId};
use crate::effect::EffectAttributes;
use crate::error::{Error, Result};
use crate::pass::{Pass, PassIo};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Keep an alpha channel through the pipeline; otherwise output is opaque.
    pub alpha: bool,
    pub precision: BufferPrecision,
    /// Give the ping-pong buffers a depth plane.
    pub depth_buffer: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            alpha: true,
            precision: BufferPrecision::Half,
            depth_buffer: false,
        }
    }
}

impl PipelineOptions {
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::configuration("pipeline options", e.to_string()))
    }
}

/// Stable handle of a pass inside one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PassId(u64);

pub struct Pipeline<R: Renderer> {
    renderer: R,
    options: PipelineOptions,
    passes: Vec<(PassId, Pass)>,
    buffers: Option<(TargetId, TargetId)>,
    size: (u32, u32),
    elapsed: f32,
    next_pass: u64,
}

fn negotiate_precision(renderer: &dyn Renderer, requested: BufferPrecision) -> Result<BufferPrecision> {
    let fallbacks: &[BufferPrecision] = match requested {
        BufferPrecision::Full => &[BufferPrecision::Full, BufferPrecision::Half, BufferPrecision::Low],
        BufferPrecision::Half => &[BufferPrecision::Half, BufferPrecision::Low],
        BufferPrecision::Low => &[BufferPrecision::Low],
    };
    let chosen = fallbacks
        .iter()
        .copied()
        .find(|p| renderer.supports_precision(*p))
        .ok_or_else(|| Error::resource(format!("renderer supports no buffer precision up to {requested:?}")))?;
    if chosen != requested {
        log::warn!("{requested:?} buffers are not supported, falling back to {chosen:?}");
    }
    Ok(chosen)
}

impl<R: Renderer> Pipeline<R> {
    /// Allocates the ping-pong buffers at the renderer's output size.
    pub fn new(mut renderer: R, mut options: PipelineOptions) -> Result<Self> {
        options.precision = negotiate_precision(&renderer, options.precision)?;
        let size = renderer.output_size();
        let buffers = Self::allocate_buffers(&mut renderer, &options, size)?;
        log::debug!(
            "pipeline created: {}x{}, {:?} precision, alpha {}",
            size.0,
            size.1,
            options.precision,
            options.alpha
        );
        Ok(Self {
            renderer,
            options,
            passes: Vec::new(),
            buffers: Some(buffers),
            size,
            elapsed: 0.0,
            next_pass: 1,
        })
    }

    fn allocate_buffers(
        renderer: &mut R,
        options: &PipelineOptions,
        (width, height): (u32, u32),
    ) -> Result<(TargetId, TargetId)> {
        let desc = |label: &str| TargetDesc {
            label: label.to_string(),
            width,
            height,
            precision: options.precision,
            alpha: options.alpha,
            depth: options.depth_buffer,
        };
        let read = renderer.create_target(&desc("pipeline.read"))?;
        match renderer.create_target(&desc("pipeline.write")) {
            Ok(write) => Ok((read, write)),
            Err(err) => {
                renderer.release_target(read);
                Err(err)
            }
        }
    }

    fn live_buffers(&self) -> Result<(TargetId, TargetId)> {
        self.buffers
            .ok_or_else(|| Error::resource("pipeline has been disposed"))
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut R {
        &mut self.renderer
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    /// Sum of all delta times passed to [`Pipeline::render`].
    pub fn elapsed_time(&self) -> f32 {
        self.elapsed
    }

    /// The buffer the next pass would read from.
    pub fn read_buffer(&self) -> Option<TargetId> {
        self.buffers.map(|b| b.0)
    }

    pub fn write_buffer(&self) -> Option<TargetId> {
        self.buffers.map(|b| b.1)
    }

    pub fn is_disposed(&self) -> bool {
        self.buffers.is_none()
    }

    /// Inserts `pass` at `index` (appends when `None` or out of range).
    ///
    /// The pass is initialized and sized before it is inserted; on error it
    /// is disposed and dropped.
    pub fn add_pass(&mut self, pass: impl Into<Pass>, index: Option<usize>) -> Result<PassId> {
        self.live_buffers()?;
        let mut pass = pass.into();
        let (width, height) = self.size;
        let setup = pass
            .stage_mut()
            .initialize(&mut self.renderer, self.options.alpha, self.options.precision)
            .and_then(|_| pass.stage_mut().set_size(&mut self.renderer, width, height));
        if let Err(err) = setup {
            pass.stage_mut().dispose(&mut self.renderer);
            return Err(err);
        }

        let id = PassId(self.next_pass);
        self.next_pass += 1;
        let index = index.unwrap_or(self.passes.len()).min(self.passes.len());
        log::debug!("pass {} added at {index}", pass.name());
        self.passes.insert(index, (id, pass));
        Ok(id)
    }

    /// Removes a pass and releases its resources. The returned pass is disposed.
    pub fn remove_pass(&mut self, id: PassId) -> Option<Pass> {
        let index = self.passes.iter().position(|(pid, _)| *pid == id)?;
        let (_, mut pass) = self.passes.remove(index);
        if !pass.stage_mut().dispose(&mut self.renderer) {
            log::warn!("pass {} was already disposed", pass.name());
        }
        log::debug!("pass {} removed", pass.name());
        Some(pass)
    }

    pub fn pass(&self, id: PassId) -> Option<&Pass> {
        self.passes.iter().find(|(pid, _)| *pid == id).map(|(_, p)| p)
    }

    pub fn pass_mut(&mut self, id: PassId) -> Option<&mut Pass> {
        self.passes.iter_mut().find(|(pid, _)| *pid == id).map(|(_, p)| p)
    }

    /// Passes in execution order.
    pub fn passes(&self) -> impl Iterator<Item = (PassId, &Pass)> + '_ {
        self.passes.iter().map(|(id, p)| (*id, p))
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Returns `false` if no pass has this id.
    pub fn set_enabled(&mut self, id: PassId, enabled: bool) -> bool {
        match self.pass_mut(id) {
            Some(pass) => {
                pass.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    /// Resizes the display, the ping-pong buffers and then every pass.
    ///
    /// Every pass is offered the new size even if an earlier one fails; the
    /// first failure is returned and only the failing passes keep their old
    /// buffers. Calling `set_size` again with the same size retries them.
    pub fn set_size(&mut self, width: u32, height: u32) -> Result<()> {
        let (read, write) = self.live_buffers()?;
        if width == 0 || height == 0 {
            return Err(Error::resource(format!("invalid pipeline size {width}x{height}")));
        }
        self.renderer.set_output_size(width, height)?;
        self.renderer.resize_target(read, width, height)?;
        self.renderer.resize_target(write, width, height)?;
        self.size = (width, height);

        let mut first_error = None;
        for (_, pass) in &mut self.passes {
            if let Err(err) = pass.stage_mut().set_size(&mut self.renderer, width, height) {
                log::warn!("{}: resize to {width}x{height} failed: {err}", pass.name());
                first_error.get_or_insert(err);
            }
        }
        log::debug!("pipeline resized to {width}x{height}");
        first_error.map_or(Ok(()), Err)
    }

    /// Runs one frame.
    ///
    /// Pending recompilations happen first; if any fails the frame is not
    /// started and the error is returned.
    pub fn render(&mut self, delta_time: f32) -> Result<()> {
        let (mut read, mut write) = self.live_buffers()?;

        for (_, pass) in &mut self.passes {
            if pass.is_enabled() {
                pass.stage_mut().prepare(&mut self.renderer)?;
            }
        }

        // A pass may disable itself while preparing.
        let enabled = |pass: &Pass| pass.is_enabled();
        let depth_needed = self
            .passes
            .iter()
            .any(|(_, p)| enabled(p) && p.stage().attributes().contains(EffectAttributes::DEPTH));
        let last_presenter = self
            .passes
            .iter()
            .rposition(|(_, p)| enabled(p) && p.presents());

        self.elapsed += delta_time;
        let mut depth: Option<TargetId> = None;
        let mut depth_rendered = false;

        for (index, (_, pass)) in self.passes.iter_mut().enumerate() {
            if !pass.is_enabled() {
                log::trace!("skip {} (disabled)", pass.name());
                continue;
            }

            if pass.is_depth_producer() {
                if !depth_needed || depth_rendered {
                    log::trace!("skip {} (depth not needed)", pass.name());
                    continue;
                }
                let io = PassIo {
                    input: read,
                    output: Some(write),
                    depth: None,
                };
                pass.stage_mut().render(&mut self.renderer, &io, delta_time)?;
                depth = pass.stage().depth_output();
                depth_rendered = true;
                log::trace!("render {} (depth)", pass.name());
                continue;
            }

            if depth.is_none() && pass.stage().attributes().contains(EffectAttributes::DEPTH) {
                log::warn!("{} reads depth but no depth pass ran before it", pass.name());
            }

            let settings = *pass.stage().settings();
            let terminal = settings.render_to_screen || Some(index) == last_presenter;
            let io = PassIo {
                input: read,
                output: (!terminal).then_some(write),
                depth,
            };
            pass.stage_mut().render(&mut self.renderer, &io, delta_time)?;
            log::trace!("render {}{}", pass.name(), if terminal { " (to screen)" } else { "" });

            if settings.needs_swap && !terminal {
                std::mem::swap(&mut read, &mut write);
                log::trace!("swap buffers");
            }
        }

        self.buffers = Some((read, write));
        Ok(())
    }

    /// Disposes every pass and releases the ping-pong buffers. Returns
    /// `false` if the pipeline was already disposed.
    pub fn dispose(&mut self) -> bool {
        let Some((read, write)) = self.buffers.take() else {
            return false;
        };
        for (_, pass) in &mut self.passes {
            pass.stage_mut().dispose(&mut self.renderer);
        }
        self.passes.clear();
        self.renderer.release_target(read);
        self.renderer.release_target(write);
        log::debug!("pipeline disposed");
        true
    }
}
