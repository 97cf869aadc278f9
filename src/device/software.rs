//! CPU emulation of the color pipeline.
//!
//! Programs are checked with naga like a driver would, then executed through
//! the per-stage software kernels. Buffers store linear RGBA quantized to the
//! requested precision; sampling is nearest-neighbour.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, anyhow};

use crate::blend::{self, BlendFunction};
use crate::color::{BufferPrecision, Rgba, TRANSPARENT, to_srgb8};
use crate::effect::{KernelInput, UniformLookup, UniformValue};
use crate::error::{Error, Result};
use crate::selection::Layers;
use crate::shader::{SlotKind, check_program, unpack_uniform_block};

use super::{
    FullscreenDraw, ProgramId, ProgramSource, ProgramStage, Renderer, RendererStats, SceneDraw,
    SceneId, SceneMode, TargetDesc, TargetId, frame_slots,
};

/// What a scene shows at one texel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fragment {
    pub color: Rgba,
    /// Normalized depth, `0.0` at the near plane.
    pub depth: f32,
}

/// Stand-in for the host's 3D renderer.
pub trait SoftwareScene {
    /// The closest visible object on `layers` at `uv`, if any.
    fn shade(&self, uv: [f32; 2], layers: Layers) -> Option<Fragment>;
}

impl<F> SoftwareScene for F
where
    F: Fn([f32; 2], Layers) -> Option<Fragment>,
{
    fn shade(&self, uv: [f32; 2], layers: Layers) -> Option<Fragment> {
        self(uv, layers)
    }
}

#[derive(Debug, Clone)]
struct Plane {
    width: u32,
    height: u32,
    precision: BufferPrecision,
    color: Vec<Rgba>,
    depth: Option<Vec<f32>>,
}

impl Plane {
    fn new(width: u32, height: u32, precision: BufferPrecision, depth: bool) -> Self {
        let len = width as usize * height as usize;
        Self {
            width,
            height,
            precision,
            color: vec![TRANSPARENT; len],
            depth: depth.then(|| vec![1.0; len]),
        }
    }

    fn resize(&mut self, width: u32, height: u32) {
        *self = Plane::new(width, height, self.precision, self.depth.is_some());
    }

    fn texel_index(&self, uv: [f32; 2]) -> usize {
        let x = ((uv[0] * self.width as f32).floor() as i64).clamp(0, self.width as i64 - 1);
        let y = ((uv[1] * self.height as f32).floor() as i64).clamp(0, self.height as i64 - 1);
        y as usize * self.width as usize + x as usize
    }

    fn sample(&self, uv: [f32; 2]) -> Rgba {
        self.color[self.texel_index(uv)]
    }

    fn sample_depth(&self, uv: [f32; 2]) -> f32 {
        self.depth.as_ref().map_or(1.0, |d| d[self.texel_index(uv)])
    }

    fn uv(&self, index: usize) -> [f32; 2] {
        let x = index % self.width as usize;
        let y = index / self.width as usize;
        [
            (x as f32 + 0.5) / self.width as f32,
            (y as f32 + 0.5) / self.height as f32,
        ]
    }

    fn store(&mut self, index: usize, color: Rgba) {
        self.color[index] = self.precision.quantize_rgba(color);
    }
}

struct Program {
    label: String,
    stages: Vec<ProgramStage>,
    slot_kinds: Vec<SlotKind>,
    opaque_output: bool,
}

pub struct SoftwareRenderer {
    screen: Plane,
    targets: HashMap<TargetId, Plane>,
    programs: HashMap<ProgramId, Program>,
    scenes: HashMap<SceneId, Box<dyn SoftwareScene>>,
    unsupported: Vec<BufferPrecision>,
    next_id: u64,
    stats: RendererStats,
}

impl SoftwareRenderer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            screen: Plane::new(width.max(1), height.max(1), BufferPrecision::Full, true),
            targets: HashMap::new(),
            programs: HashMap::new(),
            scenes: HashMap::new(),
            unsupported: Vec::new(),
            next_id: 1,
            stats: RendererStats::default(),
        }
    }

    /// Emulates a device that cannot allocate targets of `precision`.
    pub fn without_precision(mut self, precision: BufferPrecision) -> Self {
        self.unsupported.push(precision);
        self
    }

    pub fn add_scene(&mut self, scene: impl SoftwareScene + 'static) -> SceneId {
        let id = SceneId(self.next_id());
        self.scenes.insert(id, Box::new(scene));
        id
    }

    pub fn remove_scene(&mut self, scene: SceneId) -> bool {
        self.scenes.remove(&scene).is_some()
    }

    pub fn screen_pixels(&self) -> &[Rgba] {
        &self.screen.color
    }

    pub fn screen_pixel(&self, x: u32, y: u32) -> Option<Rgba> {
        (x < self.screen.width && y < self.screen.height)
            .then(|| self.screen.color[(y * self.screen.width + x) as usize])
    }

    pub fn target_pixels(&self, target: TargetId) -> Option<&[Rgba]> {
        self.targets.get(&target).map(|p| p.color.as_slice())
    }

    pub fn target_depth(&self, target: TargetId) -> Option<&[f32]> {
        self.targets.get(&target).and_then(|p| p.depth.as_deref())
    }

    /// Overwrites a target (or the display) with `pixels`, row-major.
    pub fn upload(&mut self, target: Option<TargetId>, pixels: &[Rgba]) -> Result<()> {
        let plane = self.plane_mut(target)?;
        if pixels.len() != plane.color.len() {
            return Err(Error::resource(format!(
                "upload of {} texels into a {}x{} buffer",
                pixels.len(),
                plane.width,
                plane.height
            )));
        }
        for (i, c) in pixels.iter().enumerate() {
            plane.store(i, *c);
        }
        Ok(())
    }

    /// Writes the display contents as an 8-bit sRGB PNG.
    pub fn save_screen_png(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let bytes: Vec<u8> = self.screen.color.iter().flat_map(|c| to_srgb8(*c)).collect();
        let image = image::RgbaImage::from_raw(self.screen.width, self.screen.height, bytes)
            .ok_or_else(|| anyhow!("screen buffer does not match its size"))?;
        image
            .save(path)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn plane(&self, target: Option<TargetId>) -> Result<&Plane> {
        match target {
            None => Ok(&self.screen),
            Some(t) => self
                .targets
                .get(&t)
                .ok_or_else(|| Error::resource(format!("unknown target {}", t.0))),
        }
    }

    fn plane_mut(&mut self, target: Option<TargetId>) -> Result<&mut Plane> {
        match target {
            None => Ok(&mut self.screen),
            Some(t) => self
                .targets
                .get_mut(&t)
                .ok_or_else(|| Error::resource(format!("unknown target {}", t.0))),
        }
    }
}

fn check_size(what: &str, width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(Error::resource(format!("{what}: invalid size {width}x{height}")));
    }
    Ok(())
}

impl Renderer for SoftwareRenderer {
    fn output_size(&self) -> (u32, u32) {
        (self.screen.width, self.screen.height)
    }

    fn set_output_size(&mut self, width: u32, height: u32) -> Result<()> {
        check_size("display", width, height)?;
        if (width, height) != self.output_size() {
            self.screen.resize(width, height);
        }
        Ok(())
    }

    fn supports_precision(&self, precision: BufferPrecision) -> bool {
        !self.unsupported.contains(&precision)
    }

    fn create_target(&mut self, desc: &TargetDesc) -> Result<TargetId> {
        check_size(&desc.label, desc.width, desc.height)?;
        if !self.supports_precision(desc.precision) {
            return Err(Error::resource(format!(
                "{}: {:?} precision is not supported",
                desc.label, desc.precision
            )));
        }
        let id = TargetId(self.next_id());
        self.targets
            .insert(id, Plane::new(desc.width, desc.height, desc.precision, desc.depth));
        self.stats.targets_created += 1;
        Ok(id)
    }

    fn resize_target(&mut self, target: TargetId, width: u32, height: u32) -> Result<()> {
        check_size("target", width, height)?;
        self.plane_mut(Some(target))?.resize(width, height);
        Ok(())
    }

    fn release_target(&mut self, target: TargetId) -> bool {
        let released = self.targets.remove(&target).is_some();
        if released {
            self.stats.targets_released += 1;
        }
        released
    }

    fn target_size(&self, target: TargetId) -> Option<(u32, u32)> {
        self.targets.get(&target).map(|p| (p.width, p.height))
    }

    fn compile_program(&mut self, source: &ProgramSource) -> Result<ProgramId> {
        check_program(&source.label, &source.wgsl)?;
        if let Some(stage) = source.stages.iter().find(|s| s.kernel.is_none()) {
            return Err(Error::compile(
                &source.label,
                format!("stage {} has no software kernel", stage.label),
            ));
        }
        let id = ProgramId(self.next_id());
        self.programs.insert(
            id,
            Program {
                label: source.label.clone(),
                stages: source.stages.clone(),
                slot_kinds: source.slot_kinds.clone(),
                opaque_output: source.opaque_output,
            },
        );
        self.stats.programs_compiled += 1;
        Ok(id)
    }

    fn release_program(&mut self, program: ProgramId) -> bool {
        let released = self.programs.remove(&program).is_some();
        if released {
            self.stats.programs_released += 1;
        }
        released
    }

    fn clear(&mut self, target: Option<TargetId>, color: Option<Rgba>, depth: Option<f32>) -> Result<()> {
        let plane = self.plane_mut(target)?;
        if let Some(color) = color {
            let color = plane.precision.quantize_rgba(color);
            plane.color.fill(color);
        }
        if let (Some(value), Some(plane_depth)) = (depth, plane.depth.as_mut()) {
            plane_depth.fill(value);
        }
        self.stats.clears += 1;
        Ok(())
    }

    fn render_scene(&mut self, draw: &SceneDraw) -> Result<()> {
        let scene = self
            .scenes
            .get(&draw.scene)
            .ok_or_else(|| Error::resource(format!("unknown scene {}", draw.scene.0)))?;
        let plane = match draw.target {
            None => &mut self.screen,
            Some(t) => self
                .targets
                .get_mut(&t)
                .ok_or_else(|| Error::resource(format!("unknown target {}", t.0)))?,
        };
        match draw.mode {
            SceneMode::Color => {
                for i in 0..plane.color.len() {
                    match scene.shade(plane.uv(i), draw.layers) {
                        Some(fragment) => plane.store(i, fragment.color),
                        None => {
                            if let Some(background) = draw.background {
                                plane.store(i, background);
                            }
                        }
                    }
                }
                self.stats.color_scene_renders += 1;
            }
            SceneMode::Depth => {
                let (width, height) = (plane.width, plane.height);
                let uvs: Vec<[f32; 2]> = (0..plane.color.len()).map(|i| plane.uv(i)).collect();
                let depth = plane.depth.as_mut().ok_or_else(|| {
                    Error::resource(format!("{width}x{height} target has no depth plane"))
                })?;
                for (d, uv) in depth.iter_mut().zip(uvs) {
                    if let Some(fragment) = scene.shade(uv, draw.layers) {
                        *d = d.min(fragment.depth.clamp(0.0, 1.0));
                    }
                }
                self.stats.depth_scene_renders += 1;
            }
        }
        Ok(())
    }

    fn draw_fullscreen(&mut self, draw: &FullscreenDraw<'_>) -> Result<()> {
        let program = self
            .programs
            .get(&draw.program)
            .ok_or_else(|| Error::resource(format!("unknown program {}", draw.program.0)))?;
        let uniforms = unpack_uniform_block(&program.label, draw.uniforms, &program.slot_kinds)?;
        let input = draw.input.map(|t| self.plane(Some(t))).transpose()?;
        let depth = draw.depth.map(|t| self.plane(Some(t))).transpose()?;
        let output = self.plane(draw.output)?;

        let frame = uniforms
            .get(frame_slots::FRAME)
            .map_or([0.0; 4], UniformValue::as_vec4);
        let texel_size = [1.0 / output.width as f32, 1.0 / output.height as f32];
        let sampler = |uv: [f32; 2]| input.map_or(TRANSPARENT, |p| p.sample(uv));

        let mut pixels = Vec::with_capacity(output.color.len());
        for i in 0..output.color.len() {
            let uv = output.uv(i);
            let depth = depth.map_or(1.0, |p| p.sample_depth(uv));
            let mut color = sampler(uv);
            for stage in &program.stages {
                let Some(kernel) = &stage.kernel else {
                    continue;
                };
                let result = kernel(&KernelInput {
                    color,
                    uv,
                    depth,
                    time: frame[0],
                    delta_time: frame[1],
                    texel_size,
                    uniforms: UniformLookup {
                        names: &stage.uniforms,
                        values: &uniforms,
                    },
                    sampler: &sampler,
                });
                color = match stage.blend_slot {
                    Some(slot) => {
                        let packed = uniforms.get(slot).map_or([1.0, 0.0, 0.0, 0.0], UniformValue::as_vec4);
                        let function = BlendFunction::from_id(packed[1].round() as u32)
                            .unwrap_or(BlendFunction::Normal);
                        blend::combine(function, color, result, packed[0])
                    }
                    None => result,
                };
            }
            if program.opaque_output {
                color[3] = 1.0;
            }
            pixels.push(color);
        }

        let output = self.plane_mut(draw.output)?;
        for (i, color) in pixels.into_iter().enumerate() {
            output.store(i, color);
        }
        self.stats.draw_calls += 1;
        Ok(())
    }

    fn stats(&self) -> RendererStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::approx_eq;

    #[test]
    fn zero_sized_targets_are_rejected() {
        let mut renderer = SoftwareRenderer::new(4, 4);
        let err = renderer.create_target(&TargetDesc::color("t", 0, 4)).unwrap_err();
        assert!(err.is_resource());
        assert!(renderer.set_output_size(4, 0).unwrap_err().is_resource());
    }

    #[test]
    fn storage_is_quantized_by_precision() {
        let mut renderer = SoftwareRenderer::new(1, 1);
        let low = renderer
            .create_target(&TargetDesc {
                precision: BufferPrecision::Low,
                ..TargetDesc::color("low", 1, 1)
            })
            .unwrap();
        renderer.upload(Some(low), &[[0.5, 1.5, -1.0, 1.0]]).unwrap();
        assert_eq!(renderer.target_pixels(low).unwrap()[0], [128.0 / 255.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn nearest_sampling_maps_between_sizes() {
        let plane = Plane {
            width: 2,
            height: 1,
            precision: BufferPrecision::Full,
            color: vec![[1.0, 0.0, 0.0, 1.0], [0.0, 1.0, 0.0, 1.0]],
            depth: None,
        };
        assert!(approx_eq(plane.sample([0.1, 0.5]), [1.0, 0.0, 0.0, 1.0], 0.0));
        assert!(approx_eq(plane.sample([0.9, 0.5]), [0.0, 1.0, 0.0, 1.0], 0.0));
        assert!(approx_eq(plane.sample([1.0, 1.0]), [0.0, 1.0, 0.0, 1.0], 0.0));
    }

    #[test]
    fn depth_scene_keeps_nearest_fragment() {
        let mut renderer = SoftwareRenderer::new(2, 1);
        let scene = renderer.add_scene(|uv: [f32; 2], _layers: Layers| {
            (uv[0] < 0.5).then_some(Fragment {
                color: [1.0; 4],
                depth: 0.25,
            })
        });
        let target = renderer
            .create_target(&TargetDesc {
                depth: true,
                ..TargetDesc::color("depth", 2, 1)
            })
            .unwrap();
        renderer
            .render_scene(&SceneDraw {
                scene,
                layers: Layers::ALL,
                mode: SceneMode::Depth,
                target: Some(target),
                background: None,
            })
            .unwrap();
        assert_eq!(renderer.target_depth(target).unwrap(), &[0.25, 1.0]);
        assert_eq!(renderer.stats().depth_scene_renders, 1);
    }

    #[test]
    fn programs_without_kernels_are_rejected() {
        let mut renderer = SoftwareRenderer::new(1, 1);
        let source = ProgramSource {
            label: "p".into(),
            wgsl: "@fragment fn fs_main() -> @location(0) vec4f { return vec4f(1.0); }".into(),
            slots: vec![],
            slot_kinds: vec![],
            stages: vec![ProgramStage {
                label: "s".into(),
                kernel: None,
                uniforms: vec![],
                blend_slot: None,
                reads_depth: false,
            }],
            reads_depth: false,
            opaque_output: false,
        };
        assert!(renderer.compile_program(&source).unwrap_err().is_compile());
        assert_eq!(renderer.stats().programs_compiled, 0);
    }

    #[test]
    fn draws_read_the_packed_uniform_block() {
        use crate::effect::ColorKernel;
        use crate::shader::pack_uniform_block;
        use std::sync::Arc;

        let mut renderer = SoftwareRenderer::new(1, 1);
        let kernel: ColorKernel = Arc::new(|input: &KernelInput<'_>| input.vec4("fill"));
        let source = ProgramSource {
            label: "fill".into(),
            wgsl: "@fragment fn fs_main() -> @location(0) vec4f { return vec4f(1.0); }".into(),
            slots: vec!["fill".into()],
            slot_kinds: vec![SlotKind::Float],
            stages: vec![ProgramStage {
                label: "fill".into(),
                kernel: Some(kernel),
                uniforms: vec![("fill".into(), 0)],
                blend_slot: None,
                reads_depth: false,
            }],
            reads_depth: false,
            opaque_output: false,
        };
        let program = renderer.compile_program(&source).unwrap();
        let block = pack_uniform_block(&[UniformValue::Vec4([1.0, 0.0, 1.0, 1.0])]);
        let draw = FullscreenDraw {
            program,
            uniforms: &block,
            input: None,
            depth: None,
            output: None,
        };
        renderer.draw_fullscreen(&draw).unwrap();
        assert_eq!(renderer.screen_pixel(0, 0), Some([1.0, 0.0, 1.0, 1.0]));

        let short = FullscreenDraw { uniforms: &block[..8], ..draw };
        assert!(renderer.draw_fullscreen(&short).unwrap_err().is_resource());
        assert_eq!(renderer.stats().draw_calls, 1);
    }

    #[test]
    fn release_is_idempotent() {
        let mut renderer = SoftwareRenderer::new(1, 1);
        let t = renderer.create_target(&TargetDesc::color("t", 1, 1)).unwrap();
        assert!(renderer.release_target(t));
        assert!(!renderer.release_target(t));
        assert_eq!(renderer.stats().live_targets(), 0);
    }
}
