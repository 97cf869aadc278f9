use forge_postfx::{
    BlendFunction, BlendMode, BufferPrecision, ClearPass, DepthPass, Effect, EffectAttributes,
    EffectPass, Fragment, Layers, Pass, Pipeline, PipelineOptions, RenderPass, Renderer, Rgba,
    SceneId, ShaderMaterial, ShaderPass, SoftwareRenderer, Stage,
};

fn gradient(uv: [f32; 2], layers: Layers) -> Option<Fragment> {
    layers.contains(Layers::DEFAULT).then_some(Fragment {
        color: [uv[0], uv[1], 0.5, 1.0],
        depth: uv[0],
    })
}

fn setup(width: u32, height: u32) -> (Pipeline<SoftwareRenderer>, SceneId) {
    let mut renderer = SoftwareRenderer::new(width, height);
    let scene = renderer.add_scene(gradient);
    let options = PipelineOptions {
        precision: BufferPrecision::Full,
        ..PipelineOptions::default()
    };
    (Pipeline::new(renderer, options).unwrap(), scene)
}

fn invert() -> Effect {
    Effect::new(
        "invert",
        "fn main_image(input_color: vec4f, uv: vec2f) -> vec4f {\n    return vec4f(vec3f(1.0) - input_color.rgb, input_color.a);\n}\n",
    )
    .with_kernel(|input| {
        let c = input.color;
        [1.0 - c[0], 1.0 - c[1], 1.0 - c[2], c[3]]
    })
}

fn halve() -> Effect {
    Effect::new(
        "halve",
        "fn main_image(input_color: vec4f, uv: vec2f) -> vec4f {\n    return input_color * 0.5;\n}\n",
    )
    .with_kernel(|input| input.color.map(|c| c * 0.5))
}

fn fog(name: &str) -> Effect {
    Effect::new(
        name,
        "fn main_image(input_color: vec4f, uv: vec2f, depth: f32) -> vec4f {\n    return mix(input_color, vec4f(1.0), depth);\n}\n",
    )
    .with_attributes(EffectAttributes::DEPTH)
    .with_blend_mode(BlendMode::with_opacity(BlendFunction::Normal, 0.5))
    .with_kernel(|input| {
        let d = input.depth;
        input.color.map(|c| c + (1.0 - c) * d)
    })
}

fn buffer_contents(pipeline: &Pipeline<SoftwareRenderer>) -> (Vec<Rgba>, Vec<Rgba>) {
    let renderer = pipeline.renderer();
    let read = renderer.target_pixels(pipeline.read_buffer().unwrap()).unwrap().to_vec();
    let write = renderer.target_pixels(pipeline.write_buffer().unwrap()).unwrap().to_vec();
    (read, write)
}

#[test_log::test]
fn disabled_pass_is_equivalent_to_removed_pass() {
    let (mut with_disabled, scene) = setup(4, 4);
    with_disabled.add_pass(RenderPass::new(scene), None).unwrap();
    with_disabled.add_pass(EffectPass::new("invert", vec![invert()]).unwrap(), None).unwrap();
    let halve_id = with_disabled
        .add_pass(EffectPass::new("halve", vec![halve()]).unwrap(), None)
        .unwrap();
    with_disabled.add_pass(ShaderPass::copy(), None).unwrap();
    assert!(with_disabled.set_enabled(halve_id, false));

    let (mut without, scene) = setup(4, 4);
    without.add_pass(RenderPass::new(scene), None).unwrap();
    without.add_pass(EffectPass::new("invert", vec![invert()]).unwrap(), None).unwrap();
    without.add_pass(ShaderPass::copy(), None).unwrap();

    for _ in 0..3 {
        with_disabled.render(0.016).unwrap();
        without.render(0.016).unwrap();
        assert_eq!(
            with_disabled.renderer().screen_pixels(),
            without.renderer().screen_pixels()
        );
        assert_eq!(buffer_contents(&with_disabled), buffer_contents(&without));
        assert_eq!(with_disabled.renderer().stats(), without.renderer().stats());
    }
    let disabled = with_disabled.pass(halve_id).unwrap().as_effect_pass().unwrap();
    assert!(!disabled.is_compiled(), "a disabled pass is never prepared");
}

#[test_log::test]
fn swapping_passes_hand_off_buffers() {
    let (mut pipeline, scene) = setup(2, 2);
    pipeline.add_pass(RenderPass::new(scene), None).unwrap();
    pipeline.add_pass(EffectPass::new("invert", vec![invert()]).unwrap(), None).unwrap();
    pipeline.add_pass(EffectPass::new("halve", vec![halve()]).unwrap(), None).unwrap();
    let read_before = pipeline.read_buffer();
    pipeline.render(0.0).unwrap();

    // Only the first effect pass swapped; the last one drew to the display.
    assert_ne!(pipeline.read_buffer(), read_before);
    let expected_first = [0.5 * 0.75, 0.5 * 0.75, 0.25, 0.5];
    assert_eq!(pipeline.renderer().screen_pixel(0, 0), Some(expected_first));
}

#[test_log::test]
fn explicit_render_to_screen_skips_the_write_buffer() {
    let (mut pipeline, scene) = setup(2, 2);
    pipeline.add_pass(RenderPass::new(scene), None).unwrap();
    let id = pipeline.add_pass(EffectPass::new("invert", vec![invert()]).unwrap(), None).unwrap();
    pipeline.add_pass(ClearPass::new(None, true), None).unwrap();
    pipeline
        .pass_mut(id)
        .unwrap()
        .stage_mut()
        .settings_mut()
        .render_to_screen = true;
    let read_before = pipeline.read_buffer();
    pipeline.render(0.0).unwrap();

    assert_eq!(pipeline.read_buffer(), read_before, "terminal passes never swap");
    assert_eq!(pipeline.renderer().screen_pixel(0, 0), Some([0.75, 0.75, 0.5, 1.0]));
}

#[test_log::test]
fn passes_insert_at_index() {
    let (mut pipeline, scene) = setup(2, 2);
    let copy = pipeline.add_pass(ShaderPass::copy(), None).unwrap();
    let render = pipeline.add_pass(RenderPass::new(scene), Some(0)).unwrap();
    let clear = pipeline.add_pass(ClearPass::default(), Some(0)).unwrap();
    let order: Vec<_> = pipeline.passes().map(|(id, _)| id).collect();
    assert_eq!(order, [clear, render, copy]);
    assert_eq!(pipeline.len(), 3);
}

#[test_log::test]
fn removed_pass_releases_resources_once() {
    let (mut pipeline, scene) = setup(4, 4);
    pipeline.add_pass(RenderPass::new(scene), None).unwrap();
    let depth = pipeline.add_pass(DepthPass::new(scene), None).unwrap();
    let fx = pipeline
        .add_pass(EffectPass::new("fog", vec![fog("fog")]).unwrap(), None)
        .unwrap();
    pipeline.render(0.0).unwrap();
    let stats = pipeline.renderer().stats();
    assert_eq!(stats.live_targets(), 3);
    assert_eq!(stats.live_programs(), 1);

    let mut removed = pipeline.remove_pass(fx).unwrap();
    assert!(pipeline.remove_pass(fx).is_none());
    assert!(!removed.stage_mut().dispose(pipeline.renderer_mut()));
    assert_eq!(pipeline.renderer().stats().programs_released, 1);
    let Pass::Effect(pass) = &removed else {
        panic!("expected an effect pass");
    };
    assert!(pass.effects().iter().all(Effect::is_disposed));

    let mut depth = pipeline.remove_pass(depth).unwrap();
    assert!(!depth.stage_mut().dispose(pipeline.renderer_mut()));
    assert_eq!(pipeline.renderer().stats().live_targets(), 2);

    assert!(pipeline.dispose());
    assert!(!pipeline.dispose());
    let stats = pipeline.renderer().stats();
    assert_eq!(stats.live_targets(), 0);
    assert_eq!(stats.live_programs(), 0);
}

#[test_log::test]
fn one_depth_render_feeds_every_consumer() {
    let (mut pipeline, scene) = setup(4, 4);
    pipeline.add_pass(RenderPass::new(scene), None).unwrap();
    pipeline.add_pass(DepthPass::new(scene), None).unwrap();
    pipeline
        .add_pass(EffectPass::new("fog_a", vec![fog("fog_a")]).unwrap(), None)
        .unwrap();
    pipeline.add_pass(DepthPass::new(scene), None).unwrap();
    pipeline
        .add_pass(EffectPass::new("fog_b", vec![fog("fog_b"), halve()]).unwrap(), None)
        .unwrap();

    pipeline.render(0.0).unwrap();
    assert_eq!(pipeline.renderer().stats().depth_scene_renders, 1);
    pipeline.render(0.0).unwrap();
    assert_eq!(pipeline.renderer().stats().depth_scene_renders, 2);
}

#[test_log::test]
fn depth_is_not_rendered_without_consumers() {
    let (mut pipeline, scene) = setup(4, 4);
    pipeline.add_pass(RenderPass::new(scene), None).unwrap();
    pipeline.add_pass(DepthPass::new(scene), None).unwrap();
    let fx = pipeline
        .add_pass(EffectPass::new("invert", vec![invert()]).unwrap(), None)
        .unwrap();
    pipeline.render(0.0).unwrap();
    assert_eq!(pipeline.renderer().stats().depth_scene_renders, 0);

    // Adding a depth reader later turns the producer on.
    let pass = pipeline.pass_mut(fx).unwrap().as_effect_pass_mut().unwrap();
    pass.add_effect(fog("fog")).unwrap();
    pipeline.render(0.0).unwrap();
    assert_eq!(pipeline.renderer().stats().depth_scene_renders, 1);
}

#[test_log::test]
fn resize_reaches_every_pass_at_its_own_scale() {
    let (mut pipeline, scene) = setup(8, 4);
    let mut depth = DepthPass::new(scene);
    depth.resolution_mut().set_scale(0.5);
    let depth_id = pipeline.add_pass(depth, None).unwrap();

    let target = |pipeline: &Pipeline<SoftwareRenderer>| match pipeline.pass(depth_id) {
        Some(Pass::Depth(d)) => d.target().and_then(|t| pipeline.renderer().target_size(t)),
        _ => None,
    };
    assert_eq!(target(&pipeline), Some((4, 2)));

    pipeline.set_size(16, 10).unwrap();
    assert_eq!(pipeline.size(), (16, 10));
    assert_eq!(pipeline.renderer().output_size(), (16, 10));
    assert_eq!(target(&pipeline), Some((8, 5)));
    let read = pipeline.read_buffer().unwrap();
    assert_eq!(pipeline.renderer().target_size(read), Some((16, 10)));

    if let Some(Pass::Depth(d)) = pipeline.pass_mut(depth_id) {
        d.resolution_mut().set_preferred_size(Some(100), None);
    }
    // Not reallocated until the next explicit resize.
    assert_eq!(target(&pipeline), Some((8, 5)));
    pipeline.set_size(192, 108).unwrap();
    assert_eq!(target(&pipeline), Some((100, 56)));
}

#[test_log::test]
fn failed_compile_aborts_the_frame_then_disables_the_pass() {
    let (mut pipeline, scene) = setup(2, 2);
    pipeline.add_pass(RenderPass::new(scene), None).unwrap();
    let broken = Effect::new(
        "broken",
        "fn main_image(input_color: vec4f, uv: vec2f) -> vec4f { return missing_value; }",
    )
    .with_kernel(|input| input.color);
    let id = pipeline
        .add_pass(EffectPass::new("broken", vec![broken]).unwrap(), None)
        .unwrap();

    let err = pipeline.render(0.0).unwrap_err();
    assert!(err.is_compile(), "{err}");
    assert_eq!(pipeline.renderer().stats().color_scene_renders, 0, "frame never started");
    assert!(!pipeline.pass(id).unwrap().is_enabled());

    pipeline.render(0.0).unwrap();
    assert_eq!(pipeline.renderer().screen_pixel(0, 0), Some([0.25, 0.25, 0.5, 1.0]));
}

fn broken_material() -> ShaderMaterial {
    ShaderMaterial::new(
        "broken",
        "fn main_image(input_color: vec4f, uv: vec2f) -> vec4f { return missing_value; }",
    )
    .with_kernel(|input| input.color)
}

#[test_log::test]
fn failed_shader_compile_disables_the_pass_instead_of_retrying() {
    let (mut pipeline, scene) = setup(2, 2);
    pipeline.add_pass(RenderPass::new(scene), None).unwrap();
    let id = pipeline.add_pass(ShaderPass::new(broken_material()), None).unwrap();

    assert!(pipeline.render(0.0).unwrap_err().is_compile());
    assert!(!pipeline.pass(id).unwrap().is_enabled());
    for _ in 0..2 {
        pipeline.render(0.0).unwrap();
    }
    let stats = pipeline.renderer().stats();
    assert_eq!(stats.color_scene_renders, 2);
    assert_eq!(stats.programs_compiled, 0);
    assert_eq!(pipeline.renderer().screen_pixel(0, 0), Some([0.25, 0.25, 0.5, 1.0]));
}

#[test_log::test]
fn failed_shader_recompile_keeps_rendering_the_last_good_program() {
    let (mut pipeline, scene) = setup(2, 2);
    pipeline.add_pass(RenderPass::new(scene), None).unwrap();
    let id = pipeline.add_pass(ShaderPass::copy(), None).unwrap();
    pipeline.render(0.0).unwrap();
    let before = pipeline.renderer().screen_pixels().to_vec();

    if let Some(Pass::Shader(pass)) = pipeline.pass_mut(id) {
        pass.set_material(broken_material());
    }
    assert!(pipeline.render(0.0).unwrap_err().is_compile());
    for _ in 0..2 {
        pipeline.render(0.0).unwrap();
    }

    let Some(Pass::Shader(pass)) = pipeline.pass(id) else {
        panic!("shader pass expected");
    };
    assert!(pass.settings().enabled);
    assert!(pass.is_compiled());
    assert!(pass.last_error().is_some_and(|e| e.is_compile()));
    assert_eq!(pipeline.renderer().screen_pixels(), before.as_slice());
    let stats = pipeline.renderer().stats();
    assert_eq!(stats.programs_compiled, 1);
    assert_eq!(stats.draw_calls, 3);
}

#[test_log::test]
fn failing_pass_resize_does_not_stop_later_passes() {
    let (mut pipeline, scene) = setup(4, 4);
    let first = pipeline.add_pass(DepthPass::new(scene), None).unwrap();
    let second = pipeline.add_pass(DepthPass::new(scene), None).unwrap();
    let depth_target = |pipeline: &Pipeline<SoftwareRenderer>, id| match pipeline.pass(id) {
        Some(Pass::Depth(d)) => d.target(),
        _ => None,
    };

    let lost = depth_target(&pipeline, first).unwrap();
    assert!(pipeline.renderer_mut().release_target(lost));

    let err = pipeline.set_size(8, 8).unwrap_err();
    assert!(err.is_resource(), "{err}");
    assert_eq!(pipeline.size(), (8, 8));
    let kept = depth_target(&pipeline, second).unwrap();
    assert_eq!(pipeline.renderer().target_size(kept), Some((8, 8)));
}

#[test_log::test]
fn shader_pass_output_replaces_input() {
    let (mut pipeline, scene) = setup(2, 2);
    pipeline.add_pass(RenderPass::new(scene), None).unwrap();
    let material = ShaderMaterial::new(
        "flat",
        "fn main_image(input_color: vec4f, uv: vec2f) -> vec4f {\n    return fill;\n}\n",
    )
    .with_uniform("fill", [0.25, 0.5, 0.75, 1.0])
    .with_kernel(|input| input.vec4("fill"));
    let id = pipeline.add_pass(ShaderPass::new(material), None).unwrap();
    pipeline.render(0.0).unwrap();
    assert_eq!(pipeline.renderer().screen_pixel(1, 1), Some([0.25, 0.5, 0.75, 1.0]));

    if let Some(Pass::Shader(pass)) = pipeline.pass_mut(id) {
        pass.set_uniform("fill", [1.0, 0.0, 0.0, 1.0]);
    }
    pipeline.render(0.0).unwrap();
    assert_eq!(pipeline.renderer().screen_pixel(1, 1), Some([1.0, 0.0, 0.0, 1.0]));
    assert_eq!(pipeline.renderer().stats().programs_compiled, 1);
}

#[test_log::test]
fn render_pass_honours_layer_mask() {
    let (mut pipeline, scene) = setup(2, 2);
    pipeline
        .add_pass(
            RenderPass::new(scene)
                .with_layers(Layers::layer(3))
                .with_background(Some([0.0, 0.0, 1.0, 1.0])),
            None,
        )
        .unwrap();
    pipeline.render(0.0).unwrap();
    assert_eq!(pipeline.renderer().screen_pixel(0, 0), Some([0.0, 0.0, 1.0, 1.0]));
}
