//! Fusion compiler: turns an ordered list of effects into one program.
//!
//! Each effect keeps its own namespace. Functions and structs are prefixed
//! with the effect index; uniforms and valued defines keep their names unless
//! another member already claimed them, in which case the later one gets an
//! index suffix. References inside the effect are rewritten to match, so no
//! effect ever sees another effect's names.

use std::collections::{HashMap, HashSet};

use crate::blend::WGSL_BLEND_LIBRARY;
use crate::color::BufferPrecision;
use crate::device::{ProgramSource, ProgramStage, frame_slots};
use crate::effect::{ColorKernel, Effect, EffectAttributes, OrderedMap, UniformValue};
use crate::error::{Error, Result};
use crate::shader::SlotKind;

use super::preprocess::{declared_items, is_identifier, is_keyword, preprocess, rewrite_identifiers};

/// Module-scope names owned by the generated scaffold.
const RESERVED_MODULE_NAMES: &[&str] = &[
    "fx",
    "fx_input",
    "fx_sampler",
    "fx_depth",
    "FxUniforms",
    "FxVertexOutput",
    "vs_main",
    "fs_main",
    "input_color",
    "uv",
    "depth",
    "color",
];

const FRAME_MEMBERS: [&str; frame_slots::COUNT] = ["frame", "resolution", "camera"];

#[derive(Clone, Copy, Debug)]
pub(crate) struct FuseOptions {
    pub precision: BufferPrecision,
    pub alpha: bool,
}

impl Default for FuseOptions {
    fn default() -> Self {
        Self {
            precision: BufferPrecision::default(),
            alpha: true,
        }
    }
}

/// Borrowed view of one color transform to fuse.
pub(crate) struct FuseUnit<'a> {
    pub name: &'a str,
    pub shader: &'a str,
    pub uniforms: &'a OrderedMap<UniformValue>,
    pub defines: &'a OrderedMap<String>,
    pub attributes: EffectAttributes,
    pub kernel: Option<&'a ColorKernel>,
    /// `false` for raw shader stages, whose output replaces the input.
    pub blended: bool,
}

impl<'a> From<&'a Effect> for FuseUnit<'a> {
    fn from(effect: &'a Effect) -> Self {
        Self {
            name: effect.name(),
            shader: effect.shader_text(),
            uniforms: effect.uniforms(),
            defines: effect.defines(),
            attributes: effect.attributes(),
            kernel: effect.kernel(),
            blended: true,
        }
    }
}

/// Slot assignment of one fused effect.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct UnitSlots {
    pub blend: Option<usize>,
    /// Local uniform name → slot, in the effect's declaration order.
    pub uniforms: Vec<(String, usize)>,
}

#[derive(Clone, Debug)]
pub(crate) struct FusedProgram {
    pub source: ProgramSource,
    pub layout: Vec<UnitSlots>,
}

/// Checks that `effects` may share one program; returns their attribute union.
pub(crate) fn validate_members<'e>(
    label: &str,
    effects: impl IntoIterator<Item = &'e Effect>,
) -> Result<EffectAttributes> {
    let mut union = EffectAttributes::empty();
    let mut exclusive_owner: Vec<(EffectAttributes, &str)> = Vec::new();
    for effect in effects {
        if effect.is_disposed() {
            return Err(Error::configuration(
                label,
                format!("effect {} has been disposed", effect.name()),
            ));
        }
        let exclusive = effect.attributes() & EffectAttributes::EXCLUSIVE;
        for flag in exclusive.iter() {
            if let Some((_, owner)) = exclusive_owner.iter().find(|(f, _)| *f == flag) {
                return Err(Error::configuration(
                    label,
                    format!(
                        "effects {owner} and {} both require {flag:?} and cannot be fused into one pass",
                        effect.name()
                    ),
                ));
            }
            exclusive_owner.push((flag, effect.name()));
        }
        union |= effect.attributes();
    }
    Ok(union)
}

fn unique_name(base: &str, index: usize, taken: &mut HashSet<String>) -> String {
    let mut candidate = base.to_string();
    if taken.contains(&candidate) {
        candidate = format!("{base}_{index}");
        let mut k = 1;
        while taken.contains(&candidate) {
            candidate = format!("{base}_{index}_{k}");
            k += 1;
        }
    }
    taken.insert(candidate.clone());
    candidate
}

fn check_name(context: &str, kind: &str, name: &str) -> Result<()> {
    if !is_identifier(name) || is_keyword(name) {
        return Err(Error::configuration(
            context,
            format!("{kind} name `{name}` is not a usable WGSL identifier"),
        ));
    }
    if name.starts_with("fx_") || RESERVED_MODULE_NAMES.contains(&name) {
        return Err(Error::configuration(
            context,
            format!("{kind} name `{name}` is reserved by the fused program"),
        ));
    }
    Ok(())
}

fn comment_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

/// Fuses `units` in order into one program.
pub(crate) fn fuse(label: &str, units: &[FuseUnit<'_>], options: FuseOptions) -> Result<FusedProgram> {
    let mut members: HashSet<String> = FRAME_MEMBERS.iter().map(|s| s.to_string()).collect();
    let mut module_names: HashSet<String> =
        RESERVED_MODULE_NAMES.iter().map(|s| s.to_string()).collect();
    let mut slots: Vec<String> = FRAME_MEMBERS.iter().map(|s| s.to_string()).collect();
    let mut slot_kinds: Vec<SlotKind> = vec![SlotKind::Float; frame_slots::COUNT];

    let pass_defines = [options.precision.define_name()];
    let mut attributes = EffectAttributes::empty();
    let mut blocks: Vec<String> = Vec::with_capacity(units.len());
    let mut calls: Vec<String> = Vec::with_capacity(units.len());
    let mut stages: Vec<ProgramStage> = Vec::with_capacity(units.len());
    let mut layout: Vec<UnitSlots> = Vec::with_capacity(units.len());

    for (i, unit) in units.iter().enumerate() {
        let context = format!("effect {} (#{i}) in {label}", unit.name);
        attributes |= unit.attributes;

        let blend_slot = if unit.blended {
            let member = unique_name(&format!("e{i}_blend"), i, &mut members);
            slots.push(member);
            slot_kinds.push(SlotKind::Float);
            Some(slots.len() - 1)
        } else {
            None
        };

        // Local name → replacement text inside this unit's code.
        let mut rename: HashMap<String, String> = HashMap::new();
        let mut stage_uniforms: Vec<(String, usize)> = Vec::with_capacity(unit.uniforms.len());
        for (name, value) in unit.uniforms.iter() {
            check_name(&context, "uniform", name)?;
            let member = unique_name(name, i, &mut members);
            if member != name {
                log::debug!("{label}: uniform {name} of {} renamed to {member}", unit.name);
            }
            rename.insert(name.to_string(), value.wgsl_access(&format!("fx.{member}")));
            slots.push(member);
            slot_kinds.push(SlotKind::of(value));
            stage_uniforms.push((name.to_string(), slots.len() - 1));
        }

        let mut defined: HashSet<&str> = pass_defines.iter().copied().collect();
        let mut consts = String::new();
        for (name, value) in unit.defines.iter() {
            check_name(&context, "define", name)?;
            if rename.contains_key(name) {
                return Err(Error::configuration(
                    &context,
                    format!("`{name}` is declared both as a uniform and as a define"),
                ));
            }
            defined.insert(name);
            if value.trim().is_empty() {
                continue;
            }
            let fused = unique_name(name, i, &mut module_names);
            consts.push_str(&format!("const {fused} = {};\n", value.trim()));
            rename.insert(name.to_string(), fused);
        }

        let code = preprocess(unit.shader, &defined)
            .map_err(|message| Error::configuration(&context, message))?;
        let items = declared_items(&code);
        if !items.iter().any(|n| n == "main_image") {
            return Err(Error::configuration(&context, "shader does not declare fn main_image"));
        }
        for item in &items {
            if item.starts_with("fx_") || rename.contains_key(item) {
                return Err(Error::configuration(
                    &context,
                    format!("function or struct `{item}` clashes with a reserved or declared name"),
                ));
            }
            let fused = unique_name(&format!("e{i}_{item}"), i, &mut module_names);
            rename.insert(item.clone(), fused);
        }
        let code = rewrite_identifiers(&code, |id| rename.get(id).cloned());
        blocks.push(format!(
            "// ---- {} ----\n{consts}{}",
            comment_safe(unit.name),
            code.trim_end()
        ));

        let main = &rename["main_image"];
        let reads_depth = unit.attributes.contains(EffectAttributes::DEPTH);
        let args = if reads_depth { "color, uv, depth" } else { "color, uv" };
        calls.push(match blend_slot {
            Some(slot) => format!("    color = fx_blend(fx.{}, color, {main}({args}));", slots[slot]),
            None => format!("    color = {main}({args});"),
        });

        stages.push(ProgramStage {
            label: unit.name.to_string(),
            kernel: unit.kernel.cloned(),
            uniforms: stage_uniforms.clone(),
            blend_slot,
            reads_depth,
        });
        layout.push(UnitSlots {
            blend: blend_slot,
            uniforms: stage_uniforms,
        });
    }

    let reads_depth = attributes.contains(EffectAttributes::DEPTH);
    let wgsl = assemble_module(label, &slots, &slot_kinds, &blocks, &calls, reads_depth, options.alpha);

    Ok(FusedProgram {
        source: ProgramSource {
            label: label.to_string(),
            wgsl,
            slots,
            slot_kinds,
            stages,
            reads_depth,
            opaque_output: !options.alpha,
        },
        layout,
    })
}

fn assemble_module(
    label: &str,
    slots: &[String],
    slot_kinds: &[SlotKind],
    blocks: &[String],
    calls: &[String],
    reads_depth: bool,
    alpha: bool,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("// fused program: {}\n\n", comment_safe(label)));

    out.push_str("struct FxUniforms {\n");
    for (member, kind) in slots.iter().zip(slot_kinds) {
        out.push_str(&format!("    {member}: {},\n", kind.wgsl_type()));
    }
    out.push_str("};\n\n");
    out.push_str("@group(0) @binding(0)\nvar<uniform> fx: FxUniforms;\n\n");
    out.push_str("@group(0) @binding(1)\nvar fx_input: texture_2d<f32>;\n\n");
    out.push_str("@group(0) @binding(2)\nvar fx_sampler: sampler;\n\n");
    if reads_depth {
        out.push_str("@group(0) @binding(3)\nvar fx_depth: texture_2d<f32>;\n\n");
    }

    out.push_str(
        "\
struct FxVertexOutput {
    @builtin(position) position: vec4f,
    @location(0) uv: vec2f,
};

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> FxVertexOutput {
    var out: FxVertexOutput;
    let x = f32((index << 1u) & 2u);
    let y = f32(index & 2u);
    out.position = vec4f(x * 2.0 - 1.0, 1.0 - y * 2.0, 0.0, 1.0);
    out.uv = vec2f(x, y);
    return out;
}

fn fx_time() -> f32 { return fx.frame.x; }
fn fx_delta_time() -> f32 { return fx.frame.y; }
fn fx_resolution() -> vec2f { return fx.resolution.xy; }
fn fx_texel_size() -> vec2f { return fx.resolution.zw; }
fn fx_camera_near() -> f32 { return fx.camera.x; }
fn fx_camera_far() -> f32 { return fx.camera.y; }

fn fx_sample_input(uv: vec2f) -> vec4f {
    return textureSampleLevel(fx_input, fx_sampler, uv, 0.0);
}
",
    );
    if reads_depth {
        out.push_str(
            "
fn fx_read_depth(uv: vec2f) -> f32 {
    return textureSampleLevel(fx_depth, fx_sampler, uv, 0.0).r;
}
",
        );
    }
    out.push_str(WGSL_BLEND_LIBRARY);
    out.push('\n');

    for block in blocks {
        out.push_str(block);
        out.push_str("\n\n");
    }

    out.push_str("@fragment\nfn fs_main(in: FxVertexOutput) -> @location(0) vec4f {\n");
    out.push_str("    let uv = in.uv;\n");
    out.push_str("    var color = fx_sample_input(uv);\n");
    if reads_depth {
        out.push_str("    let depth = fx_read_depth(uv);\n");
    }
    for call in calls {
        out.push_str(call);
        out.push('\n');
    }
    if !alpha {
        out.push_str("    color.a = 1.0;\n");
    }
    out.push_str("    return color;\n}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::validate_wgsl;

    fn units(effects: &[Effect]) -> Vec<FuseUnit<'_>> {
        effects.iter().map(FuseUnit::from).collect()
    }

    fn tint(name: &str) -> Effect {
        Effect::new(
            name,
            "fn main_image(input_color: vec4f, uv: vec2f) -> vec4f {\n    return input_color * tint;\n}\n",
        )
        .with_uniform("tint", [1.0, 0.5, 0.25, 1.0])
    }

    #[test]
    fn fused_module_is_valid_wgsl() {
        let effects = [tint("a"), tint("b")];
        let fused = fuse("pass", &units(&effects), FuseOptions::default()).unwrap();
        validate_wgsl(&fused.source.wgsl).unwrap();
        assert_eq!(fused.source.stages.len(), 2);
    }

    #[test]
    fn colliding_uniforms_are_renamed_per_effect() {
        let effects = [tint("a"), tint("b")];
        let fused = fuse("pass", &units(&effects), FuseOptions::default()).unwrap();
        let wgsl = &fused.source.wgsl;
        assert!(wgsl.contains("    tint: vec4f,"), "{wgsl}");
        assert!(wgsl.contains("    tint_1: vec4f,"), "{wgsl}");
        assert!(wgsl.contains("return input_color * fx.tint;"), "{wgsl}");
        assert!(wgsl.contains("return input_color * fx.tint_1;"), "{wgsl}");
        assert!(wgsl.contains("fn e0_main_image("));
        assert!(wgsl.contains("fn e1_main_image("));

        // Both kernels still look the uniform up by its local name.
        assert_eq!(fused.layout[0].uniforms[0].0, "tint");
        assert_eq!(fused.layout[1].uniforms[0].0, "tint");
        assert_ne!(fused.layout[0].uniforms[0].1, fused.layout[1].uniforms[0].1);
    }

    #[test]
    fn calls_follow_declaration_order() {
        let effects = [tint("first"), tint("second")];
        let fused = fuse("pass", &units(&effects), FuseOptions::default()).unwrap();
        let wgsl = &fused.source.wgsl;
        let first = wgsl.find("color = fx_blend(fx.e0_blend, color, e0_main_image(color, uv));").unwrap();
        let second = wgsl.find("color = fx_blend(fx.e1_blend, color, e1_main_image(color, uv));").unwrap();
        assert!(first < second);
    }

    #[test]
    fn defines_become_scoped_consts_and_flags() {
        let shader = "\
fn main_image(input_color: vec4f, uv: vec2f) -> vec4f {
#ifdef INVERT
    return vec4f(vec3f(1.0) - input_color.rgb * STRENGTH, input_color.a);
#else
    return input_color * STRENGTH;
#endif
}
";
        let a = Effect::new("a", shader).with_define("STRENGTH", "0.5").with_define("INVERT", "");
        let b = Effect::new("b", shader).with_define("STRENGTH", "2.0");
        let effects = [a, b];
        let fused = fuse("pass", &units(&effects), FuseOptions::default()).unwrap();
        let wgsl = &fused.source.wgsl;
        validate_wgsl(wgsl).unwrap();
        assert!(wgsl.contains("const STRENGTH = 0.5;"));
        assert!(wgsl.contains("const STRENGTH_1 = 2.0;"));
        assert!(wgsl.contains("vec3f(1.0) - input_color.rgb * STRENGTH, input_color.a"));
        assert!(wgsl.contains("return input_color * STRENGTH_1;"));
        assert!(!wgsl.contains("#ifdef"));
    }

    #[test]
    fn helper_functions_are_prefixed() {
        let shader = "\
fn luma(c: vec3f) -> f32 { return dot(c, vec3f(0.2126, 0.7152, 0.0722)); }
fn main_image(input_color: vec4f, uv: vec2f) -> vec4f { return vec4f(vec3f(luma(input_color.rgb)), input_color.a); }
";
        let effects = [Effect::new("gray", shader), Effect::new("gray2", shader)];
        let fused = fuse("pass", &units(&effects), FuseOptions::default()).unwrap();
        let wgsl = &fused.source.wgsl;
        validate_wgsl(wgsl).unwrap();
        assert!(wgsl.contains("fn e0_luma(") && wgsl.contains("e0_luma(input_color.rgb)"));
        assert!(wgsl.contains("fn e1_luma(") && wgsl.contains("e1_luma(input_color.rgb)"));
    }

    #[test]
    fn uniforms_shadowed_by_parameters_and_locals_stay_local() {
        let shader = "\
fn apply(c: vec4f, strength: f32) -> vec4f {
    return vec4f(c.rgb * strength, c.a);
}
fn main_image(input_color: vec4f, uv: vec2f) -> vec4f {
    let doubled = strength * 2.0;
    return apply(input_color, doubled);
}
";
        let effects = [Effect::new("a", shader).with_uniform("strength", 0.5)];
        let fused = fuse("pass", &units(&effects), FuseOptions::default()).unwrap();
        let wgsl = &fused.source.wgsl;
        validate_wgsl(wgsl).unwrap();
        assert!(wgsl.contains("fn e0_apply(c: vec4f, strength: f32) -> vec4f {"), "{wgsl}");
        assert!(wgsl.contains("return vec4f(c.rgb * strength, c.a);"), "{wgsl}");
        assert!(wgsl.contains("let doubled = fx.strength.x * 2.0;"), "{wgsl}");
    }

    #[test]
    fn depth_effects_get_depth_binding() {
        let fog = Effect::new(
            "fog",
            "fn main_image(input_color: vec4f, uv: vec2f, depth: f32) -> vec4f { return mix(input_color, vec4f(1.0), depth); }",
        )
        .with_attributes(EffectAttributes::DEPTH);
        let effects = [tint("a"), fog];
        let fused = fuse("pass", &units(&effects), FuseOptions::default()).unwrap();
        assert!(fused.source.reads_depth);
        let wgsl = &fused.source.wgsl;
        validate_wgsl(wgsl).unwrap();
        assert!(wgsl.contains("var fx_depth: texture_2d<f32>;"));
        assert!(wgsl.contains("e1_main_image(color, uv, depth)"));
    }

    #[test]
    fn opaque_pipelines_force_alpha() {
        let effects = [tint("a")];
        let fused = fuse("pass", &units(&effects), FuseOptions { alpha: false, ..FuseOptions::default() }).unwrap();
        assert!(fused.source.opaque_output);
        assert!(fused.source.wgsl.contains("color.a = 1.0;"));
    }

    #[test]
    fn missing_main_image_is_rejected() {
        let effects = [Effect::new("empty", "fn helper() -> f32 { return 1.0; }")];
        let err = fuse("pass", &units(&effects), FuseOptions::default()).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn reserved_and_invalid_names_are_rejected() {
        let bad = [
            tint("a").with_uniform("fx_time", 1.0),
            tint("a").with_uniform("return", 1.0),
            tint("a").with_define("tint", "1.0"),
            tint("a").with_uniform("uv", 1.0),
        ];
        for effect in bad {
            let effects = [effect];
            let err = fuse("pass", &units(&effects), FuseOptions::default()).unwrap_err();
            assert!(err.is_configuration(), "{err}");
        }
    }

    #[test]
    fn exclusive_attributes_cannot_share_a_pass() {
        let blur = |name: &str| {
            Effect::new(name, "fn main_image(input_color: vec4f, uv: vec2f) -> vec4f { return input_color; }")
                .with_attributes(EffectAttributes::CONVOLUTION)
        };
        let ok = [blur("a"), tint("b")];
        assert_eq!(validate_members("pass", &ok).unwrap(), EffectAttributes::CONVOLUTION);
        assert!(validate_members("pass", ok.iter().chain([&blur("c")])).is_err());
        let err = validate_members("pass", &[blur("a"), blur("b")]).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("cannot be fused"));
    }
}
