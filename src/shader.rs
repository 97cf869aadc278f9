//! WGSL validation using the naga library, plus uniform block packing.

use anyhow::{Context, anyhow};

use crate::effect::UniformValue;
use crate::error::Error;

/// Validate WGSL source code using naga's parser.
///
/// Returns the parsed naga Module on success, or an error with the numbered
/// source listing on failure.
pub fn validate_wgsl(source: &str) -> anyhow::Result<naga::Module> {
    naga::front::wgsl::parse_str(source)
        .map_err(|e| anyhow!("WGSL validation failed:\n{}", format_naga_error(source, &e)))
}

/// Validate WGSL and provide context about which program generated it.
pub fn validate_wgsl_with_context(source: &str, context: &str) -> anyhow::Result<naga::Module> {
    validate_wgsl(source).with_context(|| format!("{context} generated invalid WGSL"))
}

/// Driver-side check: parse failures become [`Error::Compile`].
pub(crate) fn check_program(label: &str, source: &str) -> Result<(), Error> {
    validate_wgsl_with_context(source, label)
        .map(|_| ())
        .map_err(|e| Error::compile(label, format!("{e:#}")))
}

fn format_naga_error(source: &str, error: &naga::front::wgsl::ParseError) -> String {
    let mut output = String::new();
    output.push_str(&format!("  {error}\n"));
    output.push_str("\nGenerated WGSL:\n");
    output.push_str("---\n");
    for (line_num, line) in source.lines().enumerate() {
        output.push_str(&format!("{:4} | {}\n", line_num + 1, line));
    }
    output.push_str("---\n");
    output
}

/// Component type of a 16-byte uniform slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlotKind {
    Float,
    Int,
    Uint,
}

impl SlotKind {
    pub fn of(value: &UniformValue) -> Self {
        match value {
            UniformValue::I32(_) => SlotKind::Int,
            UniformValue::U32(_) | UniformValue::Bool(_) => SlotKind::Uint,
            _ => SlotKind::Float,
        }
    }

    /// Storage type of the `FxUniforms` member holding this slot.
    pub fn wgsl_type(self) -> &'static str {
        match self {
            SlotKind::Float => "vec4f",
            SlotKind::Int => "vec4<i32>",
            SlotKind::Uint => "vec4<u32>",
        }
    }
}

/// One 16-byte slot of a fused uniform block.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct UniformSlot {
    pub words: [u32; 4],
}

impl UniformSlot {
    /// Reads the slot back as the widest value of `kind`.
    pub fn decode(&self, kind: SlotKind) -> UniformValue {
        let w = self.words;
        match kind {
            SlotKind::Float => UniformValue::Vec4(w.map(f32::from_bits)),
            SlotKind::Int => UniformValue::I32(w[0] as i32),
            SlotKind::Uint => UniformValue::U32(w[0]),
        }
    }
}

impl From<&UniformValue> for UniformSlot {
    fn from(value: &UniformValue) -> Self {
        let f = |x: f32| x.to_bits();
        let words = match *value {
            UniformValue::F32(x) => [f(x), 0, 0, 0],
            UniformValue::I32(x) => [x as u32, 0, 0, 0],
            UniformValue::U32(x) => [x, 0, 0, 0],
            UniformValue::Bool(b) => [b as u32, 0, 0, 0],
            UniformValue::Vec2(v) => [f(v[0]), f(v[1]), 0, 0],
            UniformValue::Vec3(v) => [f(v[0]), f(v[1]), f(v[2]), 0],
            UniformValue::Vec4(v) => [f(v[0]), f(v[1]), f(v[2]), f(v[3])],
        };
        UniformSlot { words }
    }
}

/// Packs uniform values into the byte layout of the generated `FxUniforms` struct.
///
/// Every member of that struct is a 16-byte vector, so the block is a flat
/// array of slots in declaration order.
pub fn pack_uniform_block(values: &[UniformValue]) -> Vec<u8> {
    let slots: Vec<UniformSlot> = values.iter().map(UniformSlot::from).collect();
    bytemuck::cast_slice(&slots).to_vec()
}

/// Reads a block written by [`pack_uniform_block`] using the program's slot kinds.
pub fn unpack_uniform_block(label: &str, bytes: &[u8], kinds: &[SlotKind]) -> Result<Vec<UniformValue>, Error> {
    let size = std::mem::size_of::<UniformSlot>();
    if bytes.len() != kinds.len() * size {
        return Err(Error::resource(format!(
            "{label}: {} byte uniform block bound, {} expected",
            bytes.len(),
            kinds.len() * size
        )));
    }
    Ok(bytes
        .chunks_exact(size)
        .zip(kinds)
        .map(|(chunk, kind)| bytemuck::pod_read_unaligned::<UniformSlot>(chunk).decode(*kind))
        .collect())
}
