use serde::{Deserialize, Serialize};

/// Value of one uniform cell.
///
/// In the fused program every cell occupies a 16-byte vector member; the
/// accessor suffix narrows it back to the declared type.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UniformValue {
    Bool(bool),
    F32(f32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    // Integers in JSON already match `F32`; these are only built from Rust.
    I32(i32),
    U32(u32),
}

impl UniformValue {
    /// Expression reading this value out of `member`.
    pub fn wgsl_access(&self, member: &str) -> String {
        match self {
            UniformValue::F32(_) | UniformValue::I32(_) | UniformValue::U32(_) => {
                format!("{member}.x")
            }
            UniformValue::Bool(_) => format!("({member}.x != 0u)"),
            UniformValue::Vec2(_) => format!("{member}.xy"),
            UniformValue::Vec3(_) => format!("{member}.xyz"),
            UniformValue::Vec4(_) => member.to_string(),
        }
    }

    /// Whether `other` can replace this value without changing the program layout.
    pub fn same_kind(&self, other: &UniformValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            UniformValue::Bool(_) => "bool",
            UniformValue::F32(_) => "f32",
            UniformValue::Vec2(_) => "vec2f",
            UniformValue::Vec3(_) => "vec3f",
            UniformValue::Vec4(_) => "vec4f",
            UniformValue::I32(_) => "i32",
            UniformValue::U32(_) => "u32",
        }
    }

    pub fn as_f32(&self) -> f32 {
        match *self {
            UniformValue::F32(x) => x,
            UniformValue::I32(x) => x as f32,
            UniformValue::U32(x) => x as f32,
            UniformValue::Bool(b) => b as u32 as f32,
            UniformValue::Vec2(v) => v[0],
            UniformValue::Vec3(v) => v[0],
            UniformValue::Vec4(v) => v[0],
        }
    }

    pub fn as_vec4(&self) -> [f32; 4] {
        match *self {
            UniformValue::Vec2(v) => [v[0], v[1], 0.0, 0.0],
            UniformValue::Vec3(v) => [v[0], v[1], v[2], 0.0],
            UniformValue::Vec4(v) => v,
            other => [other.as_f32(), 0.0, 0.0, 0.0],
        }
    }

    pub fn as_bool(&self) -> bool {
        match *self {
            UniformValue::Bool(b) => b,
            other => other.as_f32() != 0.0,
        }
    }
}

impl From<f32> for UniformValue {
    fn from(value: f32) -> Self {
        UniformValue::F32(value)
    }
}

impl From<bool> for UniformValue {
    fn from(value: bool) -> Self {
        UniformValue::Bool(value)
    }
}

impl From<i32> for UniformValue {
    fn from(value: i32) -> Self {
        UniformValue::I32(value)
    }
}

impl From<u32> for UniformValue {
    fn from(value: u32) -> Self {
        UniformValue::U32(value)
    }
}

impl From<[f32; 2]> for UniformValue {
    fn from(value: [f32; 2]) -> Self {
        UniformValue::Vec2(value)
    }
}

impl From<[f32; 3]> for UniformValue {
    fn from(value: [f32; 3]) -> Self {
        UniformValue::Vec3(value)
    }
}

impl From<[f32; 4]> for UniformValue {
    fn from(value: [f32; 4]) -> Self {
        UniformValue::Vec4(value)
    }
}

/// Insertion-ordered name → value list. Names are unique.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OrderedMap<V> {
    entries: Vec<(String, V)>,
}

impl<V> OrderedMap<V> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&V> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut V> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /// Returns the previous value if `name` was already present.
    pub fn insert(&mut self, name: impl Into<String>, value: V) -> Option<V> {
        let name = name.into();
        match self.get_mut(&name) {
            Some(slot) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((name, value));
                None
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<V> {
        let idx = self.entries.iter().position(|(k, _)| k == name)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_map_keeps_insertion_order_and_replaces_in_place() {
        let mut map = OrderedMap::new();
        map.insert("b", 1);
        map.insert("a", 2);
        assert_eq!(map.insert("b", 3), Some(1));
        let keys: Vec<&str> = map.names().collect();
        assert_eq!(keys, ["b", "a"]);
        assert_eq!(map.get("b"), Some(&3));
        assert_eq!(map.remove("b"), Some(3));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn json_values_map_to_natural_kinds() {
        let v: Vec<UniformValue> = serde_json::from_str("[true, 0.5, [1, 2], [1, 2, 3], [1, 2, 3, 4]]").unwrap();
        assert_eq!(
            v,
            [
                UniformValue::Bool(true),
                UniformValue::F32(0.5),
                UniformValue::Vec2([1.0, 2.0]),
                UniformValue::Vec3([1.0, 2.0, 3.0]),
                UniformValue::Vec4([1.0, 2.0, 3.0, 4.0]),
            ]
        );
    }

    #[test]
    fn accessors_narrow_the_slot() {
        assert_eq!(UniformValue::F32(1.0).wgsl_access("fx.a"), "fx.a.x");
        assert_eq!(UniformValue::Vec3([0.0; 3]).wgsl_access("fx.a"), "fx.a.xyz");
        assert_eq!(UniformValue::Bool(true).wgsl_access("fx.a"), "(fx.a.x != 0u)");
        assert!(UniformValue::F32(1.0).same_kind(&UniformValue::F32(2.0)));
        assert!(!UniformValue::F32(1.0).same_kind(&UniformValue::I32(2)));
    }
}
