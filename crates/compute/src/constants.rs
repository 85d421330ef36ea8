//! Specialization and push constant values.
//!
//! Kernels are parameterized two ways:
//! - **Specialization constants** are fixed at pipeline creation. Value `n`
//!   of a [`SpecializationConstants`] list feeds the WGSL `override` declared
//!   with `@id(n)`.
//! - **Push constants** are small byte blobs set per dispatch. Their layout is
//!   the concatenation of 4-byte scalar encodings, in declaration order.

use std::collections::HashMap;

/// A single 4-byte scalar constant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constant {
    /// 32-bit float.
    F32(f32),
    /// 32-bit unsigned integer.
    U32(u32),
    /// 32-bit signed integer.
    I32(i32),
}

impl Constant {
    /// Size of every constant in bytes.
    pub const SIZE: usize = 4;

    /// Little-endian byte encoding, as laid out in a push constant block.
    pub fn to_bytes(self) -> [u8; 4] {
        match self {
            Constant::F32(v) => v.to_le_bytes(),
            Constant::U32(v) => v.to_le_bytes(),
            Constant::I32(v) => v.to_le_bytes(),
        }
    }

    /// The value as a pipeline-override number. wgpu converts it to the type
    /// the WGSL `override` declares.
    pub fn as_f64(self) -> f64 {
        match self {
            Constant::F32(v) => v as f64,
            Constant::U32(v) => v as f64,
            Constant::I32(v) => v as f64,
        }
    }
}

impl From<f32> for Constant {
    fn from(v: f32) -> Self {
        Constant::F32(v)
    }
}

impl From<u32> for Constant {
    fn from(v: u32) -> Self {
        Constant::U32(v)
    }
}

impl From<i32> for Constant {
    fn from(v: i32) -> Self {
        Constant::I32(v)
    }
}

/// Encode a list of constants as a push constant block.
pub fn push_constant_bytes(values: &[Constant]) -> Vec<u8> {
    values.iter().flat_map(|c| c.to_bytes()).collect()
}

/// Ordered specialization constants; index `n` feeds `@id(n)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpecializationConstants(Vec<Constant>);

impl SpecializationConstants {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a constant with the next id.
    pub fn push(&mut self, value: impl Into<Constant>) -> &mut Self {
        self.0.push(value.into());
        self
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(mut self, value: impl Into<Constant>) -> Self {
        self.0.push(value.into());
        self
    }

    /// Number of constants.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no constants.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Constant with id `n`.
    pub fn get(&self, n: usize) -> Option<Constant> {
        self.0.get(n).copied()
    }

    /// Iterate in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Constant> {
        self.0.iter()
    }

    /// Pipeline override table keyed by numeric id, as wgpu expects for
    /// `@id(n)` overrides.
    pub fn pipeline_constants(&self) -> HashMap<String, f64> {
        self.0
            .iter()
            .enumerate()
            .map(|(id, c)| (id.to_string(), c.as_f64()))
            .collect()
    }
}

impl From<Vec<Constant>> for SpecializationConstants {
    fn from(values: Vec<Constant>) -> Self {
        Self(values)
    }
}

impl FromIterator<Constant> for SpecializationConstants {
    fn from_iter<I: IntoIterator<Item = Constant>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_constant_layout() {
        let bytes = push_constant_bytes(&[Constant::U32(7), Constant::F32(1.5), Constant::I32(-1)]);
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[0..4], &7u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1.5f32.to_le_bytes());
        assert_eq!(&bytes[8..12], &(-1i32).to_le_bytes());
    }

    #[test]
    fn test_pipeline_constants_keyed_by_id() {
        let spec = SpecializationConstants::new().with(64u32).with(0.25f32).with(-3i32);
        let table = spec.pipeline_constants();
        assert_eq!(table.len(), 3);
        assert_eq!(table["0"], 64.0);
        assert_eq!(table["1"], 0.25);
        assert_eq!(table["2"], -3.0);
    }
}
