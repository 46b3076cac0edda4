//! Typed access to node attributes with defaults.

use super::{Attribute, Node};

/// Conversion from a stored attribute into the type the caller asked for.
pub trait FromAttribute: Sized {
    fn from_attribute(attr: &Attribute) -> Option<Self>;
}

impl FromAttribute for i64 {
    fn from_attribute(attr: &Attribute) -> Option<Self> {
        match attr {
            Attribute::Int(value) => Some(*value),
            _ => None,
        }
    }
}

impl FromAttribute for f32 {
    fn from_attribute(attr: &Attribute) -> Option<Self> {
        match attr {
            Attribute::Float(value) => Some(*value),
            // Writers occasionally store float scalars as ints.
            Attribute::Int(value) => Some(*value as f32),
            _ => None,
        }
    }
}

impl FromAttribute for Vec<i64> {
    fn from_attribute(attr: &Attribute) -> Option<Self> {
        match attr {
            Attribute::Ints(values) => Some(values.clone()),
            _ => None,
        }
    }
}

impl FromAttribute for Vec<f32> {
    fn from_attribute(attr: &Attribute) -> Option<Self> {
        match attr {
            Attribute::Floats(values) => Some(values.clone()),
            _ => None,
        }
    }
}

impl FromAttribute for String {
    fn from_attribute(attr: &Attribute) -> Option<Self> {
        match attr {
            Attribute::Str(value) => Some(value.clone()),
            _ => None,
        }
    }
}

/// Reads a node's attributes, falling back to defaults for absent names.
pub struct NodeAttrs<'a> {
    node: &'a Node,
}

impl<'a> NodeAttrs<'a> {
    pub fn new(node: &'a Node) -> Self {
        Self { node }
    }

    /// Returns the attribute coerced to the default's type, or the default
    /// when the attribute is absent or carries an incompatible value.
    pub fn get<T: FromAttribute>(&self, name: &str, default: T) -> T {
        match self.node.attributes.get(name) {
            Some(attr) => T::from_attribute(attr).unwrap_or(default),
            None => default,
        }
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.node.attributes.contains_key(name)
    }
}
