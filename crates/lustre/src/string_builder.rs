//! The runtime string builder behind string interpolants, and the primitive
//! parse routines its conversions round-trip with.

use crate::{
    types::Primitive,
    value::Value,
};

/// An accumulating builder used by the `BeginStringBuilder` /
/// `AddToStringBuilder` / `EndStringBuilder` opcode sequence.
#[derive(Debug, Default)]
pub struct StringBuilder {
    text: String,
}

impl StringBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a value using the runtime converter for its type.
    pub fn write_value(&mut self, value: &Value) {
        use std::fmt::Write as _;
        let _ = write!(self.text, "{value}");
    }

    /// Appends raw text.
    pub fn write(&mut self, text: &str) {
        self.text.push_str(text);
    }

    /// Appends text followed by a newline.
    pub fn write_line(&mut self, text: &str) {
        self.text.push_str(text);
        self.text.push('\n');
    }

    /// Finishes the builder, producing the accumulated string.
    #[must_use]
    pub fn into_string(self) -> String {
        self.text
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.text.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Parses the textual form of a scalar primitive, the inverse of the
/// builder's conversion where one is defined.
#[must_use]
pub fn parse_primitive(primitive: Primitive, text: &str) -> Option<Value> {
    match primitive {
        Primitive::Boolean => text.parse().ok().map(Value::Boolean),
        Primitive::Byte => text.parse().ok().map(Value::Byte),
        Primitive::Integer => text.parse().ok().map(Value::Integer),
        Primitive::DoubleInteger => text.parse().ok().map(Value::DoubleInteger),
        Primitive::Real => text.parse().ok().map(Value::Real),
        Primitive::DoubleReal => text.parse().ok().map(Value::DoubleReal),
        Primitive::Str => Some(Value::string(text)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_values_and_text() {
        let mut builder = StringBuilder::new();
        builder.write("n = ");
        builder.write_value(&Value::Integer(42));
        assert_eq!(builder.into_string(), "n = 42");
    }

    #[test]
    fn scalar_conversions_round_trip() {
        let cases = [
            (Primitive::Boolean, Value::Boolean(true)),
            (Primitive::Byte, Value::Byte(7)),
            (Primitive::Integer, Value::Integer(-19)),
            (Primitive::DoubleInteger, Value::DoubleInteger(1 << 40)),
            (Primitive::Real, Value::Real(2.5)),
            (Primitive::DoubleReal, Value::DoubleReal(-0.125)),
        ];
        for (primitive, value) in cases {
            let mut builder = StringBuilder::new();
            builder.write_value(&value);
            let parsed = parse_primitive(primitive, &builder.into_string()).unwrap();
            assert_eq!(parsed, value, "{primitive} failed to round-trip");
        }
    }
}
