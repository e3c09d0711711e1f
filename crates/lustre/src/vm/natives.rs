//! Native implementations bound to core library functions.

use crate::{
    value::Value,
    vm::{Call, ExecResult},
};

/// `Exception.Constructor(message : String)`: stores the message field.
pub fn exception_constructor(call: &mut Call<'_>) -> ExecResult<()> {
    let message = call.parameter(0);
    let message = match message {
        Value::Str(_) => message,
        other => Value::string(other.to_string()),
    };
    call.write_this_field(0, message)
}
