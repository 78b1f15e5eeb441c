//! JSON output for CLI commands
//!
//! One JSON object per command on stdout. Logs go to stderr, so stdout stays
//! machine-readable.

use std::io::{self, Write};

use serde_json::Value;

use super::errors::CliResult;

/// Build the success envelope
pub fn ok_envelope(data: Value) -> Value {
    serde_json::json!({
        "status": "ok",
        "data": data
    })
}

/// Build the error envelope
pub fn error_envelope(code: &str, message: &str, data: Option<Value>) -> Value {
    let mut response = serde_json::json!({
        "status": "error",
        "code": code,
        "message": message
    });
    if let (Some(data), Some(obj)) = (data, response.as_object_mut()) {
        obj.insert("data".to_string(), data);
    }
    response
}

fn write_value(value: &Value) -> CliResult<()> {
    let mut stdout = io::stdout();
    serde_json::to_writer(&mut stdout, value)?;
    writeln!(stdout)?;
    stdout.flush()?;
    Ok(())
}

/// Write a success response to stdout
pub fn write_response(data: Value) -> CliResult<()> {
    write_value(&ok_envelope(data))
}

/// Write an error response to stdout
pub fn write_error(code: &str, message: &str, data: Option<Value>) -> CliResult<()> {
    write_value(&error_envelope(code, message, data))
}
