//! Terminal output: a coloured headline followed by pretty JSON

use orchestra_common::Envelope;
use owo_colors::OwoColorize;
use serde_json::Value;

/// Print the envelope and report whether it succeeded
pub fn print_envelope(envelope: &Envelope<Value>, json_only: bool) -> bool {
    if json_only {
        match serde_json::to_string_pretty(envelope) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("{} {}", "[ERROR]".bright_red(), e),
        }
        return envelope.ok;
    }

    if envelope.ok {
        let headline = envelope.message.as_deref().unwrap_or("OK");
        println!("{} {}", "[OK]".bright_green(), headline);
        if let Some(data) = &envelope.data {
            print_data(data);
        }
    } else if let Some(error) = &envelope.error {
        eprintln!(
            "{} {} {}",
            "[ERROR]".bright_red(),
            error.code.as_str().yellow(),
            error.message
        );
        if let Some(details) = &error.details {
            eprintln!("  {}", details.dimmed());
        }
    } else {
        eprintln!("{} request failed", "[ERROR]".bright_red());
    }

    if let Some(trace) = &envelope.trace_id {
        println!("{} {}", "trace".dimmed(), trace.dimmed());
    }
    envelope.ok
}

fn print_data(data: &Value) {
    match data {
        Value::Null => {}
        Value::Array(items) if items.is_empty() => println!("  {}", "(none)".dimmed()),
        other => match serde_json::to_string_pretty(other) {
            Ok(text) => println!("{}", text),
            Err(_) => println!("{}", other),
        },
    }
}

/// Config values are JSON; anything that does not parse is taken as a string
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
