use serde_json::{Value, json};

use crate::CliError;

pub fn print_success(json_mode: bool, payload: &Value) {
    if json_mode {
        println!("{}", success_envelope(payload));
        return;
    }

    if let Some(message) = payload.as_str() {
        if !message.is_empty() {
            println!("{message}");
        }
        return;
    }

    match serde_json::to_string_pretty(payload) {
        Ok(rendered) => println!("{rendered}"),
        Err(_) => println!("{payload}"),
    }
}

pub fn print_error(json_mode: bool, err: &CliError) {
    if json_mode {
        eprintln!("{}", error_envelope(err));
        return;
    }

    eprintln!("error: {err}");
}

fn success_envelope(payload: &Value) -> Value {
    json!({
        "ok": true,
        "result": payload,
    })
}

fn error_envelope(err: &CliError) -> Value {
    let kind = match err {
        CliError::Usage(_) => "usage",
        CliError::Store(_) => "store",
        CliError::NotFound(_) => "not_found",
        CliError::Timeout(_) => "timeout",
    };
    json!({
        "ok": false,
        "error": {
            "kind": kind,
            "message": err.to_string(),
            "code": err.exit_code(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelopes_are_stable() {
        assert_eq!(
            success_envelope(&json!({ "id": 1 })),
            json!({ "ok": true, "result": { "id": 1 } })
        );
        assert_eq!(
            error_envelope(&CliError::Timeout("still running".into())),
            json!({
                "ok": false,
                "error": { "kind": "timeout", "message": "still running", "code": 5 }
            })
        );
    }
}
