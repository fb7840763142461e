//! Canonical JSON signing input.
//!
//! Every signature in the protocol covers the canonical form of the signed
//! object: keys sorted lexicographically, UTF-8, no whitespace, and the `sig`
//! field stripped. A message round-tripped through parse + serialize yields
//! byte-identical signing input.

use serde_json::Value;

use crate::error::{Error, Result};

/// Field stripped from signing input on every signed object.
pub const SIG_FIELD: &str = "sig";

/// Canonicalize a JSON value: sorted keys, no whitespace.
pub fn canonicalize(value: &Value) -> Result<String> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

/// Canonical bytes of `value` with the top-level `sig` field removed.
///
/// This is the exact byte sequence signatures are produced over and verified
/// against, for frames, invite tokens, and key-rotation records alike.
pub fn signing_bytes(value: &Value) -> Result<Vec<u8>> {
    let mut unsigned = value.clone();
    if let Some(obj) = unsigned.as_object_mut() {
        obj.remove(SIG_FIELD);
    }
    Ok(canonicalize(&unsigned)?.into_bytes())
}

fn write_canonical(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();

            out.push('{');
            for (idx, key) in keys.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push('"');
                escape_into(key, out);
                out.push_str("\":");
                write_canonical(&map[key.as_str()], out)?;
            }
            out.push('}');
            Ok(())
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
            Ok(())
        }
        Value::String(s) => {
            out.push('"');
            escape_into(s, out);
            out.push('"');
            Ok(())
        }
        Value::Number(n) => write_number(n, out),
        Value::Bool(b) => {
            out.push_str(if *b { "true" } else { "false" });
            Ok(())
        }
        Value::Null => {
            out.push_str("null");
            Ok(())
        }
    }
}

/// Wire values are integers throughout; floats take ryu's shortest
/// round-trip form so re-parsing yields the same bytes.
fn write_number(n: &serde_json::Number, out: &mut String) -> Result<()> {
    if let Some(i) = n.as_i64() {
        out.push_str(&i.to_string());
        return Ok(());
    }
    if let Some(u) = n.as_u64() {
        out.push_str(&u.to_string());
        return Ok(());
    }
    match n.as_f64() {
        Some(f) if f.is_finite() => {
            let mut buf = ryu::Buffer::new();
            out.push_str(buf.format_finite(f));
            Ok(())
        }
        _ => Err(Error::JsonError("non-finite number in signing input".into())),
    }
}

fn escape_into(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys_without_whitespace() {
        let value = json!({"z": 1, "a": 2, "m": [1, 2]});
        assert_eq!(canonicalize(&value).unwrap(), r#"{"a":2,"m":[1,2],"z":1}"#);
    }

    #[test]
    fn nested_objects_sorted_recursively() {
        let value = json!({"outer": {"b": 1, "a": 2}});
        assert_eq!(
            canonicalize(&value).unwrap(),
            r#"{"outer":{"a":2,"b":1}}"#
        );
    }

    #[test]
    fn escapes_controls_and_quotes() {
        let value = json!({"q": "\"", "bs": "\\", "nl": "\n", "ctl": "\u{000f}"});
        assert_eq!(
            canonicalize(&value).unwrap(),
            r#"{"bs":"\\","ctl":"\u000f","nl":"\n","q":"\""}"#
        );
    }

    #[test]
    fn signing_bytes_strips_sig() {
        let signed = json!({"type": "hello", "sig": "deadbeef", "v": 2});
        let unsigned = json!({"type": "hello", "v": 2});
        assert_eq!(
            signing_bytes(&signed).unwrap(),
            canonicalize(&unsigned).unwrap().into_bytes()
        );
    }

    #[test]
    fn round_trip_is_byte_identical() {
        let value = json!({
            "v": 2,
            "type": "inject",
            "from": "ab12",
            "ts": 1722550000123i64,
            "sessions": ["dev", "*"],
            "nested": {"b": false, "a": null},
        });

        let first = canonicalize(&value).unwrap();
        let reparsed: serde_json::Value = serde_json::from_str(&first).unwrap();
        let second = canonicalize(&reparsed).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn large_integers_stay_exact() {
        let value = json!({"ts": 1722550000123i64, "big": u64::MAX});
        assert_eq!(
            canonicalize(&value).unwrap(),
            format!(r#"{{"big":{},"ts":1722550000123}}"#, u64::MAX)
        );
    }

    #[test]
    fn floats_round_trip() {
        let value = json!({"x": 1.5});
        let first = canonicalize(&value).unwrap();
        let reparsed: serde_json::Value = serde_json::from_str(&first).unwrap();
        assert_eq!(first, canonicalize(&reparsed).unwrap());
    }
}
