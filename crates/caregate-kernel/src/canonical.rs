use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

pub const STRIPPED_FIELDS: [&str; 2] = ["consent_token", "idempotency_key"];

const TOKEN_DIGEST_LEN: usize = 16;

pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.trim().to_string()),
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, item) in map {
                out.insert(key.clone(), canonicalize(item));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

pub fn sanitize_params(params: &Value) -> Value {
    match params {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, item) in map {
                if STRIPPED_FIELDS.contains(&key.as_str()) {
                    continue;
                }
                out.insert(key.clone(), item.clone());
            }
            Value::Object(out)
        }
        Value::Null => Value::Object(Map::new()),
        other => other.clone(),
    }
}

pub fn payload_hash(params: &Value) -> Result<String, String> {
    jcs_sha256_hex(&canonicalize(&sanitize_params(params)))
}

pub fn jcs_sha256_hex(value: &Value) -> Result<String, String> {
    let canonical = serde_jcs::to_string(value)
        .map_err(|err| format!("failed to canonicalize JSON via JCS: {err}"))?;
    Ok(sha256_hex(canonical.as_bytes()))
}

pub fn target_ref(tool_name: &str, params: &Value) -> String {
    match tool_name {
        "appointment_book" => format!(
            "{}|{}",
            first_string_field(params, &["provider_id", "provider_name"]),
            first_string_field(params, &["slot_datetime"])
        ),
        "medication_refill_request" => format!(
            "{}|{}",
            first_string_field(params, &["medication_id"]),
            first_string_field(params, &["pharmacy_target"])
        ),
        other => other.to_string(),
    }
}

pub fn idempotency_key(user_id: &str, tool_name: &str, params: &Value) -> Result<String, String> {
    let hash = payload_hash(params)?;
    let target = target_ref(tool_name, params);
    Ok(sha256_hex(
        format!("{user_id}|{tool_name}|{target}|{hash}").as_bytes(),
    ))
}

pub fn token_digest(token: &str) -> String {
    let full = sha256_hex(token.as_bytes());
    full[..TOKEN_DIGEST_LEN].to_string()
}

fn first_string_field(params: &Value, keys: &[&str]) -> String {
    for key in keys {
        if let Some(raw) = params.get(key).and_then(|v| v.as_str()) {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    String::new()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
