use sha1::{Digest, Sha1};

/// Trims entries and drops the empty ones; the result feeds the identity
/// digest.
pub fn normalize_entries(entries: &[String]) -> Vec<String> {
    entries
        .iter()
        .map(|e| e.trim())
        .filter(|e| !e.is_empty())
        .map(|e| e.to_string())
        .collect()
}

/// Derives the stable run identity from normalized configuration and payload
/// entries. Both lists are sorted before hashing so equivalent configurations
/// produce identical identities regardless of entry order.
pub fn compute_identity(config_entries: &[String], payload_entries: &[String]) -> String {
    let mut config = normalize_entries(config_entries);
    let mut payloads = normalize_entries(payload_entries);
    config.sort();
    payloads.sort();

    let mut hasher = Sha1::new();
    for entry in &config {
        hasher.update(entry.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(b"--payloads--\n");
    for entry in &payloads {
        hasher.update(entry.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// An explicit run id overrides the computed digest.
pub fn resolve_identity(
    override_id: Option<&str>,
    config_entries: &[String],
    payload_entries: &[String],
) -> String {
    if let Some(id) = override_id.map(|id| id.trim()).filter(|id| !id.is_empty()) {
        return id.to_string();
    }
    compute_identity(config_entries, payload_entries)
}
