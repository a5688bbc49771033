//! GATT UUID comparison.

/// Canonical comparison form: uppercase, hyphens stripped.
pub fn normalize_uuid(uuid: &str) -> String {
    uuid.trim()
        .chars()
        .filter(|c| *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Case- and hyphen-insensitive UUID equality.
pub fn uuids_match(a: &str, b: &str) -> bool {
    normalize_uuid(a) == normalize_uuid(b)
}
