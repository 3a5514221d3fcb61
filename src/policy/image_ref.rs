//! Image reference parsing.
//!
//! References look like `registry.host/path/name[:tag][@sha256:<hex>]`. Only
//! the pieces the admission policy needs are extracted; no attempt is made to
//! validate the full OCI grammar.

/// Prefix every accepted digest carries.
pub const SHA256_PREFIX: &str = "sha256:";

/// Registry host of `image_ref`: everything before the first `/`, ignoring
/// any `@digest` suffix. `None` when the reference is blank or has no
/// registry segment.
pub fn registry_of(image_ref: &str) -> Option<&str> {
    if image_ref.trim().is_empty() {
        return None;
    }
    let name = strip_digest(image_ref);
    match name.split_once('/') {
        Some((registry, _)) if !registry.is_empty() => Some(registry),
        _ => None,
    }
}

/// Digest embedded in the reference (`sha256:...`), if any.
pub fn embedded_digest(image_ref: &str) -> Option<&str> {
    image_ref
        .find("@sha256:")
        .map(|at| &image_ref[at + 1..])
}

/// Rewrite `image_ref` to address `digest`, dropping any tag or prior digest.
pub fn pin(image_ref: &str, digest: &str) -> String {
    let repository = repository_of(image_ref);
    format!("{repository}@{digest}")
}

/// Repository path (registry + path) without tag or digest.
pub fn repository_of(image_ref: &str) -> &str {
    let name = strip_digest(image_ref);
    let last_slash = name.rfind('/');
    match name.rfind(':') {
        // A colon before the last slash is a registry port, not a tag.
        Some(colon) if last_slash.is_none_or(|slash| colon > slash) => &name[..colon],
        _ => name,
    }
}

fn strip_digest(image_ref: &str) -> &str {
    image_ref
        .split_once('@')
        .map_or(image_ref, |(name, _)| name)
}
