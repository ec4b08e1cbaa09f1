//! Content key and digest utilities.

use jobgraph_core::ArtifactId;
use sha2::{Digest, Sha256};

/// Hex-encoded sha256 of `data`.
pub fn content_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Backend key for one version of an artifact: `<sanitized name>/<id>`.
pub fn content_key(name: &str, id: &ArtifactId) -> String {
    format!("{}/{}", sanitize_key(name), id)
}

/// Sanitize a name for use as a single path component.
pub fn sanitize_key(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            _ => c,
        })
        .collect();
    match sanitized.as_str() {
        "" | "." | ".." => format!("_{}", sanitized),
        _ => sanitized,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_digest() {
        assert_eq!(
            content_digest(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_content_key_is_versioned() {
        let a = ArtifactId::new();
        let b = ArtifactId::new();
        assert_ne!(content_key("dist", &a), content_key("dist", &b));
        assert!(content_key("build/out", &a).starts_with("build_out/art_"));
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("my/cache/key"), "my_cache_key");
        assert_eq!(sanitize_key("cache:key"), "cache_key");
        assert_eq!(sanitize_key(".."), "_..");
    }
}
