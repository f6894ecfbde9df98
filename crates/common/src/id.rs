//! ID generation for locally minted IRIs.

use ulid::Ulid;
use url::Url;

use crate::{AppError, AppResult};

/// Mints new object and activity IRIs under an instance base URL.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    base: Url,
}

impl IdGenerator {
    /// Create a generator rooted at `base` (e.g. `https://example.com`).
    #[must_use]
    pub const fn new(base: Url) -> Self {
        Self { base }
    }

    /// Generate a new ULID-based identifier.
    ///
    /// ULIDs sort lexicographically by creation time, which keeps minted
    /// IRIs roughly ordered when listed.
    #[must_use]
    pub fn generate(&self) -> String {
        Ulid::new().to_string().to_lowercase()
    }

    /// Mint `{base}/{kind}/{ulid}`, where `kind` is a lowercased type name.
    pub fn iri(&self, kind: &str) -> AppResult<Url> {
        let segment = if kind.is_empty() {
            "objects".to_string()
        } else {
            kind.to_lowercase()
        };
        self.base
            .join(&format!("/{segment}/{}", self.generate()))
            .map_err(|e| AppError::Internal(format!("Failed to mint IRI: {e}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_ulid() {
        let id_gen = IdGenerator::new(Url::parse("https://example.com").unwrap());
        let id1 = id_gen.generate();
        let id2 = id_gen.generate();

        assert_eq!(id1.len(), 26);
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_iri_uses_kind_segment() {
        let id_gen = IdGenerator::new(Url::parse("https://example.com").unwrap());
        let iri = id_gen.iri("Note").unwrap();

        assert_eq!(iri.host_str(), Some("example.com"));
        assert!(iri.path().starts_with("/note/"));
    }

    #[test]
    fn test_iri_without_kind() {
        let id_gen = IdGenerator::new(Url::parse("https://example.com").unwrap());
        assert!(id_gen.iri("").unwrap().path().starts_with("/objects/"));
    }
}
