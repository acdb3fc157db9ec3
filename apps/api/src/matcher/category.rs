//! Category compatibility: a small static table of known-incompatible
//! category pairs, overridable from configuration.

use std::collections::HashSet;

use crate::errors::AppError;

/// Symmetric, case-insensitive set of incompatible category pairs.
#[derive(Debug, Clone)]
pub struct CategoryTable {
    pairs: HashSet<(String, String)>,
}

impl CategoryTable {
    /// Default incompatibilities. Deliberately short: the penalty is harsh,
    /// so only pairings with no plausible transfer belong here.
    pub fn default_table() -> Self {
        Self::from_pairs(vec![
            ("Software Engineering".into(), "Logistics".into()),
            ("Software Engineering".into(), "Hospitality".into()),
            ("Finance".into(), "Healthcare".into()),
            ("Legal".into(), "Construction".into()),
            ("Sales".into(), "Research".into()),
        ])
    }

    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let mut set = HashSet::new();
        for (a, b) in pairs {
            set.insert(normalize_pair(&a, &b));
        }
        Self { pairs: set }
    }

    /// Parses the `CATEGORY_INCOMPATIBLE` override: a JSON array of
    /// two-element arrays, e.g. `[["Finance","Art"]]`.
    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        let pairs: Vec<(String, String)> = serde_json::from_str(raw)
            .map_err(|e| AppError::Config(format!("CATEGORY_INCOMPATIBLE is not valid: {e}")))?;
        Ok(Self::from_pairs(pairs))
    }

    pub fn incompatible(&self, a: &str, b: &str) -> bool {
        self.pairs.contains(&normalize_pair(a, b))
    }
}

fn normalize_pair(a: &str, b: &str) -> (String, String) {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
