use std::fmt;

use serde::{Deserialize, Serialize};

/// Commit id of the first version of every dataset.
pub const FIRST_COMMIT_ID: &str = "firstdbf9474d461a19e9333c2fd19b46115348f";

/// Identifier of an immutable version snapshot.
///
/// Every commit-scoped structure (tensor meta, encoders, chunk sets) is keyed
/// by the commit id, so two commits never share an in-memory object.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitId(String);

impl CommitId {
    /// Fresh random commit id (UUID v7, simple hex form).
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7().simple().to_string())
    }

    pub fn first() -> Self {
        Self(FIRST_COMMIT_ID.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CommitId {
    fn default() -> Self {
        Self::first()
    }
}

impl From<&str> for CommitId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CommitId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Debug for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitId({})", self.0)
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_ids_are_unique() {
        assert_ne!(CommitId::new(), CommitId::new());
        assert_eq!(CommitId::new().as_str().len(), 32);
    }

    #[test]
    fn default_is_first_commit() {
        assert_eq!(CommitId::default().as_str(), FIRST_COMMIT_ID);
    }
}
