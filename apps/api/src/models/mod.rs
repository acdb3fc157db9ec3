pub mod document;
pub mod embeddings;
pub mod posting;

pub use document::{Document, DocumentKind, MaskedPii, Source, Structured};
pub use embeddings::EmbeddingsRecord;
pub use posting::{Application, ApplicationRef, JobPosting, SubjectCode};

/// Sentinel filler used to keep `skills` at 20 and `responsibilities` at 10.
/// Pad entries embed to the zero vector and never contribute to a match.
pub const PAD_SENTINEL: &str = "__PAD__";

/// Fixed dimensionality of every stored vector.
pub const EMBEDDING_DIM: usize = 768;

/// Fixed cardinality of the skills list after normalization.
pub const SKILL_SLOTS: usize = 20;

/// Fixed cardinality of the responsibilities list after normalization.
pub const RESP_SLOTS: usize = 10;

/// Maximum byte length of a single skill phrase or responsibility sentence.
pub const MAX_PHRASE_BYTES: usize = 256;
