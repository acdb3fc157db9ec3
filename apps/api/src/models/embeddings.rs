//! The per-document vector bundle: 32 vectors of 768 dims, written and read
//! as one unit. Serialized as little-endian float32 for the store payload.

use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::models::{EMBEDDING_DIM, RESP_SLOTS, SKILL_SLOTS};

/// Total vectors per record: 20 skills + 10 responsibilities + title + experience.
pub const VECTORS_PER_DOC: usize = SKILL_SLOTS + RESP_SLOTS + 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingsRecord {
    pub skill_vectors: Vec<Vec<f32>>,
    pub resp_vectors: Vec<Vec<f32>>,
    pub title_vector: Vec<f32>,
    pub experience_vector: Vec<f32>,
    /// Recorded with the vectors so a model swap invalidates stale records.
    pub embedding_model_id: String,
}

impl EmbeddingsRecord {
    /// Checks the shape invariant: exactly 32 vectors of 768 dims, each
    /// L2-normalized (norm within [0.99, 1.01]) or all-zero (a pad slot).
    pub fn validate(&self) -> Result<(), AppError> {
        if self.skill_vectors.len() != SKILL_SLOTS {
            return Err(AppError::Invariant(format!(
                "skill vectors {} != {SKILL_SLOTS}",
                self.skill_vectors.len()
            )));
        }
        if self.resp_vectors.len() != RESP_SLOTS {
            return Err(AppError::Invariant(format!(
                "responsibility vectors {} != {RESP_SLOTS}",
                self.resp_vectors.len()
            )));
        }
        for v in self.iter_all() {
            if v.len() != EMBEDDING_DIM {
                return Err(AppError::DimMismatch {
                    expected: EMBEDDING_DIM,
                    got: v.len(),
                });
            }
            let norm = l2_norm(v);
            if norm != 0.0 && !(0.99..=1.01).contains(&norm) {
                return Err(AppError::Invariant(format!(
                    "vector norm {norm} outside [0.99, 1.01]"
                )));
            }
        }
        Ok(())
    }

    fn iter_all(&self) -> impl Iterator<Item = &Vec<f32>> {
        self.skill_vectors
            .iter()
            .chain(self.resp_vectors.iter())
            .chain(std::iter::once(&self.title_vector))
            .chain(std::iter::once(&self.experience_vector))
    }

    /// Serializes all 32 vectors as a contiguous little-endian f32 blob in
    /// fixed order: skills, responsibilities, title, experience.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(VECTORS_PER_DOC * EMBEDDING_DIM * 4);
        for v in self.iter_all() {
            for x in v {
                out.extend_from_slice(&x.to_le_bytes());
            }
        }
        out
    }

    /// Inverse of [`to_le_bytes`]. Fails on any length that is not exactly
    /// 32 × 768 × 4 bytes.
    pub fn from_le_bytes(bytes: &[u8], embedding_model_id: String) -> Result<Self, AppError> {
        let expected = VECTORS_PER_DOC * EMBEDDING_DIM * 4;
        if bytes.len() != expected {
            return Err(AppError::Invariant(format!(
                "embeddings payload is {} bytes, expected {expected}",
                bytes.len()
            )));
        }
        let mut floats = Vec::with_capacity(VECTORS_PER_DOC * EMBEDDING_DIM);
        for chunk in bytes.chunks_exact(4) {
            floats.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        let mut rows = floats.chunks_exact(EMBEDDING_DIM).map(|c| c.to_vec());
        let skill_vectors: Vec<Vec<f32>> = rows.by_ref().take(SKILL_SLOTS).collect();
        let resp_vectors: Vec<Vec<f32>> = rows.by_ref().take(RESP_SLOTS).collect();
        let title_vector = rows.next().expect("title row present by length check");
        let experience_vector = rows.next().expect("experience row present by length check");
        Ok(Self {
            skill_vectors,
            resp_vectors,
            title_vector,
            experience_vector,
            embedding_model_id,
        })
    }
}

/// L2 norm of a vector. Zero norm marks a pad slot.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Normalizes `v` in place to unit length. Zero vectors are left untouched
/// so pad slots stay zero.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = l2_norm(v);
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}
