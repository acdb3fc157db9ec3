//! The composite similarity score between a JD and a CV.
//!
//! Pure functions, no RNG, no awaits: given the same two record pairs and
//! the same weights, the output is bit-for-bit reproducible. Padded rows
//! (zero vectors) are treated as absent everywhere.

use serde::{Deserialize, Serialize};

use crate::matcher::category::CategoryTable;
use crate::models::embeddings::{l2_norm, EmbeddingsRecord};
use crate::models::Structured;

/// Component weights. `version` participates in the match cache key so a
/// weight change never serves a stale score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchWeights {
    pub skills: f32,
    pub responsibilities: f32,
    pub title: f32,
    pub experience: f32,
    pub version: String,
}

impl Default for MatchWeights {
    fn default() -> Self {
        Self {
            skills: 0.50,
            responsibilities: 0.20,
            title: 0.20,
            experience: 0.10,
            version: "w1".to_string(),
        }
    }
}

/// Result of one match. All numbers live in [0, 100].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Score {
    pub overall: f32,
    pub skills: f32,
    pub responsibilities: f32,
    pub title: f32,
    pub experience: f32,
    pub explanations: Vec<String>,
}

/// Cosine over pre-normalized vectors, clamped to [-1, 1].
pub fn sim(u: &[f32], v: &[f32]) -> f32 {
    let dot: f32 = u.iter().zip(v.iter()).map(|(a, b)| a * b).sum();
    dot.clamp(-1.0, 1.0)
}

fn is_present(v: &[f32]) -> bool {
    l2_norm(v) > 0.0
}

/// Best-match average over present rows: for each present JD row, the max
/// similarity over present CV rows, averaged, scaled to [0, 100].
///
/// Returns `None` when the JD side has no present rows (the component drops
/// out of the composite). A JD with rows but an empty CV side scores 0.
///
/// Tie-break: among CV columns with equal similarity, the lexicographically
/// smaller CV phrase wins, which keeps explanations reproducible.
fn best_match_average(
    jd_vectors: &[Vec<f32>],
    cv_vectors: &[Vec<f32>],
    jd_phrases: &[String],
    cv_phrases: &[String],
    label: &str,
    explanations: &mut Vec<String>,
) -> Option<f32> {
    let jd_present: Vec<usize> = (0..jd_vectors.len())
        .filter(|&i| is_present(&jd_vectors[i]))
        .collect();
    if jd_present.is_empty() {
        return None;
    }
    let cv_present: Vec<usize> = (0..cv_vectors.len())
        .filter(|&j| is_present(&cv_vectors[j]))
        .collect();
    if cv_present.is_empty() {
        explanations.push(format!("{label}: CV side is empty"));
        return Some(0.0);
    }

    let mut total = 0.0_f32;
    for &i in &jd_present {
        let mut best = f32::NEG_INFINITY;
        let mut best_j = cv_present[0];
        for &j in &cv_present {
            let s = sim(&jd_vectors[i], &cv_vectors[j]);
            let wins = s > best
                || (s == best && cv_phrases[j].as_str() < cv_phrases[best_j].as_str());
            if wins {
                best = s;
                best_j = j;
            }
        }
        if best >= 0.85 {
            explanations.push(format!(
                "{label}: \"{}\" covered by \"{}\"",
                jd_phrases[i], cv_phrases[best_j]
            ));
        }
        total += best;
    }

    Some((total / jd_present.len() as f32 * 100.0).clamp(0.0, 100.0))
}

/// Title component: cosine ×100, +10 for a shared category (cap 100), −20
/// for a known-incompatible pair (floor 0). The base itself is unfloored;
/// anti-correlated titles carry their negative score into the composite.
fn title_score(
    jd: &Structured,
    cv: &Structured,
    jd_vec: &[f32],
    cv_vec: &[f32],
    categories: &CategoryTable,
    explanations: &mut Vec<String>,
) -> f32 {
    let base = if is_present(jd_vec) && is_present(cv_vec) {
        sim(jd_vec, cv_vec) * 100.0
    } else {
        0.0
    };

    let same_category = !jd.category.is_empty()
        && jd.category.eq_ignore_ascii_case(&cv.category);
    if same_category {
        explanations.push(format!("title: shared category \"{}\"", jd.category));
        return (base + 10.0).min(100.0);
    }
    if categories.incompatible(&jd.category, &cv.category) {
        explanations.push(format!(
            "title: incompatible categories \"{}\" vs \"{}\"",
            jd.category, cv.category
        ));
        return (base - 20.0).max(0.0);
    }
    base
}

/// Experience component over required years `r` (JD) and candidate years
/// `c` (CV). Over-qualification beyond +3 years decays 5 points per year,
/// capped at −30.
pub fn experience_score(r: f32, c: f32) -> f32 {
    if r <= 0.0 {
        return 100.0;
    }
    if c <= 0.0 {
        return 0.0;
    }
    if c >= r {
        100.0 - (5.0 * (c - r - 3.0).max(0.0)).min(30.0)
    } else {
        100.0 * (c / r)
    }
}

fn round1(x: f32) -> f32 {
    (x * 10.0).round() / 10.0
}

/// Computes the full composite score for a JD/CV pair.
///
/// Absent components (a JD with no present skills, for instance) drop out
/// and the remaining weights are re-normalized to sum to 1 before the
/// business rules run.
pub fn compute_score(
    jd: &Structured,
    jd_emb: &EmbeddingsRecord,
    cv: &Structured,
    cv_emb: &EmbeddingsRecord,
    weights: &MatchWeights,
    categories: &CategoryTable,
) -> Score {
    let mut explanations = Vec::new();

    let skills = best_match_average(
        &jd_emb.skill_vectors,
        &cv_emb.skill_vectors,
        &jd.skills,
        &cv.skills,
        "skills",
        &mut explanations,
    );
    let responsibilities = best_match_average(
        &jd_emb.resp_vectors,
        &cv_emb.resp_vectors,
        &jd.responsibilities,
        &cv.responsibilities,
        "responsibilities",
        &mut explanations,
    );
    let title = title_score(
        jd,
        cv,
        &jd_emb.title_vector,
        &cv_emb.title_vector,
        categories,
        &mut explanations,
    );
    let experience = experience_score(jd.years_experience, cv.years_experience);

    // Composite over present components with weight re-normalization.
    let mut weighted = 0.0_f32;
    let mut weight_sum = 0.0_f32;
    if let Some(s) = skills {
        weighted += weights.skills * s;
        weight_sum += weights.skills;
    } else {
        explanations.push("skills: JD lists none, weight re-normalized".to_string());
    }
    if let Some(r) = responsibilities {
        weighted += weights.responsibilities * r;
        weight_sum += weights.responsibilities;
    } else {
        explanations.push("responsibilities: JD lists none, weight re-normalized".to_string());
    }
    weighted += weights.title * title + weights.experience * experience;
    weight_sum += weights.title + weights.experience;

    let mut overall = round1(if weight_sum > 0.0 {
        weighted / weight_sum
    } else {
        0.0
    });

    // Business rules, post-composite.
    if !jd.job_title.is_empty() && jd.job_title.eq_ignore_ascii_case(&cv.job_title) {
        overall = (overall + 5.0).min(100.0);
        explanations.push("bonus: exact title match".to_string());
    }
    let categories_differ =
        !jd.category.eq_ignore_ascii_case(&cv.category) && !jd.category.is_empty();
    if categories_differ && title < 30.0 {
        overall = (overall - 10.0).max(0.0);
        explanations.push("penalty: category mismatch with dissimilar titles".to_string());
    }

    Score {
        overall: round1(overall.clamp(0.0, 100.0)),
        skills: skills.unwrap_or(0.0),
        responsibilities: responsibilities.unwrap_or(0.0),
        title: title.clamp(0.0, 100.0),
        experience: experience.clamp(0.0, 100.0),
        explanations,
    }
}

/// Orders bulk results: descending by overall, ties broken by the
/// lexicographically smaller CV id.
pub fn rank_bulk(results: &mut Vec<(uuid::Uuid, Score)>) {
    results.sort_by(|a, b| {
        b.1.overall
            .partial_cmp(&a.1.overall)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.to_string().cmp(&b.0.to_string()))
    });
}
