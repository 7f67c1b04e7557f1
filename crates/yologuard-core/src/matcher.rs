//! Probe-vs-gallery matching.
//!
//! A full linear scan over every enrolled embedding. Galleries hold hundreds
//! of persons, so no index is kept.

use crate::gallery::GallerySnapshot;
use crate::types::{Embedding, MatchResult, PersonId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// How two embeddings are compared. Higher is always more similar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityMetric {
    /// Cosine similarity in [-1, 1].
    #[default]
    Cosine,
    /// `1 / (1 + L2 distance)`, in (0, 1].
    Euclidean,
}

impl SimilarityMetric {
    pub fn similarity(self, a: &Embedding, b: &Embedding) -> f32 {
        match self {
            SimilarityMetric::Cosine => a.cosine_similarity(b),
            SimilarityMetric::Euclidean => 1.0 / (1.0 + a.euclidean_distance(b)),
        }
    }

    /// Lowest value the metric can produce.
    pub fn floor(self) -> f32 {
        match self {
            SimilarityMetric::Cosine => -1.0,
            SimilarityMetric::Euclidean => 0.0,
        }
    }
}

impl fmt::Display for SimilarityMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimilarityMetric::Cosine => f.write_str("cosine"),
            SimilarityMetric::Euclidean => f.write_str("euclidean"),
        }
    }
}

impl FromStr for SimilarityMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" => Ok(SimilarityMetric::Cosine),
            "euclidean" | "l2" => Ok(SimilarityMetric::Euclidean),
            other => Err(format!("unknown similarity metric '{other}'")),
        }
    }
}

pub trait Matcher: Send + Sync {
    /// Best candidate for `probe`, or "unknown" when the best similarity is
    /// below `threshold`.
    fn compare(&self, probe: &Embedding, snapshot: &GallerySnapshot, threshold: f32)
        -> MatchResult;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GalleryMatcher {
    metric: SimilarityMetric,
}

impl GalleryMatcher {
    pub fn new(metric: SimilarityMetric) -> Self {
        Self { metric }
    }

    pub fn metric(&self) -> SimilarityMetric {
        self.metric
    }
}

struct Best {
    similarity: f32,
    person: PersonId,
    evidence: usize,
}

impl Best {
    /// Equal similarity goes to the person with more embeddings, then the
    /// lower id.
    fn beats(&self, other: &Best) -> bool {
        match self.similarity.total_cmp(&other.similarity) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => match self.evidence.cmp(&other.evidence) {
                Ordering::Greater => true,
                Ordering::Less => false,
                Ordering::Equal => self.person < other.person,
            },
        }
    }
}

impl Matcher for GalleryMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        snapshot: &GallerySnapshot,
        threshold: f32,
    ) -> MatchResult {
        if probe.dimension() != snapshot.dimension() {
            tracing::warn!(
                probe = probe.dimension(),
                gallery = snapshot.dimension(),
                "probe dimension does not match gallery"
            );
            return MatchResult::unknown(self.metric.floor());
        }

        let mut best: Option<Best> = None;
        for (person, enrolled) in snapshot.all_embeddings() {
            let candidate = Best {
                similarity: self.metric.similarity(probe, enrolled),
                person,
                evidence: snapshot.embedding_count(person),
            };
            if best.as_ref().map_or(true, |b| candidate.beats(b)) {
                best = Some(candidate);
            }
        }

        let Some(best) = best else {
            return MatchResult::unknown(self.metric.floor());
        };

        if best.similarity >= threshold {
            MatchResult {
                similarity: best.similarity,
                person_id: Some(best.person),
                person_name: snapshot.get(best.person).map(|p| p.person.name.clone()),
            }
        } else {
            MatchResult::unknown(best.similarity)
        }
    }
}
