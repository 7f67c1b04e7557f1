use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Bounding box for a detected region, with optional facial landmarks.
///
/// Coordinates are always in the pixel space of the frame the detection
/// came from, whatever resolution the model ran at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another box, 0.0 when disjoint or degenerate.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;

        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Shift the box (and its landmarks) by an offset, used when a region
    /// found inside a sub-image is mapped back to the full frame.
    pub fn translated(&self, dx: f32, dy: f32) -> BoundingBox {
        BoundingBox {
            x: self.x + dx,
            y: self.y + dy,
            landmarks: self
                .landmarks
                .map(|lms| lms.map(|(lx, ly)| (lx + dx, ly + dy))),
            ..self.clone()
        }
    }
}

/// Face embedding vector. The length is fixed by the recognition model
/// (512 for ArcFace w600k_r50) and is the same across a gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }

    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Return an L2-normalized copy. Zero vectors are returned unchanged.
    pub fn normalized(values: Vec<f32>) -> Vec<f32> {
        let norm: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            values.into_iter().map(|x| x / norm).collect()
        } else {
            values
        }
    }
}

/// Enrolled person identifier (student / staff code).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersonId(pub u64);

impl fmt::Display for PersonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Organizational data captured at registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonMetadata {
    pub faculty: String,
    pub program: String,
    /// Student, professor, administrative staff, ...
    pub role: String,
    pub access_type: String,
    pub campus: String,
    pub extension: String,
    pub semester: String,
}

/// Identity record owned by the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: PersonId,
    pub name: String,
    #[serde(default)]
    pub metadata: PersonMetadata,
    pub registered_at: DateTime<Utc>,
}

impl Person {
    pub fn new(id: PersonId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            metadata: PersonMetadata::default(),
            registered_at: Utc::now(),
        }
    }
}

/// A person together with its enrollment embeddings, in capture order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledPerson {
    pub person: Person,
    pub embeddings: Vec<Embedding>,
}

/// Result of one detector pass for one region. Lives for a single cycle.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub frame_sequence: u64,
    pub captured_at: Instant,
}

/// Result of matching a probe embedding against a gallery snapshot.
///
/// Carries no geometry; the tracker's `Observation` pairs it with the
/// detection it was computed for.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Similarity of the best candidate, in the active metric's range.
    pub similarity: f32,
    /// Matched person, `None` for "unknown".
    pub person_id: Option<PersonId>,
    pub person_name: Option<String>,
}

impl MatchResult {
    pub fn unknown(similarity: f32) -> Self {
        Self {
            similarity,
            person_id: None,
            person_name: None,
        }
    }

    pub fn is_match(&self) -> bool {
        self.person_id.is_some()
    }

    /// Display confidence in percent, similarity clamped to [0, 1].
    pub fn confidence_pct(&self) -> f32 {
        self.similarity.clamp(0.0, 1.0) * 100.0
    }
}

/// Durable record of one access. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessEvent {
    pub id: uuid::Uuid,
    /// `None` marks an unknown person.
    pub person_id: Option<PersonId>,
    pub person_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub similarity: f32,
    pub confidence_pct: f32,
    /// Camera / site identifier.
    pub site: String,
    pub track_id: u64,
}
