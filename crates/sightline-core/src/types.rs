use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, in image-pixel corner coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    /// Detector score in [0, 1].
    pub confidence: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> Self {
        Self { x1, y1, x2, y2, confidence }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }
}

/// Face embedding vector (model-defined length, typically 512).
///
/// Serialized as a bare array of floats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Number of dimensions.
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean (L2) distance between two embeddings.
    ///
    /// Both embeddings must have the same dimension; extra trailing values
    /// of the longer one are ignored.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Zero vectors have similarity 0 with everything.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let (a, b) = (self.normalized(), other.normalized());
        a.values.iter().zip(b.values.iter()).map(|(x, y)| x * y).sum()
    }

    /// True when every component is a finite number.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// L2 norm of the vector.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Return an L2-normalized copy. A zero vector is returned unchanged.
    pub fn normalized(&self) -> Embedding {
        let norm = self.norm();
        let values = if norm > 0.0 {
            self.values.iter().map(|x| x / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding { values }
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding::new(vec![0.3, -0.2, 0.9]);
        assert_eq!(a.euclidean_distance(&a.clone()), 0.0);
    }

    #[test]
    fn test_euclidean_distance_known_value() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
        assert!((b.euclidean_distance(&a) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_normalized_has_unit_norm() {
        let e = Embedding::new(vec![3.0, 4.0, 0.0]).normalized();
        assert!((e.norm() - 1.0).abs() < 1e-6);
        assert!((e.values[0] - 0.6).abs() < 1e-6);
        assert!((e.values[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_normalized_zero_vector_unchanged() {
        let e = Embedding::new(vec![0.0; 4]);
        assert_eq!(e.normalized(), e);
    }

    #[test]
    fn test_is_finite() {
        assert!(Embedding::new(vec![0.1, -3.0]).is_finite());
        assert!(!Embedding::new(vec![f32::NAN, 0.2]).is_finite());
        assert!(!Embedding::new(vec![0.0, f32::NEG_INFINITY]).is_finite());
    }

    #[test]
    fn test_embedding_serializes_as_array() {
        let e = Embedding::new(vec![0.5, -1.0]);
        let json = serde_json::to_string(&e).unwrap();
        assert_eq!(json, "[0.5,-1.0]");
        let back: Embedding = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn test_bounding_box_dimensions() {
        let b = BoundingBox::new(10.0, 20.0, 50.0, 80.0, 0.95);
        assert_eq!(b.width(), 40.0);
        assert_eq!(b.height(), 60.0);

        let inverted = BoundingBox::new(50.0, 20.0, 10.0, 80.0, 0.95);
        assert_eq!(inverted.width(), 0.0);
    }
}
