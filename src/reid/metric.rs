use serde::{Deserialize, Serialize};

/// Metric a vector set is ranked by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityMetric {
    Cosine,
    L2,
    #[serde(alias = "ip")]
    InnerProduct,
}

impl SimilarityMetric {
    /// Distance between two vectors; smaller is closer for every metric.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f64 {
        match self {
            Self::Cosine => {
                let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
                for (x, y) in a.iter().zip(b) {
                    let (x, y) = (*x as f64, *y as f64);
                    dot += x * y;
                    na += x * x;
                    nb += y * y;
                }
                if na == 0.0 || nb == 0.0 {
                    return 1.0;
                }
                1.0 - dot / (na.sqrt() * nb.sqrt())
            }
            Self::L2 => a
                .iter()
                .zip(b)
                .map(|(x, y)| (*x as f64 - *y as f64).powi(2))
                .sum::<f64>()
                .sqrt(),
            Self::InnerProduct => -a
                .iter()
                .zip(b)
                .map(|(x, y)| *x as f64 * *y as f64)
                .sum::<f64>(),
        }
    }

    /// Map a distance onto a similarity score where larger is more alike.
    pub fn similarity(&self, distance: f64) -> f64 {
        match self {
            Self::Cosine => 1.0 - distance,
            Self::L2 => 1.0 / (1.0 + distance.max(0.0)),
            Self::InnerProduct => -distance,
        }
    }

    /// Name used by the external descriptor-set protocol.
    pub fn protocol_name(&self) -> &'static str {
        match self {
            Self::Cosine => "COSINE",
            Self::L2 => "L2",
            Self::InnerProduct => "IP",
        }
    }

    pub fn from_protocol_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "COSINE" => Some(Self::Cosine),
            "L2" => Some(Self::L2),
            "IP" => Some(Self::InnerProduct),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_cosine() {
        let m = SimilarityMetric::Cosine;
        assert_abs_diff_eq!(m.distance(&[1.0, 0.0], &[2.0, 0.0]), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(m.distance(&[1.0, 0.0], &[0.0, 1.0]), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(m.similarity(0.25), 0.75);
    }

    #[test]
    fn test_l2() {
        let m = SimilarityMetric::L2;
        assert_abs_diff_eq!(m.distance(&[0.0, 0.0], &[3.0, 4.0]), 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(m.similarity(0.0), 1.0);
        assert_abs_diff_eq!(m.similarity(1.0), 0.5);
    }

    #[test]
    fn test_names() {
        for m in [
            SimilarityMetric::Cosine,
            SimilarityMetric::L2,
            SimilarityMetric::InnerProduct,
        ] {
            assert_eq!(SimilarityMetric::from_protocol_name(m.protocol_name()), Some(m));
        }
        let m: SimilarityMetric = serde_json::from_str("\"ip\"").unwrap();
        assert_eq!(m, SimilarityMetric::InnerProduct);
    }
}
