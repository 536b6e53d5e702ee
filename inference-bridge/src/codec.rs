//! Conversion between raw image bytes, wire messages and predictions

use bytes::Bytes;
use serde::Serialize;
use std::fmt;

use crate::proto::{InceptionRequest, InceptionResponse};

/// Raw image bytes wrapped for a single classify call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationRequest {
    pub image: Bytes,
}

impl From<ClassificationRequest> for InceptionRequest {
    fn from(request: ClassificationRequest) -> Self {
        Self {
            jpeg_encoded: request.image,
        }
    }
}

/// Parallel label/score lists as ranked by the remote service
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClassificationResponse {
    pub labels: Vec<String>,
    pub scores: Vec<f32>,
}

impl From<InceptionResponse> for ClassificationResponse {
    fn from(response: InceptionResponse) -> Self {
        Self {
            labels: response.classes,
            scores: response.scores,
        }
    }
}

/// One ranked (label, confidence) pair
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelScore {
    pub label: String,
    pub confidence: f64,
}

/// Ordered predictions for one image, in the service's own ranking
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct Prediction(Vec<LabelScore>);

impl Prediction {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LabelScore> {
        self.0.iter()
    }

    /// Highest ranked pair, if any
    pub fn top(&self) -> Option<&LabelScore> {
        self.0.first()
    }
}

impl<'a> IntoIterator for &'a Prediction {
    type Item = &'a LabelScore;
    type IntoIter = std::slice::Iter<'a, LabelScore>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Renders as `[cat=0.9100, dog=0.0500]`
impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, pair) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={:.4}", pair.label, pair.confidence)?;
        }
        f.write_str("]")
    }
}

/// Wrap raw image bytes for the wire. No validation, resizing or
/// compression; the remote service rejects malformed images itself.
pub fn encode_request(image: impl Into<Bytes>) -> ClassificationRequest {
    ClassificationRequest {
        image: image.into(),
    }
}

/// Pair `labels[i]` with `scores[i]` up to the shorter list.
///
/// Unmatched trailing entries of the longer list are dropped without error.
pub fn decode_response(response: ClassificationResponse) -> Prediction {
    let pairs = response
        .labels
        .into_iter()
        .zip(response.scores)
        .map(|(label, score)| LabelScore {
            label,
            confidence: f64::from(score),
        })
        .collect();
    Prediction(pairs)
}
