use serde::{ser::SerializeMap, Serialize, Serializer};

use crate::labels::ClassLabels;
use crate::model::InferenceError;

/// What to do with raw model scores before they are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputActivation {
    /// Scores are already a probability distribution.
    #[default]
    None,
    Softmax,
}

impl OutputActivation {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "softmax" => Some(Self::Softmax),
            _ => None,
        }
    }

    pub fn apply(self, scores: Vec<f32>) -> Vec<f32> {
        match self {
            Self::None => scores,
            Self::Softmax => softmax(scores),
        }
    }
}

fn softmax(mut scores: Vec<f32>) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for s in scores.iter_mut() {
        *s = (*s - max).exp();
        sum += *s;
    }
    if sum > 0.0 {
        scores.iter_mut().for_each(|s| *s /= sum);
    }
    scores
}

/// Label to percentage, serialized as a JSON object in label order.
#[derive(Debug, Clone, PartialEq)]
pub struct Probabilities(Vec<(String, f64)>);

impl Probabilities {
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(label, p)| (label.as_str(), *p))
    }
}

impl Serialize for Probabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (label, p) in &self.0 {
            map.serialize_entry(label, p)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub result: String,
    pub confidence: f64,
    pub all_probabilities: Probabilities,
}

/// Arg-max over the scores (first index wins ties), confidence scaled to a
/// percentage and rounded to two decimals.
pub fn format_prediction(scores: &[f32], labels: &ClassLabels) -> Result<Prediction, InferenceError> {
    if scores.len() != labels.len() {
        return Err(InferenceError::LabelMismatch {
            outputs: scores.len(),
            labels: labels.len(),
        });
    }

    if scores.iter().any(|score| !score.is_finite()) {
        return Err(InferenceError::Runtime(
            "model produced non-finite scores".to_string(),
        ));
    }

    let mut best = 0;
    for (i, score) in scores.iter().enumerate() {
        if *score > scores[best] {
            best = i;
        }
    }

    let result = labels
        .get(best)
        .map(|l| l.name.clone())
        .ok_or(InferenceError::EmptyOutput)?;
    let confidence = round2(scores[best] as f64 * 100.0);

    let all_probabilities = Probabilities(
        labels
            .iter()
            .zip(scores)
            .map(|(label, score)| (label.name.clone(), *score as f64 * 100.0))
            .collect(),
    );

    Ok(Prediction {
        result,
        confidence,
        all_probabilities,
    })
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
