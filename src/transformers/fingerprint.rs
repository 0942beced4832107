use crate::models::{Cadence, DataPoint};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

const ARRAY_SAMPLE: usize = 50;

/// Structural shape of a JSON value. Values are ignored; only keys, nesting and scalar
/// types matter. `Unknown` stands for a null or an array with no elements, which says
/// nothing about the type the source would send once data is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "of", rename_all = "lowercase")]
pub enum Shape {
    Unknown,
    Bool,
    Number,
    String,
    Array(Box<Shape>),
    Object(BTreeMap<String, Shape>),
    Mixed(BTreeSet<String>),
}

impl Shape {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Shape::Unknown,
            Value::Bool(_) => Shape::Bool,
            Value::Number(_) => Shape::Number,
            Value::String(_) => Shape::String,
            Value::Array(items) => Shape::Array(Box::new(
                items
                    .iter()
                    .take(ARRAY_SAMPLE)
                    .map(Shape::of)
                    .fold(Shape::Unknown, Shape::merge),
            )),
            Value::Object(map) => Shape::Object(map.iter().map(|(key, inner)| (key.clone(), Shape::of(inner))).collect()),
        }
    }

    /// Least shape describing both inputs. Object keys are unioned so optional fields
    /// do not split array elements apart.
    pub fn merge(self, other: Shape) -> Shape {
        match (self, other) {
            (Shape::Unknown, shape) | (shape, Shape::Unknown) => shape,
            (Shape::Array(left), Shape::Array(right)) => Shape::Array(Box::new(left.merge(*right))),
            (Shape::Object(mut left), Shape::Object(right)) => {
                for (key, shape) in right {
                    let merged = match left.remove(&key) {
                        Some(existing) => existing.merge(shape),
                        None => shape,
                    };
                    left.insert(key, merged);
                }
                Shape::Object(left)
            }
            (left, right) if left == right => left,
            (left, right) => {
                let mut kinds = left.kinds();
                kinds.extend(right.kinds());
                Shape::Mixed(kinds)
            }
        }
    }

    /// True when every value described by `incoming` is also described by `self`.
    /// Missing keys and unknown leaves in `incoming` are accepted.
    pub fn covers(&self, incoming: &Shape) -> bool {
        match (self, incoming) {
            (_, Shape::Unknown) => true,
            (Shape::Unknown, _) => false,
            (Shape::Array(known), Shape::Array(seen)) => known.covers(seen),
            (Shape::Object(known), Shape::Object(seen)) => seen
                .iter()
                .all(|(key, shape)| known.get(key).is_some_and(|known| known.covers(shape))),
            (Shape::Mixed(known), seen) => seen.kinds().is_subset(known),
            (known, seen) => known == seen,
        }
    }

    fn kinds(&self) -> BTreeSet<String> {
        let kind = match self {
            Shape::Mixed(kinds) => return kinds.clone(),
            Shape::Unknown => "unknown",
            Shape::Bool => "bool",
            Shape::Number => "number",
            Shape::String => "string",
            Shape::Array(_) => "array",
            Shape::Object(_) => "object",
        };
        BTreeSet::from([kind.to_string()])
    }

    /// Canonical text form; keys are ordered so equal shapes serialize identically.
    pub fn signature(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn fingerprint(&self) -> String {
        digest(&self.signature())
    }

    pub fn parse(raw: &str) -> Option<Shape> {
        serde_json::from_str(raw).ok()
    }
}

pub fn shape_fingerprint(value: &Value) -> String {
    Shape::of(value).fingerprint()
}

/// Sorted union of dimension keys across the stored points.
pub fn dimension_keys(points: &[DataPoint]) -> Vec<String> {
    points
        .iter()
        .filter_map(|point| point.dimensions.as_ref())
        .flat_map(|dimensions| dimensions.keys().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// A chart transformer is reusable while the points keep the same shape and the chart
/// keeps the same cadence, dimension and prompt.
pub fn chart_fingerprint(
    points: &[DataPoint],
    cadence: Cadence,
    selected_dimension: Option<&str>,
    user_prompt: &str,
) -> String {
    let has_labels = points.iter().any(|point| point.value_label.is_some());
    let signature = format!(
        "dims=[{}];labels={}|cadence={}|dimension={}|prompt={}",
        dimension_keys(points).join(","),
        has_labels,
        cadence.as_str(),
        selected_dimension.unwrap_or(""),
        user_prompt.trim()
    );
    digest(&signature)
}

fn digest(signature: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(signature.as_bytes());
    hex::encode(hasher.finalize())
}
