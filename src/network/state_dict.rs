use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::math::matrix::Matrix;

/// Prefix added by data-parallel wrappers around a model.
const WRAPPER_PREFIX: &str = "module.";

/// Strips every leading `module.` wrapper prefix from a parameter name.
pub fn normalize_name(name: &str) -> &str {
    let mut name = name;
    while let Some(rest) = name.strip_prefix(WRAPPER_PREFIX) {
        name = rest;
    }
    name
}

/// Ordered mapping of normalized parameter names to tensors.
///
/// This is the on-disk weights snapshot format: a flat JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateDict {
    tensors: BTreeMap<String, Matrix>,
}

impl StateDict {
    pub fn new() -> StateDict {
        StateDict::default()
    }

    /// Inserts `tensor` under the normalized form of `name`.
    pub fn insert(&mut self, name: &str, tensor: Matrix) {
        self.tensors.insert(normalize_name(name).to_string(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Matrix> {
        self.tensors.get(normalize_name(name))
    }

    pub fn remove(&mut self, name: &str) -> Option<Matrix> {
        self.tensors.remove(normalize_name(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(normalize_name(name))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Matrix)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Re-keys entries so names written by older snapshots still match.
    pub fn normalized(self) -> StateDict {
        let mut out = StateDict::new();
        for (name, tensor) in self.tensors {
            out.insert(&name, tensor);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShapeMismatch {
    pub name: String,
    pub expected: (usize, usize),
    pub found: (usize, usize),
}

/// Key-level difference between a live model and a snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDiff {
    /// In the model, absent from the snapshot.
    pub missing: Vec<String>,
    /// In the snapshot, absent from the model.
    pub unexpected: Vec<String>,
    /// Present in both with different shapes.
    pub mismatched: Vec<ShapeMismatch>,
}

impl StateDiff {
    pub fn compute(model_shapes: &BTreeMap<String, (usize, usize)>, snapshot: &StateDict) -> StateDiff {
        let mut diff = StateDiff::default();
        for (name, &expected) in model_shapes {
            match snapshot.get(name) {
                None => diff.missing.push(name.clone()),
                Some(t) if t.shape() != expected => diff.mismatched.push(ShapeMismatch {
                    name: name.clone(),
                    expected,
                    found: t.shape(),
                }),
                Some(_) => {}
            }
        }
        diff.unexpected = snapshot
            .keys()
            .filter(|k| !model_shapes.contains_key(*k))
            .map(str::to_string)
            .collect();
        diff
    }

    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }
}

/// Outcome of restoring a weights snapshot into a model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightLoadReport {
    /// Parameter names whose values were copied from the snapshot.
    pub applied: Vec<String>,
    /// Empty when the strict load succeeded.
    pub diff: StateDiff,
}

impl WeightLoadReport {
    pub fn is_partial(&self) -> bool {
        !self.diff.is_exact()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapper_prefixes_are_stripped() {
        assert_eq!(normalize_name("module.fc.weight"), "fc.weight");
        assert_eq!(normalize_name("module.module.fc.bias"), "fc.bias");
        assert_eq!(normalize_name("layers.0.weight"), "layers.0.weight");
        assert_eq!(normalize_name("submodule.weight"), "submodule.weight");
    }

    #[test]
    fn diff_reports_each_kind_of_mismatch() {
        let mut shapes = BTreeMap::new();
        shapes.insert("a".to_string(), (2, 2));
        shapes.insert("b".to_string(), (1, 3));
        shapes.insert("c".to_string(), (1, 1));

        let mut snap = StateDict::new();
        snap.insert("module.a", Matrix::zeros(2, 2));
        snap.insert("b", Matrix::zeros(1, 5));
        snap.insert("z", Matrix::zeros(1, 1));

        let diff = StateDiff::compute(&shapes, &snap);
        assert_eq!(diff.missing, vec!["c".to_string()]);
        assert_eq!(diff.unexpected, vec!["z".to_string()]);
        assert_eq!(diff.mismatched.len(), 1);
        assert_eq!(diff.mismatched[0].name, "b");
        assert!(!diff.is_exact());
    }
}
