use crate::error::Result;
use crate::nn::Module;
use crate::tensor::Tensor;
use bincode::{Decode, Encode, config};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

pub type StateDict = BTreeMap<String, TensorData>;

// Serializable representation of tensor data
#[derive(Encode, Decode, Clone, Debug, PartialEq)]
pub struct TensorData {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

/// Summary of differences between two state dicts.
///
/// `expected` is usually taken from `model.state_dict()`, and `loaded` is
/// what was deserialized or passed in.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StateDictDiff {
    /// Keys that exist in `expected` but are missing from `loaded`.
    pub missing_keys: Vec<String>,
    /// Keys that exist in `loaded` but not in `expected`.
    pub unexpected_keys: Vec<String>,
    /// `(key, expected_shape, loaded_shape)` for keys present in both.
    pub shape_mismatches: Vec<(String, Vec<usize>, Vec<usize>)>,
}

impl StateDictDiff {
    pub fn is_empty(&self) -> bool {
        self.missing_keys.is_empty()
            && self.unexpected_keys.is_empty()
            && self.shape_mismatches.is_empty()
    }
}

impl std::fmt::Display for StateDictDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "missing {:?}, unexpected {:?}, shape mismatches {:?}",
            self.missing_keys, self.unexpected_keys, self.shape_mismatches
        )
    }
}

impl TensorData {
    pub fn from_tensor(t: &Tensor) -> Self {
        let borrowed = t.borrow();
        TensorData {
            data: borrowed.data.clone(),
            shape: borrowed.shape.clone(),
        }
    }

    pub fn to_tensor(&self, requires_grad: bool) -> Tensor {
        crate::RawTensor::new(self.data.clone(), &self.shape, requires_grad)
    }
}

/// Compute a diff between an "expected" and a "loaded" state dict.
pub fn diff_state_dict(expected: &StateDict, loaded: &StateDict) -> StateDictDiff {
    let mut diff = StateDictDiff::default();

    for (key, expected_td) in expected {
        match loaded.get(key) {
            None => diff.missing_keys.push(key.clone()),
            Some(actual_td) if expected_td.shape != actual_td.shape => {
                diff.shape_mismatches.push((
                    key.clone(),
                    expected_td.shape.clone(),
                    actual_td.shape.clone(),
                ));
            }
            Some(_) => {}
        }
    }

    diff.unexpected_keys = loaded
        .keys()
        .filter(|key| !expected.contains_key(*key))
        .cloned()
        .collect();

    diff
}

/// Load a state dict and report which keys were missing/unexpected or mismatched.
///
/// Shape-mismatched entries are left out of the load so a partially compatible
/// checkpoint never corrupts a layer.
pub fn load_state_dict_checked<M: Module + ?Sized>(
    module: &mut M,
    state: &StateDict,
) -> StateDictDiff {
    let expected = module.state_dict();
    let diff = diff_state_dict(&expected, state);
    if diff.shape_mismatches.is_empty() {
        module.load_state_dict(state);
    } else {
        let mut filtered = state.clone();
        for (key, _, _) in &diff.shape_mismatches {
            filtered.remove(key);
        }
        module.load_state_dict(&filtered);
    }
    diff
}

/// Prefix every key of `state` with `prefix.`, used when nesting modules.
pub fn with_prefix(prefix: &str, state: StateDict) -> StateDict {
    state
        .into_iter()
        .map(|(key, value)| (format!("{prefix}.{key}"), value))
        .collect()
}

/// Entries of `state` under `prefix.`, with the prefix stripped.
pub fn sub_state(state: &StateDict, prefix: &str) -> StateDict {
    let prefix = format!("{prefix}.");
    state
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(&prefix)
                .filter(|rest| !rest.is_empty())
                .map(|rest| (rest.to_string(), value.clone()))
        })
        .collect()
}

pub fn save_state_dict(state: &StateDict, path: impl AsRef<Path>) -> Result<()> {
    let mut file = File::create(path.as_ref())?;
    let encoded = bincode::encode_to_vec(state, config::standard())?;
    file.write_all(&encoded)?;
    log::debug!(
        "Saved {} tensors to {}",
        state.len(),
        path.as_ref().display()
    );
    Ok(())
}

pub fn load_state_dict(path: impl AsRef<Path>) -> Result<StateDict> {
    let mut file = File::open(path.as_ref())?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;
    let (state, _): (StateDict, _) = bincode::decode_from_slice(&buffer, config::standard())?;
    Ok(state)
}

#[cfg(test)]
mod io_tests {
    use super::*;
    use crate::nn::Module;
    use crate::{Linear, ReLU, Sequential};

    #[test]
    fn test_save_load_sequential() {
        let model = Sequential::new(vec![
            Box::new(Linear::new(2, 3, true)),
            Box::new(ReLU),
            Box::new(Linear::new(3, 1, true)),
        ]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seq.bin");
        save_state_dict(&model.state_dict(), &path).unwrap();

        let mut model2 = Sequential::new(vec![
            Box::new(Linear::new(2, 3, true)),
            Box::new(ReLU),
            Box::new(Linear::new(3, 1, true)),
        ]);
        assert_ne!(
            model.parameters()[0].borrow().data,
            model2.parameters()[0].borrow().data
        );

        let loaded_state = load_state_dict(&path).unwrap();
        model2.load_state_dict(&loaded_state);

        for (t1, t2) in model.parameters().iter().zip(model2.parameters().iter()) {
            assert_eq!(t1.borrow().data, t2.borrow().data);
        }
    }

    #[test]
    fn test_state_dict_diff_reports_mismatches() {
        let layer = Linear::new(2, 3, true);
        let expected = layer.state_dict();

        let mut loaded = expected.clone();
        loaded.remove("bias");
        loaded.insert(
            "extra".to_string(),
            TensorData {
                data: vec![0.0],
                shape: vec![1],
            },
        );
        if let Some(td) = loaded.get_mut("weight") {
            td.shape = vec![999];
        }

        let diff = diff_state_dict(&expected, &loaded);
        assert!(!diff.is_empty());
        assert!(diff.missing_keys.contains(&"bias".to_string()));
        assert!(diff.unexpected_keys.contains(&"extra".to_string()));
        assert!(diff.shape_mismatches.iter().any(|(k, _, _)| k == "weight"));
    }

    #[test]
    fn prefix_helpers_invert() {
        let layer = Linear::new(2, 2, true);
        let nested = with_prefix("classifier.1", layer.state_dict());
        assert!(nested.contains_key("classifier.1.weight"));
        let back = sub_state(&nested, "classifier.1");
        assert_eq!(back, layer.state_dict());
    }
}
