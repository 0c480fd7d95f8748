// Copyright 2025 Frameflow Contributors
// SPDX-License-Identifier: Apache-2.0

/*!
Per-module configuration parameters.

Every module instance is configured through a flat string-to-string map.
The typed getters here turn malformed values into [`CoreError`] values so
`Module::open` can reject them with a log line instead of panicking.
*/

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{CoreError, CoreResult};

/// Flat string key/value parameter set for one module instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleParams {
    values: AHashMap<String, String>,
}

impl ModuleParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Returns the raw value of a required key.
    pub fn require(&self, key: &str) -> CoreResult<&str> {
        self.get(key)
            .ok_or_else(|| CoreError::MissingParameter(key.to_string()))
    }

    /// Parses an optional key into `T`, or `None` when absent.
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> CoreResult<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
                CoreError::InvalidParameter {
                    key: key.to_string(),
                    value: raw.to_string(),
                }
            }),
        }
    }

    pub fn get_i64(&self, key: &str, default: i64) -> CoreResult<i64> {
        Ok(self.get_parsed(key)?.unwrap_or(default))
    }

    pub fn get_f64(&self, key: &str, default: f64) -> CoreResult<f64> {
        Ok(self.get_parsed(key)?.unwrap_or(default))
    }

    /// Booleans accept `true`/`false` and `1`/`0`.
    pub fn get_bool(&self, key: &str, default: bool) -> CoreResult<bool> {
        match self.get(key) {
            None => Ok(default),
            Some("true") | Some("1") => Ok(true),
            Some("false") | Some("0") => Ok(false),
            Some(raw) => Err(CoreError::InvalidParameter {
                key: key.to_string(),
                value: raw.to_string(),
            }),
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ModuleParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = ModuleParams::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_getters_parse_and_default() {
        let params: ModuleParams =
            [("batch_size", "4"), ("threshold", "0.6"), ("object_mode", "true")]
                .into_iter()
                .collect();

        assert_eq!(params.get_i64("batch_size", 1).unwrap(), 4);
        assert_eq!(params.get_i64("device_id", 0).unwrap(), 0);
        assert!((params.get_f64("threshold", 0.0).unwrap() - 0.6).abs() < f64::EPSILON);
        assert!(params.get_bool("object_mode", false).unwrap());
        assert!(!params.get_bool("keep_aspect_ratio", false).unwrap());
    }

    #[test]
    fn malformed_values_are_errors_not_panics() {
        let params: ModuleParams = [("batch_size", "four")].into_iter().collect();
        assert!(matches!(
            params.get_i64("batch_size", 1),
            Err(CoreError::InvalidParameter { .. })
        ));
        assert!(matches!(
            params.require("model_path"),
            Err(CoreError::MissingParameter(_))
        ));
    }
}
