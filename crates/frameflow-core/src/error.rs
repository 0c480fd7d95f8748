// Copyright 2025 Frameflow Contributors
// SPDX-License-Identifier: Apache-2.0

/*!
Core error types.

Configuration problems are values, not panics: a module that cannot be
configured reports a boolean failure from `open` and logs the reason, so
errors here exist to carry that reason across crate boundaries.
*/

use thiserror::Error;

/// Errors raised by the module graph and identity layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// The shared identity pool is full; at most `MODULE_CAPACITY` modules
    /// may be live at the same time.
    #[error("module capacity exceeded: at most {0} modules may be live at once")]
    ModuleCapacityExceeded(usize),

    /// A module type name was registered twice.
    #[error("module type already registered: {0}")]
    DuplicateModuleType(String),

    /// A required parameter key is absent.
    #[error("missing required parameter [{0}]")]
    MissingParameter(String),

    /// A parameter value failed to parse into the expected type.
    #[error("invalid value for parameter [{key}]: '{value}'")]
    InvalidParameter { key: String, value: String },

    /// A configured path does not exist.
    #[error("path for parameter [{key}] does not exist: '{path}'")]
    MissingPath { key: String, path: String },
}

pub type CoreResult<T> = Result<T, CoreError>;
