// Copyright 2025 Frameflow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Logging initialization and opt-in performance sampling for frameflow.

pub mod init;
pub mod sampler;

pub use init::init_logging;
pub use sampler::{PerfSampler, PerfStats, ReportLoop, ReportSection};
