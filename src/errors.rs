// Copyright 2016 Mozilla Foundation
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub use anyhow::{anyhow, bail, Context, Error, Result};

/// A dependency command or toolchain probe exited with a non-zero status.
/// The orchestrator reacts by running the original command locally so the
/// user sees the compiler's own diagnostics.
#[derive(Debug, thiserror::Error)]
#[error("subprocess exited with status {exit_code}")]
pub struct SubprocessFailed {
    pub exit_code: i32,
}

/// A `-l` option could not be resolved to either a shared or a static
/// library on the effective search path.
#[derive(Debug, thiserror::Error)]
#[error("library not found: {0}")]
pub struct LibraryNotFound(pub String);

/// An input file carries a suffix the product-derivation rules don't
/// recognize for the detected compiler family.
#[derive(Debug, thiserror::Error)]
#[error("file '{0}' uses a file suffix unsupported for caching")]
pub struct UnsupportedSuffix(pub String);

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("not enough segments in path '{path}' to take the last {n}")]
    NotEnoughSegments { path: String, n: usize },
}

/// Malformed invocation; surfaces as exit code 100.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct UsageError(pub String);

/// A transport-level failure talking to the execution, CAS or action-cache
/// endpoint. `CANCELLED` maps to exit code 130, everything else to 102.
#[derive(Debug, thiserror::Error)]
#[error("grpc error: {0}")]
pub struct GrpcError(pub tonic::Status);

impl GrpcError {
    pub fn is_cancelled(&self) -> bool {
        self.0.code() == tonic::Code::Cancelled
    }
}
