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

//! recc is a caching, remote-executing wrapper for C and C++ compiler
//! and linker invocations, speaking the Remote Execution API v2.
//!
//! Invoked in place of the compiler, it decides per invocation whether
//! the command can be reproduced deterministically on a remote worker
//! (or satisfied from a content-addressed cache), turns the local
//! command line into a hermetic remote `Action`, and materializes the
//! outputs locally. Anything that would make remoting unsafe falls back
//! to plain local execution.

#[macro_use]
extern crate log;

pub mod actionbuilder;
pub mod clients;
pub mod compiler;
pub mod config;
pub mod deps;
pub mod digest;
pub mod errors;
pub mod execution;
pub mod grpc;
pub mod merkle;
pub mod metadata;
pub mod metrics;
pub mod paths;
pub mod protos;
pub mod shell;
pub mod signals;
pub mod subprocess;
pub mod util;
