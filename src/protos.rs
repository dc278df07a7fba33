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

//! Protobuf message definitions for the wire protocols recc speaks.
//!
//! The `re` module mirrors `build.bazel.remote.execution.v2`
//! (REAPI v2.0-v2.2), `rpc`/`longrunning`/`bytestream` the google protos
//! the Execution service builds on, and `metadata` recc's own best-effort
//! compilation-metadata record. Field numbers follow the upstream protos;
//! messages are maintained by hand so the canonical encoding (which the
//! digest scheme depends on) is in one auditable place.

/// build.bazel.remote.execution.v2
pub mod re {
    use std::fmt;

    /// The canonical name of a byte blob: hash plus size. Structural
    /// equality; usable as a map key.
    #[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
    pub struct Digest {
        #[prost(string, tag = "1")]
        pub hash: String,
        #[prost(int64, tag = "2")]
        pub size_bytes: i64,
    }

    impl fmt::Display for Digest {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}/{}", self.hash, self.size_bytes)
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Platform {
        #[prost(message, repeated, tag = "1")]
        pub properties: Vec<platform::Property>,
    }

    pub mod platform {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Property {
            #[prost(string, tag = "1")]
            pub name: String,
            #[prost(string, tag = "2")]
            pub value: String,
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Command {
        #[prost(string, repeated, tag = "1")]
        pub arguments: Vec<String>,
        /// Must be sorted by name; servers may reject unsorted commands
        /// and unsorted encodings would defeat digest canonicality anyway.
        #[prost(message, repeated, tag = "2")]
        pub environment_variables: Vec<command::EnvironmentVariable>,
        /// Deprecated in REAPI v2.1 in favour of `output_paths`; still
        /// populated when the negotiated version is 2.0.
        #[prost(string, repeated, tag = "3")]
        pub output_files: Vec<String>,
        #[prost(string, repeated, tag = "4")]
        pub output_directories: Vec<String>,
        #[prost(message, optional, tag = "5")]
        pub platform: Option<Platform>,
        #[prost(string, tag = "6")]
        pub working_directory: String,
        #[prost(string, repeated, tag = "7")]
        pub output_paths: Vec<String>,
    }

    pub mod command {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct EnvironmentVariable {
            #[prost(string, tag = "1")]
            pub name: String,
            #[prost(string, tag = "2")]
            pub value: String,
        }
    }

    /// The digest of this message's canonical serialization is the action
    /// cache key for the whole invocation.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Action {
        #[prost(message, optional, tag = "1")]
        pub command_digest: Option<Digest>,
        #[prost(message, optional, tag = "2")]
        pub input_root_digest: Option<Digest>,
        #[prost(bool, tag = "7")]
        pub do_not_cache: bool,
        #[prost(bytes = "vec", tag = "9")]
        pub salt: Vec<u8>,
        /// Only populated when the negotiated REAPI version is >= 2.2.
        #[prost(message, optional, tag = "10")]
        pub platform: Option<Platform>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct FileNode {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(message, optional, tag = "2")]
        pub digest: Option<Digest>,
        #[prost(bool, tag = "4")]
        pub is_executable: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DirectoryNode {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(message, optional, tag = "2")]
        pub digest: Option<Digest>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SymlinkNode {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(string, tag = "2")]
        pub target: String,
    }

    /// One level of the input Merkle tree. Children must be sorted by name
    /// so that equal trees serialize to equal bytes.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Directory {
        #[prost(message, repeated, tag = "1")]
        pub files: Vec<FileNode>,
        #[prost(message, repeated, tag = "2")]
        pub directories: Vec<DirectoryNode>,
        #[prost(message, repeated, tag = "3")]
        pub symlinks: Vec<SymlinkNode>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Tree {
        #[prost(message, optional, tag = "1")]
        pub root: Option<Directory>,
        #[prost(message, repeated, tag = "2")]
        pub children: Vec<Directory>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct OutputFile {
        #[prost(string, tag = "1")]
        pub path: String,
        #[prost(message, optional, tag = "2")]
        pub digest: Option<Digest>,
        #[prost(bool, tag = "4")]
        pub is_executable: bool,
        #[prost(bytes = "vec", tag = "5")]
        pub contents: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct OutputSymlink {
        #[prost(string, tag = "1")]
        pub path: String,
        #[prost(string, tag = "2")]
        pub target: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct OutputDirectory {
        #[prost(string, tag = "1")]
        pub path: String,
        #[prost(message, optional, tag = "3")]
        pub tree_digest: Option<Digest>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ActionResult {
        #[prost(message, repeated, tag = "2")]
        pub output_files: Vec<OutputFile>,
        #[prost(message, repeated, tag = "3")]
        pub output_directories: Vec<OutputDirectory>,
        #[prost(int32, tag = "4")]
        pub exit_code: i32,
        #[prost(bytes = "vec", tag = "5")]
        pub stdout_raw: Vec<u8>,
        #[prost(message, optional, tag = "6")]
        pub stdout_digest: Option<Digest>,
        #[prost(bytes = "vec", tag = "7")]
        pub stderr_raw: Vec<u8>,
        #[prost(message, optional, tag = "8")]
        pub stderr_digest: Option<Digest>,
        #[prost(message, repeated, tag = "12")]
        pub output_symlinks: Vec<OutputSymlink>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct FindMissingBlobsRequest {
        #[prost(string, tag = "1")]
        pub instance_name: String,
        #[prost(message, repeated, tag = "2")]
        pub blob_digests: Vec<Digest>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct FindMissingBlobsResponse {
        #[prost(message, repeated, tag = "2")]
        pub missing_blob_digests: Vec<Digest>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BatchUpdateBlobsRequest {
        #[prost(string, tag = "1")]
        pub instance_name: String,
        #[prost(message, repeated, tag = "2")]
        pub requests: Vec<batch_update_blobs_request::Request>,
    }

    pub mod batch_update_blobs_request {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Request {
            #[prost(message, optional, tag = "1")]
            pub digest: Option<super::Digest>,
            #[prost(bytes = "vec", tag = "2")]
            pub data: Vec<u8>,
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BatchUpdateBlobsResponse {
        #[prost(message, repeated, tag = "1")]
        pub responses: Vec<batch_update_blobs_response::Response>,
    }

    pub mod batch_update_blobs_response {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Response {
            #[prost(message, optional, tag = "1")]
            pub digest: Option<super::Digest>,
            #[prost(message, optional, tag = "2")]
            pub status: Option<crate::protos::rpc::Status>,
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BatchReadBlobsRequest {
        #[prost(string, tag = "1")]
        pub instance_name: String,
        #[prost(message, repeated, tag = "2")]
        pub digests: Vec<Digest>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BatchReadBlobsResponse {
        #[prost(message, repeated, tag = "1")]
        pub responses: Vec<batch_read_blobs_response::Response>,
    }

    pub mod batch_read_blobs_response {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Response {
            #[prost(message, optional, tag = "1")]
            pub digest: Option<super::Digest>,
            #[prost(bytes = "vec", tag = "2")]
            pub data: Vec<u8>,
            #[prost(message, optional, tag = "3")]
            pub status: Option<crate::protos::rpc::Status>,
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct GetActionResultRequest {
        #[prost(string, tag = "1")]
        pub instance_name: String,
        #[prost(message, optional, tag = "2")]
        pub action_digest: Option<Digest>,
        #[prost(bool, tag = "3")]
        pub inline_stdout: bool,
        #[prost(bool, tag = "4")]
        pub inline_stderr: bool,
        #[prost(string, repeated, tag = "5")]
        pub inline_output_files: Vec<String>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct UpdateActionResultRequest {
        #[prost(string, tag = "1")]
        pub instance_name: String,
        #[prost(message, optional, tag = "2")]
        pub action_digest: Option<Digest>,
        #[prost(message, optional, tag = "3")]
        pub action_result: Option<ActionResult>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ExecuteRequest {
        #[prost(string, tag = "1")]
        pub instance_name: String,
        #[prost(bool, tag = "3")]
        pub skip_cache_lookup: bool,
        #[prost(message, optional, tag = "6")]
        pub action_digest: Option<Digest>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ExecuteResponse {
        #[prost(message, optional, tag = "1")]
        pub result: Option<ActionResult>,
        #[prost(bool, tag = "2")]
        pub cached_result: bool,
        #[prost(message, optional, tag = "3")]
        pub status: Option<crate::protos::rpc::Status>,
        #[prost(string, tag = "5")]
        pub message: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ExecuteOperationMetadata {
        #[prost(int32, tag = "1")]
        pub stage: i32,
        #[prost(message, optional, tag = "2")]
        pub action_digest: Option<Digest>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct WaitExecutionRequest {
        #[prost(string, tag = "1")]
        pub name: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ToolDetails {
        #[prost(string, tag = "1")]
        pub tool_name: String,
        #[prost(string, tag = "2")]
        pub tool_version: String,
    }

    /// Attached to every RPC as the binary header
    /// `build.bazel.remote.execution.v2.requestmetadata-bin`.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct RequestMetadata {
        #[prost(message, optional, tag = "1")]
        pub tool_details: Option<ToolDetails>,
        #[prost(string, tag = "2")]
        pub action_id: String,
        #[prost(string, tag = "3")]
        pub tool_invocation_id: String,
        #[prost(string, tag = "4")]
        pub correlated_invocations_id: String,
    }
}

/// google.rpc
pub mod rpc {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Status {
        #[prost(int32, tag = "1")]
        pub code: i32,
        #[prost(string, tag = "2")]
        pub message: String,
        #[prost(message, repeated, tag = "3")]
        pub details: Vec<::prost_types::Any>,
    }
}

/// google.longrunning
pub mod longrunning {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Operation {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(message, optional, tag = "2")]
        pub metadata: Option<::prost_types::Any>,
        #[prost(bool, tag = "3")]
        pub done: bool,
        #[prost(oneof = "operation::Result", tags = "4, 5")]
        pub result: Option<operation::Result>,
    }

    pub mod operation {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Result {
            #[prost(message, tag = "4")]
            Error(crate::protos::rpc::Status),
            #[prost(message, tag = "5")]
            Response(::prost_types::Any),
        }
    }
}

/// google.bytestream
pub mod bytestream {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ReadRequest {
        #[prost(string, tag = "1")]
        pub resource_name: String,
        #[prost(int64, tag = "2")]
        pub read_offset: i64,
        #[prost(int64, tag = "3")]
        pub read_limit: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ReadResponse {
        #[prost(bytes = "vec", tag = "10")]
        pub data: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct WriteRequest {
        #[prost(string, tag = "1")]
        pub resource_name: String,
        #[prost(int64, tag = "2")]
        pub write_offset: i64,
        #[prost(bool, tag = "3")]
        pub finish_write: bool,
        #[prost(bytes = "vec", tag = "10")]
        pub data: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct WriteResponse {
        #[prost(int64, tag = "1")]
        pub committed_size: i64,
    }
}

/// The compilation-metadata record optionally published as a single UDP
/// datagram after every invocation.
pub mod metadata {
    use std::collections::HashMap;

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ResourceUsage {
        #[prost(message, optional, tag = "1")]
        pub user_time: Option<::prost_types::Duration>,
        #[prost(message, optional, tag = "2")]
        pub system_time: Option<::prost_types::Duration>,
        #[prost(int64, tag = "3")]
        pub max_resident_set_kb: i64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ReccData {
        #[prost(map = "string, message", tag = "1")]
        pub duration_metrics: HashMap<String, ::prost_types::Duration>,
        #[prost(map = "string, int64", tag = "2")]
        pub counter_metrics: HashMap<String, i64>,
        #[prost(message, optional, tag = "3")]
        pub action_digest: Option<crate::protos::re::Digest>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct CompilerExecutionData {
        /// The resolved compiler executable.
        #[prost(string, tag = "1")]
        pub command: String,
        /// The full command line as invoked, unresolved.
        #[prost(string, tag = "2")]
        pub full_command: String,
        #[prost(string, tag = "3")]
        pub working_directory: String,
        #[prost(map = "string, string", tag = "4")]
        pub environment_variables: HashMap<String, String>,
        #[prost(message, optional, tag = "5")]
        pub platform: Option<crate::protos::re::Platform>,
        #[prost(message, repeated, tag = "6")]
        pub source_file_info: Vec<crate::protos::re::FileNode>,
        #[prost(string, tag = "7")]
        pub correlated_invocations_id: String,
        #[prost(message, optional, tag = "8")]
        pub duration: Option<::prost_types::Duration>,
        #[prost(message, optional, tag = "9")]
        pub local_resource_usage: Option<ResourceUsage>,
        #[prost(message, optional, tag = "10")]
        pub recc_data: Option<ReccData>,
    }
}

#[cfg(test)]
mod test {
    use super::re::*;
    use prost::Message;

    #[test]
    fn test_digest_display() {
        let digest = Digest {
            hash: "abcd".into(),
            size_bytes: 42,
        };
        assert_eq!(digest.to_string(), "abcd/42");
    }

    #[test]
    fn test_default_fields_are_not_encoded() {
        // Canonical digests depend on default values staying off the wire.
        let action = Action::default();
        assert!(action.encode_to_vec().is_empty());

        let command = Command {
            arguments: vec!["/bin/ls".into()],
            ..Default::default()
        };
        // tag + length + payload
        assert_eq!(command.encode_to_vec().len(), 2 + "/bin/ls".len());
    }

    #[test]
    fn test_empty_platform_presence_is_encoded() {
        // An explicitly present-but-empty platform must still occupy bytes;
        // REAPI >= 2.2 actions carry it even when no properties are set.
        let action = Action {
            platform: Some(Platform::default()),
            ..Default::default()
        };
        assert_eq!(action.encode_to_vec().len(), 2);
    }

    #[test]
    fn test_command_roundtrip() {
        let command = Command {
            arguments: vec!["./gcc".into(), "-c".into(), "hello.cpp".into()],
            environment_variables: vec![command::EnvironmentVariable {
                name: "PATH".into(),
                value: "/usr/bin".into(),
            }],
            output_paths: vec!["hello.o".into()],
            working_directory: "build".into(),
            ..Default::default()
        };
        let encoded = command.encode_to_vec();
        let decoded = Command::decode(encoded.as_slice()).unwrap();
        assert_eq!(command, decoded);
    }
}
