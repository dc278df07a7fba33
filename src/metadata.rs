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

//! Best-effort publication of per-compilation metadata.
//!
//! When a UDP port is configured, one protobuf datagram describing the
//! invocation (command line, environment, source digests, collected
//! metrics, action digest, resource usage) is sent to localhost after
//! execution. Failures are swallowed; this must never affect the build.

use std::net::UdpSocket;
use std::time::Duration;

use prost::Message;

use crate::config::Config;
use crate::deps;
use crate::metrics::MetricsCollector;
use crate::protos::metadata::{CompilerExecutionData, ReccData, ResourceUsage};
use crate::protos::re;

/// Gather the invocation-side facts while the compilation runs.
pub fn collect_compilation_data(argv: &[String], config: &Config) -> CompilerExecutionData {
    let mut data = CompilerExecutionData {
        command: argv.first().cloned().unwrap_or_default(),
        full_command: argv.join(" "),
        working_directory: crate::paths::current_working_directory(),
        correlated_invocations_id: config.correlated_invocations_id.clone(),
        ..Default::default()
    };

    for (name, value) in std::env::vars() {
        data.environment_variables.insert(name, value);
    }

    data.platform = Some(re::Platform {
        properties: vec![
            re::platform::Property {
                name: "ISA".to_owned(),
                value: std::env::consts::ARCH.to_owned(),
            },
            re::platform::Property {
                name: "OSFamily".to_owned(),
                value: std::env::consts::OS.to_owned(),
            },
        ],
    });

    for argument in argv {
        if !deps::is_source_file(argument) {
            continue;
        }
        // Unreadable files are simply not reported.
        if let Ok(digest) = config.cas_digest_function.digest_of_file(argument) {
            data.source_file_info.push(re::FileNode {
                name: argument.clone(),
                digest: Some(digest),
                is_executable: false,
            });
        }
    }

    data
}

fn to_proto_duration(duration: Duration) -> prost_types::Duration {
    prost_types::Duration {
        seconds: duration.as_secs() as i64,
        nanos: duration.subsec_nanos() as i32,
    }
}

/// Fold the post-execution facts into the record: collected metrics, the
/// action digest, wall-clock duration and child rusage.
pub fn finalize_compilation_data(
    data: &mut CompilerExecutionData,
    metrics: &MetricsCollector,
    action_digest: Option<&re::Digest>,
    wall_clock: Duration,
) {
    let mut recc_data = ReccData {
        action_digest: action_digest.cloned(),
        ..Default::default()
    };
    for (name, duration) in metrics.durations() {
        recc_data
            .duration_metrics
            .insert(name, to_proto_duration(duration));
    }
    for (name, value) in metrics.counters() {
        recc_data.counter_metrics.insert(name, value);
    }
    data.recc_data = Some(recc_data);

    data.duration = Some(to_proto_duration(wall_clock));
    data.local_resource_usage = children_resource_usage();
}

fn children_resource_usage() -> Option<ResourceUsage> {
    use nix::sys::resource::{getrusage, UsageWho};

    let usage = getrusage(UsageWho::RUSAGE_CHILDREN).ok()?;
    let to_duration = |time: nix::sys::time::TimeVal| prost_types::Duration {
        seconds: time.tv_sec(),
        nanos: (time.tv_usec() * 1000) as i32,
    };
    Some(ResourceUsage {
        user_time: Some(to_duration(usage.user_time())),
        system_time: Some(to_duration(usage.system_time())),
        max_resident_set_kb: usage.max_rss(),
    })
}

/// Send the record as a single datagram to the configured localhost
/// port. Errors are deliberately ignored.
pub fn send_compilation_data(data: &CompilerExecutionData, config: &Config) {
    let port: u16 = match config.compilation_metadata_udp_port.parse() {
        Ok(port) if port > 0 => port,
        _ => return,
    };

    let Ok(socket) = UdpSocket::bind("0.0.0.0:0") else {
        return;
    };
    let serialized = data.encode_to_vec();
    match socket.send_to(&serialized, ("127.0.0.1", port)) {
        Ok(sent) if sent != serialized.len() => {
            debug!(
                "compilation metadata datagram truncated: sent {} of {} bytes",
                sent,
                serialized.len()
            );
        }
        Err(e) => debug!("failed to send compilation metadata: {}", e),
        Ok(_) => {}
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_collect_compilation_data() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("main.cpp");
        std::fs::write(&source, "int main() {}\n").unwrap();
        let source = source.to_string_lossy().into_owned();

        let config = Config::default();
        let data = collect_compilation_data(&args(&["gcc", "-c", &source]), &config);

        assert_eq!(data.command, "gcc");
        assert_eq!(data.full_command, format!("gcc -c {}", source));
        assert_eq!(data.source_file_info.len(), 1);
        assert_eq!(data.source_file_info[0].name, source);
        assert_eq!(data.platform.as_ref().unwrap().properties.len(), 2);
    }

    #[test]
    fn test_finalize_attaches_metrics_and_digest() {
        let config = Config::default();
        let mut data = collect_compilation_data(&args(&["gcc"]), &config);

        let metrics = MetricsCollector::new();
        metrics.record_counter("recc.action_cache_hit", 1);
        let digest = re::Digest {
            hash: "abc".into(),
            size_bytes: 3,
        };
        finalize_compilation_data(&mut data, &metrics, Some(&digest), Duration::from_secs(2));

        let recc_data = data.recc_data.as_ref().unwrap();
        assert_eq!(recc_data.counter_metrics["recc.action_cache_hit"], 1);
        assert_eq!(recc_data.action_digest.as_ref().unwrap().hash, "abc");
        assert_eq!(data.duration.as_ref().unwrap().seconds, 2);
    }
}
