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

//! Per-invocation metric accounting: named durations and counters,
//! collected in memory and optionally published in statsd line format to
//! a file or UDP sink at exit.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::errors::*;

pub const TIMER_COMPILER_DEPS: &str = "recc.compiler_deps";
pub const TIMER_LINKER_DEPS: &str = "recc.linker_deps";
pub const TIMER_BUILD_MERKLE_TREE: &str = "recc.build_merkle_tree";
pub const TIMER_EXECUTE_ACTION: &str = "recc.execute_action";
pub const TIMER_FIND_MISSING_BLOBS: &str = "recc.find_missing_blobs";
pub const TIMER_QUERY_ACTION_CACHE: &str = "recc.query_action_cache";
pub const TIMER_UPLOAD_MISSING_BLOBS: &str = "recc.upload_missing_blobs";
pub const TIMER_DOWNLOAD_BLOBS: &str = "recc.download_blobs";

pub const COUNTER_ACTION_CACHE_HIT: &str = "recc.action_cache_hit";
pub const COUNTER_ACTION_CACHE_MISS: &str = "recc.action_cache_miss";
pub const COUNTER_ACTION_CACHE_SKIP: &str = "recc.action_cache_skip";
pub const COUNTER_LINK_ACTION_CACHE_HIT: &str = "recc.link_action_cache_hit";
pub const COUNTER_LINK_ACTION_CACHE_MISS: &str = "recc.link_action_cache_miss";
pub const COUNTER_UPLOAD_BLOBS_CACHE_HIT: &str = "recc.upload_blobs_cache_hit";
pub const COUNTER_UPLOAD_BLOBS_CACHE_MISS: &str = "recc.upload_blobs_cache_miss";
pub const COUNTER_INPUT_SIZE_BYTES: &str = "recc.input_size_bytes";
pub const COUNTER_UNSUPPORTED_COMMAND: &str = "recc.unsupported_command";
pub const COUNTER_SCAN_DEPS_INVOCATION_SUCCESS: &str = "recc.clang_scan_deps_invocation_success";
pub const COUNTER_SCAN_DEPS_INVOCATION_FAILURE: &str = "recc.clang_scan_deps_invocation_failure";
pub const COUNTER_SCAN_DEPS_TARGET_SUCCESS: &str = "recc.clang_scan_deps_target_success";
pub const COUNTER_SCAN_DEPS_TARGET_FAILURE: &str = "recc.clang_scan_deps_target_failure";

#[derive(Default)]
struct Inner {
    durations: BTreeMap<String, Duration>,
    counters: BTreeMap<String, i64>,
}

/// Cheaply cloneable handle shared by every component that records.
#[derive(Clone, Default)]
pub struct MetricsCollector {
    inner: Arc<Mutex<Inner>>,
}

impl MetricsCollector {
    pub fn new() -> MetricsCollector {
        MetricsCollector::default()
    }

    pub fn record_counter(&self, name: &str, value: i64) {
        let mut inner = self.inner.lock().unwrap();
        *inner.counters.entry(name.to_owned()).or_insert(0) += value;
    }

    pub fn record_duration(&self, name: &str, duration: Duration) {
        let mut inner = self.inner.lock().unwrap();
        *inner
            .durations
            .entry(name.to_owned())
            .or_insert(Duration::ZERO) += duration;
    }

    /// Time a scope; the elapsed time is recorded when the guard drops.
    pub fn timer(&self, name: &'static str) -> MetricTimer {
        MetricTimer {
            collector: self.clone(),
            name,
            start: Instant::now(),
        }
    }

    pub fn durations(&self) -> BTreeMap<String, Duration> {
        self.inner.lock().unwrap().durations.clone()
    }

    pub fn counters(&self) -> BTreeMap<String, i64> {
        self.inner.lock().unwrap().counters.clone()
    }

    /// Render collected metrics as statsd lines and send them to the
    /// configured file or UDP endpoint. Failures are logged, never fatal.
    pub fn publish(&self, config: &Config) {
        if !config.enable_metrics {
            return;
        }

        let tag = format_metric_tag(config);
        let mut lines = String::new();
        for (name, duration) in self.durations() {
            lines.push_str(&format!("{}:{}|ms{}\n", name, duration.as_millis(), tag));
        }
        for (name, value) in self.counters() {
            lines.push_str(&format!("{}:{}|c{}\n", name, value, tag));
        }

        if let Err(e) = write_metrics(config, &lines) {
            warn!("failed to publish metrics: {:#}", e);
        }
    }
}

fn write_metrics(config: &Config, lines: &str) -> Result<()> {
    if !config.metrics_udp_server.is_empty() {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").context("failed to bind UDP socket")?;
        socket
            .send_to(lines.as_bytes(), &config.metrics_udp_server)
            .with_context(|| format!("failed to send metrics to {}", config.metrics_udp_server))?;
    } else if !config.metrics_file.is_empty() {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.metrics_file)
            .with_context(|| format!("failed to open metrics file {}", config.metrics_file))?;
        file.write_all(lines.as_bytes())?;
    } else {
        eprint!("{}", lines);
    }
    Ok(())
}

pub struct MetricTimer {
    collector: MetricsCollector,
    name: &'static str,
    start: Instant,
}

impl Drop for MetricTimer {
    fn drop(&mut self) {
        self.collector
            .record_duration(self.name, self.start.elapsed());
    }
}

/// Format the configured metric tags for the selected statsd dialect.
pub fn format_metric_tag(config: &Config) -> String {
    if config.metrics_tag.is_empty() {
        return String::new();
    }

    let (prefix, separator) = match config.statsd_format.as_str() {
        "influx" => (",", ","),
        "graphite" => (";", ";"),
        "dog" => ("|#", ","),
        _ => return String::new(),
    };

    let tags: Vec<String> = config
        .metrics_tag
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();
    format!("{}{}", prefix, tags.join(separator))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let collector = MetricsCollector::new();
        collector.record_counter("recc.test", 1);
        collector.record_counter("recc.test", 2);
        assert_eq!(collector.counters()["recc.test"], 3);
    }

    #[test]
    fn test_timer_records_on_drop() {
        let collector = MetricsCollector::new();
        {
            let _timer = collector.timer(TIMER_EXECUTE_ACTION);
        }
        assert!(collector.durations().contains_key(TIMER_EXECUTE_ACTION));
    }

    #[test]
    fn test_format_metric_tag() {
        let mut config = Config::default();
        config.metrics_tag.insert("env".into(), "ci".into());
        config.metrics_tag.insert("host".into(), "b1".into());

        config.statsd_format = "influx".into();
        assert_eq!(format_metric_tag(&config), ",env=ci,host=b1");
        config.statsd_format = "graphite".into();
        assert_eq!(format_metric_tag(&config), ";env=ci;host=b1");
        config.statsd_format = "dog".into();
        assert_eq!(format_metric_tag(&config), "|#env=ci,host=b1");
        config.statsd_format = "unknown".into();
        assert_eq!(format_metric_tag(&config), "");
    }
}
