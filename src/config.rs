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

//! Configuration loading.
//!
//! Values come from `recc.conf` files (keys without the `RECC_` prefix)
//! overridden by `RECC_`-prefixed environment variables. The result is an
//! immutable [`Config`] value constructed once and threaded through the
//! components; nothing reads configuration from globals after startup.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::digest::DigestFunction;
use crate::errors::*;

pub const REAPI_SUPPORTED_VERSIONS: &[&str] = &["2.0", "2.1", "2.2"];

const CONFIG_FILE_NAME: &str = "recc.conf";

#[derive(Debug, Clone)]
pub struct Config {
    /// URI of the execution endpoint, e.g. `http://localhost:8085`.
    pub server: String,
    pub cas_server: String,
    pub action_cache_server: String,
    pub instance: String,
    pub cas_instance: String,
    pub action_cache_instance: String,

    pub server_auth_googleapi: bool,
    pub access_token_path: String,
    /// Deprecated; coerces scheme-less endpoint URIs to `https://`.
    pub server_ssl: bool,

    pub retry_limit: u32,
    /// Base delay in milliseconds; attempt n waits `retry_delay * 2^n`.
    pub retry_delay_ms: u64,
    /// Per-request deadline in seconds; 0 means no deadline.
    pub request_timeout_secs: u64,
    /// Minimum expected throughput in bytes per second; extends the
    /// ByteStream deadline proportionally to transfer size. 0 disables.
    pub min_throughput: u64,
    /// Period for gRPC keepalive pings in seconds; 0 disables them.
    pub keepalive_time_secs: u64,

    pub cache_only: bool,
    pub compile_cache_only: bool,
    pub link: bool,
    pub link_metrics_only: bool,
    pub link_cache_only: bool,
    pub force_remote: bool,
    pub action_uncacheable: bool,
    pub skip_cache: bool,
    pub dont_save_output: bool,
    pub no_execute: bool,
    pub verify: bool,

    /// `Some` (possibly empty) when explicitly configured; `None` means
    /// run the dependency scanner.
    pub deps_override: Option<BTreeSet<String>>,
    pub deps_directory_override: String,
    pub output_files_override: BTreeSet<String>,
    pub output_directories_override: BTreeSet<String>,
    pub deps_exclude_paths: BTreeSet<String>,
    pub deps_extra_symlinks: BTreeSet<String>,
    pub deps_global_paths: bool,
    pub compilation_database: String,
    pub clang_scan_deps: String,

    pub project_root: String,
    pub no_path_rewrite: bool,
    /// Ordered `(from, to)` directory-prefix pairs; first match wins.
    pub prefix_map: Vec<(String, String)>,
    pub working_dir_prefix: String,

    pub preserve_env: bool,
    pub env_to_read: BTreeSet<String>,
    pub deps_env: HashMap<String, String>,
    pub remote_env: BTreeMap<String, String>,
    pub remote_platform: BTreeMap<String, String>,
    pub compile_remote_platform: BTreeMap<String, String>,
    pub link_remote_platform: BTreeMap<String, String>,

    pub reapi_version: String,
    pub cas_digest_function: DigestFunction,
    pub action_salt: String,

    /// -1 = one worker per core, 0 = don't parallelize.
    pub max_threads: i32,

    pub enable_metrics: bool,
    pub metrics_file: String,
    pub metrics_udp_server: String,
    pub statsd_format: String,
    pub metrics_tag: BTreeMap<String, String>,
    pub compilation_metadata_udp_port: String,

    pub log_level: String,
    pub log_directory: String,
    pub verbose: bool,

    pub runner_command: String,
    pub cache_upload_local_build: bool,
    pub cache_upload_failed_build: bool,

    pub correlated_invocations_id: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            server: String::new(),
            cas_server: String::new(),
            action_cache_server: String::new(),
            instance: String::new(),
            cas_instance: String::new(),
            action_cache_instance: String::new(),
            server_auth_googleapi: false,
            access_token_path: String::new(),
            server_ssl: false,
            retry_limit: 0,
            retry_delay_ms: 1000,
            request_timeout_secs: 0,
            min_throughput: 0,
            keepalive_time_secs: 0,
            cache_only: false,
            compile_cache_only: false,
            link: false,
            link_metrics_only: false,
            link_cache_only: false,
            force_remote: false,
            action_uncacheable: false,
            skip_cache: false,
            dont_save_output: false,
            no_execute: false,
            verify: false,
            deps_override: None,
            deps_directory_override: String::new(),
            output_files_override: BTreeSet::new(),
            output_directories_override: BTreeSet::new(),
            deps_exclude_paths: BTreeSet::new(),
            deps_extra_symlinks: BTreeSet::new(),
            deps_global_paths: false,
            compilation_database: String::new(),
            clang_scan_deps: "clang-scan-deps".to_owned(),
            project_root: String::new(),
            no_path_rewrite: false,
            prefix_map: Vec::new(),
            working_dir_prefix: String::new(),
            preserve_env: false,
            env_to_read: BTreeSet::new(),
            deps_env: HashMap::new(),
            remote_env: BTreeMap::new(),
            remote_platform: BTreeMap::new(),
            compile_remote_platform: BTreeMap::new(),
            link_remote_platform: BTreeMap::new(),
            reapi_version: "2.2".to_owned(),
            cas_digest_function: DigestFunction::Sha256,
            action_salt: String::new(),
            max_threads: 4,
            enable_metrics: false,
            metrics_file: String::new(),
            metrics_udp_server: String::new(),
            statsd_format: String::new(),
            metrics_tag: BTreeMap::new(),
            compilation_metadata_udp_port: String::new(),
            log_level: String::new(),
            log_directory: String::new(),
            verbose: false,
            runner_command: String::new(),
            cache_upload_local_build: false,
            cache_upload_failed_build: true,
            correlated_invocations_id: String::new(),
        }
    }
}

/// Endpoint and instance names default off one another, so the loader
/// keeps the explicitly-set values separate until everything is parsed.
#[derive(Default)]
struct Loader {
    config: Config,
    server: Option<String>,
    cas_server: Option<String>,
    action_cache_server: Option<String>,
    instance: Option<String>,
    cas_instance: Option<String>,
    action_cache_instance: Option<String>,
}

fn parse_bool(value: &str) -> bool {
    !matches!(
        value.to_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}

fn parse_set(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parse a byte count with an optional K/M/G/T suffix.
pub fn parse_size(val: &str) -> Option<u64> {
    let multiplier = match val.chars().last() {
        Some('K') => 1024,
        Some('M') => 1024 * 1024,
        Some('G') => 1024 * 1024 * 1024,
        Some('T') => 1024 * 1024 * 1024 * 1024,
        _ => 1,
    };
    let val = if multiplier > 1 && !val.is_empty() {
        val.split_at(val.len() - 1).0
    } else {
        val
    };
    u64::from_str(val).ok().map(|size| size * multiplier)
}

/// Parse the colon-separated `from=to` pairs of `RECC_PREFIX_MAP`.
fn parse_prefix_map(value: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for entry in value.split(':').filter(|s| !s.is_empty()) {
        match entry.split_once('=') {
            Some((from, to)) if !from.is_empty() && !to.is_empty() => {
                pairs.push((from.to_owned(), to.to_owned()));
            }
            _ => warn!("ignoring malformed prefix map entry \"{}\"", entry),
        }
    }
    pairs
}

fn version_string_to_pair(version: &str) -> Result<(u32, u32)> {
    let (major, minor) = version
        .split_once('.')
        .ok_or_else(|| anyhow!("malformed version string \"{}\"", version))?;
    Ok((
        major
            .parse()
            .with_context(|| format!("malformed version string \"{}\"", version))?,
        minor
            .parse()
            .with_context(|| format!("malformed version string \"{}\"", version))?,
    ))
}

impl Loader {
    fn parse_u64(key: &str, value: &str) -> u64 {
        match value.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!("ignoring non-numeric value \"{}\" for {}", value, key);
                0
            }
        }
    }

    /// Apply one `KEY=value` setting; `key` has the `RECC_` prefix already
    /// stripped, which is also the spelling used inside config files.
    fn apply(&mut self, key: &str, value: &str) {
        // Map-valued options arrive as families of variables sharing a
        // prefix. Match the longer prefixes first.
        if let Some(name) = key.strip_prefix("COMPILE_REMOTE_PLATFORM_") {
            self.config
                .compile_remote_platform
                .insert(name.to_owned(), value.to_owned());
            return;
        }
        if let Some(name) = key.strip_prefix("LINK_REMOTE_PLATFORM_") {
            self.config
                .link_remote_platform
                .insert(name.to_owned(), value.to_owned());
            return;
        }
        if let Some(name) = key.strip_prefix("REMOTE_PLATFORM_") {
            self.config
                .remote_platform
                .insert(name.to_owned(), value.to_owned());
            return;
        }
        if let Some(name) = key.strip_prefix("REMOTE_ENV_") {
            self.config
                .remote_env
                .insert(name.to_owned(), value.to_owned());
            return;
        }
        if let Some(name) = key.strip_prefix("DEPS_ENV_") {
            self.config
                .deps_env
                .insert(name.to_owned(), value.to_owned());
            return;
        }
        if let Some(name) = key.strip_prefix("METRICS_TAG_") {
            self.config
                .metrics_tag
                .insert(name.to_owned(), value.to_owned());
            return;
        }

        let config = &mut self.config;
        match key {
            "SERVER" => self.server = Some(value.to_owned()),
            "CAS_SERVER" => self.cas_server = Some(value.to_owned()),
            "ACTION_CACHE_SERVER" => self.action_cache_server = Some(value.to_owned()),
            "INSTANCE" => self.instance = Some(value.to_owned()),
            "CAS_INSTANCE" => self.cas_instance = Some(value.to_owned()),
            "ACTION_CACHE_INSTANCE" => self.action_cache_instance = Some(value.to_owned()),
            "SERVER_AUTH_GOOGLEAPI" => config.server_auth_googleapi = parse_bool(value),
            "ACCESS_TOKEN_PATH" => config.access_token_path = value.to_owned(),
            "SERVER_SSL" => config.server_ssl = parse_bool(value),
            "RETRY_LIMIT" => {
                let v = Self::parse_u64(key, value) as u32;
                config.retry_limit = v;
            }
            "RETRY_DELAY" => {
                let v = Self::parse_u64(key, value);
                config.retry_delay_ms = v;
            }
            "REQUEST_TIMEOUT" => {
                let v = Self::parse_u64(key, value);
                config.request_timeout_secs = v;
            }
            "MIN_THROUGHPUT" => match parse_size(value) {
                Some(size) => config.min_throughput = size,
                None => warn!("ignoring malformed MIN_THROUGHPUT \"{}\"", value),
            },
            "KEEPALIVE_TIME" => {
                let v = Self::parse_u64(key, value);
                config.keepalive_time_secs = v;
            }
            "CACHE_ONLY" => config.cache_only = parse_bool(value),
            "COMPILE_CACHE_ONLY" => config.compile_cache_only = parse_bool(value),
            "LINK" => config.link = parse_bool(value),
            "LINK_METRICS_ONLY" => config.link_metrics_only = parse_bool(value),
            "LINK_CACHE_ONLY" => config.link_cache_only = parse_bool(value),
            "FORCE_REMOTE" => config.force_remote = parse_bool(value),
            "ACTION_UNCACHEABLE" => config.action_uncacheable = parse_bool(value),
            "SKIP_CACHE" => config.skip_cache = parse_bool(value),
            "DONT_SAVE_OUTPUT" => config.dont_save_output = parse_bool(value),
            "NO_EXECUTE" => config.no_execute = parse_bool(value),
            "VERIFY" => config.verify = parse_bool(value),
            "DEPS_OVERRIDE" => config.deps_override = Some(parse_set(value)),
            "DEPS_DIRECTORY_OVERRIDE" => config.deps_directory_override = value.to_owned(),
            "OUTPUT_FILES_OVERRIDE" => config.output_files_override = parse_set(value),
            "OUTPUT_DIRECTORIES_OVERRIDE" => {
                config.output_directories_override = parse_set(value)
            }
            "DEPS_EXCLUDE_PATHS" => config.deps_exclude_paths = parse_set(value),
            "DEPS_EXTRA_SYMLINKS" => config.deps_extra_symlinks = parse_set(value),
            "DEPS_GLOBAL_PATHS" => config.deps_global_paths = parse_bool(value),
            "COMPILATION_DATABASE" => config.compilation_database = value.to_owned(),
            "CLANG_SCAN_DEPS" => config.clang_scan_deps = value.to_owned(),
            "PROJECT_ROOT" => config.project_root = value.to_owned(),
            "NO_PATH_REWRITE" => config.no_path_rewrite = parse_bool(value),
            "PREFIX_MAP" => config.prefix_map = parse_prefix_map(value),
            "WORKING_DIR_PREFIX" => config.working_dir_prefix = value.to_owned(),
            "PRESERVE_ENV" => config.preserve_env = parse_bool(value),
            "ENV_TO_READ" => config.env_to_read = parse_set(value),
            "REAPI_VERSION" => config.reapi_version = value.to_owned(),
            "CAS_DIGEST_FUNCTION" => match value.parse() {
                Ok(function) => config.cas_digest_function = function,
                Err(e) => warn!("{:#}", e),
            },
            "ACTION_SALT" => config.action_salt = value.to_owned(),
            "MAX_THREADS" => match value.parse() {
                Ok(threads) => config.max_threads = threads,
                Err(_) => warn!("ignoring non-numeric MAX_THREADS \"{}\"", value),
            },
            "ENABLE_METRICS" => config.enable_metrics = parse_bool(value),
            "METRICS_FILE" => config.metrics_file = value.to_owned(),
            "METRICS_UDP_SERVER" => config.metrics_udp_server = value.to_owned(),
            "STATSD_FORMAT" => config.statsd_format = value.to_owned(),
            "COMPILATION_METADATA_UDP_PORT" => {
                config.compilation_metadata_udp_port = value.to_owned()
            }
            "LOG_LEVEL" => config.log_level = value.to_owned(),
            "LOG_DIRECTORY" => config.log_directory = value.to_owned(),
            "VERBOSE" => config.verbose = parse_bool(value),
            "RUNNER_COMMAND" => config.runner_command = value.to_owned(),
            "CACHE_UPLOAD_LOCAL_BUILD" => config.cache_upload_local_build = parse_bool(value),
            "CACHE_UPLOAD_FAILED_BUILD" => config.cache_upload_failed_build = parse_bool(value),
            "CORRELATED_INVOCATIONS_ID" => config.correlated_invocations_id = value.to_owned(),
            "CONFIG_PREFIX_DIR" => {} // consumed when locating config files
            _ => debug!("ignoring unknown configuration key \"{}\"", key),
        }
    }

    fn parse_file_contents(&mut self, contents: &str) {
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once('=') {
                Some((key, value)) => self.apply(key.trim(), value.trim()),
                None => warn!("ignoring malformed config line \"{}\"", line),
            }
        }
    }

    /// The deprecated SERVER_SSL switch prepends a scheme to bare
    /// host:port endpoints.
    fn backwards_compatible_url(&self, url: String) -> String {
        if url.is_empty() || url.contains("://") {
            return url;
        }
        let scheme = if self.config.server_ssl { "https" } else { "http" };
        info!(
            "endpoint \"{}\" has no URL scheme, assuming {}:// (please update your configuration)",
            url, scheme
        );
        format!("{}://{}", scheme, url)
    }

    fn finish(mut self) -> Result<Config> {
        // Endpoint defaulting: CAS falls back to the action cache's
        // endpoint and vice versa, with the execution server as the
        // final fallback for both.
        let server = self.server.clone().unwrap_or_default();
        let cas_server = self
            .cas_server
            .clone()
            .or_else(|| self.action_cache_server.clone())
            .unwrap_or_else(|| server.clone());
        let action_cache_server = self
            .action_cache_server
            .clone()
            .or_else(|| self.cas_server.clone())
            .unwrap_or_else(|| server.clone());
        self.config.server = self.backwards_compatible_url(server);
        self.config.cas_server = self.backwards_compatible_url(cas_server);
        self.config.action_cache_server = self.backwards_compatible_url(action_cache_server);

        // Instance names follow the same chain. Both defaults are taken
        // from the explicitly-set values in a single pass; an instance
        // still unset afterwards is the (valid) empty instance, never a
        // re-entry into the other name's resolution.
        let instance = self.instance.clone().unwrap_or_default();
        self.config.cas_instance = self
            .cas_instance
            .clone()
            .or_else(|| self.action_cache_instance.clone())
            .unwrap_or_else(|| instance.clone());
        self.config.action_cache_instance = self
            .action_cache_instance
            .or_else(|| self.cas_instance)
            .unwrap_or_else(|| instance.clone());
        self.config.instance = instance;

        if !REAPI_SUPPORTED_VERSIONS.contains(&self.config.reapi_version.as_str()) {
            bail!(
                "unsupported RECC_REAPI_VERSION \"{}\" (supported: {})",
                self.config.reapi_version,
                REAPI_SUPPORTED_VERSIONS.join(", ")
            );
        }
        version_string_to_pair(&self.config.reapi_version)?;

        if self.config.project_root.is_empty() {
            self.config.project_root = crate::paths::current_working_directory();
        }

        if self.config.correlated_invocations_id.is_empty() {
            self.config.correlated_invocations_id = uuid::Uuid::new_v4().to_string();
        }

        if !self.config.metrics_file.is_empty() && !self.config.metrics_udp_server.is_empty() {
            bail!("RECC_METRICS_FILE and RECC_METRICS_UDP_SERVER cannot both be set");
        }

        Ok(self.config)
    }
}

/// Configuration file locations in ascending priority; later files
/// override earlier ones, and the environment overrides them all.
fn config_file_locations() -> Vec<PathBuf> {
    let mut locations = Vec::new();

    if let Ok(exe) = env::current_exe() {
        if let Some(install_dir) = exe.parent().and_then(|bin| bin.parent()) {
            locations.push(install_dir.join("etc").join("recc"));
        }
    }
    if let Ok(prefix_dir) = env::var("RECC_CONFIG_PREFIX_DIR") {
        if !prefix_dir.is_empty() {
            locations.push(PathBuf::from(prefix_dir));
        }
    }
    if let Ok(home) = env::var("HOME") {
        if !home.is_empty() {
            locations.push(PathBuf::from(home).join(".recc"));
        }
    }
    if let Ok(cwd) = env::current_dir() {
        locations.push(cwd.join("recc"));
    }

    locations
}

impl Config {
    /// Read the configuration files and the process environment and
    /// produce the immutable configuration for this invocation.
    pub fn load() -> Result<Config> {
        let mut loader = Loader::default();

        for location in config_file_locations() {
            let path = location.join(CONFIG_FILE_NAME);
            if let Ok(contents) = std::fs::read_to_string(&path) {
                debug!("parsing configuration file {}", path.display());
                loader.parse_file_contents(&contents);
            }
        }

        let mut env_vars: Vec<(String, String)> = env::vars()
            .filter_map(|(key, value)| {
                key.strip_prefix("RECC_")
                    .map(|stripped| (stripped.to_owned(), value))
            })
            .collect();
        // Deterministic application order for map-valued families.
        env_vars.sort();
        for (key, value) in env_vars {
            loader.apply(&key, &value);
        }

        loader.finish()
    }

    pub fn reapi_version_at_least(&self, version: &str) -> bool {
        let configured = version_string_to_pair(&self.reapi_version)
            .expect("validated at configuration load time");
        let wanted = version_string_to_pair(version).expect("malformed version literal");
        configured >= wanted
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_bool() {
        for val in ["1", "true", "TRUE", "yes", "anything"] {
            assert!(parse_bool(val), "{}", val);
        }
        for val in ["", "0", "false", "False", "no", "off"] {
            assert!(!parse_bool(val), "{}", val);
        }
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("100"), Some(100));
        assert_eq!(parse_size("2K"), Some(2048));
        assert_eq!(parse_size("1M"), Some(1024 * 1024));
        assert_eq!(parse_size("10G"), Some(10 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("garbage"), None);
    }

    #[test]
    fn test_parse_prefix_map() {
        assert_eq!(
            parse_prefix_map("/usr/bin=/usr/local/bin:/opt=/remote/opt"),
            vec![
                ("/usr/bin".to_owned(), "/usr/local/bin".to_owned()),
                ("/opt".to_owned(), "/remote/opt".to_owned()),
            ]
        );
        assert!(parse_prefix_map("nonsense").is_empty());
    }

    #[test]
    fn test_server_defaulting_chain() {
        let mut loader = Loader::default();
        loader.apply("SERVER", "http://exec:1");
        let config = loader.finish().unwrap();
        assert_eq!(config.server, "http://exec:1");
        assert_eq!(config.cas_server, "http://exec:1");
        assert_eq!(config.action_cache_server, "http://exec:1");

        let mut loader = Loader::default();
        loader.apply("SERVER", "http://exec:1");
        loader.apply("ACTION_CACHE_SERVER", "http://ac:2");
        let config = loader.finish().unwrap();
        assert_eq!(config.cas_server, "http://ac:2");
        assert_eq!(config.action_cache_server, "http://ac:2");

        let mut loader = Loader::default();
        loader.apply("SERVER", "http://exec:1");
        loader.apply("CAS_SERVER", "http://cas:3");
        let config = loader.finish().unwrap();
        assert_eq!(config.cas_server, "http://cas:3");
        assert_eq!(config.action_cache_server, "http://cas:3");
    }

    #[test]
    fn test_instance_defaulting_is_single_pass() {
        let mut loader = Loader::default();
        loader.apply("INSTANCE", "main");
        loader.apply("CAS_INSTANCE", "cas-only");
        let config = loader.finish().unwrap();
        assert_eq!(config.instance, "main");
        assert_eq!(config.cas_instance, "cas-only");
        assert_eq!(config.action_cache_instance, "cas-only");

        let mut loader = Loader::default();
        loader.apply("ACTION_CACHE_INSTANCE", "");
        let config = loader.finish().unwrap();
        assert_eq!(config.cas_instance, "");
        assert_eq!(config.action_cache_instance, "");
    }

    #[test]
    fn test_map_valued_options() {
        let mut loader = Loader::default();
        loader.apply("REMOTE_ENV_PATH", "/usr/bin");
        loader.apply("REMOTE_PLATFORM_arch", "x86_64");
        loader.apply("COMPILE_REMOTE_PLATFORM_arch", "compile-arch");
        loader.apply("LINK_REMOTE_PLATFORM_arch", "link-arch");
        loader.apply("DEPS_ENV_LANG", "C");
        loader.apply("METRICS_TAG_host", "builder1");
        let config = loader.config;
        assert_eq!(config.remote_env["PATH"], "/usr/bin");
        assert_eq!(config.remote_platform["arch"], "x86_64");
        assert_eq!(config.compile_remote_platform["arch"], "compile-arch");
        assert_eq!(config.link_remote_platform["arch"], "link-arch");
        assert_eq!(config.deps_env["LANG"], "C");
        assert_eq!(config.metrics_tag["host"], "builder1");
    }

    #[test]
    fn test_config_file_contents() {
        let mut loader = Loader::default();
        loader.parse_file_contents(
            "# a comment\n\
             SERVER=http://localhost:8085\n\
             RETRY_LIMIT = 3\n\
             \n\
             DEPS_OVERRIDE=a.cpp, b.cpp\n\
             malformed line\n",
        );
        let config = loader.finish().unwrap();
        assert_eq!(config.server, "http://localhost:8085");
        assert_eq!(config.retry_limit, 3);
        assert_eq!(
            config.deps_override,
            Some(["a.cpp".to_owned(), "b.cpp".to_owned()].into())
        );
    }

    #[test]
    fn test_reapi_version_validation() {
        let mut loader = Loader::default();
        loader.apply("REAPI_VERSION", "3.0");
        assert!(loader.finish().is_err());

        let mut config = Config::default();
        config.reapi_version = "2.1".to_owned();
        assert!(config.reapi_version_at_least("2.0"));
        assert!(config.reapi_version_at_least("2.1"));
        assert!(!config.reapi_version_at_least("2.2"));
    }

    #[test]
    fn test_server_ssl_coercion() {
        let mut loader = Loader::default();
        loader.apply("SERVER_SSL", "1");
        loader.apply("SERVER", "localhost:8085");
        let config = loader.finish().unwrap();
        assert_eq!(config.server, "https://localhost:8085");
    }

    #[test]
    #[serial]
    fn test_load_reads_environment() {
        env::set_var("RECC_SERVER", "http://env-server:1234");
        env::set_var("RECC_FORCE_REMOTE", "1");
        let config = Config::load().unwrap();
        env::remove_var("RECC_SERVER");
        env::remove_var("RECC_FORCE_REMOTE");
        assert_eq!(config.server, "http://env-server:1234");
        assert!(config.force_remote);
    }
}
