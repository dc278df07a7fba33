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

//! Assembly of the REAPI `Command` and `Action` messages.
//!
//! Everything that would make remoting unsafe surfaces here as
//! [`BuildOutcome::RunLocally`] rather than an error: unsupported
//! commands, failed dependency scans, empty input or product sets, and
//! outputs that escape the working directory.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use crate::compiler::ParsedCommand;
use crate::config::Config;
use crate::deps::{self, CommandFileInfo};
use crate::errors::*;
use crate::merkle::{self, NestedDirectory};
use crate::metrics::{self, MetricsCollector};
use crate::paths;
use crate::protos::re;
use crate::util;

/// Environment variables whose values are colon-separated path lists;
/// each segment goes through the prefix map individually.
const PATH_LIKE_ENV_VARS: &[&str] = &[
    "PATH",
    "LD_LIBRARY_PATH",
    "CPATH",
    "C_INCLUDE_PATH",
    "CPLUS_INCLUDE_PATH",
    "OBJC_INCLUDE_PATH",
    "OBJCPLUS_INCLUDE_PATH",
    "COMPILER_PATH",
    "LIBRARY_PATH",
    "LIB_PATH",
];

/// Local fallback expressed as data, not as an error: building an action
/// either produces one or decides the command should run locally.
#[derive(Debug)]
pub enum BuildOutcome {
    RunLocally,
    Action(Box<BuiltAction>),
}

#[derive(Debug)]
pub struct BuiltAction {
    pub action: re::Action,
    pub products: BTreeSet<String>,
}

pub struct ActionBuilder<'a> {
    config: &'a Config,
    metrics: MetricsCollector,
}

impl<'a> ActionBuilder<'a> {
    pub fn new(config: &'a Config, metrics: MetricsCollector) -> ActionBuilder<'a> {
        ActionBuilder { config, metrics }
    }

    /// Build the `Action` for a parsed command, filling `blobs` with the
    /// serialized messages and `file_paths` with the on-disk content both
    /// keyed by digest.
    pub fn build_action(
        &self,
        command: &ParsedCommand,
        cwd: &str,
        environment: &HashMap<String, String>,
        blobs: &mut HashMap<re::Digest, Vec<u8>>,
        file_paths: &mut HashMap<re::Digest, String>,
    ) -> Result<BuildOutcome> {
        let config = self.config;

        if !command.is_compile && !command.is_link && !config.force_remote {
            return Ok(BuildOutcome::RunLocally);
        }

        match command.remote_args.first() {
            Some(argv0) if argv0.contains('/') => {}
            argv0 => {
                return Err(UsageError(format!(
                    "invalid argv[0] value \"{}\": the Remote Execution API requires it to \
                     specify either a relative or absolute path to an executable",
                    argv0.map(String::as_str).unwrap_or("")
                ))
                .into());
            }
        }

        let mut tree = NestedDirectory::default();
        let mut products: BTreeSet<String> = config.output_files_override.clone();
        let mut working_directory: String;

        if !config.deps_directory_override.is_empty() {
            debug!("building Merkle tree using directory override");
            // Symlinks are recorded, never followed, so a link loop in
            // the override directory can't make this spin.
            tree = merkle::make_nested_directory(
                Path::new(&config.deps_directory_override),
                config.cas_digest_function,
                file_paths,
            )?;

            let replaced_root = normalize_replace_root(&config.deps_directory_override, config);
            debug!(
                "mapping local directory [{}] to remote directory [{}]",
                config.deps_directory_override, replaced_root
            );
            tree = tree.wrapped_under(&replaced_root);

            working_directory = config.working_dir_prefix.clone();
        } else {
            let deps: BTreeSet<String>;
            if config.deps_override.is_none() && !config.force_remote {
                let file_info = match self.get_dependencies(command) {
                    Ok(file_info) => file_info,
                    Err(e) => {
                        if e.downcast_ref::<SubprocessFailed>().is_some() {
                            // Rerunning locally shows the compiler's own
                            // diagnostics for the failure.
                            debug!("running locally to display the error");
                        } else {
                            info!("{:#}", e);
                        }
                        return Ok(BuildOutcome::RunLocally);
                    }
                };

                deps = file_info.dependencies;
                if config.output_directories_override.is_empty()
                    && config.output_files_override.is_empty()
                {
                    products = file_info.possible_products;
                }

                // Without dependencies there would be no input files in
                // the remote; without products nothing recc understands
                // is being compiled.
                if deps.is_empty() {
                    info!("no deps found, running locally");
                    return Ok(BuildOutcome::RunLocally);
                }
                if products.is_empty() {
                    info!("no products found, running locally");
                    return Ok(BuildOutcome::RunLocally);
                }
            } else {
                deps = config.deps_override.clone().unwrap_or_default();
            }

            // filesystem path -> transformed merkle-tree path
            let mut dependency_pairs: Vec<(String, String)> = Vec::new();
            for dep in &deps {
                let mut modified = dep.clone();
                if modified.starts_with('/') {
                    modified = paths::resolve_path_from_prefix_map(&modified, config);
                    modified = paths::rewrite_path_to_relative(&modified, cwd, config);
                    debug!("mapping local path [{}] to remote path [{}]", dep, modified);
                }
                dependency_pairs.push((dep.clone(), modified));
            }

            if config.no_path_rewrite && config.working_dir_prefix.is_empty() {
                working_directory = cwd.trim_start_matches('/').to_owned();
            } else {
                let common_ancestor = common_ancestor_path(&dependency_pairs, &products, cwd)?;
                working_directory =
                    prefix_working_directory(&common_ancestor, &config.working_dir_prefix);
            }

            let _timer = self.metrics.timer(metrics::TIMER_BUILD_MERKLE_TREE);
            merkle::build_merkle_tree(
                &dependency_pairs,
                &working_directory,
                config,
                &mut tree,
                file_paths,
            )?;
        }

        if !working_directory.is_empty() {
            working_directory = paths::normalize_path(&working_directory);
            // The remote side chdirs into it, so it must exist in the
            // input root even when no input lives there.
            tree.add_directory(&working_directory);
        }

        if command.upload_all_include_dirs {
            for include_dir in &command.include_dirs {
                let resolved =
                    merkle::resolve_merkle_path(include_dir, &working_directory, config, |dir| {
                        tree.add_directory(dir)
                    });
                if let Some(path) = resolved {
                    tree.add_directory(&path);
                }
            }
        }

        for symlink in &config.deps_extra_symlinks {
            if !util::is_symlink(symlink) {
                continue;
            }
            let Ok(target) = std::fs::read_link(symlink) else {
                continue;
            };
            let replaced = paths::modify_path_for_remote(symlink, cwd, true, config);
            let resolved = merkle::resolve_merkle_path(&replaced, &working_directory, config, |dir| {
                tree.add_directory(dir)
            });
            if let Some(path) = resolved {
                tree.add_symlink(&path, &target.to_string_lossy());
            }
        }

        for product in &products {
            if product.starts_with('/') {
                debug!(
                    "command produces a file in a location unrelated to the current \
                     directory, so running locally"
                );
                debug!("(use RECC_OUTPUT_[FILES|DIRECTORIES]_OVERRIDE to override)");
                return Ok(BuildOutcome::RunLocally);
            }
        }

        let input_root_digest = tree.to_digest(config.cas_digest_function, blobs);

        if config.link_metrics_only && command.is_link && !config.force_remote {
            // Action cache entry for metric collection only; don't keep
            // linker output.
            products.clear();
        }

        let remote_env = prepare_remote_env(command, config, environment);
        let command_proto = generate_command_proto(
            &command.remote_args,
            &products,
            &config.output_directories_override,
            &remote_env,
            &config.remote_platform,
            &working_directory,
            config,
        );
        debug!("command: {:?}", command_proto);

        let (command_digest, encoded) = config.cas_digest_function.digest_of_message(&command_proto);
        blobs.insert(command_digest.clone(), encoded);

        let mut action = re::Action {
            command_digest: Some(command_digest),
            input_root_digest: Some(input_root_digest),
            do_not_cache: config.action_uncacheable,
            salt: config.action_salt.as_bytes().to_vec(),
            platform: None,
        };

        // REAPI v2.2 duplicates the platform into the Action so servers
        // can route without dereferencing the Command.
        if config.reapi_version_at_least("2.2") {
            action.platform = Some(command_proto.platform.clone().unwrap_or_default());
        }

        Ok(BuildOutcome::Action(Box::new(BuiltAction { action, products })))
    }

    fn get_dependencies(&self, command: &ParsedCommand) -> Result<CommandFileInfo> {
        if command.is_link {
            let _timer = self.metrics.timer(metrics::TIMER_LINKER_DEPS);
            deps::link::get_file_info(command, self.config)
        } else {
            let _timer = self.metrics.timer(metrics::TIMER_COMPILER_DEPS);
            deps::get_file_info(command, self.config, &self.metrics)
        }
    }
}

/// Prefix-replace and normalize a local root directory, prepending the
/// working-directory prefix when the result stays relative.
fn normalize_replace_root(path: &str, config: &Config) -> String {
    let replaced = paths::resolve_path_from_prefix_map(path, config);
    let mut relative = paths::rewrite_path_to_relative(&replaced, &config.project_root, config);

    if !relative.starts_with('/') && !config.working_dir_prefix.is_empty() {
        relative = format!("{}/{}", config.working_dir_prefix, relative);
    }
    paths::normalize_path(&relative)
}

/// The minimum number of trailing cwd segments needed so that every
/// dependency and product stays representable as a non-escaping relative
/// path.
fn common_ancestor_path(
    dependency_pairs: &[(String, String)],
    products: &BTreeSet<String>,
    cwd: &str,
) -> Result<String> {
    let mut parents_needed = 0;
    for (_, remote_path) in dependency_pairs {
        parents_needed = parents_needed.max(paths::parent_directory_levels(remote_path));
    }
    for product in products {
        parents_needed = parents_needed.max(paths::parent_directory_levels(product));
    }

    paths::last_n_segments(cwd, parents_needed as usize)
}

fn prefix_working_directory(working_directory: &str, prefix: &str) -> String {
    if prefix.is_empty() {
        return working_directory.to_owned();
    }
    format!("{}/{}", prefix, working_directory)
}

/// Select the environment the remote command sees.
///
/// By default a per-family whitelist of variables is read from the local
/// environment; `preserve_env` forwards everything not prefixed `RECC_`,
/// and explicit `remote_env` overrides win over both. Path-like variables
/// have each segment run through the prefix map.
pub fn prepare_remote_env(
    command: &ParsedCommand,
    config: &Config,
    environment: &HashMap<String, String>,
) -> BTreeMap<String, String> {
    let mut remote_env = BTreeMap::new();
    let mut env_to_read = config.env_to_read.clone();

    if config.preserve_env {
        for (key, value) in environment {
            if !key.starts_with("RECC_") {
                remote_env.insert(key.clone(), value.clone());
            }
        }
    } else if env_to_read.is_empty() {
        let mut whitelist: Vec<&str> = vec![
            "PATH",
            "LD_LIBRARY_PATH",
            "LANG",
            "LC_CTYPE",
            "LC_MESSAGES",
            "LC_ALL",
        ];

        if command.is_gcc() || command.is_clang() {
            whitelist.extend([
                "CPATH",
                "C_INCLUDE_PATH",
                "CPLUS_INCLUDE_PATH",
                "OBJC_INCLUDE_PATH",
                "OBJCPLUS_INCLUDE_PATH",
                "SOURCE_DATE_EPOCH",
            ]);
        }
        if command.is_gcc() {
            whitelist.extend([
                "GCC_COMPARE_DEBUG",
                "GCC_EXEC_PREFIX",
                "COMPILER_PATH",
                "LIBRARY_PATH",
                "GCC_EXTRA_DIAGNOSTIC_OUTPUT",
                "DEPENDENCIES_OUTPUT",
                "GOMP_CPU_AFFINITY",
                "GOMP_DEBUG",
                "GOMP_STACKSIZE",
                "GOMP_SPINCOUNT",
                "GOMP_RTEMS_THREAD_POOLS",
            ]);
        }
        if command.is_gcc() || command.is_sun_studio() {
            whitelist.push("SUNPRO_DEPENDENCIES");
        }
        if command.is_sun_studio() {
            whitelist.extend(["PARALLEL", "STACKSIZE"]);
        }
        if command.is_aix() {
            whitelist.extend(["LIBPATH", "NLSPATH", "OBJECT_MODE", "XLC_USR_CONFIG"]);
        }

        whitelist.extend([
            "OMP_CANCELLATION",
            "OMP_DISPLAY_ENV",
            "OMP_DYNAMIC",
            "OMP_MAX_ACTIVE_LEVELS",
            "OMP_MAX_TASK_PRIORITY",
            "OMP_NESTED",
            "OMP_NUM_TEAMS",
            "OMP_NUM_THREADS",
            "OMP_PROC_BIND",
            "OMP_PLACES",
            "OMP_STACKSIZE",
            "OMP_SCHEDULE",
            "OMP_TARGET_OFFLOAD",
            "OMP_TEAMS_THREAD_LIMIT",
            "OMP_THREAD_LIMIT",
            "OMP_WAIT_POLICY",
        ]);

        env_to_read.extend(whitelist.into_iter().map(str::to_owned));
    }

    for name in &env_to_read {
        let Some(value) = environment.get(name) else {
            continue;
        };
        if PATH_LIKE_ENV_VARS.contains(&name.as_str()) && !value.is_empty() {
            let mapped: Vec<String> = value
                .split(':')
                .filter(|segment| !segment.is_empty())
                .map(|segment| paths::resolve_path_from_prefix_map(segment, config))
                .collect();
            remote_env.insert(name.clone(), mapped.join(":"));
        } else {
            remote_env.insert(name.clone(), value.clone());
        }
    }

    for (name, value) in &config.remote_env {
        remote_env.insert(name.clone(), value.clone());
    }

    remote_env
}

/// Assemble the REAPI `Command`. The `output_paths` field is used iff
/// the negotiated version is at least 2.1; older servers get the split
/// `output_files`/`output_directories` fields.
pub fn generate_command_proto(
    arguments: &[String],
    products: &BTreeSet<String>,
    output_directories: &BTreeSet<String>,
    remote_env: &BTreeMap<String, String>,
    platform_map: &BTreeMap<String, String>,
    working_directory: &str,
    config: &Config,
) -> re::Command {
    // If relative dependency paths were made absolute through the prefix
    // map, the working directory needs the same replacement.
    let resolved_working_directory = paths::resolve_path_from_prefix_map(working_directory, config);

    let mut command = re::Command {
        arguments: arguments.to_vec(),
        working_directory: resolved_working_directory,
        ..Default::default()
    };

    for (name, value) in remote_env {
        command
            .environment_variables
            .push(re::command::EnvironmentVariable {
                name: name.clone(),
                value: value.clone(),
            });
    }

    let output_paths_supported = config.reapi_version_at_least("2.1");
    for file in products {
        if output_paths_supported {
            command.output_paths.push(file.clone());
        } else {
            command.output_files.push(file.clone());
        }
    }
    for directory in output_directories {
        if output_paths_supported {
            command.output_paths.push(directory.clone());
        } else {
            command.output_directories.push(directory.clone());
        }
    }

    let mut platform = re::Platform::default();
    for (name, value) in platform_map {
        if !value.is_empty() {
            platform.properties.push(re::platform::Property {
                name: name.clone(),
                value: value.clone(),
            });
        }
    }
    if !platform.properties.is_empty() {
        command.platform = Some(platform);
    }

    command
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compiler::CommandParser;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn parse(config: &Config, list: &[&str]) -> ParsedCommand {
        CommandParser::new(config)
            .parse_command(&args(list), "/cwd")
            .unwrap()
    }

    fn pairs(list: &[(&str, &str)]) -> Vec<(String, String)> {
        list.iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    #[test]
    fn test_common_ancestor_path() {
        let products: BTreeSet<String> = ["hello.o".to_owned()].into();
        assert_eq!(
            common_ancestor_path(&pairs(&[("hello.cpp", "hello.cpp")]), &products, "/a/b/c")
                .unwrap(),
            ""
        );

        assert_eq!(
            common_ancestor_path(&pairs(&[("../x.h", "../x.h")]), &products, "/a/b/c").unwrap(),
            "c"
        );

        let escaping_products: BTreeSet<String> = ["../../out.o".to_owned()].into();
        assert_eq!(
            common_ancestor_path(&pairs(&[]), &escaping_products, "/a/b/c").unwrap(),
            "b/c"
        );
    }

    #[test]
    fn test_prefix_working_directory() {
        assert_eq!(prefix_working_directory("", ""), "");
        assert_eq!(prefix_working_directory("b/c", ""), "b/c");
        assert_eq!(prefix_working_directory("", "recc-build"), "recc-build/");
        assert_eq!(prefix_working_directory("b/c", "recc-build"), "recc-build/b/c");
    }

    #[test]
    fn test_prepare_remote_env_whitelist() {
        let config = Config::default();
        let command = parse(&config, &["gcc", "-c", "hello.cpp"]);

        let mut environment = HashMap::new();
        environment.insert("PATH".to_owned(), "/usr/bin".to_owned());
        environment.insert("LANG".to_owned(), "C.UTF-8".to_owned());
        environment.insert("HOME".to_owned(), "/home/user".to_owned());
        environment.insert("RECC_SERVER".to_owned(), "http://x".to_owned());

        let remote_env = prepare_remote_env(&command, &config, &environment);
        assert_eq!(remote_env["PATH"], "/usr/bin");
        assert_eq!(remote_env["LANG"], "C.UTF-8");
        assert!(!remote_env.contains_key("HOME"));
        assert!(!remote_env.contains_key("RECC_SERVER"));
    }

    #[test]
    fn test_prepare_remote_env_preserve_env() {
        let mut config = Config::default();
        config.preserve_env = true;
        let command = parse(&config, &["gcc", "-c", "hello.cpp"]);

        let mut environment = HashMap::new();
        environment.insert("HOME".to_owned(), "/home/user".to_owned());
        environment.insert("RECC_SERVER".to_owned(), "http://x".to_owned());

        let remote_env = prepare_remote_env(&command, &config, &environment);
        assert_eq!(remote_env["HOME"], "/home/user");
        assert!(!remote_env.contains_key("RECC_SERVER"));
    }

    #[test]
    fn test_prepare_remote_env_overrides_win() {
        let mut config = Config::default();
        config
            .remote_env
            .insert("PATH".to_owned(), "/remote/bin".to_owned());
        let command = parse(&config, &["gcc", "-c", "hello.cpp"]);

        let mut environment = HashMap::new();
        environment.insert("PATH".to_owned(), "/usr/bin".to_owned());

        let remote_env = prepare_remote_env(&command, &config, &environment);
        assert_eq!(remote_env["PATH"], "/remote/bin");
    }

    #[test]
    fn test_prepare_remote_env_prefix_maps_path_segments() {
        let mut config = Config::default();
        config.prefix_map = vec![("/usr/bin".to_owned(), "/remote/bin".to_owned())];
        let command = parse(&config, &["gcc", "-c", "hello.cpp"]);

        let mut environment = HashMap::new();
        environment.insert(
            "PATH".to_owned(),
            "/usr/bin:/opt/tools:/usr/bin/extra".to_owned(),
        );

        let remote_env = prepare_remote_env(&command, &config, &environment);
        assert_eq!(remote_env["PATH"], "/remote/bin:/opt/tools:/remote/bin/extra");
    }

    #[test]
    fn test_command_proto_output_paths_by_reapi_version() {
        let products: BTreeSet<String> = ["hello.o".to_owned()].into();
        let empty = BTreeSet::new();
        let env = BTreeMap::new();
        let platform = BTreeMap::new();

        let mut config = Config::default();
        config.reapi_version = "2.1".to_owned();
        let command = generate_command_proto(
            &args(&["./gcc", "-c", "hello.cpp"]),
            &products,
            &empty,
            &env,
            &platform,
            "",
            &config,
        );
        assert_eq!(command.output_paths, vec!["hello.o"]);
        assert!(command.output_files.is_empty());

        config.reapi_version = "2.0".to_owned();
        let command = generate_command_proto(
            &args(&["./gcc", "-c", "hello.cpp"]),
            &products,
            &empty,
            &env,
            &platform,
            "",
            &config,
        );
        assert!(command.output_paths.is_empty());
        assert_eq!(command.output_files, vec!["hello.o"]);
    }

    #[test]
    fn test_command_proto_drops_empty_platform_values() {
        let mut platform = BTreeMap::new();
        platform.insert("ISA".to_owned(), "x86-64".to_owned());
        platform.insert("empty".to_owned(), String::new());

        let command = generate_command_proto(
            &args(&["./gcc"]),
            &BTreeSet::new(),
            &BTreeSet::new(),
            &BTreeMap::new(),
            &platform,
            "",
            &Config::default(),
        );
        let properties = &command.platform.as_ref().unwrap().properties;
        assert_eq!(properties.len(), 1);
        assert_eq!(properties[0].name, "ISA");

        let command = generate_command_proto(
            &args(&["./gcc"]),
            &BTreeSet::new(),
            &BTreeSet::new(),
            &BTreeMap::new(),
            &BTreeMap::new(),
            "",
            &Config::default(),
        );
        assert!(command.platform.is_none());
    }

    #[test]
    fn test_build_action_runs_locally_for_plain_commands() {
        let config = Config::default();
        let metrics = MetricsCollector::new();
        let builder = ActionBuilder::new(&config, metrics);
        let command = parse(&config, &["ls", "-la"]);

        let mut blobs = HashMap::new();
        let mut file_paths = HashMap::new();
        let outcome = builder
            .build_action(&command, "/cwd", &HashMap::new(), &mut blobs, &mut file_paths)
            .unwrap();
        assert!(matches!(outcome, BuildOutcome::RunLocally));
    }

    #[test]
    fn test_build_action_rejects_bare_argv0() {
        let mut config = Config::default();
        config.force_remote = true;
        config.deps_override = Some(BTreeSet::new());
        let metrics = MetricsCollector::new();
        let builder = ActionBuilder::new(&config, metrics);
        let command = parse(&config, &["gcc", "-c", "hello.cpp"]);

        let mut blobs = HashMap::new();
        let mut file_paths = HashMap::new();
        let err = builder
            .build_action(&command, "/cwd", &HashMap::new(), &mut blobs, &mut file_paths)
            .unwrap_err();
        assert!(err.downcast_ref::<UsageError>().is_some());
    }

    #[test]
    fn test_build_action_escaping_product_runs_locally() {
        let mut config = Config::default();
        config.force_remote = true;
        config.deps_override = Some(BTreeSet::new());
        config.output_files_override.insert("/abs/out.o".to_owned());
        let metrics = MetricsCollector::new();
        let builder = ActionBuilder::new(&config, metrics);
        let command = parse(&config, &["/bin/ls"]);

        let mut blobs = HashMap::new();
        let mut file_paths = HashMap::new();
        let outcome = builder
            .build_action(&command, "/cwd", &HashMap::new(), &mut blobs, &mut file_paths)
            .unwrap();
        assert!(matches!(outcome, BuildOutcome::RunLocally));
    }
}
