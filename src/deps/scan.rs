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

//! Bulk dependency scanning with `clang-scan-deps`.
//!
//! When a compilation database is available, the first recc invocation of
//! a build scans every translation unit in one subprocess and splits the
//! output into per-target rule files named by the target's digest. Later
//! invocations answer their dependency query with one file read instead
//! of one compiler subprocess each.
//!
//! The cache directory is created under an exclusive advisory lock and
//! atomically renamed into place; a failed population leaves an empty
//! directory behind so the rest of the build skips the scanner instead of
//! retrying it.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};

use crate::compiler::ParsedCommand;
use crate::config::Config;
use crate::errors::*;
use crate::metrics::{self, MetricsCollector};
use crate::shell;
use crate::subprocess;
use crate::util;

const DEPS_DIR_NAME: &str = "recc-scan-deps.d";
const PREDEFINED_HEADER_SUFFIX: &str = "recc-scan-deps.h";

/// One entry of a JSON compilation database, as emitted by cmake and
/// friends. Either `command` or `arguments` is present.
#[derive(Clone, Serialize, Deserialize)]
struct CompilationDatabaseEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    directory: Option<String>,
    file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<String>,
}

/// Answer a single `.o` target's dependency query from the scanner
/// cache. `None` means the caller should fall back to the per-invocation
/// dependency subprocess.
pub fn dependencies_for_target(
    command: &ParsedCommand,
    target: &str,
    config: &Config,
    metrics: &MetricsCollector,
) -> Option<BTreeSet<String>> {
    if !command.is_clang() && !command.is_gcc() {
        return None;
    }

    let deps_dir = match dependencies_directory(config, metrics) {
        Ok(Some(deps_dir)) => deps_dir,
        Ok(None) => return None,
        Err(e) => {
            error!("clang-scan-deps failed: {:#}", e);
            info!("falling back to dependencies command");
            metrics.record_counter(metrics::COUNTER_SCAN_DEPS_TARGET_FAILURE, 1);
            return None;
        }
    };

    match target_dependencies(&deps_dir, target, config) {
        Ok(Some(dependencies)) if !dependencies.is_empty() => {
            metrics.record_counter(metrics::COUNTER_SCAN_DEPS_TARGET_SUCCESS, 1);
            Some(dependencies)
        }
        Ok(_) => {
            // Expected for generated files.
            warn!("clang-scan-deps returned no dependencies for \"{}\"", target);
            info!("falling back to dependencies command");
            metrics.record_counter(metrics::COUNTER_SCAN_DEPS_TARGET_FAILURE, 1);
            None
        }
        Err(e) => {
            error!("clang-scan-deps failed: {:#}", e);
            info!("falling back to dependencies command");
            metrics.record_counter(metrics::COUNTER_SCAN_DEPS_TARGET_FAILURE, 1);
            None
        }
    }
}

/// Read the per-target rule file and validate that everything it lists
/// is still present and unmodified since the scan.
fn target_dependencies(
    deps_dir: &Path,
    target: &str,
    config: &Config,
) -> Result<Option<BTreeSet<String>>> {
    let target_digest = config.cas_digest_function.digest_of_string(target);
    let path = deps_dir.join(&target_digest.hash);
    if !util::is_regular_file(&path.to_string_lossy()) {
        return Ok(None);
    }

    let rules = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let raw_dependencies = super::dependencies_from_make_rules(&rules, false);

    let deps_timestamp = FileTime::from_last_modification_time(
        &std::fs::metadata(deps_dir).context("failed to stat dependencies directory")?,
    );

    let mut result = BTreeSet::new();
    for dependency in raw_dependencies {
        // Filter out the generated file for predefined macros.
        if dependency.contains(PREDEFINED_HEADER_SUFFIX) {
            continue;
        }

        let metadata = match std::fs::metadata(&dependency) {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => {
                warn!(
                    "\"{}\" was removed after the invocation of clang-scan-deps",
                    dependency
                );
                return Ok(None);
            }
        };
        if FileTime::from_last_modification_time(&metadata) > deps_timestamp {
            warn!(
                "\"{}\" was modified after the invocation of clang-scan-deps",
                dependency
            );
            return Ok(None);
        }

        result.insert(dependency);
    }

    Ok(Some(result))
}

/// Locate (and on first use, populate) the per-build dependencies
/// directory. `None` when the bulk scanner isn't enabled or applicable.
fn dependencies_directory(config: &Config, metrics: &MetricsCollector) -> Result<Option<PathBuf>> {
    if config.compilation_database.is_empty() {
        // Not enabled in configuration.
        return Ok(None);
    }

    // The compilation database may live above the working directory,
    // e.g. for cmake subdirectory builds driven by make.
    let mut top_build_dir = PathBuf::from(crate::paths::current_working_directory());
    while !top_build_dir.join(&config.compilation_database).is_file() {
        if !top_build_dir.pop() || top_build_dir.parent().is_none() {
            // Not found; incompatible build system or disabled.
            return Ok(None);
        }
    }

    let scan_deps_path = match which::which(&config.clang_scan_deps) {
        Ok(path) => path,
        Err(_) => return Ok(None),
    };

    info!(
        "using clang-scan-deps to get dependencies of {}",
        top_build_dir.join(&config.compilation_database).display()
    );

    let deps_dir = top_build_dir.join(DEPS_DIR_NAME);
    if deps_dir.is_dir() {
        // Already written by another recc process.
        return Ok(Some(deps_dir));
    }

    let lock_path = top_build_dir.join(format!("{}.lock", DEPS_DIR_NAME));
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .with_context(|| format!("failed to open lock file {}", lock_path.display()))?;
    let lock = match Flock::lock(lock_file, FlockArg::LockExclusive) {
        Ok(lock) => lock,
        Err((_, errno)) => bail!("failed to lock {}: {}", lock_path.display(), errno),
    };

    // Another process may have populated the directory while we waited.
    if deps_dir.is_dir() {
        return Ok(Some(deps_dir));
    }

    match populate_dependencies_directory(&top_build_dir, &scan_deps_path, &deps_dir, config) {
        Ok(()) => {
            metrics.record_counter(metrics::COUNTER_SCAN_DEPS_INVOCATION_SUCCESS, 1);
        }
        Err(e) => {
            metrics.record_counter(metrics::COUNTER_SCAN_DEPS_INVOCATION_FAILURE, 1);
            // Leave an empty directory behind so other recc processes
            // don't retry the scanner for every translation unit.
            std::fs::create_dir_all(&deps_dir).ok();
            let _ = std::fs::remove_file(&lock_path);
            drop(lock);
            return Err(e);
        }
    }

    let _ = std::fs::remove_file(&lock_path);
    drop(lock);

    Ok(Some(deps_dir))
}

fn populate_dependencies_directory(
    top_build_dir: &Path,
    scan_deps_path: &Path,
    deps_dir: &Path,
    config: &Config,
) -> Result<()> {
    // Generated headers go into a temporary directory so `*.h` glob
    // patterns in build systems don't pick them up.
    let header_dir = tempfile::Builder::new()
        .prefix("recc")
        .tempdir()
        .context("failed to create temporary header directory")?;

    let database_path = top_build_dir.join(&config.compilation_database);
    let contents = std::fs::read_to_string(&database_path)
        .with_context(|| format!("failed to read {}", database_path.display()))?;
    let entries: Vec<CompilationDatabaseEntry> = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse {}", database_path.display()))?;

    let mut modified_database = Vec::new();
    let mut extra_args_cache: HashMap<String, Vec<String>> = HashMap::new();

    for entry in entries {
        if !super::is_source_file(&entry.file) || !util::is_regular_file(&entry.file) {
            // Only C/C++ sources are supported, and the database may list
            // files that are generated later in the build.
            continue;
        }

        let arguments: Vec<String> = if let Some(command) = &entry.command {
            shell::split_command(command)
        } else if let Some(arguments) = &entry.arguments {
            arguments.clone()
        } else {
            bail!("command object in compilation database without arguments or command");
        };
        if arguments.is_empty() {
            bail!("command object in compilation database with empty argument list");
        }

        let extra_args =
            extra_args_for_scan_deps(&mut extra_args_cache, header_dir.path(), &arguments, config)?;
        let mut rewritten = vec![arguments[0].clone()];
        rewritten.extend(extra_args);
        rewritten.extend(arguments[1..].iter().cloned());

        let mut entry = entry;
        entry.command = None;
        entry.arguments = Some(rewritten);
        modified_database.push(entry);
    }

    let mut database_file = tempfile::NamedTempFile::new()
        .context("failed to create modified compilation database")?;
    serde_json::to_writer(&mut database_file, &modified_database)
        .context("failed to write modified compilation database")?;

    let scan_command = vec![
        scan_deps_path.to_string_lossy().into_owned(),
        format!(
            "--compilation-database={}",
            database_file.path().to_string_lossy()
        ),
    ];
    debug!(
        "getting dependencies using the command: {}",
        scan_command.join(" ")
    );

    let result = subprocess::execute(&scan_command, true, true, &config.deps_env)?;
    if result.exit_code != 0 {
        error!("failed to execute: {}", scan_command.join(" "));
        error!("exit status: {}", result.exit_code);
        debug!("stdout: {}", result.stdout);
        debug!("stderr: {}", result.stderr);
        return Err(SubprocessFailed {
            exit_code: result.exit_code,
        }
        .into());
    }

    let staging_dir = PathBuf::from(format!("{}.tmp", deps_dir.to_string_lossy()));
    std::fs::create_dir_all(&staging_dir)
        .with_context(|| format!("failed to create {}", staging_dir.display()))?;

    split_scan_deps_rules(&result.stdout, &staging_dir, config)?;

    std::fs::rename(&staging_dir, deps_dir).context("failed to rename dependencies directory")?;
    Ok(())
}

/// Split the scanner's output into one file per make rule, named by the
/// digest of the rule's target so a single lookup doesn't have to parse
/// the whole build's worth of rules.
fn split_scan_deps_rules(rules: &str, deps_dir: &Path, config: &Config) -> Result<()> {
    let bytes = rules.as_bytes();
    let mut targets = BTreeSet::new();
    let mut rule_start = 0;

    while rule_start < rules.len() {
        // Scan for an unescaped newline to find the end of the rule.
        let mut pos = rule_start;
        let rule_size;
        loop {
            match rules[pos..].find('\n') {
                None => {
                    rule_size = rules.len() - rule_start;
                    break;
                }
                Some(offset) => {
                    let newline = pos + offset;
                    if newline > 0 && bytes[newline - 1] == b'\\' {
                        // Escaped newline; the rule continues.
                        pos = newline + 1;
                    } else {
                        rule_size = newline + 1 - rule_start;
                        break;
                    }
                }
            }
        }

        let rule = &rules[rule_start..rule_start + rule_size];
        match rule.find(':') {
            Some(colon) => {
                let target = rule[..colon].trim();
                let target_digest = config.cas_digest_function.digest_of_string(target);
                let path = deps_dir.join(&target_digest.hash);

                if targets.insert(target.to_owned()) {
                    util::write_file_atomically(&path, rule.as_bytes())?;
                } else {
                    // Duplicate target name; remove the rule file so
                    // lookups fall back to the dependencies command.
                    match std::fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => {
                            return Err(e).with_context(|| {
                                format!("failed to remove file \"{}\"", path.display())
                            })
                        }
                    }
                }
            }
            None if !rule.trim().is_empty() => {
                bail!("failed to parse clang-scan-deps rule: {}", rule);
            }
            None => {}
        }

        rule_start += rule_size;
    }

    Ok(())
}

/// Determine the predefined macros and system include directories of the
/// actual compiler, so scans match what the compiler itself would see
/// even when it isn't the scanner's own toolchain.
///
/// Results are cached by the compiler executable plus the flags that can
/// affect predefined macros or include paths.
fn extra_args_for_scan_deps(
    cache: &mut HashMap<String, Vec<String>>,
    base_dir: &Path,
    arguments: &[String],
    config: &Config,
) -> Result<Vec<String>> {
    let mut probe_command = vec![arguments[0].clone()];
    let mut compiler_key = arguments[0].clone();

    for argument in arguments {
        if argument.starts_with("-std=")
            || argument.starts_with("-O")
            || argument.starts_with("-f")
            || argument.starts_with("-m")
            || argument == "-undef"
            || argument == "-nostdinc"
        {
            probe_command.push(argument.clone());
            compiler_key.push(' ');
            compiler_key.push_str(argument);
        }
    }

    if let Some(cached) = cache.get(&compiler_key) {
        return Ok(cached.clone());
    }

    let empty_header = base_dir.join("recc-empty.h");
    std::fs::write(&empty_header, "").context("failed to create empty header")?;

    probe_command.push("-E".to_owned());
    probe_command.push("-dM".to_owned());
    probe_command.push("-Wp,-v".to_owned());
    probe_command.push(empty_header.to_string_lossy().into_owned());

    let result = subprocess::execute(&probe_command, true, true, &config.deps_env)?;
    if result.exit_code != 0 {
        error!("failed to execute: {}", probe_command.join(" "));
        error!("exit status: {}", result.exit_code);
        debug!("stdout: {}", result.stdout);
        debug!("stderr: {}", result.stderr);
        return Err(SubprocessFailed {
            exit_code: result.exit_code,
        }
        .into());
    }

    let mut extra_args = vec!["-undef".to_owned(), "-nostdinc".to_owned()];

    let key_digest = config.cas_digest_function.digest_of_string(&compiler_key);
    let predefined_header = base_dir.join(format!("{}-{}", key_digest.hash, PREDEFINED_HEADER_SUFFIX));
    util::write_file_atomically(&predefined_header, result.stdout.as_bytes())?;
    extra_args.push("-include".to_owned());
    extra_args.push(predefined_header.to_string_lossy().into_owned());

    // The system include directories are listed on stderr between the
    // search-list markers.
    let mut in_search_list = false;
    for line in result.stderr.lines() {
        if line == "#include <...> search starts here:" {
            in_search_list = true;
        } else if line == "End of search list." {
            break;
        } else if in_search_list {
            extra_args.push("-idirafter".to_owned());
            extra_args.push(line.trim_start().to_owned());
        }
    }

    cache.insert(compiler_key, extra_args.clone());
    Ok(extra_args)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::digest::DigestFunction;

    fn target_path(deps_dir: &Path, target: &str) -> PathBuf {
        let digest = DigestFunction::Sha256.digest_of_string(target);
        deps_dir.join(&digest.hash)
    }

    #[test]
    fn test_split_scan_deps_rules_one_file_per_target() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let rules = "a.o: \\\n  /src/a.cpp \\\n  /usr/include/x.h\nb.o: /src/b.cpp\n";
        split_scan_deps_rules(rules, dir.path(), &config).unwrap();

        let a_rule = std::fs::read_to_string(target_path(dir.path(), "a.o")).unwrap();
        assert!(a_rule.contains("/src/a.cpp"));
        assert!(a_rule.contains("/usr/include/x.h"));
        let b_rule = std::fs::read_to_string(target_path(dir.path(), "b.o")).unwrap();
        assert!(b_rule.contains("/src/b.cpp"));
    }

    #[test]
    fn test_split_scan_deps_rules_duplicate_target_is_tombstoned() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let rules = "dup.o: /src/one.cpp\ndup.o: /src/two.cpp\n";
        split_scan_deps_rules(rules, dir.path(), &config).unwrap();
        assert!(!target_path(dir.path(), "dup.o").exists());
    }

    #[test]
    fn test_split_scan_deps_rules_garbage_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        assert!(split_scan_deps_rules("no colon here\n", dir.path(), &config).is_err());
    }

    #[test]
    fn test_target_dependencies_validates_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();

        // The source predates the dependencies directory, as it would
        // after a real scan.
        let source = dir.path().join("a.cpp");
        std::fs::write(&source, "int main() {}\n").unwrap();

        let deps_dir = dir.path().join(DEPS_DIR_NAME);
        std::fs::create_dir(&deps_dir).unwrap();

        let rule = format!("a.o: {}\n", source.display());
        std::fs::write(target_path(&deps_dir, "a.o"), &rule).unwrap();

        let deps = target_dependencies(&deps_dir, "a.o", &config).unwrap().unwrap();
        assert!(deps.contains(&source.to_string_lossy().into_owned()));

        // Touch the source file into the future; the cache entry must be
        // considered stale.
        let future = FileTime::from_unix_time(FileTime::now().unix_seconds() + 1000, 0);
        filetime::set_file_mtime(&source, future).unwrap();
        assert!(target_dependencies(&deps_dir, "a.o", &config)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_target_dependencies_missing_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        assert!(target_dependencies(dir.path(), "missing.o", &config)
            .unwrap()
            .is_none());
    }
}
