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

//! Dependency resolution for link commands.
//!
//! The compiler driver is re-invoked with `-###` to recover the actual
//! linker invocation, which is then parsed with the linker rule table.
//! `-l` options are resolved against the effective search path, and the
//! transitive `DT_NEEDED` closure of every shared library found is walked
//! with the platform's object-file inspector.

use std::collections::{BTreeSet, HashMap, VecDeque};

use once_cell::sync::Lazy;
use regex::Regex;

use super::CommandFileInfo;
use crate::compiler::{CommandParser, ParsedCommand};
use crate::config::Config;
use crate::errors::*;
use crate::paths;
use crate::shell;
use crate::subprocess;
use crate::util;

/// Shared objects that are commonly linker scripts rather than ELF
/// files. They are base toolchain libraries, so when the inspector
/// chokes on one there is no need to chase its indirect dependencies.
const BASE_SYSTEM_LIBRARIES: &[&str] = &[
    "libc.so",
    "libgcc_s.so",
    "libm.so",
    "libpthread.so",
    "libstdc++.so",
    "libgfortran.so",
];

pub fn get_file_info(command: &ParsedCommand, config: &Config) -> Result<CommandFileInfo> {
    let mut result = CommandFileInfo::default();
    let products = super::determine_products(command)?;

    // This is a pure link command without source files as input.
    for product in products {
        result.possible_products.insert(paths::normalize_path(&product));
    }

    if !command.is_gcc() && !command.is_clang() && !command.is_sun_studio() {
        info!("unsupported compiler in link command");
        return Ok(result);
    }

    let linker_command = parse_linker_command(command, config)?;
    if !linker_command.is_link {
        bail!("unsupported linker command");
    }

    // All direct inputs of the linker command are dependencies.
    for input in &linker_command.inputs {
        result.dependencies.insert(input.clone());
    }
    for input in &linker_command.aux_inputs {
        result.dependencies.insert(input.clone());
    }

    let default_search_path = library_search_path(command, &linker_command)?;

    // Directories from the command line (-L) are searched before the
    // linker's default directories.
    let mut library_dirs = linker_command.library_dirs.clone();
    library_dirs.extend(default_search_path.iter().cloned());

    let mut static_libraries = linker_command.static_libraries.clone();

    // Queue of shared libraries whose DT_NEEDED entries still need to be
    // gathered, with a processed set for cycle breaking.
    let mut shared_library_queue: VecDeque<String> = VecDeque::new();
    let mut processed: BTreeSet<String> = BTreeSet::new();

    // First try to find a shared library for each `-l` option.
    for library in &linker_command.libraries {
        let filename = shared_library_filename(library);
        let mut found = false;
        for library_dir in &library_dirs {
            let library_path = format!("{}/{}", library_dir, filename);
            if util::is_regular_file(&library_path) {
                // Normalize lexically but don't follow symlinks; the
                // remote linker must find the library under the same
                // symlink name it has locally.
                let normalized = paths::normalize_path(&library_path);
                result.dependencies.insert(normalized.clone());
                shared_library_queue.push_back(normalized);
                found = true;
                break;
            }
        }
        if !found {
            static_libraries.insert(library.clone());
        }
    }

    // Then static libraries, for `-l` options without a shared hit or
    // with static linking requested. Missing here is fatal.
    for library in &static_libraries {
        let filename = static_library_filename(library);
        let mut found = false;
        for library_dir in &library_dirs {
            let library_path = format!("{}/{}", library_dir, filename);
            if util::is_regular_file(&library_path) {
                result.dependencies.insert(library_path);
                found = true;
                break;
            }
        }
        if !found {
            return Err(LibraryNotFound(filename).into());
        }
    }

    // Search path for dependencies of shared libraries (i.e. indirect
    // dependencies of the main target), per ld's `-rpath-link` docs.
    let mut rpath_dirs = linker_command.rpath_link_dirs.clone();
    rpath_dirs.extend(linker_command.rpath_dirs.iter().cloned());
    if rpath_dirs.is_empty() {
        add_directories_from_path(&mut rpath_dirs, "LD_RUN_PATH");
    }
    add_directories_from_path(&mut rpath_dirs, "LD_LIBRARY_PATH");
    if cfg!(target_os = "linux") {
        parse_ld_so_conf("/etc/ld.so.conf", &mut rpath_dirs);
    }
    rpath_dirs.extend(default_search_path.iter().cloned());

    while let Some(shared_library) = shared_library_queue.pop_front() {
        if !processed.insert(shared_library.clone()) {
            continue;
        }

        for filename in needed_libraries(&shared_library)? {
            let mut found = false;
            for rpath_dir in &rpath_dirs {
                let library_path = format!("{}/{}", rpath_dir, filename);
                if util::is_regular_file(&library_path) {
                    let normalized = paths::normalize_path(&library_path);
                    result.dependencies.insert(normalized.clone());
                    shared_library_queue.push_back(normalized);
                    found = true;
                    break;
                }
            }
            if !found {
                return Err(LibraryNotFound(filename).into());
            }
        }
    }

    Ok(result)
}

fn shared_library_filename(library: &str) -> String {
    match library.strip_prefix(':') {
        Some(exact) => exact.to_owned(),
        None => format!("lib{}.so", library),
    }
}

fn static_library_filename(library: &str) -> String {
    match library.strip_prefix(':') {
        Some(exact) => exact.to_owned(),
        None => format!("lib{}.a", library),
    }
}

/// Re-run the compiler driver with `-###` and parse the linker line it
/// would have executed.
fn parse_linker_command(command: &ParsedCommand, config: &Config) -> Result<ParsedCommand> {
    let mut probe = command.original_args.clone();
    probe.push("-###".to_owned());

    let result = subprocess::execute(&probe, true, true, &HashMap::new())?;
    if result.exit_code != 0 {
        error!("failed to execute: {}", probe.join(" "));
        error!("exit status: {}", result.exit_code);
        debug!("stdout: {}", result.stdout);
        debug!("stderr: {}", result.stderr);
        return Err(SubprocessFailed {
            exit_code: result.exit_code,
        }
        .into());
    }

    let mut linker_args: Vec<String> = Vec::new();
    let mut command_found = false;
    for line in result.stderr.lines() {
        if (command.is_gcc() || command.is_clang()) && line.starts_with(' ') {
            if command_found {
                // Pure link commands shouldn't execute multiple
                // subprocesses.
                bail!("unexpected second command in linker probe");
            }
            command_found = true;
            debug!("linker command: {}", line);
            linker_args = shell::split_command(line);
        } else if command.is_sun_studio() && !line.is_empty() && !line.starts_with('#') {
            let mut args = shell::split_command(line);
            if args.first().map(|a| paths::strip_directory(a)) == Some("ld") {
                if command_found {
                    bail!("unexpected second command in linker probe");
                }
                command_found = true;
                debug!("linker command: {}", line);
                // Drop stderr redirection.
                if args.len() > 2 && args[args.len() - 2] == "2>" {
                    args.truncate(args.len() - 2);
                }
                linker_args = args;
            }
        }
    }

    if !command_found {
        error!("unable to determine linker command: {}", probe.join(" "));
        debug!("stderr: {}", result.stderr);
        bail!("unable to determine linker command");
    }

    let cwd = paths::current_working_directory();
    CommandParser::new(config).parse_linker_command(&linker_args, &cwd)
}

/// The linker's default library search path. On Solaris it comes
/// straight off the linker command (`-Y P,`); elsewhere it is probed
/// with `-Wl,--verbose`, forwarding any `-m32`/`-m64` selection.
fn library_search_path(
    compiler_command: &ParsedCommand,
    linker_command: &ParsedCommand,
) -> Result<Vec<String>> {
    if cfg!(target_os = "solaris") {
        return Ok(linker_command.default_library_dirs.clone());
    }

    let mut probe = vec![compiler_command.original_args[0].clone()];
    for arg in &compiler_command.original_args {
        if arg == "-m32" || arg == "-m64" {
            probe.push(arg.clone());
        }
    }
    probe.push("-Wl,--verbose".to_owned());

    let result = subprocess::execute(&probe, true, true, &HashMap::new())?;
    Ok(search_dirs_from_linker_output(&result.stdout))
}

fn search_dirs_from_linker_output(output: &str) -> Vec<String> {
    static RE: Lazy<Regex> = Lazy::new(|| Regex::new("SEARCH_DIR\\(\"([^\n\"]+)\"\\)").unwrap());
    RE.captures_iter(output)
        .map(|captures| captures.get(1).unwrap().as_str().to_owned())
        .collect()
}

/// DT_NEEDED entries of a shared library, via the platform inspector.
fn needed_libraries(path: &str) -> Result<BTreeSet<String>> {
    let command: Vec<String> = if cfg!(target_os = "solaris") {
        vec!["elfdump".into(), "-d".into(), path.into()]
    } else {
        vec!["objdump".into(), "-p".into(), path.into()]
    };

    let result = subprocess::execute(&command, true, true, &HashMap::new())?;
    if result.exit_code != 0 {
        if BASE_SYSTEM_LIBRARIES.iter().any(|base| path.ends_with(base)) {
            return Ok(BTreeSet::new());
        }

        error!("failed to execute: {}", command.join(" "));
        error!("exit status: {}", result.exit_code);
        debug!("stdout: {}", result.stdout);
        debug!("stderr: {}", result.stderr);
        return Err(SubprocessFailed {
            exit_code: result.exit_code,
        }
        .into());
    }

    if cfg!(target_os = "solaris") {
        Ok(needed_from_elfdump_output(&result.stdout))
    } else {
        Ok(needed_from_objdump_output(&result.stdout))
    }
}

fn needed_from_objdump_output(output: &str) -> BTreeSet<String> {
    // Example:   NEEDED               libc.so.6
    static RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+NEEDED\s+(\S+)").unwrap());
    RE.captures_iter(output)
        .map(|captures| captures.get(1).unwrap().as_str().to_owned())
        .collect()
}

fn needed_from_elfdump_output(output: &str) -> BTreeSet<String> {
    // Example: [0]  NEEDED            0x7d4     libc.so.1
    static RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\[\d+\]\s+NEEDED\s+0x[0-9a-f]+\s+(\S+)").unwrap());
    RE.captures_iter(output)
        .map(|captures| captures.get(1).unwrap().as_str().to_owned())
        .collect()
}

/// Append the directories of a colon-separated path environment
/// variable, skipping entries that don't exist.
fn add_directories_from_path(directories: &mut Vec<String>, env_name: &str) {
    let Ok(path) = std::env::var(env_name) else {
        return;
    };
    for token in path.split(':') {
        if util::is_directory(token) {
            directories.push(token.to_owned());
        }
    }
}

/// Parse an `ld.so.conf`-style file into the runtime linker's search
/// path, following `include` directives with glob patterns.
fn parse_ld_so_conf(filename: &str, directories: &mut Vec<String>) {
    let Ok(contents) = std::fs::read_to_string(filename) else {
        return;
    };

    for line in contents.lines() {
        let line = line.split('#').next().unwrap_or("").trim();

        let is_include = line.starts_with("include")
            && matches!(line.as_bytes().get("include".len()), Some(b' ') | Some(b'\t'));
        if is_include {
            let mut pattern = line["include".len()..].trim().to_owned();
            if !pattern.starts_with('/') {
                // Relative include patterns resolve against the directory
                // of the including file.
                if let Some(slash) = filename.rfind('/') {
                    pattern = format!("{}{}", &filename[..slash + 1], pattern);
                }
            }
            match glob::glob(&pattern) {
                Ok(matches) => {
                    for path in matches.flatten() {
                        parse_ld_so_conf(&path.to_string_lossy(), directories);
                    }
                }
                Err(e) => {
                    error!("failed to evaluate include pattern in ld.so.conf: {}", e);
                }
            }
        } else if !line.is_empty() {
            directories.push(line.to_owned());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_library_filenames() {
        assert_eq!(shared_library_filename("pthread"), "libpthread.so");
        assert_eq!(shared_library_filename(":ld-linux.so.2"), "ld-linux.so.2");
        assert_eq!(static_library_filename("m"), "libm.a");
        assert_eq!(static_library_filename(":custom.a"), "custom.a");
    }

    #[test]
    fn test_needed_from_objdump_output() {
        let output = "\
Dynamic Section:
  NEEDED               libc.so.6
  NEEDED               libm.so.6
  SONAME               libfoo.so.1
";
        let needed = needed_from_objdump_output(output);
        assert_eq!(needed, ["libc.so.6".to_owned(), "libm.so.6".to_owned()].into());
    }

    #[test]
    fn test_needed_from_elfdump_output() {
        let output = "\
Dynamic Section:  .dynamic
     index  tag                value
       [0]  NEEDED            0x7d4     libc.so.1
       [1]  NEEDED            0x7e0     libm.so.2
";
        let needed = needed_from_elfdump_output(output);
        assert_eq!(needed, ["libc.so.1".to_owned(), "libm.so.2".to_owned()].into());
    }

    #[test]
    fn test_search_dirs_from_linker_output() {
        let output = "SEARCH_DIR(\"/usr/local/lib\"); SEARCH_DIR(\"/usr/lib\");\n";
        assert_eq!(
            search_dirs_from_linker_output(output),
            vec!["/usr/local/lib".to_owned(), "/usr/lib".to_owned()]
        );
    }

    #[test]
    fn test_parse_ld_so_conf_with_includes() {
        let dir = tempfile::tempdir().unwrap();
        let main_conf = dir.path().join("ld.so.conf");
        let sub_dir = dir.path().join("ld.so.conf.d");
        std::fs::create_dir(&sub_dir).unwrap();
        std::fs::write(&main_conf, "include ld.so.conf.d/*.conf\n/opt/lib # trailing\n").unwrap();
        std::fs::write(sub_dir.join("x.conf"), "/usr/local/lib64\n").unwrap();

        let mut directories = Vec::new();
        parse_ld_so_conf(&main_conf.to_string_lossy(), &mut directories);
        assert_eq!(
            directories,
            vec!["/usr/local/lib64".to_owned(), "/opt/lib".to_owned()]
        );
    }

    #[test]
    #[serial]
    fn test_add_directories_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().to_str().unwrap().to_owned();
        std::env::set_var(
            "RECC_TEST_LIBRARY_PATH",
            format!("{}:/definitely/not/there", existing),
        );
        let mut directories = Vec::new();
        add_directories_from_path(&mut directories, "RECC_TEST_LIBRARY_PATH");
        std::env::remove_var("RECC_TEST_LIBRARY_PATH");
        assert_eq!(directories, vec![existing]);
    }
}
