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

//! Dependency discovery for compile commands and product derivation for
//! both compile and link commands.
//!
//! The default path invokes the compiler's own dependency-output mode as
//! a subprocess and parses the resulting make rules; an opt-in bulk
//! scanner cache (see [`scan`]) can answer instead when a compilation
//! database is available.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::compiler::ParsedCommand;
use crate::config::Config;
use crate::errors::*;
use crate::metrics::MetricsCollector;
use crate::paths;
use crate::subprocess;

pub mod link;
pub mod scan;

/// The file sets computed for one invocation: what must be uploaded and
/// what the command is expected to produce.
#[derive(Debug, Default)]
pub struct CommandFileInfo {
    pub dependencies: BTreeSet<String>,
    pub possible_products: BTreeSet<String>,
}

const HEADER_SUFFIXES: &[&str] = &["h", "hh", "H", "hp", "hxx", "hpp", "HPP", "h++", "tcc"];
const SOURCE_SUFFIXES: &[&str] = &["cc", "c", "cp", "cxx", "cpp", "CPP", "c++", "C"];
const OBJECT_SUFFIXES: &[&str] = &["a", "o", "so"];

fn suffix_of(file: &str) -> Option<&str> {
    file.rfind('.').map(|dot| &file[dot + 1..])
}

pub fn is_header_file(file: &str) -> bool {
    suffix_of(file).is_some_and(|s| HEADER_SUFFIXES.contains(&s))
}

pub fn is_source_file(file: &str) -> bool {
    suffix_of(file).is_some_and(|s| SOURCE_SUFFIXES.contains(&s))
}

pub fn is_object_file(file: &str) -> bool {
    suffix_of(file).is_some_and(|s| OBJECT_SUFFIXES.contains(&s))
}

/// Sun Studio inline template files accompany a source file without
/// producing their own output.
pub fn is_aux_input_file(file: &str, command: &ParsedCommand) -> bool {
    command.is_sun_studio() && suffix_of(file) == Some("il")
}

/// Parse make rules as produced by a compiler in dependency-output mode
/// and return the rule's right-hand-side files.
///
/// In the GNU format whitespace separates filenames and `\<LF>` continues
/// a rule; in the Sun variant each dependency sits alone on its own line
/// and spaces within filenames are literal.
pub fn dependencies_from_make_rules(rules: &str, is_sun_format: bool) -> BTreeSet<String> {
    let mut result = BTreeSet::new();
    let mut saw_colon_on_line = false;
    let mut saw_backslash = false;
    let mut current_filename = String::new();

    for character in rules.chars() {
        if saw_backslash {
            saw_backslash = false;
            if character != '\n' && saw_colon_on_line {
                current_filename.push(character);
            }
        } else if character == '\\' {
            saw_backslash = true;
        } else if character == ':' && !saw_colon_on_line {
            saw_colon_on_line = true;
        } else if character == '\n' {
            saw_colon_on_line = false;
            if !current_filename.is_empty() {
                result.insert(std::mem::take(&mut current_filename));
            }
        } else if character == ' ' {
            if is_sun_format {
                if !current_filename.is_empty() && saw_colon_on_line {
                    current_filename.push(character);
                }
            } else {
                if !current_filename.is_empty() {
                    result.insert(std::mem::take(&mut current_filename));
                }
            }
        } else if saw_colon_on_line {
            current_filename.push(character);
        }
    }

    if !current_filename.is_empty() {
        result.insert(current_filename);
    }

    result
}

/// Extract the crtbegin.o path clang selected, from `-v` stderr output.
///
/// Clang locates GCC installations by looking for crtbegin.o and adjusts
/// its system include paths accordingly, so the file must be uploaded as
/// if it were an input.
pub fn crtbegin_from_clang_v(stderr: &str) -> Option<String> {
    static RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?s)Selected GCC installation: ([^\n]*).*Selected multilib: ([^;\n]*)")
            .unwrap()
    });

    let captures = match RE.captures(stderr) {
        Some(captures) => captures,
        None => {
            debug!("failed to locate crtbegin.o for clang");
            return None;
        }
    };

    let installation = captures.get(1).unwrap().as_str();
    let multilib = captures.get(2).unwrap().as_str();

    let crtbegin = if multilib == "." {
        // Avoid redundant .'s in the path.
        format!("{}/crtbegin.o", installation)
    } else {
        format!("{}/{}/crtbegin.o", installation, multilib)
    };
    debug!("found crtbegin.o for clang: {}", crtbegin);

    Some(crtbegin)
}

/// Derive the set of files this command can produce, before any output
/// override is applied. Inputs with unrecognized suffixes are an error;
/// the caller falls back to local execution for those.
pub fn determine_products(command: &ParsedCommand) -> Result<BTreeSet<String>> {
    let mut headers = BTreeSet::new();
    let mut sources = BTreeSet::new();
    let mut objects = BTreeSet::new();
    let mut result = BTreeSet::new();

    for input in &command.inputs {
        if command.is_compile && is_header_file(input) {
            headers.insert(input.clone());
        } else if command.is_compile && is_source_file(input) {
            sources.insert(input.clone());
        } else if command.is_compile && is_aux_input_file(input, command) {
            // An input that doesn't produce a separate output file.
        } else if command.is_link && is_object_file(input) {
            objects.insert(input.clone());
        } else {
            return Err(UnsupportedSuffix(input.clone()).into());
        }
    }

    if headers.is_empty() && sources.is_empty() && objects.is_empty() {
        // No products without inputs.
        return Ok(result);
    }

    if !command.products.is_empty() {
        result.extend(command.products.iter().cloned());
    } else if command.is_link {
        result.insert("a.out".to_owned());
    } else {
        for header in &headers {
            // The precompiled header stays next to the header itself.
            result.insert(format!("{}.gch", header));
        }
        for source in &sources {
            result.insert(paths::strip_directory(&paths::replace_suffix(source, ".o")).to_owned());
        }
    }

    // -MD/-MMD without -MF writes a make-dependency file. Explicitly
    // specified names win; otherwise derive from -o, and failing that
    // from the input basename. xlc's -qmakedep works the same way but
    // uses `.u`.
    if command.md_set || command.qmakedep_set {
        let suffix = if command.md_set { ".d" } else { ".u" };
        if !command.deps_products.is_empty() {
            result.extend(command.deps_products.iter().cloned());
        } else if !command.products.is_empty() {
            for product in &command.products {
                result.insert(paths::replace_suffix(product, suffix));
            }
        } else {
            for header in &headers {
                result.insert(paths::strip_directory(&paths::replace_suffix(header, suffix)).to_owned());
            }
            for source in &sources {
                result.insert(paths::strip_directory(&paths::replace_suffix(source, suffix)).to_owned());
            }
        }
    }

    // Coverage notes follow the same explicit-first priority order.
    if command.coverage_set {
        if !command.coverage_products.is_empty() {
            result.extend(command.coverage_products.iter().cloned());
        } else if !command.products.is_empty() {
            for product in &command.products {
                result.insert(paths::replace_suffix(product, ".gcno"));
            }
        } else {
            for header in &headers {
                result.insert(
                    paths::strip_directory(&paths::replace_suffix(header, ".gcno")).to_owned(),
                );
            }
            for source in &sources {
                result.insert(
                    paths::strip_directory(&paths::replace_suffix(source, ".gcno")).to_owned(),
                );
            }
        }
    }

    // Split DWARF emits a .dwo per object, unless -o renames a .gch
    // output (header-only compile).
    if command.split_dwarf_set {
        if !command.products.is_empty() {
            if !sources.is_empty() {
                for product in &command.products {
                    result.insert(paths::replace_suffix(product, ".dwo"));
                }
            }
        } else {
            for source in &sources {
                result.insert(
                    paths::strip_directory(&paths::replace_suffix(source, ".dwo")).to_owned(),
                );
            }
        }
    }

    Ok(result)
}

/// Compute the dependency and product sets for a command. Linker
/// commands go through the transitive library resolution in [`link`].
pub fn get_file_info(
    command: &ParsedCommand,
    config: &Config,
    metrics: &MetricsCollector,
) -> Result<CommandFileInfo> {
    if command.is_link {
        return link::get_file_info(command, config);
    }

    let mut result = CommandFileInfo::default();
    let products = determine_products(command)?;

    let mut object_targets = Vec::new();
    for product in &products {
        result
            .possible_products
            .insert(paths::normalize_path(product));
        if product.ends_with(".o") {
            object_targets.push(product.clone());
        }
    }

    // Exactly one object target can be answered from the bulk scanner's
    // per-target cache.
    if object_targets.len() == 1 {
        if let Some(dependencies) =
            scan::dependencies_for_target(command, &object_targets[0], config, metrics)
        {
            result.dependencies = dependencies;
            return Ok(result);
        }
    }

    if config.verbose {
        debug!(
            "getting dependencies using the command: {}",
            command.deps_args.join(" ")
        );
    }

    let subprocess_result = subprocess::execute(&command.deps_args, true, true, &config.deps_env)?;
    if subprocess_result.exit_code != 0 {
        error!(
            "failed to execute get dependencies command: {}",
            command.deps_args.join(" ")
        );
        error!("exit status: {}", subprocess_result.exit_code);
        debug!("stdout: {}", subprocess_result.stdout);
        debug!("stderr: {}", subprocess_result.stderr);
        return Err(SubprocessFailed {
            exit_code: subprocess_result.exit_code,
        }
        .into());
    }

    // The AIX compiler writes dependency info to the temporary file
    // passed on the command line rather than stdout.
    let dependencies = match command.aix_deps_file_path() {
        Some(deps_file) => std::fs::read_to_string(&deps_file)
            .with_context(|| format!("failed to read AIX dependency file {}", deps_file))?,
        None => subprocess_result.stdout,
    };

    result.dependencies =
        dependencies_from_make_rules(&dependencies, command.produces_sun_make_rules());

    if config.deps_global_paths && command.is_clang() {
        if let Some(crtbegin) = crtbegin_from_clang_v(&subprocess_result.stderr) {
            result.dependencies.insert(crtbegin);
        }
    }

    for input in &command.inputs {
        if is_aux_input_file(input, command) {
            result.dependencies.insert(input.clone());
        }
    }

    Ok(result)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compiler::CommandParser;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn parse(list: &[&str]) -> ParsedCommand {
        let config = Config::default();
        CommandParser::new(&config)
            .parse_command(&args(list), "/cwd")
            .unwrap()
    }

    #[test]
    fn test_make_rules_basic() {
        let deps = dependencies_from_make_rules("hello.o: hello.cpp hello.h", false);
        assert_eq!(deps, ["hello.cpp".to_owned(), "hello.h".to_owned()].into());
    }

    #[test]
    fn test_make_rules_backslash_continuation() {
        let deps = dependencies_from_make_rules("hello.o: hello.cpp \\\n  hello.h \\\n  other.h\n", false);
        assert_eq!(
            deps,
            [
                "hello.cpp".to_owned(),
                "hello.h".to_owned(),
                "other.h".to_owned()
            ]
            .into()
        );
    }

    #[test]
    fn test_make_rules_whitespace_is_immaterial() {
        let compact = dependencies_from_make_rules("t.o: a.cpp b.h c.h", false);
        let sprawling =
            dependencies_from_make_rules("t.o:    a.cpp \\\nb.h   \\\n   c.h\n", false);
        assert_eq!(compact, sprawling);
    }

    #[test]
    fn test_make_rules_escaped_space_in_filename() {
        let deps = dependencies_from_make_rules("t.o: my\\ file.cpp other.h", false);
        assert_eq!(deps, ["my file.cpp".to_owned(), "other.h".to_owned()].into());
    }

    #[test]
    fn test_make_rules_multiple_rules() {
        let deps = dependencies_from_make_rules("a.o: a.cpp\nb.o: b.cpp b.h\n", false);
        assert_eq!(
            deps,
            ["a.cpp".to_owned(), "b.cpp".to_owned(), "b.h".to_owned()].into()
        );
    }

    #[test]
    fn test_sun_make_rules_keep_spaces() {
        let deps = dependencies_from_make_rules(
            "hello.o : ./hello with space.cpp\nhello.o : /usr/include/stdio.h\n",
            true,
        );
        assert!(deps.contains("./hello with space.cpp"));
        assert!(deps.contains("/usr/include/stdio.h"));
    }

    #[test]
    fn test_crtbegin_from_clang_v() {
        let stderr = "clang version 11\n\
                      Selected GCC installation: /usr/lib/gcc/x86_64-linux-gnu/9\n\
                      Candidate multilib: .;@m64\n\
                      Selected multilib: .;@m64\n";
        assert_eq!(
            crtbegin_from_clang_v(stderr).unwrap(),
            "/usr/lib/gcc/x86_64-linux-gnu/9/crtbegin.o"
        );

        let stderr = "Selected GCC installation: /usr/lib/gcc/x86_64-linux-gnu/9\n\
                      Selected multilib: 32;@m32\n";
        assert_eq!(
            crtbegin_from_clang_v(stderr).unwrap(),
            "/usr/lib/gcc/x86_64-linux-gnu/9/32/crtbegin.o"
        );

        assert!(crtbegin_from_clang_v("nothing useful").is_none());
    }

    #[test]
    fn test_determine_products_from_output_option() {
        let parsed = parse(&["gcc", "-c", "hello.cpp", "-o", "out/hello.o"]);
        let products = determine_products(&parsed).unwrap();
        assert_eq!(products, ["out/hello.o".to_owned()].into());
    }

    #[test]
    fn test_determine_products_default_object_name() {
        let parsed = parse(&["gcc", "-c", "src/hello.cpp"]);
        let products = determine_products(&parsed).unwrap();
        assert_eq!(products, ["hello.o".to_owned()].into());
    }

    #[test]
    fn test_determine_products_header_gch() {
        let parsed = parse(&["gcc", "-c", "lib/common.hpp"]);
        let products = determine_products(&parsed).unwrap();
        assert_eq!(products, ["lib/common.hpp.gch".to_owned()].into());
    }

    #[test]
    fn test_determine_products_md_adds_dependency_file() {
        let parsed = parse(&["gcc", "-c", "-MD", "hello.cpp", "-o", "hello.o"]);
        let products = determine_products(&parsed).unwrap();
        assert_eq!(products, ["hello.o".to_owned(), "hello.d".to_owned()].into());

        let parsed = parse(&["gcc", "-c", "-MD", "-MF", "custom.d", "hello.cpp", "-o", "hello.o"]);
        let products = determine_products(&parsed).unwrap();
        assert_eq!(products, ["hello.o".to_owned(), "custom.d".to_owned()].into());

        let parsed = parse(&["gcc", "-c", "-MD", "src/hello.cpp"]);
        let products = determine_products(&parsed).unwrap();
        assert_eq!(products, ["hello.o".to_owned(), "hello.d".to_owned()].into());
    }

    #[test]
    fn test_determine_products_qmakedep_uses_u_suffix() {
        let parsed = parse(&["xlc", "-c", "-qmakedep", "hello.c", "-o", "hello.o"]);
        let products = determine_products(&parsed).unwrap();
        assert!(products.contains("hello.u"));
    }

    #[test]
    fn test_determine_products_coverage() {
        let parsed = parse(&["gcc", "-c", "--coverage", "hello.cpp", "-o", "hello.o"]);
        let products = determine_products(&parsed).unwrap();
        assert!(products.contains("hello.gcno"));
    }

    #[test]
    fn test_determine_products_split_dwarf() {
        let parsed = parse(&["gcc", "-c", "-gsplit-dwarf", "hello.cpp", "-o", "hello.o"]);
        let products = determine_products(&parsed).unwrap();
        assert!(products.contains("hello.dwo"));

        // A header-only compile produces no .dwo even with -o.
        let parsed = parse(&["gcc", "-c", "-gsplit-dwarf", "common.hpp", "-o", "common.gch"]);
        let products = determine_products(&parsed).unwrap();
        assert!(!products.iter().any(|p| p.ends_with(".dwo")));
    }

    #[test]
    fn test_determine_products_linker_default() {
        let parsed = parse(&["gcc", "main.o", "util.o"]);
        assert!(parsed.is_link);
        let products = determine_products(&parsed).unwrap();
        assert_eq!(products, ["a.out".to_owned()].into());
    }

    #[test]
    fn test_unrecognized_suffix_is_an_error() {
        let parsed = parse(&["gcc", "-c", "hello.weird"]);
        let err = determine_products(&parsed).unwrap_err();
        assert!(err.downcast_ref::<UnsupportedSuffix>().is_some());
    }

    #[test]
    fn test_get_file_info_reports_subprocess_failure() {
        let mut config = Config::default();
        config.deps_override = None;
        let parsed = {
            let parser = CommandParser::new(&config);
            // `false` exits non-zero no matter the arguments; recc treats
            // that as the compiler rejecting the dependency command.
            let mut parsed = parser
                .parse_command(&args(&["gcc", "-c", "hello.cpp"]), "/cwd")
                .unwrap();
            parsed.deps_args = args(&["false"]);
            parsed
        };
        let err = get_file_info(&parsed, &config, &MetricsCollector::new()).unwrap_err();
        assert!(err.downcast_ref::<SubprocessFailed>().is_some());
    }
}
