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

//! Parsing compiler and linker command lines into a [`ParsedCommand`].
//!
//! Parsing consumes the argument list token by token through the family's
//! rule table. Two argument vectors are built side by side: `remote_args`
//! with paths rewritten for the remote worker, and `deps_args` with paths
//! untouched for the local dependency scan.

use std::collections::{BTreeSet, VecDeque};

use super::args::{match_option, rule, ArgAction, ArgInfo};
use super::{command_basename, CompilerFamily};
use crate::config::Config;
use crate::errors::*;
use crate::paths;
use crate::util;

static GCC_RULES: &[ArgInfo] = &[
    // Interferes with dependencies
    rule!("-MD" => InterfersWithDeps),
    rule!("-MMD" => InterfersWithDeps),
    rule!("-MG" => InterfersWithDeps),
    rule!("-MP" => InterfersWithDeps),
    rule!("-MV" => InterfersWithDeps),
    rule!("-Wmissing-include-dirs" => InterfersWithDeps),
    rule!("-Werror=missing-include-dirs" => InterfersWithDeps),
    // Compile options
    rule!("-c" => Compile),
    // Macros
    rule!("-D" => Macro),
    // Redirects output
    rule!("-o" => RedirectsOutput),
    rule!("-MF" => RedirectsDepsOutput),
    rule!("-MT" => DepsRuleTarget),
    rule!("-MQ" => DepsRuleTarget),
    // Coverage options
    rule!("--coverage" => CoverageOutput),
    rule!("-ftest-coverage" => CoverageOutput),
    rule!("-fprofile-note" => RedirectsCoverageOutput),
    // Input paths
    rule!("-include" => InputPath),
    rule!("-imacros" => InputPath),
    rule!("-I" => InputPath),
    rule!("-iquote" => InputPath),
    rule!("-isystem" => InputPath),
    rule!("-idirafter" => InputPath),
    rule!("-iprefix" => InputPath),
    rule!("-isysroot" => InputPath),
    rule!("--sysroot" => InputPath),
    // Preprocessor arguments
    rule!("-Wp," => PreprocessorArg),
    rule!("-Xpreprocessor" => PreprocessorArg),
    // Sets language
    rule!("-x" => SetsGccLanguage),
    // Debug options
    rule!("-gsplit-dwarf" => SplitDwarf),
    // Options not supported
    rule!("-fprofile-use" => Unsupported),
    rule!("-fauto-profile" => Unsupported),
    rule!("-fbranch-probabilities" => Unsupported),
    rule!("-specs" => Unsupported),
    rule!("-M" => Unsupported),
    rule!("-MM" => Unsupported),
    rule!("-E" => Unsupported),
    rule!("-S" => Unsupported),
    rule!("-save-temps" => Unsupported),
    rule!("-fdump" => Unsupported),
    rule!("-march" => Native),
    rule!("-mtune" => Native),
    rule!("-mcpu" => Native),
    rule!("--param" => Param),
    rule!("-z" => Param),
];

static GCC_PREPROCESSOR_RULES: &[ArgInfo] = &[
    // Interferes with dependencies
    rule!("-MD" => InterfersWithDeps),
    rule!("-MMD" => InterfersWithDeps),
    rule!("-M" => Unsupported),
    rule!("-MM" => Unsupported),
    rule!("-MG" => InterfersWithDeps),
    rule!("-MP" => InterfersWithDeps),
    rule!("-MV" => InterfersWithDeps),
    // Redirects output
    rule!("-o" => RedirectsOutput),
    rule!("-MF" => RedirectsDepsOutput),
    rule!("-MT" => DepsRuleTarget),
    rule!("-MQ" => DepsRuleTarget),
    // Input paths
    rule!("-include" => InputPath),
    rule!("-imacros" => InputPath),
    rule!("-I" => InputPath),
    rule!("-iquote" => InputPath),
    rule!("-isystem" => InputPath),
    rule!("-idirafter" => InputPath),
    rule!("-iprefix" => InputPath),
    rule!("-isysroot" => InputPath),
    rule!("--sysroot" => InputPath),
];

static SUN_STUDIO_RULES: &[ArgInfo] = &[
    // Phase rules
    rule!("-Qoption" => SolarisPhase),
    // Interferes with dependencies
    rule!("-xMD" => InterfersWithDeps),
    rule!("-xMMD" => InterfersWithDeps),
    // Macros
    rule!("-D" => Macro),
    // Redirects output
    rule!("-o" => RedirectsOutput),
    rule!("-xMF" => RedirectsDepsOutput),
    // Input paths
    rule!("-I" => InputPath),
    rule!("-include" => InputPath),
    // Compile options
    rule!("-c" => Compile),
    // Rule needed so `-xarch` isn't matched by the shorter `-xar`
    rule!("-xarch" => Simple),
    // Options not supported
    rule!("-xar" => Unsupported),
    rule!("-xpch" => Unsupported),
    rule!("-xprofile" => Unsupported),
    rule!("-###" => Unsupported),
    rule!("-xM" => Unsupported),
    rule!("-xM1" => Unsupported),
    rule!("-E" => Unsupported),
    rule!("-S" => Unsupported),
];

static AIX_RULES: &[ArgInfo] = &[
    // Interferes with dependencies
    rule!("-qsyntaxonly" => InterfersWithDeps),
    rule!("-M" => InterfersWithDeps),
    rule!("-qmakedep" => InterfersWithDeps),
    rule!("-qmakedep=gcc" => InterfersWithDeps),
    // Macros
    rule!("-D" => Macro),
    // Redirects output
    rule!("-o" => RedirectsOutput),
    rule!("-MF" => RedirectsDepsOutput),
    rule!("-qexpfile" => RedirectsOutput),
    // Input paths
    rule!("-qinclude" => InputPath),
    rule!("-I" => InputPath),
    rule!("-qcinc" => InputPath),
    // Compile options
    rule!("-c" => Compile),
    // Options not supported
    rule!("-#" => Unsupported),
    rule!("-qshowpdf" => Unsupported),
    rule!("-qdump_class_hierachy" => Unsupported),
    rule!("-E" => Unsupported),
    rule!("-S" => Unsupported),
];

static LD_RULES: &[ArgInfo] = &[
    rule!("-o" => RedirectsOutput),
    rule!("-L" => LdLibraryPath),
    rule!("--library-path" => LdLibraryPath),
    rule!("-l" => LdLibrary),
    rule!("--library" => LdLibrary),
    rule!("-rpath-link" => LdLibraryPath),
    rule!("--rpath-link" => LdLibraryPath),
    rule!("-rpath" => LdLibraryPath),
    rule!("--rpath" => LdLibraryPath),
    rule!("-R" => LdLibraryPath),
    rule!("-Bdynamic" => LdDynamic),
    rule!("-dy" => LdDynamic),
    rule!("-call_shared" => LdDynamic),
    rule!("-Bstatic" => LdStatic),
    rule!("-dn" => LdStatic),
    rule!("-non_shared" => LdStatic),
    rule!("-static" => LdStatic),
    rule!("--push-state" => LdState),
    rule!("--pop-state" => LdState),
    rule!("-m" => LdEmulation),
    rule!("-soname" => Param),
    rule!("--soname" => Param),
    rule!("-z" => Param),
    // Options not supported
    rule!("--dependency-file" => Unsupported),
    rule!("--just-symbols" => Unsupported),
    rule!("-T" => Unsupported),
    rule!("--script" => Unsupported),
    rule!("-dT" => Unsupported),
    rule!("--default-script" => Unsupported),
    rule!("-Y" => Unsupported),
    rule!("--dynamic-list" => Unsupported),
    rule!("-Map" => Unsupported),
    rule!("--error-handling-script" => Unsupported),
    rule!("--out-implib" => Unsupported),
    rule!("--retain-symbols-file" => Unsupported),
    rule!("--sysroot" => Unsupported),
    rule!("--version-script" => Unsupported),
    rule!("-a" => Unsupported),
];

static SOLARIS_LD_RULES: &[ArgInfo] = &[
    rule!("-o" => RedirectsOutput),
    rule!("-L" => LdLibraryPath),
    rule!("--library-path" => LdLibraryPath),
    rule!("-l" => LdLibrary),
    rule!("--library" => LdLibrary),
    rule!("-rpath" => LdLibraryPath),
    rule!("-R" => LdLibraryPath),
    rule!("-B" => SolarisLdB),
    rule!("-d" => SolarisLdD),
    rule!("-Y" => SolarisLdY),
    rule!("-h" => Param),
    rule!("-soname" => Param),
    rule!("-z" => Param),
    rule!("-u" => Macro),
    rule!("-M" => SolarisLdMapfile),
];

/// The result of parsing one invocation. Immutable once parsing finishes.
#[derive(Debug, Default)]
pub struct ParsedCommand {
    /// Canonical compiler basename, e.g. `gcc` for `/usr/bin/gcc-4.7`.
    pub compiler: String,
    pub family: CompilerFamily,

    pub is_compile: bool,
    pub is_link: bool,
    pub md_set: bool,
    pub qmakedep_set: bool,
    pub coverage_set: bool,
    pub split_dwarf_set: bool,
    pub upload_all_include_dirs: bool,
    pub unsupported: bool,
    pub bstatic: bool,
    pub bstatic_stack: Vec<bool>,

    /// The argv exactly as invoked.
    pub original_args: Vec<String>,
    /// argv with paths rewritten for the remote worker.
    pub remote_args: Vec<String>,
    /// argv with paths kept local, for the dependency subprocess.
    pub deps_args: Vec<String>,
    pub default_deps_args: Vec<String>,
    pub preprocessor_options: Vec<String>,

    pub inputs: Vec<String>,
    pub aux_inputs: Vec<String>,
    pub include_dirs: BTreeSet<String>,
    pub library_dirs: Vec<String>,
    pub rpath_dirs: Vec<String>,
    pub rpath_link_dirs: Vec<String>,
    pub default_library_dirs: Vec<String>,
    pub libraries: BTreeSet<String>,
    pub static_libraries: BTreeSet<String>,

    pub products: BTreeSet<String>,
    pub deps_products: BTreeSet<String>,
    pub coverage_products: BTreeSet<String>,

    /// On AIX the compiler writes dependency info to a file rather than
    /// stdout. The file lives as long as this ParsedCommand.
    aix_deps_file: Option<tempfile::NamedTempFile>,
}

impl ParsedCommand {
    pub fn is_gcc(&self) -> bool {
        self.family == CompilerFamily::Gcc
    }

    pub fn is_clang(&self) -> bool {
        self.family == CompilerFamily::Clang
    }

    pub fn is_sun_studio(&self) -> bool {
        self.family == CompilerFamily::SunStudio
    }

    pub fn is_aix(&self) -> bool {
        self.family == CompilerFamily::Aix
    }

    /// Sun-style make rules list one dependency per line and leave spaces
    /// in filenames unescaped.
    pub fn produces_sun_make_rules(&self) -> bool {
        matches!(self.family, CompilerFamily::SunStudio | CompilerFamily::Aix)
    }

    pub fn aix_deps_file_path(&self) -> Option<String> {
        self.aix_deps_file
            .as_ref()
            .map(|f| f.path().to_string_lossy().into_owned())
    }
}

pub struct CommandParser<'a> {
    config: &'a Config,
}

impl<'a> CommandParser<'a> {
    pub fn new(config: &'a Config) -> CommandParser<'a> {
        CommandParser { config }
    }

    /// Parse a command invoked through recc. Commands whose compiler isn't
    /// recognized come back with `unsupported` set and nothing parsed.
    pub fn parse_command(&self, command: &[String], cwd: &str) -> Result<ParsedCommand> {
        if command.is_empty() {
            return Ok(ParsedCommand::default());
        }

        let (mut parsed, mut queue) = self.init(command, cwd)?;

        let rules = match parsed.family {
            CompilerFamily::Gcc | CompilerFamily::Clang => GCC_RULES,
            CompilerFamily::SunStudio => SUN_STUDIO_RULES,
            CompilerFamily::Aix => AIX_RULES,
            _ => {
                // Don't attempt to parse the arguments of an unsupported
                // command.
                parsed.unsupported = true;
                return Ok(parsed);
            }
        };

        ParseContext {
            config: self.config,
            cwd,
            parsed: &mut parsed,
            queue: &mut queue,
        }
        .run_rules(rules);

        if parsed.unsupported || parsed.inputs.is_empty() {
            parsed.is_compile = false;
            return Ok(parsed);
        }

        if !parsed.is_compile {
            // A compiler driver invocation without `-c` links.
            parsed.is_link = true;
        }

        // Preprocessor options buffered during the main pass are re-parsed
        // with the restricted preprocessor table and re-emitted with an
        // explicit `-Xpreprocessor` before each token.
        if !parsed.preprocessor_options.is_empty() {
            let mut preprocessor = ParsedCommand::default();
            let mut preprocessor_queue: VecDeque<String> =
                parsed.preprocessor_options.iter().cloned().collect();
            ParseContext {
                config: self.config,
                cwd,
                parsed: &mut preprocessor,
                queue: &mut preprocessor_queue,
            }
            .run_rules(GCC_PREPROCESSOR_RULES);

            for arg in preprocessor.remote_args {
                parsed.remote_args.push("-Xpreprocessor".to_owned());
                parsed.remote_args.push(arg);
            }
            for arg in preprocessor.deps_args {
                parsed.deps_args.push("-Xpreprocessor".to_owned());
                parsed.deps_args.push(arg);
            }
            parsed.products.extend(preprocessor.products);
            parsed.deps_products.extend(preprocessor.deps_products);
            parsed.md_set |= preprocessor.md_set;
        }

        let default_deps_args = parsed.default_deps_args.clone();
        parsed.deps_args.extend(default_deps_args);

        Ok(parsed)
    }

    /// Parse a raw linker invocation, as recovered from the compiler
    /// driver's dry run.
    pub fn parse_linker_command(&self, command: &[String], cwd: &str) -> Result<ParsedCommand> {
        if command.is_empty() {
            return Ok(ParsedCommand::default());
        }

        let (mut parsed, mut queue) = self.init(command, cwd)?;

        let rules = if cfg!(target_os = "solaris") {
            SOLARIS_LD_RULES
        } else {
            LD_RULES
        };
        ParseContext {
            config: self.config,
            cwd,
            parsed: &mut parsed,
            queue: &mut queue,
        }
        .run_rules(rules);

        if parsed.unsupported || parsed.is_compile {
            return Ok(parsed);
        }
        parsed.is_link = true;

        Ok(parsed)
    }

    fn init(&self, command: &[String], cwd: &str) -> Result<(ParsedCommand, VecDeque<String>)> {
        let mut parsed = ParsedCommand::default();
        let compiler_path = &command[0];
        if compiler_path.is_empty() {
            return Ok((parsed, VecDeque::new()));
        }

        parsed.original_args = command.to_vec();
        parsed.compiler = command_basename(compiler_path)?;
        parsed.family = CompilerFamily::from_basename(&parsed.compiler);

        match parsed.family {
            CompilerFamily::Gcc | CompilerFamily::Clang => {
                parsed.default_deps_args =
                    super::GCC_DEFAULT_DEPS_ARGS.iter().map(|s| s.to_string()).collect();
            }
            CompilerFamily::SunStudio => {
                parsed.default_deps_args = super::SUN_STUDIO_DEFAULT_DEPS_ARGS
                    .iter()
                    .map(|s| s.to_string())
                    .collect();
            }
            CompilerFamily::Aix => {
                parsed.default_deps_args =
                    super::AIX_DEFAULT_DEPS_ARGS.iter().map(|s| s.to_string()).collect();
                let deps_file = tempfile::NamedTempFile::new()
                    .context("failed to create AIX dependency file")?;
                parsed
                    .default_deps_args
                    .push(deps_file.path().to_string_lossy().into_owned());
                parsed.aix_deps_file = Some(deps_file);
            }
            _ => {}
        }

        if parsed.is_clang() && self.config.deps_global_paths {
            // Clang reports where it found crtbegin.o on stderr with -v.
            parsed.default_deps_args.push("-v".to_owned());
        }

        // The compiler path is rewritten but never normalized: normalizing
        // `./gcc` would leave a bare basename, and the Remote Execution
        // API requires argv[0] to be a relative or absolute path so the
        // command can't silently resolve against a remote worker's PATH.
        let replaced = paths::modify_path_for_remote(compiler_path, cwd, false, self.config);
        parsed.remote_args.push(replaced);
        parsed.deps_args.push(compiler_path.clone());

        let queue = command[1..].iter().cloned().collect();
        Ok((parsed, queue))
    }
}

/// Mutable state shared by the rule handlers while one command parses.
struct ParseContext<'a> {
    config: &'a Config,
    cwd: &'a str,
    parsed: &'a mut ParsedCommand,
    queue: &'a mut VecDeque<String>,
}

impl ParseContext<'_> {
    fn run_rules(&mut self, rules: &'static [ArgInfo]) {
        while let Some(token) = self.queue.front().cloned() {
            if let Some(info) = match_option(&token, rules) {
                self.dispatch(info.action, info.flag);
            } else if token == "-" {
                warn!("recc does not support standard input");
                self.parsed.unsupported = true;
                self.queue.pop_front();
            } else if token.starts_with('@') {
                warn!("recc does not support reading command-line options from a file");
                self.parsed.unsupported = true;
                self.queue.pop_front();
            } else if token.starts_with('-')
                || (self.parsed.is_sun_studio() && token.starts_with('+'))
            {
                // Option without a handler; pass through opaquely.
                self.append_and_remove(false, true, false, false);
            } else {
                let replaced = self.modify(&token);
                self.parsed.remote_args.push(replaced);
                self.parsed.deps_args.push(token.clone());
                self.parsed.inputs.push(token);
                self.queue.pop_front();
            }
        }
    }

    fn dispatch(&mut self, action: ArgAction, flag: &'static str) {
        match action {
            ArgAction::InterfersWithDeps => self.interferes_with_deps(flag),
            ArgAction::Compile => {
                self.parsed.is_compile = true;
                self.append_and_remove(false, true, false, false);
            }
            ArgAction::Macro => self.macro_definition(flag),
            ArgAction::RedirectsOutput => self.parse_gcc_option(flag, false, true, false),
            ArgAction::RedirectsDepsOutput => self.parse_gcc_option(flag, false, true, true),
            ArgAction::DepsRuleTarget => self.parse_gcc_option(flag, false, false, false),
            ArgAction::CoverageOutput => self.coverage_output(),
            ArgAction::RedirectsCoverageOutput => self.redirects_coverage_output(),
            ArgAction::InputPath => self.parse_gcc_option(flag, true, false, false),
            ArgAction::SetsGccLanguage => self.sets_gcc_language(flag),
            ArgAction::PreprocessorArg => self.preprocessor_arg(flag),
            ArgAction::SplitDwarf => {
                self.parsed.split_dwarf_set = true;
                self.append_and_remove(false, true, false, false);
            }
            ArgAction::Unsupported => self.mark_rest_unsupported(),
            ArgAction::Native => self.native_machine_option(),
            ArgAction::Param => self.param(flag),
            ArgAction::Simple => self.append_and_remove(false, true, false, false),
            ArgAction::SolarisPhase => self.solaris_phase(),
            ArgAction::LdLibraryPath => self.ld_library_path(flag),
            ArgAction::LdLibrary => self.ld_library(flag),
            ArgAction::LdDynamic => {
                self.parsed.bstatic = false;
                self.append_and_remove(false, true, false, false);
            }
            ArgAction::LdStatic => {
                self.parsed.bstatic = true;
                self.append_and_remove(false, true, false, false);
            }
            ArgAction::LdState => self.ld_state(flag),
            ArgAction::LdEmulation => self.ld_emulation(flag),
            ArgAction::SolarisLdB => {
                if let Some(arg) = self.solaris_two_token_arg(flag) {
                    match arg.as_str() {
                        "dynamic" => self.parsed.bstatic = false,
                        "static" => self.parsed.bstatic = true,
                        _ => {}
                    }
                }
            }
            ArgAction::SolarisLdD => {
                if let Some(arg) = self.solaris_two_token_arg(flag) {
                    match arg.as_str() {
                        "y" => self.parsed.bstatic = false,
                        "n" => self.parsed.bstatic = true,
                        _ => {}
                    }
                }
            }
            ArgAction::SolarisLdY => self.solaris_ld_y(flag),
            ArgAction::SolarisLdMapfile => self.solaris_ld_mapfile(flag),
        }
    }

    fn modify(&self, path: &str) -> String {
        paths::modify_path_for_remote(path, self.cwd, true, self.config)
    }

    /// Move the front token into the remote (and optionally deps) vector.
    /// Path tokens get the remote rewriting, and are recorded as an
    /// include directory or a product when asked to.
    fn append_and_remove(&mut self, is_path: bool, to_deps: bool, is_output: bool, deps_output: bool) {
        let option = match self.queue.pop_front() {
            Some(option) => option,
            None => return,
        };

        if is_path {
            let replaced = self.modify(&option);
            let local_normalized = paths::normalize_path(&option);
            if util::is_directory(&local_normalized) {
                self.parsed.include_dirs.insert(replaced.clone());
            }
            // The deps command runs locally, so it keeps the unreplaced
            // path.
            if to_deps {
                self.parsed.deps_args.push(option);
            }
            self.parsed.remote_args.push(replaced.clone());
            if is_output && !deps_output {
                self.parsed.products.insert(replaced);
            } else if is_output {
                self.parsed.deps_products.insert(replaced);
            }
        } else {
            self.parsed.remote_args.push(option.clone());
            if to_deps {
                self.parsed.deps_args.push(option);
            }
        }
    }

    /// Handle a gcc-style option with an adjacent, `=`-joined or
    /// space-separated argument.
    fn parse_gcc_option(&mut self, flag: &str, to_deps: bool, is_output: bool, deps_output: bool) {
        let val = self.queue.front().cloned().unwrap_or_default();
        if val == flag {
            // Space between option and argument (-I /usr/include).
            if self.queue.len() < 2 {
                self.mark_rest_unsupported();
                return;
            }
            self.append_and_remove(false, to_deps, false, false);
            self.append_and_remove(true, to_deps, is_output, deps_output);
        } else {
            // Adjacent (-I/usr/include) or equals (-I=/usr/include).
            let mut option = flag.to_owned();
            let mut payload = val[flag.len()..].to_owned();
            if let Some(eq) = val.find('=') {
                option.push('=');
                payload = val[eq + 1..].to_owned();
            }

            let replaced = self.modify(&payload);
            let local_normalized = paths::normalize_path(&payload);
            if util::is_directory(&local_normalized) {
                self.parsed.include_dirs.insert(replaced.clone());
            }

            self.parsed.remote_args.push(format!("{}{}", option, replaced));

            if is_output && !deps_output {
                self.parsed.products.insert(replaced);
            } else if is_output {
                self.parsed.deps_products.insert(replaced);
            } else if to_deps {
                self.parsed.deps_args.push(format!("{}{}", option, payload));
            }

            self.queue.pop_front();
        }
    }

    fn interferes_with_deps(&mut self, flag: &str) {
        let token = self.queue.front().cloned().unwrap_or_default();
        if matches!(token.as_str(), "-MMD" | "-MD" | "-xMMD" | "-xMD") {
            self.parsed.md_set = true;
        } else if self.parsed.is_aix() && (flag == "-M" || flag == "-qmakedep") {
            self.parsed.qmakedep_set = true;
        } else if token == "-Wmissing-include-dirs" || token == "-Werror=missing-include-dirs" {
            self.parsed.upload_all_include_dirs = true;
        }

        // Remote command only; the deps command must not see it.
        self.parsed.remote_args.push(token);
        self.queue.pop_front();
    }

    fn macro_definition(&mut self, flag: &str) {
        // -Dname, -Dname=definition, -D name, -D name=definition
        let token = match self.queue.pop_front() {
            Some(token) => token,
            None => return,
        };
        self.parsed.remote_args.push(token.clone());
        self.parsed.deps_args.push(token.clone());
        if token == flag {
            match self.queue.pop_front() {
                Some(arg) => {
                    self.parsed.remote_args.push(arg.clone());
                    self.parsed.deps_args.push(arg);
                }
                None => self.parsed.unsupported = true,
            }
        }
    }

    fn sets_gcc_language(&mut self, flag: &str) {
        let token = match self.queue.pop_front() {
            Some(token) => token,
            None => return,
        };

        let language = if token == flag {
            // Space between -x and argument, e.g. "-x assembler"
            match self.queue.front() {
                Some(language) => language.clone(),
                None => {
                    warn!("gcc's \"-x\" flag requires an argument");
                    self.parsed.unsupported = true;
                    return;
                }
            }
        } else {
            // No space, e.g. "-xassembler". gcc -x does not understand an
            // equals sign; "-x=c++" selects the language "=c++".
            token[flag.len()..].to_owned()
        };

        self.queue.push_front(token);

        if !super::GCC_SUPPORTED_LANGUAGES.contains(&language.as_str()) {
            warn!("recc does not support the language [{}]", language);
            self.parsed.unsupported = true;
        }

        self.parse_gcc_option(flag, true, false, false);
    }

    fn mark_rest_unsupported(&mut self) {
        self.parsed.unsupported = true;

        // Flush the remainder into both command vectors and stop parsing.
        for token in self.queue.iter() {
            self.parsed.deps_args.push(token.clone());
            self.parsed.remote_args.push(token.clone());
        }
        self.queue.clear();
    }

    fn coverage_output(&mut self) {
        let token = match self.queue.pop_front() {
            Some(token) => token,
            None => return,
        };
        // A .gcno file will be produced alongside each object.
        self.parsed.coverage_set = true;
        self.parsed.remote_args.push(token);
    }

    fn redirects_coverage_output(&mut self) {
        let token = match self.queue.pop_front() {
            Some(token) => token,
            None => return,
        };
        match token.find('=') {
            Some(eq) => {
                let replaced = self.modify(&token[eq + 1..]);
                self.parsed.coverage_products.insert(replaced);
                self.parsed.remote_args.push(token);
            }
            None => {
                warn!("gcc's \"-fprofile-note\" option requires an argument");
                self.parsed.unsupported = true;
            }
        }
    }

    fn native_machine_option(&mut self) {
        let token = self.queue.front().cloned().unwrap_or_default();
        match token.find('=') {
            Some(eq) => {
                if &token[eq + 1..] == "native" {
                    warn!("\"native\" machine type builds cannot be cached [{}]", token);
                    self.mark_rest_unsupported();
                    return;
                }
            }
            None => debug!("malformed machine type option [{}]", token),
        }
        self.append_and_remove(false, true, false, false);
    }

    fn param(&mut self, flag: &str) {
        let val = self.queue.front().cloned().unwrap_or_default();
        if val == flag {
            if self.queue.len() < 2 {
                self.mark_rest_unsupported();
                return;
            }
            self.append_and_remove(false, true, false, false);
            // Push back the corresponding key=value.
            self.append_and_remove(false, true, false, false);
        } else {
            // "=" between option and value (--param=ggc-min-expand=30).
            self.append_and_remove(false, true, false, false);
        }
    }

    fn solaris_phase(&mut self) {
        // -Qoption takes a phase and an option argument.
        if self.queue.len() < 3 {
            self.mark_rest_unsupported();
            return;
        }
        for _ in 0..3 {
            self.append_and_remove(false, true, false, false);
        }
    }

    fn preprocessor_arg(&mut self, flag: &str) {
        let val = self.queue.front().cloned().unwrap_or_default();
        if flag == "-Wp," {
            // Comma-separated list of arguments.
            parse_stage_option_list(&val[flag.len()..], &mut self.parsed.preprocessor_options);
        } else if flag == "-Xpreprocessor" {
            self.queue.pop_front();
            match self.queue.front() {
                Some(arg) => self.parsed.preprocessor_options.push(arg.clone()),
                None => {
                    self.parsed.unsupported = true;
                    return;
                }
            }
        }
        self.queue.pop_front();
    }

    fn ld_library(&mut self, flag: &str) {
        let val = self.queue.front().cloned().unwrap_or_default();
        let library;

        if val == flag {
            // Space between option and library name (-l foo).
            self.append_and_remove(false, false, false, false);
            library = match self.queue.front() {
                Some(library) => library.clone(),
                None => {
                    self.parsed.unsupported = true;
                    return;
                }
            };
            self.append_and_remove(false, false, false, false);
        } else {
            // Adjacent (-lfoo) or equals (--library=foo).
            library = match val.find('=') {
                Some(eq) => val[eq + 1..].to_owned(),
                None => val[flag.len()..].to_owned(),
            };
            self.append_and_remove(false, false, false, false);
        }

        if library.is_empty() {
            self.mark_rest_unsupported();
            return;
        }

        if self.parsed.bstatic {
            self.parsed.static_libraries.insert(library);
        } else {
            self.parsed.libraries.insert(library);
        }
    }

    fn ld_library_path(&mut self, flag: &'static str) {
        let val = match self.queue.pop_front() {
            Some(val) => val,
            None => return,
        };

        let library_path = if val == flag {
            self.queue.pop_front().unwrap_or_default()
        } else {
            let mut path = val[flag.len()..].to_owned();
            if let Some(stripped) = path.strip_prefix('=') {
                path = stripped.to_owned();
            }
            path
        };

        if library_path.is_empty() {
            self.mark_rest_unsupported();
            return;
        }

        for token in library_path.split(':') {
            if util::is_directory(token) {
                self.parsed.remote_args.push(flag.to_owned());
                let replaced = self.modify(token);
                self.parsed.remote_args.push(replaced);

                match flag {
                    "-rpath-link" | "--rpath-link" => {
                        self.parsed.rpath_link_dirs.push(token.to_owned())
                    }
                    "-rpath" | "--rpath" | "-R" => self.parsed.rpath_dirs.push(token.to_owned()),
                    _ => self.parsed.library_dirs.push(token.to_owned()),
                }
            } else if flag == "-R" && util::is_regular_file(token) {
                // `-R` with a regular file argument is `--just-symbols`.
                self.mark_rest_unsupported();
                return;
            }
        }
    }

    fn ld_state(&mut self, flag: &str) {
        if flag == "--push-state" {
            self.parsed.bstatic_stack.push(self.parsed.bstatic);
        } else if flag == "--pop-state" && !self.parsed.bstatic_stack.is_empty() {
            self.parsed.bstatic = self.parsed.bstatic_stack.pop().unwrap();
        } else {
            self.mark_rest_unsupported();
            return;
        }
        self.append_and_remove(false, true, false, false);
    }

    fn ld_emulation(&mut self, flag: &str) {
        // `-m` with and without a space.
        let token = match self.queue.pop_front() {
            Some(token) => token,
            None => return,
        };
        self.parsed.remote_args.push(token.clone());
        self.parsed.deps_args.push(token.clone());
        if token == flag {
            match self.queue.pop_front() {
                Some(arg) => {
                    self.parsed.remote_args.push(arg.clone());
                    self.parsed.deps_args.push(arg);
                }
                None => self.parsed.unsupported = true,
            }
        }
    }

    fn solaris_two_token_arg(&mut self, flag: &str) -> Option<String> {
        let val = self.queue.front().cloned().unwrap_or_default();
        if val == flag {
            if self.queue.len() < 2 {
                self.mark_rest_unsupported();
                return None;
            }
            self.append_and_remove(false, true, false, false);
            let arg = self.queue.front().cloned().unwrap_or_default();
            self.append_and_remove(false, true, false, false);
            Some(arg)
        } else {
            let arg = val[flag.len()..].to_owned();
            self.append_and_remove(false, true, false, false);
            Some(arg)
        }
    }

    fn solaris_ld_y(&mut self, flag: &str) {
        let arg = match self.solaris_two_token_arg(flag) {
            Some(arg) => arg,
            None => return,
        };

        match arg.strip_prefix("P,") {
            Some(path_list) => {
                // -Y P,<dirs> replaces the default library search path.
                self.parsed.default_library_dirs.clear();
                for token in path_list.split(':') {
                    if util::is_directory(token) {
                        self.parsed.default_library_dirs.push(token.to_owned());
                    }
                }
            }
            None => self.mark_rest_unsupported(),
        }
    }

    fn solaris_ld_mapfile(&mut self, flag: &str) {
        let val = self.queue.front().cloned().unwrap_or_default();
        let mapfile;

        if val == flag {
            self.append_and_remove(false, false, false, false);
            mapfile = match self.queue.front() {
                Some(mapfile) => mapfile.clone(),
                None => {
                    self.parsed.unsupported = true;
                    return;
                }
            };
            self.append_and_remove(false, false, false, false);
        } else {
            mapfile = val[flag.len()..].to_owned();
            self.append_and_remove(false, false, false, false);
        }

        if mapfile.is_empty() {
            self.mark_rest_unsupported();
            return;
        }

        self.parsed.aux_inputs.push(mapfile);
    }
}

/// Split a `-Wp,`-style comma-separated option list, honouring single
/// quotes around commas.
fn parse_stage_option_list(list: &str, result: &mut Vec<String>) {
    let mut quoted = false;
    let mut current = String::new();
    for character in list.chars() {
        if character == '\'' {
            quoted = !quoted;
        } else if character == ',' && !quoted {
            result.push(std::mem::take(&mut current));
        } else {
            current.push(character);
        }
    }
    result.push(current);
}

#[cfg(test)]
mod test {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn parse(list: &[&str]) -> ParsedCommand {
        let config = Config::default();
        CommandParser::new(&config)
            .parse_command(&args(list), "/cwd")
            .unwrap()
    }

    fn parse_linker(list: &[&str]) -> ParsedCommand {
        let config = Config::default();
        CommandParser::new(&config)
            .parse_linker_command(&args(list), "/cwd")
            .unwrap()
    }

    #[test]
    fn test_simple_compile_command() {
        let parsed = parse(&["gcc", "-c", "hello.cpp", "-o", "hello.o"]);
        assert!(parsed.is_compile);
        assert!(!parsed.is_link);
        assert!(!parsed.unsupported);
        assert_eq!(parsed.compiler, "gcc");
        assert_eq!(parsed.remote_args, args(&["gcc", "-c", "hello.cpp", "-o", "hello.o"]));
        assert_eq!(parsed.deps_args, args(&["gcc", "-c", "hello.cpp", "-M"]));
        assert_eq!(parsed.inputs, args(&["hello.cpp"]));
        assert!(parsed.products.contains("hello.o"));
    }

    #[test]
    fn test_output_adjacent_to_flag() {
        let parsed = parse(&["gcc", "-c", "hello.cpp", "-ohello.o"]);
        assert!(parsed.products.contains("hello.o"));
        assert!(parsed.remote_args.contains(&"-ohello.o".to_owned()));
    }

    #[test]
    fn test_macro_forms() {
        let parsed = parse(&["gcc", "-c", "-DFOO=bar", "-D", "BAZ", "hello.cpp"]);
        assert!(parsed.remote_args.contains(&"-DFOO=bar".to_owned()));
        assert!(parsed.deps_args.contains(&"-DFOO=bar".to_owned()));
        assert!(parsed.remote_args.contains(&"BAZ".to_owned()));
        assert!(parsed.deps_args.contains(&"BAZ".to_owned()));
    }

    #[test]
    fn test_md_option_sets_flag_and_stays_out_of_deps_command() {
        let parsed = parse(&["gcc", "-c", "-MD", "hello.cpp"]);
        assert!(parsed.md_set);
        assert!(parsed.remote_args.contains(&"-MD".to_owned()));
        assert!(!parsed.deps_args.contains(&"-MD".to_owned()));
    }

    #[test]
    fn test_mf_records_deps_product() {
        let parsed = parse(&["gcc", "-c", "-MD", "-MF", "hello.d", "hello.cpp"]);
        assert!(parsed.deps_products.contains("hello.d"));
        assert!(!parsed.products.contains("hello.d"));
    }

    #[test]
    fn test_stdin_is_unsupported() {
        let parsed = parse(&["gcc", "-c", "-"]);
        assert!(parsed.unsupported);
        assert!(!parsed.is_compile);
    }

    #[test]
    fn test_response_file_is_unsupported() {
        let parsed = parse(&["gcc", "@args.rsp"]);
        assert!(parsed.unsupported);
    }

    #[test]
    fn test_march_native_is_unsupported() {
        assert!(parse(&["gcc", "-c", "-march=native", "hello.cpp"]).unsupported);
        assert!(!parse(&["gcc", "-c", "-march=armv8-a", "hello.cpp"]).unsupported);
        assert!(parse(&["gcc", "-c", "-mtune=native", "hello.cpp"]).unsupported);
    }

    #[test]
    fn test_preprocess_only_is_unsupported() {
        assert!(parse(&["gcc", "-E", "hello.cpp"]).unsupported);
        assert!(parse(&["gcc", "-S", "hello.cpp"]).unsupported);
        assert!(parse(&["gcc", "-M", "hello.cpp"]).unsupported);
    }

    #[test]
    fn test_language_allow_list() {
        assert!(parse(&["gcc", "-x", "assembler", "-c", "hello.s"]).unsupported);
        assert!(parse(&["gcc", "-xnone", "-c", "hello.cpp"]).unsupported);
        assert!(!parse(&["gcc", "-x", "c++", "-c", "hello.cpp"]).unsupported);
        assert!(!parse(&["gcc", "-xc++-header", "-c", "hello.hpp"]).unsupported);
    }

    #[test]
    fn test_unknown_compiler_is_unsupported() {
        let parsed = parse(&["ls", "-la"]);
        assert!(parsed.unsupported);
        assert!(!parsed.is_compile);
        assert!(!parsed.is_link);
    }

    #[test]
    fn test_no_input_files_is_not_a_compile_command() {
        let parsed = parse(&["gcc", "-c"]);
        assert!(!parsed.unsupported);
        assert!(!parsed.is_compile);
        assert!(!parsed.is_link);
    }

    #[test]
    fn test_driver_without_dash_c_is_a_link_command() {
        let parsed = parse(&["gcc", "main.o", "-o", "app"]);
        assert!(!parsed.is_compile);
        assert!(parsed.is_link);
        assert!(parsed.products.contains("app"));
    }

    #[test]
    fn test_wp_options_are_reemitted_with_xpreprocessor() {
        let parsed = parse(&["gcc", "-c", "hello.cpp", "-Wp,-MD,hello.d"]);
        assert!(parsed.md_set);
        let remote = parsed.remote_args.join(" ");
        assert!(remote.contains("-Xpreprocessor -MD"), "{}", remote);
    }

    #[test]
    fn test_xpreprocessor_collects_next_token() {
        let parsed = parse(&["gcc", "-c", "hello.cpp", "-Xpreprocessor", "-MP"]);
        let remote = parsed.remote_args.join(" ");
        assert!(remote.contains("-Xpreprocessor -MP"), "{}", remote);
    }

    #[test]
    fn test_include_dir_recorded_when_it_exists() {
        let dir = tempfile::tempdir().unwrap();
        let include = dir.path().to_str().unwrap().to_owned();
        let parsed = parse(&["gcc", "-c", &format!("-I{}", include), "hello.cpp"]);
        assert!(parsed.include_dirs.contains(&include));

        let parsed = parse(&["gcc", "-c", "-I/definitely/not/a/dir", "hello.cpp"]);
        assert!(parsed.include_dirs.is_empty());
    }

    #[test]
    fn test_sun_studio_plus_options_pass_through() {
        let parsed = parse(&["CC", "-c", "foo.cpp", "+w"]);
        assert!(!parsed.unsupported);
        assert!(parsed.produces_sun_make_rules());
        assert!(parsed.remote_args.contains(&"+w".to_owned()));
        assert_eq!(parsed.deps_args.last().unwrap(), "-xM");
    }

    #[test]
    fn test_sun_xarch_is_not_swallowed_by_xar() {
        assert!(!parse(&["CC", "-c", "-xarch=sparc", "foo.cpp"]).unsupported);
        assert!(parse(&["CC", "-c", "-xar", "foo.cpp"]).unsupported);
    }

    #[test]
    fn test_aix_qmakedep_and_deps_file() {
        let parsed = parse(&["xlc", "-c", "-qmakedep=gcc", "foo.c"]);
        assert!(parsed.qmakedep_set);
        let deps_file = parsed.aix_deps_file_path().unwrap();
        assert!(std::path::Path::new(&deps_file).exists());
        assert_eq!(parsed.deps_args.last().unwrap(), &deps_file);
    }

    #[test]
    fn test_split_dwarf_flag() {
        let parsed = parse(&["gcc", "-c", "-gsplit-dwarf", "hello.cpp"]);
        assert!(parsed.split_dwarf_set);
    }

    #[test]
    fn test_coverage_flag() {
        let parsed = parse(&["gcc", "-c", "--coverage", "hello.cpp"]);
        assert!(parsed.coverage_set);
        let parsed = parse(&["gcc", "-c", "-ftest-coverage", "-fprofile-note=out.gcno", "hello.cpp"]);
        assert!(parsed.coverage_products.contains("out.gcno"));
    }

    #[test]
    fn test_linker_library_classification_with_state_stack() {
        let parsed = parse_linker(&[
            "ld",
            "-o",
            "app",
            "main.o",
            "-lfoo",
            "-Bstatic",
            "-lbar",
            "--push-state",
            "-Bdynamic",
            "-lbaz",
            "--pop-state",
            "-lqux",
        ]);
        assert!(parsed.is_link);
        assert!(parsed.libraries.contains("foo"));
        assert!(parsed.libraries.contains("baz"));
        assert!(parsed.static_libraries.contains("bar"));
        assert!(parsed.static_libraries.contains("qux"));
    }

    #[test]
    fn test_linker_script_options_are_unsupported() {
        assert!(parse_linker(&["ld", "-o", "app", "-T", "link.ld", "main.o"]).unsupported);
        assert!(parse_linker(&["ld", "--version-script", "v.map", "main.o"]).unsupported);
        assert!(parse_linker(&["ld", "--sysroot=/x", "main.o"]).unsupported);
    }

    #[test]
    fn test_linker_library_path_records_existing_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let lib_dir = dir.path().to_str().unwrap().to_owned();
        let parsed = parse_linker(&["ld", "-o", "app", &format!("-L{}", lib_dir), "main.o"]);
        assert_eq!(parsed.library_dirs, vec![lib_dir.clone()]);
        assert!(parsed.remote_args.contains(&"-L".to_owned()));
        assert!(parsed.remote_args.contains(&lib_dir));
    }

    #[test]
    fn test_linker_emulation_is_preserved() {
        let parsed = parse_linker(&["ld", "-m", "elf_x86_64", "-o", "app", "main.o"]);
        let remote = parsed.remote_args.join(" ");
        assert!(remote.contains("-m elf_x86_64"), "{}", remote);
    }

    #[test]
    fn test_reparsing_original_args_is_stable() {
        let config = Config::default();
        let parser = CommandParser::new(&config);
        let first = parser
            .parse_command(
                &args(&["gcc", "-c", "hello.cpp", "-o", "hello.o", "-MD", "-DX=1"]),
                "/cwd",
            )
            .unwrap();
        let second = parser.parse_command(&first.original_args, "/cwd").unwrap();
        assert_eq!(first.remote_args, second.remote_args);
        assert_eq!(first.deps_args, second.deps_args);
        assert_eq!(first.products, second.products);
        assert_eq!(first.is_compile, second.is_compile);
        assert_eq!(first.md_set, second.md_set);
    }

    #[test]
    fn test_parse_stage_option_list() {
        let mut result = Vec::new();
        parse_stage_option_list("-MD,foo.d", &mut result);
        assert_eq!(result, args(&["-MD", "foo.d"]));

        let mut result = Vec::new();
        parse_stage_option_list("-D'A,B',x", &mut result);
        assert_eq!(result, args(&["-DA,B", "x"]));
    }
}
