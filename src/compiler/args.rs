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

//! Rule-table infrastructure for command parsing.
//!
//! Each compiler family provides a static table mapping flag spellings to
//! a handler kind; the parser matches one token at a time and dispatches.
//! Handler kinds are plain data so the tables carry no state of their own.

/// What the parser should do with a matched flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgAction {
    /// Forward to the remote command but keep it out of the local
    /// dependency command, which it would confuse (`-MD` and friends).
    InterfersWithDeps,
    /// `-c`: this is a compile step.
    Compile,
    /// `-D` macro definitions in all their spellings.
    Macro,
    /// `-o`: the argument is a product.
    RedirectsOutput,
    /// `-MF`/`-xMF`: the argument is a dependency-info product.
    RedirectsDepsOutput,
    /// `-MT`/`-MQ`: renames the make-rule target; remote-only.
    DepsRuleTarget,
    /// `--coverage`/`-ftest-coverage`: a `.gcno` will appear.
    CoverageOutput,
    /// `-fprofile-note=<path>`: the `.gcno` goes to an explicit path.
    RedirectsCoverageOutput,
    /// Option taking a path argument that is an input (include dirs etc).
    InputPath,
    /// `-x <lang>`: restricts the supported language set.
    SetsGccLanguage,
    /// `-Wp,...`/`-Xpreprocessor`: buffered and re-parsed afterwards.
    PreprocessorArg,
    /// `-gsplit-dwarf`: a `.dwo` will appear.
    SplitDwarf,
    /// The command cannot be reproduced remotely.
    Unsupported,
    /// `-march=`/`-mtune=`/`-mcpu=`: unsupported iff the value is
    /// `native`, which bakes host detection into the output.
    Native,
    /// Two-token passthrough (`--param key=value`, `-z keyword`).
    Param,
    /// Opaque single-token passthrough.
    Simple,
    /// Sun `-Qoption phase option` three-token passthrough.
    SolarisPhase,
    /// Linker `-L`-style search path options.
    LdLibraryPath,
    /// Linker `-l`-style library requests.
    LdLibrary,
    LdDynamic,
    LdStatic,
    /// `--push-state`/`--pop-state` save and restore the static flag.
    LdState,
    /// `-m EMU` emulation selection.
    LdEmulation,
    /// Solaris `-B dynamic|static`.
    SolarisLdB,
    /// Solaris `-d y|n`.
    SolarisLdD,
    /// Solaris `-Y P,<dirs>` default-search-path override.
    SolarisLdY,
    /// Solaris `-M <mapfile>`; the mapfile is an auxiliary input.
    SolarisLdMapfile,
}

pub struct ArgInfo {
    pub flag: &'static str,
    pub action: ArgAction,
}

macro_rules! rule {
    ($flag:expr => $action:ident) => {
        $crate::compiler::args::ArgInfo {
            flag: $flag,
            action: $crate::compiler::args::ArgAction::$action,
        }
    };
}
pub(crate) use rule;

/// Match one command-line token against a rule table.
///
/// The spelling before any `=` is tried as an exact key first; failing
/// that, the longest table key that is a prefix of the token wins, so
/// `-xarch` dispatches to its own rule rather than the shorter `-xar`.
pub fn match_option(token: &str, rules: &'static [ArgInfo]) -> Option<&'static ArgInfo> {
    if !token.starts_with('-') && !token.starts_with('+') {
        return None;
    }

    let trimmed: String = token
        .split('=')
        .next()
        .unwrap_or(token)
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    if let Some(info) = rules.iter().find(|info| info.flag == trimmed) {
        return Some(info);
    }

    rules
        .iter()
        .filter(|info| token.starts_with(info.flag))
        .max_by_key(|info| info.flag.len())
}

#[cfg(test)]
mod test {
    use super::*;

    static RULES: &[ArgInfo] = &[
        rule!("-x" => SetsGccLanguage),
        rule!("-xarch" => Simple),
        rule!("-xar" => Unsupported),
        rule!("-o" => RedirectsOutput),
    ];

    #[test]
    fn test_exact_match_trims_equals() {
        let info = match_option("-o=thing", RULES).unwrap();
        assert_eq!(info.action, ArgAction::RedirectsOutput);
    }

    #[test]
    fn test_longest_prefix_wins() {
        assert_eq!(
            match_option("-xarch64", RULES).unwrap().action,
            ArgAction::Simple
        );
        assert_eq!(
            match_option("-xar64", RULES).unwrap().action,
            ArgAction::Unsupported
        );
        assert_eq!(
            match_option("-xassembler", RULES).unwrap().action,
            ArgAction::SetsGccLanguage
        );
    }

    #[test]
    fn test_non_options_do_not_match() {
        assert!(match_option("input.cpp", RULES).is_none());
        assert!(match_option("", RULES).is_none());
    }
}
