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

//! Compiler classification: canonicalizing an executable path down to a
//! compiler family that selects the parse rules, the dependency command
//! and the remote environment.

use crate::errors::*;
use crate::paths;

pub mod args;
pub mod parser;

pub use parser::{CommandParser, ParsedCommand};

/// Compilers that accept the same options parse with the same rule table,
/// so the family is the unit of classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompilerFamily {
    Gcc,
    Clang,
    SunStudio,
    Aix,
    Ld,
    SolarisLd,
    #[default]
    Unknown,
}

pub const GCC_COMPILERS: &[&str] = &["gcc", "g++", "c99-gcc", "c++"];
pub const CLANG_COMPILERS: &[&str] = &["clang", "clang++"];
pub const SUN_STUDIO_COMPILERS: &[&str] = &["CC"];
pub const AIX_COMPILERS: &[&str] = &["xlc", "xlc++", "xlC", "xlCcore", "xlc++core"];
pub const LINKERS: &[&str] = &["ld"];

/// Generic driver names that are conventionally symlinks to a real
/// compiler (`cc -> gcc`). Only these are worth chasing through the
/// filesystem; following `clang++ -> clang` would misclassify C++ as C.
pub const C_COMPILER_INDIRECTIONS: &[&str] = &["cc", "c89", "c99"];

/// Languages accepted via `-x`. Anything else (notably `assembler` and
/// `none`) makes the command unsupported.
pub const GCC_SUPPORTED_LANGUAGES: &[&str] = &[
    "c",
    "c++",
    "c-header",
    "c++-header",
    "c++-system-header",
    "c++-user-header",
    "objective-c",
    "objective-c++",
    "objective-c-header",
    "objective-c++-header",
    "assembler-with-cpp",
];

/// Options appended to the dependency command to make the compiler emit
/// make rules instead of compiling.
pub const GCC_DEFAULT_DEPS_ARGS: &[&str] = &["-M"];
pub const SUN_STUDIO_DEFAULT_DEPS_ARGS: &[&str] = &["-xM"];
pub const AIX_DEFAULT_DEPS_ARGS: &[&str] = &["-qsyntaxonly", "-M", "-MF"];

impl CompilerFamily {
    pub fn from_basename(basename: &str) -> CompilerFamily {
        if GCC_COMPILERS.contains(&basename) {
            CompilerFamily::Gcc
        } else if CLANG_COMPILERS.contains(&basename) {
            CompilerFamily::Clang
        } else if SUN_STUDIO_COMPILERS.contains(&basename) {
            CompilerFamily::SunStudio
        } else if AIX_COMPILERS.contains(&basename) {
            CompilerFamily::Aix
        } else if LINKERS.contains(&basename) {
            if cfg!(target_os = "solaris") {
                CompilerFamily::SolarisLd
            } else {
                CompilerFamily::Ld
            }
        } else {
            CompilerFamily::Unknown
        }
    }
}

const MAX_NESTED_SYMLINKS: u32 = 40;

/// Convert a compiler path (e.g. `/usr/bin/gcc-4.7`) to a canonical
/// command name (e.g. `gcc`).
///
/// The AIX reentrant `_r` suffix (with or without interposed version
/// digits) and trailing version characters are stripped; generic names
/// like `cc` are chased through their symlink chain to whatever real
/// compiler they point at.
pub fn command_basename(path: &str) -> Result<String> {
    command_basename_at_depth(path, 0)
}

fn command_basename_at_depth(path: &str, symlinks: u32) -> Result<String> {
    let basename = paths::strip_directory(path);

    if C_COMPILER_INDIRECTIONS.contains(&basename) {
        if let Ok(absolute) = which::which(path) {
            if absolute
                .symlink_metadata()
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false)
            {
                if symlinks >= MAX_NESTED_SYMLINKS {
                    bail!(
                        "too many levels of symlinks for compiler command: {}",
                        absolute.display()
                    );
                }
                let target = paths::resolve_symlink(&absolute.to_string_lossy())?;
                return command_basename_at_depth(&target, symlinks + 1);
            }
        }
        return Ok(basename.to_owned());
    }

    let mut length = basename.len();
    let bytes = basename.as_bytes();

    if length > 2 && &basename[length - 2..] == "_r" {
        length -= 2;
    } else if length > 3 && &basename[length - 3..length - 1] == "_r" {
        length -= 3;
    }

    let is_version_character =
        |c: u8| c.is_ascii_digit() || c == b'.' || c == b'-';
    while length > 0 && is_version_character(bytes[length - 1]) {
        length -= 1;
    }

    Ok(basename[..length].to_owned())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_command_basename_strips_version() {
        assert_eq!(command_basename("gcc").unwrap(), "gcc");
        assert_eq!(command_basename("gcc-4.7").unwrap(), "gcc");
        assert_eq!(command_basename("/usr/bin/gcc-4.7").unwrap(), "gcc");
        assert_eq!(command_basename("clang++-11").unwrap(), "clang++");
        assert_eq!(command_basename("g++-10.2.0").unwrap(), "g++");
    }

    #[test]
    fn test_command_basename_strips_aix_reentrant_suffix() {
        assert_eq!(command_basename("xlc++_r").unwrap(), "xlc++");
        assert_eq!(command_basename("./xlc_r7").unwrap(), "xlc");
        assert_eq!(command_basename("xlC128_r").unwrap(), "xlC");
    }

    #[test]
    fn test_command_basename_follows_cc_symlink() {
        use std::os::unix::fs::symlink;
        let dir = tempfile::tempdir().unwrap();
        let gcc = dir.path().join("gcc-9");
        std::fs::write(&gcc, "#!/bin/sh\n").unwrap();
        let mut perms = std::fs::metadata(&gcc).unwrap().permissions();
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o755);
        std::fs::set_permissions(&gcc, perms).unwrap();
        symlink("gcc-9", dir.path().join("cc")).unwrap();

        let cc = dir.path().join("cc");
        assert_eq!(command_basename(cc.to_str().unwrap()).unwrap(), "gcc");
    }

    #[test]
    fn test_family_from_basename() {
        assert_eq!(CompilerFamily::from_basename("gcc"), CompilerFamily::Gcc);
        assert_eq!(CompilerFamily::from_basename("c++"), CompilerFamily::Gcc);
        assert_eq!(CompilerFamily::from_basename("clang"), CompilerFamily::Clang);
        assert_eq!(
            CompilerFamily::from_basename("CC"),
            CompilerFamily::SunStudio
        );
        assert_eq!(CompilerFamily::from_basename("xlc++"), CompilerFamily::Aix);
        assert_eq!(CompilerFamily::from_basename("ls"), CompilerFamily::Unknown);
    }
}
