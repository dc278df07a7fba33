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

//! Synchronous subprocess execution. Dependency scans, toolchain probes
//! and local fallback all run from the driver thread and wait for the
//! child; there is nothing useful to do concurrently with them.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Stdio};

use crate::errors::*;

#[derive(Debug)]
pub struct SubprocessResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Run `args` to completion. Captured streams come back lossily decoded;
/// uncaptured streams are inherited so compiler diagnostics reach the
/// user directly. `env` entries are applied on top of the inherited
/// environment.
pub fn execute(
    args: &[String],
    capture_stdout: bool,
    capture_stderr: bool,
    env: &HashMap<String, String>,
) -> Result<SubprocessResult> {
    let (program, rest) = args
        .split_first()
        .ok_or_else(|| anyhow!("cannot execute an empty command"))?;

    let mut command = Command::new(program);
    command
        .args(rest)
        .envs(env)
        .stdout(if capture_stdout {
            Stdio::piped()
        } else {
            Stdio::inherit()
        })
        .stderr(if capture_stderr {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });

    trace!("executing subprocess: {:?}", args);
    let output = command
        .output()
        .with_context(|| format!("failed to execute \"{}\"", program))?;

    // A child killed by signal N reports 128 + N, matching the shell.
    let exit_code = output
        .status
        .code()
        .or_else(|| output.status.signal().map(|sig| 128 + sig))
        .unwrap_or(1);

    Ok(SubprocessResult {
        exit_code,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_capture_stdout() {
        let result = execute(&args(&["echo", "hello"]), true, true, &HashMap::new()).unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.stderr, "");
    }

    #[test]
    fn test_exit_code() {
        let result = execute(&args(&["false"]), true, true, &HashMap::new()).unwrap();
        assert_ne!(result.exit_code, 0);
    }

    #[test]
    fn test_environment_override() {
        let mut env = HashMap::new();
        env.insert("RECC_TEST_SUBPROCESS_VAR".to_owned(), "value".to_owned());
        let result = execute(
            &args(&["sh", "-c", "echo $RECC_TEST_SUBPROCESS_VAR"]),
            true,
            true,
            &env,
        )
        .unwrap();
        assert_eq!(result.stdout, "value\n");
    }

    #[test]
    fn test_missing_executable_is_an_error() {
        assert!(execute(
            &args(&["/nonexistent/recc-test-binary"]),
            true,
            true,
            &HashMap::new()
        )
        .is_err());
    }
}
