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

//! Runs a build command remotely. If the given command is not a build
//! command, it's actually run locally.

use std::time::Instant;

use recc::config::Config;
use recc::errors::*;
use recc::execution::ExecutionContext;
use recc::{metadata, signals};

const RC_OK: i32 = 0;
const RC_USAGE: i32 = 100;
const RC_EXEC_FAILURE: i32 = 101;
const RC_GRPC_ERROR: i32 = 102;
const RC_CANCELLED: i32 = 130;

const HELP: &str = "\
USAGE: recc <command>

If the given command is a compile command, runs it on a remote build
server. Otherwise, runs it locally.

If the command is to be executed remotely, it must specify either a
relative or absolute path to an executable.

recc is configured through RECC_-prefixed environment variables, or
recc.conf files (with the RECC_ prefix omitted). Frequently used:

  RECC_SERVER                 URI of the execution endpoint
  RECC_CAS_SERVER             URI of the CAS endpoint (defaults to
                              RECC_ACTION_CACHE_SERVER, else RECC_SERVER)
  RECC_ACTION_CACHE_SERVER    URI of the action cache endpoint (defaults
                              to RECC_CAS_SERVER, else RECC_SERVER)
  RECC_INSTANCE               instance name to pass to the server
  RECC_CACHE_ONLY             only fetch from cache; build locally on miss
  RECC_RUNNER_COMMAND         runner command for local execution in
                              cache-only mode
  RECC_FORCE_REMOTE           send all commands to the build server
  RECC_SKIP_CACHE             re-run actions instead of looking them up
  RECC_ACTION_UNCACHEABLE     mark actions as never cacheable
  RECC_ACTION_SALT            salt value to namespace the action cache
  RECC_PROJECT_ROOT           directory under which paths are rewritten
                              to relative (defaults to the working dir)
  RECC_PREFIX_MAP             colon-separated from=to path replacements
  RECC_WORKING_DIR_PREFIX     prefix for the remote working directory
  RECC_DEPS_OVERRIDE          comma-separated input files (skip deps scan)
  RECC_OUTPUT_FILES_OVERRIDE  comma-separated output files to request
  RECC_DEPS_GLOBAL_PATHS      include absolute paths in the input root
  RECC_DEPS_EXCLUDE_PATHS     comma-separated prefixes to exclude
  RECC_COMPILATION_DATABASE   compilation database for clang-scan-deps
  RECC_LINK                   remote-execute link commands as well
  RECC_REMOTE_PLATFORM_[key]  platform property to select workers by
  RECC_REMOTE_ENV_[var]       environment variable for the remote build
  RECC_REAPI_VERSION          Remote Execution API version (default 2.2)
  RECC_CAS_DIGEST_FUNCTION    digest function (default SHA256)
  RECC_RETRY_LIMIT            retries for failed requests (default 0)
  RECC_LOG_LEVEL              logging verbosity
  RECC_VERBOSE                equivalent to RECC_LOG_LEVEL=debug
  RECC_NO_EXECUTE             only compute and print the action digest

Run with a compiler command, e.g.: recc /usr/bin/gcc -c hello.cpp";

fn init_logging() {
    let level = if std::env::var("RECC_VERBOSE").map_or(false, |v| !v.is_empty()) {
        "debug".to_owned()
    } else {
        std::env::var("RECC_LOG_LEVEL").unwrap_or_else(|_| "warn".to_owned())
    };

    let mut builder = env_logger::Builder::new();
    builder.parse_filters(&level);

    if let Ok(log_directory) = std::env::var("RECC_LOG_DIRECTORY") {
        if !log_directory.is_empty() {
            let path = format!("{}/recc.{}.log", log_directory, std::process::id());
            match std::fs::File::create(&path) {
                Ok(file) => {
                    builder.target(env_logger::Target::Pipe(Box::new(file)));
                }
                Err(e) => eprintln!("recc: cannot open log file {}: {}", path, e),
            }
        }
    }

    builder.init();
}

fn exit_code_for_error(error: &Error) -> i32 {
    if let Some(grpc_error) = error.downcast_ref::<GrpcError>() {
        if grpc_error.is_cancelled() {
            return RC_CANCELLED;
        }
        return RC_GRPC_ERROR;
    }
    if error.downcast_ref::<UsageError>().is_some() {
        return RC_USAGE;
    }
    RC_EXEC_FAILURE
}

fn run() -> i32 {
    init_logging();

    let argv: Vec<String> = std::env::args().collect();
    if argv.len() <= 1 {
        eprintln!("USAGE: recc <command>");
        eprintln!("(run \"recc --help\" for details)");
        return RC_USAGE;
    }
    match argv[1].as_str() {
        "--help" | "-h" => {
            println!("{}", HELP);
            return RC_OK;
        }
        "--version" | "-v" => {
            println!("recc version: {}", env!("CARGO_PKG_VERSION"));
            return RC_OK;
        }
        arg if arg.starts_with('-') => {
            eprintln!("recc: unrecognized option '{}'", arg);
            eprintln!("USAGE: recc <command>");
            eprintln!("(run \"recc --help\" for details)");
            return RC_USAGE;
        }
        _ => {}
    }

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("recc: {:#}", e);
            return RC_USAGE;
        }
    };

    // Start gathering metadata while the compilation runs.
    let started = Instant::now();
    let command_args = argv[1..].to_vec();
    let mut compilation_data = if config.compilation_metadata_udp_port.is_empty() {
        None
    } else {
        Some(metadata::collect_compilation_data(&command_args, &config))
    };

    signals::setup_signals();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("recc: failed to initialize runtime: {}", e);
            return RC_EXEC_FAILURE;
        }
    };

    let mut context = ExecutionContext::new(config.clone());
    let exit_code = match runtime.block_on(context.execute(&command_args)) {
        Ok(exit_code) => exit_code,
        Err(e) => {
            eprintln!("recc: {:#}", e);
            exit_code_for_error(&e)
        }
    };

    context.metrics().publish(&config);

    if let Some(data) = compilation_data.as_mut() {
        metadata::finalize_compilation_data(
            data,
            context.metrics(),
            context.action_digest(),
            started.elapsed(),
        );
        metadata::send_compilation_data(data, &config);
    }

    exit_code
}

fn main() {
    std::process::exit(run());
}
