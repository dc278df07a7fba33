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

//! Per-invocation orchestration: classify, build the action, consult the
//! action cache, upload missing inputs, execute remotely or under a
//! local runner, and materialize the outputs.
//!
//! Local fallback is the default reaction to anything that prevents an
//! action from being built; transport failures after the work has been
//! surfaced remotely are not recovered locally and exit with the
//! transport class instead.

use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::sync::Arc;

use crate::actionbuilder::{ActionBuilder, BuildOutcome};
use crate::clients::{ActionCacheClient, CasClient, ExecutionClient, LocalRunnerClient, UploadRequest};
use crate::compiler::CommandParser;
use crate::config::Config;
use crate::errors::*;
use crate::grpc;
use crate::merkle;
use crate::metrics::{self, MetricsCollector};
use crate::paths;
use crate::protos::re;
use crate::shell;
use crate::signals;
use crate::subprocess;
use crate::util;

pub struct ExecutionContext {
    config: Config,
    metrics: MetricsCollector,
    action_digest: Option<re::Digest>,
    action_result: Option<re::ActionResult>,
}

/// Everything the post-build phase needs to know about the action.
struct PreparedAction {
    is_link: bool,
    products: BTreeSet<String>,
    action_digest: re::Digest,
    action_bytes: Vec<u8>,
    blobs: HashMap<re::Digest, Vec<u8>>,
    file_paths: HashMap<re::Digest, String>,
}

struct Clients {
    cas: Arc<dyn CasClient>,
    action_cache: Arc<dyn ActionCacheClient>,
    execution: Arc<dyn ExecutionClient>,
    local_runner: bool,
}

impl ExecutionContext {
    pub fn new(config: Config) -> ExecutionContext {
        ExecutionContext {
            config,
            metrics: MetricsCollector::new(),
            action_digest: None,
            action_result: None,
        }
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn action_digest(&self) -> Option<&re::Digest> {
        self.action_digest.as_ref()
    }

    pub fn action_result(&self) -> Option<&re::ActionResult> {
        self.action_result.as_ref()
    }

    /// Run one invocation end to end and return the exit code to
    /// propagate.
    pub async fn execute(&mut self, argv: &[String]) -> Result<i32> {
        debug!("RECC_REAPI_VERSION == '{}'", self.config.reapi_version);

        let cwd = paths::current_working_directory();
        let command = CommandParser::new(&self.config).parse_command(argv, &cwd)?;

        // Apply the per-class configuration overlays by value; the
        // family-specific map wins on conflicts.
        if command.is_compile {
            self.config.cache_only |= self.config.compile_cache_only;
            let overlay = self.config.compile_remote_platform.clone();
            self.config.remote_platform.extend(overlay);
        } else if command.is_link {
            self.config.cache_only |= self.config.link_cache_only;
            let overlay = self.config.link_remote_platform.clone();
            self.config.remote_platform.extend(overlay);
        }

        let eligible = command.is_compile
            || ((self.config.link || self.config.link_metrics_only) && command.is_link)
            || self.config.force_remote;

        let mut blobs: HashMap<re::Digest, Vec<u8>> = HashMap::new();
        let mut file_paths: HashMap<re::Digest, String> = HashMap::new();

        let built = if eligible {
            let environment: HashMap<String, String> = std::env::vars().collect();
            let builder = ActionBuilder::new(&self.config, self.metrics.clone());
            match builder.build_action(&command, &cwd, &environment, &mut blobs, &mut file_paths)? {
                BuildOutcome::Action(built) => {
                    let input_size: i64 = blobs.keys().map(|d| d.size_bytes).sum::<i64>()
                        + file_paths.keys().map(|d| d.size_bytes).sum::<i64>();
                    self.metrics
                        .record_counter(metrics::COUNTER_INPUT_SIZE_BYTES, input_size);
                    Some(built)
                }
                BuildOutcome::RunLocally => None,
            }
        } else {
            info!(
                "not a compiler command, so running locally \
                 (use RECC_FORCE_REMOTE=1 to force remote execution)"
            );
            self.metrics
                .record_counter(metrics::COUNTER_UNSUPPORTED_COMMAND, 1);
            None
        };

        let Some(built) = built else {
            if self.config.no_execute {
                info!("command would have run locally but RECC_NO_EXECUTE is enabled, exiting");
                return Ok(0);
            }
            return self.exec_locally(argv);
        };

        let (action_digest, action_bytes) =
            self.config.cas_digest_function.digest_of_message(&built.action);
        self.action_digest = Some(action_digest.clone());
        debug!("action digest: {} action: {:?}", action_digest, built.action);

        if self.config.no_execute {
            info!("RECC_NO_EXECUTE is enabled, exiting");
            println!("{}", action_digest);
            return Ok(0);
        }

        let prepared = PreparedAction {
            is_link: command.is_link,
            products: built.products,
            action_digest: action_digest.clone(),
            action_bytes,
            blobs,
            file_paths,
        };

        let interceptor = grpc::MetadataInterceptor::new(&self.config, &action_digest)?;
        let cas = grpc::make_cas_client(&self.config, &interceptor)?;
        let action_cache = grpc::make_action_cache_client(&self.config, &interceptor)?;

        let local_runner = self.config.cache_only && !self.config.runner_command.is_empty();
        let execution: Arc<dyn ExecutionClient> = if local_runner {
            let runner_args = shell::split_command(&self.config.runner_command);
            if runner_args.is_empty() {
                return Err(UsageError(format!(
                    "empty runner command \"{}\"",
                    self.config.runner_command
                ))
                .into());
            }
            Arc::new(LocalRunnerClient::new(
                runner_args,
                argv.to_vec(),
                prepared.products.clone(),
                self.config.clone(),
                cas.clone(),
                action_cache.clone(),
            ))
        } else {
            grpc::make_execution_client(&self.config, &interceptor)?
        };

        self.run_prepared(
            argv,
            prepared,
            Clients {
                cas,
                action_cache,
                execution,
                local_runner,
            },
        )
        .await
    }

    async fn run_prepared(
        &mut self,
        argv: &[String],
        mut prepared: PreparedAction,
        clients: Clients,
    ) -> Result<i32> {
        let action_digest = prepared.action_digest.clone();
        let products = prepared.products.clone();

        let mut action_in_cache = false;
        let mut result = re::ActionResult::default();

        if !self.config.skip_cache {
            let _timer = self.metrics.timer(metrics::TIMER_QUERY_ACTION_CACHE);
            let inline_outputs: Vec<String> = products.iter().cloned().collect();
            match clients
                .action_cache
                .fetch_action_result(&action_digest, &inline_outputs)
                .await
            {
                Ok(Some(cached)) => {
                    action_in_cache = true;
                    result = cached;
                    self.metrics.record_counter(
                        if prepared.is_link {
                            metrics::COUNTER_LINK_ACTION_CACHE_HIT
                        } else {
                            metrics::COUNTER_ACTION_CACHE_HIT
                        },
                        1,
                    );
                    info!("action cache hit for [{}]", action_digest);
                }
                Ok(None) => {
                    self.metrics.record_counter(
                        if prepared.is_link {
                            metrics::COUNTER_LINK_ACTION_CACHE_MISS
                        } else {
                            metrics::COUNTER_ACTION_CACHE_MISS
                        },
                        1,
                    );
                }
                Err(e) => {
                    // Treated as a miss for execution purposes.
                    error!(
                        "error while querying action cache at \"{}\": {:#}",
                        self.config.action_cache_server, e
                    );
                }
            }
        } else {
            self.metrics
                .record_counter(metrics::COUNTER_ACTION_CACHE_SKIP, 1);
        }

        if !action_in_cache || (self.config.link_metrics_only && prepared.is_link) {
            prepared
                .blobs
                .insert(action_digest.clone(), std::mem::take(&mut prepared.action_bytes));

            if self.config.cache_only && !clients.local_runner {
                let cache_upload_local_build = self.config.cache_upload_local_build
                    && !self.config.action_uncacheable
                    && !action_in_cache;
                info!("action not cached and running in cache-only mode, executing locally");

                if !cache_upload_local_build {
                    return self.exec_locally(argv);
                }

                // No need to upload input files in cache-only mode.
                prepared.file_paths.clear();

                let action_result = self.exec_locally_with_action_result(
                    argv,
                    &mut prepared.blobs,
                    &mut prepared.file_paths,
                    &products,
                )?;
                let outputs_found = action_result.output_files.len();

                if action_result.exit_code != 0 && !self.config.cache_upload_failed_build {
                    warn!(
                        "not uploading action result due to exit_code = {}, \
                         RECC_CACHE_UPLOAD_FAILED_BUILD = false",
                        action_result.exit_code
                    );
                } else if outputs_found != products.len() {
                    warn!(
                        "not uploading action result due to {} of the requested output files \
                         not being found",
                        products.len() - outputs_found
                    );
                } else {
                    debug!("uploading local build...");
                    if let Err(e) = self
                        .upload_resources(
                            clients.cas.as_ref(),
                            &prepared.blobs,
                            &prepared.file_paths,
                        )
                        .await
                    {
                        warn!(
                            "error while uploading local build to CAS at \"{}\": {:#}",
                            self.config.cas_server, e
                        );
                        // Skip the action cache update.
                        self.action_result = Some(action_result.clone());
                        return Ok(action_result.exit_code);
                    }

                    match clients
                        .action_cache
                        .update_action_result(&action_digest, &action_result)
                        .await
                    {
                        Ok(()) => info!("action cache updated for [{}]", action_digest),
                        Err(e) => {
                            // Local execution still succeeded.
                            warn!(
                                "error while calling `UpdateActionCache()` on \"{}\": {:#}",
                                self.config.action_cache_server, e
                            );
                        }
                    }
                }

                self.action_result = Some(action_result.clone());
                return Ok(action_result.exit_code);
            }

            if clients.local_runner {
                info!("executing action in local runner... [actionDigest={}]", action_digest);
            } else {
                info!("executing action remotely... [actionDigest={}]", action_digest);
            }

            debug!("uploading resources...");
            if let Err(e) = self
                .upload_resources(clients.cas.as_ref(), &prepared.blobs, &prepared.file_paths)
                .await
            {
                error!(
                    "error while uploading resources to CAS at \"{}\": {:#}",
                    self.config.cas_server, e
                );
                return Err(e);
            }

            {
                let _timer = self.metrics.timer(metrics::TIMER_EXECUTE_ACTION);
                result = match clients
                    .execution
                    .execute_action(&action_digest, signals::stop_token(), self.config.skip_cache)
                    .await
                {
                    Ok(result) => result,
                    Err(e) => {
                        if clients.local_runner {
                            error!("failed to execute action in local runner: {:#}", e);
                        } else {
                            error!(
                                "error while calling `Execute()` on \"{}\": {:#}",
                                self.config.server, e
                            );
                        }
                        return Err(e);
                    }
                };
            }
            info!("remote execution finished with exit code {}", result.exit_code);
        }

        self.action_result = Some(result.clone());

        let exit_code = result.exit_code;
        if exit_code == 0 && result.output_files.is_empty() && !products.is_empty() {
            bail!("action produced none of the expected output files");
        }

        if self.config.dont_save_output {
            // stdout and stderr are still written below; only the
            // command's own outputs are skipped.
            result.output_files.clear();
            result.output_symlinks.clear();
            result.output_directories.clear();
        }

        // Fetch stdout/stderr referenced by digest as ordinary output
        // files under throwaway names, so everything downloads in one
        // batch.
        let random = uuid::Uuid::new_v4().simple().to_string();
        let stdout_filename = format!(".recc-stdout-{}", &random[..8]);
        let stderr_filename = format!(".recc-stderr-{}", &random[..8]);
        let fetch_stdout = result
            .stdout_digest
            .as_ref()
            .is_some_and(|digest| digest.size_bytes > 0);
        let fetch_stderr = result
            .stderr_digest
            .as_ref()
            .is_some_and(|digest| digest.size_bytes > 0);
        if fetch_stdout {
            result.output_files.push(re::OutputFile {
                path: stdout_filename.clone(),
                digest: result.stdout_digest.clone(),
                ..Default::default()
            });
        }
        if fetch_stderr {
            result.output_files.push(re::OutputFile {
                path: stderr_filename.clone(),
                digest: result.stderr_digest.clone(),
                ..Default::default()
            });
        }

        {
            let _timer = self.metrics.timer(metrics::TIMER_DOWNLOAD_BLOBS);
            download_outputs(clients.cas.as_ref(), &result, self.config.cas_digest_function)
                .await?;
        }

        // These bypass the logger because they are the compiler's own
        // output.
        if fetch_stdout {
            let contents = std::fs::read(&stdout_filename).unwrap_or_default();
            std::io::stdout().write_all(&contents).ok();
            std::fs::remove_file(&stdout_filename).ok();
        } else {
            std::io::stdout().write_all(&result.stdout_raw).ok();
        }
        if fetch_stderr {
            let contents = std::fs::read(&stderr_filename).unwrap_or_default();
            std::io::stderr().write_all(&contents).ok();
            std::fs::remove_file(&stderr_filename).ok();
        } else {
            std::io::stderr().write_all(&result.stderr_raw).ok();
        }

        Ok(exit_code)
    }

    /// Invoke the command directly, inheriting stdio.
    fn exec_locally(&self, argv: &[String]) -> Result<i32> {
        let _timer = self.metrics.timer(metrics::TIMER_EXECUTE_ACTION);
        let result = subprocess::execute(argv, false, false, &HashMap::new())?;
        Ok(result.exit_code)
    }

    /// Invoke the command locally with captured output, synthesizing an
    /// `ActionResult` whose blobs are staged for upload.
    fn exec_locally_with_action_result(
        &self,
        argv: &[String],
        blobs: &mut HashMap<re::Digest, Vec<u8>>,
        file_paths: &mut HashMap<re::Digest, String>,
        products: &BTreeSet<String>,
    ) -> Result<re::ActionResult> {
        let _timer = self.metrics.timer(metrics::TIMER_EXECUTE_ACTION);

        let result = subprocess::execute(argv, true, true, &HashMap::new())?;
        print!("{}", result.stdout);
        eprint!("{}", result.stderr);

        let digest_function = self.config.cas_digest_function;
        let stdout_digest = digest_function.digest_of_bytes(result.stdout.as_bytes());
        let stderr_digest = digest_function.digest_of_bytes(result.stderr.as_bytes());
        blobs.insert(stdout_digest.clone(), result.stdout.into_bytes());
        blobs.insert(stderr_digest.clone(), result.stderr.into_bytes());

        let mut action_result = re::ActionResult {
            exit_code: result.exit_code,
            stdout_digest: Some(stdout_digest),
            stderr_digest: Some(stderr_digest),
            ..Default::default()
        };

        // Only products actually produced by the compiler are recorded.
        for product in products {
            if !util::is_regular_file(product) {
                continue;
            }
            let entry = merkle::file_entry(product, digest_function)?;
            file_paths.insert(entry.digest.clone(), product.clone());
            action_result.output_files.push(re::OutputFile {
                path: product.clone(),
                digest: Some(entry.digest),
                is_executable: entry.executable,
                contents: Vec::new(),
            });
        }

        Ok(action_result)
    }

    /// Upload blobs and path-referenced files the CAS doesn't already
    /// have.
    async fn upload_resources(
        &self,
        cas: &dyn CasClient,
        blobs: &HashMap<re::Digest, Vec<u8>>,
        file_paths: &HashMap<re::Digest, String>,
    ) -> Result<()> {
        let digests: Vec<re::Digest> = blobs.keys().chain(file_paths.keys()).cloned().collect();
        let total = digests.len();

        let missing = {
            let _timer = self.metrics.timer(metrics::TIMER_FIND_MISSING_BLOBS);
            cas.find_missing_blobs(digests).await?
        };

        let mut upload_requests = Vec::with_capacity(missing.len());
        for digest in &missing {
            if let Some(data) = blobs.get(digest) {
                upload_requests.push(UploadRequest::Blob(digest.clone(), data.clone()));
            } else if let Some(path) = file_paths.get(digest) {
                upload_requests.push(UploadRequest::File(digest.clone(), path.clone()));
            } else {
                bail!("FindMissingBlobs returned non-existent digest {}", digest);
            }
        }

        {
            let _timer = self.metrics.timer(metrics::TIMER_UPLOAD_MISSING_BLOBS);
            cas.upload_blobs(upload_requests).await?;
        }

        self.metrics.record_counter(
            metrics::COUNTER_UPLOAD_BLOBS_CACHE_HIT,
            (total - missing.len()) as i64,
        );
        self.metrics
            .record_counter(metrics::COUNTER_UPLOAD_BLOBS_CACHE_MISS, missing.len() as i64);
        Ok(())
    }
}

/// Fetch every output file and directory tree of an action result and
/// write them to the local filesystem.
async fn download_outputs(
    cas: &dyn CasClient,
    result: &re::ActionResult,
    digest_function: crate::digest::DigestFunction,
) -> Result<()> {
    for output_file in &result.output_files {
        let digest = output_file
            .digest
            .as_ref()
            .ok_or_else(|| anyhow!("output file \"{}\" without digest", output_file.path))?;
        let data = if !output_file.contents.is_empty() {
            output_file.contents.clone()
        } else if digest.size_bytes == 0 {
            Vec::new()
        } else {
            cas.download_blob(digest).await?
        };
        write_output_file(&output_file.path, &data, output_file.is_executable)?;
    }

    for output_symlink in &result.output_symlinks {
        if let Some(parent) = std::path::Path::new(&output_symlink.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let _ = std::fs::remove_file(&output_symlink.path);
        std::os::unix::fs::symlink(&output_symlink.target, &output_symlink.path)
            .with_context(|| format!("failed to create symlink \"{}\"", output_symlink.path))?;
    }

    for output_directory in &result.output_directories {
        let tree_digest = output_directory
            .tree_digest
            .as_ref()
            .ok_or_else(|| anyhow!("output directory without tree digest"))?;
        let tree_bytes = cas.download_blob(tree_digest).await?;
        let tree = <re::Tree as prost::Message>::decode(tree_bytes.as_slice())
            .context("failed to decode output directory tree")?;
        materialize_tree(cas, &tree, &output_directory.path, digest_function).await?;
    }

    Ok(())
}

/// Write a downloaded `Tree` message to disk rooted at `path`. Children
/// are referenced by digest from their parents, so they are indexed by
/// their canonical digest first.
async fn materialize_tree(
    cas: &dyn CasClient,
    tree: &re::Tree,
    path: &str,
    digest_function: crate::digest::DigestFunction,
) -> Result<()> {
    let root = tree
        .root
        .as_ref()
        .ok_or_else(|| anyhow!("output tree without root directory"))?;

    let mut children: HashMap<re::Digest, &re::Directory> = HashMap::new();
    for child in &tree.children {
        let (digest, _) = digest_function.digest_of_message(child);
        children.insert(digest, child);
    }

    let mut stack: Vec<(&re::Directory, String)> = vec![(root, path.to_owned())];
    while let Some((directory, directory_path)) = stack.pop() {
        std::fs::create_dir_all(&directory_path)
            .with_context(|| format!("failed to create directory \"{}\"", directory_path))?;

        for file in &directory.files {
            let digest = file
                .digest
                .as_ref()
                .ok_or_else(|| anyhow!("file node \"{}\" without digest", file.name))?;
            let data = if digest.size_bytes == 0 {
                Vec::new()
            } else {
                cas.download_blob(digest).await?
            };
            let file_path = format!("{}/{}", directory_path, file.name);
            write_output_file(&file_path, &data, file.is_executable)?;
        }

        for symlink in &directory.symlinks {
            let link_path = format!("{}/{}", directory_path, symlink.name);
            let _ = std::fs::remove_file(&link_path);
            std::os::unix::fs::symlink(&symlink.target, &link_path)?;
        }

        for subdir in &directory.directories {
            let digest = subdir
                .digest
                .as_ref()
                .ok_or_else(|| anyhow!("directory node \"{}\" without digest", subdir.name))?;
            let child = children
                .get(digest)
                .ok_or_else(|| anyhow!("tree is missing child directory {}", digest))?;
            stack.push((child, format!("{}/{}", directory_path, subdir.name)));
        }
    }

    Ok(())
}

fn write_output_file(path: &str, data: &[u8], is_executable: bool) -> Result<()> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create parent of \"{}\"", path))?;
        }
    }
    std::fs::write(path, data).with_context(|| format!("failed to write \"{}\"", path))?;
    if is_executable {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .with_context(|| format!("failed to set permissions on \"{}\"", path))?;
    }
    Ok(())
}
