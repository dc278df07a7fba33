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

//! Client contracts for the three remote services, plus the local-runner
//! execution client used in cache-only mode.
//!
//! The orchestrator only ever talks to these traits; the gRPC
//! implementations live in [`crate::grpc`] and tests substitute mocks.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::errors::*;
use crate::merkle;
use crate::protos::re::{ActionResult, Digest, OutputFile};
use crate::subprocess;

/// One blob to upload: either bytes already in memory or content that is
/// only on disk and streamed from its path.
pub enum UploadRequest {
    Blob(Digest, Vec<u8>),
    File(Digest, String),
}

impl UploadRequest {
    pub fn digest(&self) -> &Digest {
        match self {
            UploadRequest::Blob(digest, _) => digest,
            UploadRequest::File(digest, _) => digest,
        }
    }
}

#[async_trait]
pub trait CasClient: Send + Sync {
    /// Which of `digests` the server doesn't have yet.
    async fn find_missing_blobs(&self, digests: Vec<Digest>) -> Result<Vec<Digest>>;

    async fn upload_blobs(&self, requests: Vec<UploadRequest>) -> Result<()>;

    async fn download_blob(&self, digest: &Digest) -> Result<Vec<u8>>;
}

#[async_trait]
pub trait ActionCacheClient: Send + Sync {
    /// `None` on a cache miss (`NOT_FOUND`); transport failures are
    /// errors the caller decides how to treat.
    async fn fetch_action_result(
        &self,
        action_digest: &Digest,
        inline_output_files: &[String],
    ) -> Result<Option<ActionResult>>;

    async fn update_action_result(
        &self,
        action_digest: &Digest,
        action_result: &ActionResult,
    ) -> Result<()>;
}

#[async_trait]
pub trait ExecutionClient: Send + Sync {
    /// Run the action named by `action_digest` and wait for its result.
    /// `stop_token` is polled while waiting; cancellation surfaces as a
    /// `CANCELLED` transport error.
    async fn execute_action(
        &self,
        action_digest: &Digest,
        stop_token: &AtomicBool,
        skip_cache_lookup: bool,
    ) -> Result<ActionResult>;
}

/// Execution client for cache-only mode with a configured runner: the
/// command runs locally under the runner, and an `ActionResult` is
/// synthesized from its captured output and the product files it left
/// behind.
pub struct LocalRunnerClient {
    runner_args: Vec<String>,
    original_args: Vec<String>,
    products: BTreeSet<String>,
    config: Config,
    cas: Arc<dyn CasClient>,
    action_cache: Arc<dyn ActionCacheClient>,
}

impl LocalRunnerClient {
    pub fn new(
        runner_args: Vec<String>,
        original_args: Vec<String>,
        products: BTreeSet<String>,
        config: Config,
        cas: Arc<dyn CasClient>,
        action_cache: Arc<dyn ActionCacheClient>,
    ) -> LocalRunnerClient {
        LocalRunnerClient {
            runner_args,
            original_args,
            products,
            config,
            cas,
            action_cache,
        }
    }
}

#[async_trait]
impl ExecutionClient for LocalRunnerClient {
    async fn execute_action(
        &self,
        action_digest: &Digest,
        _stop_token: &AtomicBool,
        _skip_cache_lookup: bool,
    ) -> Result<ActionResult> {
        let mut argv = self.runner_args.clone();
        argv.extend(self.original_args.iter().cloned());

        let result = subprocess::execute(&argv, true, true, &HashMap::new())?;

        let digest_function = self.config.cas_digest_function;
        let stdout_digest = digest_function.digest_of_bytes(result.stdout.as_bytes());
        let stderr_digest = digest_function.digest_of_bytes(result.stderr.as_bytes());

        let mut action_result = ActionResult {
            exit_code: result.exit_code,
            stdout_raw: result.stdout.clone().into_bytes(),
            stdout_digest: Some(stdout_digest.clone()),
            stderr_raw: result.stderr.clone().into_bytes(),
            stderr_digest: Some(stderr_digest.clone()),
            ..Default::default()
        };

        let mut uploads = vec![
            UploadRequest::Blob(stdout_digest, result.stdout.into_bytes()),
            UploadRequest::Blob(stderr_digest, result.stderr.into_bytes()),
        ];

        // Only the products the runner actually produced are recorded.
        for product in &self.products {
            if !crate::util::is_regular_file(product) {
                continue;
            }
            let entry = merkle::file_entry(product, digest_function)?;
            action_result.output_files.push(OutputFile {
                path: product.clone(),
                digest: Some(entry.digest.clone()),
                is_executable: entry.executable,
                contents: Vec::new(),
            });
            uploads.push(UploadRequest::File(entry.digest, product.clone()));
        }

        let complete = action_result.output_files.len() == self.products.len();
        let cacheable = self.config.cache_upload_local_build
            && !self.config.action_uncacheable
            && complete
            && (action_result.exit_code == 0 || self.config.cache_upload_failed_build);

        if cacheable {
            let digests: Vec<Digest> = uploads.iter().map(|u| u.digest().clone()).collect();
            let missing = self.cas.find_missing_blobs(digests).await?;
            let missing: std::collections::HashSet<Digest> = missing.into_iter().collect();
            let to_upload: Vec<UploadRequest> = uploads
                .into_iter()
                .filter(|u| missing.contains(u.digest()))
                .collect();
            self.cas.upload_blobs(to_upload).await?;

            self.action_cache
                .update_action_result(action_digest, &action_result)
                .await?;
            info!("action cache updated for [{}]", action_digest);
        } else if action_result.exit_code != 0 && !self.config.cache_upload_failed_build {
            warn!(
                "not caching action result due to exit code {}",
                action_result.exit_code
            );
        } else if !complete {
            warn!(
                "not caching action result: {} of the requested output files were not produced",
                self.products.len() - action_result.output_files.len()
            );
        }

        Ok(action_result)
    }
}
