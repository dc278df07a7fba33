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

//! gRPC implementations of the remote-service client contracts.
//!
//! Every RPC goes through [`retrying`], which applies the configured
//! retry limit with exponential backoff. The Execute call additionally
//! polls the stop token between stream messages so a signal cancels the
//! wait instead of the process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::uri::PathAndQuery;
use prost::Message;
use tonic::client::Grpc;
use tonic::metadata::{MetadataKey, MetadataValue};
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::{Code, Request, Status};

use crate::clients::{ActionCacheClient, CasClient, ExecutionClient, UploadRequest};
use crate::config::Config;
use crate::errors::*;
use crate::protos::{bytestream, longrunning, re};
use crate::util;

const REQUEST_METADATA_HEADER: &str = "build.bazel.remote.execution.v2.requestmetadata-bin";
pub const TOOL_NAME: &str = "recc";
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Payload size limit for batched blob transfer; anything larger goes
/// through the ByteStream service.
const BATCH_BLOB_LIMIT: usize = 2 * 1024 * 1024;
const BYTESTREAM_CHUNK_SIZE: usize = 1024 * 1024;
/// How often the Execute wait loop wakes up to check the stop token.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

const EXECUTE_PATH: &str = "/build.bazel.remote.execution.v2.Execution/Execute";
const GET_ACTION_RESULT_PATH: &str =
    "/build.bazel.remote.execution.v2.ActionCache/GetActionResult";
const UPDATE_ACTION_RESULT_PATH: &str =
    "/build.bazel.remote.execution.v2.ActionCache/UpdateActionResult";
const FIND_MISSING_BLOBS_PATH: &str =
    "/build.bazel.remote.execution.v2.ContentAddressableStorage/FindMissingBlobs";
const BATCH_UPDATE_BLOBS_PATH: &str =
    "/build.bazel.remote.execution.v2.ContentAddressableStorage/BatchUpdateBlobs";
const BATCH_READ_BLOBS_PATH: &str =
    "/build.bazel.remote.execution.v2.ContentAddressableStorage/BatchReadBlobs";
const BYTESTREAM_READ_PATH: &str = "/google.bytestream.ByteStream/Read";
const BYTESTREAM_WRITE_PATH: &str = "/google.bytestream.ByteStream/Write";

type ReccService = InterceptedService<Channel, MetadataInterceptor>;

/// Attaches the binary RequestMetadata header (tool name and version,
/// action id, tool invocation id, correlated invocations id) and the
/// optional bearer token to every outgoing request.
#[derive(Clone)]
pub struct MetadataInterceptor {
    request_metadata: Arc<Vec<u8>>,
    authorization: Option<MetadataValue<tonic::metadata::Ascii>>,
}

impl MetadataInterceptor {
    pub fn new(config: &Config, action_digest: &re::Digest) -> Result<MetadataInterceptor> {
        let metadata = re::RequestMetadata {
            tool_details: Some(re::ToolDetails {
                tool_name: TOOL_NAME.to_owned(),
                tool_version: TOOL_VERSION.to_owned(),
            }),
            action_id: action_digest.to_string(),
            tool_invocation_id: util::tool_invocation_id(),
            correlated_invocations_id: config.correlated_invocations_id.clone(),
        };

        let authorization = if config.access_token_path.is_empty() {
            None
        } else {
            let token = std::fs::read_to_string(&config.access_token_path)
                .with_context(|| {
                    format!("failed to read access token {}", config.access_token_path)
                })?
                .trim()
                .to_owned();
            Some(
                format!("Bearer {}", token)
                    .parse()
                    .context("access token is not a valid header value")?,
            )
        };

        Ok(MetadataInterceptor {
            request_metadata: Arc::new(metadata.encode_to_vec()),
            authorization,
        })
    }
}

impl Interceptor for MetadataInterceptor {
    fn call(&mut self, mut request: Request<()>) -> std::result::Result<Request<()>, Status> {
        request.metadata_mut().insert_bin(
            MetadataKey::from_static(REQUEST_METADATA_HEADER),
            MetadataValue::from_bytes(self.request_metadata.as_slice()),
        );
        if let Some(authorization) = &self.authorization {
            request
                .metadata_mut()
                .insert("authorization", authorization.clone());
        }
        Ok(request)
    }
}

/// Open a lazily-connected channel to `uri`, applying the configured
/// timeout, keepalive and TLS settings.
fn connect_channel(uri: &str, config: &Config) -> Result<Channel> {
    if uri.is_empty() {
        bail!("no server configured (set RECC_SERVER)");
    }

    let mut endpoint = Endpoint::from_shared(uri.to_owned())
        .with_context(|| format!("invalid server URI \"{}\"", uri))?;
    if config.request_timeout_secs > 0 {
        endpoint = endpoint.timeout(Duration::from_secs(config.request_timeout_secs));
    }
    if config.keepalive_time_secs > 0 {
        endpoint =
            endpoint.http2_keep_alive_interval(Duration::from_secs(config.keepalive_time_secs));
    }
    if uri.starts_with("https://") || config.server_auth_googleapi {
        endpoint = endpoint
            .tls_config(ClientTlsConfig::new())
            .context("failed to configure TLS")?;
    }

    Ok(endpoint.connect_lazy())
}

fn make_service(uri: &str, config: &Config, interceptor: &MetadataInterceptor) -> Result<Grpc<ReccService>> {
    let channel = connect_channel(uri, config)?;
    Ok(Grpc::new(InterceptedService::new(
        channel,
        interceptor.clone(),
    )))
}

pub fn make_cas_client(
    config: &Config,
    interceptor: &MetadataInterceptor,
) -> Result<Arc<dyn CasClient>> {
    Ok(Arc::new(GrpcCasClient {
        grpc: make_service(&config.cas_server, config, interceptor)?,
        instance_name: config.cas_instance.clone(),
        config: config.clone(),
    }))
}

pub fn make_action_cache_client(
    config: &Config,
    interceptor: &MetadataInterceptor,
) -> Result<Arc<dyn ActionCacheClient>> {
    Ok(Arc::new(GrpcActionCacheClient {
        grpc: make_service(&config.action_cache_server, config, interceptor)?,
        instance_name: config.action_cache_instance.clone(),
        config: config.clone(),
    }))
}

pub fn make_execution_client(
    config: &Config,
    interceptor: &MetadataInterceptor,
) -> Result<Arc<dyn ExecutionClient>> {
    Ok(Arc::new(GrpcExecutionClient {
        grpc: make_service(&config.server, config, interceptor)?,
        instance_name: config.instance.clone(),
        config: config.clone(),
    }))
}

fn is_retryable(code: Code) -> bool {
    matches!(
        code,
        Code::Unavailable
            | Code::DeadlineExceeded
            | Code::ResourceExhausted
            | Code::Aborted
            | Code::Internal
            | Code::Unknown
    )
}

/// Run `call` up to `retry_limit + 1` times, waiting
/// `retry_delay * 2^n` between attempts.
async fn retrying<T, Fut>(
    config: &Config,
    description: &str,
    mut call: impl FnMut() -> Fut,
) -> Result<T>
where
    Fut: std::future::Future<Output = std::result::Result<T, Status>>,
{
    let mut attempt: u32 = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(status) => {
                if attempt >= config.retry_limit || !is_retryable(status.code()) {
                    return Err(GrpcError(status).into());
                }
                let delay = config
                    .retry_delay_ms
                    .saturating_mul(1u64 << attempt.min(32));
                warn!(
                    "{} failed ({}); retrying in {} ms",
                    description, status, delay
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
        }
    }
}

async fn unary<Req, Resp>(
    grpc: &Grpc<ReccService>,
    path: &'static str,
    request: Req,
    timeout: Option<Duration>,
) -> std::result::Result<Resp, Status>
where
    Req: prost::Message + 'static,
    Resp: prost::Message + Default + 'static,
{
    let mut grpc = grpc.clone();
    grpc.ready()
        .await
        .map_err(|e| Status::unknown(format!("service was not ready: {}", e)))?;
    let codec = tonic::codec::ProstCodec::default();
    let mut request = Request::new(request);
    if let Some(timeout) = timeout {
        request.set_timeout(timeout);
    }
    Ok(grpc
        .unary(request, PathAndQuery::from_static(path), codec)
        .await?
        .into_inner())
}

/// The elastic ByteStream deadline: the base request timeout extended
/// with the time the transfer is allowed to take at the configured
/// minimum throughput.
fn bytestream_timeout(config: &Config, transfer_size: usize) -> Option<Duration> {
    if config.min_throughput == 0 {
        return None;
    }
    let base = Duration::from_secs(config.request_timeout_secs);
    let transfer = Duration::from_secs(transfer_size as u64 / config.min_throughput + 1);
    Some(base + transfer)
}

struct GrpcCasClient {
    grpc: Grpc<ReccService>,
    instance_name: String,
    config: Config,
}

impl GrpcCasClient {
    fn upload_resource_name(&self, digest: &re::Digest) -> String {
        let uuid = uuid::Uuid::new_v4();
        if self.instance_name.is_empty() {
            format!("uploads/{}/blobs/{}/{}", uuid, digest.hash, digest.size_bytes)
        } else {
            format!(
                "{}/uploads/{}/blobs/{}/{}",
                self.instance_name, uuid, digest.hash, digest.size_bytes
            )
        }
    }

    fn read_resource_name(&self, digest: &re::Digest) -> String {
        if self.instance_name.is_empty() {
            format!("blobs/{}/{}", digest.hash, digest.size_bytes)
        } else {
            format!(
                "{}/blobs/{}/{}",
                self.instance_name, digest.hash, digest.size_bytes
            )
        }
    }

    async fn batch_upload(&self, batch: Vec<re::batch_update_blobs_request::Request>) -> Result<()> {
        let request = re::BatchUpdateBlobsRequest {
            instance_name: self.instance_name.clone(),
            requests: batch,
        };
        let response: re::BatchUpdateBlobsResponse =
            retrying(&self.config, "BatchUpdateBlobs", || {
                unary(&self.grpc, BATCH_UPDATE_BLOBS_PATH, request.clone(), None)
            })
            .await?;

        for blob_response in response.responses {
            let status = blob_response.status.unwrap_or_default();
            if status.code != 0 {
                bail!(
                    "failed to upload blob {}: {}",
                    blob_response.digest.unwrap_or_default(),
                    status.message
                );
            }
        }
        Ok(())
    }

    async fn bytestream_upload(&self, digest: &re::Digest, data: Vec<u8>) -> Result<()> {
        let resource_name = self.upload_resource_name(digest);
        let timeout = bytestream_timeout(&self.config, data.len());

        let total = data.len();
        let mut requests = Vec::new();
        let mut offset = 0;
        // An empty blob still needs one finishing write.
        loop {
            let end = (offset + BYTESTREAM_CHUNK_SIZE).min(total);
            requests.push(bytestream::WriteRequest {
                resource_name: resource_name.clone(),
                write_offset: offset as i64,
                finish_write: end == total,
                data: data[offset..end].to_vec(),
            });
            offset = end;
            if offset == total {
                break;
            }
        }

        let response: bytestream::WriteResponse = retrying(&self.config, "ByteStream.Write", || {
            let requests = requests.clone();
            async move {
                let mut grpc = self.grpc.clone();
                grpc.ready()
                    .await
                    .map_err(|e| Status::unknown(format!("service was not ready: {}", e)))?;
                let codec = tonic::codec::ProstCodec::default();
                let mut request = Request::new(futures::stream::iter(requests));
                if let Some(timeout) = timeout {
                    request.set_timeout(timeout);
                }
                Ok(grpc
                    .client_streaming(request, PathAndQuery::from_static(BYTESTREAM_WRITE_PATH), codec)
                    .await?
                    .into_inner())
            }
        })
        .await?;

        if response.committed_size != digest.size_bytes {
            bail!(
                "short ByteStream write for {}: committed {} of {} bytes",
                digest,
                response.committed_size,
                digest.size_bytes
            );
        }
        Ok(())
    }

    async fn bytestream_download(&self, digest: &re::Digest) -> Result<Vec<u8>> {
        let resource_name = self.read_resource_name(digest);
        let timeout = bytestream_timeout(&self.config, digest.size_bytes as usize);

        retrying(&self.config, "ByteStream.Read", || async {
            let mut grpc = self.grpc.clone();
            grpc.ready()
                .await
                .map_err(|e| Status::unknown(format!("service was not ready: {}", e)))?;
            let codec = tonic::codec::ProstCodec::default();
            let mut request = Request::new(bytestream::ReadRequest {
                resource_name: resource_name.clone(),
                read_offset: 0,
                read_limit: 0,
            });
            if let Some(timeout) = timeout {
                request.set_timeout(timeout);
            }
            let mut stream = grpc
                .server_streaming(request, PathAndQuery::from_static(BYTESTREAM_READ_PATH), codec)
                .await?
                .into_inner();

            let mut data = Vec::with_capacity(digest.size_bytes as usize);
            while let Some(response) = stream.message().await? {
                let response: bytestream::ReadResponse = response;
                data.extend_from_slice(&response.data);
            }
            Ok(data)
        })
        .await
    }
}

#[async_trait]
impl CasClient for GrpcCasClient {
    async fn find_missing_blobs(&self, digests: Vec<re::Digest>) -> Result<Vec<re::Digest>> {
        let mut missing = Vec::new();
        for chunk in digests.chunks(4096) {
            let request = re::FindMissingBlobsRequest {
                instance_name: self.instance_name.clone(),
                blob_digests: chunk.to_vec(),
            };
            let response: re::FindMissingBlobsResponse =
                retrying(&self.config, "FindMissingBlobs", || {
                    unary(&self.grpc, FIND_MISSING_BLOBS_PATH, request.clone(), None)
                })
                .await?;
            missing.extend(response.missing_blob_digests);
        }
        Ok(missing)
    }

    async fn upload_blobs(&self, requests: Vec<UploadRequest>) -> Result<()> {
        let mut batch: Vec<re::batch_update_blobs_request::Request> = Vec::new();
        let mut batch_size = 0;

        for request in requests {
            let (digest, data) = match request {
                UploadRequest::Blob(digest, data) => (digest, data),
                UploadRequest::File(digest, path) => {
                    let data = std::fs::read(&path)
                        .with_context(|| format!("failed to read \"{}\" for upload", path))?;
                    (digest, data)
                }
            };

            if data.len() > BATCH_BLOB_LIMIT {
                self.bytestream_upload(&digest, data).await?;
                continue;
            }

            if batch_size + data.len() > BATCH_BLOB_LIMIT && !batch.is_empty() {
                self.batch_upload(std::mem::take(&mut batch)).await?;
                batch_size = 0;
            }
            batch_size += data.len();
            batch.push(re::batch_update_blobs_request::Request {
                digest: Some(digest),
                data,
            });
        }

        if !batch.is_empty() {
            self.batch_upload(batch).await?;
        }
        Ok(())
    }

    async fn download_blob(&self, digest: &re::Digest) -> Result<Vec<u8>> {
        if digest.size_bytes as usize > BATCH_BLOB_LIMIT {
            return self.bytestream_download(digest).await;
        }

        let request = re::BatchReadBlobsRequest {
            instance_name: self.instance_name.clone(),
            digests: vec![digest.clone()],
        };
        let mut response: re::BatchReadBlobsResponse =
            retrying(&self.config, "BatchReadBlobs", || {
                unary(&self.grpc, BATCH_READ_BLOBS_PATH, request.clone(), None)
            })
            .await?;

        let blob = response
            .responses
            .pop()
            .ok_or_else(|| anyhow!("BatchReadBlobs returned no response for {}", digest))?;
        let status = blob.status.unwrap_or_default();
        if status.code != 0 {
            bail!("failed to download blob {}: {}", digest, status.message);
        }
        Ok(blob.data)
    }
}

struct GrpcActionCacheClient {
    grpc: Grpc<ReccService>,
    instance_name: String,
    config: Config,
}

#[async_trait]
impl ActionCacheClient for GrpcActionCacheClient {
    async fn fetch_action_result(
        &self,
        action_digest: &re::Digest,
        inline_output_files: &[String],
    ) -> Result<Option<re::ActionResult>> {
        let request = re::GetActionResultRequest {
            instance_name: self.instance_name.clone(),
            action_digest: Some(action_digest.clone()),
            inline_stdout: true,
            inline_stderr: true,
            inline_output_files: inline_output_files.to_vec(),
        };

        let result: std::result::Result<re::ActionResult, Status> =
            retrying(&self.config, "GetActionResult", || {
                unary(&self.grpc, GET_ACTION_RESULT_PATH, request.clone(), None)
            })
            .await
            .map_err(|e| match e.downcast::<GrpcError>() {
                Ok(grpc_error) => grpc_error.0,
                Err(other) => Status::unknown(other.to_string()),
            });

        match result {
            Ok(action_result) => Ok(Some(action_result)),
            Err(status) if status.code() == Code::NotFound => Ok(None),
            Err(status) => Err(GrpcError(status).into()),
        }
    }

    async fn update_action_result(
        &self,
        action_digest: &re::Digest,
        action_result: &re::ActionResult,
    ) -> Result<()> {
        let request = re::UpdateActionResultRequest {
            instance_name: self.instance_name.clone(),
            action_digest: Some(action_digest.clone()),
            action_result: Some(action_result.clone()),
        };
        let _: re::ActionResult = retrying(&self.config, "UpdateActionResult", || {
            unary(&self.grpc, UPDATE_ACTION_RESULT_PATH, request.clone(), None)
        })
        .await?;
        Ok(())
    }
}

struct GrpcExecutionClient {
    grpc: Grpc<ReccService>,
    instance_name: String,
    config: Config,
}

impl GrpcExecutionClient {
    /// Wait on the operation stream, checking the stop token between
    /// messages so signals cancel the wait promptly.
    async fn wait_for_operation(
        &self,
        mut stream: tonic::Streaming<longrunning::Operation>,
        stop_token: &AtomicBool,
    ) -> std::result::Result<re::ActionResult, Status> {
        loop {
            if stop_token.load(Ordering::Relaxed) {
                return Err(Status::cancelled("execution cancelled by signal"));
            }

            match tokio::time::timeout(STOP_POLL_INTERVAL, stream.message()).await {
                Err(_elapsed) => continue,
                Ok(Err(status)) => return Err(status),
                Ok(Ok(None)) => {
                    return Err(Status::unknown(
                        "execution stream ended without a completed operation",
                    ));
                }
                Ok(Ok(Some(operation))) => {
                    if !operation.done {
                        continue;
                    }
                    return extract_action_result(operation);
                }
            }
        }
    }
}

fn extract_action_result(
    operation: longrunning::Operation,
) -> std::result::Result<re::ActionResult, Status> {
    match operation.result {
        Some(longrunning::operation::Result::Error(status)) => {
            Err(Status::new(Code::from(status.code), status.message))
        }
        Some(longrunning::operation::Result::Response(any)) => {
            let response = re::ExecuteResponse::decode(any.value.as_slice())
                .map_err(|e| Status::internal(format!("undecodable ExecuteResponse: {}", e)))?;
            if let Some(status) = response.status {
                if status.code != 0 {
                    return Err(Status::new(Code::from(status.code), status.message));
                }
            }
            response
                .result
                .ok_or_else(|| Status::internal("ExecuteResponse without an action result"))
        }
        None => Err(Status::internal("completed operation carries no result")),
    }
}

#[async_trait]
impl ExecutionClient for GrpcExecutionClient {
    async fn execute_action(
        &self,
        action_digest: &re::Digest,
        stop_token: &AtomicBool,
        skip_cache_lookup: bool,
    ) -> Result<re::ActionResult> {
        let request = re::ExecuteRequest {
            instance_name: self.instance_name.clone(),
            skip_cache_lookup,
            action_digest: Some(action_digest.clone()),
        };

        retrying(&self.config, "Execute", || {
            let request = request.clone();
            async move {
                let mut grpc = self.grpc.clone();
                grpc.ready()
                    .await
                    .map_err(|e| Status::unknown(format!("service was not ready: {}", e)))?;
                let codec = tonic::codec::ProstCodec::default();
                let stream = grpc
                    .server_streaming(
                        Request::new(request),
                        PathAndQuery::from_static(EXECUTE_PATH),
                        codec,
                    )
                    .await?
                    .into_inner();
                self.wait_for_operation(stream, stop_token).await
            }
        })
        .await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_is_retryable() {
        assert!(is_retryable(Code::Unavailable));
        assert!(is_retryable(Code::DeadlineExceeded));
        assert!(!is_retryable(Code::NotFound));
        assert!(!is_retryable(Code::InvalidArgument));
        assert!(!is_retryable(Code::Cancelled));
    }

    #[test]
    fn test_bytestream_timeout_scales_with_size() {
        let mut config = Config::default();
        assert_eq!(bytestream_timeout(&config, 1024), None);

        config.min_throughput = 1024;
        config.request_timeout_secs = 10;
        let timeout = bytestream_timeout(&config, 10 * 1024).unwrap();
        assert_eq!(timeout, Duration::from_secs(10 + 10 + 1));
    }

    #[tokio::test]
    async fn test_retrying_respects_retry_limit() {
        let mut config = Config::default();
        config.retry_limit = 2;
        config.retry_delay_ms = 1;

        let mut attempts = 0;
        let result: Result<()> = retrying(&config, "test", || {
            attempts += 1;
            async { Err(Status::unavailable("down")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_retrying_does_not_retry_permanent_errors() {
        let mut config = Config::default();
        config.retry_limit = 5;
        config.retry_delay_ms = 1;

        let mut attempts = 0;
        let result: Result<()> = retrying(&config, "test", || {
            attempts += 1;
            async { Err(Status::invalid_argument("bad")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_extract_action_result() {
        use crate::protos::rpc;

        let operation = longrunning::Operation {
            done: true,
            result: Some(longrunning::operation::Result::Error(rpc::Status {
                code: Code::PermissionDenied as i32,
                message: "nope".into(),
                details: Vec::new(),
            })),
            ..Default::default()
        };
        let status = extract_action_result(operation).unwrap_err();
        assert_eq!(status.code(), Code::PermissionDenied);

        let response = re::ExecuteResponse {
            result: Some(re::ActionResult {
                exit_code: 3,
                ..Default::default()
            }),
            ..Default::default()
        };
        let operation = longrunning::Operation {
            done: true,
            result: Some(longrunning::operation::Result::Response(prost_types::Any {
                type_url: "type.googleapis.com/build.bazel.remote.execution.v2.ExecuteResponse"
                    .into(),
                value: response.encode_to_vec(),
            })),
            ..Default::default()
        };
        assert_eq!(extract_action_result(operation).unwrap().exit_code, 3);
    }
}
