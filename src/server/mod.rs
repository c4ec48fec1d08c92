//! gRPC front end
//!
//! Thin, stateless translation layer between the wire and the arbiter:
//! request validation, sampler defaulting, outcome-to-status mapping, and
//! cancel-on-disconnect. All queueing and concurrency decisions live in the
//! arbiter.

use crate::arbiter::{Arbiter, SubmitError, UnknownJob};
use crate::config::ServiceConfig;
use crate::job::{JobId, JobOutcome, JobSpec};
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::{Request, Response, Status};

pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/chatd.rs"));

    pub const FILE_DESCRIPTOR_SET: &[u8] =
        include_bytes!(concat!(env!("OUT_DIR"), "/chatd_descriptor.bin"));
}

use proto::chat_service_server::ChatService;
use proto::{CancelReply, CancelRequest, CompletionReply, CompletionRequest, TokenFragment};

impl From<SubmitError> for Status {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::QueueFull { .. } => Status::resource_exhausted(e.to_string()),
            SubmitError::ShuttingDown => Status::unavailable(e.to_string()),
        }
    }
}

impl From<UnknownJob> for Status {
    fn from(e: UnknownJob) -> Self {
        Status::not_found(e.to_string())
    }
}

/// Maps a terminal outcome to the completion text or the gRPC status the
/// caller sees.
fn completion_text(outcome: JobOutcome) -> Result<String, Status> {
    match outcome {
        JobOutcome::Completed(text) => Ok(text),
        JobOutcome::Failed(message) => Err(Status::internal(message)),
        JobOutcome::Cancelled => Err(Status::cancelled("job was cancelled")),
        JobOutcome::TimedOut => Err(Status::deadline_exceeded("job deadline expired")),
    }
}

/// Cancels and abandons the job if the response future is dropped before
/// the outcome is delivered, i.e. the client disconnected mid-request.
/// Abandoning also releases the arbiter's bookkeeping, which no one else
/// will do once the waiter is gone.
struct CancelOnDrop {
    arbiter: Arbiter,
    job: Option<JobId>,
}

impl CancelOnDrop {
    fn new(arbiter: Arbiter, job: JobId) -> Self {
        Self {
            arbiter,
            job: Some(job),
        }
    }

    fn disarm(&mut self) {
        self.job.take();
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(id) = self.job.take() {
            tracing::debug!(job = %id, "caller went away, cancelling");
            self.arbiter.abandon(id);
        }
    }
}

pub struct ChatFrontEnd {
    arbiter: Arbiter,
    config: ServiceConfig,
}

impl ChatFrontEnd {
    pub fn new(arbiter: Arbiter, config: ServiceConfig) -> Self {
        Self { arbiter, config }
    }

    /// Builds a job spec from the wire request: server defaults fill the
    /// gaps, overrides are clamped, and the output token bound never exceeds
    /// the configured maximum.
    fn job_spec(&self, req: CompletionRequest) -> Result<JobSpec, Status> {
        if req.prompt.trim().is_empty() {
            return Err(Status::invalid_argument("prompt must not be empty"));
        }

        let mut sampler = self.config.default_sampler();
        if let Some(temperature) = req.temperature {
            sampler.temperature = temperature;
        }
        if let Some(top_p) = req.top_p {
            sampler.top_p = top_p;
        }
        if let Some(top_k) = req.top_k {
            sampler.top_k = top_k;
        }
        sampler.seed = req.seed;
        sampler.validate();

        let max_tokens = req
            .max_tokens
            .map(|m| m.min(self.config.max_tokens))
            .unwrap_or(self.config.max_tokens);

        let deadline = req
            .deadline_ms
            .map(|ms| tokio::time::Instant::now() + Duration::from_millis(ms));

        Ok(JobSpec {
            prompt: req.prompt,
            system_prompt: req
                .system_prompt
                .or_else(|| self.config.system_prompt.clone()),
            sampler,
            max_tokens,
            deadline,
        })
    }
}

fn parse_job_id(raw: &str) -> Result<JobId, Status> {
    raw.parse()
        .map_err(|_| Status::invalid_argument(format!("not a job id: {raw}")))
}

#[tonic::async_trait]
impl ChatService for ChatFrontEnd {
    async fn complete(
        &self,
        request: Request<CompletionRequest>,
    ) -> Result<Response<CompletionReply>, Status> {
        let spec = self.job_spec(request.into_inner())?;
        let id = self.arbiter.submit(spec, None)?;

        let mut guard = CancelOnDrop::new(self.arbiter.clone(), id);
        let outcome = self.arbiter.await_result(id).await?;
        guard.disarm();

        let text = completion_text(outcome)?;
        Ok(Response::new(CompletionReply {
            job_id: id.to_string(),
            text,
        }))
    }

    type CompleteStreamStream =
        Pin<Box<dyn Stream<Item = Result<TokenFragment, Status>> + Send + 'static>>;

    async fn complete_stream(
        &self,
        request: Request<CompletionRequest>,
    ) -> Result<Response<Self::CompleteStreamStream>, Status> {
        let spec = self.job_spec(request.into_inner())?;

        let (sink_tx, mut sink_rx) = mpsc::channel::<String>(32);
        let id = self.arbiter.submit(spec, Some(sink_tx))?;
        let (out_tx, out_rx) = mpsc::channel::<Result<TokenFragment, Status>>(32);

        let arbiter = self.arbiter.clone();
        tokio::spawn(async move {
            let mut guard = CancelOnDrop::new(arbiter.clone(), id);

            // The sink closes when the job finalizes; the output channel
            // closes when the client goes away.
            loop {
                tokio::select! {
                    fragment = sink_rx.recv() => match fragment {
                        Some(text) => {
                            let fragment = TokenFragment {
                                job_id: id.to_string(),
                                text,
                                done: false,
                            };
                            if out_tx.send(Ok(fragment)).await.is_err() {
                                return;
                            }
                        }
                        None => break,
                    },
                    _ = out_tx.closed() => return,
                }
            }

            let item = match arbiter.await_result(id).await {
                Ok(outcome) => {
                    guard.disarm();
                    completion_text(outcome).map(|_| TokenFragment {
                        job_id: id.to_string(),
                        text: String::new(),
                        done: true,
                    })
                }
                Err(e) => {
                    guard.disarm();
                    Err(e.into())
                }
            };
            let _ = out_tx.send(item).await;
        });

        let stream = ReceiverStream::new(out_rx);
        Ok(Response::new(Box::pin(stream) as Self::CompleteStreamStream))
    }

    async fn cancel(
        &self,
        request: Request<CancelRequest>,
    ) -> Result<Response<CancelReply>, Status> {
        let id = parse_job_id(&request.into_inner().job_id)?;
        self.arbiter.cancel(id)?;
        Ok(Response::new(CancelReply {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::MockEngine;
    use crate::lifecycle::Supervisor;
    use std::path::PathBuf;
    use tokio_stream::StreamExt;
    use tonic::Code;

    fn front_end(queue_capacity: usize) -> (Supervisor, ChatFrontEnd) {
        let supervisor = Supervisor::with_engines(
            vec![MockEngine::new(Duration::from_millis(10))],
            queue_capacity,
        )
        .unwrap();
        let config = ServiceConfig {
            model_path: PathBuf::from("/models/test.gguf"),
            max_tokens: 64,
            ..ServiceConfig::default()
        };
        let front_end = ChatFrontEnd::new(supervisor.arbiter().clone(), config);
        (supervisor, front_end)
    }

    fn completion_request(prompt: &str) -> CompletionRequest {
        CompletionRequest {
            prompt: prompt.to_string(),
            system_prompt: None,
            temperature: None,
            top_p: None,
            top_k: None,
            seed: None,
            max_tokens: None,
            deadline_ms: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_returns_full_text() {
        let (_supervisor, front_end) = front_end(4);
        let reply = front_end
            .complete(Request::new(completion_request("hi")))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.text, "hello world");
        assert!(reply.job_id.parse::<JobId>().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_prompt_rejected() {
        let (_supervisor, front_end) = front_end(4);
        let status = front_end
            .complete(Request::new(completion_request("   ")))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_full_maps_to_resource_exhausted() {
        let (_supervisor, front_end) = front_end(1);
        let arbiter = front_end.arbiter.clone();

        // Occupy the slot, then fill the single-entry queue.
        let slow = front_end.job_spec(completion_request("p1")).unwrap();
        arbiter.submit(slow, None).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        let queued = front_end.job_spec(completion_request("p2")).unwrap();
        arbiter.submit(queued, None).unwrap();

        let status = front_end
            .complete(Request::new(completion_request("p3")))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::ResourceExhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_maps_to_deadline_exceeded() {
        let supervisor = Supervisor::with_engines(
            vec![MockEngine::new(Duration::from_secs(1))],
            4,
        )
        .unwrap();
        let config = ServiceConfig {
            model_path: PathBuf::from("/models/test.gguf"),
            ..ServiceConfig::default()
        };
        let front_end = ChatFrontEnd::new(supervisor.arbiter().clone(), config);

        let mut req = completion_request("slow");
        req.deadline_ms = Some(100);
        let status = front_end.complete(Request::new(req)).await.unwrap_err();
        assert_eq!(status.code(), Code::DeadlineExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_delivers_fragments_then_done() {
        let (_supervisor, front_end) = front_end(4);
        let mut stream = front_end
            .complete_stream(Request::new(completion_request("hi")))
            .await
            .unwrap()
            .into_inner();

        let mut text = String::new();
        let mut saw_done = false;
        while let Some(item) = stream.next().await {
            let fragment = item.unwrap();
            if fragment.done {
                saw_done = true;
                assert!(fragment.text.is_empty());
            } else {
                text.push_str(&fragment.text);
            }
        }
        assert_eq!(text, "hello world");
        assert!(saw_done, "stream must end with a done fragment");
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_caller_releases_job() {
        let supervisor = Supervisor::with_engines(
            vec![MockEngine::new(Duration::from_secs(1))],
            4,
        )
        .unwrap();
        let config = ServiceConfig {
            model_path: PathBuf::from("/models/test.gguf"),
            ..ServiceConfig::default()
        };
        let front_end = ChatFrontEnd::new(supervisor.arbiter().clone(), config);
        let arbiter = front_end.arbiter.clone();

        // The client disconnects mid-generation: the RPC future is dropped.
        let call = front_end.complete(Request::new(completion_request("slow")));
        assert!(tokio::time::timeout(Duration::from_millis(50), call)
            .await
            .is_err());

        // The job is cancelled and its bookkeeping released, not leaked.
        arbiter.idle().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(arbiter.tracked_jobs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_unknown_job_is_not_found() {
        let (_supervisor, front_end) = front_end(4);
        let status = front_end
            .cancel(Request::new(CancelRequest {
                job_id: uuid::Uuid::new_v4().to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_malformed_id_is_invalid_argument() {
        let (_supervisor, front_end) = front_end(4);
        let status = front_end
            .cancel(Request::new(CancelRequest {
                job_id: "not-a-uuid".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_overrides_clamped_and_capped() {
        let (_supervisor, front_end) = front_end(4);
        let mut req = completion_request("hi");
        req.temperature = Some(9.0);
        req.max_tokens = Some(10_000);
        req.seed = Some(7);

        let spec = front_end.job_spec(req).unwrap();
        assert_eq!(spec.sampler.temperature, 2.0);
        assert_eq!(spec.sampler.seed, Some(7));
        // Per-request bound never exceeds the server maximum.
        assert_eq!(spec.max_tokens, 64);
    }
}
