use crate::error::QueueError;
use crate::jobs::error_codes::ErrorCode;
use crate::jobs::model::{DocumentJob, ErrorClass, JobCategory, JobPayload, JobRecord, WebhookJob};
use crate::jobs::retry::classify;
use crate::subjects::EntityUpdateSerializer;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::{pin::Pin, sync::Arc, time::Duration};
use tokio::{sync::Semaphore, time::timeout};

pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
type HandlerFn = dyn for<'a> Fn(&'a JobRecord, &'a JobContext) -> BoxFuture<'a, Result<(), JobError>>
    + Send
    + Sync;
type FailedHookFn =
    dyn for<'a> Fn(&'a JobRecord, &'a JobError, &'a JobContext) -> BoxFuture<'a, ()> + Send + Sync;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    pub code: String,
    pub message: String,
}

impl JobError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn coded(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(code.as_str(), message)
    }

    /// An error without a known code; classified from its message text.
    pub fn uncoded(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unknown.as_str(), message)
    }

    pub fn classify(&self) -> ErrorClass {
        classify(&self.code, &self.message)
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for JobError {}

impl From<QueueError> for JobError {
    fn from(e: QueueError) -> Self {
        let code = match &e {
            QueueError::Storage(_) | QueueError::Unavailable(_) => ErrorCode::DependencyDown,
            QueueError::Payload(_) | QueueError::PayloadTooLarge { .. } => ErrorCode::BadPayload,
            QueueError::EntityNotFound(_) => ErrorCode::EntityNotFound,
            QueueError::VersionConflict { .. } => ErrorCode::Conflict,
            QueueError::JobNotFound(_) | QueueError::Update(_) => ErrorCode::Unknown,
        };
        JobError::coded(code, e.to_string())
    }
}

/// What a handler gets besides the job itself.
#[derive(Clone)]
pub struct JobContext {
    pub worker_id: String,
    /// Serialized read-modify-write access to subject records.
    pub subjects: EntityUpdateSerializer<Value>,
}

#[derive(Clone)]
pub struct HandlerEntry {
    pub handler: Arc<HandlerFn>,
    pub semaphore: Option<Arc<Semaphore>>,
    pub timeout: Option<Duration>,
    pub on_failed: Option<Arc<FailedHookFn>>,
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobCategory, HandlerEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, category: JobCategory, handler: F)
    where
        F: for<'a> Fn(&'a JobRecord, &'a JobContext) -> BoxFuture<'a, Result<(), JobError>>
            + Send
            + Sync
            + 'static,
    {
        self.register_with_options(category, handler, HandlerOptions::new());
    }

    pub fn register_with_options<F>(&mut self, category: JobCategory, handler: F, opts: HandlerOptions)
    where
        F: for<'a> Fn(&'a JobRecord, &'a JobContext) -> BoxFuture<'a, Result<(), JobError>>
            + Send
            + Sync
            + 'static,
    {
        let semaphore = opts
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        self.handlers.insert(
            category,
            HandlerEntry {
                handler: Arc::new(handler),
                semaphore,
                timeout: opts.timeout,
                on_failed: opts.on_failed,
            },
        );
    }

    pub fn handler_for(&self, category: JobCategory) -> Option<HandlerEntry> {
        self.handlers.get(&category).cloned()
    }

    pub fn categories(&self) -> Vec<JobCategory> {
        let mut cats: Vec<JobCategory> = self.handlers.keys().copied().collect();
        cats.sort_by_key(|c| c.as_str());
        cats
    }
}

#[derive(Clone, Default)]
pub struct HandlerOptions {
    max_concurrency: Option<usize>,
    timeout: Option<Duration>,
    on_failed: Option<Arc<FailedHookFn>>,
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    pub fn timeout(mut self, dur: Duration) -> Self {
        self.timeout = Some(dur);
        self
    }

    /// Runs once after a job of this category lands in `failed`.
    pub fn on_failed<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a JobRecord, &'a JobError, &'a JobContext) -> BoxFuture<'a, ()>
            + Send
            + Sync
            + 'static,
    {
        self.on_failed = Some(Arc::new(hook));
        self
    }
}

impl HandlerEntry {
    /// Run the handler under its concurrency limit and timeout. A panic
    /// inside the handler comes back as a `PANIC` error.
    pub async fn run(&self, job: &JobRecord, ctx: &JobContext) -> Result<(), JobError> {
        let _permit = if let Some(sem) = &self.semaphore {
            Some(
                sem.clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| JobError::coded(ErrorCode::DependencyDown, "handler semaphore closed"))?,
            )
        } else {
            None
        };

        let fut = AssertUnwindSafe((self.handler)(job, ctx)).catch_unwind();
        let res = if let Some(dur) = self.timeout {
            match timeout(dur, fut).await {
                Ok(inner) => inner,
                Err(_) => Ok(Err(JobError::coded(
                    ErrorCode::Timeout,
                    format!("handler timeout after {}ms", dur.as_millis()),
                ))),
            }
        } else {
            fut.await
        };

        match res {
            Ok(r) => r,
            Err(panic) => Err(JobError::coded(ErrorCode::Panic, panic_message(&*panic))),
        }
    }

    pub async fn failed(&self, job: &JobRecord, err: &JobError, ctx: &JobContext) {
        if let Some(hook) = &self.on_failed {
            let fut = AssertUnwindSafe(hook(job, err, ctx)).catch_unwind();
            if fut.await.is_err() {
                tracing::error!(job_id = %job.id, "failed-job hook panicked");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

pub fn boxed<'a, T>(fut: impl std::future::Future<Output = T> + Send + 'a) -> BoxFuture<'a, T> {
    Box::pin(fut)
}

pub fn document_payload(job: &JobRecord) -> Result<&DocumentJob, JobError> {
    match &job.payload {
        JobPayload::DocumentProcessing(p) => Ok(p),
        other => Err(JobError::coded(
            ErrorCode::BadPayload,
            format!("expected document-processing payload, got {}", other.category()),
        )),
    }
}

pub fn webhook_payload(job: &JobRecord) -> Result<&WebhookJob, JobError> {
    match &job.payload {
        JobPayload::WebhookDelivery(p) => Ok(p),
        other => Err(JobError::coded(
            ErrorCode::BadPayload,
            format!("expected webhook-delivery payload, got {}", other.category()),
        )),
    }
}
