//! Remote job execution.
//!
//! [`JobExecutor`] splits a job run into two awaitable milestones: the job
//! is started (queued item resolved to a concrete build), then the build
//! completes. The release engine maps the first milestone to
//! `Queueing -> InProgress` and the second to `Succeeded`/`Failed`.
//!
//! [`JenkinsJobExecutor`] talks to a Jenkins-style server over plain HTTP
//! polling: CSRF crumb, `buildWithParameters` trigger, queued-item poll,
//! build-result poll. [`SimulatingJobExecutor`] replaces the server with
//! timed sleeps for dry runs and tests.

use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

const SUCCESS_RESULT: &str = "SUCCESS";

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("HTTP request failed")]
    Http(#[from] reqwest::Error),

    #[error("{url} answered with unexpected status {status}")]
    UnexpectedStatus { url: String, status: u16 },

    #[error(
        "Triggering {job_url} did not yield a Location header pointing at the queued item; \
         configure the server to expose it (Access-Control-Expose-Headers: Location)"
    )]
    MissingLocationHeader { job_url: String },

    #[error("Could not parse the CSRF crumb from: {body}")]
    MalformedCrumb { body: String },

    #[error("Polling for {what} gave up after {attempts} attempts; last response: {last_body}")]
    Timeout {
        what: &'static str,
        attempts: u32,
        last_body: String,
    },

    #[error("Job ended with {result}, see {build_url}")]
    JobFailed { result: String, build_url: String },
}

/// How often and how long to poll for one milestone.
#[derive(Clone, Copy, Debug)]
pub struct PollSettings {
    pub initial_delay: Duration,
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            interval: Duration::from_secs(2),
            max_attempts: 10,
        }
    }
}

/// One probe's verdict: the awaited value, or evidence of what the server
/// said so a timeout can report it.
pub enum PollOutcome<T> {
    Ready(T),
    NotYet { body: String },
}

/// Repeatedly run `probe` until it yields a value or the attempt budget is
/// spent. Probe errors abort immediately; only NotYet answers are retried.
pub async fn poll_until<T, F, Fut>(
    what: &'static str,
    settings: &PollSettings,
    mut probe: F,
) -> Result<T, ExecutorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollOutcome<T>, ExecutorError>>,
{
    tokio::time::sleep(settings.initial_delay).await;
    let mut last_body = String::new();
    for attempt in 1..=settings.max_attempts {
        match probe().await? {
            PollOutcome::Ready(value) => return Ok(value),
            PollOutcome::NotYet { body } => {
                debug!(what, attempt, "not ready yet");
                last_body = body;
            }
        }
        if attempt < settings.max_attempts {
            tokio::time::sleep(settings.interval).await;
        }
    }
    Err(ExecutorError::Timeout {
        what,
        attempts: settings.max_attempts,
        last_body,
    })
}

/// Credentials sent as HTTP basic auth (Jenkins API token style).
#[derive(Clone, Debug)]
pub struct UsernameToken {
    pub username: String,
    pub token: String,
}

/// CSRF crumb as issued by the server: a header name and its value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Crumb {
    pub request_field: String,
    pub crumb: String,
}

/// Everything needed to trigger one job.
#[derive(Clone, Debug)]
pub struct JobTrigger {
    /// Job base URL ending in `/`, e.g. `https://ci.example.com/job/lib/`.
    pub job_url: String,
    pub parameters: BTreeMap<String, String>,
}

/// A job that has left the queue: a concrete build to await.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartedJob {
    pub build_number: u64,
    pub build_url: String,
}

#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Trigger the job and wait until the queued item turns into a running
    /// build.
    async fn start_job(&self, trigger: &JobTrigger) -> Result<StartedJob, ExecutorError>;

    /// Wait until the build finishes; Ok means the server reported success.
    async fn await_completion(&self, job: &StartedJob) -> Result<(), ExecutorError>;
}

pub struct JenkinsJobExecutor {
    client: reqwest::Client,
    base_url: String,
    auth: Option<UsernameToken>,
    queue_poll: PollSettings,
    result_poll: PollSettings,
    number_re: Regex,
    result_re: Regex,
}

impl JenkinsJobExecutor {
    pub fn new(
        base_url: impl Into<String>,
        auth: Option<UsernameToken>,
    ) -> Result<Self, ExecutorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Ok(Self {
            client,
            base_url,
            auth,
            queue_poll: PollSettings::default(),
            result_poll: PollSettings::default(),
            number_re: Regex::new(r"<number>([0-9]+)</number>").expect("hard-coded pattern"),
            result_re: Regex::new(r"<result>([A-Z_]+)</result>").expect("hard-coded pattern"),
        })
    }

    pub fn with_queue_poll(mut self, settings: PollSettings) -> Self {
        self.queue_poll = settings;
        self
    }

    pub fn with_result_poll(mut self, settings: PollSettings) -> Self {
        self.result_poll = settings;
        self
    }

    fn authenticated(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Some(auth) => request.basic_auth(&auth.username, Some(&auth.token)),
            None => request,
        }
    }

    async fn get_text(&self, url: &str) -> Result<(u16, String), ExecutorError> {
        let response = self.authenticated(self.client.get(url)).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok((status, body))
    }

    /// Ask the server for its CSRF crumb. A 404 means CSRF protection is
    /// off, which is not an error.
    async fn fetch_crumb(&self) -> Result<Option<Crumb>, ExecutorError> {
        let url = format!(
            "{}crumbIssuer/api/xml?xpath=concat(//crumbRequestField,\":\",//crumb)",
            self.base_url
        );
        let (status, body) = self.get_text(&url).await?;
        match status {
            200 => Ok(Some(parse_crumb(&body)?)),
            404 => Ok(None),
            other => Err(ExecutorError::UnexpectedStatus { url, status: other }),
        }
    }
}

fn parse_crumb(body: &str) -> Result<Crumb, ExecutorError> {
    let (field, value) = body
        .trim()
        .split_once(':')
        .ok_or_else(|| ExecutorError::MalformedCrumb {
            body: body.to_owned(),
        })?;
    if field.is_empty() || value.is_empty() {
        return Err(ExecutorError::MalformedCrumb {
            body: body.to_owned(),
        });
    }
    Ok(Crumb {
        request_field: field.to_owned(),
        crumb: value.to_owned(),
    })
}

fn extract_first(re: &Regex, body: &str) -> Option<String> {
    re.captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_owned())
}

#[async_trait]
impl JobExecutor for JenkinsJobExecutor {
    async fn start_job(&self, trigger: &JobTrigger) -> Result<StartedJob, ExecutorError> {
        let crumb = self.fetch_crumb().await?;

        let url = format!("{}buildWithParameters", trigger.job_url);
        let mut request = self.authenticated(self.client.post(&url)).form(&trigger.parameters);
        if let Some(crumb) = &crumb {
            request = request.header(crumb.request_field.as_str(), crumb.crumb.as_str());
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExecutorError::UnexpectedStatus {
                url,
                status: status.as_u16(),
            });
        }
        let mut queued_url = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| ExecutorError::MissingLocationHeader {
                job_url: trigger.job_url.clone(),
            })?;
        if !queued_url.ends_with('/') {
            queued_url.push('/');
        }
        debug!(job_url = %trigger.job_url, %queued_url, "job queued");

        let poll_url = format!("{queued_url}api/xml?xpath=//executable/number");
        let build_number = poll_until("queued item to start building", &self.queue_poll, || {
            let poll_url = poll_url.clone();
            async move {
                // A 404 here is a race with the server still materializing
                // the queued item; anything else non-200 is a hard failure.
                match self.get_text(&poll_url).await? {
                    (200, body) => Ok(
                        match extract_first(&self.number_re, &body)
                            .and_then(|n| n.parse::<u64>().ok())
                        {
                            Some(number) => PollOutcome::Ready(number),
                            None => PollOutcome::NotYet { body },
                        },
                    ),
                    (404, body) => Ok(PollOutcome::NotYet { body }),
                    (status, _) => Err(ExecutorError::UnexpectedStatus {
                        url: poll_url,
                        status,
                    }),
                }
            }
        })
        .await?;

        Ok(StartedJob {
            build_number,
            build_url: format!("{}{}/", trigger.job_url, build_number),
        })
    }

    async fn await_completion(&self, job: &StartedJob) -> Result<(), ExecutorError> {
        let poll_url = format!("{}api/xml?xpath=/*/result", job.build_url);
        let result = poll_until("build to finish", &self.result_poll, || {
            let poll_url = poll_url.clone();
            async move {
                match self.get_text(&poll_url).await? {
                    (200, body) => Ok(match extract_first(&self.result_re, &body) {
                        Some(result) => PollOutcome::Ready(result),
                        None => PollOutcome::NotYet { body },
                    }),
                    (404, body) => Ok(PollOutcome::NotYet { body }),
                    (status, _) => Err(ExecutorError::UnexpectedStatus {
                        url: poll_url,
                        status,
                    }),
                }
            }
        })
        .await?;

        if result == SUCCESS_RESULT {
            Ok(())
        } else {
            Err(ExecutorError::JobFailed {
                result,
                build_url: job.build_url.clone(),
            })
        }
    }
}

/// Dry-run executor: no HTTP, just plausible delays. `fail_nth` makes the
/// n-th awaited build report a failure, which exercises the retrigger
/// path.
pub struct SimulatingJobExecutor {
    started: AtomicU64,
    completed: AtomicU64,
    fail_nth: Option<u64>,
}

impl SimulatingJobExecutor {
    pub fn new() -> Self {
        Self {
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            fail_nth: None,
        }
    }

    pub fn failing_on(nth: u64) -> Self {
        Self {
            fail_nth: Some(nth),
            ..Self::new()
        }
    }
}

impl Default for SimulatingJobExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobExecutor for SimulatingJobExecutor {
    async fn start_job(&self, trigger: &JobTrigger) -> Result<StartedJob, ExecutorError> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let build_number = 100 + self.started.fetch_add(1, Ordering::SeqCst);
        debug!(job_url = %trigger.job_url, build_number, "simulated trigger");
        Ok(StartedJob {
            build_number,
            build_url: format!("{}{}/", trigger.job_url, build_number),
        })
    }

    async fn await_completion(&self, job: &StartedJob) -> Result<(), ExecutorError> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let nth = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_nth == Some(nth) {
            return Err(ExecutorError::JobFailed {
                result: "FAILURE".into(),
                build_url: job.build_url.clone(),
            });
        }
        Ok(())
    }
}
