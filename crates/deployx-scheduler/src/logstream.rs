//! Incremental job log tailing.
//!
//! A subscription polls the job record and yields whatever part of the log it
//! has not delivered yet, ending with a `Completed` event once the job is
//! terminal. Cursors are byte offsets into the log text.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use deployx_core::{JobId, JobStatus, Result};
use deployx_db::{DbError, JobRepo};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use tracing::{debug, warn};

/// Where a subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogStart {
    /// From the first byte of the log.
    #[default]
    Start,
    /// From the end of the log as it is at subscription time.
    Tail,
}

impl std::str::FromStr for LogStart {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "start" | "beginning" => Ok(LogStart::Start),
            "tail" | "end" => Ok(LogStart::Tail),
            _ => Err(format!("Unknown log start: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LogEvent {
    Chunk { data: String },
    Completed { status: JobStatus },
}

pub struct LogStreamService {
    jobs: Arc<dyn JobRepo>,
    poll_interval: Duration,
}

impl LogStreamService {
    pub fn new(jobs: Arc<dyn JobRepo>, poll_interval: Duration) -> Self {
        Self {
            jobs,
            poll_interval,
        }
    }

    pub async fn subscribe(
        &self,
        job_id: JobId,
        from: LogStart,
    ) -> Result<BoxStream<'static, LogEvent>> {
        let job = self.jobs.get(job_id).await?;
        let cursor = match from {
            LogStart::Start => 0,
            LogStart::Tail => job.logs.len(),
        };
        debug!(job_id = %job_id, cursor, "Log subscription opened");

        let tail = Tail {
            jobs: self.jobs.clone(),
            job_id,
            cursor,
            poll_interval: self.poll_interval,
            polled: false,
            done: false,
            pending: VecDeque::new(),
        };

        Ok(futures::stream::unfold(tail, |mut tail| async move {
            let event = tail.next_event().await?;
            Some((event, tail))
        })
        .boxed())
    }
}

struct Tail {
    jobs: Arc<dyn JobRepo>,
    job_id: JobId,
    cursor: usize,
    poll_interval: Duration,
    polled: bool,
    done: bool,
    pending: VecDeque<LogEvent>,
}

impl Tail {
    async fn next_event(&mut self) -> Option<LogEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.done {
                return None;
            }
            if self.polled {
                tokio::time::sleep(self.poll_interval).await;
            }
            self.polled = true;
            self.poll().await;
        }
    }

    async fn poll(&mut self) {
        match self.jobs.get(self.job_id).await {
            Ok(job) => {
                let (chunk, cursor) = advance(&job.logs, self.cursor);
                self.cursor = cursor;
                if let Some(data) = chunk {
                    self.pending.push_back(LogEvent::Chunk { data });
                }
                if job.status.is_terminal() {
                    self.pending
                        .push_back(LogEvent::Completed { status: job.status });
                    self.done = true;
                }
            }
            Err(DbError::NotFound(_)) => {
                debug!(job_id = %self.job_id, "Job disappeared; closing log stream");
                self.done = true;
            }
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "Failed to poll job log");
            }
        }
    }
}

/// Return the undelivered suffix of `logs` and the new cursor. A log shorter
/// than the cursor was reset, so reading restarts at zero.
fn advance(logs: &str, cursor: usize) -> (Option<String>, usize) {
    let mut start = if logs.len() < cursor { 0 } else { cursor };
    while !logs.is_char_boundary(start) {
        start -= 1;
    }
    if start == logs.len() {
        return (None, start);
    }
    (Some(logs[start..].to_string()), logs.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use deployx_core::{PipelineStatus, Step};
    use deployx_db::{NewPipeline, Store};

    async fn running_job(store: &Store) -> (JobId, i32) {
        let repository = store
            .repositories
            .create("app", "https://git.example.com/app.git", None)
            .await
            .unwrap();
        let pipeline = store
            .pipelines
            .create(NewPipeline {
                repository_id: repository.id,
                branch: "main".to_string(),
                commit_id: None,
                triggered_by: "manual".to_string(),
            })
            .await
            .unwrap();
        let jobs = store
            .pipelines
            .start_with_jobs(pipeline.id, &[Step::new("build", "make")])
            .await
            .unwrap();
        let attempt = store.jobs.claim(jobs[0].id).await.unwrap().unwrap();
        (jobs[0].id, attempt)
    }

    fn service(store: &Store) -> LogStreamService {
        LogStreamService::new(store.jobs.clone(), Duration::from_millis(5))
    }

    fn concat(events: &[LogEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                LogEvent::Chunk { data } => Some(data.as_str()),
                LogEvent::Completed { .. } => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_stream_delivers_each_byte_once_and_ends() {
        let store = Store::memory();
        let (job_id, attempt) = running_job(&store).await;
        store.jobs.append_log(job_id, attempt, "one\n").await.unwrap();

        let stream = service(&store)
            .subscribe(job_id, LogStart::Start)
            .await
            .unwrap();
        let writer = {
            let jobs = store.jobs.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                jobs.append_log(job_id, attempt, "two\n").await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
                jobs.append_log(job_id, attempt, "three\n").await.unwrap();
                jobs.complete(job_id, attempt, JobStatus::Success, None)
                    .await
                    .unwrap();
            })
        };

        let events: Vec<_> = tokio::time::timeout(Duration::from_secs(2), stream.collect())
            .await
            .unwrap();
        writer.await.unwrap();

        assert_eq!(concat(&events), "one\ntwo\nthree\n");
        assert_eq!(
            events.last(),
            Some(&LogEvent::Completed {
                status: JobStatus::Success
            })
        );
        let completions = events
            .iter()
            .filter(|e| matches!(e, LogEvent::Completed { .. }))
            .count();
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn test_tail_skips_existing_output() {
        let store = Store::memory();
        let (job_id, attempt) = running_job(&store).await;
        store
            .jobs
            .append_log(job_id, attempt, "old output\n")
            .await
            .unwrap();

        let stream = service(&store)
            .subscribe(job_id, LogStart::Tail)
            .await
            .unwrap();
        store.jobs.append_log(job_id, attempt, "new\n").await.unwrap();
        store
            .jobs
            .complete(job_id, attempt, JobStatus::Failed, Some("exit 1\n"))
            .await
            .unwrap();

        let events: Vec<_> = tokio::time::timeout(Duration::from_secs(2), stream.collect())
            .await
            .unwrap();
        assert_eq!(concat(&events), "new\nexit 1\n");
        assert_eq!(
            events.last(),
            Some(&LogEvent::Completed {
                status: JobStatus::Failed
            })
        );
    }

    #[tokio::test]
    async fn test_finished_job_yields_log_then_completion() {
        let store = Store::memory();
        let (job_id, attempt) = running_job(&store).await;
        store
            .jobs
            .complete(job_id, attempt, JobStatus::Success, Some("done\n"))
            .await
            .unwrap();

        let events: Vec<_> = service(&store)
            .subscribe(job_id, LogStart::Start)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(
            events,
            vec![
                LogEvent::Chunk {
                    data: "done\n".to_string()
                },
                LogEvent::Completed {
                    status: JobStatus::Success
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_cancelled_job_closes_stream() {
        let store = Store::memory();
        let (job_id, _) = running_job(&store).await;
        let pipeline_id = store.jobs.get(job_id).await.unwrap().pipeline_id;
        store.pipelines.cancel(pipeline_id).await.unwrap();
        assert_eq!(
            store.pipelines.get(pipeline_id).await.unwrap().status,
            PipelineStatus::Cancelled
        );

        let events: Vec<_> = service(&store)
            .subscribe(job_id, LogStart::Start)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(
            events,
            vec![LogEvent::Completed {
                status: JobStatus::Cancelled
            }]
        );
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let store = Store::memory();
        let result = service(&store).subscribe(JobId::new(), LogStart::Start).await;
        assert!(matches!(result, Err(deployx_core::Error::NotFound(_))));
    }

    #[test]
    fn test_advance() {
        assert_eq!(advance("", 0), (None, 0));
        assert_eq!(advance("abc", 0), (Some("abc".to_string()), 3));
        assert_eq!(advance("abcdef", 3), (Some("def".to_string()), 6));
        assert_eq!(advance("abc", 3), (None, 3));
        // log was reset underneath the reader
        assert_eq!(advance("xy", 5), (Some("xy".to_string()), 2));
        // cursor inside a multi-byte char backs up to its start
        assert_eq!(advance("é!", 1), (Some("é!".to_string()), 3));
    }

    #[test]
    fn test_log_start_parse() {
        assert_eq!("tail".parse::<LogStart>(), Ok(LogStart::Tail));
        assert_eq!("START".parse::<LogStart>(), Ok(LogStart::Start));
        assert!("middle".parse::<LogStart>().is_err());
    }
}
