//! Job commands, including live log following.

use std::io::Write;

use anyhow::{Context, Result, bail};
use deployx_core::{Job, JobStatus};
use serde::Deserialize;

use super::timestamp;
use crate::client::ApiClient;
use crate::sse::{SseDecoder, SseFrame};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum LogEvent {
    Chunk { data: String },
    Completed { status: JobStatus },
}

pub async fn show(client: &ApiClient, id: &str) -> Result<()> {
    let job: Job = client.get(&format!("/jobs/{}", id)).await?;
    println!("Job:      {} ({})", job.name, job.id);
    println!("Pipeline: {}", job.pipeline_id);
    println!("Command:  {}", job.command);
    println!("Status:   {} (attempt {})", job.status, job.attempt);
    if let Some(started) = &job.started_at {
        println!("Started:  {}", timestamp(started));
    }
    if let Some(completed) = &job.completed_at {
        println!("Finished: {}", timestamp(completed));
    }
    if !job.logs.is_empty() {
        println!();
        print!("{}", job.logs);
    }
    Ok(())
}

pub async fn retry(client: &ApiClient, id: &str) -> Result<()> {
    let job: Job = client
        .post(&format!("/jobs/{}/retry", id), &serde_json::json!({}))
        .await?;
    println!("Job {} requeued (attempt {} next)", job.id, job.attempt + 1);
    Ok(())
}

pub async fn logs(client: &ApiClient, id: &str, follow: bool, tail: bool) -> Result<()> {
    if !follow {
        let job: Job = client.get(&format!("/jobs/{}", id)).await?;
        print!("{}", job.logs);
        return Ok(());
    }

    let from = if tail { "tail" } else { "start" };
    let mut response = client
        .stream(&format!("/jobs/{}/logs?from={}", id, from))
        .await?;
    let mut decoder = SseDecoder::default();
    let mut stdout = std::io::stdout();

    while let Some(bytes) = response.chunk().await.context("log stream interrupted")? {
        for frame in decoder.push(&bytes) {
            match decode(&frame)? {
                Some(LogEvent::Chunk { data }) => {
                    stdout.write_all(data.as_bytes())?;
                    stdout.flush()?;
                }
                Some(LogEvent::Completed { status }) => {
                    eprintln!("Job finished: {}", status);
                    if status != JobStatus::Success {
                        std::process::exit(1);
                    }
                    return Ok(());
                }
                None => {}
            }
        }
    }
    bail!("log stream closed before the job finished")
}

fn decode(frame: &SseFrame) -> Result<Option<LogEvent>> {
    match frame.event.as_str() {
        "log" | "end" => Ok(Some(
            serde_json::from_str(&frame.data).context("malformed log event")?,
        )),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_frames() {
        let chunk = SseFrame {
            event: "log".to_string(),
            data: r#"{"type":"chunk","data":"building\r\n"}"#.to_string(),
        };
        assert!(matches!(
            decode(&chunk).unwrap(),
            Some(LogEvent::Chunk { data }) if data == "building\r\n"
        ));

        let end = SseFrame {
            event: "end".to_string(),
            data: r#"{"type":"completed","status":"FAILED"}"#.to_string(),
        };
        assert!(matches!(
            decode(&end).unwrap(),
            Some(LogEvent::Completed {
                status: JobStatus::Failed
            })
        ));

        let other = SseFrame {
            event: "message".to_string(),
            data: "hello".to_string(),
        };
        assert!(decode(&other).unwrap().is_none());
    }
}
