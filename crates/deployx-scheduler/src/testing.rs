//! Scripted collaborators for engine tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use deployx_core::executor::{
    CommandExecutor, ExecOutcome, ExecRequest, Materializer, OutputSink, SourceSpec,
};
use deployx_core::{Error, Result};

/// Behaviour keyed on the command text:
/// - `fail`: prints a line, exits 1
/// - `flaky`: fails the first time, succeeds afterwards
/// - `hang`: prints a line, then never finishes
/// - `slow`: finishes after 50 ms
/// - `error`: the executor itself errors
/// - anything else: prints `ran <command>`, exits 0
#[derive(Default)]
pub struct ScriptedExecutor {
    runs: Mutex<HashMap<String, usize>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn runs(&self, command: &str) -> usize {
        self.runs
            .lock()
            .unwrap()
            .get(command)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of commands that were running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn run(&self, request: ExecRequest, output: OutputSink) -> Result<ExecOutcome> {
        let previous = {
            let mut runs = self.runs.lock().unwrap();
            let count = runs.entry(request.command.clone()).or_insert(0);
            *count += 1;
            *count - 1
        };
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _active = ActiveGuard(&self.active);

        match request.command.as_str() {
            "fail" => {
                let _ = output.send("failing\n".to_string()).await;
                Ok(ExecOutcome { exit_code: Some(1) })
            }
            "flaky" if previous == 0 => {
                let _ = output.send("flaky failure\n".to_string()).await;
                Ok(ExecOutcome { exit_code: Some(1) })
            }
            "hang" => {
                let _ = output.send("started\n".to_string()).await;
                std::future::pending().await
            }
            "slow" => {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let _ = output.send("ran slow\n".to_string()).await;
                Ok(ExecOutcome { exit_code: Some(0) })
            }
            "error" => Err(Error::Execution("executor unavailable".to_string())),
            command => {
                let _ = output.send(format!("ran {}\n", command)).await;
                Ok(ExecOutcome { exit_code: Some(0) })
            }
        }
    }
}

/// Records workspaces instead of cloning anything. Fails for URLs ending in
/// `broken.git`.
#[derive(Default)]
pub struct RecordingMaterializer {
    pub workspaces: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl Materializer for RecordingMaterializer {
    async fn materialize(&self, source: &SourceSpec, workspace: &Path) -> Result<()> {
        if source.url.ends_with("broken.git") {
            return Err(Error::Execution(format!("could not clone {}", source.url)));
        }
        self.workspaces.lock().unwrap().push(workspace.to_path_buf());
        Ok(())
    }
}
