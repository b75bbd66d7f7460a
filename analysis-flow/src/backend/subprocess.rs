use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use super::SubprocessStrategy;
use crate::error::{FlowError, Result};
use crate::request::AnalysisRequest;

const DIAGNOSTIC_LIMIT: usize = 4_000;

/// How to launch the external analysis engine.
#[derive(Debug, Clone)]
pub struct EngineCommand {
    pub program: PathBuf,
    /// Leading arguments, typically the engine script.
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Hard deadline after which the process is killed.
    pub timeout: Duration,
}

/// Runs `program [args..] --domain D --operation O --gene G [..]` and parses
/// standard output as a single JSON document.
pub struct EngineProcess {
    command: EngineCommand,
}

impl EngineProcess {
    pub fn new(command: EngineCommand) -> Self {
        Self { command }
    }

    fn build(&self, request: &AnalysisRequest) -> Command {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .args(request.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.command.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl SubprocessStrategy for EngineProcess {
    async fn run(&self, request: &AnalysisRequest) -> Result<Value> {
        let program = self.command.program.display().to_string();
        let mut child = self.build(request).spawn().map_err(|e| FlowError::Process {
            message: format!("failed to start {program}: {e}"),
            stderr: String::new(),
        })?;
        debug!(%program, pid = child.id(), operation = %request.operation(), "Analysis engine started");

        // Drain both pipes while waiting so a chatty engine cannot block on a full pipe.
        let mut stdout = tokio::spawn(read_all(child.stdout.take()));
        let mut stderr = tokio::spawn(read_all(child.stderr.take()));

        // One deadline for the exit and both drains: a background job the
        // engine leaves behind can hold the pipes open after it exits.
        let finished = tokio::time::timeout(self.command.timeout, async {
            let status = child.wait().await;
            let out = (&mut stdout).await.unwrap_or_default();
            let err = (&mut stderr).await.unwrap_or_default();
            (status, out, err)
        })
        .await;

        let (status, stdout, stderr) = match finished {
            Ok((Ok(status), out, err)) => (
                status,
                String::from_utf8_lossy(&out).into_owned(),
                String::from_utf8_lossy(&err).into_owned(),
            ),
            Ok((Err(e), _, _)) => {
                return Err(FlowError::Process {
                    message: format!("failed waiting for {program}: {e}"),
                    stderr: String::new(),
                });
            }
            Err(_) => {
                warn!(
                    %program,
                    operation = %request.operation(),
                    timeout_secs = self.command.timeout.as_secs_f64(),
                    "Analysis engine exceeded its deadline, killing it"
                );
                stdout.abort();
                stderr.abort();
                if let Err(e) = child.kill().await {
                    debug!(%program, error = %e, "Analysis engine had already exited");
                }
                return Err(FlowError::Timeout {
                    what: format!("analysis engine ({})", request.operation()),
                    after: self.command.timeout,
                });
            }
        };

        if !status.success() {
            return Err(FlowError::Process {
                message: format!("{program} exited with {status}"),
                stderr: clip(if stderr.trim().is_empty() { &stdout } else { &stderr }),
            });
        }

        serde_json::from_str(stdout.trim()).map_err(|e| {
            let mut raw = clip(&stdout);
            if !stderr.trim().is_empty() {
                raw.push_str("\n--- stderr ---\n");
                raw.push_str(&clip(&stderr));
            }
            FlowError::malformed(format!("analysis engine output is not JSON: {e}"), raw)
        })
    }
}

async fn read_all<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            debug!(error = %e, "Engine pipe closed early");
        }
    }
    buf
}

fn clip(text: &str) -> String {
    let text = text.trim();
    if text.len() <= DIAGNOSTIC_LIMIT {
        return text.to_string();
    }
    let mut start = text.len() - DIAGNOSTIC_LIMIT;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    // Engines print the useful part of a failure last.
    format!("...{}", &text[start..])
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::{Domain, Operation};
    use crate::request::AnalysisParams;
    use serde_json::json;
    use std::time::Instant;

    /// `sh -c SCRIPT engine --domain ..`: request flags land in `$@`.
    fn shell(script: &str, timeout: Duration) -> EngineProcess {
        EngineProcess::new(EngineCommand {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string(), "engine".to_string()],
            working_dir: None,
            timeout,
        })
    }

    fn request() -> AnalysisRequest {
        let params = AnalysisParams {
            site: Some("Y703".to_string()),
            ..Default::default()
        };
        AnalysisRequest::new(Domain::Phospho, Operation::Survival, "KIT", params).unwrap()
    }

    #[tokio::test]
    async fn parses_stdout_and_passes_flags() {
        let engine = shell(
            r#"printf '{"status":["success"],"message":["%s"]}' "$*""#,
            Duration::from_secs(10),
        );
        let payload = engine.run(&request()).await.unwrap();
        assert_eq!(
            payload,
            json!({
                "status": ["success"],
                "message": ["--domain phospho --operation survival --gene KIT --site Y703"]
            })
        );
    }

    #[tokio::test]
    async fn runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let engine = EngineProcess::new(EngineCommand {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), r#"printf '{"cwd":"%s"}' "$(pwd -P)""#.to_string()],
            working_dir: Some(dir.path().to_path_buf()),
            timeout: Duration::from_secs(10),
        });
        let payload = engine.run(&request()).await.unwrap();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(payload["cwd"], json!(expected.display().to_string()));
    }

    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let engine = shell("echo 'Error: gene not in cohort' >&2; exit 3", Duration::from_secs(10));
        match engine.run(&request()).await {
            Err(FlowError::Process { message, stderr }) => {
                assert!(message.contains("exit"));
                assert_eq!(stderr, "Error: gene not in cohort");
            }
            other => panic!("expected process error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unparsable_output_is_malformed() {
        let engine = shell("echo 'Loading required package: survival'", Duration::from_secs(10));
        match engine.run(&request()).await {
            Err(FlowError::MalformedResponse { raw, .. }) => {
                assert!(raw.contains("Loading required package"));
            }
            other => panic!("expected malformed response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deadline_kills_the_engine() {
        let engine = shell("sleep 30", Duration::from_millis(200));
        let started = Instant::now();
        let err = engine.run(&request()).await.unwrap_err();
        assert!(matches!(err, FlowError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn deadline_covers_pipes_held_by_a_background_job() {
        let engine = shell("sleep 3 & echo '{}'", Duration::from_millis(300));
        let started = Instant::now();
        let err = engine.run(&request()).await.unwrap_err();
        assert!(matches!(err, FlowError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn missing_program_is_a_process_error() {
        let engine = EngineProcess::new(EngineCommand {
            program: PathBuf::from("/nonexistent/analysis-engine"),
            args: Vec::new(),
            working_dir: None,
            timeout: Duration::from_secs(1),
        });
        assert!(matches!(
            engine.run(&request()).await,
            Err(FlowError::Process { .. })
        ));
    }
}
