// SPDX-License-Identifier: Apache-2.0

//! Collaborators backed by external programs.
//!
//! Every call starts the program afresh, writes one JSON request to its
//! stdin, closes stdin, and parses one JSON response from its stdout. A
//! non-zero exit status or an unparseable response fails the call.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;
use pathweave::{
    CancelToken, CollaboratorError, GenerationOutcome, PathResolver, PathTarget, Resolution,
    TestCase, TestGenerator,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::driver_config::CollaboratorCommand;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct ProcessCollaborator {
    name: &'static str,
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessCollaborator {
    /// Resolves `command.program` on `PATH` (or as a path) up front so a
    /// missing tool is reported before the search starts.
    pub fn locate(name: &'static str, command: &CollaboratorCommand) -> anyhow::Result<Self> {
        let program = which::which(&command.program)
            .with_context(|| format!("{} program `{}` not found", name, command.program))?;
        log::info!("{}: using {}", name, program.display());
        Ok(ProcessCollaborator {
            name,
            program,
            args: command.args.clone(),
        })
    }

    fn error(&self, message: impl Into<String>) -> CollaboratorError {
        CollaboratorError::new(self.name, message)
    }

    /// Runs the program once. The child is killed if `cancel` fires or it is
    /// still running after `deadline`.
    pub fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        request: &Req,
        deadline: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<Resp, CollaboratorError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| self.error(format!("cannot encode request: {}", e)))?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        log::debug!("{}: running {:?}", self.name, command);
        let mut child = command
            .spawn()
            .map_err(|e| self.error(format!("cannot start {}: {}", self.program.display(), e)))?;

        // All three pipes are serviced off this thread so that neither side
        // can wedge on a full pipe while we poll for exit.
        let writer = child.stdin.take().map(|mut stdin| {
            std::thread::spawn(move || {
                // A child that exits without reading is judged by its exit
                // status, not by the broken pipe.
                let _ = stdin.write_all(&payload);
            })
        });
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => return Err(self.error(format!("cannot wait for child: {}", e))),
            }
            let overdue = deadline.filter(|d| started.elapsed() > *d);
            if cancel.is_cancelled() || overdue.is_some() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(match overdue {
                    Some(d) => self.error(format!("no response within {:?}; killed", d)),
                    None => self.error("cancelled"),
                });
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        };
        if let Some(writer) = writer {
            let _ = writer.join();
        }
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        if !status.success() {
            return Err(self.error(format!(
                "exited with {}; stderr: {}",
                status,
                String::from_utf8_lossy(&stderr).trim()
            )));
        }
        serde_json::from_slice(&stdout)
            .map_err(|e| self.error(format!("malformed response: {}", e)))
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

#[derive(Serialize)]
struct ResolveRequest<'a> {
    test: &'a TestCase,
}

#[derive(Deserialize)]
struct ResolveResponse {
    resolutions: Vec<Resolution>,
}

/// Request: `{"test": TestCase}`. Response: `{"resolutions": [Resolution]}`.
pub struct ProcessResolver {
    process: ProcessCollaborator,
}

impl ProcessResolver {
    pub fn new(process: ProcessCollaborator) -> Self {
        ProcessResolver { process }
    }
}

impl PathResolver for ProcessResolver {
    fn resolve(
        &self,
        test: &TestCase,
        cancel: &CancelToken,
    ) -> Result<Vec<Resolution>, CollaboratorError> {
        let response: ResolveResponse = self.process.call(&ResolveRequest { test }, None, cancel)?;
        Ok(response.resolutions)
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    targets: &'a [PathTarget],
    budget_ms: u64,
}

/// Request: `{"targets": [PathTarget], "budget_ms": u64}`. Response: a
/// `GenerationOutcome`.
pub struct ProcessGenerator {
    process: ProcessCollaborator,
    grace: Duration,
}

impl ProcessGenerator {
    pub fn new(process: ProcessCollaborator, grace: Duration) -> Self {
        ProcessGenerator { process, grace }
    }
}

impl TestGenerator for ProcessGenerator {
    fn generate(
        &self,
        targets: &[PathTarget],
        budget: Duration,
        cancel: &CancelToken,
    ) -> Result<GenerationOutcome, CollaboratorError> {
        let request = GenerateRequest {
            targets,
            budget_ms: budget.as_millis() as u64,
        };
        self.process
            .call(&request, Some(budget + self.grace), cancel)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pathweave::PathCondition;
    use pretty_assertions::assert_eq;

    fn shell(name: &'static str, script: &str) -> ProcessCollaborator {
        ProcessCollaborator::locate(
            name,
            &CollaboratorCommand {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
            },
        )
        .unwrap()
    }

    #[test]
    fn missing_program_is_reported_up_front() {
        let command = CollaboratorCommand {
            program: "pathweave-no-such-program".to_string(),
            args: Vec::new(),
        };
        let err = ProcessCollaborator::locate("resolver", &command)
            .err()
            .unwrap();
        assert!(format!("{:#}", err).contains("pathweave-no-such-program"));
    }

    #[test]
    fn resolver_round_trips_json() {
        let resolver = ProcessResolver::new(shell(
            "resolver",
            r#"cat > /dev/null; echo '{"resolutions":[{"condition":["x > 0"],"feasible":true,"frontier":[["x <= 0"]]}]}'"#,
        ));
        let got = resolver
            .resolve(&TestCase::seed("s", "x=1"), &CancelToken::new())
            .unwrap();
        assert_eq!(
            got,
            vec![Resolution {
                condition: PathCondition::new(vec!["x > 0".to_string()]),
                feasible: true,
                frontier: vec![PathCondition::new(vec!["x <= 0".to_string()])],
            }]
        );
    }

    #[test]
    fn request_is_written_to_stdin() {
        // Reports whether the request reached stdin.
        let generator = ProcessGenerator::new(
            shell(
                "generator",
                r#"req=$(cat); printf '{"tests":[],"covered":["%s"]}' "$(printf %s "$req" | grep -c budget_ms)""#,
            ),
            Duration::from_secs(5),
        );
        let target = PathTarget {
            condition: PathCondition::new(vec!["y == 2".to_string()]),
            depth: 1,
        };
        let outcome = generator
            .generate(&[target], Duration::from_millis(100), &CancelToken::new())
            .unwrap();
        assert_eq!(outcome.covered, vec!["1".to_string()]);
    }

    #[test]
    fn non_zero_exit_is_an_error() {
        let resolver = ProcessResolver::new(shell("resolver", "echo boom >&2; exit 3"));
        let err = resolver
            .resolve(&TestCase::seed("s", ""), &CancelToken::new())
            .unwrap_err();
        assert_eq!(err.collaborator, "resolver");
        assert!(err.message.contains("boom"), "{}", err.message);
    }

    #[test]
    fn malformed_output_is_an_error() {
        let resolver = ProcessResolver::new(shell("resolver", "echo not-json"));
        let err = resolver
            .resolve(&TestCase::seed("s", ""), &CancelToken::new())
            .unwrap_err();
        assert!(err.message.contains("malformed"), "{}", err.message);
    }

    #[test]
    fn overdue_generator_is_killed() {
        let generator = ProcessGenerator::new(shell("generator", "sleep 10"), Duration::ZERO);
        let started = Instant::now();
        let err = generator
            .generate(&[], Duration::from_millis(50), &CancelToken::new())
            .unwrap_err();
        assert!(err.message.contains("killed"), "{}", err.message);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn cancellation_kills_the_child() {
        let resolver = ProcessResolver::new(shell("resolver", "sleep 10"));
        let cancel = CancelToken::new();
        let canceller = {
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                cancel.cancel();
            })
        };
        let err = resolver
            .resolve(&TestCase::seed("s", ""), &cancel)
            .unwrap_err();
        canceller.join().unwrap();
        assert_eq!(err.message, "cancelled");
    }
}
