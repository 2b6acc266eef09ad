// keg-aio/src/process.rs
use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use keg_common::error::{KegError, Result};
use tracing::{debug, error, trace};

/// Exit status plus the last lines of stdout and stderr, merged in arrival
/// order.
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub status: ExitStatus,
    /// At most the `keep_lines` most recent lines.
    pub lines: Vec<String>,
    /// Lines seen in total, including those no longer retained.
    pub total_lines: usize,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    /// Retained output joined into one block.
    pub fn tail(&self) -> String {
        self.lines.join("\n")
    }
}

/// Bounded ring of the most recent output lines.
#[derive(Debug)]
struct TailBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    seen: usize,
}

impl TailBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            seen: 0,
        }
    }

    fn push(&mut self, line: String) {
        self.seen += 1;
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }
}

fn pump<R: Read + Send + 'static>(
    reader: R,
    sink: Arc<Mutex<TailBuffer>>,
    label: &'static str,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    trace!("[{}] {}", label, line);
                    sink.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(line);
                }
            }
        }
    })
}

/// Runs `program` to completion, keeping the last `keep_lines` lines of its
/// combined output. A non-zero exit is not an error here; callers inspect
/// [`CapturedOutput::status`].
pub fn run_command_captured(
    program: &str,
    args: &[String],
    cwd: &Path,
    envs: &HashMap<String, String>,
    keep_lines: usize,
) -> Result<CapturedOutput> {
    debug!(
        "Running command: {} {:?} (cwd: {}, envs: {:?})",
        program,
        args,
        cwd.display(),
        envs.keys().collect::<Vec<_>>()
    );
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .envs(envs)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| {
        error!("Failed to execute '{}': {}", program, e);
        KegError::CommandExecError(format!("failed to start '{program}': {e}"))
    })?;

    let buffer = Arc::new(Mutex::new(TailBuffer::new(keep_lines)));
    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(pump(stdout, Arc::clone(&buffer), "stdout"));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(pump(stderr, Arc::clone(&buffer), "stderr"));
    }
    let status = child.wait().map_err(|e| KegError::Io(Arc::new(e)))?;
    for handle in pumps {
        let _ = handle.join();
    }
    let mut buffer = buffer.lock().unwrap_or_else(PoisonError::into_inner);
    let total_lines = buffer.seen;
    let lines: Vec<String> = std::mem::take(&mut buffer.lines).into();

    if status.success() {
        debug!("Command '{}' finished successfully.", program);
    } else {
        debug!("Command '{}' failed with status: {} ({} lines of output)", program, status, total_lines);
    }
    Ok(CapturedOutput {
        status,
        lines,
        total_lines,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str, keep_lines: usize) -> CapturedOutput {
        let dir = tempfile::tempdir().unwrap();
        run_command_captured(
            "sh",
            &["-c".to_string(), script.to_string()],
            dir.path(),
            &HashMap::new(),
            keep_lines,
        )
        .unwrap()
    }

    #[test]
    fn captures_stdout_and_stderr() {
        let out = sh("echo checking for gcc... yes; echo 'configure: error: no librabbitmq' >&2; exit 1", 40);
        assert!(!out.success());
        assert_eq!(out.exit_code(), Some(1));
        assert!(out.lines.iter().any(|l| l.contains("checking for gcc")));
        assert_eq!(out.total_lines, 2);
        assert!(out.tail().contains("configure: error: no librabbitmq"));
    }

    #[test]
    fn only_the_last_lines_are_retained() {
        let out = sh("for i in $(seq 1 100); do echo line$i; done", 40);
        assert!(out.success());
        assert_eq!(out.lines.len(), 40);
        assert_eq!(out.total_lines, 100);
        let tail = out.tail();
        assert!(tail.starts_with("line61\n"));
        assert!(tail.ends_with("line100"));
    }

    #[test]
    fn noisy_builds_stay_bounded() {
        // 50k lines of compiler chatter followed by the real error.
        let out = sh(
            "i=0; while [ $i -lt 50000 ]; do echo \"cc -c src/file$i.c\"; i=$((i+1)); done; \
             echo 'ld: symbol not found'; exit 2",
            3,
        );
        assert_eq!(out.exit_code(), Some(2));
        assert_eq!(out.total_lines, 50_001);
        assert_eq!(out.lines.len(), 3);
        assert_eq!(out.lines[2], "ld: symbol not found");
    }

    #[test]
    fn zero_capacity_counts_without_keeping() {
        let out = sh("echo a; echo b", 0);
        assert!(out.lines.is_empty());
        assert_eq!(out.total_lines, 2);
        assert_eq!(out.tail(), "");
    }

    #[test]
    fn passes_environment_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let mut envs = HashMap::new();
        envs.insert("KEG_TEST_VALUE".to_string(), "42".to_string());
        let out = run_command_captured(
            "sh",
            &["-c".to_string(), "echo $KEG_TEST_VALUE; pwd".to_string()],
            dir.path(),
            &envs,
            40,
        )
        .unwrap();
        assert_eq!(out.lines[0], "42");
        assert!(out.lines[1].ends_with(dir.path().file_name().unwrap().to_str().unwrap()));
    }

    #[test]
    fn missing_program_is_an_exec_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_command_captured("keg-no-such-tool", &[], dir.path(), &HashMap::new(), 40)
            .unwrap_err();
        assert!(matches!(err, KegError::CommandExecError(_)));
    }
}
