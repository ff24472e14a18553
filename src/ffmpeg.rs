//! Shared plumbing for the `ffmpeg` child processes used for capture and encoding.

use std::{
    collections::VecDeque,
    ffi::OsStr,
    io::{self, BufRead, BufReader},
    process::{Child, ChildStderr, Command, Stdio},
    sync::{Arc, Mutex, PoisonError},
    thread,
};

const TAIL_LINES: usize = 20;

pub fn prefix() -> Vec<String> {
    zq(&["-hide_banner", "-nostdin", "-loglevel", "error"])
}

pub fn zq(x: &[&str]) -> Vec<String> {
    x.iter().map(|x| String::from(*x)).collect()
}

/// Last lines ffmpeg wrote to stderr, kept so failures can be reported with its own diagnosis.
#[derive(Clone, Default)]
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl StderrTail {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn summary(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.is_empty() {
            "no output".to_string()
        } else {
            lines.iter().cloned().collect::<Vec<_>>().join("; ")
        }
    }
}

/// Spawns ffmpeg with piped stdio. Stderr is drained on a helper thread so the child can never
/// block on a full pipe.
pub fn spawn<I, S>(program: &str, args: I, piped_stdin: bool) -> io::Result<(Child, StderrTail)>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut child = Command::new(program)
        .args(args)
        .stdin(if piped_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(if piped_stdin {
            Stdio::null()
        } else {
            Stdio::piped()
        })
        .stderr(Stdio::piped())
        .spawn()?;
    let tail = StderrTail::default();
    if let Some(stderr) = child.stderr.take() {
        drain(stderr, tail.clone());
    }
    Ok((child, tail))
}

fn drain(stderr: ChildStderr, tail: StderrTail) {
    thread::spawn(move || {
        for line in BufReader::new(stderr).lines().map_while(Result::ok) {
            tracing::debug!(line = %line, "ffmpeg");
            tail.push(line);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_most_recent_lines() {
        let tail = StderrTail::default();
        assert_eq!(tail.summary(), "no output");
        for n in 0..(TAIL_LINES + 5) {
            tail.push(format!("line {n}"));
        }
        let summary = tail.summary();
        assert!(summary.starts_with("line 5;"));
        assert!(summary.ends_with(&format!("line {}", TAIL_LINES + 4)));
    }

    #[test]
    fn spawning_missing_program_fails() {
        assert!(spawn("/nonexistent/ffmpeg", ["-version"], false).is_err());
    }
}
