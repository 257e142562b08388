use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::error::{SupervisorError, SupervisorResult};
use super::scripts::{ScriptLocator, ScriptRef};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Everything needed to start one child process.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            timeout: None,
            env: Vec::new(),
        }
    }

    /// Python scripts run through the interpreter in unbuffered mode so
    /// progress lines arrive as they are printed; anything else runs directly.
    pub fn for_script(script: &ScriptRef, interpreter: &str) -> Self {
        let is_python = script
            .path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("py"))
            .unwrap_or(false);
        if is_python {
            LaunchSpec::new(interpreter)
                .arg("-u")
                .arg(script.path.to_string_lossy())
        } else {
            LaunchSpec::new(&script.path)
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn display_name(&self) -> String {
        self.program.display().to_string()
    }

    pub fn command_line(&self) -> String {
        let mut line = self.display_name();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }

    fn spawn(&self) -> SupervisorResult<Child> {
        debug!(command = %self.command_line(), "spawning child process");
        self.command()
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: self.display_name(),
                source,
            })
    }
}

/// Outcome of a child process that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn summary(&self) -> String {
        match self.code {
            Some(code) => format!("Process exited with code {code}."),
            None => "Process terminated by signal.".to_string(),
        }
    }

    pub fn diagnosis(&self) -> Option<&'static str> {
        exit_diagnosis(self.code)
    }
}

/// Common causes shown when a wrapped job exits with status 1.
pub fn exit_diagnosis(code: Option<i32>) -> Option<&'static str> {
    match code {
        Some(1) => Some(
            "Common causes:\n\
             1. Data file missing required columns (open, high, low, close, vol)\n\
             2. Data file is empty or corrupted\n\
             3. Invalid feature names specified\n\
             4. Insufficient data for training",
        ),
        _ => None,
    }
}

/// Runs `spec` to completion, capturing both output streams.
///
/// When `spec.timeout` elapses the child is killed and reaped before
/// [`SupervisorError::Timeout`] is returned; no partial output is reported.
pub fn run_sync(spec: &LaunchSpec) -> SupervisorResult<ExitReport> {
    let mut child = spec.spawn()?;
    let stdout_pump = child.stdout.take().map(|out| thread::spawn(move || read_all(out)));
    let stderr_pump = child.stderr.take().map(|err| thread::spawn(move || read_all(err)));

    let waited = match spec.timeout {
        Some(timeout) => wait_with_deadline(&mut child, timeout),
        None => child.wait().map(Some),
    };
    let status = match settle_wait(&mut child, waited) {
        Ok(status) => status,
        Err(error) => {
            warn!(program = %spec.display_name(), %error, "waiting for child failed, killed it");
            return Err(error.into());
        }
    };

    let Some(status) = status else {
        // Pumps are left detached: a grandchild may still hold the pipes open.
        drop(stdout_pump);
        drop(stderr_pump);
        let timeout = spec.timeout.unwrap_or_default();
        warn!(program = %spec.display_name(), ?timeout, "child timed out and was killed");
        return Err(SupervisorError::Timeout {
            program: spec.display_name(),
            timeout,
        });
    };

    let stdout = stdout_pump
        .and_then(|pump| pump.join().ok())
        .unwrap_or_default();
    let stderr = stderr_pump
        .and_then(|pump| pump.join().ok())
        .unwrap_or_default();

    let report = ExitReport {
        code: status.code(),
        stdout,
        stderr,
    };
    if report.success() {
        info!(program = %spec.display_name(), "child finished successfully");
    } else {
        warn!(program = %spec.display_name(), code = ?report.code, "child failed");
    }
    Ok(report)
}

/// Passes an exit status through. On timeout (`Ok(None)`) or a failed wait
/// the child is killed and reaped first.
fn settle_wait(
    child: &mut Child,
    waited: io::Result<Option<ExitStatus>>,
) -> io::Result<Option<ExitStatus>> {
    if !matches!(waited, Ok(Some(_))) {
        let _ = child.kill();
        let _ = child.wait();
    }
    waited
}

fn wait_with_deadline(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(WAIT_POLL_INTERVAL);
    }
}

fn read_all(mut source: impl Read) -> String {
    let mut buf = Vec::new();
    let _ = source.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

/// One line of child output, tagged with the stream it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

impl OutputLine {
    pub fn text(&self) -> &str {
        match self {
            OutputLine::Stdout(text) | OutputLine::Stderr(text) => text,
        }
    }

    /// Log-view rendering: stderr lines carry a `! ` marker.
    pub fn display(&self) -> String {
        match self {
            OutputLine::Stdout(text) => text.clone(),
            OutputLine::Stderr(text) => format!("! {text}"),
        }
    }
}

/// Releases the single streaming slot once every handle to the run is gone.
#[derive(Debug)]
struct StreamSlot(Arc<AtomicBool>);

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Cloneable control surface for a streaming child.
#[derive(Debug, Clone)]
pub struct ProcessController {
    child: Arc<Mutex<Child>>,
    pid: u32,
    _slot: Arc<StreamSlot>,
}

impl ProcessController {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking exit check. `Ok(None)` while still running.
    pub fn try_status(&self) -> SupervisorResult<Option<ExitStatus>> {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(child.try_wait()?)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.try_status(), Ok(Some(_)) | Err(_))
    }

    /// Asks the child to stop the way Ctrl+C would.
    pub fn interrupt(&self) -> SupervisorResult<()> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            info!(pid = self.pid, "sending SIGINT to streaming child");
            kill(Pid::from_raw(self.pid as i32), Signal::SIGINT)
                .map_err(|errno| SupervisorError::Io(std::io::Error::from(errno)))
        }
        #[cfg(not(unix))]
        {
            self.kill()
        }
    }

    /// Forcibly terminates the child. Killing an exited child is a no-op.
    pub fn kill(&self) -> SupervisorResult<()> {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        info!(pid = self.pid, "killing streaming child");
        child.kill()?;
        Ok(())
    }

    /// Polls until the child exits. Only call this from the reader thread.
    pub fn wait(&self) -> SupervisorResult<Option<i32>> {
        loop {
            if let Some(status) = self.try_status()? {
                return Ok(status.code());
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }
    }
}

/// A running streaming child: its merged output plus its controller.
#[derive(Debug)]
pub struct ProcessHandle {
    lines: Receiver<OutputLine>,
    controller: ProcessController,
}

impl ProcessHandle {
    /// Blocks until the next output line is available. Returns `None` once
    /// both output streams are closed.
    pub fn read_line(&self) -> Option<OutputLine> {
        self.lines.recv().ok()
    }

    pub fn try_status(&self) -> SupervisorResult<Option<ExitStatus>> {
        self.controller.try_status()
    }

    pub fn controller(&self) -> ProcessController {
        self.controller.clone()
    }

    pub fn pid(&self) -> u32 {
        self.controller.pid
    }
}

/// Launches child processes and enforces the one-active-stream rule.
#[derive(Debug, Default)]
pub struct ProcessLauncher {
    active: Arc<AtomicBool>,
    working_dir: OnceLock<PathBuf>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_sync(&self, spec: &LaunchSpec) -> SupervisorResult<ExitReport> {
        run_sync(spec)
    }

    /// Starts `spec` and returns immediately. Fails with
    /// [`SupervisorError::Busy`] while a previous handle is still alive.
    pub fn run_streaming(&self, spec: &LaunchSpec) -> SupervisorResult<ProcessHandle> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SupervisorError::Busy);
        }
        let slot = Arc::new(StreamSlot(Arc::clone(&self.active)));

        let mut child = spec.spawn()?;
        let pid = child.id();
        let (tx, rx) = mpsc::channel();

        if let Some(stdout) = child.stdout.take() {
            pump_lines(stdout, tx.clone(), OutputLine::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            pump_lines(stderr, tx, OutputLine::Stderr);
        }

        info!(pid, command = %spec.command_line(), "started streaming child");
        Ok(ProcessHandle {
            lines: rx,
            controller: ProcessController {
                child: Arc::new(Mutex::new(child)),
                pid,
                _slot: slot,
            },
        })
    }

    pub fn is_busy(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Directory every job runs from: the folder holding `sentinel`, or the
    /// current directory when it cannot be found. Resolved once.
    pub fn working_dir(&self, locator: &ScriptLocator, sentinel: &str) -> &Path {
        self.working_dir.get_or_init(|| {
            let dir = match locator.resolve(sentinel) {
                Ok(script) => script.working_dir,
                Err(_) => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            };
            info!(dir = %dir.display(), "job working directory");
            dir
        })
    }
}

fn pump_lines<R, F>(source: R, tx: Sender<OutputLine>, wrap: F)
where
    R: Read + Send + 'static,
    F: Fn(String) -> OutputLine + Send + 'static,
{
    thread::spawn(move || {
        let reader = BufReader::new(source);
        for line in reader.lines().map_while(Result::ok) {
            if tx.send(wrap(line)).is_err() {
                break;
            }
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::new("/bin/sh").arg("-c").arg(script)
    }

    #[test]
    fn run_sync_captures_both_streams() {
        let report = run_sync(&sh("echo out; echo err 1>&2; exit 3")).unwrap();
        assert_eq!(report.code, Some(3));
        assert_eq!(report.stdout, "out\n");
        assert_eq!(report.stderr, "err\n");
        assert!(!report.success());
    }

    #[test]
    fn run_sync_honours_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let report = run_sync(&sh("pwd").working_dir(dir.path())).unwrap();
        let printed = PathBuf::from(report.stdout.trim());
        assert_eq!(
            printed.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn run_sync_reports_spawn_failure() {
        let err = run_sync(&LaunchSpec::new("/definitely/not/a/program")).unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
    }

    #[test]
    fn for_script_wraps_python_in_interpreter() {
        let script = ScriptRef {
            name: "stock_net.py".into(),
            path: PathBuf::from("/opt/jobs/stock_net.py"),
            working_dir: PathBuf::from("/opt/jobs"),
        };
        let spec = LaunchSpec::for_script(&script, "python3").arg("--batch_size");
        assert_eq!(spec.program, PathBuf::from("python3"));
        assert_eq!(spec.args, vec!["-u", "/opt/jobs/stock_net.py", "--batch_size"]);

        let native = ScriptRef {
            name: "visualize".into(),
            path: PathBuf::from("/opt/jobs/visualize"),
            working_dir: PathBuf::from("/opt/jobs"),
        };
        let spec = LaunchSpec::for_script(&native, "python3");
        assert_eq!(spec.program, PathBuf::from("/opt/jobs/visualize"));
        assert!(spec.args.is_empty());
    }

    #[test]
    fn diagnosis_only_for_exit_code_one() {
        assert!(exit_diagnosis(Some(1)).unwrap().contains("missing required columns"));
        assert!(exit_diagnosis(Some(2)).is_none());
        assert!(exit_diagnosis(None).is_none());
    }

    #[test]
    fn stream_slot_is_released_when_handle_drops() {
        let launcher = ProcessLauncher::new();
        let handle = launcher.run_streaming(&sh("echo hi")).unwrap();
        assert!(launcher.is_busy());
        assert_eq!(handle.read_line(), Some(OutputLine::Stdout("hi".into())));
        assert_eq!(handle.controller().wait().unwrap(), Some(0));
        drop(handle);
        assert!(!launcher.is_busy());
    }

    #[test]
    fn failed_spawn_does_not_hold_the_slot() {
        let launcher = ProcessLauncher::new();
        assert!(launcher
            .run_streaming(&LaunchSpec::new("/definitely/not/a/program"))
            .is_err());
        assert!(!launcher.is_busy());
    }

    #[test]
    fn kill_stops_a_streaming_child() {
        let launcher = ProcessLauncher::new();
        let handle = launcher.run_streaming(&sh("exec sleep 30")).unwrap();
        let controller = handle.controller();
        controller.kill().unwrap();
        assert_eq!(controller.wait().unwrap(), None);
        assert!(handle.read_line().is_none());
    }

    #[test]
    fn failed_wait_kills_and_reaps_the_child() {
        use std::os::unix::process::ExitStatusExt;

        let mut child = sh("exec sleep 30").spawn().unwrap();
        let waited = Err(io::Error::new(io::ErrorKind::Other, "wait failed"));
        assert!(settle_wait(&mut child, waited).is_err());
        let status = child.try_wait().unwrap().expect("child should be reaped");
        assert_eq!(status.signal(), Some(nix::libc::SIGKILL));
    }
}
