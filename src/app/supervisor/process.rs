use std::io::{BufRead, BufReader, Read};
use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::app::models::OutputStream;
use crate::app::scheduler::relock;
use crate::app::supervisor::pipeline::OutputPipeline;

const POLL_STEP: Duration = Duration::from_millis(50);

/// How a session process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn summary(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("process exited with code {code}"),
            (None, Some(signal)) => format!("process terminated by signal {signal}"),
            (None, None) => "process exited without a status".to_string(),
        }
    }
}

/// A running session process with its output reader threads.
pub struct SessionProcess {
    child: Arc<Mutex<Child>>,
    pid: u32,
    readers: Mutex<Vec<JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    stop_requested: AtomicBool,
    finalizing: AtomicBool,
    finalized: AtomicBool,
    exit: Mutex<Option<ExitInfo>>,
}

impl SessionProcess {
    /// Takes over `child` and starts one reader thread per output pipe.
    pub fn attach(mut child: Child, pipeline: Arc<OutputPipeline>) -> Self {
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, OutputStream::Stdout, Arc::clone(&pipeline)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, OutputStream::Stderr, pipeline));
        }
        let pid = child.id();
        Self {
            child: Arc::new(Mutex::new(child)),
            pid,
            readers: Mutex::new(readers.into_iter().flatten().collect()),
            watcher: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            finalizing: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            exit: Mutex::new(None),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn set_watcher(&self, handle: JoinHandle<()>) {
        *relock(&self.watcher) = Some(handle);
    }

    pub fn take_watcher(&self) -> Option<JoinHandle<()>> {
        relock(&self.watcher).take()
    }

    pub fn watcher_alive(&self) -> bool {
        relock(&self.watcher)
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Non-blocking exit check. The first observed status is cached.
    pub fn try_exit(&self) -> Option<ExitInfo> {
        let mut exit = relock(&self.exit);
        if exit.is_some() {
            return *exit;
        }
        match relock(&self.child).try_wait() {
            Ok(Some(status)) => {
                *exit = Some(ExitInfo::from_status(status));
                *exit
            }
            Ok(None) => None,
            Err(err) => {
                warn!(pid = self.pid, error = %err, "failed to poll session process");
                None
            }
        }
    }

    /// Marks the stop as user-initiated. Returns false if already marked.
    pub fn request_stop(&self) -> bool {
        !self.stop_requested.swap(true, Ordering::SeqCst)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Exactly one caller wins the right to finalize the session.
    pub fn claim_finalization(&self) -> bool {
        self.finalizing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_finalizing(&self) -> bool {
        self.finalizing.load(Ordering::SeqCst)
    }

    pub fn mark_finalized(&self) {
        self.finalized.store(true, Ordering::SeqCst);
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    /// Waits for whoever claimed finalization to finish it.
    pub fn wait_finalized(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while !self.is_finalized() {
            if start.elapsed() >= timeout {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }

    /// SIGTERM (unix), then a forced kill once `grace` runs out.
    pub fn terminate(&self, grace: Duration) -> Option<ExitInfo> {
        if let Some(exit) = self.try_exit() {
            return Some(exit);
        }
        self.send_terminate();
        let start = Instant::now();
        while start.elapsed() < grace {
            if let Some(exit) = self.try_exit() {
                return Some(exit);
            }
            thread::sleep(POLL_STEP);
        }

        warn!(pid = self.pid, "session process ignored graceful stop; killing");
        {
            let mut child = relock(&self.child);
            let _ = child.kill();
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Some(exit) = self.try_exit() {
                return Some(exit);
            }
            thread::sleep(POLL_STEP);
        }
        None
    }

    /// Joins reader threads that finish within `timeout`. A reader stuck on a
    /// pipe still held open by a grandchild is left detached.
    pub fn join_readers(&self, timeout: Duration) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *relock(&self.readers));
        let start = Instant::now();
        while handles.iter().any(|handle| !handle.is_finished()) && start.elapsed() < timeout {
            thread::sleep(Duration::from_millis(10));
        }
        for handle in handles {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                debug!(pid = self.pid, "output reader still blocked; detaching");
            }
        }
    }

    fn send_terminate(&self) {
        if !send_sigterm(self.pid) {
            let _ = relock(&self.child).kill();
        }
    }
}

/// Delivers SIGTERM to `pid`. Returns false where no graceful signal exists
/// and the caller has to kill outright.
#[cfg(unix)]
pub fn send_sigterm(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        debug!(pid, error = %err, "SIGTERM delivery failed");
    }
    true
}

#[cfg(not(unix))]
pub fn send_sigterm(_pid: u32) -> bool {
    false
}

fn spawn_reader<R>(pipe: R, stream: OutputStream, pipeline: Arc<OutputPipeline>) -> Option<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    let name = match stream {
        OutputStream::Stdout => "session-stdout",
        OutputStream::Stderr => "session-stderr",
    };
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let mut reader = BufReader::new(pipe);
            let mut buffer = Vec::with_capacity(1024);
            loop {
                buffer.clear();
                match reader.read_until(b'\n', &mut buffer) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buffer)
                            .trim_end_matches(['\r', '\n'])
                            .to_string();
                        pipeline.push_line(stream, line);
                    }
                    Err(err) => {
                        debug!(error = %err, "session output pipe closed with error");
                        break;
                    }
                }
            }
        })
        .map_err(|err| warn!(error = %err, "failed to spawn output reader"))
        .ok()
}
