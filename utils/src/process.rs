//! OS process probes: liveness, process table, CPU usage, termination.
//!
//! Signals go through `libc`; the process table and CPU accounting come
//! from `sysinfo`, which covers Linux and macOS alike. Everything here is
//! best-effort: a process that vanishes mid-scan is simply left out.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

/// Capability to ask whether a pid still refers to a running process.
pub trait ProcessLiveness: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Liveness backed by the operating system.
///
/// Unix uses a signal-0 existence test; on Linux zombies count as dead.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsLiveness;

impl ProcessLiveness for OsLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        #[cfg(unix)]
        {
            let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
            if rc != 0 {
                // EPERM means the pid exists but belongs to someone else.
                return std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
            }
            #[cfg(target_os = "linux")]
            if read_linux_state(pid) == Some('Z') {
                return false;
            }
            true
        }
        #[cfg(not(unix))]
        {
            // No cheap probe; assume alive so nothing is reaped by mistake.
            true
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    NotRunning,
    Killed,
}

/// Ask a process to exit (SIGTERM).
pub fn terminate(pid: u32) -> std::io::Result<KillOutcome> {
    #[cfg(unix)]
    {
        send_signal(pid, libc::SIGTERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        Ok(KillOutcome::NotRunning)
    }
}

/// Kill a process outright (SIGKILL).
pub fn force_kill(pid: u32) -> std::io::Result<KillOutcome> {
    #[cfg(unix)]
    {
        send_signal(pid, libc::SIGKILL)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        Ok(KillOutcome::NotRunning)
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> std::io::Result<KillOutcome> {
    if pid == 0 {
        return Ok(KillOutcome::NotRunning);
    }
    unsafe {
        if libc::kill(pid as libc::pid_t, signal) == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(KillOutcome::NotRunning);
            }
            return Err(err);
        }
    }
    Ok(KillOutcome::Killed)
}

/// Put a spawned daemon in its own session so it outlives the caller's
/// terminal and process group.
#[cfg(unix)]
pub fn detach_session(cmd: &mut tokio::process::Command) {
    use std::os::unix::process::CommandExt;
    unsafe {
        cmd.as_std_mut().pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

/// Linux-only: the analyzer dies with its supervising daemon, even on
/// SIGKILL, so a crashed daemon never leaves analyzers holding workspace
/// locks.
#[cfg(unix)]
pub fn die_with_parent(cmd: &mut tokio::process::Command) {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.as_std_mut().pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = cmd;
    }
}

/// A process-table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    pub cmdline: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl ProcessInfo {
    fn from_process(process: &Process) -> Self {
        Self {
            pid: process.pid().as_u32(),
            ppid: process.parent().map_or(0, Pid::as_u32),
            cmdline: process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect(),
            cwd: process.cwd().map(Path::to_path_buf),
        }
    }

    /// Whether any argv element contains `signature`.
    #[must_use]
    pub fn matches_signature(&self, signature: &str) -> bool {
        !signature.is_empty() && self.cmdline.iter().any(|arg| arg.contains(signature))
    }

    /// File name of `argv[0]`.
    #[must_use]
    pub fn executable_name(&self) -> Option<&str> {
        Path::new(self.cmdline.first()?).file_name()?.to_str()
    }

    /// Whether this process is an instance of the executable `name`.
    #[must_use]
    pub fn runs_executable(&self, name: &str) -> bool {
        self.executable_name() == Some(name)
    }
}

fn table_of(system: &System) -> Vec<ProcessInfo> {
    system
        .processes()
        .values()
        .filter(|process| process.thread_kind().is_none())
        .map(ProcessInfo::from_process)
        .collect()
}

/// Snapshot of the process table.
#[must_use]
pub fn list_processes() -> Vec<ProcessInfo> {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing()
            .with_cmd(UpdateKind::Always)
            .with_cwd(UpdateKind::Always),
    );
    table_of(&system)
}

/// Orphaned analyzer processes for one workspace: the command line
/// contains `signature`, the working directory is `cwd`, and the parent is
/// either gone (reparented to init) or another instance of the executable
/// `owner` (a daemon that lost its registry row). Children of the calling
/// process are never included.
///
/// Used to clear analyzers left behind by a previous daemon for the same
/// workspace before starting a fresh one there.
#[must_use]
pub fn find_analyzer_processes(signature: &str, cwd: &Path, owner: &str) -> Vec<ProcessInfo> {
    select_orphans(&list_processes(), std::process::id(), signature, cwd, owner)
}

fn select_orphans(
    table: &[ProcessInfo],
    own: u32,
    signature: &str,
    cwd: &Path,
    owner: &str,
) -> Vec<ProcessInfo> {
    let parent_of = |p: &ProcessInfo| table.iter().find(|q| q.pid == p.ppid);
    table
        .iter()
        .filter(|p| p.pid != own && p.ppid != own)
        .filter(|p| p.matches_signature(signature))
        .filter(|p| p.cwd.as_deref() == Some(cwd))
        .filter(|p| p.ppid <= 1 || parent_of(p).is_none_or(|parent| parent.runs_executable(owner)))
        .cloned()
        .collect()
}

/// One CPU measurement for one process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuSample {
    pub pid: u32,
    /// Percent of one core since the previous sample.
    pub cpu_percent: f64,
}

/// Source of periodic CPU measurements.
pub trait CpuSampler: Send {
    fn sample(&mut self) -> Vec<CpuSample>;
}

/// Samples every descendant of a parent process.
///
/// The first observation of a pid only seeds the baseline; it yields a
/// sample from the second call on.
pub struct ChildCpuSampler {
    parent: u32,
    system: System,
    seen: HashSet<u32>,
}

impl ChildCpuSampler {
    #[must_use]
    pub fn new(parent: u32) -> Self {
        Self {
            parent,
            system: System::new(),
            seen: HashSet::new(),
        }
    }

    /// Descendants of this process.
    #[must_use]
    pub fn for_current_process() -> Self {
        Self::new(std::process::id())
    }
}

impl CpuSampler for ChildCpuSampler {
    fn sample(&mut self) -> Vec<CpuSample> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cpu(),
        );
        let descendants = descendants_of(self.parent, &table_of(&self.system));
        let mut samples = Vec::new();
        for &pid in &descendants {
            if !self.seen.contains(&pid) {
                continue;
            }
            if let Some(process) = self.system.process(Pid::from_u32(pid)) {
                samples.push(CpuSample {
                    pid,
                    cpu_percent: f64::from(process.cpu_usage()),
                });
            }
        }
        self.seen = descendants.into_iter().collect();
        samples
    }
}

/// Pids whose ancestry reaches `root` (excluding `root`).
#[must_use]
pub fn descendants_of(root: u32, table: &[ProcessInfo]) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for p in table {
        children.entry(p.ppid).or_default().push(p.pid);
    }
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(pid) = stack.pop() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if kid != root && !out.contains(&kid) {
                    out.push(kid);
                    stack.push(kid);
                }
            }
        }
    }
    out
}

/// Scheduler state letter from `/proc/<pid>/stat` (`Z` for zombies).
#[cfg(target_os = "linux")]
fn read_linux_state(pid: u32) -> Option<char> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_linux_state(&stat)
}

#[cfg(target_os = "linux")]
fn parse_linux_state(proc_stat: &str) -> Option<char> {
    // pid (comm) state ...; comm may contain spaces and parentheses.
    let close_paren = proc_stat.rfind(')')?;
    proc_stat.get(close_paren + 1..)?.trim_start().chars().next()
}
