//! Orchestration of a profiling run: up to two single-purpose child
//! processes (recorder and converter) joined by the sample pipe, plus the
//! profiled workload. The recorder owns the kernel fds; the converter owns
//! the process model and every sample file; nothing is shared but the pipe.

use std::ffi::OsString;
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{ForkResult, Pid};

use crate::error::{RecorderError, SetupError};
use crate::linux_shared::converter::{convert_stream, ConvertOptions};
use crate::linux_shared::event::{EventConfig, SampleFormat};
use crate::stream::{StreamReader, StreamSink};

use super::cpu_info;
use super::kallsyms;
use super::process::SuspendedLaunchedProcess;
use super::recorder::{Recorder, RecordTarget, RecorderConfig};

pub const EXIT_OK: i32 = 0;
pub const EXIT_SETUP_FAILED: i32 = 1;
pub const EXIT_APP_FAILED: i32 = 2;
pub const EXIT_RECORD_FAILED: i32 = 3;
pub const EXIT_CONVERT_FAILED: i32 = 4;
pub const EXIT_BOTH_FAILED: i32 = 5;

/// How long the converter gets to finish draining the pipe after the
/// recorder has exited, before it is told to wrap up with SIGUSR1.
const CONVERT_GRACE: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub enum ProfileTarget {
    Command {
        program: OsString,
        args: Vec<OsString>,
    },
    Pid(u32),
    SystemWide,
}

#[derive(Debug, Clone)]
pub struct ProfileSession {
    pub target: ProfileTarget,
    pub events: Vec<EventConfig>,
    pub session_dir: PathBuf,
    pub separate_cpu: bool,
    pub separate_thread: bool,
    pub callgraph: bool,
    pub lazy_conversion: bool,
    pub vmlinux: Option<PathBuf>,
}

/// Run a whole profiling session. Returns the process exit code.
pub fn run(session: ProfileSession) -> i32 {
    let sample_format = SampleFormat::for_options(session.separate_cpu, session.callgraph);

    if let Err(err) = std::fs::create_dir_all(session.session_dir.join("samples").join("current")) {
        eprintln!(
            "oxprof: could not create session directory {}: {err}",
            session.session_dir.display()
        );
        return EXIT_SETUP_FAILED;
    }

    let vmlinux = resolve_vmlinux(session.vmlinux.as_deref());

    // Launch the workload first (suspended) so its pid exists for
    // perf_event_open, but nothing of it runs before counters are armed.
    let (launched, record_target) = match &session.target {
        ProfileTarget::Command { program, args } => {
            let process = match SuspendedLaunchedProcess::launch_in_suspended_state(program, args) {
                Ok(process) => process,
                Err(err) => {
                    eprintln!("oxprof: could not launch {}: {err}", program.to_string_lossy());
                    return EXIT_SETUP_FAILED;
                }
            };
            let pid = process.pid();
            (Some(process), RecordTarget::LaunchedChild(pid))
        }
        ProfileTarget::Pid(pid) => (None, RecordTarget::ExistingPid(*pid)),
        ProfileTarget::SystemWide => (None, RecordTarget::SystemWide),
    };

    let recorder_config = RecorderConfig {
        events: session.events.clone(),
        sample_format,
        target: record_target,
        vmlinux,
    };

    let convert_options = ConvertOptions {
        session_dir: session.session_dir.clone(),
        separate_cpu: session.separate_cpu,
        separate_thread: session.separate_thread,
        callgraph: session.callgraph,
        cpu_type: cpu_info::cpu_type(),
        cpu_speed: cpu_info::cpu_speed_mhz(),
        profiled: match (&session.target, &launched) {
            (ProfileTarget::Command { program, args: _ }, Some(process)) => {
                Some((process.pid(), resolve_app_path(program)))
            }
            _ => None,
        },
    };

    if session.lazy_conversion {
        run_with_lazy_conversion(&session, recorder_config, convert_options, launched)
    } else {
        run_with_piped_conversion(&session, recorder_config, convert_options, launched)
    }
}

fn run_with_piped_conversion(
    session: &ProfileSession,
    recorder_config: RecorderConfig,
    convert_options: ConvertOptions,
    launched: Option<SuspendedLaunchedProcess>,
) -> i32 {
    let (sample_read, sample_write) = match nix::unistd::pipe() {
        Ok(fds) => fds,
        Err(err) => {
            eprintln!("oxprof: could not create the sample pipe: {err}");
            return EXIT_SETUP_FAILED;
        }
    };

    // The write end travels into the recorder child and is dropped in the
    // parent on return, so the converter sees EOF exactly when the recorder
    // exits.
    let sink = StreamSink::Pipe(Box::new(File::from(sample_write)));
    let (recorder_pid, ready_read) = match spawn_recorder(recorder_config, sink) {
        Ok(spawned) => spawned,
        Err(code) => return code,
    };

    let converter_pid = match spawn_converter(sample_read, convert_options) {
        Ok(pid) => pid,
        Err(code) => {
            let _ = kill(recorder_pid, Signal::SIGUSR1);
            let _ = waitpid(recorder_pid, None);
            return code;
        }
    };

    if !wait_for_recorder_ready(ready_read) {
        // The recorder printed its own diagnostic.
        drop(launched);
        let _ = waitpid(recorder_pid, None);
        let _ = waitpid(converter_pid, None);
        return EXIT_RECORD_FAILED;
    }

    let app_ok = supervise_workload(&session.target, launched, recorder_pid);

    let _ = kill(recorder_pid, Signal::SIGUSR1);
    let recorder_ok = wait_for_exit(recorder_pid);
    let converter_ok = wait_for_converter(converter_pid);

    reconcile_exit(app_ok, recorder_ok, converter_ok)
}

fn run_with_lazy_conversion(
    session: &ProfileSession,
    recorder_config: RecorderConfig,
    convert_options: ConvertOptions,
    launched: Option<SuspendedLaunchedProcess>,
) -> i32 {
    let data_path = session.session_dir.join("samples").join("oxprof.data");
    let data_file = match File::create(&data_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("oxprof: could not create {}: {err}", data_path.display());
            return EXIT_SETUP_FAILED;
        }
    };

    let (recorder_pid, ready_read) =
        match spawn_recorder(recorder_config, StreamSink::File(data_file)) {
            Ok(spawned) => spawned,
            Err(code) => return code,
        };

    if !wait_for_recorder_ready(ready_read) {
        drop(launched);
        let _ = waitpid(recorder_pid, None);
        return EXIT_RECORD_FAILED;
    }

    let app_ok = supervise_workload(&session.target, launched, recorder_pid);

    let _ = kill(recorder_pid, Signal::SIGUSR1);
    let recorder_ok = wait_for_exit(recorder_pid);

    // Deferred conversion happens right here in this process.
    eprintln!("Converting recorded profiling data...");
    let quit = AtomicBool::new(false);
    let converter_ok = match StreamReader::open_file(&data_path) {
        Ok(mut reader) => match convert_stream(&mut reader, convert_options, &quit) {
            Ok(stats) => {
                log::info!("conversion done; {} samples attributed", stats.samples);
                true
            }
            Err(err) => {
                eprintln!("oxprof: converting the recorded data failed: {err}");
                false
            }
        },
        Err(err) => {
            eprintln!("oxprof: could not read {}: {err}", data_path.display());
            false
        }
    };

    reconcile_exit(app_ok, recorder_ok, converter_ok)
}

/// Fork the recorder process. Returns its pid and the read end of the
/// readiness pipe (one byte arrives once counters are armed).
fn spawn_recorder(
    config: RecorderConfig,
    sink: StreamSink,
) -> Result<(Pid, OwnedFd), i32> {
    let (ready_read, ready_write) = nix::unistd::pipe().map_err(|err| {
        eprintln!("oxprof: could not create the readiness pipe: {err}");
        EXIT_SETUP_FAILED
    })?;

    match unsafe { nix::unistd::fork() } {
        Ok(ForkResult::Child) => {
            drop(ready_read);
            let code = recorder_process_body(config, sink, ready_write);
            std::process::exit(code);
        }
        Ok(ForkResult::Parent { child }) => {
            drop(ready_write);
            Ok((child, ready_read))
        }
        Err(err) => {
            eprintln!("oxprof: could not fork the recorder process: {err}");
            Err(EXIT_SETUP_FAILED)
        }
    }
}

fn recorder_process_body(config: RecorderConfig, sink: StreamSink, ready: OwnedFd) -> i32 {
    let quit = Arc::new(AtomicBool::new(false));
    if let Err(err) = signal_hook::flag::register(signal_hook::consts::SIGUSR1, quit.clone()) {
        eprintln!("oxprof: could not install the recorder signal handler: {err}");
        return EXIT_RECORD_FAILED;
    }
    // Ctrl+C reaches the whole foreground process group; the recorder must
    // survive it and wait for the orchestrator's SIGUSR1 instead.
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::new(AtomicBool::new(false)));

    let recorder = match Recorder::setup(config, sink) {
        Ok(recorder) => recorder,
        Err(err) => {
            report_setup_error(&err);
            return EXIT_RECORD_FAILED;
        }
    };

    if nix::unistd::write(&ready, &[1]).is_err() {
        return EXIT_RECORD_FAILED;
    }
    drop(ready);

    match recorder.record(&quit) {
        Ok(_) => EXIT_OK,
        Err(err) => {
            eprintln!("oxprof: recording failed: {err}");
            EXIT_RECORD_FAILED
        }
    }
}

fn report_setup_error(err: &RecorderError) {
    eprintln!("oxprof: failed to start profiling: {err}");
    if let RecorderError::Setup(SetupError::PermissionDenied(_)) = err {
        if let Some(level) = kallsyms::paranoid_level() {
            if level > 1 {
                eprintln!();
                eprintln!("'/proc/sys/kernel/perf_event_paranoid' is currently set to {level}.");
                eprintln!("In order for oxprof to work with a non-root user, this level needs");
                eprintln!("to be set to 1 or lower.");
                eprintln!("You can execute the following command and then try again:");
                eprintln!("    echo '1' | sudo tee /proc/sys/kernel/perf_event_paranoid");
            }
        }
    }
}

fn spawn_converter(sample_read: OwnedFd, options: ConvertOptions) -> Result<Pid, i32> {
    match unsafe { nix::unistd::fork() } {
        Ok(ForkResult::Child) => {
            let code = converter_process_body(sample_read, options);
            std::process::exit(code);
        }
        Ok(ForkResult::Parent { child }) => {
            drop(sample_read);
            Ok(child)
        }
        Err(err) => {
            eprintln!("oxprof: could not fork the converter process: {err}");
            Err(EXIT_SETUP_FAILED)
        }
    }
}

fn converter_process_body(sample_read: OwnedFd, options: ConvertOptions) -> i32 {
    let quit = Arc::new(AtomicBool::new(false));
    if let Err(err) = signal_hook::flag::register(signal_hook::consts::SIGUSR1, quit.clone()) {
        eprintln!("oxprof: could not install the converter signal handler: {err}");
        return EXIT_CONVERT_FAILED;
    }
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::new(AtomicBool::new(false)));

    let pipe = File::from(sample_read);
    let mut reader = match StreamReader::open_pipe(Box::new(pipe)) {
        Ok(reader) => reader,
        Err(err) => {
            eprintln!("oxprof: could not read the sample stream: {err}");
            return EXIT_CONVERT_FAILED;
        }
    };
    match convert_stream(&mut reader, options, &quit) {
        Ok(stats) => {
            log::info!("conversion done; {} samples attributed", stats.samples);
            EXIT_OK
        }
        Err(err) => {
            eprintln!("oxprof: converting the sample stream failed: {err}");
            EXIT_CONVERT_FAILED
        }
    }
}

fn wait_for_recorder_ready(ready_read: OwnedFd) -> bool {
    loop {
        let mut byte = [0u8; 1];
        match nix::unistd::read(ready_read.as_raw_fd(), &mut byte) {
            Ok(1) => return true,
            Ok(_) => return false,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => return false,
        }
    }
}

/// Run the workload (or idle until Ctrl+C) while the recorder drains rings.
/// Returns whether the workload finished successfully.
fn supervise_workload(
    target: &ProfileTarget,
    launched: Option<SuspendedLaunchedProcess>,
    recorder_pid: Pid,
) -> bool {
    let interrupted = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, interrupted.clone());

    match target {
        ProfileTarget::Command { program, .. } => {
            let process = match launched.expect("command mode launches a child").unsuspend_and_run()
            {
                Ok(process) => process,
                Err(err) => {
                    eprintln!("oxprof: could not run {}: {err}", program.to_string_lossy());
                    return false;
                }
            };
            let app_pid = Pid::from_raw(process.pid() as i32);
            let mut killed_by_us = false;
            loop {
                if !killed_by_us && interrupted.load(Ordering::Relaxed) {
                    // Ctrl+C: stop the workload hard so it produces no
                    // further samples; the recorder flushes on its own
                    // SIGUSR1 afterwards.
                    let _ = kill(app_pid, Signal::SIGKILL);
                    killed_by_us = true;
                }
                match waitpid(app_pid, Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::Exited(_, code)) => {
                        if code != 0 {
                            eprintln!("oxprof: profiled app exited with status {code}");
                        }
                        return code == 0;
                    }
                    Ok(WaitStatus::Signaled(_, signal, _)) => {
                        if killed_by_us {
                            return true;
                        }
                        eprintln!("oxprof: profiled app was killed by signal {signal}");
                        return false;
                    }
                    Ok(_) | Err(nix::errno::Errno::EINTR) => {
                        std::thread::sleep(Duration::from_millis(100));
                    }
                    Err(_) => return false,
                }
            }
        }
        ProfileTarget::Pid(pid) => {
            eprintln!("Profiling process {pid} until Ctrl+C...");
            idle_until_interrupt(&interrupted, recorder_pid);
            true
        }
        ProfileTarget::SystemWide => {
            eprintln!("Profiling all processes until Ctrl+C...");
            idle_until_interrupt(&interrupted, recorder_pid);
            true
        }
    }
}

fn idle_until_interrupt(interrupted: &AtomicBool, recorder_pid: Pid) {
    while !interrupted.load(Ordering::Relaxed) {
        // If the recorder died underneath us there is nothing to wait for.
        match waitpid(recorder_pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::EINTR) => {}
            _ => break,
        }
        std::thread::sleep(Duration::from_millis(200));
    }
}

fn wait_for_exit(pid: Pid) -> bool {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return code == EXIT_OK,
            Ok(WaitStatus::Signaled(..)) => return false,
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(nix::errno::Errno::ECHILD) => return true,
            Err(_) => return false,
        }
    }
}

/// Give the converter a bounded window to drain the pipe, then force it out
/// with SIGUSR1. It still writes out everything processed so far.
fn wait_for_converter(pid: Pid) -> bool {
    let deadline = Instant::now() + CONVERT_GRACE;
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => return code == EXIT_OK,
            Ok(WaitStatus::Signaled(..)) => return false,
            Ok(_) | Err(nix::errno::Errno::EINTR) => {}
            Err(nix::errno::Errno::ECHILD) => return true,
            Err(_) => return false,
        }
        if Instant::now() >= deadline {
            eprintln!("oxprof: conversion is taking too long; asking it to wrap up");
            let _ = kill(pid, Signal::SIGUSR1);
            return wait_for_exit(pid);
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn reconcile_exit(app_ok: bool, recorder_ok: bool, converter_ok: bool) -> i32 {
    match (recorder_ok, converter_ok) {
        (false, false) => EXIT_BOTH_FAILED,
        (false, true) => EXIT_RECORD_FAILED,
        (true, false) => EXIT_CONVERT_FAILED,
        (true, true) if !app_ok => EXIT_APP_FAILED,
        (true, true) => EXIT_OK,
    }
}

/// Resolve the explicit vmlinux path (if any) to an image with a text
/// range; the range still comes from kallsyms because the file itself does
/// not say where it was loaded.
fn resolve_vmlinux(vmlinux: Option<&Path>) -> Option<(String, u64, u64)> {
    let path = vmlinux?;
    match kallsyms::read_kernel_range() {
        Some((start, end)) => Some((path.to_string_lossy().into_owned(), start, end)),
        None => {
            eprintln!(
                "oxprof: could not determine the kernel address range; ignoring --vmlinux"
            );
            None
        }
    }
}

/// The full path the appname should carry for a launched command: resolve
/// relative invocations against the PATH the way exec will.
fn resolve_app_path(program: &OsString) -> String {
    let raw = program.to_string_lossy().into_owned();
    if raw.contains('/') {
        return std::fs::canonicalize(&raw)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or(raw);
    }
    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(&raw);
            if candidate.is_file() {
                return candidate.to_string_lossy().into_owned();
            }
        }
    }
    raw
}
