use std::ffi::{CString, OsStr, OsString};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::raw::c_char;
use std::os::unix::prelude::OsStrExt;

use libc::execvp;
use nix::unistd::Pid;

/// Launches a command in a suspended state, so that the perf counters can be
/// opened (with enable-on-exec) against its pid before it runs a single
/// instruction of the profiled workload.
pub struct SuspendedLaunchedProcess {
    pid: Pid,
    send_end_of_resume_pipe: OwnedFd,
    recv_end_of_execerr_pipe: OwnedFd,
}

impl SuspendedLaunchedProcess {
    pub fn launch_in_suspended_state(
        command_name: &OsStr,
        command_args: &[OsString],
    ) -> std::io::Result<Self> {
        let argv: Vec<CString> = std::iter::once(command_name)
            .chain(command_args.iter().map(|s| s.as_os_str()))
            .map(|os_str: &OsStr| CString::new(os_str.as_bytes().to_vec()).unwrap())
            .collect();
        let argv: Vec<*const c_char> = argv
            .iter()
            .map(|c_str| c_str.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        let (resume_rp, resume_sp) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)?;
        let (execerr_rp, execerr_sp) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)?;

        match unsafe { nix::unistd::fork() }.expect("fork failed") {
            nix::unistd::ForkResult::Child => {
                drop(resume_sp);
                drop(execerr_rp);
                Self::run_child(resume_rp, execerr_sp, &argv)
            }
            nix::unistd::ForkResult::Parent { child } => {
                drop(resume_rp);
                drop(execerr_sp);
                Ok(Self {
                    pid: child,
                    send_end_of_resume_pipe: resume_sp,
                    recv_end_of_execerr_pipe: execerr_rp,
                })
            }
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    const EXECERR_MSG_FOOTER: [u8; 4] = *b"NOEX";

    pub fn unsuspend_and_run(self) -> std::io::Result<RunningProcess> {
        // Tell the child to exec.
        nix::unistd::write(&self.send_end_of_resume_pipe, &[0x42])?;
        drop(self.send_end_of_resume_pipe);

        // Wait for the child to report the fate of its execvp call.
        loop {
            let mut bytes = [0; 8];
            let read_result = nix::unistd::read(self.recv_end_of_execerr_pipe.as_raw_fd(), &mut bytes);
            match read_result {
                Ok(0) => {
                    // The pipe closed on exec: the command is running.
                    break;
                }
                Ok(8) => {
                    // An execerr message: the execvp call failed.
                    let (errno, footer) = bytes.split_at(4);
                    assert_eq!(
                        Self::EXECERR_MSG_FOOTER,
                        footer,
                        "validation on the execerr pipe failed: {bytes:?}",
                    );
                    let errno = i32::from_be_bytes([errno[0], errno[1], errno[2], errno[3]]);
                    let _wait_status = nix::sys::wait::waitpid(self.pid, None);
                    return Err(std::io::Error::from_raw_os_error(errno));
                }
                Ok(_) => {
                    // Pipe I/O of up to PIPE_BUF bytes is atomic, so this
                    // should never happen.
                    let _status = nix::sys::wait::waitpid(self.pid, None)
                        .expect("waitpid should always succeed");
                    panic!("short read on the execerr pipe")
                }
                Err(nix::errno::Errno::EINTR) => {}
                Err(_) => std::process::exit(1),
            }
        }

        Ok(RunningProcess { pid: self.pid })
    }

    /// Executed in the forked child process. This function never returns.
    fn run_child(
        recv_end_of_resume_pipe: OwnedFd,
        send_end_of_execerr_pipe: OwnedFd,
        argv: &[*const c_char],
    ) -> ! {
        // Wait for the parent to send us a byte through the pipe.
        loop {
            let mut buf = [0];
            let read_result = nix::unistd::read(recv_end_of_resume_pipe.as_raw_fd(), &mut buf);
            match read_result {
                Ok(0) => {
                    // The parent exited without starting us; profiling setup
                    // must have failed. Do not run the command.
                    std::process::exit(0)
                }
                Ok(_) => {
                    let _ = unsafe { execvp(argv[0], argv.as_ptr()) };

                    // Exec failed (usually: no such command). Report errno.
                    let errno = nix::errno::Errno::last_raw().to_be_bytes();
                    let bytes = [
                        errno[0],
                        errno[1],
                        errno[2],
                        errno[3],
                        Self::EXECERR_MSG_FOOTER[0],
                        Self::EXECERR_MSG_FOOTER[1],
                        Self::EXECERR_MSG_FOOTER[2],
                        Self::EXECERR_MSG_FOOTER[3],
                    ];
                    nix::unistd::write(send_end_of_execerr_pipe, &bytes).unwrap();
                    unsafe { libc::_exit(1) }
                }
                Err(nix::errno::Errno::EINTR) => {}
                Err(_) => std::process::exit(1),
            }
        }
    }
}

pub struct RunningProcess {
    pid: Pid,
}

impl RunningProcess {
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    pub fn wait(self) -> Result<nix::sys::wait::WaitStatus, nix::errno::Errno> {
        nix::sys::wait::waitpid(self.pid, None)
    }
}
