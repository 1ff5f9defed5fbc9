use std::process::exit;

use clap::Parser;

use oxprof::cli;
use oxprof::linux::profiler::{self, ProfileSession, ProfileTarget};

fn main() {
    env_logger::init();

    let opt = cli::Opt::parse();

    let events = match cli::resolve_events(&opt.event) {
        Ok(events) => events,
        Err(message) => {
            eprintln!("oxprof: {message}");
            exit(profiler::EXIT_SETUP_FAILED);
        }
    };

    let target = if let Some(pid) = opt.pid {
        ProfileTarget::Pid(pid)
    } else if opt.system_wide {
        ProfileTarget::SystemWide
    } else if let Some((program, args)) = opt.command.split_first() {
        ProfileTarget::Command {
            program: program.clone(),
            args: args.to_vec(),
        }
    } else {
        eprintln!("oxprof: nothing to profile; give a command, --pid or --system-wide");
        eprintln!("Try 'oxprof --help' for more information.");
        exit(profiler::EXIT_SETUP_FAILED);
    };

    let session = ProfileSession {
        target,
        events,
        session_dir: opt.session_dir,
        separate_cpu: opt.separate_cpu,
        separate_thread: opt.separate_thread,
        callgraph: opt.callgraph,
        lazy_conversion: opt.lazy_conversion,
        vmlinux: opt.vmlinux,
    };

    exit(profiler::run(session));
}
