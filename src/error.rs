use std::io;
use std::path::PathBuf;

/// Errors while setting up the kernel side of profiling. `PmuBusy` and
/// `TargetEnded` are expected operational failures and get a plain
/// human-readable report; everything else is unexpected.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("the performance monitoring hardware reports busy; is another profiling tool in use?")]
    PmuBusy,

    #[error("the target program ended before profiling was started; no samples collected")]
    TargetEnded,

    #[error("permission to open performance counters was denied")]
    PermissionDenied(#[source] io::Error),

    #[error("perf_event_open failed for event {event}: {source}")]
    CounterOpen {
        event: String,
        #[source]
        source: io::Error,
    },

    #[error("could not read the counter id back from the kernel: {0}")]
    CounterId(#[source] io::Error),

    #[error("could not map the ring buffer: {0}")]
    RingMap(#[source] io::Error),

    #[error("could not redirect counter output into the shared ring: {0}")]
    SetOutput(#[source] io::Error),

    #[error("no online CPUs could be enumerated")]
    NoCpus,

    #[error("could not find process information for pid {0}; has it exited?")]
    NoSuchProcess(u32),

    #[error("{0}")]
    Io(#[from] io::Error),
}

/// Errors in the recorder→converter sample stream. Corruption is fatal to
/// the converter; partial output is preserved.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("sample data does not start with the expected magic")]
    BadMagic,

    #[error("sample data header is incompatible (attribute record size differs)")]
    BadAttrSize,

    #[error("sample data is corrupted: {0}")]
    Corrupt(&'static str),

    #[error("stream i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Fatal ring-buffer protocol violation: the producer head moved behind our
/// consumer tail.
#[derive(Debug, thiserror::Error)]
pub enum RingError {
    #[error("ring buffer head is behind the consumer tail; this should never happen")]
    Overrun,

    #[error("ring buffer drain failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error("could not write the sample stream: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Registry(#[from] crate::samples::registry::RegistryError),

    #[error("could not write the session log {}: {source}", .path.display())]
    Log {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
