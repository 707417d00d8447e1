use std::{
    fmt,
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
};

use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default location of the kprobe control file
pub const KPROBE_EVENTS: &str = "/sys/kernel/debug/tracing/kprobe_events";

/// Number of return probe instances the kernel can run concurrently
pub const KPROBE_MAX_ACTIVE: u32 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    KProbe,
    KRetProbe,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KProbe => write!(f, "Kprobe"),
            Self::KRetProbe => write!(f, "Kretprobe"),
        }
    }
}

impl ProbeKind {
    /// Prefix of the eBPF section holding programs of this kind
    pub const fn section_prefix(&self) -> &'static str {
        match self {
            Self::KProbe => "kprobe/",
            Self::KRetProbe => "kretprobe/",
        }
    }

    /// Returns the bare kernel function name of `func`
    #[inline]
    pub fn strip<'a>(&self, func: &'a str) -> &'a str {
        func.strip_prefix(self.section_prefix()).unwrap_or(func)
    }

    fn enable_command(&self, func: &str, max_active: u32) -> String {
        match self {
            Self::KProbe => format!("p:p{func} {func}\n"),
            Self::KRetProbe => format!("r{max_active}:r{func} {func}\n"),
        }
    }
}

// removal always uses the return probe event name, whatever
// the kind of the probe registered
#[inline]
fn disable_event_name(func: &str) -> String {
    format!("r{func}")
}

#[inline]
fn disable_command(event_name: &str) -> String {
    format!("-:{event_name}\n")
}

/// Kernel functions to hook, either one can be absent
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KProbe {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_fn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_fn: Option<String>,
}

impl KProbe {
    pub fn new<S: AsRef<str>>(name: S) -> Self {
        Self {
            name: name.as_ref().to_string(),
            ..Default::default()
        }
    }

    pub fn entry<S: AsRef<str>>(mut self, func: S) -> Self {
        self.entry_fn = Some(func.as_ref().to_string());
        self
    }

    pub fn exit<S: AsRef<str>>(mut self, func: S) -> Self {
        self.exit_fn = Some(func.as_ref().to_string());
        self
    }

    fn functions(&self) -> impl Iterator<Item = (ProbeKind, &str)> {
        [
            (ProbeKind::KProbe, self.entry_fn.as_deref()),
            (ProbeKind::KRetProbe, self.exit_fn.as_deref()),
        ]
        .into_iter()
        .filter_map(|(kind, f)| f.filter(|f| !f.is_empty()).map(|f| (kind, f)))
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("cannot open {}: {source}", .path.to_string_lossy())]
    Open { path: PathBuf, source: io::Error },
    #[error("cannot write {cmd:?} to {}: {source}", .path.to_string_lossy())]
    Write {
        path: PathBuf,
        cmd: String,
        source: io::Error,
    },
}

impl ControlError {
    /// The kernel refused the command because the event does not exist
    #[inline]
    pub fn is_event_not_found(&self) -> bool {
        matches!(self, Self::Write { source, .. } if source.raw_os_error() == Some(libc::ENOENT))
    }
}

/// Kernel interface taking kprobe control commands
pub trait ControlInterface {
    fn write_command(&self, cmd: &str) -> Result<(), ControlError>;
}

/// The tracefs `kprobe_events` file
#[derive(Debug, Clone)]
pub struct KprobeEvents {
    path: PathBuf,
}

impl Default for KprobeEvents {
    fn default() -> Self {
        Self::new(KPROBE_EVENTS)
    }
}

impl KprobeEvents {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ControlInterface for KprobeEvents {
    fn write_command(&self, cmd: &str) -> Result<(), ControlError> {
        // the file gets closed when going out of scope
        let mut f = OpenOptions::new()
            .append(true)
            .write(true)
            .open(&self.path)
            .map_err(|source| ControlError::Open {
                path: self.path.clone(),
                source,
            })?;

        f.write_all(cmd.as_bytes())
            .map_err(|source| ControlError::Write {
                path: self.path.clone(),
                cmd: cmd.to_string(),
                source,
            })
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to load {kind} {func}: {source}")]
    Registration {
        kind: ProbeKind,
        func: String,
        source: ControlError,
    },
    #[error("failed to unregister {kind} {func}: {source}")]
    Unregistration {
        kind: ProbeKind,
        func: String,
        source: ControlError,
    },
}

/// Registers and unregisters kprobes. Calls are expected at
/// startup and shutdown only, from a single thread.
pub struct KprobeManager<C = KprobeEvents> {
    control: C,
}

impl Default for KprobeManager<KprobeEvents> {
    fn default() -> Self {
        Self::new(KprobeEvents::default())
    }
}

impl<C: ControlInterface> KprobeManager<C> {
    pub fn new(control: C) -> Self {
        Self { control }
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    fn enable_kprobe(&self, kind: ProbeKind, func: &str) -> Result<(), ControlError> {
        self.control
            .write_command(&kind.enable_command(func, KPROBE_MAX_ACTIVE))
    }

    fn disable_kprobe(&self, event_name: &str) -> Result<(), ControlError> {
        match self.control.write_command(&disable_command(event_name)) {
            // this happens when two independent owners of the same
            // probes tear them down, the second finds them removed
            Err(e) if e.is_event_not_found() => {
                debug!("kprobe event {event_name} already removed");
                Ok(())
            }
            res => res,
        }
    }

    pub fn register(&self, k: &KProbe) -> Result<(), Error> {
        for (kind, f) in k.functions() {
            let func = kind.strip(f);
            self.enable_kprobe(kind, func)
                .map_err(|source| Error::Registration {
                    kind,
                    func: f.to_string(),
                    source,
                })?;
            info!("registered {kind} {func} for {}", k.name);
        }
        Ok(())
    }

    pub fn unregister(&self, k: &KProbe) -> Result<(), Error> {
        for (kind, f) in k.functions() {
            let func = kind.strip(f);
            self.disable_kprobe(&disable_event_name(func))
                .map_err(|source| Error::Unregistration {
                    kind,
                    func: f.to_string(),
                    source,
                })?;
            info!("unregistered {kind} {func} for {}", k.name);
        }
        Ok(())
    }

    /// Registers all the probes, stops at the first failure
    pub fn register_all(&self, probes: &[KProbe]) -> Result<(), Error> {
        probes.iter().try_for_each(|k| self.register(k))
    }

    /// Tries to unregister every probe and returns the first error
    pub fn unregister_all(&self, probes: &[KProbe]) -> Result<(), Error> {
        let mut first = None;
        for k in probes {
            if let Err(e) = self.unregister(k) {
                error!("{e}");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}
