//! Machine driver: VM lifecycle primitives over `VBoxManage`.
//!
//! Steps only ever see `dyn Driver`. The concrete variant is picked once,
//! from the detected VirtualBox major version, when the driver is built.
//!
//! `VBoxManage` resolution order:
//! 1. `VBOXMANAGE_BIN` env var (path to binary)
//! 2. System PATH (`VBoxManage`, then `vboxmanage`)

pub mod command;
pub mod vbox4;
pub mod vbox5;

use std::env;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::cancel::CancelToken;
pub use command::{CommandOutput, VBoxManage};
pub use vbox4::VBox4Driver;
pub use vbox5::VBox5Driver;

/// Storage controller the disk and install medium hang off.
pub const STORAGE_CONTROLLER: &str = "IDE Controller";

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("VBoxManage not found: {0}")]
    NotFound(String),

    #[error("unsupported VirtualBox version '{0}' (4.x or newer is required)")]
    UnsupportedVersion(String),

    #[error("failed to execute '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("'{command}' failed ({status})\n  stdout: {stdout}\n  stderr: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stdout: String,
        stderr: String,
    },

    #[error("'{command}' was cancelled")]
    Cancelled { command: String },
}

/// Parsed `VBoxManage --version` output, e.g. `4.2.6r82870`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VBoxVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl VBoxVersion {
    pub fn parse(raw: &str) -> Option<Self> {
        let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
        let numeric = line
            .split(|c: char| c == 'r' || c == '_' || c == '-')
            .next()?;
        let mut parts = numeric.split('.').map(|p| p.parse::<u32>());
        let major = parts.next()?.ok()?;
        let minor = parts.next().unwrap_or(Ok(0)).ok()?;
        let patch = parts.next().unwrap_or(Ok(0)).ok()?;
        Some(Self {
            major,
            minor,
            patch,
        })
    }
}

impl fmt::Display for VBoxVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// VM lifecycle primitives needed by the build steps.
///
/// Variants implement the version-specific operations; the rest are shared
/// translations onto [`Driver::vboxmanage`].
pub trait Driver: Send + Sync {
    /// Version the driver was built for.
    fn version(&self) -> VBoxVersion;

    /// Confirm the tool still answers and matches this variant.
    fn verify(&self) -> Result<(), DriverError>;

    /// Run raw `VBoxManage` arguments, returning stdout.
    fn vboxmanage(&self, args: &[&str]) -> Result<String, DriverError>;

    /// Silence interactive GUI notices that would block an unattended build.
    fn suppress_messages(&self) -> Result<(), DriverError>;

    /// Create a disk image of `size_mb` megabytes at `path`.
    fn create_disk(&self, path: &Path, size_mb: u32) -> Result<(), DriverError>;

    fn create_vm(&self, name: &str, guest_os_type: &str) -> Result<(), DriverError> {
        self.vboxmanage(&[
            "createvm",
            "--name",
            name,
            "--ostype",
            guest_os_type,
            "--register",
        ])
        .map(drop)
    }

    /// Unregister the VM and delete its files.
    fn delete_vm(&self, name: &str) -> Result<(), DriverError> {
        self.vboxmanage(&["unregistervm", name, "--delete"]).map(drop)
    }

    /// Unregister a disk that is not attached to any VM and delete its file.
    fn delete_disk(&self, path: &Path) -> Result<(), DriverError> {
        let disk = path.display().to_string();
        self.vboxmanage(&["closemedium", "disk", &disk, "--delete"])
            .map(drop)
    }

    /// Add the storage controller and attach `path` as the primary disk.
    fn attach_disk(&self, vm: &str, path: &Path) -> Result<(), DriverError> {
        self.vboxmanage(&[
            "storagectl",
            vm,
            "--name",
            STORAGE_CONTROLLER,
            "--add",
            "ide",
        ])?;
        let disk = path.display().to_string();
        self.vboxmanage(&[
            "storageattach",
            vm,
            "--storagectl",
            STORAGE_CONTROLLER,
            "--port",
            "0",
            "--device",
            "0",
            "--type",
            "hdd",
            "--medium",
            &disk,
        ])
        .map(drop)
    }

    /// Attach an installation medium as the DVD drive.
    fn attach_medium(&self, vm: &str, iso: &Path) -> Result<(), DriverError> {
        let iso = iso.display().to_string();
        self.vboxmanage(&dvd_attach_args(vm, &iso)).map(drop)
    }

    fn detach_medium(&self, vm: &str) -> Result<(), DriverError> {
        self.vboxmanage(&dvd_attach_args(vm, "none")).map(drop)
    }
}

fn dvd_attach_args<'a>(vm: &'a str, medium: &'a str) -> [&'a str; 12] {
    [
        "storageattach",
        vm,
        "--storagectl",
        STORAGE_CONTROLLER,
        "--port",
        "1",
        "--device",
        "0",
        "--type",
        "dvddrive",
        "--medium",
        medium,
    ]
}

/// Find the `VBoxManage` binary.
pub fn locate_vboxmanage() -> Result<PathBuf, DriverError> {
    if let Ok(bin_path) = env::var("VBOXMANAGE_BIN") {
        let path = PathBuf::from(&bin_path);
        if is_executable(&path) {
            return Ok(path);
        }
        return Err(DriverError::NotFound(format!(
            "VBOXMANAGE_BIN points to a missing or non-executable file: {}",
            bin_path
        )));
    }

    for name in ["VBoxManage", "vboxmanage"] {
        if let Ok(path) = which::which(name) {
            return Ok(path);
        }
    }

    Err(DriverError::NotFound(
        "set VBOXMANAGE_BIN=/path/to/VBoxManage or install VirtualBox to PATH".to_string(),
    ))
}

fn is_executable(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => {
            if !meta.is_file() {
                return false;
            }
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if meta.permissions().mode() & 0o111 == 0 {
                    return false;
                }
            }
            true
        }
        Err(_) => false,
    }
}

/// Query the tool version.
pub fn detect_version(vbm: &VBoxManage) -> Result<VBoxVersion, DriverError> {
    let output = vbm.run(&["--version"])?;
    VBoxVersion::parse(&output.stdout)
        .ok_or_else(|| DriverError::UnsupportedVersion(output.stdout.trim().to_string()))
}

/// Build the driver variant matching the installed VirtualBox.
pub fn new_driver(
    vboxmanage: PathBuf,
    cancel: CancelToken,
) -> Result<Box<dyn Driver>, DriverError> {
    log::info!("VBoxManage path: {}", vboxmanage.display());
    let vbm = VBoxManage::new(vboxmanage, cancel);
    let version = detect_version(&vbm)?;
    log::info!("VirtualBox version: {}", version);

    let driver: Box<dyn Driver> = match version.major {
        4 => Box::new(VBox4Driver::new(vbm, version)),
        major if major >= 5 => Box::new(VBox5Driver::new(vbm, version)),
        _ => return Err(DriverError::UnsupportedVersion(version.to_string())),
    };
    driver.verify()?;
    Ok(driver)
}

/// Shared check for variants: the tool must still report the same major.
pub(crate) fn verify_major(vbm: &VBoxManage, expected: VBoxVersion) -> Result<(), DriverError> {
    let found = detect_version(vbm)?;
    if found.major != expected.major {
        return Err(DriverError::UnsupportedVersion(format!(
            "{} (driver was selected for {})",
            found, expected
        )));
    }
    Ok(())
}
