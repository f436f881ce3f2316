#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use vbox_builder::{Builder, CancelToken, Driver, DriverError, Ui, VBoxVersion};

/// md5 of `b"hello"`.
pub const HELLO_MD5: &str = "5d41402abc4b2a76b9719d911017c592";

pub type CallLog = Arc<Mutex<Vec<String>>>;

/// Driver that records lifecycle calls instead of running `VBoxManage`.
pub struct RecordingDriver {
    calls: CallLog,
    cancel: CancelToken,
    cancel_on: Option<&'static str>,
}

impl RecordingDriver {
    fn record(&self, call: String) -> Result<(), DriverError> {
        let op = call.split_whitespace().next().unwrap_or_default().to_string();
        self.calls.lock().unwrap().push(call);
        if self.cancel_on == Some(op.as_str()) {
            self.cancel.cancel();
        }
        Ok(())
    }
}

impl Driver for RecordingDriver {
    fn version(&self) -> VBoxVersion {
        VBoxVersion {
            major: 7,
            minor: 0,
            patch: 14,
        }
    }

    fn verify(&self) -> Result<(), DriverError> {
        Ok(())
    }

    fn vboxmanage(&self, args: &[&str]) -> Result<String, DriverError> {
        self.record(args.join(" ")).map(|_| String::new())
    }

    fn suppress_messages(&self) -> Result<(), DriverError> {
        self.record("suppress_messages".to_string())
    }

    fn create_disk(&self, path: &Path, size_mb: u32) -> Result<(), DriverError> {
        self.record(format!("create_disk {} {}", path.display(), size_mb))
    }

    fn create_vm(&self, name: &str, guest_os_type: &str) -> Result<(), DriverError> {
        self.record(format!("create_vm {name} {guest_os_type}"))
    }

    fn delete_vm(&self, name: &str) -> Result<(), DriverError> {
        self.record(format!("delete_vm {name}"))
    }

    fn delete_disk(&self, path: &Path) -> Result<(), DriverError> {
        self.record(format!("delete_disk {}", path.display()))
    }

    fn attach_disk(&self, vm: &str, path: &Path) -> Result<(), DriverError> {
        self.record(format!("attach_disk {vm} {}", path.display()))
    }

    fn attach_medium(&self, vm: &str, iso: &Path) -> Result<(), DriverError> {
        self.record(format!("attach_medium {vm} {}", iso.display()))
    }

    fn detach_medium(&self, vm: &str) -> Result<(), DriverError> {
        self.record(format!("detach_medium {vm}"))
    }
}

/// A builder backed by a [`RecordingDriver`]. The driver cancels the build
/// when it sees the `cancel_on` operation.
pub fn recording_builder(cancel_on: Option<&'static str>) -> (Builder, CallLog) {
    let calls: CallLog = Arc::new(Mutex::new(Vec::new()));
    let shared = Arc::clone(&calls);
    let builder = Builder::with_driver_factory(Box::new(
        move |cancel: &CancelToken| -> Result<Box<dyn Driver>, DriverError> {
            Ok(Box::new(RecordingDriver {
                calls: Arc::clone(&shared),
                cancel: cancel.clone(),
                cancel_on,
            }))
        },
    ));
    (builder, calls)
}

pub fn calls(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Ui that records every line, optionally cancelling on a message prefix.
#[derive(Default)]
pub struct MemoryUi {
    lines: Mutex<Vec<String>>,
    cancel_on_message: Option<(&'static str, CancelToken)>,
}

impl MemoryUi {
    pub fn cancelling_on(prefix: &'static str, token: CancelToken) -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
            cancel_on_message: Some((prefix, token)),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    fn push(&self, kind: &str, message: &str) {
        self.lines.lock().unwrap().push(format!("{kind}: {message}"));
    }
}

impl Ui for MemoryUi {
    fn say(&self, message: &str) {
        self.push("say", message);
    }

    fn message(&self, message: &str) {
        self.push("message", message);
        if let Some((prefix, token)) = &self.cancel_on_message {
            if message.starts_with(prefix) {
                token.cancel();
            }
        }
    }

    fn error(&self, message: &str) {
        self.push("error", message);
    }
}

/// Write `b"hello"` as a local ISO under `dir`.
pub fn local_iso(dir: &Path) -> PathBuf {
    let iso = dir.join("os.iso");
    fs::write(&iso, b"hello").unwrap();
    iso
}

pub fn spec(iso_url: &str, checksum: &str, output: &Path) -> Value {
    json!({
        "iso_url": iso_url,
        "iso_checksum": checksum,
        "output_directory": output.display().to_string(),
        "vm_name": "box",
        "disk_size": 2048,
    })
}

/// Files left in the cache's partial directory.
pub fn partial_files(cache_root: &Path) -> usize {
    match fs::read_dir(cache_root.join("partial")) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}
