//! Driver for VirtualBox 4.x.

use std::path::Path;

use super::{verify_major, Driver, DriverError, VBoxManage, VBoxVersion};

/// GUI notices that block unattended installs on 4.x.
const SUPPRESSED_MESSAGES: &str =
    "confirmGoingFullscreen,remindAboutMouseIntegration,remindAboutAutoCapture";

pub struct VBox4Driver {
    vbm: VBoxManage,
    version: VBoxVersion,
}

impl VBox4Driver {
    pub fn new(vbm: VBoxManage, version: VBoxVersion) -> Self {
        Self { vbm, version }
    }
}

impl Driver for VBox4Driver {
    fn version(&self) -> VBoxVersion {
        self.version
    }

    fn verify(&self) -> Result<(), DriverError> {
        verify_major(&self.vbm, self.version)
    }

    fn vboxmanage(&self, args: &[&str]) -> Result<String, DriverError> {
        self.vbm.run(args).map(|out| out.stdout)
    }

    fn suppress_messages(&self) -> Result<(), DriverError> {
        self.vboxmanage(&[
            "setextradata",
            "global",
            "GUI/SuppressMessages",
            SUPPRESSED_MESSAGES,
        ])
        .map(drop)
    }

    fn create_disk(&self, path: &Path, size_mb: u32) -> Result<(), DriverError> {
        let filename = path.display().to_string();
        let size = size_mb.to_string();
        self.vboxmanage(&[
            "createhd",
            "--filename",
            &filename,
            "--size",
            &size,
            "--variant",
            "Standard",
        ])
        .map(drop)
    }
}
