//! Driver for VirtualBox 5.0 and newer.
//!
//! `createhd` is deprecated from 5.0 on in favour of `createmedium`, and the
//! GUI accepts `all` for message suppression.

use std::path::Path;

use super::{verify_major, Driver, DriverError, VBoxManage, VBoxVersion};

pub struct VBox5Driver {
    vbm: VBoxManage,
    version: VBoxVersion,
}

impl VBox5Driver {
    pub fn new(vbm: VBoxManage, version: VBoxVersion) -> Self {
        Self { vbm, version }
    }
}

impl Driver for VBox5Driver {
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
        self.vboxmanage(&["setextradata", "global", "GUI/SuppressMessages", "all"])
            .map(drop)
    }

    fn create_disk(&self, path: &Path, size_mb: u32) -> Result<(), DriverError> {
        let filename = path.display().to_string();
        let size = size_mb.to_string();
        self.vboxmanage(&[
            "createmedium",
            "disk",
            "--filename",
            &filename,
            "--size",
            &size,
            "--format",
            "VDI",
            "--variant",
            "Standard",
        ])
        .map(drop)
    }
}
