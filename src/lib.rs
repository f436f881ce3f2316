//! Build VirtualBox VM images from a declarative spec.
//!
//! A build spec names an installation medium and how the VM should be called.
//! The builder validates it, resolves `VBoxManage`, and then drives a fixed
//! pipeline of provisioning steps:
//!
//! - **Config** - Defaulting, normalization and aggregate validation
//! - **Driver** - Version-specific translation of VM lifecycle intents
//! - **Download** - Cached, checksum-verified retrieval of the ISO
//! - **Steps** - Ordered operations with reverse-order cleanup
//!
//! # Architecture
//!
//! ```text
//! raw spec (JSON value)
//!     │
//!     ├── Builder::prepare
//!     │     ├── BuildConfig::from_raw ── every defect collected
//!     │     └── DriverFactory ──────────── locate + version-select driver
//!     │
//!     └── Builder::run
//!           └── run_steps(default_steps, StepContext)
//!                 download_iso ─── FileCache (shared across builds)
//!                 prepare_output_dir
//!                 suppress_messages
//!                 create_vm ─────── Driver
//!                 create_disk
//!                 attach_iso
//!                 └── cleanups in reverse ── Artifact | cancelled | StepFailed
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use vbox_builder::{Builder, ConsoleUi, FileCache, NoopHook};
//!
//! let mut builder = Builder::new();
//! builder.prepare(&serde_json::json!({
//!     "iso_url": "https://example.com/os.iso",
//!     "iso_checksum": "5d41402abc4b2a76b9719d911017c592",
//! }))?;
//!
//! let cache = FileCache::open(&FileCache::default_root())?;
//! if let Some(artifact) = builder.run(&ConsoleUi, &NoopHook, &cache)? {
//!     println!("{artifact}");
//! }
//! ```

pub mod artifact;
pub mod builder;
pub mod cache;
pub mod cancel;
pub mod checksum;
pub mod config;
pub mod download;
pub mod driver;
pub mod error;
pub mod steps;
pub mod ui;

pub use artifact::{Artifact, BUILDER_ID};
pub use builder::{Builder, DriverFactory};
pub use cache::{Cache, CacheEntry, FileCache};
pub use cancel::CancelToken;
pub use checksum::ChecksumType;
pub use config::BuildConfig;
pub use download::{fetch_iso, DownloadError, Fetched, IsoRequest};
pub use driver::{Driver, DriverError, VBoxVersion};
pub use error::{BuildError, ConfigError, ConfigErrors};
pub use steps::{Step, StepAction, StepContext};
pub use ui::{ConsoleUi, Hook, HookData, NoopHook, Ui};
