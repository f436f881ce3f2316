use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use log::{LevelFilter, Log, Metadata, Record};
use vbox_builder::config::IsoSource;
use vbox_builder::{BuildConfig, Builder, ConsoleUi, FileCache, IsoRequest, NoopHook};

const LOG_ENV: &str = "VBOX_BUILDER_LOG";

fn usage() -> &'static str {
    "Usage:
  vbox-builder validate <spec.json|spec.toml>
  vbox-builder build <spec.json|spec.toml>
  vbox-builder cache-path <spec.json|spec.toml>"
}

fn main() -> Result<()> {
    init_logging();
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [cmd, spec] if cmd == "validate" => validate(Path::new(spec)),
        [cmd, spec] if cmd == "build" => build(Path::new(spec)),
        [cmd, spec] if cmd == "cache-path" => cache_path(Path::new(spec)),
        _ => bail!("{}", usage()),
    }
}

fn validate(spec: &Path) -> Result<()> {
    let raw = load_spec(spec)?;
    let mut builder = Builder::new();
    builder.prepare(&raw)?;
    println!("Build spec {} is valid", spec.display());
    Ok(())
}

fn build(spec: &Path) -> Result<()> {
    let raw = load_spec(spec)?;
    let mut builder = Builder::new();
    builder.prepare(&raw)?;

    let cache_root = FileCache::default_root();
    let cache = FileCache::open(&cache_root)
        .with_context(|| format!("Failed to open download cache at {}", cache_root.display()))?;

    match builder.run(&ConsoleUi, &NoopHook, &cache)? {
        Some(artifact) => {
            println!("Build finished: {}", artifact);
            Ok(())
        }
        None => bail!("build was cancelled"),
    }
}

fn cache_path(spec: &Path) -> Result<()> {
    let raw = load_spec(spec)?;
    let config = BuildConfig::from_raw(&raw)?;
    if let IsoSource::Local(path) = config.iso_source()? {
        println!("Local ISO is used in place: {}", path.display());
        return Ok(());
    }

    let key = IsoRequest {
        url: &config.iso_url,
        checksum_type: config.iso_checksum_type,
        checksum: &config.iso_checksum,
    }
    .cache_key();
    let cache = FileCache::open(&FileCache::default_root())?;
    match cache.get(&key)? {
        Some(path) => println!("{key} {}", path.display()),
        None => println!("{key} (not cached)"),
    }
    Ok(())
}

/// Read a spec file. `.json` is JSON; anything else is TOML.
fn load_spec(path: &Path) -> Result<serde_json::Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read build spec {}", path.display()))?;
    if path.extension().is_some_and(|ext| ext == "json") {
        return serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse {} as JSON", path.display()));
    }
    let value: toml::Table = toml::from_str(&text)
        .with_context(|| format!("Failed to parse {} as TOML", path.display()))?;
    serde_json::to_value(value).context("Failed to convert TOML build spec")
}

struct StderrLogger {
    level: LevelFilter,
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Level named by `VBOX_BUILDER_LOG`; unset or unknown means `warn`.
fn log_level(raw: Option<&str>) -> LevelFilter {
    raw.and_then(|v| LevelFilter::from_str(v.trim()).ok())
        .unwrap_or(LevelFilter::Warn)
}

fn install_logger(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    log::set_boxed_logger(Box::new(StderrLogger { level })).map(|()| log::set_max_level(level))
}

fn init_logging() {
    let level = log_level(std::env::var(LOG_ENV).ok().as_deref());
    if let Err(e) = install_logger(level) {
        eprintln!("warning: failed to install logger: {}", e);
    }
}
