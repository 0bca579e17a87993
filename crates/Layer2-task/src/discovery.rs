//! Discovery - finds IOC instances under a root directory
//!
//! Layout walked (one level per [`ScanLevel`]):
//!
//! ```text
//! <root>/                                Root      every subdirectory
//!   <stage>/                             Stage     only `ioc*` subdirectories
//!     ioc/                               IocTree   every subdirectory
//!       <instance>/instance.cmd          Instance  read instance.cmd
//!       <category>/<instance>/...        NestedInstance (when <category> has no instance.cmd)
//! ```
//!
//! Unreadable directories and files are skipped. An `instance.cmd` missing any
//! of `LOCATION`, `DEVICE_NAME`, `CAMERA_NAME` yields no descriptor.

use ioc_foundation::{Error, Result};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Configuration file looked for in instance directories
pub const INSTANCE_FILE: &str = "instance.cmd";

/// Name prefix of the stage subdirectories that hold instances
pub const IOC_DIR_PREFIX: &str = "ioc";

// ============================================================================
// Descriptor
// ============================================================================

/// Validated result of parsing one `instance.cmd`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDescriptor {
    stage_path: PathBuf,
    instance_name: String,
    device_name: String,
    location: String,
    device: String,
    prefix: String,
}

impl InstanceDescriptor {
    pub fn new(
        stage_path: impl Into<PathBuf>,
        instance_name: impl Into<String>,
        location: impl Into<String>,
        device: impl Into<String>,
        device_name: impl Into<String>,
    ) -> Self {
        let location = location.into();
        let device = device.into();
        let prefix = format!("{}:{}:", location, device);
        Self {
            stage_path: stage_path.into(),
            instance_name: instance_name.into(),
            device_name: device_name.into(),
            location,
            device,
            prefix,
        }
    }

    /// Stage directory (two levels above the instance directory)
    pub fn stage_path(&self) -> &Path {
        &self.stage_path
    }

    /// Instance directory name
    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// `CAMERA_NAME`
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// `LOCATION`
    pub fn location(&self) -> &str {
        &self.location
    }

    /// `DEVICE_NAME`
    pub fn device(&self) -> &str {
        &self.device
    }

    /// `"<LOCATION>:<DEVICE_NAME>:"`
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

// ============================================================================
// instance.cmd parsing
// ============================================================================

/// Keys read from `instance.cmd`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceKey {
    Location,
    DeviceName,
    CameraName,
}

impl InstanceKey {
    pub const ALL: [InstanceKey; 3] = [
        InstanceKey::Location,
        InstanceKey::DeviceName,
        InstanceKey::CameraName,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceKey::Location => "LOCATION",
            InstanceKey::DeviceName => "DEVICE_NAME",
            InstanceKey::CameraName => "CAMERA_NAME",
        }
    }

    /// The key a `epicsEnvSet("KEY", ...)` line sets, if it is one of ours
    pub fn from_line(line: &str) -> Option<Self> {
        let rest = line.trim_start().strip_prefix("epicsEnvSet(\"")?;
        Self::ALL
            .into_iter()
            .find(|key| rest.strip_prefix(key.as_str()).map_or(false, |r| r.starts_with('"')))
    }
}

/// The value of a `epicsEnvSet("KEY", "VALUE")` line: the text between the
/// second pair of double quotes.
///
/// Without a closing quote the value runs to the end of the line minus any
/// trailing non-alphanumeric characters.
pub fn extract_value(line: &str) -> Option<&str> {
    let (_, after_comma) = line.split_once(',')?;
    let (_, value) = after_comma.split_once('"')?;
    match value.find('"') {
        Some(end) => Some(&value[..end]),
        None => Some(value.trim_end_matches(|c: char| !c.is_ascii_alphanumeric())),
    }
}

/// Values collected from one `instance.cmd`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceFields {
    pub location: Option<String>,
    pub device: Option<String>,
    pub device_name: Option<String>,
}

impl InstanceFields {
    /// Collect the known keys; later lines override earlier ones
    pub fn parse<R: BufRead>(mut reader: R) -> std::io::Result<Self> {
        let mut fields = Self::default();
        let mut raw = Vec::new();
        loop {
            raw.clear();
            if reader.read_until(b'\n', &mut raw)? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&raw);
            fields.apply_line(&line);
        }
        Ok(fields)
    }

    pub fn apply_line(&mut self, line: &str) {
        let Some(key) = InstanceKey::from_line(line) else {
            return;
        };
        let Some(value) = extract_value(line) else {
            return;
        };
        debug!("found {}: '{}'", key.as_str(), value);
        let slot = match key {
            InstanceKey::Location => &mut self.location,
            InstanceKey::DeviceName => &mut self.device,
            InstanceKey::CameraName => &mut self.device_name,
        };
        *slot = Some(value.to_string());
    }

    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.location.is_none() {
            missing.push(InstanceKey::Location.as_str());
        }
        if self.device.is_none() {
            missing.push(InstanceKey::DeviceName.as_str());
        }
        if self.device_name.is_none() {
            missing.push(InstanceKey::CameraName.as_str());
        }
        missing
    }

    /// Build the descriptor, or `ConfigIncomplete` naming the absent keys
    pub fn into_descriptor(
        self,
        file: &Path,
        stage_path: &Path,
        instance_name: &str,
    ) -> Result<InstanceDescriptor> {
        match (self.location, self.device, self.device_name) {
            (Some(location), Some(device), Some(device_name)) => Ok(InstanceDescriptor::new(
                stage_path,
                instance_name,
                location,
                device,
                device_name,
            )),
            (location, device, device_name) => {
                let fields = InstanceFields {
                    location,
                    device,
                    device_name,
                };
                Err(Error::config_incomplete(file, fields.missing()))
            }
        }
    }
}

/// Parse `<instance_dir>/instance.cmd` into a descriptor
pub fn parse_instance_file(file: &Path, stage_path: &Path) -> Result<InstanceDescriptor> {
    let instance_name = file
        .parent()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Discovery(format!("no instance directory for {}", file.display())))?;

    let handle = File::open(file)
        .map_err(|e| Error::Discovery(format!("open {} failed: {}", file.display(), e)))?;
    let fields = InstanceFields::parse(BufReader::new(handle))
        .map_err(|e| Error::Discovery(format!("read {} failed: {}", file.display(), e)))?;

    fields.into_descriptor(file, stage_path, &instance_name)
}

// ============================================================================
// Directory walk
// ============================================================================

/// Depth in the discovery walk, named by the directory being listed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanLevel {
    Root,
    Stage,
    IocTree,
    Instance,
    NestedInstance,
}

/// What a level does with the directory it lists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    /// Only recurse
    No,
    /// Read `instance.cmd`; without one, recurse into subdirectories
    InstanceOrCategory,
    /// Read `instance.cmd`; never recurse
    Instance,
}

#[derive(Debug, Clone, Copy)]
struct LevelRule {
    descend: fn(&str) -> bool,
    next: Option<ScanLevel>,
    terminal: Terminal,
}

fn any_dir(_: &str) -> bool {
    true
}

fn ioc_dir(name: &str) -> bool {
    name.starts_with(IOC_DIR_PREFIX)
}

impl ScanLevel {
    fn rule(self) -> LevelRule {
        match self {
            ScanLevel::Root => LevelRule {
                descend: any_dir,
                next: Some(ScanLevel::Stage),
                terminal: Terminal::No,
            },
            ScanLevel::Stage => LevelRule {
                descend: ioc_dir,
                next: Some(ScanLevel::IocTree),
                terminal: Terminal::No,
            },
            ScanLevel::IocTree => LevelRule {
                descend: any_dir,
                next: Some(ScanLevel::Instance),
                terminal: Terminal::No,
            },
            ScanLevel::Instance => LevelRule {
                descend: any_dir,
                next: Some(ScanLevel::NestedInstance),
                terminal: Terminal::InstanceOrCategory,
            },
            ScanLevel::NestedInstance => LevelRule {
                descend: any_dir,
                next: None,
                terminal: Terminal::Instance,
            },
        }
    }

    /// Whether a subdirectory called `name` is entered from this level
    pub fn descends_into(self, name: &str) -> bool {
        let rule = self.rule();
        rule.next.is_some() && (rule.descend)(name)
    }
}

/// Result of one scan
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    /// Descriptors in discovery order
    pub descriptors: Vec<InstanceDescriptor>,
    /// `instance.cmd` files that produced no descriptor
    pub skipped: Vec<PathBuf>,
}

/// Walks a root directory for instance files
#[derive(Debug, Clone)]
pub struct Scanner {
    root: PathBuf,
}

impl Scanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scan(&self) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();
        if self.root.as_os_str().is_empty() {
            error!("empty top path");
            return outcome;
        }

        debug!("using top path {}", self.root.display());
        self.walk(&self.root, ScanLevel::Root, None, &mut outcome);
        info!(
            "found {} IOCs under {} ({} skipped)",
            outcome.descriptors.len(),
            self.root.display(),
            outcome.skipped.len()
        );
        outcome
    }

    fn walk(&self, dir: &Path, level: ScanLevel, stage: Option<&Path>, outcome: &mut ScanOutcome) {
        let stage = if level == ScanLevel::Stage { Some(dir) } else { stage };
        let rule = level.rule();

        let Some((dirs, files)) = list_dir(dir) else {
            return;
        };

        if rule.terminal != Terminal::No {
            if files.iter().any(|f| f.file_name().map_or(false, |n| n == INSTANCE_FILE)) {
                let file = dir.join(INSTANCE_FILE);
                match stage {
                    Some(stage) => self.add_instance(&file, stage, outcome),
                    None => outcome.skipped.push(file),
                }
                return;
            }
            if rule.terminal == Terminal::Instance {
                return;
            }
        }

        let Some(next) = rule.next else {
            return;
        };
        for sub in dirs {
            let name = sub.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            if (rule.descend)(&name) {
                self.walk(&sub, next, stage, outcome);
            } else {
                debug!("[{:?}] not entering {}", level, sub.display());
            }
        }
    }

    fn add_instance(&self, file: &Path, stage: &Path, outcome: &mut ScanOutcome) {
        match parse_instance_file(file, stage) {
            Ok(descriptor) => {
                debug!(
                    "IOC {} ({}) in stage {}",
                    descriptor.instance_name(),
                    descriptor.prefix(),
                    stage.display()
                );
                outcome.descriptors.push(descriptor);
            }
            Err(e) => {
                warn!("failed to add IOC from {}: {}", file.display(), e);
                outcome.skipped.push(file.to_path_buf());
            }
        }
    }
}

/// Discover every valid instance under `root`
pub fn discover(root: &Path) -> Vec<InstanceDescriptor> {
    Scanner::new(root).scan().descriptors
}

/// Subdirectories and files of `dir` in name order; `None` if unreadable
fn list_dir(dir: &Path) -> Option<(Vec<PathBuf>, Vec<PathBuf>)> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("skipping {}: {}", dir.display(), e);
            return None;
        }
    };

    let mut entries: Vec<_> = entries.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());

    let mut dirs = Vec::new();
    let mut files = Vec::new();
    for entry in entries {
        match entry.file_type() {
            Ok(t) if t.is_dir() => dirs.push(entry.path()),
            Ok(t) if t.is_file() => files.push(entry.path()),
            _ => {}
        }
    }
    Some((dirs, files))
}
