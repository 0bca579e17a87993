//! Instance registry - the ordered set of discovered instances
//!
//! Insertion order is discovery order and stays stable for index-based
//! front ends until the next `clear()` or `rescan()`.

use crate::discovery::Scanner;
use crate::instance::ProcessInstance;
use crate::stream::StreamKind;
use ioc_foundation::{Error, LaunchConfig, LauncherConfig, Result, StreamConfig};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Summary of one `tick()`
#[derive(Debug, Default)]
pub struct TickReport {
    /// Live instances drained
    pub drained: usize,
    /// Lines completed across all instances
    pub lines: usize,
    /// Indices stopped because their child hung up
    pub stopped: Vec<usize>,
    /// Drain or stop failures other than hang-up, by index
    pub errors: Vec<(usize, Error)>,
}

/// Owns every discovered `ProcessInstance`
#[derive(Debug)]
pub struct InstanceRegistry {
    instances: Vec<ProcessInstance>,
    root: PathBuf,
    launch: LaunchConfig,
    stream: StreamConfig,
}

impl InstanceRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            instances: Vec::new(),
            root: root.into(),
            launch: LaunchConfig::default(),
            stream: StreamConfig::default(),
        }
    }

    pub fn with_config(config: &LauncherConfig) -> Self {
        Self {
            instances: Vec::new(),
            root: config.root.clone(),
            launch: config.launch.clone(),
            stream: config.stream.clone(),
        }
    }

    pub fn with_launch(mut self, launch: LaunchConfig) -> Self {
        self.launch = launch;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn set_root(&mut self, root: impl Into<PathBuf>) {
        self.root = root.into();
    }

    /// Discover instances under `path` and append them as dormant instances
    ///
    /// Returns the resulting instance count.
    pub fn populate(&mut self, path: &Path) -> usize {
        let outcome = Scanner::new(path).scan();
        for descriptor in outcome.descriptors {
            self.instances.push(ProcessInstance::new(
                descriptor,
                self.launch.clone(),
                &self.stream,
            ));
        }
        debug!("nr IOCs {}", self.count());
        self.count()
    }

    /// Drop every instance
    ///
    /// Live children are not stopped: their processes keep running after
    /// their entries are gone.
    // TODO: decide whether clear()/rescan() should stop live instances first;
    // today a rescan orphans any started IOC until the launcher exits.
    pub fn clear(&mut self) {
        let live = self.live_count();
        if live > 0 {
            warn!("clearing {} IOCs while {} are still running", self.count(), live);
        }
        debug!("have {} IOCs", self.count());
        self.instances.clear();
    }

    /// `clear()` then `populate()` from the configured root
    pub fn rescan(&mut self) -> usize {
        self.clear();
        let root = self.root.clone();
        let count = self.populate(&root);
        info!("rescan of {} found {} IOCs", root.display(), count);
        count
    }

    pub fn count(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.instances.iter().filter(|i| i.is_started()).count()
    }

    pub fn get(&self, index: usize) -> Option<&ProcessInstance> {
        self.instances.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut ProcessInstance> {
        self.instances.get_mut(index)
    }

    /// `NotFound` for an index past the end
    pub fn instance_mut(&mut self, index: usize) -> Result<&mut ProcessInstance> {
        let count = self.count();
        self.instances
            .get_mut(index)
            .ok_or_else(|| Error::NotFound(format!("IOC #{} (have {})", index, count)))
    }

    /// Index of the instance with this instance name or device name
    pub fn find(&self, name: &str) -> Option<usize> {
        self.instances
            .iter()
            .position(|i| i.name() == name || i.descriptor().device_name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessInstance> {
        self.instances.iter()
    }

    /// Drain every live instance once, stopping those whose child hung up
    pub fn tick(&mut self) -> TickReport {
        self.tick_with(|_, _, _, _| {})
    }

    /// `tick()`, calling `on_line(index, instance, stream, line)` for every
    /// newly completed line before any hung-up instance is stopped
    pub fn tick_with<F>(&mut self, mut on_line: F) -> TickReport
    where
        F: FnMut(usize, &ProcessInstance, StreamKind, &str),
    {
        let mut report = TickReport::default();

        for (index, instance) in self.instances.iter_mut().enumerate() {
            if !instance.is_started() {
                continue;
            }
            report.drained += 1;

            let before_out = instance.stdout().line_count();
            let before_err = instance.stderr().line_count();
            let result = instance.drain();

            for (kind, before) in [(StreamKind::Stderr, before_err), (StreamKind::Stdout, before_out)] {
                let buffer = instance.stream(kind);
                let new = buffer.line_count().saturating_sub(before);
                report.lines += new;
                for line in buffer.tail(new) {
                    on_line(index, instance, kind, line);
                }
            }

            match result {
                Ok(_) => {}
                Err(e) if e.is_hangup() => {
                    // child has closed both pipes and everything was read
                    if let Err(stop_err) = instance.stop() {
                        report.errors.push((index, stop_err));
                    }
                    report.stopped.push(index);
                }
                Err(e) => report.errors.push((index, e)),
            }
        }

        report
    }

    /// Stop every live instance, collecting failures
    pub fn stop_all(&mut self) -> Vec<(usize, Error)> {
        let mut errors = Vec::new();
        for (index, instance) in self.instances.iter_mut().enumerate() {
            if let Err(e) = instance.stop() {
                errors.push((index, e));
            }
        }
        errors
    }
}
