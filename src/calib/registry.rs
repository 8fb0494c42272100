//! Catalog of runnable calibration tests, keyed by name for the CLI.

use crate::calib::throughput::ThroughputTest;
use crate::calib::CalibrationTest;
use crate::config::Config;

type BuildFn = fn(&Config) -> Box<dyn CalibrationTest>;

#[derive(Clone, Copy)]
pub struct TestEntry {
    pub name: &'static str,
    pub description: &'static str,
    pub build: BuildFn,
}

static CATALOG: [TestEntry; 1] = [TestEntry {
    name: "throughput",
    description: "Maximum forwarding throughput within the tolerated packet loss",
    build: |cfg| Box::new(ThroughputTest::new(cfg.clone())),
}];

pub fn catalog() -> &'static [TestEntry] {
    &CATALOG
}

pub fn find(name: &str) -> Option<TestEntry> {
    catalog().iter().find(|e| e.name == name).copied()
}
