//! Test harness: in-memory collaborators, fixture worlds and the simulator

pub mod fixtures;
pub mod memory;
pub mod simulator;
pub mod world;

pub use fixtures::{imaging_definition, imaging_schema, ImagingClasses, ImagingWorld};
pub use memory::{InMemoryFiles, InMemoryStore};
pub use simulator::{run_simulator, SimulatorConfig, SimulatorReport};
pub use world::{LoadedWorld, WorldFile};

/// Runs simulations across several seeds
pub struct TestHarness;

impl TestHarness {
    /// Run `worlds` operations on worlds of up to `max_images` images
    #[must_use]
    pub fn run_stress_test(max_images: usize, worlds: u64) -> StressTestReport {
        tracing::info!(max_images, worlds, "stress test");
        let report = run_simulator(SimulatorConfig {
            seed: 12345,
            worlds,
            max_images,
            ..SimulatorConfig::default()
        });
        StressTestReport {
            max_images,
            worlds,
            violations: report.violations.len(),
            success: report.passed(),
        }
    }

    /// Run the default simulation over ten seeds
    #[must_use]
    pub fn run_certification() -> CertificationReport {
        let mut total_violations = 0;
        let mut all_passed = true;
        for seed in 0..10 {
            let report = run_simulator(SimulatorConfig {
                seed,
                ..SimulatorConfig::default()
            });
            all_passed &= report.passed();
            total_violations += report.violations.len();
        }
        CertificationReport {
            passed: all_passed && total_violations == 0,
            total_violations,
            seeds_tested: 10,
        }
    }
}

/// Report from a stress test
#[derive(Debug, Clone)]
pub struct StressTestReport {
    /// Largest world size
    pub max_images: usize,
    /// Operations run
    pub worlds: u64,
    /// Violations found
    pub violations: usize,
    /// Whether no invariant was broken
    pub success: bool,
}

/// Report from a multi-seed run
#[derive(Debug, Clone)]
pub struct CertificationReport {
    /// Whether every seed passed
    pub passed: bool,
    /// Violations across seeds
    pub total_violations: usize,
    /// Seeds run
    pub seeds_tested: u64,
}
