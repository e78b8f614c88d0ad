//! Host vector-ISA detection and the kernel algorithm catalogue.
//!
//! The kernel is compiled with `-march=native`, so what matters is the
//! instruction set the *host* supports. Detection reads the same sources the
//! OS exposes (`/proc/cpuinfo` on Linux, `sysctl` on macOS) and picks the
//! highest-priority feature present.

use std::cmp::Ordering;
use std::fmt;
use std::process::Command;
use std::str::FromStr;

use tracing::{debug, warn};

use crate::error::{invalid_config, TuneError};

/// Kernel algorithm families, in the order the kernel declares them.
const BASE_FAMILIES: [&str; 3] = ["simple", "transpose", "simd_manual"];
const AVX256_FAMILY: &str = "avx256";
const AVX512_FAMILY: &str = "avx512";

/// Widest vector instruction set usable by the kernel on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimdTier {
    Avx512,
    Avx256,
    /// No AVX: only the portable hand-vectorised path.
    Manual,
}

impl SimdTier {
    /// Doubles processed per vector step, which is also the block-size granule.
    pub fn lane_width(&self) -> u32 {
        match self {
            SimdTier::Avx512 => 8,
            SimdTier::Avx256 => 4,
            SimdTier::Manual => 8,
        }
    }

    /// Algorithm families the kernel can run on this tier.
    pub fn families(&self) -> Vec<&'static str> {
        let mut families = BASE_FAMILIES.to_vec();
        match self {
            SimdTier::Avx512 => {
                families.push(AVX256_FAMILY);
                families.push(AVX512_FAMILY);
            }
            SimdTier::Avx256 => families.push(AVX256_FAMILY),
            SimdTier::Manual => {}
        }
        families
    }

    /// Unrolled variants, scored by the unroll search.
    pub fn unroll_algorithms(&self) -> Vec<String> {
        self.with_suffix("_unroll")
    }

    /// Unrolled and blocked variants, scored by the block-size search.
    pub fn blocking_algorithms(&self) -> Vec<String> {
        self.with_suffix("_unroll_blocking")
    }

    /// Every serial variant, used by the final sweep.
    pub fn report_algorithms(&self) -> Vec<String> {
        let mut algorithms = self.with_suffix("");
        algorithms.extend(self.unroll_algorithms());
        algorithms.extend(self.blocking_algorithms());
        algorithms
    }

    fn with_suffix(&self, suffix: &str) -> Vec<String> {
        self.families()
            .into_iter()
            .map(|family| format!("{family}{suffix}"))
            .collect()
    }
}

impl fmt::Display for SimdTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SimdTier::Avx512 => "avx512",
            SimdTier::Avx256 => "avx256",
            SimdTier::Manual => "manual",
        };
        f.write_str(name)
    }
}

impl FromStr for SimdTier {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "avx512" => Ok(SimdTier::Avx512),
            "avx256" | "avx2" => Ok(SimdTier::Avx256),
            "manual" | "fallback" => Ok(SimdTier::Manual),
            other => Err(invalid_config(format!("unknown SIMD tier '{other}'"))),
        }
    }
}

// CPU features we want to detect
#[derive(PartialEq, Eq, Debug)]
struct CpuFeature {
    name: &'static str,
    tier: SimdTier,
    detected: bool,
}

impl CpuFeature {
    // Lowest number == highest priority
    fn priority(&self) -> usize {
        match self.tier {
            SimdTier::Avx512 => 0,
            SimdTier::Avx256 => 1,
            SimdTier::Manual => usize::MAX,
        }
    }

    fn features() -> Vec<CpuFeature> {
        vec![
            CpuFeature {
                name: "avx2",
                tier: SimdTier::Avx256,
                detected: false,
            },
            CpuFeature {
                name: "avx512f",
                tier: SimdTier::Avx512,
                detected: false,
            },
        ]
    }
}

impl Ord for CpuFeature {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority().cmp(&other.priority())
    }
}

impl PartialOrd for CpuFeature {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

trait CpuFeatureDetector {
    fn detect_features(&self, features: &mut [CpuFeature]);
    fn is_applicable(&self) -> bool;
}

struct LinuxDetector;
impl CpuFeatureDetector for LinuxDetector {
    fn detect_features(&self, features: &mut [CpuFeature]) {
        if let Ok(cpuinfo) = std::fs::read_to_string("/proc/cpuinfo") {
            mark_cpuinfo_flags(&cpuinfo, features);
        }
    }

    fn is_applicable(&self) -> bool {
        cfg!(target_os = "linux")
    }
}

struct MacOSDetector;
impl CpuFeatureDetector for MacOSDetector {
    fn detect_features(&self, features: &mut [CpuFeature]) {
        let output = Command::new("sysctl").args(["-a"]).output();

        if let Ok(output) = output {
            let contents = String::from_utf8_lossy(&output.stdout).to_lowercase();

            for feature in features.iter_mut() {
                match feature.name {
                    "avx512f" => feature.detected = contents.contains("hw.optional.avx512f: 1"),
                    "avx2" => feature.detected = contents.contains("hw.optional.avx2_0: 1"),
                    _ => {}
                }
            }
        }
    }

    fn is_applicable(&self) -> bool {
        cfg!(target_os = "macos")
    }
}

/// Marks features listed on any `flags` line of a `/proc/cpuinfo` dump.
fn mark_cpuinfo_flags(cpuinfo: &str, features: &mut [CpuFeature]) {
    let flags: Vec<&str> = cpuinfo
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            (key.trim() == "flags").then_some(value)
        })
        .flat_map(str::split_whitespace)
        .collect();

    for feature in features.iter_mut() {
        feature.detected = flags.contains(&feature.name);
    }
}

fn highest_tier(features: &mut [CpuFeature]) -> SimdTier {
    features.sort();
    features
        .iter()
        .find(|feature| feature.detected)
        .map(|feature| feature.tier)
        .unwrap_or(SimdTier::Manual)
}

/// Detects the widest SIMD tier on this host, falling back to [`SimdTier::Manual`].
pub fn detect() -> SimdTier {
    let detectors: Vec<Box<dyn CpuFeatureDetector>> =
        vec![Box::new(LinuxDetector), Box::new(MacOSDetector)];

    let mut features = CpuFeature::features();
    match detectors.iter().find(|d| d.is_applicable()) {
        Some(detector) => detector.detect_features(&mut features),
        None => warn!("no CPU feature source on this platform, assuming no AVX"),
    }

    let tier = highest_tier(&mut features);
    debug!(%tier, lanes = tier.lane_width(), "detected SIMD tier");
    tier
}
