//! SIMD capability probe.
//!
//! Decides whether the fast vectorized inference path should be enabled.
//! The answer is advisory: it feeds [`SessionConfig`](crate::session::SessionConfig)
//! and never affects correctness, so the probe never fails. Any detection
//! error yields `false`.
//!
//! Precedence:
//! 1. a CPU feature validator for the target, when one exists;
//! 2. the platform quirk table (`contrib/simd/*.toml`, embedded at compile time);
//! 3. `true`.

use serde::Deserialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::OnceLock;
use thiserror::Error;

/// Compile-time embedded platform quirks.
const SIMD_QUIRKS: &str = include_str!("../../../contrib/simd/quirks.toml");

/// Set to anything but `0` to force the scalar path.
pub const DISABLE_SIMD_ENV: &str = "FACEMATCH_DISABLE_SIMD";

static QUIRK_DB: OnceLock<Vec<PlatformQuirk>> = OnceLock::new();
static SIMD_SUPPORTED: OnceLock<bool> = OnceLock::new();

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("feature detection failed: {0}")]
    Detection(String),
}

/// Checks whether the instruction-set extension behind the fast path is usable.
pub trait InstructionValidator {
    fn validate(&self) -> Result<bool, ProbeError>;
}

/// Runtime CPU feature detection: SSE4.1 on x86, NEON on aarch64.
#[derive(Debug, Clone, Copy)]
pub struct CpuFeatureValidator;

impl CpuFeatureValidator {
    /// `None` when this target has no way to check.
    pub fn for_target() -> Option<Self> {
        detect_simd().map(|_| Self)
    }
}

impl InstructionValidator for CpuFeatureValidator {
    fn validate(&self) -> Result<bool, ProbeError> {
        detect_simd().ok_or_else(|| {
            ProbeError::Detection(format!("no feature check for {}", std::env::consts::ARCH))
        })
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn detect_simd() -> Option<bool> {
    Some(std::arch::is_x86_feature_detected!("sse4.1"))
}

#[cfg(target_arch = "aarch64")]
fn detect_simd() -> Option<bool> {
    Some(std::arch::is_aarch64_feature_detected!("neon"))
}

#[cfg(all(target_arch = "wasm32", target_feature = "simd128"))]
fn detect_simd() -> Option<bool> {
    Some(true)
}

#[cfg(not(any(
    target_arch = "x86",
    target_arch = "x86_64",
    target_arch = "aarch64",
    all(target_arch = "wasm32", target_feature = "simd128")
)))]
fn detect_simd() -> Option<bool> {
    None
}

/// Environment identification used by the quirk fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformIdent {
    pub os: String,
    pub arch: String,
    /// `unix`, `windows`, or empty (e.g. bare wasm32).
    pub family: String,
}

impl PlatformIdent {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            family: std::env::consts::FAMILY.to_string(),
        }
    }
}

/// One `[[platform]]` entry of a quirk file.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformQuirk {
    #[serde(default = "any")]
    pub os: String,
    #[serde(default = "any")]
    pub arch: String,
    #[serde(default = "any")]
    pub family: String,
    pub reason: String,
}

fn any() -> String {
    "*".to_string()
}

impl PlatformQuirk {
    pub fn matches(&self, platform: &PlatformIdent) -> bool {
        let field = |pattern: &str, value: &str| pattern == "*" || pattern == value;
        field(&self.os, &platform.os)
            && field(&self.arch, &platform.arch)
            && field(&self.family, &platform.family)
    }
}

#[derive(Debug, Deserialize)]
struct QuirkFile {
    #[serde(default)]
    platform: Vec<PlatformQuirk>,
}

/// Parse a quirk file.
pub fn parse_quirks(src: &str) -> Result<Vec<PlatformQuirk>, toml::de::Error> {
    Ok(toml::from_str::<QuirkFile>(src)?.platform)
}

/// The embedded quirk table.
pub fn quirk_db() -> &'static [PlatformQuirk] {
    QUIRK_DB.get_or_init(|| match parse_quirks(SIMD_QUIRKS) {
        Ok(q) => q,
        Err(e) => {
            tracing::warn!(error = %e, "bad SIMD quirk TOML; ignoring quirk table");
            Vec::new()
        }
    })
}

/// Run the detection policy against explicit inputs.
pub fn probe_with(
    validator: Option<&dyn InstructionValidator>,
    platform: &PlatformIdent,
    quirks: &[PlatformQuirk],
) -> bool {
    if let Some(v) = validator {
        // A panicking validator counts as a detection error.
        return match panic::catch_unwind(AssertUnwindSafe(|| v.validate())) {
            Ok(Ok(supported)) => supported,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "SIMD detection failed; disabling fast path");
                false
            }
            Err(_) => {
                tracing::warn!("SIMD validator panicked; disabling fast path");
                false
            }
        };
    }

    if let Some(q) = quirks.iter().find(|q| q.matches(platform)) {
        tracing::info!(os = %platform.os, arch = %platform.arch, reason = %q.reason, "SIMD disabled by platform quirk");
        return false;
    }

    true
}

/// Probe the running process. Uncached; see [`simd_supported`].
pub fn probe() -> bool {
    if std::env::var(DISABLE_SIMD_ENV).is_ok_and(|v| v != "0") {
        tracing::info!("SIMD disabled via {DISABLE_SIMD_ENV}");
        return false;
    }

    let validator = CpuFeatureValidator::for_target();
    let supported = probe_with(
        validator.as_ref().map(|v| v as &dyn InstructionValidator),
        &PlatformIdent::current(),
        quirk_db(),
    );
    tracing::debug!(supported, "SIMD capability probed");
    supported
}

/// [`probe`], computed once per process.
pub fn simd_supported() -> bool {
    *SIMD_SUPPORTED.get_or_init(probe)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Result<bool, &'static str>);

    impl InstructionValidator for Fixed {
        fn validate(&self) -> Result<bool, ProbeError> {
            self.0.map_err(|e| ProbeError::Detection(e.into()))
        }
    }

    struct Panics;

    impl InstructionValidator for Panics {
        fn validate(&self) -> Result<bool, ProbeError> {
            panic!("validator blew up")
        }
    }

    fn platform(os: &str, arch: &str) -> PlatformIdent {
        PlatformIdent {
            os: os.into(),
            arch: arch.into(),
            family: "unix".into(),
        }
    }

    #[test]
    fn test_embedded_quirks_parse() {
        let quirks = parse_quirks(SIMD_QUIRKS).unwrap();
        assert!(!quirks.is_empty());
        assert_eq!(quirk_db().len(), quirks.len());
    }

    #[test]
    fn test_validator_verdict_wins() {
        let quirks = quirk_db();
        let arm = platform("linux", "arm");
        assert!(probe_with(Some(&Fixed(Ok(true))), &arm, quirks));
        assert!(!probe_with(Some(&Fixed(Ok(false))), &platform("linux", "x86_64"), quirks));
    }

    #[test]
    fn test_validator_error_is_false() {
        assert!(!probe_with(Some(&Fixed(Err("boom"))), &platform("linux", "x86_64"), &[]));
        assert!(!probe_with(Some(&Panics), &platform("linux", "x86_64"), &[]));
    }

    #[test]
    fn test_quirk_forces_false_without_validator() {
        assert!(!probe_with(None, &platform("linux", "arm"), quirk_db()));
        assert!(!probe_with(None, &platform("unknown", "wasm32"), quirk_db()));
    }

    #[test]
    fn test_default_is_optimistic() {
        assert!(probe_with(None, &platform("linux", "riscv64"), quirk_db()));
        assert!(probe_with(None, &platform("linux", "arm"), &[]));
    }

    #[test]
    fn test_wildcard_matching() {
        let q = PlatformQuirk {
            os: "*".into(),
            arch: "mips".into(),
            family: "*".into(),
            reason: "test".into(),
        };
        assert!(q.matches(&platform("linux", "mips")));
        assert!(q.matches(&platform("freebsd", "mips")));
        assert!(!q.matches(&platform("linux", "mips64")));
    }

    #[test]
    fn test_family_matching() {
        let quirks = parse_quirks(
            r#"
            [[platform]]
            family = "windows"
            arch = "aarch64"
            reason = "test"
            "#,
        )
        .unwrap();
        assert_eq!(quirks[0].os, "*");

        let mut arm_windows = platform("windows", "aarch64");
        arm_windows.family = "windows".into();
        assert!(!probe_with(None, &arm_windows, &quirks));
        assert!(probe_with(None, &platform("linux", "aarch64"), &quirks));
    }

    #[test]
    fn test_current_platform_has_family() {
        let current = PlatformIdent::current();
        assert_eq!(current.family, std::env::consts::FAMILY);
        assert_eq!(current.os, std::env::consts::OS);
    }

    #[test]
    fn test_missing_platform_table() {
        assert!(parse_quirks("").unwrap().is_empty());
        assert!(parse_quirks("[[platform]]\nos = 1").is_err());
    }
}
