//! Platform detection
//!
//! Provides OS and architecture information using standard Unix conventions:
//! - macOS → `"darwin"` (kernel name)
//! - Linux → `"linux"`
//! - Windows → `"windows"`
//!
//! Platform info is cached on first access.

use std::sync::LazyLock;

/// Current platform information (cached)
///
/// # Example
/// ```
/// use tether_core::platform::CURRENT_PLATFORM;
///
/// println!("running on {}/{}", CURRENT_PLATFORM.os, CURRENT_PLATFORM.arch);
/// ```
pub static CURRENT_PLATFORM: LazyLock<Platform> = LazyLock::new(Platform::detect);

/// Platform information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    /// OS: "darwin" (macOS), "linux", "windows", "unknown"
    pub os: &'static str,
    /// CPU architecture: "`x86_64`", "aarch64", etc.
    pub arch: &'static str,
}

impl Platform {
    pub fn detect() -> Self {
        Self {
            os: Self::detect_os(),
            arch: std::env::consts::ARCH,
        }
    }

    /// Windows hosts never ship a usable `sed`, so probing is skipped there
    #[must_use]
    pub fn is_windows(&self) -> bool {
        self.os == "windows"
    }

    /// File name of a native executable on this platform
    #[must_use]
    pub fn executable_name(&self, stem: &str) -> String {
        if self.is_windows() {
            format!("{stem}.exe")
        } else {
            stem.to_string()
        }
    }

    const fn detect_os() -> &'static str {
        #[cfg(target_os = "macos")]
        {
            "darwin"
        }

        #[cfg(target_os = "linux")]
        {
            "linux"
        }

        #[cfg(target_os = "windows")]
        {
            "windows"
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            "unknown"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executable_name() {
        let windows = Platform {
            os: "windows",
            arch: "x86_64",
        };
        let linux = Platform {
            os: "linux",
            arch: "x86_64",
        };
        assert_eq!(windows.executable_name("tether-replace"), "tether-replace.exe");
        assert_eq!(linux.executable_name("tether-replace"), "tether-replace");
    }

    #[test]
    fn test_current_platform_is_known() {
        assert!(!CURRENT_PLATFORM.arch.is_empty());
    }
}
