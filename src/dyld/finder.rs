//! Locating the installed cache for an architecture.
//!
//! Candidates are tried in a fixed order: every mount prefix, then every
//! install directory of the target OS, then every file-name suffix of the
//! architecture family from most to least specific. The first candidate
//! that opens and validates wins.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::file::FileSource;
use crate::error::{Error, Result};

/// Install locations relative to the system root, newest first.
const MACOS_CACHE_DIRS: &[&str] = &[
    // macOS Ventura+ (cryptex)
    "System/Volumes/Preboot/Cryptexes/OS/System/Library/dyld",
    "System/Cryptexes/OS/System/Library/dyld",
    "System/Library/dyld",
    "var/db/dyld",
];

const IOS_CACHE_DIRS: &[&str] = &[
    "private/preboot/Cryptexes/OS/System/Library/Caches/com.apple.dyld",
    "System/Library/Caches/com.apple.dyld",
];

const CACHE_FILE_PREFIX: &str = "dyld_shared_cache_";

/// Operating systems whose install layout the finder knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOs {
    /// macOS, including cryptex installs
    MacOs,
    /// iOS and the other embedded platforms
    Ios,
}

impl TargetOs {
    /// Parses an OS name such as `"macos"` or `"ios"`.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "macos" | "macosx" | "osx" | "darwin" => Ok(TargetOs::MacOs),
            "ios" | "ipados" | "tvos" | "watchos" | "visionos" => Ok(TargetOs::Ios),
            _ => Err(Error::UnsupportedOs(name.to_string())),
        }
    }

    /// The OS this binary runs on, if the finder knows its layout.
    pub fn host() -> Result<Self> {
        Self::parse(std::env::consts::OS)
    }

    fn cache_dirs(self) -> &'static [&'static str] {
        match self {
            TargetOs::MacOs => MACOS_CACHE_DIRS,
            TargetOs::Ios => IOS_CACHE_DIRS,
        }
    }
}

/// File-name suffixes to try for `arch`, in priority order.
pub fn arch_suffixes(arch: &str) -> Result<&'static [&'static str]> {
    match arch {
        "arm64e" | "arm64" | "arm64_32" => Ok(&["arm64e", "arm64", "arm64_32"]),
        "x86_64h" | "x86_64" => Ok(&["x86_64h", "x86_64"]),
        _ => Err(Error::UnsupportedArchitecture(arch.to_string())),
    }
}

/// Finds the cache file for an architecture.
#[derive(Debug, Clone)]
pub struct Finder {
    arch: String,
    os: TargetOs,
    prefixes: Vec<PathBuf>,
}

impl Finder {
    /// Creates a finder searching the root file system.
    pub fn new(arch: impl Into<String>, os: TargetOs) -> Self {
        Self {
            arch: arch.into(),
            os,
            prefixes: vec![PathBuf::from("/")],
        }
    }

    /// Replaces the mount prefixes searched, e.g. with a mounted disk image.
    pub fn with_prefixes<I, P>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.prefixes = prefixes.into_iter().map(|p| p.as_ref().to_path_buf()).collect();
        self
    }

    /// Every path that [`Finder::find`] would try, in order.
    pub fn candidates(&self) -> Result<Vec<PathBuf>> {
        let suffixes = arch_suffixes(&self.arch)?;
        let mut out = Vec::new();
        for prefix in &self.prefixes {
            for dir in self.os.cache_dirs() {
                for suffix in suffixes {
                    out.push(prefix.join(dir).join(format!("{CACHE_FILE_PREFIX}{suffix}")));
                }
            }
        }
        Ok(out)
    }

    /// Opens the first candidate that is a valid cache.
    ///
    /// Every candidate that fails to open or validate is skipped, whatever
    /// the error. Only an exhausted search is reported.
    pub fn find(&self) -> Result<FileSource> {
        let candidates = self.candidates()?;
        for path in &candidates {
            match FileSource::open(path) {
                Ok(source) => {
                    info!(path = %path.display(), "found cache");
                    return Ok(source);
                }
                Err(e) => debug!(path = %path.display(), error = %e, "candidate rejected"),
            }
        }
        Err(Error::NoCacheFound {
            arch: self.arch.clone(),
            tried: candidates.len(),
        })
    }
}
