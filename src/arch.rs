//! Host architecture naming and synonym canonicalization
//!
//! The exchange names architectures the Go way (`amd64`, `arm64`, `arm`),
//! while nodes and users frequently use kernel names (`x86_64`, `aarch64`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Architecture of this host, in exchange naming.
pub fn host_arch() -> String {
    exchange_name(std::env::consts::ARCH).to_string()
}

fn exchange_name(rust_arch: &str) -> &str {
    match rust_arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

/// Synonym table mapping alternate architecture names to their canonical name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchSynonyms(BTreeMap<String, String>);

impl Default for ArchSynonyms {
    fn default() -> Self {
        let pairs = [
            ("x86_64", "amd64"),
            ("aarch64", "arm64"),
            ("armhf", "arm"),
            ("armv7l", "arm"),
            ("i386", "386"),
            ("ppc64el", "ppc64le"),
        ];
        Self(
            pairs
                .into_iter()
                .map(|(synonym, canonical)| (synonym.to_string(), canonical.to_string()))
                .collect(),
        )
    }
}

impl ArchSynonyms {
    pub fn new(table: BTreeMap<String, String>) -> Self {
        Self(table)
    }

    /// Canonical name for `arch`; names without a synonym entry are returned as is.
    pub fn canonical<'a>(&'a self, arch: &'a str) -> &'a str {
        self.0.get(arch).map(String::as_str).unwrap_or(arch)
    }

    /// True when `arch` names the host architecture directly or through a synonym.
    pub fn runs_on(&self, arch: &str, host: &str) -> bool {
        arch == host || self.canonical(arch) == host
    }
}
