//! Policy file persistence
//!
//! Documents live at `<policy_path>/<org>/<file>.policy`, one per service.
//! Names that are not already safe path components are sanitized and
//! suffixed with a digest of the original, so distinct services never share
//! a file.

use std::fs;
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{PolicyDocument, PolicyError};

const POLICY_EXTENSION: &str = "policy";

/// Hex digits of the digest kept in a file name.
const DIGEST_LEN: usize = 16;

pub struct PolicyWriter {
    root: PathBuf,
}

impl PolicyWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Location of the document for service `(url, org)`.
    pub fn path_for(&self, org: &str, url: &str) -> PathBuf {
        self.root
            .join(file_component(org))
            .join(format!("{}.{}", file_component(url), POLICY_EXTENSION))
    }

    /// Replace the stored document for the policy's service.
    pub fn write(&self, doc: &PolicyDocument) -> Result<PathBuf, PolicyError> {
        let path = self.path_for(&doc.service.org, &doc.service.url);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        // Write then rename so readers never see a partial document
        let tmp = path.with_extension("policy.tmp");
        fs::write(&tmp, doc.to_json()?)?;
        fs::rename(&tmp, &path)?;

        info!(path = %path.display(), name = %doc.name, "Wrote policy");
        Ok(path)
    }

    /// Delete the document for `(url, org)`. Returns whether one existed.
    pub fn remove(&self, org: &str, url: &str) -> Result<bool, PolicyError> {
        let path = self.path_for(org, url);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "Removed policy");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every stored document, ordered by org then file name.
    pub fn list(&self) -> Result<Vec<PolicyDocument>, PolicyError> {
        let mut docs = Vec::new();
        if !self.root.exists() {
            return Ok(docs);
        }

        let mut org_dirs: Vec<PathBuf> = fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_dir())
            .collect();
        org_dirs.sort();

        for dir in org_dirs {
            let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.extension().is_some_and(|ext| ext == POLICY_EXTENSION))
                .collect();
            files.sort();

            for file in files {
                let bytes = fs::read(&file)?;
                docs.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(docs)
    }
}

/// Map an org or url to a single safe path component.
///
/// Safe names are used as is; anything else becomes a readable stem plus a
/// digest of the raw name.
fn file_component(raw: &str) -> String {
    let trimmed = raw
        .strip_prefix("https://")
        .or_else(|| raw.strip_prefix("http://"))
        .unwrap_or(raw);
    let cleaned: String = trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stem = cleaned.trim_matches(|c| c == '_' || c == '.');
    if stem == raw {
        return stem.to_string();
    }

    let digest = format!("{:x}", Sha256::digest(raw.as_bytes()));
    if stem.is_empty() {
        digest[..DIGEST_LEN].to_string()
    } else {
        format!("{}-{}", stem, &digest[..DIGEST_LEN])
    }
}
