use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PipelineError;

/// Where a patch comes from. Remote sources are patch-tracker URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PatchSource {
    Remote(String),
    Local(PathBuf),
}

impl PatchSource {
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            Self::Remote(trimmed.to_string())
        } else {
            Self::Local(PathBuf::from(trimmed))
        }
    }

    /// Stable identifier written to state and hashed into the UID.
    pub fn id(&self) -> String {
        match self {
            Self::Remote(url) => url.clone(),
            Self::Local(path) => path.to_string_lossy().to_string(),
        }
    }
}

impl fmt::Display for PatchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UidKind {
    Baseline,
    Patched,
}

/// Identity of a (base, commit, patch series) combination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uid {
    pub kind: UidKind,
    pub digest: String,
}

impl Uid {
    /// Order-sensitive digest over the base repository, the resolved base
    /// commit and the patch identifiers. Every field is length-prefixed so
    /// that no two different inputs share a byte stream.
    pub fn compute(base_repo: &str, commit: &str, patches: &[String]) -> Self {
        let mut hasher = Sha256::new();
        let mut feed = |part: &str| {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        };
        feed(base_repo);
        feed(commit);
        for patch in patches {
            feed(patch);
        }
        let full = format!("{:x}", hasher.finalize());

        Self {
            kind: if patches.is_empty() {
                UidKind::Baseline
            } else {
                UidKind::Patched
            },
            digest: full[..16].to_string(),
        }
    }

    pub fn is_baseline(&self) -> bool {
        self.kind == UidKind::Baseline
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.kind {
            UidKind::Baseline => "baseline",
            UidKind::Patched => "patched",
        };
        write!(f, "{prefix}-{}", self.digest)
    }
}

impl FromStr for Uid {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, digest) = s
            .split_once('-')
            .ok_or_else(|| PipelineError::Config(format!("malformed uid '{s}'")))?;
        let kind = match prefix {
            "baseline" => UidKind::Baseline,
            "patched" => UidKind::Patched,
            other => {
                return Err(PipelineError::Config(format!(
                    "unknown uid kind '{other}' in '{s}'"
                )));
            }
        };
        if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PipelineError::Config(format!("malformed uid digest in '{s}'")));
        }
        Ok(Self {
            kind,
            digest: digest.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patches(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn uid_is_reproducible() {
        let a = Uid::compute("git://repo", "abc", &patches(&["p1", "p2"]));
        let b = Uid::compute("git://repo", "abc", &patches(&["p1", "p2"]));
        assert_eq!(a, b);
        assert_eq!(a.kind, UidKind::Patched);
    }

    #[test]
    fn uid_depends_on_order_and_membership() {
        let base = Uid::compute("git://repo", "abc", &patches(&["p1", "p2"]));
        let swapped = Uid::compute("git://repo", "abc", &patches(&["p2", "p1"]));
        let extra = Uid::compute("git://repo", "abc", &patches(&["p1", "p2", "p3"]));
        assert_ne!(base, swapped);
        assert_ne!(base, extra);
    }

    #[test]
    fn field_boundaries_are_not_ambiguous() {
        let a = Uid::compute("repo", "ab", &patches(&["c"]));
        let b = Uid::compute("repo", "a", &patches(&["bc"]));
        assert_ne!(a, b);
    }

    #[test]
    fn no_patches_is_baseline() {
        let uid = Uid::compute("git://repo", "abc", &[]);
        assert!(uid.is_baseline());
        assert!(uid.to_string().starts_with("baseline-"));
        let parsed: Uid = uid.to_string().parse().unwrap();
        assert_eq!(parsed, uid);
    }

    #[test]
    fn patch_source_detects_urls() {
        assert_eq!(
            PatchSource::parse("https://patchwork.example.org/patch/1/"),
            PatchSource::Remote("https://patchwork.example.org/patch/1/".into())
        );
        assert_eq!(
            PatchSource::parse("fix.patch"),
            PatchSource::Local(PathBuf::from("fix.patch"))
        );
    }
}
