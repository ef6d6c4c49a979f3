//! Extraction and rewriting of the pinned image line in CI configuration.
//!
//! The configuration is never parsed as YAML. It is treated as a line-oriented
//! patch target: a line of the form
//!
//! ```text
//!     - image: <repository>:<tag>[@sha256:<hex>]
//! ```
//!
//! (any leading indentation) names the image. The first such line is the
//! canonical reference used to drive an update; patching appends or replaces
//! the `@digest` suffix and leaves every other byte untouched.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use thiserror::Error;

/// Default repository pattern: two path segments, e.g. `myorg/app`.
pub const DEFAULT_REPOSITORY_PATTERN: &str = r"\w+/\w+";

const TAG_PATTERN: &str = r"[0-9A-Za-z_.-]+";
const DIGEST_PATTERN: &str = r"sha256:[0-9a-f]+";

static DIGEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!("^{}$", DIGEST_PATTERN)).expect("static digest regex"));

static DEFAULT_IMAGE_PATTERN: LazyLock<ImagePattern> = LazyLock::new(|| {
    ImagePattern::new(DEFAULT_REPOSITORY_PATTERN).expect("default repository pattern compiles")
});

/// Errors raised while locating the image line.
#[derive(Debug, Error)]
pub enum ParseError {
    /// No line matched `- image: <repository>:<tag>`
    #[error("no `- image: <repository>:<tag>` line matching repository pattern `{0}`")]
    NotFound(String),

    /// The configured repository pattern is not a valid regular expression
    #[error("invalid repository pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Check whether a string is a well-formed `sha256:<hex>` digest.
pub fn is_valid_digest(digest: &str) -> bool {
    DIGEST_RE.is_match(digest)
}

/// At most 8 hex characters following `sha256:`, used in branch names,
/// commit messages and pull request titles.
pub fn short_digest(digest: &str) -> &str {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    hex.get(..8).unwrap_or(hex)
}

/// Which image lines [`ConfigDocument::patch`] rewrites.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchScope {
    /// Only lines naming the same `repository:tag` as the canonical line
    #[default]
    #[serde(rename = "canonical")]
    Canonical,
    /// Every line matching the repository pattern, whatever image it names
    #[serde(rename = "all")]
    AllMatching,
}

impl PatchScope {
    /// Parse from string, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "canonical" => Some(PatchScope::Canonical),
            "all" | "all-matching" => Some(PatchScope::AllMatching),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PatchScope::Canonical => "canonical",
            PatchScope::AllMatching => "all",
        }
    }
}

impl std::fmt::Display for PatchScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A pinned image reference found in configuration text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageReference {
    /// Registry repository, e.g. `myorg/app`
    pub repository: String,
    /// Image tag, e.g. `1.0`
    pub tag: String,
    /// Pinned digest, if the line carries one
    pub digest: Option<String>,
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)?;
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// Compiled matcher for image lines with a given repository pattern.
#[derive(Debug, Clone)]
pub struct ImagePattern {
    repository_pattern: String,
    line: Regex,
}

impl ImagePattern {
    /// Compile the line matcher around a repository pattern.
    pub fn new(repository_pattern: &str) -> Result<Self, ParseError> {
        // `R` makes `$` stop before `\r\n` as well as `\n`
        let source = format!(
            r"(?mR)^(?P<head>[ \t]*- image: (?P<repository>(?:{repo})):(?P<tag>{tag}))(?:@(?P<digest>{digest}))?(?P<tail>[ \t]*)$",
            repo = repository_pattern,
            tag = TAG_PATTERN,
            digest = DIGEST_PATTERN,
        );
        let line = Regex::new(&source).map_err(|source| ParseError::InvalidPattern {
            pattern: repository_pattern.to_string(),
            source,
        })?;

        Ok(Self {
            repository_pattern: repository_pattern.to_string(),
            line,
        })
    }

    /// The repository pattern this matcher was built from.
    pub fn repository_pattern(&self) -> &str {
        &self.repository_pattern
    }

    /// Return the first image line's reference.
    pub fn extract(&self, content: &str) -> Result<ImageReference, ParseError> {
        let caps = self
            .line
            .captures(content)
            .ok_or_else(|| ParseError::NotFound(self.repository_pattern.clone()))?;

        Ok(ImageReference {
            repository: caps["repository"].to_string(),
            tag: caps["tag"].to_string(),
            digest: caps.name("digest").map(|m| m.as_str().to_string()),
        })
    }

    /// Rewrite matching image lines to pin `new_digest`.
    ///
    /// With `only` set, lines naming a different `repository:tag` are left as
    /// they are.
    pub fn patch(&self, content: &str, new_digest: &str, only: Option<(&str, &str)>) -> String {
        self.line
            .replace_all(content, |caps: &Captures| {
                let selected = match only {
                    Some((repository, tag)) => {
                        &caps["repository"] == repository && &caps["tag"] == tag
                    }
                    None => true,
                };

                if selected {
                    format!("{}@{}{}", &caps["head"], new_digest, &caps["tail"])
                } else {
                    caps[0].to_string()
                }
            })
            .into_owned()
    }
}

/// Find the canonical image reference in `content`.
pub fn extract(content: &str, repository_pattern: &str) -> Result<ImageReference, ParseError> {
    ImagePattern::new(repository_pattern)?.extract(content)
}

/// Pin `new_digest` on every image line matching the default repository
/// pattern.
pub fn patch(content: &str, new_digest: &str) -> String {
    DEFAULT_IMAGE_PATTERN.patch(content, new_digest, None)
}

/// Configuration text together with its canonical image reference.
///
/// The original text is never modified; [`ConfigDocument::patch`] returns a
/// new string.
#[derive(Debug, Clone)]
pub struct ConfigDocument {
    content: String,
    pattern: ImagePattern,
    image: ImageReference,
    scope: PatchScope,
}

impl ConfigDocument {
    /// Parse `content`, locating the canonical image line.
    pub fn parse(content: impl Into<String>, repository_pattern: &str) -> Result<Self, ParseError> {
        let content = content.into();
        let pattern = ImagePattern::new(repository_pattern)?;
        let image = pattern.extract(&content)?;

        Ok(Self {
            content,
            pattern,
            image,
            scope: PatchScope::default(),
        })
    }

    /// Choose which lines [`patch`](Self::patch) touches.
    pub fn with_scope(mut self, scope: PatchScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn image(&self) -> &ImageReference {
        &self.image
    }

    pub fn scope(&self) -> PatchScope {
        self.scope
    }

    /// Produce the configuration text with `new_digest` pinned.
    pub fn patch(&self, new_digest: &str) -> String {
        let only = match self.scope {
            PatchScope::Canonical => Some((self.image.repository.as_str(), self.image.tag.as_str())),
            PatchScope::AllMatching => None,
        };
        self.pattern.patch(&self.content, new_digest, only)
    }
}
