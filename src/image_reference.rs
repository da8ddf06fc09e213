use oci_spec::distribution::Reference as OciReference;
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use thiserror::Error;

const NAME_TOTAL_LENGTH_MAX: usize = 255;

static SHORT_IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-f0-9]{6,}$").expect("valid short identifier pattern"));

static FULL_IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-f0-9]{64}$").expect("valid identifier pattern"));

/// A normalized container image reference, e.g. `docker.io/library/nginx:1.25`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host (and optional port), always lowercase.
    pub domain: String,
    pub path: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("image reference is empty")]
    Empty,
    #[error("invalid reference format {image}: {reason}")]
    InvalidFormat { image: String, reason: String },
    #[error("invalid reference format: repository name ({0}) must be lowercase")]
    UppercaseRepository(String),
    #[error("repository name {0} must not be more than 255 characters")]
    NameTooLong(String),
    #[error("invalid repository name ({0}), cannot specify 64-byte hexadecimal strings")]
    HexRepository(String),
    #[error("invalid digest format: {0}")]
    InvalidDigest(String),
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedDigest(String),
}

/// Bare lowercase hex strings such as `a1b2c3` are content hashes, not image names.
pub fn is_short_identifier(image: &str) -> bool {
    SHORT_IDENTIFIER.is_match(image)
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rebuild(&self.domain))
    }
}

impl ImageReference {
    /// Parses and normalizes an image reference. Images without an explicit
    /// registry resolve to `docker.io`, official images get the `library/` prefix.
    ///
    /// Grammar and domain splitting come from [`OciReference`]. On top of it the
    /// digest algorithm is restricted, bare 64-hex names are refused, and no
    /// `latest` tag is invented for untagged images.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }
        if FULL_IDENTIFIER.is_match(s) {
            return Err(ParseError::HexRepository(s.to_string()));
        }
        if let Some((_, digest)) = s.split_once('@') {
            validate_digest(digest)?;
        }

        let reference = OciReference::from_str(s).map_err(|err| ParseError::InvalidFormat {
            image: s.to_string(),
            reason: err.to_string(),
        })?;

        let domain = reference.registry().to_lowercase();
        let path = reference.repository().to_string();
        if path.to_lowercase() != path {
            return Err(ParseError::UppercaseRepository(path));
        }
        if domain.len() + 1 + path.len() > NAME_TOTAL_LENGTH_MAX {
            return Err(ParseError::NameTooLong(format!("{domain}/{path}")));
        }

        let tag = if has_explicit_tag(s) {
            reference.tag().map(str::to_string)
        } else {
            None
        };

        Ok(Self {
            domain,
            path,
            tag,
            digest: reference.digest().map(str::to_string),
        })
    }

    /// Reassembles the reference on top of `domain`. Tag and digest are both
    /// kept when present.
    pub fn rebuild(&self, domain: &str) -> String {
        let mut image = format!("{}/{}", domain, self.path);
        if let Some(tag) = &self.tag {
            image.push(':');
            image.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            image.push('@');
            image.push_str(digest);
        }
        image
    }
}

/// A tag is a `:` in the last path component, a `:` before it is a registry port.
fn has_explicit_tag(s: &str) -> bool {
    let name = s.split_once('@').map_or(s, |(name, _)| name);
    name.rsplit('/').next().is_some_and(|last| last.contains(':'))
}

fn validate_digest(digest: &str) -> Result<(), ParseError> {
    let (algorithm, encoded) = digest
        .split_once(':')
        .ok_or_else(|| ParseError::InvalidDigest(digest.to_string()))?;

    let expected_len = match algorithm {
        "sha256" => 64,
        "sha384" => 96,
        "sha512" => 128,
        _ => return Err(ParseError::UnsupportedDigest(digest.to_string())),
    };

    let lowercase_hex = encoded
        .bytes()
        .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    if encoded.len() != expected_len || !lowercase_hex {
        return Err(ParseError::InvalidDigest(digest.to_string()));
    }

    Ok(())
}
