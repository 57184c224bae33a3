use anyhow::{Context, Result};
use digest::Digest;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};
use tracing::{debug, warn};

use super::engine::Fetcher;

const HASH_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumType {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl ChecksumType {
    /// Infer the algorithm from the length of a hex digest.
    /// Unrecognised lengths fall back to SHA-256.
    pub fn from_digest(digest: &str) -> Self {
        match digest.trim().len() {
            32 => ChecksumType::Md5,
            40 => ChecksumType::Sha1,
            128 => ChecksumType::Sha512,
            _ => ChecksumType::Sha256,
        }
    }
}

impl fmt::Display for ChecksumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumType::Md5 => write!(f, "MD5"),
            ChecksumType::Sha1 => write!(f, "SHA1"),
            ChecksumType::Sha256 => write!(f, "SHA256"),
            ChecksumType::Sha512 => write!(f, "SHA512"),
        }
    }
}

/// Outcome of checking one local file against its published checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum VerificationResult {
    Verified {
        algorithm: ChecksumType,
        digest: String,
    },
    Failed {
        reason: String,
        computed: Option<String>,
    },
    Unknown {
        reason: String,
        computed: Option<String>,
    },
}

impl VerificationResult {
    pub fn is_verified(&self) -> bool {
        matches!(self, VerificationResult::Verified { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, VerificationResult::Failed { .. })
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, VerificationResult::Unknown { .. })
    }

    pub fn computed_digest(&self) -> Option<&str> {
        match self {
            VerificationResult::Verified { digest, .. } => Some(digest),
            VerificationResult::Failed { computed, .. }
            | VerificationResult::Unknown { computed, .. } => computed.as_deref(),
        }
    }

    /// Operator-facing description of the result.
    pub fn message(&self) -> String {
        match self {
            VerificationResult::Verified { algorithm, .. } => {
                format!("Hash verified successfully ({})", algorithm)
            }
            VerificationResult::Failed { reason, .. } | VerificationResult::Unknown { reason, .. } => {
                reason.clone()
            }
        }
    }
}

pub struct ChecksumVerifier;

impl ChecksumVerifier {
    pub async fn calculate_checksum(
        file_path: &Path,
        checksum_type: ChecksumType,
    ) -> Result<String> {
        let file = File::open(file_path)
            .await
            .with_context(|| format!("Failed to open file: {:?}", file_path))?;
        let mut reader = BufReader::new(file);

        match checksum_type {
            ChecksumType::Sha256 => hash_reader::<sha2::Sha256>(&mut reader).await,
            ChecksumType::Sha512 => hash_reader::<sha2::Sha512>(&mut reader).await,
            ChecksumType::Sha1 => hash_reader::<sha1::Sha1>(&mut reader).await,
            ChecksumType::Md5 => {
                // md5 exposes its own context type rather than the Digest trait
                let mut context = md5::Context::new();
                let mut buffer = vec![0; HASH_BUFFER_SIZE];
                loop {
                    let bytes_read = reader.read(&mut buffer).await?;
                    if bytes_read == 0 {
                        break;
                    }
                    context.consume(&buffer[..bytes_read]);
                }
                Ok(format!("{:x}", context.finalize()))
            }
        }
    }
}

async fn hash_reader<D: Digest>(reader: &mut BufReader<File>) -> Result<String> {
    let mut hasher = D::new();
    let mut buffer = vec![0; HASH_BUFFER_SIZE];
    loop {
        let bytes_read = reader.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect())
}

/// Where a distribution publishes the checksum for an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumLocation {
    /// A manifest next to the artifact, e.g. `<dir>/SHA256SUMS`.
    Sibling(&'static str),
    /// A per-file manifest, e.g. `<artifact>.sha256`.
    Suffix(&'static str),
    /// `.iso` replaced by the given suffix (Manjaro style).
    ReplaceIsoExtension(&'static str),
    /// A `*CHECKSUM*` file found by scanning the directory listing (Fedora).
    DirectoryListing,
}

/// Ordered by specificity: a longer name must be checked before any
/// substring of it.
const DISTRO_CONVENTIONS: &[(&str, ChecksumLocation)] = &[
    ("archlinux", ChecksumLocation::Sibling("sha256sums.txt")),
    ("endeavouros", ChecksumLocation::Suffix(".sha512sum")),
    ("opensuse", ChecksumLocation::Suffix(".sha256")),
    ("linuxmint", ChecksumLocation::Sibling("sha256sum.txt")),
    ("mint", ChecksumLocation::Sibling("sha256sum.txt")),
    ("manjaro", ChecksumLocation::ReplaceIsoExtension("-sha256.sum")),
    ("pop-os", ChecksumLocation::Sibling("SHA256SUMS")),
    ("popos", ChecksumLocation::Sibling("SHA256SUMS")),
    ("kali", ChecksumLocation::Sibling("SHA256SUMS")),
    ("alpine", ChecksumLocation::Suffix(".sha256")),
    ("ubuntu", ChecksumLocation::Sibling("SHA256SUMS")),
    ("debian", ChecksumLocation::Sibling("SHA256SUMS")),
    ("fedora", ChecksumLocation::DirectoryListing),
    ("rocky", ChecksumLocation::Sibling("CHECKSUM")),
    ("zorin", ChecksumLocation::Sibling("sha256sum.txt")),
    ("mx", ChecksumLocation::Suffix(".sha256")),
];

/// Manifest names tried when the distribution is not recognised.
const COMMON_MANIFESTS: &[&str] = &["SHA256SUMS", "sha256sum.txt", "CHECKSUM"];

/// Detect the distribution convention that applies to `url`.
pub fn detect_convention(url: &str) -> Option<(&'static str, ChecksumLocation)> {
    let lower = url.to_lowercase();
    DISTRO_CONVENTIONS
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .copied()
}

fn base_url(url: &str) -> &str {
    url.rsplit_once('/').map(|(base, _)| base).unwrap_or(url)
}

/// Build the checksum URL for locations that need no network access.
pub fn checksum_url_for(url: &str, location: ChecksumLocation) -> Option<String> {
    match location {
        ChecksumLocation::Sibling(name) => Some(format!("{}/{}", base_url(url), name)),
        ChecksumLocation::Suffix(suffix) => Some(format!("{}{}", url, suffix)),
        ChecksumLocation::ReplaceIsoExtension(suffix) => {
            if url.to_lowercase().ends_with(".iso") {
                Some(format!("{}{}", &url[..url.len() - 4], suffix))
            } else {
                Some(format!("{}{}", url, suffix))
            }
        }
        ChecksumLocation::DirectoryListing => None,
    }
}

static BSD_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:SHA256|SHA512|SHA1|MD5)\s*\((.+)\)\s*=\s*([a-fA-F0-9]+)$").unwrap()
});
static PAREN_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-fA-F0-9]+)\s+\((.+)\)$").unwrap());
static GNU_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-fA-F0-9]+)\s+\*?(.+)$").unwrap());
static CHECKSUM_HREF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)href="([^"]*CHECKSUM[^"]*)""#).unwrap());

fn is_digest_length(len: usize) -> bool {
    matches!(len, 32 | 40 | 64 | 128)
}

fn normalize_name(name: &str) -> String {
    let mut name = name.trim();
    while let Some(rest) = name.strip_prefix("./") {
        name = rest;
    }
    name.to_string()
}

/// Parse a checksum manifest into `filename -> lowercase hex digest`.
///
/// Accepted layouts:
/// - `<hex>  <file>` and `<hex> *<file>` (coreutils)
/// - `<hex> (<file>)`
/// - `SHA256 (<file>) = <hex>` (BSD, used by Fedora)
///
/// Anything else (comments, PGP armor, short digests) is ignored.
pub fn parse_checksum_file(content: &str) -> HashMap<String, String> {
    let mut hashes = HashMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parsed = if let Some(caps) = BSD_LINE.captures(line) {
            Some((caps[2].to_string(), caps[1].to_string()))
        } else if let Some(caps) = PAREN_LINE.captures(line) {
            Some((caps[1].to_string(), caps[2].to_string()))
        } else {
            GNU_LINE
                .captures(line)
                .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        };

        if let Some((digest, name)) = parsed {
            if is_digest_length(digest.len()) {
                hashes.insert(normalize_name(&name), digest.to_lowercase());
            }
        }
    }

    hashes
}

/// Look up `filename` in parsed entries: exact, then basename, then
/// case-insensitive basename.
pub fn find_checksum<'a>(entries: &'a HashMap<String, String>, filename: &str) -> Option<&'a str> {
    if let Some(digest) = entries.get(filename) {
        return Some(digest);
    }

    let basename = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(filename);
    if let Some(digest) = entries.get(basename) {
        return Some(digest);
    }

    entries
        .iter()
        .find(|(name, _)| {
            let entry_base = Path::new(name.as_str())
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(name);
            name.eq_ignore_ascii_case(basename) || entry_base.eq_ignore_ascii_case(basename)
        })
        .map(|(_, digest)| digest.as_str())
}

fn abbreviate(digest: &str) -> String {
    digest.chars().take(16).collect()
}

/// Resolves published checksums for downloaded artifacts and compares digests.
pub struct HashVerifier {
    fetcher: Arc<dyn Fetcher>,
}

impl HashVerifier {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self { fetcher }
    }

    /// Work out which checksum file covers the artifact at `url`.
    pub async fn resolve_checksum_url(&self, url: &str) -> Option<String> {
        match detect_convention(url) {
            Some((distro, ChecksumLocation::DirectoryListing)) => {
                debug!("Scanning directory listing for {} checksum", distro);
                self.find_in_listing(url).await
            }
            Some((_, location)) => checksum_url_for(url, location),
            None => Some(self.try_common_manifests(url).await),
        }
    }

    async fn find_in_listing(&self, url: &str) -> Option<String> {
        let base = base_url(url);
        let listing = match self.fetcher.fetch_text(&format!("{}/", base)).await {
            Ok(listing) => listing,
            Err(e) => {
                debug!("Could not list {}: {}", base, e);
                return None;
            }
        };

        CHECKSUM_HREF
            .captures(&listing)
            .map(|caps| format!("{}/{}", base, &caps[1]))
    }

    async fn try_common_manifests(&self, url: &str) -> String {
        let base = base_url(url);
        for name in COMMON_MANIFESTS {
            let candidate = format!("{}/{}", base, name);
            if self.fetcher.exists(&candidate).await {
                return candidate;
            }
        }
        format!("{}/{}", base, COMMON_MANIFESTS[0])
    }

    /// Fetch the published digest for `filename` from the manifest covering `url`.
    pub async fn published_digest(&self, url: &str, filename: &str) -> Option<String> {
        let checksum_url = self.resolve_checksum_url(url).await?;
        let content = match self.fetcher.fetch_text(&checksum_url).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Could not fetch hash file from {}: {}", checksum_url, e);
                return None;
            }
        };

        let entries = parse_checksum_file(&content);
        find_checksum(&entries, filename).map(str::to_string)
    }

    /// Verify `file_path`. A caller-supplied digest wins over a published one.
    /// Missing checksums yield [`VerificationResult::Unknown`], never an error.
    pub async fn verify_file(
        &self,
        file_path: &Path,
        expected: Option<&str>,
        source_url: Option<&str>,
    ) -> VerificationResult {
        if !file_path.exists() {
            return VerificationResult::Failed {
                reason: "File not found".to_string(),
                computed: None,
            };
        }

        let filename = file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let expected = match (expected, source_url) {
            (Some(digest), _) => Some(digest.trim().to_lowercase()),
            (None, Some(url)) => self.published_digest(url, &filename).await,
            (None, None) => None,
        };

        let Some(expected) = expected.filter(|d| !d.is_empty()) else {
            return match ChecksumVerifier::calculate_checksum(file_path, ChecksumType::Sha256).await {
                Ok(computed) => VerificationResult::Unknown {
                    reason: format!(
                        "No hash available (computed SHA256: {}...)",
                        abbreviate(&computed)
                    ),
                    computed: Some(computed),
                },
                Err(e) => VerificationResult::Unknown {
                    reason: format!("No hash available (error computing: {})", e),
                    computed: None,
                },
            };
        };

        let algorithm = ChecksumType::from_digest(&expected);
        let computed = match ChecksumVerifier::calculate_checksum(file_path, algorithm).await {
            Ok(computed) => computed,
            Err(e) => {
                return VerificationResult::Failed {
                    reason: format!("Error computing {} hash: {}", algorithm, e),
                    computed: None,
                };
            }
        };

        if computed == expected {
            VerificationResult::Verified {
                algorithm,
                digest: computed,
            }
        } else {
            VerificationResult::Failed {
                reason: format!(
                    "Hash mismatch! Expected: {}..., Got: {}...",
                    abbreviate(&expected),
                    abbreviate(&computed)
                ),
                computed: Some(computed),
            }
        }
    }
}
