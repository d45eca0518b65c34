//! Configuration and environment resolution (spec §4.7). Resolves, in
//! order, explicit CLI flags, then environment variables, then archive
//! auto-detection by walking upward from the current directory.
//!
//! Grounded on `other_examples/manifests/ejc3-claude-code-sync`'s layered
//! env-var-then-file resolution pattern for a CLI tool.

use std::env;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

pub const API_TOKEN_VAR: &str = "LEDGERSYNC_API_TOKEN";
pub const BASE_URL_VAR: &str = "LEDGERSYNC_BASE_URL";
pub const OUTPUT_DIR_VAR: &str = "LEDGERSYNC_OUTPUT_DIR";

/// Recognized archive file extensions for auto-detection. The default
/// `LocalStore` persists a line-oriented format of our own design (§6),
/// independent of any particular plain-text ledger grammar.
const ARCHIVE_EXTENSIONS: [&str; 2] = ["ledger", "ldg"];

/// Fully resolved runtime configuration for a single invocation.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_token: String,
    pub base_url: String,
    pub archive_path: PathBuf,
    pub changelog_path: PathBuf,
}

/// A located archive file plus its sibling changelog, before the rest of
/// `Config` is assembled.
#[derive(Debug, Clone)]
pub struct DetectedArchive {
    pub archive_path: PathBuf,
    pub changelog_path: PathBuf,
}

impl Config {
    /// Resolves configuration for a command. `explicit_destination` is the
    /// `--destination`/positional path argument, if the user gave one;
    /// `explicit_base_url` is a CLI override for the base URL.
    pub fn resolve(
        explicit_destination: Option<&Path>,
        explicit_base_url: Option<&str>,
    ) -> Result<Config, ConfigError> {
        let api_token = env::var(API_TOKEN_VAR).map_err(|_| ConfigError::MissingEnv(API_TOKEN_VAR))?;

        let base_url = explicit_base_url
            .map(str::to_string)
            .or_else(|| env::var(BASE_URL_VAR).ok())
            .unwrap_or_else(|| "https://api.example-ledger-service.invalid".to_string());

        let archive = locate_archive(explicit_destination)?;

        Ok(Config {
            api_token,
            base_url,
            archive_path: archive.archive_path,
            changelog_path: archive.changelog_path,
        })
    }
}

/// Locates the archive to operate on: an explicit destination (file or
/// directory) takes priority, then `LEDGERSYNC_OUTPUT_DIR`, then an upward
/// walk from the current directory looking for a primary archive file with
/// a sibling `.log` changelog (§4.7, §6).
fn locate_archive(explicit_destination: Option<&Path>) -> Result<DetectedArchive, ConfigError> {
    if let Some(dest) = explicit_destination {
        return resolve_destination(dest);
    }

    if let Ok(dir) = env::var(OUTPUT_DIR_VAR) {
        return resolve_destination(Path::new(&dir));
    }

    let cwd = env::current_dir().map_err(|_| ConfigError::NoDestination)?;
    let mut dir = Some(cwd.as_path());
    while let Some(d) = dir {
        if let Some(found) = find_archive_in_dir(d) {
            return Ok(found);
        }
        dir = d.parent();
    }

    Err(ConfigError::NoDestination)
}

/// An explicit destination may name a directory (search within it, no
/// upward walk) or a specific archive file (sibling `.log` is derived).
fn resolve_destination(dest: &Path) -> Result<DetectedArchive, ConfigError> {
    if dest.is_dir() {
        return find_archive_in_dir(dest).ok_or(ConfigError::NoDestination);
    }
    let changelog_path = sibling_changelog(dest);
    Ok(DetectedArchive {
        archive_path: dest.to_path_buf(),
        changelog_path,
    })
}

fn find_archive_in_dir(dir: &Path) -> Option<DetectedArchive> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut candidates: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| ARCHIVE_EXTENSIONS.contains(&ext))
        })
        .collect();
    candidates.sort();

    candidates.into_iter().find_map(|candidate| {
        let changelog_path = sibling_changelog(&candidate);
        changelog_path.exists().then_some(DetectedArchive {
            archive_path: candidate,
            changelog_path,
        })
    })
}

/// The changelog sibling of an archive path is `<primary>.log`, per §6
/// ("a sibling `<primary>.log` changelog").
fn sibling_changelog(archive_path: &Path) -> PathBuf {
    let mut name = archive_path.as_os_str().to_os_string();
    name.push(".log");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sibling_changelog_appends_dot_log() {
        let path = sibling_changelog(Path::new("/tmp/main.ledger"));
        assert_eq!(path, PathBuf::from("/tmp/main.ledger.log"));
    }

    #[test]
    fn explicit_file_destination_is_used_directly() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("main.ledger");
        std::fs::write(&archive, "").unwrap();
        let detected = resolve_destination(&archive).unwrap();
        assert_eq!(detected.archive_path, archive);
        assert_eq!(detected.changelog_path, dir.path().join("main.ledger.log"));
    }

    #[test]
    fn dir_destination_requires_a_sibling_changelog_to_match() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.ledger"), "").unwrap();
        // No sibling .log yet: nothing should match.
        assert!(find_archive_in_dir(dir.path()).is_none());

        std::fs::write(dir.path().join("main.ledger.log"), "").unwrap();
        let found = find_archive_in_dir(dir.path()).unwrap();
        assert_eq!(found.archive_path, dir.path().join("main.ledger"));
    }
}
