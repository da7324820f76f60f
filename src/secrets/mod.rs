//! Secrets-to-files broker.
//!
//! Values of designated environment variables are moved out of the sandbox
//! environment and into owner-only files, one per variable, inside a leased
//! `credproxy-secrets-*` directory. The directory is mounted into the sandbox
//! and scrubbed away by [`SecretsBundle::teardown`] once the sandbox exits.
//!
//! Only variable names are ever logged.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::security::{LEASE_FILENAME, SECRETS_PREFIX, create_owned_dir, scrub_and_remove};

/// Environment as handed to and returned from the broker.
pub type EnvMap = BTreeMap<String, String>;

/// Permission bits of every secret file.
pub const SECRET_FILE_MODE: u32 = 0o600;

#[derive(Debug, Error)]
pub enum SecretsError {
    /// Not usable as a file name and environment variable name.
    #[error("invalid secret variable name: {0:?}")]
    InvalidName(String),

    #[error("failed to {what}: {source}")]
    Setup {
        what: String,
        #[source]
        source: anyhow::Error,
    },
}

impl SecretsError {
    fn setup(what: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        SecretsError::Setup {
            what: what.into(),
            source: source.into(),
        }
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// One secret written to disk. The value itself is not retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRecord {
    pub name: String,
    pub path: PathBuf,
    pub mode: u32,
}

/// Directory of secret files owned by one sandbox invocation.
#[derive(Debug)]
pub struct SecretsBundle {
    dir: PathBuf,
    records: Vec<SecretRecord>,
    torn_down: bool,
}

impl SecretsBundle {
    /// Create an empty bundle directory under `base`.
    pub fn create(base: &Path) -> Result<Self, SecretsError> {
        let dir = create_owned_dir(base, SECRETS_PREFIX)
            .map_err(|e| SecretsError::setup("create secrets directory", e))?;
        debug!("Created secrets directory {}", dir.display());
        Ok(Self {
            dir,
            records: Vec::new(),
            torn_down: false,
        })
    }

    /// Write `value` to a new owner-only file named `name`.
    pub fn write(&mut self, name: &str, value: &str) -> Result<&SecretRecord, SecretsError> {
        if !is_valid_env_name(name) {
            return Err(SecretsError::InvalidName(name.to_string()));
        }

        let path = self.dir.join(name);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(SECRET_FILE_MODE)
            .open(&path)
            .map_err(|e| SecretsError::setup(format!("create secret file {}", name), e))?;
        file.write_all(value.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| SecretsError::setup(format!("write secret file {}", name), e))?;

        debug!("Wrote secret {} to {}", name, self.dir.display());
        self.records.push(SecretRecord {
            name: name.to_string(),
            path,
            mode: SECRET_FILE_MODE,
        });
        Ok(&self.records[self.records.len() - 1])
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn records(&self) -> &[SecretRecord] {
        &self.records
    }

    pub fn names(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Scrub every file in the directory, then remove the directory.
    ///
    /// Best effort and idempotent; failures are logged.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        match fs::read_dir(&self.dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    let is_file = entry.file_type().is_ok_and(|t| t.is_file());
                    if is_file && entry.file_name() != LEASE_FILENAME {
                        scrub_and_remove(&path);
                    }
                }
            }
            Err(e) => warn!("Failed to list secrets directory {}: {}", self.dir.display(), e),
        }

        match fs::remove_dir_all(&self.dir) {
            Ok(()) => info!(
                "Removed secrets directory {} ({} secret(s))",
                self.dir.display(),
                self.records.len()
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove secrets directory {}: {}", self.dir.display(), e),
        }
    }
}

impl Drop for SecretsBundle {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Outcome of [`prepare_secrets`].
#[derive(Debug)]
pub struct PreparedSecrets {
    /// `None` when no designated name was present in the environment.
    pub bundle: Option<SecretsBundle>,
    /// Input environment minus every variable that was written to a file.
    pub env: EnvMap,
}

impl PreparedSecrets {
    pub fn dir(&self) -> Option<&Path> {
        self.bundle.as_ref().map(SecretsBundle::dir)
    }

    pub fn written(&self) -> Vec<&str> {
        self.bundle.as_ref().map(SecretsBundle::names).unwrap_or_default()
    }
}

/// Move every variable of `env` named in `secret_names` into a secrets bundle.
///
/// Names missing from `env` are skipped. No directory is created unless at
/// least one name matches. An invalid name fails the whole call before
/// anything is written.
pub fn prepare_secrets(
    base: &Path,
    env: &EnvMap,
    secret_names: &[String],
) -> Result<PreparedSecrets, SecretsError> {
    if let Some(bad) = secret_names.iter().find(|n| !is_valid_env_name(n)) {
        return Err(SecretsError::InvalidName(bad.clone()));
    }

    let mut residual = env.clone();
    let mut matched: Vec<(&str, String)> = Vec::new();
    let mut seen = BTreeSet::new();
    for name in secret_names {
        if !seen.insert(name.as_str()) {
            continue;
        }
        match residual.remove(name) {
            Some(value) => matched.push((name.as_str(), value)),
            None => debug!("Secret {} not set, skipping", name),
        }
    }

    if matched.is_empty() {
        return Ok(PreparedSecrets {
            bundle: None,
            env: residual,
        });
    }

    // Dropping the bundle on error scrubs whatever was already written.
    let mut bundle = SecretsBundle::create(base)?;
    for (name, value) in &matched {
        bundle.write(name, value)?;
    }

    Ok(PreparedSecrets {
        bundle: Some(bundle),
        env: residual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn env(pairs: &[(&str, &str)]) -> EnvMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn valid_env_names() {
        assert!(is_valid_env_name("ANTHROPIC_API_KEY"));
        assert!(is_valid_env_name("_private"));
        assert!(is_valid_env_name("a1"));
        assert!(!is_valid_env_name(""));
        assert!(!is_valid_env_name("1ABC"));
        assert!(!is_valid_env_name("../etc/passwd"));
        assert!(!is_valid_env_name("WITH-DASH"));
        assert!(!is_valid_env_name("WITH SPACE"));
    }

    #[test]
    fn secret_moves_to_file() {
        let tmp = tempfile::tempdir().unwrap();
        let input = env(&[("ANTHROPIC_API_KEY", "sk-test-123"), ("TERM", "xterm")]);

        let base = tmp.path().join("base");
        let prepared = prepare_secrets(&base, &input, &names(&["ANTHROPIC_API_KEY"])).unwrap();

        assert_eq!(prepared.env, env(&[("TERM", "xterm")]));
        assert_eq!(prepared.written(), vec!["ANTHROPIC_API_KEY"]);

        let dir = prepared.dir().unwrap();
        assert!(
            dir.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with(SECRETS_PREFIX)
        );
        assert_eq!(fs::metadata(dir).unwrap().permissions().mode() & 0o777, 0o700);
        assert!(dir.join(LEASE_FILENAME).exists());

        let file = dir.join("ANTHROPIC_API_KEY");
        assert_eq!(fs::read_to_string(&file).unwrap(), "sk-test-123");
        assert_eq!(fs::metadata(&file).unwrap().permissions().mode() & 0o777, 0o600);

        let record = &prepared.bundle.as_ref().unwrap().records()[0];
        assert_eq!(record.path, file);
        assert_eq!(record.mode, SECRET_FILE_MODE);
    }

    #[test]
    fn no_match_creates_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("base");
        let input = env(&[("TERM", "xterm")]);

        let prepared = prepare_secrets(&base, &input, &names(&["GH_TOKEN"])).unwrap();

        assert!(prepared.bundle.is_none());
        assert!(prepared.dir().is_none());
        assert!(prepared.written().is_empty());
        assert_eq!(prepared.env, input);
        assert!(!base.exists());
    }

    #[test]
    fn missing_names_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let input = env(&[("GH_TOKEN", "ghp_abc"), ("HOME", "/home/me")]);

        let prepared = prepare_secrets(
            &tmp.path().join("base"),
            &input,
            &names(&["ANTHROPIC_API_KEY", "GH_TOKEN", "GH_TOKEN"]),
        )
        .unwrap();

        assert_eq!(prepared.written(), vec!["GH_TOKEN"]);
        assert_eq!(prepared.env, env(&[("HOME", "/home/me")]));
    }

    #[test]
    fn empty_value_is_written() {
        let tmp = tempfile::tempdir().unwrap();
        let input = env(&[("EMPTY_TOKEN", "")]);

        let base = tmp.path().join("base");
        let prepared = prepare_secrets(&base, &input, &names(&["EMPTY_TOKEN"])).unwrap();
        let file = prepared.dir().unwrap().join("EMPTY_TOKEN");
        assert_eq!(fs::read(&file).unwrap().len(), 0);
        assert!(prepared.env.is_empty());
    }

    #[test]
    fn invalid_name_fails_before_writing() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("base");
        let input = env(&[("GOOD", "1"), ("../escape", "2")]);

        let err = prepare_secrets(&base, &input, &names(&["GOOD", "../escape"])).unwrap_err();

        assert!(matches!(err, SecretsError::InvalidName(ref n) if n == "../escape"), "{err}");
        assert!(!base.exists());
    }

    #[test]
    fn teardown_scrubs_and_removes() {
        let tmp = tempfile::tempdir().unwrap();
        let input = env(&[("A_TOKEN", "aaaa"), ("B_TOKEN", "bbbb")]);

        let base = tmp.path().join("base");
        let mut prepared = prepare_secrets(&base, &input, &names(&["A_TOKEN", "B_TOKEN"])).unwrap();
        let mut bundle = prepared.bundle.take().unwrap();
        let dir = bundle.dir().to_path_buf();
        // A file dropped in by someone else is scrubbed too.
        fs::write(dir.join("extra"), b"leftover").unwrap();

        bundle.teardown();

        assert!(bundle.is_torn_down());
        assert!(!dir.exists());
        // Idempotent.
        bundle.teardown();
    }

    #[test]
    fn drop_tears_down() {
        let tmp = tempfile::tempdir().unwrap();
        let input = env(&[("A_TOKEN", "aaaa")]);

        let dir = {
            let base = tmp.path().join("base");
            let prepared = prepare_secrets(&base, &input, &names(&["A_TOKEN"])).unwrap();
            prepared.dir().unwrap().to_path_buf()
        };
        assert!(!dir.exists());
    }

    #[test]
    fn write_refuses_duplicates() {
        let tmp = tempfile::tempdir().unwrap();
        let mut bundle = SecretsBundle::create(&tmp.path().join("base")).unwrap();

        bundle.write("TOKEN", "one").unwrap();
        let err = bundle.write("TOKEN", "two").unwrap_err();
        assert!(matches!(err, SecretsError::Setup { .. }), "{err}");
        assert_eq!(fs::read_to_string(bundle.dir().join("TOKEN")).unwrap(), "one");
    }
}
