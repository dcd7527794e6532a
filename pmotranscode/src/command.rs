//! Resolution of a profile template into a runnable command.

use std::{
    ffi::OsString,
    fmt,
    path::{Path, PathBuf},
};

use sha2::{Digest, Sha256};

use crate::{
    error::TranscodeError,
    profile::{BITRATE_PLACEHOLDER, FILE_PLACEHOLDER, Profile, SEEK_PLACEHOLDER},
};

/// Concrete program and arguments for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ResolvedCommand {
    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Fingerprint of the whole command line, absolute input path included.
    pub fn cache_key(&self) -> CacheKey {
        let mut hasher = Sha256::new();
        hasher.update(self.program.as_os_str().as_encoded_bytes());
        for arg in &self.args {
            hasher.update(arg.as_encoded_bytes());
        }
        let digest = hasher.finalize();
        CacheKey(hex::encode(&digest[..16]))
    }
}

impl fmt::Display for ResolvedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            write!(f, " {}", shlex::try_quote(&arg).map_err(|_| fmt::Error)?)?;
        }
        Ok(())
    }
}

/// Lookup token for a cache entry: 32 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recognizes a cache file name produced by [`ResolvedCommand::cache_key`].
    pub(crate) fn from_file_name(name: &str) -> Option<Self> {
        let valid = name.len() == 32
            && name
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| CacheKey(name.to_string()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Fills the profile template for `input`.
///
/// The template is split with shell quoting rules. Its first token names the
/// program, looked up on the search path so a missing encoder is reported
/// before any file is touched. A token equal to `<file>`, `<seek>` or
/// `<bitrate>` is replaced by the input path, the seek offset in
/// microseconds (`"<n>us"`) or the bitrate (`"<n>k"`); every other token is
/// kept verbatim. The input path is passed through as raw OS bytes, so file
/// names that are not UTF-8 reach the encoder untouched.
pub fn resolve(profile: &Profile, input: &Path) -> Result<ResolvedCommand, TranscodeError> {
    let parts = shlex::split(profile.command()).ok_or_else(|| TranscodeError::SplitCommand {
        template: profile.command().to_string(),
    })?;
    let (name, rest) = parts.split_first().ok_or(TranscodeError::NoProfileParts)?;

    let program = which::which(name).map_err(|source| TranscodeError::ExecutableNotFound {
        program: name.clone(),
        source,
    })?;

    let args = rest
        .iter()
        .map(|part| match part.as_str() {
            FILE_PLACEHOLDER => input.as_os_str().to_os_string(),
            SEEK_PLACEHOLDER => format!("{}us", profile.seek().as_micros()).into(),
            BITRATE_PLACEHOLDER => format!("{}k", profile.bitrate()).into(),
            _ => part.into(),
        })
        .collect();

    Ok(ResolvedCommand { program, args })
}
