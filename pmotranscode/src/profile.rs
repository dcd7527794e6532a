//! Encoding profiles and the registry that names them.
//!
//! A [`Profile`] describes a target encoding: content type, file suffix,
//! default bitrate and a command template. The template is a shell-like
//! command line whose `<file>`, `<seek>` and `<bitrate>` tokens are filled in
//! per request (see [`crate::resolve`]).
//!
//! Profiles are plain values. Deriving one with another bitrate or seek
//! offset copies it and never touches the registry entry.

use std::{collections::BTreeMap, time::Duration};

use serde::Deserialize;

use crate::error::TranscodeError;

/// Bitrate in kbit/s. Zero means "not applicable" (lossless PCM).
pub type BitRate = u32;

pub const FILE_PLACEHOLDER: &str = "<file>";
pub const SEEK_PLACEHOLDER: &str = "<seek>";
pub const BITRATE_PLACEHOLDER: &str = "<bitrate>";

/// Name of the raw PCM profile, kept out of the user selectable list.
pub const PCM16LE: &str = "pcm16le";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Profile {
    mime: String,
    suffix: String,
    #[serde(default)]
    bitrate: BitRate,
    #[serde(skip)]
    seek: Duration,
    command: String,
}

impl Profile {
    pub fn new(
        mime: impl Into<String>,
        suffix: impl Into<String>,
        bitrate: BitRate,
        command: impl Into<String>,
    ) -> Self {
        Self {
            mime: mime.into(),
            suffix: suffix.into(),
            bitrate,
            seek: Duration::ZERO,
            command: command.into(),
        }
    }

    pub fn mime(&self) -> &str {
        &self.mime
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn bitrate(&self) -> BitRate {
        self.bitrate
    }

    pub fn seek(&self) -> Duration {
        self.seek
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Same profile, different bitrate.
    pub fn with_bitrate(mut self, bitrate: BitRate) -> Self {
        self.bitrate = bitrate;
        self
    }

    /// Same profile, starting `seek` into the source.
    pub fn with_seek(mut self, seek: Duration) -> Self {
        self.seek = seek;
        self
    }

    /// True when the template accepts a start offset.
    pub fn supports_seek(&self) -> bool {
        self.has_placeholder(SEEK_PLACEHOLDER)
    }

    // tokenised like `resolve`, so quoted placeholders count
    fn has_placeholder(&self, placeholder: &str) -> bool {
        shlex::split(&self.command)
            .is_some_and(|tokens| tokens.iter().any(|token| token == placeholder))
    }

    fn validate(&self) -> Result<(), TranscodeError> {
        if self.has_placeholder(FILE_PLACEHOLDER) {
            Ok(())
        } else {
            Err(TranscodeError::MissingFilePlaceholder {
                template: self.command.clone(),
            })
        }
    }
}

const REPLAYGAIN_FILTER: &str = r#""volume=replaygain=track:replaygain_preamp=6dB:replaygain_noclip=0, alimiter=level=disabled, asidedata=mode=delete:type=REPLAYGAIN""#;
const CAR_FILTER: &str = r#""aresample=96000:resampler=soxr, volume=replaygain=track:replaygain_preamp=15dB:replaygain_noclip=0, alimiter=level=disabled, asidedata=mode=delete:type=REPLAYGAIN""#;
const STRIP_GAIN_TAGS: &str = "-metadata replaygain_album_gain= -metadata replaygain_album_peak= -metadata replaygain_track_gain= -metadata replaygain_track_peak= -metadata r128_album_gain= -metadata r128_track_gain=";

fn mp3(bitrate: BitRate) -> Profile {
    Profile::new(
        "audio/mpeg",
        "mp3",
        bitrate,
        format!(
            "ffmpeg -v 0 -i <file> -ss <seek> -map 0:a:0 -vn -b:a <bitrate> -c:a libmp3lame -af {REPLAYGAIN_FILTER} {STRIP_GAIN_TAGS} -f mp3 -"
        ),
    )
}

fn opus(bitrate: BitRate) -> Profile {
    Profile::new(
        "audio/ogg",
        "ogg",
        bitrate,
        format!(
            "ffmpeg -v 0 -i <file> -ss <seek> -map 0:a:0 -vn -b:a <bitrate> -c:a libopus -vbr on -af {REPLAYGAIN_FILTER} {STRIP_GAIN_TAGS} -f opus -"
        ),
    )
}

// louder baseline gain and 2x upsampled limiting, for noisy environments
fn opus_car(bitrate: BitRate) -> Profile {
    Profile::new(
        "audio/ogg",
        "ogg",
        bitrate,
        format!(
            "ffmpeg -v 0 -i <file> -ss <seek> -map 0:a:0 -vn -b:a <bitrate> -c:a libopus -vbr on -af {CAR_FILTER} -f opus -"
        ),
    )
}

/// 48 kHz, 16 bit, stereo little endian PCM.
pub fn pcm16le() -> Profile {
    Profile::new(
        "audio/wav",
        "wav",
        0,
        "ffmpeg -v 0 -i <file> -ss <seek> -c:a pcm_s16le -ac 2 -f s16le -",
    )
}

/// Read-only catalog of named profiles.
///
/// Built once at startup and shared by reference afterwards; lookups hand out
/// copies so callers can derive from them freely.
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: BTreeMap<String, Profile>,
}

impl ProfileRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The stock ffmpeg profiles.
    pub fn builtin() -> Self {
        let profiles = [
            ("mp3", mp3(128)),
            ("mp3_rg", mp3(128)),
            ("opus_car", opus_car(96)),
            ("opus", opus(96)),
            ("opus_rg", opus(96)),
            ("opus_128_car", opus_car(128)),
            ("opus_128", opus(128)),
            ("opus_128_rg", opus(128)),
            (PCM16LE, pcm16le()),
        ];

        Self {
            profiles: profiles
                .into_iter()
                .map(|(name, profile)| (name.to_string(), profile))
                .collect(),
        }
    }

    /// Adds (or replaces) a profile. Templates without `<file>` are refused.
    pub fn register(&mut self, name: impl Into<String>, profile: Profile) -> Result<(), TranscodeError> {
        profile.validate()?;
        let name = name.into();
        if self.profiles.insert(name.clone(), profile).is_some() {
            tracing::debug!(profile = %name, "Replaced transcode profile");
        }
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Profile> {
        self.profiles.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.profiles.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    /// Names a client may pick as its transcode preference.
    pub fn user_selectable(&self) -> impl Iterator<Item = &str> {
        self.names().filter(|name| *name != PCM16LE)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Profile)> {
        self.profiles.iter().map(|(name, profile)| (name.as_str(), profile))
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
