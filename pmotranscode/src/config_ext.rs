//! Extension pour intégrer le transcodage dans pmoconfig
//!
//! Ce module fournit le trait `TranscodeConfigExt` qui lit la section
//! `transcode` de la configuration :
//!
//! ```yaml
//! transcode:
//!   cache:
//!     directory: cache_transcode   # relatif au répertoire de configuration
//!     size_mb: 1024                # 0 désactive l'éviction
//!     eject_interval_secs: 600
//!     partial: false               # mettre en cache les requêtes avec seek
//!   profiles:
//!     flac_16:
//!       mime: audio/flac
//!       suffix: flac
//!       command: ffmpeg -v 0 -i <file> -ss <seek> -sample_fmt s16 -f flac -
//! ```

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use pmoconfig::Config;
use serde_yaml::Value;

use crate::{CacheStore, CachingTranscoder, ProcessTranscoder, Profile, ProfileRegistry};

const CACHE_DIR: &[&str] = &["transcode", "cache", "directory"];
const CACHE_SIZE: &[&str] = &["transcode", "cache", "size_mb"];
const EJECT_INTERVAL: &[&str] = &["transcode", "cache", "eject_interval_secs"];
const CACHE_PARTIAL: &[&str] = &["transcode", "cache", "partial"];
const PROFILES: &[&str] = &["transcode", "profiles"];

const DEFAULT_CACHE_DIR: &str = "cache_transcode";
const DEFAULT_CACHE_SIZE_MB: u64 = 1024;
const DEFAULT_EJECT_INTERVAL_SECS: u64 = 600;

/// Trait d'extension pour ajouter le transcodage à pmoconfig
///
/// # Exemple
///
/// ```rust,ignore
/// use pmoconfig::get_config;
/// use pmotranscode::TranscodeConfigExt;
///
/// let config = get_config();
/// let transcoder = config.create_caching_transcoder()?;
/// ```
pub trait TranscodeConfigExt {
    /// Répertoire absolu du cache de transcodage, créé si nécessaire
    fn get_transcode_cache_dir(&self) -> Result<String>;

    /// Taille maximale du cache en Mo
    fn get_transcode_cache_size_mb(&self) -> Result<u64>;

    /// Période entre deux passes d'éviction
    fn get_transcode_eject_interval(&self) -> Result<Duration>;

    /// Mettre aussi en cache les requêtes qui commencent à un offset
    fn get_transcode_cache_partial(&self) -> Result<bool>;

    /// Profils déclarés par l'utilisateur sous `transcode.profiles`
    fn get_transcode_profiles(&self) -> Result<BTreeMap<String, Profile>>;

    /// Profils intégrés, complétés ou remplacés par ceux de la configuration
    fn create_profile_registry(&self) -> Result<ProfileRegistry>;

    /// Crée le transcodeur avec cache configuré
    fn create_caching_transcoder(&self) -> Result<Arc<CachingTranscoder>>;
}

impl TranscodeConfigExt for Config {
    fn get_transcode_cache_dir(&self) -> Result<String> {
        self.get_managed_dir(CACHE_DIR, DEFAULT_CACHE_DIR)
    }

    fn get_transcode_cache_size_mb(&self) -> Result<u64> {
        self.get_u64(CACHE_SIZE, DEFAULT_CACHE_SIZE_MB)
    }

    fn get_transcode_eject_interval(&self) -> Result<Duration> {
        let secs = self.get_u64(EJECT_INTERVAL, DEFAULT_EJECT_INTERVAL_SECS)?;
        Ok(Duration::from_secs(secs.max(1)))
    }

    fn get_transcode_cache_partial(&self) -> Result<bool> {
        self.get_bool(CACHE_PARTIAL, false)
    }

    fn get_transcode_profiles(&self) -> Result<BTreeMap<String, Profile>> {
        match self.get_value(PROFILES) {
            Ok(Value::Null) | Err(_) => Ok(BTreeMap::new()),
            Ok(value) => serde_yaml::from_value(value).context("invalid transcode.profiles section"),
        }
    }

    fn create_profile_registry(&self) -> Result<ProfileRegistry> {
        let mut registry = ProfileRegistry::builtin();
        for (name, profile) in self.get_transcode_profiles()? {
            registry
                .register(name.clone(), profile)
                .with_context(|| format!("transcode profile {name}"))?;
        }
        Ok(registry)
    }

    fn create_caching_transcoder(&self) -> Result<Arc<CachingTranscoder>> {
        let dir = self.get_transcode_cache_dir()?;
        let size = self.get_transcode_cache_size_mb()?;
        let transcoder = CachingTranscoder::new(Arc::new(ProcessTranscoder::new()), CacheStore::new(dir, size))
            .with_partial_caching(self.get_transcode_cache_partial()?);
        Ok(Arc::new(transcoder))
    }
}
