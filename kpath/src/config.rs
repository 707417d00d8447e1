use kpath_common::path::MAX_PATH_DEPTH;
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

use crate::{
    cache::DEFAULT_CACHE_SIZE,
    kprobe::{KProbe, KprobeEvents, KprobeManager, KPROBE_EVENTS},
    resolver::DentryResolver,
    store::{PathEntryStore, PATHNAMES_TABLE},
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("cache size must be greater than zero")]
    InvalidCacheSize,
    #[error("max path depth must be greater than zero")]
    InvalidMaxPathDepth,
    #[error("invalid kprobe: {0}")]
    InvalidKprobe(String),
}

/// kpath configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub kprobe_events: PathBuf,
    pub table: String,
    pub cache_size: usize,
    pub max_path_depth: u16,
    pub kprobes: Vec<KProbe>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kprobe_events: PathBuf::from(KPROBE_EVENTS),
            table: PATHNAMES_TABLE.into(),
            cache_size: DEFAULT_CACHE_SIZE,
            max_path_depth: MAX_PATH_DEPTH,
            kprobes: vec![],
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        Self::from_yaml(&fs::read_to_string(p)?)
    }

    pub fn from_yaml(s: &str) -> Result<Self, Error> {
        let conf: Self = serde_yaml::from_str(s)?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.cache_size == 0 {
            return Err(Error::InvalidCacheSize);
        }

        if self.max_path_depth == 0 {
            return Err(Error::InvalidMaxPathDepth);
        }

        for k in self.kprobes.iter() {
            if k.name.is_empty() {
                return Err(Error::InvalidKprobe("kprobe name cannot be empty".into()));
            }
        }

        Ok(())
    }

    pub fn kprobe_events<P: AsRef<Path>>(mut self, p: P) -> Self {
        self.kprobe_events = p.as_ref().to_path_buf();
        self
    }

    pub fn kprobe(mut self, k: KProbe) -> Self {
        self.kprobes.push(k);
        self
    }

    /// Builds a resolver, not started yet, according to configuration
    pub fn resolver<S: PathEntryStore>(&self) -> DentryResolver<S> {
        DentryResolver::with_cache_size(self.cache_size)
            .table(&self.table)
            .max_depth(self.max_path_depth)
    }

    pub fn kprobe_manager(&self) -> KprobeManager<KprobeEvents> {
        KprobeManager::new(KprobeEvents::new(&self.kprobe_events))
    }
}
