use std::{borrow::Borrow, collections::HashMap, path::PathBuf, sync::Arc};

use aya::{
    maps::{HashMap as AyaHashMap, Map, MapData, MapError},
    Ebpf,
};
use kpath_common::path::{PATH_KEY_SIZE, PATH_VALUE_SIZE};
use log::warn;
use thiserror::Error;

/// Name of the table filled by the kernel side producer
pub const PATHNAMES_TABLE: &str = "pathnames";

#[derive(Debug, Error)]
pub enum Error {
    #[error("key not found")]
    NotFound,
    #[error("map: {0}")]
    Map(#[from] MapError),
}

/// Read only access to the `pathnames` table
pub trait PathEntryStore {
    /// Returns the raw value stored at `key`. A present value
    /// is at least [`PATH_VALUE_SIZE`] bytes long.
    fn get(&self, key: &[u8; PATH_KEY_SIZE]) -> Result<Vec<u8>, Error>;
}

impl<S: PathEntryStore + ?Sized> PathEntryStore for &S {
    fn get(&self, key: &[u8; PATH_KEY_SIZE]) -> Result<Vec<u8>, Error> {
        (**self).get(key)
    }
}

impl<S: PathEntryStore + ?Sized> PathEntryStore for Arc<S> {
    fn get(&self, key: &[u8; PATH_KEY_SIZE]) -> Result<Vec<u8>, Error> {
        (**self).get(key)
    }
}

pub type PathnamesMap = AyaHashMap<MapData, [u8; PATH_KEY_SIZE], [u8; PATH_VALUE_SIZE]>;

impl<T: Borrow<MapData>> PathEntryStore for AyaHashMap<T, [u8; PATH_KEY_SIZE], [u8; PATH_VALUE_SIZE]> {
    fn get(&self, key: &[u8; PATH_KEY_SIZE]) -> Result<Vec<u8>, Error> {
        match AyaHashMap::get(self, key, 0) {
            Ok(v) => Ok(v.to_vec()),
            Err(MapError::KeyNotFound) => Err(Error::NotFound),
            Err(e) => Err(e.into()),
        }
    }
}

/// Something a table can be looked up from by name
pub trait TableSource {
    type Table: PathEntryStore;

    /// Takes ownership of table `name`, None if it does not exist
    fn take_table(&mut self, name: &str) -> Option<Self::Table>;
}

#[inline]
fn pathnames_map(name: &str, map: Map) -> Option<PathnamesMap> {
    PathnamesMap::try_from(map)
        .inspect_err(|e| warn!("{name} is not a valid pathnames table: {e}"))
        .ok()
}

impl TableSource for Ebpf {
    type Table = PathnamesMap;

    fn take_table(&mut self, name: &str) -> Option<Self::Table> {
        pathnames_map(name, self.take_map(name)?)
    }
}

/// Tables pinned in a bpffs directory by the process owning
/// the kernel side producer
#[derive(Debug, Clone)]
pub struct PinnedMaps {
    dir: PathBuf,
}

impl Default for PinnedMaps {
    fn default() -> Self {
        Self::new("/sys/fs/bpf")
    }
}

impl PinnedMaps {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }
}

impl TableSource for PinnedMaps {
    type Table = PathnamesMap;

    fn take_table(&mut self, name: &str) -> Option<Self::Table> {
        let path = self.dir.join(name);
        let data = MapData::from_pin(&path)
            .inspect_err(|e| warn!("cannot open pinned map {}: {e}", path.to_string_lossy()))
            .ok()?;
        pathnames_map(name, Map::HashMap(data))
    }
}

impl<S: PathEntryStore> TableSource for HashMap<String, S> {
    type Table = S;

    fn take_table(&mut self, name: &str) -> Option<Self::Table> {
        self.remove(name)
    }
}
