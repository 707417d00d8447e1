use kpath_common::path::{self, PathKey, PathValue, MAX_PATH_DEPTH};
use log::{debug, info};
use thiserror::Error;

use crate::cache::{ResolutionCache, DEFAULT_CACHE_SIZE};
use crate::store::{self, PathEntryStore, PathnamesMap, TableSource, PATHNAMES_TABLE};

/// Prefix of a path whose resolution stopped before reaching the root
pub const ERROR_MARKER: &str = "*ERROR*";

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} table doesn't exist")]
    TableMissing(String),
    #[error("resolver is not started")]
    NotStarted,
    #[error("{0}")]
    Path(#[from] path::Error),
    #[error("unable to get filename for {key}: {source}")]
    Store {
        key: PathKey,
        source: store::Error,
    },
    #[error("failed to decode received data for {key}: {source}")]
    Decode {
        key: PathKey,
        source: path::Error,
    },
    #[error("max path depth has been reached")]
    ReachedMaxPathDepth,
}

/// Resolver reading paths out of the kernel `pathnames` table
pub type PathnamesResolver = DentryResolver<PathnamesMap>;

/// Rebuilds dentry paths from the parent chain stored in the
/// `pathnames` table. Decoded entries are kept in a LRU cache
/// shared by all callers.
pub struct DentryResolver<S> {
    table: String,
    pathnames: Option<S>,
    cache: ResolutionCache,
    max_depth: u16,
}

impl<S: PathEntryStore> Default for DentryResolver<S> {
    fn default() -> Self {
        Self::with_cache_size(DEFAULT_CACHE_SIZE)
    }
}

impl<S: PathEntryStore> DentryResolver<S> {
    pub fn with_cache_size(cap: usize) -> Self {
        Self {
            table: PATHNAMES_TABLE.into(),
            pathnames: None,
            cache: ResolutionCache::with_max_entries(cap),
            max_depth: MAX_PATH_DEPTH,
        }
    }

    /// Name of the table looked up by [`DentryResolver::start`]
    pub fn table<T: AsRef<str>>(mut self, name: T) -> Self {
        self.table = name.as_ref().to_string();
        self
    }

    pub fn max_depth(mut self, depth: u16) -> Self {
        self.max_depth = depth;
        self
    }

    /// Binds the resolver to an already opened table
    pub fn with_store(mut self, store: S) -> Self {
        self.pathnames = Some(store);
        self
    }

    /// Binds the resolver to the live table. This is the only
    /// resolver error meant to be fatal.
    pub fn start<T: TableSource<Table = S>>(&mut self, source: &mut T) -> Result<(), Error> {
        let pathnames = source
            .take_table(&self.table)
            .ok_or_else(|| Error::TableMissing(self.table.clone()))?;
        self.pathnames = Some(pathnames);
        info!("dentry resolver bound to table {}", self.table);
        Ok(())
    }

    #[inline(always)]
    pub fn is_started(&self) -> bool {
        self.pathnames.is_some()
    }

    #[inline]
    pub fn cache(&self) -> &ResolutionCache {
        &self.cache
    }

    fn fetch(&self, key: &PathKey) -> Result<PathValue, Error> {
        let pathnames = self.pathnames.as_ref().ok_or(Error::NotStarted)?;
        let raw = pathnames
            .get(&key.to_bytes())
            .map_err(|source| Error::Store { key: *key, source })?;
        PathValue::read(&raw).map_err(|source| Error::Decode { key: *key, source })
    }

    fn lookup(&self, key: &PathKey) -> Result<PathValue, Error> {
        let raw_key = key.to_bytes();
        if let Some(v) = self.cache.get(&raw_key) {
            return Ok(v);
        }

        let v = self.fetch(key)?;
        self.cache.put(raw_key, v);
        Ok(v)
    }

    // walks up the parent chain starting at key, the returned path
    // contains everything accumulated before an error occurred.
    // Only named segments count against max_depth, one extra lookup
    // is allowed for the terminating root record.
    fn walk(&self, mut key: PathKey) -> (String, Option<Error>) {
        let mut filename = String::new();
        let mut depth = 0u16;

        for _ in 0..=self.max_depth {
            let value = match self.lookup(&key) {
                Ok(v) => v,
                Err(e) => return (filename, Some(e)),
            };

            if !value.is_root() {
                if depth == self.max_depth {
                    return (filename, Some(Error::ReachedMaxPathDepth));
                }
                depth += 1;
                filename = format!("/{}{filename}", value.name());
            }

            if value.is_last() {
                return (filename, None);
            }

            key = value.parent;
        }

        (filename, Some(Error::ReachedMaxPathDepth))
    }

    /// Returns the name of a single dentry. The cache is bypassed.
    pub fn try_get_name(&self, mount_id: u32, inode: u64) -> Result<String, Error> {
        let key = PathKey::new(mount_id, inode).non_null()?;
        Ok(self.fetch(&key)?.name().into_owned())
    }

    /// Best effort version of [`DentryResolver::try_get_name`],
    /// an empty string is returned on error.
    pub fn get_name(&self, mount_id: u32, inode: u64) -> String {
        self.try_get_name(mount_id, inode)
            .inspect_err(|e| debug!("failed to get dentry name: {e}"))
            .unwrap_or_default()
    }

    /// Resolves the full path of a dentry. Unlike [`DentryResolver::resolve`]
    /// the partial path is dropped when an error occurs.
    pub fn try_resolve(&self, mount_id: u32, inode: u64) -> Result<String, Error> {
        let key = PathKey::new(mount_id, inode).non_null()?;

        match self.walk(key) {
            (partial, Some(e)) => {
                debug!("dropping partial path {partial:?} of {key}");
                Err(e)
            }
            (filename, None) if filename.is_empty() => Ok("/".into()),
            (filename, None) => Ok(filename),
        }
    }

    /// Resolves the full path of a dentry.
    ///
    /// This never fails: if the walk stops before reaching the root
    /// the path accumulated so far is returned prefixed with
    /// [`ERROR_MARKER`]. The null key resolves to an empty string.
    pub fn resolve(&self, mount_id: u32, inode: u64) -> String {
        let key = PathKey::new(mount_id, inode);
        if key.is_null() {
            return String::new();
        }

        match self.walk(key) {
            (partial, Some(e)) => {
                debug!("failed to resolve {key}: {e}");
                format!("{ERROR_MARKER}{partial}")
            }
            (filename, None) if filename.is_empty() => "/".into(),
            (filename, None) => filename,
        }
    }

    /// Drops the cached entry of a dentry so that next resolution
    /// reads it again from the table.
    pub fn invalidate(&self, mount_id: u32, inode: u64) {
        self.cache.invalidate(&PathKey::new(mount_id, inode).to_bytes())
    }

    pub fn clear_cache(&self) {
        self.cache.clear()
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, RwLock};

    use kpath_common::path::PATH_KEY_SIZE;

    use super::*;
    use crate::store::memory::MemoryTable;

    const NULL: PathKey = PathKey::new(0, 0);

    #[derive(Default)]
    struct CountingTable {
        table: RwLock<MemoryTable>,
        reads: AtomicUsize,
    }

    impl CountingTable {
        fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }

        fn insert(&self, key: PathKey, parent: PathKey, name: &str) {
            self.table.write().unwrap().insert(key, parent, name)
        }
    }

    impl PathEntryStore for CountingTable {
        fn get(&self, key: &[u8; PATH_KEY_SIZE]) -> Result<Vec<u8>, store::Error> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.table.read().unwrap().get(key)
        }
    }

    // A(1/3) -> B(1/2) -> C(1/1) -> root
    fn abc() -> Arc<CountingTable> {
        let t = CountingTable::default();
        t.insert(PathKey::new(1, 3), PathKey::new(1, 2), "c");
        t.insert(PathKey::new(1, 2), PathKey::new(1, 1), "b");
        t.insert(PathKey::new(1, 1), NULL, "a");
        Arc::new(t)
    }

    fn resolver(t: &Arc<CountingTable>) -> DentryResolver<Arc<CountingTable>> {
        DentryResolver::default().with_store(Arc::clone(t))
    }

    #[test]
    fn test_resolve_chain() {
        let t = abc();
        let r = resolver(&t);
        assert_eq!(r.resolve(1, 3), "/a/b/c");
        assert_eq!(r.resolve(1, 2), "/a/b");
        assert_eq!(r.try_resolve(1, 3).unwrap(), "/a/b/c");
    }

    #[test]
    fn test_resolve_root() {
        let t = CountingTable::default();
        t.insert(PathKey::new(4, 2), NULL, "/");
        t.insert(PathKey::new(5, 2), NULL, "");
        let r = DentryResolver::default().with_store(Arc::new(t));

        assert_eq!(r.resolve(4, 2), "/");
        assert_eq!(r.resolve(5, 2), "/");
        assert_eq!(r.try_resolve(4, 2).unwrap(), "/");
    }

    #[test]
    fn test_root_name_not_prepended() {
        let t = CountingTable::default();
        t.insert(PathKey::new(1, 10), PathKey::new(1, 2), "etc");
        t.insert(PathKey::new(1, 2), NULL, "/");
        let r = DentryResolver::default().with_store(Arc::new(t));

        assert_eq!(r.resolve(1, 10), "/etc");
    }

    #[test]
    fn test_idempotent_resolution() {
        let t = abc();
        let r = resolver(&t);

        let first = r.resolve(1, 3);
        assert_eq!(t.reads(), 3);
        let second = r.resolve(1, 3);
        assert_eq!(first, second);
        assert_eq!(t.reads(), 3);

        // parents are cached by the first walk
        assert_eq!(r.resolve(1, 1), "/a");
        assert_eq!(t.reads(), 3);
    }

    #[test]
    fn test_null_key() {
        let t = abc();
        let r = resolver(&t);

        assert_eq!(r.resolve(0, 0), "");
        assert_eq!(r.get_name(0, 0), "");
        assert!(matches!(
            r.try_resolve(0, 0),
            Err(Error::Path(path::Error::InvalidKey(_)))
        ));
        assert!(matches!(
            r.try_get_name(0, 0),
            Err(Error::Path(path::Error::InvalidKey(_)))
        ));
        assert_eq!(t.reads(), 0);
    }

    #[test]
    fn test_missing_key() {
        let t = abc();
        let r = resolver(&t);

        assert_eq!(r.get_name(1, 42), "");
        assert_eq!(r.resolve(1, 42), ERROR_MARKER);
        assert!(matches!(
            r.try_resolve(1, 42),
            Err(Error::Store {
                source: store::Error::NotFound,
                ..
            })
        ));
    }

    #[test]
    fn test_broken_chain() {
        let t = CountingTable::default();
        t.insert(PathKey::new(1, 3), PathKey::new(1, 2), "c");
        t.insert(PathKey::new(1, 2), PathKey::new(1, 9), "b");
        let r = DentryResolver::default().with_store(Arc::new(t));

        assert_eq!(r.resolve(1, 3), "*ERROR*/b/c");
    }

    #[test]
    fn test_decode_failure() {
        let t = CountingTable::default();
        t.insert(PathKey::new(1, 3), PathKey::new(1, 2), "c");
        t.table
            .write()
            .unwrap()
            .insert_raw(PathKey::new(1, 2), vec![0; 20]);
        let r = DentryResolver::default().with_store(Arc::new(t));

        assert_eq!(r.resolve(1, 3), "*ERROR*/c");
        assert!(matches!(r.try_resolve(1, 3), Err(Error::Decode { .. })));
        assert_eq!(r.get_name(1, 2), "");
        // a failed entry must not be cached
        assert!(r.cache().get(&PathKey::new(1, 2).to_bytes()).is_none());
    }

    #[test]
    fn test_cyclic_chain() {
        let t = CountingTable::default();
        t.insert(PathKey::new(1, 3), PathKey::new(1, 2), "x");
        t.insert(PathKey::new(1, 2), PathKey::new(1, 3), "y");
        let t = Arc::new(t);
        let r = resolver(&t).max_depth(8);

        let p = r.resolve(1, 3);
        assert!(p.starts_with(ERROR_MARKER));
        assert_eq!(p.matches('/').count(), 8);
        assert!(matches!(
            r.try_resolve(1, 3),
            Err(Error::ReachedMaxPathDepth)
        ));
        // looping entries come from the cache
        assert_eq!(t.reads(), 2);
    }

    #[test]
    fn test_cyclic_root_records() {
        let t = CountingTable::default();
        t.insert(PathKey::new(1, 3), PathKey::new(1, 2), "/");
        t.insert(PathKey::new(1, 2), PathKey::new(1, 3), "");
        let r = DentryResolver::default()
            .with_store(Arc::new(t))
            .max_depth(8);

        assert_eq!(r.resolve(1, 3), ERROR_MARKER);
        assert!(matches!(
            r.try_resolve(1, 3),
            Err(Error::ReachedMaxPathDepth)
        ));
    }

    #[test]
    fn test_poisoned_cache() {
        let t = abc();
        let r = resolver(&t);
        r.cache().poison();

        assert_eq!(r.resolve(1, 3), "/a/b/c");
        assert_eq!(r.try_resolve(1, 3).unwrap(), "/a/b/c");
        // every walk goes to the table
        assert_eq!(t.reads(), 6);
    }

    // chain of depth components named "d" under a "/" root record (1/1)
    fn deep_chain(depth: u64) -> Arc<CountingTable> {
        let t = CountingTable::default();
        t.insert(PathKey::new(1, 1), NULL, "/");
        for inode in 2..=depth + 1 {
            t.insert(PathKey::new(1, inode), PathKey::new(1, inode - 1), "d");
        }
        Arc::new(t)
    }

    #[test]
    fn test_depth_boundary() {
        let t = deep_chain(8);
        let r = resolver(&t).max_depth(8);
        assert_eq!(r.resolve(1, 9), "/d".repeat(8));
        assert_eq!(r.try_resolve(1, 9).unwrap(), "/d".repeat(8));

        let t = deep_chain(MAX_PATH_DEPTH as u64);
        let r = resolver(&t);
        let p = r.resolve(1, MAX_PATH_DEPTH as u64 + 1);
        assert!(!p.starts_with(ERROR_MARKER));
        assert_eq!(p.matches('/').count(), MAX_PATH_DEPTH as usize);
    }

    #[test]
    fn test_depth_exceeded() {
        let t = deep_chain(9);
        let r = resolver(&t).max_depth(8);

        let p = r.resolve(1, 10);
        assert_eq!(p, format!("{ERROR_MARKER}{}", "/d".repeat(8)));
        assert!(matches!(
            r.try_resolve(1, 10),
            Err(Error::ReachedMaxPathDepth)
        ));

        // no root record, the last component ends the chain
        let t = CountingTable::default();
        t.insert(PathKey::new(1, 1), NULL, "d");
        for inode in 2..=9 {
            t.insert(PathKey::new(1, inode), PathKey::new(1, inode - 1), "d");
        }
        let r = DentryResolver::default()
            .with_store(Arc::new(t))
            .max_depth(8);
        assert_eq!(r.resolve(1, 8), "/d".repeat(8));
        assert!(r.resolve(1, 9).starts_with(ERROR_MARKER));
    }

    #[test]
    fn test_get_name_bypasses_cache() {
        let t = abc();
        let r = resolver(&t);

        assert_eq!(r.get_name(1, 3), "c");
        assert_eq!(r.get_name(1, 3), "c");
        assert_eq!(t.reads(), 2);
        assert!(r.cache().get(&PathKey::new(1, 3).to_bytes()).is_none());
    }

    #[test]
    fn test_invalidate() {
        let t = abc();
        let r = resolver(&t);
        assert_eq!(r.resolve(1, 3), "/a/b/c");

        // inode reused by the kernel
        t.insert(PathKey::new(1, 3), PathKey::new(1, 2), "d");
        assert_eq!(r.resolve(1, 3), "/a/b/c");

        r.invalidate(1, 3);
        assert_eq!(r.resolve(1, 3), "/a/b/d");
        assert_eq!(t.reads(), 4);

        r.clear_cache();
        assert_eq!(r.resolve(1, 3), "/a/b/d");
        assert_eq!(t.reads(), 7);
    }

    #[test]
    fn test_start() {
        let mut source: HashMap<String, MemoryTable> = HashMap::new();
        let mut r: DentryResolver<MemoryTable> = DentryResolver::default();
        assert!(!r.is_started());
        assert_eq!(r.resolve(1, 1), ERROR_MARKER);
        assert!(matches!(r.try_get_name(1, 1), Err(Error::NotStarted)));

        assert!(matches!(
            r.start(&mut source),
            Err(Error::TableMissing(name)) if name == PATHNAMES_TABLE
        ));

        let mut table = MemoryTable::default();
        table.insert(PathKey::new(1, 1), NULL, "tmp");
        source.insert(PATHNAMES_TABLE.into(), table);
        r.start(&mut source).unwrap();

        assert!(r.is_started());
        assert_eq!(r.resolve(1, 1), "/tmp");
    }

    #[test]
    fn test_start_custom_table() {
        let mut source: HashMap<String, MemoryTable> = HashMap::new();
        source.insert("dentries".into(), MemoryTable::default());

        let mut r: DentryResolver<MemoryTable> = DentryResolver::default().table("dentries");
        r.start(&mut source).unwrap();
        assert!(r.is_started());
    }

    #[test]
    fn test_concurrent_resolution() {
        let t = abc();
        let r = resolver(&t);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..100 {
                        assert_eq!(r.resolve(1, 3), "/a/b/c");
                    }
                });
            }
        });

        // a key may be fetched by several threads before being cached
        assert!(t.reads() >= 3);
        assert!(t.reads() <= 3 * 8);
    }
}
