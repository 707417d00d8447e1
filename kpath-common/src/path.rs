use core::ffi::CStr;
use core::fmt;

#[cfg(feature = "user")]
use std::borrow::Cow;

/// Size of an encoded [`PathKey`]
pub const PATH_KEY_SIZE: usize = 16;
/// Size of the null padded name buffer of a [`PathValue`]
pub const MAX_NAME: usize = 256;
/// Size of an encoded [`PathValue`]
pub const PATH_VALUE_SIZE: usize = PATH_KEY_SIZE + MAX_NAME;

// a path deeper than this is either corrupted or looping, we
// never walk further than that when rebuilding a path
pub const MAX_PATH_DEPTH: u16 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    const fn native() -> Self {
        if cfg!(target_endian = "little") {
            Self::Little
        } else {
            Self::Big
        }
    }

    #[inline]
    fn u64_bytes(self, v: u64) -> [u8; 8] {
        match self {
            Self::Little => v.to_le_bytes(),
            Self::Big => v.to_be_bytes(),
        }
    }

    #[inline]
    fn u32_bytes(self, v: u32) -> [u8; 4] {
        match self {
            Self::Little => v.to_le_bytes(),
            Self::Big => v.to_be_bytes(),
        }
    }

    #[inline]
    fn read_u64(self, b: [u8; 8]) -> u64 {
        match self {
            Self::Little => u64::from_le_bytes(b),
            Self::Big => u64::from_be_bytes(b),
        }
    }

    #[inline]
    fn read_u32(self, b: [u8; 4]) -> u32 {
        match self {
            Self::Little => u32::from_le_bytes(b),
            Self::Big => u32::from_be_bytes(b),
        }
    }
}

/// Byte order of every integer stored in the `pathnames` table.
/// The table is filled by an eBPF program running in the kernel
/// of the same host, so this is the native byte order.
pub const BYTE_ORDER: ByteOrder = ByteOrder::native();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(thiserror::Error))]
pub enum Error {
    #[cfg_attr(feature = "user", error("invalid inode/mount_id couple: {0}"))]
    InvalidKey(PathKey),
    #[cfg_attr(
        feature = "user",
        error("cannot decode {what}: expected at least {expected} bytes, got {got}")
    )]
    ShortBuffer {
        what: &'static str,
        expected: usize,
        got: usize,
    },
}

// caller must have checked that b is large enough
#[inline(always)]
fn array_at<const N: usize>(b: &[u8], off: usize) -> [u8; N] {
    let mut a = [0u8; N];
    a.copy_from_slice(&b[off..off + N]);
    a
}

/// Identifies a dentry in the `pathnames` table.
///
/// Encoded layout (16 bytes, [`BYTE_ORDER`]):
///
/// | offset | size | field    |
/// |--------|------|----------|
/// | 0      | 8    | inode    |
/// | 8      | 4    | mount_id |
/// | 12     | 4    | padding  |
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq)]
pub struct PathKey {
    pub inode: u64,
    pub mount_id: u32,
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}/{:x}", self.mount_id, self.inode)
    }
}

impl PathKey {
    pub const fn new(mount_id: u32, inode: u64) -> Self {
        Self { inode, mount_id }
    }

    /// The null key is a reserved value and is never looked up
    #[inline(always)]
    pub const fn is_null(&self) -> bool {
        self.inode == 0 && self.mount_id == 0
    }

    /// Returns the key itself or [`Error::InvalidKey`] if it is the null key
    #[inline]
    pub fn non_null(self) -> Result<Self, Error> {
        if self.is_null() {
            return Err(Error::InvalidKey(self));
        }
        Ok(self)
    }

    #[inline]
    pub fn write(&self, buffer: &mut [u8; PATH_KEY_SIZE]) {
        buffer[0..8].copy_from_slice(&BYTE_ORDER.u64_bytes(self.inode));
        buffer[8..12].copy_from_slice(&BYTE_ORDER.u32_bytes(self.mount_id));
        buffer[12..16].fill(0);
    }

    /// Decodes a key from the first 16 bytes of `buffer`, padding is ignored
    #[inline]
    pub fn read(buffer: &[u8]) -> Result<Self, Error> {
        if buffer.len() < PATH_KEY_SIZE {
            return Err(Error::ShortBuffer {
                what: "path key",
                expected: PATH_KEY_SIZE,
                got: buffer.len(),
            });
        }

        Ok(Self {
            inode: BYTE_ORDER.read_u64(array_at(buffer, 0)),
            mount_id: BYTE_ORDER.read_u32(array_at(buffer, 8)),
        })
    }

    #[inline]
    pub fn to_bytes(&self) -> [u8; PATH_KEY_SIZE] {
        let mut b = [0u8; PATH_KEY_SIZE];
        self.write(&mut b);
        b
    }
}

/// A `pathnames` table record: the key of the parent dentry
/// followed by the null padded name of the dentry itself.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PathValue {
    pub parent: PathKey,
    name: [u8; MAX_NAME],
}

impl fmt::Debug for PathValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathValue")
            .field("parent", &self.parent)
            .field(
                "name",
                &core::str::from_utf8(self.name_bytes()).unwrap_or("<non utf8>"),
            )
            .finish()
    }
}

impl Default for PathValue {
    fn default() -> Self {
        Self {
            parent: PathKey::default(),
            name: [0; MAX_NAME],
        }
    }
}

impl PathValue {
    /// Builds a value, `name` is truncated to [`MAX_NAME`] bytes
    pub fn new<S: AsRef<[u8]>>(parent: PathKey, name: S) -> Self {
        let src = name.as_ref();
        let n = src.len().min(MAX_NAME);
        let mut v = Self {
            parent,
            ..Default::default()
        };
        v.name[..n].copy_from_slice(&src[..n]);
        v
    }

    /// Decodes a value from the first [`PATH_VALUE_SIZE`] bytes of `buffer`
    pub fn read(buffer: &[u8]) -> Result<Self, Error> {
        if buffer.len() < PATH_VALUE_SIZE {
            return Err(Error::ShortBuffer {
                what: "path value",
                expected: PATH_VALUE_SIZE,
                got: buffer.len(),
            });
        }

        Ok(Self {
            parent: PathKey::read(buffer)?,
            name: array_at(buffer, PATH_KEY_SIZE),
        })
    }

    pub fn write(&self, buffer: &mut [u8; PATH_VALUE_SIZE]) {
        let mut key = [0u8; PATH_KEY_SIZE];
        self.parent.write(&mut key);
        buffer[..PATH_KEY_SIZE].copy_from_slice(&key);
        buffer[PATH_KEY_SIZE..].copy_from_slice(&self.name);
    }

    pub fn to_bytes(&self) -> [u8; PATH_VALUE_SIZE] {
        let mut b = [0u8; PATH_VALUE_SIZE];
        self.write(&mut b);
        b
    }

    /// Name bytes up to the first null byte. A name filling the whole
    /// buffer without terminator is returned entirely.
    #[inline]
    pub fn name_bytes(&self) -> &[u8] {
        CStr::from_bytes_until_nul(&self.name)
            .map(|c| c.to_bytes())
            .unwrap_or(&self.name)
    }

    /// Name with invalid UTF-8 sequences replaced
    #[cfg(feature = "user")]
    #[inline]
    pub fn name(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.name_bytes())
    }

    /// The root dentry has an empty name or a name starting with '/'
    #[inline]
    pub fn is_root(&self) -> bool {
        matches!(self.name[0], 0 | b'/')
    }

    /// True when there is no parent to walk to
    #[inline]
    pub fn is_last(&self) -> bool {
        self.parent.inode == 0
    }
}
