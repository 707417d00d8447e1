//! Types whose binary layout is shared with the kernel side
//! producer filling the `pathnames` table.
//!
//! Without the `user` feature the crate is `no_std`, so the layout
//! can be pulled by the eBPF side. Userland conveniences (error
//! trait, lossy names) are only available with `user`.
#![cfg_attr(not(any(feature = "user", test)), no_std)]

pub mod path;
