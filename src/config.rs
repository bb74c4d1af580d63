//! Mount-time configuration (spec.md §6, ambient per SPEC_FULL.md).
//!
//! The reference implementation keeps the equivalent of this state in
//! `request_uid`/`request_gid` process globals and a handful of mount-flag
//! command line switches. §9's design notes call that out as something an
//! adapter-facing port should not repeat, so here it is plain data the
//! adapter constructs once at mount time and passes in.

use crate::error::{FatError, Result};

/// Inputs the adapter supplies when mounting a filesystem.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Mount read-only regardless of what the on-disk clean flag says.
    pub read_only: bool,
    /// Upper bound, in bytes, on the block cache's resident set.
    pub cache_budget_bytes: usize,
    /// Owner reported for every inode (FAT has no on-disk uid/gid).
    pub uid: u32,
    /// Group reported for every inode.
    pub gid: u32,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            read_only: false,
            cache_budget_bytes: DEFAULT_CACHE_BUDGET_BYTES,
            uid: 0,
            gid: 0,
        }
    }
}

/// Default block cache budget when the adapter does not specify one: 4 MiB.
pub const DEFAULT_CACHE_BUDGET_BYTES: usize = 4 * 1024 * 1024;

impl MountOptions {
    /// Parse the `cache=<N>[K|M|G|%]` mount option grammar.
    ///
    /// `device_bytes` is the size of the backing device, needed to resolve
    /// a `%` suffix. Returns the cache budget in bytes.
    pub fn parse_cache_budget(spec: &str, device_bytes: u64) -> Result<usize> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(FatError::InvalidName);
        }
        let (digits, suffix) = match spec.chars().last() {
            Some(c) if c.is_ascii_digit() => (spec, None),
            Some(c) => (&spec[..spec.len() - c.len_utf8()], Some(c)),
            None => return Err(FatError::InvalidName),
        };
        let n: u64 = digits.parse().map_err(|_| FatError::InvalidName)?;
        let bytes = match suffix {
            None => n,
            Some('K') | Some('k') => n.saturating_mul(1024),
            Some('M') | Some('m') => n.saturating_mul(1024 * 1024),
            Some('G') | Some('g') => n.saturating_mul(1024 * 1024 * 1024),
            Some('%') => {
                if n == 0 || n > 100 {
                    return Err(FatError::InvalidName);
                }
                device_bytes.saturating_mul(n) / 100
            }
            Some(_) => return Err(FatError::InvalidName),
        };
        if bytes == 0 {
            return Err(FatError::InvalidName);
        }
        Ok(bytes as usize)
    }
}

/// Per-call identity context, replacing the reference's
/// `request_uid`/`request_gid` globals (spec.md §9).
///
/// Every [`Inode`](crate::inode::Inode) operation that needs to know who is
/// asking (`chmod`, `chown`, permission checks) takes one of these instead
/// of consulting ambient state.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperationContext {
    pub uid: u32,
    pub gid: u32,
}

impl OperationContext {
    pub fn new(uid: u32, gid: u32) -> Self {
        OperationContext { uid, gid }
    }

    /// Whether this caller is allowed to chown/chmod an inode mounted with
    /// the given identity — the mount's "no-op chown" policy (SPEC_FULL.md).
    pub fn matches_mount_identity(&self, mount: &MountOptions) -> bool {
        self.uid == mount.uid && self.gid == mount.gid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_bytes() {
        assert_eq!(MountOptions::parse_cache_budget("4096", 0).unwrap(), 4096);
    }

    #[test]
    fn parses_suffixes() {
        assert_eq!(MountOptions::parse_cache_budget("4K", 0).unwrap(), 4096);
        assert_eq!(
            MountOptions::parse_cache_budget("2M", 0).unwrap(),
            2 * 1024 * 1024
        );
        assert_eq!(
            MountOptions::parse_cache_budget("1G", 0).unwrap(),
            1024 * 1024 * 1024
        );
    }

    #[test]
    fn parses_percent_of_device() {
        assert_eq!(
            MountOptions::parse_cache_budget("10%", 1_000_000).unwrap(),
            100_000
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(MountOptions::parse_cache_budget("", 0).is_err());
        assert!(MountOptions::parse_cache_budget("four", 0).is_err());
        assert!(MountOptions::parse_cache_budget("0%", 100).is_err());
        assert!(MountOptions::parse_cache_budget("101%", 100).is_err());
    }
}
