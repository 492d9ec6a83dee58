//! The file-descriptor table (§3 "File Descriptor"): process-scoped by construction of its key,
//! `hash(filename || extension || pid)`, so two tasks opening the same file get independent
//! descriptors. Uses `BTreeMap` rather than a hash map crate — no hashing crate is in the
//! teacher's dependency graph, and `alloc::collections::BTreeMap` needs none.

use alloc::collections::BTreeMap;

use spin::Mutex;

pub type Handle = u64;

pub struct FileDescriptor {
    pub root_entry: usize,
    pub file_size: u32,
    pub offset: usize,
}

static TABLE: Mutex<Option<BTreeMap<Handle, FileDescriptor>>> = Mutex::new(None);

pub fn init() {
    *TABLE.lock() = Some(BTreeMap::new());
}

/// FNV-1a over `name || ext || pid`. Not cryptographic; just needs to disperse the small set of
/// (file, task) pairs a teaching OS ever has open at once.
fn hash(name8: &[u8; 8], ext3: &[u8; 3], pid: u64) -> Handle {
    let mut h: u64 = 0xcbf29ce484222325;
    let mut mix = |byte: u8| {
        h ^= byte as u64;
        h = h.wrapping_mul(0x100000001b3);
    };
    for &b in name8 {
        mix(b);
    }
    for &b in ext3 {
        mix(b);
    }
    for &b in &pid.to_le_bytes() {
        mix(b);
    }
    h
}

/// Register a new descriptor for `root_entry`, owned by `pid`. Collisions (the same file already
/// open by the same task) silently replace the old descriptor, matching a second `open()` call
/// resetting the offset.
pub fn open(name8: &[u8; 8], ext3: &[u8; 3], pid: u64, root_entry: usize, file_size: u32) -> Handle {
    let handle = hash(name8, ext3, pid);
    TABLE.lock().as_mut().unwrap().insert(
        handle,
        FileDescriptor {
            root_entry,
            file_size,
            offset: 0,
        },
    );
    handle
}

pub fn with<R>(handle: Handle, f: impl FnOnce(&mut FileDescriptor) -> R) -> Option<R> {
    TABLE.lock().as_mut().unwrap().get_mut(&handle).map(f)
}

pub fn close(handle: Handle) {
    TABLE.lock().as_mut().unwrap().remove(&handle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_file_different_pid_hashes_differ() {
        let name = *b"README  ";
        let ext = *b"TXT";
        assert_ne!(hash(&name, &ext, 1), hash(&name, &ext, 2));
    }

    #[test]
    fn same_file_same_pid_hashes_match() {
        let name = *b"README  ";
        let ext = *b"TXT";
        assert_eq!(hash(&name, &ext, 7), hash(&name, &ext, 7));
    }
}
