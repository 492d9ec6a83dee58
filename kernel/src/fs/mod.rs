//! C6 (file-system half) — the FAT12 volume, its block-device backend, the per-task file
//! descriptor table, and the program loader that backs the `execute` syscall. §4.6/§6.

pub mod ata;
pub mod fat12;
pub mod fd;
pub mod loader;

/// Bring up the file-system-adjacent state that needs an explicit init call (the fd table, by
/// the same `Mutex<Option<_>>` + `init()` convention `interrupts::kbd` uses). The FAT12 volume
/// itself lazily loads its root directory and FAT on first access, matching the original's
/// `RootDirectoryLoaded` guard.
pub fn init() {
    fd::init();
    printk!("\tfs inited\n");
}
