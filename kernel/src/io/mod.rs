//! The VGA text console — the "external collaborator" §1 describes as a memory-mapped 80×25
//! cell buffer, needed here because syscalls 1/5/6/8/9 (`printf`, `getcursor`, `setcursor`,
//! `print-root-dir`, `clear-screen`) are the only way a user task ever produces output.

pub mod vga;

/// Bring up the console. Called once from `kernel_main` after interrupts are live, the same spot
/// in the boot sequence `fs::fd::init` uses for its own table state (the keyboard driver needs no
/// equivalent call -- its modifier state is plain statics, ready before `kernel_main` even runs).
pub fn init() {
    vga::init();
    printk!("\tvga inited\n");
}
