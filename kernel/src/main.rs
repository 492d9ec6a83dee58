#![feature(
    lang_items,
    asm,
    alloc_error_handler,
    box_syntax,
    abi_x86_interrupt,
    panic_info_message,
    drain_filter,
    naked_functions
)]
// Compile without libstd
#![no_std]
#![no_main]
#![crate_type = "staticlib"]
#![crate_name = "kernel"]

extern crate alloc;

#[macro_use]
mod debug;
mod bare_bones;
mod fs;
mod interrupts;
mod io;
mod memory;
mod sched;
mod syscall;
mod time;

use bootloader::BootInfo;

/// The kernel heap
#[global_allocator]
static mut ALLOCATOR: memory::KernelAllocator = memory::KernelAllocator::new();

bootloader::entry_point!(kernel_main);

/// The init task's body: §4.6's `execute` demo path has no shell, so the init task just requests
/// the `demos/hello` FAT12 payload once at boot and otherwise idles.
fn init_task_entry() -> ! {
    let name: [u8; 11] = *b"HELLO   EXE";
    fs::loader::request_execute(name);
    loop {
        x86_64::instructions::hlt();
    }
}

/// This is the entry point to the kernel. It is the first rust code that runs.
#[no_mangle]
fn kernel_main(boot_info: &'static BootInfo) -> ! {
    // At this point we are still in the provisional environment with
    // - the temporary page tables (first 2MiB of memory direct mapped)
    // - no IDT
    // - no current task

    // Make sure interrupts are off
    x86_64::instructions::interrupts::disable();

    // Let everyone know we are here
    printk!("\nYo Yo Yo! Made it to `kernel_main`! Hooray!\n");

    // Initialize memory
    printk!("Memory ...\n");
    memory::init(unsafe { &mut ALLOCATOR }, boot_info);
    printk!("Memory ✔\n");

    // Set up interrupt/exception handling
    printk!("Interrupts...\n\t");
    interrupts::init();
    printk!("Interrupts ✔\n");

    // I/O (the VGA console)
    printk!("I/O ...\n");
    io::init();
    printk!("I/O ✔\n");

    // File system (FAT12 volume is lazily loaded on first access; the fd table needs an init
    // call the same as kbd/io do)
    printk!("File system ...\n");
    fs::init();
    printk!("File system ✔\n");

    // Scheduler and tasks
    printk!("Scheduler ...\n");
    sched::init();

    // The head of the task list becomes `kernel_main`'s own continuation through `sched::start`'s
    // `hlt` loop -- its image is never staged from until the first time it is preempted and
    // rotated back around, at which point `on_tick`'s `capture` has already overwritten it with
    // this function's real register state.
    sched::spawn_kernel(kernel_main as u64, fs::loader::alloc_kernel_stack());

    // The FAT12 loader's worker task (§4.6 "A dedicated kernel task polls this slot").
    sched::spawn_kernel(
        fs::loader::worker_task_entry as u64,
        fs::loader::alloc_kernel_stack(),
    );

    // A small init task that kicks off the first `execute` request.
    sched::spawn_kernel(init_task_entry as u64, fs::loader::alloc_kernel_stack());

    printk!("Scheduler ✔\n");

    // We can turn on interrupts now.
    x86_64::instructions::interrupts::enable();

    // Start the first task
    sched::start();

    // We never return...
}
