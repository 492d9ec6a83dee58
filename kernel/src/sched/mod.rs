//! C5 — the round-robin preemptive scheduler and task list, §3 "Task List"/§4.5.
//!
//! The original C kernel's task list is a raw circular doubly-linked list, head-is-running. This
//! crate keeps that externally observable contract (the head is whichever task is
//! Running/most-recently-preempted; rotation is strict FIFO; a terminated task is unlinked
//! before it would have been selected again) but represents it as a `Vec<Task>` rotated
//! front-to-back under a single `spin::Mutex`, the same simplification the teacher's own
//! `sched`/`process` modules make over a hand-rolled linked list -- the only thing that matters
//! to callers and to the §8 fairness property is the rotation order, not the node representation.
//!
//! Context switching itself happens in exactly two places, both naked trampolines that capture
//! every general-purpose register onto the kernel stack before handing off to this module:
//! the timer IRQ (preemption, `on_tick`) and the `terminate` syscall (a task unlinking itself
//! must not resume into its own now-dead context, `terminate_current_and_switch`). Every other
//! syscall runs to completion and returns into the *same* task, so it never needs to touch this
//! module's rotation at all.

pub mod task;

use alloc::vec::Vec;

use spin::Mutex;

use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

use crate::interrupts::SELECTORS;
use crate::sched::task::{Pid, Registers, SavedImage, Task, TaskState};

/// The raw interrupt-stack-frame shape pushed by the CPU for a vector with no error code --
/// exactly what both the timer IRQ and the `int 0x80` syscall trap leave above the GPRs the
/// naked trampolines push. Laid out low-to-high the way the CPU pushes it (RIP first).
#[repr(C)]
pub struct RawIsf {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

struct Scheduler {
    /// Index 0 is always the head: the task that is Running, or was most recently preempted from.
    tasks: Vec<Task>,
    next_pid: Pid,
}

impl Scheduler {
    const fn empty() -> Self {
        Scheduler { tasks: Vec::new(), next_pid: 1 }
    }
}

static SCHED: Mutex<Scheduler> = Mutex::new(Scheduler::empty());

/// Initialize the scheduler with no tasks. Called once from `kernel_main` before any task is
/// created.
pub fn init() {
    *SCHED.lock() = Scheduler::empty();
    printk!("\tsched inited\n");
}

/// Create a kernel-mode task: runs at ring 0, shares the kernel's current CR3, and starts with a
/// fresh register image pointing at `entry` with `kernel_stack_top` as its only stack.
pub fn spawn_kernel(entry: u64, kernel_stack_top: u64) -> Pid {
    let selectors = SELECTORS.lock();
    let cr3 = Cr3::read().0.start_address().as_u64();
    let mut sched = SCHED.lock();
    let pid = sched.next_pid;
    sched.next_pid += 1;

    let mut task = Task::new_kernel(
        pid,
        entry,
        kernel_stack_top,
        selectors.kernel_cs.0 as u64,
        selectors.kernel_ss.0 as u64,
        cr3,
    );
    task.state = TaskState::Runnable;
    sched.tasks.push(task);
    pid
}

/// Create a user-mode task: runs at ring 3 in the address space `cr3` (already populated by the
/// FAT12 loader), with separate user and kernel stacks per §3 "Task".
pub fn spawn_user(entry: u64, user_stack_top: u64, kernel_stack_top: u64, cr3: u64) -> Pid {
    let selectors = SELECTORS.lock();
    let mut sched = SCHED.lock();
    let pid = sched.next_pid;
    sched.next_pid += 1;

    let mut task = Task::new_user(
        pid,
        entry,
        user_stack_top,
        kernel_stack_top,
        selectors.user_cs.0 as u64,
        selectors.user_ss.0 as u64,
        cr3,
    );
    task.state = TaskState::Runnable;
    sched.tasks.push(task);
    pid
}

/// PID of the task at the head of the list (Running, or most recently preempted), or 0 if the
/// scheduler has not dispatched its first task yet.
pub fn current_pid() -> Pid {
    SCHED.lock().tasks.first().map(|t| t.pid).unwrap_or(0)
}

/// Number of times the task at the head has been context-switched into. Exposed for the §8
/// fairness property (`ContextSwitches`).
pub fn current_context_switches() -> u64 {
    SCHED.lock().tasks.first().map(|t| t.context_switches).unwrap_or(0)
}

/// Context-switches recorded for a specific PID, if it still exists.
pub fn context_switches_of(pid: Pid) -> Option<u64> {
    SCHED.lock().tasks.iter().find(|t| t.pid == pid).map(|t| t.context_switches)
}

/// Remove a task from the list by PID without switching anything in place -- used when a task
/// other than the current one is being torn down (no such syscall exists today, but this is the
/// unlink primitive §4.5 "Terminate(PID)" describes; `terminate_current_and_switch` is the path
/// the `terminate` syscall actually takes, since it must also perform a context switch).
pub fn terminate(pid: Pid) {
    SCHED.lock().tasks.retain(|t| t.pid != pid);
}

/// Load the selectors/CR3/stack of `task` so it becomes live, writing its register image
/// (everything but `rax`, left for the caller's own return-value convention) into `regs` and its
/// interrupt frame into `isf`. Updates `TSS.RSP0` and loads `CR3`. Returns the value that should
/// end up in the resumed task's `rax`.
unsafe fn stage(task: &Task, regs: *mut Registers, isf: *mut RawIsf) -> u64 {
    let img = &task.image;
    let saved_rax = img.gprs.rax;
    *regs = img.gprs;
    (*isf).rip = img.rip;
    (*isf).cs = img.cs;
    (*isf).rflags = img.rflags;
    (*isf).rsp = img.rsp;
    (*isf).ss = img.ss;

    crate::interrupts::set_kernel_stack(task.kernel_stack_top);

    if Cr3::read().0.start_address().as_u64() != img.cr3 {
        let frame = PhysFrame::containing_address(PhysAddr::new(img.cr3));
        Cr3::write(frame, Cr3Flags::empty());
    }

    saved_rax
}

/// Capture the outgoing task's register image from the stack the trampoline just built.
unsafe fn capture(task: &mut Task, regs: *const Registers, isf: *const RawIsf) {
    let cr3 = Cr3::read().0.start_address().as_u64();
    task.image = SavedImage {
        rip: (*isf).rip,
        rflags: (*isf).rflags,
        rsp: (*isf).rsp,
        cs: (*isf).cs,
        ss: (*isf).ss,
        gprs: *regs,
        cr3,
    };
}

/// Driven by the timer vector (§4.5 "Context switch"): save the outgoing task, rotate it to the
/// tail as Runnable, promote the new head to Running, and stage its registers in place. A no-op
/// (beyond EOI, handled by the caller) if fewer than two tasks exist -- nothing to rotate into.
///
/// # Safety
/// `regs`/`isf` must point at the GPR block and CPU-pushed frame the timer trampoline just built
/// on the current kernel stack.
pub unsafe fn on_tick(regs: *mut Registers, isf: *mut RawIsf) {
    let mut sched = SCHED.lock();
    if sched.tasks.len() < 2 {
        return;
    }

    let mut outgoing = sched.tasks.remove(0);
    capture(&mut outgoing, regs, isf);
    outgoing.state = TaskState::Runnable;
    sched.tasks.push(outgoing);

    let incoming = &mut sched.tasks[0];
    incoming.state = TaskState::Running;
    incoming.context_switches += 1;
    let rax = stage(incoming, regs, isf);
    (*regs).rax = rax;
}

/// Driven by the `terminate` syscall (§4.5 "Terminate(PID)"): unlink the current task (it is
/// never re-enqueued) and stage the new head in its place. Unlike `on_tick`, there is always a
/// "next" task to resume as long as at least one other task exists; if the terminating task was
/// the last one, the kernel has nothing left to run and halts.
///
/// # Safety
/// Same contract as `on_tick`.
pub unsafe fn terminate_current_and_switch(regs: *mut Registers, isf: *mut RawIsf) -> u64 {
    let mut sched = SCHED.lock();
    if sched.tasks.is_empty() {
        return 0;
    }
    sched.tasks.remove(0);

    if sched.tasks.is_empty() {
        drop(sched);
        printk!("sched: last task terminated, halting\n");
        loop {
            x86_64::instructions::hlt();
        }
    }

    let incoming = &mut sched.tasks[0];
    incoming.state = TaskState::Running;
    incoming.context_switches += 1;
    stage(incoming, regs, isf)
}

/// Driven by a fatal-but-task-scoped fault (§8 E5: a user task's General Protection Fault is not
/// a machine-fatal error, just that task's end). Same shape as `terminate_current_and_switch`
/// but named separately so the GPF path reads as "kill", not "graceful exit".
///
/// # Safety
/// Same contract as `on_tick`.
pub unsafe fn kill_current_and_switch(regs: *mut Registers, isf: *mut RawIsf) -> u64 {
    terminate_current_and_switch(regs, isf)
}

/// Start the scheduler: the very first task at the head becomes Running in place (no context
/// switch needed -- `kernel_main`'s own call stack becomes that task's first "kernel stack frame"
/// by convention; the first timer tick preempts it exactly like any other task thereafter).
pub fn start() -> ! {
    {
        let mut sched = SCHED.lock();
        if let Some(first) = sched.tasks.first_mut() {
            first.state = TaskState::Running;
        }
    }
    loop {
        x86_64::instructions::hlt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_task(pid: Pid) -> Task {
        Task::new_kernel(pid, 0x1000, 0x2000, 8, 16, 0x3000)
    }

    #[test]
    fn rotation_is_strict_fifo() {
        let mut tasks = Vec::new();
        for pid in 1..=3 {
            tasks.push(dummy_task(pid));
        }
        // Simulate three rotations.
        for _ in 0..3 {
            let head = tasks.remove(0);
            tasks.push(head);
        }
        let pids: Vec<Pid> = tasks.iter().map(|t| t.pid).collect();
        assert_eq!(pids, alloc::vec![1, 2, 3]);
    }

    #[test]
    fn terminated_task_is_not_rescheduled() {
        let mut tasks = Vec::new();
        for pid in 1..=3 {
            tasks.push(dummy_task(pid));
        }
        tasks.retain(|t| t.pid != 2);
        let pids: Vec<Pid> = tasks.iter().map(|t| t.pid).collect();
        assert_eq!(pids, alloc::vec![1, 3]);
    }
}
