//! The per-task state held by the scheduler's task list — §3 "Task", §4.5.

use x86_64::structures::idt::InterruptStackFrame;

/// The general-purpose register image captured by the syscall and context-switch trampolines.
///
/// Field order is load-bearing: it mirrors the push order of `interrupts::syscall::entry`'s
/// naked prologue exactly, so that a `*mut Registers` cast directly onto the live kernel stack
/// lines the struct's fields up with the pushed words without any copying. The last-pushed
/// register (`rax`) sits at the lowest address, i.e. first in the struct.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

/// Lifecycle states a `Task` moves through — §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Runnable,
    Running,
    Waiting,
}

/// The saved frame a context switch restores into the CPU: the pieces the interrupt frame itself
/// carries (RIP, code/stack selectors, RFLAGS, RSP) plus the sixteen general registers and CR3.
/// A `Running` task's copy here is stale -- the CPU holds the live values -- until the moment it
/// is preempted, at which point this becomes authoritative again.
#[derive(Debug, Clone, Copy)]
pub struct SavedImage {
    pub rip: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub cs: u64,
    pub ss: u64,
    pub gprs: Registers,
    pub cr3: u64,
}

impl SavedImage {
    /// An image suitable for a brand-new task that has never run: entry point, a fresh stack top,
    /// the given selectors, IF set in RFLAGS, and zeroed general registers.
    pub fn fresh(entry: u64, stack_top: u64, cs: u64, ss: u64, cr3: u64) -> Self {
        const IF: u64 = 1 << 9;
        SavedImage {
            rip: entry,
            rflags: IF,
            rsp: stack_top,
            cs,
            ss,
            gprs: Registers::default(),
            cr3,
        }
    }

    /// Capture the outgoing task's image from the interrupt frame the timer trampoline was
    /// handed, plus the GPRs a sibling trampoline already saved to the stack.
    pub fn capture(esf: &InterruptStackFrame, gprs: Registers, cr3: u64) -> Self {
        SavedImage {
            rip: esf.instruction_pointer.as_u64(),
            rflags: esf.cpu_flags,
            rsp: esf.stack_pointer.as_u64(),
            cs: esf.code_segment,
            ss: esf.stack_segment,
            gprs,
            cr3,
        }
    }
}

pub type Pid = u64;

/// A schedulable unit of execution -- §3 "Task".
pub struct Task {
    pub pid: Pid,
    pub state: TaskState,
    pub image: SavedImage,
    pub kernel_stack_top: u64,
    /// `None` for kernel tasks, which never leave ring 0.
    pub user_stack_top: Option<u64>,
    pub context_switches: u64,
}

impl Task {
    pub fn new_kernel(pid: Pid, entry: u64, kernel_stack_top: u64, cs: u64, ss: u64, cr3: u64) -> Self {
        Task {
            pid,
            state: TaskState::Created,
            image: SavedImage::fresh(entry, kernel_stack_top, cs, ss, cr3),
            kernel_stack_top,
            user_stack_top: None,
            context_switches: 0,
        }
    }

    pub fn new_user(
        pid: Pid,
        entry: u64,
        user_stack_top: u64,
        kernel_stack_top: u64,
        cs: u64,
        ss: u64,
        cr3: u64,
    ) -> Self {
        Task {
            pid,
            state: TaskState::Created,
            image: SavedImage::fresh(entry, user_stack_top, cs, ss, cr3),
            kernel_stack_top,
            user_stack_top: Some(user_stack_top),
            context_switches: 0,
        }
    }

    pub fn is_user(&self) -> bool {
        self.user_stack_top.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_image_has_interrupts_enabled() {
        let img = SavedImage::fresh(0x1000, 0x2000, 8, 16, 0x3000);
        assert_eq!(img.rflags & (1 << 9), 1 << 9);
        assert_eq!(img.rip, 0x1000);
        assert_eq!(img.rsp, 0x2000);
    }

    #[test]
    fn new_kernel_task_has_no_user_stack() {
        let t = Task::new_kernel(1, 0x1000, 0x2000, 8, 16, 0x3000);
        assert!(!t.is_user());
        assert_eq!(t.state, TaskState::Created);
    }
}
