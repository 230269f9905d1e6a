//! Process inspection: liveness, start signatures and subtree search.
//!
//! The multiplexer's "current command" field only ever names the shell that
//! owns a pane; the assistant itself is a grandchild. Finding it means
//! walking the child-process tree rooted at the pane PID.

use std::cell::RefCell;
use sysinfo::{Pid, ProcessRefreshKind, System};

thread_local! {
    static SYSTEM: RefCell<System> = RefCell::new(System::new());
}

/// Signal-0 liveness probe.
pub fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        unsafe { nix::libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Unix start time of a process, used as a reuse-proof signature for the
/// global lock. Refreshes only the one PID.
pub fn process_start_time(pid: u32) -> Option<u64> {
    SYSTEM.with(|sys| {
        let mut sys = sys.borrow_mut();
        let spid = Pid::from(pid as usize);
        sys.refresh_process_specifics(spid, ProcessRefreshKind::new());
        sys.process(spid).map(|p| p.start_time())
    })
}

/// Searches the process subtree rooted at `root` for the assistant.
///
/// A process qualifies when its command name contains one of `needles`
/// (e.g. `codex`) or equals `node` exactly. Returns the matching PID.
pub fn find_in_subtree(root: u32, needles: &[&str]) -> Option<u32> {
    SYSTEM.with(|sys| {
        let mut sys = sys.borrow_mut();
        sys.refresh_processes();

        let mut frontier = vec![Pid::from(root as usize)];
        while let Some(pid) = frontier.pop() {
            if let Some(process) = sys.process(pid) {
                let name = process.name().to_lowercase();
                if name == "node" || needles.iter().any(|n| name.contains(n)) {
                    return Some(pid.as_u32());
                }
            }
            for (child_pid, child) in sys.processes() {
                if child.parent() == Some(pid) {
                    frontier.push(*child_pid);
                }
            }
        }
        None
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn test_bogus_pid_is_dead() {
        assert!(!pid_alive(999_999_999));
    }

    #[test]
    fn test_start_time_of_self() {
        let t = process_start_time(std::process::id());
        assert!(t.is_some());
        assert!(t.unwrap() > 0);
    }

    #[test]
    fn test_subtree_match_on_own_name() {
        // The test binary's own name is in its subtree root.
        let me = std::process::id();
        let name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_lowercase()))
            .unwrap_or_default();
        // Use a prefix of our own binary name as the needle.
        let needle = &name[..name.len().min(8)];
        assert_eq!(find_in_subtree(me, &[needle]), Some(me));
    }

    #[test]
    fn test_subtree_no_match() {
        let me = std::process::id();
        assert_eq!(find_in_subtree(me, &["definitely-not-a-process"]), None);
    }
}
