use crate::thread::Priority;

// pthread thread names are capped at 16 bytes, terminator included.
#[cfg(target_os = "linux")]
const PTHREAD_NAME_CAPACITY: usize = 16;

#[cfg(target_os = "linux")]
pub(crate) fn set_current_thread_name(name: &str) {
    let mut buf = [0 as libc::c_char; PTHREAD_NAME_CAPACITY];
    // Anything past 15 bytes is silently truncated; the untouched tail keeps
    // the buffer null-terminated.
    for (slot, byte) in buf[..PTHREAD_NAME_CAPACITY - 1].iter_mut().zip(name.bytes()) {
        *slot = byte as libc::c_char;
    }
    unsafe {
        libc::pthread_setname_np(libc::pthread_self(), buf.as_ptr());
    }
}

/// Applies the requested scheduling priority to the calling thread.
///
/// Everything here is best effort: the process may lack the privileges for
/// negative nice values or real-time policies, and a refusal must not break
/// the thread that asked for it.
#[cfg(target_os = "linux")]
pub(crate) fn set_current_thread_priority(priority: Priority) {
    match priority {
        Priority::Default => {}
        Priority::Low => {
            unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, 10) };
        }
        Priority::High => {
            let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, -10) };
            if ret != 0 {
                tracing::trace!("failed to raise thread priority, missing privileges");
            }
        }
        Priority::RealTime => {
            let param = libc::sched_param {
                sched_priority: unsafe { libc::sched_get_priority_max(libc::SCHED_FIFO) },
            };
            let ret = unsafe {
                libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param)
            };
            if ret != 0 {
                tracing::trace!("failed to enter real-time scheduling, missing privileges");
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_current_thread_name(_name: &str) {}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_current_thread_priority(_priority: Priority) {}
