/*!
    promotion of the cyclic exchange thread to realtime scheduling

    This is best effort: without the required privileges (typically `CAP_SYS_NICE` and `CAP_IPC_LOCK`), each step fails with a warning and the thread keeps running with a normal priority. Only linux is supported.
*/

/// lock the process memory, then give the current thread the highest IO and FIFO scheduling priorities
#[cfg(target_os = "linux")]
pub fn promote_current_thread() {
    use thread_priority::{ThreadPriority, ThreadSchedulePolicy, RealtimeThreadSchedulePolicy};

    // page faults in the cyclic loop would break its period
    if unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) } != 0 {
        log::warn!("cannot lock process memory: {}", std::io::Error::last_os_error());
    }
    if let Err(err) = ioprio::set_priority(
            ioprio::Target::Process(ioprio::Pid::this()),
            ioprio::Priority::new(ioprio::Class::Realtime(ioprio::RtPriorityLevel::highest())),
            ) {
        log::warn!("cannot set realtime io priority: {}", err);
    }
    if let Err(err) = thread_priority::set_thread_priority_and_policy(
            thread_priority::thread_native_id(),
            ThreadPriority::Max,
            ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
            ) {
        log::warn!("cannot set realtime thread priority: {:?}", err);
        return;
    }
    log::info!("cyclic thread promoted to realtime");
}

#[cfg(not(target_os = "linux"))]
pub fn promote_current_thread() {
    log::warn!("realtime promotion is not supported on this platform");
}
