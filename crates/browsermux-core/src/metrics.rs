use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct MuxMetricsSnapshot {
    pub commands: u64,
    pub command_failures: u64,
    pub events: u64,
    pub frames: u64,
    pub sessions_created: u64,
    pub sessions_destroyed: u64,
}

static COMMANDS: AtomicU64 = AtomicU64::new(0);
static COMMAND_FAILURES: AtomicU64 = AtomicU64::new(0);
static EVENTS: AtomicU64 = AtomicU64::new(0);
static FRAMES: AtomicU64 = AtomicU64::new(0);
static SESSIONS_CREATED: AtomicU64 = AtomicU64::new(0);
static SESSIONS_DESTROYED: AtomicU64 = AtomicU64::new(0);

pub fn record_command() {
    COMMANDS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_command_failure() {
    COMMAND_FAILURES.fetch_add(1, Ordering::Relaxed);
}

pub fn record_event() {
    EVENTS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_frame() {
    FRAMES.fetch_add(1, Ordering::Relaxed);
}

pub fn record_session_created() {
    SESSIONS_CREATED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_session_destroyed() {
    SESSIONS_DESTROYED.fetch_add(1, Ordering::Relaxed);
}

pub fn snapshot() -> MuxMetricsSnapshot {
    MuxMetricsSnapshot {
        commands: COMMANDS.load(Ordering::Relaxed),
        command_failures: COMMAND_FAILURES.load(Ordering::Relaxed),
        events: EVENTS.load(Ordering::Relaxed),
        frames: FRAMES.load(Ordering::Relaxed),
        sessions_created: SESSIONS_CREATED.load(Ordering::Relaxed),
        sessions_destroyed: SESSIONS_DESTROYED.load(Ordering::Relaxed),
    }
}

pub fn reset() {
    COMMANDS.store(0, Ordering::Relaxed);
    COMMAND_FAILURES.store(0, Ordering::Relaxed);
    EVENTS.store(0, Ordering::Relaxed);
    FRAMES.store(0, Ordering::Relaxed);
    SESSIONS_CREATED.store(0, Ordering::Relaxed);
    SESSIONS_DESTROYED.store(0, Ordering::Relaxed);
}
