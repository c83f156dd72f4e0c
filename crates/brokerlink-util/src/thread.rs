use std::{io, thread, thread::JoinHandle};

/// Spawns a named thread, logging the OS thread name on failure to set it
/// (non-fatal — the thread still runs, just without a name in `ps`/`top`).
pub fn spawn_named<F, T>(name: &str, f: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new().name(name.to_string()).spawn(f)
}
