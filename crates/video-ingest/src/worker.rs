use std::{io, thread};

/// Spawn a named thread that inherits the current tracing dispatcher.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::Registry;

    use super::*;

    fn registry_is_default() -> bool {
        tracing::dispatcher::get_default(|dispatch| dispatch.is::<Registry>())
    }

    #[test]
    fn spawned_threads_carry_their_name() {
        let handle = spawn_thread("ingest-test-worker", || {
            thread::current().name().map(str::to_string)
        })
        .unwrap();
        assert_eq!(handle.join().unwrap().as_deref(), Some("ingest-test-worker"));
    }

    #[test]
    fn spawned_threads_log_through_the_caller_subscriber() {
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry());
        let handle = spawn_thread("ingest-dispatch-worker", registry_is_default).unwrap();
        assert!(handle.join().unwrap());

        let plain = thread::spawn(registry_is_default);
        assert!(!plain.join().unwrap());
    }
}
