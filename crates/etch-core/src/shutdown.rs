//! Process-level shutdown hook.
//!
//! `Drop` does not run when the process is killed by SIGINT or SIGTERM, nor
//! for engines that are leaked or held in statics. Engines registered with a
//! [`ShutdownRegistry`] are closed together, header last, and
//! [`install_shutdown_hook`] does that for the global registry when a
//! termination signal arrives.
//!
//! `std::process::exit` skips every hook; call
//! [`ShutdownRegistry::close_all`] on the global registry before exiting
//! that way.

use std::io;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tracing::{info, warn};

use crate::engine::Etch;
use crate::error::EtchResult;

/// A set of open engines to close together.
///
/// Engines are held weakly: registering never keeps one alive, and engines
/// dropped in the meantime are skipped.
#[derive(Default)]
pub struct ShutdownRegistry {
    engines: Mutex<Vec<Weak<Etch>>>,
}

impl ShutdownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry closed by [`install_shutdown_hook`].
    pub fn global() -> &'static ShutdownRegistry {
        static GLOBAL: OnceLock<ShutdownRegistry> = OnceLock::new();
        GLOBAL.get_or_init(ShutdownRegistry::new)
    }

    /// Track `etch` until it is dropped. Registering twice is a no-op.
    pub fn register(&self, etch: &Arc<Etch>) {
        let mut engines = self.engines.lock().expect("lock poisoned");
        engines.retain(|e| e.strong_count() > 0);
        if !engines.iter().any(|e| e.as_ptr() == Arc::as_ptr(etch)) {
            engines.push(Arc::downgrade(etch));
        }
    }

    /// Registered engines that are still alive and open.
    pub fn open_engines(&self) -> usize {
        self.engines
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|e| !e.is_closed())
            .count()
    }

    /// Close every live registered engine and forget them all.
    ///
    /// Each close waits for an in-flight write to finish. Failures are
    /// logged and do not stop the remaining engines from closing. Returns
    /// how many engines this call closed.
    pub fn close_all(&self) -> usize {
        let live: Vec<Arc<Etch>> = {
            let mut engines = self.engines.lock().expect("lock poisoned");
            let live = engines.iter().filter_map(Weak::upgrade).collect();
            engines.clear();
            live
        };

        let mut closed = 0;
        for etch in live.iter().filter(|e| !e.is_closed()) {
            match etch.close() {
                Ok(()) => closed += 1,
                Err(e) => warn!(
                    path = %etch.path().display(),
                    error = %e,
                    "failed to close Etch store at shutdown"
                ),
            }
        }
        info!(closed, "closed registered Etch stores");
        closed
    }
}

impl std::fmt::Debug for ShutdownRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownRegistry")
            .field("open_engines", &self.open_engines())
            .finish()
    }
}

impl Etch {
    /// Register this engine with the global [`ShutdownRegistry`].
    pub fn close_on_shutdown(self: &Arc<Self>) {
        ShutdownRegistry::global().register(self);
    }
}

/// SIGINT and SIGTERM listeners, created inside a Tokio runtime.
struct TerminationSignals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl TerminationSignals {
    #[cfg(unix)]
    fn listen() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    fn listen() -> io::Result<Self> {
        Ok(Self {})
    }

    /// Wait for a signal and return its number.
    #[cfg(unix)]
    async fn recv(&mut self) -> io::Result<i32> {
        tokio::select! {
            _ = self.interrupt.recv() => Ok(2),
            _ = self.terminate.recv() => Ok(15),
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) -> io::Result<i32> {
        tokio::signal::ctrl_c().await.map(|()| 2)
    }
}

/// Close every engine in [`ShutdownRegistry::global`] on SIGINT or SIGTERM,
/// then exit with status `128 + signal`.
///
/// Listeners are in place when this returns. The handler runs on its own
/// thread with a single-threaded runtime, so callers need no async runtime
/// of their own. Installing more than once is a no-op.
pub fn install_shutdown_hook() -> EtchResult<()> {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    if INSTALLED.get().is_some() {
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let mut signals = {
        let _context = runtime.enter();
        TerminationSignals::listen()?
    };
    if INSTALLED.set(()).is_err() {
        return Ok(());
    }

    std::thread::Builder::new()
        .name("etch-shutdown".into())
        .spawn(move || match runtime.block_on(signals.recv()) {
            Ok(signal) => {
                info!(signal, "termination signal received, closing Etch stores");
                ShutdownRegistry::global().close_all();
                std::process::exit(128 + signal);
            }
            Err(e) => warn!(error = %e, "Etch shutdown hook stopped listening"),
        })?;
    info!("installed Etch shutdown hook");
    Ok(())
}
