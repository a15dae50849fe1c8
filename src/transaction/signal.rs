//! Deferred process termination.
//!
//! The first [`SignalGuard::enter`] starts a listener thread that takes over
//! SIGTERM and SIGINT for the rest of the process. While no guard is held the
//! listener terminates the process as soon as a signal arrives, exiting with
//! status `128 + signo` (what a shell reports for a signal death). While at
//! least one guard is held the first signal is recorded instead, and it is
//! delivered when the outermost guard goes away.
//!
//! Guard depth and the pending signal share one lock, so a signal can never
//! slip between the listener's check and the release of the last guard.
//!
//! Applications that want a graceful shutdown await [`terminated`] (or hold a
//! [`Shutdown`] from [`subscribe`]) instead of registering their own
//! `tokio::signal` handlers. Once anything is subscribed, a delivered signal
//! is announced to the subscribers rather than ending the process, and the
//! announcement is held back by guards exactly like the exit is.

use std::fmt;
use std::sync::{Mutex, MutexGuard, OnceLock};

use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// A termination request held back by a [`SignalGuard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    Terminate,
    Interrupt,
}

impl TerminationSignal {
    pub fn number(self) -> i32 {
        match self {
            TerminationSignal::Terminate => 15,
            TerminationSignal::Interrupt => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TerminationSignal::Terminate => "SIGTERM",
            TerminationSignal::Interrupt => "SIGINT",
        }
    }

    pub fn exit_code(self) -> i32 {
        128 + self.number()
    }

    /// Honor the request now.
    ///
    /// With live [`Shutdown`] subscribers the signal is announced to them and
    /// this returns; shutting down is then up to the application. Without any,
    /// the process exits with [`TerminationSignal::exit_code`].
    pub fn redeliver(self) {
        if announce(self) {
            info!(signal = self.name(), "termination handed to shutdown subscribers");
            return;
        }
        warn!(signal = self.name(), "terminating on signal");
        std::process::exit(self.exit_code())
    }
}

impl fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    Terminate,
    Defer,
}

fn disposition(depth: usize) -> Disposition {
    if depth == 0 {
        Disposition::Terminate
    } else {
        Disposition::Defer
    }
}

struct GuardState {
    depth: usize,
    pending: Option<TerminationSignal>,
}

static STATE: Mutex<GuardState> = Mutex::new(GuardState {
    depth: 0,
    pending: None,
});

static LISTENER: OnceLock<std::result::Result<(), String>> = OnceLock::new();

static SHUTDOWN: OnceLock<watch::Sender<Option<TerminationSignal>>> = OnceLock::new();

fn shutdown_sender() -> &'static watch::Sender<Option<TerminationSignal>> {
    SHUTDOWN.get_or_init(|| watch::channel(None).0)
}

/// Publish `signal` to subscribers. Returns whether anyone is listening.
fn announce(signal: TerminationSignal) -> bool {
    let sender = shutdown_sender();
    if sender.receiver_count() == 0 {
        return false;
    }
    sender.send_replace(Some(signal));
    true
}

fn state() -> MutexGuard<'static, GuardState> {
    STATE.lock().unwrap_or_else(|e| e.into_inner())
}

fn intercept(signal: TerminationSignal) {
    let mut state = state();
    match disposition(state.depth) {
        Disposition::Terminate => signal.redeliver(),
        Disposition::Defer => {
            warn!(signal = signal.name(), "termination deferred until the guarded scope exits");
            state.pending.get_or_insert(signal);
        }
    }
}

/// Leave one guard level. Returns the pending signal if this was the last.
fn leave() -> Option<TerminationSignal> {
    let mut state = state();
    state.depth = state.depth.saturating_sub(1);
    if state.depth == 0 {
        state.pending.take()
    } else {
        None
    }
}

fn install() -> Result<()> {
    LISTENER
        .get_or_init(spawn_listener)
        .clone()
        .map_err(Error::Signal)
}

#[cfg(unix)]
fn spawn_listener() -> std::result::Result<(), String> {
    use tokio::signal::unix::{SignalKind, signal};

    let (ready_tx, ready_rx) = std::sync::mpsc::channel();

    std::thread::Builder::new()
        .name("msgq-signals".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = ready_tx.send(Err(format!("signal runtime: {e}")));
                    return;
                }
            };

            runtime.block_on(async move {
                let streams = signal(SignalKind::terminate())
                    .and_then(|term| Ok((term, signal(SignalKind::interrupt())?)));
                let (mut term, mut int) = match streams {
                    Ok(streams) => streams,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("signal handler: {e}")));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                loop {
                    let signal = tokio::select! {
                        Some(()) = term.recv() => TerminationSignal::Terminate,
                        Some(()) = int.recv() => TerminationSignal::Interrupt,
                        else => break,
                    };
                    intercept(signal);
                }
            });
        })
        .map_err(|e| format!("signal thread: {e}"))?;

    ready_rx
        .recv()
        .map_err(|_| "signal thread exited before it was ready".to_string())?
}

#[cfg(not(unix))]
fn spawn_listener() -> std::result::Result<(), String> {
    Err("termination deferral requires unix signals".to_string())
}

/// A process-wide shutdown notification that respects [`SignalGuard`]s.
pub struct Shutdown {
    rx: watch::Receiver<Option<TerminationSignal>>,
}

impl Shutdown {
    /// Wait until a termination signal is delivered outside every guarded
    /// scope. Resolves at once if one already was.
    pub async fn recv(&mut self) -> Result<TerminationSignal> {
        let signal = self
            .rx
            .wait_for(Option::is_some)
            .await
            .map_err(|e| Error::Signal(format!("shutdown channel: {e}")))?;
        (*signal).ok_or_else(|| Error::Signal("shutdown announced without a signal".to_string()))
    }
}

/// Take over SIGTERM and SIGINT and subscribe to their delivery.
///
/// While the returned handle lives, signals no longer end the process
/// directly; the application decides when to stop.
pub fn subscribe() -> Result<Shutdown> {
    install()?;
    Ok(Shutdown {
        rx: shutdown_sender().subscribe(),
    })
}

/// Resolve once the process has been asked to terminate and no guarded
/// scope is open. Use in place of `tokio::signal::ctrl_c()`.
pub async fn terminated() -> Result<TerminationSignal> {
    subscribe()?.recv().await
}

/// Scope during which SIGTERM and SIGINT are recorded instead of honored.
///
/// Dropping the guard delivers a recorded signal. Use
/// [`SignalGuard::release`] to receive it instead.
///
/// Only msgq's own listener is held back. Handlers the application registers
/// directly with `tokio::signal` still fire inside the scope, because tokio
/// hands each signal to every registered stream; wait on [`terminated`] to
/// get a shutdown that honors guards.
#[must_use = "the scope ends when the guard is dropped"]
pub struct SignalGuard {
    released: bool,
}

impl SignalGuard {
    pub fn enter() -> Result<Self> {
        install()?;
        state().depth += 1;
        Ok(Self { released: false })
    }

    /// End the scope, handing any deferred signal to the caller.
    ///
    /// Nested guards return `None`; the signal belongs to the outermost one.
    pub fn release(mut self) -> Option<TerminationSignal> {
        self.released = true;
        leave()
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(signal) = leave() {
            signal.redeliver();
        }
    }
}
