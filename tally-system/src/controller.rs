use std::io;
use std::time::Duration;

use once_cell::sync::OnceCell;
use tokio::sync::watch;

/// Shutdown request message sent by the [`Controller`] to subscribed services.
///
/// A handler has to ensure that it doesn't take longer than `timeout` to
/// resolve the future. Ideally, open work is persisted or finished in an
/// orderly manner but no new requests are accepted anymore.
///
/// After the timeout the system will shut down regardless of what the receivers
/// of this message do.
#[derive(Debug, Clone)]
pub struct Shutdown {
    /// The timeout for this shutdown. `None` indicates an immediate forced shutdown.
    pub timeout: Option<Duration>,
}

type ShutdownChannel = (
    watch::Sender<Option<Shutdown>>,
    watch::Receiver<Option<Shutdown>>,
);

/// Global [`ShutdownChannel`] for all services.
static SHUTDOWN: OnceCell<ShutdownChannel> = OnceCell::new();

/// Timeout configured through [`Controller::start`].
static TIMEOUT: OnceCell<Duration> = OnceCell::new();

/// Notifies a service about an upcoming shutdown.
pub struct ShutdownHandle(watch::Receiver<Option<Shutdown>>);

impl ShutdownHandle {
    /// Wait for a shutdown.
    ///
    /// This method is cancellation safe and can be used in `select!`.
    pub async fn notified(&mut self) -> Shutdown {
        while self.0.changed().await.is_ok() {
            if let Some(shutdown) = &*self.0.borrow() {
                return shutdown.clone();
            }
        }

        Shutdown { timeout: None }
    }

    /// Returns the shutdown state without waiting, if a shutdown was requested.
    pub fn requested(&self) -> Option<Shutdown> {
        self.0.borrow().clone()
    }
}

/// Distributes shutdown signals to all running services.
///
/// The controller monitors process signals once [started](Self::start). A
/// SIGTERM initiates a graceful shutdown bounded by the configured timeout; a
/// SIGINT or a second signal upgrades to an immediate shutdown. Services obtain
/// a [`ShutdownHandle`] to be notified.
#[derive(Debug)]
pub struct Controller;

impl Controller {
    /// Starts a controller that monitors shutdown signals.
    pub fn start(shutdown_timeout: Duration) {
        TIMEOUT.get_or_init(|| shutdown_timeout);
        tokio::spawn(monitor_shutdown(shutdown_timeout));
    }

    /// Initiates the shutdown process of the system.
    ///
    /// A graceful shutdown uses the timeout passed to [`start`](Self::start).
    pub fn trigger_shutdown(graceful: bool) {
        let timeout = graceful.then(|| TIMEOUT.get().copied().unwrap_or(Duration::ZERO));
        let (tx, _) = SHUTDOWN.get_or_init(|| watch::channel(None));
        tx.send(Some(Shutdown { timeout })).ok();
    }

    /// Returns a [handle](ShutdownHandle) to receive shutdown notifications.
    pub fn shutdown_handle() -> ShutdownHandle {
        let (_, ref rx) = SHUTDOWN.get_or_init(|| watch::channel(None));
        ShutdownHandle(rx.clone())
    }

    /// Wait for the shutdown and timeout.
    ///
    /// This waits for the first shutdown signal and then conditionally waits
    /// for the shutdown timeout. If the shutdown timeout is interrupted by
    /// another signal, this function resolves immediately.
    pub async fn shutdown() {
        let mut handle = Controller::shutdown_handle();
        let shutdown = handle.notified().await;

        // If this is a graceful signal, wait for either the timeout to elapse, or any other signal
        // to upgrade to an immediate shutdown.
        if let Some(timeout) = shutdown.timeout {
            tokio::select! {
                _ = handle.notified() => (),
                _ = tokio::time::sleep(timeout) => (),
            }
        }
    }
}

#[cfg(unix)]
async fn monitor_shutdown(timeout: Duration) -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_quit = signal(SignalKind::quit())?;
    let mut sig_term = signal(SignalKind::terminate())?;

    let (tx, _) = SHUTDOWN.get_or_init(|| watch::channel(None));

    loop {
        let timeout = tokio::select! {
            biased;

            Some(()) = sig_int.recv() => {
                tracing::info!("SIGINT received, exiting");
                None
            }
            Some(()) = sig_quit.recv() => {
                tracing::info!("SIGQUIT received, exiting");
                None
            }
            Some(()) = sig_term.recv() => {
                tracing::info!("SIGTERM received, stopping in {}s", timeout.as_secs());
                Some(timeout)
            }

            else => break,
        };

        tx.send(Some(Shutdown { timeout })).ok();
    }

    Ok(())
}

#[cfg(windows)]
async fn monitor_shutdown(_timeout: Duration) -> io::Result<()> {
    use tokio::signal::windows::{ctrl_break, ctrl_c, ctrl_close};

    let mut ctrl_c = ctrl_c()?;
    let mut ctrl_break = ctrl_break()?;
    let mut ctrl_close = ctrl_close()?;

    let (tx, _) = SHUTDOWN.get_or_init(|| watch::channel(None));

    loop {
        tokio::select! {
            biased;

            Some(()) = ctrl_c.recv() => tracing::info!("CTRL-C received, exiting"),
            Some(()) = ctrl_break.recv() => tracing::info!("CTRL-BREAK received, exiting"),
            Some(()) = ctrl_close.recv() => tracing::info!("CTRL-CLOSE received, exiting"),

            else => break,
        };

        tx.send(Some(Shutdown { timeout: None })).ok();
    }

    Ok(())
}
