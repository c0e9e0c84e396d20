/// Host signal handling for the interactive `run`/`monitor` console.
///
/// First SIGINT (Ctrl-C): stop the supervised render.
/// Second SIGINT: detach the console, leaving the render to finish or die
/// on its own (anything this session paused is resumed first).
/// SIGTERM: detach.
use tokio::sync::mpsc;

/// What the console should do in response to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    Stop,
    Detach,
}

/// Map the n-th Ctrl-C (1-based) to an action.
fn interrupt_action(count: u32) -> HostSignal {
    if count <= 1 {
        HostSignal::Stop
    } else {
        HostSignal::Detach
    }
}

pub struct SignalHandler {
    rx: mpsc::UnboundedReceiver<HostSignal>,
}

impl SignalHandler {
    /// Install the handlers. Must be called inside a tokio runtime.
    pub fn install() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let ctrl_c_tx = tx.clone();
        tokio::spawn(async move {
            let mut count = 0u32;
            while tokio::signal::ctrl_c().await.is_ok() {
                count += 1;
                let action = interrupt_action(count);
                tracing::info!(count, action = ?action, "interrupt received");
                if ctrl_c_tx.send(action).is_err() {
                    break;
                }
            }
        });

        #[cfg(unix)]
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "could not install SIGTERM handler");
                    return;
                }
            };
            while term.recv().await.is_some() {
                tracing::info!("SIGTERM received, detaching");
                if tx.send(HostSignal::Detach).is_err() {
                    break;
                }
            }
        });
        #[cfg(not(unix))]
        drop(tx);

        Self { rx }
    }

    /// Wait for the next signal. Pending forever if no handler could be installed.
    pub async fn recv(&mut self) -> HostSignal {
        match self.rx.recv().await {
            Some(signal) => signal,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_interrupt_stops_second_detaches() {
        assert_eq!(interrupt_action(1), HostSignal::Stop);
        assert_eq!(interrupt_action(2), HostSignal::Detach);
        assert_eq!(interrupt_action(5), HostSignal::Detach);
    }
}
