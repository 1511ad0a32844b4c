mod handler;

pub use handler::Handler;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info};

/// Counts in-flight connections so shutdown can wait for them to drain.
pub struct ActiveConns {
    count: AtomicUsize,
    idle: Notify,
}

impl ActiveConns {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            count: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    pub fn guard(self: &Arc<Self>) -> ConnGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        ConnGuard {
            conns: Arc::clone(self),
        }
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Resolves once no connection is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct ConnGuard {
    conns: Arc<ActiveConns>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        if self.conns.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.conns.idle.notify_waiters();
        }
    }
}

/// The proxy accept loop. Each accepted connection runs its handler in its
/// own task, independent of the others.
pub struct ProxyServer {
    handler: Arc<Handler>,
    active: Arc<ActiveConns>,
}

impl ProxyServer {
    pub fn new(handler: Handler) -> Self {
        Self {
            handler: Arc::new(handler),
            active: ActiveConns::new(),
        }
    }

    pub fn active(&self) -> Arc<ActiveConns> {
        Arc::clone(&self.active)
    }

    /// Accepts connections until the shutdown signal flips. The listener is
    /// closed on return; in-flight handlers keep running and are awaited by
    /// the supervisor through `ActiveConns`.
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = listener.local_addr() {
            info!("proxy listening on {}", addr);
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("accept error: {}", e);
                            continue;
                        }
                    };

                    let handler = Arc::clone(&self.handler);
                    let guard = self.active.guard();
                    tokio::spawn(async move {
                        handler.handle(stream, peer).await;
                        drop(guard);
                    });
                }
                _ = shutdown.changed() => {
                    debug!("proxy accept loop stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_active_conns_wait_idle() {
        let conns = ActiveConns::new();
        let g1 = conns.guard();
        let g2 = conns.guard();
        assert_eq!(conns.len(), 2);

        let waiter = {
            let conns = Arc::clone(&conns);
            tokio::spawn(async move { conns.wait_idle().await })
        };

        drop(g1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(g2);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_idle must resolve once the last guard drops")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_idle_resolves_immediately_when_idle() {
        let conns = ActiveConns::new();
        tokio::time::timeout(Duration::from_millis(100), conns.wait_idle())
            .await
            .unwrap();
    }
}
