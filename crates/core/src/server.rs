//! The RTSP listener: accepts TCP connections and hands each one to a
//! connection thread.

use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::config::{Config, SharedConfig};
use crate::connection::Connection;
use crate::error::{KgdError, Result};

/// The streaming server. Owns the accept loop; connections, sessions, and
/// media are owned by the per-connection threads it spawns.
pub struct Server {
    config: SharedConfig,
    running: Arc<AtomicBool>,
    accept_thread: Option<thread::JoinHandle<()>>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Server {
            config: SharedConfig::new(config),
            running: Arc::new(AtomicBool::new(false)),
            accept_thread: None,
        }
    }

    pub fn with_shared_config(config: SharedConfig) -> Self {
        Server {
            config,
            running: Arc::new(AtomicBool::new(false)),
            accept_thread: None,
        }
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    /// Bind the RTSP port and start accepting.
    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(KgdError::InvalidState("server already running"));
        }
        let addr = self.config.get().bind_addr();
        let listener = TcpListener::bind(&addr)?;
        listener.set_nonblocking(true)?;
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(%addr, "RTSP server listening");

        let running = self.running.clone();
        let config = self.config.clone();
        self.accept_thread = Some(
            thread::Builder::new()
                .name("kgd-accept".into())
                .spawn(move || accept_loop(listener, config, running))?,
        );
        Ok(())
    }

    /// Stop accepting; connection threads notice within a read timeout and
    /// tear their sessions down.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        tracing::info!("server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

fn accept_loop(listener: TcpListener, config: SharedConfig, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let config = config.clone();
                let running = running.clone();
                let _ = thread::Builder::new()
                    .name("kgd-connection".into())
                    .spawn(move || Connection::handle(stream, config, running));
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}
