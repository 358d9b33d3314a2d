//! Thread-per-connection TCP accept loop shared by the computation server and the decryptor.

use crate::error::LutPIRError;
use std::{
    io::ErrorKind,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, info, warn};

/// How long the accept loop sleeps when no connection is pending, before re-checking the stop flag.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Running accept loop. Stopping it refuses new connections; established ones finish on their own.
pub struct ServerHandle {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and waits for the accept loop to exit. Calling it again is a no-op.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);

        if let Some(accept_thread) = self.accept_thread.take() {
            if accept_thread.join().is_err() {
                warn!(addr = %self.local_addr, "accept loop panicked");
            }
            info!(addr = %self.local_addr, "server stopped");
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Runs `handle_connection` on a dedicated thread for every accepted connection, until the returned handle is stopped.
pub fn spawn_accept_loop<F>(listener: TcpListener, role: &'static str, handle_connection: F) -> Result<ServerHandle, LutPIRError>
where
    F: Fn(TcpStream) + Send + Sync + 'static,
{
    let local_addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;

    let stop = Arc::new(AtomicBool::new(false));
    let handle_connection = Arc::new(handle_connection);

    let accept_thread = {
        let stop = stop.clone();

        thread::Builder::new().name(format!("{}-accept", role)).spawn(move || {
            info!(role, addr = %local_addr, "listening");

            while !stop.load(Ordering::Acquire) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        debug!(role, %peer, "accepted connection");

                        if let Err(e) = stream.set_nonblocking(false).and_then(|_| stream.set_nodelay(true)) {
                            warn!(role, %peer, error = %e, "failed to configure connection");
                            continue;
                        }

                        let handle_connection = handle_connection.clone();
                        let spawned = thread::Builder::new().name(format!("{}-conn", role)).spawn(move || handle_connection(stream));
                        if let Err(e) = spawned {
                            warn!(role, %peer, error = %e, "failed to spawn connection thread");
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
                    Err(e) => {
                        warn!(role, error = %e, "accept failed");
                        thread::sleep(ACCEPT_POLL_INTERVAL);
                    }
                }
            }
        })?
    };

    Ok(ServerHandle {
        local_addr,
        stop,
        accept_thread: Some(accept_thread),
    })
}

#[cfg(test)]
mod test {
    use super::spawn_accept_loop;
    use std::{
        io::{Read, Write},
        net::{TcpListener, TcpStream},
    };

    #[test]
    fn connections_are_served_until_stopped_and_stop_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut handle = spawn_accept_loop(listener, "echo", |mut stream: TcpStream| {
            let mut buf = [0u8; 4];
            if stream.read_exact(&mut buf).is_ok() {
                let _ = stream.write_all(&buf);
            }
        })
        .unwrap();

        let mut client = TcpStream::connect(handle.local_addr()).unwrap();
        client.write_all(b"ping").unwrap();

        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"ping");

        handle.stop();
        handle.stop();
    }
}
