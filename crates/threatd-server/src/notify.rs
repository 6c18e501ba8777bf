//! Update-complete notifications.
//!
//! On-access cache clients connect to the update-complete socket and stay
//! connected. Whenever engine settings or data change, every client is sent
//! an [`UpdateComplete`] frame and is expected to discard its cached
//! verdicts. Clients that went away are dropped whenever a client
//! subscribes or a notice is sent, and the registry never holds more than
//! `max_connections` clients.

use std::io::Write;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use threatd_protocol::{UpdateComplete, encode_message};

use crate::config::SocketConfig;
use crate::error::ServerResult;
use crate::service::ServiceThread;
use crate::socket::{ConnectionHandler, SocketServer};

/// Fan-out channel telling cache clients that cached verdicts are stale.
pub trait UpdateCompleteNotifier: ServiceThread {
    fn update_complete(&self);
}

/// True once the peer hung up. Clients never send anything, so readable
/// data alone does not count as closed.
fn peer_closed(client: &UnixStream) -> bool {
    let mut fds = [PollFd::new(client.as_fd(), PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::ZERO) {
        Ok(0) | Err(_) => false,
        Ok(_) => fds[0].revents().is_some_and(|revents| {
            revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL)
        }),
    }
}

fn prune(clients: &mut Vec<UnixStream>) -> usize {
    let before = clients.len();
    clients.retain(|client| !peer_closed(client));
    before - clients.len()
}

struct ClientRegistry {
    clients: Mutex<Vec<UnixStream>>,
    capacity: usize,
}

impl ConnectionHandler for ClientRegistry {
    fn handle(&self, stream: UnixStream) {
        let mut clients = self.clients.lock();
        let pruned = prune(&mut clients);
        if clients.len() >= self.capacity {
            warn!(
                capacity = self.capacity,
                "Update-complete registry full, rejecting client"
            );
            return;
        }
        clients.push(stream);
        debug!(clients = clients.len(), pruned, "Update-complete client subscribed");
    }
}

impl ClientRegistry {
    fn live(&self) -> usize {
        let mut clients = self.clients.lock();
        prune(&mut clients);
        clients.len()
    }

    fn broadcast(&self, frame: &[u8]) -> (usize, usize) {
        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|client| {
            let mut writer = client;
            writer.write_all(frame).is_ok()
        });
        (clients.len(), before - clients.len())
    }
}

/// Socket server keeping the subscribed cache clients.
pub struct UpdateCompleteServer {
    server: SocketServer,
    clients: Arc<ClientRegistry>,
}

impl UpdateCompleteServer {
    pub fn bind(config: SocketConfig) -> ServerResult<Self> {
        let clients = Arc::new(ClientRegistry {
            clients: Mutex::new(Vec::new()),
            capacity: config.max_connections,
        });
        let server = SocketServer::bind("update-complete", config, clients.clone())?;
        Ok(Self { server, clients })
    }

    /// Number of subscribed clients that are still connected.
    pub fn subscribers(&self) -> usize {
        self.clients.live()
    }
}

impl ServiceThread for UpdateCompleteServer {
    fn start(&self) -> ServerResult<()> {
        self.server.start()
    }

    fn request_stop(&self) {
        self.server.request_stop();
    }

    fn join(&self) {
        self.server.join();
        self.clients.clients.lock().clear();
    }
}

impl UpdateCompleteNotifier for UpdateCompleteServer {
    fn update_complete(&self) {
        let frame = match encode_message(&UpdateComplete::now()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Failed to encode update-complete notice");
                return;
            }
        };
        let (notified, dropped) = self.clients.broadcast(&frame);
        info!(notified, dropped, "Sent update-complete notice");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;
    use threatd_protocol::FrameReader;

    fn wait_for_subscribers(server: &UpdateCompleteServer, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while server.subscribers() < count {
            assert!(Instant::now() < deadline, "clients never subscribed");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn every_client_is_notified() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("update_complete_socket");
        let server = UpdateCompleteServer::bind(SocketConfig::new(&path)).unwrap();
        server.start().unwrap();

        let first = UnixStream::connect(&path).unwrap();
        let second = UnixStream::connect(&path).unwrap();
        wait_for_subscribers(&server, 2);

        server.update_complete();

        for client in [&first, &second] {
            client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let notice: Option<UpdateComplete> = FrameReader::new(client).read_message().unwrap();
            assert!(notice.is_some());
        }

        server.stop();
    }

    #[test]
    fn dead_clients_are_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("update_complete_socket");
        let server = UpdateCompleteServer::bind(SocketConfig::new(&path)).unwrap();
        server.start().unwrap();

        let client = UnixStream::connect(&path).unwrap();
        wait_for_subscribers(&server, 1);
        drop(client);

        // the first write after the peer closed may still succeed
        server.update_complete();
        server.update_complete();
        assert_eq!(server.subscribers(), 0);

        server.stop();
    }

    #[test]
    fn closed_clients_are_released_without_a_notice() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("update_complete_socket");
        let server =
            UpdateCompleteServer::bind(SocketConfig::new(&path).with_max_connections(4)).unwrap();
        server.start().unwrap();

        for _ in 0..20 {
            drop(UnixStream::connect(&path).unwrap());
        }
        // the accept loop may still be busy with the closed ones
        let deadline = Instant::now() + Duration::from_secs(5);
        let live = loop {
            let client = UnixStream::connect(&path).unwrap();
            std::thread::sleep(Duration::from_millis(50));
            if server.subscribers() == 1 {
                break client;
            }
            assert!(Instant::now() < deadline, "live client never subscribed");
        };
        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(server.subscribers(), 1);
        assert_eq!(server.clients.clients.lock().len(), 1);

        drop(live);
        server.stop();
    }

    #[test]
    fn registry_is_capped_at_max_connections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("update_complete_socket");
        let server =
            UpdateCompleteServer::bind(SocketConfig::new(&path).with_max_connections(2)).unwrap();
        server.start().unwrap();

        let clients: Vec<UnixStream> = (0..3)
            .map(|_| UnixStream::connect(&path).unwrap())
            .collect();
        wait_for_subscribers(&server, 2);

        let rejected = clients
            .iter()
            .filter(|client| {
                client
                    .set_read_timeout(Some(Duration::from_millis(300)))
                    .unwrap();
                let mut reader: &UnixStream = client;
                matches!(reader.read(&mut [0u8; 1]), Ok(0))
            })
            .count();
        assert_eq!(rejected, 1);
        assert_eq!(server.subscribers(), 2);

        server.stop();
    }
}
