use crate::protocol::{error_id, ApiEnvelope, InboundMsg, OutboundMsg};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tungstenite::protocol::Message;

const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(2);
const READ_TIMEOUT: Duration = Duration::from_millis(20);
const WRITE_TIMEOUT: Duration = Duration::from_millis(200);
const IDLE_SLEEP: Duration = Duration::from_millis(10);

struct ActiveClient {
    ws: tungstenite::WebSocket<TcpStream>,
    socket_addr: SocketAddr,
}

/// Owns the listening socket and the single active client connection.
pub struct NetworkThread {
    listen_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkThread {
    pub fn spawn_with_addr(
        addr: &str,
        in_tx: Sender<InboundMsg>,
        out_rx: Receiver<OutboundMsg>,
    ) -> Result<Self, String> {
        let listener = TcpListener::bind(addr).map_err(|e| format!("ws bind failed on {addr}: {e}"))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| format!("ws listener setup failed: {e}"))?;
        let listen_addr = listener
            .local_addr()
            .map_err(|e| format!("ws listener has no local addr: {e}"))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_for_thread = Arc::clone(&shutdown);

        let join_handle =
            thread::spawn(move || run_server(listener, in_tx, out_rx, shutdown_for_thread));

        Ok(Self {
            listen_addr,
            shutdown,
            join_handle: Mutex::new(Some(join_handle)),
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Ok(mut h) = self.join_handle.lock() {
            if let Some(h) = h.take() {
                let _ = h.join();
            }
        }
    }
}

impl Drop for NetworkThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_server(
    listener: TcpListener,
    in_tx: Sender<InboundMsg>,
    out_rx: Receiver<OutboundMsg>,
    shutdown: Arc<AtomicBool>,
) {
    let mut server = Server {
        listener,
        in_tx,
        out_rx,
        client: None,
    };
    while !shutdown.load(Ordering::Relaxed) {
        server.accept_pending();
        if !server.flush_outbound() {
            break;
        }
        if !server.poll_inbound() {
            thread::sleep(IDLE_SLEEP);
        }
    }
    server.close_client();
}

struct Server {
    listener: TcpListener,
    in_tx: Sender<InboundMsg>,
    out_rx: Receiver<OutboundMsg>,
    client: Option<ActiveClient>,
}

impl Server {
    /// Newest client wins; the previous one is closed and reported gone.
    fn accept_pending(&mut self) {
        loop {
            let (stream, socket_addr) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    eprintln!("mock device: accept failed: {e}");
                    return;
                }
            };
            let Some(mut ws) = handshake(stream) else { continue };

            if self.client.is_some() {
                self.close_client();
            }
            let connected = InboundMsg::ClientConnected { socket_addr };
            if self.in_tx.try_send(connected).is_err() {
                let busy = ApiEnvelope::error("", error_id::INTERNAL_SERVER_ERROR, "server busy", 0);
                let _ = send_envelope(&mut ws, &busy);
                let _ = ws.close(None);
                continue;
            }
            self.client = Some(ActiveClient { ws, socket_addr });
        }
    }

    /// Returns false once the device side has hung up.
    fn flush_outbound(&mut self) -> bool {
        loop {
            let msg = match self.out_rx.try_recv() {
                Ok(msg) => msg,
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            };
            // Output queued while nobody is connected belongs to a gone client.
            let Some(client) = self.client.as_mut() else { continue };
            match msg {
                OutboundMsg::Send { envelope } => {
                    if send_envelope(&mut client.ws, &envelope).is_err() {
                        self.forget_client();
                        return true;
                    }
                }
                OutboundMsg::Kick => {
                    eprintln!("mock device: kicking {}", client.socket_addr);
                    self.close_client();
                    return true;
                }
            }
        }
    }

    /// Reads at most one frame. Returns false when there is no client to read from.
    fn poll_inbound(&mut self) -> bool {
        let Some(client) = self.client.as_mut() else { return false };
        let keep = match client.ws.read() {
            Ok(Message::Text(text)) => {
                forward_request(&self.in_tx, &mut client.ws, &text);
                true
            }
            Ok(Message::Ping(payload)) => {
                let _ = client.ws.send(Message::Pong(payload));
                true
            }
            Ok(Message::Close(_)) => false,
            Ok(_) => true,
            Err(tungstenite::Error::Io(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                true
            }
            Err(_) => false,
        };
        if !keep {
            self.forget_client();
        }
        true
    }

    fn close_client(&mut self) {
        if let Some(client) = self.client.as_mut() {
            let _ = client.ws.close(None);
            let _ = client.ws.flush();
        }
        self.forget_client();
    }

    fn forget_client(&mut self) {
        if self.client.take().is_some() {
            let _ = self.in_tx.try_send(InboundMsg::ClientDisconnected);
        }
    }
}

fn handshake(stream: TcpStream) -> Option<tungstenite::WebSocket<TcpStream>> {
    // Accepted sockets inherit non-blocking mode from the listener.
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_nodelay(true);
    let _ = stream.set_read_timeout(Some(HANDSHAKE_READ_TIMEOUT));
    let _ = stream.set_write_timeout(Some(WRITE_TIMEOUT));
    match tungstenite::accept(stream) {
        Ok(ws) => {
            let _ = ws.get_ref().set_read_timeout(Some(READ_TIMEOUT));
            Some(ws)
        }
        Err(e) => {
            eprintln!("mock device: websocket handshake failed: {e}");
            None
        }
    }
}

/// Undecodable frames are answered directly; everything else goes to the device loop.
fn forward_request(in_tx: &Sender<InboundMsg>, ws: &mut tungstenite::WebSocket<TcpStream>, text: &str) {
    let envelope: ApiEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            let reply = ApiEnvelope::error(
                "",
                error_id::INTERNAL_SERVER_ERROR,
                &format!("invalid json: {e}"),
                0,
            );
            let _ = send_envelope(ws, &reply);
            return;
        }
    };
    let request_id = envelope.request_id.clone();
    if in_tx.try_send(InboundMsg::Request { envelope }).is_err() {
        let busy = ApiEnvelope::error(request_id, error_id::INTERNAL_SERVER_ERROR, "server busy", 0);
        let _ = send_envelope(ws, &busy);
    }
}

fn send_envelope(ws: &mut tungstenite::WebSocket<TcpStream>, envelope: &ApiEnvelope) -> tungstenite::Result<()> {
    let payload = serde_json::to_string(envelope)
        .map_err(|e| tungstenite::Error::Io(std::io::Error::other(e)))?;
    ws.send(Message::Text(payload.into()))
}
