//! Transports feeding an endpoint handler.
//!
//! A transport moves staged output to the wire and reports inbound bytes,
//! writability and failures back to the [`EndpointHandler`]. Two are
//! provided: an in-process loopback pair and a tokio TCP driver.

use crate::endpoint::EndpointHandler;
use bytes::{Bytes, BytesMut};
use mux_wire::OutputStaging;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, trace};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Unwritten bytes above which [`TcpTransport`] pushes back on flushes
pub const HIGH_WATER_MARK: usize = 256 * 1024;

/// Byte channel under an endpoint
pub trait Transport: Send + Sync {
    /// Enable or disable reading
    fn set_read_interest(&self, enabled: bool);

    /// Ask for `on_channel_writable` once output can make progress
    fn set_write_interest(&self, enabled: bool);

    /// Write staged output; `Ok(false)` means some was left behind
    fn flush_internal(&self, output: &OutputStaging, more_to_come: bool) -> io::Result<bool>;

    /// Release the channel
    fn cleanup(&self);
}

/// One end of an in-process connection
#[derive(Debug)]
pub struct LoopbackTransport {
    local: OnceLock<Weak<EndpointHandler>>,
    peer: OnceLock<Weak<EndpointHandler>>,
    read_interest: AtomicBool,
    closed: AtomicBool,
    cleanups: AtomicUsize,
    bytes_sent: AtomicU64,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self {
            local: OnceLock::new(),
            peer: OnceLock::new(),
            read_interest: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            cleanups: AtomicUsize::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }
}

impl LoopbackTransport {
    /// Unattached transport
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wire this end: `local` owns it, `peer` receives what it writes
    pub fn attach(&self, local: &Arc<EndpointHandler>, peer: &Arc<EndpointHandler>) {
        let _ = self.local.set(Arc::downgrade(local));
        let _ = self.peer.set(Arc::downgrade(peer));
    }

    /// Current read interest
    pub fn read_interest(&self) -> bool {
        self.read_interest.load(Ordering::Acquire)
    }

    /// Times `cleanup` was called
    pub fn cleanup_count(&self) -> usize {
        self.cleanups.load(Ordering::Acquire)
    }

    /// Bytes handed to the peer
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Acquire)
    }

    /// Whether `cleanup` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn peer(&self) -> Option<Arc<EndpointHandler>> {
        self.peer.get().and_then(Weak::upgrade)
    }
}

impl Transport for LoopbackTransport {
    fn set_read_interest(&self, enabled: bool) {
        self.read_interest.store(enabled, Ordering::Release);
    }

    fn set_write_interest(&self, enabled: bool) {
        if !enabled {
            return;
        }
        if let Some(local) = self.local.get().and_then(Weak::upgrade) {
            local.on_channel_writable();
        }
    }

    fn flush_internal(&self, output: &OutputStaging, _more_to_come: bool) -> io::Result<bool> {
        let slices = output.fetch();
        if self.is_closed() {
            return Ok(true);
        }
        if let Some(peer) = self.peer() {
            for slice in slices {
                self.bytes_sent.fetch_add(slice.len() as u64, Ordering::Relaxed);
                peer.on_channel_input_read(slice);
            }
        }
        Ok(true)
    }

    fn cleanup(&self) {
        self.cleanups.fetch_add(1, Ordering::AcqRel);
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(peer) = self.peer() {
            peer.on_channel_error(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "loopback peer closed",
            ));
        }
    }
}

enum WriterCommand {
    Write(Vec<Bytes>),
    NotifyWritable,
    Shutdown,
}

// Bytes handed to the writer task and not yet written to the socket.
#[derive(Debug, Default)]
struct WriteGauge {
    in_flight: AtomicUsize,
    interest: AtomicBool,
}

impl WriteGauge {
    fn below_mark(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) < HIGH_WATER_MARK
    }

    /// Whether a pending write interest should fire now
    fn take_writable(&self) -> bool {
        self.below_mark() && self.interest.swap(false, Ordering::AcqRel)
    }
}

/// Transport over a tokio TCP stream
///
/// Output is handed to a writer task. Once more than [`HIGH_WATER_MARK`]
/// bytes wait for the socket, flushes leave output staged and report
/// `Ok(false)`; a set write interest fires when the writer drains below it.
pub struct TcpTransport {
    writer: mpsc::UnboundedSender<WriterCommand>,
    read_interest: watch::Sender<bool>,
    gauge: Arc<WriteGauge>,
    tasks: Mutex<Vec<AbortHandle>>,
    peer_addr: SocketAddr,
    closed: AtomicBool,
}

/// Tasks owning the halves of a [`TcpTransport`]'s stream
pub struct TcpDriver {
    transport: Arc<TcpTransport>,
    read: OwnedReadHalf,
    write: OwnedWriteHalf,
    writer_rx: mpsc::UnboundedReceiver<WriterCommand>,
    read_interest_rx: watch::Receiver<bool>,
}

impl TcpTransport {
    /// Wrap `stream`; nothing moves until the driver is started
    pub fn new(stream: TcpStream) -> io::Result<(Arc<Self>, TcpDriver)> {
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let (read, write) = stream.into_split();
        let (writer, writer_rx) = mpsc::unbounded_channel();
        let (read_interest, read_interest_rx) = watch::channel(true);
        let transport = Arc::new(Self {
            writer,
            read_interest,
            gauge: Arc::new(WriteGauge::default()),
            tasks: Mutex::new(Vec::new()),
            peer_addr,
            closed: AtomicBool::new(false),
        });
        let driver = TcpDriver {
            transport: transport.clone(),
            read,
            write,
            writer_rx,
            read_interest_rx,
        };
        Ok((transport, driver))
    }

    /// Remote address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Bytes queued for the socket
    pub fn bytes_in_flight(&self) -> usize {
        self.gauge.in_flight.load(Ordering::Acquire)
    }
}

impl Transport for TcpTransport {
    fn set_read_interest(&self, enabled: bool) {
        self.read_interest.send_replace(enabled);
    }

    fn set_write_interest(&self, enabled: bool) {
        self.gauge.interest.store(enabled, Ordering::Release);
        if enabled {
            // the writer fires it now or after draining below the mark
            let _ = self.writer.send(WriterCommand::NotifyWritable);
        }
    }

    fn flush_internal(&self, output: &OutputStaging, _more_to_come: bool) -> io::Result<bool> {
        if self.closed.load(Ordering::Acquire) {
            output.fetch();
            return Ok(true);
        }
        if !self.gauge.below_mark() {
            return Ok(false);
        }
        let slices = output.fetch();
        if slices.is_empty() {
            return Ok(true);
        }
        let len: usize = slices.iter().map(Bytes::len).sum();
        let in_flight = self.gauge.in_flight.fetch_add(len, Ordering::AcqRel) + len;
        self.writer
            .send(WriterCommand::Write(slices))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "writer task gone"))?;
        Ok(in_flight < HIGH_WATER_MARK)
    }

    fn cleanup(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.writer.send(WriterCommand::Shutdown);
        // the writer drains and shuts down on its own; the reader is stopped
        if let Some(reader) = crate::lock(&self.tasks).first() {
            reader.abort();
        }
        debug!("Closed TCP transport to {}", self.peer_addr);
    }
}

impl TcpDriver {
    /// Spawn the reader and writer tasks and report the channel ready
    pub fn start(self, handler: &Arc<EndpointHandler>) {
        let TcpDriver {
            transport,
            mut read,
            mut write,
            mut writer_rx,
            mut read_interest_rx,
        } = self;

        let weak = Arc::downgrade(handler);
        let reader = tokio::spawn(async move {
            loop {
                if !*read_interest_rx.borrow_and_update()
                    && read_interest_rx.wait_for(|enabled| *enabled).await.is_err()
                {
                    return;
                }
                let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
                let result = read.read_buf(&mut buf).await;
                let Some(handler) = weak.upgrade() else {
                    return;
                };
                match result {
                    Ok(0) => {
                        handler.on_channel_error(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed by peer",
                        ));
                        return;
                    }
                    Ok(n) => {
                        trace!("Read {} bytes", n);
                        handler.on_channel_input_read(buf.freeze());
                    }
                    Err(err) => {
                        handler.on_channel_error(err);
                        return;
                    }
                }
            }
        });

        let weak = Arc::downgrade(handler);
        let gauge = transport.gauge.clone();
        let writer = tokio::spawn(async move {
            while let Some(command) = writer_rx.recv().await {
                match command {
                    WriterCommand::Write(slices) => {
                        for slice in slices {
                            let result = write.write_all(&slice).await;
                            gauge.in_flight.fetch_sub(slice.len(), Ordering::AcqRel);
                            if let Err(err) = result {
                                if let Some(handler) = weak.upgrade() {
                                    handler.on_channel_error(err);
                                }
                                return;
                            }
                        }
                    }
                    WriterCommand::NotifyWritable => {}
                    WriterCommand::Shutdown => {
                        let _ = write.shutdown().await;
                        return;
                    }
                }
                if gauge.take_writable() {
                    if let Some(handler) = weak.upgrade() {
                        handler.on_channel_writable();
                    }
                }
            }
        });

        {
            let mut tasks = crate::lock(&transport.tasks);
            tasks.push(reader.abort_handle());
            tasks.push(writer.abort_handle());
        }
        handler.on_channel_ready();
    }
}

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a TCP address
pub async fn connect_tcp(addr: SocketAddr) -> io::Result<TcpStream> {
    TcpStream::connect(addr).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use crate::error::ConnectionError;
    use crate::executor::TokioExecutor;
    use crate::handler::DialogHandlerFactories;
    use crate::message::MessageOutput;
    use crate::state::{DialogState, EndpointState};
    use crate::testing::{Recorder, RecordingFactory};
    use mux_wire::{ProtocolMessage, PROTOCOL_VERSION};
    use std::time::Duration;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = listen_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(connect_tcp(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    fn tcp_endpoint(
        stream: TcpStream,
        creator: bool,
        factories: DialogHandlerFactories,
    ) -> (Arc<EndpointHandler>, Arc<TcpTransport>, TcpDriver) {
        let (transport, driver) = TcpTransport::new(stream).unwrap();
        let handler =
            EndpointHandler::builder(EndpointConfig::default(), TokioExecutor::new(), transport.clone())
                .creator(creator)
                .factories(factories)
                .build();
        handler.start();
        (handler, transport, driver)
    }

    async fn eventually(what: &str, done: impl Fn() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    fn version_message() -> Bytes {
        ProtocolMessage::ProtocolVersion {
            version: PROTOCOL_VERSION,
        }
        .to_bytes()
    }

    #[tokio::test]
    async fn test_echo_larger_than_high_water_mark() {
        let (a, b) = tcp_pair().await;
        let factory = RecordingFactory::echo();
        let mut factories = DialogHandlerFactories::new();
        factories.register(1, factory.clone());

        let (client, client_transport, client_driver) =
            tcp_endpoint(a, true, DialogHandlerFactories::new());
        let (server, _, server_driver) = tcp_endpoint(b, false, factories);
        client_driver.start(&client);
        server_driver.start(&server);
        eventually("handshake", || {
            client.state() == EndpointState::Normal && server.state() == EndpointState::Normal
        })
        .await;

        let payload = vec![7u8; HIGH_WATER_MARK * 3];
        let recorder = Recorder::new();
        let ctx = client
            .start_dialog(1, recorder.clone(), Duration::from_secs(10))
            .unwrap();
        assert!(ctx.write(MessageOutput::from(payload.clone()), true).unwrap());

        eventually("echo", || ctx.state().is_terminal()).await;
        assert_eq!(ctx.state(), DialogState::Fin);
        assert_eq!(recorder.received_bytes(), payload);
        assert_eq!(factory.get(0).received_bytes().len(), payload.len());
        assert_eq!(client_transport.bytes_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_flush_holds_output_above_high_water_mark() {
        let (a, _peer) = tcp_pair().await;
        // without a running writer nothing drains
        let (transport, _driver) = TcpTransport::new(a).unwrap();
        let output = OutputStaging::new();
        let frame = |len: usize| ProtocolMessage::DialogFrame {
            finish: false,
            cont: false,
            dialog_id: 1,
            payload: Bytes::from(vec![0u8; len]),
        };

        assert!(output.write_message(&frame(1024)));
        assert!(transport.flush_internal(&output, false).unwrap());
        assert!(output.is_empty());

        assert!(output.write_message(&frame(HIGH_WATER_MARK)));
        assert!(!transport.flush_internal(&output, false).unwrap());
        assert!(output.is_empty());
        assert!(transport.bytes_in_flight() > HIGH_WATER_MARK);

        assert!(output.write_message(&ProtocolMessage::NoOperation));
        assert!(!transport.flush_internal(&output, false).unwrap());
        assert!(!output.is_empty());
    }

    #[tokio::test]
    async fn test_peer_close_terminates_endpoint() {
        let (a, peer) = tcp_pair().await;
        let (server, _, driver) = tcp_endpoint(a, false, DialogHandlerFactories::new());
        driver.start(&server);

        drop(peer);
        eventually("termination", || server.state() == EndpointState::Terminated).await;
        assert!(matches!(
            server.termination_error(),
            Some(ConnectionError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn test_reads_wait_for_read_interest() {
        let (a, mut peer) = tcp_pair().await;
        let (server, transport, driver) = tcp_endpoint(a, false, DialogHandlerFactories::new());
        transport.set_read_interest(false);
        driver.start(&server);

        peer.write_all(&version_message()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.stats().messages_received, 0);

        transport.set_read_interest(true);
        eventually("version exchange", || {
            server.state() == EndpointState::HandshakingStep2
        })
        .await;

        let mut response = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(5), peer.read(&mut response))
            .await
            .expect("version response")
            .unwrap();
        assert!(n > 0);
    }

    #[tokio::test]
    async fn test_cleanup_shuts_down_both_directions() {
        let (a, mut peer) = tcp_pair().await;
        let (server, transport, driver) = tcp_endpoint(a, false, DialogHandlerFactories::new());
        driver.start(&server);

        transport.cleanup();
        transport.cleanup();

        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), peer.read_to_end(&mut rest))
            .await
            .expect("writer shut down")
            .unwrap();
        assert!(rest.is_empty());

        // the reader is gone, so neither input nor EOF reaches the endpoint
        let _ = peer.write_all(&version_message()).await;
        drop(peer);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.stats().messages_received, 0);
        assert!(!server.state().is_terminating());

        let output = OutputStaging::new();
        assert!(output.write_message(&ProtocolMessage::NoOperation));
        assert!(transport.flush_internal(&output, false).unwrap());
        assert!(output.is_empty());
        assert_eq!(transport.bytes_in_flight(), 0);
    }
}
