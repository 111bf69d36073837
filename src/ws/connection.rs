//! WebSocket connection: message reassembly, control frames and the run loop.

use crate::{
    errors::{Error, Result},
    http::{reader::BufferedReader, request::Request},
    limits::WebSocketLimits,
    ws::frame::{Frame, Opcode},
};
use std::{future::Future, net::SocketAddr, pin::Pin, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    time::{interval_at, sleep_until, timeout, Instant, Interval, MissedTickBehavior},
};
use tracing::trace;

/// Any bidirectional byte stream a WebSocket can run over.
pub trait Socket: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Socket for T {}

/// Callbacks for an upgraded connection.
///
/// Every method has a default, so a handler only implements what it needs.
/// Frames returned from [`on_frame`](Self::on_frame) are sent back in order.
///
/// # Examples
/// ```
/// use kiln::{Frame, Opcode, WebSocketConnection, WebSocketHandler};
///
/// struct Echo;
///
/// impl WebSocketHandler for Echo {
///     async fn on_frame(&self, _: &mut WebSocketConnection, frame: Frame) -> Option<Vec<Frame>> {
///         match frame.opcode {
///             Opcode::Text | Opcode::Binary => Some(vec![Frame::new(frame.opcode, frame.payload)]),
///             _ => None,
///         }
///     }
/// }
/// ```
pub trait WebSocketHandler: Send + Sync + 'static {
    /// Picks one of the subprotocols offered by the client.
    fn select_protocol(&self, _offered: &[String]) -> Option<String> {
        None
    }

    /// Called once after the `101` response has been written.
    fn on_open(
        &self,
        _conn: &mut WebSocketConnection,
        _request: &Request,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Called for every complete message and every control frame.
    ///
    /// Returning `None` for a ping sends a pong with the same payload;
    /// returning `None` for a close echoes the close. The loop ends after a
    /// close either way.
    fn on_frame(
        &self,
        _conn: &mut WebSocketConnection,
        _frame: Frame,
    ) -> impl Future<Output = Option<Vec<Frame>>> + Send {
        async { None }
    }

    /// Period of [`on_tick`](Self::on_tick); `None` disables ticks.
    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    /// Server-initiated work, e.g. pushing updates. An error ends the loop.
    fn on_tick(&self, _conn: &mut WebSocketConnection) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe form of [`WebSocketHandler`].
pub(crate) trait DynWebSocketHandler: Send + Sync + 'static {
    fn select_protocol(&self, offered: &[String]) -> Option<String>;
    fn tick_interval(&self) -> Option<Duration>;
    fn on_open<'a>(
        &'a self,
        conn: &'a mut WebSocketConnection,
        request: &'a Request,
    ) -> BoxFuture<'a, ()>;
    fn on_frame<'a>(
        &'a self,
        conn: &'a mut WebSocketConnection,
        frame: Frame,
    ) -> BoxFuture<'a, Option<Vec<Frame>>>;
    fn on_tick<'a>(&'a self, conn: &'a mut WebSocketConnection) -> BoxFuture<'a, Result<()>>;
}

impl<H: WebSocketHandler> DynWebSocketHandler for H {
    #[inline]
    fn select_protocol(&self, offered: &[String]) -> Option<String> {
        WebSocketHandler::select_protocol(self, offered)
    }

    #[inline]
    fn tick_interval(&self) -> Option<Duration> {
        WebSocketHandler::tick_interval(self)
    }

    fn on_open<'a>(
        &'a self,
        conn: &'a mut WebSocketConnection,
        request: &'a Request,
    ) -> BoxFuture<'a, ()> {
        Box::pin(WebSocketHandler::on_open(self, conn, request))
    }

    fn on_frame<'a>(
        &'a self,
        conn: &'a mut WebSocketConnection,
        frame: Frame,
    ) -> BoxFuture<'a, Option<Vec<Frame>>> {
        Box::pin(WebSocketHandler::on_frame(self, conn, frame))
    }

    fn on_tick<'a>(&'a self, conn: &'a mut WebSocketConnection) -> BoxFuture<'a, Result<()>> {
        Box::pin(WebSocketHandler::on_tick(self, conn))
    }
}

/// An upgraded connection.
///
/// Owns the socket for its whole lifetime. Incoming frames are decoded from
/// a [`BufferedReader`]; the only await point while reading is the socket
/// fill, so the run loop can stop waiting for data to serve a tick without
/// losing part of a frame.
pub struct WebSocketConnection {
    reader: BufferedReader<Box<dyn Socket>>,
    limits: WebSocketLimits,
    write_timeout: Option<Duration>,
    peer_addr: Option<SocketAddr>,

    partial: Option<(Opcode, Vec<u8>)>,
    close_sent: bool,
}

impl WebSocketConnection {
    /// Wraps a stream on which the handshake has already been completed.
    pub fn new<S: Socket>(stream: S, limits: WebSocketLimits) -> Self {
        let stream: Box<dyn Socket> = Box::new(stream);
        Self::from_reader(BufferedReader::new(stream), limits, None, None)
    }

    pub(crate) fn from_reader(
        reader: BufferedReader<Box<dyn Socket>>,
        limits: WebSocketLimits,
        write_timeout: Option<Duration>,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            reader,
            limits,
            write_timeout,
            peer_addr,
            partial: None,
            close_sent: false,
        }
    }

    #[inline(always)]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// `true` once a close frame has been sent.
    #[inline(always)]
    pub fn is_closing(&self) -> bool {
        self.close_sent
    }

    /// Reads one raw frame, without reassembly.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.poll_frame()? {
                return Ok(frame);
            }
            self.fill().await?;
        }
    }

    /// Reads one complete message.
    ///
    /// Text and binary messages split over continuation frames are joined
    /// into a single final frame. Control frames are returned as they arrive,
    /// also in the middle of a fragmented message, which then continues
    /// with the next call.
    pub async fn read_message(&mut self) -> Result<Frame> {
        loop {
            if let Some(message) = self.poll_message()? {
                return Ok(message);
            }
            self.fill().await?;
        }
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<()> {
        trace!(opcode = ?frame.opcode, len = frame.payload.len(), "websocket send");

        let bytes = frame.encode();
        let stream = self.reader.get_mut();
        let write = async {
            stream.write_all(&bytes).await?;
            stream.flush().await?;
            Ok::<(), std::io::Error>(())
        };

        match self.write_timeout {
            Some(time) => timeout(time, write).await??,
            None => write.await?,
        }

        if frame.opcode == Opcode::Close {
            self.close_sent = true;
        }
        Ok(())
    }

    #[inline]
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.send(&Frame::text(text)).await
    }

    #[inline]
    pub async fn send_binary(&mut self, data: &[u8]) -> Result<()> {
        self.send(&Frame::binary(data)).await
    }

    #[inline]
    pub async fn ping(&mut self, data: &[u8]) -> Result<()> {
        self.send(&Frame::ping(data)).await
    }

    /// Starts the closing handshake. The run loop keeps going until the
    /// peer answers with its own close frame.
    #[inline]
    pub async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        self.send(&Frame::close(code, reason)).await
    }

    /// Dispatches messages to `handler` until the connection closes.
    ///
    /// Returns `Ok(())` after a completed closing handshake. Socket errors,
    /// protocol errors, the idle timeout and errors from
    /// [`WebSocketHandler::on_tick`] are returned to the caller.
    pub async fn run<H: WebSocketHandler>(&mut self, handler: &H) -> Result<()> {
        self.run_dyn(handler).await
    }

    pub(crate) async fn run_dyn(&mut self, handler: &dyn DynWebSocketHandler) -> Result<()> {
        let mut ticker = handler.tick_interval().map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let idle = self.limits.idle_timeout;
        let mut last_seen = Instant::now();

        loop {
            let Some(frame) = self.poll_message()? else {
                tokio::select! {
                    read = self.reader.fill() => {
                        if read? == 0 {
                            return Err(Error::ConnectionClosed);
                        }
                        last_seen = Instant::now();
                    }
                    _ = next_tick(&mut ticker) => handler.on_tick(self).await?,
                    _ = idle_expired(idle, last_seen) => {
                        let _ = self.close(1001, "idle timeout").await;
                        return Err(Error::Timeout);
                    }
                }
                continue;
            };

            let opcode = frame.opcode;
            let ping = match opcode {
                Opcode::Ping => Some(frame.payload.clone()),
                _ => None,
            };
            let close_code = frame.close_code();

            let reply = handler.on_frame(self, frame).await;
            for frame in reply.iter().flatten() {
                self.send(frame).await?;
            }

            match (opcode, reply.is_some()) {
                (Opcode::Ping, false) => {
                    self.send(&Frame::pong(ping.unwrap_or_default())).await?;
                }
                (Opcode::Close, answered) => {
                    if !answered && !self.close_sent {
                        let echo = match close_code {
                            Some(code) => Frame::close(code, ""),
                            None => Frame::new(Opcode::Close, Vec::new()),
                        };
                        self.send(&echo).await?;
                    }
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    /// Shuts down the write side of the socket.
    pub(crate) async fn shutdown(&mut self) {
        let _ = self.reader.get_mut().shutdown().await;
    }

    async fn fill(&mut self) -> Result<()> {
        match self.reader.fill().await? {
            0 => Err(Error::ConnectionClosed),
            _ => Ok(()),
        }
    }

    fn poll_frame(&mut self) -> Result<Option<Frame>> {
        let Some((frame, used)) = Frame::parse(self.reader.buffered(), self.limits.max_frame_size)?
        else {
            return Ok(None);
        };

        self.reader.consume(used);
        trace!(opcode = ?frame.opcode, fin = frame.fin, len = frame.payload.len(), "websocket frame");
        Ok(Some(frame))
    }

    fn poll_message(&mut self) -> Result<Option<Frame>> {
        while let Some(frame) = self.poll_frame()? {
            if let Some(message) = self.assemble(frame)? {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    fn assemble(&mut self, frame: Frame) -> Result<Option<Frame>> {
        if frame.opcode.is_control() {
            return Ok(Some(frame));
        }

        let limit = self.limits.max_message_size;
        match (self.partial.take(), frame.opcode) {
            (None, Opcode::Continuation) => Err(Error::InvalidFrame("continuation without a message")),
            (None, _) if frame.fin => Ok(Some(frame)),
            (None, opcode) => {
                if frame.payload.len() as u64 > limit {
                    return Err(Error::FrameTooLarge { limit });
                }
                self.partial = Some((opcode, frame.payload));
                Ok(None)
            }
            (Some(_), _) if frame.opcode != Opcode::Continuation => {
                Err(Error::InvalidFrame("expected a continuation frame"))
            }
            (Some((opcode, mut data)), _) => {
                if (data.len() + frame.payload.len()) as u64 > limit {
                    return Err(Error::FrameTooLarge { limit });
                }
                data.extend_from_slice(&frame.payload);

                match frame.fin {
                    true => Ok(Some(Frame {
                        fin: true,
                        opcode,
                        payload: data,
                        mask: frame.mask,
                    })),
                    false => {
                        self.partial = Some((opcode, data));
                        Ok(None)
                    }
                }
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn idle_expired(idle: Option<Duration>, since: Instant) {
    match idle {
        Some(idle) => sleep_until(since + idle).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    const KEY: [u8; 4] = [0x0F, 0xA0, 0x33, 0x5C];

    struct Client {
        reader: BufferedReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn send(&mut self, frame: Frame) {
            self.writer.write_all(&frame.encode_masked(KEY)).await.unwrap();
        }

        async fn recv(&mut self) -> Frame {
            loop {
                if let Some((frame, used)) = Frame::parse(self.reader.buffered(), u64::MAX).unwrap() {
                    self.reader.consume(used);
                    return frame;
                }
                assert!(self.reader.fill().await.unwrap() > 0, "server closed");
            }
        }
    }

    fn pair(limits: WebSocketLimits) -> (WebSocketConnection, Client) {
        let (client, server) = duplex(64 * 1024);
        let (read, write) = tokio::io::split(client);
        let client = Client {
            reader: BufferedReader::new(read),
            writer: write,
        };
        (WebSocketConnection::new(server, limits), client)
    }

    fn fragment(opcode: Opcode, fin: bool, payload: &[u8]) -> Frame {
        Frame {
            fin,
            opcode,
            payload: payload.to_vec(),
            mask: None,
        }
    }

    #[tokio::test]
    async fn fragmented_message() {
        let (mut conn, mut client) = pair(WebSocketLimits::default());

        client.send(fragment(Opcode::Text, false, b"Hel")).await;
        client.send(fragment(Opcode::Continuation, false, b"lo, ")).await;
        client.send(fragment(Opcode::Continuation, true, b"world")).await;

        let message = conn.read_message().await.unwrap();
        assert!(message.fin);
        assert_eq!(message.opcode, Opcode::Text);
        assert_eq!(message.as_text(), Some("Hello, world"));
    }

    #[tokio::test]
    async fn control_frame_inside_message() {
        let (mut conn, mut client) = pair(WebSocketLimits::default());

        client.send(fragment(Opcode::Binary, false, &[1, 2])).await;
        client.send(Frame::ping("p")).await;
        client.send(fragment(Opcode::Continuation, true, &[3])).await;

        let ping = conn.read_message().await.unwrap();
        assert_eq!(ping.opcode, Opcode::Ping);

        let message = conn.read_message().await.unwrap();
        assert_eq!(message.opcode, Opcode::Binary);
        assert_eq!(message.payload, [1, 2, 3]);
    }

    #[tokio::test]
    async fn sequence_errors() {
        let (mut conn, mut client) = pair(WebSocketLimits::default());
        client.send(fragment(Opcode::Text, false, b"a")).await;
        client.send(fragment(Opcode::Text, true, b"b")).await;
        assert!(matches!(conn.read_message().await, Err(Error::InvalidFrame(_))));

        let (mut conn, mut client) = pair(WebSocketLimits::default());
        client.send(fragment(Opcode::Continuation, true, b"a")).await;
        assert!(matches!(conn.read_message().await, Err(Error::InvalidFrame(_))));
    }

    #[tokio::test]
    async fn message_limit() {
        let limits = WebSocketLimits {
            max_frame_size: 100,
            max_message_size: 150,
            ..WebSocketLimits::default()
        };

        let (mut conn, mut client) = pair(limits.clone());
        client.send(fragment(Opcode::Binary, false, &[0; 100])).await;
        client.send(fragment(Opcode::Continuation, true, &[0; 100])).await;
        assert!(matches!(
            conn.read_message().await,
            Err(Error::FrameTooLarge { limit: 150 })
        ));

        let (mut conn, mut client) = pair(limits);
        client.send(Frame::binary(vec![0; 101])).await;
        assert!(matches!(
            conn.read_frame().await,
            Err(Error::FrameTooLarge { limit: 100 })
        ));
    }

    struct Echo {
        ticks: Arc<AtomicUsize>,
        tick: Option<Duration>,
    }

    impl WebSocketHandler for Echo {
        async fn on_frame(&self, _: &mut WebSocketConnection, frame: Frame) -> Option<Vec<Frame>> {
            match frame.opcode {
                Opcode::Text => Some(vec![Frame::text(format!("echo: {}", frame.as_text()?))]),
                _ => None,
            }
        }

        fn tick_interval(&self) -> Option<Duration> {
            self.tick
        }

        async fn on_tick(&self, conn: &mut WebSocketConnection) -> Result<()> {
            let n = self.ticks.fetch_add(1, Ordering::SeqCst);
            conn.send_text(&format!("tick {n}")).await
        }
    }

    #[tokio::test]
    async fn run_loop() {
        let (mut conn, mut client) = pair(WebSocketLimits::default());
        let handler = Echo {
            ticks: Arc::default(),
            tick: None,
        };
        let server = tokio::spawn(async move { conn.run(&handler).await });

        client.send(Frame::text("hi")).await;
        assert_eq!(client.recv().await.as_text(), Some("echo: hi"));

        client.send(Frame::ping(vec![9, 9])).await;
        let pong = client.recv().await;
        assert_eq!(pong.opcode, Opcode::Pong);
        assert_eq!(pong.payload, [9, 9]);

        // Unanswered data frames produce nothing
        client.send(Frame::binary(vec![1])).await;

        client.send(Frame::close(1000, "done")).await;
        let close = client.recv().await;
        assert_eq!(close.opcode, Opcode::Close);
        assert_eq!(close.close_code(), Some(1000));
        assert!(close.mask.is_none());

        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn ticks_do_not_break_frames() {
        let (mut conn, mut client) = pair(WebSocketLimits::default());
        let ticks = Arc::new(AtomicUsize::new(0));
        let handler = Echo {
            ticks: ticks.clone(),
            tick: Some(Duration::from_millis(5)),
        };
        let server = tokio::spawn(async move { conn.run(&handler).await });

        assert_eq!(client.recv().await.as_text(), Some("tick 0"));

        // Send a frame byte by byte, slower than the tick period
        let wire = Frame::text("slow").encode_masked(KEY);
        for byte in wire {
            client.writer.write_all(&[byte]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        loop {
            let frame = client.recv().await;
            if frame.as_text() == Some("echo: slow") {
                break;
            }
            assert!(frame.as_text().unwrap().starts_with("tick "));
        }
        assert!(ticks.load(Ordering::SeqCst) > 1);

        client.send(Frame::close(1000, "")).await;
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn idle_timeout() {
        let limits = WebSocketLimits {
            idle_timeout: Some(Duration::from_millis(30)),
            ..WebSocketLimits::default()
        };
        let (mut conn, mut client) = pair(limits);
        let handler = Echo {
            ticks: Arc::default(),
            tick: None,
        };

        let result = conn.run(&handler).await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert_eq!(client.recv().await.close_code(), Some(1001));
    }

    #[tokio::test]
    async fn server_initiated_close() {
        let (mut conn, mut client) = pair(WebSocketLimits::default());

        conn.close(1000, "bye").await.unwrap();
        assert!(conn.is_closing());
        assert_eq!(client.recv().await.close_reason(), Some("bye"));

        client.send(Frame::close(1000, "")).await;
        let handler = Echo {
            ticks: Arc::default(),
            tick: None,
        };
        conn.run(&handler).await.unwrap();
    }

    #[tokio::test]
    async fn peer_disconnect() {
        let (mut conn, client) = pair(WebSocketLimits::default());
        drop(client);

        assert!(matches!(conn.read_frame().await, Err(Error::ConnectionClosed)));
    }
}
