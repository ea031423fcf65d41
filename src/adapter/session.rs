//! Per-adapter session: the client/server handshake and Data exchange state
//! machines built on top of the [`protocol`](super::protocol) wire format
//! (spec.md §4.5).

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::adapter::protocol::{Frame, FrameBody, MAX_DATAGRAM};
use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::message::{payload, ChannelId, Message, Payload};
use crate::system::SystemContext;
use crate::worker::{RawFrame, TimerTick, Worker, WorkerId, WorkerMsg};

/// Decodes a Data frame body into zero or more bus payloads (spec.md §4.5
/// "Publish/consume binding"). `None` uses the default: one payload holding
/// the raw bytes.
pub type FrameDecoder = Box<dyn Fn(&[u8]) -> Result<Vec<Payload>> + Send + Sync>;
/// Encodes a bus message's payload into a Data frame body. `None` uses the
/// default: the payload must already be `Vec<u8>`.
pub type FrameEncoder = Box<dyn Fn(&Payload) -> Result<Vec<u8>> + Send + Sync>;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum SessionState {
    Idle,
    AwaitingAccept,
    Connected,
    Failed,
    Terminated,
}

/// A worker that speaks the adapter UDP protocol to one external-process
/// peer, either as the connecting client or the listening server (spec.md
/// §4.5: "The protocol is symmetric with distinct client/server
/// initiation").
pub struct AdapterWorker {
    id: WorkerId,
    is_client: bool,
    schema: String,
    remote_ip: IpAddr,
    remote_port: Option<u16>,
    socket_timeout: Duration,
    data_interval: Duration,
    max_failures: u32,
    write_to: Vec<ChannelId>,
    decoder: Option<FrameDecoder>,
    encoder: Option<FrameEncoder>,

    socket: Option<Arc<UdpSocket>>,
    reader_task: Option<JoinHandle<()>>,
    state: SessionState,
    own_id: i32,
    remote_id: Option<i32>,
    next_client_id: i32,
    last_data_millis: Option<i64>,
    failures: u32,
    timer_id: u64,
    expected_timer_id: Option<u64>,
}

impl AdapterWorker {
    pub fn new(
        id: WorkerId,
        config: &WorkerConfig,
        decoder: Option<FrameDecoder>,
        encoder: Option<FrameEncoder>,
    ) -> Result<Self> {
        let remote_ip: IpAddr = config
            .remote_ip_address()?
            .parse()
            .map_err(|e| Error::Config(format!("invalid remote-ip-address: {e}")))?;
        let is_client = config.is_adapter_client();
        let remote_port = if is_client {
            Some(config.remote_port()?)
        } else {
            None
        };
        Ok(AdapterWorker {
            id,
            is_client,
            schema: config.schema()?.to_string(),
            remote_ip,
            remote_port,
            socket_timeout: config.socket_timeout(),
            data_interval: config.data_interval(),
            max_failures: config.max_failures(),
            write_to: config.write_to().into_iter().map(ChannelId::from).collect(),
            decoder,
            encoder,
            socket: None,
            reader_task: None,
            state: SessionState::Idle,
            own_id: 0,
            remote_id: None,
            next_client_id: 1,
            last_data_millis: None,
            failures: 0,
            timer_id: 0,
            expected_timer_id: None,
        })
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.remote_port.map(|port| SocketAddr::new(self.remote_ip, port))
    }

    async fn send_frame(&self, frame: &Frame, to: SocketAddr) -> Result<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| Error::Programming("adapter socket not initialized".into()))?;
        let bytes = frame.encode()?;
        socket.send_to(&bytes, to).await?;
        Ok(())
    }

    fn schedule_timeout(&mut self, ctx: &SystemContext, delay: Duration) {
        self.timer_id += 1;
        let id = self.timer_id;
        self.expected_timer_id = Some(id);
        let mailbox = ctx.mailbox_sender();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            mailbox.try_deliver(WorkerMsg::Timer(TimerTick { id }));
        });
    }

    async fn handle_request(
        &mut self,
        ctx: &SystemContext,
        from: SocketAddr,
        _sender_id: i32,
        schema: &str,
        interval_millis: i32,
    ) -> Result<()> {
        if schema != self.schema {
            warn!(
                "worker {}: schema mismatch (got {schema:?}, want {:?}); rejecting",
                self.id, self.schema
            );
            let frame = Frame::new(
                self.own_id,
                ctx.clock().now_millis(),
                FrameBody::Reject { reason_code: 1 },
            );
            return self.send_frame(&frame, from).await;
        }

        let assigned = self.next_client_id;
        self.next_client_id += 1;
        self.remote_port = Some(from.port());
        // The client stamps every frame after this one with its assigned id,
        // not the `sender_id` it used on the initial Request, so that (not
        // the raw request's id) is what this side must expect going forward.
        self.remote_id = Some(assigned);
        self.state = SessionState::Connected;
        self.last_data_millis = None;
        self.failures = 0;

        let frame = Frame::new(
            self.own_id,
            ctx.clock().now_millis(),
            FrameBody::Accept {
                server_flags: 0,
                sim_millis: ctx.clock().now_millis(),
                interval_millis,
                assigned_client_id: assigned,
            },
        );
        self.send_frame(&frame, from).await?;
        info!("worker {}: accepted client, assigned id {assigned}", self.id);
        self.schedule_timeout(ctx, self.socket_timeout);
        Ok(())
    }

    async fn handle_data(&mut self, ctx: &SystemContext, epoch_millis: i64, bytes: &[u8]) {
        if let Some(last) = self.last_data_millis {
            if epoch_millis < last {
                warn!(
                    "worker {}: out-of-order Data (epochMillis {epoch_millis} < {last}); discarding",
                    self.id
                );
                return;
            }
        }
        self.last_data_millis = Some(epoch_millis);

        let payloads = match &self.decoder {
            Some(decode) => match decode(bytes) {
                Ok(p) => p,
                Err(e) => {
                    warn!("worker {}: failed to decode Data body: {e}", self.id);
                    return;
                }
            },
            None => vec![payload(bytes.to_vec())],
        };
        for p in payloads {
            for channel in &self.write_to {
                ctx.publish_payload(channel, p.clone());
            }
        }
    }

    async fn handle_frame(&mut self, ctx: &SystemContext, raw: RawFrame) -> Result<()> {
        if raw.from.ip() != self.remote_ip {
            warn!(
                "worker {}: frame from unexpected ip {} (want {}); discarding",
                self.id,
                raw.from.ip(),
                self.remote_ip
            );
            return Ok(());
        }
        let frame = match Frame::decode(&raw.bytes) {
            Ok(f) => f,
            Err(e) => {
                warn!("worker {}: malformed frame: {e}", self.id);
                return Ok(());
            }
        };
        if let Some(port) = self.remote_port {
            if raw.from.port() != port {
                warn!(
                    "worker {}: frame from unexpected port {} (want {port}); discarding",
                    self.id,
                    raw.from.port()
                );
                return Ok(());
            }
        }
        if let Some(expected) = self.remote_id {
            if frame.sender_id != expected {
                warn!(
                    "worker {}: frame senderId {} != remembered {expected}; discarding",
                    self.id, frame.sender_id
                );
                return Ok(());
            }
        }

        match (self.state, frame.body) {
            (SessionState::Idle, FrameBody::Request { schema, interval_millis, .. })
                if !self.is_client =>
            {
                self.handle_request(ctx, raw.from, frame.sender_id, &schema, interval_millis)
                    .await?;
            }
            (
                SessionState::AwaitingAccept,
                FrameBody::Accept { assigned_client_id, .. },
            ) if self.is_client => {
                self.remote_id = Some(frame.sender_id);
                self.own_id = assigned_client_id;
                self.state = SessionState::Connected;
                self.last_data_millis = None;
                self.failures = 0;
                info!("worker {}: connected, assigned id {}", self.id, self.own_id);
                self.schedule_timeout(ctx, self.socket_timeout);
            }
            (SessionState::AwaitingAccept, FrameBody::Reject { reason_code }) if self.is_client => {
                warn!("worker {}: connection rejected (code {reason_code})", self.id);
                self.state = SessionState::Failed;
                ctx.request_self_termination();
            }
            (SessionState::Connected, FrameBody::Data { bytes }) => {
                self.handle_data(ctx, frame.epoch_millis, &bytes).await;
                self.schedule_timeout(ctx, self.socket_timeout);
            }
            (SessionState::Connected, FrameBody::Stop) => {
                info!("worker {}: peer sent Stop", self.id);
                if self.is_client {
                    self.state = SessionState::Terminated;
                    ctx.request_self_termination();
                } else {
                    self.state = SessionState::Idle;
                    self.remote_port = None;
                    self.remote_id = None;
                }
            }
            (SessionState::Connected, body @ (FrameBody::Pause | FrameBody::Resume)) => {
                debug!("worker {}: peer sent {body:?}", self.id);
            }
            (state, body) => {
                debug!("worker {}: ignoring {body:?} while {state:?}", self.id);
            }
        }
        Ok(())
    }

    async fn handle_timer(&mut self, ctx: &SystemContext, tick: TimerTick) -> Result<()> {
        if Some(tick.id) != self.expected_timer_id {
            return Ok(());
        }
        self.expected_timer_id = None;
        match self.state {
            SessionState::AwaitingAccept => {
                warn!("worker {}: no Accept within socket-timeout", self.id);
                self.state = SessionState::Failed;
                ctx.request_self_termination();
            }
            SessionState::Connected => {
                self.failures += 1;
                if self.failures > self.max_failures {
                    warn!(
                        "worker {}: exceeded max-failures on liveness timeout; terminating",
                        self.id
                    );
                    self.state = SessionState::Terminated;
                    ctx.request_self_termination();
                } else {
                    warn!(
                        "worker {}: liveness timeout ({}/{}), retrying",
                        self.id, self.failures, self.max_failures
                    );
                    self.schedule_timeout(ctx, self.socket_timeout);
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_bus(&mut self, ctx: &SystemContext, message: Message) -> Result<()> {
        if self.state != SessionState::Connected {
            return Ok(());
        }
        let Some(peer) = self.peer_addr() else {
            return Ok(());
        };
        let body_bytes = match &self.encoder {
            Some(encode) => match encode(&message.payload) {
                Ok(b) => b,
                Err(e) => {
                    warn!("worker {}: failed to encode outbound message: {e}", self.id);
                    return Ok(());
                }
            },
            None => match message.payload.downcast_ref::<Vec<u8>>() {
                Some(b) => b.clone(),
                None => {
                    warn!(
                        "worker {}: no encoder configured and payload is not raw bytes",
                        self.id
                    );
                    return Ok(());
                }
            },
        };
        let frame = Frame::new(
            self.own_id,
            ctx.clock().now_millis(),
            FrameBody::Data { bytes: body_bytes },
        );
        if let Err(e) = self.send_frame(&frame, peer).await {
            warn!("worker {}: failed to transmit Data frame: {e}", self.id);
        }
        Ok(())
    }
}

#[async_trait]
impl Worker for AdapterWorker {
    fn id(&self) -> &WorkerId {
        &self.id
    }

    async fn initialize(&mut self, ctx: &SystemContext, config: &WorkerConfig) -> Result<()> {
        let own_ip = config.own_ip_address()?;
        let own_port = config.own_port()?;
        let bind_addr: SocketAddr = format!("{own_ip}:{own_port}")
            .parse()
            .map_err(|e| Error::Config(format!("invalid own-ip-address/own-port: {e}")))?;
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        self.socket = Some(socket.clone());

        let mailbox = ctx.mailbox_sender();
        let clock = ctx.clock().clone();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        let frame = RawFrame {
                            bytes: buf[..n].to_vec(),
                            from,
                            received_sim_millis: clock.now_millis(),
                        };
                        if !mailbox.try_deliver(WorkerMsg::Frame(frame)) {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("adapter socket read error: {e}");
                        break;
                    }
                }
            }
        });
        self.reader_task = Some(reader);
        Ok(())
    }

    async fn start(&mut self, ctx: &SystemContext) -> Result<()> {
        if self.is_client {
            let remote_port = self.remote_port.ok_or_else(|| {
                Error::Config("remote-port is required for an adapter client".into())
            })?;
            let frame = Frame::new(
                self.own_id,
                ctx.clock().now_millis(),
                FrameBody::Request {
                    flags: 0,
                    schema: self.schema.clone(),
                    requested_sim_millis: ctx.clock().now_millis(),
                    interval_millis: self.data_interval.as_millis() as i32,
                },
            );
            self.send_frame(&frame, SocketAddr::new(self.remote_ip, remote_port))
                .await?;
            self.state = SessionState::AwaitingAccept;
            self.schedule_timeout(ctx, self.socket_timeout);
        }
        Ok(())
    }

    async fn terminate(&mut self, _ctx: &SystemContext) {
        if self.state == SessionState::Connected {
            if let Some(peer) = self.peer_addr() {
                let frame = Frame::new(self.own_id, 0, FrameBody::Stop);
                let _ = self.send_frame(&frame, peer).await;
            }
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.state = SessionState::Terminated;
    }

    async fn handle(&mut self, ctx: &SystemContext, msg: WorkerMsg) -> Result<()> {
        match msg {
            WorkerMsg::Frame(raw) => self.handle_frame(ctx, raw).await,
            WorkerMsg::Timer(tick) => self.handle_timer(ctx, tick).await,
            WorkerMsg::Bus(message) => self.handle_bus(ctx, message).await,
            WorkerMsg::Lifecycle(_) => Ok(()),
        }
    }
}
