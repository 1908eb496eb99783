//! Telemetry worker task, publish client and subscription dispatch

use core::net::{Ipv4Addr, SocketAddrV4};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{with_deadline, with_timeout, Duration, Instant, Timer};
use heapless::{String, Vec};
use log::{debug, error, info, warn};
use mqttrs::{
    decode_slice, encode_slice, Connect, ConnectReturnCode, Packet, Pid, Protocol, Publish, QoS,
    QosPid, Subscribe, SubscribeReturnCodes, SubscribeTopic,
};

use super::frame::{PacketError, PacketReader};
use super::state_machine::{
    ConnectionMachine, ConnectionState, RetryPolicy, WorkerAction, WorkerEvent,
};
use super::{
    ConnectError, PublishError, CLIENT_ID, MAX_PAYLOAD_LEN, MAX_PUBLISH_LEN, MAX_TOPIC_LEN,
    RX_BUFFER_SIZE, SUBSCRIPTION_POOL_SIZE, TX_BUFFER_SIZE,
};

/// Byte stream to the broker plus name resolution
#[allow(async_fn_in_trait)]
pub trait Transport {
    type Error: core::fmt::Debug;

    async fn resolve(&mut self, host: &str) -> Result<Ipv4Addr, Self::Error>;
    async fn connect(&mut self, remote: SocketAddrV4) -> Result<(), Self::Error>;
    /// `Ok(0)` means the peer closed the connection
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), Self::Error>;
    /// Drop the connection, ready for a fresh `connect`
    async fn close(&mut self);
}

/// Topics the codec accepts in one SUBSCRIBE
pub const MAX_SUBSCRIBE_TOPICS: usize = 5;

/// Bounded waits of the worker and the publish client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerTimeouts {
    pub connack: Duration,
    pub suback: Duration,
    /// Socket wait of one `Connected` poll round
    pub poll: Duration,
    pub publish_ack: Duration,
}

impl Default for WorkerTimeouts {
    fn default() -> Self {
        Self {
            connack: Duration::from_secs(2),
            suback: Duration::from_secs(4),
            poll: Duration::from_secs(1),
            publish_ack: Duration::from_secs(4),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig<'a> {
    /// Host name or dotted IPv4 literal
    pub broker_host: &'a str,
    pub broker_port: u16,
    pub client_id: &'a str,
    pub ping_interval: Duration,
    /// Topics subscribed after every connect, may be empty
    pub topics: &'a [&'a str],
    pub timeouts: WorkerTimeouts,
    pub policy: RetryPolicy,
}

impl<'a> WorkerConfig<'a> {
    pub fn new(broker_host: &'a str, broker_port: u16) -> Self {
        Self {
            broker_host,
            broker_port,
            client_id: CLIENT_ID,
            ping_interval: Duration::from_secs(60),
            topics: &[],
            timeouts: WorkerTimeouts::default(),
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_topics(mut self, topics: &'a [&'a str]) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_timeouts(mut self, timeouts: WorkerTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Keep-alive announced in CONNECT, twice the ping interval
    pub fn keep_alive_secs(&self) -> u16 {
        u16::try_from(self.ping_interval.as_secs().saturating_mul(2)).unwrap_or(u16::MAX)
    }
}

/// Outbound QoS 1 message handed to the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub topic: String<MAX_TOPIC_LEN>,
    pub payload: Vec<u8, MAX_PUBLISH_LEN>,
    pub message_id: u16,
    pub retain: bool,
}

impl PublishRequest {
    pub fn new(topic: &str, payload: &[u8], message_id: u16) -> Result<Self, PublishError> {
        Ok(Self {
            topic: String::try_from(topic).map_err(|_| PublishError::EncodeOverflow)?,
            payload: Vec::from_slice(payload).map_err(|_| PublishError::EncodeOverflow)?,
            message_id,
            retain: true,
        })
    }
}

/// Inbound message waiting for the dispatch task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionMessage {
    pub topic: String<MAX_TOPIC_LEN>,
    pub payload: Vec<u8, MAX_PAYLOAD_LEN>,
}

impl SubscriptionMessage {
    pub fn payload_str(&self) -> Option<&str> {
        core::str::from_utf8(&self.payload).ok()
    }
}

/// Consumer of subscription messages, run on the dispatch task
pub trait SubscriptionHandler {
    fn on_message(&mut self, message: &SubscriptionMessage);
}

/// Result of the broker liveness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Silent { silent_for: Duration },
}

/// State shared between the worker and every other context
pub struct WorkerShared {
    connected: AtomicBool,
    disconnect_pending: AtomicBool,
    /// Uptime seconds of the last CONNACK or PINGRESP
    last_alive_secs: AtomicU32,
    dropped_messages: AtomicU32,
    requests: Channel<CriticalSectionRawMutex, PublishRequest, 1>,
    acks: Signal<CriticalSectionRawMutex, u16>,
    connected_signal: Signal<CriticalSectionRawMutex, ()>,
    inbox: Channel<CriticalSectionRawMutex, SubscriptionMessage, SUBSCRIPTION_POOL_SIZE>,
}

impl WorkerShared {
    pub const fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            disconnect_pending: AtomicBool::new(false),
            last_alive_secs: AtomicU32::new(0),
            dropped_messages: AtomicU32::new(0),
            requests: Channel::new(),
            acks: Signal::new(),
            connected_signal: Signal::new(),
            inbox: Channel::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn disconnect_pending(&self) -> bool {
        self.disconnect_pending.load(Ordering::Acquire)
    }

    /// Link-layer notification that the network went away
    pub fn notify_disconnect(&self) {
        warn!("[MQTT] External disconnect notification");
        self.disconnect_pending.store(true, Ordering::Release);
    }

    pub fn last_alive_secs(&self) -> u32 {
        self.last_alive_secs.load(Ordering::Acquire)
    }

    /// Inbound messages dropped because the queue was full or the message too large
    pub fn dropped_messages(&self) -> u32 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Compare the time since the last broker response against `max_silence`
    pub fn liveness(&self, now: Instant, max_silence: Duration) -> Liveness {
        let last = Instant::from_secs(u64::from(self.last_alive_secs()));
        let silent_for = now.saturating_duration_since(last);
        if silent_for > max_silence {
            Liveness::Silent { silent_for }
        } else {
            Liveness::Alive
        }
    }

    pub async fn next_message(&self) -> SubscriptionMessage {
        self.inbox.receive().await
    }

    pub fn try_next_message(&self) -> Option<SubscriptionMessage> {
        self.inbox.try_receive().ok()
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
        if connected {
            self.connected_signal.signal(());
        }
    }

    fn mark_alive(&self) {
        let now = Instant::now().as_secs();
        self.last_alive_secs
            .store(u32::try_from(now).unwrap_or(u32::MAX), Ordering::Release);
    }

    // Single writer (the worker), so load + store is enough
    fn note_dropped(&self) {
        let dropped = self.dropped_messages.load(Ordering::Relaxed);
        self.dropped_messages
            .store(dropped.wrapping_add(1), Ordering::Relaxed);
    }

    fn deliver(&self, topic: &str, payload: &[u8]) {
        if !self.is_connected() {
            warn!("[MQTT] Not connected yet, dropping message on {}", topic);
            return;
        }

        let (Ok(topic_slot), Ok(payload_slot)) = (String::try_from(topic), Vec::from_slice(payload))
        else {
            warn!(
                "[MQTT] Message on {} too long ({} bytes), dropped",
                topic,
                payload.len()
            );
            self.note_dropped();
            return;
        };

        let message = SubscriptionMessage {
            topic: topic_slot,
            payload: payload_slot,
        };
        if self.inbox.try_send(message).is_err() {
            warn!("[MQTT] Subscription queue full, dropping message on {}", topic);
            self.note_dropped();
        }
    }
}

impl Default for WorkerShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one inbound packet as seen by the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Received {
    ConnAck(u8),
    SubAck { packet_id: u16, failed: bool },
    PubAck(u16),
    PingResp,
    Publish,
}

fn return_code(code: ConnectReturnCode) -> u8 {
    match code {
        ConnectReturnCode::Accepted => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::RefusedIdentifierRejected => 2,
        ConnectReturnCode::ServerUnavailable => 3,
        ConnectReturnCode::BadUsernamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    }
}

fn packet_id(id: u16) -> Result<Pid, PacketError> {
    Pid::try_from(id).map_err(|_| PacketError::Codec)
}

fn encode(packet: &Packet<'_>, buf: &mut [u8]) -> Result<usize, PacketError> {
    encode_slice(packet, buf).map_err(|e| {
        warn!("[MQTT] Encode failed: {:?}", e);
        PacketError::Codec
    })
}

/// Apply one packet to the shared state; the second value is a PUBACK to send
fn interpret(bytes: &[u8], shared: &WorkerShared) -> Result<(Received, Option<u16>), PacketError> {
    let packet = decode_slice(bytes)
        .map_err(|e| {
            warn!("[MQTT] Undecodable packet: {:?}", e);
            PacketError::Codec
        })?
        .ok_or(PacketError::Incomplete)?;

    match packet {
        Packet::Connack(connack) => {
            let code = return_code(connack.code);
            if code == 0 {
                shared.mark_alive();
            }
            Ok((Received::ConnAck(code), None))
        }
        Packet::Suback(suback) => {
            let failed = suback
                .return_codes
                .iter()
                .any(|code| matches!(code, SubscribeReturnCodes::Failure));
            Ok((
                Received::SubAck {
                    packet_id: suback.pid.get(),
                    failed,
                },
                None,
            ))
        }
        Packet::Puback(pid) => {
            shared.acks.signal(pid.get());
            Ok((Received::PubAck(pid.get()), None))
        }
        Packet::Pingresp => {
            debug!("[MQTT] PINGRESP");
            shared.mark_alive();
            Ok((Received::PingResp, None))
        }
        Packet::Publish(publish) => {
            shared.deliver(publish.topic_name, publish.payload);
            let reply = match publish.qospid {
                QosPid::AtLeastOnce(pid) => Some(pid.get()),
                _ => None,
            };
            Ok((Received::Publish, reply))
        }
        _ => Err(PacketError::Codec),
    }
}

/// Subscribe ids live in the upper half so they never collide with publish ids
fn next_subscribe_id(current: u16) -> u16 {
    0x8000 | (current.wrapping_add(1) & 0x7FFF)
}

/// Owns the broker connection and drives the [`ConnectionMachine`]
pub struct TelemetryWorker<'a, T: Transport> {
    transport: T,
    config: WorkerConfig<'a>,
    shared: &'a WorkerShared,
    machine: ConnectionMachine,
    reader: PacketReader<RX_BUFFER_SIZE>,
    tx: [u8; TX_BUFFER_SIZE],
    broker: Option<SocketAddrV4>,
    next_ping: Option<Instant>,
    subscribe_id: u16,
    in_flight: Option<u16>,
}

impl<'a, T: Transport> TelemetryWorker<'a, T> {
    pub fn new(transport: T, config: WorkerConfig<'a>, shared: &'a WorkerShared) -> Self {
        Self {
            transport,
            machine: ConnectionMachine::new(config.policy),
            config,
            shared,
            reader: PacketReader::new(),
            tx: [0; TX_BUFFER_SIZE],
            broker: None,
            next_ping: None,
            subscribe_id: 0,
            in_flight: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.get_current_state()
    }

    pub fn machine(&self) -> &ConnectionMachine {
        &self.machine
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Leave `Disconnected` and return the first action
    pub fn start(&mut self) -> WorkerAction {
        info!(
            "[MQTT] Worker started, broker {}:{}",
            self.config.broker_host, self.config.broker_port
        );
        self.machine.handle_event(WorkerEvent::Started)
    }

    pub async fn run(&mut self) -> ! {
        let mut action = self.start();
        loop {
            action = self.step(action).await;
        }
    }

    /// Execute one action and return the next one
    pub async fn step(&mut self, action: WorkerAction) -> WorkerAction {
        let event = match action {
            WorkerAction::Resolve => self.resolve().await,
            WorkerAction::Connect => self.connect().await,
            WorkerAction::Subscribe => self.subscribe().await,
            WorkerAction::Poll => self.poll().await,
            WorkerAction::Retry(delay) => {
                Timer::after(delay).await;
                return self.machine.entry_action();
            }
            WorkerAction::Teardown => {
                self.teardown().await;
                return self.machine.entry_action();
            }
            WorkerAction::Backoff(delay) => {
                self.shared.set_connected(false);
                Timer::after(delay).await;
                WorkerEvent::Started
            }
        };

        self.machine.handle_event(event)
    }

    async fn resolve(&mut self) -> WorkerEvent {
        let host = self.config.broker_host;

        let ip = match host.parse::<Ipv4Addr>() {
            Ok(ip) => ip,
            Err(_) => match self.transport.resolve(host).await {
                Ok(ip) => ip,
                Err(e) => {
                    error!("[MQTT] {} for {}: {:?}", ConnectError::DnsFailure, host, e);
                    return WorkerEvent::ResolveFailed;
                }
            },
        };

        info!("[MQTT] Broker {} resolved to {}", host, ip);
        self.broker = Some(SocketAddrV4::new(ip, self.config.broker_port));
        WorkerEvent::BrokerResolved
    }

    async fn connect(&mut self) -> WorkerEvent {
        self.shared.disconnect_pending.store(false, Ordering::Release);
        self.shared.set_connected(false);

        let Some(remote) = self.broker else {
            return WorkerEvent::ConnectFailed;
        };

        match self.open_session(remote).await {
            Ok(()) => {
                info!("[MQTT] Connected to {}", remote);
                self.next_ping = Some(Instant::now() + self.config.ping_interval);
                WorkerEvent::BrokerConnected
            }
            Err(e) => {
                error!("[MQTT] Connect to {} failed: {}", remote, e);
                self.transport.close().await;
                WorkerEvent::ConnectFailed
            }
        }
    }

    async fn open_session(&mut self, remote: SocketAddrV4) -> Result<(), ConnectError> {
        self.reader.clear();
        self.transport.connect(remote).await.map_err(|e| {
            warn!("[MQTT] TCP connect: {:?}", e);
            ConnectError::TransportFailure
        })?;

        let connect = Packet::Connect(Connect {
            protocol: Protocol::MQTT311,
            keep_alive: self.config.keep_alive_secs(),
            client_id: self.config.client_id,
            clean_session: true,
            last_will: None,
            username: None,
            password: None,
        });
        let len = encode(&connect, &mut self.tx).map_err(|_| ConnectError::TransportFailure)?;
        self.send(len).await?;

        let code = self.wait_connack().await?;
        if code != 0 {
            return Err(ConnectError::Refused(code));
        }
        Ok(())
    }

    /// The session counts as connected only once SUBACK arrives
    async fn subscribe(&mut self) -> WorkerEvent {
        let topics = self.config.topics;
        if topics.is_empty() {
            debug!("[MQTT] No subscriptions configured");
            self.shared.set_connected(true);
            return WorkerEvent::Subscribed;
        }
        if topics.len() > MAX_SUBSCRIBE_TOPICS || topics.iter().any(|t| t.len() > MAX_TOPIC_LEN) {
            error!("[MQTT] Subscription list does not fit one SUBSCRIBE");
            return WorkerEvent::SubscribeFailed;
        }

        self.subscribe_id = next_subscribe_id(self.subscribe_id);
        let id = self.subscribe_id;
        let Ok(pid) = packet_id(id) else {
            return WorkerEvent::SubscribeFailed;
        };
        let subscribe = Packet::Subscribe(Subscribe {
            pid,
            topics: topics
                .iter()
                .map(|topic| SubscribeTopic {
                    topic_path: (*topic).into(),
                    qos: QoS::AtMostOnce,
                })
                .collect(),
        });
        let Ok(len) = encode(&subscribe, &mut self.tx) else {
            return WorkerEvent::SubscribeFailed;
        };
        if self.send(len).await.is_err() {
            return WorkerEvent::LinkLost;
        }

        match self.wait_suback(id).await {
            Ok(false) => {
                info!("[MQTT] Subscribed to {} topic(s)", topics.len());
                self.shared.set_connected(true);
                WorkerEvent::Subscribed
            }
            Ok(true) => {
                warn!("[MQTT] Broker rejected subscription {}", id);
                WorkerEvent::SubscribeFailed
            }
            Err(ConnectError::AckTimeout) => {
                warn!("[MQTT] SUBACK {} timed out", id);
                WorkerEvent::SubscribeFailed
            }
            Err(_) => WorkerEvent::LinkLost,
        }
    }

    async fn poll(&mut self) -> WorkerEvent {
        let shared = self.shared;

        if shared.disconnect_pending() {
            info!("[MQTT] Closing session after disconnect notification");
            if let Ok(len) = encode(&Packet::Disconnect, &mut self.tx) {
                let _ = self.send(len).await;
            }
            return WorkerEvent::LinkLost;
        }

        let now = Instant::now();
        if self.next_ping.is_some_and(|at| now >= at) {
            self.next_ping = Some(now + self.config.ping_interval);
            let Ok(len) = encode(&Packet::Pingreq, &mut self.tx) else {
                return WorkerEvent::LinkLost;
            };
            if self.send(len).await.is_err() {
                return WorkerEvent::LinkLost;
            }
            debug!("[MQTT] PINGREQ");
        }

        // Only the socket read races the timeout; the reply is written after it
        let timeout = self.config.timeouts.poll;
        let reply = match select(with_timeout(timeout, self.read_packet()), shared.requests.receive()).await {
            Either::First(Ok(Ok((_, reply)))) => reply,
            Either::First(Err(_)) => return WorkerEvent::PollIdle,
            Either::First(Ok(Err(_))) => return WorkerEvent::LinkLost,
            Either::Second(request) => return self.publish(request).await,
        };

        match self.send_reply(reply).await {
            Ok(()) => WorkerEvent::PollIdle,
            Err(_) => WorkerEvent::LinkLost,
        }
    }

    async fn publish(&mut self, request: PublishRequest) -> WorkerEvent {
        let encoded = packet_id(request.message_id).and_then(|pid| {
            let publish = Packet::Publish(Publish {
                dup: false,
                qospid: QosPid::AtLeastOnce(pid),
                retain: request.retain,
                topic_name: &request.topic,
                payload: &request.payload,
            });
            encode(&publish, &mut self.tx)
        });
        let len = match encoded {
            Ok(len) => len,
            Err(e) => {
                error!("[MQTT] Dropping publish {}: {}", request.message_id, e);
                return WorkerEvent::PollIdle;
            }
        };

        if self.send(len).await.is_err() {
            return WorkerEvent::LinkLost;
        }

        debug!(
            "[MQTT] PUBLISH {} to {} ({} bytes)",
            request.message_id,
            request.topic,
            request.payload.len()
        );
        self.in_flight = Some(request.message_id);
        WorkerEvent::PollIdle
    }

    async fn teardown(&mut self) {
        self.shared.set_connected(false);
        self.transport.close().await;
        self.reader.clear();
        self.next_ping = None;

        if let Some(id) = self.in_flight.take() {
            warn!("[MQTT] Publish {} unacknowledged at teardown", id);
        }
        while let Ok(stale) = self.shared.requests.try_receive() {
            warn!("[MQTT] Discarding stale publish {}", stale.message_id);
        }
    }

    async fn wait_connack(&mut self) -> Result<u8, ConnectError> {
        let deadline = Instant::now() + self.config.timeouts.connack;
        loop {
            if let Received::ConnAck(code) = self.receive_before(deadline).await? {
                return Ok(code);
            }
        }
    }

    /// `Ok(true)` when the broker refused at least one topic
    async fn wait_suback(&mut self, id: u16) -> Result<bool, ConnectError> {
        let deadline = Instant::now() + self.config.timeouts.suback;
        loop {
            match self.receive_before(deadline).await? {
                Received::SubAck { packet_id, failed } if packet_id == id => return Ok(failed),
                _ => continue,
            }
        }
    }

    /// Next packet before `deadline`, with its PUBACK already sent
    async fn receive_before(&mut self, deadline: Instant) -> Result<Received, ConnectError> {
        let (received, reply) = with_deadline(deadline, self.read_packet())
            .await
            .map_err(|_| ConnectError::AckTimeout)??;
        self.send_reply(reply).await?;
        Ok(received)
    }

    /// Read until one complete packet has been applied.
    ///
    /// The only await is the socket read, so dropping this future never loses a
    /// packet that was already taken off the stream.
    async fn read_packet(&mut self) -> Result<(Received, Option<u16>), ConnectError> {
        let shared = self.shared;

        loop {
            let frame = self.reader.frame().map_err(|e| {
                warn!("[MQTT] Corrupt stream: {}", e);
                ConnectError::TransportFailure
            })?;

            if let Some(len) = frame {
                let outcome = interpret(self.reader.packet(len), shared);
                self.reader.consume(len);

                match outcome {
                    Ok((received, reply)) => {
                        if matches!(received, Received::PubAck(id) if self.in_flight == Some(id)) {
                            self.in_flight = None;
                        }
                        return Ok((received, reply));
                    }
                    Err(e) => {
                        warn!("[MQTT] Ignoring packet: {}", e);
                        continue;
                    }
                }
            }

            let n = self.transport.read(self.reader.spare()).await.map_err(|e| {
                warn!("[MQTT] Socket read: {:?}", e);
                ConnectError::TransportFailure
            })?;
            if n == 0 {
                warn!("[MQTT] Broker closed the connection");
                return Err(ConnectError::TransportFailure);
            }
            self.reader.filled(n);
        }
    }

    async fn send_reply(&mut self, reply: Option<u16>) -> Result<(), ConnectError> {
        let Some(id) = reply else {
            return Ok(());
        };
        let len = packet_id(id)
            .and_then(|pid| encode(&Packet::Puback(pid), &mut self.tx))
            .map_err(|_| ConnectError::TransportFailure)?;
        self.send(len).await?;
        debug!("[MQTT] PUBACK {}", id);
        Ok(())
    }

    async fn send(&mut self, len: usize) -> Result<(), ConnectError> {
        self.transport.write_all(&self.tx[..len]).await.map_err(|e| {
            warn!("[MQTT] Socket write: {:?}", e);
            ConnectError::TransportFailure
        })
    }
}

/// Publishing handle used by the station task
pub struct TelemetryClient<'a> {
    shared: &'a WorkerShared,
    ack_timeout: Duration,
    next_id: u16,
}

impl<'a> TelemetryClient<'a> {
    pub fn new(shared: &'a WorkerShared, ack_timeout: Duration) -> Self {
        Self {
            shared,
            ack_timeout,
            next_id: 1,
        }
    }

    fn next_message_id(&mut self) -> u16 {
        let id = self.next_id;
        self.next_id = if id >= 0x7FFF { 1 } else { id + 1 };
        id
    }

    /// Publish at QoS 1 with retain and wait for the broker's PUBACK
    pub async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        let shared = self.shared;
        if !shared.is_connected() || shared.disconnect_pending() {
            warn!("[MQTT] Cannot publish to {}, client not connected", topic);
            return Err(PublishError::NotConnected);
        }

        let id = self.next_message_id();
        let request = PublishRequest::new(topic, payload, id)?;

        shared.acks.reset();
        let acked = with_timeout(self.ack_timeout, async {
            shared.requests.send(request).await;
            while shared.acks.wait().await != id {}
        })
        .await;

        match acked {
            Ok(()) => {
                info!("[MQTT] Published {} bytes to {} (id {})", payload.len(), topic, id);
                Ok(())
            }
            Err(_) => {
                // Pull the request back if the worker never took it
                if let Ok(stale) = shared.requests.try_receive() {
                    debug!("[MQTT] Withdrew unsent publish {}", stale.message_id);
                }
                error!(
                    "[MQTT] {} for id {} after {} ms",
                    PublishError::AckTimeout,
                    id,
                    self.ack_timeout.as_millis()
                );
                Err(PublishError::AckTimeout)
            }
        }
    }

    /// Wait until the worker reports an open session
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let shared = self.shared;
        with_timeout(timeout, async {
            while !shared.is_connected() {
                shared.connected_signal.wait().await;
            }
        })
        .await
        .is_ok()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }
}

/// Hand every queued subscription message to `handler`, forever
pub async fn dispatch<H: SubscriptionHandler>(shared: &WorkerShared, handler: &mut H) -> ! {
    loop {
        let message = shared.next_message().await;
        debug!("[MQTT] Dispatching message on {}", message.topic);
        handler.on_message(&message);
    }
}

/// Handler that only logs what arrives
pub struct LogHandler;

impl SubscriptionHandler for LogHandler {
    fn on_message(&mut self, message: &SubscriptionMessage) {
        match message.payload_str() {
            Some(text) => info!("[MQTT] {}: {}", message.topic, text),
            None => info!("[MQTT] {}: {} bytes", message.topic, message.payload.len()),
        }
    }
}
