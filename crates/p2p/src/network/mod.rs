//! The network manager.
//!
//! Owns the connected-peer set, drives outbound connection attempts,
//! answers the peer-exchange messages, schedules pings, pruning and
//! broadcasts, and routes everything else to the controller. All work
//! is produced as unit tasks for the [`crate::net::engine`] pool, in
//! strict priority order: deliver decoded messages first, then pings,
//! then connects, then broadcasts, and only then block on the selector.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, error, info, trace, warn};

use quill_types::messages::{
    encode, MessageType, NetworkMessage, RawNetworkMessage, CODE_LENGTH,
};
use quill_types::network::Magic;
use quill_types::node_id::NODE_ID_LENGTH;
use quill_types::{NodeId, PeerAddress};

use crate::common::peer::{PeerData, PeerRepository, RepositoryFactory};
use crate::common::time::Clock;
use crate::config::Config;
use crate::controller::Controller;
use crate::handshake::{self, Action, HandshakeState};
use crate::net::engine::{Engine, Produce, Task};
use crate::net::reactor::{self, ChannelEvent, Selector, Waker};
use crate::net::{Error, Link, LocalDuration, LocalTime};
use crate::peer::{Peer, ReadOutcome, RequestError};

mod broadcast;

pub use broadcast::MessageBuilder;

/// The whole handshake must complete within this window.
pub const HANDSHAKE_TIMEOUT: LocalDuration = LocalDuration::from_secs(60);
/// An outbound dial must establish within this window.
pub const CONNECT_TIMEOUT: LocalDuration = LocalDuration::from_secs(5);
/// Default wait for a request's reply.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Idle time after which a handshaked peer is pinged.
pub const PING_INTERVAL: LocalDuration = LocalDuration::from_secs(30);
/// A ping without an echo for this long disconnects the peer.
pub const PING_TIMEOUT: LocalDuration = LocalDuration::from_secs(10);
/// Hold-off after a failed connection attempt.
pub const CONNECT_FAILURE_BACKOFF: LocalDuration = LocalDuration::from_mins(5);
/// Persisted peers not attempted within this period count as old.
pub const OLD_PEER_ATTEMPTED_PERIOD: LocalDuration = LocalDuration::from_hours(24);
/// Persisted peers not connected within this period count as old.
pub const OLD_PEER_CONNECTION_PERIOD: LocalDuration = LocalDuration::from_hours(24 * 7);
/// Only peers connected this recently are advertised to others.
pub const RECENT_CONNECTION_THRESHOLD: LocalDuration = LocalDuration::from_hours(24);
/// The controller is invited to broadcast this often.
pub const BROADCAST_INTERVAL: LocalDuration = LocalDuration::from_secs(60);
/// How often the outbound target count is re-checked.
pub const CONNECT_INTERVAL: LocalDuration = LocalDuration::from_secs(10);
/// How often stale repository records are pruned.
pub const PRUNE_INTERVAL: LocalDuration = LocalDuration::from_mins(5);

/// Maximum time the producer blocks in the selector.
const SELECT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Source tag for records seeded from the configuration.
const ADDED_BY_INIT: &str = "INIT";

/// Ability to fan a message out to the handshaked peer set. Consumed by
/// the controller during its broadcast window.
pub trait Broadcast: Send + Sync {
    /// Send `builder(peer)` to every unique handshaked peer, spaced on
    /// the broadcast executor.
    fn broadcast(&self, builder: MessageBuilder);
}

/// Check whether an IP address is locally routable.
pub fn is_local(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(addr) => {
            addr.is_private() || addr.is_loopback() || addr.is_link_local() || addr.is_unspecified()
        }
        IpAddr::V6(_) => false,
    }
}

fn address_is_local(addr: &PeerAddress) -> bool {
    addr.host()
        .parse::<IpAddr>()
        .map_or(false, |ip| is_local(&ip))
}

fn random_code() -> [u8; CODE_LENGTH] {
    let mut code = [0u8; CODE_LENGTH];
    OsRng.fill_bytes(&mut code);
    code
}

fn generate_node_id() -> NodeId {
    let mut bytes = [0u8; NODE_ID_LENGTH];
    OsRng.fill_bytes(&mut bytes);
    NodeId::from_random_bytes(bytes)
}

#[derive(Debug, Default)]
struct Timers {
    next_connect: LocalTime,
    next_broadcast: LocalTime,
    next_prune: LocalTime,
}

enum PingDue {
    No,
    Send,
    TimedOut,
}

/// Top-level coordinator of the networking core.
pub struct NetworkManager<R, C, K> {
    config: Config,
    magic: Magic,
    max_message_size: u32,
    our_id: NodeId,
    repository: R,
    controller: C,
    clock: K,
    selector: Mutex<Selector>,
    waker: Waker,
    listen_addr: SocketAddr,
    /// Established connections, each address at most once. Iteration is
    /// always over a snapshot copy.
    connected: Mutex<Vec<Arc<Peer>>>,
    /// Outbound dials awaiting their first writable event.
    connecting: Mutex<Vec<(Arc<Peer>, LocalTime)>>,
    /// Addresses that turned out to be this node.
    self_peers: Mutex<HashSet<PeerAddress>>,
    /// Serialises peer-list merges; contenders drop their batch.
    merge_lock: Mutex<()>,
    timers: Mutex<Timers>,
    broadcaster: broadcast::Broadcaster,
    engine: Mutex<Option<Engine>>,
    rng: Mutex<fastrand::Rng>,
    stopping: AtomicBool,
    weak_self: Weak<Self>,
}

impl<R, C, K> NetworkManager<R, C, K>
where
    R: RepositoryFactory,
    C: Controller,
    K: Clock,
{
    /// Bind the listener, seed the repository, and start the worker
    /// pool. The node is live when this returns.
    pub fn start(config: Config, repository: R, controller: C, clock: K) -> Result<Arc<Self>, Error> {
        let manager = Self::build(config, repository, controller, clock)?;

        let engine = Engine::start(
            Arc::downgrade(&manager) as Weak<dyn Produce>,
            manager.config.pool.clone(),
        );
        *manager
            .engine
            .lock()
            .expect("network lock is never poisoned") = Some(engine);

        Ok(manager)
    }

    /// Everything in [`NetworkManager::start`] short of the worker
    /// pool. Tests drive the produced state by hand.
    fn build(config: Config, repository: R, controller: C, clock: K) -> Result<Arc<Self>, Error> {
        let our_id = generate_node_id();
        let magic = config.network.magic();
        let max_message_size = config.max_message_size();

        let (mut selector, waker) = Selector::new()?;
        let listen_addr = selector.listen(config.listen_addr())?;
        info!(
            target: "p2p",
            "Listening on {} ({}, node id {})",
            listen_addr,
            config.network,
            our_id
        );

        install_initial_peers(&repository, &clock, &config)?;

        Ok(Arc::new_cyclic(|weak| Self {
            magic,
            max_message_size,
            our_id,
            repository,
            controller,
            clock,
            selector: Mutex::new(selector),
            waker,
            listen_addr,
            connected: Mutex::new(Vec::new()),
            connecting: Mutex::new(Vec::new()),
            self_peers: Mutex::new(HashSet::new()),
            merge_lock: Mutex::new(()),
            timers: Mutex::new(Timers::default()),
            broadcaster: broadcast::Broadcaster::start(),
            engine: Mutex::new(None),
            rng: Mutex::new(fastrand::Rng::new()),
            stopping: AtomicBool::new(false),
            weak_self: weak.clone(),
            config,
        }))
    }

    pub fn our_node_id(&self) -> NodeId {
        self.our_id
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Snapshot of the connected set.
    pub fn connected_peers(&self) -> Vec<Arc<Peer>> {
        self.connected
            .lock()
            .expect("network lock is never poisoned")
            .clone()
    }

    fn connecting_snapshot(&self) -> Vec<(Arc<Peer>, LocalTime)> {
        self.connecting
            .lock()
            .expect("network lock is never poisoned")
            .clone()
    }

    fn find_connected(&self, addr: SocketAddr) -> Option<Arc<Peer>> {
        self.connected
            .lock()
            .expect("network lock is never poisoned")
            .iter()
            .find(|p| p.resolved_addr() == addr)
            .cloned()
    }

    fn outbound_count(&self) -> usize {
        let connected = self
            .connected
            .lock()
            .expect("network lock is never poisoned")
            .iter()
            .filter(|p| p.direction().is_outbound())
            .count();
        let connecting = self
            .connecting
            .lock()
            .expect("network lock is never poisoned")
            .len();
        connected + connecting
    }

    /// Run `f` on the selector after interrupting any in-flight poll,
    /// so the wait for the lock stays bounded.
    fn with_selector<T>(&self, f: impl FnOnce(&mut Selector) -> T) -> T {
        self.waker.wake().ok();
        let mut selector = self.selector.lock().expect("network lock is never poisoned");
        f(&mut selector)
    }

    fn task(&self, f: impl FnOnce(&Arc<Self>) + Send + 'static) -> Task {
        let weak = self.weak_self.clone();
        Box::new(move || {
            if let Some(this) = weak.upgrade() {
                f(&this);
            }
        })
    }

    // Task production ////////////////////////////////////////////////////

    fn produce_message_task(&self) -> Option<Task> {
        for peer in self.connected_peers() {
            if peer.has_pending_messages() && peer.begin_delivery() {
                if !peer.has_pending_messages() {
                    // Another worker drained the inbox first.
                    peer.end_delivery();
                    continue;
                }
                return Some(self.task(move |this| this.deliver_next(&peer)));
            }
        }
        None
    }

    fn produce_ping_task(&self) -> Option<Task> {
        let now = self.clock.now()?;

        // Outbound dials that never established.
        for (peer, since) in self.connecting_snapshot() {
            if now - since >= CONNECT_TIMEOUT {
                return Some(self.task(move |this| {
                    debug!(target: "p2p", "{}: Connection attempt timed out", peer.address());
                    this.abort_connecting(&peer);
                }));
            }
        }

        for peer in self.connected_peers() {
            if peer.is_disconnected() {
                continue;
            }

            if !peer.is_handshake_completed() {
                let Some(connected_at) = peer.connected_at() else {
                    continue;
                };
                if now - connected_at >= HANDSHAKE_TIMEOUT {
                    let state = peer.with_handshake(|hs| hs.state);
                    return Some(self.task(move |this| {
                        this.disconnect(&peer, &format!("handshake timeout at {state}"));
                    }));
                }
                continue;
            }

            let due = peer.with_ping(|ping| {
                if let Some((_, sent)) = ping.inflight {
                    if now - sent >= PING_TIMEOUT {
                        return PingDue::TimedOut;
                    }
                    PingDue::No
                } else if ping.last_activity.map_or(true, |last| now - last >= PING_INTERVAL) {
                    PingDue::Send
                } else {
                    PingDue::No
                }
            });
            match due {
                PingDue::TimedOut => {
                    return Some(self.task(move |this| this.disconnect(&peer, "ping timeout")))
                }
                PingDue::Send if peer.begin_ping_task() => {
                    return Some(self.task(move |this| this.ping_peer(&peer)))
                }
                _ => {}
            }
        }
        None
    }

    fn produce_connect_task(&self) -> Option<Task> {
        let now = self.clock.now()?;
        let mut timers = self.timers.lock().expect("network lock is never poisoned");

        if now >= timers.next_prune {
            timers.next_prune = now + PRUNE_INTERVAL;
            return Some(self.task(|this| this.prune_peers()));
        }

        if now >= timers.next_connect {
            timers.next_connect = now + CONNECT_INTERVAL;
            if self.outbound_count() < self.config.min_outbound_peers {
                return Some(self.task(|this| this.connect_next()));
            }
        }
        None
    }

    fn produce_broadcast_task(&self) -> Option<Task> {
        let now = self.clock.now()?;
        let mut timers = self.timers.lock().expect("network lock is never poisoned");

        if now >= timers.next_broadcast {
            timers.next_broadcast = now + BROADCAST_INTERVAL;
            return Some(self.task(|this| this.controller.do_network_broadcast(&**this)));
        }
        None
    }

    fn produce_channel_task(&self, can_block: bool) -> Option<Task> {
        let mut selector = self.selector.lock().expect("network lock is never poisoned");

        if let Some(event) = selector.next_event() {
            drop(selector);
            return Some(self.channel_task(event));
        }

        let timeout = if can_block {
            SELECT_TIMEOUT
        } else {
            Duration::ZERO
        };
        if let Err(e) = selector.poll(timeout) {
            error!(target: "net", "Selector failure: {}", e);
            return None;
        }

        let event = selector.next_event()?;
        drop(selector);
        Some(self.channel_task(event))
    }

    fn channel_task(&self, event: ChannelEvent) -> Task {
        match event {
            ChannelEvent::Acceptable => self.task(|this| this.accept_connections()),
            ChannelEvent::Readable(addr) => self.task(move |this| this.peer_readable(addr)),
            ChannelEvent::Writable(addr) => self.task(move |this| this.peer_writable(addr)),
        }
    }

    // Channel tasks //////////////////////////////////////////////////////

    fn accept_connections(&self) {
        loop {
            let accepted = self
                .selector
                .lock()
                .expect("network lock is never poisoned")
                .accept();

            match accepted {
                Ok(Some((stream, addr))) => self.accept_one(stream, addr),
                Ok(None) => break,
                Err(e) => {
                    error!(target: "net", "Accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn accept_one(&self, stream: std::net::TcpStream, addr: SocketAddr) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }

        let total = self.connected_peers().len() + self.connecting_snapshot().len();
        if total >= self.config.max_peers {
            debug!(target: "p2p", "{}: Connection limit reached, closing new accept", addr);
            return; // Dropping the stream closes it.
        }
        if let Err(e) = stream.set_nonblocking(true) {
            error!(target: "net", "{}: Failed to make socket non-blocking: {}", addr, e);
            return;
        }

        trace!(target: "p2p", "{}: Accepting peer connection", addr);

        let address = PeerAddress::from(addr);
        let now = self.clock.now();
        let data = PeerData::new(address.clone(), now.unwrap_or_default(), "inbound");
        let peer = Arc::new(Peer::new(
            address,
            addr,
            stream,
            Link::Inbound,
            data,
            self.magic,
            self.max_message_size,
        ));
        peer.mark_connected(now);

        {
            let mut connected = self.connected.lock().expect("network lock is never poisoned");
            if connected.iter().any(|p| p.address() == peer.address()) {
                drop(connected);
                peer.close(RequestError::Disconnected);
                return;
            }
            connected.push(peer.clone());
        }
        self.with_selector(|s| s.register_peer(addr, peer.socket().raw()));

        // Inbound waits for the remote to open the handshake.
        peer.with_handshake(|hs| handshake::initiate(hs, Link::Inbound));
    }

    fn peer_readable(&self, addr: SocketAddr) {
        let Some(peer) = self.find_connected(addr) else {
            return;
        };

        match peer.fill_inbox() {
            Ok(ReadOutcome::Progress(_)) => {
                if !peer.is_disconnected() {
                    self.with_selector(|s| s.arm_read(addr));
                }
            }
            Ok(ReadOutcome::Eof) => {
                self.disconnect(&peer, "connection reset by peer");
            }
            Err(e) => {
                debug!(target: "p2p", "{}: Read failed: {}", peer.address(), e);
                self.disconnect(&peer, &e.to_string());
            }
        }
    }

    fn peer_writable(&self, addr: SocketAddr) {
        // A connecting socket turning writable means the dial resolved,
        // one way or the other.
        let dialing = {
            let mut connecting = self.connecting.lock().expect("network lock is never poisoned");
            connecting
                .iter()
                .position(|(p, _)| p.resolved_addr() == addr)
                .map(|pos| connecting.remove(pos).0)
        };

        if let Some(peer) = dialing {
            match peer.socket().raw().take_error() {
                Ok(None) => {}
                Ok(Some(e)) => return self.dial_failed(&peer, e),
                Err(e) => return self.dial_failed(&peer, e),
            }

            debug!(target: "p2p", "{}: Connected ({})", peer.address(), peer.direction());
            peer.mark_connected(self.clock.now());

            {
                let mut connected =
                    self.connected.lock().expect("network lock is never poisoned");
                if connected.iter().any(|p| p.address() == peer.address()) {
                    drop(connected);
                    peer.close(RequestError::Disconnected);
                    self.with_selector(|s| s.unregister_peer(addr));
                    return;
                }
                connected.push(peer.clone());
            }
            self.with_selector(|s| s.arm_read(addr));

            // The outbound side drives the handshake.
            let actions = peer.with_handshake(|hs| handshake::initiate(hs, Link::Outbound));
            for action in actions {
                self.perform_handshake_action(&peer, action);
            }
            return;
        }

        let Some(peer) = self.find_connected(addr) else {
            return;
        };
        match peer.socket().flush() {
            Ok(true) => {}
            Ok(false) => self.with_selector(|s| s.arm_write(addr)),
            Err(e) => {
                debug!(target: "p2p", "{}: Write failed: {}", peer.address(), e);
                self.disconnect(&peer, "write failure");
            }
        }
    }

    fn dial_failed(&self, peer: &Arc<Peer>, err: std::io::Error) {
        debug!(target: "p2p", "{}: Connection failed: {}", peer.address(), err);
        self.with_selector(|s| s.unregister_peer(peer.resolved_addr()));
        peer.close(RequestError::Disconnected);
    }

    fn abort_connecting(&self, peer: &Arc<Peer>) {
        {
            let mut connecting = self.connecting.lock().expect("network lock is never poisoned");
            let Some(pos) = connecting.iter().position(|(p, _)| Arc::ptr_eq(p, peer)) else {
                return; // Already resolved by a writable event.
            };
            connecting.remove(pos);
        }
        self.with_selector(|s| s.unregister_peer(peer.resolved_addr()));
        peer.close(RequestError::Disconnected);
    }

    // Message delivery ///////////////////////////////////////////////////

    fn deliver_next(&self, peer: &Arc<Peer>) {
        if let Some(msg) = peer.pop_message() {
            peer.record_activity(self.clock.now());
            self.dispatch(peer, msg);
        }
        peer.end_delivery();
    }

    fn dispatch(&self, peer: &Arc<Peer>, msg: RawNetworkMessage) {
        if peer.is_disconnected() {
            return;
        }

        if msg.id != 0 {
            // An echo of our outstanding ping?
            let now = self.clock.now();
            let pong = peer.with_ping(|ping| match ping.inflight {
                Some((id, sent)) if id == msg.id && msg.kind() == MessageType::Ping => {
                    ping.inflight = None;
                    if let Some(now) = now {
                        ping.rtt = Some(now - sent);
                    }
                    true
                }
                _ => false,
            });
            if pong {
                trace!(target: "p2p", "{}: Ping answered (rtt {:?})", peer.address(), peer.with_ping(|p| p.rtt));
                return;
            }
            if peer.complete_waiter(&msg) {
                return;
            }
        }

        if !peer.is_handshake_completed() {
            self.on_handshake_message(peer, msg);
        } else {
            self.on_message(peer, msg);
        }
    }

    // Handshake //////////////////////////////////////////////////////////

    fn on_handshake_message(&self, peer: &Arc<Peer>, msg: RawNetworkMessage) {
        let duplicate_inbound = match (&msg.payload, peer.direction()) {
            (NetworkMessage::PeerId(id), Link::Outbound) => self.inbound_claims(id, peer),
            _ => false,
        };

        let result = peer.with_handshake(|hs| {
            handshake::transition(
                hs,
                &msg.payload,
                &handshake::Context {
                    our_id: &self.our_id,
                    direction: peer.direction(),
                    duplicate_inbound,
                },
            )
        });

        match result {
            Ok(actions) => {
                for action in actions {
                    self.perform_handshake_action(peer, action);
                }
            }
            Err(err) => {
                debug!(target: "p2p", "{}: Handshake failed: {}", peer.address(), err);
                self.disconnect(peer, &err.to_string());
            }
        }
    }

    fn perform_handshake_action(&self, peer: &Arc<Peer>, action: Action) {
        match action {
            Action::Send(payload) => {
                self.send(peer, RawNetworkMessage::unsolicited(payload));
            }
            Action::Completed => self.on_handshake_completed(peer),
            Action::SelfConnect => {
                info!(target: "p2p", "{}: Detected connection to ourselves", peer.address());
                self.self_peers
                    .lock()
                    .expect("network lock is never poisoned")
                    .insert(peer.address().clone());
                self.disconnect(peer, "self-connect");
            }
            Action::BeginVerify { claimed } => {
                let send = random_code();
                let expect = random_code();
                peer.with_handshake(|hs| {
                    hs.verification_sent = Some(send);
                    hs.verification_expected = Some(expect);
                });
                debug!(
                    target: "p2p",
                    "{}: Node id {} is already claimed by an inbound peer, verifying",
                    peer.address(),
                    claimed
                );
                self.send(
                    peer,
                    RawNetworkMessage::unsolicited(NetworkMessage::VerificationCodes {
                        send,
                        expect,
                    }),
                );
            }
            Action::Prove { claimed, code } => {
                let outbound = self.connected_peers().into_iter().find(|p| {
                    p.direction().is_outbound()
                        && !Arc::ptr_eq(p, peer)
                        && p.remote_node_id() == Some(claimed)
                });
                match outbound {
                    Some(channel) => {
                        debug!(
                            target: "p2p",
                            "{}: Proving our identity over {}",
                            peer.address(),
                            channel.address()
                        );
                        self.send(
                            &channel,
                            RawNetworkMessage::unsolicited(NetworkMessage::PeerVerify(code)),
                        );
                    }
                    None => {
                        debug!(
                            target: "p2p",
                            "{}: Challenged for id {} but no outbound channel carries it",
                            peer.address(),
                            claimed
                        );
                        self.disconnect(peer, "no channel to prove identity over");
                    }
                }
            }
        }
    }

    fn inbound_claims(&self, id: &NodeId, excluding: &Arc<Peer>) -> bool {
        self.connected_peers().iter().any(|p| {
            !Arc::ptr_eq(p, excluding)
                && p.direction().is_inbound()
                && p.remote_node_id() == Some(*id)
        })
    }

    fn on_handshake_completed(&self, peer: &Arc<Peer>) {
        let now = self.clock.now();
        debug!(
            target: "p2p",
            "{}: Handshake completed ({}, v{}, id {})",
            peer.address(),
            peer.direction(),
            peer.version(),
            peer.remote_node_id().expect("completed handshake recorded an id")
        );
        peer.record_activity(now);

        // Outbound addresses are worth keeping; inbound remotes dial
        // from ephemeral ports we can't reconnect to.
        if peer.direction().is_outbound() {
            if let Some(now) = now {
                let data = peer.update_peer_data(|d| {
                    d.last_connected = Some(now);
                });
                let mut repo = self.repository.repository();
                let saved = repo.save(&data).and_then(|_| repo.save_changes());
                if let Err(e) = saved {
                    // The record can be re-learned from peer exchange.
                    warn!(target: "p2p", "{}: Failed to persist peer record: {}", peer.address(), e);
                }
            }
        }

        self.controller.on_peer_handshake_completed(peer);

        // Announce our tip and ask for their peer list.
        let tip = self.controller.get_chain_tip();
        let height = if peer.version() >= 2 {
            NetworkMessage::HeightV2(tip)
        } else {
            NetworkMessage::Height(tip.height)
        };
        self.send(peer, RawNetworkMessage::unsolicited(height));
        self.send(peer, RawNetworkMessage::unsolicited(NetworkMessage::GetPeers));
    }

    /// PEER_VERIFY on a channel that is past (or outside) its own
    /// handshake: the proof leg of a doppelganger challenge we issued.
    fn on_peer_verify(&self, from: &Arc<Peer>, code: [u8; CODE_LENGTH]) {
        let challenged = self.connected_peers().into_iter().find(|p| {
            !Arc::ptr_eq(p, from)
                && p.with_handshake(|hs| {
                    hs.state == HandshakeState::PeerVerify && hs.verification_sent == Some(code)
                })
        });

        match challenged {
            Some(channel) => {
                let expect = channel.with_handshake(|hs| {
                    if let Some(id) = hs.pending_id.take() {
                        hs.remote_id = Some(id);
                    }
                    hs.state = HandshakeState::Completed;
                    hs.verification_expected.take()
                });
                debug!(
                    target: "p2p",
                    "{}: Identity verified via {}",
                    channel.address(),
                    from.address()
                );
                if let Some(expect) = expect {
                    self.send(
                        &channel,
                        RawNetworkMessage::unsolicited(NetworkMessage::PeerVerify(expect)),
                    );
                }
                self.on_handshake_completed(&channel);
            }
            None => {
                debug!(target: "p2p", "{}: Unmatched verification code", from.address());
                let claimed = from.remote_node_id();
                self.disconnect(from, "verification code mismatch");
                if let Some(claimed) = claimed {
                    for peer in self.connected_peers() {
                        let ambiguous = peer.with_handshake(|hs| {
                            hs.state == HandshakeState::PeerVerify
                                && hs.pending_id == Some(claimed)
                        });
                        if ambiguous {
                            self.disconnect(&peer, "verification code mismatch");
                        }
                    }
                }
            }
        }
    }

    // Post-handshake routing /////////////////////////////////////////////

    fn on_message(&self, peer: &Arc<Peer>, msg: RawNetworkMessage) {
        match &msg.payload {
            NetworkMessage::Ping => {
                self.send(peer, RawNetworkMessage::reply_to(msg.id, NetworkMessage::Ping));
            }
            NetworkMessage::GetPeers => {
                let reply = self.build_peers_reply(peer);
                self.send(peer, RawNetworkMessage::reply_to(msg.id, reply));
            }
            NetworkMessage::Peers(addrs) => {
                let port = self.config.network.default_port();
                let addrs = addrs
                    .iter()
                    .map(|ip| PeerAddress::from(SocketAddr::new(IpAddr::V4(*ip), port)))
                    .collect();
                self.merge_peers(peer, addrs);
            }
            NetworkMessage::PeersV2(addrs) => {
                self.merge_peers(peer, addrs.clone());
            }
            NetworkMessage::PeerVerify(code) => {
                self.on_peer_verify(peer, *code);
            }
            NetworkMessage::Version(_)
            | NetworkMessage::PeerId(_)
            | NetworkMessage::Proof(_)
            | NetworkMessage::VerificationCodes { .. } => {
                self.disconnect(peer, "handshake message on a handshaked connection");
            }
            _ => self.controller.on_network_message(peer, msg),
        }
    }

    /// Advertise recently connected peers, respecting the requester's
    /// protocol version and locality.
    fn build_peers_reply(&self, requester: &Arc<Peer>) -> NetworkMessage {
        let mut addrs: Vec<PeerAddress> = Vec::new();

        if let Some(now) = self.clock.now() {
            if let Some(repo) = self.repository.try_repository() {
                match repo.get_all_peers() {
                    Ok(known) => {
                        for peer in known {
                            let recent = peer
                                .last_connected
                                .map_or(false, |t| now - t < RECENT_CONNECTION_THRESHOLD);
                            if recent {
                                addrs.push(peer.address);
                            }
                        }
                    }
                    Err(e) => warn!(target: "p2p", "Failed to read peers for reply: {}", e),
                }
            }
        }

        // Local addresses are only of use to local peers.
        let requester_is_local = is_local(&requester.resolved_addr().ip());
        if !requester_is_local {
            addrs.retain(|a| !address_is_local(a));
        }

        if requester.version() >= 2 {
            NetworkMessage::PeersV2(addrs)
        } else {
            // v1 frames carry bare IPv4 addresses only.
            NetworkMessage::Peers(
                addrs
                    .iter()
                    .filter_map(|a| a.host().parse().ok())
                    .collect(),
            )
        }
    }

    // Sending ////////////////////////////////////////////////////////////

    /// Serialise and enqueue; any failure closes the connection.
    pub fn send(&self, peer: &Arc<Peer>, msg: RawNetworkMessage) -> bool {
        if peer.is_disconnected() {
            return false;
        }

        let frame = match encode(self.magic, &msg) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "p2p", "{}: Failed to encode {:?}: {}", peer.address(), msg.kind(), e);
                self.disconnect(peer, "encode failure");
                return false;
            }
        };
        trace!(target: "p2p", "{}: Sending {:?} (id {})", peer.address(), msg.kind(), msg.id);

        match peer.enqueue(&frame) {
            Ok(true) => true,
            Ok(false) => {
                self.with_selector(|s| s.arm_write(peer.resolved_addr()));
                true
            }
            Err(e) => {
                debug!(target: "p2p", "{}: Write failed: {}", peer.address(), e);
                self.disconnect(peer, "write failure");
                false
            }
        }
    }

    /// Send with a fresh id and wait for the correlated reply.
    pub fn request(
        &self,
        peer: &Arc<Peer>,
        payload: NetworkMessage,
        timeout: Duration,
    ) -> Result<RawNetworkMessage, RequestError> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(RequestError::Shutdown);
        }
        let id = peer.allocate_id();
        let handle = peer.register_waiter(id);
        if !self.send(peer, RawNetworkMessage::new(id, payload)) {
            return Err(RequestError::Disconnected);
        }
        handle.wait(timeout)
    }

    fn ping_peer(&self, peer: &Arc<Peer>) {
        let now = self.clock.now();
        let id = peer.allocate_id();
        let armed = peer.with_ping(|ping| {
            if ping.inflight.is_none() {
                if let Some(now) = now {
                    ping.inflight = Some((id, now));
                    return true;
                }
            }
            false
        });
        if armed {
            self.send(peer, RawNetworkMessage::new(id, NetworkMessage::Ping));
        }
        peer.end_ping_task();
    }

    // Disconnection //////////////////////////////////////////////////////

    /// Idempotent: closes the socket, fails waiters, removes the peer
    /// from the connected set and tells the controller.
    pub fn disconnect(&self, peer: &Arc<Peer>, reason: &str) {
        let failure = if self.stopping.load(Ordering::SeqCst) {
            RequestError::Shutdown
        } else {
            RequestError::Disconnected
        };
        if !peer.close(failure) {
            return;
        }
        debug!(target: "p2p", "{}: Disconnecting: {}", peer.address(), reason);

        self.with_selector(|s| s.unregister_peer(peer.resolved_addr()));
        self.connected
            .lock()
            .expect("network lock is never poisoned")
            .retain(|p| !Arc::ptr_eq(p, peer));
        self.connecting
            .lock()
            .expect("network lock is never poisoned")
            .retain(|(p, _)| !Arc::ptr_eq(p, peer));

        self.controller.on_peer_disconnect(peer);
    }

    // Outbound selection /////////////////////////////////////////////////

    /// Pick a connectable repository peer uniformly at random, mark it
    /// attempted, and dial it.
    fn connect_next(&self) {
        let Some(now) = self.clock.now() else {
            return;
        };

        let candidate = {
            let mut repo = self.repository.repository();
            let Some(mut candidate) = self.get_connectable_peer(&*repo, now) else {
                return;
            };
            // Record the attempt before touching the socket, so a crash
            // mid-dial still backs the address off.
            candidate.last_attempted = Some(now);
            let saved = repo.save(&candidate).and_then(|_| repo.save_changes());
            if let Err(e) = saved {
                warn!(target: "p2p", "{}: Failed to record connection attempt: {}", candidate.address, e);
            }
            candidate
        };

        let resolved = match candidate.address.resolve() {
            Ok(addrs) => match addrs.into_iter().next() {
                Some(addr) => addr,
                None => return,
            },
            Err(e) => {
                debug!(target: "p2p", "{}: Failed to resolve: {}", candidate.address, e);
                return;
            }
        };

        debug!(target: "p2p", "{}: Connecting", candidate.address);
        match reactor::dial(&resolved) {
            Ok(stream) => {
                let peer = Arc::new(Peer::new(
                    candidate.address.clone(),
                    resolved,
                    stream,
                    Link::Outbound,
                    candidate,
                    self.magic,
                    self.max_message_size,
                ));
                self.with_selector(|s| s.register_dialing(resolved, peer.socket().raw()));
                self.connecting
                    .lock()
                    .expect("network lock is never poisoned")
                    .push((peer, now));
            }
            Err(e) => {
                debug!(target: "p2p", "{}: Dial error: {}", candidate.address, e);
            }
        }
    }

    /// The outbound candidate filter: skip recent failures, self peers,
    /// and anything already connected by unresolved or resolved match
    /// (unresolvable addresses are skipped the same way).
    fn get_connectable_peer(
        &self,
        repo: &dyn PeerRepository,
        now: LocalTime,
    ) -> Option<PeerData> {
        let known = match repo.get_all_peers() {
            Ok(known) => known,
            Err(e) => {
                warn!(target: "p2p", "Failed to read peers: {}", e);
                return None;
            }
        };

        let self_peers = self
            .self_peers
            .lock()
            .expect("network lock is never poisoned")
            .clone();

        let mut connected_addrs: HashSet<PeerAddress> = HashSet::new();
        let mut connected_socks: HashSet<SocketAddr> = HashSet::new();
        for peer in self.connected_peers() {
            connected_addrs.insert(peer.address().clone());
            connected_socks.insert(peer.resolved_addr());
        }
        for (peer, _) in self.connecting_snapshot() {
            connected_addrs.insert(peer.address().clone());
            connected_socks.insert(peer.resolved_addr());
        }

        let mut candidates = Vec::new();
        for peer in known {
            if let Some(attempted) = peer.last_attempted {
                let failed = peer.last_connected.map_or(true, |c| c < attempted);
                if failed && now - attempted < CONNECT_FAILURE_BACKOFF {
                    continue;
                }
            }
            if self_peers.contains(&peer.address) {
                continue;
            }
            if connected_addrs.contains(&peer.address) {
                continue;
            }
            match peer.address.resolve() {
                Ok(addrs) => {
                    if addrs.iter().any(|a| connected_socks.contains(a)) {
                        continue;
                    }
                }
                // Can't resolve, can't dial: treat like a connected
                // address and skip it.
                Err(_) => continue,
            }
            candidates.push(peer);
        }

        if candidates.is_empty() {
            return None;
        }
        let pick = self
            .rng
            .lock()
            .expect("network lock is never poisoned")
            .usize(..candidates.len());
        Some(candidates.swap_remove(pick))
    }

    // Peer-list maintenance //////////////////////////////////////////////

    /// Fold peer-exchange addresses into the repository. Runs under a
    /// try-lock: a concurrent merge wins and this batch is dropped.
    fn merge_peers(&self, from: &Arc<Peer>, addrs: Vec<PeerAddress>) {
        let Some(now) = self.clock.now() else {
            return;
        };
        let Ok(_guard) = self.merge_lock.try_lock() else {
            debug!(target: "p2p", "Peer merge already in progress, dropping batch");
            return;
        };
        let Some(mut repo) = self.repository.try_repository() else {
            debug!(target: "p2p", "Repository busy, dropping peer batch");
            return;
        };

        let known: HashSet<PeerAddress> = match repo.get_all_peers() {
            Ok(known) => known.into_iter().map(|p| p.address).collect(),
            Err(e) => {
                warn!(target: "p2p", "Failed to read peers for merge: {}", e);
                return;
            }
        };
        let self_peers = self
            .self_peers
            .lock()
            .expect("network lock is never poisoned")
            .clone();
        let added_by = from.address().to_string();

        let mut batch: HashSet<PeerAddress> = HashSet::new();
        let mut added = 0u32;
        for addr in addrs {
            if known.contains(&addr) || self_peers.contains(&addr) || !batch.insert(addr.clone()) {
                continue;
            }
            if let Err(e) = repo.save(&PeerData::new(addr, now, added_by.clone())) {
                warn!(target: "p2p", "Failed to merge peers: {}", e);
                repo.discard_changes();
                return;
            }
            added += 1;
        }

        if added > 0 {
            match repo.save_changes() {
                Ok(()) => {
                    debug!(target: "p2p", "Merged {} new peer(s) from {}", added, from.address())
                }
                Err(e) => warn!(target: "p2p", "Failed to merge peers: {}", e),
            }
        }
    }

    /// Disconnect peers stuck in handshake and delete stale repository
    /// records. Opportunistic: skips when the repository is busy.
    fn prune_peers(&self) {
        let Some(now) = self.clock.now() else {
            return;
        };

        for peer in self.connected_peers() {
            if peer.is_handshake_completed() {
                continue;
            }
            let Some(connected_at) = peer.connected_at() else {
                continue;
            };
            if now - connected_at >= HANDSHAKE_TIMEOUT {
                let state = peer.with_handshake(|hs| hs.state);
                self.disconnect(&peer, &format!("handshake timeout at {state}"));
            }
        }

        let Some(mut repo) = self.repository.try_repository() else {
            debug!(target: "p2p", "Repository busy, skipping prune");
            return;
        };
        let known = match repo.get_all_peers() {
            Ok(known) => known,
            Err(e) => {
                warn!(target: "p2p", "Failed to read peers for prune: {}", e);
                return;
            }
        };

        let connected_addrs: HashSet<PeerAddress> = self
            .connected_peers()
            .iter()
            .map(|p| p.address().clone())
            .collect();

        let mut deleted = 0u32;
        for peer in known {
            if connected_addrs.contains(&peer.address) {
                continue;
            }
            let attempted_old = peer
                .last_attempted
                .map_or(true, |t| now - t >= OLD_PEER_ATTEMPTED_PERIOD);
            let connection_old = peer
                .last_connected
                .map_or(true, |t| now - t >= OLD_PEER_CONNECTION_PERIOD);
            if attempted_old || connection_old {
                match repo.delete(&peer.address) {
                    Ok(n) => deleted += n,
                    Err(e) => {
                        warn!(target: "p2p", "Failed to prune peers: {}", e);
                        repo.discard_changes();
                        return;
                    }
                }
            }
        }

        if deleted > 0 {
            match repo.save_changes() {
                Ok(()) => debug!(target: "p2p", "Pruned {} old peer(s)", deleted),
                Err(e) => warn!(target: "p2p", "Failed to prune peers: {}", e),
            }
        }

        let connected = self.connected_peers();
        debug!(
            target: "p2p",
            "connections = {}/{} (outbound {}), self peers = {}",
            connected.len(),
            self.config.max_peers,
            connected.iter().filter(|p| p.direction().is_outbound()).count(),
            self.self_peers.lock().expect("network lock is never poisoned").len(),
        );
    }

    /// Handshaked peers with inbound duplicates of an outbound node id
    /// removed.
    fn unique_handshaked_peers(&self) -> Vec<Arc<Peer>> {
        let snapshot = self.connected_peers();
        let mut seen: HashSet<[u8; NODE_ID_LENGTH]> = HashSet::new();
        let mut unique = Vec::new();

        let outbound = snapshot.iter().filter(|p| p.direction().is_outbound());
        let inbound = snapshot.iter().filter(|p| p.direction().is_inbound());
        for peer in outbound.chain(inbound) {
            if !peer.is_handshake_completed() || peer.is_disconnected() {
                continue;
            }
            let Some(id) = peer.remote_node_id() else {
                continue;
            };
            if seen.insert(*id.as_bytes()) {
                unique.push(peer.clone());
            }
        }
        unique
    }

    // Shutdown ///////////////////////////////////////////////////////////

    /// Stop accepting, stop the pool and the broadcaster, and close
    /// every connection. No subsystem socket remains open afterwards.
    pub fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: "p2p", "Shutting down networking");

        self.with_selector(|s| s.close_listener());

        let engine = self
            .engine
            .lock()
            .expect("network lock is never poisoned")
            .take();
        if let Some(engine) = engine {
            self.waker.wake().ok();
            engine.shutdown(Duration::from_secs(5));
        }
        self.broadcaster.shutdown(Duration::from_secs(1));

        for (peer, _) in self.connecting_snapshot() {
            self.disconnect(&peer, "shutdown");
        }
        for peer in self.connected_peers() {
            self.disconnect(&peer, "shutdown");
        }
    }
}

fn install_initial_peers<R: RepositoryFactory, K: Clock>(
    repository: &R,
    clock: &K,
    config: &Config,
) -> Result<(), Error> {
    let mut repo = repository.repository();
    let known = repo
        .get_all_peers()
        .map_err(|e| Error::Persistence(e.to_string()))?;
    if !known.is_empty() {
        return Ok(());
    }

    let first_seen = clock.now().unwrap_or_default();
    let mut added = 0;
    for entry in &config.initial_peers {
        match PeerAddress::parse(entry, config.network.default_port()) {
            Ok(address) => {
                repo.save(&PeerData::new(address, first_seen, ADDED_BY_INIT))
                    .map_err(|e| Error::Persistence(e.to_string()))?;
                added += 1;
            }
            Err(e) => warn!(target: "p2p", "Skipping invalid initial peer `{}`: {}", entry, e),
        }
    }
    if added > 0 {
        repo.save_changes()
            .map_err(|e| Error::Persistence(e.to_string()))?;
        debug!(target: "p2p", "Installed {} initial peer(s)", added);
    }
    Ok(())
}

impl<R, C, K> Produce for NetworkManager<R, C, K>
where
    R: RepositoryFactory,
    C: Controller,
    K: Clock,
{
    fn produce(&self, can_block: bool) -> Option<Task> {
        if self.stopping.load(Ordering::SeqCst) {
            return None;
        }
        self.produce_message_task()
            .or_else(|| self.produce_ping_task())
            .or_else(|| self.produce_connect_task())
            .or_else(|| self.produce_broadcast_task())
            .or_else(|| self.produce_channel_task(can_block))
    }
}

impl<R, C, K> Broadcast for NetworkManager<R, C, K>
where
    R: RepositoryFactory,
    C: Controller,
    K: Clock,
{
    fn broadcast(&self, builder: MessageBuilder) {
        let peers = self.unique_handshaked_peers();
        if peers.is_empty() {
            return;
        }

        let weak = self.weak_self.clone();
        let job = broadcast::Job {
            peers,
            builder,
            spacing: self.config.broadcast_spacing,
            send: Box::new(move |peer, msg| {
                if let Some(this) = weak.upgrade() {
                    this.send(peer, msg);
                }
            }),
        };
        if !self.broadcaster.submit(job) {
            debug!(target: "p2p", "Broadcast executor busy, dropping broadcast");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener, TcpStream};

    use quill_types::{BlockSummary, Network};

    use crate::common::peer::MemoryRepository;
    use crate::common::time::ManualClock;
    use crate::controller::MockController;

    const T0: LocalTime = LocalTime::from_secs(1_700_000_000);

    type TestManager = NetworkManager<MemoryRepository, MockController, ManualClock>;

    fn addr(s: &str) -> PeerAddress {
        PeerAddress::parse(s, Network::Mainnet.default_port()).unwrap()
    }

    fn relaxed_controller() -> MockController {
        let mut controller = MockController::new();
        controller.expect_on_peer_disconnect().returning(|_| ());
        controller
            .expect_on_peer_handshake_completed()
            .returning(|_| ());
        controller.expect_on_network_message().returning(|_, _| ());
        controller.expect_do_network_broadcast().returning(|_| ());
        controller.expect_get_chain_tip().returning(|| BlockSummary {
            height: 42,
            signature: vec![0; 64],
            timestamp: 0,
            minter_public_key: vec![0; 32],
        });
        controller.expect_get_online_accounts().returning(Vec::new);
        controller
    }

    fn test_manager_with(
        clock: ManualClock,
        controller: MockController,
        tweak: impl FnOnce(&mut Config),
    ) -> Arc<TestManager> {
        let mut config = Config::new(Network::Mainnet);
        config.bind_address = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.listen_port = 0;
        tweak(&mut config);
        NetworkManager::build(config, MemoryRepository::new(), controller, clock)
            .expect("manager builds on loopback")
    }

    fn test_manager(clock: ManualClock) -> Arc<TestManager> {
        test_manager_with(clock, relaxed_controller(), |_| {})
    }

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let local = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (remote, _) = listener.accept().unwrap();
        (local, remote)
    }

    /// Wire a peer into the manager's connected set over a real
    /// loopback socket, bypassing the selector.
    fn attach_peer(manager: &Arc<TestManager>, host: &str, direction: Link) -> (Arc<Peer>, TcpStream) {
        let (local, remote) = socket_pair();
        local.set_nonblocking(true).unwrap();
        let resolved = local.peer_addr().unwrap();
        let address = addr(host);
        let data = PeerData::new(address.clone(), T0, "test");
        let peer = Arc::new(Peer::new(
            address,
            resolved,
            local,
            direction,
            data,
            Network::Mainnet.magic(),
            manager.max_message_size,
        ));
        peer.mark_connected(Some(T0));
        manager
            .connected
            .lock()
            .unwrap()
            .push(peer.clone());
        (peer, remote)
    }

    fn complete_handshake(peer: &Arc<Peer>, id: NodeId, version: u32) {
        peer.with_handshake(|hs| {
            hs.state = HandshakeState::Completed;
            hs.remote_id = Some(id);
            hs.remote_version = version;
        });
    }

    #[test]
    fn self_connect_is_detected_and_never_persisted() {
        let manager = test_manager(ManualClock::new(T0));
        {
            let mut repo = manager.repository.repository();
            repo.save(&PeerData::new(addr("10.9.9.9"), T0, "test")).unwrap();
            repo.save_changes().unwrap();
        }

        let (peer, _remote) = attach_peer(&manager, "10.9.9.9", Link::Outbound);
        let actions = peer.with_handshake(|hs| handshake::initiate(hs, Link::Outbound));
        for action in actions {
            manager.perform_handshake_action(&peer, action);
        }
        manager.dispatch(&peer, RawNetworkMessage::unsolicited(NetworkMessage::Version(2)));
        manager.dispatch(
            &peer,
            RawNetworkMessage::unsolicited(NetworkMessage::PeerId(manager.our_id)),
        );

        assert!(peer.is_disconnected());
        assert!(manager.connected_peers().is_empty());
        assert!(manager
            .self_peers
            .lock()
            .unwrap()
            .contains(&addr("10.9.9.9")));

        // The record never carries a connection, and the address is
        // never offered as an outbound candidate again.
        let repo = manager.repository.repository();
        let record = &repo.get_all_peers().unwrap()[0];
        assert_eq!(record.last_connected, None);
        assert!(manager.get_connectable_peer(&*repo, T0).is_none());
    }

    #[test]
    fn doppelganger_is_resolved_by_verification_codes() {
        let manager = test_manager(ManualClock::new(T0));
        let k = NodeId::from_random_bytes([0x5A; 128]);

        // X: a handshaked inbound peer claiming id K.
        let (x, _x_remote) = attach_peer(&manager, "10.1.1.1", Link::Inbound);
        complete_handshake(&x, k, 2);

        // Y: an outbound connection whose remote also claims K.
        let (y, _y_remote) = attach_peer(&manager, "10.2.2.2", Link::Outbound);
        let actions = y.with_handshake(|hs| handshake::initiate(hs, Link::Outbound));
        for action in actions {
            manager.perform_handshake_action(&y, action);
        }
        manager.dispatch(&y, RawNetworkMessage::unsolicited(NetworkMessage::Version(2)));
        manager.dispatch(&y, RawNetworkMessage::unsolicited(NetworkMessage::PeerId(k)));

        assert_eq!(y.with_handshake(|hs| hs.state), HandshakeState::PeerVerify);
        assert!(!y.is_handshake_completed());
        let sent = y.with_handshake(|hs| hs.verification_sent.unwrap());

        // The true owner of K echoes the code over the inbound channel.
        manager.dispatch(
            &x,
            RawNetworkMessage::unsolicited(NetworkMessage::PeerVerify(sent)),
        );

        assert!(y.is_handshake_completed());
        assert_eq!(y.remote_node_id(), Some(k));
        assert!(!x.is_disconnected());
    }

    #[test]
    fn doppelganger_mismatch_disconnects_both_channels() {
        let manager = test_manager(ManualClock::new(T0));
        let k = NodeId::from_random_bytes([0x5A; 128]);

        let (x, _x_remote) = attach_peer(&manager, "10.1.1.1", Link::Inbound);
        complete_handshake(&x, k, 2);

        let (y, _y_remote) = attach_peer(&manager, "10.2.2.2", Link::Outbound);
        let actions = y.with_handshake(|hs| handshake::initiate(hs, Link::Outbound));
        for action in actions {
            manager.perform_handshake_action(&y, action);
        }
        manager.dispatch(&y, RawNetworkMessage::unsolicited(NetworkMessage::Version(2)));
        manager.dispatch(&y, RawNetworkMessage::unsolicited(NetworkMessage::PeerId(k)));

        manager.dispatch(
            &x,
            RawNetworkMessage::unsolicited(NetworkMessage::PeerVerify([0xEE; CODE_LENGTH])),
        );

        assert!(x.is_disconnected());
        assert!(y.is_disconnected());
        assert!(manager.connected_peers().is_empty());
    }

    #[test]
    fn outbound_scheduling_attempts_distinct_fresh_peers() {
        let manager = test_manager_with(ManualClock::new(T0), relaxed_controller(), |config| {
            config.min_outbound_peers = 3;
        });

        let listeners: Vec<TcpListener> = (0..10)
            .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        {
            let mut repo = manager.repository.repository();
            for listener in &listeners {
                let address = PeerAddress::from(listener.local_addr().unwrap());
                repo.save(&PeerData::new(address, T0, "test")).unwrap();
            }
            repo.save_changes().unwrap();
        }

        for _ in 0..10 {
            if manager.outbound_count() < manager.config.min_outbound_peers {
                manager.connect_next();
            }
        }

        let connecting = manager.connecting_snapshot();
        assert_eq!(connecting.len(), 3);
        let distinct: HashSet<PeerAddress> = connecting
            .iter()
            .map(|(p, _)| p.address().clone())
            .collect();
        assert_eq!(distinct.len(), 3);

        // Attempts are recorded before the dial.
        let repo = manager.repository.repository();
        let attempted = repo
            .get_all_peers()
            .unwrap()
            .into_iter()
            .filter(|p| p.last_attempted == Some(T0))
            .count();
        assert_eq!(attempted, 3);
    }

    #[test]
    fn no_candidate_while_the_clock_is_unsynchronised() {
        let manager = test_manager(ManualClock::unsynchronised());
        {
            let mut repo = manager.repository.repository();
            repo.save(&PeerData::new(addr("10.0.0.1"), T0, "test")).unwrap();
            repo.save_changes().unwrap();
        }
        manager.connect_next();
        assert!(manager.connecting_snapshot().is_empty());
    }

    #[test]
    fn connectable_peer_respects_backoff_and_exclusions() {
        let manager = test_manager(ManualClock::new(T0));
        {
            let mut repo = manager.repository.repository();
            // Failed a minute ago: backed off.
            let mut failed = PeerData::new(addr("10.0.0.1"), T0, "test");
            failed.last_attempted = Some(T0 - LocalDuration::from_mins(1));
            repo.save(&failed).unwrap();
            // Flagged as ourselves.
            repo.save(&PeerData::new(addr("10.0.0.2"), T0, "test")).unwrap();
            // Attempted long ago and the connection succeeded.
            let mut good = PeerData::new(addr("10.0.0.3"), T0, "test");
            good.last_attempted = Some(T0 - LocalDuration::from_mins(10));
            good.last_connected = Some(T0 - LocalDuration::from_mins(10));
            repo.save(&good).unwrap();
            repo.save_changes().unwrap();
        }
        manager
            .self_peers
            .lock()
            .unwrap()
            .insert(addr("10.0.0.2"));

        let repo = manager.repository.repository();
        for _ in 0..20 {
            let candidate = manager.get_connectable_peer(&*repo, T0).unwrap();
            assert_eq!(candidate.address, addr("10.0.0.3"));
        }
    }

    #[test]
    fn prune_deletes_old_peers_and_keeps_fresh_ones() {
        let manager = test_manager(ManualClock::new(T0));
        {
            let mut repo = manager.repository.repository();
            let mut old = PeerData::new(addr("10.0.0.1"), T0 - LocalDuration::from_hours(300), "test");
            old.last_attempted = Some(T0 - LocalDuration::from_hours(48));
            old.last_connected = Some(T0 - LocalDuration::from_hours(240));
            repo.save(&old).unwrap();

            let mut fresh = PeerData::new(addr("10.0.0.2"), T0 - LocalDuration::from_hours(2), "test");
            fresh.last_attempted = Some(T0 - LocalDuration::from_hours(1));
            fresh.last_connected = Some(T0 - LocalDuration::from_hours(1));
            repo.save(&fresh).unwrap();
            repo.save_changes().unwrap();
        }

        manager.prune_peers();

        let remaining = manager.repository.repository().get_all_peers().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].address, addr("10.0.0.2"));
    }

    #[test]
    fn merge_is_idempotent_and_deduplicates_the_batch() {
        let manager = test_manager(ManualClock::new(T0));
        let (peer, _remote) = attach_peer(&manager, "10.1.1.1", Link::Inbound);

        let batch = vec![addr("10.5.5.5"), addr("10.5.5.5"), addr("10.6.6.6")];
        manager.merge_peers(&peer, batch.clone());

        let all = manager.repository.repository().get_all_peers().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|p| p.added_by == peer.address().to_string()));

        // Merging a list already fully contained changes nothing.
        manager.merge_peers(&peer, batch);
        assert_eq!(manager.repository.repository().get_all_peers().unwrap().len(), 2);
    }

    #[test]
    fn contended_merge_drops_its_batch() {
        let manager = test_manager(ManualClock::new(T0));
        let (peer, _remote) = attach_peer(&manager, "10.1.1.1", Link::Inbound);

        let busy = manager.repository.repository();
        manager.merge_peers(&peer, vec![addr("10.7.7.7")]);
        drop(busy);

        assert!(manager.repository.repository().get_all_peers().unwrap().is_empty());
    }

    #[test]
    fn peers_stuck_in_handshake_are_timed_out() {
        let clock = ManualClock::new(T0);
        let manager = test_manager(clock.clone());
        let (peer, _remote) = attach_peer(&manager, "10.1.1.1", Link::Outbound);
        peer.with_handshake(|hs| handshake::initiate(hs, Link::Outbound));

        clock.set(T0 + LocalDuration::from_secs(61));
        let task = manager.produce_ping_task().expect("a timeout task is due");
        task();

        assert!(peer.is_disconnected());
        assert!(manager.connected_peers().is_empty());
    }

    #[test]
    fn idle_peers_are_pinged_and_silent_ones_dropped() {
        let clock = ManualClock::new(T0);
        let manager = test_manager(clock.clone());
        let (peer, _remote) = attach_peer(&manager, "10.1.1.1", Link::Outbound);
        complete_handshake(&peer, NodeId::from_random_bytes([0x11; 128]), 2);
        peer.record_activity(Some(T0));

        // Nothing due while the connection is active.
        assert!(manager.produce_ping_task().is_none());

        clock.set(T0 + LocalDuration::from_secs(31));
        let task = manager.produce_ping_task().expect("a ping is due");
        task();
        let (id, _) = peer.with_ping(|p| p.inflight).expect("ping in flight");

        // The echo clears the ping and records a round-trip.
        manager.dispatch(&peer, RawNetworkMessage::reply_to(id, NetworkMessage::Ping));
        assert!(peer.with_ping(|p| p.inflight).is_none());
        assert!(peer.with_ping(|p| p.rtt).is_some());

        // A second ping that nobody answers is fatal.
        clock.set(T0 + LocalDuration::from_secs(62));
        manager.produce_ping_task().expect("a ping is due")();
        clock.set(T0 + LocalDuration::from_secs(73));
        manager.produce_ping_task().expect("a timeout task is due")();

        assert!(peer.is_disconnected());
    }

    #[test]
    fn broadcast_targets_unique_handshaked_peers() {
        let manager = test_manager(ManualClock::new(T0));
        let k = NodeId::from_random_bytes([0x5A; 128]);
        let m = NodeId::from_random_bytes([0x6B; 128]);

        let (x, _xr) = attach_peer(&manager, "10.1.1.1", Link::Inbound);
        complete_handshake(&x, k, 2);
        let (y, _yr) = attach_peer(&manager, "10.2.2.2", Link::Outbound);
        complete_handshake(&y, k, 2);
        let (z, _zr) = attach_peer(&manager, "10.3.3.3", Link::Inbound);
        complete_handshake(&z, m, 2);
        let (_w, _wr) = attach_peer(&manager, "10.4.4.4", Link::Inbound);

        let unique = manager.unique_handshaked_peers();
        assert_eq!(unique.len(), 2);
        assert!(unique.iter().any(|p| Arc::ptr_eq(p, &y)));
        assert!(unique.iter().any(|p| Arc::ptr_eq(p, &z)));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut controller = MockController::new();
        controller.expect_on_peer_disconnect().times(1).returning(|_| ());
        let manager = test_manager_with(ManualClock::new(T0), controller, |_| {});

        let (peer, _remote) = attach_peer(&manager, "10.1.1.1", Link::Inbound);
        manager.disconnect(&peer, "test");
        manager.disconnect(&peer, "test");

        assert!(peer.is_disconnected());
        assert!(manager.connected_peers().is_empty());
    }

    #[test]
    fn peers_replies_respect_version_recency_and_reach() {
        let manager = test_manager(ManualClock::new(T0));
        {
            let mut repo = manager.repository.repository();
            let mut recent = PeerData::new(addr("10.1.2.3"), T0, "test");
            recent.last_connected = Some(T0 - LocalDuration::from_hours(1));
            repo.save(&recent).unwrap();

            let mut stale = PeerData::new(addr("10.4.5.6"), T0, "test");
            stale.last_connected = Some(T0 - LocalDuration::from_hours(30));
            repo.save(&stale).unwrap();

            let mut v6 = PeerData::new(addr("[2001:db8::1]:12392"), T0, "test");
            v6.last_connected = Some(T0 - LocalDuration::from_hours(1));
            repo.save(&v6).unwrap();
            repo.save_changes().unwrap();
        }

        // The requester connects over loopback, so it counts as local.
        let (v1_peer, _r1) = attach_peer(&manager, "10.1.1.1", Link::Inbound);
        complete_handshake(&v1_peer, NodeId::from_random_bytes([0x11; 128]), 1);
        let (v2_peer, _r2) = attach_peer(&manager, "10.2.2.2", Link::Inbound);
        complete_handshake(&v2_peer, NodeId::from_random_bytes([0x22; 128]), 2);

        match manager.build_peers_reply(&v1_peer) {
            NetworkMessage::Peers(addrs) => {
                // v1 carries IPv4 only, and only the recent record.
                assert_eq!(addrs, vec!["10.1.2.3".parse::<Ipv4Addr>().unwrap()]);
            }
            other => panic!("expected a v1 PEERS reply, got {other:?}"),
        }

        match manager.build_peers_reply(&v2_peer) {
            NetworkMessage::PeersV2(addrs) => {
                let set: HashSet<PeerAddress> = addrs.into_iter().collect();
                assert_eq!(
                    set,
                    HashSet::from([addr("10.1.2.3"), addr("[2001:db8::1]:12392")])
                );
            }
            other => panic!("expected a v2 PEERS reply, got {other:?}"),
        }
    }
}
