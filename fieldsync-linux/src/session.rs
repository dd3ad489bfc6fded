//! Session loop: one task owns the core and reacts to timer ticks, transport
//! events and presentation commands in arrival order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use fieldsync_core::{
    Action, ConnectionId, Descriptor, FieldSyncCore, Identity, Namespace, RosterEntry, Settings,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::transport::{EventStream, Link, Transport, TransportError, TransportEvent};

/// Input from the presentation layer.
#[derive(Debug)]
pub enum Command {
    LocalEdit(String),
    Connect(Identity),
}

/// Shared field as the presentation should show it: the latest local or remote value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldView {
    pub value: String,
    pub acknowledging: bool,
}

/// Handle to a running session. Dropping it without `stop` leaves the loop running.
pub struct SessionHandle {
    identity: Identity,
    commands: mpsc::UnboundedSender<Command>,
    roster: watch::Receiver<Vec<RosterEntry>>,
    field: watch::Receiver<FieldView>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn local_edit(&self, value: impl Into<String>) {
        let _ = self.commands.send(Command::LocalEdit(value.into()));
    }

    pub fn connect(&self, remote: Identity) {
        let _ = self.commands.send(Command::Connect(remote));
    }

    /// Roster snapshots; updated on every roster change.
    pub fn roster(&self) -> watch::Receiver<Vec<RosterEntry>> {
        self.roster.clone()
    }

    pub fn field(&self) -> watch::Receiver<FieldView> {
        self.field.clone()
    }

    /// Stop polling, drop every connection and unregister from the transport.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

pub struct Session<T: Transport> {
    transport: Arc<T>,
    core: FieldSyncCore,
    links: HashMap<ConnectionId, Link>,
    settings: Settings,
    roster_tx: watch::Sender<Vec<RosterEntry>>,
    field_tx: watch::Sender<FieldView>,
    ack_deadline: Option<tokio::time::Instant>,
}

impl<T: Transport> Session<T> {
    /// Derive an identity under `namespace`, register it with the transport and start the loop.
    pub async fn start(
        transport: Arc<T>,
        namespace: Namespace,
        descriptor: Descriptor,
        settings: Settings,
    ) -> Result<SessionHandle, TransportError> {
        let identity = Identity::generate(&namespace);
        let events = transport.open(identity.clone()).await?;
        tracing::info!(%identity, %namespace, "registered");

        let core = FieldSyncCore::new(namespace, identity.clone(), descriptor, &settings);
        let (roster_tx, roster) = watch::channel(core.roster());
        let (field_tx, field) = watch::channel(FieldView::default());
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = oneshot::channel();

        let session = Session {
            transport,
            core,
            links: HashMap::new(),
            settings,
            roster_tx,
            field_tx,
            ack_deadline: None,
        };
        let task = tokio::spawn(session.run(events, commands_rx, shutdown_rx));
        Ok(SessionHandle {
            identity,
            commands,
            roster,
            field,
            shutdown: Some(shutdown),
            task,
        })
    }

    async fn run(
        mut self,
        mut events: EventStream,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut poll = tokio::time::interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let (listed_tx, mut listed_rx) = mpsc::unbounded_channel();
        let mut commands_open = true;

        loop {
            let actions = tokio::select! {
                _ = &mut shutdown => break,
                _ = poll.tick() => {
                    let transport = self.transport.clone();
                    let listed_tx = listed_tx.clone();
                    tokio::spawn(async move {
                        let _ = listed_tx.send(transport.list_identities().await);
                    });
                    Vec::new()
                }
                Some(listed) = listed_rx.recv() => match listed {
                    Ok(ids) => self.core.on_discovery(ids),
                    Err(e) => {
                        tracing::warn!(error = %e, "discovery poll failed");
                        Vec::new()
                    }
                },
                event = events.recv() => match event {
                    Some(event) => self.on_transport_event(event),
                    None => {
                        tracing::warn!("transport event stream ended");
                        break;
                    }
                },
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(Command::LocalEdit(value)) => {
                        let actions = self.core.broadcast_local_edit(value);
                        self.publish_field();
                        actions
                    }
                    Some(Command::Connect(remote)) => self.core.connect(remote),
                    None => {
                        commands_open = false;
                        Vec::new()
                    }
                },
                _ = sleep_until(self.ack_deadline), if self.ack_deadline.is_some() => {
                    self.ack_deadline = None;
                    self.publish_field();
                    Vec::new()
                }
            };
            self.perform(actions);
        }

        self.links.clear();
        self.transport.close();
        tracing::info!(identity = %self.core.identity(), "session stopped");
    }

    fn on_transport_event(&mut self, event: TransportEvent) -> Vec<Action> {
        match event {
            TransportEvent::Opened {
                remote,
                link,
                direction,
            } => {
                let id = link.id();
                self.links.insert(id, link);
                self.core.on_connection_opened(remote, id, direction)
            }
            TransportEvent::Message {
                connection,
                remote,
                message,
            } => {
                // Frames still in flight on a superseded or closed channel.
                if !self.links.contains_key(&connection) {
                    tracing::debug!(peer = %remote, ?connection, "ignoring message on dropped link");
                    return Vec::new();
                }
                self.core.on_message_received(&remote, message, Instant::now())
            }
            TransportEvent::Closed { connection, remote } => {
                self.links.remove(&connection);
                self.core.on_connection_closed(&remote, connection)
            }
            TransportEvent::DialFailed { remote, error } => {
                tracing::warn!(peer = %remote, error = %error, "connection attempt failed");
                self.core.on_dial_failed(&remote);
                Vec::new()
            }
            TransportEvent::Error(e) => {
                tracing::warn!(error = %e, "transport error");
                Vec::new()
            }
        }
    }

    fn perform(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Dial(remote) => self.transport.connect(remote),
                Action::Send {
                    connection,
                    message,
                } => match self.links.get(&connection) {
                    Some(link) => {
                        if let Err(e) = link.send(message) {
                            tracing::debug!(?connection, error = %e, "send on closed link");
                        }
                    }
                    None => tracing::debug!(?connection, "send on unknown link"),
                },
                Action::Close(connection) => {
                    self.links.remove(&connection);
                }
                Action::RosterChanged => {
                    self.roster_tx.send_replace(self.core.roster());
                }
                Action::FieldChanged(_) => self.publish_field(),
                Action::Acknowledge { duration } => {
                    self.ack_deadline = Some(tokio::time::Instant::now() + duration);
                    self.publish_field();
                }
            }
        }
    }

    fn publish_field(&self) {
        let sync = self.core.sync();
        self.field_tx.send_replace(FieldView {
            value: sync.value().to_string(),
            acknowledging: self.ack_deadline.is_some() && sync.is_acknowledging(Instant::now()),
        });
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryNetwork;
    use std::time::Duration;

    fn settings() -> Settings {
        Settings {
            poll_interval: Duration::from_millis(30),
            ack_duration: Duration::from_millis(200),
            redial_disconnected: true,
        }
    }

    async fn start(network: &MemoryNetwork, ns: &Namespace, name: &str) -> SessionHandle {
        Session::start(
            Arc::new(network.transport()),
            ns.clone(),
            Descriptor::new(name, "💻"),
            settings(),
        )
        .await
        .unwrap()
    }

    async fn wait_roster<F>(handle: &SessionHandle, pred: F) -> Vec<RosterEntry>
    where
        F: Fn(&[RosterEntry]) -> bool,
    {
        let mut rx = handle.roster();
        let fut = async {
            loop {
                {
                    let roster = rx.borrow_and_update();
                    if pred(&roster) {
                        return roster.clone();
                    }
                }
                rx.changed().await.unwrap();
            }
        };
        tokio::time::timeout(Duration::from_secs(5), fut)
            .await
            .expect("roster condition not reached")
    }

    async fn wait_field<F>(handle: &SessionHandle, pred: F) -> FieldView
    where
        F: Fn(&FieldView) -> bool,
    {
        let mut rx = handle.field();
        let fut = async {
            loop {
                {
                    let view = rx.borrow_and_update();
                    if pred(&view) {
                        return view.clone();
                    }
                }
                rx.changed().await.unwrap();
            }
        };
        tokio::time::timeout(Duration::from_secs(5), fut)
            .await
            .expect("field condition not reached")
    }

    fn connected_to(roster: &[RosterEntry], id: &Identity) -> bool {
        roster.iter().any(|e| e.identity == *id && e.connected)
    }

    #[tokio::test]
    async fn two_sessions_discover_and_announce() {
        let network = MemoryNetwork::new();
        let ns = Namespace::from_address("1.2.3.4");
        let a = start(&network, &ns, "Alpha").await;
        let b = start(&network, &ns, "Bravo").await;
        assert!(a.identity().as_str().starts_with("p2p-sync-1.2.3.4-"));

        let roster_a = wait_roster(&a, |r| {
            r.iter()
                .any(|e| e.identity == *b.identity() && e.connected && e.descriptor.name == "Bravo")
        })
        .await;
        assert_eq!(roster_a.len(), 2);
        assert!(roster_a[0].is_self && roster_a[0].connected);

        wait_roster(&b, |r| {
            r.iter()
                .any(|e| e.identity == *a.identity() && e.connected && e.descriptor.name == "Alpha")
        })
        .await;

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn other_namespaces_are_ignored() {
        let network = MemoryNetwork::new();
        let a = start(&network, &Namespace::from_address("1.2.3.4"), "A").await;
        let _b = start(&network, &Namespace::fallback(), "B").await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(a.roster().borrow().len(), 1);
        a.stop().await;
    }

    #[tokio::test]
    async fn fallback_namespace_session_registers() {
        let network = MemoryNetwork::new();
        let a = start(&network, &Namespace::fallback(), "A").await;
        assert!(a.identity().as_str().starts_with("p2p-sync-public-room-"));
        assert_eq!(network.registered(), vec![a.identity().clone()]);
        a.stop().await;
        assert!(network.registered().is_empty());
    }

    #[tokio::test]
    async fn remote_edit_mirrors_and_acknowledges() {
        let network = MemoryNetwork::new();
        let ns = Namespace::from_address("1.2.3.4");
        let a = start(&network, &ns, "A").await;
        let b = start(&network, &ns, "B").await;
        wait_roster(&a, |r| connected_to(r, b.identity())).await;
        wait_roster(&b, |r| connected_to(r, a.identity())).await;
        // Let a simultaneous dial from both sides settle on one connection.
        tokio::time::sleep(Duration::from_millis(100)).await;

        b.local_edit("hello");
        let view = wait_field(&a, |v| v.value == "hello").await;
        assert!(view.acknowledging);
        let cleared = wait_field(&a, |v| v.value == "hello" && !v.acknowledging).await;
        assert_eq!(cleared.value, "hello");

        // The sender does not get its own edit bounced back as a remote edit.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!b.field().borrow().acknowledging);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn late_listing_still_connects() {
        let network = MemoryNetwork::new();
        let ns = Namespace::from_address("5.6.7.8");
        let a = start(&network, &ns, "A").await;
        network.hide(a.identity());
        let b = start(&network, &ns, "B").await;
        network.hide(b.identity());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(a.roster().borrow().len(), 1);

        network.reveal(b.identity());
        wait_roster(&a, |r| connected_to(r, b.identity())).await;
        // b learns about a through the incoming connection even though a is still hidden.
        wait_roster(&b, |r| connected_to(r, a.identity())).await;

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn listing_failures_are_retried() {
        let network = MemoryNetwork::new();
        network.fail_listing(true);
        let ns = Namespace::from_address("1.2.3.4");
        let a = start(&network, &ns, "A").await;
        let b = start(&network, &ns, "B").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(a.roster().borrow().len(), 1);

        network.fail_listing(false);
        wait_roster(&a, |r| connected_to(r, b.identity())).await;

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn closed_peer_stays_known_and_can_reconnect() {
        let network = MemoryNetwork::new();
        let ns = Namespace::from_address("1.2.3.4");
        let mut settings_a = settings();
        settings_a.redial_disconnected = false;
        let a = Session::start(
            Arc::new(network.transport()),
            ns.clone(),
            Descriptor::new("A", "💻"),
            settings_a,
        )
        .await
        .unwrap();
        let c = start(&network, &ns, "C").await;
        let c_id = c.identity().clone();
        wait_roster(&a, |r| connected_to(r, &c_id)).await;

        c.stop().await;
        let roster = wait_roster(&a, |r| r.iter().any(|e| e.identity == c_id && !e.connected)).await;
        assert_eq!(roster.len(), 2);

        // Nobody answers under c's identity: the attempt fails and clears the in-flight marker.
        a.connect(c_id.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!connected_to(&a.roster().borrow(), &c_id));

        // c comes back under the same identity. Discovery does not redial known peers
        // with this setting, so only the explicit connect can bring it back.
        let returned = network.transport();
        let _returned_events = returned.open(c_id.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!connected_to(&a.roster().borrow(), &c_id));

        a.connect(c_id.clone());
        wait_roster(&a, |r| connected_to(r, &c_id)).await;

        a.stop().await;
    }

    #[tokio::test]
    async fn new_peer_after_departure_connects() {
        let network = MemoryNetwork::new();
        let ns = Namespace::from_address("1.2.3.4");
        let a = start(&network, &ns, "A").await;
        let b = start(&network, &ns, "B").await;
        let b_id = b.identity().clone();
        wait_roster(&a, |r| connected_to(r, &b_id)).await;

        b.stop().await;
        wait_roster(&a, |r| r.iter().any(|e| e.identity == b_id && !e.connected)).await;
        let b2 = start(&network, &ns, "B2").await;
        wait_roster(&a, |r| connected_to(r, b2.identity())).await;
        assert!(!connected_to(&a.roster().borrow(), &b_id));

        a.stop().await;
        b2.stop().await;
    }

    #[tokio::test]
    async fn listed_again_peer_is_redialled() {
        let network = MemoryNetwork::new();
        let ns = Namespace::from_address("1.2.3.4");
        let a = start(&network, &ns, "A").await;
        let b = start(&network, &ns, "B").await;
        let b_id = b.identity().clone();
        wait_roster(&a, |r| connected_to(r, &b_id)).await;

        b.stop().await;
        wait_roster(&a, |r| r.iter().any(|e| e.identity == b_id && !e.connected)).await;

        // Same identity registers again; a's next poll lists it and redials.
        let returned = network.transport();
        let mut returned_events = returned.open(b_id.clone()).await.unwrap();
        wait_roster(&a, |r| connected_to(r, &b_id)).await;
        match returned_events.recv().await {
            Some(TransportEvent::Opened { remote, direction, .. }) => {
                assert_eq!(remote, *a.identity());
                assert_eq!(direction, fieldsync_core::Direction::Inbound);
            }
            other => panic!("expected an inbound connection, got {other:?}"),
        }

        a.stop().await;
    }

    #[tokio::test]
    async fn local_edit_updates_own_view_without_ack() {
        let network = MemoryNetwork::new();
        let a = start(&network, &Namespace::fallback(), "A").await;
        a.local_edit("draft");
        let view = wait_field(&a, |v| v.value == "draft").await;
        assert!(!view.acknowledging);
        a.stop().await;
    }

    fn detached_session(network: &MemoryNetwork) -> Session<crate::transport::memory::MemoryTransport> {
        let settings = settings();
        let ns = Namespace::from_address("1.2.3.4");
        let core = FieldSyncCore::new(
            ns.clone(),
            Identity::generate(&ns),
            Descriptor::new("A", "💻"),
            &settings,
        );
        let (roster_tx, _) = watch::channel(core.roster());
        let (field_tx, _) = watch::channel(FieldView::default());
        Session {
            transport: Arc::new(network.transport()),
            core,
            links: HashMap::new(),
            settings,
            roster_tx,
            field_tx,
            ack_deadline: None,
        }
    }

    #[tokio::test]
    async fn messages_on_dropped_links_are_ignored() {
        let network = MemoryNetwork::new();
        let mut session = detached_session(&network);
        let peer = Identity::new("p2p-sync-1.2.3.4-peer");

        let (near, _far) = tokio::io::duplex(1024);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (r, w) = tokio::io::split(near);
        crate::transport::spawn_channel(r, w, peer.clone(), fieldsync_core::Direction::Inbound, events_tx);
        let opened = events.recv().await.unwrap();
        let live = match &opened {
            TransportEvent::Opened { link, .. } => link.id(),
            other => panic!("expected Opened, got {other:?}"),
        };
        session.on_transport_event(opened);

        let edit = |connection, value: &str| TransportEvent::Message {
            connection,
            remote: peer.clone(),
            message: fieldsync_core::Message::InputSync {
                value: value.to_string(),
            },
        };
        let actions = session.on_transport_event(edit(live, "fresh"));
        assert!(actions.contains(&Action::FieldChanged("fresh".into())));

        let superseded = ConnectionId(live.0 + 1_000_000);
        assert!(session.on_transport_event(edit(superseded, "stale")).is_empty());
        assert_eq!(session.core.sync().value(), "fresh");
    }
}
