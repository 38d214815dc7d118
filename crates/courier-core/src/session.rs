//! One connected client: a reader task and a writer task around a shared
//! [`Client`].
//!
//! The reader decodes inbound messages and routes them. The writer is the
//! single consumer of the session's mailbox; it numbers every outbound
//! message, remembers the ones that need an ACK, and on shutdown moves
//! whatever is still unacknowledged into the offline store.

use crate::client::{Client, Mail, Mailbox};
use crate::cluster::{ClusterRegistry, PeerClient, PeerId};
use crate::group::GroupDirectory;
use crate::router::Route;
use crate::storage::OfflineStore;
use courier_protocol::{
    Authentication, Body, ImMessage, Message, MessageAck, Seq, Uid, AUTH_STATUS_INVALID,
    AUTH_STATUS_OK,
};
use courier_transport::{Connection, MessageReader, MessageWriter};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, trace, warn};

/// Idle time after which a silent connection is dropped.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(20);

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum time between two inbound messages.
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// The collaborators a session works with.
#[derive(Clone)]
pub struct SessionContext {
    /// Local sessions and remote peers.
    pub router: Arc<dyn Route>,
    /// Node ownership announcements.
    pub cluster: Arc<dyn ClusterRegistry>,
    /// Offline message queues.
    pub store: Arc<dyn OfflineStore>,
    /// Group membership.
    pub groups: Arc<dyn GroupDirectory>,
    /// Session settings.
    pub config: SessionConfig,
}

impl SessionContext {
    /// Bundle the collaborators with the default configuration.
    #[must_use]
    pub fn new(
        router: Arc<dyn Route>,
        cluster: Arc<dyn ClusterRegistry>,
        store: Arc<dyn OfflineStore>,
        groups: Arc<dyn GroupDirectory>,
    ) -> Self {
        Self {
            router,
            cluster,
            store,
            groups,
            config: SessionConfig::default(),
        }
    }

    /// Replace the configuration.
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }
}

/// A session owning one connection.
pub struct Session {
    client: Arc<Client>,
    mailbox: mpsc::UnboundedReceiver<Mail>,
    connection: Connection,
    ctx: SessionContext,
}

impl Session {
    /// Create a session for a freshly accepted connection.
    #[must_use]
    pub fn new(ctx: SessionContext, connection: Connection) -> Self {
        let (client, mailbox) = Client::new(connection.id.clone());
        Self {
            client,
            mailbox,
            connection,
            ctx,
        }
    }

    /// The handle other sessions use to reach this one.
    #[must_use]
    pub fn client(&self) -> Arc<Client> {
        Arc::clone(&self.client)
    }

    /// Drive the connection until it is closed.
    ///
    /// The writer runs as its own task; this future runs the reader and
    /// resolves once both have finished.
    pub async fn run(self) {
        let Session {
            client,
            mailbox,
            connection,
            ctx,
        } = self;
        let Connection {
            reader,
            writer,
            remote_addr,
            ..
        } = connection;

        debug!(connection = %client.id(), remote = ?remote_addr, "Session started");

        let closed = Arc::new(Notify::new());

        let writer = SessionWriter {
            client: Arc::clone(&client),
            ctx: ctx.clone(),
            writer,
            mailbox,
            closed: Arc::clone(&closed),
            seq: 0,
            halted: false,
        };
        let write_task = tokio::spawn(writer.run());

        let reader = SessionReader {
            client: Arc::clone(&client),
            ctx,
            reader,
            closed,
        };
        reader.run().await;

        if let Err(e) = write_task.await {
            error!(connection = %client.id(), error = %e, "Writer task failed");
        }

        debug!(connection = %client.id(), uid = client.uid(), "Session finished");
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Where a message for a given user should go.
enum Target {
    Local(Arc<Client>),
    Remote(Arc<PeerClient>),
    Offline,
}

struct SessionReader {
    client: Arc<Client>,
    ctx: SessionContext,
    reader: Box<dyn MessageReader>,
    /// Signalled by the writer once it has closed the connection.
    closed: Arc<Notify>,
}

impl SessionReader {
    async fn run(mut self) {
        let idle_timeout = self.ctx.config.idle_timeout;

        loop {
            let next = tokio::select! {
                biased;

                _ = self.closed.notified() => {
                    debug!(connection = %self.client.id(), "Connection closed by writer");
                    break;
                }

                result = tokio::time::timeout(idle_timeout, self.reader.recv()) => result,
            };

            let message = match next {
                Ok(Ok(Some(message))) => message,
                Ok(Ok(None)) => {
                    debug!(connection = %self.client.id(), "Connection closed by peer");
                    break;
                }
                Ok(Err(e)) => {
                    warn!(connection = %self.client.id(), error = %e, "Read failed");
                    break;
                }
                Err(_) => {
                    info!(connection = %self.client.id(), uid = self.client.uid(), "Idle timeout");
                    break;
                }
            };

            self.dispatch(message).await;
        }

        self.disconnect();
    }

    async fn dispatch(&mut self, message: Message) {
        trace!(
            connection = %self.client.id(),
            cmd = ?message.cmd(),
            seq = message.seq,
            "Message received"
        );

        let seq = message.seq;
        let cmd = message.cmd();
        match message.body {
            Body::Auth(auth) => self.handle_auth(auth),
            Body::Heartbeat => {}
            _ if !self.client.is_authenticated() => {
                warn!(
                    connection = %self.client.id(),
                    ?cmd,
                    "Message before authentication, ignoring"
                );
            }
            Body::Im(im) => self.handle_im(im, seq).await,
            Body::GroupIm(im) => self.handle_group_im(im, seq).await,
            Body::Ack(ack) => self.handle_ack(ack),
            Body::AuthStatus(_) | Body::Rst => {
                warn!(connection = %self.client.id(), seq, "Unexpected message from client");
            }
        }
    }

    fn reply(&self, message: Message) {
        if self.client.enqueue(message).is_err() {
            debug!(connection = %self.client.id(), "Mailbox closed, reply dropped");
        }
    }

    fn handle_auth(&mut self, auth: Authentication) {
        let current = self.client.uid();
        if auth.uid == 0 || (current != 0 && current != auth.uid) {
            warn!(
                connection = %self.client.id(),
                uid = auth.uid,
                current,
                "Authentication refused"
            );
            self.reply(Message::auth_status(AUTH_STATUS_INVALID));
            return;
        }

        let now = unix_seconds();
        self.client.authenticate(auth.uid, now);
        info!(connection = %self.client.id(), uid = auth.uid, "Client authenticated");

        self.reply(Message::auth_status(AUTH_STATUS_OK));

        let previous = self.evict_previous(auth.uid);
        self.ctx.router.add_client(Arc::clone(&self.client));
        self.ctx.cluster.add_client(auth.uid, now);

        self.send_offline_messages(auth.uid, previous);
    }

    /// Single sign-on: tell any other session of `uid` to go away.
    ///
    /// Returns the evicted session, if there was one.
    fn evict_previous(&self, uid: Uid) -> Option<Arc<Client>> {
        let previous = self.ctx.router.find_client(uid)?;
        if previous.id() == self.client.id() {
            return None;
        }

        info!(
            uid,
            previous = %previous.id(),
            connection = %self.client.id(),
            "Evicting previous session"
        );
        if previous.enqueue(Message::rst()).is_err() {
            debug!(uid, previous = %previous.id(), "Previous session already gone");
        }
        Some(previous)
    }

    /// Replay `uid`'s offline queue into this session.
    ///
    /// An evicted session flushes its unacked messages into the same queue
    /// when it closes, so the drain starts only after it has.
    fn send_offline_messages(&self, uid: Uid, previous: Option<Arc<Client>>) {
        let client = Arc::clone(&self.client);
        let store = Arc::clone(&self.ctx.store);
        let wait = self.ctx.config.idle_timeout;

        tokio::spawn(async move {
            if let Some(previous) = previous {
                if tokio::time::timeout(wait, previous.closed()).await.is_err() {
                    warn!(uid, previous = %previous.id(), "Previous session still open, draining anyway");
                }
            }

            let messages = match store.load_offline_message(uid).await {
                Ok(messages) => messages,
                Err(e) => {
                    error!(uid, error = %e, "Failed to load offline messages");
                    return;
                }
            };
            if messages.is_empty() {
                return;
            }

            let count = messages.len();
            for message in messages {
                if client.enqueue(message).is_err() {
                    // Keep the queue; it is replayed on the next login
                    debug!(uid, "Session closed during offline delivery");
                    return;
                }
            }

            if let Err(e) = store.clear_offline_message(uid).await {
                error!(uid, error = %e, "Failed to clear offline messages");
            }
            debug!(uid, count, "Offline messages delivered");
        });
    }

    fn resolve(&self, uid: Uid) -> Target {
        if let Some(client) = self.ctx.router.find_client(uid) {
            Target::Local(client)
        } else if let Some(peer) = self.ctx.router.find_peer_client(uid) {
            Target::Remote(peer)
        } else {
            Target::Offline
        }
    }

    async fn save_offline(&self, uid: Uid, message: Message) {
        if let Err(e) = self.ctx.store.save_offline_message(uid, message).await {
            error!(uid, error = %e, "Failed to save offline message");
        }
    }

    async fn handle_im(&mut self, im: ImMessage, seq: Seq) {
        let receiver = im.receiver;
        let message = Message::im(im);

        let undelivered = match self.resolve(receiver) {
            Target::Local(client) => client.enqueue(message).err(),
            Target::Remote(peer) => peer.enqueue(message).err(),
            Target::Offline => Some(message),
        };
        if let Some(message) = undelivered {
            trace!(receiver, "Receiver offline, storing message");
            self.save_offline(receiver, message).await;
        }

        self.reply(Message::ack(seq));
    }

    async fn handle_group_im(&mut self, im: ImMessage, seq: Seq) {
        let gid = im.receiver;
        let Some(group) = self.ctx.groups.find_group(gid) else {
            warn!(connection = %self.client.id(), gid, "Can't find group");
            return;
        };

        let message = Message::group_im(im);
        // One copy per remote node, however many members live there
        let mut peers: HashMap<PeerId, (Arc<PeerClient>, Vec<Uid>)> = HashMap::new();

        for member in group.members() {
            match self.resolve(member) {
                Target::Local(client) => {
                    if let Err(message) = client.enqueue(message.clone()) {
                        self.save_offline(member, message).await;
                    }
                }
                Target::Remote(peer) => {
                    let key = peer.id().clone();
                    peers
                        .entry(key)
                        .or_insert_with(|| (peer, Vec::new()))
                        .1
                        .push(member);
                }
                Target::Offline => self.save_offline(member, message.clone()).await,
            }
        }

        for (peer, members) in peers.into_values() {
            if let Err(message) = peer.enqueue(message.clone()) {
                warn!(peer = %peer.id(), "Peer unavailable, storing group message");
                for member in members {
                    self.save_offline(member, message.clone()).await;
                }
            }
        }

        trace!(gid, members = group.len(), "Group message routed");
        self.reply(Message::ack(seq));
    }

    fn handle_ack(&mut self, ack: MessageAck) {
        match self.client.unacked().remove(ack.seq) {
            Some(_) => trace!(
                connection = %self.client.id(),
                seq = ack.seq,
                remaining = self.client.unacked().len(),
                "Message acknowledged"
            ),
            None => warn!(connection = %self.client.id(), seq = ack.seq, "Invalid ack seq"),
        }
    }

    fn disconnect(&self) {
        self.client.begin_closing();
        self.ctx.router.remove_client(&self.client);

        let uid = self.client.uid();
        // A newer login of the same user keeps its announcement
        if uid != 0 && self.ctx.router.find_client(uid).is_none() {
            self.ctx.cluster.remove_client(uid);
        }

        self.client.shutdown();
    }
}

struct SessionWriter {
    client: Arc<Client>,
    ctx: SessionContext,
    writer: Box<dyn MessageWriter>,
    mailbox: mpsc::UnboundedReceiver<Mail>,
    closed: Arc<Notify>,
    /// Last assigned sequence number.
    seq: Seq,
    /// Set once the connection is closed (RST sent or a write failed).
    halted: bool,
}

impl SessionWriter {
    async fn run(mut self) {
        while let Some(mail) = self.mailbox.recv().await {
            let Mail::Deliver(mut message) = mail else {
                break;
            };

            self.seq = self.seq.checked_add(1).unwrap_or(1);
            message.seq = self.seq;

            if message.requires_ack() {
                self.client.unacked().push(message.clone());
            }

            if self.halted {
                trace!(
                    connection = %self.client.id(),
                    seq = message.seq,
                    "Connection closed, not writing"
                );
                continue;
            }

            if let Err(e) = self.writer.send(&message).await {
                warn!(connection = %self.client.id(), error = %e, "Write failed");
                self.halt().await;
                continue;
            }

            if matches!(message.body, Body::Rst) {
                info!(
                    connection = %self.client.id(),
                    uid = self.client.uid(),
                    "Reset sent, closing connection"
                );
                self.halt().await;
            }
        }

        self.finish().await;
    }

    async fn halt(&mut self) {
        self.halted = true;
        self.client.begin_closing();
        if let Err(e) = self.writer.close().await {
            debug!(connection = %self.client.id(), error = %e, "Close failed");
        }
        self.closed.notify_one();
    }

    async fn finish(mut self) {
        // Refuse new mail; senders fall back to the offline store
        self.mailbox.close();

        let mut pending = self.client.unacked().drain();
        while let Ok(mail) = self.mailbox.try_recv() {
            if let Mail::Deliver(message) = mail {
                if message.requires_ack() {
                    pending.push(message);
                }
            }
        }

        let uid = self.client.uid();
        if !pending.is_empty() {
            let count = pending.len();
            if uid == 0 {
                warn!(
                    connection = %self.client.id(),
                    count,
                    "Dropping messages of unauthenticated connection"
                );
            } else {
                for message in pending {
                    if let Err(e) = self.ctx.store.save_offline_message(uid, message).await {
                        error!(uid, error = %e, "Failed to save unacknowledged message");
                    }
                }
                info!(
                    connection = %self.client.id(),
                    uid,
                    count,
                    "Unacknowledged messages stored"
                );
            }
        }

        if !self.halted {
            if let Err(e) = self.writer.close().await {
                debug!(connection = %self.client.id(), error = %e, "Close failed");
            }
        }
        self.client.mark_closed();

        debug!(connection = %self.client.id(), "Socket closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SessionState;
    use crate::cluster::Cluster;
    use crate::group::GroupManager;
    use crate::router::Router;
    use crate::storage::MemoryStore;
    use courier_transport::memory::{self, MemoryClient};
    use tokio::task::JoinHandle;

    const WAIT: Duration = Duration::from_secs(1);

    struct Harness {
        router: Arc<Router>,
        cluster: Arc<Cluster>,
        store: Arc<MemoryStore>,
        groups: Arc<GroupManager>,
        ctx: SessionContext,
    }

    struct Conn {
        client: Arc<Client>,
        remote: MemoryClient,
        task: JoinHandle<()>,
    }

    impl Harness {
        fn new() -> Self {
            let router = Arc::new(Router::new());
            let cluster = Arc::new(Cluster::new("node-a"));
            let store = Arc::new(MemoryStore::new());
            let groups = Arc::new(GroupManager::new());
            let ctx = SessionContext::new(
                router.clone(),
                cluster.clone(),
                store.clone(),
                groups.clone(),
            );
            Self {
                router,
                cluster,
                store,
                groups,
                ctx,
            }
        }

        fn connect(&self) -> Conn {
            let (connection, remote) = memory::pair();
            let session = Session::new(self.ctx.clone(), connection);
            let client = session.client();
            let task = tokio::spawn(session.run());
            Conn {
                client,
                remote,
                task,
            }
        }

        async fn login(&self, uid: Uid) -> Conn {
            let mut conn = self.connect();
            conn.remote.send(Message::auth(uid)).unwrap();
            assert_eq!(
                expect(&mut conn.remote).await,
                Message::auth_status(AUTH_STATUS_OK).with_seq(1)
            );
            let id = conn.client.id().clone();
            wait_until(|| self.router.find_client(uid).is_some_and(|c| *c.id() == id)).await;
            conn
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    /// Give in-flight deliveries time to land.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    async fn expect(remote: &mut MemoryClient) -> Message {
        remote
            .recv_timeout(WAIT)
            .await
            .expect("timed out")
            .expect("connection closed")
    }

    fn im(sender: Uid, receiver: Uid, content: &str, seq: Seq) -> Message {
        Message::im(ImMessage::new(sender, receiver, content)).with_seq(seq)
    }

    fn content(message: &Message) -> &str {
        match &message.body {
            Body::Im(im) | Body::GroupIm(im) => &im.content,
            other => panic!("not a chat message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_auth_registers_session() {
        let h = Harness::new();
        let a = h.login(1).await;

        assert_eq!(a.client.uid(), 1);
        assert_eq!(a.client.state(), SessionState::Authenticated);
        assert!(a.client.authenticated_at() > 0);
        assert!(h.cluster.is_online(1));
        assert_eq!(h.router.stats().online_users, 1);
    }

    #[tokio::test]
    async fn test_auth_rejects_zero_uid() {
        let h = Harness::new();
        let mut a = h.connect();

        a.remote.send(Message::auth(0)).unwrap();
        assert_eq!(
            expect(&mut a.remote).await,
            Message::auth_status(AUTH_STATUS_INVALID).with_seq(1)
        );
        assert!(!a.client.is_authenticated());
        assert_eq!(h.router.stats().online_users, 0);
        assert!(h.cluster.is_empty());
    }

    #[tokio::test]
    async fn test_reauth_with_other_uid_refused() {
        let h = Harness::new();
        let mut a = h.login(1).await;

        a.remote.send(Message::auth(2)).unwrap();
        assert_eq!(
            expect(&mut a.remote).await,
            Message::auth_status(AUTH_STATUS_INVALID).with_seq(2)
        );
        assert_eq!(a.client.uid(), 1);
        assert!(h.router.find_client(2).is_none());
        assert!(!h.cluster.is_online(2));
    }

    #[tokio::test]
    async fn test_reauth_same_uid_refreshes() {
        let h = Harness::new();
        let mut a = h.login(1).await;

        a.remote.send(Message::auth(1)).unwrap();
        assert_eq!(
            expect(&mut a.remote).await,
            Message::auth_status(AUTH_STATUS_OK).with_seq(2)
        );
        // Re-login on the same connection does not evict itself
        assert!(a.remote.try_recv().is_none());
        assert_eq!(h.router.find_client(1).unwrap().id(), a.client.id());
    }

    #[tokio::test]
    async fn test_message_before_auth_ignored() {
        let h = Harness::new();
        let mut a = h.connect();

        a.remote.send(im(1, 2, "early", 1)).unwrap();
        a.remote.send(Message::ack(1).with_seq(2)).unwrap();
        a.remote.send(Message::auth(1)).unwrap();

        // The first reply is the AUTH status, nothing was acknowledged before
        assert_eq!(
            expect(&mut a.remote).await,
            Message::auth_status(AUTH_STATUS_OK).with_seq(1)
        );
        assert_eq!(h.store.pending(2), 0);
    }

    #[tokio::test]
    async fn test_local_delivery_in_order() {
        let h = Harness::new();
        let mut a = h.login(1).await;
        let mut b = h.login(2).await;

        a.remote.send(im(1, 2, "first", 7)).unwrap();
        a.remote.send(im(1, 2, "second", 8)).unwrap();

        // Acks echo the request seq and carry the sender's own numbering
        assert_eq!(expect(&mut a.remote).await, Message::ack(7).with_seq(2));
        assert_eq!(expect(&mut a.remote).await, Message::ack(8).with_seq(3));

        let first = expect(&mut b.remote).await;
        let second = expect(&mut b.remote).await;
        assert_eq!(content(&first), "first");
        assert_eq!(content(&second), "second");
        assert_eq!((first.seq, second.seq), (2, 3));
        assert_eq!(b.client.unacked().seqs(), vec![2, 3]);

        // Each message arrives exactly once
        settle().await;
        assert!(a.remote.try_recv().is_none());
        assert!(b.remote.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_ack_removes_only_match() {
        let h = Harness::new();
        let mut a = h.login(1).await;
        let mut b = h.login(2).await;

        a.remote.send(im(1, 2, "one", 1)).unwrap();
        a.remote.send(im(1, 2, "two", 2)).unwrap();
        expect(&mut b.remote).await;
        expect(&mut b.remote).await;
        assert_eq!(b.client.unacked().seqs(), vec![2, 3]);

        b.remote.send(Message::ack(99)).unwrap();
        b.remote.send(Message::ack(3)).unwrap();
        wait_until(|| b.client.unacked().len() == 1).await;
        assert_eq!(b.client.unacked().seqs(), vec![2]);
    }

    #[tokio::test]
    async fn test_offline_messages_replayed_on_login() {
        let h = Harness::new();
        let mut a = h.login(1).await;

        a.remote.send(im(1, 2, "one", 1)).unwrap();
        a.remote.send(im(1, 2, "two", 2)).unwrap();
        assert_eq!(expect(&mut a.remote).await, Message::ack(1).with_seq(2));
        assert_eq!(expect(&mut a.remote).await, Message::ack(2).with_seq(3));
        assert_eq!(h.store.pending(2), 2);

        let mut b = h.login(2).await;
        let first = expect(&mut b.remote).await;
        let second = expect(&mut b.remote).await;
        assert_eq!((content(&first), first.seq), ("one", 2));
        assert_eq!((content(&second), second.seq), ("two", 3));

        wait_until(|| h.store.pending(2) == 0).await;
    }

    #[tokio::test]
    async fn test_unacked_message_survives_disconnect() {
        let h = Harness::new();
        let mut a = h.login(1).await;
        let mut b = h.login(2).await;

        a.remote.send(im(1, 2, "hello", 1)).unwrap();
        assert_eq!(content(&expect(&mut b.remote).await), "hello");

        // B drops without acknowledging
        b.remote.disconnect();
        b.task.await.unwrap();
        assert_eq!(b.client.state(), SessionState::Closed);
        assert_eq!(h.store.pending(2), 1);
        assert!(h.router.find_client(2).is_none());
        assert!(!h.cluster.is_online(2));

        let mut b = h.login(2).await;
        let replayed = expect(&mut b.remote).await;
        assert_eq!(content(&replayed), "hello");
        wait_until(|| h.store.pending(2) == 0).await;
    }

    #[tokio::test]
    async fn test_duplicate_login_resets_old_session() {
        let h = Harness::new();
        let mut sender = h.login(9).await;
        let mut old = h.login(1).await;

        sender.remote.send(im(9, 1, "pending", 1)).unwrap();
        assert_eq!(content(&expect(&mut old.remote).await), "pending");

        let mut new = h.login(1).await;

        assert_eq!(expect(&mut old.remote).await.body, Body::Rst);
        assert_eq!(old.remote.recv_timeout(WAIT).await.unwrap(), None);
        old.task.await.unwrap();

        assert_eq!(h.router.find_client(1).unwrap().id(), new.client.id());
        assert!(h.cluster.is_online(1));

        // The unacknowledged message moves to the new session
        assert_eq!(content(&expect(&mut new.remote).await), "pending");
        wait_until(|| h.store.pending(1) == 0).await;
    }

    #[tokio::test]
    async fn test_duplicate_login_keeps_queued_and_unacked_messages() {
        let h = Harness::new();
        let mut sender = h.login(9).await;
        let mut old = h.login(1).await;
        settle().await;

        h.store
            .save_offline_message(1, Message::im(ImMessage::new(9, 1, "queued")))
            .await
            .unwrap();
        sender.remote.send(im(9, 1, "unacked", 1)).unwrap();
        assert_eq!(content(&expect(&mut old.remote).await), "unacked");

        let mut new = h.login(1).await;
        assert_eq!(expect(&mut old.remote).await.body, Body::Rst);

        // The drain waits for the old session to flush into the store
        let first = expect(&mut new.remote).await;
        let second = expect(&mut new.remote).await;
        assert_eq!(content(&first), "queued");
        assert_eq!(content(&second), "unacked");
        assert_eq!(old.client.state(), SessionState::Closed);

        wait_until(|| h.store.pending(1) == 0).await;
        settle().await;
        assert!(new.remote.try_recv().is_none());
        assert_eq!(h.store.pending(1), 0);
    }

    #[tokio::test]
    async fn test_reset_suppresses_queued_messages() {
        let h = Harness::new();
        let mut a = h.login(1).await;

        a.client.enqueue(Message::rst()).unwrap();
        a.client
            .enqueue(Message::im(ImMessage::new(2, 1, "late")))
            .unwrap();
        a.client
            .enqueue(Message::im(ImMessage::new(2, 1, "later")))
            .unwrap();

        assert_eq!(expect(&mut a.remote).await.body, Body::Rst);
        assert_eq!(a.remote.recv_timeout(WAIT).await.unwrap(), None);
        a.task.await.unwrap();

        let stored = h.store.load_offline_message(1).await.unwrap();
        let contents: Vec<_> = stored.iter().map(content).collect();
        assert_eq!(contents, vec!["late", "later"]);
        assert!(!h.cluster.is_online(1));
    }

    #[tokio::test]
    async fn test_group_fanout() {
        let h = Harness::new();
        let mut a = h.login(1).await;
        let mut b = h.login(2).await;
        let (peer, mut peer_rx) = PeerClient::new("node-b");
        h.router.add_peer_client(3, Arc::clone(&peer));
        h.router.add_peer_client(4, peer);
        h.groups.create_group(100, [2, 3, 4, 5]);

        let message = Message::group_im(ImMessage::new(1, 100, "hey")).with_seq(4);
        a.remote.send(message).unwrap();
        assert_eq!(expect(&mut a.remote).await, Message::ack(4).with_seq(2));

        let local = expect(&mut b.remote).await;
        assert!(matches!(local.body, Body::GroupIm(_)));
        assert_eq!(content(&local), "hey");

        // Two members on node-b, one copy forwarded
        assert_eq!(content(&peer_rx.try_recv().unwrap()), "hey");
        assert!(peer_rx.try_recv().is_err());

        assert_eq!(h.store.pending(5), 1);

        settle().await;
        assert!(a.remote.try_recv().is_none());
        assert!(b.remote.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_group_fanout_includes_sender() {
        let h = Harness::new();
        let mut a = h.login(1).await;
        let mut b = h.login(2).await;
        let mut c = h.login(3).await;
        h.groups.create_group(100, [1, 2, 3]);

        let message = Message::group_im(ImMessage::new(1, 100, "all")).with_seq(6);
        a.remote.send(message).unwrap();

        // The sender is a member too: its copy is queued before the ack
        let own = expect(&mut a.remote).await;
        assert_eq!((content(&own), own.seq), ("all", 2));
        assert_eq!(expect(&mut a.remote).await, Message::ack(6).with_seq(3));

        assert_eq!(content(&expect(&mut b.remote).await), "all");
        assert_eq!(content(&expect(&mut c.remote).await), "all");

        settle().await;
        assert!(a.remote.try_recv().is_none());
        assert!(b.remote.try_recv().is_none());
        assert!(c.remote.try_recv().is_none());
        assert_eq!(h.store.total_pending(), 0);
    }

    #[tokio::test]
    async fn test_unknown_group_not_acknowledged() {
        let h = Harness::new();
        let mut a = h.login(1).await;

        let message = Message::group_im(ImMessage::new(1, 999, "lost")).with_seq(4);
        a.remote.send(message).unwrap();
        a.remote.send(im(1, 2, "stored", 5)).unwrap();

        assert_eq!(expect(&mut a.remote).await, Message::ack(5).with_seq(2));
        assert_eq!(h.store.total_pending(), 1);
    }

    #[tokio::test]
    async fn test_remote_delivery() {
        let h = Harness::new();
        let mut a = h.login(1).await;
        let (peer, mut peer_rx) = PeerClient::new("node-b");
        h.router.add_peer_client(2, peer);

        a.remote.send(im(1, 2, "far away", 3)).unwrap();
        assert_eq!(expect(&mut a.remote).await, Message::ack(3).with_seq(2));
        assert_eq!(content(&peer_rx.try_recv().unwrap()), "far away");
        assert_eq!(h.store.pending(2), 0);
    }

    #[tokio::test]
    async fn test_closed_peer_falls_back_to_store() {
        let h = Harness::new();
        let mut a = h.login(1).await;
        let (peer, peer_rx) = PeerClient::new("node-b");
        drop(peer_rx);
        h.router.add_peer_client(2, peer);

        a.remote.send(im(1, 2, "retry later", 3)).unwrap();
        assert_eq!(expect(&mut a.remote).await, Message::ack(3).with_seq(2));
        assert_eq!(h.store.pending(2), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_session_alive() {
        let h = Harness::new();
        let mut a = h.login(1).await;

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(15)).await;
            a.remote.send(Message::heartbeat()).unwrap();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        // Heartbeats are never answered
        assert!(a.remote.try_recv().is_none());
        assert_eq!(a.client.state(), SessionState::Authenticated);
        assert!(h.cluster.is_online(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_disconnects() {
        let h = Harness::new();
        let mut a = h.login(1).await;

        assert_eq!(a.remote.recv().await, None);
        a.task.await.unwrap();

        assert_eq!(a.client.state(), SessionState::Closed);
        assert!(h.router.find_client(1).is_none());
        assert!(!h.cluster.is_online(1));
    }

    #[tokio::test]
    async fn test_custom_idle_timeout() {
        let mut h = Harness::new();
        h.ctx = h.ctx.clone().with_config(SessionConfig {
            idle_timeout: Duration::from_millis(50),
        });
        let mut a = h.connect();

        assert_eq!(a.remote.recv_timeout(WAIT).await.unwrap(), None);
        a.task.await.unwrap();
        assert_eq!(a.client.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_enqueue_after_close_fails() {
        let h = Harness::new();
        let mut a = h.login(1).await;

        a.remote.disconnect();
        a.task.await.unwrap();

        let message = Message::im(ImMessage::new(2, 1, "too late"));
        assert_eq!(a.client.enqueue(message.clone()), Err(message));
    }

    #[tokio::test]
    async fn test_newer_login_keeps_cluster_entry() {
        let h = Harness::new();
        let mut old = h.login(1).await;
        let _new = h.login(1).await;

        assert_eq!(expect(&mut old.remote).await.body, Body::Rst);
        old.task.await.unwrap();

        // The superseded session must not retract the live login
        assert!(h.cluster.is_online(1));
        assert_eq!(h.router.stats().online_users, 1);
    }
}
