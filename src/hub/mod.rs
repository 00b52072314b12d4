//! The hub: users, offline queues, agent registry and command dispatch.
//!
//! All mutable state sits behind one mutex together with the store, so
//! persistence is serialized with every mutation. Chat sends and agent
//! calls happen with the lock released.

pub mod command;
pub mod dispatch;
pub mod registry;
pub mod server;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

use crate::config::Settings;
use crate::error::Result;
use crate::store::Store;
use crate::telegram::{run_poll_loop, InboundMessage, Messenger, OfflineMessenger, TelegramMessenger};

use command::{ChatCommand, HELP_TEXT, USAGE_TEXT};
use dispatch::AgentClient;
use registry::{AgentInfo, AgentRegistry, Lookup};

pub use server::run_server;

/// Reply used when an agent answers with an empty body.
pub const NO_OUTPUT: &str = "(no output)";

/// Tunables taken from [`Settings`].
#[derive(Debug, Clone)]
pub struct HubOptions {
    pub aliases: HashMap<String, Vec<String>>,
    pub stale_after: Duration,
    pub connect_timeout: Duration,
}

impl HubOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            aliases: settings.hub.aliases.clone(),
            stale_after: settings.stale_after(),
            connect_timeout: Duration::from_secs(settings.hub.connect_timeout_secs),
        }
    }
}

impl Default for HubOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Everything guarded by the hub's lock.
#[derive(Debug)]
pub struct HubState {
    pub store: Store,
    pub agents: AgentRegistry,
    /// Users (by queue key) with a send in progress.
    pub in_flight: HashSet<String>,
}

/// How a delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Queued,
}

pub struct Hub {
    state: Mutex<HubState>,
    messenger: Arc<dyn Messenger>,
    agent_client: AgentClient,
    aliases: HashMap<String, Vec<String>>,
}

impl Hub {
    pub fn new(store: Store, messenger: Arc<dyn Messenger>, options: HubOptions) -> Result<Self> {
        Ok(Self {
            state: Mutex::new(HubState {
                store,
                agents: AgentRegistry::new(options.stale_after),
                in_flight: HashSet::new(),
            }),
            messenger,
            agent_client: AgentClient::new(options.connect_timeout)?,
            aliases: options.aliases,
        })
    }

    /// Lock the shared state.
    pub async fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().await
    }

    /// Handle one inbound chat message.
    pub async fn handle_message(&self, msg: InboundMessage) {
        if msg.text.trim().is_empty() {
            return;
        }
        if msg.is_group {
            tracing::debug!("Ignoring group message from {} in {}", msg.sender, msg.chat_id);
            return;
        }

        tracing::info!("[{}] {}", msg.sender, msg.text);
        self.observe_sender(&msg).await;

        match command::parse(&msg.text) {
            ChatCommand::Help => self.reply(&msg, HELP_TEXT).await,
            ChatCommand::Usage => self.reply(&msg, USAGE_TEXT).await,
            ChatCommand::Dispatch {
                command,
                agent,
                args,
            } => self.dispatch(&msg, &command, &agent, &args).await,
        }
    }

    async fn observe_sender(&self, msg: &InboundMessage) {
        let observed = {
            let mut state = self.state.lock().await;
            let (name, aliases) = self.configured_identity(&msg.sender);
            let observed = state.store.observe(name, msg.chat_id, aliases);
            if observed.created || observed.chat_changed {
                if let Err(e) = state.store.save() {
                    tracing::warn!("Failed to save users: {}", e);
                }
            }
            observed
        };

        if observed.chat_changed {
            tracing::info!("{} is reachable at chat {}", observed.name, msg.chat_id);
            self.flush(&observed.name).await;
        }
    }

    /// Canonical name and aliases for `sender` from the static alias table.
    fn configured_identity<'a>(&'a self, sender: &'a str) -> (&'a str, &'a [String]) {
        if let Some(aliases) = self.aliases.get(sender) {
            return (sender, aliases.as_slice());
        }
        self.aliases
            .iter()
            .find(|(_, aliases)| aliases.iter().any(|a| a == sender))
            .map(|(name, aliases)| (name.as_str(), aliases.as_slice()))
            .unwrap_or((sender, &[][..]))
    }

    async fn dispatch(&self, msg: &InboundMessage, command: &str, agent: &str, args: &[String]) {
        let (lookup, known) = {
            let state = self.state.lock().await;
            (state.agents.lookup(agent), state.agents.known_names())
        };

        let address = match lookup {
            Lookup::Live(address) => address,
            Lookup::Unknown => {
                tracing::info!("Unknown agent {} requested by {}", agent, msg.sender);
                let text = format!("unknown agent \"{}\"; known agents: {}", agent, known);
                self.reply(msg, &text).await;
                return;
            }
            Lookup::Stale { address, age } => {
                tracing::warn!("Agent {} at {} is stale ({:?})", agent, address, age);
                let text = format!(
                    "agent \"{}\" has not registered for {}s; known agents: {}",
                    agent,
                    age.as_secs(),
                    known
                );
                self.reply(msg, &text).await;
                return;
            }
        };

        let text = match self
            .agent_client
            .execute(&address, command, &msg.sender, args)
            .await
        {
            Ok(body) if body.is_empty() => NO_OUTPUT.to_string(),
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("Dispatch of {} to {} failed: {}", command, agent, e);
                e.to_string()
            }
        };
        self.reply(msg, &text).await;
    }

    async fn reply(&self, msg: &InboundMessage, text: &str) {
        if let Err(e) = self.messenger.reply(msg, text).await {
            tracing::warn!("Failed to reply to {}: {}", msg.sender, e);
        }
    }

    /// Send `text` to `user` now if possible, otherwise queue it durably.
    ///
    /// Deliveries to one user never overtake each other: while older
    /// messages are queued or another delivery to the same user is in
    /// flight, `text` is queued behind them. Errors only come from
    /// persisting the queue.
    pub async fn deliver_or_queue(&self, user: &str, text: &str) -> Result<Delivery> {
        let backlog = {
            let state = self.state.lock().await;
            state.store.chat_id(user).is_some() && !state.store.queue(user).is_empty()
        };
        if backlog {
            self.flush(user).await;
        }

        let (chat_id, key) = {
            let mut state = self.state.lock().await;
            let key = state.store.queue_key(user);
            let idle = state.store.queue(user).is_empty() && !state.in_flight.contains(&key);
            match state.store.chat_id(user) {
                Some(chat_id) if idle => {
                    state.in_flight.insert(key.clone());
                    (chat_id, key)
                }
                _ => {
                    state.store.enqueue(user, text);
                    tracing::info!(
                        "Queued message for {} ({} pending)",
                        user,
                        state.store.queue(user).len()
                    );
                    state.store.save()?;
                    return Ok(Delivery::Queued);
                }
            }
        };

        let result = self.messenger.send(chat_id, text).await;

        let queued_meanwhile = {
            let mut state = self.state.lock().await;
            state.in_flight.remove(&key);
            if let Err(e) = result {
                tracing::warn!("Sending to {} failed, queueing: {}", user, e);
                // Anything queued meanwhile is newer than this text.
                state.store.requeue_front(user, vec![text.to_string()]);
                state.store.save()?;
                return Ok(Delivery::Queued);
            }
            !state.store.queue(user).is_empty()
        };

        tracing::info!("Sent message to {}", user);
        if queued_meanwhile {
            self.flush(user).await;
        }
        Ok(Delivery::Sent)
    }

    /// Try to deliver everything queued for `user`; returns how many were sent.
    ///
    /// Keeps draining until the queue is empty or a send fails. Entries
    /// that fail stay queued in their original order, ahead of anything
    /// queued meanwhile. Returns 0 at once if a delivery to `user` is
    /// already in flight; that one drains the queue when it finishes.
    pub async fn flush(&self, user: &str) -> usize {
        let (chat_id, key) = {
            let mut state = self.state.lock().await;
            let Some(chat_id) = state.store.chat_id(user) else {
                return 0;
            };
            let key = state.store.queue_key(user);
            if !state.in_flight.insert(key.clone()) {
                return 0;
            }
            (chat_id, key)
        };

        let mut sent = 0;
        loop {
            let pending = {
                let mut state = self.state.lock().await;
                let pending = state.store.take_queue(user);
                if pending.is_empty() {
                    state.in_flight.remove(&key);
                    break;
                }
                pending
            };

            let total = pending.len();
            let mut remaining = Vec::new();
            for text in pending {
                if let Err(e) = self.messenger.send(chat_id, &text).await {
                    tracing::warn!("Redelivery to {} failed: {}", user, e);
                    remaining.push(text);
                }
            }
            sent += total - remaining.len();

            let mut state = self.state.lock().await;
            let failed = !remaining.is_empty();
            state.store.requeue_front(user, remaining);
            if let Err(e) = state.store.save() {
                tracing::warn!("Failed to save queues after flush: {}", e);
            }
            if failed {
                state.in_flight.remove(&key);
                break;
            }
        }

        if sent > 0 {
            tracing::info!("Flushed {} queued messages to {}", sent, user);
        }
        sent
    }

    /// Flush every user that has both a known chat and pending messages.
    pub async fn flush_all(&self) {
        let users = self.state.lock().await.store.flushable_users();
        for user in users {
            self.flush(&user).await;
        }
    }

    /// Record an agent's address; returns the address it replaced.
    pub async fn register_agent(&self, name: &str, address: &str) -> Option<String> {
        let previous = self.state.lock().await.agents.register(name, address);
        match &previous {
            Some(old) if old != address => {
                tracing::info!("Agent {} moved from {} to {}", name, old, address)
            }
            Some(_) => tracing::debug!("Agent {} refreshed at {}", name, address),
            None => tracing::info!("Registered agent {} at {}", name, address),
        }
        previous
    }

    pub async fn agents(&self) -> Vec<AgentInfo> {
        self.state.lock().await.agents.snapshot()
    }

    /// Users array and queue object as two newline-terminated JSON documents.
    pub async fn status_text(&self) -> Result<String> {
        let state = self.state.lock().await;
        let users = serde_json::to_string(state.store.users())?;
        let queues = serde_json::to_string(state.store.queues())?;
        Ok(format!("{}\n{}\n", users, queues))
    }
}

/// Run the hub until its HTTP server or the Telegram poll loop stops.
///
/// Only a locked data directory is fatal here; unreadable state is logged
/// and the hub starts empty.
pub async fn run_hub(settings: &Settings, listen: SocketAddr, data_dir: &Path) -> Result<()> {
    let mut store = Store::acquire(data_dir)?;
    if let Err(e) = store.load() {
        tracing::warn!("Starting with empty state: {}", e);
    }
    tracing::info!("Hub data directory: {}", data_dir.display());

    let telegram = match settings.bot_token() {
        Ok(token) => Some(TelegramMessenger::new(token)),
        Err(e) => {
            tracing::warn!("Telegram disabled, messages will only be queued: {}", e);
            None
        }
    };
    let messenger: Arc<dyn Messenger> = match &telegram {
        Some(client) => Arc::new(client.clone()),
        None => Arc::new(OfflineMessenger),
    };

    let hub = Arc::new(Hub::new(store, messenger, HubOptions::from_settings(settings))?);
    hub.flush_all().await;

    match telegram {
        Some(client) => {
            tokio::select! {
                result = run_server(hub.clone(), listen) => result,
                result = run_poll_loop(client, hub.clone()) => {
                    tracing::info!("Telegram poll loop stopped");
                    result
                }
            }
        }
        None => run_server(hub, listen).await,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    use crate::error::Error;

    /// Records everything sent; texts in `failing` cannot be delivered and
    /// texts in `slow` take [`SLOW_SEND`] to go out.
    #[derive(Default)]
    pub(crate) struct FakeMessenger {
        pub sent: StdMutex<Vec<(i64, String)>>,
        pub replies: StdMutex<Vec<(i32, String)>>,
        pub failing: StdMutex<HashSet<String>>,
        pub slow: StdMutex<HashSet<String>>,
    }

    const SLOW_SEND: Duration = Duration::from_millis(200);

    impl FakeMessenger {
        pub fn slow_on(&self, text: &str) {
            self.slow.lock().unwrap().insert(text.to_string());
        }

        pub fn fail_on(&self, text: &str) {
            self.failing.lock().unwrap().insert(text.to_string());
        }

        pub fn heal(&self) {
            self.failing.lock().unwrap().clear();
        }

        pub fn sent(&self) -> Vec<(i64, String)> {
            self.sent.lock().unwrap().clone()
        }

        pub fn replies(&self) -> Vec<String> {
            self.replies
                .lock()
                .unwrap()
                .iter()
                .map(|(_, t)| t.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Messenger for FakeMessenger {
        async fn send(&self, chat_id: i64, text: &str) -> std::result::Result<(), Error> {
            let slow = self.slow.lock().unwrap().contains(text);
            if slow {
                tokio::time::sleep(SLOW_SEND).await;
            }
            if self.failing.lock().unwrap().contains(text) {
                return Err(Error::Telegram("forbidden".to_string()));
            }
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }

        async fn reply(&self, to: &InboundMessage, text: &str) -> std::result::Result<(), Error> {
            self.replies
                .lock()
                .unwrap()
                .push((to.message_id, text.to_string()));
            Ok(())
        }
    }

    pub(crate) fn hub_with(dir: &TempDir, options: HubOptions) -> (Arc<Hub>, Arc<FakeMessenger>) {
        let messenger = Arc::new(FakeMessenger::default());
        let store = Store::acquire(dir.path()).unwrap();
        let hub = Hub::new(store, messenger.clone(), options).unwrap();
        (Arc::new(hub), messenger)
    }

    pub(crate) fn private(sender: &str, chat_id: i64, text: &str) -> InboundMessage {
        InboundMessage {
            sender: sender.to_string(),
            chat_id,
            message_id: 1,
            is_group: false,
            text: text.to_string(),
        }
    }

    fn queues_on_disk(dir: &TempDir) -> serde_json::Value {
        let content = std::fs::read_to_string(dir.path().join(crate::store::QUEUES_FILE)).unwrap();
        serde_json::from_str(&content).unwrap()
    }

    #[tokio::test]
    async fn unseen_user_is_queued_then_flushed_on_first_message() {
        let dir = TempDir::new().unwrap();
        let (hub, messenger) = hub_with(&dir, HubOptions::default());

        let delivery = hub.deliver_or_queue("alice", "hi").await.unwrap();
        assert_eq!(delivery, Delivery::Queued);
        assert_eq!(queues_on_disk(&dir), serde_json::json!({"alice": ["hi"]}));

        hub.handle_message(private("alice", 100, "hello")).await;

        assert_eq!(messenger.sent(), vec![(100, "hi".to_string())]);
        assert_eq!(queues_on_disk(&dir), serde_json::json!({"alice": []}));
        assert_eq!(hub.state().await.store.chat_id("alice"), Some(100));
    }

    #[tokio::test]
    async fn known_user_gets_message_directly() {
        let dir = TempDir::new().unwrap();
        let (hub, messenger) = hub_with(&dir, HubOptions::default());
        hub.handle_message(private("bob", 7, "/help")).await;

        let delivery = hub.deliver_or_queue("bob", "ping").await.unwrap();

        assert_eq!(delivery, Delivery::Sent);
        assert_eq!(messenger.sent(), vec![(7, "ping".to_string())]);
    }

    #[tokio::test]
    async fn failed_send_is_queued() {
        let dir = TempDir::new().unwrap();
        let (hub, messenger) = hub_with(&dir, HubOptions::default());
        hub.handle_message(private("bob", 7, "/help")).await;
        messenger.fail_on("ping");

        let delivery = hub.deliver_or_queue("bob", "ping").await.unwrap();

        assert_eq!(delivery, Delivery::Queued);
        assert_eq!(hub.state().await.store.queue("bob"), &["ping"]);
    }

    #[tokio::test]
    async fn flush_keeps_failed_entries_in_order() {
        let dir = TempDir::new().unwrap();
        let (hub, messenger) = hub_with(&dir, HubOptions::default());
        for text in ["a", "b", "c", "d"] {
            hub.deliver_or_queue("alice", text).await.unwrap();
        }
        messenger.fail_on("b");
        messenger.fail_on("d");

        hub.handle_message(private("alice", 1, "hi")).await;

        assert_eq!(
            messenger.sent(),
            vec![(1, "a".to_string()), (1, "c".to_string())]
        );
        assert_eq!(hub.state().await.store.queue("alice"), &["b", "d"]);

        // New text waits behind the backlog while it is still undeliverable.
        let delivery = hub.deliver_or_queue("alice", "e").await.unwrap();
        assert_eq!(delivery, Delivery::Queued);
        assert_eq!(hub.state().await.store.queue("alice"), &["b", "d", "e"]);

        messenger.heal();
        assert_eq!(hub.flush("alice").await, 3);
        assert_eq!(
            messenger.sent()[2..],
            [
                (1, "b".to_string()),
                (1, "d".to_string()),
                (1, "e".to_string())
            ]
        );
        assert!(hub.state().await.store.queue("alice").is_empty());
    }

    #[tokio::test]
    async fn chat_change_triggers_flush_but_same_chat_does_not() {
        let dir = TempDir::new().unwrap();
        let (hub, messenger) = hub_with(&dir, HubOptions::default());
        hub.handle_message(private("alice", 1, "hi")).await;
        messenger.fail_on("later");
        hub.deliver_or_queue("alice", "later").await.unwrap();
        messenger.heal();

        hub.handle_message(private("alice", 1, "hi again")).await;
        assert!(messenger.sent().is_empty());

        hub.handle_message(private("alice", 2, "new phone")).await;
        assert_eq!(messenger.sent(), vec![(2, "later".to_string())]);
    }

    #[tokio::test]
    async fn configured_aliases_share_one_user() {
        let dir = TempDir::new().unwrap();
        let mut options = HubOptions::default();
        options.aliases.insert(
            "lmegyesi".to_string(),
            vec!["megyesilaszlo".to_string(), "laszlomegyesi".to_string()],
        );
        let (hub, messenger) = hub_with(&dir, options);

        hub.deliver_or_queue("laszlomegyesi", "via alias").await.unwrap();
        hub.handle_message(private("lmegyesi", 5, "hi")).await;

        assert_eq!(messenger.sent(), vec![(5, "via alias".to_string())]);
        assert_eq!(hub.deliver_or_queue("megyesilaszlo", "x").await.unwrap(), Delivery::Sent);
    }

    #[tokio::test]
    async fn alias_queue_is_delivered_before_newer_canonical_entries() {
        let dir = TempDir::new().unwrap();
        let mut options = HubOptions::default();
        options
            .aliases
            .insert("lm".to_string(), vec!["laszlo".to_string()]);
        let (hub, messenger) = hub_with(&dir, options);

        hub.deliver_or_queue("laszlo", "first").await.unwrap();
        hub.deliver_or_queue("lm", "second").await.unwrap();
        hub.handle_message(private("lm", 5, "hi")).await;

        assert_eq!(
            messenger.sent(),
            vec![(5, "first".to_string()), (5, "second".to_string())]
        );
    }

    #[tokio::test]
    async fn delivery_during_flush_waits_behind_backlog() {
        let dir = TempDir::new().unwrap();
        let (hub, messenger) = hub_with(&dir, HubOptions::default());
        hub.deliver_or_queue("alice", "old1").await.unwrap();
        hub.deliver_or_queue("alice", "old2").await.unwrap();
        messenger.slow_on("old1");
        messenger.slow_on("old2");

        let flushing = tokio::spawn({
            let hub = Arc::clone(&hub);
            async move { hub.handle_message(private("alice", 1, "hi")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let delivery = hub.deliver_or_queue("alice", "new").await.unwrap();
        flushing.await.unwrap();

        assert_eq!(delivery, Delivery::Queued);
        assert_eq!(
            messenger.sent(),
            vec![
                (1, "old1".to_string()),
                (1, "old2".to_string()),
                (1, "new".to_string())
            ]
        );
        assert!(hub.state().await.store.queue("alice").is_empty());
        assert!(hub.state().await.in_flight.is_empty());
    }

    #[tokio::test]
    async fn delivery_during_direct_send_follows_it() {
        let dir = TempDir::new().unwrap();
        let (hub, messenger) = hub_with(&dir, HubOptions::default());
        hub.handle_message(private("alice", 1, "hi")).await;
        messenger.slow_on("first");

        let first = tokio::spawn({
            let hub = Arc::clone(&hub);
            async move { hub.deliver_or_queue("alice", "first").await.unwrap() }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = hub.deliver_or_queue("alice", "second").await.unwrap();
        let first = first.await.unwrap();

        assert_eq!(first, Delivery::Sent);
        assert_eq!(second, Delivery::Queued);
        assert_eq!(
            messenger.sent(),
            vec![(1, "first".to_string()), (1, "second".to_string())]
        );
        assert!(hub.state().await.store.queue("alice").is_empty());
    }

    #[tokio::test]
    async fn failed_direct_send_stays_ahead_of_later_deliveries() {
        let dir = TempDir::new().unwrap();
        let (hub, messenger) = hub_with(&dir, HubOptions::default());
        hub.handle_message(private("alice", 1, "hi")).await;
        messenger.slow_on("first");
        messenger.fail_on("first");

        let first = tokio::spawn({
            let hub = Arc::clone(&hub);
            async move { hub.deliver_or_queue("alice", "first").await.unwrap() }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        hub.deliver_or_queue("alice", "second").await.unwrap();

        assert_eq!(first.await.unwrap(), Delivery::Queued);
        assert_eq!(hub.state().await.store.queue("alice"), &["first", "second"]);
    }

    #[tokio::test]
    async fn writing_from_an_alias_resolves_to_canonical_user() {
        let dir = TempDir::new().unwrap();
        let mut options = HubOptions::default();
        options
            .aliases
            .insert("ops".to_string(), vec!["ops-oncall".to_string()]);
        let (hub, _) = hub_with(&dir, options);

        hub.handle_message(private("ops-oncall", 9, "hi")).await;

        let state = hub.state().await;
        assert_eq!(state.store.users().len(), 1);
        assert_eq!(state.store.users()[0].name, "ops");
        assert_eq!(state.store.chat_id("ops"), Some(9));
    }

    #[tokio::test]
    async fn group_and_empty_messages_are_ignored() {
        let dir = TempDir::new().unwrap();
        let (hub, messenger) = hub_with(&dir, HubOptions::default());

        let mut group = private("mallory", -100, "/run box rm");
        group.is_group = true;
        hub.handle_message(group).await;
        hub.handle_message(private("mallory", 3, "   ")).await;

        assert!(messenger.replies().is_empty());
        assert!(hub.state().await.store.users().is_empty());
    }

    #[tokio::test]
    async fn help_usage_and_unknown_agent_replies() {
        let dir = TempDir::new().unwrap();
        let (hub, messenger) = hub_with(&dir, HubOptions::default());
        hub.register_agent("zeta", "http://127.0.0.1:9").await;
        hub.register_agent("alpha", "http://127.0.0.1:9").await;

        hub.handle_message(private("alice", 1, "/help")).await;
        hub.handle_message(private("alice", 1, "/run")).await;
        hub.handle_message(private("alice", 1, "just chatting")).await;
        hub.handle_message(private("alice", 1, "/run nowhere")).await;

        assert_eq!(
            messenger.replies(),
            vec![
                HELP_TEXT.to_string(),
                USAGE_TEXT.to_string(),
                USAGE_TEXT.to_string(),
                "unknown agent \"nowhere\"; known agents: alpha, zeta".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn stale_agent_is_refused() {
        let dir = TempDir::new().unwrap();
        let options = HubOptions {
            stale_after: Duration::from_millis(50),
            ..HubOptions::default()
        };
        let (hub, messenger) = hub_with(&dir, options);
        hub.register_agent("old", "http://127.0.0.1:9").await;
        tokio::time::sleep(Duration::from_millis(120)).await;

        hub.handle_message(private("alice", 1, "/run old")).await;

        let replies = messenger.replies();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].starts_with("agent \"old\" has not registered"));
    }

    #[tokio::test]
    async fn transport_errors_are_replied() {
        let dir = TempDir::new().unwrap();
        let (hub, messenger) = hub_with(&dir, HubOptions::default());
        // Bind then drop to get a port with nothing listening.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        hub.register_agent("down", &format!("http://127.0.0.1:{}", port)).await;

        hub.handle_message(private("alice", 1, "/run down")).await;

        let replies = messenger.replies();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].contains(&format!("127.0.0.1:{}", port)), "{}", replies[0]);
    }

    #[tokio::test]
    async fn startup_flush_sends_to_known_users() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(crate::store::USERS_FILE),
            r#"[{"name":"alice","aliases":[],"last_chat_id":11},{"name":"bob"}]"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join(crate::store::QUEUES_FILE),
            r#"{"alice":["x","y"],"bob":["z"]}"#,
        )
        .unwrap();
        let (hub, messenger) = hub_with(&dir, HubOptions::default());
        hub.state().await.store.load().unwrap();

        hub.flush_all().await;

        assert_eq!(
            messenger.sent(),
            vec![(11, "x".to_string()), (11, "y".to_string())]
        );
        assert_eq!(
            queues_on_disk(&dir),
            serde_json::json!({"alice": [], "bob": ["z"]})
        );
    }

    #[tokio::test]
    async fn status_lists_users_then_queues() {
        let dir = TempDir::new().unwrap();
        let (hub, _messenger) = hub_with(&dir, HubOptions::default());
        hub.handle_message(private("alice", 4, "hi")).await;
        hub.deliver_or_queue("carol", "later").await.unwrap();

        let status = hub.status_text().await.unwrap();
        let mut lines = status.lines();

        let users: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        let queues: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(users[0]["name"], "alice");
        assert_eq!(users[0]["last_chat_id"], 4);
        assert_eq!(queues, serde_json::json!({"carol": ["later"]}));
    }
}
