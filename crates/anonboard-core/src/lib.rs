//! Anonboard Core
//!
//! Runtime orchestration: membership gate, admission pipeline, persistence,
//! and anonymous relay

mod platform;
mod relay;

pub use relay::{mention, Destinations, RelayGateway};

use anonboard_config::Config;
use anonboard_discord::{DiscordClient, DiscordGateway};
use anonboard_ipc::{Envelope, EventBus, MessageKind};
use anonboard_policy::{AdmissionOutcome, AdmissionPipeline, SenderId};
use anonboard_storage::Storage;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[async_trait::async_trait]
pub trait MembershipDirectory: Send + Sync {
    async fn is_member(&self, user_id: SenderId) -> Result<bool>;
}

/// Append-only store of accepted messages.
#[async_trait::async_trait]
pub trait MessageLog: Send + Sync {
    async fn append(&self, content: &str, sender: SenderId) -> Result<i64>;
}

#[async_trait::async_trait]
pub trait Messenger: Send + Sync {
    async fn send_direct(&self, user_id: SenderId, text: &str) -> Result<()>;
    async fn send_to_channel(&self, channel_id: u64, text: &str) -> Result<()>;
}

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Not a direct message, or the sender is not a member. Nothing recorded.
    Ignored,
    Rejected(AdmissionOutcome),
    Relayed { record_id: i64 },
}

pub struct Board {
    pipeline: Mutex<AdmissionPipeline>,
    directory: Arc<dyn MembershipDirectory>,
    log: Arc<dyn MessageLog>,
    messenger: Arc<dyn Messenger>,
    relay: RelayGateway,
}

impl Board {
    pub fn new(
        pipeline: AdmissionPipeline,
        directory: Arc<dyn MembershipDirectory>,
        log: Arc<dyn MessageLog>,
        messenger: Arc<dyn Messenger>,
        destinations: Destinations,
    ) -> Self {
        let relay = RelayGateway::new(Arc::clone(&messenger), destinations);
        Self {
            pipeline: Mutex::new(pipeline),
            directory,
            log,
            messenger,
            relay,
        }
    }

    pub async fn handle_envelope(&self, envelope: &Envelope) -> Result<Disposition> {
        if !envelope.is_direct() {
            return Ok(Disposition::Ignored);
        }

        match &envelope.kind {
            MessageKind::Message { from, text } => {
                self.handle_direct_message(*from, text, Utc::now()).await
            }
        }
    }

    pub async fn handle_direct_message(
        &self,
        sender: SenderId,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<Disposition> {
        match self.directory.is_member(sender).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(sender, "Ignoring direct message from non-member");
                return Ok(Disposition::Ignored);
            }
            Err(e) => {
                warn!(sender, "Membership lookup failed, dropping message: {:#}", e);
                return Ok(Disposition::Ignored);
            }
        }

        // evaluate() never suspends, so the cool-down read/modify/write is atomic.
        let outcome = self.pipeline.lock().await.evaluate(sender, text, now);

        if let Some(warning) = outcome.warning() {
            info!(sender, outcome = %outcome, "Rejected anonymous post");
            if let Err(e) = self.messenger.send_direct(sender, warning).await {
                warn!(sender, "Failed to deliver warning: {:#}", e);
            }
            self.relay.log_warning(sender, &outcome, text).await;
            return Ok(Disposition::Rejected(outcome));
        }

        let record_id = match self.log.append(text, sender).await {
            Ok(id) => id,
            Err(e) => {
                error!(sender, "Failed to persist accepted message, not relaying: {:#}", e);
                return Err(e.context("message log append failed"));
            }
        };

        self.relay.publish(text, sender).await;
        info!(record_id, "Relayed anonymous post");
        Ok(Disposition::Relayed { record_id })
    }

    pub async fn tracked_senders(&self) -> usize {
        self.pipeline.lock().await.rate_limiter().tracked_senders()
    }
}

pub struct BoardRuntime {
    config: Config,
    storage: Arc<Mutex<Storage>>,
    event_bus: EventBus,
}

impl BoardRuntime {
    pub fn new(config: Config, storage: Storage) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            storage: Arc::new(Mutex::new(storage)),
            event_bus: EventBus::new(),
        })
    }

    pub async fn run(&self) -> Result<()> {
        let discord = &self.config.discord;
        let token = discord
            .resolved_token()
            .ok_or_else(|| anyhow!("no Discord bot token configured"))?;

        let client = Arc::new(
            DiscordClient::new(&token, &discord.api_base, discord.guild_id)
                .context("failed to create Discord client")?,
        );
        let board = Arc::new(Board::new(
            AdmissionPipeline::from_config(&self.config.gate),
            client.clone(),
            self.storage.clone(),
            client,
            Destinations::from(discord),
        ));

        // Subscribe before the gateway starts publishing.
        let inbound_rx = self.event_bus.subscribe();
        let gateway = DiscordGateway::new(&token, &discord.gateway_url)
            .with_event_bus(self.event_bus.clone());
        let mut gateway_task = tokio::spawn(async move { gateway.run().await });

        info!(
            guild_id = discord.guild_id,
            cooldown_secs = self.config.gate.cooldown_secs,
            max_in_window = self.config.gate.max_in_window,
            "Anonboard runtime started"
        );

        let result = tokio::select! {
            _ = Self::process_inbound(board, inbound_rx, self.config.gate.max_concurrency) => {
                info!("Event bus closed, stopping runtime");
                Ok(())
            }
            joined = &mut gateway_task => match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow!("gateway task failed: {}", e)),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                Ok(())
            }
        };

        gateway_task.abort();
        result
    }

    /// Dispatches each inbound envelope to its own task. Messages from the
    /// same sender are processed one at a time; at most `max_concurrency`
    /// messages are in flight overall. Returns once the bus closes and all
    /// in-flight work has finished.
    pub async fn process_inbound(
        board: Arc<Board>,
        mut inbound_rx: broadcast::Receiver<Envelope>,
        max_concurrency: usize,
    ) {
        let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
        let sender_locks: Arc<Mutex<HashMap<SenderId, Arc<Mutex<()>>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let mut workers = JoinSet::new();

        loop {
            tokio::select! {
                result = inbound_rx.recv() => {
                    match result {
                        Ok(envelope) => {
                            let board = Arc::clone(&board);
                            let semaphore = Arc::clone(&semaphore);
                            let sender_locks = Arc::clone(&sender_locks);

                            workers.spawn(async move {
                                Self::handle_inbound(board, semaphore, sender_locks, envelope)
                                    .await;
                            });
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("Event bus closed, stopping message processor");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Event bus lagged by {} messages", n);
                        }
                    }
                }
                Some(_) = workers.join_next(), if !workers.is_empty() => {}
            }
        }

        while workers.join_next().await.is_some() {}
    }

    /// Waits for the sender's turn before taking a concurrency permit, so a
    /// backlog from one sender never holds permits other senders could use.
    async fn handle_inbound(
        board: Arc<Board>,
        semaphore: Arc<Semaphore>,
        sender_locks: Arc<Mutex<HashMap<SenderId, Arc<Mutex<()>>>>>,
        envelope: Envelope,
    ) {
        let trace_id = envelope.trace_id.clone();
        let sender_lock = Self::get_or_create_sender_lock(&sender_locks, envelope.sender()).await;
        let _sender_guard = sender_lock.lock_owned().await;

        let _permit = match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            Err(err) => {
                error!(
                    "Inbound worker semaphore closed (trace_id={}): {}",
                    trace_id, err
                );
                return;
            }
        };

        match board.handle_envelope(&envelope).await {
            Ok(disposition) => {
                debug!(trace_id = %trace_id, ?disposition, "Inbound message handled");
            }
            Err(e) => {
                error!(
                    "Error processing inbound message (trace_id={}): {:#}",
                    trace_id, e
                );
            }
        }
    }

    async fn get_or_create_sender_lock(
        sender_locks: &Arc<Mutex<HashMap<SenderId, Arc<Mutex<()>>>>>,
        sender: SenderId,
    ) -> Arc<Mutex<()>> {
        let mut locks = sender_locks.lock().await;
        // Entries only the map still references belong to finished senders.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(sender).or_insert_with(|| Arc::new(Mutex::new(()))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anonboard_config::GateConfig;
    use chrono::{Duration, TimeZone};
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    const PUBLIC: u64 = 1165550084394602497;
    const AUDIT: u64 = 995853282838847528;
    const WARNINGS: u64 = 1159370416779960412;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Sent {
        Direct(u64, String),
        Channel(u64, String),
    }

    struct FakeDirectory {
        members: HashSet<u64>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl MembershipDirectory for FakeDirectory {
        async fn is_member(&self, user_id: u64) -> Result<bool> {
            if self.fail {
                anyhow::bail!("guild unavailable");
            }
            Ok(self.members.contains(&user_id))
        }
    }

    #[derive(Default)]
    struct FakeLog {
        rows: StdMutex<Vec<(String, u64)>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl MessageLog for FakeLog {
        async fn append(&self, content: &str, sender: u64) -> Result<i64> {
            if self.fail {
                anyhow::bail!("disk full");
            }
            let mut rows = self.rows.lock().expect("rows");
            rows.push((content.to_string(), sender));
            Ok(rows.len() as i64)
        }
    }

    #[derive(Default)]
    struct FakeMessenger {
        sent: StdMutex<Vec<Sent>>,
        broken_channels: HashSet<u64>,
    }

    #[async_trait::async_trait]
    impl Messenger for FakeMessenger {
        async fn send_direct(&self, user_id: u64, text: &str) -> Result<()> {
            self.sent
                .lock()
                .expect("sent")
                .push(Sent::Direct(user_id, text.to_string()));
            Ok(())
        }

        async fn send_to_channel(&self, channel_id: u64, text: &str) -> Result<()> {
            if self.broken_channels.contains(&channel_id) {
                anyhow::bail!("unknown channel {}", channel_id);
            }
            self.sent
                .lock()
                .expect("sent")
                .push(Sent::Channel(channel_id, text.to_string()));
            Ok(())
        }
    }

    struct Harness {
        board: Board,
        log: Arc<FakeLog>,
        messenger: Arc<FakeMessenger>,
    }

    impl Harness {
        fn sent(&self) -> Vec<Sent> {
            self.messenger.sent.lock().expect("sent").clone()
        }

        fn rows(&self) -> Vec<(String, u64)> {
            self.log.rows.lock().expect("rows").clone()
        }
    }

    fn harness_with(
        members: &[u64],
        directory_fails: bool,
        log: FakeLog,
        messenger: FakeMessenger,
    ) -> Harness {
        let directory = Arc::new(FakeDirectory {
            members: members.iter().copied().collect(),
            fail: directory_fails,
        });
        let log = Arc::new(log);
        let messenger = Arc::new(messenger);
        let board = Board::new(
            AdmissionPipeline::from_config(&GateConfig::default()),
            directory,
            log.clone(),
            messenger.clone(),
            Destinations {
                public_channel: PUBLIC,
                audit_channel: AUDIT,
                warning_channel: WARNINGS,
            },
        );
        Harness {
            board,
            log,
            messenger,
        }
    }

    fn harness(members: &[u64]) -> Harness {
        harness_with(members, false, FakeLog::default(), FakeMessenger::default())
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).single().expect("base time") + Duration::seconds(secs)
    }

    #[tokio::test]
    async fn member_message_is_persisted_and_relayed_anonymously() {
        let h = harness(&[1]);
        let disposition = h
            .board
            .handle_direct_message(1, "hello", at(0))
            .await
            .expect("handled");

        assert_eq!(disposition, Disposition::Relayed { record_id: 1 });
        assert_eq!(h.rows(), vec![("hello".to_string(), 1)]);
        assert_eq!(
            h.sent(),
            vec![
                Sent::Channel(PUBLIC, "hello".to_string()),
                Sent::Channel(AUDIT, "<@1>: hello".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn second_message_inside_cooldown_is_warned_not_relayed() {
        let h = harness(&[1]);
        h.board
            .handle_direct_message(1, "hello", at(0))
            .await
            .expect("first");
        let disposition = h
            .board
            .handle_direct_message(1, "hello again", at(2))
            .await
            .expect("second");

        assert_eq!(
            disposition,
            Disposition::Rejected(AdmissionOutcome::RejectedRateTooFast)
        );
        assert_eq!(h.rows().len(), 1);

        let sent = h.sent();
        assert_eq!(sent.len(), 4);
        match &sent[2] {
            Sent::Direct(user, text) => {
                assert_eq!(*user, 1);
                assert!(text.contains("too short"));
            }
            other => panic!("expected warning DM, got {:?}", other),
        }
        assert_eq!(
            sent[3],
            Sent::Channel(
                WARNINGS,
                "Warning sent: <@1> - interval too short: hello again".to_string()
            )
        );
    }

    #[tokio::test]
    async fn non_member_is_ignored_without_state_change() {
        let h = harness(&[1]);
        let disposition = h
            .board
            .handle_direct_message(2, "anything https://x.example", at(0))
            .await
            .expect("handled");

        assert_eq!(disposition, Disposition::Ignored);
        assert!(h.rows().is_empty());
        assert!(h.sent().is_empty());
        assert_eq!(h.board.tracked_senders().await, 0);
    }

    #[tokio::test]
    async fn membership_lookup_failure_drops_silently() {
        let h = harness_with(&[1], true, FakeLog::default(), FakeMessenger::default());
        let disposition = h
            .board
            .handle_direct_message(1, "hello", at(0))
            .await
            .expect("handled");
        assert_eq!(disposition, Disposition::Ignored);
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn url_rejection_logs_warning_with_content() {
        let h = harness(&[1]);
        let disposition = h
            .board
            .handle_direct_message(1, "see http://example.com", at(0))
            .await
            .expect("handled");

        assert_eq!(
            disposition,
            Disposition::Rejected(AdmissionOutcome::RejectedContainsUrl)
        );
        assert!(h.rows().is_empty());
        assert!(h.sent().contains(&Sent::Channel(
            WARNINGS,
            "Warning sent: <@1> - message contains a URL: see http://example.com".to_string()
        )));
        assert!(!h
            .sent()
            .iter()
            .any(|s| matches!(s, Sent::Channel(PUBLIC, _))));
    }

    #[tokio::test]
    async fn forbidden_term_warning_does_not_name_term() {
        let h = harness(&[1]);
        let disposition = h
            .board
            .handle_direct_message(1, "死ね", at(0))
            .await
            .expect("handled");
        assert_eq!(
            disposition,
            Disposition::Rejected(AdmissionOutcome::RejectedForbiddenTerm("死ね".to_string()))
        );
        let warning = h
            .sent()
            .into_iter()
            .find_map(|s| match s {
                Sent::Direct(_, text) => Some(text),
                _ => None,
            })
            .expect("warning DM");
        assert!(!warning.contains("死ね"));
        assert!(h.sent().contains(&Sent::Channel(
            WARNINGS,
            "Warning sent: <@1> - forbidden term: 死ね".to_string()
        )));
        assert!(!h
            .sent()
            .iter()
            .any(|s| matches!(s, Sent::Channel(PUBLIC, _))));
        assert!(h.rows().is_empty());
    }

    #[tokio::test]
    async fn window_cap_warns_fifth_sender_and_logs_it() {
        let h = harness(&[1, 2, 3, 4, 5]);
        for sender in 1..=4 {
            let disposition = h
                .board
                .handle_direct_message(sender, "hi", at(0))
                .await
                .expect("handled");
            assert!(matches!(disposition, Disposition::Relayed { .. }));
        }

        let disposition = h
            .board
            .handle_direct_message(5, "me too", at(1))
            .await
            .expect("handled");
        assert_eq!(
            disposition,
            Disposition::Rejected(AdmissionOutcome::RejectedTooManyInWindow)
        );
        assert_eq!(h.rows().len(), 4);

        let sent = h.sent();
        let tail = &sent[sent.len() - 2..];
        match &tail[0] {
            Sent::Direct(user, text) => {
                assert_eq!(*user, 5);
                assert!(text.contains("too many messages"));
            }
            other => panic!("expected warning DM, got {:?}", other),
        }
        assert_eq!(
            tail[1],
            Sent::Channel(
                WARNINGS,
                "Warning sent: <@5> - too many messages in window: me too".to_string()
            )
        );
        assert!(!sent.contains(&Sent::Channel(PUBLIC, "me too".to_string())));
    }

    #[tokio::test]
    async fn public_relay_failure_keeps_record_and_still_audits() {
        let messenger = FakeMessenger {
            broken_channels: [PUBLIC].into_iter().collect(),
            ..FakeMessenger::default()
        };
        let h = harness_with(&[1], false, FakeLog::default(), messenger);
        let disposition = h
            .board
            .handle_direct_message(1, "hello", at(0))
            .await
            .expect("handled");

        assert_eq!(disposition, Disposition::Relayed { record_id: 1 });
        assert_eq!(h.rows().len(), 1);
        assert_eq!(
            h.sent(),
            vec![Sent::Channel(AUDIT, "<@1>: hello".to_string())]
        );
    }

    #[tokio::test]
    async fn persistence_failure_blocks_relay() {
        let log = FakeLog {
            fail: true,
            ..FakeLog::default()
        };
        let h = harness_with(&[1], false, log, FakeMessenger::default());
        let result = h.board.handle_direct_message(1, "hello", at(0)).await;
        assert!(result.is_err());
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn guild_envelope_is_ignored() {
        let h = harness(&[1]);
        let envelope = Envelope::new(
            "discord",
            MessageKind::Message {
                from: 1,
                text: "in a channel".to_string(),
            },
        )
        .with_guild_id(983702974792613969);
        let disposition = h.board.handle_envelope(&envelope).await.expect("handled");
        assert_eq!(disposition, Disposition::Ignored);
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn process_inbound_drains_bus_and_applies_cooldown() {
        let h = harness(&[1, 2]);
        let board = Arc::new(h.board);
        let bus = EventBus::new();
        let rx = bus.subscribe();

        let dm = |from: u64, text: &str| {
            Envelope::new(
                "discord",
                MessageKind::Message {
                    from,
                    text: text.to_string(),
                },
            )
        };
        bus.publish(dm(1, "first")).expect("publish");
        bus.publish(dm(1, "second")).expect("publish");
        bus.publish(dm(2, "other member")).expect("publish");
        bus.publish(dm(3, "stranger")).expect("publish");
        drop(bus);

        BoardRuntime::process_inbound(Arc::clone(&board), rx, 4).await;

        let rows = h.log.rows.lock().expect("rows").clone();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.iter().filter(|(_, sender)| *sender == 1).count(), 1);
        assert!(rows.contains(&("other member".to_string(), 2)));

        let warnings = h
            .messenger
            .sent
            .lock()
            .expect("sent")
            .iter()
            .filter(|s| matches!(s, Sent::Direct(1, _)))
            .count();
        assert_eq!(warnings, 1);
        assert_eq!(board.tracked_senders().await, 2);
    }

    /// Records the order in which lookups start and holds each one briefly.
    struct SlowDirectory {
        started: StdMutex<Vec<u64>>,
    }

    #[async_trait::async_trait]
    impl MembershipDirectory for SlowDirectory {
        async fn is_member(&self, user_id: u64) -> Result<bool> {
            self.started.lock().expect("started").push(user_id);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(true)
        }
    }

    #[tokio::test]
    async fn backlog_from_one_sender_does_not_hold_up_others() {
        let directory = Arc::new(SlowDirectory {
            started: StdMutex::new(Vec::new()),
        });
        let board = Arc::new(Board::new(
            AdmissionPipeline::from_config(&GateConfig::default()),
            directory.clone(),
            Arc::new(FakeLog::default()),
            Arc::new(FakeMessenger::default()),
            Destinations {
                public_channel: PUBLIC,
                audit_channel: AUDIT,
                warning_channel: WARNINGS,
            },
        ));

        let bus = EventBus::new();
        let rx = bus.subscribe();
        let dm = |from: u64| {
            Envelope::new(
                "discord",
                MessageKind::Message {
                    from,
                    text: "burst".to_string(),
                },
            )
        };
        for _ in 0..10 {
            bus.publish(dm(1)).expect("publish");
        }
        bus.publish(dm(2)).expect("publish");
        drop(bus);

        BoardRuntime::process_inbound(board, rx, 4).await;

        let started = directory.started.lock().expect("started").clone();
        assert_eq!(started.len(), 11);
        let second_sender_at = started
            .iter()
            .position(|sender| *sender == 2)
            .expect("second sender handled");
        assert!(
            second_sender_at <= 1,
            "second sender waited behind the backlog: {:?}",
            started
        );
    }

    #[tokio::test]
    async fn sender_locks_are_pruned_once_released() {
        let locks: Arc<Mutex<HashMap<SenderId, Arc<Mutex<()>>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let first = BoardRuntime::get_or_create_sender_lock(&locks, 1).await;
        let again = BoardRuntime::get_or_create_sender_lock(&locks, 1).await;
        assert!(Arc::ptr_eq(&first, &again));
        drop(first);
        drop(again);

        let _other = BoardRuntime::get_or_create_sender_lock(&locks, 2).await;
        let map = locks.lock().await;
        assert_eq!(map.len(), 1);
        assert!(map.contains_key(&2));
    }
}
