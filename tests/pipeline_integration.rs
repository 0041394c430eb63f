//! Integration tests for the forwarding pipeline.
//!
//! Each test starts a real `Forwarder` against a recording sender and drives
//! it through `on_event`, the backlog scans and shutdown. Time is paused, so
//! album and deferral timers fire as soon as the runtime goes idle.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::timeout;

use relay_forward::channels::CachedAuthorDirectory;
use relay_forward::config::ForwarderConfig;
use relay_forward::error::{ChannelError, PipelineError};
use relay_forward::pipeline::deferral::Readiness;
use relay_forward::pipeline::types::{
    AuthorInfo, ChatId, ContentKind, Delivery, EventKey, ForwardPayload, MediaAttachment,
    MessageId,
};
use relay_forward::pipeline::{
    DefaultPayloadBuilder, DispatchUnit, FilterRejection, Forwarder, ForwarderDeps,
    HistorySource, InboundMessage, ItemOutcome, MessageSender, OutcomeEvent, Rule,
    ShutdownMode, ShutdownReport, Triage,
};
use relay_forward::store::{LastSeenIds, RuleBook};

const SOURCE: ChatId = -100;
const DESTINATION: ChatId = -200;

/// Upper bound on waiting for the next outcome. Virtual time under a paused clock.
const OUTCOME_TIMEOUT: Duration = Duration::from_secs(30);

/// Sender stub that records payloads and can fail or panic on chosen messages.
#[derive(Default)]
struct RecordingSender {
    sent: Mutex<Vec<ForwardPayload>>,
    fail_on: Mutex<HashSet<MessageId>>,
    panic_on: Mutex<HashSet<MessageId>>,
    next_id: AtomicI64,
}

impl RecordingSender {
    fn fail_on(&self, id: MessageId) {
        self.fail_on.lock().unwrap().insert(id);
    }

    fn panic_on(&self, id: MessageId) {
        self.panic_on.lock().unwrap().insert(id);
    }

    fn sent(&self) -> Vec<ForwardPayload> {
        self.sent.lock().unwrap().clone()
    }

    /// Source message ids of every sent item, in send order.
    fn sent_ids(&self) -> Vec<MessageId> {
        self.sent()
            .iter()
            .flat_map(|p| p.items.iter().map(|i| i.source_message_id))
            .collect()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, _rule: &Rule, payload: ForwardPayload) -> Result<Delivery, ChannelError> {
        let ids: Vec<MessageId> = payload.items.iter().map(|i| i.source_message_id).collect();
        if ids.iter().any(|id| self.panic_on.lock().unwrap().contains(id)) {
            panic!("sender blew up on {ids:?}");
        }
        if ids.iter().any(|id| self.fail_on.lock().unwrap().contains(id)) {
            return Err(ChannelError::SendFailed {
                name: "stub".into(),
                reason: "destination unavailable".into(),
            });
        }
        self.sent.lock().unwrap().push(payload);
        Ok(Delivery {
            message_id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1000,
        })
    }
}

struct Harness {
    forwarder: Forwarder,
    sender: Arc<RecordingSender>,
    rules: Arc<RuleBook>,
    directory: Arc<CachedAuthorDirectory>,
    last_seen: Arc<LastSeenIds>,
    outcomes: broadcast::Receiver<OutcomeEvent>,
}

impl Harness {
    async fn next(&mut self) -> OutcomeEvent {
        timeout(OUTCOME_TIMEOUT, self.outcomes.recv())
            .await
            .expect("timed out waiting for an outcome")
            .expect("outcome channel closed")
    }

    /// `true` if nothing else comes out of the pipeline within the timeout.
    async fn quiet(&mut self) -> bool {
        timeout(OUTCOME_TIMEOUT, self.outcomes.recv()).await.is_err()
    }
}

fn fast_config() -> ForwarderConfig {
    ForwarderConfig {
        sequential_delay: Duration::ZERO,
        antispam_delay: Duration::ZERO,
        ..ForwarderConfig::default()
    }
}

fn start(config: ForwarderConfig, rule: Rule) -> Harness {
    let sender = Arc::new(RecordingSender::default());
    let rules = Arc::new(RuleBook::from_rules([(SOURCE, rule)]));
    let directory = Arc::new(CachedAuthorDirectory::new());
    let last_seen = Arc::new(LastSeenIds::new());
    let deps = ForwarderDeps {
        rules: rules.clone(),
        authors: directory.clone(),
        sender: sender.clone(),
        payloads: Arc::new(DefaultPayloadBuilder::with_authors(directory.clone())),
        last_seen: last_seen.clone(),
    };
    let forwarder = Forwarder::start(config, deps).expect("valid config");
    let outcomes = forwarder.subscribe();
    Harness {
        forwarder,
        sender,
        rules,
        directory,
        last_seen,
        outcomes,
    }
}

fn text(id: MessageId, body: &str) -> InboundMessage {
    InboundMessage::text(SOURCE, id, body)
}

fn photo(id: MessageId, file_id: Option<&str>) -> InboundMessage {
    InboundMessage::text(SOURCE, id, "").with_media(MediaAttachment {
        kind: ContentKind::Photo,
        file_id: file_id.map(String::from),
        file_name: None,
    })
}

fn is_sent(event: &OutcomeEvent) -> bool {
    matches!(event.outcome, ItemOutcome::Sent { .. })
}

// ── Live events ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn forwards_in_arrival_order() {
    let mut h = start(fast_config(), Rule::to(DESTINATION));

    for (id, body) in [(1, "one"), (2, "two"), (3, "three")] {
        assert_eq!(h.forwarder.on_event(text(id, body)).await, Triage::Queued);
    }
    for _ in 0..3 {
        assert!(is_sent(&h.next().await));
    }

    assert_eq!(h.sender.sent_ids(), vec![1, 2, 3]);
    let sent = h.sender.sent();
    assert_eq!(sent[0].destination, DESTINATION);
    assert_eq!(sent[0].items[0].text, "one");
    assert_eq!(h.last_seen.get(SOURCE), Some(3));
}

#[tokio::test(start_paused = true)]
async fn repeated_event_is_forwarded_once() {
    let mut h = start(fast_config(), Rule::to(DESTINATION));

    h.forwarder.on_event(text(7, "hello")).await;
    h.forwarder.on_event(text(7, "hello")).await;

    assert!(is_sent(&h.next().await));
    assert_eq!(h.next().await.outcome, ItemOutcome::Duplicate);
    assert_eq!(h.sender.sent().len(), 1);
    assert_eq!(h.forwarder.stats().duplicates, 1);
}

#[tokio::test(start_paused = true)]
async fn disabled_or_unknown_source_is_ignored() {
    let mut h = start(fast_config(), Rule::to(DESTINATION).disabled());

    assert_eq!(h.forwarder.on_event(text(1, "hi")).await, Triage::Ignored);
    let album_member = photo(2, Some("f")).with_group(9);
    assert_eq!(h.forwarder.on_event(album_member).await, Triage::Ignored);
    let elsewhere = InboundMessage::text(SOURCE - 1, 3, "hi");
    assert_eq!(h.forwarder.on_event(elsewhere).await, Triage::Ignored);

    assert_eq!(h.forwarder.pending_albums().await, 0);
    assert!(h.quiet().await);
    assert!(h.sender.sent().is_empty());
    assert_eq!(h.last_seen.get(SOURCE), None);
}

#[tokio::test(start_paused = true)]
async fn rule_disabled_after_triage_drops_item() {
    let mut h = start(fast_config(), Rule::to(DESTINATION));

    h.rules.set_enabled(SOURCE, false);
    let unit = DispatchUnit::single(text(1, "late"));
    h.forwarder.submit(unit).expect("queue open");

    assert_eq!(h.next().await.outcome, ItemOutcome::NoRule);
    assert!(h.sender.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn album_is_sent_as_one_unit() {
    let mut h = start(fast_config(), Rule::to(DESTINATION));

    let members = [
        photo(12, Some("c")).with_group(55),
        photo(10, Some("a")).with_group(55),
        photo(11, Some("b")).with_group(55),
    ];
    let mut triage = Vec::new();
    for member in members {
        triage.push(h.forwarder.on_event(member).await);
    }
    assert_eq!(triage[0], Triage::Buffered { new_group: true });
    assert_eq!(triage[1], Triage::Buffered { new_group: false });
    assert_eq!(h.forwarder.pending_albums().await, 1);

    let event = h.next().await;
    assert!(is_sent(&event));
    assert_eq!(h.sender.sent().len(), 1);
    assert_eq!(h.sender.sent_ids(), vec![10, 11, 12]);
    assert_eq!(h.forwarder.pending_albums().await, 0);
    assert_eq!(h.last_seen.get(SOURCE), Some(12));
}

#[tokio::test(start_paused = true)]
async fn keyword_filter_rejects_non_matching_text() {
    let mut h = start(fast_config(), Rule::to(DESTINATION).with_keyword("btc"));

    h.forwarder.on_event(text(1, "ETH pumps")).await;
    h.forwarder.on_event(text(2, "BTC pumps")).await;

    assert_eq!(
        h.next().await.outcome,
        ItemOutcome::Filtered(FilterRejection::Keyword)
    );
    assert!(is_sent(&h.next().await));
    assert_eq!(h.sender.sent_ids(), vec![2]);
}

#[tokio::test(start_paused = true)]
async fn global_keyword_pattern_comes_from_config() {
    let config = ForwarderConfig {
        global_keyword_pattern: "btc|eth".into(),
        ..fast_config()
    };
    let mut rule = Rule::to(DESTINATION);
    rule.use_global_pattern = true;
    let mut h = start(config, rule);

    h.forwarder.on_event(text(1, "doge pumps")).await;
    h.forwarder.on_event(text(2, "ETH pumps")).await;

    assert_eq!(
        h.next().await.outcome,
        ItemOutcome::Filtered(FilterRejection::Keyword)
    );
    assert!(is_sent(&h.next().await));
    assert_eq!(h.sender.sent_ids(), vec![2]);
}

// ── Deferral ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn incomplete_media_is_retried_once_after_timeout() {
    let mut h = start(fast_config(), Rule::to(DESTINATION));

    h.forwarder.on_event(photo(4, None)).await;

    let first = h.next().await;
    assert_eq!(
        first.outcome,
        ItemOutcome::Deferred(Readiness::IncompleteMedia)
    );
    assert_eq!(h.forwarder.pending_deferrals().await, 1);

    let retry = h.next().await;
    assert!(retry.retry);
    assert!(is_sent(&retry));
    assert_eq!(h.sender.sent_ids(), vec![4]);
    assert_eq!(h.forwarder.pending_deferrals().await, 0);

    assert!(h.quiet().await);
    assert_eq!(h.sender.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn fresh_event_supersedes_pending_deferral() {
    let mut h = start(fast_config(), Rule::to(DESTINATION));

    h.forwarder.on_event(photo(4, None)).await;
    assert!(matches!(h.next().await.outcome, ItemOutcome::Deferred(_)));

    h.forwarder.on_event(photo(4, Some("ready"))).await;
    let event = h.next().await;
    assert!(!event.retry);
    assert!(is_sent(&event));
    assert_eq!(h.forwarder.pending_deferrals().await, 0);

    assert!(h.quiet().await);
    let sent = h.sender.sent();
    assert_eq!(sent.len(), 1);
    let media = sent[0].items[0].media.as_ref().expect("photo");
    assert_eq!(media.file_id.as_deref(), Some("ready"));
}

#[tokio::test(start_paused = true)]
async fn partially_ready_album_is_deferred_whole() {
    let mut h = start(fast_config(), Rule::to(DESTINATION));

    h.forwarder.on_event(photo(11, None).with_group(5)).await;
    h.forwarder.on_event(photo(10, Some("a")).with_group(5)).await;

    let deferred = h.next().await;
    assert_eq!(
        deferred.outcome,
        ItemOutcome::Deferred(Readiness::IncompleteMedia)
    );
    assert_eq!(
        deferred.key,
        EventKey::Message {
            source_id: SOURCE,
            message_id: 10
        }
    );
    assert_eq!(h.forwarder.pending_deferrals().await, 1);
    assert!(h.sender.sent().is_empty());

    let retry = h.next().await;
    assert!(retry.retry);
    assert!(is_sent(&retry));
    assert_eq!(h.sender.sent().len(), 1);
    assert_eq!(h.sender.sent_ids(), vec![10, 11]);
    assert_eq!(h.forwarder.pending_deferrals().await, 0);
}

#[tokio::test(start_paused = true)]
async fn manual_release_retries_immediately() {
    let mut h = start(fast_config(), Rule::to(DESTINATION));

    h.forwarder.on_event(photo(8, None)).await;
    let deferred = h.next().await;
    assert!(h.forwarder.release_deferred(&deferred.key).await);

    let retry = h.next().await;
    assert!(retry.retry);
    assert!(is_sent(&retry));
    assert!(!h.forwarder.release_deferred(&deferred.key).await);
}

// ── Rate limiting and failures ──────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn same_author_is_rate_limited() {
    let config = ForwarderConfig {
        antispam_delay: Duration::from_secs(1),
        ..fast_config()
    };
    let mut h = start(config, Rule::to(DESTINATION));
    h.directory.remember(
        5,
        AuthorInfo {
            is_bot: false,
            handle: Some("spammer".into()),
            display_name: None,
        },
    );

    h.forwarder.on_event(text(1, "first").with_author(5)).await;
    h.forwarder.on_event(text(2, "second").with_author(5)).await;
    h.forwarder.on_event(text(3, "other").with_author(6)).await;

    assert!(is_sent(&h.next().await));
    assert_eq!(h.next().await.outcome, ItemOutcome::RateLimited);
    assert!(is_sent(&h.next().await));
    assert_eq!(h.sender.sent_ids(), vec![1, 3]);
}

#[tokio::test(start_paused = true)]
async fn deferred_retry_is_not_rate_limited() {
    let config = ForwarderConfig {
        antispam_delay: Duration::from_secs(10),
        ..fast_config()
    };
    let mut h = start(config, Rule::to(DESTINATION));

    h.forwarder.on_event(photo(4, None).with_author(7)).await;
    assert!(matches!(h.next().await.outcome, ItemOutcome::Deferred(_)));

    let retry = h.next().await;
    assert!(retry.retry);
    assert!(is_sent(&retry));
    assert_eq!(h.sender.sent_ids(), vec![4]);

    // The send itself starts the author's window.
    h.forwarder.on_event(text(5, "again").with_author(7)).await;
    assert_eq!(h.next().await.outcome, ItemOutcome::RateLimited);
    assert_eq!(h.sender.sent_ids(), vec![4]);
}

#[tokio::test(start_paused = true)]
async fn superseding_copy_is_not_rate_limited() {
    let config = ForwarderConfig {
        antispam_delay: Duration::from_secs(1),
        ..fast_config()
    };
    let mut h = start(config, Rule::to(DESTINATION));

    h.forwarder.on_event(photo(4, None).with_author(7)).await;
    assert!(matches!(h.next().await.outcome, ItemOutcome::Deferred(_)));

    h.forwarder
        .on_event(photo(4, Some("ready")).with_author(7))
        .await;
    let event = h.next().await;
    assert!(!event.retry);
    assert!(is_sent(&event));
    assert_eq!(h.forwarder.pending_deferrals().await, 0);
    assert_eq!(h.sender.sent_ids(), vec![4]);
}

#[tokio::test(start_paused = true)]
async fn panic_in_sender_does_not_stop_worker() {
    let mut h = start(fast_config(), Rule::to(DESTINATION));
    h.sender.panic_on(1);

    h.forwarder.on_event(text(1, "boom")).await;
    h.forwarder.on_event(text(2, "fine")).await;

    assert_eq!(h.next().await.outcome, ItemOutcome::Panicked);
    assert!(is_sent(&h.next().await));
    assert_eq!(h.sender.sent_ids(), vec![2]);
    assert_eq!(h.forwarder.stats().panics, 1);
}

#[tokio::test(start_paused = true)]
async fn failed_send_is_not_requeued() {
    let mut h = start(fast_config(), Rule::to(DESTINATION));
    h.sender.fail_on(1);

    h.forwarder.on_event(text(1, "lost")).await;
    assert!(matches!(h.next().await.outcome, ItemOutcome::SendFailed(_)));
    assert!(h.quiet().await);

    h.forwarder.on_event(text(1, "lost")).await;
    assert_eq!(h.next().await.outcome, ItemOutcome::Duplicate);

    assert!(h.sender.sent().is_empty());
    assert_eq!(h.last_seen.get(SOURCE), None);
    assert_eq!(h.forwarder.stats().send_failures, 1);
}

// ── Shutdown ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn drain_shutdown_processes_queue() {
    let config = ForwarderConfig {
        sequential_delay: Duration::from_secs(1),
        ..fast_config()
    };
    let h = start(config, Rule::to(DESTINATION));

    for id in 1..=3 {
        h.forwarder.on_event(text(id, "queued")).await;
    }
    h.forwarder.on_event(photo(9, Some("x")).with_group(77)).await;
    h.forwarder.on_event(photo(20, None)).await;

    let report = h.forwarder.shutdown(ShutdownMode::Drain).await;
    assert_eq!(report.abandoned_queued, 0);
    assert_eq!(report.abandoned_albums, 1);
    assert_eq!(report.abandoned_deferred, 1);
    assert_eq!(h.sender.sent_ids(), vec![1, 2, 3]);

    assert_eq!(h.forwarder.on_event(text(4, "late")).await, Triage::Ignored);
    assert_eq!(
        h.forwarder.shutdown(ShutdownMode::Drain).await,
        ShutdownReport::default()
    );
}

#[tokio::test(start_paused = true)]
async fn abandon_shutdown_drops_queue_and_timers() {
    let config = ForwarderConfig {
        sequential_delay: Duration::from_secs(1),
        ..fast_config()
    };
    let h = start(config, Rule::to(DESTINATION));

    for id in 1..=3 {
        h.forwarder.on_event(text(id, "queued")).await;
    }
    h.forwarder.on_event(photo(9, Some("x")).with_group(77)).await;

    let report = h.forwarder.shutdown(ShutdownMode::Abandon).await;
    assert!(report.abandoned_queued >= 2);
    assert_eq!(report.abandoned_queued + h.sender.sent().len(), 3);
    assert_eq!(report.abandoned_albums, 1);
    assert_eq!(h.forwarder.pending_albums().await, 0);
}

#[tokio::test(start_paused = true)]
async fn events_after_shutdown_are_ignored() {
    let mut h = start(fast_config(), Rule::to(DESTINATION));
    h.forwarder.shutdown(ShutdownMode::Drain).await;

    let member = photo(30, Some("late")).with_group(5);
    assert_eq!(h.forwarder.on_event(member).await, Triage::Ignored);
    assert_eq!(h.forwarder.on_event(text(31, "late")).await, Triage::Ignored);
    assert_eq!(h.forwarder.pending_albums().await, 0);

    assert!(h.quiet().await);
    assert!(h.sender.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn second_shutdown_reports_nothing() {
    let h = start(fast_config(), Rule::to(DESTINATION));
    h.forwarder.on_event(photo(9, Some("x")).with_group(77)).await;

    let first = h.forwarder.shutdown(ShutdownMode::Abandon).await;
    assert_eq!(first.abandoned_albums, 1);

    let second = h.forwarder.shutdown(ShutdownMode::Abandon).await;
    assert_eq!(second, ShutdownReport::default());
    assert_eq!(h.forwarder.pending_albums().await, 0);
    assert_eq!(h.forwarder.pending_deferrals().await, 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_deferrals() {
    let mut h = start(fast_config(), Rule::to(DESTINATION));

    h.forwarder.on_event(photo(4, None)).await;
    assert!(matches!(h.next().await.outcome, ItemOutcome::Deferred(_)));

    let report = h.forwarder.shutdown(ShutdownMode::Drain).await;
    assert_eq!(report.abandoned_deferred, 1);
    assert!(h.sender.sent().is_empty());
}

// ── Backlog ─────────────────────────────────────────────────────────

/// History stub over a fixed message list.
struct StubHistory {
    read_boundary: MessageId,
    messages: Vec<InboundMessage>,
}

#[async_trait]
impl HistorySource for StubHistory {
    async fn read_boundary(&self, _source_id: ChatId) -> Result<MessageId, ChannelError> {
        Ok(self.read_boundary)
    }

    async fn fetch_after(
        &self,
        _source_id: ChatId,
        min_id: MessageId,
        limit: usize,
    ) -> Result<Vec<InboundMessage>, ChannelError> {
        Ok(self
            .messages
            .iter()
            .filter(|m| m.id > min_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn fetch_page(
        &self,
        _source_id: ChatId,
        offset_id: MessageId,
        limit: usize,
    ) -> Result<Vec<InboundMessage>, ChannelError> {
        let mut page: Vec<_> = self
            .messages
            .iter()
            .filter(|m| offset_id == 0 || m.id < offset_id)
            .cloned()
            .collect();
        page.sort_by_key(|m| std::cmp::Reverse(m.id));
        page.truncate(limit);
        Ok(page)
    }
}

#[tokio::test(start_paused = true)]
async fn unread_catch_up_starts_after_boundary() {
    let mut h = start(fast_config(), Rule::to(DESTINATION).with_keyword("btc"));
    h.last_seen.advance(SOURCE, 1);

    let history = StubHistory {
        read_boundary: 2,
        messages: vec![
            text(1, "btc old"),
            text(2, "btc read"),
            text(5, "btc five"),
            text(3, "btc three"),
            text(4, "eth four"),
        ],
    };
    let report = h
        .forwarder
        .catch_up_unread(&history, SOURCE)
        .await
        .expect("catch-up");
    assert_eq!(report.queued, 2);
    assert_eq!(report.skipped, 1);

    assert!(is_sent(&h.next().await));
    assert!(is_sent(&h.next().await));
    assert_eq!(h.sender.sent_ids(), vec![3, 5]);
    assert_eq!(h.last_seen.get(SOURCE), Some(5));
}

#[tokio::test(start_paused = true)]
async fn history_catch_up_stops_at_cutoff() {
    let mut h = start(fast_config(), Rule::to(DESTINATION));
    let old = Utc::now() - chrono::Duration::days(3);

    let history = StubHistory {
        read_boundary: 0,
        messages: vec![
            text(1, "ancient").with_date(old),
            text(2, "ancient").with_date(old),
            text(3, "recent"),
            photo(4, Some("a")).with_group(40),
            photo(5, Some("b")).with_group(40),
        ],
    };
    let report = h
        .forwarder
        .catch_up_history(&history, SOURCE, 1)
        .await
        .expect("catch-up");
    assert_eq!(report.queued, 2);

    assert!(is_sent(&h.next().await));
    assert!(is_sent(&h.next().await));
    assert_eq!(h.sender.sent_ids(), vec![3, 4, 5]);
    assert_eq!(h.sender.sent().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn catch_up_requires_enabled_rule() {
    let h = start(fast_config(), Rule::to(DESTINATION));
    let history = StubHistory {
        read_boundary: 0,
        messages: Vec::new(),
    };

    let err = h
        .forwarder
        .catch_up_unread(&history, SOURCE - 1)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NoRule(id) if id == SOURCE - 1));

    let reports = h
        .forwarder
        .catch_up_all_unread(&history, &[SOURCE, SOURCE - 1])
        .await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].queued, 0);
}
