//! End-to-end consistency tests for the published-content cache.
//!
//! These drive the whole pipeline the way a host would: authoring changes
//! go through the notification channel, a consumer drains them, and readers
//! observe the results through pinned snapshots.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fronda::{
    CacheConsumer, CacheError, CacheSettings, ChangeKind, ContentId, ContentSource, LocalChannel,
    MemorySource, NodeRecord, NotificationChannel, PublishedCache, Seeder, SourceError,
    VariantKey, VariantRecord,
};

fn invariant(name: &str) -> Vec<VariantRecord> {
    vec![VariantRecord::published(VariantKey::invariant(), name)]
}

fn fast_settings() -> CacheSettings {
    CacheSettings {
        refresh_backoff_ms: 1,
        ..Default::default()
    }
}

struct Farm {
    source: Arc<MemorySource>,
    channel: LocalChannel,
    cache: Arc<PublishedCache<MemorySource>>,
    consumer: CacheConsumer<MemorySource>,
}

/// One cache instance wired to an in-process channel, the way a
/// single-server deployment runs.
fn farm_of_one(settings: CacheSettings) -> Farm {
    let source = Arc::new(MemorySource::new());
    let channel = LocalChannel::new(settings.queue_soft_limit);
    let cache = PublishedCache::new(Arc::clone(&source), settings);
    let consumer = CacheConsumer::new(Arc::clone(&cache), channel.subscribe());
    Farm {
        source,
        channel,
        cache,
        consumer,
    }
}

#[tokio::test]
async fn publish_consume_read_unpublish_roundtrip() {
    let farm = farm_of_one(fast_settings());
    let home = ContentId::new(1);

    // Publish: the store row appears, then the event.
    farm.source.upsert(home, ContentId::ROOT, invariant("Home"));
    farm.channel.publish(ChangeKind::Refreshed { id: home });
    farm.consumer.consume_pending().await;

    let content = farm
        .cache
        .get(home, &VariantKey::invariant())
        .await
        .expect("get")
        .expect("published");
    assert_eq!(content.name(), "Home");
    assert_eq!(content.url_segment(), "home");

    // Unpublish: the row flips, then the event.
    farm.source.upsert(
        home,
        ContentId::ROOT,
        vec![VariantRecord::published(VariantKey::invariant(), "Home").unpublished()],
    );
    farm.channel.publish(ChangeKind::Refreshed { id: home });
    farm.consumer.consume_pending().await;

    let gone = farm
        .cache
        .get(home, &VariantKey::invariant())
        .await
        .expect("get");
    assert!(gone.is_none());
}

#[tokio::test]
async fn snapshot_generations_never_go_backwards() {
    let farm = farm_of_one(fast_settings());
    let mut last = farm.cache.current().generation();

    for raw in 1..=10 {
        let id = ContentId::new(raw);
        farm.source
            .upsert(id, ContentId::ROOT, invariant(&format!("Node {raw}")));
        farm.channel.publish(ChangeKind::Refreshed { id });
        farm.consumer.consume_pending().await;

        let generation = farm.cache.current().generation();
        assert!(generation >= last);
        last = generation;
    }
}

#[tokio::test]
async fn pinned_reader_is_stable_across_applies() {
    let farm = farm_of_one(fast_settings());
    let page = ContentId::new(1);

    farm.source.upsert(page, ContentId::ROOT, invariant("First"));
    farm.channel.publish(ChangeKind::Refreshed { id: page });
    farm.consumer.consume_pending().await;

    // A long-running render pins the snapshot it started with.
    let pinned = farm.cache.current();
    let before = pinned.get(page).expect("entry");

    for round in 0..5 {
        farm.source
            .upsert(page, ContentId::ROOT, invariant(&format!("Round {round}")));
        farm.channel.publish(ChangeKind::Refreshed { id: page });
        farm.consumer.consume_pending().await;
    }

    let during = pinned.get(page).expect("entry");
    assert_eq!(before, during);

    let fresh = farm.cache.current().get(page).expect("entry");
    assert_ne!(before, fresh);
}

#[tokio::test]
async fn removing_a_branch_evicts_every_descendant() {
    let farm = farm_of_one(fast_settings());
    let section = ContentId::new(1);
    let page = ContentId::new(2);
    let leaf = ContentId::new(3);

    farm.source.upsert(section, ContentId::ROOT, invariant("Docs"));
    farm.source.upsert(page, section, invariant("Guide"));
    farm.source.upsert(leaf, page, invariant("Step"));
    farm.channel
        .publish(ChangeKind::RefreshedBranch { id: section });
    farm.consumer.consume_pending().await;
    assert!(farm.cache.current().contains(leaf));

    farm.source.remove(page);
    farm.source.remove(leaf);
    farm.channel.publish(ChangeKind::Removed { id: page });
    farm.consumer.consume_pending().await;

    let snapshot = farm.cache.current();
    assert!(snapshot.contains(section));
    assert!(!snapshot.contains(page));
    assert!(!snapshot.contains(leaf));
    assert!(snapshot.get(section).expect("section").child_ids.is_empty());
}

#[tokio::test]
async fn redelivered_events_do_not_reapply() {
    let farm = farm_of_one(fast_settings());
    let page = ContentId::new(1);
    farm.source.upsert(page, ContentId::ROOT, invariant("Home"));

    // The transport redelivers: same event pushed twice, then an older
    // epoch arrives late.
    farm.channel.publish(ChangeKind::Refreshed { id: page });
    farm.consumer.consume_pending().await;

    farm.source.upsert(page, ContentId::ROOT, invariant("Edited"));
    farm.channel.publish(ChangeKind::Refreshed { id: page });
    farm.consumer.consume_pending().await;

    // Roll the store back to simulate what a stale refresh would reinstall,
    // then deliver an event with an already-applied epoch by hand.
    farm.source.upsert(page, ContentId::ROOT, invariant("Home"));
    let stale = fronda::ChangeNotification::new(ChangeKind::Refreshed { id: page }, 1);
    assert_eq!(farm.cache.apply_events(vec![stale]).await, 0);

    let content = farm
        .cache
        .get(page, &VariantKey::invariant())
        .await
        .expect("get")
        .expect("published");
    assert_eq!(content.name(), "Edited");
}

#[tokio::test]
async fn both_instances_of_a_farm_converge() {
    let settings = fast_settings();
    let source = Arc::new(MemorySource::new());
    let channel = LocalChannel::new(settings.queue_soft_limit);

    let first = PublishedCache::new(Arc::clone(&source), settings.clone());
    let second = PublishedCache::new(Arc::clone(&source), settings);
    let first_consumer = CacheConsumer::new(Arc::clone(&first), channel.subscribe());
    let second_consumer = CacheConsumer::new(Arc::clone(&second), channel.subscribe());

    let page = ContentId::new(1);
    source.upsert(page, ContentId::ROOT, invariant("Shared"));
    // The publishing instance takes no shortcut: it learns about its own
    // change through the channel like everyone else.
    channel.publish(ChangeKind::Refreshed { id: page });

    first_consumer.consume_pending().await;
    second_consumer.consume_pending().await;

    for cache in [&first, &second] {
        let content = cache
            .get(page, &VariantKey::invariant())
            .await
            .expect("get")
            .expect("published");
        assert_eq!(content.name(), "Shared");
    }
}

#[tokio::test]
async fn seeding_covers_configured_branches_before_ready() {
    let source = Arc::new(MemorySource::new());
    source.upsert(ContentId::new(1), ContentId::ROOT, invariant("Site"));
    source.upsert(ContentId::new(2), ContentId::new(1), invariant("News"));
    source.upsert(ContentId::new(3), ContentId::new(2), invariant("Post"));

    let cache = PublishedCache::new(
        Arc::clone(&source),
        CacheSettings {
            seed_ids: vec![1],
            refresh_backoff_ms: 1,
            ..Default::default()
        },
    );
    assert!(!cache.is_ready());

    Seeder::new(Arc::clone(&cache)).run().await;

    assert!(cache.is_ready());
    let snapshot = cache.current();
    for raw in 1..=3 {
        assert!(snapshot.contains(ContentId::new(raw)));
    }
}

/// A source whose reads hang longer than any test deadline.
struct StalledSource;

#[async_trait]
impl ContentSource for StalledSource {
    async fn read_node(&self, id: ContentId) -> Result<Option<NodeRecord>, SourceError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Some(NodeRecord {
            id,
            parent: ContentId::ROOT,
            sort_order: 0,
            template: None,
            child_ids: Vec::new(),
        }))
    }

    async fn read_variants(&self, _id: ContentId) -> Result<Vec<VariantRecord>, SourceError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn cold_read_against_a_stalled_store_times_out() {
    let cache = PublishedCache::new(
        Arc::new(StalledSource),
        CacheSettings {
            get_deadline_ms: 50,
            ..Default::default()
        },
    );

    let err = cache
        .get(ContentId::new(1), &VariantKey::invariant())
        .await
        .expect_err("deadline");
    assert!(matches!(err, CacheError::Timeout { id } if id == ContentId::new(1)));
}

#[tokio::test]
async fn store_outage_during_refresh_keeps_serving_the_old_version() {
    let farm = farm_of_one(CacheSettings {
        refresh_retry_attempts: 1,
        refresh_backoff_ms: 1,
        ..Default::default()
    });
    let page = ContentId::new(1);

    farm.source.upsert(page, ContentId::ROOT, invariant("Stable"));
    farm.channel.publish(ChangeKind::Refreshed { id: page });
    farm.consumer.consume_pending().await;

    // The store goes down right as an edit is announced.
    farm.source.upsert(page, ContentId::ROOT, invariant("Edited"));
    farm.source.fail_reads(usize::MAX);
    farm.channel.publish(ChangeKind::Refreshed { id: page });
    farm.consumer.consume_pending().await;

    // Readers keep getting the previous version the whole time.
    let content = farm
        .cache
        .get(page, &VariantKey::invariant())
        .await
        .expect("get")
        .expect("published");
    assert_eq!(content.name(), "Stable");

    // The store recovers and the edit is announced again.
    farm.source.fail_reads(0);
    farm.channel.publish(ChangeKind::Refreshed { id: page });
    farm.consumer.consume_pending().await;

    let content = farm
        .cache
        .get(page, &VariantKey::invariant())
        .await
        .expect("get")
        .expect("published");
    assert_eq!(content.name(), "Edited");
}

#[tokio::test]
async fn moves_and_sorts_keep_the_tree_navigable() {
    let farm = farm_of_one(fast_settings());
    let blog = ContentId::new(1);
    let news = ContentId::new(2);
    let post = ContentId::new(3);

    farm.source.upsert(blog, ContentId::ROOT, invariant("Blog"));
    farm.source.upsert(news, ContentId::ROOT, invariant("News"));
    farm.source.upsert(post, blog, invariant("Post"));
    farm.channel.publish(ChangeKind::RefreshedBranch { id: blog });
    farm.channel.publish(ChangeKind::Refreshed { id: news });
    farm.consumer.consume_pending().await;

    farm.source.move_node(post, news);
    farm.channel.publish(ChangeKind::TreeMoved {
        id: post,
        new_parent: news,
    });
    farm.channel.publish(ChangeKind::Sorted {
        parent: ContentId::ROOT,
        ordered_children: vec![news, blog],
    });
    farm.consumer.consume_pending().await;

    let snapshot = farm.cache.current();
    let roots: Vec<ContentId> = snapshot.at_root().iter().map(|n| n.id).collect();
    assert_eq!(roots, vec![news, blog]);
    let children: Vec<ContentId> = snapshot.children(news).iter().map(|n| n.id).collect();
    assert_eq!(children, vec![post]);
    assert!(snapshot.children(blog).is_empty());
}
