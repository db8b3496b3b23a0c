//! Integration tests for the log abstraction over the in-memory backend.

use logflow::{
    Codec, JsonCodec, LogAppender, LogError, LogManager, LogOffset, LogPartition, LogTailer,
    MemoryLogManager, RawCodec, Record,
};
use std::sync::Arc;
use std::time::Duration;

const SHORT: Duration = Duration::from_millis(50);
const LONG: Duration = Duration::from_secs(5);

fn codec() -> Arc<dyn Codec> {
    Arc::new(JsonCodec)
}

#[tokio::test]
async fn test_create_and_open() {
    let manager = MemoryLogManager::new();
    assert!(!manager.exists("orders").await);
    assert!(manager.create_if_not_exists("orders", 4).await.unwrap());
    assert!(manager.exists("orders").await);
    // idempotent with the same partition count
    assert!(!manager.create_if_not_exists("orders", 4).await.unwrap());
    assert_eq!(4, manager.size("orders").await.unwrap());
    // a different partition count is an error
    assert!(matches!(
        manager.create_if_not_exists("orders", 2).await,
        Err(LogError::PartitionMismatch { .. })
    ));
    manager.create_if_not_exists("audit", 1).await.unwrap();
    assert_eq!(vec!["audit", "orders"], manager.list_all().await);
}

#[tokio::test]
async fn test_append_preserves_partition_order() {
    let manager = MemoryLogManager::new();
    manager.create_if_not_exists("events", 2).await.unwrap();
    let appender = manager.get_appender("events", codec()).await.unwrap();
    assert_eq!("events", appender.name());
    assert_eq!(2, appender.size());

    for i in 0..10u8 {
        let offset = appender
            .append(0, Record::of(format!("k{}", i), vec![i]))
            .await
            .unwrap();
        assert_eq!(i as u64, offset.offset);
    }
    let mut tailer = manager
        .create_tailer("g1", vec![LogPartition::of("events", 0)], codec())
        .await
        .unwrap();
    for i in 0..10u8 {
        let entry = tailer.read(LONG).await.unwrap().unwrap();
        assert_eq!(vec![i], entry.record.data);
        assert_eq!(i as u64, entry.offset.offset);
    }
    assert_eq!(None, tailer.read(SHORT).await.unwrap());
}

#[tokio::test]
async fn test_append_by_key_is_sticky() {
    let manager = MemoryLogManager::new();
    manager.create_if_not_exists("events", 4).await.unwrap();
    let appender = manager.get_appender("events", codec()).await.unwrap();
    let first = appender
        .append_by_key(Record::of("same-key", vec![1]))
        .await
        .unwrap();
    for _ in 0..5 {
        let next = appender
            .append_by_key(Record::of("same-key", vec![2]))
            .await
            .unwrap();
        assert_eq!(first.partition, next.partition);
    }
}

#[tokio::test]
async fn test_commit_and_replay_from_last_committed() {
    let manager = MemoryLogManager::new();
    manager.create_if_not_exists("events", 1).await.unwrap();
    let appender = manager.get_appender("events", codec()).await.unwrap();
    for i in 0..10u8 {
        appender
            .append(0, Record::of(format!("k{}", i), vec![i]))
            .await
            .unwrap();
    }
    let partition = LogPartition::of("events", 0);
    {
        let mut tailer = manager
            .create_tailer("g1", vec![partition.clone()], codec())
            .await
            .unwrap();
        // consume two records and commit
        tailer.read(LONG).await.unwrap().unwrap();
        tailer.read(LONG).await.unwrap().unwrap();
        tailer.commit().await.unwrap();
        // read two more without committing
        tailer.read(LONG).await.unwrap().unwrap();
        tailer.read(LONG).await.unwrap().unwrap();
        tailer.close().await.unwrap();
    }
    // a new tailer of the same group resumes after the committed position
    let mut tailer = manager
        .create_tailer("g1", vec![partition], codec())
        .await
        .unwrap();
    let entry = tailer.read(LONG).await.unwrap().unwrap();
    assert_eq!(vec![2u8], entry.record.data);
}

#[tokio::test]
async fn test_consumer_groups_are_independent() {
    let manager = MemoryLogManager::new();
    manager.create_if_not_exists("events", 1).await.unwrap();
    let appender = manager.get_appender("events", codec()).await.unwrap();
    for i in 0..3u8 {
        appender.append(0, Record::of("k", vec![i])).await.unwrap();
    }
    let partition = LogPartition::of("events", 0);
    let mut g1 = manager
        .create_tailer("g1", vec![partition.clone()], codec())
        .await
        .unwrap();
    let mut g2 = manager
        .create_tailer("g2", vec![partition], codec())
        .await
        .unwrap();
    g1.read(LONG).await.unwrap().unwrap();
    g1.read(LONG).await.unwrap().unwrap();
    g1.commit().await.unwrap();
    // g2 still sees everything from the start
    let entry = g2.read(LONG).await.unwrap().unwrap();
    assert_eq!(vec![0u8], entry.record.data);

    let mut groups = manager.list_consumer_groups("events").await.unwrap();
    groups.sort();
    assert_eq!(vec!["g1", "g2"], groups);
}

#[tokio::test]
async fn test_cannot_open_twice_the_same_tailer() {
    let manager = MemoryLogManager::new();
    manager.create_if_not_exists("events", 2).await.unwrap();
    let partition = LogPartition::of("events", 0);
    let _first = manager
        .create_tailer("g1", vec![partition.clone()], codec())
        .await
        .unwrap();
    assert!(matches!(
        manager
            .create_tailer("g1", vec![partition.clone()], codec())
            .await
            .map(|_| ()),
        Err(LogError::AlreadyOpened { .. })
    ));
    // a different group is fine
    assert!(manager
        .create_tailer("g2", vec![partition.clone()], codec())
        .await
        .is_ok());
    // closing releases the partition
    let mut first = _first;
    first.close().await.unwrap();
    assert!(first.closed());
    assert!(manager.create_tailer("g1", vec![partition], codec()).await.is_ok());
}

#[tokio::test]
async fn test_seeks() {
    let manager = MemoryLogManager::new();
    manager.create_if_not_exists("events", 1).await.unwrap();
    let appender = manager.get_appender("events", codec()).await.unwrap();
    for i in 0..5u8 {
        appender.append(0, Record::of("k", vec![i])).await.unwrap();
    }
    let partition = LogPartition::of("events", 0);
    let mut tailer = manager
        .create_tailer("g1", vec![partition.clone()], codec())
        .await
        .unwrap();

    tailer.to_end().await.unwrap();
    assert_eq!(None, tailer.read(SHORT).await.unwrap());

    tailer.to_start().await.unwrap();
    assert_eq!(vec![0u8], tailer.read(LONG).await.unwrap().unwrap().record.data);

    tailer.seek(&LogOffset::of(partition.clone(), 3)).await.unwrap();
    assert_eq!(vec![3u8], tailer.read(LONG).await.unwrap().unwrap().record.data);
    tailer.commit().await.unwrap();

    tailer.to_start().await.unwrap();
    tailer.read(LONG).await.unwrap().unwrap();
    tailer.to_last_committed().await.unwrap();
    assert_eq!(vec![4u8], tailer.read(LONG).await.unwrap().unwrap().record.data);

    // seeking an unassigned partition is an error
    assert!(matches!(
        tailer.seek(&LogOffset::of(LogPartition::of("events", 1), 0)).await,
        Err(LogError::UnassignedPartition { .. })
    ));

    // reset forgets the committed position
    tailer.reset().await.unwrap();
    assert_eq!(vec![0u8], tailer.read(LONG).await.unwrap().unwrap().record.data);
    let lag = manager.get_lag("events", "g1").await.unwrap();
    assert_eq!(5, lag.lag);
}

#[tokio::test]
async fn test_position_by_watermark() {
    let manager = MemoryLogManager::new();
    manager.create_if_not_exists("events", 1).await.unwrap();
    let appender = manager.get_appender("events", codec()).await.unwrap();

    // first half, then capture a boundary watermark, then second half
    for i in 0..5u8 {
        appender.append(0, Record::of("k", vec![i])).await.unwrap();
    }
    let boundary = Record::of("boundary", vec![]).watermark;
    for i in 5..10u8 {
        appender.append(0, Record::of("k", vec![i])).await.unwrap();
    }

    let mut tailer = manager
        .create_tailer("g1", vec![LogPartition::of("events", 0)], codec())
        .await
        .unwrap();

    // older than every record: positions at the earliest record
    tailer.position_by_watermark(1).await.unwrap();
    assert_eq!(vec![0u8], tailer.read(LONG).await.unwrap().unwrap().record.data);

    tailer.position_by_watermark(boundary).await.unwrap();
    let entry = tailer.read(LONG).await.unwrap().unwrap();
    assert_eq!(vec![5u8], entry.record.data);
    assert!(entry.record.watermark >= boundary);

    // a watermark past everything positions at the end
    tailer.position_by_watermark(i64::MAX).await.unwrap();
    assert_eq!(None, tailer.read(SHORT).await.unwrap());
}

#[tokio::test]
async fn test_lag_and_wait_for() {
    let manager = MemoryLogManager::new();
    manager.create_if_not_exists("events", 2).await.unwrap();
    let appender = manager.get_appender("events", codec()).await.unwrap();
    appender.append(0, Record::of("a", vec![])).await.unwrap();
    appender.append(0, Record::of("b", vec![])).await.unwrap();
    let offset = appender.append(1, Record::of("c", vec![])).await.unwrap();

    let lag = manager.get_lag("events", "g1").await.unwrap();
    assert_eq!(3, lag.lag);
    assert_eq!(3, lag.end);
    let per_partition = manager.get_lag_per_partition("events", "g1").await.unwrap();
    assert_eq!(2, per_partition[0].lag);
    assert_eq!(1, per_partition[1].lag);

    // nothing committed yet
    assert!(!appender.wait_for(&offset, "g1", SHORT).await.unwrap());

    let waiter = {
        let appender = manager.get_appender("events", codec()).await.unwrap();
        let offset = offset.clone();
        tokio::spawn(async move { appender.wait_for(&offset, "g1", LONG).await })
    };
    let mut tailer = manager
        .create_tailer(
            "g1",
            vec![LogPartition::of("events", 0), LogPartition::of("events", 1)],
            codec(),
        )
        .await
        .unwrap();
    for _ in 0..3 {
        tailer.read(LONG).await.unwrap().unwrap();
    }
    tailer.commit().await.unwrap();
    assert!(waiter.await.unwrap().unwrap());
    assert_eq!(0, manager.get_lag("events", "g1").await.unwrap().lag);
}

#[tokio::test]
async fn test_subscribe_partitions_work_across_members() {
    let manager = MemoryLogManager::new();
    manager.create_if_not_exists("events", 4).await.unwrap();
    let appender = manager.get_appender("events", codec()).await.unwrap();
    for p in 0..4u32 {
        for i in 0..5u8 {
            appender.append(p, Record::of("k", vec![i])).await.unwrap();
        }
    }

    let mut m1 = manager
        .subscribe("g1", vec!["events".to_string()], codec())
        .await
        .unwrap();
    assert_eq!("g1", m1.group());
    assert_eq!(4, m1.assignments().len());

    let mut m2 = manager
        .subscribe("g1", vec!["events".to_string()], codec())
        .await
        .unwrap();
    assert_eq!(2, m2.assignments().len());

    // the first member observes the rebalance, then holds the other half
    let err = m1.read(LONG).await.unwrap_err();
    assert!(err.is_rebalance());
    assert_eq!(2, m1.assignments().len());

    // assignments are disjoint and cover all partitions
    let mut all = m1.assignments();
    all.extend(m2.assignments());
    all.sort();
    all.dedup();
    assert_eq!(4, all.len());

    // each member reads exactly its half
    let mut count = 0;
    while m1.read(SHORT).await.unwrap().is_some() {
        count += 1;
    }
    while m2.read(SHORT).await.unwrap().is_some() {
        count += 1;
    }
    assert_eq!(20, count);
}

#[tokio::test]
async fn test_member_departure_triggers_rebalance() {
    let manager = MemoryLogManager::new();
    manager.create_if_not_exists("events", 2).await.unwrap();
    let mut m1 = manager
        .subscribe("g1", vec!["events".to_string()], codec())
        .await
        .unwrap();
    let mut m2 = manager
        .subscribe("g1", vec!["events".to_string()], codec())
        .await
        .unwrap();
    assert!(m1.read(SHORT).await.unwrap_err().is_rebalance());
    m2.close().await.unwrap();
    assert!(m1.read(LONG).await.unwrap_err().is_rebalance());
    // the survivor now owns everything
    assert_eq!(2, m1.assignments().len());
}

#[tokio::test]
async fn test_rebalance_replays_uncommitted_reads() {
    let manager = MemoryLogManager::new();
    manager.create_if_not_exists("events", 1).await.unwrap();
    let appender = manager.get_appender("events", codec()).await.unwrap();
    for i in 0..4u8 {
        appender.append(0, Record::of("k", vec![i])).await.unwrap();
    }
    let mut m1 = manager
        .subscribe("g1", vec!["events".to_string()], codec())
        .await
        .unwrap();
    assert_eq!(vec![0u8], m1.read(LONG).await.unwrap().unwrap().record.data);
    m1.commit().await.unwrap();
    // read past the commit, then lose/regain the partition
    assert_eq!(vec![1u8], m1.read(LONG).await.unwrap().unwrap().record.data);
    let m2 = manager
        .subscribe("g1", vec!["events".to_string()], codec())
        .await
        .unwrap();
    assert!(m1.read(LONG).await.unwrap_err().is_rebalance());
    drop(m2);
    assert!(m1.read(LONG).await.unwrap_err().is_rebalance());
    // the uncommitted record is delivered again
    assert_eq!(vec![1u8], m1.read(LONG).await.unwrap().unwrap().record.data);
}

#[tokio::test]
async fn test_codec_is_negotiated_per_log() {
    let manager = MemoryLogManager::new();
    manager.create_if_not_exists("events", 1).await.unwrap();
    let _appender = manager
        .get_appender("events", Arc::new(RawCodec))
        .await
        .unwrap();
    assert!(matches!(
        manager.get_appender("events", codec()).await.map(|_| ()),
        Err(LogError::CodecMismatch { .. })
    ));
    // same codec is fine, and tailers negotiate too
    assert!(manager.get_appender("events", Arc::new(RawCodec)).await.is_ok());
    assert!(matches!(
        manager
            .create_tailer("g1", vec![LogPartition::of("events", 0)], codec())
            .await
            .map(|_| ()),
        Err(LogError::CodecMismatch { .. })
    ));
}

#[tokio::test]
async fn test_failed_tailer_open_registers_no_reader() {
    let manager = MemoryLogManager::new();
    manager.create_if_not_exists("a", 1).await.unwrap();
    manager.create_if_not_exists("b", 1).await.unwrap();
    // "b" is claimed by a raw-codec appender, so a json tailer over both
    // logs must be rejected
    let appender = manager.get_appender("b", Arc::new(RawCodec)).await.unwrap();
    appender.append(0, Record::of("k", vec![1])).await.unwrap();
    assert!(matches!(
        manager
            .create_tailer(
                "g1",
                vec![LogPartition::of("a", 0), LogPartition::of("b", 0)],
                codec(),
            )
            .await
            .map(|_| ()),
        Err(LogError::CodecMismatch { .. })
    ));
    // the rejected open left no partition registered, so both stay openable
    let mut tailer = manager
        .create_tailer("g1", vec![LogPartition::of("a", 0)], codec())
        .await
        .unwrap();
    tailer.close().await.unwrap();
    let mut tailer = manager
        .create_tailer("g1", vec![LogPartition::of("b", 0)], Arc::new(RawCodec))
        .await
        .unwrap();
    tailer.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_appenders() {
    let manager = Arc::new(MemoryLogManager::new());
    manager.create_if_not_exists("events", 1).await.unwrap();
    let mut tasks = Vec::new();
    for writer in 0..4 {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            let appender = manager.get_appender("events", codec()).await.unwrap();
            for i in 0..25u8 {
                appender
                    .append(0, Record::of(format!("w{}-{}", writer, i), vec![i]))
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    let lag = manager.get_lag("events", "g1").await.unwrap();
    assert_eq!(100, lag.end);
}

#[tokio::test]
async fn test_read_after_close_fails() {
    let manager = MemoryLogManager::new();
    manager.create_if_not_exists("events", 1).await.unwrap();
    let mut tailer = manager
        .create_tailer("g1", vec![LogPartition::of("events", 0)], codec())
        .await
        .unwrap();
    tailer.close().await.unwrap();
    assert!(matches!(tailer.read(SHORT).await, Err(LogError::Closed)));
    assert!(matches!(tailer.commit().await, Err(LogError::Closed)));
}

#[tokio::test]
async fn test_missing_log_errors() {
    let manager = MemoryLogManager::new();
    assert!(matches!(
        manager.size("nope").await,
        Err(LogError::NotFound { .. })
    ));
    assert!(matches!(
        manager.get_appender("nope", codec()).await.map(|_| ()),
        Err(LogError::NotFound { .. })
    ));
    manager.create_if_not_exists("events", 1).await.unwrap();
    assert!(matches!(
        manager
            .create_tailer("g1", vec![LogPartition::of("events", 5)], codec())
            .await
            .map(|_| ()),
        Err(LogError::InvalidPartition { .. })
    ));
}
