//! End-to-end resharding scenarios against an in-memory topology and a
//! simulated tablet fleet.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use reshard::config::{self, Config};
use reshard::healthcheck::LocalHealthCheck;
use reshard::orchestrator::{Error, Orchestrator, RecordingSink};
use reshard::tablet::{LocalTablets, TabletAlias, TabletType};
use reshard::topo::{
    self, Keyspace, MemoryTopo, Shard, SrvKeyspace, TabletRecord, TopoServer,
};
use reshard::vrep::StreamState;

const CELLS: [&str; 2] = ["zone1", "zone2"];

struct Cluster {
    topo: Arc<MemoryTopo>,
    fleet: LocalTablets,
    orchestrator: Orchestrator,
    events: RecordingSink,
    token: CancellationToken,
}

impl Cluster {
    fn new() -> Self {
        reshard::logger();

        // Keep the post-migration drain sleeps out of test wall time.
        let mut test_config = Config::default();
        test_config.general.rdonly_drain_sleep = 1;
        test_config.general.replica_drain_sleep = 1;
        config::set(test_config);

        let topo = Arc::new(MemoryTopo::new(&CELLS));
        let fleet = LocalTablets::new();
        let events = RecordingSink::new();
        let orchestrator = Orchestrator::new(
            topo.clone(),
            Arc::new(fleet.clone()),
            Arc::new(LocalHealthCheck::new()),
        )
        .with_events(Arc::new(events.clone()));

        Self {
            topo,
            fleet,
            orchestrator,
            events,
            token: CancellationToken::new(),
        }
    }

    async fn add_keyspace(&self, name: &str) {
        self.topo.create_keyspace(&Keyspace::new(name)).await.unwrap();
    }

    /// Shard with a primary, a replica and an rdonly tablet, uids
    /// `base_uid..base_uid + 2`, all in zone1.
    async fn add_shard(&self, keyspace: &str, name: &str, base_uid: u32, serving: bool) {
        let primary = TabletAlias::new("zone1", base_uid);
        let mut shard = Shard::new(keyspace, name).unwrap();
        shard.primary_alias = Some(primary);
        shard.is_primary_serving = serving;
        self.topo.create_shard(&shard).await.unwrap();

        let types = [TabletType::Primary, TabletType::Replica, TabletType::Rdonly];
        for (offset, tablet_type) in types.into_iter().enumerate() {
            let alias = TabletAlias::new("zone1", base_uid + offset as u32);
            self.fleet.add_tablet(&alias, keyspace, name, tablet_type);
            self.topo
                .upsert_tablet(&TabletRecord {
                    alias,
                    keyspace: keyspace.to_string(),
                    shard: name.to_string(),
                    tablet_type,
                    host: String::new(),
                    http_port: None,
                })
                .await
                .unwrap();
        }
    }

    async fn rebuild(&self, keyspace: &str) {
        self.orchestrator
            .rebuild_keyspace_graph(&self.token, keyspace, None)
            .await
            .unwrap();
    }

    async fn shard(&self, keyspace: &str, name: &str) -> Shard {
        self.topo.get_shard(keyspace, name).await.unwrap().record
    }

    async fn srv(&self, cell: &str, keyspace: &str) -> SrvKeyspace {
        self.topo.get_srv_keyspace(cell, keyspace).await.unwrap()
    }

    fn primary(&self, uid: u32) -> TabletAlias {
        TabletAlias::new("zone1", uid)
    }
}

/// ks/0 serving, empty destinations ks/-80 and ks/80-.
async fn split_fixture() -> Cluster {
    let cluster = Cluster::new();
    cluster.add_keyspace("ks").await;
    cluster.add_shard("ks", "0", 100, true).await;
    cluster.add_shard("ks", "-80", 200, false).await;
    cluster.add_shard("ks", "80-", 300, false).await;
    cluster.rebuild("ks").await;
    cluster
}

async fn split_clone(cluster: &Cluster) {
    cluster
        .orchestrator
        .split_clone(
            &cluster.token,
            "ks",
            &["0".to_string()],
            &["-80".to_string(), "80-".to_string()],
        )
        .await
        .unwrap();
}

async fn migrate_type(cluster: &Cluster, served_type: TabletType) {
    cluster
        .orchestrator
        .migrate_served_types(
            &cluster.token,
            "ks",
            "-80",
            None,
            served_type,
            false,
            false,
            Some(Duration::from_secs(30)),
            false,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_split_clone_creates_streams() {
    let cluster = split_fixture().await;
    split_clone(&cluster).await;

    for name in ["-80", "80-"] {
        let shard = cluster.shard("ks", name).await;
        assert_eq!(shard.source_shards.len(), 1);
        let entry = &shard.source_shards[0];
        assert_eq!(entry.keyspace, "ks");
        assert_eq!(entry.shard, "0");
        assert_eq!(entry.key_range, shard.key_range);
        assert!(entry.tables.is_empty());
    }

    for uid in [200, 300] {
        let streams = cluster.fleet.streams(&cluster.primary(uid));
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].workflow, "SplitClone");
        assert_eq!(streams[0].state, StreamState::Init);
        assert_eq!(streams[0].source.shard, "0");
    }

    // The source is untouched.
    let source = cluster.shard("ks", "0").await;
    assert!(source.source_shards.is_empty());
    assert!(source.is_primary_serving);

    // The report shows both destinations and their streams.
    let report = cluster
        .orchestrator
        .show_resharding(&cluster.token, "ks", "-80")
        .await
        .unwrap();
    assert!(report.contains("ks/-80"));
    assert!(report.contains("ks/80-"));
    assert!(report.contains("SplitClone"));
}

#[tokio::test]
async fn test_clone_twice_fails() {
    let cluster = split_fixture().await;
    split_clone(&cluster).await;

    let result = cluster
        .orchestrator
        .split_clone(
            &cluster.token,
            "ks",
            &["0".to_string()],
            &["-80".to_string(), "80-".to_string()],
        )
        .await;
    assert!(matches!(result, Err(Error::CloneAlreadyRun(_))));
}

#[tokio::test]
async fn test_cancel_after_clone_restores_topology() {
    let cluster = split_fixture().await;

    let before_low = cluster.shard("ks", "-80").await;
    let before_high = cluster.shard("ks", "80-").await;
    let before_source = cluster.shard("ks", "0").await;

    split_clone(&cluster).await;
    cluster
        .orchestrator
        .cancel_resharding(&cluster.token, "ks", "-80")
        .await
        .unwrap();

    assert_eq!(cluster.shard("ks", "-80").await, before_low);
    assert_eq!(cluster.shard("ks", "80-").await, before_high);
    assert_eq!(cluster.shard("ks", "0").await, before_source);

    for uid in [200, 300] {
        assert!(cluster.fleet.streams(&cluster.primary(uid)).is_empty());
    }
}

#[tokio::test]
async fn test_migrate_non_primary_types() {
    let cluster = split_fixture().await;
    split_clone(&cluster).await;

    migrate_type(&cluster, TabletType::Rdonly).await;
    migrate_type(&cluster, TabletType::Replica).await;

    for cell in CELLS {
        let srv = cluster.srv(cell, "ks").await;
        assert_eq!(srv.served_shards(TabletType::Rdonly), vec!["-80", "80-"]);
        assert_eq!(srv.served_shards(TabletType::Replica), vec!["-80", "80-"]);
        // PRIMARY has not moved.
        assert_eq!(srv.served_shards(TabletType::Primary), vec!["0"]);
    }

    let source = cluster.shard("ks", "0").await;
    assert!(source.is_primary_serving);
    for tablet_type in [TabletType::Rdonly, TabletType::Replica] {
        let control = source.tablet_control(tablet_type).unwrap();
        assert!(control.disable_query_service);
    }

    // The disabled replica/rdonly tablets were refreshed after the sleep.
    assert!(cluster.fleet.refresh_count(&TabletAlias::new("zone1", 101)) > 0);
    assert!(cluster.fleet.refresh_count(&TabletAlias::new("zone1", 102)) > 0);

    let statuses = cluster.events.statuses();
    assert!(statuses.iter().any(|s| s == "start"));
    assert!(statuses.iter().any(|s| s == "finished"));
}

#[tokio::test]
async fn test_migrate_replica_round_trip() {
    let cluster = split_fixture().await;
    split_clone(&cluster).await;

    let before = cluster.srv("zone1", "ks").await;

    migrate_type(&cluster, TabletType::Replica).await;
    cluster
        .orchestrator
        .migrate_served_types(
            &cluster.token,
            "ks",
            "-80",
            None,
            TabletType::Replica,
            true,
            false,
            Some(Duration::from_secs(30)),
            false,
        )
        .await
        .unwrap();

    assert_eq!(cluster.srv("zone1", "ks").await, before);
}

#[tokio::test]
async fn test_migrate_replica_single_cell() {
    let cluster = split_fixture().await;
    split_clone(&cluster).await;

    let before = cluster.srv("zone1", "ks").await;
    cluster
        .orchestrator
        .migrate_served_types(
            &cluster.token,
            "ks",
            "-80",
            Some(&["zone2".to_string()][..]),
            TabletType::Replica,
            false,
            false,
            Some(Duration::from_secs(30)),
            false,
        )
        .await
        .unwrap();

    // Only zone2 moved.
    assert_eq!(cluster.srv("zone1", "ks").await, before);
    assert_eq!(
        cluster.srv("zone2", "ks").await.served_shards(TabletType::Replica),
        vec!["-80", "80-"]
    );

    let source = cluster.shard("ks", "0").await;
    let control = source.tablet_control(TabletType::Replica).unwrap();
    assert_eq!(control.cells, vec!["zone2"]);
}

#[tokio::test]
async fn test_primary_requires_non_primary_first() {
    let cluster = split_fixture().await;
    split_clone(&cluster).await;

    // REPLICA and RDONLY still point at the source.
    let result = cluster
        .orchestrator
        .migrate_served_types(
            &cluster.token,
            "ks",
            "-80",
            None,
            TabletType::Primary,
            false,
            false,
            Some(Duration::from_secs(30)),
            false,
        )
        .await;

    match result {
        Err(Error::MigrateNonPrimaryFirst(types)) => {
            assert!(types.contains("REPLICA"));
            assert!(types.contains("RDONLY"));
        }
        other => panic!("expected MigrateNonPrimaryFirst, got {:?}", other.err()),
    }
}

#[tokio::test]
async fn test_primary_migration_with_reverse_replication() {
    let cluster = split_fixture().await;
    split_clone(&cluster).await;
    migrate_type(&cluster, TabletType::Rdonly).await;
    migrate_type(&cluster, TabletType::Replica).await;

    cluster
        .orchestrator
        .migrate_served_types(
            &cluster.token,
            "ks",
            "-80",
            None,
            TabletType::Primary,
            false,
            false,
            Some(Duration::from_secs(30)),
            true,
        )
        .await
        .unwrap();

    let source = cluster.shard("ks", "0").await;
    assert!(!source.is_primary_serving);
    assert!(!source.is_primary_frozen());
    assert_eq!(source.source_shards.len(), 2);
    let reverse_targets: Vec<&str> = source
        .source_shards
        .iter()
        .map(|entry| entry.shard.as_str())
        .collect();
    assert_eq!(reverse_targets, vec!["-80", "80-"]);

    for name in ["-80", "80-"] {
        let destination = cluster.shard("ks", name).await;
        assert!(destination.is_primary_serving);
        assert!(destination.source_shards.is_empty());
        assert!(destination.tablet_control(TabletType::Primary).is_none());
    }

    for cell in CELLS {
        let srv = cluster.srv(cell, "ks").await;
        assert_eq!(srv.served_shards(TabletType::Primary), vec!["-80", "80-"]);
    }

    // Reverse streams run on the old source primary; the destination
    // clone streams are gone.
    let reverse = cluster.fleet.streams(&cluster.primary(100));
    assert_eq!(reverse.len(), 2);
    for stream in &reverse {
        assert_eq!(stream.workflow, "ReversedResharding");
        assert_eq!(stream.state, StreamState::Running);
        assert!(!stream.pos.is_empty());
    }
    for uid in [200, 300] {
        assert!(cluster.fleet.streams(&cluster.primary(uid)).is_empty());
    }
}

#[tokio::test]
async fn test_primary_migration_without_reverse_replication() {
    let cluster = split_fixture().await;
    split_clone(&cluster).await;
    migrate_type(&cluster, TabletType::Rdonly).await;
    migrate_type(&cluster, TabletType::Replica).await;

    cluster
        .orchestrator
        .migrate_served_types(
            &cluster.token,
            "ks",
            "-80",
            None,
            TabletType::Primary,
            false,
            false,
            Some(Duration::from_secs(30)),
            false,
        )
        .await
        .unwrap();

    // The sources stay frozen and the reverse streams stay dormant.
    let source = cluster.shard("ks", "0").await;
    assert!(!source.is_primary_serving);
    assert!(source.is_primary_frozen());
    assert_eq!(source.source_shards.len(), 2);

    let reverse = cluster.fleet.streams(&cluster.primary(100));
    assert_eq!(reverse.len(), 2);
    for stream in &reverse {
        assert_eq!(stream.state, StreamState::Stopped);
    }

    // The overlap resolver still labels the frozen side as the source.
    let report = cluster
        .orchestrator
        .show_resharding(&cluster.token, "ks", "-80")
        .await
        .unwrap();
    let source_index = report.find("source shards:").unwrap();
    let destination_index = report.find("destination shards:").unwrap();
    let sources_section = &report[source_index..destination_index];
    assert!(sources_section.contains("ks/0"));
}

#[tokio::test]
async fn test_primary_migration_compensates_before_freeze() {
    let cluster = split_fixture().await;
    split_clone(&cluster).await;
    migrate_type(&cluster, TabletType::Rdonly).await;
    migrate_type(&cluster, TabletType::Replica).await;

    // One destination primary is down: the initial refresh fails and the
    // migration backs out before anything froze.
    cluster.fleet.set_reachable(&cluster.primary(300), false);

    let result = cluster
        .orchestrator
        .migrate_served_types(
            &cluster.token,
            "ks",
            "-80",
            None,
            TabletType::Primary,
            false,
            false,
            Some(Duration::from_secs(30)),
            true,
        )
        .await;
    assert!(result.is_err());

    let source = cluster.shard("ks", "0").await;
    assert!(source.is_primary_serving);
    assert!(!source.is_primary_frozen());
    assert!(source
        .tablet_control(TabletType::Primary)
        .map(|control| !control.disable_query_service)
        .unwrap_or(true));

    for cell in CELLS {
        let srv = cluster.srv(cell, "ks").await;
        assert_eq!(srv.served_shards(TabletType::Primary), vec!["0"]);
    }

    let statuses = cluster.events.statuses();
    assert!(statuses.iter().any(|s| s.starts_with("failed: ")));
}

#[tokio::test]
async fn test_second_migration_fails_on_lock() {
    let cluster = split_fixture().await;
    split_clone(&cluster).await;

    let _held = cluster.topo.lock_keyspace("ks", "other migration").await.unwrap();

    let result = cluster
        .orchestrator
        .migrate_served_types(
            &cluster.token,
            "ks",
            "-80",
            None,
            TabletType::Replica,
            false,
            false,
            Some(Duration::from_secs(30)),
            false,
        )
        .await;
    assert!(matches!(
        result,
        Err(Error::Topo(topo::Error::Locked(_, _)))
    ));
}

#[tokio::test]
async fn test_primary_input_constraints() {
    let cluster = split_fixture().await;

    let reverse = cluster
        .orchestrator
        .migrate_served_types(
            &cluster.token,
            "ks",
            "-80",
            None,
            TabletType::Primary,
            true,
            false,
            None,
            false,
        )
        .await;
    assert!(matches!(reverse, Err(Error::Precondition(_))));

    let cells = cluster
        .orchestrator
        .migrate_served_types(
            &cluster.token,
            "ks",
            "-80",
            Some(&["zone1".to_string()][..]),
            TabletType::Primary,
            false,
            false,
            None,
            false,
        )
        .await;
    assert!(matches!(cells, Err(Error::Precondition(_))));
}

/// ks1/0 owns t1 and t2; ks2/0 is the vertical-split target.
async fn vertical_fixture() -> Cluster {
    let cluster = Cluster::new();
    cluster.add_keyspace("ks1").await;
    cluster.add_keyspace("ks2").await;
    cluster.add_shard("ks1", "0", 100, true).await;
    cluster.add_shard("ks2", "0", 400, true).await;
    cluster.rebuild("ks1").await;
    cluster.rebuild("ks2").await;

    for tablet_type in TabletType::all() {
        cluster
            .orchestrator
            .set_keyspace_served_from(&cluster.token, "ks2", tablet_type, &[], "ks1", false)
            .await
            .unwrap();
    }
    cluster
}

async fn vertical_clone(cluster: &Cluster) {
    cluster
        .orchestrator
        .vertical_split_clone(
            &cluster.token,
            "ks1",
            "ks2",
            &["t1".to_string(), "t2".to_string()],
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_vertical_clone_and_migrate() {
    let cluster = vertical_fixture().await;
    vertical_clone(&cluster).await;

    let destination = cluster.shard("ks2", "0").await;
    assert_eq!(destination.source_shards.len(), 1);
    let entry = &destination.source_shards[0];
    assert_eq!(entry.keyspace, "ks1");
    assert_eq!(entry.tables, vec!["t1", "t2"]);
    let stream_uid = entry.uid;

    let streams = cluster.fleet.streams(&cluster.primary(400));
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].state, StreamState::Init);
    assert_eq!(streams[0].source.tables, vec!["t1", "t2"]);

    for tablet_type in [TabletType::Rdonly, TabletType::Replica] {
        cluster
            .orchestrator
            .migrate_served_from(
                &cluster.token,
                "ks2",
                "0",
                tablet_type,
                None,
                false,
                Some(Duration::from_secs(30)),
            )
            .await
            .unwrap();

        let keyspace = cluster.topo.get_keyspace("ks2").await.unwrap().record;
        assert!(keyspace.served_from(tablet_type).is_none());

        let source = cluster.shard("ks1", "0").await;
        let control = source.tablet_control(tablet_type).unwrap();
        assert_eq!(control.denied_tables, vec!["t1", "t2"]);
    }

    cluster
        .orchestrator
        .migrate_served_from(
            &cluster.token,
            "ks2",
            "0",
            TabletType::Primary,
            None,
            false,
            Some(Duration::from_secs(30)),
        )
        .await
        .unwrap();

    // The move is complete: writes denied at the source, stream gone,
    // destination standalone.
    let source = cluster.shard("ks1", "0").await;
    let control = source.tablet_control(TabletType::Primary).unwrap();
    assert_eq!(control.denied_tables, vec!["t1", "t2"]);

    let destination = cluster.shard("ks2", "0").await;
    assert!(destination.source_shards.is_empty());

    let keyspace = cluster.topo.get_keyspace("ks2").await.unwrap().record;
    assert!(!keyspace.is_served_from());

    let streams = cluster.fleet.streams(&cluster.primary(400));
    assert!(streams.iter().all(|s| s.id != stream_uid));
}

#[tokio::test]
async fn test_vertical_cancel() {
    let cluster = vertical_fixture().await;
    vertical_clone(&cluster).await;

    cluster
        .orchestrator
        .cancel_resharding(&cluster.token, "ks2", "0")
        .await
        .unwrap();

    let destination = cluster.shard("ks2", "0").await;
    assert!(destination.source_shards.is_empty());
    assert!(cluster.fleet.streams(&cluster.primary(400)).is_empty());
}

#[tokio::test]
async fn test_vertical_cancel_refused_after_migration() {
    let cluster = vertical_fixture().await;
    vertical_clone(&cluster).await;

    cluster
        .orchestrator
        .migrate_served_from(
            &cluster.token,
            "ks2",
            "0",
            TabletType::Rdonly,
            None,
            false,
            Some(Duration::from_secs(30)),
        )
        .await
        .unwrap();

    // The source now denies tables for RDONLY; the cancel must refuse.
    let result = cluster
        .orchestrator
        .cancel_resharding(&cluster.token, "ks2", "0")
        .await;
    assert!(matches!(result, Err(Error::Precondition(_))));
}

#[tokio::test]
async fn test_cancel_refused_after_serving_migrated() {
    let cluster = split_fixture().await;
    split_clone(&cluster).await;
    migrate_type(&cluster, TabletType::Rdonly).await;

    let result = cluster
        .orchestrator
        .cancel_resharding(&cluster.token, "ks", "-80")
        .await;
    assert!(matches!(result, Err(Error::Precondition(_))));
}

#[tokio::test]
async fn test_sharding_info() {
    let cluster = split_fixture().await;

    cluster
        .orchestrator
        .set_keyspace_sharding_info(
            &cluster.token,
            "ks",
            "keyspace_id",
            topo::KeyspaceIdType::Uint64,
            false,
        )
        .await
        .unwrap();

    // Changing it again without force fails.
    let result = cluster
        .orchestrator
        .set_keyspace_sharding_info(
            &cluster.token,
            "ks",
            "other_column",
            topo::KeyspaceIdType::Uint64,
            false,
        )
        .await;
    assert!(result.is_err());

    cluster
        .orchestrator
        .set_keyspace_sharding_info(
            &cluster.token,
            "ks",
            "other_column",
            topo::KeyspaceIdType::Bytes,
            true,
        )
        .await
        .unwrap();

    let keyspace = cluster.topo.get_keyspace("ks").await.unwrap().record;
    assert_eq!(keyspace.sharding_column_name, "other_column");
    assert_eq!(keyspace.sharding_column_type, topo::KeyspaceIdType::Bytes);
}
