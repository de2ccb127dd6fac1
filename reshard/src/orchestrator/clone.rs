//! Clone initiators: the first step of a resharding.
//!
//! A clone creates the initial VReplication streams on the destination
//! primaries and records them as `SourceShards` on the destination shard
//! records. From then on the destinations are "in resharding" until a
//! primary migration or a cancel clears the entries.

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{with_cancel, Error, Orchestrator};
use crate::topo::{self, SourceShard};
use crate::vrep::{query, BinlogSource, Position, StreamState};

impl Orchestrator {
    /// Start a horizontal clone: one stream per source on every
    /// destination primary, filtered to the destination's own key range.
    pub async fn split_clone(
        &self,
        token: &CancellationToken,
        keyspace: &str,
        from_shards: &[String],
        to_shards: &[String],
    ) -> Result<(), Error> {
        if from_shards.is_empty() || to_shards.is_empty() {
            return Err(Error::precondition(
                "split clone needs at least one source and one destination shard",
            ));
        }

        let _lock = self.topo().lock_keyspace(keyspace, "SplitClone").await?;
        let target = to_shards.join(",");
        self.emit("SplitClone", keyspace, &target, "start");

        let result = self.split_clone_locked(token, keyspace, from_shards, to_shards).await;
        match &result {
            Ok(()) => self.emit("SplitClone", keyspace, &target, "finished"),
            Err(err) => self.emit("SplitClone", keyspace, &target, &format!("failed: {}", err)),
        }
        result
    }

    async fn split_clone_locked(
        &self,
        token: &CancellationToken,
        keyspace: &str,
        from_shards: &[String],
        to_shards: &[String],
    ) -> Result<(), Error> {
        let sources = topo::get_shards(self.topo(), keyspace, from_shards).await?;
        let destinations = topo::get_shards(self.topo(), keyspace, to_shards).await?;

        for destination in &destinations {
            if destination.has_source_shards() {
                return Err(Error::CloneAlreadyRun(destination.id()));
            }
        }

        let db_name = query::db_name(keyspace);
        for destination in &destinations {
            let primary = destination.primary()?.clone();

            // Create every stream stopped first; they only start moving
            // once all of them exist and are recorded on the shard.
            let mut entries = vec![];
            for source in &sources {
                let binlog_source = BinlogSource::for_key_range(
                    keyspace,
                    &source.name,
                    destination.key_range.clone(),
                );
                let create = query::create_stream(
                    "SplitClone",
                    &binlog_source,
                    &Position::default(),
                    StreamState::Stopped,
                    &db_name,
                );
                let created =
                    with_cancel(token, self.tablets().vreplication_exec(&primary, &create))
                        .await?;

                entries.push(SourceShard {
                    uid: created.insert_id as u32,
                    keyspace: keyspace.to_string(),
                    shard: source.name.clone(),
                    key_range: destination.key_range.clone(),
                    tables: vec![],
                });
            }

            let destination_name = destination.name.clone();
            topo::update_shard_fields(self.topo(), keyspace, &destination.name, |shard| {
                if shard.has_source_shards() {
                    return Err(topo::Error::condition(format!(
                        "shard {} gained source shards mid-clone",
                        shard.id()
                    )));
                }
                shard.source_shards = entries.clone();
                Ok(())
            })
            .await?;

            for entry in &entries {
                let start = query::update_stream_state(entry.uid, StreamState::Init);
                with_cancel(token, self.tablets().vreplication_exec(&primary, &start)).await?;
            }

            info!(
                "created {} clone streams on {}/{}",
                entries.len(),
                keyspace,
                destination_name
            );
        }

        self.refresh_shard_primaries(token, &destinations).await?;

        Ok(())
    }

    /// Start a vertical clone: move a table set from one keyspace into
    /// another. Exactly one stream per destination shard.
    pub async fn vertical_split_clone(
        &self,
        token: &CancellationToken,
        from_keyspace: &str,
        to_keyspace: &str,
        tables: &[String],
    ) -> Result<(), Error> {
        if tables.is_empty() {
            return Err(Error::precondition("vertical clone needs a table list"));
        }

        // Source keyspace first, destination second; the vertical
        // migrators take them in the same order.
        let _source_lock = self
            .topo()
            .lock_keyspace(from_keyspace, "VerticalSplitClone")
            .await?;
        let _destination_lock = self
            .topo()
            .lock_keyspace(to_keyspace, "VerticalSplitClone")
            .await?;

        self.emit("VerticalSplitClone", to_keyspace, "", "start");
        let result = self
            .vertical_split_clone_locked(token, from_keyspace, to_keyspace, tables)
            .await;
        match &result {
            Ok(()) => self.emit("VerticalSplitClone", to_keyspace, "", "finished"),
            Err(err) => self.emit(
                "VerticalSplitClone",
                to_keyspace,
                "",
                &format!("failed: {}", err),
            ),
        }
        result
    }

    async fn vertical_split_clone_locked(
        &self,
        token: &CancellationToken,
        from_keyspace: &str,
        to_keyspace: &str,
        tables: &[String],
    ) -> Result<(), Error> {
        let source_names = self.topo().list_shards(from_keyspace).await?;
        let [source_name] = source_names.as_slice() else {
            return Err(Error::precondition(format!(
                "vertical clone needs exactly one source shard, keyspace {} has {}",
                from_keyspace,
                source_names.len()
            )));
        };
        let source = self.topo().get_shard(from_keyspace, source_name).await?.record;

        let destination_names = self.topo().list_shards(to_keyspace).await?;
        let destinations = topo::get_shards(self.topo(), to_keyspace, &destination_names).await?;
        if destinations.is_empty() {
            return Err(Error::precondition(format!(
                "keyspace {} has no shards to clone into",
                to_keyspace
            )));
        }
        for destination in &destinations {
            if destination.has_source_shards() {
                return Err(Error::CloneAlreadyRun(destination.id()));
            }
        }

        let db_name = query::db_name(to_keyspace);
        for destination in &destinations {
            let primary = destination.primary()?.clone();

            let binlog_source = BinlogSource::for_tables(from_keyspace, &source.name, tables);
            let create = query::create_stream(
                "VerticalSplitClone",
                &binlog_source,
                &Position::default(),
                StreamState::Stopped,
                &db_name,
            );
            let created =
                with_cancel(token, self.tablets().vreplication_exec(&primary, &create)).await?;
            let uid = created.insert_id as u32;

            let entry = SourceShard {
                uid,
                keyspace: from_keyspace.to_string(),
                shard: source.name.clone(),
                key_range: None,
                tables: tables.to_vec(),
            };
            topo::update_shard_fields(self.topo(), to_keyspace, &destination.name, |shard| {
                if shard.has_source_shards() {
                    return Err(topo::Error::condition(format!(
                        "shard {} gained source shards mid-clone",
                        shard.id()
                    )));
                }
                shard.source_shards = vec![entry.clone()];
                Ok(())
            })
            .await?;

            let start = query::update_stream_state(uid, StreamState::Init);
            with_cancel(token, self.tablets().vreplication_exec(&primary, &start)).await?;
        }

        self.refresh_shard_primaries(token, &destinations).await?;

        Ok(())
    }
}
