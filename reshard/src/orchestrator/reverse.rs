//! Reverse replication wiring at primary cutover.
//!
//! Before destinations take over writes, every (old) source primary gets
//! a stopped stream per destination, anchored at the position the
//! destination primary held at cutover. Whether they are ever started is
//! the caller's choice; their existence is what makes the migration
//! reversible.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use tracing::error;

use super::{with_cancel, Error, Orchestrator};
use crate::topo::{self, Shard, SourceShard};
use crate::vrep::{query, BinlogSource, StreamState};

impl Orchestrator {
    /// Create (but do not start) destination-to-source streams, and
    /// record them as `SourceShards` on the source shard records.
    /// Returns the new stream uids per source shard.
    pub(crate) async fn setup_reverse_replication(
        &self,
        token: &CancellationToken,
        keyspace: &str,
        sources: &[Shard],
        destinations: &[Shard],
    ) -> Result<HashMap<String, Vec<u32>>, Error> {
        let mut destination_positions = vec![];
        for destination in destinations {
            let position = with_cancel(
                token,
                self.tablets().primary_position(destination.primary()?),
            )
            .await?;
            destination_positions.push((destination, position));
        }

        let db_name = query::db_name(keyspace);
        let mut created = HashMap::new();

        // A source that still carries SourceShards got its reverse
        // streams in an earlier (partially failed) attempt; leave it be.
        for source in sources.iter().filter(|s| !s.has_source_shards()) {
            let primary = source.primary()?.clone();

            let mut uids = vec![];
            let mut entries = vec![];
            for (destination, position) in &destination_positions {
                let binlog_source = BinlogSource::for_reverse(
                    keyspace,
                    &destination.name,
                    source.key_range.clone(),
                );
                let create = query::create_stream(
                    "ReversedResharding",
                    &binlog_source,
                    position,
                    StreamState::Stopped,
                    &db_name,
                );
                let result =
                    with_cancel(token, self.tablets().vreplication_exec(&primary, &create))
                        .await?;
                let uid = result.insert_id as u32;

                uids.push(uid);
                entries.push(SourceShard {
                    uid,
                    keyspace: keyspace.to_string(),
                    shard: destination.name.clone(),
                    key_range: destination.key_range.clone(),
                    tables: vec![],
                });
            }

            let recorded = topo::update_shard_fields(self.topo(), keyspace, &source.name, |shard| {
                shard.source_shards.extend(entries.clone());
                Ok(())
            })
            .await;

            if let Err(err) = recorded {
                let orphans = uids
                    .iter()
                    .map(|uid| format!("{}/{}", primary, uid))
                    .collect::<Vec<_>>()
                    .join(", ");
                error!(
                    "recording reverse streams on {}/{} failed, orphaned streams: {}",
                    keyspace, source.name, orphans
                );
                return Err(Error::OrphanStreams(format!("{} ({})", orphans, err)));
            }

            created.insert(source.name.clone(), uids);
        }

        Ok(created)
    }

    /// Flip the reverse streams created at cutover to running.
    pub(crate) async fn start_reverse_replication(
        &self,
        token: &CancellationToken,
        sources: &[Shard],
        streams: &HashMap<String, Vec<u32>>,
    ) -> Result<(), Error> {
        for source in sources {
            let Some(uids) = streams.get(&source.name) else {
                continue;
            };
            let primary = source.primary()?;
            for uid in uids {
                let start = query::update_stream_state(*uid, StreamState::Running);
                with_cancel(token, self.tablets().vreplication_exec(primary, &start)).await?;
            }
        }
        Ok(())
    }
}
