//! Finding overlapping shard sets and labeling migration direction.
//!
//! During a horizontal resharding one keyspace contains two partitionings
//! of the same key range at once, e.g. `0` next to `-80, 80-`. Grouping
//! them is pure set expansion: shards of one partitioning never intersect
//! each other, so any intersection is with the other side.

use super::Error;
use crate::topo::key_range::{is_contiguous, or_complete};
use crate::topo::Shard;

/// Two shard sets covering the same key range with different boundaries.
#[derive(Debug, Clone)]
pub struct OverlappingShards {
    pub left: Vec<Shard>,
    pub right: Vec<Shard>,
}

impl OverlappingShards {
    pub fn contains_shard(&self, name: &str) -> bool {
        self.left
            .iter()
            .chain(self.right.iter())
            .any(|shard| shard.name == name)
    }
}

/// The group labeled by migration direction.
#[derive(Debug, Clone)]
pub struct MigrationSides {
    pub sources: Vec<Shard>,
    pub destinations: Vec<Shard>,
}

/// Group a keyspace's shards into overlapping pairs. Shards that overlap
/// nothing are dropped. Input order does not affect the grouping.
pub fn find_overlapping_shards(shards: &[Shard]) -> Vec<OverlappingShards> {
    let mut remaining: Vec<Shard> = shards.to_vec();
    remaining.sort_by(|a, b| {
        or_complete(&a.key_range)
            .cmp(&or_complete(&b.key_range))
            .then_with(|| a.name.cmp(&b.name))
    });

    let mut groups = vec![];
    while !remaining.is_empty() {
        let mut left = vec![remaining.remove(0)];
        let mut right: Vec<Shard> = vec![];

        // Shards intersecting one side belong on the other; repeat until
        // neither side grows.
        loop {
            let mut changed = false;
            if let Some(shard) = take_intersecting(&mut remaining, &left) {
                right.push(shard);
                changed = true;
            }
            if let Some(shard) = take_intersecting(&mut remaining, &right) {
                left.push(shard);
                changed = true;
            }
            if !changed {
                break;
            }
        }

        if right.is_empty() {
            continue;
        }

        sort_side(&mut left);
        sort_side(&mut right);
        if covers_same_range(&left, &right) {
            groups.push(OverlappingShards { left, right });
        }
    }

    groups
}

/// Group containing the given shard, if any.
pub fn overlapping_shards_for(
    shards: &[Shard],
    keyspace: &str,
    shard: &str,
) -> Result<OverlappingShards, Error> {
    find_overlapping_shards(shards)
        .into_iter()
        .find(|group| group.contains_shard(shard))
        .ok_or_else(|| Error::NoOverlappingShards(keyspace.to_string(), shard.to_string()))
}

/// Label the sides of an overlapping group as sources and destinations.
///
/// `SourceShards` alone cannot tell the direction: after primary cutover
/// the demoted side holds them too, for the reverse streams. A frozen
/// primary control marks that side as the (old) source first.
pub fn resolve_migration_sides(group: OverlappingShards) -> Result<MigrationSides, Error> {
    let OverlappingShards { left, right } = group;

    let frozen = |side: &[Shard]| side.iter().any(|shard| shard.is_primary_frozen());
    let has_sources = |side: &[Shard]| side.iter().any(|shard| shard.has_source_shards());

    if frozen(&left) {
        return Ok(MigrationSides {
            sources: left,
            destinations: right,
        });
    }
    if frozen(&right) {
        return Ok(MigrationSides {
            sources: right,
            destinations: left,
        });
    }
    if has_sources(&left) {
        return Ok(MigrationSides {
            sources: right,
            destinations: left,
        });
    }
    if has_sources(&right) {
        return Ok(MigrationSides {
            sources: left,
            destinations: right,
        });
    }

    Err(Error::NoCloneRun)
}

fn take_intersecting(remaining: &mut Vec<Shard>, side: &[Shard]) -> Option<Shard> {
    let position = remaining.iter().position(|candidate| {
        side.iter().any(|shard| {
            or_complete(&candidate.key_range).intersects(&or_complete(&shard.key_range))
        })
    })?;
    Some(remaining.remove(position))
}

fn sort_side(side: &mut [Shard]) {
    side.sort_by(|a, b| or_complete(&a.key_range).cmp(&or_complete(&b.key_range)));
}

fn covers_same_range(left: &[Shard], right: &[Shard]) -> bool {
    let left_ranges: Vec<_> = left.iter().map(|s| or_complete(&s.key_range)).collect();
    let right_ranges: Vec<_> = right.iter().map(|s| or_complete(&s.key_range)).collect();

    is_contiguous(&left_ranges)
        && is_contiguous(&right_ranges)
        && left_ranges.first().map(|r| &r.start) == right_ranges.first().map(|r| &r.start)
        && left_ranges.last().map(|r| &r.end) == right_ranges.last().map(|r| &r.end)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::topo::SourceShard;

    fn shard(name: &str) -> Shard {
        Shard::new("ks", name).unwrap()
    }

    fn with_source_shards(mut shard: Shard) -> Shard {
        shard.source_shards.push(SourceShard {
            uid: 1,
            keyspace: "ks".to_string(),
            shard: "0".to_string(),
            ..Default::default()
        });
        shard
    }

    #[test]
    fn test_split_grouping() {
        let shards = vec![shard("0"), shard("-80"), shard("80-")];
        let groups = find_overlapping_shards(&shards);
        assert_eq!(groups.len(), 1);

        let group = &groups[0];
        let (single, pair) = if group.left.len() == 1 {
            (&group.left, &group.right)
        } else {
            (&group.right, &group.left)
        };
        assert_eq!(single[0].name, "0");
        assert_eq!(pair[0].name, "-80");
        assert_eq!(pair[1].name, "80-");
    }

    #[test]
    fn test_no_overlap() {
        let shards = vec![shard("-80"), shard("80-")];
        assert!(find_overlapping_shards(&shards).is_empty());
        assert!(matches!(
            overlapping_shards_for(&shards, "ks", "-80"),
            Err(Error::NoOverlappingShards(_, _))
        ));
    }

    #[test]
    fn test_partial_cover_rejected() {
        // A lone -80 does not cover what 0 covers.
        let shards = vec![shard("0"), shard("-80")];
        assert!(find_overlapping_shards(&shards).is_empty());
    }

    #[test]
    fn test_direction_from_source_shards() {
        let shards = vec![
            shard("0"),
            with_source_shards(shard("-80")),
            with_source_shards(shard("80-")),
        ];
        let group = overlapping_shards_for(&shards, "ks", "0").unwrap();
        let sides = resolve_migration_sides(group).unwrap();

        assert_eq!(sides.sources[0].name, "0");
        assert_eq!(sides.destinations.len(), 2);
    }

    #[test]
    fn test_frozen_wins_over_source_shards() {
        // After cutover both directions carry SourceShards; the frozen
        // side is the old source.
        let mut old_source = with_source_shards(shard("0"));
        old_source.set_primary_frozen(true);
        let shards = vec![
            old_source,
            with_source_shards(shard("-80")),
            with_source_shards(shard("80-")),
        ];

        let group = overlapping_shards_for(&shards, "ks", "-80").unwrap();
        let sides = resolve_migration_sides(group).unwrap();
        assert_eq!(sides.sources[0].name, "0");
    }

    #[test]
    fn test_no_clone_run() {
        let shards = vec![shard("0"), shard("-80"), shard("80-")];
        let group = overlapping_shards_for(&shards, "ks", "0").unwrap();
        assert!(matches!(
            resolve_migration_sides(group),
            Err(Error::NoCloneRun)
        ));
    }

    #[test]
    fn test_resolution_is_stable() {
        let shards = vec![
            with_source_shards(shard("-80")),
            shard("0"),
            with_source_shards(shard("80-")),
        ];
        let first =
            resolve_migration_sides(overlapping_shards_for(&shards, "ks", "0").unwrap()).unwrap();
        let reversed: Vec<Shard> = shards.iter().rev().cloned().collect();
        let second =
            resolve_migration_sides(overlapping_shards_for(&reversed, "ks", "0").unwrap()).unwrap();

        let names = |side: &[Shard]| side.iter().map(|s| s.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(&first.sources), names(&second.sources));
        assert_eq!(names(&first.destinations), names(&second.destinations));
    }
}
