// vim: tw=80
//! Structural invariants of the metadata, checked after real workloads

use itertools::Itertools;
use pretty_assertions::assert_eq;

use dmzoned_core::{metadata::Role, target::TargetState};

use super::*;

/// Check that the mapping table, the zone roles and the validity bitmaps all
/// agree with each other.
///
/// A running target is suspended for the duration, so that background
/// reclaim can't race with the checks.
pub(super) async fn check(target: &Target) {
    let running = target.state() == TargetState::Running;
    if running {
        t!(target.suspend().await);
    }
    check_quiescent(target).await;
    if running {
        t!(target.resume().await);
    }
}

async fn check_quiescent(target: &Target) {
    let md = target.metadata();
    let lpz = md.layout().zone_nr_blocks;

    // Mapping entries and zone roles describe each other
    for chunk in 0..target.nr_chunks() {
        match md.map_entry(chunk) {
            (None, b) => assert_eq!(b, None, "chunk {} has only a buffer", chunk),
            (Some(dzone), bzone) => {
                assert_eq!(md.zone_state(dzone).role,
                           Role::Data { chunk, bzone });
                if let Some(bzone) = bzone {
                    assert!(md.dir().get(bzone).is_rnd());
                    assert_eq!(md.zone_state(bzone).role,
                               Role::Buffer { chunk, dzone });
                }
            }
        }
    }
    let data_zones = md.dir().iter()
        .map(|(zone, _)| (zone, md.zone_state(zone)))
        .filter_map(|(zone, zs)| match zs.role {
            Role::Data { chunk, bzone } => Some((chunk, zone, bzone)),
            _ => None
        }).collect_vec();
    for (chunk, zone, bzone) in data_zones.iter() {
        assert_eq!(md.map_entry(*chunk), (Some(*zone), *bzone));
    }
    assert!(data_zones.iter().map(|(chunk, _, _)| chunk).all_unique());

    for (zone, desc) in md.dir().iter() {
        let zs = md.zone_state(zone);
        if zs.role == Role::Meta {
            continue;
        }
        // Weights match the bitmaps
        assert_eq!(zs.weight, t!(md.count_valid(zone).await),
                   "zone {} has the wrong weight", zone);
        // No valid block lies beyond a sequential zone's write pointer
        if desc.is_seq() && zs.wp < lpz {
            assert_eq!(t!(md.first_valid_run(zone, zs.wp, lpz).await), None,
                       "zone {} has valid blocks past its write pointer", zone);
        }
        if matches!(zs.role, Role::Free) {
            assert_eq!(zs.weight, 0);
        }
    }
}

#[tokio::test]
async fn after_random_workload() {
    let (_vd, target) = Harness::default().build().await;
    let mut shadow = Shadow::new(&target);
    let mut rng = rng(20);
    random_workload(&target, &mut shadow, &mut rng, 6, 200).await;
    check(&target).await;
    t!(target.flush().await);
    check(&target).await;
    t!(target.shutdown().await);
}

/// Every chunk may be moved around by reclaim, and the metadata must stay
/// consistent at each step.
#[test_log::test(tokio::test)]
async fn during_reclaim() {
    let (_vd, target) = Harness::default().build().await;
    let md = target.metadata();
    let mut shadow = Shadow::new(&target);
    let mut rng = rng(21);
    random_workload(&target, &mut shadow, &mut rng, 4, 100).await;
    for _ in 0..16 {
        let Some(zone) = md.pick_reclaim_victim() else {
            break;
        };
        t!(dmzoned_core::reclaim::reclaim_zone(md, zone).await);
        check(&target).await;
        t!(target.flush().await);
    }
    shadow.verify(&target).await;
    t!(target.shutdown().await);
}

/// The committed metadata reloads into exactly the same state.
#[tokio::test]
async fn reload() {
    let h = Harness::default();
    let (vd, target) = h.build().await;
    let mut shadow = Shadow::new(&target);
    let mut rng = rng(22);
    random_workload(&target, &mut shadow, &mut rng, 6, 150).await;
    t!(target.shutdown().await);
    let before = target.status();

    let target = h.open(&vd).await;
    check(&target).await;
    let after = target.status();
    assert_eq!(before.nr_mapped_chunks, after.nr_mapped_chunks);
    assert_eq!(before.gen, after.gen);
    shadow.verify(&target).await;
    t!(target.shutdown().await);
}
