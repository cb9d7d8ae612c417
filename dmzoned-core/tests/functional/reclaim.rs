// vim: tw=80
//! Garbage collection of the running target

use std::time::Duration;

use pretty_assertions::assert_eq;

use super::*;

/// A target with only two random data zones, so reclaim is needed early
fn small() -> Harness {
    Harness { nconv: 4, nseq: 8, ..Default::default() }
}

/// When every random zone is in use, writing a new chunk waits for the
/// reclaimer to move another chunk to a sequential zone.
#[test_log::test(tokio::test)]
async fn write_waits_for_reclaim() {
    let (_vd, target) = small().build().await;
    let mut rng = rng(30);
    let datas = (0..4).map(|_| payload(&mut rng, 4)).collect::<Vec<_>>();
    for (chunk, data) in datas.iter().enumerate() {
        t!(write_data(&target, chunk as ChunkT, 0, data).await);
    }
    let md = target.metadata();
    let on_seq = (0..4)
        .filter(|chunk| {
            let dzone = md.map_entry(*chunk).0.unwrap();
            md.dir().get(dzone).is_seq()
        }).count();
    assert!(on_seq >= 2, "only {} chunks were moved", on_seq);
    for (chunk, data) in datas.iter().enumerate() {
        let actual = t!(read_data(&target, chunk as ChunkT, 0, 4).await);
        assert_eq!(&actual, data);
    }
    t!(target.shutdown().await);
}

#[tokio::test]
async fn preserves_data() {
    let (_vd, target) = Harness::default().build().await;
    let md = target.metadata();
    let mut shadow = Shadow::new(&target);
    let mut rng = rng(32);
    for round in 0..4 {
        random_workload(&target, &mut shadow, &mut rng, 5, 60).await;
        while let Some(zone) = md.pick_reclaim_victim() {
            t!(dmzoned_core::reclaim::reclaim_zone(md, zone).await);
            t!(target.flush().await);
        }
        shadow.verify(&target).await;
        println!("round {} ok: {:?}", round, target.status());
    }
    t!(target.shutdown().await);
}

/// An explicit reclaim pass restores the free random zone pool.
#[tokio::test]
async fn manual_pass() {
    let (_vd, target) = Harness::default().build().await;
    let mut rng = rng(33);
    for chunk in 0..3 {
        t!(write_data(&target, chunk, 0, &payload(&mut rng, 2)).await);
    }
    let free = target.status().nr_unmap_rnd;
    assert!(free > 0);
    // Nothing to do above the low threshold
    assert_eq!(t!(target.reclaim().await), 0);
    assert_eq!(target.status().nr_unmap_rnd, free);
    t!(target.shutdown().await);
}

/// An idle target uses the higher idle threshold to reclaim ahead of time.
#[tokio::test(start_paused = true)]
async fn idle() {
    let mut h = Harness::default();
    h.config.reclaim_idle_low = 90;
    h.config.idle_period_ms = 1_000;
    h.config.reclaim_period_ms = 500;
    let (_vd, target) = h.build().await;
    let md = target.metadata();
    let mut rng = rng(34);
    let data = payload(&mut rng, 3);
    t!(write_data(&target, 0, 0, &data).await);
    let rzone = md.map_entry(0).0.unwrap();
    assert!(md.dir().get(rzone).is_rnd());

    tokio::time::sleep(Duration::from_secs(5)).await;
    let dzone = md.map_entry(0).0.unwrap();
    assert!(md.dir().get(dzone).is_seq());
    assert_eq!(t!(read_data(&target, 0, 0, 3).await), data);
    t!(target.shutdown().await);
}

/// A zone whose data can't be read stays where it is.  Reclaim carries on with
/// other zones, and no zone is lost.
#[tokio::test]
async fn read_error() {
    let (vd, target) = Harness::default().build().await;
    let md = target.metadata();
    let mut rng = rng(35);
    let datas = (0..2).map(|_| payload(&mut rng, 3)).collect::<Vec<_>>();
    for (chunk, data) in datas.iter().enumerate() {
        t!(write_data(&target, chunk as ChunkT, 0, data).await);
    }
    t!(target.flush().await);
    let before = target.status();
    let bad = md.map_entry(0).0.unwrap();
    let lba = md.zone_lba(bad, 0);
    vd.fail_reads(lba..lba + 1);

    let mut failed = Vec::new();
    while let Some(zone) = md.pick_reclaim_victim_except(&failed) {
        if let Err(e) = dmzoned_core::reclaim::reclaim_zone(md, zone).await {
            assert_eq!(e, Error::EIO);
            failed.push(zone);
        }
    }
    assert_eq!(failed, vec![bad]);
    vd.clear_faults();
    t!(target.flush().await);

    assert_eq!(md.map_entry(0), (Some(bad), None));
    assert!(md.dir().get(md.map_entry(1).0.unwrap()).is_seq());
    let status = target.status();
    assert_eq!(status.nr_unmap_rnd, before.nr_unmap_rnd + 1);
    assert_eq!(status.nr_unmap_seq, before.nr_unmap_seq - 1);
    assert_eq!(status.nr_pending_free, 0);
    for (chunk, data) in datas.iter().enumerate() {
        let actual = t!(read_data(&target, chunk as ChunkT, 0, 3).await);
        assert_eq!(&actual, data);
    }
    super::invariants::check(&target).await;
    t!(target.shutdown().await);
}
