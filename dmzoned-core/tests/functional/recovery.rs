// vim: tw=80
//! Crash consistency of the metadata

use pretty_assertions::assert_eq;
use rstest::rstest;

use dmzoned_core::superblock::Superblock;

use super::*;

/// Read the superblock of a metadata set straight off the disk.
fn superblock(vd: &VdevMem, target: &Target, set: usize) -> Result<Superblock>
{
    let lba = target.metadata().layout().set_base[set];
    Superblock::from_block(&vd.peek(lba, 1))
}

/// Raw contents of both metadata sets
fn meta_image(vd: &VdevMem, target: &Target) -> Vec<u8> {
    let layout = target.metadata().layout();
    layout.set_base.iter()
        .flat_map(|base| vd.peek(*base, layout.nr_meta_blocks))
        .collect()
}

#[tokio::test]
async fn committed_data_survives_crash() {
    let h = Harness::default();
    let (vd, target) = h.build().await;
    let mut shadow = Shadow::new(&target);
    let mut rng = rng(40);
    random_workload(&target, &mut shadow, &mut rng, 6, 150).await;
    t!(target.flush().await);
    let gen = target.metadata().gen();
    let crashed = vd.snapshot();
    t!(target.shutdown().await);

    let target = h.open(&crashed).await;
    assert_eq!(target.metadata().gen(), gen);
    shadow.verify(&target).await;
    super::invariants::check(&target).await;
    t!(target.shutdown().await);
}

/// Changes that were never committed are simply absent after a crash.
#[tokio::test]
async fn uncommitted_mapping_is_lost() {
    let h = Harness::default();
    let (vd, target) = h.build().await;
    let mut rng = rng(41);
    let committed = payload(&mut rng, 2);
    t!(write_data(&target, 0, 0, &committed).await);
    t!(target.flush().await);
    t!(write_data(&target, 1, 0, &payload(&mut rng, 2)).await);
    let crashed = vd.snapshot();
    t!(target.shutdown().await);

    let target = h.open(&crashed).await;
    assert_eq!(t!(read_data(&target, 0, 0, 2).await), committed);
    assert_eq!(target.metadata().map_entry(1), (None, None));
    assert!(t!(read_data(&target, 1, 0, 2).await).iter().all(|b| *b == 0));
    // The chunk can be written again
    let new = payload(&mut rng, 2);
    t!(write_data(&target, 1, 0, &new).await);
    assert_eq!(t!(read_data(&target, 1, 0, 2).await), new);
    t!(target.shutdown().await);
}

/// A crash between committing the secondary set and the primary set leaves
/// the newer secondary, which wins at the next mount.
#[tokio::test]
async fn interrupted_flush() {
    let h = Harness::default();
    let (vd, target) = h.build().await;
    let mut rng = rng(42);
    let a = payload(&mut rng, 2);
    let b = payload(&mut rng, 2);
    t!(write_data(&target, 0, 0, &a).await);
    t!(target.flush().await);
    let gen = target.metadata().gen();
    t!(write_data(&target, 2, 0, &b).await);

    let base0 = target.metadata().layout().set_base[0];
    vd.fail_writes(base0..base0 + LPZ);
    assert_eq!(Err(Error::EIO), target.flush().await);
    let crashed = vd.snapshot();
    crashed.clear_faults();
    vd.clear_faults();
    assert_eq!(t!(superblock(&crashed, &target, 1)).gen, gen + 1);
    assert_eq!(t!(superblock(&crashed, &target, 0)).gen, gen);
    t!(target.shutdown().await);

    let target = h.open(&crashed).await;
    assert_eq!(target.metadata().gen(), gen + 1);
    assert_eq!(t!(read_data(&target, 0, 0, 2).await), a);
    assert_eq!(t!(read_data(&target, 2, 0, 2).await), b);
    // The primary set was brought up to date during the mount
    assert_eq!(t!(superblock(&crashed, &target, 0)).gen, gen + 1);
    t!(target.shutdown().await);
}

/// Two flushes in a row fail, each on a different metadata set, while a
/// reclaim moves committed data.  Nothing committed may be lost.
#[tokio::test]
async fn consecutive_failed_flushes() {
    let h = Harness::default();
    let (vd, target) = h.build().await;
    let md = target.metadata();
    let mut rng = rng(46);
    let a = payload(&mut rng, 4);
    t!(write_data(&target, 0, 0, &a).await);
    t!(target.flush().await);
    let gen = md.gen();

    let layout = md.layout();
    let set0 = layout.set_base[0]..layout.set_base[0] + layout.nr_meta_blocks;
    let set1 = layout.set_base[1]..layout.set_base[1] + layout.nr_meta_blocks;
    vd.fail_writes(set0);
    assert_eq!(Err(Error::EIO), target.flush().await);
    assert_eq!(md.gen(), gen + 1);
    vd.clear_faults();

    let rzone = md.map_entry(0).0.unwrap();
    t!(dmzoned_core::reclaim::reclaim_zone(md, rzone).await);
    let szone = md.map_entry(0).0.unwrap();
    assert_ne!(szone, rzone);

    vd.fail_writes(set1);
    assert_eq!(Err(Error::EIO), target.flush().await);
    assert_eq!(md.gen(), gen + 2);
    let crashed = vd.snapshot();
    crashed.clear_faults();
    vd.clear_faults();
    t!(target.shutdown().await);

    let target = h.open(&crashed).await;
    assert_eq!(target.metadata().gen(), gen + 2);
    assert_eq!(target.metadata().map_entry(0), (Some(szone), None));
    assert_eq!(t!(read_data(&target, 0, 0, 4).await), a);
    super::invariants::check(&target).await;
    t!(target.shutdown().await);
}

/// After a flush fails, the target keeps working and later flushes succeed.
#[tokio::test]
async fn operation_continues_after_failed_flush() {
    let h = Harness::default();
    let (vd, target) = h.build().await;
    let mut shadow = Shadow::new(&target);
    let mut rng = rng(47);
    random_workload(&target, &mut shadow, &mut rng, 4, 40).await;
    let base0 = target.metadata().layout().set_base[0];
    vd.fail_writes(base0..base0 + LPZ);
    assert_eq!(Err(Error::EIO), target.flush().await);
    vd.clear_faults();

    random_workload(&target, &mut shadow, &mut rng, 4, 40).await;
    shadow.verify(&target).await;
    t!(target.flush().await);
    let gen = target.metadata().gen();
    assert_eq!(t!(superblock(&vd, &target, 0)).gen, gen);
    assert_eq!(t!(superblock(&vd, &target, 1)).gen, gen);
    t!(target.shutdown().await);

    let target = h.open(&vd).await;
    shadow.verify(&target).await;
    super::invariants::check(&target).await;
    t!(target.shutdown().await);
}

/// Either superblock may be destroyed without losing data.
#[rstest]
#[case(0)]
#[case(1)]
#[tokio::test]
async fn corrupt_superblock(#[case] set: usize) {
    let h = Harness::default();
    let (vd, target) = h.build().await;
    let mut shadow = Shadow::new(&target);
    let mut rng = rng(43);
    random_workload(&target, &mut shadow, &mut rng, 4, 50).await;
    t!(target.shutdown().await);
    let gen = target.metadata().gen();

    let lba = target.metadata().layout().set_base[set];
    vd.poke(lba, &[0xffu8; BYTES_PER_LBA]);
    assert!(superblock(&vd, &target, set).is_err());

    let target = h.open(&vd).await;
    assert_eq!(target.metadata().gen(), gen);
    shadow.verify(&target).await;
    // The damaged set was rewritten from the good one
    assert_eq!(t!(superblock(&vd, &target, set)).gen, gen);
    t!(target.shutdown().await);
}

/// Flushing with nothing dirty changes nothing on disk.
#[tokio::test]
async fn idempotent_flush() {
    let (vd, target) = Harness::default().build().await;
    let mut rng = rng(44);
    t!(write_data(&target, 0, 0, &payload(&mut rng, 1)).await);
    t!(target.flush().await);
    let gen = target.metadata().gen();
    let image = meta_image(&vd, &target);
    t!(target.flush().await);
    t!(target.flush().await);
    assert_eq!(target.metadata().gen(), gen);
    assert!(meta_image(&vd, &target) == image);
    t!(target.shutdown().await);
}

/// Sequential zones written but never committed are reset at mount, so they
/// can be reused.
#[tokio::test]
async fn reset_orphaned_zones() {
    let h = Harness::default();
    let (vd, target) = h.build().await;
    let md = target.metadata();
    let mut rng = rng(45);
    t!(write_data(&target, 0, 0, &payload(&mut rng, 4)).await);
    t!(target.flush().await);
    // Move the chunk to a sequential zone, but crash before committing.
    let rzone = md.map_entry(0).0.unwrap();
    assert_eq!(md.pick_reclaim_victim(), Some(rzone));
    t!(dmzoned_core::reclaim::reclaim_zone(md, rzone).await);
    let szone = md.map_entry(0).0.unwrap();
    assert_eq!(vd.write_pointer(szone), 4);
    let crashed = vd.snapshot();
    t!(target.shutdown().await);

    let target = h.open(&crashed).await;
    assert_eq!(target.metadata().map_entry(0), (Some(rzone), None));
    assert_eq!(crashed.write_pointer(szone), 0);
    super::invariants::check(&target).await;
    t!(target.shutdown().await);
}
