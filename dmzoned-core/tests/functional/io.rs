// vim: tw=80
//! Reads and writes through the I/O translator

use pretty_assertions::assert_eq;

use dmzoned_core::{metadata::Role, reclaim};

use super::*;

/// Move a chunk from its random zone to a sequential zone.
async fn make_sequential(target: &Target, chunk: ChunkT) -> u32 {
    let md = target.metadata();
    let rzone = md.map_entry(chunk).0.unwrap();
    assert!(md.dir().get(rzone).is_rnd());
    assert_eq!(md.pick_reclaim_victim(), Some(rzone));
    t!(reclaim::reclaim_zone(md, rzone).await);
    let szone = md.map_entry(chunk).0.unwrap();
    assert!(md.dir().get(szone).is_seq());
    szone
}

#[tokio::test]
async fn full_chunk() {
    let (_vd, target) = Harness::default().build().await;
    let mut rng = rng(1);
    let data = payload(&mut rng, LPZ);
    t!(write_data(&target, 3, 0, &data).await);
    assert_eq!(t!(read_data(&target, 3, 0, LPZ).await), data);
    // Partial reads too
    assert_eq!(t!(read_data(&target, 3, 5, 3).await),
               &data[5 * BYTES_PER_LBA..8 * BYTES_PER_LBA]);
    t!(target.shutdown().await);
}

#[tokio::test]
async fn overwrite_random_zone() {
    let (_vd, target) = Harness::default().build().await;
    let mut rng = rng(2);
    let old = payload(&mut rng, 8);
    let new = payload(&mut rng, 2);
    t!(write_data(&target, 0, 0, &old).await);
    t!(write_data(&target, 0, 3, &new).await);
    let actual = t!(read_data(&target, 0, 0, 8).await);
    assert_eq!(&actual[..3 * BYTES_PER_LBA], &old[..3 * BYTES_PER_LBA]);
    assert_eq!(&actual[3 * BYTES_PER_LBA..5 * BYTES_PER_LBA], &new[..]);
    assert_eq!(&actual[5 * BYTES_PER_LBA..], &old[5 * BYTES_PER_LBA..]);
    // Random zones never need a buffer
    assert_eq!(target.metadata().map_entry(0).1, None);
    t!(target.shutdown().await);
}

/// Writes below a sequential zone's write pointer go to a buffer zone, and
/// reads prefer the buffer's newer data.
#[tokio::test]
async fn unaligned_write_uses_buffer() {
    let (_vd, target) = Harness::default().build().await;
    let mut rng = rng(3);
    let old = payload(&mut rng, 4);
    t!(write_data(&target, 1, 0, &old).await);
    let dzone = make_sequential(&target, 1).await;
    let md = target.metadata();
    assert_eq!(md.zone_state(dzone).wp, 4);

    let new = payload(&mut rng, 1);
    t!(write_data(&target, 1, 1, &new).await);
    let (d, b) = md.map_entry(1);
    assert_eq!(d, Some(dzone));
    let bzone = b.unwrap();
    assert!(md.dir().get(bzone).is_rnd());
    assert_eq!(md.zone_state(bzone).role, Role::Buffer { chunk: 1, dzone });
    assert!(!t!(md.is_valid(dzone, 1).await));
    assert!(t!(md.is_valid(bzone, 1).await));

    let actual = t!(read_data(&target, 1, 0, 4).await);
    assert_eq!(&actual[..BYTES_PER_LBA], &old[..BYTES_PER_LBA]);
    assert_eq!(&actual[BYTES_PER_LBA..2 * BYTES_PER_LBA], &new[..]);
    assert_eq!(&actual[2 * BYTES_PER_LBA..], &old[2 * BYTES_PER_LBA..]);
    t!(target.shutdown().await);
}

/// Writes at the write pointer go directly to the sequential zone, and
/// supersede any buffered copy.
#[tokio::test]
async fn aligned_write_is_direct() {
    let (_vd, target) = Harness::default().build().await;
    let mut rng = rng(4);
    t!(write_data(&target, 2, 0, &payload(&mut rng, 2)).await);
    let dzone = make_sequential(&target, 2).await;
    let md = target.metadata();

    // A gap past the write pointer must be buffered
    let far = payload(&mut rng, 1);
    t!(write_data(&target, 2, 6, &far).await);
    let bzone = md.map_entry(2).1.unwrap();
    assert_eq!(md.zone_state(dzone).wp, 2);

    let next = payload(&mut rng, 5);
    t!(write_data(&target, 2, 2, &next).await);
    assert_eq!(md.zone_state(dzone).wp, 7);
    assert!(t!(md.is_valid(dzone, 6).await));
    // The buffer zone became empty, so it was released
    assert_eq!(md.map_entry(2), (Some(dzone), None));
    assert_eq!(md.zone_state(bzone).role, Role::PendingFree);
    let actual = t!(read_data(&target, 2, 2, 5).await);
    assert_eq!(actual, next);
    t!(target.shutdown().await);
}

#[tokio::test]
async fn discard_reads_zeros() {
    let (_vd, target) = Harness::default().build().await;
    let mut rng = rng(5);
    let data = payload(&mut rng, 8);
    t!(write_data(&target, 4, 0, &data).await);
    t!(target.discard(4, 2, 4).await);
    let actual = t!(read_data(&target, 4, 0, 8).await);
    assert_eq!(&actual[..2 * BYTES_PER_LBA], &data[..2 * BYTES_PER_LBA]);
    assert!(actual[2 * BYTES_PER_LBA..6 * BYTES_PER_LBA].iter()
            .all(|b| *b == 0));
    assert_eq!(&actual[6 * BYTES_PER_LBA..], &data[6 * BYTES_PER_LBA..]);
    t!(target.shutdown().await);
}

/// Discarding a whole chunk frees its zone once the change is committed.
#[tokio::test]
async fn discard_frees_zones() {
    let (_vd, target) = Harness::default().build().await;
    let mut rng = rng(6);
    t!(write_data(&target, 5, 0, &payload(&mut rng, 3)).await);
    let zone = target.metadata().map_entry(5).0.unwrap();
    let free = target.status().nr_unmap_rnd;
    t!(target.discard(5, 0, LPZ).await);
    assert_eq!(target.metadata().map_entry(5), (None, None));
    // Not reusable until the unmapping is committed
    assert_eq!(target.status().nr_unmap_rnd, free);
    assert_eq!(target.status().nr_pending_free, 1);
    t!(target.flush().await);
    assert_eq!(target.status().nr_unmap_rnd, free + 1);
    assert_eq!(target.metadata().zone_state(zone).role, Role::Free);
    t!(target.shutdown().await);
}

#[tokio::test]
async fn errors() {
    let (vd, target) = Harness::default().build().await;
    let n = target.nr_chunks();
    assert_eq!(Err(Error::EINVAL), read_data(&target, n, 0, 1).await);
    assert_eq!(Err(Error::EINVAL), read_data(&target, 0, LPZ, 1).await);
    assert_eq!(Err(Error::EINVAL),
               write_data(&target, 0, 0, &[0u8; 100]).await);
    // Ranges that would overflow
    assert_eq!(Err(Error::EINVAL), read_data(&target, 0, LbaT::MAX, 1).await);
    assert_eq!(Err(Error::EINVAL),
               write_data(&target, 0, LbaT::MAX, &[0u8; BYTES_PER_LBA]).await);
    assert_eq!(Err(Error::EINVAL), target.discard(0, 1, LbaT::MAX).await);
    assert_eq!(Err(Error::EINVAL), target.discard(0, LbaT::MAX, 2).await);

    // A failed write leaves the target usable
    t!(write_data(&target, 0, 0, &[1u8; BYTES_PER_LBA]).await);
    let zone = target.metadata().map_entry(0).0.unwrap();
    let start = LbaT::from(zone) * LPZ;
    vd.fail_writes(start..start + LPZ);
    assert_eq!(Err(Error::EIO),
               write_data(&target, 0, 1, &[2u8; BYTES_PER_LBA]).await);
    vd.clear_faults();
    assert!(!t!(target.metadata().is_valid(zone, 1).await));
    t!(write_data(&target, 0, 1, &[3u8; BYTES_PER_LBA]).await);
    let actual = t!(read_data(&target, 0, 0, 2).await);
    assert!(actual[..BYTES_PER_LBA].iter().all(|b| *b == 1));
    assert!(actual[BYTES_PER_LBA..].iter().all(|b| *b == 3));
    t!(target.shutdown().await);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn random_writes() {
    let (_vd, target) = Harness::default().build().await;
    let mut shadow = Shadow::new(&target);
    let mut rng = rng(7);
    random_workload(&target, &mut shadow, &mut rng, 6, 300).await;
    shadow.verify(&target).await;
    t!(target.shutdown().await);
}

/// Independent chunks may be written concurrently.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_chunks() {
    let (_vd, target) = Harness::default().build().await;
    let target = Arc::new(target);
    let handles = (0..4u32).map(|chunk| {
        let target = target.clone();
        tokio::spawn(async move {
            let mut rng = rng(100 + u64::from(chunk));
            let mut expected = vec![0u8; LPZ as usize * BYTES_PER_LBA];
            for _ in 0..50 {
                let block = rng.gen_range(0..LPZ);
                let data = payload(&mut rng, 1);
                t!(write_data(&target, chunk, block, &data).await);
                let off = block as usize * BYTES_PER_LBA;
                expected[off..off + BYTES_PER_LBA].copy_from_slice(&data);
            }
            (chunk, expected)
        })
    }).collect::<Vec<_>>();
    for h in handles {
        let (chunk, expected) = h.await.unwrap();
        let actual = t!(read_data(&target, chunk, 0, LPZ).await);
        assert!(actual == expected, "chunk {} differs", chunk);
    }
    t!(target.shutdown().await);
}
