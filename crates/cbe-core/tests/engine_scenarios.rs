//! End-to-end scenarios against `Engine`, driven entirely through its
//! public API (submit a request, tick `execute()`, drain `poll_completed`).

use cbe_core::model::limits;
use cbe_core::{Block, CompletedRequest, Engine, EngineConfig, ManualClock, Operation, StartupError};
use cbe_crypto::BlockCipher;

const HEIGHT: u32 = 1;
const DEGREE: u32 = limits::TREE_MIN_DEGREE;
const FREE_POOL: usize = 8;
const CAPACITY: u64 = 32;

fn cipher() -> BlockCipher {
    BlockCipher::new([0x42; cbe_crypto::KEY_LEN])
}

fn mounted() -> Engine<ManualClock> {
    let mut backend = cbe_core::InMemoryBackend::new(CAPACITY);
    cbe_core::format(&mut backend, &cipher(), HEIGHT, DEGREE, FREE_POOL).expect("format succeeds");
    Engine::mount(Box::new(backend), cipher(), ManualClock::new(), EngineConfig::default()).expect("mount succeeds")
}

fn block_of(fill: u8) -> Block {
    Block::from_bytes([fill; 4096])
}

/// Drives `engine` until the named request shows up as completed, or
/// panics after a generous bound — a real bug would hang forever, not
/// quietly under-deliver.
fn drive_to_completion(engine: &mut Engine<ManualClock>, id: cbe_core::RequestId) -> CompletedRequest {
    for _ in 0..500 {
        engine.execute();
        if let Some(completed) = engine.poll_completed() {
            assert_eq!(completed.request.id, id, "unexpected request completed first");
            return completed;
        }
    }
    panic!("request {id:?} never completed within the tick budget");
}

#[test]
fn fresh_device_write_then_read_round_trips() {
    let mut engine = mounted();

    let id = engine
        .submit_request(Operation::Write, 1, 1, 0, Some(vec![block_of(0xAB)]))
        .expect("write accepted");
    let completed = drive_to_completion(&mut engine, id);
    assert!(completed.success);

    let id = engine.submit_request(Operation::Read, 1, 1, 0, None).expect("read accepted");
    let completed = drive_to_completion(&mut engine, id);
    assert!(completed.success);
    assert_eq!(completed.data.unwrap()[0], block_of(0xAB));
}

#[test]
fn unwritten_leaves_read_back_as_zero() {
    let mut engine = mounted();

    let id = engine.submit_request(Operation::Read, 2, 1, 0, None).expect("read accepted");
    let completed = drive_to_completion(&mut engine, id);
    assert!(completed.success);
    assert_eq!(completed.data.unwrap()[0], Block::zeroed());
}

#[test]
fn request_out_of_range_is_rejected_without_touching_the_engine() {
    let mut engine = mounted();
    let max_vba = (DEGREE as u64).pow(HEIGHT) - 1;

    let err = engine
        .submit_request(Operation::Read, max_vba + 1, 1, 0, None)
        .unwrap_err();
    assert!(matches!(err, cbe_core::RequestError::OutOfRange { .. }));
}

#[test]
fn request_pool_rejects_once_full() {
    let mut backend = cbe_core::InMemoryBackend::new(CAPACITY);
    cbe_core::format(&mut backend, &cipher(), HEIGHT, DEGREE, FREE_POOL).unwrap();
    let config = EngineConfig {
        request_pool_capacity: 1,
        ..EngineConfig::default()
    };
    let mut engine = Engine::mount(Box::new(backend), cipher(), ManualClock::new(), config).unwrap();

    engine
        .submit_request(Operation::Read, 0, 1, 0, None)
        .expect("first request fits");
    let err = engine.submit_request(Operation::Read, 1, 1, 0, None).unwrap_err();
    assert!(matches!(err, cbe_core::RequestError::PoolFull));
}

#[test]
fn corrupted_leaf_fails_the_read_with_an_integrity_error() {
    // `format`'s zero tree lays leaves out at deterministic addresses
    // (reserved slots, then the free-tree directory, then root-to-leaf in
    // allocation order); corrupt vba 0's leaf before mounting so the very
    // first read has to walk through it.
    let mut backend = cbe_core::InMemoryBackend::new(CAPACITY);
    cbe_core::format(&mut backend, &cipher(), HEIGHT, DEGREE, FREE_POOL).unwrap();
    let leaf_pba = limits::NUM_SUPER_BLOCKS as u64 + 1; // first leaf: superblocks, then the free-tree directory, then leaves
    backend.corrupt(leaf_pba);

    let mut engine = Engine::mount(Box::new(backend), cipher(), ManualClock::new(), EngineConfig::default()).unwrap();

    let id = engine.submit_request(Operation::Read, 0, 1, 0, None).unwrap();
    let completed = drive_to_completion(&mut engine, id);
    assert!(!completed.success);
    assert!(completed.data.is_none());
}

#[test]
fn keep_flagged_snapshot_survives_after_current_moves_on() {
    let mut engine = mounted();

    let id = engine
        .submit_request(Operation::Write, 0, 1, 0, Some(vec![block_of(0xA1)]))
        .unwrap();
    drive_to_completion(&mut engine, id);

    let original_id = engine.current_snapshot_id();
    assert!(engine.mark_snapshot_keep(original_id));

    // Force a sync: the sync request itself carries no primitives and
    // completes immediately, but it arms `need_to_sync` so the next
    // write's commit seals a fresh snapshot.
    let sync_id = engine.submit_request(Operation::Sync, 0, 0, 0, None).unwrap();
    drive_to_completion(&mut engine, sync_id);

    let id = engine
        .submit_request(Operation::Write, 1, 1, 0, Some(vec![block_of(0xB2)]))
        .unwrap();
    drive_to_completion(&mut engine, id);
    // Let the sync sequence's cache flush and superblock update settle.
    for _ in 0..10 {
        engine.execute();
    }

    let new_id = engine.current_snapshot_id();
    assert_ne!(new_id, original_id, "sync should have sealed a fresh snapshot");

    // The original, kept snapshot still shows its own state: vba 0
    // written, vba 1 untouched.
    let kept_vba0 = engine.read_snapshot_block(original_id, 0).unwrap();
    let kept_vba1 = engine.read_snapshot_block(original_id, 1).unwrap();
    assert_eq!(kept_vba0, block_of(0xA1));
    assert_eq!(kept_vba1, Block::zeroed());

    // The current working tree reflects both writes.
    let current_vba0 = engine.read_snapshot_block(new_id, 0).unwrap();
    let current_vba1 = engine.read_snapshot_block(new_id, 1).unwrap();
    assert_eq!(current_vba0, block_of(0xA1));
    assert_eq!(current_vba1, block_of(0xB2));
}

#[test]
fn format_rejects_degree_below_minimum() {
    let mut backend = cbe_core::InMemoryBackend::new(CAPACITY);
    let err = cbe_core::format(&mut backend, &cipher(), HEIGHT, DEGREE - 1, FREE_POOL).unwrap_err();
    assert!(matches!(err, StartupError::TreeDegreeTooLow { .. }));
}

#[test]
fn format_rejects_height_out_of_range() {
    let mut backend = cbe_core::InMemoryBackend::new(CAPACITY);
    let err = cbe_core::format(&mut backend, &cipher(), limits::TREE_MAX_HEIGHT + 1, DEGREE, FREE_POOL).unwrap_err();
    assert!(matches!(err, StartupError::TreeHeightOutOfRange { .. }));
}

#[test]
fn format_rejects_a_device_too_small_for_the_requested_geometry() {
    let mut backend = cbe_core::InMemoryBackend::new(4);
    let err = cbe_core::format(&mut backend, &cipher(), HEIGHT, DEGREE, FREE_POOL).unwrap_err();
    assert!(matches!(err, StartupError::DeviceTooSmall { .. }));
}
