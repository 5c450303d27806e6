//! End-to-end tests of the state manager against the mock chain: block
//! assembly from ordered batches, the membership window, checkpointing, and
//! checkpoint-driven restoration.

use libp2p::PeerId;
use mir_consensus::testing::{
    fake_certificate, test_message, test_validator_set, MemoryWallet, MockChain,
};
use mir_consensus::{
    cache::BlockCache, validation, CheckpointStore, ConfigurationManager, Error, MemoryStore,
    RequestPool, StateManager,
};
use mir_smr::{AppLogic, EpochConfig, EpochNr, NodeId, Request, Snapshot, StableCheckpoint};
use mir_types::{Checkpoint, Height, ValidatorSet};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const CONFIG_OFFSET: u64 = 1;
const SEGMENT_LENGTH: u64 = 1;

struct Node {
    chain: Arc<MockChain>,
    config_manager: Arc<ConfigurationManager>,
    pool: Arc<Mutex<RequestPool>>,
    store: CheckpointStore,
    sm: StateManager,
}

async fn make_node(set: &ValidatorSet, index: usize) -> Node {
    make_node_with_repo(set, index, None).await
}

async fn make_node_with_repo(
    set: &ValidatorSet,
    index: usize,
    checkpoint_repo: Option<std::path::PathBuf>,
) -> Node {
    let id = set.validators()[index].id();
    let chain = Arc::new(MockChain::new());
    let metadata = Arc::new(MemoryStore::new());
    let store = CheckpointStore::new(metadata.clone());
    let config_manager = Arc::new(ConfigurationManager::new(metadata, id.clone()));
    let pool = Arc::new(Mutex::new(RequestPool::new()));

    let sm = StateManager::new(
        id,
        set.membership(),
        EpochNr(0),
        chain.clone(),
        store.clone(),
        config_manager.clone(),
        pool.clone(),
        CancellationToken::new(),
        CONFIG_OFFSET,
        SEGMENT_LENGTH,
        checkpoint_repo,
    )
    .await
    .unwrap();

    Node {
        chain,
        config_manager,
        pool,
        store,
        sm,
    }
}

fn config_request(set: &ValidatorSet, voter_index: usize, req_no: u64, voted: &ValidatorSet) -> Request {
    Request::configuration(
        set.validators()[voter_index].addr.to_string(),
        req_no,
        voted.to_bytes().unwrap(),
    )
}

#[tokio::test(start_paused = true)]
async fn ordered_batches_become_blocks() {
    let set = test_validator_set(4, 0);
    let mut node = make_node(&set, 0).await;

    let sender = &set.validators()[1].addr;
    let msg = test_message(sender, 0);
    let request = Request::transport(sender.to_string(), 0, msg.to_bytes().unwrap());

    node.sm.apply_txs(vec![request]).await.unwrap();
    node.sm.apply_txs(vec![]).await.unwrap();
    node.sm.apply_txs(vec![]).await.unwrap();

    assert_eq!(node.chain.height(), Height(3));
    for h in 1..=3u64 {
        let block = node.chain.block_at(Height(h)).unwrap();
        assert_eq!(block.header.timestamp, h);
        assert!(block.header.miner.is_system_actor());
        assert_eq!(block.header.parents.len(), 1);
        assert!(!block.header.has_checkpoint());
        validation::block_sanity_checks(&block.header).unwrap();
    }
    // The message landed in the first block only.
    assert_eq!(node.chain.block_at(Height(1)).unwrap().messages, vec![msg]);
    assert!(node.chain.block_at(Height(2)).unwrap().messages.is_empty());
}

#[tokio::test(start_paused = true)]
async fn committed_transport_request_is_released_from_pool() {
    let set = test_validator_set(4, 0);
    let mut node = make_node(&set, 0).await;

    let sender = &set.validators()[1].addr;
    let msg = test_message(sender, 0);
    node.pool
        .lock()
        .add(msg.cid(), sender.as_str(), msg.message.nonce);

    let request = Request::transport(sender.to_string(), 0, msg.to_bytes().unwrap());
    node.sm.apply_txs(vec![request]).await.unwrap();
    assert!(node.pool.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn weak_quorum_applies_pending_membership() {
    let set = test_validator_set(4, 0);
    let mut node = make_node(&set, 0).await;
    let proposed = test_validator_set(5, 1);

    let pending_slot = EpochNr(CONFIG_OFFSET + 1);
    let initial_pending = node.sm.memberships()[&pending_slot].clone();

    // One vote is not enough for n = 4.
    node.sm
        .apply_txs(vec![config_request(&set, 0, 0, &proposed)])
        .await
        .unwrap();
    assert_eq!(node.sm.memberships()[&pending_slot], initial_pending);

    // The same voter again changes nothing: votes are deduplicated by id.
    node.sm
        .apply_txs(vec![config_request(&set, 0, 0, &proposed)])
        .await
        .unwrap();
    assert_eq!(node.sm.memberships()[&pending_slot], initial_pending);

    // A second distinct voter reaches the weak quorum (⌊3/3⌋ + 1 = 2).
    node.sm
        .apply_txs(vec![config_request(&set, 1, 0, &proposed)])
        .await
        .unwrap();
    assert_eq!(node.sm.memberships()[&pending_slot], proposed.membership());

    // The votes were persisted with the proposal's configuration number.
    let votes = node.config_manager.votes().unwrap();
    assert_eq!(votes.records.len(), 1);
    assert_eq!(votes.records[0].configuration_number, 1);
    assert_eq!(
        votes.records[0].valset_hash,
        proposed.hash().to_string()
    );
    assert_eq!(votes.records[0].voted_validators.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn own_configuration_request_is_marked_applied() {
    let set = test_validator_set(4, 0);
    let mut node = make_node(&set, 0).await;
    let proposed = test_validator_set(5, 1);

    let request = node
        .config_manager
        .new_tx(proposed.to_bytes().unwrap())
        .unwrap();
    assert_eq!(request.req_no, 0);
    assert_eq!(node.config_manager.next_applied_configuration_number().unwrap(), 0);

    node.sm.apply_txs(vec![request]).await.unwrap();
    assert_eq!(node.config_manager.next_applied_configuration_number().unwrap(), 1);
    assert!(node.config_manager.pending().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn new_epoch_slides_the_window() {
    let set = test_validator_set(4, 0);
    let mut node = make_node(&set, 0).await;

    // Initially: the current epoch plus config_offset + 1 future entries.
    let epochs: Vec<u64> = node.sm.memberships().keys().map(|e| e.0).collect();
    assert_eq!(epochs, vec![0, 1, 2]);

    let returned = node.sm.new_epoch(EpochNr(1)).await.unwrap();
    assert_eq!(node.sm.current_epoch(), EpochNr(1));

    // The fresh mutable slot is a copy of the last fixed membership.
    let epochs: Vec<u64> = node.sm.memberships().keys().map(|e| e.0).collect();
    assert_eq!(epochs, vec![0, 1, 2, 3]);
    assert_eq!(node.sm.memberships()[&EpochNr(3)], node.sm.memberships()[&EpochNr(2)]);
    assert_eq!(returned, node.sm.memberships()[&EpochNr(2)]);

    // Older epochs are garbage collected as the window slides on.
    node.sm.new_epoch(EpochNr(2)).await.unwrap();
    node.sm.new_epoch(EpochNr(3)).await.unwrap();
    let epochs: Vec<u64> = node.sm.memberships().keys().map(|e| e.0).collect();
    assert_eq!(epochs, vec![2, 3, 4, 5]);
}

#[tokio::test(start_paused = true)]
async fn epoch_must_advance_by_exactly_one() {
    let set = test_validator_set(4, 0);
    let mut node = make_node(&set, 0).await;

    let err = node.sm.new_epoch(EpochNr(2)).await.unwrap_err();
    let err = err.downcast::<Error>().unwrap();
    assert!(matches!(err, Error::StateMachineFault(_)));
}

#[tokio::test(start_paused = true)]
async fn batch_over_unexpected_head_is_a_fault() {
    let set = test_validator_set(4, 0);
    let mut node = make_node(&set, 0).await;
    node.sm.apply_txs(vec![]).await.unwrap();

    // A block appears behind the state manager's back, so the head no
    // longer matches the height of the last applied batch.
    let template = mir_types::BlockTemplate {
        miner: mir_types::Address::system_actor(),
        parents: node.chain.chain_head().await.unwrap().key(),
        height: Height(2),
        timestamp: 2,
        ticket: None,
        election_proof: None,
        messages: vec![],
    };
    let block = node
        .chain
        .miner_create_block(template)
        .await
        .unwrap()
        .unwrap();
    node.chain.sync_submit_block(block).await.unwrap();

    let err = node.sm.apply_txs(vec![]).await.unwrap_err();
    let err = err.downcast::<Error>().unwrap();
    assert!(matches!(err, Error::StateMachineFault(_)));
}

#[tokio::test(start_paused = true)]
async fn checkpoint_pipeline_embeds_into_next_block() {
    let set = test_validator_set(4, 0);
    let mut node = make_node(&set, 0).await;
    // Checkpoint period: segment_length × |membership| = 4.
    for _ in 0..4 {
        node.sm.apply_txs(vec![]).await.unwrap();
    }

    let app_data = node.sm.snapshot().await.unwrap();
    let snapshot = Checkpoint::from_bytes(&app_data).unwrap();
    assert_eq!(snapshot.height, Height(5));
    assert_eq!(snapshot.parent.height, Height(1));
    // Covered heights, most recent first.
    assert_eq!(snapshot.block_cids.len(), 4);
    for (i, cid) in snapshot.block_cids.iter().enumerate() {
        let block = node.chain.block_at(Height(4 - i as u64)).unwrap();
        assert_eq!(*cid, block.header.cid());
    }

    // Fill the pool to observe the purge on checkpoint commit.
    node.pool.lock().add(mir_types::Cid::of(b"m"), "t1sender", 0);

    let stable = StableCheckpoint {
        sn: 4,
        snapshot: Snapshot {
            app_data: app_data.clone(),
            epoch_config: EpochConfig {
                epoch: EpochNr(0),
                memberships: BTreeMap::from([(EpochNr(0), set.membership())]),
            },
        },
        cert: fake_certificate(
            &set.validators().iter().map(|v| v.addr.clone()).collect::<Vec<_>>(),
            &app_data,
        ),
    };
    node.sm.checkpoint(stable.clone()).await.unwrap();

    // Four records, all readable back.
    assert_eq!(node.store.latest().unwrap(), Some(snapshot.clone()));
    assert_eq!(node.store.latest_stable().unwrap(), Some(stable.clone()));
    assert!(node.store.by_height(Height(5)).unwrap().is_some());
    assert_eq!(
        node.store.by_cid(&snapshot.cid().unwrap()).unwrap(),
        Some(snapshot.clone())
    );
    assert_eq!(node.sm.prev_checkpoint().height, Height(5));
    assert!(node.pool.lock().is_empty());

    // The next block carries the checkpoint in its reused header slots.
    node.sm.apply_txs(vec![]).await.unwrap();
    let block = node.chain.block_at(Height(5)).unwrap();
    assert!(block.header.has_checkpoint());
    assert_eq!(block.header.ticket.as_deref(), Some(app_data.as_slice()));

    // And the block validates end to end, certificate included.
    let parent = node.chain.chain_get_tipset_by_height(Height(4)).await.unwrap();
    validation::block_sanity_checks(&block.header).unwrap();
    validation::validate_against_parent(&block.header, &parent).unwrap();
    let cache = BlockCache::new();
    validation::validate_block_checkpoint(&block.header, &MemoryWallet, &cache)
        .await
        .unwrap();

    // A block after the checkpoint block goes back to empty slots.
    node.sm.apply_txs(vec![]).await.unwrap();
    assert!(!node.chain.block_at(Height(6)).unwrap().header.has_checkpoint());
}

#[tokio::test(start_paused = true)]
async fn checkpoint_is_mirrored_to_repo() {
    let set = test_validator_set(4, 0);
    let repo = tempfile::tempdir().unwrap();
    let mut node = make_node_with_repo(&set, 0, Some(repo.path().to_path_buf())).await;
    for _ in 0..4 {
        node.sm.apply_txs(vec![]).await.unwrap();
    }

    let app_data = node.sm.snapshot().await.unwrap();
    let stable = StableCheckpoint {
        sn: 4,
        snapshot: Snapshot {
            app_data: app_data.clone(),
            epoch_config: EpochConfig {
                epoch: EpochNr(0),
                memberships: BTreeMap::from([(EpochNr(0), set.membership())]),
            },
        },
        cert: fake_certificate(&[set.validators()[0].addr.clone()], &app_data),
    };
    node.sm.checkpoint(stable.clone()).await.unwrap();

    // The mirror write runs off the critical path; wait for it to land.
    let path = repo.path().join("checkpoint-5.chkp");
    for _ in 0..1000 {
        if path.exists() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }

    let mirrored = std::fs::read(&path).unwrap();
    assert_eq!(
        mir_smr::StableCheckpoint::deserialize(&mirrored).unwrap(),
        stable
    );
}

#[tokio::test(start_paused = true)]
async fn restore_state_syncs_from_peer() {
    let set = test_validator_set(4, 0);
    let mut ahead = make_node(&set, 0).await;
    for _ in 0..4 {
        ahead.sm.apply_txs(vec![]).await.unwrap();
    }
    let app_data = ahead.sm.snapshot().await.unwrap();
    let snapshot = Checkpoint::from_bytes(&app_data).unwrap();

    let stable = StableCheckpoint {
        sn: 4,
        snapshot: Snapshot {
            app_data,
            epoch_config: EpochConfig {
                epoch: EpochNr(2),
                memberships: BTreeMap::from([
                    (EpochNr(2), set.membership()),
                    (EpochNr(3), set.membership()),
                ]),
            },
        },
        cert: fake_certificate(&[set.validators()[0].addr.clone()], &[]),
    };

    // A fresh node, behind the committee, with the producer as its peer.
    let mut behind = make_node(&set, 1).await;
    let peer = PeerId::random();
    behind.chain.add_peer(peer, ahead.chain.clone());

    behind.sm.restore_state(stable).await.unwrap();

    // Chain state caught up to the checkpointed range.
    assert_eq!(behind.chain.height(), Height(4));
    for h in 1..=4u64 {
        assert_eq!(
            behind.chain.block_at(Height(h)).unwrap().header.cid(),
            ahead.chain.block_at(Height(h)).unwrap().header.cid()
        );
    }

    // Epoch state was overwritten from the checkpoint, with a recomputed
    // pending slot.
    assert_eq!(behind.sm.current_epoch(), EpochNr(2));
    assert!(behind.sm.memberships().contains_key(&EpochNr(4)));

    // The checkpoint is re-delivered into the next produced block.
    behind.sm.apply_txs(vec![]).await.unwrap();
    assert!(behind
        .chain
        .block_at(Height(5))
        .unwrap()
        .header
        .has_checkpoint());
}

#[tokio::test(start_paused = true)]
async fn restore_state_without_peers_is_fatal() {
    let set = test_validator_set(4, 0);
    let mut ahead = make_node(&set, 0).await;
    for _ in 0..4 {
        ahead.sm.apply_txs(vec![]).await.unwrap();
    }
    let app_data = ahead.sm.snapshot().await.unwrap();

    let stable = StableCheckpoint {
        sn: 4,
        snapshot: Snapshot {
            app_data,
            epoch_config: EpochConfig {
                epoch: EpochNr(2),
                memberships: BTreeMap::from([(EpochNr(2), set.membership())]),
            },
        },
        cert: fake_certificate(&[set.validators()[0].addr.clone()], &[]),
    };

    let mut behind = make_node(&set, 1).await;
    let err = behind.sm.restore_state(stable).await.unwrap_err();
    let err = err.downcast::<Error>().unwrap();
    assert!(matches!(err, Error::RestoreFailure(_)));
}

#[tokio::test(start_paused = true)]
async fn undecodable_ordered_validator_set_is_fatal() {
    let set = test_validator_set(4, 0);
    let mut node = make_node(&set, 0).await;

    let bogus = Request::configuration(
        set.validators()[0].addr.to_string(),
        0,
        b"not a validator set".to_vec(),
    );
    let err = node.sm.apply_txs(vec![bogus]).await.unwrap_err();
    let err = err.downcast::<Error>().unwrap();
    assert!(matches!(err, Error::StateMachineFault(_)));
}

#[tokio::test(start_paused = true)]
async fn node_id_must_match_a_validator() {
    // Sanity on the fixtures: every node id resolves back to its validator.
    let set = test_validator_set(4, 0);
    for v in set.validators() {
        assert_eq!(set.validator(&v.id()), Some(v));
    }
    assert_eq!(set.validator(&NodeId::from("t1stranger")), None);
}
