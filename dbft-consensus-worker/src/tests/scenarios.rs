//! End to end consensus scenarios, driving the worker directly.

use super::tools::{make_transaction, setup, setup_as};
use dbft_consensus_exports::messages::{
    ChangeView, ChangeViewReason, Commit, MessageBody, PrepareRequest, PrepareResponse,
};
use dbft_consensus_exports::ConsensusEvent;
use dbft_models::amount::Amount;
use dbft_time::DbftTime;
use more_asserts::assert_ge;
use serial_test::serial;

#[test]
#[serial]
fn test_backup_decides_block_after_quorum() {
    // committee of 4: f = 1, quorum m = 3; block 1 is proposed by validator 1
    let mut fixture = setup(4, 0);
    let prev_hash = fixture.worker.context.prev_hash;
    let request = fixture.peer_payload(
        1,
        0,
        MessageBody::PrepareRequest(PrepareRequest {
            version: 0,
            prev_hash,
            timestamp: DbftTime::from_millis(100_000),
            nonce: 7,
            transaction_hashes: vec![],
        }),
    );
    fixture.worker.on_consensus_payload(request).unwrap();

    // the backup acknowledged the proposal
    let sent = fixture.sent_messages();
    assert!(matches!(
        sent.last().unwrap().body,
        MessageBody::PrepareResponse(_)
    ));
    assert!(!fixture.worker.context.commit_sent());

    // a third preparation completes the quorum: the worker saves its state
    // and commits
    let preparation_hash = fixture.worker.context.preparation_payloads[1]
        .as_ref()
        .unwrap()
        .payload
        .compute_id();
    let response = fixture.peer_payload(
        2,
        0,
        MessageBody::PrepareResponse(PrepareResponse { preparation_hash }),
    );
    fixture.worker.on_consensus_payload(response).unwrap();
    assert!(fixture.worker.context.commit_sent());
    assert!(fixture.config.recovery_log_path.exists());

    // two peer commits reach the quorum and the block is persisted
    let sign_data = fixture.worker.context.block_sign_data().unwrap().unwrap();
    for index in [1u8, 2u8] {
        let signature = fixture.keypairs[index as usize].sign(&sign_data).unwrap();
        let commit = fixture.peer_payload(index, 0, MessageBody::Commit(Commit { signature }));
        fixture.worker.on_consensus_payload(commit).unwrap();
    }
    {
        let state = fixture.ledger.lock().unwrap();
        assert_eq!(state.persisted.len(), 1);
        assert_eq!(state.persisted[0].header.index, 1);
        assert_eq!(state.persisted[0].witness.signatures.len(), 3);
    }
    match fixture.event_receiver.recv() {
        Ok(ConsensusEvent::BlockFinalized { index, .. }) => assert_eq!(index, 1),
        other => panic!("expected a finalized block event, got {:?}", other),
    }
    // the worker moved on to the next height
    assert_eq!(fixture.worker.context.block_index, 2);
    assert_eq!(fixture.worker.context.view_number, 0);
}

#[test]
#[serial]
fn test_seven_validator_committee_decides_empty_block() {
    // committee of 7: f = 2, quorum m = 5; validator 1 is the primary of
    // block 1 and proposes an empty block on its timer
    let mut fixture = setup(7, 1);
    fixture.worker.on_timer(1, 0).unwrap();
    let sent = fixture.sent_messages();
    assert!(matches!(
        sent.last().unwrap().body,
        MessageBody::PrepareRequest(_)
    ));
    assert!(!fixture.worker.context.commit_sent());

    // four acknowledgements complete the quorum of 5 with the proposal
    let preparation_hash = fixture.worker.context.preparation_payloads[1]
        .as_ref()
        .unwrap()
        .payload
        .compute_id();
    for index in [2u8, 3, 4, 5] {
        let response = fixture.peer_payload(
            index,
            0,
            MessageBody::PrepareResponse(PrepareResponse { preparation_hash }),
        );
        fixture.worker.on_consensus_payload(response).unwrap();
    }
    assert!(fixture.worker.context.commit_sent());

    // four peer commits complete the quorum with this node's own commit
    let sign_data = fixture.worker.context.block_sign_data().unwrap().unwrap();
    let validators = fixture.worker.context.validators.clone();
    for index in [2u8, 3, 4, 5] {
        let signature = fixture.keypairs[index as usize].sign(&sign_data).unwrap();
        let commit = fixture.peer_payload(index, 0, MessageBody::Commit(Commit { signature }));
        fixture.worker.on_consensus_payload(commit).unwrap();
    }
    let state = fixture.ledger.lock().unwrap();
    assert_eq!(state.persisted.len(), 1);
    let block = &state.persisted[0];
    assert!(block.transactions.is_empty());
    assert_eq!(block.witness.signatures.len(), 5);
    block.witness.verify(&validators, &sign_data, 5).unwrap();
}

#[test]
#[serial]
fn test_single_validator_decides_on_timer() {
    let mut fixture = setup(1, 0);
    fixture.worker.on_timer(1, 0).unwrap();

    let state = fixture.ledger.lock().unwrap();
    assert_eq!(state.persisted.len(), 1);
    drop(state);
    assert_eq!(fixture.worker.context.block_index, 2);
    let sent = fixture.sent_messages();
    assert!(sent
        .iter()
        .any(|message| matches!(message.body, MessageBody::PrepareRequest(_))));
    assert!(sent
        .iter()
        .any(|message| matches!(message.body, MessageBody::Commit(_))));
}

#[test]
#[serial]
fn test_view_changes_after_timeout_quorum() {
    let mut fixture = setup(4, 0);
    // no proposal arrived: the timer expiry makes the backup vote to leave
    fixture.worker.on_timer(1, 0).unwrap();
    let sent = fixture.sent_messages();
    match &sent.last().unwrap().body {
        MessageBody::ChangeView(change_view) => {
            assert_eq!(change_view.reason, ChangeViewReason::Timeout)
        }
        other => panic!("expected a change view vote, got {:?}", other),
    }
    assert!(fixture.worker.context.view_changing());
    assert_eq!(fixture.worker.context.view_number, 0);

    // two more votes reach the quorum
    for index in [1u8, 2u8] {
        let vote = fixture.peer_payload(
            index,
            0,
            MessageBody::ChangeView(ChangeView {
                timestamp: DbftTime::from_millis(100_000),
                reason: ChangeViewReason::Timeout,
            }),
        );
        fixture.worker.on_consensus_payload(vote).unwrap();
    }
    assert_eq!(fixture.worker.context.view_number, 1);
    // the primary role rotated backwards onto this node
    assert!(fixture.worker.context.is_primary());
}

#[test]
#[serial]
fn test_commit_from_another_view_is_kept_but_not_counted() {
    let mut fixture = setup(4, 0);
    let request = fixture.peer_payload(
        1,
        0,
        MessageBody::PrepareRequest(PrepareRequest {
            version: 0,
            prev_hash: fixture.worker.context.prev_hash,
            timestamp: DbftTime::from_millis(100_000),
            nonce: 7,
            transaction_hashes: vec![],
        }),
    );
    fixture.worker.on_consensus_payload(request).unwrap();

    // validator 3 claims a commit from view 2
    let sign_data = fixture.worker.context.block_sign_data().unwrap().unwrap();
    let signature = fixture.keypairs[3].sign(&sign_data).unwrap();
    let commit = fixture.peer_payload(3, 2, MessageBody::Commit(Commit { signature }));
    fixture.worker.on_consensus_payload(commit).unwrap();

    assert!(fixture.worker.context.commit_payloads[3].is_some());
    // it does not count toward the quorum of the current view
    assert_eq!(fixture.worker.context.count_committed(), 0);
}

#[test]
#[serial]
fn test_quorum_needs_more_than_two_preparations() {
    let mut fixture = setup(4, 0);
    let request = fixture.peer_payload(
        1,
        0,
        MessageBody::PrepareRequest(PrepareRequest {
            version: 0,
            prev_hash: fixture.worker.context.prev_hash,
            timestamp: DbftTime::from_millis(100_000),
            nonce: 7,
            transaction_hashes: vec![],
        }),
    );
    fixture.worker.on_consensus_payload(request).unwrap();

    // proposal plus own acknowledgement is only 2 of the 3 required
    assert_eq!(fixture.worker.context.count_preparations(), 2);
    assert!(!fixture.worker.context.commit_sent());
}

#[test]
#[serial]
fn test_commitment_survives_restart() {
    let mut fixture = setup(4, 0);
    let request = fixture.peer_payload(
        1,
        0,
        MessageBody::PrepareRequest(PrepareRequest {
            version: 0,
            prev_hash: fixture.worker.context.prev_hash,
            timestamp: DbftTime::from_millis(100_000),
            nonce: 7,
            transaction_hashes: vec![],
        }),
    );
    fixture.worker.on_consensus_payload(request).unwrap();
    let preparation_hash = fixture.worker.context.preparation_payloads[1]
        .as_ref()
        .unwrap()
        .payload
        .compute_id();
    let response = fixture.peer_payload(
        2,
        0,
        MessageBody::PrepareResponse(PrepareResponse { preparation_hash }),
    );
    fixture.worker.on_consensus_payload(response).unwrap();
    assert!(fixture.worker.context.commit_sent());
    let committed_payload = fixture.worker.context.commit_payloads[0]
        .as_ref()
        .unwrap()
        .payload
        .clone();

    fixture.drain_sent();
    fixture.restart_worker();

    // the restarted worker honors the commitment it made before the restart
    assert!(fixture.worker.context.commit_sent());
    assert_eq!(
        fixture.worker.context.commit_payloads[0]
            .as_ref()
            .unwrap()
            .payload,
        committed_payload
    );
    // and replays it to the committee
    let sent = fixture.sent_messages();
    assert!(sent
        .iter()
        .any(|message| matches!(message.body, MessageBody::RecoveryMessage(_))));
}

#[test]
#[serial]
fn test_commit_is_never_resigned() {
    let mut fixture = setup(1, 0);
    fixture.worker.on_timer(1, 0).unwrap();
    // height 2: propose but do not let the single validator decide twice
    let first = fixture.worker.context.make_prepare_request(
        DbftTime::from_millis(200_000),
        vec![],
    );
    assert!(first.is_ok());
    let commit_a = fixture.worker.context.make_commit().unwrap();
    let commit_b = fixture.worker.context.make_commit().unwrap();
    assert_eq!(commit_a.payload.data, commit_b.payload.data);
    assert_eq!(
        commit_a.payload.signature.to_bytes(),
        commit_b.payload.signature.to_bytes()
    );
}

#[test]
#[serial]
fn test_proposal_stops_at_block_limits() {
    let mut fixture = setup(4, 0);
    fixture.worker.context.config.max_transactions_per_block = 2;
    let candidates = vec![
        make_transaction(1, 10, vec![1; 16]),
        make_transaction(2, 10, vec![2; 16]),
        make_transaction(3, 10, vec![3; 16]),
    ];
    fixture
        .worker
        .context
        .ensure_max_block_limitation(candidates)
        .unwrap();
    assert_eq!(
        fixture.worker.context.transaction_hashes.as_ref().unwrap().len(),
        2
    );

    // the cumulated system fee also bounds the proposal
    fixture.worker.context.config.max_transactions_per_block = 128;
    fixture.worker.context.config.max_block_system_fee = Amount::from_raw(100);
    let candidates = vec![
        make_transaction(4, 80, vec![4; 16]),
        make_transaction(5, 80, vec![5; 16]),
    ];
    fixture
        .worker
        .context
        .ensure_max_block_limitation(candidates)
        .unwrap();
    assert_eq!(
        fixture.worker.context.transaction_hashes.as_ref().unwrap().len(),
        1
    );
}

#[test]
#[serial]
fn test_designated_node_answers_recovery_request() {
    use dbft_consensus_exports::messages::RecoveryRequest;

    let mut fixture = setup(4, 0);
    // f = 1: the f + 1 followers of the requester answer; 3 + 1 = 0 mod 4
    let request = fixture.peer_payload(
        3,
        0,
        MessageBody::RecoveryRequest(RecoveryRequest {
            timestamp: DbftTime::from_millis(100_000),
        }),
    );
    fixture.worker.on_consensus_payload(request.clone()).unwrap();
    let sent = fixture.sent_messages();
    assert_ge!(sent.len(), 1);
    assert!(matches!(
        sent.last().unwrap().body,
        MessageBody::RecoveryMessage(_)
    ));

    // the very same payload was answered already
    fixture.drain_sent();
    fixture.worker.on_consensus_payload(request).unwrap();
    assert!(fixture.sent_messages().is_empty());

    // a request from validator 1 designates validators 2 and 3, not this node
    fixture.drain_sent();
    let request = fixture.peer_payload(
        1,
        0,
        MessageBody::RecoveryRequest(RecoveryRequest {
            timestamp: DbftTime::from_millis(100_000),
        }),
    );
    fixture.worker.on_consensus_payload(request).unwrap();
    assert!(fixture.sent_messages().is_empty());
}

#[test]
#[serial]
fn test_future_block_index_requests_sync() {
    let mut fixture = setup(4, 0);
    let payload = fixture.peer_payload_at(
        5,
        1,
        0,
        MessageBody::PrepareRequest(PrepareRequest {
            version: 0,
            prev_hash: fixture.worker.context.prev_hash,
            timestamp: DbftTime::from_millis(100_000),
            nonce: 7,
            transaction_hashes: vec![],
        }),
    );
    fixture.worker.on_consensus_payload(payload).unwrap();
    match fixture.event_receiver.recv() {
        Ok(ConsensusEvent::NeedSync {
            current_index,
            observed_index,
        }) => {
            assert_eq!(current_index, 0);
            assert_eq!(observed_index, 5);
        }
        other => panic!("expected a sync request event, got {:?}", other),
    }
}

#[test]
#[serial]
fn test_commits_stop_extending_the_view_timer() {
    let mut fixture = setup(4, 0);
    let request = fixture.peer_payload(
        1,
        0,
        MessageBody::PrepareRequest(PrepareRequest {
            version: 0,
            prev_hash: fixture.worker.context.prev_hash,
            timestamp: DbftTime::from_millis(100_000),
            nonce: 7,
            transaction_hashes: vec![],
        }),
    );
    fixture.worker.on_consensus_payload(request).unwrap();
    let sign_data = fixture.worker.context.block_sign_data().unwrap().unwrap();

    // a commit claimed from a later view is kept but buys no extra time
    let deadline = fixture.worker.timer_deadline;
    let signature = fixture.keypairs[3].sign(&sign_data).unwrap();
    let commit = fixture.peer_payload(3, 2, MessageBody::Commit(Commit { signature }));
    fixture.worker.on_consensus_payload(commit).unwrap();
    assert!(fixture.worker.context.commit_payloads[3].is_some());
    assert_eq!(fixture.worker.timer_deadline, deadline);

    // a third preparation completes the quorum: this node commits
    let preparation_hash = fixture.worker.context.preparation_payloads[1]
        .as_ref()
        .unwrap()
        .payload
        .compute_id();
    let response = fixture.peer_payload(
        2,
        0,
        MessageBody::PrepareResponse(PrepareResponse { preparation_hash }),
    );
    fixture.worker.on_consensus_payload(response).unwrap();
    assert!(fixture.worker.context.commit_sent());

    // a committed node no longer grants grace periods
    let deadline = fixture.worker.timer_deadline;
    let signature = fixture.keypairs[1].sign(&sign_data).unwrap();
    let commit = fixture.peer_payload(1, 0, MessageBody::Commit(Commit { signature }));
    fixture.worker.on_consensus_payload(commit).unwrap();
    assert!(fixture.worker.context.commit_payloads[1].is_some());
    assert_eq!(fixture.worker.timer_deadline, deadline);
}

#[test]
#[serial]
fn test_view_changing_node_keeps_its_deadline() {
    use dbft_hash::Hash;

    let mut fixture = setup(4, 0);
    // no proposal arrived: the timer expiry makes this node vote to leave
    fixture.worker.on_timer(1, 0).unwrap();
    assert!(fixture.worker.context.view_changing());

    // a commit stored while the node wants out of the view buys no time
    let deadline = fixture.worker.timer_deadline;
    let signature = fixture.keypairs[3]
        .sign(&Hash::compute_from(b"unchecked until the proposal is known"))
        .unwrap();
    let commit = fixture.peer_payload(3, 0, MessageBody::Commit(Commit { signature }));
    fixture.worker.on_consensus_payload(commit).unwrap();
    assert!(fixture.worker.context.commit_payloads[3].is_some());
    assert_eq!(fixture.worker.timer_deadline, deadline);
}

#[test]
#[serial]
fn test_committed_node_never_changes_view() {
    let mut fixture = setup(4, 0);
    let request = fixture.peer_payload(
        1,
        0,
        MessageBody::PrepareRequest(PrepareRequest {
            version: 0,
            prev_hash: fixture.worker.context.prev_hash,
            timestamp: DbftTime::from_millis(100_000),
            nonce: 7,
            transaction_hashes: vec![],
        }),
    );
    fixture.worker.on_consensus_payload(request).unwrap();
    let preparation_hash = fixture.worker.context.preparation_payloads[1]
        .as_ref()
        .unwrap()
        .payload
        .compute_id();
    let response = fixture.peer_payload(
        2,
        0,
        MessageBody::PrepareResponse(PrepareResponse { preparation_hash }),
    );
    fixture.worker.on_consensus_payload(response).unwrap();
    assert!(fixture.worker.context.commit_sent());

    // the timer of a committed node asks for help instead of leaving the view
    fixture.drain_sent();
    fixture.worker.on_timer(1, 0).unwrap();
    let sent = fixture.sent_messages();
    assert!(matches!(
        sent.last().unwrap().body,
        MessageBody::RecoveryMessage(_)
    ));
    assert!(!sent
        .iter()
        .any(|message| matches!(message.body, MessageBody::ChangeView(_))));

    // even a quorum's worth of change view votes does not move it
    fixture.drain_sent();
    for index in [1u8, 2, 3] {
        let vote = fixture.peer_payload(
            index,
            0,
            MessageBody::ChangeView(ChangeView {
                timestamp: DbftTime::from_millis(100_000),
                reason: ChangeViewReason::Timeout,
            }),
        );
        fixture.worker.on_consensus_payload(vote).unwrap();
    }
    assert_eq!(fixture.worker.context.view_number, 0);
    assert!(fixture.worker.context.commit_sent());
    assert!(!fixture
        .sent_messages()
        .iter()
        .any(|message| matches!(message.body, MessageBody::ChangeView(_))));
}

#[test]
#[serial]
fn test_forged_recovery_log_commit_is_dropped() {
    use super::tools::CHAIN_ID;
    use crate::context::serialization::ContextSnapshotSerializer;
    use dbft_models::payload::ConsensusPayload;
    use dbft_serialization::Serializer;

    let mut fixture = setup(4, 0);
    let request = fixture.peer_payload(
        1,
        0,
        MessageBody::PrepareRequest(PrepareRequest {
            version: 0,
            prev_hash: fixture.worker.context.prev_hash,
            timestamp: DbftTime::from_millis(100_000),
            nonce: 7,
            transaction_hashes: vec![],
        }),
    );
    fixture.worker.on_consensus_payload(request).unwrap();
    let preparation_hash = fixture.worker.context.preparation_payloads[1]
        .as_ref()
        .unwrap()
        .payload
        .compute_id();
    let response = fixture.peer_payload(
        2,
        0,
        MessageBody::PrepareResponse(PrepareResponse { preparation_hash }),
    );
    fixture.worker.on_consensus_payload(response).unwrap();
    assert!(fixture.worker.context.commit_sent());

    // rewrite the log, re-signing this node's commit with another key
    let mut snapshot = fixture.worker.context.load().unwrap();
    let entry = snapshot
        .commit_payloads
        .iter_mut()
        .find(|(index, _)| *index == 0)
        .unwrap();
    let signable = ConsensusPayload::compute_signable_hash(CHAIN_ID, &entry.1.data).unwrap();
    entry.1.signature = fixture.keypairs[1].sign(&signable).unwrap();
    let mut buffer = Vec::new();
    ContextSnapshotSerializer::new()
        .serialize(&snapshot, &mut buffer)
        .unwrap();
    std::fs::write(&fixture.config.recovery_log_path, buffer).unwrap();

    fixture.drain_sent();
    fixture.restart_worker();

    // the forged commit did not survive verification, the rest of the round did
    assert!(!fixture.worker.context.commit_sent());
    assert!(fixture.worker.context.commit_payloads[0].is_none());
    assert!(fixture.worker.context.preparation_payloads[1].is_some());
}

#[test]
#[serial]
fn test_recovery_message_brings_lagging_node_to_commit() {
    // validator 1 is the primary of block 1 and gathers a full quorum
    let mut primary = setup(4, 1);
    primary.worker.on_timer(1, 0).unwrap();
    let preparation_hash = primary.worker.context.preparation_payloads[1]
        .as_ref()
        .unwrap()
        .payload
        .compute_id();
    for index in [2u8, 3u8] {
        let response = primary.peer_payload(
            index,
            0,
            MessageBody::PrepareResponse(PrepareResponse { preparation_hash }),
        );
        primary.worker.on_consensus_payload(response).unwrap();
    }
    assert!(primary.worker.context.commit_sent());
    let recovery = primary.worker.context.make_recovery_message().unwrap();

    // validator 0 saw nothing of this round and replays the recovery message
    let mut lagging = setup_as(0, primary.keypairs.clone());
    lagging
        .worker
        .on_consensus_payload(recovery.payload)
        .unwrap();

    // the replay carried the proposal, the acknowledgements and the commit
    assert!(lagging.worker.context.request_sent_or_received());
    assert!(lagging.worker.context.commit_sent());
    assert_eq!(lagging.worker.context.count_committed(), 2);
}
