//! End-to-end handshake flows, driven through in-process streams

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TestNode, ec_public_key_pem};
use sshsync_server::bus::Broker;
use sshsync_server::pairing::{handle_challenge_response, handle_new_machine};
use sshsync_server::transport::{
    ChallengeSubmission, ChannelStream, EncryptedMasterKey, KeyUpload, MachineInfo, ServerNotice,
    read_message, write_message,
};
use sshsync_server::{Error, MemoryBroker};

async fn start_new_machine(
    node: &TestNode,
    username: &str,
    machine_name: &str,
) -> (
    ChannelStream,
    tokio::task::JoinHandle<sshsync_server::Result<()>>,
) {
    let (mut client, mut server) = ChannelStream::pair();
    let ctx = node.ctx.clone();
    let handle = tokio::spawn(async move { handle_new_machine(&ctx, &mut server).await });

    write_message(
        &mut client,
        &MachineInfo {
            username: username.to_string(),
            machine_name: machine_name.to_string(),
        },
    )
    .await
    .unwrap();
    (client, handle)
}

fn start_responder(
    node: &TestNode,
    caller: &str,
) -> (
    ChannelStream,
    tokio::task::JoinHandle<sshsync_server::Result<()>>,
) {
    let (client, mut server) = ChannelStream::pair();
    let ctx = node.ctx.clone();
    let caller = caller.to_string();
    let handle =
        tokio::spawn(async move { handle_challenge_response(&ctx, &mut server, &caller).await });
    (client, handle)
}

#[tokio::test]
async fn same_node_pairing_end_to_end() {
    let node = TestNode::single(Duration::from_secs(5));
    node.users.create("alice").unwrap();

    let (mut machine, machine_task) = start_new_machine(&node, "alice", "laptop").await;
    let phrase = read_message::<_, ServerNotice>(&mut machine)
        .await
        .unwrap()
        .message;
    assert_eq!(phrase.split('-').count(), 3);

    let (mut responder, responder_task) = start_responder(&node, "alice");
    write_message(
        &mut responder,
        &ChallengeSubmission {
            challenge: phrase.clone(),
        },
    )
    .await
    .unwrap();
    // The acceptance notice goes to the new machine only; the responder's
    // first reply is the relayed key material
    assert_eq!(
        read_message::<_, ServerNotice>(&mut machine)
            .await
            .unwrap()
            .message,
        "Challenge accepted!"
    );

    let public_key = ec_public_key_pem();
    write_message(
        &mut machine,
        &KeyUpload {
            public_key: public_key.clone(),
            encapsulation_key: None,
        },
    )
    .await
    .unwrap();

    let relayed: KeyUpload = read_message(&mut responder).await.unwrap();
    assert_eq!(relayed.public_key, public_key);
    write_message(
        &mut responder,
        &EncryptedMasterKey {
            encrypted_master_key: b"sealed master key".to_vec(),
        },
    )
    .await
    .unwrap();

    let secret: EncryptedMasterKey = read_message(&mut machine).await.unwrap();
    assert_eq!(secret.encrypted_master_key, b"sealed master key");
    assert_eq!(
        read_message::<_, ServerNotice>(&mut machine)
            .await
            .unwrap()
            .message,
        "Everything is done, you can now use ssh-sync"
    );

    responder_task.await.unwrap().unwrap();
    machine_task.await.unwrap().unwrap();

    let stored = node.machines.find("alice", "laptop").unwrap().unwrap();
    assert_eq!(stored.public_key, public_key);
    assert!(node.ctx.sessions.is_empty());
}

#[tokio::test]
async fn unanswered_challenge_times_out() {
    let node = TestNode::single(Duration::from_millis(100));
    node.users.create("alice").unwrap();

    let (mut machine, machine_task) = start_new_machine(&node, "alice", "laptop").await;
    let _phrase: ServerNotice = read_message(&mut machine).await.unwrap();

    let err = read_message::<_, ServerNotice>(&mut machine)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("handshake timed out"), "{err}");

    assert!(matches!(machine_task.await.unwrap(), Err(Error::Timeout)));
    assert!(node.ctx.sessions.is_empty());
    assert!(node.machines.find("alice", "laptop").unwrap().is_none());
}

#[tokio::test]
async fn unknown_user_is_rejected_up_front() {
    let node = TestNode::single(Duration::from_secs(5));

    let (mut machine, machine_task) = start_new_machine(&node, "nobody", "laptop").await;
    let err = read_message::<_, ServerNotice>(&mut machine)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("user not found"), "{err}");
    machine_task.await.unwrap().unwrap();
    assert!(node.ctx.sessions.is_empty());
}

#[tokio::test]
async fn duplicate_machine_name_is_rejected_up_front() {
    let node = TestNode::single(Duration::from_secs(5));
    let alice = node.users.create("alice").unwrap();
    node.machines
        .create(
            alice.id,
            "laptop",
            &ec_public_key_pem(),
            sshsync_server::KeyType::Ecdsa,
            None,
        )
        .unwrap();

    let (mut machine, machine_task) = start_new_machine(&node, "alice", "laptop").await;
    let err = read_message::<_, ServerNotice>(&mut machine)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("machine name already in use"), "{err}");
    machine_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn wrong_phrase_reports_not_found() {
    let node = TestNode::single(Duration::from_secs(5));
    node.users.create("alice").unwrap();

    let (mut responder, responder_task) = start_responder(&node, "alice");
    write_message(
        &mut responder,
        &ChallengeSubmission {
            challenge: "no-such-phrase".to_string(),
        },
    )
    .await
    .unwrap();

    let err = read_message::<_, ServerNotice>(&mut responder)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("challenge not found"), "{err}");
    responder_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn responder_from_other_account_sees_not_found() {
    let node = TestNode::single(Duration::from_millis(200));
    node.users.create("alice").unwrap();

    let (mut machine, machine_task) = start_new_machine(&node, "alice", "laptop").await;
    let phrase = read_message::<_, ServerNotice>(&mut machine)
        .await
        .unwrap()
        .message;

    // Correct phrase, wrong account: indistinguishable from a miss
    let (mut responder, responder_task) = start_responder(&node, "mallory");
    write_message(&mut responder, &ChallengeSubmission { challenge: phrase })
        .await
        .unwrap();
    let err = read_message::<_, ServerNotice>(&mut responder)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("challenge not found"), "{err}");
    responder_task.await.unwrap().unwrap();

    // The session is untouched and dies by timeout, not by the intruder
    assert!(matches!(machine_task.await.unwrap(), Err(Error::Timeout)));
    assert!(node.machines.find("alice", "laptop").unwrap().is_none());
}

#[tokio::test]
async fn cross_node_pairing_via_bus() {
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let node_a = TestNode::on_bus(Arc::clone(&broker), "node-a", Duration::from_secs(5)).await;
    let node_b = TestNode::on_bus(broker, "node-b", Duration::from_secs(5)).await;
    node_a.users.create("alice").unwrap();

    let (mut machine, machine_task) = start_new_machine(&node_a, "alice", "laptop").await;
    let phrase = read_message::<_, ServerNotice>(&mut machine)
        .await
        .unwrap()
        .message;

    // Responder lands on the other node and finds the challenge via the bus
    let (mut responder, responder_task) = start_responder(&node_b, "alice");
    write_message(
        &mut responder,
        &ChallengeSubmission {
            challenge: phrase.clone(),
        },
    )
    .await
    .unwrap();
    // The acceptance notice goes to the new machine only; the responder's
    // first reply is the relayed key material
    assert_eq!(
        read_message::<_, ServerNotice>(&mut machine)
            .await
            .unwrap()
            .message,
        "Challenge accepted!"
    );

    let public_key = ec_public_key_pem();
    write_message(
        &mut machine,
        &KeyUpload {
            public_key: public_key.clone(),
            encapsulation_key: None,
        },
    )
    .await
    .unwrap();

    let relayed: KeyUpload = read_message(&mut responder).await.unwrap();
    assert_eq!(relayed.public_key, public_key);
    write_message(
        &mut responder,
        &EncryptedMasterKey {
            encrypted_master_key: b"sealed across nodes".to_vec(),
        },
    )
    .await
    .unwrap();

    let secret: EncryptedMasterKey = read_message(&mut machine).await.unwrap();
    assert_eq!(secret.encrypted_master_key, b"sealed across nodes");
    let _done: ServerNotice = read_message(&mut machine).await.unwrap();

    responder_task.await.unwrap().unwrap();
    machine_task.await.unwrap().unwrap();

    // Machine lives on the node it connected to; the advertisement is gone
    assert!(node_a.machines.find("alice", "laptop").unwrap().is_some());
    assert!(node_b.machines.find("alice", "laptop").unwrap().is_none());
    assert!(
        node_b
            .ctx
            .bus
            .metadata(&phrase)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn already_accepted_phrase_answers_like_a_miss() {
    let node = TestNode::single(Duration::from_secs(5));
    node.users.create("alice").unwrap();

    // A session whose acceptance slot is already taken
    let session = sshsync_server::PairingSession::new(
        "maple-lantern-otter".to_string(),
        "alice".to_string(),
        "laptop".to_string(),
    );
    assert!(session.accepted.try_send(true));
    node.ctx.sessions.insert(session).unwrap();

    let (mut responder, responder_task) = start_responder(&node, "alice");
    write_message(
        &mut responder,
        &ChallengeSubmission {
            challenge: "maple-lantern-otter".to_string(),
        },
    )
    .await
    .unwrap();

    // Same wording as a nonexistent phrase: the reply must not confirm the
    // phrase is live
    let err = read_message::<_, ServerNotice>(&mut responder)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("challenge not found"), "{err}");
    responder_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn responder_abort_fails_the_handshake() {
    let node = TestNode::single(Duration::from_secs(5));
    node.users.create("alice").unwrap();

    let (mut machine, machine_task) = start_new_machine(&node, "alice", "laptop").await;
    let phrase = read_message::<_, ServerNotice>(&mut machine)
        .await
        .unwrap()
        .message;

    let (responder, responder_task) = start_responder(&node, "alice");
    {
        let mut responder = responder;
        write_message(&mut responder, &ChallengeSubmission { challenge: phrase })
            .await
            .unwrap();
        // Responder hangs up right after accepting; its handler only notices
        // once it tries to relay the key
    }

    let _accepted: ServerNotice = read_message(&mut machine).await.unwrap();
    write_message(
        &mut machine,
        &KeyUpload {
            public_key: ec_public_key_pem(),
            encapsulation_key: None,
        },
    )
    .await
    .unwrap();

    let err = read_message::<_, EncryptedMasterKey>(&mut machine)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("aborted"), "{err}");

    // Only now has the responder handler hit the dropped stream
    assert!(responder_task.await.unwrap().is_err());
    assert!(machine_task.await.unwrap().is_err());
    assert!(node.machines.find("alice", "laptop").unwrap().is_none());
    assert!(node.ctx.sessions.is_empty());
}
