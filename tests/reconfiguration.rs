mod common;

use std::time::Duration;

use gigapaxos::{EpochState, PacketType, PaxosError, Request};

use common::{empty_state, eventually, propose, Cluster};

const PATIENCE: Duration = Duration::from_secs(10);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconfiguration_moves_state_to_the_new_group() {
    let cluster = Cluster::start(5);
    let reconfigurator = cluster.reconfigurator(0);
    reconfigurator.create("kv", vec![0, 1, 2], empty_state()).await.unwrap();

    for id in 0..5u64 {
        propose(cluster.manager(1), "kv", 0, id, &[id as u8]).await;
    }

    assert_eq!(reconfigurator.reconfigure("kv", vec![4, 3, 2]).await, Ok(1));
    let record = reconfigurator.record("kv").unwrap();
    assert_eq!(record.epoch, 1);
    assert_eq!(record.group, vec![2, 3, 4]);
    assert_eq!(record.state, EpochState::Active);

    assert!(eventually(PATIENCE, || {
        cluster.manager(3).services() == vec![("kv".to_owned(), 1)]
    }).await);
    propose(cluster.manager(3), "kv", 1, 100, b"moved").await;

    let mut expected = (0..5u8).map(|x| vec![x]).collect::<Vec<_>>();
    expected.push(b"moved".to_vec());
    assert!(eventually(PATIENCE, || {
        [2, 3, 4].iter().all(|node| cluster.app(*node).entries("kv") == expected)
    }).await);

    assert!(eventually(PATIENCE, || {
        cluster.manager(0).services().is_empty() && cluster.manager(1).services().is_empty()
    }).await);
    assert!(eventually(PATIENCE, || !cluster.app(0).has_final_state("kv", 0)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn old_epoch_never_accepts_new_requests() {
    let cluster = Cluster::start(4);
    let reconfigurator = cluster.reconfigurator(0);
    reconfigurator.create("kv", vec![0, 1, 2], empty_state()).await.unwrap();
    propose(cluster.manager(0), "kv", 0, 1, b"before").await;

    assert_eq!(reconfigurator.reconfigure("kv", vec![1, 2, 3]).await, Ok(1));

    let stale = Request::new("kv", 0, 2, b"after".to_vec());
    match cluster.manager(2).propose_request(stale.clone()).await {
    | Err(PaxosError::StaleEpoch { requested: 0, .. })
    | Err(PaxosError::Stopped { epoch: 0, .. }) => (),
    | other => panic!("expected the old epoch to refuse, got {:?}", other),
    }
    assert!(eventually(PATIENCE, || cluster.manager(3).services() == vec![("kv".to_owned(), 1)]).await);
    match cluster.manager(3).propose_request(stale).await {
    | Err(PaxosError::StaleEpoch { current: 1, requested: 0, .. }) => (),
    | other => panic!("expected a stale epoch, got {:?}", other),
    }
    for node in 1..4 {
        assert!(!cluster.app(node).entries("kv").contains(&b"after".to_vec()));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deleted_service_is_gone_and_can_be_recreated() {
    let cluster = Cluster::start(4);
    let reconfigurator = cluster.reconfigurator(0);
    reconfigurator.create("gone", vec![0, 1, 2], empty_state()).await.unwrap();
    propose(cluster.manager(1), "gone", 0, 1, b"x").await;

    reconfigurator.delete("gone").await.unwrap();
    assert_eq!(reconfigurator.record("gone").unwrap().state, EpochState::Deleted);
    assert!(eventually(PATIENCE, || (0..3).all(|node| cluster.manager(node).services().is_empty())).await);

    match cluster.manager(1).propose("gone", Vec::new()).await {
    | Err(PaxosError::UnknownService(_)) => (),
    | other => panic!("expected unknown service, got {:?}", other),
    }
    match reconfigurator.reconfigure("gone", vec![1, 2, 3]).await {
    | Err(PaxosError::UnknownService(_)) => (),
    | other => panic!("expected unknown service, got {:?}", other),
    }

    reconfigurator.create("gone", vec![1, 2, 3], empty_state()).await.unwrap();
    assert_eq!(reconfigurator.record("gone").unwrap().epoch, 1);
    assert_eq!(reconfigurator.create("gone", vec![1, 2, 3], empty_state()).await, Err(PaxosError::AlreadyExists("gone".to_owned())));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_group_is_refused_and_the_service_keeps_running() {
    let cluster = Cluster::start(3);
    let reconfigurator = cluster.reconfigurator(0);
    assert_eq!(reconfigurator.create("kv", Vec::new(), empty_state()).await, Err(PaxosError::EmptyGroup("kv".to_owned())));
    assert!(reconfigurator.record("kv").is_none());

    reconfigurator.create("kv", vec![0, 1, 2], empty_state()).await.unwrap();
    propose(cluster.manager(0), "kv", 0, 1, b"data").await;

    assert_eq!(reconfigurator.reconfigure("kv", Vec::new()).await, Err(PaxosError::EmptyGroup("kv".to_owned())));
    let record = reconfigurator.record("kv").unwrap();
    assert_eq!((record.epoch, record.state), (0, EpochState::Active));
    assert!(eventually(PATIENCE, || {
        (0..3).all(|node| cluster.manager(node).services() == vec![("kv".to_owned(), 0)])
    }).await);
    propose(cluster.manager(1), "kv", 0, 2, b"more").await;
    assert!(eventually(PATIENCE, || {
        (0..3).all(|node| cluster.app(node).entries("kv") == vec![b"data".to_vec(), b"more".to_vec()])
    }).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn member_that_missed_the_start_joins_later() {
    let cluster = Cluster::start(5);
    let reconfigurator = cluster.reconfigurator(0);
    reconfigurator.create("kv", vec![0, 1, 2], empty_state()).await.unwrap();
    propose(cluster.manager(0), "kv", 0, 1, b"before").await;

    cluster.network.set_filter(|_, to, packet| to == 4 && packet.kind() == PacketType::StartEpoch);
    assert_eq!(reconfigurator.reconfigure("kv", vec![2, 3, 4]).await, Ok(1));
    assert!(cluster.manager(4).services().is_empty());

    cluster.network.clear_filter();
    assert!(eventually(PATIENCE, || cluster.manager(4).services() == vec![("kv".to_owned(), 1)]).await);
    propose(cluster.manager(2), "kv", 1, 2, b"after").await;
    assert!(eventually(PATIENCE, || {
        cluster.app(4).entries("kv") == vec![b"before".to_vec(), b"after".to_vec()]
    }).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn records_survive_a_restart_of_the_driving_node() {
    let mut cluster = Cluster::start(4);
    let reconfigurator = cluster.reconfigurator(3);
    reconfigurator.create("kv", vec![0, 1, 2], empty_state()).await.unwrap();
    propose(cluster.manager(0), "kv", 0, 1, b"kept").await;
    drop(reconfigurator);

    cluster.restart(3);
    let reconfigurator = cluster.reconfigurator(3);
    let record = reconfigurator.record("kv").unwrap();
    assert_eq!((record.epoch, record.group, record.state), (0, vec![0, 1, 2], EpochState::Active));

    assert_eq!(reconfigurator.reconfigure("kv", vec![1, 2, 3]).await, Ok(1));
    assert!(eventually(PATIENCE, || cluster.app(3).entries("kv") == vec![b"kept".to_vec()]).await);
    assert_eq!(cluster.reconfigurator(3).record("kv").map(|record| record.epoch), Some(1));
}
