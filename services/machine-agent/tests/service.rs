//! Integration tests for the machine service: registry operations, event
//! fan-out and restoring machines after a restart.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, polling_config, spec};
use kiln_agent::event::MachineEvent;
use kiln_agent::machine::Machine;
use kiln_agent::providers::mock::MockProviders;
use kiln_agent::providers::Providers;
use kiln_agent::state::SqliteStore;
use kiln_agent::{MachineService, ServiceError};
use kiln_id::MachineId;
use kiln_reconcile::{DesiredState, MachineState};
use tempfile::TempDir;

async fn wait_for(service: &MachineService, machine_id: MachineId, state: MachineState) -> Machine {
    for _ in 0..1000 {
        let machine = service.machine(machine_id).await.unwrap();
        if machine.state == state {
            return machine;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("machine {machine_id} never reached {state}");
}

fn sqlite_providers(mocks: &MockProviders, store: &SqliteStore) -> Providers {
    let mut providers = mocks.providers();
    providers.persistence = Arc::new(store.clone());
    providers
}

#[tokio::test]
async fn test_create_list_and_get() {
    let mocks = MockProviders::new();
    let service = MachineService::new(mocks.providers(), polling_config());
    assert!(service.is_empty());

    let first = service.create(spec(1), DesiredState::Running).await.unwrap();
    let second = service.create(spec(2), DesiredState::Pending).await.unwrap();
    assert_eq!(service.len(), 2);

    let listed: Vec<_> = service.list().await.into_iter().map(|m| m.id).collect();
    assert_eq!(listed, vec![first.id, second.id]);

    wait_for(&service, first.id, MachineState::Running).await;
    assert_eq!(
        service.machine(second.id).await.unwrap().state,
        MachineState::Pending
    );

    // Saved before its controller ran.
    assert!(mocks.store.machine(second.id).is_some());

    service.shutdown().await;
}

#[tokio::test]
async fn test_unknown_machine_is_reported() {
    let mocks = MockProviders::new();
    let service = MachineService::new(mocks.providers(), polling_config());
    let missing = MachineId::new();

    assert!(matches!(
        service.machine(missing).await,
        Err(ServiceError::UnknownMachine(id)) if id == missing
    ));
    assert!(matches!(
        service.set_desired_state(missing, DesiredState::Running).await,
        Err(ServiceError::UnknownMachine(_))
    ));
    assert!(matches!(
        service.remove(missing).await,
        Err(ServiceError::UnknownMachine(_))
    ));
}

#[tokio::test]
async fn test_create_fails_when_persistence_is_down() {
    let mocks = MockProviders::new();
    mocks.store.set_failing(true);
    let service = MachineService::new(mocks.providers(), polling_config());

    let result = service.create(spec(1), DesiredState::Running).await;
    assert!(matches!(result, Err(ServiceError::Persistence(_))));
    assert!(service.is_empty());
    assert_eq!(mocks.runtime.creates(), 0);
}

#[tokio::test]
async fn test_watch_receives_events_from_every_machine() {
    let mocks = MockProviders::new();
    let service = MachineService::new(mocks.providers(), polling_config());
    let mut watcher = service.watch();

    let first = service.create(spec(1), DesiredState::Running).await.unwrap();
    let second = service.create(spec(1), DesiredState::Running).await.unwrap();

    let mut starting = Vec::new();
    while starting.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(5), watcher.recv())
            .await
            .unwrap()
            .unwrap();
        if event.event == MachineEvent::state_changed(MachineState::Starting) {
            starting.push(event.machine_id);
        }
    }
    starting.sort();
    let mut expected = vec![first.id, second.id];
    expected.sort();
    assert_eq!(starting, expected);

    service.shutdown().await;
}

#[tokio::test]
async fn test_only_durable_events_are_logged() {
    let mocks = MockProviders::new();
    let service = MachineService::new(mocks.providers(), polling_config());

    let machine = service.create(spec(1), DesiredState::Running).await.unwrap();
    wait_for(&service, machine.id, MachineState::Running).await;
    eventually("health events to be dispatched", || mocks.runtime.healthchecks() >= 3).await;
    eventually("transitions to be logged", || mocks.store.events_for(machine.id).len() == 2).await;

    let logged = mocks.store.events_for(machine.id);
    assert!(logged.iter().all(MachineEvent::is_durable));
    assert_eq!(
        logged,
        vec![
            MachineEvent::state_changed(MachineState::Starting),
            MachineEvent::state_changed(MachineState::Running),
        ]
    );

    service.shutdown().await;
}

#[tokio::test]
async fn test_logged_transitions_never_repeat() {
    let mocks = MockProviders::new();
    let service = MachineService::new(mocks.providers(), polling_config());

    let machine = service.create(spec(1), DesiredState::Running).await.unwrap();
    wait_for(&service, machine.id, MachineState::Running).await;

    // Hold dispatch while failed healthchecks pile up behind it.
    service.get(machine.id).unwrap().subscribe_to_events(|event| async move {
        if event
            == (MachineEvent::DesiredStateChanged {
                desired_state: DesiredState::Running,
            })
        {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        anyhow::Ok(())
    });

    mocks.runtime.set_healthy(false);
    service
        .set_desired_state(machine.id, DesiredState::Running)
        .await
        .unwrap();
    service
        .set_desired_state(machine.id, DesiredState::Pending)
        .await
        .unwrap();

    wait_for(&service, machine.id, MachineState::Pending).await;
    eventually("reconciliation to finish", || {
        !service.get(machine.id).unwrap().is_reconciling()
    })
    .await;
    eventually("pending to be logged", || {
        mocks.store.events_for(machine.id).last()
            == Some(&MachineEvent::state_changed(MachineState::Pending))
    })
    .await;

    let logged: Vec<_> = mocks
        .store
        .events_for(machine.id)
        .into_iter()
        .map(|event| match event {
            MachineEvent::StateChanged { state } => state,
            other => panic!("unexpected logged event {other:?}"),
        })
        .collect();
    for pair in logged.windows(2) {
        assert_ne!(pair[0], pair[1], "repeated transition in {logged:?}");
    }
    assert_eq!(logged[..2], [MachineState::Starting, MachineState::Running]);
    assert_eq!(
        service.machine(machine.id).await.unwrap().state,
        MachineState::Pending
    );

    service.shutdown().await;
}

#[tokio::test]
async fn test_set_desired_state_through_service() {
    let mocks = MockProviders::new();
    let service = MachineService::new(mocks.providers(), polling_config());

    let machine = service.create(spec(2), DesiredState::Running).await.unwrap();
    wait_for(&service, machine.id, MachineState::Running).await;

    service
        .set_desired_state(machine.id, DesiredState::Terminated)
        .await
        .unwrap();
    wait_for(&service, machine.id, MachineState::Terminated).await;
    assert_eq!(mocks.volumes.live(), 0);

    let err = service
        .set_desired_state(machine.id, DesiredState::Running)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Controller(_)));

    service.shutdown().await;
}

#[tokio::test]
async fn test_remove_stops_controller_and_keeps_resources() {
    let mocks = MockProviders::new();
    let service = MachineService::new(mocks.providers(), polling_config());

    let machine = service.create(spec(1), DesiredState::Running).await.unwrap();
    wait_for(&service, machine.id, MachineState::Running).await;

    let removed = service.remove(machine.id).await.unwrap();
    assert_eq!(removed.id, machine.id);
    assert!(service.is_empty());
    assert!(mocks.runtime.is_running(machine.id));
    assert_eq!(mocks.volumes.live(), 1);

    let checks = mocks.runtime.healthchecks();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(mocks.runtime.healthchecks(), checks);
}

#[tokio::test]
async fn test_shutdown_stops_every_controller() {
    let mocks = MockProviders::new();
    let service = MachineService::new(mocks.providers(), polling_config());

    let first = service.create(spec(1), DesiredState::Running).await.unwrap();
    let second = service.create(spec(1), DesiredState::Running).await.unwrap();
    let first_controller = service.get(first.id).unwrap();
    let second_controller = service.get(second.id).unwrap();

    service.shutdown().await;
    assert!(service.is_empty());
    assert!(first_controller.is_stopped());
    assert!(second_controller.is_stopped());
}

#[tokio::test]
async fn test_load_skips_terminated_machines() {
    let mocks = MockProviders::new();

    let mut live = common::machine(1, DesiredState::Running);
    live.state = MachineState::Pending;
    let mut dead = common::machine(1, DesiredState::Terminated);
    dead.state = MachineState::Terminated;
    mocks.store.insert(live.clone());
    mocks.store.insert(dead.clone());

    let service = MachineService::new(mocks.providers(), polling_config());
    assert_eq!(service.load().await.unwrap(), 1);
    assert!(service.get(live.id).is_ok());
    assert!(service.get(dead.id).is_err());

    // Already registered machines are not started twice.
    assert_eq!(service.load().await.unwrap(), 0);

    wait_for(&service, live.id, MachineState::Running).await;
    service.shutdown().await;
}

#[tokio::test]
async fn test_restart_restores_machines_from_sqlite() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("kiln.db");
    let mocks = MockProviders::new();

    let (running, terminated) = {
        let store = SqliteStore::open(&path).unwrap();
        let service = MachineService::new(sqlite_providers(&mocks, &store), polling_config());

        let running = service.create(spec(2), DesiredState::Running).await.unwrap();
        let terminated = service.create(spec(1), DesiredState::Terminated).await.unwrap();
        wait_for(&service, running.id, MachineState::Running).await;
        wait_for(&service, terminated.id, MachineState::Terminated).await;
        eventually("running reconciliation to finish", || {
            !service.get(running.id).unwrap().is_reconciling()
        })
        .await;
        eventually("termination to be logged", || {
            store.events_for(terminated.id).unwrap().len() == 2
        })
        .await;

        service.shutdown().await;
        (running.id, terminated.id)
    };

    let store = SqliteStore::open(&path).unwrap();
    let restored = store
        .list_machines()
        .unwrap()
        .into_iter()
        .find(|m| m.id == running)
        .unwrap();
    assert_eq!(restored.state, MachineState::Running);
    assert_eq!(restored.volumes.len(), 2);
    assert!(restored.runtime_pid.is_some());

    let log: Vec<_> = store
        .events_for(terminated)
        .unwrap()
        .into_iter()
        .map(|record| record.event)
        .collect();
    assert_eq!(
        log,
        vec![
            MachineEvent::state_changed(MachineState::Terminating),
            MachineEvent::state_changed(MachineState::Terminated),
        ]
    );

    let service = MachineService::new(sqlite_providers(&mocks, &store), polling_config());
    assert_eq!(service.load().await.unwrap(), 1);
    assert!(service.get(terminated).is_err());

    // The runtime survived the restart, so nothing is rebuilt.
    let machine = wait_for(&service, running, MachineState::Running).await;
    assert_eq!(machine.runtime_pid, restored.runtime_pid);
    assert_eq!(mocks.runtime.creates(), 1);
    assert!(!service.get(running).unwrap().is_reconciling());

    service.shutdown().await;
}
