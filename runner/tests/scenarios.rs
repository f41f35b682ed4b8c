mod common;

use common::{flaky_setup, job, locator, setup};
use expman::{
    distributed::Artifact,
    resources::{LockMode, LockType, Resource, ResourceState},
};
use std::fs;

#[test]
fn read_access_waits_for_the_done_marker() {
    let setup = setup();
    let scheduler = &setup.scheduler;
    let producer = scheduler
        .submit(Resource::data(locator("/data/p")).with_lock_mode(LockMode::MultipleWriter))
        .unwrap();

    let mut reader = job("/jobs/j", &["true"]);
    reader.add_dependency(&producer, LockType::ReadAccess).unwrap();
    let reader = scheduler.submit(reader).unwrap();
    assert_eq!(reader.state(), ResourceState::Waiting);
    assert_eq!(reader.nb_unsatisfied(), 1);

    // nothing on disk yet
    assert!(!scheduler.update_status(&locator("/data/p")).unwrap());
    assert_eq!(setup.state("/jobs/j"), ResourceState::Waiting);

    setup.touch_done("/data/p");
    assert!(scheduler.update_status(&locator("/data/p")).unwrap());

    assert_eq!(setup.state("/data/p"), ResourceState::Done);
    let reader = scheduler.get(&locator("/jobs/j")).unwrap();
    assert_eq!(reader.state(), ResourceState::Ready);
    assert_eq!(reader.nb_unsatisfied(), 0);
}

#[test]
fn single_writer_waits_for_the_other_writer() {
    let setup = setup();
    let scheduler = &setup.scheduler;
    scheduler
        .submit(
            Resource::data(locator("/data/p"))
                .with_lock_mode(LockMode::SingleWriter)
                .with_state(ResourceState::Done),
        )
        .unwrap();
    setup.write_status("/data/p", "local:/jobs/other w\n");
    scheduler.update_status(&locator("/data/p")).unwrap();
    assert_eq!(
        scheduler.get(&locator("/data/p")).unwrap().access().writers,
        1
    );

    let mut writer = job("/jobs/j", &["true"]);
    writer
        .add_dependency(&scheduler.get(&locator("/data/p")).unwrap(), LockType::WriteAccess)
        .unwrap();
    assert_eq!(scheduler.submit(writer).unwrap().state(), ResourceState::Waiting);

    // the counters move, the state of the producer does not
    setup.write_status("/data/p", "");
    assert!(!scheduler.update_status(&locator("/data/p")).unwrap());

    assert_eq!(setup.state("/jobs/j"), ResourceState::Ready);
}

#[test]
fn token_slots_are_handed_over() {
    let setup = setup();
    let scheduler = &setup.scheduler;
    scheduler.declare_token(&locator("/tokens/cpu"), 1).unwrap();
    let token = scheduler.get(&locator("/tokens/cpu")).unwrap();

    for path in ["/jobs/a", "/jobs/b"] {
        let mut resource = job(path, &["sleep", "0.3"]);
        resource.add_dependency(&token, LockType::Generated).unwrap();
        assert_eq!(scheduler.submit(resource).unwrap().state(), ResourceState::Ready);
    }

    assert!(scheduler.start_job(&locator("/jobs/a")).unwrap());
    assert_eq!(setup.state("/jobs/a"), ResourceState::Running);
    assert_eq!(setup.state("/jobs/b"), ResourceState::Waiting);
    assert!(scheduler
        .get(&locator("/tokens/cpu"))
        .unwrap()
        .is_blocking_token());

    // no slot left
    assert!(!scheduler.start_job(&locator("/jobs/b")).unwrap());

    setup.reap_until(|setup| setup.state("/jobs/a") == ResourceState::Done);

    assert_eq!(
        scheduler
            .get(&locator("/tokens/cpu"))
            .unwrap()
            .token_payload()
            .unwrap()
            .used_tokens(),
        0
    );
    assert_eq!(setup.state("/jobs/b"), ResourceState::Ready);
}

#[test]
fn invalidation_cascades_to_done_dependents() {
    let setup = setup();
    let scheduler = &setup.scheduler;
    let producer = scheduler
        .submit(Resource::data(locator("/data/p")).with_state(ResourceState::Done))
        .unwrap();

    let mut first = job("/jobs/j", &["true"]);
    first.add_dependency(&producer, LockType::Generated).unwrap();
    scheduler.submit(first).unwrap();
    setup.touch_done("/jobs/j");
    fs::write(setup.artifact("/jobs/j", Artifact::Out), "output").unwrap();
    scheduler.update_status(&locator("/jobs/j")).unwrap();

    let mut second = job("/jobs/k", &["true"]);
    second
        .add_dependency(&scheduler.get(&locator("/jobs/j")).unwrap(), LockType::Generated)
        .unwrap();
    assert_eq!(scheduler.submit(second).unwrap().state(), ResourceState::Ready);
    setup.touch_done("/jobs/k");
    scheduler.update_status(&locator("/jobs/k")).unwrap();
    assert_eq!(setup.state("/jobs/k"), ResourceState::Done);

    assert_eq!(scheduler.invalidate(&locator("/jobs/j"), false).unwrap(), 2);

    assert!(!setup.artifact("/jobs/j", Artifact::Done).exists());
    assert!(!setup.artifact("/jobs/j", Artifact::Out).exists());
    assert!(!setup.artifact("/jobs/k", Artifact::Done).exists());
    assert_eq!(setup.state("/jobs/j"), ResourceState::Ready);
    let second = scheduler.get(&locator("/jobs/k")).unwrap();
    assert_eq!(second.state(), ResourceState::Waiting);
    assert_eq!(second.nb_unsatisfied(), 1);

    // a second invalidation finds nothing done
    assert_eq!(scheduler.invalidate(&locator("/jobs/j"), false).unwrap(), 0);
}

#[test]
fn unreachable_storage_holds_dependents_until_it_recovers() {
    let (setup, connector) = flaky_setup();
    let scheduler = &setup.scheduler;
    let producer = scheduler
        .submit(Resource::data(locator("/data/p")).with_state(ResourceState::Done))
        .unwrap();
    let mut reader = job("/jobs/j", &["true"]);
    reader.add_dependency(&producer, LockType::ReadAccess).unwrap();
    assert_eq!(scheduler.submit(reader).unwrap().state(), ResourceState::Ready);

    connector.fail(true);
    assert!(scheduler.update_status(&locator("/data/p")).unwrap());

    let producer = scheduler.get(&locator("/data/p")).unwrap();
    assert_eq!(producer.state(), ResourceState::OnHold);
    assert!(producer.hold().is_some());
    let reader = scheduler.get(&locator("/jobs/j")).unwrap();
    assert_eq!(reader.state(), ResourceState::OnHold);
    assert_eq!(reader.nb_holding(), 1);
    assert_eq!(
        reader.blocking_dependency().map(|dependency| dependency.from.clone()),
        Some(locator("/data/p"))
    );

    connector.fail(false);
    assert!(scheduler.update_status(&locator("/data/p")).unwrap());

    let producer = scheduler.get(&locator("/data/p")).unwrap();
    assert_eq!(producer.state(), ResourceState::Done);
    assert!(producer.hold().is_none());
    let reader = scheduler.get(&locator("/jobs/j")).unwrap();
    assert_eq!(reader.state(), ResourceState::Ready);
    assert_eq!(reader.nb_holding(), 0);
    assert_eq!(reader.nb_unsatisfied(), 0);
}
