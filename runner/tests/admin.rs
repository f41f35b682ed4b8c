mod common;

use common::{job, locator, setup};
use expman::{
    distributed::Artifact,
    resources::{LockType, Resource, ResourceError, ResourceState},
    scheduler::SchedulerError,
};
use std::fs;

#[test]
fn failed_jobs_keep_their_code_until_restarted() {
    let setup = setup();
    let scheduler = &setup.scheduler;
    scheduler
        .submit(job("/jobs/fail", &["sh", "-c", "exit 3"]))
        .unwrap();

    assert!(scheduler.start_job(&locator("/jobs/fail")).unwrap());
    setup.reap_until(|setup| setup.state("/jobs/fail") == ResourceState::Error);

    let failed = scheduler.get(&locator("/jobs/fail")).unwrap();
    assert_eq!(failed.job_payload().unwrap().exit_code, Some(3));
    assert!(failed.job_payload().unwrap().end_timestamp.is_some());
    assert!(!setup.artifact("/jobs/fail", Artifact::Done).exists());

    assert_eq!(scheduler.restart(&locator("/jobs/fail"), false, false).unwrap(), 1);
    let restarted = scheduler.get(&locator("/jobs/fail")).unwrap();
    assert_eq!(restarted.state(), ResourceState::Ready);
    assert_eq!(restarted.job_payload().unwrap().exit_code, None);
    assert!(!setup.artifact("/jobs/fail", Artifact::Code).exists());

    // already in line
    assert_eq!(scheduler.restart(&locator("/jobs/fail"), false, false).unwrap(), 0);
}

#[test]
fn done_resources_restart_only_on_request() {
    let setup = setup();
    let scheduler = &setup.scheduler;
    scheduler.submit(job("/jobs/j", &["true"])).unwrap();
    setup.touch_done("/jobs/j");
    scheduler.update_status(&locator("/jobs/j")).unwrap();

    assert_eq!(scheduler.restart(&locator("/jobs/j"), false, false).unwrap(), 0);
    assert_eq!(setup.state("/jobs/j"), ResourceState::Done);

    assert_eq!(scheduler.restart(&locator("/jobs/j"), true, false).unwrap(), 1);
    assert_eq!(setup.state("/jobs/j"), ResourceState::Ready);
    assert!(!setup.artifact("/jobs/j", Artifact::Done).exists());
}

#[test]
fn removal_requires_recursion_for_producers() {
    let setup = setup();
    let scheduler = &setup.scheduler;
    let producer = scheduler.submit(Resource::data(locator("/data/p"))).unwrap();
    let mut dependent = job("/jobs/j", &["true"]);
    dependent.add_dependency(&producer, LockType::Generated).unwrap();
    scheduler.submit(dependent).unwrap();

    assert!(matches!(
        scheduler.remove("local:/data/p", &[], false),
        Err(SchedulerError::HasDependents { count: 1, .. })
    ));
    assert!(matches!(
        scheduler.remove("local:/data/p", &[ResourceState::Done], true),
        Err(SchedulerError::StateMismatch { .. })
    ));
    assert!(matches!(
        scheduler.remove("local:/data/missing", &[], false),
        Err(SchedulerError::NotFound(_))
    ));

    let report = scheduler.remove("local:/data/p", &[], true).unwrap();
    assert_eq!(report.count, 2);
    assert!(report.failures.is_empty());
    assert!(scheduler.find(&locator("/data/p")).unwrap().is_none());
    assert!(scheduler.find(&locator("/jobs/j")).unwrap().is_none());
}

#[test]
fn removal_keeps_the_tree_of_a_running_dependent() {
    let setup = setup();
    let scheduler = &setup.scheduler;
    let producer = scheduler
        .submit(Resource::data(locator("/data/p")).with_state(ResourceState::Done))
        .unwrap();
    let mut sibling = job("/jobs/j", &["true"]);
    sibling.add_dependency(&producer, LockType::Generated).unwrap();
    scheduler.submit(sibling).unwrap();
    let mut intermediate = Resource::data(locator("/data/k"));
    intermediate.add_dependency(&producer, LockType::Generated).unwrap();
    scheduler.submit(intermediate).unwrap();
    setup.touch_done("/data/k");
    scheduler.update_status(&locator("/data/k")).unwrap();
    assert_eq!(setup.state("/data/k"), ResourceState::Done);

    let mut leaf = job("/jobs/l", &["sleep", "30"]);
    leaf.add_dependency(&scheduler.get(&locator("/data/k")).unwrap(), LockType::Generated)
        .unwrap();
    scheduler.submit(leaf).unwrap();
    assert!(scheduler.start_job(&locator("/jobs/l")).unwrap());

    assert!(matches!(
        scheduler.remove("local:/data/p", &[], true),
        Err(SchedulerError::Running(running)) if running == locator("/jobs/l")
    ));
    for path in ["/data/p", "/jobs/j", "/data/k", "/jobs/l"] {
        assert!(scheduler.find(&locator(path)).unwrap().is_some(), "{path} was removed");
    }

    assert_eq!(scheduler.stop(&[locator("/jobs/l")], false).count, 1);
    assert_eq!(scheduler.remove("local:/data/p", &[], true).unwrap().count, 4);
}

#[test]
fn tokens_cannot_be_restarted_nor_invalidated() {
    let setup = setup();
    let scheduler = &setup.scheduler;
    scheduler
        .submit(Resource::token(locator("/tokens/gpu"), 1).with_state(ResourceState::Done))
        .unwrap();

    assert!(matches!(
        scheduler.restart(&locator("/tokens/gpu"), true, false),
        Err(SchedulerError::Resource(ResourceError::TokenNotRestartable(_)))
    ));
    assert!(matches!(
        scheduler.invalidate(&locator("/tokens/gpu"), false),
        Err(SchedulerError::Resource(ResourceError::TokenNotRestartable(_)))
    ));

    let token = scheduler.get(&locator("/tokens/gpu")).unwrap();
    assert_eq!(token.state(), ResourceState::Done);
    assert_eq!(token.token_payload().unwrap().limit, 1);
}

#[test]
fn patterns_remove_matching_resources() {
    let setup = setup();
    let scheduler = &setup.scheduler;
    for path in ["/batch/a", "/batch/b", "/other/c"] {
        scheduler.submit(job(path, &["true"])).unwrap();
    }
    setup.touch_done("/batch/b");
    scheduler.update_status(&locator("/batch/b")).unwrap();

    let report = scheduler
        .remove("local:/batch/*", &[ResourceState::Ready], false)
        .unwrap();
    assert_eq!(report.count, 1);

    let remaining = scheduler
        .list(None, &[])
        .unwrap()
        .into_iter()
        .map(|resource| resource.locator().clone())
        .collect::<Vec<_>>();
    assert_eq!(remaining, vec![locator("/batch/b"), locator("/other/c")]);
}

#[test]
fn stopped_jobs_fail_or_go_back_in_line() {
    let setup = setup();
    let scheduler = &setup.scheduler;
    scheduler.submit(job("/jobs/long", &["sleep", "30"])).unwrap();

    assert!(scheduler.start_job(&locator("/jobs/long")).unwrap());
    let report = scheduler.stop(&[locator("/jobs/long")], true);
    assert_eq!(report.count, 1);
    assert_eq!(setup.state("/jobs/long"), ResourceState::Ready);

    assert!(scheduler.start_job(&locator("/jobs/long")).unwrap());
    let report = scheduler.stop(&[locator("/jobs/long")], false);
    assert_eq!(report.count, 1);
    assert_eq!(setup.state("/jobs/long"), ResourceState::Error);

    let report = scheduler.stop(&[locator("/jobs/long")], false);
    assert_eq!(report.count, 0);
    assert!(matches!(report.failures[0].1, SchedulerError::NotRunning(_)));
}

#[test]
fn raising_a_token_limit_releases_waiting_jobs() {
    let setup = setup();
    let scheduler = &setup.scheduler;
    scheduler.declare_token(&locator("/tokens/gpu"), 0).unwrap();
    let mut consumer = job("/jobs/j", &["true"]);
    consumer
        .add_dependency(&scheduler.get(&locator("/tokens/gpu")).unwrap(), LockType::Generated)
        .unwrap();
    assert_eq!(scheduler.submit(consumer).unwrap().state(), ResourceState::Waiting);

    // declaring it again with another limit updates it
    scheduler.declare_token(&locator("/tokens/gpu"), 1).unwrap();

    assert_eq!(
        scheduler
            .get(&locator("/tokens/gpu"))
            .unwrap()
            .token_payload()
            .unwrap()
            .limit,
        1
    );
    assert_eq!(setup.state("/jobs/j"), ResourceState::Ready);

    scheduler.set_token_limit(&locator("/tokens/gpu"), 0).unwrap();
    assert_eq!(setup.state("/jobs/j"), ResourceState::Waiting);
}

#[test]
fn information_names_the_blocking_dependency() {
    let setup = setup();
    let scheduler = &setup.scheduler;
    let producer = scheduler.submit(Resource::data(locator("/data/p"))).unwrap();
    let mut dependent = job("/jobs/j", &["true"]).with_group("training");
    dependent.add_dependency(&producer, LockType::ReadAccess).unwrap();
    scheduler.submit(dependent).unwrap();

    let information = scheduler.information(&locator("/jobs/j")).unwrap();
    assert_eq!(information.state, ResourceState::Waiting);
    assert_eq!(information.group.as_deref(), Some("training"));
    assert_eq!(information.nb_unsatisfied, 1);
    assert_eq!(
        information.blocking.map(|dependency| dependency.from),
        Some(locator("/data/p"))
    );

    let listed = scheduler.list(Some("training"), &[]).unwrap();
    assert_eq!(listed.len(), 1);
    assert!(scheduler
        .list(Some("training"), &[ResourceState::Done])
        .unwrap()
        .is_empty());
}

#[test]
fn generated_scripts_can_be_rewritten() {
    let setup = setup();
    let scheduler = &setup.scheduler;
    scheduler.submit(job("/jobs/j", &["echo", "hi"])).unwrap();
    scheduler.submit(Resource::data(locator("/data/p"))).unwrap();

    let report = scheduler.generate_files(&[locator("/jobs/j"), locator("/data/p")]);
    assert_eq!(report.count, 1);
    assert_eq!(report.failures.len(), 1);

    let script = fs::read_to_string(setup.artifact("/jobs/j", Artifact::Run)).unwrap();
    assert!(script.contains("echo hi"));
}

#[test]
fn runners_drain_a_pipeline() {
    let setup = setup();
    let scheduler = &setup.scheduler;
    let first = scheduler.submit(job("/jobs/first", &["echo", "hello"])).unwrap();
    let mut second = job("/jobs/second", &["echo", "world"]);
    second.add_dependency(&first, LockType::ReadAccess).unwrap();
    scheduler.submit(second).unwrap();

    scheduler.run_until_idle().unwrap();

    assert_eq!(setup.state("/jobs/first"), ResourceState::Done);
    assert_eq!(setup.state("/jobs/second"), ResourceState::Done);
    assert_eq!(
        fs::read_to_string(setup.artifact("/jobs/first", Artifact::Out)).unwrap(),
        "hello\n"
    );
    assert_eq!(
        fs::read_to_string(setup.artifact("/jobs/second", Artifact::Code))
            .unwrap()
            .trim(),
        "0"
    );
    assert!(scheduler.is_idle().unwrap());
}
