//! End-to-end job lifecycle over real TCP connections.


use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::json;

use jobfleet::archive;
use jobfleet::config::HeartbeatConfig;
use jobfleet::job::{JobSpec, JobState};
use jobfleet::protocol::EOF_MARKER;
use jobfleet::store::Store;
use test_harness::{simple_job, wait_until, Peer, TestCoordinator};

const USER: &str = "alice@example.com";
const ADMIN: &str = "root@example.com";

/// Take an announced job and its archive off the wire.
async fn accept_job(worker: &mut Peer, job_id: u64) {
    let announce = worker.expect("addJob").await;
    assert_eq!(announce["jobId"], job_id);
    let (header, payload) = worker.receive_file().await;
    assert_eq!(header["jobId"], job_id);
    assert_eq!(header["size"].as_u64().unwrap(), payload.len() as u64);
}

/// Pack `files` and send them as the archive `filename` of `job_id`.
async fn upload_archive(peer: &mut Peer, job_id: u64, filename: &str, files: &[(&str, &str)]) {
    let src = tempfile::tempdir().unwrap();
    for (name, contents) in files {
        std::fs::write(src.path().join(name), contents).unwrap();
    }
    let out = tempfile::tempdir().unwrap();
    let tar_path = out.path().join(filename);
    archive::pack(&tar_path, src.path()).unwrap();
    let bytes = std::fs::read(&tar_path).unwrap();

    peer.send(json!({
        "command": "put",
        "jobId": job_id,
        "filename": filename,
        "checksum": archive::checksum(&tar_path).unwrap(),
        "size": bytes.len(),
    }))
    .await;
    for chunk in bytes.chunks(16 * 1024) {
        peer.send(json!({ "command": "chunk", "data": STANDARD.encode(chunk) }))
            .await;
    }
    peer.send_line(EOF_MARKER).await;
}

/// Upload `files` as the result archive of `job_id`.
async fn upload_results(worker: &mut Peer, job_id: u64, files: &[(&str, &str)]) {
    upload_archive(worker, job_id, "results.tar", files).await;
}

/// Send one byte whose checksum cannot match.
async fn upload_corrupt(peer: &mut Peer, job_id: u64) {
    peer.send(json!({
        "command": "put",
        "jobId": job_id,
        "filename": "job.tar",
        "checksum": "00",
        "size": 1,
    }))
    .await;
    peer.send(json!({ "command": "chunk", "data": STANDARD.encode([0u8]) }))
        .await;
    peer.send_line(EOF_MARKER).await;
}

#[tokio::test]
async fn test_job_runs_to_completion_and_results_come_back() {
    let coord = TestCoordinator::start().await;
    coord.add_user(USER, false);
    let mut worker = coord.worker("ws1", &[5.0, 5.0]).await;

    let job_id = coord.submit(USER, simple_job("sim")).await;
    accept_job(&mut worker, job_id).await;

    let job = coord.wait_for_state(job_id, JobState::Dispatched).await;
    assert_eq!(job.workstation.as_deref(), Some("ws1"));
    assert!(job
        .log_entries()
        .iter()
        .any(|e| e.message == "Job sent to workstation ws1"));

    worker.report_job(job_id, "RUNNING").await;
    coord.wait_for_state(job_id, JobState::Running).await;

    worker.report_job(job_id, "DONE").await;
    coord.wait_for_state(job_id, JobState::Done).await;
    let request = worker.expect("getResults").await;
    assert_eq!(request["jobId"], job_id);

    upload_results(&mut worker, job_id, &[("output.txt", "42\n")]).await;
    let results = coord.dir.path().join(job_id.to_string()).join("results");
    wait_until(|| {
        let path = results.join("output.txt");
        async move { path.exists() }
    })
    .await;
    assert_eq!(
        std::fs::read_to_string(results.join("output.txt")).unwrap(),
        "42\n"
    );

    // The owner downloads the results: file first, then the response.
    let mut client = coord.client().await;
    client
        .send(json!({ "command": "getResults", "username": USER, "jobId": job_id }))
        .await;
    let (header, payload) = client.receive_file().await;
    assert_eq!(header["jobId"], job_id);
    assert!(!payload.is_empty());
    let response = client.expect("response").await;
    assert_eq!(response["result"], true);

    coord.shutdown().await;
}

#[tokio::test]
async fn test_stale_job_reports_are_ignored() {
    let coord = TestCoordinator::start().await;
    coord.add_user(USER, false);
    let mut worker = coord.worker("ws1", &[5.0]).await;

    let job_id = coord.submit(USER, simple_job("sim")).await;
    accept_job(&mut worker, job_id).await;
    coord.wait_for_state(job_id, JobState::Dispatched).await;

    worker.report_job(job_id, "DONE").await;
    coord.wait_for_state(job_id, JobState::Done).await;

    // Going backwards is not allowed.
    worker.report_job(job_id, "RUNNING").await;
    let mut client = coord.client().await;
    let response = client
        .request(json!({ "command": "getJob", "username": USER, "jobId": job_id }))
        .await;
    assert_eq!(response["data"]["state"], "DONE");

    coord.shutdown().await;
}

#[tokio::test]
async fn test_job_waits_without_a_fitting_worker() {
    let coord = TestCoordinator::start().await;
    coord.add_user(USER, false);
    // One free core only.
    let _worker = coord.worker("ws1", &[90.0, 90.0, 90.0, 10.0]).await;

    let job_id = coord
        .submit(
            USER,
            json!({
                "name": "wide",
                "executeCommand": "./run.sh",
                "minCpu": 2,
                "multiCpu": true,
                "requiredOs": "linux",
            }),
        )
        .await;

    let job = coord
        .wait_for_state(job_id, JobState::WaitingForWorkstation)
        .await;
    assert!(job
        .log_entries()
        .iter()
        .any(|e| e.message.contains("1 free CPUs, 2 required")));
    assert!(job.workstation.is_none());

    coord.shutdown().await;
}

#[tokio::test]
async fn test_worker_disconnect_fails_its_running_job() {
    let coord = TestCoordinator::start().await;
    coord.add_user(USER, false);
    let mut worker = coord.worker("ws1", &[5.0]).await;

    let job_id = coord.submit(USER, simple_job("sim")).await;
    accept_job(&mut worker, job_id).await;
    coord.wait_for_state(job_id, JobState::Dispatched).await;
    worker.report_job(job_id, "RUNNING").await;
    coord.wait_for_state(job_id, JobState::Running).await;

    drop(worker);

    let job = coord
        .wait_for_state(job_id, JobState::WorkstationError)
        .await;
    assert!(job
        .log_entries()
        .iter()
        .any(|e| e.message == "Lost connection to workstation ws1"));
    assert!(coord.handle.workers().await.unwrap().is_empty());

    // The next job finds no candidate.
    let next = coord.submit(USER, simple_job("next")).await;
    coord
        .wait_for_state(next, JobState::WaitingForWorkstation)
        .await;

    coord.shutdown().await;
}

#[tokio::test]
async fn test_deferred_job_goes_to_the_back_of_the_queue() {
    let coord = TestCoordinator::start().await;
    coord.add_user(USER, false);
    let mut worker = coord.worker("ws1", &[5.0, 5.0, 5.0, 5.0]).await;

    let j1 = coord
        .submit(
            USER,
            json!({ "name": "j1", "executeCommand": "./run.sh", "requiredOs": "Windows" }),
        )
        .await;
    let j2 = coord.submit(USER, simple_job("j2")).await;

    accept_job(&mut worker, j2).await;
    coord.wait_for_state(j2, JobState::Dispatched).await;
    let deferred = coord.wait_for_state(j1, JobState::WaitingForWorkstation).await;
    assert!(deferred
        .log_entries()
        .iter()
        .any(|e| e.message.contains("requires OS Windows")));

    // A newer job still gets through while J1 keeps cycling.
    let j3 = coord.submit(USER, simple_job("j3")).await;
    accept_job(&mut worker, j3).await;
    coord.wait_for_state(j3, JobState::Dispatched).await;
    assert_eq!(coord.job(j1).state, JobState::WaitingForWorkstation);

    coord.shutdown().await;
}

#[tokio::test]
async fn test_compile_failure_marks_compiler_error() {
    let coord = TestCoordinator::start().await;
    coord.add_user(USER, false);
    let _worker = coord.worker("ws1", &[5.0]).await;

    let job_id = coord
        .submit(
            USER,
            json!({ "name": "broken", "executeCommand": "./a.out", "compilerCommand": "false" }),
        )
        .await;

    let job = coord.wait_for_state(job_id, JobState::CompilerError).await;
    assert!(job
        .log_entries()
        .iter()
        .any(|e| e.message.starts_with("Compilation failed")));
    let logs = coord.dir.path().join(job_id.to_string()).join("logs");
    assert!(logs.join("compilerError").exists());

    coord.shutdown().await;
}

#[tokio::test]
async fn test_compiled_job_is_dispatched() {
    let coord = TestCoordinator::start().await;
    coord.add_user(USER, false);
    let mut worker = coord.worker("ws1", &[5.0]).await;

    let job_id = coord
        .submit(
            USER,
            json!({ "name": "ok", "executeCommand": "./a.out", "compilerCommand": "true" }),
        )
        .await;

    accept_job(&mut worker, job_id).await;
    let job = coord.wait_for_state(job_id, JobState::Dispatched).await;
    assert!(job
        .log_entries()
        .iter()
        .any(|e| e.message == "Compilation succeeded"));

    coord.shutdown().await;
}

#[tokio::test]
async fn test_unregistered_program_is_denied() {
    let coord = TestCoordinator::start().await;
    coord.add_user(USER, false);
    let _worker = coord.worker("ws1", &[5.0]).await;

    let job_id = coord
        .submit(
            USER,
            json!({ "name": "m", "executeCommand": "./run.sh", "requiredPrograms": ["matlab"] }),
        )
        .await;

    let job = coord.wait_for_state(job_id, JobState::PermissionDenied).await;
    assert!(job
        .log_entries()
        .iter()
        .any(|e| e.message.contains("not registered: matlab")));

    coord.shutdown().await;
}

#[tokio::test]
async fn test_missing_program_is_probed_on_the_worker() {
    let coord = TestCoordinator::start().await;
    coord.add_user(USER, false);
    coord.add_user(ADMIN, true);

    let mut admin = coord.client().await;
    let response = admin
        .request(json!({
            "command": "addProgram",
            "username": ADMIN,
            "program": { "name": "matlab" },
        }))
        .await;
    assert_eq!(response["result"], true, "{}", response);

    let mut worker = coord.worker("ws1", &[5.0]).await;
    // Sent on registration because programs are registered; left unanswered.
    let on_register = worker.expect("checkForPrograms").await;
    assert_eq!(on_register["programs"], json!(["matlab"]));

    let job_id = coord
        .submit(
            USER,
            json!({ "name": "m", "executeCommand": "./run.sh", "requiredPrograms": ["matlab"] }),
        )
        .await;

    worker.expect("checkForPrograms").await;
    worker
        .send(json!({ "command": "workstationInfo", "programs": ["matlab"] }))
        .await;

    accept_job(&mut worker, job_id).await;
    coord.wait_for_state(job_id, JobState::Dispatched).await;
    let workers = coord.handle.workers().await.unwrap();
    assert!(workers[0].programs.contains("matlab"));

    coord.shutdown().await;
}

#[tokio::test]
async fn test_unknown_user_is_rejected() {
    let coord = TestCoordinator::start().await;
    let mut client = coord.client().await;

    let response = client
        .request(json!({
            "command": "submitJob",
            "username": "nobody@example.com",
            "job": simple_job("x"),
        }))
        .await;
    assert_eq!(response["result"], false);
    assert!(response["message"]
        .as_str()
        .unwrap()
        .contains("nobody@example.com"));

    coord.shutdown().await;
}

#[tokio::test]
async fn test_admin_commands_need_an_admin() {
    let coord = TestCoordinator::start().await;
    coord.add_user(USER, false);
    coord.add_user(ADMIN, true);
    let mut client = coord.client().await;

    let denied = client
        .request(json!({
            "command": "createUser",
            "username": USER,
            "user": { "email": "bob@example.com" },
        }))
        .await;
    assert_eq!(denied["result"], false);

    let created = client
        .request(json!({
            "command": "createUser",
            "username": ADMIN,
            "user": { "email": "bob@example.com", "firstName": "Bob" },
        }))
        .await;
    assert_eq!(created["result"], true);
    assert_eq!(created["data"]["email"], "bob@example.com");

    coord.shutdown().await;
}

#[tokio::test]
async fn test_unknown_command_is_rejected() {
    let coord = TestCoordinator::start().await;
    let mut client = coord.client().await;

    client.send(json!({ "command": "frobnicate" })).await;
    let response = client.expect("response").await;
    assert_eq!(response["result"], false);
    assert_eq!(response["endCom"], true);

    client.send_line("not json at all").await;
    let response = client.expect("response").await;
    assert_eq!(response["result"], false);

    // The connection survives bad frames.
    client.send(json!({ "command": "ping" })).await;
    let available = client.expect("serverAvailable").await;
    assert_eq!(available["endCom"], true);

    coord.shutdown().await;
}

#[tokio::test]
async fn test_delete_is_a_soft_delete() {
    let coord = TestCoordinator::start().await;
    coord.add_user(USER, false);

    let job_id = coord.submit(USER, simple_job("gone")).await;
    coord
        .wait_for_state(job_id, JobState::WaitingForWorkstation)
        .await;

    let mut client = coord.client().await;
    let response = client
        .request(json!({ "command": "deleteJob", "username": USER, "jobId": job_id }))
        .await;
    assert_eq!(response["result"], true);

    let job = coord.job(job_id);
    assert_eq!(job.state, JobState::Deleted);
    assert!(!coord.dir.path().join(job_id.to_string()).exists());
    assert!(!coord.handle.queue().await.unwrap().contains(&job_id));

    let listed = client
        .request(json!({ "command": "getJobs", "username": USER, "showAll": true }))
        .await;
    assert_eq!(listed["data"], json!([]));

    let lookup = client
        .request(json!({ "command": "getJob", "username": USER, "jobId": job_id }))
        .await;
    assert_eq!(lookup["result"], false);

    coord.shutdown().await;
}

#[tokio::test]
async fn test_kill_before_dispatch_aborts_locally() {
    let coord = TestCoordinator::start().await;
    coord.add_user(USER, false);

    let job_id = coord.submit(USER, simple_job("short")).await;
    coord
        .wait_for_state(job_id, JobState::WaitingForWorkstation)
        .await;

    let mut client = coord.client().await;
    let response = client
        .request(json!({ "command": "killJob", "username": USER, "jobId": job_id }))
        .await;
    assert_eq!(response["result"], true);
    assert_eq!(coord.job(job_id).state, JobState::Aborted);

    // Aborted jobs can be archived; results stay.
    let archived = client
        .request(json!({ "command": "archiveJob", "username": USER, "jobId": job_id }))
        .await;
    assert_eq!(archived["result"], true);
    assert_eq!(coord.job(job_id).state, JobState::ArchivedAborted);

    let visible = client
        .request(json!({ "command": "getJobs", "username": USER }))
        .await;
    assert_eq!(visible["data"], json!([]));
    let everything = client
        .request(json!({ "command": "getJobs", "username": USER, "showAll": true }))
        .await;
    assert_eq!(everything["data"][0]["state"], "ARCHIVED_ABORTED");

    coord.shutdown().await;
}

#[tokio::test]
async fn test_kill_after_dispatch_goes_to_the_worker() {
    let coord = TestCoordinator::start().await;
    coord.add_user(USER, false);
    let mut worker = coord.worker("ws1", &[5.0]).await;

    let job_id = coord.submit(USER, simple_job("long")).await;
    accept_job(&mut worker, job_id).await;
    coord.wait_for_state(job_id, JobState::Dispatched).await;
    worker.report_job(job_id, "RUNNING").await;
    coord.wait_for_state(job_id, JobState::Running).await;

    let mut client = coord.client().await;
    let response = client
        .request(json!({ "command": "killJob", "username": USER, "jobId": job_id }))
        .await;
    assert_eq!(response["result"], true);

    let kill = worker.expect("killJob").await;
    assert_eq!(kill["jobId"], job_id);
    // The worker decides when the job is over.
    assert_eq!(coord.job(job_id).state, JobState::Running);
    worker.report_job(job_id, "ABORTED").await;
    coord.wait_for_state(job_id, JobState::Aborted).await;

    coord.shutdown().await;
}

#[tokio::test]
async fn test_other_users_jobs_are_hidden() {
    let coord = TestCoordinator::start().await;
    coord.add_user(USER, false);
    coord.add_user("mallory@example.com", false);
    coord.add_user(ADMIN, true);

    let job_id = coord.submit(USER, simple_job("private")).await;
    let mut client = coord.client().await;

    let denied = client
        .request(json!({ "command": "getLog", "username": "mallory@example.com", "jobId": job_id }))
        .await;
    assert_eq!(denied["result"], false);

    let log = client
        .request(json!({ "command": "getLog", "username": ADMIN, "jobId": job_id }))
        .await;
    assert_eq!(log["result"], true);
    assert!(log["data"][0].as_str().unwrap().contains("Job submitted by"));

    let all = client
        .request(json!({ "command": "getJobs", "username": ADMIN, "allUsers": true }))
        .await;
    assert_eq!(all["data"].as_array().unwrap().len(), 1);

    coord.shutdown().await;
}

#[tokio::test]
async fn test_silent_worker_is_dropped_after_missed_heartbeats() {
    let coord = TestCoordinator::start_with(|config| {
        config.with_heartbeat(HeartbeatConfig {
            interval_ms: 100,
            timeout_ms: 100,
            max_missed: 2,
        })
    })
    .await;
    coord.add_user(USER, false);

    let mut worker = coord.worker("ws1", &[5.0]).await;
    let job_id = coord.submit(USER, simple_job("sim")).await;
    accept_job(&mut worker, job_id).await;
    coord.wait_for_state(job_id, JobState::Dispatched).await;

    // Stop answering from here on.
    worker.answer_heartbeats = false;

    let job = coord
        .wait_for_state(job_id, JobState::WorkstationError)
        .await;
    assert_eq!(job.workstation.as_deref(), Some("ws1"));
    assert!(coord.handle.workers().await.unwrap().is_empty());

    // The coordinator closes its side.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while worker.next_line().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok());

    coord.shutdown().await;
}

#[tokio::test]
async fn test_answering_worker_stays_registered() {
    let coord = TestCoordinator::start_with(|config| {
        config.with_heartbeat(HeartbeatConfig {
            interval_ms: 30,
            timeout_ms: 30,
            max_missed: 2,
        })
    })
    .await;

    let mut worker = coord.worker("ws1", &[5.0]).await;
    worker.answer_heartbeats = false;
    for _ in 0..5 {
        let heartbeat = worker.next_frame().await;
        assert_eq!(heartbeat["command"], "heartbeat");
        worker.send(json!({ "command": "heartbeatResponse" })).await;
    }
    assert_eq!(coord.handle.workers().await.unwrap().len(), 1);

    coord.shutdown().await;
}

#[tokio::test]
async fn test_reconnecting_worker_replaces_the_old_connection() {
    let coord = TestCoordinator::start().await;
    let _old = coord.worker("ws1", &[5.0]).await;
    let _new = coord.worker("ws1", &[5.0, 5.0]).await;

    wait_until(|| {
        let handle = coord.handle.clone();
        async move {
            handle
                .workers()
                .await
                .map(|w| w.len() == 1 && w[0].cpu_load.len() == 2)
                .unwrap_or(false)
        }
    })
    .await;

    coord.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_request_stops_the_coordinator() {
    let coord = TestCoordinator::start().await;
    coord.add_user(USER, false);
    coord.add_user(ADMIN, true);
    let mut client = coord.client().await;

    let denied = client
        .request(json!({ "command": "shutdown", "username": USER }))
        .await;
    assert_eq!(denied["result"], false);

    let accepted = client
        .request(json!({ "command": "shutdown", "username": ADMIN }))
        .await;
    assert_eq!(accepted["result"], true);

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while client.next_line().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok());
    assert!(coord.handle.workers().await.is_err());

    coord.shutdown().await;
}

#[tokio::test]
async fn test_files_from_unrelated_connections_are_discarded() {
    let coord = TestCoordinator::start().await;
    coord.add_user(USER, false);
    let mut worker = coord.worker("ws1", &[5.0]).await;

    let job_id = coord.submit(USER, simple_job("sim")).await;
    accept_job(&mut worker, job_id).await;
    coord.wait_for_state(job_id, JobState::Dispatched).await;

    let mut stranger = coord.client().await;
    upload_corrupt(&mut stranger, job_id).await;
    // Answered after the file was handled.
    let response = stranger
        .request(json!({ "command": "getJob", "username": USER, "jobId": job_id }))
        .await;
    assert_eq!(response["result"], true);

    let job = coord.job(job_id);
    assert_eq!(job.state, JobState::Dispatched);
    assert_eq!(job.workstation.as_deref(), Some("ws1"));

    // Results from anyone but the bound worker are ignored as well.
    worker.report_job(job_id, "DONE").await;
    coord.wait_for_state(job_id, JobState::Done).await;
    worker.expect("getResults").await;
    upload_results(&mut stranger, job_id, &[("output.txt", "forged\n")]).await;
    stranger
        .request(json!({ "command": "getJob", "username": USER, "jobId": job_id }))
        .await;
    let results = coord.dir.path().join(job_id.to_string()).join("results");
    assert!(!results.join("output.txt").exists());

    coord.shutdown().await;
}

#[tokio::test]
async fn test_corrupt_upload_from_bound_worker_kills_the_dispatched_job() {
    let coord = TestCoordinator::start().await;
    coord.add_user(USER, false);
    let mut worker = coord.worker("ws1", &[5.0]).await;

    let job_id = coord.submit(USER, simple_job("sim")).await;
    accept_job(&mut worker, job_id).await;
    coord.wait_for_state(job_id, JobState::Dispatched).await;

    upload_corrupt(&mut worker, job_id).await;
    let kill = worker.expect("killJob").await;
    assert_eq!(kill["jobId"], job_id);
    let job = coord.wait_for_state(job_id, JobState::Deleted).await;
    assert!(job
        .log_entries()
        .iter()
        .any(|e| e.message == "Uploaded job files are corrupt, job deleted"));

    coord.shutdown().await;
}

#[tokio::test]
async fn test_job_files_come_from_the_submitting_connection() {
    let coord = TestCoordinator::start().await;
    coord.add_user(USER, false);
    let mut worker = coord.worker("ws1", &[5.0]).await;

    let mut submitter = coord.client().await;
    let response = submitter
        .request(json!({
            "command": "submitJob",
            "username": USER,
            "job": simple_job("uploaded"),
            "awaitUpload": true,
        }))
        .await;
    assert_eq!(response["result"], true);
    let job_id = response["data"]["jobId"].as_u64().unwrap();

    let mut other = coord.client().await;
    upload_archive(&mut other, job_id, "job.tar", &[("run.sh", "#!/bin/sh\nforged\n")]).await;
    other
        .request(json!({ "command": "getJob", "username": USER, "jobId": job_id }))
        .await;
    assert_eq!(coord.job(job_id).state, JobState::Queued);
    assert!(coord.handle.queue().await.unwrap().is_empty());

    upload_archive(&mut submitter, job_id, "job.tar", &[("run.sh", "#!/bin/sh\n")]).await;
    accept_job(&mut worker, job_id).await;
    let job = coord.wait_for_state(job_id, JobState::Dispatched).await;
    assert!(job
        .log_entries()
        .iter()
        .any(|e| e.message == "Job files received"));

    coord.shutdown().await;
}

#[tokio::test]
async fn test_rescheduled_compiled_jobs_go_first() {
    let coord =
        TestCoordinator::start_with(|config| config.with_tick_interval_ms(3_600_000)).await;
    let owner = coord.add_user(USER, false);

    let spec = |name: &str| JobSpec {
        name: name.to_string(),
        execute_command: "./run.sh".to_string(),
        ..Default::default()
    };
    let first = coord.store.add_job(owner.id, spec("first")).unwrap();
    let second = coord.store.add_job(owner.id, spec("second")).unwrap();
    let mut compiled = coord.store.add_job(owner.id, spec("compiled")).unwrap();
    compiled.advance(JobState::Compiled);
    coord.store.save_job(&compiled).unwrap();
    let compiled_id = compiled.id;

    let mut client = coord.client().await;
    let response = client
        .request(json!({ "command": "schedule", "username": USER }))
        .await;
    assert_eq!(response["data"]["queued"], 3);

    // The immediate tick takes the compiled job. The next one is an hour away.
    wait_until(|| {
        let store = coord.store.clone();
        async move {
            store
                .job(compiled_id)
                .unwrap()
                .unwrap()
                .log_entries()
                .iter()
                .any(|e| e.message == "No appropriate workstation found")
        }
    })
    .await;
    assert_eq!(coord.job(first.id).state, JobState::Queued);
    assert_eq!(coord.job(second.id).state, JobState::Queued);
    assert_eq!(coord.job(compiled_id).state, JobState::Compiled);
    assert_eq!(
        coord.handle.queue().await.unwrap(),
        vec![first.id, second.id, compiled_id]
    );

    coord.shutdown().await;
}

#[tokio::test]
async fn test_worker_in_maintenance_is_logged_as_skipped() {
    let coord = TestCoordinator::start().await;
    coord.add_user(USER, false);
    coord.add_user(ADMIN, true);
    let _worker = coord.worker("ws1", &[5.0, 5.0]).await;

    let mut admin = coord.client().await;
    let response = admin
        .request(json!({
            "command": "setMaintenance",
            "username": ADMIN,
            "workstation": "ws1",
            "maintenance": true,
        }))
        .await;
    assert_eq!(response["result"], true);

    let job_id = coord.submit(USER, simple_job("sim")).await;
    let job = coord
        .wait_for_state(job_id, JobState::WaitingForWorkstation)
        .await;
    assert!(job
        .log_entries()
        .iter()
        .any(|e| e.message == "ws1 not appropriate: in maintenance"));
    assert!(job.workstation.is_none());

    coord.shutdown().await;
}
