//! Dispatch boundary behaviour: admission queueing, port cooldown,
//! acceptance rate, ghost detection, and the attestation/transcript
//! artifacts a retired job leaves on disk.

use std::sync::Arc;
use std::time::{Duration, Instant};

use vapd::attest::{self, CreationRecord, DeletionRecord, ResourceLimits};
use vapd::container::ports::PortPool;
use vapd::dispatcher::jobs::{ActiveJob, JobState, JobTable};
use vapd::identity::Identity;
use vapd::joblog::JobStore;
use vapd::limits::AcceptWindow;
use vapd::market::Job;
use vapd::signing;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Write a keys.json with 0600 and load it through the real identity path.
fn load_identity(dir: &std::path::Path, n: u8) -> Identity {
    let agent_dir = dir.join(format!("agent-{n}"));
    std::fs::create_dir_all(&agent_dir).unwrap();
    let keys_path = agent_dir.join("keys.json");
    std::fs::write(
        &keys_path,
        serde_json::json!({
            "agent_id": format!("agent-{n}"),
            "identity_name": format!("agent{n}@"),
            "address": format!("RAddr{n}"),
            "i_address": format!("iAddr{n}"),
            "wif": "UnusedWif",
            "network": "testnet",
            "secret_seed": hex::encode([n; 32]),
        })
        .to_string(),
    )
    .unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&keys_path, std::fs::Permissions::from_mode(0o600)).unwrap();
    }
    Identity::load(&keys_path).unwrap()
}

fn job(n: u32) -> Job {
    serde_json::from_value(serde_json::json!({
        "jobId": format!("job-{n}"),
        "jobHash": format!("{:064x}", n),
        "buyerVerusId": "buyer@",
        "amount": "2.5",
        "currency": "VRSC",
        "description": "answer questions about the corpus",
        "status": "requested",
    }))
    .unwrap()
}

// ---------------------------------------------------------------------------
// Queueing and capacity
// ---------------------------------------------------------------------------

#[test]
fn fifth_job_queues_and_promotes_after_retirement() {
    // Pool of 2, queue cap 2: J1/J2 run, J3/J4 queue at #1/#2.
    let tmp = tempfile::tempdir().unwrap();
    let identity = Arc::new(load_identity(tmp.path(), 1));
    let capacity = 2;
    let queue_cap = 2;
    let mut table = JobTable::new();

    for n in 1..=4 {
        table.insert(ActiveJob::new(job(n), identity.clone()));
        if table.in_flight() < capacity {
            table.get_mut(&format!("job-{n}")).unwrap().state = JobState::Starting;
        } else {
            assert!(table.queued() < queue_cap);
            let position = table.enqueue(&format!("job-{n}"));
            assert_eq!(position, (n - 2) as usize);
        }
    }
    assert_eq!(table.in_flight(), 2);
    assert_eq!(table.queued(), 2);
    assert!(table.in_flight() + table.queued() <= capacity + queue_cap);

    // J1 completes: J3 promotes, J4 moves to #1.
    table.remove("job-1");
    let promoted = table.dequeue().unwrap();
    assert_eq!(promoted, "job-3");
    table.get_mut(&promoted).unwrap().state = JobState::Starting;
    assert_eq!(table.queue_position("job-4"), Some(1));
    assert_eq!(table.in_flight(), 2);
}

#[test]
fn accept_rate_cap_skips_the_excess_job() {
    let k = 3;
    let mut window = AcceptWindow::new(k);
    for _ in 0..k {
        assert!(window.try_accept());
    }
    // The (k+1)th acceptance inside the same minute is refused.
    assert!(!window.try_accept());
}

#[test]
fn released_port_unavailable_for_cooldown_period() {
    let cooldown = Duration::from_millis(60);
    let mut pool = PortPool::new(42000, 42000, cooldown);

    assert_eq!(pool.allocate("job-1"), Some(42000));
    let released_at = Instant::now();
    pool.release(42000);

    while released_at.elapsed() < cooldown {
        assert!(
            pool.allocate("job-2").is_none(),
            "port reused {}ms after release",
            released_at.elapsed().as_millis()
        );
        std::thread::sleep(Duration::from_millis(10));
    }
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(pool.allocate("job-2"), Some(42000));
    assert!(pool.check_partition());
}

#[test]
fn ghost_job_detected_after_timeout() {
    let tmp = tempfile::tempdir().unwrap();
    let identity = Arc::new(load_identity(tmp.path(), 2));
    let mut table = JobTable::new();
    table.insert(ActiveJob::new(job(1), identity));
    {
        let entry = table.get_mut("job-1").unwrap();
        entry.state = JobState::Ready;
        entry.ready_at = Some(Instant::now());
    }

    // Not a ghost before the timeout elapses.
    assert!(table.ghosts(Duration::from_millis(50)).is_empty());
    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(table.ghosts(Duration::from_millis(50)), vec!["job-1"]);

    // A buyer turn clears the timer for good.
    table.get_mut("job-1").unwrap().last_buyer_turn = Some(Instant::now());
    assert!(table.ghosts(Duration::from_millis(50)).is_empty());
}

// ---------------------------------------------------------------------------
// Signed artifacts
// ---------------------------------------------------------------------------

#[test]
fn acceptance_message_round_trips_byte_for_byte() {
    let tmp = tempfile::tempdir().unwrap();
    let identity = load_identity(tmp.path(), 3);
    let job = job(7);
    let ts = 1_760_000_000;

    let message = signing::accept_message(
        &job.job_hash,
        &job.buyer_verus_id,
        &job.amount,
        &job.currency,
        ts,
    );
    let signature = identity.signer().sign(message.as_bytes());

    // The verifier reconstructs the message from the same fields.
    let reconstructed = signing::accept_message(
        &job.job_hash,
        &job.buyer_verus_id,
        &job.amount,
        &job.currency,
        ts,
    );
    assert_eq!(message, reconstructed);
    signing::verify(
        &identity.signer().verifying_key(),
        reconstructed.as_bytes(),
        &signature,
    )
    .unwrap();
}

#[test]
fn attestation_pair_verifies_and_embeds_transcript_hash() {
    let tmp = tempfile::tempdir().unwrap();
    let identity = load_identity(tmp.path(), 4);
    let store = JobStore::new(tmp.path().join("jobs"));
    let job = job(9);
    store.init_job(&job).unwrap();

    // A short conversation, then retirement.
    let log = store.log(&job.job_id);
    log.lifecycle("container:created", "port=42000").unwrap();
    log.user_turn("buyer@", "0011223344556677", "hello").unwrap();
    log.assistant_turn("0011223344556677", 42000, "default", "hi!")
        .unwrap();
    log.lifecycle("retired", "reason=timeout").unwrap();

    let created_at = chrono::Utc::now();
    let creation = CreationRecord {
        record_type: attest::TYPE_CREATED,
        job_id: job.job_id.clone(),
        container_id: "c0ffee".to_string(),
        agent_id: identity.agent_id.clone(),
        identity: identity.identity_name.clone(),
        created_at,
        job_hash: attest::local_job_hash(
            &job.job_id,
            &job.description,
            &job.buyer_verus_id,
            &job.amount,
            &job.currency,
            created_at.timestamp(),
        )
        .unwrap(),
        resource_limits: ResourceLimits {
            memory_mb: 2048,
            cpus: 1.0,
        },
        privacy_tier: "standard".to_string(),
    };
    let signed_creation = attest::sign_record(&creation, &identity).unwrap();
    store
        .write_attestation(&job.job_id, "creation-attestation.json", &signed_creation)
        .unwrap();

    let transcript = log.transcript_hash().unwrap();
    let deletion = DeletionRecord {
        record_type: attest::TYPE_DESTROYED,
        job_id: job.job_id.clone(),
        container_id: "c0ffee".to_string(),
        created_at,
        destroyed_at: chrono::Utc::now(),
        data_volumes: vec!["/etc/sandbox".to_string(), "/tmp".to_string()],
        deletion_method: "docker-remove".to_string(),
        transcript_sha256: transcript.clone(),
        reason: None,
    }
    .timeout();
    let signed_deletion = attest::sign_record(&deletion, &identity).unwrap();
    store
        .write_attestation(&job.job_id, "deletion-attestation.json", &signed_deletion)
        .unwrap();

    // Both files exist and verify against the identity's public key.
    let key = identity.signer().verifying_key();
    for file in ["creation-attestation.json", "deletion-attestation.json"] {
        let raw = std::fs::read_to_string(store.job_dir(&job.job_id).join(file)).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        attest::verify_record(&parsed, &key).unwrap();
    }

    let parsed: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(store.job_dir(&job.job_id).join("deletion-attestation.json"))
            .unwrap(),
    )
    .unwrap();
    assert_eq!(parsed["type"], "container:destroyed:timeout");
    assert_eq!(parsed["reason"], "timeout");
    assert_eq!(parsed["transcriptSha256"], transcript);

    // The recorded hash matches a recomputation over the file bytes.
    assert_eq!(log.transcript_hash().unwrap(), transcript);

    // Log entries are monotonic in timestamp.
    let entries = log.read_all().unwrap();
    assert_eq!(entries.len(), 4);
    for pair in entries.windows(2) {
        assert!(pair[0].ts <= pair[1].ts);
    }
}

#[test]
fn restart_gap_entry_appends_to_existing_transcript() {
    let tmp = tempfile::tempdir().unwrap();
    let store = JobStore::new(tmp.path());
    let log = store.log("job-restart");

    log.user_turn("buyer@", "aa00aa00aa00aa00", "first session")
        .unwrap();
    let before = log.transcript_hash().unwrap();

    // What reconciliation writes when it finds an existing transcript.
    log.lifecycle(
        "dispatcher:restarted",
        "previous container lost; a new sandbox starts on demand",
    )
    .unwrap();
    log.user_turn("buyer@", "bb11bb11bb11bb11", "second session")
        .unwrap();

    let entries = log.read_all().unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[1].meta["event"], "dispatcher:restarted");
    assert_ne!(log.transcript_hash().unwrap(), before);
}
