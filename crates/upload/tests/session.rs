mod common;

use std::sync::Arc;
use std::time::Duration;

use cloudgate_backend::{
    AckChecksum, BackendProfile, Challenge, FastPathAnswer, RemoteObjectRef, RemotePart,
};
use cloudgate_transfer::{ByteRange, ChunkState, NoopProgress, ReaderSource, checksum_bytes};
use cloudgate_upload::{
    CancelReason, FastPathResult, SessionState, UploadError, UploadEvent, UploadPolicy,
    UploadRequest, Uploader,
};
use common::*;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn request(data: &[u8]) -> UploadRequest {
    UploadRequest::new(Arc::new(MemorySource::new(data.to_vec())), destination())
}

fn uploader(backend: &Arc<ScriptedBackend>, policy: UploadPolicy) -> Uploader {
    Uploader::new(Arc::clone(backend) as _, policy)
}

#[tokio::test]
async fn twenty_five_mib_in_five_chunks() {
    let data = pattern(25 * MIB);
    let backend = Arc::new(ScriptedBackend::new(profile()));
    let (sink, seen) = recording_sink();

    let outcome = uploader(&backend, fast_policy())
        .session(request(&data).with_chunk_size(5 * MIB))
        .run(sink, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.fast_path, FastPathResult::NoMatch);
    assert_eq!(outcome.chunks.len(), 5);
    for (i, chunk) in outcome.chunks.iter().enumerate() {
        assert_eq!(chunk.spec.number, i as u32 + 1);
        assert_eq!(chunk.spec.size, 5 * MIB);
        assert_eq!(chunk.state, ChunkState::Succeeded);
        assert_eq!(chunk.attempt, 1);
        assert!(!chunk.resumed);
    }
    assert_eq!(outcome.uploaded_bytes, 25 * MIB);
    assert_eq!(outcome.object.size, 25 * MIB);
    assert_eq!(
        outcome.object.fingerprint,
        checksum_bytes(profile().digest, &data)
    );

    let log = backend.log();
    assert_eq!(log.uploads.len(), 5);
    assert_eq!(log.finalizes.len(), 1);
    let keyed: Vec<u32> = log.finalizes[0].parts.iter().map(|p| p.number).collect();
    assert_eq!(keyed, vec![1, 2, 3, 4, 5]);
    assert!(log.aborts.is_empty());

    assert_monotonic_to_100(&seen.lock().unwrap());
}

#[tokio::test]
async fn fifty_byte_file_is_one_chunk() {
    let data = pattern(50);
    let backend = Arc::new(ScriptedBackend::new(profile()));

    let outcome = uploader(&backend, fast_policy())
        .session(request(&data))
        .run(Arc::new(NoopProgress), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.chunks.len(), 1);
    assert_eq!(outcome.chunks[0].spec.size, 50);
    assert_eq!(backend.log().uploaded_numbers(), vec![1]);
}

#[tokio::test]
async fn challenge_answered_and_matched_without_upload() {
    let data = pattern(4096);
    let existing = RemoteObjectRef {
        id: "obj-existing".into(),
        path: destination(),
        size: 4096,
        fingerprint: checksum_bytes(profile().digest, &data),
    };
    let backend = Arc::new(ScriptedBackend::new(profile()).with_probes([
        ProbeStep::Answer(FastPathAnswer::Challenge(Challenge {
            token: "tok-1".into(),
            range: ByteRange::new(1000, 8),
        })),
        ProbeStep::Answer(FastPathAnswer::Matched(existing.clone())),
    ]));
    let (sink, seen) = recording_sink();
    let (tx, mut rx) = mpsc::channel(64);

    let outcome = uploader(&backend, fast_policy())
        .upload_with_events(request(&data), sink, &CancellationToken::new(), tx)
        .await
        .unwrap();

    assert_eq!(outcome.object, existing);
    assert_eq!(outcome.fast_path, FastPathResult::Matched(existing));
    assert!(outcome.chunks.is_empty());
    assert_eq!(outcome.uploaded_bytes, 0);

    let log = backend.log();
    assert!(log.uploads.is_empty());
    assert!(log.inits.is_empty());
    assert_eq!(log.probes.len(), 2);
    assert!(log.probes[0].proof.is_none());
    let proof = log.probes[1].proof.as_ref().unwrap();
    assert_eq!(proof.token, "tok-1");
    assert_eq!(proof.range, ByteRange::new(1000, 8));
    assert_eq!(proof.digest, checksum_bytes(profile().digest, &data[1000..1008]));
    assert_eq!(
        log.probes[0].partial,
        checksum_bytes(profile().digest, &data)
    );

    assert_eq!(*seen.lock().unwrap(), vec![100.0]);

    let mut states = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let UploadEvent::StateChanged { state, .. } = event {
            states.push(state);
        }
    }
    assert_eq!(states, vec![SessionState::Probing, SessionState::Completed]);
}

#[tokio::test]
async fn challenge_limit_falls_back_to_upload() {
    let data = pattern(4096);
    let challenge = || {
        ProbeStep::Answer(FastPathAnswer::Challenge(Challenge {
            token: "rotating".into(),
            range: ByteRange::new(0, 16),
        }))
    };
    let backend = Arc::new(
        ScriptedBackend::new(profile()).with_probes([challenge(), challenge(), challenge()]),
    );
    let policy = UploadPolicy {
        max_challenges: 2,
        ..fast_policy()
    };

    let outcome = uploader(&backend, policy)
        .session(request(&data))
        .run(Arc::new(NoopProgress), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.fast_path, FastPathResult::NoMatch);
    assert_eq!(backend.log().probes.len(), 3);
    assert_eq!(backend.log().uploads.len(), 1);
}

#[tokio::test]
async fn rejected_probe_falls_back_to_upload() {
    let data = pattern(4096);
    let backend = Arc::new(
        ScriptedBackend::new(profile())
            .with_probes([ProbeStep::Reject("proof window expired".into())]),
    );

    let outcome = uploader(&backend, fast_policy())
        .session(request(&data))
        .run(Arc::new(NoopProgress), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.fast_path, FastPathResult::NoMatch);
    assert_eq!(backend.log().finalizes.len(), 1);
}

#[tokio::test]
async fn out_of_range_challenge_falls_back_to_upload() {
    let data = pattern(4096);
    let backend = Arc::new(ScriptedBackend::new(profile()).with_probes([ProbeStep::Answer(
        FastPathAnswer::Challenge(Challenge {
            token: "t".into(),
            range: ByteRange::new(4090, 64),
        }),
    )]));

    let outcome = uploader(&backend, fast_policy())
        .session(request(&data))
        .run(Arc::new(NoopProgress), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.fast_path, FastPathResult::NoMatch);
    assert_eq!(backend.log().probes.len(), 1);
}

#[tokio::test]
async fn fast_path_skipped_when_backend_lacks_it() {
    let data = pattern(4096);
    let backend = Arc::new(ScriptedBackend::new(BackendProfile {
        fast_path: false,
        ..profile()
    }));

    let outcome = uploader(&backend, fast_policy())
        .session(request(&data))
        .run(Arc::new(NoopProgress), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.fast_path, FastPathResult::NotAttempted);
    assert!(backend.log().probes.is_empty());
}

#[tokio::test]
async fn chunk_three_succeeds_on_third_attempt() {
    let data = pattern(5 * 200 * KIB);
    let backend = Arc::new(
        ScriptedBackend::new(profile()).with_faults(3, [Fault::Retryable, Fault::Retryable]),
    );
    let (tx, mut rx) = mpsc::channel(256);

    let outcome = uploader(&backend, fast_policy())
        .upload_with_events(
            request(&data).with_chunk_size(200 * KIB),
            Arc::new(NoopProgress),
            &CancellationToken::new(),
            tx,
        )
        .await
        .unwrap();

    assert_eq!(outcome.chunks.len(), 5);
    assert!(outcome.chunks.iter().all(|c| c.is_succeeded()));
    assert_eq!(outcome.chunks[2].attempt, 3);
    assert_eq!(
        outcome.chunks[2].last_error.as_deref(),
        Some("transport error: connection reset")
    );
    for i in [0, 1, 3, 4] {
        assert_eq!(outcome.chunks[i].attempt, 1);
    }
    assert_eq!(backend.log().uploads_of(3), 3);

    let mut retries = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let UploadEvent::ChunkRetrying { number, attempt, .. } = event {
            retries.push((number, attempt));
        }
    }
    assert_eq!(retries, vec![(3, 1), (3, 2)]);
}

#[tokio::test]
async fn exhausted_budget_fails_with_chunk_number() {
    let data = pattern(5 * 200 * KIB);
    let backend = Arc::new(ScriptedBackend::new(profile()).with_faults(
        3,
        [Fault::Retryable, Fault::Retryable, Fault::Retryable],
    ));
    let (sink, seen) = recording_sink();

    let err = uploader(&backend, fast_policy())
        .upload(
            request(&data).with_chunk_size(200 * KIB).with_concurrency(1),
            sink,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    match &err {
        UploadError::ChunkUpload {
            number, attempts, ..
        } => {
            assert_eq!(*number, 3);
            assert_eq!(*attempts, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.chunk_number(), Some(3));

    let log = backend.log();
    assert_eq!(log.uploads_of(3), 3);
    assert_eq!(log.uploads_of(4), 0);
    assert!(log.finalizes.is_empty());
    assert_eq!(log.aborts, vec![UPLOAD_ID.to_string()]);

    // Partial success is never reported as completion.
    assert!(seen.lock().unwrap().iter().all(|p| *p < 100.0));
}

#[tokio::test]
async fn fatal_rejection_is_not_retried() {
    let data = pattern(3 * 200 * KIB);
    let backend = Arc::new(ScriptedBackend::new(profile()).with_faults(2, [Fault::Fatal]));

    let err = uploader(&backend, fast_policy())
        .upload(
            request(&data).with_chunk_size(200 * KIB).with_concurrency(1),
            Arc::new(NoopProgress),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        UploadError::ChunkUpload {
            number: 2,
            attempts: 1,
            ..
        }
    ));
    assert_eq!(backend.log().uploads_of(2), 1);
}

#[tokio::test]
async fn checksum_mismatch_is_retried() {
    let data = pattern(2 * 200 * KIB);
    let backend = Arc::new(ScriptedBackend::new(profile()).with_faults(1, [Fault::WrongChecksum]));

    let outcome = uploader(&backend, fast_policy())
        .session(request(&data).with_chunk_size(200 * KIB))
        .run(Arc::new(NoopProgress), &CancellationToken::new())
        .await
        .unwrap();

    let first = &outcome.chunks[0];
    assert_eq!(first.attempt, 2);
    assert_eq!(
        first.checksum.as_ref().unwrap(),
        &checksum_bytes(profile().digest, &data[..200 * KIB as usize])
    );
    assert!(first.last_error.as_deref().unwrap().contains("checksum mismatch"));
}

#[tokio::test]
async fn persistent_checksum_mismatch_fails() {
    let data = pattern(200 * KIB);
    let backend = Arc::new(ScriptedBackend::new(profile()).with_faults(
        1,
        [Fault::WrongChecksum, Fault::WrongChecksum, Fault::WrongChecksum],
    ));

    let err = uploader(&backend, fast_policy())
        .upload(request(&data), Arc::new(NoopProgress), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        UploadError::ChecksumMismatch {
            number,
            attempts,
            expected,
            actual,
        } => {
            assert_eq!(number, 1);
            assert_eq!(attempts, 3);
            assert_eq!(expected, checksum_bytes(profile().digest, &data));
            assert_ne!(expected, actual);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn unconfirmed_ack_is_retried() {
    let data = pattern(2 * 200 * KIB);
    let backend = Arc::new(ScriptedBackend::new(profile()).with_faults(1, [Fault::NoChecksum]));

    let outcome = uploader(&backend, fast_policy())
        .session(request(&data).with_chunk_size(200 * KIB))
        .run(Arc::new(NoopProgress), &CancellationToken::new())
        .await
        .unwrap();

    let first = &outcome.chunks[0];
    assert_eq!(first.attempt, 2);
    assert!(first.is_succeeded());
    assert!(first.last_error.as_deref().unwrap().contains("no checksum"));
    assert_eq!(backend.log().uploads_of(1), 2);
}

#[tokio::test]
async fn never_confirmed_chunk_fails() {
    let data = pattern(200 * KIB);
    let backend = Arc::new(ScriptedBackend::new(profile()).with_faults(
        1,
        [Fault::NoChecksum, Fault::NoChecksum, Fault::NoChecksum],
    ));

    let err = uploader(&backend, fast_policy())
        .upload(request(&data), Arc::new(NoopProgress), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(
        matches!(err, UploadError::ChecksumUnconfirmed { number: 1, attempts: 3 }),
        "{err}"
    );
    let log = backend.log();
    assert!(log.finalizes.is_empty());
    assert_eq!(log.aborts, vec![UPLOAD_ID.to_string()]);
}

#[tokio::test]
async fn server_verified_backend_needs_no_ack_checksum() {
    let data = pattern(2 * 200 * KIB);
    let backend = Arc::new(
        ScriptedBackend::new(BackendProfile {
            ack_checksum: AckChecksum::ServerVerified,
            ..profile()
        })
        .with_faults(1, [Fault::NoChecksum])
        .with_faults(2, [Fault::NoChecksum]),
    );

    let outcome = uploader(&backend, fast_policy())
        .session(request(&data).with_chunk_size(200 * KIB))
        .run(Arc::new(NoopProgress), &CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.chunks.iter().all(|c| c.is_succeeded() && c.attempt == 1));
    assert_eq!(outcome.chunks[0].remote_ack.as_deref(), Some("etag-1"));
    assert_eq!(
        outcome.chunks[1].checksum.as_ref().unwrap(),
        &checksum_bytes(profile().digest, &data[200 * KIB as usize..])
    );
}

#[tokio::test]
async fn auth_rejection_refreshes_credential() {
    let data = pattern(3 * 200 * KIB);
    let backend = Arc::new(ScriptedBackend::new(profile()).with_faults(2, [Fault::Auth]));

    let outcome = uploader(&backend, fast_policy())
        .session(request(&data).with_chunk_size(200 * KIB).with_concurrency(1))
        .run(Arc::new(NoopProgress), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.chunks[1].attempt, 2);
    assert_eq!(backend.credential_calls(), 2);
    assert_eq!(outcome.credential_refreshes, 2);

    let log = backend.log();
    let keys: Vec<&str> = log
        .uploads
        .iter()
        .filter(|(n, _)| *n == 2)
        .map(|(_, key)| key.as_str())
        .collect();
    assert_eq!(keys, vec!["key-1", "key-2"]);
    assert_eq!(log.uploads.last().unwrap().1, "key-2");
}

#[tokio::test]
async fn short_lived_credentials_refresh_reactively() {
    let data = pattern(2 * 200 * KIB);
    let backend = Arc::new(
        ScriptedBackend::new(profile())
            .with_credential_ttl(chrono::Duration::seconds(20))
            .with_faults(2, [Fault::Auth]),
    );

    let outcome = uploader(&backend, fast_policy())
        .session(request(&data).with_chunk_size(200 * KIB).with_concurrency(1))
        .run(Arc::new(NoopProgress), &CancellationToken::new())
        .await
        .unwrap();

    // One credential for the whole session plus one after the rejection.
    assert_eq!(backend.credential_calls(), 2);
    assert!(outcome.chunks.iter().all(|c| c.is_succeeded()));
}

#[tokio::test]
async fn credential_failure_is_terminal() {
    let data = pattern(4096);
    let backend = Arc::new(ScriptedBackend::new(profile()).with_credential_failures(1));

    let err = uploader(&backend, fast_policy())
        .upload(request(&data), Arc::new(NoopProgress), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::Credential(_)), "{err}");
    let log = backend.log();
    assert!(log.probes.is_empty());
    assert!(log.uploads.is_empty());
}

#[tokio::test]
async fn cancellation_stops_new_chunks() {
    let data = pattern(5 * 200 * KIB);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let backend = Arc::new(ScriptedBackend::new(profile()).on_upload(move |number| {
        if number == 2 {
            trigger.cancel();
        }
    }));
    let (tx, mut rx) = mpsc::channel(256);

    let err = uploader(&backend, fast_policy())
        .upload_with_events(
            request(&data).with_chunk_size(200 * KIB).with_concurrency(1),
            Arc::new(NoopProgress),
            &cancel,
            tx,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::Canceled(CancelReason::Requested)));
    let log = backend.log();
    assert_eq!(log.uploaded_numbers(), vec![1, 2]);
    assert!(log.finalizes.is_empty());
    assert_eq!(log.aborts, vec![UPLOAD_ID.to_string()]);

    let mut last_state = None;
    while let Ok(event) = rx.try_recv() {
        if let UploadEvent::StateChanged { state, .. } = event {
            last_state = Some(state);
        }
    }
    assert_eq!(last_state, Some(SessionState::Canceled));
}

#[tokio::test]
async fn cancelled_before_start_does_nothing() {
    let backend = Arc::new(ScriptedBackend::new(profile()));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = uploader(&backend, fast_policy())
        .upload(request(&pattern(4096)), Arc::new(NoopProgress), &cancel)
        .await
        .unwrap_err();
    assert!(err.is_canceled());
    assert_eq!(backend.credential_calls(), 0);
}

#[tokio::test]
async fn session_timeout_reports_canceled() {
    let data = pattern(2 * 200 * KIB);
    let backend = Arc::new(
        ScriptedBackend::new(profile()).with_upload_delay(Duration::from_secs(30)),
    );
    let policy = UploadPolicy {
        session_timeout_secs: Some(1),
        ..fast_policy()
    };

    let started = std::time::Instant::now();
    let err = uploader(&backend, policy)
        .upload(
            request(&data).with_chunk_size(200 * KIB),
            Arc::new(NoopProgress),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::Canceled(CancelReason::Timeout)), "{err}");
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(backend.log().aborts, vec![UPLOAD_ID.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn hung_finalize_is_cut_off_by_session_timeout() {
    let data = pattern(200 * KIB);
    let backend = Arc::new(
        ScriptedBackend::new(profile()).with_finalize_delay(Duration::from_secs(3600)),
    );
    let policy = UploadPolicy {
        session_timeout_secs: Some(5),
        ..fast_policy()
    };

    let started = tokio::time::Instant::now();
    let err = uploader(&backend, policy)
        .upload(request(&data), Arc::new(NoopProgress), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::Canceled(CancelReason::Timeout)), "{err}");
    assert!(started.elapsed() < Duration::from_secs(60));
    let log = backend.log();
    assert_eq!(log.finalizes.len(), 1);
    assert_eq!(log.aborts, vec![UPLOAD_ID.to_string()]);
}

#[tokio::test]
async fn ordered_backend_uploads_one_at_a_time() {
    let data = pattern(6 * 200 * KIB);
    let backend = Arc::new(
        ScriptedBackend::new(BackendProfile {
            ordered_chunks: true,
            ..profile()
        })
        .with_upload_delay(Duration::from_millis(5)),
    );

    uploader(&backend, fast_policy())
        .upload(
            request(&data).with_chunk_size(200 * KIB).with_concurrency(8),
            Arc::new(NoopProgress),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(backend.max_in_flight(), 1);
    assert_eq!(backend.log().uploaded_numbers(), vec![1, 2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn concurrency_is_bounded() {
    let data = pattern(12 * 200 * KIB);
    let backend = Arc::new(
        ScriptedBackend::new(profile()).with_upload_delay(Duration::from_millis(10)),
    );
    let (sink, seen) = recording_sink();

    let outcome = uploader(&backend, fast_policy())
        .session(request(&data).with_chunk_size(200 * KIB).with_concurrency(3))
        .run(sink, &CancellationToken::new())
        .await
        .unwrap();

    assert!(backend.max_in_flight() <= 3);
    assert_eq!(outcome.chunks.len(), 12);
    let mut numbers = backend.log().uploaded_numbers();
    numbers.sort_unstable();
    assert_eq!(numbers, (1..=12).collect::<Vec<_>>());
    assert_monotonic_to_100(&seen.lock().unwrap());
}

#[tokio::test]
async fn staged_parts_are_resumed() {
    let size = 200 * KIB;
    let data = pattern(4 * size);
    let digest = profile().digest;
    let part = |number: u32, bytes: &[u8]| RemotePart {
        number,
        size,
        checksum: checksum_bytes(digest, bytes),
        etag: format!("staged-{number}"),
    };
    let s = size as usize;
    let backend = Arc::new(ScriptedBackend::new(profile()).with_existing_parts(vec![
        part(1, &data[..s]),
        part(2, &data[s..2 * s]),
        // Stale: staged from different content.
        part(3, b"something else"),
    ]));
    let (sink, seen) = recording_sink();

    let outcome = uploader(&backend, fast_policy())
        .session(request(&data).with_chunk_size(size).with_concurrency(1))
        .run(sink, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(backend.log().uploaded_numbers(), vec![3, 4]);
    assert_eq!(outcome.resumed_bytes, 2 * size);
    assert_eq!(outcome.uploaded_bytes, 2 * size);
    assert!(outcome.chunks[0].resumed && outcome.chunks[1].resumed);
    assert!(!outcome.chunks[2].resumed);

    let log = backend.log();
    let etags: Vec<&str> = log.finalizes[0]
        .parts
        .iter()
        .map(|p| p.etag.as_str())
        .collect();
    assert_eq!(etags, vec!["staged-1", "staged-2", "etag-3", "etag-4"]);
    assert_monotonic_to_100(&seen.lock().unwrap());
}

#[tokio::test]
async fn finalize_polls_while_assembling() {
    let data = pattern(4096);
    let backend = Arc::new(ScriptedBackend::new(profile()).with_assembling(2));

    uploader(&backend, fast_policy())
        .upload(request(&data), Arc::new(NoopProgress), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(backend.log().finalizes.len(), 3);
}

#[tokio::test]
async fn finalize_poll_bound_is_backend_busy() {
    let data = pattern(4096);
    let backend = Arc::new(ScriptedBackend::new(profile()).with_assembling(10));
    let policy = UploadPolicy {
        finalize_polls: 2,
        ..fast_policy()
    };

    let err = uploader(&backend, policy)
        .upload(request(&data), Arc::new(NoopProgress), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::BackendBusy { polls: 3 }), "{err}");
    assert_eq!(backend.log().finalizes.len(), 3);
}

#[tokio::test]
async fn empty_source_creates_object_directly() {
    let backend = Arc::new(ScriptedBackend::new(profile()));
    let (sink, seen) = recording_sink();

    let outcome = uploader(&backend, fast_policy())
        .session(request(&[]))
        .run(sink, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.object.size, 0);
    assert_eq!(outcome.fast_path, FastPathResult::NotAttempted);
    let log = backend.log();
    assert_eq!(log.empties, vec![destination()]);
    assert!(log.inits.is_empty());
    assert!(log.probes.is_empty());
    assert_eq!(*seen.lock().unwrap(), vec![100.0]);
}

#[tokio::test]
async fn sequential_source_is_spooled_and_cleaned_up() {
    let spool = tempfile::tempdir().unwrap();
    let data = pattern(3 * 200 * KIB);
    let source = ReaderSource::new(std::io::Cursor::new(data.clone()), Some(1234));
    let backend = Arc::new(ScriptedBackend::new(profile()));
    let policy = UploadPolicy {
        spool_dir: Some(spool.path().to_path_buf()),
        chunk_size: Some(200 * KIB),
        ..fast_policy()
    };

    let outcome = uploader(&backend, policy)
        .session(UploadRequest::new(Arc::new(source), destination()))
        .run(Arc::new(NoopProgress), &CancellationToken::new())
        .await
        .unwrap();

    // The declared 1234 bytes were revised to the bytes actually read.
    assert_eq!(outcome.object.size, data.len() as u64);
    assert_eq!(outcome.chunks.len(), 3);
    assert_eq!(backend.log().inits[0].size, data.len() as u64);
    assert_eq!(std::fs::read_dir(spool.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn invalid_overrides_are_rejected() {
    let backend = Arc::new(ScriptedBackend::new(profile()));
    let err = uploader(&backend, fast_policy())
        .upload(
            request(&pattern(10)).with_concurrency(0),
            Arc::new(NoopProgress),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::InvalidRequest(_)));
    assert_eq!(backend.credential_calls(), 0);
}

#[tokio::test]
async fn shared_broker_fetches_one_credential() {
    let backend = Arc::new(ScriptedBackend::new(profile()));
    let up = uploader(&backend, fast_policy());

    let a = pattern(300 * KIB);
    let b: Vec<u8> = pattern(300 * KIB).into_iter().rev().collect();
    let cancel = CancellationToken::new();
    let (ra, rb) = tokio::join!(
        up.upload(request(&a), Arc::new(NoopProgress), &cancel),
        up.upload(
            UploadRequest::new(
                Arc::new(MemorySource::new(b)),
                cloudgate_backend::RemotePath::parse("media/other.bin").unwrap(),
            ),
            Arc::new(NoopProgress),
            &cancel,
        ),
    );
    ra.unwrap();
    rb.unwrap();
    assert_eq!(backend.credential_calls(), 1);
}

#[tokio::test]
async fn session_events_follow_the_state_machine() {
    let data = pattern(2 * 200 * KIB);
    let backend = Arc::new(ScriptedBackend::new(profile()));
    let (tx, mut rx) = mpsc::channel(256);

    let outcome = uploader(&backend, fast_policy())
        .upload_with_events(
            request(&data).with_chunk_size(200 * KIB),
            Arc::new(NoopProgress),
            &CancellationToken::new(),
            tx,
        )
        .await
        .unwrap();

    let mut states = Vec::new();
    let mut succeeded = Vec::new();
    let mut last_percent = 0.0;
    while let Ok(event) = rx.try_recv() {
        match event {
            UploadEvent::StateChanged { session_id, state } => {
                assert_eq!(session_id, outcome.session_id);
                states.push(state);
            }
            UploadEvent::ChunkSucceeded { number, .. } => succeeded.push(number),
            UploadEvent::Progress { percent, .. } => {
                assert!(percent >= last_percent);
                last_percent = percent;
            }
            _ => {}
        }
    }
    assert_eq!(
        states,
        vec![
            SessionState::Probing,
            SessionState::Planning,
            SessionState::Transferring,
            SessionState::Finalizing,
            SessionState::Completed,
        ]
    );
    succeeded.sort_unstable();
    assert_eq!(succeeded, vec![1, 2]);
    assert!(last_percent <= 99.0);
}
