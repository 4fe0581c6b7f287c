#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use overlay_fs::error::FetchError;
use overlay_fs::overlay::SendPolicy;
use overlay_fs::store::OpenFlags;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::task::JoinSet;

use common::{Fixture, RecordingSender, fetch_error, wait_until};

fn transport_failure(path: &str) -> FetchError {
    FetchError::transport(path, std::io::Error::other("connection reset by peer"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_callers_share_one_delayed_retrieval() {
    let fx = Fixture::new(|r| {
        r.with_object("/a/b.txt", "hello")
            .with_delay(Duration::from_millis(200))
    })
    .await;

    let (first, second) = tokio::join!(
        fx.overlay.exists("/a/b.txt"),
        fx.overlay.exists("/a/b.txt")
    );

    assert!(first.unwrap());
    assert!(second.unwrap());
    assert_eq!(fx.retriever.calls(), vec!["/a/b.txt".to_owned()]);
    assert_eq!(fx.read_local("/a/b.txt").unwrap(), b"hello");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_readers_cause_a_single_retrieval() {
    let mut gate = None;
    let fx = Fixture::new(|r| {
        let (r, g) = r.with_object("/big.bin", "payload").gated();
        gate = Some(g);
        r
    })
    .await;

    let mut set = JoinSet::new();
    for _ in 0..12 {
        let overlay = fx.overlay.clone();
        set.spawn(async move {
            let mut file = overlay.open_for_read("/big.bin").await?;
            let mut content = String::new();
            file.read_to_string(&mut content).await?;
            Ok::<_, std::io::Error>(content)
        });
    }

    wait_until("the retrieval to start", || fx.retriever.call_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fx.overlay.pending(), 1);
    assert!(fx.read_local("/big.bin").is_none());
    assert_eq!(set.len(), 12, "no reader may finish before the retrieval does");
    gate.unwrap().add_permits(1);

    while let Some(res) = set.join_next().await {
        assert_eq!(res.unwrap().unwrap(), "payload");
    }
    assert_eq!(fx.retriever.call_count(), 1);
    assert_eq!(fx.overlay.pending(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn present_path_is_not_retrieved_again() {
    let fx = Fixture::new(|r| r.with_object("/doc.txt", "v1")).await;

    assert!(fx.overlay.exists("/doc.txt").await.unwrap());
    assert!(fx.overlay.exists("/doc.txt").await.unwrap());
    let mut file = fx.overlay.open_for_read("/doc.txt").await.unwrap();
    let mut content = String::new();
    file.read_to_string(&mut content).await.unwrap();

    assert_eq!(content, "v1");
    assert_eq!(fx.retriever.call_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn transport_failure_propagates_and_leaves_path_absent() {
    let fx = Fixture::new(|r| r.with_failure("/net.txt", transport_failure("/net.txt"))).await;

    let err = fx.overlay.exists("/net.txt").await.unwrap_err();
    assert!(
        matches!(fetch_error(&err), Some(FetchError::Transport { .. })),
        "expected a transport failure, got {err:?}"
    );

    assert!(!fx.store.exists("/net.txt").await.unwrap());
    let listed = fx.overlay.list_directory("/", &|_: &str| true).await.unwrap();
    assert!(listed.is_empty(), "nothing may be left behind: {listed:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_waiters_see_the_instigators_failure() {
    let mut gate = None;
    let fx = Fixture::new(|r| {
        let (r, g) = r.with_failure("/x.txt", transport_failure("/x.txt")).gated();
        gate = Some(g);
        r
    })
    .await;

    let mut set = JoinSet::new();
    for _ in 0..5 {
        let overlay = fx.overlay.clone();
        set.spawn(async move { overlay.exists("/x.txt").await });
    }
    wait_until("the retrieval to start", || fx.retriever.call_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    gate.unwrap().add_permits(1);

    while let Some(res) = set.join_next().await {
        let err = res.unwrap().unwrap_err();
        assert!(matches!(fetch_error(&err), Some(FetchError::Transport { .. })));
    }
    assert_eq!(fx.retriever.call_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_mid_fetch_releases_waiters() {
    let mut gate = None;
    let fx = Fixture::new(|r| {
        let (r, g) = r.with_object("/slow.txt", "never").gated();
        gate = Some(g);
        r
    })
    .await;
    let _gate = gate.unwrap();

    let mut set = JoinSet::new();
    for _ in 0..4 {
        let overlay = fx.overlay.clone();
        set.spawn(async move { overlay.exists("/slow.txt").await });
    }
    wait_until("the retrieval to start", || fx.retriever.call_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(5), fx.overlay.close())
        .await
        .expect("close must not hang")
        .unwrap();

    let outcomes = tokio::time::timeout(Duration::from_secs(5), async {
        let mut outcomes = Vec::new();
        while let Some(res) = set.join_next().await {
            outcomes.push(res.unwrap());
        }
        outcomes
    })
    .await
    .expect("every waiter must unblock");

    for outcome in outcomes {
        let err = outcome.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Interrupted, "got {err:?}");
    }
    wait_until("the retriever to be dropped", || fx.retriever.in_flight() == 0).await;

    assert!(!fx.overlay.exists("/slow.txt").await.unwrap());
    assert_eq!(fx.retriever.call_count(), 1, "a closed overlay fetches nothing");
    assert!(fx.read_local("/slow.txt").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn root_and_empty_paths_are_never_retrieved() {
    let fx = Fixture::new(|r| r).await;

    for path in ["", "/", "//"] {
        let err = fx.overlay.retrieve(path).await.unwrap_err();
        assert!(
            matches!(err, FetchError::NotFound { .. }),
            "{path:?} gave {err:?}"
        );
    }
    assert_eq!(fx.retriever.call_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn copy_retrieves_the_source_first() {
    let fx = Fixture::new(|r| {
        r.with_object("/src.txt", "copied content")
            .with_delay(Duration::from_millis(50))
    })
    .await;

    fx.overlay
        .copy_file("/src.txt", "/dest/copy.txt", false)
        .await
        .unwrap();

    assert_eq!(fx.retriever.calls(), vec!["/src.txt".to_owned()]);
    assert_eq!(fx.read_local("/dest/copy.txt").unwrap(), b"copied content");
    assert_eq!(fx.read_local("/src.txt").unwrap(), b"copied content");
}

#[tokio::test(flavor = "multi_thread")]
async fn copy_of_a_missing_source_fails_not_found() {
    let fx = Fixture::new(|r| r).await;

    let err = fx
        .overlay
        .copy_file("/nope.txt", "/dest.txt", false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(fx.read_local("/dest.txt").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_remote_path_does_not_exist() {
    let fx = Fixture::new(|r| r).await;

    assert!(!fx.overlay.exists("/missing.txt").await.unwrap());
    assert!(!fx.overlay.exists("/missing.txt").await.unwrap());

    let err = fx.overlay.open_for_read("/missing.txt").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(fx.retriever.call_count(), 3, "every top-level call is a fresh attempt");
}

#[tokio::test(flavor = "multi_thread")]
async fn other_local_failures_are_not_retried() {
    let fx = Fixture::new(|r| r.with_object("/a.txt", "a")).await;

    let err = fx.overlay.open_for_read("/../a.txt").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(fx.retriever.call_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn pass_through_operations_never_retrieve() {
    let fx = Fixture::new(|r| r.with_object("/remote.txt", "remote")).await;

    fx.overlay.create_directory("/dir").await.unwrap();
    let err = fx.overlay.attributes("/remote.txt").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    fx.overlay.delete("/remote.txt", false).await.unwrap();
    let listed = fx.overlay.list_directory("/", &|_: &str| true).await.unwrap();
    assert_eq!(listed, vec!["/dir".to_owned()]);
    let err = fx
        .overlay
        .open_channel("/remote.txt", OpenFlags::READ)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    fx.overlay.expire().await;

    assert_eq!(fx.retriever.call_count(), 0);
    assert!(!fx.overlay.is_temporary());
    assert!(fx.overlay.base_directory().ends_with("store"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn equivalent_spellings_share_one_retrieval() {
    let fx = Fixture::new(|r| {
        r.with_object("/a/b.txt", "x")
            .with_delay(Duration::from_millis(200))
    })
    .await;

    let (a, b) = tokio::join!(
        fx.overlay.exists("/a//b.txt"),
        fx.overlay.exists("a/b.txt/")
    );
    assert!(a.unwrap());
    assert!(b.unwrap());
    assert_eq!(fx.retriever.calls(), vec!["/a/b.txt".to_owned()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn closing_a_write_handle_sends_its_content() {
    let fx = Fixture::new(|r| r).await;
    fx.overlay.create_directory("/out").await.unwrap();

    let mut handle = fx
        .overlay
        .open_for_write("/out/report.txt", OpenFlags::OVERWRITE)
        .await
        .unwrap();
    handle.write_all(b"final numbers").await.unwrap();
    assert!(fx.sender.sent().is_empty(), "nothing is sent before close");
    handle.close().await.unwrap();

    let sent = fx.sender.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "/out/report.txt");
    assert_eq!(&sent[0].1[..], b"final numbers");
    assert_eq!(fx.retriever.call_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn dropping_a_write_handle_sends_nothing() {
    let fx = Fixture::new(|r| r).await;

    let mut handle = fx
        .overlay
        .open_for_write("/draft.txt", OpenFlags::OVERWRITE)
        .await
        .unwrap();
    handle.write_all(b"half done").await.unwrap();
    drop(handle);

    assert!(fx.sender.sent().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_send_failure_is_returned_from_close() {
    let fx = Fixture::build(|r| r, RecordingSender::failing, SendPolicy::Sync).await;

    let mut handle = fx
        .overlay
        .open_for_write("/rejected.txt", OpenFlags::OVERWRITE)
        .await
        .unwrap();
    handle.write_all(b"data").await.unwrap();
    let err = handle.close().await.unwrap_err();

    assert!(matches!(fetch_error(&err), Some(FetchError::Transport { .. })));
    assert_eq!(fx.read_local("/rejected.txt").unwrap(), b"data");
}

#[tokio::test(flavor = "multi_thread")]
async fn background_sends_finish_before_close_returns() {
    let fx = Fixture::build(|r| r, RecordingSender::new, SendPolicy::Background).await;

    for i in 0..3 {
        let mut handle = fx
            .overlay
            .open_for_write(&format!("/bg-{i}.txt"), OpenFlags::OVERWRITE)
            .await
            .unwrap();
        handle.write_all(format!("n{i}").as_bytes()).await.unwrap();
        handle.close().await.unwrap();
    }
    fx.overlay.close().await.unwrap();

    let mut sent: Vec<_> = fx.sender.sent().into_iter().map(|(p, _)| p).collect();
    sent.sort();
    assert_eq!(sent, vec!["/bg-0.txt", "/bg-1.txt", "/bg-2.txt"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn explicit_send_pushes_local_content() {
    let fx = Fixture::new(|r| r.with_object("/pulled.txt", "from remote")).await;

    assert!(fx.overlay.exists("/pulled.txt").await.unwrap());
    fx.overlay.send("/pulled.txt").await.unwrap();

    let sent = fx.sender.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(&sent[0].1[..], b"from remote");

    let err = fx.overlay.send("/").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test(flavor = "multi_thread")]
async fn temporary_store_is_cleared_on_close() {
    let tmp = tempfile::tempdir().unwrap();
    let store: Arc<dyn overlay_fs::store::LocalStore> = Arc::new(
        overlay_fs::store::DirStore::temporary(&tmp.path().join("scratch"))
            .await
            .unwrap(),
    );
    let retriever = Arc::new(
        common::MockRetriever::new(Arc::clone(&store)).with_object("/t.txt", "temp"),
    );
    let sender = Arc::new(RecordingSender::new(Arc::clone(&store)));
    let overlay = common::overlay_over(&store, &retriever, &sender, SendPolicy::Sync);

    assert!(overlay.is_temporary());
    assert!(overlay.exists("/t.txt").await.unwrap());
    overlay.close().await.unwrap();

    let left: Vec<_> = std::fs::read_dir(tmp.path().join("scratch"))
        .unwrap()
        .collect();
    assert!(left.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn background_handle_closed_after_overlay_sends_inline() {
    let fx = Fixture::build(|r| r, RecordingSender::new, SendPolicy::Background).await;
    let mut handle = fx
        .overlay
        .open_for_write("/late.txt", OpenFlags::OVERWRITE)
        .await
        .unwrap();
    handle.write_all(b"late").await.unwrap();

    fx.overlay.clone().close().await.unwrap();
    handle.close().await.unwrap();

    let sent = fx.sender.sent();
    assert_eq!(sent.len(), 1, "send must have run before close returned");
    assert_eq!(sent[0].0, "/late.txt");
    assert_eq!(&sent[0].1[..], b"late");
}

#[tokio::test(flavor = "multi_thread")]
async fn late_background_send_from_wiped_store_reports_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let store: Arc<dyn overlay_fs::store::LocalStore> = Arc::new(
        overlay_fs::store::DirStore::temporary(&tmp.path().join("scratch"))
            .await
            .unwrap(),
    );
    let retriever = Arc::new(common::MockRetriever::new(Arc::clone(&store)));
    let sender = Arc::new(RecordingSender::new(Arc::clone(&store)));
    let overlay = common::overlay_over(&store, &retriever, &sender, SendPolicy::Background);

    let mut handle = overlay
        .open_for_write("/gone.txt", OpenFlags::OVERWRITE)
        .await
        .unwrap();
    handle.write_all(b"soon wiped").await.unwrap();
    handle.flush().await.unwrap();
    overlay.close().await.unwrap();

    let err = handle.close().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(sender.sent().is_empty());
}
