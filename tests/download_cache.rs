mod common;

use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use common::*;
use tempfile::TempDir;
use vbox_builder::{
    fetch_iso, CancelToken, ChecksumType, DownloadError, Fetched, FileCache, IsoRequest,
};

fn request<'a>(url: &'a str, checksum: &'a str) -> IsoRequest<'a> {
    IsoRequest {
        url,
        checksum_type: ChecksumType::Md5,
        checksum,
    }
}

fn ready(fetched: Fetched) -> std::path::PathBuf {
    match fetched {
        Fetched::Ready(path) => path,
        Fetched::Cancelled => panic!("fetch was cancelled"),
    }
}

#[test]
fn concurrent_builds_share_one_download() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("cache");

    let mut server = mockito::Server::new();
    let mock = server
        .mock("GET", "/os.iso")
        .with_status(200)
        .with_body("hello")
        .expect(1)
        .create();
    let url = format!("{}/os.iso", server.url());

    let paths: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let root = root.clone();
                let url = url.clone();
                s.spawn(move || {
                    // Each build opens the shared cache on its own.
                    let cache = FileCache::open(&root).unwrap();
                    let ui = MemoryUi::default();
                    let cancel = CancelToken::new();
                    ready(fetch_iso(request(&url, HELLO_MD5), &cache, &ui, &cancel).unwrap())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    mock.assert();
    assert_eq!(paths[0], paths[1]);
    assert_eq!(fs::read(&paths[0]).unwrap(), b"hello");
    assert_eq!(fs::read_dir(root.join("blobs")).unwrap().count(), 1);
    assert_eq!(partial_files(&root), 0);
}

#[test]
fn repeat_fetch_reuses_verified_cache_entry() {
    let tmp = TempDir::new().unwrap();
    let cache = FileCache::open(tmp.path()).unwrap();

    let mut server = mockito::Server::new();
    let mock = server
        .mock("GET", "/os.iso")
        .with_status(200)
        .with_body("hello")
        .expect(1)
        .create();
    let url = format!("{}/os.iso", server.url());
    let cancel = CancelToken::new();

    let first = ready(
        fetch_iso(request(&url, HELLO_MD5), &cache, &MemoryUi::default(), &cancel).unwrap(),
    );
    let ui = MemoryUi::default();
    let second = ready(fetch_iso(request(&url, HELLO_MD5), &cache, &ui, &cancel).unwrap());

    mock.assert();
    assert_eq!(first, second);
    assert!(ui
        .lines()
        .iter()
        .any(|l| l.starts_with("message: Verifying cached ISO")));
}

#[test]
fn corrupt_cache_entry_is_fetched_again() {
    let tmp = TempDir::new().unwrap();
    let cache = FileCache::open(tmp.path()).unwrap();

    let mut server = mockito::Server::new();
    let mock = server
        .mock("GET", "/os.iso")
        .with_status(200)
        .with_body("hello")
        .expect(2)
        .create();
    let url = format!("{}/os.iso", server.url());
    let cancel = CancelToken::new();

    let path = ready(
        fetch_iso(request(&url, HELLO_MD5), &cache, &MemoryUi::default(), &cancel).unwrap(),
    );
    fs::write(&path, b"bit rot").unwrap();

    let ui = MemoryUi::default();
    let again = ready(fetch_iso(request(&url, HELLO_MD5), &cache, &ui, &cancel).unwrap());

    mock.assert();
    assert_eq!(fs::read(&again).unwrap(), b"hello");
    assert!(ui
        .lines()
        .iter()
        .any(|l| l.starts_with("error: Cached ISO is corrupt")));
}

#[test]
fn mismatch_is_never_committed() {
    let tmp = TempDir::new().unwrap();
    let cache = FileCache::open(tmp.path()).unwrap();

    let mut server = mockito::Server::new();
    let _mock = server
        .mock("GET", "/os.iso")
        .with_status(200)
        .with_body("tampered")
        .create();
    let url = format!("{}/os.iso", server.url());

    let err = fetch_iso(
        request(&url, HELLO_MD5),
        &cache,
        &MemoryUi::default(),
        &CancelToken::new(),
    )
    .unwrap_err();

    match err.downcast_ref::<DownloadError>() {
        Some(DownloadError::ChecksumMismatch { expected, .. }) => {
            assert_eq!(expected, HELLO_MD5)
        }
        other => panic!("expected checksum mismatch, got {other:?}"),
    }
    let key = request(&url, HELLO_MD5).cache_key();
    assert!(cache.get(&key).unwrap().is_none());
    assert_eq!(partial_files(tmp.path()), 0);
}

#[test]
fn changed_checksum_uses_a_new_entry() {
    let tmp = TempDir::new().unwrap();
    let cache = FileCache::open(tmp.path()).unwrap();

    let mut server = mockito::Server::new();
    let mock = server
        .mock("GET", "/os.iso")
        .with_status(200)
        .with_body("hello")
        .expect(2)
        .create();
    let url = format!("{}/os.iso", server.url());
    let cancel = CancelToken::new();

    let ui = MemoryUi::default();
    let old = ready(fetch_iso(request(&url, HELLO_MD5), &cache, &ui, &cancel).unwrap());

    // Same bytes, new digest: the new key never sees the old entry.
    let stale = "00000000000000000000000000000000";
    assert!(fetch_iso(request(&url, stale), &cache, &MemoryUi::default(), &cancel).is_err());

    mock.assert();
    assert!(old.is_file());
    assert!(cache.get(&request(&url, stale).cache_key()).unwrap().is_none());
}

#[test]
fn http_errors_are_reported() {
    let tmp = TempDir::new().unwrap();
    let cache = FileCache::open(tmp.path()).unwrap();

    let mut server = mockito::Server::new();
    let _mock = server.mock("GET", "/missing.iso").with_status(404).create();
    let url = format!("{}/missing.iso", server.url());

    let err = fetch_iso(
        request(&url, HELLO_MD5),
        &cache,
        &MemoryUi::default(),
        &CancelToken::new(),
    )
    .unwrap_err();

    assert!(format!("{err:#}").contains("404"), "{err:#}");
    assert_eq!(partial_files(tmp.path()), 0);
}

#[test]
fn cancel_before_first_byte_discards_partial_data() {
    let tmp = TempDir::new().unwrap();
    let cache = FileCache::open(tmp.path()).unwrap();

    let mut server = mockito::Server::new();
    let _mock = server
        .mock("GET", "/os.iso")
        .with_status(200)
        .with_body(vec![1u8; 256 * 1024])
        .create();
    let url = format!("{}/os.iso", server.url());

    let cancel = CancelToken::new();
    let ui = MemoryUi::cancelling_on("Downloading", cancel.clone());
    let fetched = fetch_iso(request(&url, HELLO_MD5), &cache, &ui, &cancel).unwrap();

    assert_eq!(fetched, Fetched::Cancelled);
    assert_eq!(partial_files(tmp.path()), 0);
    assert!(cache
        .get(&request(&url, HELLO_MD5).cache_key())
        .unwrap()
        .is_none());
}

/// A server that answers with `head` (if any), then holds the connection
/// open until the returned sender fires or is dropped.
fn stalling_server(head: Option<Vec<u8>>) -> (String, mpsc::Sender<()>, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/os.iso", listener.local_addr().unwrap());
    let (release, held) = mpsc::channel::<()>();
    let handle = thread::spawn(move || {
        let (mut socket, _) = listener.accept().unwrap();
        let mut request = Vec::new();
        let mut byte = [0u8; 1];
        while !request.ends_with(b"\r\n\r\n") {
            if socket.read(&mut byte).unwrap() == 0 {
                return;
            }
            request.push(byte[0]);
        }
        if let Some(head) = head {
            socket.write_all(&head).unwrap();
            socket.flush().unwrap();
        }
        let _ = held.recv();
    });
    (url, release, handle)
}

fn cancel_after(cancel: &CancelToken, delay: Duration) {
    let cancel = cancel.clone();
    thread::spawn(move || {
        thread::sleep(delay);
        cancel.cancel();
    });
}

fn assert_stalled_fetch_cancels(head: Option<Vec<u8>>) {
    let tmp = TempDir::new().unwrap();
    let cache = FileCache::open(tmp.path()).unwrap();
    let (url, release, server) = stalling_server(head);

    let cancel = CancelToken::new();
    cancel_after(&cancel, Duration::from_millis(300));
    let started = Instant::now();
    let fetched = fetch_iso(request(&url, HELLO_MD5), &cache, &MemoryUi::default(), &cancel);
    let elapsed = started.elapsed();

    drop(release);
    server.join().unwrap();

    assert_eq!(fetched.unwrap(), Fetched::Cancelled);
    assert!(elapsed < Duration::from_secs(3), "cancel took {elapsed:?}");
    assert_eq!(partial_files(tmp.path()), 0);
    assert!(cache
        .get(&request(&url, HELLO_MD5).cache_key())
        .unwrap()
        .is_none());
}

#[test]
fn cancel_interrupts_a_stalled_body() {
    let mut head = b"HTTP/1.1 200 OK\r\nContent-Length: 1000000\r\n\r\n".to_vec();
    head.extend_from_slice(&[0u8; 1000]);
    assert_stalled_fetch_cancels(Some(head));
}

#[test]
fn cancel_interrupts_a_server_that_never_answers() {
    assert_stalled_fetch_cancels(None);
}
