use std::sync::Arc;

use bucketfs::cadapter::client::ObjectClient;
use bucketfs::cadapter::localfs::LocalFsBackend;
use bucketfs::{Config, Vfs, VfsError};
use tokio_util::sync::CancellationToken;

async fn local_vfs(block: u64, chunk: u64) -> (Vfs, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let config = Config::default()
        .block_size(block)
        .max_blocks(2)
        .chunk_size(chunk)
        .cache_capacity(1 << 20)
        .max_concurrent_transfers(3)
        .cache_dir(tmp.path().join("cache"));
    let client = ObjectClient::new(LocalFsBackend::new(tmp.path().join("store")));
    let vfs = Vfs::new(config, client).await.unwrap();
    (vfs, tmp)
}

#[tokio::test]
async fn streamed_writes_publish_one_object() {
    let (vfs, tmp) = local_vfs(1000, 512).await;
    let never = CancellationToken::new();
    let data: Vec<u8> = (0..4321u32).map(|i| (i % 251) as u8).collect();

    let fh = vfs.create("dir-less-name").await.unwrap();
    let mut offset = 0;
    for piece in data.chunks(333) {
        vfs.write(fh, piece, offset, &never).await.unwrap();
        offset += piece.len() as u64;
    }
    assert_eq!(vfs.write_file_info(fh).unwrap().total_size, data.len() as u64);
    assert!(matches!(vfs.stat("dir-less-name").await, Err(VfsError::NotFound(_))));

    let generation = vfs.flush(fh).await.unwrap();
    vfs.release(fh).await.unwrap();

    let attr = vfs.stat("dir-less-name").await.unwrap();
    assert_eq!(attr.size, data.len() as u64);
    assert_eq!(attr.generation, generation);
    let on_disk = std::fs::read(tmp.path().join("store/objects/dir-less-name")).unwrap();
    assert_eq!(on_disk, data);

    let rh = vfs.open_read("dir-less-name").await.unwrap();
    let out = vfs.read(rh, 700, 2500, &never).await.unwrap();
    assert_eq!(&out[..], &data[700..3200]);
}

#[tokio::test]
async fn append_extends_existing_object() {
    let (vfs, _tmp) = local_vfs(64, 32).await;
    let never = CancellationToken::new();

    let fh = vfs.create("log").await.unwrap();
    vfs.write(fh, b"hello ", 0, &never).await.unwrap();
    let first = vfs.flush(fh).await.unwrap();
    vfs.release(fh).await.unwrap();

    let fh = vfs.open_append("log").await.unwrap();
    vfs.write(fh, b"world", 6, &never).await.unwrap();
    let second = vfs.flush(fh).await.unwrap();
    vfs.release(fh).await.unwrap();
    assert_ne!(first, second);

    let rh = vfs.open_read("log").await.unwrap();
    assert_eq!(&vfs.read(rh, 0, 100, &never).await.unwrap()[..], b"hello world");
}

#[tokio::test]
async fn out_of_order_write_is_rejected() {
    let (vfs, _tmp) = local_vfs(64, 32).await;
    let never = CancellationToken::new();
    let fh = vfs.create("seq").await.unwrap();
    vfs.write(fh, &[7u8; 200], 0, &never).await.unwrap();
    let err = vfs.write(fh, b"late", 10, &never).await.unwrap_err();
    assert!(matches!(err, VfsError::OutOfOrderWrite { .. }));
    vfs.write(fh, b"tail", 200, &never).await.unwrap();
    vfs.flush(fh).await.unwrap();
    assert_eq!(vfs.stat("seq").await.unwrap().size, 204);
}

#[tokio::test]
async fn unflushed_release_leaves_nothing_behind() {
    let (vfs, _tmp) = local_vfs(64, 32).await;
    let never = CancellationToken::new();
    let fh = vfs.create("draft").await.unwrap();
    vfs.write(fh, &[1u8; 300], 0, &never).await.unwrap();
    vfs.release(fh).await.unwrap();
    assert!(matches!(vfs.stat("draft").await, Err(VfsError::NotFound(_))));
}

#[tokio::test]
async fn concurrent_writers_share_the_transfer_budget() {
    let (vfs, _tmp) = local_vfs(128, 64).await;
    let vfs = Arc::new(vfs);
    let mut tasks = Vec::new();
    for n in 0..4u8 {
        let vfs = vfs.clone();
        tasks.push(tokio::spawn(async move {
            let never = CancellationToken::new();
            let name = format!("w{n}");
            let body = vec![n; 1000];
            let fh = vfs.create(&name).await.unwrap();
            vfs.write(fh, &body, 0, &never).await.unwrap();
            vfs.flush(fh).await.unwrap();
            vfs.release(fh).await.unwrap();
            (name, body)
        }));
    }
    let never = CancellationToken::new();
    for t in tasks {
        let (name, body) = t.await.unwrap();
        let rh = vfs.open_read(&name).await.unwrap();
        assert_eq!(&vfs.read(rh, 0, 1000, &never).await.unwrap()[..], &body[..]);
    }
}
