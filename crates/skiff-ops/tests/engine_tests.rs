//! End-to-end tests for the operation runners.

use std::fs;
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tempfile::tempdir;

use skiff_ops::{
    ConflictChoice, JobEvent, JobRegistry, JobState, OperationComplete, PackOptions,
    TransferOptions,
};

/// Drain a runner's events, answering conflict prompts from `answers` in
/// order. Returns the terminal report and the number of prompts seen.
async fn run_to_completion(
    mut handle: skiff_ops::JobHandle,
    mut answers: Vec<ConflictChoice>,
) -> (OperationComplete, usize) {
    let mut prompts = 0usize;
    while let Some(event) = handle.next_event().await {
        match event {
            JobEvent::Conflict(request) => {
                prompts += 1;
                let choice = if answers.is_empty() {
                    ConflictChoice::Cancel
                } else {
                    answers.remove(0)
                };
                request.answer(choice);
            }
            JobEvent::Complete(complete) => return (complete, prompts),
            JobEvent::Progress(_) => {}
        }
    }
    panic!("runner ended without a completion event");
}

fn write_file(path: &Path, contents: &str, mode: u32) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("parent dir should be creatable");
    }
    fs::write(path, contents).expect("file should be writable");
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .expect("mode should be settable");
}

fn mode_bits(path: &Path) -> u32 {
    fs::metadata(path)
        .expect("metadata should be readable")
        .permissions()
        .mode()
        & 0o777
}

fn mtime_seconds(path: &Path) -> i64 {
    let metadata = fs::metadata(path).expect("metadata should be readable");
    FileTime::from_last_modification_time(&metadata).unix_seconds()
}

#[tokio::test]
async fn copy_reproduces_tree_without_conflicts() {
    let temp = tempdir().expect("tempdir");
    let tree = temp.path().join("a");
    write_file(&tree.join("x.txt"), "hi", 0o644);
    write_file(&tree.join("sub/y.txt"), "yo", 0o755);
    let out = temp.path().join("out");
    fs::create_dir_all(&out).expect("mkdir out");

    let handle = skiff_ops::start_copy(
        vec![tree.clone()],
        out.clone(),
        TransferOptions::default(),
    );
    let (complete, prompts) = run_to_completion(handle, vec![]).await;

    assert_eq!(complete.state, JobState::Completed);
    assert!(complete.errors.is_empty(), "errors: {:?}", complete.errors);
    assert_eq!(prompts, 0);
    assert_eq!(
        fs::read_to_string(out.join("a/x.txt")).expect("copied file"),
        "hi"
    );
    assert_eq!(
        fs::read_to_string(out.join("a/sub/y.txt")).expect("copied nested file"),
        "yo"
    );
    assert_eq!(mode_bits(&out.join("a/x.txt")), 0o644);
    assert_eq!(mode_bits(&out.join("a/sub/y.txt")), 0o755);
    assert!(tree.join("x.txt").exists(), "copy must not remove sources");
}

#[tokio::test]
async fn copy_skip_all_answers_every_later_conflict() {
    let temp = tempdir().expect("tempdir");
    let src = temp.path().join("src");
    let out = temp.path().join("out");
    write_file(&src.join("one.txt"), "new-one", 0o644);
    write_file(&src.join("two.txt"), "new-two", 0o644);
    write_file(&out.join("one.txt"), "old-one", 0o644);
    write_file(&out.join("two.txt"), "old-two", 0o644);

    let handle = skiff_ops::start_copy(
        vec![src.join("one.txt"), src.join("two.txt")],
        out.clone(),
        TransferOptions::default(),
    );
    let (complete, prompts) =
        run_to_completion(handle, vec![ConflictChoice::NoAll]).await;

    assert_eq!(complete.state, JobState::Completed, "skip is not a failure");
    assert_eq!(prompts, 1, "the sticky answer must silence later conflicts");
    assert_eq!(
        fs::read_to_string(out.join("one.txt")).expect("kept file"),
        "old-one"
    );
    assert_eq!(
        fs::read_to_string(out.join("two.txt")).expect("kept file"),
        "old-two"
    );
}

#[tokio::test]
async fn copy_cancel_at_prompt_keeps_prior_work() {
    let temp = tempdir().expect("tempdir");
    let src = temp.path().join("src");
    let out = temp.path().join("out");
    write_file(&src.join("a.txt"), "new-a", 0o644);
    write_file(&src.join("b.txt"), "new-b", 0o644);
    write_file(&src.join("c.txt"), "new-c", 0o644);
    write_file(&out.join("b.txt"), "old-b", 0o644);

    let handle = skiff_ops::start_copy(
        vec![src.join("a.txt"), src.join("b.txt"), src.join("c.txt")],
        out.clone(),
        TransferOptions::default(),
    );
    let (complete, prompts) =
        run_to_completion(handle, vec![ConflictChoice::Cancel]).await;

    assert_eq!(complete.state, JobState::Cancelled);
    assert_eq!(prompts, 1);
    assert_eq!(
        fs::read_to_string(out.join("a.txt")).expect("already-copied file stays"),
        "new-a"
    );
    assert_eq!(
        fs::read_to_string(out.join("b.txt")).expect("conflicting file kept"),
        "old-b"
    );
    assert!(
        !out.join("c.txt").exists(),
        "no job generated after the abort may execute"
    );
}

#[tokio::test]
async fn copy_newer_answer_compares_mtimes() {
    let temp = tempdir().expect("tempdir");
    let src = temp.path().join("src");
    let out = temp.path().join("out");
    write_file(&src.join("stale.txt"), "stale", 0o644);
    write_file(&out.join("stale.txt"), "fresh", 0o644);

    // Make the source strictly older than the destination.
    let old = FileTime::from_unix_time(1_000_000, 0);
    filetime::set_file_times(src.join("stale.txt"), old, old).expect("set src mtime");

    let handle = skiff_ops::start_copy(
        vec![src.join("stale.txt")],
        out.clone(),
        TransferOptions::default(),
    );
    let (complete, prompts) =
        run_to_completion(handle, vec![ConflictChoice::Newer]).await;

    assert_eq!(complete.state, JobState::Completed);
    assert_eq!(prompts, 1);
    assert_eq!(
        fs::read_to_string(out.join("stale.txt")).expect("newer destination kept"),
        "fresh"
    );
}

#[tokio::test]
async fn cancellation_is_observed_before_the_next_job() {
    let temp = tempdir().expect("tempdir");
    let src = temp.path().join("src");
    let out = temp.path().join("out");
    write_file(&src.join("a.txt"), "new-a", 0o644);
    write_file(&src.join("b.txt"), "new-b", 0o644);
    write_file(&out.join("a.txt"), "old-a", 0o644);

    let mut handle = skiff_ops::start_copy(
        vec![src.join("a.txt"), src.join("b.txt")],
        out.clone(),
        TransferOptions::default(),
    );

    let complete = loop {
        match handle.next_event().await.expect("runner should report") {
            JobEvent::Conflict(request) => {
                // Cancel while the prompt is open; the answered job still
                // runs to its chunk boundary, then the flag is observed.
                handle.cancel();
                request.answer(ConflictChoice::Yes);
            }
            JobEvent::Complete(complete) => break complete,
            JobEvent::Progress(_) => {}
        }
    };

    assert_eq!(complete.state, JobState::Cancelled);
    assert_eq!(
        fs::read_to_string(out.join("a.txt")).expect("answered job completed"),
        "new-a"
    );
    assert!(
        !out.join("b.txt").exists(),
        "jobs after the cancellation point must not run"
    );
}

#[tokio::test]
async fn move_relocates_tree_and_removes_source() {
    let temp = tempdir().expect("tempdir");
    let tree = temp.path().join("tree");
    write_file(&tree.join("x.txt"), "hi", 0o644);
    write_file(&tree.join("sub/y.txt"), "yo", 0o644);
    let out = temp.path().join("out");
    fs::create_dir_all(&out).expect("mkdir out");

    let handle = skiff_ops::start_move(
        vec![tree.clone()],
        out.clone(),
        TransferOptions::default(),
    );
    let (complete, prompts) = run_to_completion(handle, vec![]).await;

    assert_eq!(complete.state, JobState::Completed);
    assert!(complete.errors.is_empty(), "errors: {:?}", complete.errors);
    assert_eq!(prompts, 0);
    assert_eq!(
        fs::read_to_string(out.join("tree/x.txt")).expect("moved file"),
        "hi"
    );
    assert_eq!(
        fs::read_to_string(out.join("tree/sub/y.txt")).expect("moved nested file"),
        "yo"
    );
    assert!(!tree.exists(), "source tree must be removed after the move");
}

#[tokio::test]
async fn move_into_itself_is_rejected_before_any_job() {
    let temp = tempdir().expect("tempdir");
    let tree = temp.path().join("tree");
    write_file(&tree.join("x.txt"), "hi", 0o644);
    let inner = tree.join("inner");
    fs::create_dir_all(&inner).expect("mkdir inner");

    let handle =
        skiff_ops::start_move(vec![tree.clone()], inner, TransferOptions::default());
    let (complete, _) = run_to_completion(handle, vec![]).await;

    assert_eq!(complete.state, JobState::Failed);
    assert!(!complete.errors.is_empty());
    assert_eq!(
        fs::read_to_string(tree.join("x.txt")).expect("source untouched"),
        "hi"
    );
}

#[tokio::test]
async fn delete_removes_every_descendant() {
    let temp = tempdir().expect("tempdir");
    let tree = temp.path().join("doomed");
    write_file(&tree.join("x.txt"), "x", 0o644);
    write_file(&tree.join("deep/nested/y.txt"), "y", 0o644);
    let loose = temp.path().join("loose.txt");
    write_file(&loose, "z", 0o644);

    let handle = skiff_ops::start_delete(vec![tree.clone(), loose.clone()]);
    let (complete, _) = run_to_completion(handle, vec![]).await;

    assert_eq!(complete.state, JobState::Completed);
    assert!(complete.errors.is_empty(), "errors: {:?}", complete.errors);
    assert!(!tree.exists());
    assert!(!loose.exists());
}

#[tokio::test]
async fn tar_roundtrip_preserves_paths_contents_and_modes() {
    let temp = tempdir().expect("tempdir");
    let tree = temp.path().join("project");
    write_file(&tree.join("readme.txt"), "docs", 0o644);
    write_file(&tree.join("bin/run.sh"), "#!/bin/sh\n", 0o755);

    // Pin a directory mtime to verify the deferred deepest-first fixup.
    let old = FileTime::from_unix_time(1_500_000_000, 0);
    filetime::set_file_times(tree.join("bin"), old, old).expect("set dir mtime");

    let archive = temp.path().join("project.tar");
    let handle = skiff_ops::start_pack(
        skiff_ops::ArchiveFormat::Tar,
        vec![tree.clone()],
        archive.clone(),
        PackOptions::default(),
    );
    let (complete, _) = run_to_completion(handle, vec![]).await;
    assert_eq!(complete.state, JobState::Completed);
    assert!(complete.errors.is_empty(), "errors: {:?}", complete.errors);

    let out = temp.path().join("restored");
    fs::create_dir_all(&out).expect("mkdir restored");
    let handle = skiff_ops::start_untar(vec![archive], out.clone());
    let (complete, _) = run_to_completion(handle, vec![]).await;
    assert_eq!(complete.state, JobState::Completed);
    assert!(complete.errors.is_empty(), "errors: {:?}", complete.errors);

    assert_eq!(
        fs::read_to_string(out.join("project/readme.txt")).expect("extracted file"),
        "docs"
    );
    assert_eq!(
        fs::read_to_string(out.join("project/bin/run.sh")).expect("extracted script"),
        "#!/bin/sh\n"
    );
    assert_eq!(mode_bits(&out.join("project/bin/run.sh")), 0o755);
    assert_eq!(
        mtime_seconds(&out.join("project/bin")),
        1_500_000_000,
        "directory mtime must survive the fixup pass"
    );
}

#[tokio::test]
async fn tar_gz_roundtrip_preserves_contents() {
    let temp = tempdir().expect("tempdir");
    let tree = temp.path().join("data");
    write_file(&tree.join("blob.bin"), "0123456789", 0o644);

    let archive = temp.path().join("data.tar.gz");
    let handle = skiff_ops::start_pack(
        skiff_ops::ArchiveFormat::TarGz,
        vec![tree],
        archive.clone(),
        PackOptions::default(),
    );
    let (complete, _) = run_to_completion(handle, vec![]).await;
    assert_eq!(complete.state, JobState::Completed);

    let out = temp.path().join("restored");
    fs::create_dir_all(&out).expect("mkdir restored");
    let handle = skiff_ops::start_untar(vec![archive], out.clone());
    let (complete, _) = run_to_completion(handle, vec![]).await;
    assert_eq!(complete.state, JobState::Completed);
    assert_eq!(
        fs::read_to_string(out.join("data/blob.bin")).expect("extracted file"),
        "0123456789"
    );
}

#[tokio::test]
async fn zip_roundtrip_preserves_contents_and_modes() {
    let temp = tempdir().expect("tempdir");
    let tree = temp.path().join("site");
    write_file(&tree.join("index.html"), "<html/>", 0o644);
    write_file(&tree.join("cgi/hook.sh"), "#!/bin/sh\n", 0o755);

    let archive = temp.path().join("site.zip");
    let handle = skiff_ops::start_pack(
        skiff_ops::ArchiveFormat::Zip,
        vec![tree],
        archive.clone(),
        PackOptions {
            wrap: Some("backup".to_string()),
            ..Default::default()
        },
    );
    let (complete, _) = run_to_completion(handle, vec![]).await;
    assert_eq!(complete.state, JobState::Completed);
    assert!(complete.errors.is_empty(), "errors: {:?}", complete.errors);

    let out = temp.path().join("restored");
    fs::create_dir_all(&out).expect("mkdir restored");
    let handle = skiff_ops::start_unzip(vec![archive], out.clone());
    let (complete, _) = run_to_completion(handle, vec![]).await;
    assert_eq!(complete.state, JobState::Completed);

    assert_eq!(
        fs::read_to_string(out.join("backup/site/index.html")).expect("wrapped entry"),
        "<html/>"
    );
    assert_eq!(mode_bits(&out.join("backup/site/cgi/hook.sh")), 0o755);
}

#[tokio::test]
async fn pack_create_mode_fails_on_existing_destination() {
    let temp = tempdir().expect("tempdir");
    let src = temp.path().join("a.txt");
    write_file(&src, "a", 0o644);
    let archive = temp.path().join("out.tar");
    fs::write(&archive, "already here").expect("pre-create archive");

    let handle = skiff_ops::start_pack(
        skiff_ops::ArchiveFormat::Tar,
        vec![src],
        archive.clone(),
        PackOptions::default(),
    );
    let (complete, _) = run_to_completion(handle, vec![]).await;

    assert_eq!(complete.state, JobState::Failed);
    assert_eq!(
        fs::read_to_string(&archive).expect("existing archive untouched"),
        "already here"
    );
}

#[tokio::test]
async fn tar_add_mode_appends_to_existing_archive() {
    let temp = tempdir().expect("tempdir");
    let first = temp.path().join("first.txt");
    let second = temp.path().join("second.txt");
    write_file(&first, "one", 0o644);
    write_file(&second, "two", 0o644);
    let archive = temp.path().join("out.tar");

    let handle = skiff_ops::start_pack(
        skiff_ops::ArchiveFormat::Tar,
        vec![first],
        archive.clone(),
        PackOptions::default(),
    );
    let (complete, _) = run_to_completion(handle, vec![]).await;
    assert_eq!(complete.state, JobState::Completed);

    let handle = skiff_ops::start_pack(
        skiff_ops::ArchiveFormat::Tar,
        vec![second],
        archive.clone(),
        PackOptions {
            mode: skiff_ops::CreateMode::Add,
            ..Default::default()
        },
    );
    let (complete, _) = run_to_completion(handle, vec![]).await;
    assert_eq!(complete.state, JobState::Completed);

    let out = temp.path().join("restored");
    fs::create_dir_all(&out).expect("mkdir restored");
    let handle = skiff_ops::start_untar(vec![archive], out.clone());
    let (complete, _) = run_to_completion(handle, vec![]).await;
    assert_eq!(complete.state, JobState::Completed);
    assert_eq!(
        fs::read_to_string(out.join("first.txt")).expect("original entry"),
        "one"
    );
    assert_eq!(
        fs::read_to_string(out.join("second.txt")).expect("appended entry"),
        "two"
    );
}

#[tokio::test]
async fn compressed_tar_add_mode_is_rejected() {
    let temp = tempdir().expect("tempdir");
    let src = temp.path().join("a.txt");
    write_file(&src, "a", 0o644);
    let archive = temp.path().join("out.tar.gz");
    fs::write(&archive, "pretend archive").expect("pre-create archive");

    let handle = skiff_ops::start_pack(
        skiff_ops::ArchiveFormat::TarGz,
        vec![src],
        archive,
        PackOptions {
            mode: skiff_ops::CreateMode::Add,
            ..Default::default()
        },
    );
    let (complete, _) = run_to_completion(handle, vec![]).await;

    assert_eq!(complete.state, JobState::Failed);
    assert!(
        complete
            .errors
            .iter()
            .any(|e| e.message.contains("cannot append")),
        "errors: {:?}",
        complete.errors
    );
}

#[tokio::test]
async fn pack_single_source_copies_mtime_onto_archive() {
    let temp = tempdir().expect("tempdir");
    let tree = temp.path().join("snapshots");
    write_file(&tree.join("a.txt"), "a", 0o644);
    let old = FileTime::from_unix_time(1_400_000_000, 0);
    filetime::set_file_times(&tree, old, old).expect("set source mtime");

    let archive = temp.path().join("snapshots.tar");
    let handle = skiff_ops::start_pack(
        skiff_ops::ArchiveFormat::Tar,
        vec![tree],
        archive.clone(),
        PackOptions::default(),
    );
    let (complete, _) = run_to_completion(handle, vec![]).await;

    assert_eq!(complete.state, JobState::Completed);
    assert_eq!(mtime_seconds(&archive), 1_400_000_000);
}

#[tokio::test]
async fn unzip_refuses_escaping_member_paths() {
    let temp = tempdir().expect("tempdir");
    let archive = temp.path().join("unsafe.zip");
    let file = fs::File::create(&archive).expect("create zip file");
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    writer
        .start_file("../evil.txt", options)
        .expect("unsafe entry");
    writer.write_all(b"evil").expect("write unsafe entry");
    writer.start_file("safe.txt", options).expect("safe entry");
    writer.write_all(b"safe").expect("write safe entry");
    writer.finish().expect("finish zip");

    let out = temp.path().join("dest");
    fs::create_dir_all(&out).expect("mkdir dest");
    let handle = skiff_ops::start_unzip(vec![archive], out.clone());
    let (complete, _) = run_to_completion(handle, vec![]).await;

    assert_eq!(complete.state, JobState::Completed);
    assert!(
        complete
            .errors
            .iter()
            .any(|e| e.message.contains("unsafe")),
        "errors: {:?}",
        complete.errors
    );
    assert!(!temp.path().join("evil.txt").exists());
    assert_eq!(
        fs::read_to_string(out.join("safe.txt")).expect("safe entry extracted"),
        "safe"
    );
}

#[tokio::test]
async fn registry_kill_oldest_cancels_and_reap_collects() {
    let temp = tempdir().expect("tempdir");
    let src = temp.path().join("src");
    let out = temp.path().join("out");
    write_file(&src.join("a.txt"), "new-a", 0o644);
    write_file(&out.join("a.txt"), "old-a", 0o644);

    let mut registry = JobRegistry::new();
    let (id, mut handle) = registry.copy(
        vec![src.join("a.txt")],
        out.clone(),
        TransferOptions::default(),
    );
    assert_eq!(registry.running(), 1);
    assert!(!registry.is_idle());

    let complete = loop {
        match handle.next_event().await.expect("runner should report") {
            JobEvent::Conflict(request) => {
                assert_eq!(registry.kill_oldest(), Some(id));
                request.answer(ConflictChoice::Yes);
            }
            JobEvent::Complete(complete) => break complete,
            JobEvent::Progress(_) => {}
        }
    };

    assert_eq!(complete.state, JobState::Cancelled);
    let finished = registry.reap();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].0, id);
    assert_eq!(finished[0].1.state, JobState::Cancelled);
    assert!(registry.is_idle());
    assert_eq!(registry.kill_oldest(), None);
}

#[tokio::test]
async fn symlinks_are_recreated_not_followed() {
    let temp = tempdir().expect("tempdir");
    let tree = temp.path().join("tree");
    write_file(&tree.join("real.txt"), "real", 0o644);
    std::os::unix::fs::symlink("real.txt", tree.join("link.txt"))
        .expect("create symlink");
    let out = temp.path().join("out");
    fs::create_dir_all(&out).expect("mkdir out");

    let handle =
        skiff_ops::start_copy(vec![tree], out.clone(), TransferOptions::default());
    let (complete, prompts) = run_to_completion(handle, vec![]).await;

    assert_eq!(complete.state, JobState::Completed);
    assert_eq!(prompts, 0, "symlinks never prompt");
    let copied = out.join("tree/link.txt");
    let metadata = fs::symlink_metadata(&copied).expect("link metadata");
    assert!(metadata.file_type().is_symlink());
    assert_eq!(
        fs::read_link(&copied).expect("link target"),
        PathBuf::from("real.txt")
    );
}
