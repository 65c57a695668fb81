use std::fs;
use std::io::Read;
use std::path::Path;

use sdcam::transport::{BusPins, SerialPins};
use sdcam::{
    DirCard, ErrorKind, FileError, FileManager, MemCard, MemMedium, StorageTransport,
    TransportMode, TransportPolicy, UploadState,
};

fn dir_transport(root: &Path) -> StorageTransport {
    StorageTransport::new(
        Box::new(DirCard::bus(root, BusPins::default())),
        Box::new(DirCard::serial(root, SerialPins::default())),
        TransportPolicy::default().without_delays(),
    )
}

fn upload(
    files: &mut FileManager,
    transport: &mut StorageTransport,
    dir: &str,
    name: &str,
    data: &[u8],
) -> Result<sdcam::UploadReport, FileError> {
    files.upload_start(transport, dir, name)?;
    for chunk in data.chunks(1000) {
        files.upload_chunk(chunk);
    }
    files.upload_end(transport, data.len() as u64)
}

#[test]
fn listing_hides_dot_files_and_counts_returned_entries() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.jpg"), b"12345").unwrap();
    fs::write(dir.path().join(".DS_Store"), b"x").unwrap();
    fs::create_dir(dir.path().join("sub")).unwrap();
    let mut transport = dir_transport(dir.path());

    let listing = FileManager::new().list(&mut transport, "").unwrap();
    assert_eq!(listing.path, "/");
    let names: Vec<&str> = listing.files.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["a.jpg", "sub"]);
    assert_eq!(listing.count, listing.files.len());
    assert!(listing.files[1].is_dir);
    assert_eq!(listing.files[0].size, 5);
    assert!(names.iter().all(|name| !name.starts_with('.')));
}

#[test]
fn delete_missing_file_reports_flat_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut transport = dir_transport(dir.path());
    let err = FileManager::new()
        .delete(&mut transport, "/missing.jpg")
        .unwrap_err();
    assert_eq!(err.to_string(), "Failed to delete file");
    assert_eq!(err.kind(), ErrorKind::HardwareUnavailable);
}

#[test]
fn delete_refuses_non_empty_directory() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("photos")).unwrap();
    fs::write(dir.path().join("photos/a.jpg"), b"1").unwrap();
    let mut transport = dir_transport(dir.path());
    let files = FileManager::new();
    assert!(files.delete(&mut transport, "photos").is_err());
    assert!(files.delete(&mut transport, "photos/a.jpg").is_ok());
    assert!(files.delete(&mut transport, "photos").is_ok());
    assert!(!dir.path().join("photos").exists());
}

#[test]
fn upload_then_download_round_trips_bytes() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("photos")).unwrap();
    let mut transport = dir_transport(dir.path());
    let mut files = FileManager::new();
    let data: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 256) as u8).collect();

    let report = upload(&mut files, &mut transport, "/photos", "blob.bin", &data).unwrap();
    assert_eq!(report.path, "/photos/blob.bin");
    assert_eq!(report.bytes, 10_000);
    assert_eq!(report.sha256.len(), 64);
    assert_eq!(files.upload_state(), UploadState::Closed);

    let mut download = files.download(&mut transport, "photos/blob.bin").ok().unwrap();
    assert_eq!(download.filename, "blob.bin");
    assert_eq!(download.content_type, "application/octet-stream");
    assert_eq!(download.size, 10_000);
    let mut fetched = Vec::new();
    download.reader.read_to_end(&mut fetched).unwrap();
    assert_eq!(fetched, data);
}

#[test]
fn upload_filename_is_stripped_of_directories() {
    let dir = tempfile::tempdir().unwrap();
    let card = dir.path().join("card");
    fs::create_dir_all(card.join("photos")).unwrap();
    let mut transport = dir_transport(&card);
    let mut files = FileManager::new();

    let report = upload(&mut files, &mut transport, "photos", "../../x.txt", b"abc").unwrap();
    assert_eq!(report.path, "/photos/x.txt");
    assert_eq!(fs::read(card.join("photos/x.txt")).unwrap(), b"abc");
    assert!(!dir.path().join("x.txt").exists());
}

#[test]
fn upload_into_missing_directory_fails_at_end() {
    let dir = tempfile::tempdir().unwrap();
    let mut transport = dir_transport(dir.path());
    let mut files = FileManager::new();
    assert_eq!(
        files
            .upload_start(&mut transport, "/nope", "a.txt")
            .unwrap(),
        UploadState::Errored
    );
    files.upload_chunk(b"abc");
    let err = files.upload_end(&mut transport, 3).unwrap_err();
    assert!(matches!(err, FileError::UploadFailed { .. }));
}

#[test]
fn create_folder_rejects_separator_without_creating_anything() {
    let dir = tempfile::tempdir().unwrap();
    let mut transport = dir_transport(dir.path());
    let files = FileManager::new();
    let err = files
        .create_folder(&mut transport, "/", "a/b")
        .unwrap_err();
    assert_eq!(err.to_string(), "Invalid folder name");
    assert_eq!(err.http_status(), 400);
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);

    assert_eq!(
        files.create_folder(&mut transport, "", "photos").unwrap(),
        "/photos"
    );
    assert!(dir.path().join("photos").is_dir());
}

#[test]
fn missing_directory_retries_with_reinitialization() {
    let medium = MemMedium::new();
    let bus = MemCard::new(TransportMode::Bus, medium.clone());
    let bus_faults = bus.faults();
    let serial = MemCard::new(TransportMode::Serial, medium.clone());
    let mut transport = StorageTransport::new(
        Box::new(bus),
        Box::new(serial),
        TransportPolicy::default().without_delays(),
    );

    let err = FileManager::new()
        .list(&mut transport, "/nowhere")
        .unwrap_err();
    assert_eq!(err.to_string(), "Directory not found or SD card error");
    assert_eq!(err.http_status(), 404);
    // Initial mount plus one remount before each of the two retries.
    assert_eq!(bus_faults.mount_attempts(), 3);
    assert_eq!(transport.stats().reinitializations, 2);
}

#[test]
fn absent_card_fails_listing() {
    let medium = MemMedium::new();
    medium.set_present(false);
    let mut transport = StorageTransport::new(
        Box::new(MemCard::new(TransportMode::Bus, medium.clone())),
        Box::new(MemCard::new(TransportMode::Serial, medium)),
        TransportPolicy::default().without_delays(),
    );
    let err = FileManager::new().list(&mut transport, "/").unwrap_err();
    assert_eq!(err, FileError::StorageUnavailable);
    assert_eq!(err.http_status(), 500);
}
