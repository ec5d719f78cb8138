use std::path::Path;
use syrupnet::device::FailureReason;
use syrupnet::fleet::Fleet;
use syrupnet::storage::backup::{BackupManager, BackupReason};
use syrupnet::storage::{
    AutoDispenseSettings, ItemStatus, Storage, TransmissionStatus, CONNECTIONS_FILE,
    ITEM_STATUS_FILE,
};

#[test]
fn fleet_state_survives_restart() {
    let tmpdir = tempfile::tempdir().expect("tempdir");
    let storage = Storage::open(tmpdir.path()).expect("storage open");

    {
        let fleet = Fleet::load(&storage, 3).unwrap();
        fleet
            .register("aa-bb-cc-dd-ee-ff", "Front", "SYR1", Some("192.168.1.5"))
            .unwrap();
        fleet.register("112233445566", "Back", "SYR2", None).unwrap();
        fleet.disconnect("11:22:33:44:55:66");

        let mut state = fleet.lock();
        state
            .statuses
            .set_item_result("20240105_0001", "SYR1", ItemStatus::Success, None, false);
        state.statuses.set_item_result(
            "20240105_0001",
            "SYR2",
            ItemStatus::Failed,
            Some(FailureReason::Timeout),
            false,
        );
        state
            .statuses
            .set_record_status("20240105_0001", TransmissionStatus::Failed);
    }

    let fleet = Fleet::load(&storage, 3).unwrap();
    let state = fleet.lock();
    let front = state.registry.get("AABBCCDDEEFF").unwrap();
    assert_eq!(front.nickname, "Front");
    assert_eq!(front.last_known_network_address.as_deref(), Some("192.168.1.5"));
    assert!(state.registry.is_manually_disconnected("112233445566"));
    assert!(!state.registry.is_manually_disconnected("AABBCCDDEEFF"));
    assert_eq!(
        state.statuses.record_status("20240105_0001"),
        TransmissionStatus::Failed
    );
    let syr2 = state.statuses.item_state("20240105_0001", "SYR2").unwrap();
    assert_eq!(syr2.status, ItemStatus::Failed);
    assert_eq!(syr2.reason, Some(FailureReason::Timeout));
    assert_eq!(
        state.statuses.item_state("20240105_0001", "SYR1").unwrap().sends,
        1
    );
    // Connections are live state only.
    assert!(state.table.is_empty());
}

#[test]
fn missing_and_corrupt_files_load_empty() {
    let tmpdir = tempfile::tempdir().expect("tempdir");
    let storage = Storage::open(tmpdir.path()).unwrap();
    std::fs::write(tmpdir.path().join(CONNECTIONS_FILE), "{ not json").unwrap();
    std::fs::write(tmpdir.path().join(ITEM_STATUS_FILE), "").unwrap();

    let fleet = Fleet::load(&storage, 3).unwrap();
    let state = fleet.lock();
    assert!(state.registry.is_empty());
    assert_eq!(state.statuses.records().count(), 0);
    assert_eq!(storage.load_ingest_path().unwrap(), None);
    assert_eq!(
        storage.load_auto_dispense(80).unwrap(),
        AutoDispenseSettings {
            enabled: false,
            max_volume: 80
        }
    );
}

#[test]
fn settings_files_round_trip() {
    let tmpdir = tempfile::tempdir().expect("tempdir");
    let storage = Storage::open(tmpdir.path()).unwrap();
    let inbox = tmpdir.path().join("inbox");
    std::fs::create_dir(&inbox).unwrap();

    storage.save_ingest_path(&inbox).unwrap();
    assert_eq!(storage.load_ingest_path().unwrap().as_deref(), Some(inbox.as_path()));

    let settings = AutoDispenseSettings {
        enabled: true,
        max_volume: 150,
    };
    storage.save_auto_dispense(&settings).unwrap();
    assert_eq!(storage.load_auto_dispense(100).unwrap(), settings);
}

#[test]
fn backup_then_reset_then_restore() {
    let tmpdir = tempfile::tempdir().expect("tempdir");
    let data = tmpdir.path().join("data");
    let storage = Storage::open(&data).unwrap();
    Fleet::load(&storage, 3)
        .unwrap()
        .register("AABBCCDDEEFF", "Front", "SYR1", None)
        .unwrap();
    storage
        .save_auto_dispense(&AutoDispenseSettings {
            enabled: true,
            max_volume: 60,
        })
        .unwrap();

    let mut manager = BackupManager::new(data.clone(), tmpdir.path().join("backups"), 5).unwrap();
    let backup = manager
        .create_backup(Some("before reset".into()), BackupReason::PreReset)
        .unwrap();
    assert_eq!(backup.files.len(), 2);
    assert!(manager.verify_backup(&backup.id).unwrap());

    let removed = storage.reset_state().unwrap();
    assert_eq!(removed.len(), 2);
    assert!(Fleet::load(&storage, 3).unwrap().lock().registry.is_empty());

    manager.restore_backup(&backup.id, &data).unwrap();
    assert!(Path::new(&data.join(CONNECTIONS_FILE)).exists());
    let fleet = Fleet::load(&storage, 3).unwrap();
    assert!(fleet.lock().registry.contains("AABBCCDDEEFF"));
    assert_eq!(storage.load_auto_dispense(100).unwrap().max_volume, 60);
}
