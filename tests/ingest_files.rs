use chrono::{Local, NaiveDate};
use syrupnet::config::Config;
use syrupnet::prescription::{IngestError, Ingestor, PrescriptionFormat};

fn euc_kr(text: &str) -> Vec<u8> {
    let (bytes, _, had_errors) = encoding_rs::EUC_KR.encode(text);
    assert!(!had_errors);
    bytes.into_owned()
}

#[tokio::test]
async fn legacy_korean_export_is_decoded_and_parsed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let content = "홍길동\r\n\
        SYR002\\이부프로펜 시럽\\2.5\\3\\5\\38\\20240105\\2\r\n\
        SYR001\\아목시실린 시럽\\5\\3\\7\\105\\20240105\\1\r\n\
        잘못된 줄\r\n";
    std::fs::write(dir.path().join("20240105_0012.txt"), euc_kr(content)).unwrap();

    let mut ingestor = Ingestor::from_config(&Config::default().ingest).unwrap();
    let added = ingestor.poll(dir.path()).await.unwrap();
    assert_eq!(added, vec!["20240105_0012"]);

    let record = ingestor.record("20240105_0012").unwrap();
    assert_eq!(record.patient_name, "홍길동");
    assert_eq!(record.receipt_date, NaiveDate::from_ymd_opt(2024, 1, 5));
    let codes: Vec<_> = record.items.iter().map(|i| i.code.as_str()).collect();
    assert_eq!(codes, vec!["SYR001", "SYR002"]);
    assert_eq!(record.items[0].name, "아목시실린 시럽");
    assert_eq!(record.items[0].total_quantity, 105);
    assert_eq!(record.items[1].volume_per_dose, 2.5);
}

#[tokio::test]
async fn utf8_export_is_accepted_too() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("20240106_0001.txt");
    std::fs::write(&path, "김영희\nSYR9\\해열제\\1\\1\\1\\3\\20240106\\1\n").unwrap();

    let mut ingestor = Ingestor::new(
        PrescriptionFormat::Text,
        vec!["euc-kr".into(), "utf-8".into()],
        0.1,
    );
    let record = ingestor.ingest(&path).await.unwrap().unwrap();
    assert_eq!(record.patient_name, "김영희");
    assert_eq!(record.items[0].name, "해열제");
    // Already seen: a no-op.
    assert!(ingestor.ingest(&path).await.unwrap().is_none());
}

#[tokio::test]
async fn receipt_timestamp_is_recent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("20240107_0001.txt");
    std::fs::write(&path, "Park\n").unwrap();

    let before = Local::now().naive_local() - chrono::Duration::minutes(5);
    let mut ingestor = Ingestor::from_config(&Config::default().ingest).unwrap();
    let record = ingestor.ingest(&path).await.unwrap().unwrap();
    // Either the file's creation time or the ingestion time; both are just now.
    assert!(record.receipt_timestamp >= before);
}

#[tokio::test]
async fn missing_file_is_an_io_error_and_not_marked_seen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("late.txt");
    let mut ingestor = Ingestor::from_config(&Config::default().ingest).unwrap();
    assert!(matches!(
        ingestor.ingest(&path).await,
        Err(IngestError::Io { .. })
    ));

    std::fs::write(&path, "Choi\n").unwrap();
    assert!(ingestor.ingest(&path).await.unwrap().is_some());
}
