// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Full pipeline: file-backed store, stored template, device manager talking
// to an in-process TCP printer, scheduler workers and the audit sink.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use labelspool_core::config::{PrintersConfig, QueueConfig};
use labelspool_core::status::STATUS_COMMAND;
use labelspool_core::types::{
    JobId, JobRequest, JobStatus, LabelTemplate, PrintJob, Printer, PrinterId, TemplateId,
};
use labelspool_print::{
    AuditSink, DeviceManager, LabelCodec, Notifier, PrinterDevice, Scheduler, SpoolStore,
    TemplateCodec,
};

/// Accepts connections, answers status polls with `@@@@` and records the
/// rest of the bytes it receives.
async fn spawn_printer() -> (SocketAddr, Arc<Mutex<Vec<u8>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    let mut chunk = &buf[..n];
                    while chunk.starts_with(STATUS_COMMAND) {
                        if socket.write_all(b"@@@@").await.is_err() {
                            return;
                        }
                        chunk = &chunk[STATUS_COMMAND.len()..];
                    }
                    sink.lock().unwrap().extend_from_slice(chunk);
                }
            });
        }
    });
    (addr, received)
}

struct Spool {
    store: Arc<SpoolStore>,
    devices: Arc<DeviceManager>,
    scheduler: Scheduler,
    notifier_task: tokio::task::JoinHandle<()>,
}

/// Open (or reopen) the spool database under `dir` with fresh services.
async fn spool(dir: &Path, queue: QueueConfig) -> Spool {
    let store = Arc::new(SpoolStore::open(dir.join("spool.db")).expect("store"));
    let (notifier, notifier_task) = Notifier::spawn(Arc::new(AuditSink::new(store.clone())), 64);
    let printers = PrintersConfig { health_check_interval_secs: 30, connection_timeout_ms: 2_000 };
    let devices =
        Arc::new(DeviceManager::new(store.clone(), notifier.clone(), &printers).expect("devices"));
    let codec: Arc<dyn LabelCodec> = Arc::new(TemplateCodec::new(store.clone()));
    let scheduler = Scheduler::new(
        store.clone(),
        Some(devices.clone() as Arc<dyn PrinterDevice>),
        Some(codec),
        notifier,
        queue,
    );
    Spool { store, devices, scheduler, notifier_task }
}

fn shipping_template(store: &SpoolStore) -> TemplateId {
    store
        .insert_template(&LabelTemplate {
            id: TemplateId(0),
            name: "shipping".into(),
            description: "outbound parcel".into(),
            schema_json: r#"{
                "name": "shipping", "width_mm": 100, "height_mm": 50, "gap_mm": 3,
                "elements": [
                    {"type": "text", "x": 16, "y": 16, "content": "TO: {{recipient}}"},
                    {"type": "barcode", "x": 16, "y": 80, "content": "{{tracking}}",
                     "symbology": "128", "height": 80}
                ],
                "variables": {
                    "recipient": {"type": "string", "required": true},
                    "tracking": {"type": "string", "required": true}
                }
            }"#
            .into(),
            width_mm: 100.0,
            height_mm: 50.0,
            created_at: Utc::now(),
        })
        .expect("template")
}

async fn wait_for(scheduler: &Scheduler, id: JobId, status: JobStatus) -> PrintJob {
    for _ in 0..500 {
        let job = scheduler.job(id).expect("job");
        if job.status == status {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {id} never reached {status}: {:?}", scheduler.job(id));
}

#[tokio::test]
async fn submitted_job_is_printed_counted_and_audited() {
    let (addr, received) = spawn_printer().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let spool = spool(dir.path(), QueueConfig::default()).await;

    let mut printer = Printer::new("dock-2", addr.ip().to_string());
    printer.port = addr.port();
    let printer_id = spool.devices.add_printer(printer).await.expect("add printer");
    let template_id = shipping_template(&spool.store);

    spool.scheduler.start().expect("start");
    let id = spool
        .scheduler
        .enqueue(JobRequest {
            printer_id,
            template_id,
            variables: BTreeMap::from([
                ("recipient".to_string(), "Ada".to_string()),
                ("tracking".to_string(), "1Z999".to_string()),
            ]),
            priority: 5,
            copies: 2,
            submitted_by: "integration".into(),
            ..Default::default()
        })
        .await
        .expect("enqueue");

    let job = wait_for(&spool.scheduler, id, JobStatus::Completed).await;
    assert!(job.started_at.unwrap() <= job.completed_at.unwrap());
    assert_eq!(job.retry_count, 0);

    let content = job.content.expect("materialized content");
    assert!(content.contains(r#""TO: Ada""#));
    assert!(content.contains(r#""1Z999""#));
    let printed_copies = || {
        String::from_utf8_lossy(&received.lock().unwrap()).matches("PRINT 1").count()
    };
    for _ in 0..100 {
        if printed_copies() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(printed_copies(), 2);

    let printer = spool.devices.get_printer(printer_id).await.unwrap();
    assert_eq!(printer.total_prints, 2);
    assert_eq!(spool.store.get_printer(printer_id).unwrap().unwrap().total_prints, 2);
    assert_eq!(spool.store.daily_count(printer_id, Utc::now().date_naive()).unwrap(), 2);

    let stats = spool.scheduler.stats().unwrap();
    assert_eq!((stats.completed, stats.total), (1, 1));

    spool.scheduler.shutdown().await;
    spool.devices.shutdown().await;
    drop(spool.scheduler);
    drop(spool.devices);
    spool.notifier_task.await.expect("notifier drained");

    let actions: Vec<String> = spool
        .store
        .recent_audit(20)
        .unwrap()
        .into_iter()
        .filter(|e| e.entity_type == "job")
        .map(|e| e.action)
        .collect();
    assert!(actions.contains(&"job_started".to_string()));
    assert!(actions.contains(&"job_completed".to_string()));
}

#[tokio::test]
async fn unreachable_printer_exhausts_retries() {
    // Bind then drop a listener to get a port nothing answers on.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let dir = tempfile::tempdir().expect("tempdir");
    let spool = spool(dir.path(), QueueConfig { retry_delay_ms: 10, ..QueueConfig::default() }).await;

    let mut printer = Printer::new("gone", addr.ip().to_string());
    printer.port = addr.port();
    let printer_id = spool.devices.add_printer(printer).await.unwrap();

    spool.scheduler.start().unwrap();
    let id = spool
        .scheduler
        .enqueue(JobRequest {
            printer_id,
            content: Some("CLS\nPRINT 1\n".into()),
            max_retries: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();

    let job = wait_for(&spool.scheduler, id, JobStatus::Failed).await;
    assert_eq!(job.retry_count, 2);
    assert_eq!(job.error_message.as_deref(), Some(format!("printer {printer_id} is offline").as_str()));
    assert_eq!(
        spool.devices.get_printer(printer_id).await.unwrap().status,
        labelspool_core::PrinterState::Offline
    );
    assert!(matches!(
        spool.scheduler.enqueue(JobRequest { printer_id: PrinterId(404), ..Default::default() }).await,
        Err(labelspool_core::SpoolError::PrinterNotFound(_))
    ));

    spool.scheduler.shutdown().await;
    spool.devices.shutdown().await;
}

#[tokio::test]
async fn printer_pause_survives_restart() {
    let (addr, received) = spawn_printer().await;
    let dir = tempfile::tempdir().expect("tempdir");

    let first = spool(dir.path(), QueueConfig::default()).await;
    let mut printer = Printer::new("dock-4", addr.ip().to_string());
    printer.port = addr.port();
    let printer_id = first.devices.add_printer(printer).await.expect("add printer");
    first.devices.pause_printer(printer_id).await.expect("hold device");
    first.scheduler.pause_printer(printer_id).await.expect("hold dispatch");
    first.scheduler.shutdown().await;
    first.devices.shutdown().await;
    drop(first);

    let second = spool(dir.path(), QueueConfig::default()).await;
    second.scheduler.start().expect("start");
    assert!(second.scheduler.is_printer_paused(printer_id));
    let id = second
        .scheduler
        .enqueue(JobRequest {
            printer_id,
            content: Some("CLS\nPRINT 1\n".into()),
            max_retries: Some(0),
            ..Default::default()
        })
        .await
        .expect("enqueue");

    let parked = wait_for(&second.scheduler, id, JobStatus::Paused).await;
    assert_eq!(parked.retry_count, 0);
    assert!(parked.error_message.is_none());
    assert!(received.lock().unwrap().is_empty());

    second.devices.resume_printer(printer_id).await.expect("release device");
    assert_eq!(second.scheduler.resume_printer(printer_id).await.expect("release dispatch"), 1);
    wait_for(&second.scheduler, id, JobStatus::Completed).await;

    second.scheduler.shutdown().await;
    second.devices.shutdown().await;
}
