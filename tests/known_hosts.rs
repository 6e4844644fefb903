//! Host keys of terminated nodes are purged with the real `ssh-keygen`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use fleet_runner::{CloudApi, EventLog, KnownHosts, NodeDescriptor, Result, Terminator};

const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAINN3IGAZ5VcqEk+kr+nr0f/PWAUBEKIoPH0LdfTROVld";

#[derive(Default)]
struct RecordingCloud {
    terminated: Mutex<Vec<String>>,
}

#[async_trait]
impl CloudApi for RecordingCloud {
    async fn launch(&self, _: usize, _: &Value, _: &str) -> Result<Vec<NodeDescriptor>> {
        Ok(Vec::new())
    }

    async fn terminate(&self, ids: &[String]) -> Result<()> {
        self.terminated.lock().unwrap().extend_from_slice(ids);
        Ok(())
    }
}

fn descriptor(id: &str, host: &str, port: u16) -> NodeDescriptor {
    serde_json::from_value(json!({
        "instanceId": id, "state": "started",
        "ssh": {"host": host, "port": port, "user": "fleet"}
    }))
    .unwrap()
}

fn have_ssh_keygen() -> bool {
    match std::process::Command::new("ssh-keygen").arg("-?").output() {
        Ok(_) => true,
        Err(e) => e.kind() != std::io::ErrorKind::NotFound,
    }
}

#[tokio::test]
async fn terminated_nodes_leave_known_hosts() {
    if !have_ssh_keygen() {
        eprintln!("ssh-keygen not installed; skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("known_hosts");
    std::fs::write(
        &file,
        format!(
            "[a.example]:20022 {key}\nb.example {key}\n[c.example]:20022 {key}\n",
            key = KEY
        ),
    )
    .unwrap();

    let cloud = Arc::new(RecordingCloud::default());
    let terminator = Terminator::new(cloud.clone(), EventLog::in_memory(), None)
        .with_known_hosts(KnownHosts::at(&file));
    let released = vec![
        descriptor("a", "a.example", 20022),
        descriptor("b", "b.example", 22),
    ];
    assert!(terminator.terminate(&released, "terminateFinal").await);

    assert_eq!(*cloud.terminated.lock().unwrap(), vec!["a", "b"]);
    let remaining = std::fs::read_to_string(&file).unwrap();
    assert!(!remaining.contains("a.example"), "{}", remaining);
    assert!(!remaining.contains("b.example"), "{}", remaining);
    assert!(remaining.contains("[c.example]:20022"), "{}", remaining);
}

#[tokio::test]
async fn nodes_without_endpoints_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let bare: NodeDescriptor =
        serde_json::from_value(json!({"instanceId": "x", "state": "exhausted"})).unwrap();
    let forgotten = KnownHosts::at(&dir.path().join("known_hosts"))
        .forget(&[bare])
        .await;
    assert_eq!(forgotten, 0);
}
