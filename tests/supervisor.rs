//! Integration tests for Procfile manifests and process groups

#![cfg(unix)]

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use forerunner::procfile::Manifest;
use forerunner::{PortManager, PrefixedLineWriter, ProcessGroup};

fn write_procfile(contents: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("Procfile"), contents).unwrap();
    dir
}

fn sorted(mut addrs: Vec<String>) -> Vec<String> {
    addrs.sort();
    addrs
}

#[tokio::test]
async fn test_echo_port_with_computed_ports() {
    let dir = write_procfile("web: echo ${PORT}\n");
    let mut manifest = Manifest::new(dir.path(), 4000);
    manifest.parse().unwrap();
    manifest.set_concurrency("web=2").unwrap();

    assert_eq!(manifest.launch_all().await.unwrap(), 2);

    let web = manifest.group("web").unwrap();
    let ports: Vec<u16> = web.instances().map(|i| i.port()).collect();
    assert_eq!(ports, vec![4000, 4001]);
    assert_eq!(
        sorted(manifest.addrs_for("web")),
        vec![":4000".to_string(), ":4001".to_string()]
    );
    assert!(manifest.addrs_for("missing").is_empty());

    manifest.wait().await;
    manifest.kill().await;
}

#[tokio::test]
async fn test_echo_port_with_leased_ports() {
    let dir = write_procfile("web: echo ${PORT}\n");
    let ports = Arc::new(PortManager::new(43000, 43099).unwrap());
    let mut manifest = Manifest::new(dir.path(), 4000).with_port_manager(ports);
    manifest.parse().unwrap();
    manifest.set_concurrency("web=2").unwrap();
    manifest.launch_all().await.unwrap();

    let addrs = manifest.addrs_for("web");
    assert_eq!(addrs.len(), 2);
    assert_ne!(addrs[0], addrs[1]);
    for instance in manifest.group("web").unwrap().instances() {
        assert!((43000..=43099).contains(&instance.port()));
        assert_eq!(instance.env()["PORT"], instance.port().to_string());
    }

    manifest.kill().await;
}

#[tokio::test]
async fn test_group_count_and_base_ports() {
    let dir = write_procfile("web: ./web\n\nworker: ./worker\n  \nclock: ./clock\nmailer: ./mailer\n");
    let mut manifest = Manifest::new(dir.path(), 5000);
    manifest.parse().unwrap();

    assert_eq!(manifest.len(), 4);
    for (ordinal, name) in ["web", "worker", "clock", "mailer"].iter().enumerate() {
        let group = manifest.group(name).unwrap();
        assert_eq!(group.base_port(), 5000 + 100 * ordinal as u16);
    }
}

#[tokio::test]
async fn test_unlisted_group_gets_no_instances() {
    let dir = write_procfile("web: sleep 30\nworker: sleep 30\n");
    let mut manifest = Manifest::new(dir.path(), 4000).with_grace_period(Duration::from_secs(1));
    manifest.parse().unwrap();
    manifest.set_concurrency("worker=1").unwrap();
    manifest.launch_all().await.unwrap();

    assert!(manifest.group("web").unwrap().is_empty());
    assert_eq!(manifest.group("worker").unwrap().len(), 1);
    assert_eq!(manifest.running_count(), 1);

    manifest.kill().await;
    assert_eq!(manifest.running_count(), 0);
}

#[tokio::test]
async fn test_environment_last_value_wins() {
    std::env::set_var("FORERUNNER_IT_A", "1");
    let dir = tempfile::tempdir().unwrap();
    let mut group = ProcessGroup::new("env", "sh -c exit", dir.path(), 4500);

    let extra = vec![
        ("FORERUNNER_IT_A".to_string(), "2".to_string()),
        ("PORT".to_string(), "1".to_string()),
    ];
    let instance = group.launch(&extra).await.unwrap();
    assert_eq!(instance.env()["FORERUNNER_IT_A"], "2");
    assert_eq!(instance.env()["PORT"], "4500");

    group.wait().await;
    group.kill().await;
}

#[tokio::test]
async fn test_processes_see_their_port() {
    let dir = write_procfile("writer: touch port-$PORT.txt\n");
    let mut manifest = Manifest::new(dir.path(), 4700);
    manifest.parse().unwrap();
    manifest.set_concurrency("writer=2").unwrap();
    manifest.launch_all().await.unwrap();
    manifest.wait().await;

    for port in [4700, 4701] {
        let path = dir.path().join(format!("port-{}.txt", port));
        assert!(path.exists(), "missing {}", path.display());
    }
}

#[test]
fn test_prefixed_line_writer() {
    let mut writer = PrefixedLineWriter::new(Vec::new(), || "P:".to_string());
    assert_eq!(writer.write(b"a\nb").unwrap(), 3);
    assert_eq!(writer.into_inner(), b"P:a\nP:b");
}
