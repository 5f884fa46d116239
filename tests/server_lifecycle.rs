/// 실제 프로세스 없이 검증하는 인스턴스 수명주기 통합 테스트
/// screen / java / rdiff-backup 이 필요한 경로는 제외

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use mineos_daemon::config::DaemonConfig;
use mineos_daemon::events::{Event, EventBus};
use mineos_daemon::host::{self, Host};
use mineos_daemon::identity::{Owner, StaticIdentity};
use mineos_daemon::registry::ServerRegistry;
use mineos_daemon::server::env::dirs;
use mineos_daemon::server::{ManagedServer, ServerError, State};
use mineos_daemon::supervisor::SupervisorOptions;
use serde_json::json;

fn current_owner() -> Owner {
    Owner {
        uid: nix::unistd::getuid().as_raw(),
        gid: nix::unistd::getgid().as_raw(),
    }
}

fn identity() -> Arc<StaticIdentity> {
    let owner = current_owner();
    Arc::new(
        StaticIdentity::new()
            .with_user(owner.uid, "steve", owner.gid)
            .with_group(owner.gid, "steve", &[]),
    )
}

fn host(base: &Path) -> Arc<Host> {
    host::prepare_base(base).unwrap();
    let registry = ServerRegistry::new(base, identity(), EventBus::new(), SupervisorOptions::default());
    let config = DaemonConfig {
        base_directory: base.to_path_buf(),
        lan_broadcast: false,
        ..DaemonConfig::default()
    };
    Host::new(config, registry)
}

fn write_wrapped_zip(path: &Path) {
    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default();
    zip.add_directory("modpack/", options).unwrap();
    zip.start_file("modpack/server.jar", options).unwrap();
    zip.write_all(b"not really a jar").unwrap();
    zip.start_file("modpack/FTBInstall.sh", options).unwrap();
    zip.write_all(b"#!/bin/sh\n").unwrap();
    zip.start_file("modpack/server.properties", options).unwrap();
    zip.write_all(b"server-port=25600\nmotd=Modded\n").unwrap();
    zip.finish().unwrap();
}

#[tokio::test]
async fn test_create_modify_delete() {
    let base = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(base.path().join(dirs::SERVERS)).unwrap();
    let server = ManagedServer::new("vanilla", base.path(), identity());

    assert_eq!(server.state().await, State::NotExisting);
    server.create(current_owner()).await.unwrap();
    assert_eq!(server.state().await, State::Stopped);

    server.modify_sp("server-port", "25590").await.unwrap();
    server.modify_sc("java", "jarfile", "minecraft_server.jar").await.unwrap();
    assert_eq!(server.server_port().await.unwrap(), 25590);
    assert_eq!(server.property("server-port").await.unwrap(), json!("25590"));
    assert_eq!(server.property("up").await.unwrap(), json!(false));
    assert_eq!(server.property("owner").await.unwrap()["username"], "steve");

    // 아직 eula.txt 없음
    assert_eq!(server.property("eula").await.unwrap(), json!(null));
    server.accept_eula().await.unwrap();
    assert_eq!(server.property("eula").await.unwrap(), json!(true));

    let err = server.stop().await.unwrap_err();
    assert!(matches!(err, ServerError::Precondition(ref t) if t == "up"));

    server.delete().await.unwrap();
    assert_eq!(server.state().await, State::NotExisting);
    assert!(!server.env.cwd.exists());
    println!("✓ create/modify/delete test passed");
}

#[tokio::test]
async fn test_import_hoists_wrapper_and_keeps_archive_properties() {
    let base = tempfile::tempdir().unwrap();
    let host = host(base.path());
    write_wrapped_zip(&base.path().join(dirs::IMPORT).join("modpack.zip"));

    host.dispatch(
        "steve",
        json!({"command": "create_from_archive", "new_server_name": "modded", "filename": "modpack.zip"}),
    )
    .await
    .unwrap();

    let sup = host.registry().get("modded").await.expect("tracked after import");
    let server = sup.server();
    assert!(server.env.cwd.join("server.jar").is_file());
    assert!(!server.env.cwd.join("modpack").exists());
    assert_eq!(server.property("server_files").await.unwrap(), json!(["server.jar"]));
    assert_eq!(server.property("FTBInstall.sh").await.unwrap(), json!(true));
    assert_eq!(server.server_port().await.unwrap(), 25600);

    host.registry().shutdown().await;
    println!("✓ archive import test passed");
}

#[tokio::test]
async fn test_import_rejects_missing_and_unknown_archives() {
    let base = tempfile::tempdir().unwrap();
    let host = host(base.path());

    let err = host
        .dispatch(
            "steve",
            json!({"command": "create_from_archive", "new_server_name": "a", "filename": "missing.zip"}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "NOT_FOUND");

    std::fs::write(base.path().join(dirs::IMPORT).join("pack.rar"), b"rar").unwrap();
    let err = host
        .dispatch(
            "steve",
            json!({"command": "create_from_archive", "new_server_name": "b", "filename": "pack.rar"}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_ARGUMENT");

    // 실패한 가져오기는 인스턴스를 남기지 않음
    assert!(!base.path().join(dirs::SERVERS).join("a").exists());
    assert!(!base.path().join(dirs::SERVERS).join("b").exists());
}

#[tokio::test]
async fn test_delete_command_untracks_without_notice() {
    let base = tempfile::tempdir().unwrap();
    let host = host(base.path());
    host.dispatch("steve", json!({"command": "create", "server_name": "doomed"}))
        .await
        .unwrap();
    let sup = host.registry().get("doomed").await.unwrap();
    let mut rx = host.registry().bus().subscribe();

    let notice = sup.dispatch("steve", json!({"command": "delete"})).await;
    assert_eq!(notice.success, Some(true), "{:?}", notice.error);
    assert!(sup.is_closed());
    assert!(sup.notices().is_empty());

    let report = host.registry().sync().await;
    assert_eq!(report.removed, vec!["doomed".to_string()]);

    let mut names = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        names.push(ev.name());
    }
    assert_eq!(names, vec!["server_ack", "server_fin", "untrack_server"]);
    println!("✓ delete command test passed");
}

#[tokio::test]
async fn test_property_request_answers_with_server_fin() {
    let base = tempfile::tempdir().unwrap();
    let host = host(base.path());
    host.dispatch("steve", json!({"command": "create", "server_name": "props"}))
        .await
        .unwrap();
    let sup = host.registry().get("props").await.unwrap();
    let mut rx = host.registry().bus().subscribe();

    sup.get_prop("exists").await.unwrap();
    assert!(sup.get_prop("no-such-property").await.is_err());

    match rx.try_recv().unwrap() {
        Event::PropertyFin { property, payload, .. } => {
            assert_eq!(property, "exists");
            assert_eq!(payload, json!(true));
        }
        other => panic!("unexpected {:?}", other),
    }
    host.registry().shutdown().await;
}
