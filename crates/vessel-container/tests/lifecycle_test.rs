//! End-to-end container volume lifecycle scenarios.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::UnixListener;
use vessel_container::{ContainerConfig, ContainerError, Daemon, HostConfig};
use vessel_plugins::{LocalRegistry, PluginStore};
use vessel_volume::{DriverRegistry, Repository};

fn new_daemon(root: &Path) -> Daemon {
    let plugin_dir = root.join("plugins");
    std::fs::create_dir_all(&plugin_dir).unwrap();
    let plugins = Arc::new(PluginStore::new(LocalRegistry::new(&plugin_dir)));
    let registry = DriverRegistry::new(plugins, root.join("vfs").join("dir"));
    let repository = Arc::new(Repository::new(root.join("volumes"), registry).unwrap());
    Daemon::new(root, repository).unwrap()
}

fn config_with_volumes(image: &str, destinations: &[&str]) -> ContainerConfig {
    let mut config = ContainerConfig {
        image: image.to_string(),
        ..ContainerConfig::default()
    };
    for destination in destinations {
        config
            .volumes
            .insert((*destination).to_string(), json!({}));
    }
    config
}

#[tokio::test]
async fn s1_bind_to_a_named_volume_path_shares_the_volume() {
    let tmp = TempDir::new().unwrap();
    let daemon = new_daemon(tmp.path());

    daemon
        .create_container("one", config_with_volumes("busybox", &["/foo"]), &HostConfig::default(), None)
        .await
        .unwrap();
    let one = daemon.get("one").unwrap();
    let mount = &one.mount_points[&PathBuf::from("/foo")];
    let volume_path = mount.source_path().unwrap();
    let vfs_root = std::fs::canonicalize(tmp.path()).unwrap().join("vfs").join("dir");
    assert!(volume_path.starts_with(&vfs_root));

    let host_config = HostConfig {
        binds: vec![format!("{}:/foo", volume_path.display())],
        ..HostConfig::default()
    };
    daemon
        .create_container(
            "two",
            ContainerConfig {
                image: "busybox".to_string(),
                ..ContainerConfig::default()
            },
            &host_config,
            None,
        )
        .await
        .unwrap();

    let two = daemon.get("two").unwrap();
    let bound = &two.mount_points[&PathBuf::from("/foo")];
    assert_eq!(bound.source_path().unwrap(), volume_path);

    let volume = daemon.repository().get(&volume_path).unwrap();
    assert_eq!(volume.ref_count(), 2);
    assert_eq!(daemon.repository().list().len(), 1);
}

#[tokio::test]
async fn volumes_from_inherits_peer_mounts() {
    let tmp = TempDir::new().unwrap();
    let daemon = new_daemon(tmp.path());

    daemon
        .create_container("v", config_with_volumes("busybox", &["/tmp"]), &HostConfig::default(), None)
        .await
        .unwrap();
    let peer_path = daemon.get("v").unwrap().mount_points[&PathBuf::from("/tmp")]
        .source_path()
        .unwrap();

    let host_config = HostConfig {
        volumes_from: vec!["v:ro".to_string()],
        ..HostConfig::default()
    };
    daemon
        .create_container("c", config_with_volumes("busybox", &["/tmp"]), &host_config, None)
        .await
        .unwrap();

    let c = daemon.get("c").unwrap();
    let inherited = &c.mount_points[&PathBuf::from("/tmp")];
    assert_eq!(inherited.source_path().unwrap(), peer_path);
    assert!(!inherited.rw);

    let volume = daemon.repository().get(&peer_path).unwrap();
    assert_eq!(volume.ref_count(), 2);
}

#[tokio::test]
async fn volumes_from_missing_peer_is_not_found() {
    let tmp = TempDir::new().unwrap();
    let daemon = new_daemon(tmp.path());

    let host_config = HostConfig {
        volumes_from: vec!["ghost".to_string()],
        ..HostConfig::default()
    };
    let err = daemon
        .create_container("c", ContainerConfig::default(), &host_config, None)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn s3_binds_override_peer_mounts_at_the_same_destination() {
    let tmp = TempDir::new().unwrap();
    let daemon = new_daemon(tmp.path());

    daemon
        .create_container("v", config_with_volumes("busybox", &["/tmp"]), &HostConfig::default(), None)
        .await
        .unwrap();
    let peer_path = daemon.get("v").unwrap().mount_points[&PathBuf::from("/tmp")]
        .source_path()
        .unwrap();

    let bind_source = tmp.path().join("hostdata");
    std::fs::create_dir(&bind_source).unwrap();

    // Peer and bind both claim /tmp: the bind wins.
    let host_config = HostConfig {
        binds: vec![format!("{}:/tmp", bind_source.display())],
        volumes_from: vec!["v".to_string()],
    };
    daemon
        .create_container("c", config_with_volumes("busybox", &["/tmp"]), &host_config, None)
        .await
        .unwrap();

    let c = daemon.get("c").unwrap();
    let resolved = &c.mount_points[&PathBuf::from("/tmp")];
    let resolved_path = resolved.source_path().unwrap();
    assert_ne!(resolved_path, peer_path);
    assert_eq!(
        resolved_path,
        std::fs::canonicalize(&bind_source).unwrap()
    );
    assert!(resolved.driver.is_empty());

    // Without the bind, the peer mount is what /tmp resolves to.
    let host_config = HostConfig {
        volumes_from: vec!["v".to_string()],
        ..HostConfig::default()
    };
    daemon
        .create_container("d", config_with_volumes("busybox", &["/tmp"]), &host_config, None)
        .await
        .unwrap();
    let d = daemon.get("d").unwrap();
    let inherited = &d.mount_points[&PathBuf::from("/tmp")];
    assert_eq!(inherited.source_path().unwrap(), peer_path);
}

#[tokio::test]
async fn s4_duplicate_binds_fail_without_side_effects() {
    let tmp = TempDir::new().unwrap();
    let daemon = new_daemon(tmp.path());

    let host_config = HostConfig {
        binds: vec!["/a:/tmp".to_string(), "/b:/tmp/".to_string()],
        ..HostConfig::default()
    };
    let err = daemon
        .create_container("dup", config_with_volumes("busybox", &["/data"]), &host_config, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ContainerError::DuplicateBind(ref d) if d == "/tmp"));

    assert!(daemon.get("dup").unwrap_err().is_not_found());
    assert!(daemon.repository().list().is_empty());
}

#[tokio::test]
async fn property_mounts_are_sorted_parents_first() {
    let tmp = TempDir::new().unwrap();
    let daemon = new_daemon(tmp.path());

    daemon
        .create_container(
            "deep",
            config_with_volumes("busybox", &["/a/b/c", "/a", "/a/b", "/var/log/app"]),
            &HostConfig::default(),
            None,
        )
        .await
        .unwrap();

    let mounts = daemon.setup_mounts("deep").await.unwrap();
    assert_eq!(mounts.len(), 7);

    let volume_mounts = &mounts[..4];
    let depths: Vec<usize> = volume_mounts
        .iter()
        .map(|m| m.destination.components().count())
        .collect();
    let mut sorted = depths.clone();
    sorted.sort_unstable();
    assert_eq!(depths, sorted);
    assert_eq!(volume_mounts[0].destination, PathBuf::from("/a"));

    let network_mounts = &mounts[4..];
    let destinations: Vec<&Path> = network_mounts
        .iter()
        .map(|m| m.destination.as_path())
        .collect();
    assert_eq!(
        destinations,
        [
            Path::new("/etc/resolv.conf"),
            Path::new("/etc/hostname"),
            Path::new("/etc/hosts")
        ]
    );
    assert!(network_mounts.iter().all(|m| m.private && m.writable));

    assert!(daemon.get("deep").unwrap().is_running());
}

#[tokio::test]
async fn s6_restart_restores_volumes_and_references() {
    let tmp = TempDir::new().unwrap();
    let volume_path = {
        let daemon = new_daemon(tmp.path());
        daemon
            .create_container("one", config_with_volumes("busybox", &["/foo"]), &HostConfig::default(), None)
            .await
            .unwrap();
        daemon.get("one").unwrap().mount_points[&PathBuf::from("/foo")]
            .source_path()
            .unwrap()
    };

    let daemon = new_daemon(tmp.path());
    daemon.restore().await.unwrap();

    let volume = daemon
        .repository()
        .get(&volume_path)
        .expect("volume survives the restart");
    assert_eq!(volume.ref_count(), 1);

    let one = daemon.get("one").unwrap();
    let mount = &one.mount_points[&PathBuf::from("/foo")];
    assert_eq!(mount.source_path().unwrap(), volume_path);

    // Deletion stays blocked until the container goes away.
    let err = daemon.repository().delete(&volume_path).await.unwrap_err();
    assert!(err.is_in_use());

    daemon.remove_container("one", false).await.unwrap();
    daemon.repository().delete(&volume_path).await.unwrap();
    assert!(daemon.repository().get(&volume_path).is_none());
}

#[tokio::test]
async fn removing_a_container_dereferences_but_keeps_volumes() {
    let tmp = TempDir::new().unwrap();
    let daemon = new_daemon(tmp.path());

    daemon
        .create_container("solo", config_with_volumes("busybox", &["/data"]), &HostConfig::default(), None)
        .await
        .unwrap();
    let path = daemon.get("solo").unwrap().mount_points[&PathBuf::from("/data")]
        .source_path()
        .unwrap();

    daemon.remove_container("solo", false).await.unwrap();

    // Refcount zero does not delete the volume by itself.
    let volume = daemon.repository().get(&path).unwrap();
    assert_eq!(volume.ref_count(), 0);

    // An explicit volume removal request does.
    daemon
        .create_container("next", config_with_volumes("busybox", &["/data"]), &HostConfig::default(), None)
        .await
        .unwrap();
    let next_path = daemon.get("next").unwrap().mount_points[&PathBuf::from("/data")]
        .source_path()
        .unwrap();
    daemon.remove_container("next", true).await.unwrap();
    assert!(daemon.repository().get(&next_path).is_none());
    assert!(daemon.repository().get(&path).is_some());
}

#[tokio::test]
async fn file_exists_blocks_mounting_over_a_regular_file() {
    let tmp = TempDir::new().unwrap();
    let daemon = new_daemon(tmp.path());

    let basefs = tmp.path().join("fs");
    std::fs::create_dir_all(&basefs).unwrap();
    std::fs::write(basefs.join("data"), b"a file").unwrap();

    let err = daemon
        .create_container(
            "clash",
            config_with_volumes("busybox", &["/data"]),
            &HostConfig::default(),
            Some(&basefs),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ContainerError::FileExists(_)));
}

#[tokio::test]
async fn symlinked_destinations_are_rewritten_in_scope() {
    let tmp = TempDir::new().unwrap();
    let daemon = new_daemon(tmp.path());

    let basefs = tmp.path().join("fs");
    std::fs::create_dir_all(basefs.join("real")).unwrap();
    std::os::unix::fs::symlink("real", basefs.join("data")).unwrap();

    daemon
        .create_container(
            "linked",
            config_with_volumes("busybox", &["/data"]),
            &HostConfig::default(),
            Some(&basefs),
        )
        .await
        .unwrap();

    let mounts = daemon.setup_mounts("linked").await.unwrap();
    let volume_mount = mounts
        .iter()
        .find(|m| !m.private)
        .expect("volume mount present");
    assert_eq!(volume_mount.destination, PathBuf::from("/real"));
}

#[tokio::test]
async fn new_volumes_are_seeded_from_rootfs_content() {
    let tmp = TempDir::new().unwrap();
    let daemon = new_daemon(tmp.path());

    let basefs = tmp.path().join("fs");
    std::fs::create_dir_all(basefs.join("etc")).unwrap();
    std::fs::write(basefs.join("etc/app.conf"), b"port = 80\n").unwrap();

    daemon
        .create_container(
            "seeded",
            config_with_volumes("busybox", &["/etc"]),
            &HostConfig::default(),
            Some(&basefs),
        )
        .await
        .unwrap();

    let volume_path = daemon.get("seeded").unwrap().mount_points[&PathBuf::from("/etc")]
        .source_path()
        .unwrap();
    assert_eq!(
        std::fs::read(volume_path.join("app.conf")).unwrap(),
        b"port = 80\n"
    );
}

// ============================================================================
// Plugin-backed volumes (S5)
// ============================================================================

struct VolumePluginServer {
    mount_root: PathBuf,
    creates: AtomicUsize,
    removes: AtomicUsize,
    mounts: AtomicUsize,
    unmounts: AtomicUsize,
}

impl VolumePluginServer {
    fn start(plugin_dir: &Path, name: &str, mount_root: PathBuf) -> Arc<Self> {
        let server = Arc::new(Self {
            mount_root,
            creates: AtomicUsize::new(0),
            removes: AtomicUsize::new(0),
            mounts: AtomicUsize::new(0),
            unmounts: AtomicUsize::new(0),
        });
        let listener = UnixListener::bind(plugin_dir.join(format!("{name}.sock"))).unwrap();
        let state = server.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = state.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle_request(state.clone(), req));
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        server
    }
}

async fn handle_request(
    state: Arc<VolumePluginServer>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();
    let body = req.into_body().collect().await.unwrap().to_bytes();
    let name = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v["Name"].as_str().map(str::to_string))
        .unwrap_or_default();

    let payload = match path.as_str() {
        "/Plugin.Activate" => json!({"Implements": ["VolumeDriver"]}),
        "/VolumeDriver.Create" => {
            state.creates.fetch_add(1, Ordering::SeqCst);
            std::fs::create_dir_all(state.mount_root.join(&name)).unwrap();
            json!({"Err": ""})
        }
        "/VolumeDriver.Remove" => {
            state.removes.fetch_add(1, Ordering::SeqCst);
            let _ = std::fs::remove_dir_all(state.mount_root.join(&name));
            json!({"Err": ""})
        }
        "/VolumeDriver.Path" => json!({"Mountpoint": state.mount_root.join(&name), "Err": ""}),
        "/VolumeDriver.Mount" => {
            state.mounts.fetch_add(1, Ordering::SeqCst);
            json!({"Mountpoint": state.mount_root.join(&name), "Err": ""})
        }
        "/VolumeDriver.Unmount" => {
            state.unmounts.fetch_add(1, Ordering::SeqCst);
            json!({"Err": ""})
        }
        other => {
            let response = Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from(format!("no such method: {other}"))))
                .unwrap();
            return Ok(response);
        }
    };

    let response = Response::builder()
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(payload.to_string())))
        .unwrap();
    Ok(response)
}

#[tokio::test]
async fn s5_plugin_backed_volume_lifecycle() {
    let tmp = TempDir::new().unwrap();
    let plugin_dir = tmp.path().join("plugins");
    std::fs::create_dir_all(&plugin_dir).unwrap();
    let server = VolumePluginServer::start(&plugin_dir, "blockvol", tmp.path().join("mnt"));
    let daemon = new_daemon(tmp.path());

    let mut config = config_with_volumes("busybox", &["/data"]);
    config.volume_driver = "blockvol".to_string();
    daemon
        .create_container("plugged", config, &HostConfig::default(), None)
        .await
        .unwrap();
    assert_eq!(server.creates.load(Ordering::SeqCst), 1);

    let plugged = daemon.get("plugged").unwrap();
    let mount = &plugged.mount_points[&PathBuf::from("/data")];
    assert_eq!(mount.driver, "blockvol");
    let volume_path = mount.source_path().unwrap();

    daemon.setup_mounts("plugged").await.unwrap();
    assert_eq!(server.mounts.load(Ordering::SeqCst), 1);

    daemon.release_mounts("plugged").await.unwrap();
    assert_eq!(server.unmounts.load(Ordering::SeqCst), 1);

    // Deleting while referenced is refused and does not reach the plugin.
    let err = daemon.repository().delete(&volume_path).await.unwrap_err();
    assert!(err.is_in_use());
    assert_eq!(server.removes.load(Ordering::SeqCst), 0);

    daemon.remove_container("plugged", false).await.unwrap();
    daemon.repository().delete(&volume_path).await.unwrap();
    assert_eq!(server.removes.load(Ordering::SeqCst), 1);
}
