//! End-to-end walk through one instance's life

mod common;

use common::TestEnv;
use foundry_instance_manager::core::{InstanceConfig, InstanceStatus};
use foundry_instance_manager::ErrorKind;

#[test]
fn alpha_from_create_to_forced_delete() {
    let env = TestEnv::new();
    let manager = env.manager();
    let worlds = manager.worlds();

    manager
        .create(InstanceConfig::new("alpha", "13.0", 30000))
        .unwrap();
    let status = manager.status("alpha").unwrap();
    assert_eq!(status.status, InstanceStatus::Created);
    assert_eq!(status.port, 30000);

    manager.start("alpha").unwrap();
    assert_eq!(manager.status("alpha").unwrap().status, InstanceStatus::Running);

    worlds.create("alpha", "w1", "dnd5e", None).unwrap();
    let names: Vec<String> = worlds
        .list("alpha")
        .unwrap()
        .into_iter()
        .map(|w| w.name)
        .collect();
    assert_eq!(names, vec!["w1"]);

    let backups_dir = env.instance_dir("alpha").join("backups/worlds");
    let before = std::fs::read_dir(&backups_dir).unwrap().count();
    worlds.backup("alpha", "w1").unwrap();
    let new_files: Vec<String> = std::fs::read_dir(&backups_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(new_files.len(), before + 1);
    assert_eq!(new_files.iter().filter(|n| n.starts_with("w1_")).count(), 1);

    let err = manager.delete("alpha", false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

    let report = manager.delete("alpha", true).unwrap();
    assert!(report.is_clean());
    assert!(manager.list().unwrap().iter().all(|i| i.name != "alpha"));
    assert!(!env.instance_dir("alpha").exists());
    assert!(env.runtime.container("alpha").is_none());
}

#[test]
fn instances_are_isolated_from_each_other() {
    let env = TestEnv::new();
    env.create("alpha", 30000);
    env.create("beta", 30001);
    let worlds = env.worlds();

    worlds.create("alpha", "w1", "dnd5e", None).unwrap();
    assert!(worlds.list("beta").unwrap().is_empty());

    env.manager().start("alpha").unwrap();
    let listed = env.manager().list().unwrap();
    let status_of = |name: &str| listed.iter().find(|i| i.name == name).unwrap().status;
    assert_eq!(status_of("alpha"), InstanceStatus::Running);
    assert_eq!(status_of("beta"), InstanceStatus::Created);

    let alpha = env.runtime.container("alpha").unwrap().spec;
    env.manager().start("beta").unwrap();
    let beta = env.runtime.container("beta").unwrap().spec;
    let shared = env.base_dir.join("shared");
    let shared_mount = |spec: &foundry_instance_manager::runtime::ContainerSpec| {
        spec.mounts
            .iter()
            .find(|m| m.host_path == shared)
            .map(|m| m.container_path.clone())
    };
    assert_eq!(shared_mount(&alpha), shared_mount(&beta));
    assert!(shared_mount(&alpha).is_some());
    assert_ne!(alpha.mounts[0].host_path, beta.mounts[0].host_path);
}
