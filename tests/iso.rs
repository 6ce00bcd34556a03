use std::fs;

use sonjayos_provision::artifact::{build_iso, Autoinstall, ImagePayload, IsoOptions};
use sonjayos_provision::testing::FakeHost;
use tempfile::TempDir;

#[test]
fn payload_directory_ships_with_installer() {
    let temp = TempDir::new().unwrap();
    let base = temp.path().join("ubuntu-22.04-live-server-amd64.iso");
    fs::write(&base, b"base").unwrap();
    let payload_dir = temp.path().join("payload");
    fs::create_dir_all(payload_dir.join("scripts")).unwrap();
    fs::write(payload_dir.join("scripts/install.sh"), "#!/bin/sh\n").unwrap();

    let autoinstall = Autoinstall::default().with_payload_install();
    let payload = ImagePayload::new(&base, autoinstall).with_payload_dir(&payload_dir);
    let output = temp.path().join("sonjayos.iso");
    let host = FakeHost::new();

    let artifact = build_iso(&payload, &IsoOptions::new(&output), &host).unwrap();
    assert_eq!(artifact.iso, output);
    assert!(temp.path().join("sonjayos.iso.sha512").is_file());

    let repack = host
        .calls_to("xorriso")
        .into_iter()
        .find(|c| c.contains("-outdev"))
        .unwrap();
    assert!(repack.contains(&format!("{} /sonjayos", payload_dir.display())));

    // Work files are gone once the image is in place.
    let leftovers: Vec<_> = fs::read_dir(temp.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".partial") || n.ends_with(".work"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

#[test]
fn rebuild_requires_force() {
    let temp = TempDir::new().unwrap();
    let base = temp.path().join("base.iso");
    fs::write(&base, b"base").unwrap();
    let payload = ImagePayload::new(&base, Autoinstall::default());
    let output = temp.path().join("sonjayos.iso");
    let host = FakeHost::new();

    let first = build_iso(&payload, &IsoOptions::new(&output), &host).unwrap();
    let err = build_iso(&payload, &IsoOptions::new(&output), &host).unwrap_err();
    assert_eq!(err.exit_code(), 4);

    let second = build_iso(&payload, &IsoOptions::new(&output).force(true), &host).unwrap();
    assert_eq!(first.sha512, second.sha512);
}
